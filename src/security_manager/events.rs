use bt_hci::param::{BdAddr, ConnHandle};

use super::types::{KeypressAction, PassKey, Reason};
use crate::Address;

/// Outcome of a pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PairingStatus {
    /// Keys exchanged and the link is encrypted
    Success,
    /// Pairing failed, locally or at the peer
    Failed(Reason),
    /// The security manager timer expired
    Timeout,
}

/// Outcome of an encryption with a stored key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ReencryptionStatus {
    /// The link is encrypted
    Success,
    /// The controller reported a failure
    Failed,
}

/// Events emitted by the security manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SecurityEvent {
    /// Derived keys are available, pairing can be served
    Ready,
    /// Confirm Just Works pairing with [`SecurityManager::just_works_confirm`](crate::SecurityManager::just_works_confirm)
    JustWorksRequest {
        /// Connection handle
        handle: ConnHandle,
        /// Peer address
        address: Address,
    },
    /// Show the passkey to the user
    PassKeyDisplay {
        /// Connection handle
        handle: ConnHandle,
        /// Passkey to show
        passkey: PassKey,
    },
    /// Ask the user for the passkey shown by the peer, answer with
    /// [`SecurityManager::passkey_input`](crate::SecurityManager::passkey_input)
    PassKeyInput {
        /// Connection handle
        handle: ConnHandle,
    },
    /// Keypress notification received from the peer
    KeypressNotification {
        /// Connection handle
        handle: ConnHandle,
        /// Notification type
        action: KeypressAction,
    },
    /// Pairing started on a link
    PairingStarted {
        /// Connection handle
        handle: ConnHandle,
    },
    /// Pairing finished on a link
    PairingComplete {
        /// Connection handle
        handle: ConnHandle,
        /// Outcome
        status: PairingStatus,
    },
    /// Encryption with a stored key started
    ReencryptionStarted {
        /// Connection handle
        handle: ConnHandle,
    },
    /// Encryption with a stored key finished
    ReencryptionComplete {
        /// Connection handle
        handle: ConnHandle,
        /// Outcome
        status: ReencryptionStatus,
    },
    /// The peer asked for encryption with a key that is not known anymore
    BondLost {
        /// Connection handle
        handle: ConnHandle,
    },
    /// Identity resolution started
    IdentityResolvingStarted {
        /// Connection handle, `None` for a queued lookup
        handle: Option<ConnHandle>,
        /// Address being resolved
        address: Address,
    },
    /// The address belongs to a stored device
    IdentityResolvingSucceeded {
        /// Connection handle, `None` for a queued lookup
        handle: Option<ConnHandle>,
        /// Address being resolved
        address: Address,
        /// Device store index
        index: usize,
    },
    /// The address does not belong to any stored device
    IdentityResolvingFailed {
        /// Connection handle, `None` for a queued lookup
        handle: Option<ConnHandle>,
        /// Address being resolved
        address: Address,
    },
    /// A device record was created or updated after bonding
    IdentityCreated {
        /// Connection handle
        handle: ConnHandle,
        /// Identity address of the peer
        identity: Address,
        /// Device store index
        index: usize,
    },
    /// Grant or decline with
    /// [`SecurityManager::authorization_grant`](crate::SecurityManager::authorization_grant) /
    /// [`SecurityManager::authorization_decline`](crate::SecurityManager::authorization_decline)
    AuthorizationRequest {
        /// Connection handle
        handle: ConnHandle,
    },
    /// Authorization decided
    AuthorizationResult {
        /// Connection handle
        handle: ConnHandle,
        /// Was authorization granted?
        granted: bool,
    },
    /// Signature of a signed write
    SignatureComputed {
        /// The 8 most significant octets of the MAC
        signature: [u8; 8],
    },
    /// A new random address was applied to the controller
    RandomAddressUpdated {
        /// The new address
        address: BdAddr,
    },
}

/// Receiver of [`SecurityEvent`]s.
pub trait EventSink {
    /// Handle one event.
    fn on_event(&mut self, event: SecurityEvent);
}

impl<F: FnMut(SecurityEvent)> EventSink for F {
    fn on_event(&mut self, event: SecurityEvent) {
        self(event)
    }
}
