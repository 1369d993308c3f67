//! Scratch space of the pairing in progress and legacy pairing negotiation.

use bt_hci::param::ConnHandle;

use super::Role;
use crate::security_manager::constants::ENCRYPTION_KEY_SIZE_128_BITS;
use crate::security_manager::crypto::Block;
use crate::security_manager::types::{KeySet, PairingFeatures, Reason, UseOutOfBand};
use crate::{AcceptedMethods, Address};

/// Legacy pairing method ([Vol 3] Part H, Section 2.3.5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum PairingMethod {
    JustWorks,
    /// Initiator inputs, responder displays
    PasskeyInitiatorInput,
    /// Responder inputs, initiator displays
    PasskeyResponderInput,
    /// Both input
    PasskeyBothInput,
    OutOfBand,
}

use PairingMethod::{JustWorks as JW, PasskeyBothInput as PKB, PasskeyInitiatorInput as PKI, PasskeyResponderInput as PKR};

/// Indexed `[responder][initiator]` by I/O capability.
const METHODS: [[PairingMethod; 5]; 5] = [
    [JW, JW, PKI, JW, PKI],
    [JW, JW, PKI, JW, PKI],
    [PKR, PKR, PKB, JW, PKR],
    [JW, JW, JW, JW, JW],
    [PKR, PKR, PKI, JW, PKR],
];

impl PairingMethod {
    pub(crate) fn is_passkey(&self) -> bool {
        matches!(self, PKI | PKR | PKB)
    }

    pub(crate) fn displays(&self, role: Role) -> bool {
        match role {
            Role::Initiator => *self == PKR,
            Role::Responder => *self == PKI,
        }
    }

    pub(crate) fn accepted(&self, methods: AcceptedMethods) -> bool {
        match self {
            JW => methods.just_works(),
            PairingMethod::OutOfBand => methods.out_of_band(),
            _ => methods.passkey(),
        }
    }
}

pub(crate) fn choose_method(initiator: &PairingFeatures, responder: &PairingFeatures) -> PairingMethod {
    if initiator.use_oob == UseOutOfBand::Present && responder.use_oob == UseOutOfBand::Present {
        return PairingMethod::OutOfBand;
    }
    if !initiator.security_properties.man_in_the_middle() && !responder.security_properties.man_in_the_middle() {
        return JW;
    }
    match (responder.io_capabilities(), initiator.io_capabilities()) {
        (Some(r), Some(i)) => METHODS[r.table_index()][i.table_index()],
        _ => JW,
    }
}

/// Outcome of Phase 1 feature exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Negotiated {
    pub(crate) method: PairingMethod,
    pub(crate) key_size: u8,
}

/// Negotiate method and key size, `min_key_size`/`max_key_size` being the local bounds.
pub(crate) fn negotiate(
    initiator: &PairingFeatures,
    responder: &PairingFeatures,
    role: Role,
    min_key_size: u8,
    max_key_size: u8,
    accepted: AcceptedMethods,
) -> Result<Negotiated, Reason> {
    let peer = match role {
        Role::Initiator => responder,
        Role::Responder => initiator,
    };
    if peer.maximum_encryption_key_size > ENCRYPTION_KEY_SIZE_128_BITS {
        return Err(Reason::InvalidParameters);
    }
    if peer.maximum_encryption_key_size < min_key_size {
        return Err(Reason::EncryptionKeySize);
    }
    let method = choose_method(initiator, responder);
    if !method.accepted(accepted) {
        return Err(Reason::AuthenticationRequirements);
    }
    Ok(Negotiated {
        method,
        key_size: peer.maximum_encryption_key_size.min(max_key_size),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum UserResponse {
    /// Nothing to ask
    Idle,
    /// Waiting for the user
    Pending,
    Confirm,
    Passkey(u32),
    Decline,
}

/// Data of the one pairing or re-encryption in progress.
#[derive(Debug, Clone)]
pub(crate) struct PairingSetup {
    pub(crate) preq: [u8; 7],
    pub(crate) pres: [u8; 7],
    pub(crate) initiator: Address,
    pub(crate) responder: Address,
    pub(crate) local_random: Block,
    pub(crate) peer_random: Block,
    pub(crate) local_confirm: Block,
    pub(crate) peer_confirm: Block,
    /// Intermediate cipher result
    pub(crate) scratch: Block,
    pub(crate) method: PairingMethod,
    pub(crate) tk: Block,
    pub(crate) stk: Block,
    pub(crate) key_size: u8,
    pub(crate) authenticated: bool,
    pub(crate) bonding: bool,
    pub(crate) user_response: UserResponse,

    pub(crate) local_ltk: Block,
    pub(crate) local_ediv: u16,
    pub(crate) local_rand: u64,
    pub(crate) local_div: u16,
    pub(crate) local_csrk: Block,

    pub(crate) peer_ltk: Block,
    pub(crate) peer_ediv: u16,
    pub(crate) peer_rand: u64,
    pub(crate) peer_irk: Block,
    pub(crate) peer_identity: Option<Address>,
    pub(crate) peer_csrk: Block,

    /// Key PDUs still to send
    pub(crate) send: KeySet,
    /// Key PDUs still expected
    pub(crate) expect: KeySet,
    /// Key PDUs received
    pub(crate) received: KeySet,
}

impl PairingSetup {
    pub(crate) fn new() -> Self {
        Self {
            preq: [0; 7],
            pres: [0; 7],
            initiator: Address::public([0; 6]),
            responder: Address::public([0; 6]),
            local_random: [0; 16],
            peer_random: [0; 16],
            local_confirm: [0; 16],
            peer_confirm: [0; 16],
            scratch: [0; 16],
            method: PairingMethod::JustWorks,
            tk: [0; 16],
            stk: [0; 16],
            key_size: 0,
            authenticated: false,
            bonding: false,
            user_response: UserResponse::Idle,
            local_ltk: [0; 16],
            local_ediv: 0,
            local_rand: 0,
            local_div: 0,
            local_csrk: [0; 16],
            peer_ltk: [0; 16],
            peer_ediv: 0,
            peer_rand: 0,
            peer_irk: [0; 16],
            peer_identity: None,
            peer_csrk: [0; 16],
            send: KeySet::default(),
            expect: KeySet::default(),
            received: KeySet::default(),
        }
    }

    /// Is a user answer still missing?
    pub(crate) fn waiting_for_user(&self) -> bool {
        self.user_response == UserResponse::Pending
    }

    /// Does local distribution need freshly derived LTK/EDIV/Rand/CSRK?
    pub(crate) fn needs_local_keys(&self) -> bool {
        self.send.contains(KeySet::ENCRYPTION_INFORMATION)
            || self.send.contains(KeySet::CENTRAL_IDENTIFICATION)
            || self.send.contains(KeySet::SIGNING_INFORMATION)
    }
}

/// The single [`PairingSetup`] and the link holding it.
pub(crate) struct SetupArena {
    owner: Option<ConnHandle>,
    pub(crate) setup: PairingSetup,
}

impl SetupArena {
    pub(crate) fn new() -> Self {
        Self {
            owner: None,
            setup: PairingSetup::new(),
        }
    }

    pub(crate) fn owner(&self) -> Option<ConnHandle> {
        self.owner
    }

    pub(crate) fn is_owner(&self, handle: ConnHandle) -> bool {
        self.owner == Some(handle)
    }

    /// Hand a cleared setup to `handle`.
    pub(crate) fn acquire(&mut self, handle: ConnHandle) -> bool {
        if self.owner.is_some() {
            return false;
        }
        trace!("[smp] setup acquired by {:?}", handle);
        self.owner = Some(handle);
        self.setup = PairingSetup::new();
        true
    }

    pub(crate) fn release(&mut self, handle: ConnHandle) {
        if self.owner == Some(handle) {
            trace!("[smp] setup released by {:?}", handle);
            self.owner = None;
        }
    }
}

/// Does the local user type the passkey?
pub(crate) fn local_inputs(method: PairingMethod, role: Role) -> bool {
    match method {
        PairingMethod::PasskeyBothInput => true,
        PairingMethod::PasskeyInitiatorInput => role == Role::Initiator,
        PairingMethod::PasskeyResponderInput => role == Role::Responder,
        _ => false,
    }
}
