//! A cooperative Bluetooth LE Security Manager for `no_std` hosts.
//!
//! The engine never blocks: feed it SMP PDUs, controller events and crypto
//! completions, then call [`SecurityManager::poll`] until it has nothing more to do.
#![no_std]

use bt_hci::param::{AddrKind, BdAddr};

mod fmt;

pub mod codec;
mod cursor;
pub mod config;
pub mod security_manager;
pub mod types;

pub use config::{AcceptedMethods, AddressMode, SecurityConfig};
pub use security_manager::{
    CryptoSource, DeviceStore, EventSink, MemoryStore, PassKey, Reason, SecurityEvent, SecurityManager, Transport,
};
pub use types::capabilities::IoCapabilities;
pub use types::security::{EncryptionInformation, IdentityResolvingKey, LongTermKey, SignatureKey};

/// Commonly used types.
pub mod prelude {
    pub use bt_hci::param::{AddrKind, BdAddr, ConnHandle};

    pub use crate::security_manager::{
        AuthorizationState, IdentityLookup, KeypressAction, PairingStatus, ReencryptionStatus, Role,
    };
    pub use crate::{
        AcceptedMethods, Address, AddressMode, CryptoSource, DeviceStore, EncryptionInformation, Error, EventSink,
        IdentityResolvingKey, IoCapabilities, LongTermKey, MemoryStore, PassKey, Reason, SecurityConfig,
        SecurityEvent, SecurityManager, SignatureKey, Transport,
    };
}

/// A Bluetooth device address together with its kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Address {
    /// Address kind (public or random).
    pub kind: AddrKind,
    /// Address octets, least significant octet first.
    pub addr: BdAddr,
}

impl Address {
    /// A random device address.
    pub fn random(val: [u8; 6]) -> Self {
        Self {
            kind: AddrKind::RANDOM,
            addr: BdAddr::new(val),
        }
    }

    /// A public device address.
    pub fn public(val: [u8; 6]) -> Self {
        Self {
            kind: AddrKind::PUBLIC,
            addr: BdAddr::new(val),
        }
    }

    /// Is this a public device address?
    pub fn is_public(&self) -> bool {
        self.kind == AddrKind::PUBLIC
    }

    /// Address octets, most significant octet first.
    pub(crate) fn to_be_bytes(&self) -> [u8; 6] {
        let mut out = [0; 6];
        out.copy_from_slice(self.addr.raw());
        out.reverse();
        out
    }

    /// Address type octet as used by c1 and the identity address PDU.
    pub(crate) fn type_octet(&self) -> u8 {
        if self.is_public() {
            0
        } else {
            1
        }
    }
}

impl core::fmt::Display for Address {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let a = self.to_be_bytes();
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x} ({})",
            a[0],
            a[1],
            a[2],
            a[3],
            a[4],
            a[5],
            if self.is_public() { "public" } else { "random" }
        )
    }
}

/// Errors returned by the security manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The resource is in use, try again later.
    Busy,
    /// A fixed-capacity container is full.
    OutOfMemory,
    /// The connection or record is not known.
    NotFound,
    /// A parameter has an invalid value.
    InvalidValue,
    /// The operation is not valid in the current state.
    InvalidState,
    /// A pairing timed out.
    Timeout,
    /// The controller transport rejected a command.
    Transport,
    /// Security manager protocol failure.
    Security(Reason),
    /// Encoding or decoding failure.
    Codec(codec::Error),
}

impl From<codec::Error> for Error {
    fn from(error: codec::Error) -> Self {
        Self::Codec(error)
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Busy => write!(f, "Busy"),
            Error::OutOfMemory => write!(f, "OutOfMemory"),
            Error::NotFound => write!(f, "NotFound"),
            Error::InvalidValue => write!(f, "InvalidValue"),
            Error::InvalidState => write!(f, "InvalidState"),
            Error::Timeout => write!(f, "Timeout"),
            Error::Transport => write!(f, "Transport"),
            Error::Security(reason) => write!(f, "Security({})", reason),
            Error::Codec(_) => write!(f, "Codec"),
        }
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Error {
    fn format(&self, fmt: defmt::Formatter) {
        match self {
            Error::Busy => defmt::write!(fmt, "Busy"),
            Error::OutOfMemory => defmt::write!(fmt, "OutOfMemory"),
            Error::NotFound => defmt::write!(fmt, "NotFound"),
            Error::InvalidValue => defmt::write!(fmt, "InvalidValue"),
            Error::InvalidState => defmt::write!(fmt, "InvalidState"),
            Error::Timeout => defmt::write!(fmt, "Timeout"),
            Error::Transport => defmt::write!(fmt, "Transport"),
            Error::Security(reason) => defmt::write!(fmt, "Security({})", reason),
            Error::Codec(value) => defmt::write!(fmt, "Codec({})", value),
        }
    }
}
