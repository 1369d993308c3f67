//! Run-time configuration.
//!
//! The security manager is configured once, when it is created, with a [`SecurityConfig`].
//! Capacities (number of links, length of the address resolution queue) are const generic
//! parameters of [`SecurityManager`](crate::SecurityManager) instead.
//!
//! ## Compatibility warning
//!
//! Changing `er` or `ir` invalidates every bond created before: the long term keys handed
//! out to peers are derived from `er`, and the identity resolving key distributed to peers
//! is derived from `ir`. Peers will have to pair again.

use embassy_time::Duration;

use crate::security_manager::constants::{
    DEFAULT_ADDRESS_UPDATE_PERIOD, ENCRYPTION_KEY_SIZE_128_BITS, ENCRYPTION_KEY_SIZE_MIN,
};
use crate::{Address, IoCapabilities};

/// Authentication requirements: bonding requested
pub const AUTH_REQ_BONDING: u8 = 0b0000_0001;
/// Authentication requirements: man-in-the-middle protection requested
pub const AUTH_REQ_MITM: u8 = 0b0000_0100;

/// Pairing methods the application is willing to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AcceptedMethods(u8);

impl AcceptedMethods {
    /// Just Works
    pub const JUST_WORKS: u8 = 0b0001;
    /// Passkey entry
    pub const PASSKEY: u8 = 0b0010;
    /// Out of band
    pub const OUT_OF_BAND: u8 = 0b0100;

    /// Accept every legacy pairing method.
    pub const fn all() -> Self {
        Self(Self::JUST_WORKS | Self::PASSKEY | Self::OUT_OF_BAND)
    }

    /// Accept the methods in `bits`.
    pub const fn new(bits: u8) -> Self {
        Self(bits)
    }

    /// Is Just Works accepted?
    pub fn just_works(&self) -> bool {
        self.0 & Self::JUST_WORKS != 0
    }

    /// Is passkey entry accepted?
    pub fn passkey(&self) -> bool {
        self.0 & Self::PASSKEY != 0
    }

    /// Is out of band accepted?
    pub fn out_of_band(&self) -> bool {
        self.0 & Self::OUT_OF_BAND != 0
    }
}

impl Default for AcceptedMethods {
    fn default() -> Self {
        Self::all()
    }
}

/// Local random address policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AddressMode {
    /// Use the public address
    Off,
    /// Generate one static random address
    Static,
    /// Rotate non-resolvable private addresses
    NonResolvable,
    /// Rotate resolvable private addresses
    Resolvable,
}

/// Hook asked for out of band data for a peer, most significant octet first.
pub type OobDataHook = fn(&Address) -> Option<[u8; 16]>;

/// Security manager configuration.
#[derive(Clone, Copy)]
pub struct SecurityConfig {
    /// Local I/O capabilities
    pub io_capabilities: IoCapabilities,
    /// AuthReq octet sent in Pairing Request/Response and Security Request,
    /// see [`AUTH_REQ_BONDING`] and [`AUTH_REQ_MITM`]
    pub auth_req: u8,
    /// Smallest key size accepted from the peer, in octets (7..=16)
    pub min_key_size: u8,
    /// Largest key size offered, in octets (7..=16)
    pub max_key_size: u8,
    /// Pairing methods the application accepts
    pub accepted_methods: AcceptedMethods,
    /// Encryption Root key, `None` uses a built-in key that is not secret
    pub er: Option<[u8; 16]>,
    /// Identity Root key, `None` uses a built-in key that is not secret
    pub ir: Option<[u8; 16]>,
    /// Local identity address sent during key distribution
    pub identity_address: Address,
    /// Random address policy
    pub address_mode: AddressMode,
    /// Private address rotation period
    pub address_update_period: Duration,
    /// Send a Security Request as soon as a peer connects to us
    pub request_security: bool,
    /// Passkey shown instead of a random one when displaying
    pub fixed_passkey: Option<u32>,
    /// Out of band data lookup
    pub oob_data: Option<OobDataHook>,
}

impl SecurityConfig {
    /// Minimum key size after clamping to the valid range.
    pub(crate) fn min_key_size(&self) -> u8 {
        self.min_key_size.clamp(ENCRYPTION_KEY_SIZE_MIN, ENCRYPTION_KEY_SIZE_128_BITS)
    }

    /// Maximum key size after clamping to the valid range and the minimum.
    pub(crate) fn max_key_size(&self) -> u8 {
        self.max_key_size
            .clamp(ENCRYPTION_KEY_SIZE_MIN, ENCRYPTION_KEY_SIZE_128_BITS)
            .max(self.min_key_size())
    }

    /// Does the local device ask for bonding?
    pub(crate) fn bonding(&self) -> bool {
        self.auth_req & 0b11 == AUTH_REQ_BONDING
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            io_capabilities: IoCapabilities::NoInputNoOutput,
            auth_req: AUTH_REQ_BONDING,
            min_key_size: ENCRYPTION_KEY_SIZE_MIN,
            max_key_size: ENCRYPTION_KEY_SIZE_128_BITS,
            accepted_methods: AcceptedMethods::all(),
            er: None,
            ir: None,
            identity_address: Address::public([0; 6]),
            address_mode: AddressMode::Off,
            address_update_period: DEFAULT_ADDRESS_UPDATE_PERIOD,
            request_security: false,
            fixed_passkey: None,
            oob_data: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_size_clamping() {
        let config = SecurityConfig {
            min_key_size: 3,
            max_key_size: 40,
            ..Default::default()
        };
        assert_eq!(config.min_key_size(), 7);
        assert_eq!(config.max_key_size(), 16);

        let config = SecurityConfig {
            min_key_size: 12,
            max_key_size: 10,
            ..Default::default()
        };
        assert_eq!(config.max_key_size(), 12);
    }

    #[test]
    fn accepted_methods() {
        let methods = AcceptedMethods::new(AcceptedMethods::PASSKEY);
        assert!(methods.passkey());
        assert!(!methods.just_works());
        assert!(!methods.out_of_band());
        assert!(AcceptedMethods::default().just_works());
    }
}
