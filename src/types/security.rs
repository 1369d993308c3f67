//! Key material and the bonding record shared with the device store.

macro_rules! key_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
        pub struct $name(pub u128);

        impl $name {
            /// Create a key from its integer value.
            pub const fn new(value: u128) -> Self {
                Self(value)
            }

            /// Key from octets in most significant octet first order.
            pub const fn from_be_bytes(bytes: [u8; 16]) -> Self {
                Self(u128::from_be_bytes(bytes))
            }

            /// Key from octets in wire (least significant octet first) order.
            pub const fn from_le_bytes(bytes: [u8; 16]) -> Self {
                Self(u128::from_le_bytes(bytes))
            }

            /// Octets in most significant octet first order.
            pub const fn to_be_bytes(self) -> [u8; 16] {
                self.0.to_be_bytes()
            }

            /// Octets in wire (least significant octet first) order.
            pub const fn to_le_bytes(self) -> [u8; 16] {
                self.0.to_le_bytes()
            }

            /// Is this the all-zero key?
            pub const fn is_null(&self) -> bool {
                self.0 == 0
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{:032x}", self.0)
            }
        }

        #[cfg(feature = "defmt")]
        impl defmt::Format for $name {
            fn format(&self, fmt: defmt::Formatter) {
                defmt::write!(fmt, "{:032x}", self.0)
            }
        }
    };
}

key_type!(
    /// Long Term Key (LTK)
    // ([Vol 3] Part H, Section 2.4.2).
    LongTermKey
);

key_type!(
    /// Identity Resolving Key (IRK)
    // ([Vol 3] Part H, Section 2.4.2.1).
    IdentityResolvingKey
);

key_type!(
    /// Connection Signature Resolving Key (CSRK)
    // ([Vol 3] Part H, Section 2.4.2.2).
    SignatureKey
);

impl LongTermKey {
    /// Mask the key down to `key_size` octets
    // ([Vol 3] Part H, Section 2.3.4).
    pub fn truncated(self, key_size: u8) -> Self {
        if key_size >= 16 {
            self
        } else {
            Self(self.0 & ((1u128 << (u32::from(key_size) * 8)) - 1))
        }
    }
}

/// Encryption information kept for a bonded device.
///
/// `ediv`, `rand` and `ltk` are the values the peer distributed and are used when
/// re-encrypting as initiator. `key_size`, `authenticated` and `authorized` describe
/// the pairing that produced the bond and are used in both roles.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EncryptionInformation {
    /// Encrypted diversifier
    pub ediv: u16,
    /// Random number
    pub rand: u64,
    /// Long term key
    pub ltk: LongTermKey,
    /// Negotiated key size in octets
    pub key_size: u8,
    /// Bond created with MITM protection
    pub authenticated: bool,
    /// Authorization granted by the application
    pub authorized: bool,
}

impl EncryptionInformation {
    /// Can an initiator re-encrypt with this information?
    pub fn has_ltk(&self) -> bool {
        self.ediv != 0 || self.rand != 0
    }
}
