use core::fmt::{Display, Formatter};

use super::constants::ENCRYPTION_KEY_SIZE_128_BITS;
use crate::codec::{Decode, FixedSize};
use crate::{Error, IoCapabilities};

macro_rules! reasons {
    ($($(#[$doc:meta])* $name:ident = $value:literal => $text:literal,)*) => {
        /// Pairing Failed Reason
        // ([Vol 3] Part H, Section 3.5.5).
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum Reason {
            $($(#[$doc])* $name,)*
        }

        impl TryFrom<u8> for Reason {
            type Error = Error;
            fn try_from(val: u8) -> Result<Self, Error> {
                match val {
                    $($value => Ok(Self::$name),)*
                    _ => Err(Error::InvalidValue),
                }
            }
        }

        impl From<Reason> for u8 {
            fn from(val: Reason) -> u8 {
                match val {
                    $(Reason::$name => $value,)*
                }
            }
        }

        impl AsRef<str> for Reason {
            fn as_ref(&self) -> &str {
                match self {
                    $(Reason::$name => $text,)*
                }
            }
        }
    };
}

reasons! {
    /// The user cancelled or failed passkey entry.
    PasskeyEntryFailed = 0x01 => "Passkey entry canceled or failed",
    /// Out of band data is not available.
    OobNotAvailable = 0x02 => "Out-of-band data not available",
    /// The I/O capabilities of the devices cannot satisfy the authentication requirements.
    AuthenticationRequirements = 0x03 => "Authentication requirements not met",
    /// The confirm value does not match the recomputed one.
    ConfirmValueFailed = 0x04 => "Confirm value does not match",
    /// The device does not support pairing.
    PairingNotSupported = 0x05 => "Device does not support pairing",
    /// The resulting key is too short.
    EncryptionKeySize = 0x06 => "Encryption key size is not long enough",
    /// The SMP command is not supported.
    CommandNotSupported = 0x07 => "Security manager protocol command not supported",
    /// Anything else, including an unexpected command.
    UnspecifiedReason = 0x08 => "Pairing failed due to an unspecified reason",
    /// Too little time has elapsed since the last attempt.
    RepeatedAttempts = 0x09 => "Pairing failed due to repeated attempts",
    /// Invalid command length or parameter.
    InvalidParameters = 0x0a => "Command and/or parameter invalid",
    /// DHKey check mismatch.
    DHKeyCheckFailed = 0x0b => "DH key check value does not match",
    /// Numeric comparison mismatch.
    NumericComparisonFailed = 0x0c => "Numeric comparison values do not match",
    /// Pairing over BR/EDR in progress.
    BrEdrPairingInProgress = 0x0d => "Pairing in progress over BR/EDR",
    /// Cross transport key derivation not allowed.
    GenerationNotAllowed = 0x0e => "Link key generation failed",
    /// A distributed key was rejected.
    KeyRejected = 0x0f => "Device rejected distributed key",
    /// The device is not ready to pair.
    Busy = 0x10 => "Device is not ready to perform pairing",
}

impl core::fmt::Display for Reason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Reason {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "{}", self.as_ref())
    }
}

macro_rules! commands {
    ($($name:ident = $value:literal, $size:literal, $text:literal;)*) => {
        /// Security Manager Protocol (SMP) Command
        // ([Vol 3] Part H, Section 3.3).
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub(crate) enum Command {
            $($name,)*
        }

        impl Command {
            /// Command payload size excluding command octet
            pub const fn payload_size(&self) -> u16 {
                match self {
                    $(Command::$name => $size,)*
                }
            }
        }

        impl From<Command> for u8 {
            fn from(value: Command) -> u8 {
                match value {
                    $(Command::$name => $value,)*
                }
            }
        }

        impl TryFrom<u8> for Command {
            type Error = Error;

            fn try_from(value: u8) -> Result<Command, Error> {
                match value {
                    $($value => Ok(Command::$name),)*
                    _ => Err(Error::InvalidValue),
                }
            }
        }

        impl AsRef<str> for Command {
            fn as_ref(&self) -> &str {
                match self {
                    $(Command::$name => $text,)*
                }
            }
        }
    };
}

commands! {
    PairingRequest = 0x01, 6, "Pairing Request";
    PairingResponse = 0x02, 6, "Pairing Response";
    PairingConfirm = 0x03, 16, "Pairing Confirm";
    PairingRandom = 0x04, 16, "Pairing Random";
    PairingFailed = 0x05, 1, "Pairing Failed";
    EncryptionInformation = 0x06, 16, "Encryption Information";
    CentralIdentification = 0x07, 10, "Central Identification";
    IdentityInformation = 0x08, 16, "Identity Information";
    IdentityAddressInformation = 0x09, 7, "Identity Address Information";
    SigningInformation = 0x0a, 16, "Signing Information";
    SecurityRequest = 0x0b, 1, "Security Request";
    PairingPublicKey = 0x0c, 64, "Pairing Public Key";
    PairingDhKeyCheck = 0x0d, 16, "Pairing DH Key Check";
    KeypressNotification = 0x0e, 1, "Keypress Notification";
}

impl core::fmt::Display for Command {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Command {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "{}", self.as_ref())
    }
}

/// A six digit passkey
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PassKey(pub(crate) u32);

impl PassKey {
    /// Get the underlying value as an integer.
    pub fn value(&self) -> u32 {
        self.0
    }
}

impl Display for PassKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:06}", self.0)
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for PassKey {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "{=u32:06}", self.0)
    }
}

/// Keypress notification type
// ([Vol 3] Part H, Section 3.5.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum KeypressAction {
    /// Passkey entry started
    EntryStarted,
    /// Passkey digit entered
    DigitEntered,
    /// Passkey digit erased
    DigitErased,
    /// Passkey cleared
    Cleared,
    /// Passkey entry completed
    EntryCompleted,
}

impl TryFrom<u8> for KeypressAction {
    type Error = Error;
    fn try_from(val: u8) -> Result<Self, Error> {
        Ok(match val {
            0 => Self::EntryStarted,
            1 => Self::DigitEntered,
            2 => Self::DigitErased,
            3 => Self::Cleared,
            4 => Self::EntryCompleted,
            _ => return Err(Error::InvalidValue),
        })
    }
}

/// Out of band (OOB) authentication data
// ([Vol 3] Part H, Section 2.3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum UseOutOfBand {
    /// OOB not present
    NotPresent = 0,
    /// OOB present
    Present = 1,
}

impl TryFrom<u8> for UseOutOfBand {
    type Error = Error;
    fn try_from(val: u8) -> Result<Self, Error> {
        Ok(match val {
            0x00 => Self::NotPresent,
            0x01 => Self::Present,
            _ => return Err(Error::InvalidValue),
        })
    }
}

impl From<UseOutOfBand> for u8 {
    fn from(val: UseOutOfBand) -> u8 {
        val as u8
    }
}

impl From<bool> for UseOutOfBand {
    fn from(present: bool) -> Self {
        if present {
            UseOutOfBand::Present
        } else {
            UseOutOfBand::NotPresent
        }
    }
}

/// Bit field indicating the type of bonding requested
// ([Vol 3] Part H, Section 3.5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum BondingFlag {
    /// No bonding
    NoBonding = 0,
    /// Bonding
    Bonding = 1,
}

/// AuthReq octet
// ([Vol 3] Part H, Section 3.5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AuthReq(u8);

/// Man in the middle (MITM) protection requested
const AUTH_REQ_MITM: u8 = 0b0000_0100;
/// LE Secure Connections supported
const AUTH_REQ_SECURE_CONNECTION: u8 = 0b0000_1000;
/// Keypress notification during Passkey entry protocol
const AUTH_REQ_KEY_PRESS: u8 = 0b0001_0000;

impl AuthReq {
    /// Bond requested; reserved bonding values read as no bonding
    pub fn bond(&self) -> BondingFlag {
        if self.0 & 0b11 == 0b01 {
            BondingFlag::Bonding
        } else {
            BondingFlag::NoBonding
        }
    }
    /// Man in the middle (MITM) protection requested
    pub fn man_in_the_middle(&self) -> bool {
        (self.0 & AUTH_REQ_MITM) == AUTH_REQ_MITM
    }
    /// LE Secure Connections supported
    pub fn secure_connection(&self) -> bool {
        (self.0 & AUTH_REQ_SECURE_CONNECTION) == AUTH_REQ_SECURE_CONNECTION
    }
    ///  Keypress notification during Passkey entry protocol
    pub fn key_press_notification(&self) -> bool {
        (self.0 & AUTH_REQ_KEY_PRESS) == AUTH_REQ_KEY_PRESS
    }
}

impl From<u8> for AuthReq {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

impl From<AuthReq> for u8 {
    fn from(value: AuthReq) -> u8 {
        value.0
    }
}

impl core::fmt::Display for AuthReq {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{} {} {} {}",
            if matches!(self.bond(), BondingFlag::Bonding) { "BOND" } else { "" },
            if self.man_in_the_middle() { "MITM" } else { "" },
            if self.secure_connection() { "SC" } else { "" },
            if self.key_press_notification() { "KP" } else { "" },
        )
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for AuthReq {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "AuthReq({=u8:#04x})", self.0)
    }
}

/// Key Distribution Flags
// ([Vol 3] Part H, Section 3.6.1).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) struct KeyDistributionFlags(u8);

impl KeyDistributionFlags {
    /// Distribute Long Term Key (LTK)
    pub(crate) const ENCRYPTION_KEY: u8 = 0b0000_0001;
    /// Distribute Identity Resolving Key (IRK)
    pub(crate) const IDENTITY_KEY: u8 = 0b0000_0010;
    /// Distribute Connection Signature Resolving Key (CSRK)
    pub(crate) const SIGNING_KEY: u8 = 0b0000_0100;

    /// Encryption key flag
    pub(crate) fn encryption_key(&self) -> bool {
        (self.0 & Self::ENCRYPTION_KEY) == Self::ENCRYPTION_KEY
    }
    /// Identity key flag
    pub(crate) fn identity_key(&self) -> bool {
        (self.0 & Self::IDENTITY_KEY) == Self::IDENTITY_KEY
    }
    /// Signing key flag
    pub(crate) fn signing_key(&self) -> bool {
        (self.0 & Self::SIGNING_KEY) == Self::SIGNING_KEY
    }
    /// Flags present in both sets
    pub(crate) fn intersect(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }
}

impl From<u8> for KeyDistributionFlags {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

impl From<KeyDistributionFlags> for u8 {
    fn from(value: KeyDistributionFlags) -> u8 {
        value.0
    }
}

impl core::fmt::Display for KeyDistributionFlags {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{} {} {}",
            if self.encryption_key() { "ENC" } else { "" },
            if self.identity_key() { "ID" } else { "" },
            if self.signing_key() { "SGN" } else { "" },
        )
    }
}

/// Key distribution PDUs still to be sent or received.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) struct KeySet(u8);

impl KeySet {
    pub(crate) const ENCRYPTION_INFORMATION: u8 = 0b0000_0001;
    pub(crate) const CENTRAL_IDENTIFICATION: u8 = 0b0000_0010;
    pub(crate) const IDENTITY_INFORMATION: u8 = 0b0000_0100;
    pub(crate) const IDENTITY_ADDRESS_INFORMATION: u8 = 0b0000_1000;
    pub(crate) const SIGNING_INFORMATION: u8 = 0b0001_0000;

    /// PDUs implied by a set of key distribution flags
    pub(crate) fn from_flags(flags: KeyDistributionFlags) -> Self {
        let mut set = 0;
        if flags.encryption_key() {
            set |= Self::ENCRYPTION_INFORMATION | Self::CENTRAL_IDENTIFICATION;
        }
        if flags.identity_key() {
            set |= Self::IDENTITY_INFORMATION | Self::IDENTITY_ADDRESS_INFORMATION;
        }
        if flags.signing_key() {
            set |= Self::SIGNING_INFORMATION;
        }
        Self(set)
    }

    pub(crate) fn contains(&self, bit: u8) -> bool {
        self.0 & bit == bit
    }

    pub(crate) fn insert(&mut self, bit: u8) {
        self.0 |= bit;
    }

    pub(crate) fn remove(&mut self, bit: u8) {
        self.0 &= !bit;
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Lowest pending bit, which is the next PDU in distribution order
    pub(crate) fn first(&self) -> Option<u8> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0 & self.0.wrapping_neg())
        }
    }
}

/// Pairing features used in pairing request and pairing response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PairingFeatures {
    pub(crate) io_capabilities: u8,
    pub(crate) use_oob: UseOutOfBand,
    pub(crate) security_properties: AuthReq,
    pub(crate) maximum_encryption_key_size: u8,
    pub(crate) initiator_key_distribution: KeyDistributionFlags,
    pub(crate) responder_key_distribution: KeyDistributionFlags,
}

impl PairingFeatures {
    /// I/O capabilities, `None` for reserved values
    pub(crate) fn io_capabilities(&self) -> Option<IoCapabilities> {
        IoCapabilities::try_from(self.io_capabilities).ok()
    }

    /// The PDU as it went over the air, opcode included
    pub(crate) fn to_pdu(&self, command: Command) -> [u8; 7] {
        let mut pdu = [0; 7];
        pdu[0] = command.into();
        pdu[1] = self.io_capabilities;
        pdu[2] = self.use_oob.into();
        pdu[3] = self.security_properties.into();
        pdu[4] = self.maximum_encryption_key_size;
        pdu[5] = self.initiator_key_distribution.into();
        pdu[6] = self.responder_key_distribution.into();
        pdu
    }
}

impl Default for PairingFeatures {
    fn default() -> Self {
        Self {
            io_capabilities: IoCapabilities::NoInputNoOutput.into(),
            use_oob: UseOutOfBand::NotPresent,
            security_properties: AuthReq(0),
            maximum_encryption_key_size: ENCRYPTION_KEY_SIZE_128_BITS,
            initiator_key_distribution: KeyDistributionFlags(0),
            responder_key_distribution: KeyDistributionFlags(0),
        }
    }
}

impl FixedSize for PairingFeatures {
    const SIZE: usize = Command::PairingRequest.payload_size() as usize;
}

impl Decode<'_> for PairingFeatures {
    fn decode(source: &[u8]) -> Result<PairingFeatures, crate::codec::Error> {
        if source.len() < Self::SIZE {
            return Err(crate::codec::Error::InsufficientSpace);
        }
        // Unknown I/O capabilities are kept as is, they select Just Works.
        let use_oob = UseOutOfBand::try_from(source[1]).map_err(|_| crate::codec::Error::InvalidValue)?;
        Ok(Self {
            io_capabilities: source[0],
            use_oob,
            security_properties: AuthReq::from(source[2]),
            maximum_encryption_key_size: source[3],
            initiator_key_distribution: KeyDistributionFlags::from(source[4]),
            responder_key_distribution: KeyDistributionFlags::from(source[5]),
        })
    }
}

impl core::fmt::Display for PairingFeatures {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "I/O {} OOB {} SP {} KS {} IKD {} RKD {}",
            self.io_capabilities,
            if matches!(self.use_oob, UseOutOfBand::Present) { "OOB" } else { "" },
            self.security_properties,
            u16::from(self.maximum_encryption_key_size) * 8,
            self.initiator_key_distribution,
            self.responder_key_distribution
        )
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for PairingFeatures {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(
            fmt,
            "I/O {} OOB {} SP {} KS {} IKD {} RKD {}",
            self.io_capabilities,
            self.use_oob,
            self.security_properties,
            u16::from(self.maximum_encryption_key_size) * 8,
            self.initiator_key_distribution,
            self.responder_key_distribution
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_variant() {
        assert!(u8::from(Reason::PasskeyEntryFailed) == 1);
        assert!(u8::from(Reason::ConfirmValueFailed) == 4);
        assert!(u8::from(Reason::EncryptionKeySize) == 6);
        assert!(u8::from(Reason::UnspecifiedReason) == 8);
        assert!(u8::from(Reason::Busy) == 16);

        for n in 1..=16u8 {
            assert!(u8::from(Reason::try_from(n).unwrap()) == n);
        }
        assert!(Reason::try_from(0) == Err(Error::InvalidValue));
        for n in 17..u8::MAX {
            assert!(Reason::try_from(n) == Err(Error::InvalidValue));
        }
    }

    #[test]
    fn command_variants() {
        assert!(u8::from(Command::PairingRequest) == 0x01);
        assert!(u8::from(Command::CentralIdentification) == 0x07);
        assert!(u8::from(Command::SecurityRequest) == 0x0b);
        assert!(u8::from(Command::KeypressNotification) == 0x0e);
        for n in 1..=0x0eu8 {
            assert!(u8::from(Command::try_from(n).unwrap()) == n);
        }
        for n in 0x0f..u8::MAX {
            assert!(Command::try_from(n) == Err(Error::InvalidValue));
        }

        assert!(Command::PairingRequest.payload_size() == 6);
        assert!(Command::PairingConfirm.payload_size() == 16);
        assert!(Command::PairingFailed.payload_size() == 1);
        assert!(Command::CentralIdentification.payload_size() == 10);
        assert!(Command::IdentityAddressInformation.payload_size() == 7);
        assert!(Command::PairingPublicKey.payload_size() == 64);
    }

    #[test]
    fn pairing_features_decode() {
        let features = PairingFeatures::decode(&[0x03, 0x00, 0x01, 0x10, 0x07, 0x07]).unwrap();
        assert_eq!(features.io_capabilities(), Some(IoCapabilities::NoInputNoOutput));
        assert_eq!(features.security_properties.bond(), BondingFlag::Bonding);
        assert!(!features.security_properties.man_in_the_middle());
        assert_eq!(features.maximum_encryption_key_size, 16);
        assert_eq!(
            features.to_pdu(Command::PairingResponse),
            [0x02, 0x03, 0x00, 0x01, 0x10, 0x07, 0x07]
        );

        // key size is checked during negotiation
        let features = PairingFeatures::decode(&[0x03, 0x00, 0x01, 0x06, 0x07, 0x07]).unwrap();
        assert_eq!(features.maximum_encryption_key_size, 6);
        // reserved OOB flag
        assert!(PairingFeatures::decode(&[0x03, 0x02, 0x01, 0x10, 0x07, 0x07]).is_err());
        // reserved I/O capability is kept
        let features = PairingFeatures::decode(&[0x09, 0x00, 0x04, 0x10, 0x00, 0x00]).unwrap();
        assert_eq!(features.io_capabilities(), None);
    }

    #[test]
    fn pairing_features_from_cursor() {
        let payload = [0x03, 0x00, 0x01, 0x10, 0x07, 0x07, 0xaa];
        let mut r = crate::cursor::ReadCursor::new(&payload);
        let features: PairingFeatures = r.read().unwrap();
        assert_eq!(features.maximum_encryption_key_size, 16);
        assert_eq!(r.read_u8().unwrap(), 0xaa);

        let mut short = crate::cursor::ReadCursor::new(&payload[..5]);
        assert!(short.read::<PairingFeatures>().is_err());
    }

    #[test]
    fn pairing_features_display() {
        use core::fmt::Write;

        let features = PairingFeatures::decode(&[0x03, 0x00, 0x01, 0xff, 0x07, 0x07]).unwrap();
        let mut text = heapless::String::<256>::new();
        write!(text, "{}", features).unwrap();
        assert!(text.contains("KS 2040"));
    }

    #[test]
    fn key_set_order() {
        let all = KeyDistributionFlags::from(
            KeyDistributionFlags::ENCRYPTION_KEY | KeyDistributionFlags::IDENTITY_KEY | KeyDistributionFlags::SIGNING_KEY,
        );
        let mut set = KeySet::from_flags(all);
        let mut order = heapless::Vec::<u8, 5>::new();
        while let Some(bit) = set.first() {
            order.push(bit).unwrap();
            set.remove(bit);
        }
        assert_eq!(
            order.as_slice(),
            &[
                KeySet::ENCRYPTION_INFORMATION,
                KeySet::CENTRAL_IDENTIFICATION,
                KeySet::IDENTITY_INFORMATION,
                KeySet::IDENTITY_ADDRESS_INFORMATION,
                KeySet::SIGNING_INFORMATION
            ]
        );
        assert!(KeySet::from_flags(KeyDistributionFlags::default()).is_empty());
    }
}
