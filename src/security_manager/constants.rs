use embassy_time::Duration;

/// 128-bit encryption key size
pub(crate) const ENCRYPTION_KEY_SIZE_128_BITS: u8 = 128 / 8;
/// 56-bit encryption key size, the smallest allowed
pub(crate) const ENCRYPTION_KEY_SIZE_MIN: u8 = 56 / 8;

const TIMEOUT_SECS: u64 = 30;
/// Pairing time-out
// ([Vol 3] Part H, Section 3.4).
pub(crate) const TIMEOUT: Duration = Duration::from_secs(TIMEOUT_SECS);

/// Default private address rotation period
pub(crate) const DEFAULT_ADDRESS_UPDATE_PERIOD: Duration = Duration::from_secs(15 * 60);

/// Largest signed write payload the CMAC engine accepts
pub const SIGNED_WRITE_MAX_PAYLOAD: usize = 512;

/// Largest SMP PDU handled (opcode + payload)
pub(crate) const SMP_PDU_MAX: usize = 17;

/// Diversifier for the identity resolving key in d1
pub(crate) const D1_IRK_DIVERSIFIER: u16 = 1;
/// Diversifier for the diversifier hiding key in d1
pub(crate) const D1_DHK_DIVERSIFIER: u16 = 3;
