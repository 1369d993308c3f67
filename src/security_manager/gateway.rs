//! Serialized access to the controller's AES-128 and random number generator.

use bt_hci::param::ConnHandle;

use super::crypto::Block;
use crate::Error;

/// Asynchronous source of AES-128 encryption and random numbers.
///
/// Implemented by the controller glue, typically with the HCI LE Encrypt and
/// LE Rand commands. A call only starts the operation; the host hands the
/// result back with [`SecurityManager::handle_encrypt_result`](crate::SecurityManager::handle_encrypt_result)
/// or [`SecurityManager::handle_random_result`](crate::SecurityManager::handle_random_result).
pub trait CryptoSource {
    /// Start `E(key, plaintext)`, both most significant octet first.
    fn start_encrypt(&mut self, key: &[u8; 16], plaintext: &[u8; 16]) -> Result<(), Error>;
    /// Start generating 16 random octets.
    fn start_random(&mut self) -> Result<(), Error>;
}

/// Which sub-machine a pending crypto result belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum CryptoContext {
    DerivedKeys,
    AddressUpdate,
    Cmac,
    Resolution,
    Link(ConnHandle),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum RequestKind {
    Cipher,
    Random,
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    kind: RequestKind,
    context: CryptoContext,
}

/// Single slot arbiter in front of a [`CryptoSource`].
#[derive(Debug, Default)]
pub(crate) struct CryptoGateway {
    pending: Option<Pending>,
}

impl CryptoGateway {
    pub(crate) fn is_busy(&self) -> bool {
        self.pending.is_some()
    }

    pub(crate) fn start_cipher<C: CryptoSource>(
        &mut self,
        source: &mut C,
        key: &Block,
        plaintext: &Block,
        context: CryptoContext,
    ) -> Result<(), Error> {
        if self.is_busy() {
            return Err(Error::Busy);
        }
        source.start_encrypt(key, plaintext)?;
        self.pending = Some(Pending {
            kind: RequestKind::Cipher,
            context,
        });
        Ok(())
    }

    pub(crate) fn start_random<C: CryptoSource>(&mut self, source: &mut C, context: CryptoContext) -> Result<(), Error> {
        if self.is_busy() {
            return Err(Error::Busy);
        }
        source.start_random()?;
        self.pending = Some(Pending {
            kind: RequestKind::Random,
            context,
        });
        Ok(())
    }

    /// Take the context of the outstanding request of kind `kind`.
    pub(crate) fn complete(&mut self, kind: RequestKind) -> Option<CryptoContext> {
        match self.pending {
            Some(pending) if pending.kind == kind => {
                self.pending = None;
                Some(pending.context)
            }
            Some(pending) => {
                warn!(
                    "[crypto] {:?} result while waiting for {:?}, dropped",
                    kind, pending.kind
                );
                None
            }
            None => {
                warn!("[crypto] unexpected {:?} result, dropped", kind);
                None
            }
        }
    }
}
