//! Identity Resolving Key and Diversifier Hiding Key derivation from IR.

use super::constants::{D1_DHK_DIVERSIFIER, D1_IRK_DIVERSIFIER};
use super::crypto::{d1_block, Block};
use super::gateway::{CryptoContext, CryptoGateway, CryptoSource};
use crate::{Error, IdentityResolvingKey, SecurityConfig};

const fn default_root(base: u8) -> Block {
    let mut key = [0; 16];
    let mut i = 0;
    while i < 16 {
        key[i] = base + i as u8;
        i += 1;
    }
    key
}

/// Built-in Encryption Root, not secret.
const DEFAULT_ER: Block = default_root(0x30);
/// Built-in Identity Root, not secret.
const DEFAULT_IR: Block = default_root(0x90);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum DerivedKeyState {
    W4Start,
    CalcIrk,
    W4Irk,
    CalcDhk,
    W4Dhk,
    Ready,
}

/// Root keys and the keys derived from them.
pub(crate) struct DerivedKeys {
    state: DerivedKeyState,
    er: Block,
    ir: Block,
    irk: Block,
    dhk: Block,
}

impl DerivedKeys {
    pub(crate) fn new(config: &SecurityConfig) -> Self {
        let er = config.er.unwrap_or_else(|| {
            error!("[security manager] no ER configured, using the built-in key: bonds are not secure");
            DEFAULT_ER
        });
        let ir = config.ir.unwrap_or_else(|| {
            error!("[security manager] no IR configured, using the built-in key: identity is not secure");
            DEFAULT_IR
        });
        Self {
            state: DerivedKeyState::W4Start,
            er,
            ir,
            irk: [0; 16],
            dhk: [0; 16],
        }
    }

    pub(crate) fn start(&mut self) {
        if self.state == DerivedKeyState::W4Start {
            self.state = DerivedKeyState::CalcIrk;
        }
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.state == DerivedKeyState::Ready
    }

    pub(crate) fn er(&self) -> &Block {
        &self.er
    }

    pub(crate) fn dhk(&self) -> &Block {
        &self.dhk
    }

    pub(crate) fn irk(&self) -> IdentityResolvingKey {
        IdentityResolvingKey::from_be_bytes(self.irk)
    }

    pub(crate) fn step<C: CryptoSource>(&mut self, gateway: &mut CryptoGateway, source: &mut C) -> Result<bool, Error> {
        let (diversifier, next) = match self.state {
            DerivedKeyState::CalcIrk => (D1_IRK_DIVERSIFIER, DerivedKeyState::W4Irk),
            DerivedKeyState::CalcDhk => (D1_DHK_DIVERSIFIER, DerivedKeyState::W4Dhk),
            _ => return Ok(false),
        };
        gateway.start_cipher(source, &self.ir, &d1_block(diversifier, 0), CryptoContext::DerivedKeys)?;
        self.state = next;
        Ok(true)
    }

    /// Returns `true` once both keys are known.
    pub(crate) fn handle_result(&mut self, result: &Block) -> bool {
        match self.state {
            DerivedKeyState::W4Irk => {
                self.irk = *result;
                trace!("[security manager] IRK {:?}", crate::fmt::Bytes(&self.irk));
                self.state = DerivedKeyState::CalcDhk;
                false
            }
            DerivedKeyState::W4Dhk => {
                self.dhk = *result;
                trace!("[security manager] DHK {:?}", crate::fmt::Bytes(&self.dhk));
                self.state = DerivedKeyState::Ready;
                true
            }
            state => {
                warn!("[security manager] derived key result in state {:?}, dropped", state);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security_manager::gateway::RequestKind;

    #[derive(Default)]
    struct Source {
        last: Option<(Block, Block)>,
    }

    impl CryptoSource for Source {
        fn start_encrypt(&mut self, key: &[u8; 16], plaintext: &[u8; 16]) -> Result<(), Error> {
            self.last = Some((*key, *plaintext));
            Ok(())
        }

        fn start_random(&mut self) -> Result<(), Error> {
            Err(Error::InvalidState)
        }
    }

    #[test]
    fn default_roots() {
        assert_eq!(DEFAULT_ER[0], 0x30);
        assert_eq!(DEFAULT_ER[15], 0x3f);
        assert_eq!(DEFAULT_IR[0], 0x90);
        assert_eq!(DEFAULT_IR[15], 0x9f);
    }

    #[test]
    fn irk_then_dhk() {
        let mut keys = DerivedKeys::new(&SecurityConfig {
            ir: Some([7; 16]),
            ..Default::default()
        });
        let mut gateway = CryptoGateway::default();
        let mut source = Source::default();

        assert!(!keys.step(&mut gateway, &mut source).unwrap());
        keys.start();

        assert!(keys.step(&mut gateway, &mut source).unwrap());
        assert_eq!(source.last, Some(([7; 16], d1_block(1, 0))));
        gateway.complete(RequestKind::Cipher);
        assert!(!keys.handle_result(&[1; 16]));

        assert!(keys.step(&mut gateway, &mut source).unwrap());
        assert_eq!(source.last, Some(([7; 16], d1_block(3, 0))));
        gateway.complete(RequestKind::Cipher);
        assert!(keys.handle_result(&[3; 16]));

        assert!(keys.is_ready());
        assert_eq!(keys.irk().to_be_bytes(), [1; 16]);
        assert_eq!(keys.dhk(), &[3; 16]);
        assert_eq!(keys.er(), &DEFAULT_ER);
        assert!(!keys.step(&mut gateway, &mut source).unwrap());
    }
}
