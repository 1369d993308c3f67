//! AES-CMAC ([Vol 3] Part H, Section 2.2.5), one cipher call per step.
//!
//! The message is never materialized: [`CmacMessage::byte`] is asked for
//! each octet as its block is fed to the cipher.

use heapless::Vec;

use super::constants::SIGNED_WRITE_MAX_PAYLOAD;
use super::crypto::{xor, Block};
use super::gateway::{CryptoContext, CryptoGateway, CryptoSource};
use crate::Error;

/// A message authenticated by the CMAC engine.
pub trait CmacMessage {
    /// Message length in octets.
    fn len(&self) -> usize;
    /// Octet at `offset` of the CMAC input.
    fn byte(&self, offset: usize) -> u8;
    /// Is the message empty?
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Signed Write Command to be signed with the local CSRK.
///
/// The signed data is the opcode, the attribute handle, the value and the
/// sign counter, fed to AES-CMAC last octet first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedWrite {
    header: [u8; 3],
    payload: Vec<u8, SIGNED_WRITE_MAX_PAYLOAD>,
    counter: [u8; 4],
}

impl SignedWrite {
    /// Build the message for `opcode` writing `payload` to `attribute_handle`.
    pub fn new(opcode: u8, attribute_handle: u16, payload: &[u8], sign_counter: u32) -> Result<Self, Error> {
        let [lo, hi] = attribute_handle.to_le_bytes();
        Ok(Self {
            header: [opcode, lo, hi],
            payload: Vec::from_slice(payload).map_err(|_| Error::InvalidValue)?,
            counter: sign_counter.to_le_bytes(),
        })
    }
}

impl CmacMessage for SignedWrite {
    fn len(&self) -> usize {
        self.header.len() + self.payload.len() + self.counter.len()
    }

    fn byte(&self, offset: usize) -> u8 {
        let pos = self.len() - 1 - offset;
        let payload_end = self.header.len() + self.payload.len();
        if pos < self.header.len() {
            self.header[pos]
        } else if pos < payload_end {
            self.payload[pos - self.header.len()]
        } else {
            self.counter[pos - payload_end]
        }
    }
}

/// Subkey generation step: `L << 1`, folding in the constant on carry.
pub(crate) fn subkey(l: &Block) -> Block {
    let mut k = [0; 16];
    let mut carry = 0;
    for i in (0..16).rev() {
        k[i] = (l[i] << 1) | carry;
        carry = l[i] >> 7;
    }
    if l[0] & 0x80 != 0 {
        k[15] ^= 0x87;
    }
    k
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum CmacState {
    Idle,
    CalcSubkeys,
    W4Subkeys,
    CalcMi,
    W4Mi,
    CalcMlast,
    W4Mlast,
}

pub(crate) struct CmacEngine<M> {
    state: CmacState,
    key: Block,
    message: Option<M>,
    k1: Block,
    k2: Block,
    x: Block,
    block: usize,
    blocks: usize,
}

impl<M: CmacMessage> CmacEngine<M> {
    pub(crate) const fn new() -> Self {
        Self {
            state: CmacState::Idle,
            key: [0; 16],
            message: None,
            k1: [0; 16],
            k2: [0; 16],
            x: [0; 16],
            block: 0,
            blocks: 0,
        }
    }

    /// Can a new computation be started?
    pub(crate) fn is_ready(&self) -> bool {
        self.state == CmacState::Idle
    }

    pub(crate) fn start(&mut self, key: &Block, message: M) -> Result<(), Error> {
        if !self.is_ready() {
            return Err(Error::Busy);
        }
        self.blocks = message.len().div_ceil(16).max(1);
        self.block = 0;
        self.x = [0; 16];
        self.key = *key;
        self.message = Some(message);
        self.state = CmacState::CalcSubkeys;
        Ok(())
    }

    /// Issue the next cipher call, `Ok(false)` if there is none to issue.
    pub(crate) fn step<C: CryptoSource>(&mut self, gateway: &mut CryptoGateway, source: &mut C) -> Result<bool, Error> {
        let (plaintext, next) = match self.state {
            CmacState::CalcSubkeys => ([0; 16], CmacState::W4Subkeys),
            CmacState::CalcMi => (xor(&self.x, &self.message_block(self.block)), CmacState::W4Mi),
            CmacState::CalcMlast => (xor(&self.x, &self.last_block()), CmacState::W4Mlast),
            _ => return Ok(false),
        };
        gateway.start_cipher(source, &self.key, &plaintext, CryptoContext::Cmac)?;
        self.state = next;
        Ok(true)
    }

    /// Feed a cipher result, returns the MAC once the last block is done.
    pub(crate) fn handle_result(&mut self, result: &Block) -> Option<Block> {
        match self.state {
            CmacState::W4Subkeys => {
                self.k1 = subkey(result);
                self.k2 = subkey(&self.k1);
                self.state = if self.blocks == 1 {
                    CmacState::CalcMlast
                } else {
                    CmacState::CalcMi
                };
                None
            }
            CmacState::W4Mi => {
                self.x = *result;
                self.block += 1;
                self.state = if self.block == self.blocks - 1 {
                    CmacState::CalcMlast
                } else {
                    CmacState::CalcMi
                };
                None
            }
            CmacState::W4Mlast => {
                self.state = CmacState::Idle;
                self.message = None;
                Some(*result)
            }
            state => {
                warn!("[cmac] cipher result in state {:?}, dropped", state);
                None
            }
        }
    }

    fn message_block(&self, index: usize) -> Block {
        let mut block = [0; 16];
        if let Some(message) = &self.message {
            for (i, b) in block.iter_mut().enumerate() {
                *b = message.byte(index * 16 + i);
            }
        }
        block
    }

    fn last_block(&self) -> Block {
        let len = self.message.as_ref().map(|m| m.len()).unwrap_or(0);
        let start = (self.blocks - 1) * 16;
        if len > 0 && len % 16 == 0 {
            return xor(&self.message_block(self.blocks - 1), &self.k1);
        }
        let mut block = [0; 16];
        if let Some(message) = &self.message {
            for (i, b) in block.iter_mut().enumerate().take(len - start) {
                *b = message.byte(start + i);
            }
        }
        block[len - start] = 0x80;
        xor(&block, &self.k2)
    }
}

#[cfg(test)]
mod tests {
    use aes::cipher::{BlockEncrypt, KeyInit};
    use aes::Aes128;

    use super::*;
    use crate::security_manager::gateway::RequestKind;

    const KEY: Block = [
        0x2b, 0x7e, 0x15, 0x16, 0x28, 0xae, 0xd2, 0xa6, 0xab, 0xf7, 0x15, 0x88, 0x09, 0xcf, 0x4f, 0x3c,
    ];

    const MESSAGE: [u8; 64] = [
        0x6b, 0xc1, 0xbe, 0xe2, 0x2e, 0x40, 0x9f, 0x96, 0xe9, 0x3d, 0x7e, 0x11, 0x73, 0x93, 0x17, 0x2a, 0xae, 0x2d, 0x8a,
        0x57, 0x1e, 0x03, 0xac, 0x9c, 0x9e, 0xb7, 0x6f, 0xac, 0x45, 0xaf, 0x8e, 0x51, 0x30, 0xc8, 0x1c, 0x46, 0xa3, 0x5c,
        0xe4, 0x11, 0xe5, 0xfb, 0xc1, 0x19, 0x1a, 0x0a, 0x52, 0xef, 0xf6, 0x9f, 0x24, 0x45, 0xdf, 0x4f, 0x9b, 0x17, 0xad,
        0x2b, 0x41, 0x7b, 0xe6, 0x6c, 0x37, 0x10,
    ];

    struct Plain<'a>(&'a [u8]);

    impl CmacMessage for Plain<'_> {
        fn len(&self) -> usize {
            self.0.len()
        }

        fn byte(&self, offset: usize) -> u8 {
            self.0[offset]
        }
    }

    #[derive(Default)]
    struct Aes {
        request: Option<(Block, Block)>,
    }

    impl CryptoSource for Aes {
        fn start_encrypt(&mut self, key: &[u8; 16], plaintext: &[u8; 16]) -> Result<(), Error> {
            self.request = Some((*key, *plaintext));
            Ok(())
        }

        fn start_random(&mut self) -> Result<(), Error> {
            Err(Error::InvalidState)
        }
    }

    fn hex(s: &str) -> Block {
        u128::from_str_radix(s, 16).unwrap().to_be_bytes()
    }

    fn run<M: CmacMessage>(engine: &mut CmacEngine<M>, message: M) -> (Block, usize) {
        let mut gateway = CryptoGateway::default();
        let mut source = Aes::default();
        engine.start(&KEY, message).unwrap();
        let mut calls = 0;
        loop {
            assert!(engine.step(&mut gateway, &mut source).unwrap());
            let (key, plaintext) = source.request.take().unwrap();
            let cipher = Aes128::new(&aes::Block::from(key));
            let mut block = aes::Block::from(plaintext);
            cipher.encrypt_block(&mut block);
            calls += 1;
            assert_eq!(gateway.complete(RequestKind::Cipher), Some(CryptoContext::Cmac));
            if let Some(mac) = engine.handle_result(&block.into()) {
                assert!(engine.is_ready());
                return (mac, calls);
            }
            assert!(!engine.is_ready());
        }
    }

    #[test]
    fn subkeys() {
        let l = hex("7df76b0c1ab899b33e42f047b91b546f");
        let k1 = subkey(&l);
        assert_eq!(k1, hex("fbeed618357133667c85e08f7236a8de"));
        assert_eq!(subkey(&k1), hex("f7ddac306ae266ccf90bc11ee46d513b"));
    }

    #[test]
    fn rfc4493_vectors() {
        let mut engine = CmacEngine::new();
        assert_eq!(run(&mut engine, Plain(&[])), (hex("bb1d6929e95937287fa37d129b756746"), 2));
        assert_eq!(
            run(&mut engine, Plain(&MESSAGE[..16])),
            (hex("070a16b46b4d4144f79bdd9dd04a287c"), 2)
        );
        assert_eq!(
            run(&mut engine, Plain(&MESSAGE[..40])),
            (hex("dfa66747de9ae63030ca32611497c827"), 4)
        );
        assert_eq!(
            run(&mut engine, Plain(&MESSAGE[..])),
            (hex("51f0bebf7e3b9d92fc49741779363cfe"), 5)
        );
        // subkeys are derived again for every message
        assert_eq!(
            run(&mut engine, Plain(&MESSAGE[..16])),
            (hex("070a16b46b4d4144f79bdd9dd04a287c"), 2)
        );
    }

    #[test]
    fn busy_while_running() {
        let mut engine = CmacEngine::new();
        engine.start(&KEY, Plain(&MESSAGE[..16])).unwrap();
        assert_eq!(engine.start(&KEY, Plain(&MESSAGE[..16])), Err(Error::Busy));
    }

    #[test]
    fn signed_write_is_reversed() {
        let message = SignedWrite::new(0xd2, 0x0102, &[0xaa, 0xbb], 0x0a0b_0c0d).unwrap();
        assert_eq!(message.len(), 9);
        let input: heapless::Vec<u8, 9> = (0..message.len()).map(|i| message.byte(i)).collect();
        assert_eq!(
            input.as_slice(),
            &[0x0a, 0x0b, 0x0c, 0x0d, 0xbb, 0xaa, 0x01, 0x02, 0xd2]
        );

        let too_long = [0u8; SIGNED_WRITE_MAX_PAYLOAD + 1];
        assert_eq!(SignedWrite::new(0xd2, 1, &too_long, 0), Err(Error::InvalidValue));
    }
}
