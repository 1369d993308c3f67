//! Block builders for the legacy pairing functions.
//!
//! Every function here prepares the plaintext of exactly one AES-128 call or
//! interprets its result; the cipher itself runs in the controller and is
//! reached through the [`CryptoGateway`](super::gateway::CryptoGateway).
//! Blocks are most significant octet first, as AES sees them
//! ([Vol 3] Part H, Section 2.2).

use crate::Address;

/// A 128-bit block, most significant octet first.
pub(crate) type Block = [u8; 16];

pub(crate) fn xor(a: &Block, b: &Block) -> Block {
    let mut out = [0; 16];
    for (o, (x, y)) in out.iter_mut().zip(a.iter().zip(b.iter())) {
        *o = x ^ y;
    }
    out
}

/// First c1 operand: `pres || preq || rat' || iat'`.
///
/// `preq` and `pres` are the 7-octet PDUs as sent over the air.
pub(crate) fn c1_p1(preq: &[u8; 7], pres: &[u8; 7], initiator: &Address, responder: &Address) -> Block {
    let mut p1 = [0; 16];
    for i in 0..7 {
        p1[i] = pres[6 - i];
        p1[7 + i] = preq[6 - i];
    }
    p1[14] = responder.type_octet();
    p1[15] = initiator.type_octet();
    p1
}

/// Second c1 operand: `padding || ia || ra`.
pub(crate) fn c1_p2(initiator: &Address, responder: &Address) -> Block {
    let mut p2 = [0; 16];
    p2[4..10].copy_from_slice(&initiator.to_be_bytes());
    p2[10..16].copy_from_slice(&responder.to_be_bytes());
    p2
}

/// s1 plaintext: the low halves of both randoms.
pub(crate) fn s1_block(r1: &Block, r2: &Block) -> Block {
    let mut r = [0; 16];
    r[..8].copy_from_slice(&r1[8..]);
    r[8..].copy_from_slice(&r2[8..]);
    r
}

/// d1 plaintext: `padding || r || d`.
pub(crate) fn d1_block(d: u16, r: u16) -> Block {
    let mut block = [0; 16];
    block[12..14].copy_from_slice(&r.to_be_bytes());
    block[14..16].copy_from_slice(&d.to_be_bytes());
    block
}

/// dm plaintext: `padding || r` with the 64-bit random.
pub(crate) fn dm_block(rand: u64) -> Block {
    let mut block = [0; 16];
    block[8..].copy_from_slice(&rand.to_be_bytes());
    block
}

/// The 16 least significant bits of the dm cipher output.
pub(crate) fn dm_result(block: &Block) -> u16 {
    u16::from_be_bytes([block[14], block[15]])
}

/// ah plaintext: `padding || prand`.
pub(crate) fn ah_block(prand: &[u8; 3]) -> Block {
    let mut block = [0; 16];
    block[13..].copy_from_slice(prand);
    block
}

/// The 24 least significant bits of the ah cipher output.
pub(crate) fn ah_result(block: &Block) -> [u8; 3] {
    [block[13], block[14], block[15]]
}

/// Reduce a random value to a six digit passkey.
pub(crate) fn passkey_from_random(random: &[u8]) -> u32 {
    let mut raw = [0; 4];
    raw.copy_from_slice(&random[..4]);
    let mut value = u32::from_le_bytes(raw) & 0x000f_ffff;
    if value >= 999_999 {
        value -= 999_999;
    }
    value
}

/// Temporary key holding a passkey.
pub(crate) fn tk_from_passkey(passkey: u32) -> Block {
    let mut tk = [0; 16];
    tk[12..].copy_from_slice(&passkey.to_be_bytes());
    tk
}

/// Keep the `key_size` least significant octets.
pub(crate) fn truncate(block: &Block, key_size: u8) -> Block {
    let mut out = *block;
    let drop = 16usize.saturating_sub(usize::from(key_size));
    out[..drop].fill(0);
    out
}

/// Reverse a block between wire order and cipher order.
pub(crate) fn reversed(block: &Block) -> Block {
    let mut out = *block;
    out.reverse();
    out
}

#[cfg(test)]
mod tests {
    use aes::cipher::{BlockEncrypt, KeyInit};
    use aes::Aes128;

    use super::*;

    fn e(key: &Block, plaintext: &Block) -> Block {
        let cipher = Aes128::new(&aes::Block::from(*key));
        let mut block = aes::Block::from(*plaintext);
        cipher.encrypt_block(&mut block);
        block.into()
    }

    fn hex(s: &str) -> Block {
        u128::from_str_radix(s, 16).unwrap().to_be_bytes()
    }

    #[test]
    fn c1_sample() {
        // [Vol 3] Part H, Section 2.2.3
        let k = [0; 16];
        let r = hex("5783D52156AD6F0E6388274EC6702EE0");
        let preq = [0x01, 0x01, 0x00, 0x00, 0x10, 0x07, 0x07];
        let pres = [0x02, 0x03, 0x00, 0x00, 0x08, 0x00, 0x05];
        let initiator = Address::random([0xa6, 0xa5, 0xa4, 0xa3, 0xa2, 0xa1]);
        let responder = Address::public([0xb6, 0xb5, 0xb4, 0xb3, 0xb2, 0xb1]);

        let p1 = c1_p1(&preq, &pres, &initiator, &responder);
        assert_eq!(p1, hex("05000800000302070710000001010001"));
        let p2 = c1_p2(&initiator, &responder);
        assert_eq!(p2, hex("00000000A1A2A3A4A5A6B1B2B3B4B5B6"));

        let t2 = e(&k, &xor(&r, &p1));
        let confirm = e(&k, &xor(&t2, &p2));
        assert_eq!(confirm, hex("1e1e3fef878988ead2a74dc5bef13b86"));
    }

    #[test]
    fn s1_sample() {
        // [Vol 3] Part H, Section 2.2.4
        let k = [0; 16];
        let r1 = hex("000F0E0D0C0B0A091122334455667788");
        let r2 = hex("010203040506070899AABBCCDDEEFF00");
        let block = s1_block(&r1, &r2);
        assert_eq!(block, hex("112233445566778899AABBCCDDEEFF00"));
        assert_eq!(e(&k, &block), hex("9a1fe1f0e8b0f49b5b4216ae796da062"));
    }

    #[test]
    fn ah_sample() {
        let irk = hex("ec0234a357c8ad05341010a60a397d9b");
        let block = ah_block(&[0x70, 0x81, 0x94]);
        assert_eq!(ah_result(&e(&irk, &block)), [0x0d, 0xfb, 0xaa]);
    }

    #[test]
    fn d1_and_dm_layout() {
        assert_eq!(d1_block(0x1234, 0xabcd), hex("000000000000000000000000abcd1234"));
        assert_eq!(d1_block(1, 0), hex("00000000000000000000000000000001"));
        assert_eq!(dm_block(0x0102_0304_0506_0708), hex("00000000000000000102030405060708"));

        let key = hex("000102030405060708090a0b0c0d0e0f");
        let out = e(&key, &dm_block(0x0102_0304_0506_0708));
        assert_eq!(dm_result(&out), u16::from_be_bytes([out[14], out[15]]));
    }

    #[test]
    fn ediv_round_trip() {
        let dhk = hex("a0a1a2a3a4a5a6a7a8a9aaabacadaeaf");
        let rand = 0x1122_3344_5566_7788;
        let div = 0x4321;
        let y = dm_result(&e(&dhk, &dm_block(rand)));
        let ediv = y ^ div;
        // The responder recovers DIV from EDIV and Rand alone.
        assert_eq!(dm_result(&e(&dhk, &dm_block(rand))) ^ ediv, div);
    }

    #[test]
    fn passkey_reduction() {
        assert_eq!(passkey_from_random(&[0x3f, 0x42, 0x0f, 0x00]), 0);
        assert_eq!(passkey_from_random(&[0x3e, 0x42, 0x0f, 0x00]), 999_998);
        assert_eq!(passkey_from_random(&[0xff, 0xff, 0xff, 0xff]), 0x000f_ffff - 999_999);
        assert_eq!(passkey_from_random(&[0x01, 0x00, 0x00, 0x00]), 1);

        let tk = tk_from_passkey(123_456);
        assert_eq!(u128::from_be_bytes(tk), 123_456);
    }

    #[test]
    fn truncation() {
        let block = [0xff; 16];
        let short = truncate(&block, 7);
        assert_eq!(short[..9], [0; 9]);
        assert_eq!(short[9..], [0xff; 7]);
        assert_eq!(truncate(&block, 16), block);
    }
}
