//! Local random address generation ([Vol 6] Part B, Section 1.3.2).

use bt_hci::param::BdAddr;
use embassy_time::{Duration, Instant};

use super::crypto::{ah_block, ah_result, Block};
use super::gateway::{CryptoContext, CryptoGateway, CryptoSource};
use crate::{AddressMode, Error, IdentityResolvingKey, SecurityConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum AddressUpdateState {
    Idle,
    W2GetRandom,
    W4Random,
    W2CalcHash,
    W4Hash,
    W2SetAddress,
}

pub(crate) struct AddressUpdate {
    state: AddressUpdateState,
    mode: AddressMode,
    period: Duration,
    started: bool,
    next_update: Option<Instant>,
    /// Most significant octet first.
    address: [u8; 6],
}

impl AddressUpdate {
    pub(crate) fn new(config: &SecurityConfig) -> Self {
        Self {
            state: AddressUpdateState::Idle,
            mode: config.address_mode,
            period: config.address_update_period,
            started: false,
            next_update: None,
            address: [0; 6],
        }
    }

    fn rotates(&self) -> bool {
        matches!(self.mode, AddressMode::NonResolvable | AddressMode::Resolvable)
    }

    /// Generate the first address.
    pub(crate) fn start(&mut self) {
        if self.mode != AddressMode::Off && !self.started {
            self.started = true;
            self.state = AddressUpdateState::W2GetRandom;
        }
    }

    pub(crate) fn process_timer(&mut self, now: Instant) {
        if !self.started || !self.rotates() {
            return;
        }
        match self.next_update {
            None => self.next_update = Some(now + self.period),
            Some(at) if now >= at && self.state == AddressUpdateState::Idle => {
                debug!("[address update] rotating private address");
                self.next_update = Some(now + self.period);
                self.state = AddressUpdateState::W2GetRandom;
            }
            _ => {}
        }
    }

    /// Does the next step need the crypto gateway?
    pub(crate) fn needs_crypto(&self) -> bool {
        matches!(
            self.state,
            AddressUpdateState::W2GetRandom | AddressUpdateState::W2CalcHash
        )
    }

    /// Take the address to apply, if one is ready.
    pub(crate) fn take_address(&mut self) -> Option<BdAddr> {
        if self.state != AddressUpdateState::W2SetAddress {
            return None;
        }
        self.state = AddressUpdateState::Idle;
        let mut raw = self.address;
        raw.reverse();
        Some(BdAddr::new(raw))
    }

    pub(crate) fn step<C: CryptoSource>(
        &mut self,
        gateway: &mut CryptoGateway,
        source: &mut C,
        irk: &IdentityResolvingKey,
    ) -> Result<bool, Error> {
        match self.state {
            AddressUpdateState::W2GetRandom => {
                gateway.start_random(source, CryptoContext::AddressUpdate)?;
                self.state = AddressUpdateState::W4Random;
                Ok(true)
            }
            AddressUpdateState::W2CalcHash => {
                let mut prand = [0; 3];
                prand.copy_from_slice(&self.address[..3]);
                gateway.start_cipher(
                    source,
                    &irk.to_be_bytes(),
                    &ah_block(&prand),
                    CryptoContext::AddressUpdate,
                )?;
                self.state = AddressUpdateState::W4Hash;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub(crate) fn handle_random(&mut self, random: &[u8]) {
        if self.state != AddressUpdateState::W4Random {
            warn!("[address update] random in state {:?}, dropped", self.state);
            return;
        }
        self.address.copy_from_slice(&random[..6]);
        match self.mode {
            AddressMode::Resolvable => {
                self.address[0] = (self.address[0] & 0x3f) | 0x40;
                self.state = AddressUpdateState::W2CalcHash;
            }
            AddressMode::NonResolvable => {
                self.address[0] &= 0x3f;
                self.state = AddressUpdateState::W2SetAddress;
            }
            AddressMode::Static => {
                self.address[0] |= 0xc0;
                self.state = AddressUpdateState::W2SetAddress;
            }
            AddressMode::Off => self.state = AddressUpdateState::Idle,
        }
    }

    pub(crate) fn handle_cipher(&mut self, result: &Block) {
        if self.state != AddressUpdateState::W4Hash {
            warn!("[address update] hash in state {:?}, dropped", self.state);
            return;
        }
        self.address[3..].copy_from_slice(&ah_result(result));
        self.state = AddressUpdateState::W2SetAddress;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Source;

    impl CryptoSource for Source {
        fn start_encrypt(&mut self, _key: &[u8; 16], _plaintext: &[u8; 16]) -> Result<(), Error> {
            Ok(())
        }

        fn start_random(&mut self) -> Result<(), Error> {
            Ok(())
        }
    }

    fn update(mode: AddressMode) -> AddressUpdate {
        AddressUpdate::new(&SecurityConfig {
            address_mode: mode,
            ..Default::default()
        })
    }

    #[test]
    fn non_resolvable_clears_top_bits() {
        let mut gateway = CryptoGateway::default();
        let mut update = update(AddressMode::NonResolvable);
        update.start();
        assert!(update.step(&mut gateway, &mut Source, &IdentityResolvingKey::new(0)).unwrap());
        update.handle_random(&[0xff; 16]);
        let addr = update.take_address().unwrap();
        assert_eq!(addr.raw(), &[0xff, 0xff, 0xff, 0xff, 0xff, 0x3f]);
        assert!(update.take_address().is_none());
    }

    #[test]
    fn resolvable_hashes_prand() {
        let mut gateway = CryptoGateway::default();
        let mut update = update(AddressMode::Resolvable);
        update.start();
        update.step(&mut gateway, &mut Source, &IdentityResolvingKey::new(0)).unwrap();
        gateway.complete(crate::security_manager::gateway::RequestKind::Random);
        update.handle_random(&[0x81, 0x02, 0x03, 0x04, 0x05, 0x06]);
        assert!(update.needs_crypto());
        update.step(&mut gateway, &mut Source, &IdentityResolvingKey::new(0)).unwrap();
        let mut hash = [0; 16];
        hash[13..].copy_from_slice(&[0xaa, 0xbb, 0xcc]);
        update.handle_cipher(&hash);
        let addr = update.take_address().unwrap();
        assert_eq!(addr.raw(), &[0xcc, 0xbb, 0xaa, 0x03, 0x02, 0x41]);
    }

    #[test]
    fn static_generated_once() {
        let mut update = update(AddressMode::Static);
        update.start();
        update.state = AddressUpdateState::W4Random;
        update.handle_random(&[0x01; 16]);
        assert_eq!(update.take_address().unwrap().raw()[5], 0xc1);

        update.process_timer(Instant::from_secs(0));
        update.process_timer(Instant::from_secs(100_000));
        assert_eq!(update.state, AddressUpdateState::Idle);
    }

    #[test]
    fn rotation_period() {
        let mut update = update(AddressMode::NonResolvable);
        update.start();
        update.state = AddressUpdateState::Idle;
        update.process_timer(Instant::from_secs(10));
        update.process_timer(Instant::from_secs(10 + 15 * 60 - 1));
        assert_eq!(update.state, AddressUpdateState::Idle);
        update.process_timer(Instant::from_secs(10 + 15 * 60));
        assert_eq!(update.state, AddressUpdateState::W2GetRandom);
    }
}
