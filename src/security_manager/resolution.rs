//! Address resolution against the device store.
//!
//! One lookup runs at a time. It walks the store from index 0: a record with
//! the same address matches directly, otherwise the record's IRK is used to
//! hash the prand of a candidate random address.

use bt_hci::param::ConnHandle;
use heapless::Deque;

use super::crypto::{ah_block, ah_result, Block};
use super::gateway::{CryptoContext, CryptoGateway, CryptoSource};
use super::store::DeviceStore;
use crate::{Address, Error};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum ResolutionMode {
    ForConnection(ConnHandle),
    General,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum ResolutionState {
    Idle,
    Started {
        index: usize,
        address: Address,
        mode: ResolutionMode,
    },
    W4Ah {
        index: usize,
        address: Address,
        mode: ResolutionMode,
    },
}

/// A finished lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Resolved {
    pub(crate) mode: ResolutionMode,
    pub(crate) address: Address,
    pub(crate) index: Option<usize>,
}

pub(crate) struct AddressResolution<const QUEUE: usize> {
    state: ResolutionState,
    queue: Deque<Address, QUEUE>,
}

impl<const QUEUE: usize> AddressResolution<QUEUE> {
    pub(crate) const fn new() -> Self {
        Self {
            state: ResolutionState::Idle,
            queue: Deque::new(),
        }
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.state == ResolutionState::Idle
    }

    pub(crate) fn is_waiting(&self) -> bool {
        matches!(self.state, ResolutionState::W4Ah { .. })
    }

    /// Queue a general lookup.
    pub(crate) fn enqueue(&mut self, address: Address) -> Result<(), Error> {
        if self.queue.iter().any(|a| *a == address) {
            return Err(Error::Busy);
        }
        self.queue.push_back(address).map_err(|_| Error::Busy)
    }

    pub(crate) fn dequeue(&mut self) -> Option<Address> {
        self.queue.pop_front()
    }

    pub(crate) fn start(&mut self, address: Address, mode: ResolutionMode) {
        debug!("[address resolution] start {} {:?}", address, mode);
        self.state = ResolutionState::Started { index: 0, address, mode };
    }

    /// Forget the lookup running for `handle`. A hash still in flight is
    /// dropped when it arrives.
    pub(crate) fn cancel(&mut self, handle: ConnHandle) {
        match self.state {
            ResolutionState::Started { mode, .. } | ResolutionState::W4Ah { mode, .. }
                if mode == ResolutionMode::ForConnection(handle) =>
            {
                self.state = ResolutionState::Idle;
            }
            _ => {}
        }
    }

    /// Check records until a match, a hash to compute or the end of the store.
    pub(crate) fn step<C: CryptoSource, S: DeviceStore>(
        &mut self,
        gateway: &mut CryptoGateway,
        source: &mut C,
        store: &S,
    ) -> Result<Option<Resolved>, Error> {
        let ResolutionState::Started {
            index: first,
            address,
            mode,
        } = self.state
        else {
            return Ok(None);
        };
        let candidate = address.to_be_bytes();
        for index in first..store.capacity() {
            let Some(identity) = store.identity(index) else {
                continue;
            };
            if identity.address == address {
                return Ok(Some(self.finish(address, mode, Some(index))));
            }
            if address.is_public() || identity.irk.is_null() {
                continue;
            }
            let mut prand = [0; 3];
            prand.copy_from_slice(&candidate[..3]);
            gateway.start_cipher(
                source,
                &identity.irk.to_be_bytes(),
                &ah_block(&prand),
                CryptoContext::Resolution,
            )?;
            self.state = ResolutionState::W4Ah { index, address, mode };
            return Ok(None);
        }
        Ok(Some(self.finish(address, mode, None)))
    }

    pub(crate) fn handle_result(&mut self, result: &Block) -> Option<Resolved> {
        let ResolutionState::W4Ah { index, address, mode } = self.state else {
            debug!("[address resolution] hash for a cancelled lookup, dropped");
            return None;
        };
        let candidate = address.to_be_bytes();
        if ah_result(result) == candidate[3..] {
            Some(self.finish(address, mode, Some(index)))
        } else {
            self.state = ResolutionState::Started {
                index: index + 1,
                address,
                mode,
            };
            None
        }
    }

    fn finish(&mut self, address: Address, mode: ResolutionMode, index: Option<usize>) -> Resolved {
        self.state = ResolutionState::Idle;
        debug!("[address resolution] {} resolved to {:?}", address, index);
        Resolved { mode, address, index }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security_manager::gateway::RequestKind;
    use crate::security_manager::MemoryStore;
    use crate::IdentityResolvingKey;

    #[derive(Default)]
    struct Source {
        ciphers: usize,
    }

    impl CryptoSource for Source {
        fn start_encrypt(&mut self, _key: &[u8; 16], _plaintext: &[u8; 16]) -> Result<(), Error> {
            self.ciphers += 1;
            Ok(())
        }

        fn start_random(&mut self) -> Result<(), Error> {
            Err(Error::InvalidState)
        }
    }

    #[test]
    fn queue_limits() {
        let mut resolution = AddressResolution::<2>::new();
        let a = Address::random([1; 6]);
        resolution.enqueue(a).unwrap();
        assert_eq!(resolution.enqueue(a), Err(Error::Busy));
        resolution.enqueue(Address::random([2; 6])).unwrap();
        assert_eq!(resolution.enqueue(Address::random([3; 6])), Err(Error::Busy));
        assert_eq!(resolution.dequeue(), Some(a));
    }

    #[test]
    fn direct_match_skips_hashing() {
        let mut store = MemoryStore::<4>::new();
        let peer = Address::public([1, 2, 3, 4, 5, 6]);
        store.add(Address::random([9; 6]), IdentityResolvingKey::new(5)).unwrap();
        store.add(peer, IdentityResolvingKey::new(0)).unwrap();

        let mut gateway = CryptoGateway::default();
        let mut source = Source::default();
        let mut resolution = AddressResolution::<1>::new();
        resolution.start(peer, ResolutionMode::General);
        let resolved = resolution.step(&mut gateway, &mut source, &store).unwrap().unwrap();
        assert_eq!(resolved.index, Some(1));
        assert_eq!(source.ciphers, 0);
        assert!(resolution.is_idle());
    }

    #[test]
    fn hash_mismatch_moves_on() {
        let mut store = MemoryStore::<4>::new();
        store.add(Address::public([7; 6]), IdentityResolvingKey::new(5)).unwrap();
        store.add(Address::public([8; 6]), IdentityResolvingKey::new(6)).unwrap();
        // prand 0x4a0b0c, hash 0x010203
        let candidate = Address::random([0x03, 0x02, 0x01, 0x0c, 0x0b, 0x4a]);
        let handle = ConnHandle::new(1);

        let mut gateway = CryptoGateway::default();
        let mut source = Source::default();
        let mut resolution = AddressResolution::<1>::new();
        resolution.start(candidate, ResolutionMode::ForConnection(handle));

        assert_eq!(resolution.step(&mut gateway, &mut source, &store).unwrap(), None);
        assert!(resolution.is_waiting());
        gateway.complete(RequestKind::Cipher);
        assert_eq!(resolution.handle_result(&[0; 16]), None);

        assert_eq!(resolution.step(&mut gateway, &mut source, &store).unwrap(), None);
        gateway.complete(RequestKind::Cipher);
        let mut hash = [0; 16];
        hash[13..].copy_from_slice(&[0x01, 0x02, 0x03]);
        let resolved = resolution.handle_result(&hash).unwrap();
        assert_eq!(resolved.index, Some(1));
        assert_eq!(resolved.mode, ResolutionMode::ForConnection(handle));
        assert_eq!(source.ciphers, 2);
    }

    #[test]
    fn public_candidate_never_hashed() {
        let mut store = MemoryStore::<2>::new();
        store.add(Address::public([7; 6]), IdentityResolvingKey::new(5)).unwrap();
        let mut gateway = CryptoGateway::default();
        let mut source = Source::default();
        let mut resolution = AddressResolution::<1>::new();
        resolution.start(Address::public([1; 6]), ResolutionMode::General);
        let resolved = resolution.step(&mut gateway, &mut source, &store).unwrap().unwrap();
        assert_eq!(resolved.index, None);
        assert_eq!(source.ciphers, 0);
    }

    #[test]
    fn cancelled_lookup_drops_hash() {
        let mut store = MemoryStore::<1>::new();
        store.add(Address::public([7; 6]), IdentityResolvingKey::new(5)).unwrap();
        let handle = ConnHandle::new(4);
        let mut gateway = CryptoGateway::default();
        let mut source = Source::default();
        let mut resolution = AddressResolution::<1>::new();
        resolution.start(Address::random([1; 6]), ResolutionMode::ForConnection(handle));
        resolution.step(&mut gateway, &mut source, &store).unwrap();
        resolution.cancel(handle);
        assert!(resolution.is_idle());
        assert_eq!(resolution.handle_result(&[0; 16]), None);
    }
}
