//! Device identity records.

use heapless::Vec;

use crate::{Address, EncryptionInformation, Error, IdentityResolvingKey, SignatureKey};

/// Identity part of a device record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct IdentityInfo {
    /// Identity address
    pub address: Address,
    /// Identity resolving key, all zeros if the peer did not distribute one
    pub irk: IdentityResolvingKey,
}

/// Persistent storage of bonded devices.
///
/// Records are addressed by index in `0..capacity()`; an index stays valid
/// until the record is removed.
pub trait DeviceStore {
    /// Number of record slots.
    fn capacity(&self) -> usize;
    /// Identity of the record at `index`, `None` for an empty slot.
    fn identity(&self, index: usize) -> Option<IdentityInfo>;
    /// Add a record, or update the IRK of the record with the same address.
    fn add(&mut self, address: Address, irk: IdentityResolvingKey) -> Result<usize, Error>;
    /// Remove a record.
    fn remove(&mut self, index: usize);
    /// Encryption information of a record.
    fn encryption(&self, index: usize) -> Option<EncryptionInformation>;
    /// Set the encryption information of a record.
    fn set_encryption(&mut self, index: usize, info: EncryptionInformation) -> Result<(), Error>;
    /// Local CSRK used for this peer.
    fn local_signing(&self, index: usize) -> Option<SignatureKey>;
    /// Set the local CSRK used for this peer.
    fn set_local_signing(&mut self, index: usize, key: SignatureKey) -> Result<(), Error>;
    /// Local sign counter.
    fn local_counter(&self, index: usize) -> Option<u32>;
    /// Set the local sign counter.
    fn set_local_counter(&mut self, index: usize, counter: u32) -> Result<(), Error>;
    /// CSRK distributed by the peer.
    fn remote_signing(&self, index: usize) -> Option<SignatureKey>;
    /// Set the CSRK distributed by the peer.
    fn set_remote_signing(&mut self, index: usize, key: SignatureKey) -> Result<(), Error>;
    /// Last sign counter seen from the peer.
    fn remote_counter(&self, index: usize) -> Option<u32>;
    /// Set the last sign counter seen from the peer.
    fn set_remote_counter(&mut self, index: usize, counter: u32) -> Result<(), Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Record {
    identity: IdentityInfo,
    encryption: Option<EncryptionInformation>,
    local_signing: Option<SignatureKey>,
    local_counter: u32,
    remote_signing: Option<SignatureKey>,
    remote_counter: u32,
}

/// Device store kept in RAM, holding up to `N` records.
#[derive(Debug, Default)]
pub struct MemoryStore<const N: usize> {
    slots: Vec<Option<Record>, N>,
}

impl<const N: usize> MemoryStore<N> {
    /// Create an empty store.
    pub const fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// Number of records stored.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Is the store empty?
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn record(&self, index: usize) -> Option<&Record> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    fn record_mut(&mut self, index: usize) -> Result<&mut Record, Error> {
        self.slots
            .get_mut(index)
            .and_then(Option::as_mut)
            .ok_or(Error::NotFound)
    }
}

impl<const N: usize> DeviceStore for MemoryStore<N> {
    fn capacity(&self) -> usize {
        N
    }

    fn identity(&self, index: usize) -> Option<IdentityInfo> {
        self.record(index).map(|r| r.identity)
    }

    fn add(&mut self, address: Address, irk: IdentityResolvingKey) -> Result<usize, Error> {
        let identity = IdentityInfo { address, irk };
        if let Some(index) = self
            .slots
            .iter()
            .position(|slot| matches!(slot, Some(r) if r.identity.address == address))
        {
            self.record_mut(index)?.identity = identity;
            return Ok(index);
        }
        let record = Record {
            identity,
            encryption: None,
            local_signing: None,
            local_counter: 0,
            remote_signing: None,
            remote_counter: 0,
        };
        if let Some(index) = self.slots.iter().position(Option::is_none) {
            self.slots[index] = Some(record);
            return Ok(index);
        }
        self.slots.push(Some(record)).map_err(|_| Error::OutOfMemory)?;
        Ok(self.slots.len() - 1)
    }

    fn remove(&mut self, index: usize) {
        if let Some(slot) = self.slots.get_mut(index) {
            *slot = None;
        }
    }

    fn encryption(&self, index: usize) -> Option<EncryptionInformation> {
        self.record(index).and_then(|r| r.encryption)
    }

    fn set_encryption(&mut self, index: usize, info: EncryptionInformation) -> Result<(), Error> {
        self.record_mut(index)?.encryption = Some(info);
        Ok(())
    }

    fn local_signing(&self, index: usize) -> Option<SignatureKey> {
        self.record(index).and_then(|r| r.local_signing)
    }

    fn set_local_signing(&mut self, index: usize, key: SignatureKey) -> Result<(), Error> {
        self.record_mut(index)?.local_signing = Some(key);
        Ok(())
    }

    fn local_counter(&self, index: usize) -> Option<u32> {
        self.record(index).map(|r| r.local_counter)
    }

    fn set_local_counter(&mut self, index: usize, counter: u32) -> Result<(), Error> {
        self.record_mut(index)?.local_counter = counter;
        Ok(())
    }

    fn remote_signing(&self, index: usize) -> Option<SignatureKey> {
        self.record(index).and_then(|r| r.remote_signing)
    }

    fn set_remote_signing(&mut self, index: usize, key: SignatureKey) -> Result<(), Error> {
        self.record_mut(index)?.remote_signing = Some(key);
        Ok(())
    }

    fn remote_counter(&self, index: usize) -> Option<u32> {
        self.record(index).map(|r| r.remote_counter)
    }

    fn set_remote_counter(&mut self, index: usize, counter: u32) -> Result<(), Error> {
        self.record_mut(index)?.remote_counter = counter;
        Ok(())
    }
}
