//! Cursors over a byte slice.

use crate::codec::{Decode, Error};

/// Not a byte writer. It is just a cursor to track where a byte slice is being written.
pub(crate) struct WriteCursor<'d> {
    pos: usize,
    data: &'d mut [u8],
}

impl<'d> WriteCursor<'d> {
    pub(crate) fn new(data: &'d mut [u8]) -> Self {
        Self { pos: 0, data }
    }

    pub(crate) fn write_u8(&mut self, value: u8) -> Result<(), Error> {
        self.append(&[value])
    }

    pub(crate) fn write_u16_le(&mut self, value: u16) -> Result<(), Error> {
        self.append(&value.to_le_bytes())
    }

    pub(crate) fn append(&mut self, bytes: &[u8]) -> Result<(), Error> {
        if self.available() < bytes.len() {
            return Err(Error::InsufficientSpace);
        }
        self.data[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
        Ok(())
    }

    pub(crate) fn available(&self) -> usize {
        self.data.len() - self.pos
    }

    pub(crate) fn len(&self) -> usize {
        self.pos
    }
}

/// A cursor reading values out of a received payload.
pub(crate) struct ReadCursor<'d> {
    pos: usize,
    data: &'d [u8],
}

impl<'d> ReadCursor<'d> {
    pub(crate) fn new(data: &'d [u8]) -> Self {
        Self { pos: 0, data }
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8, Error> {
        let [b] = self.read_array::<1>()?;
        Ok(b)
    }

    pub(crate) fn read_u16_le(&mut self) -> Result<u16, Error> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    pub(crate) fn read_u64_le(&mut self) -> Result<u64, Error> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    pub(crate) fn read_array<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        if self.data.len() - self.pos < N {
            return Err(Error::InsufficientSpace);
        }
        let mut out = [0; N];
        out.copy_from_slice(&self.data[self.pos..self.pos + N]);
        self.pos += N;
        Ok(out)
    }

    pub(crate) fn read<T: Decode<'d>>(&mut self) -> Result<T, Error> {
        let value = T::decode(&self.data[self.pos..])?;
        self.pos += value.size();
        Ok(value)
    }
}
