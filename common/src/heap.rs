//! Fixed-size arena holding the tagged records built while a command is processed.
//!
//! Records are bump-allocated from the start of the buffer and are only ever released en masse
//! (via [`Heap::reset`] or [`Heap::clean`]). A second, short-lived region grows down from the end
//! of the buffer for scratch space that must be returned in LIFO order.

use crate::record::RecordType;
use crate::{km_err, vec_try, Error};
use alloc::vec::Vec;
use log::error;
use zeroize::Zeroize;

/// Default arena capacity in bytes.
pub const HEAP_SIZE: usize = 10000;

/// Size of the tag + length header in front of every record.
pub const TLV_HEADER_SIZE: usize = 3;

/// Offset value stored in an array or map slot that has not been filled in yet.
pub(crate) const UNSET: u16 = 0xffff;

/// Location of a record in the arena, bound to the arena generation that produced it.
///
/// Every reset or clean of the arena bumps its epoch, so an `Addr` retained across one of those
/// events no longer resolves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Addr {
    offset: u16,
    epoch: u16,
}

impl Addr {
    /// Offset of the record header within the arena.
    pub fn offset(&self) -> u16 {
        self.offset
    }

    /// Arena generation this address belongs to.
    pub fn epoch(&self) -> u16 {
        self.epoch
    }
}

/// Handle to a block of scratch space taken from the reclaim region.
#[derive(Debug, PartialEq, Eq)]
pub struct Scratch {
    offset: u16,
    len: u16,
    epoch: u16,
}

impl Scratch {
    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// The record arena.
pub struct Heap {
    buf: Vec<u8>,
    /// Forward (bump) cursor.
    top: usize,
    /// Reclaim cursor; equal to the capacity when no scratch space is outstanding.
    reclaim: usize,
    epoch: u16,
}

impl core::fmt::Debug for Heap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Heap")
            .field("capacity", &self.buf.len())
            .field("top", &self.top)
            .field("reclaim", &self.reclaim)
            .field("epoch", &self.epoch)
            .finish()
    }
}

impl Heap {
    /// Create an arena of the given capacity, which must fit in a 16-bit offset.
    pub fn new(capacity: usize) -> Result<Self, Error> {
        if capacity == 0 || capacity > u16::MAX as usize {
            return Err(km_err!(InvalidArgument, "arena capacity {} out of range", capacity));
        }
        Ok(Self { buf: vec_try![0u8; capacity]?, top: 0, reclaim: capacity, epoch: 0 })
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Number of bytes handed out by the forward cursor.
    pub fn used(&self) -> usize {
        self.top
    }

    /// Number of bytes left between the two cursors.
    pub fn available(&self) -> usize {
        self.reclaim.saturating_sub(self.top)
    }

    pub fn epoch(&self) -> u16 {
        self.epoch
    }

    /// Bump-allocate `len` raw bytes, returning their offset.
    pub fn alloc(&mut self, len: usize) -> Result<usize, Error> {
        let end = self.top.checked_add(len).ok_or(Error::Alloc("arena offset overflow"))?;
        if end > self.reclaim {
            return Err(Error::Alloc("arena exhausted"));
        }
        let offset = self.top;
        self.top = end;
        Ok(offset)
    }

    /// Allocate a record of the given kind with a zero-filled payload of `len` bytes.
    pub fn instance(&mut self, kind: RecordType, len: usize) -> Result<Addr, Error> {
        let len16 = u16::try_from(len).map_err(|_e| Error::Alloc("record too large"))?;
        let offset = self.alloc(TLV_HEADER_SIZE + len)?;
        self.buf[offset] = kind as u8;
        self.buf[offset + 1..offset + 3].copy_from_slice(&len16.to_be_bytes());
        // A clean arena is all zeroes, but `reset` leaves stale bytes behind.
        self.buf[offset + TLV_HEADER_SIZE..self.top].fill(0);
        Ok(Addr { offset: offset as u16, epoch: self.epoch })
    }

    /// Rebuild an address from an offset stored inside another record of the current generation.
    pub(crate) fn addr_at(&self, offset: u16) -> Result<Addr, Error> {
        if offset == UNSET {
            error!("arena: dereference of unset slot");
            return Err(km_err!(UnknownError, "unset record slot"));
        }
        Ok(Addr { offset, epoch: self.epoch })
    }

    /// Check that `addr` refers to a live record and return its kind and payload range.
    fn locate(&self, addr: Addr) -> Result<(RecordType, usize, usize), Error> {
        if addr.epoch != self.epoch {
            error!("arena: stale address {:?}, current epoch {}", addr, self.epoch);
            return Err(km_err!(
                UnknownError,
                "address from epoch {} used in {}",
                addr.epoch,
                self.epoch
            ));
        }
        let start = addr.offset as usize;
        if start + TLV_HEADER_SIZE > self.top {
            error!("arena: address {} beyond cursor {}", start, self.top);
            return Err(km_err!(UnknownError, "address {} out of bounds", start));
        }
        let kind = match RecordType::n(self.buf[start]) {
            Some(k) => k,
            None => {
                error!("arena: unknown record tag {} at {}", self.buf[start], start);
                return Err(km_err!(UnknownError, "bad record tag {}", self.buf[start]));
            }
        };
        let len = u16::from_be_bytes([self.buf[start + 1], self.buf[start + 2]]) as usize;
        let payload = start + TLV_HEADER_SIZE;
        if payload + len > self.top {
            error!("arena: record at {} overruns cursor", start);
            return Err(km_err!(UnknownError, "record at {} overruns arena", start));
        }
        Ok((kind, payload, len))
    }

    /// Return the kind of the record at `addr`.
    pub fn kind(&self, addr: Addr) -> Result<RecordType, Error> {
        self.locate(addr).map(|(kind, _, _)| kind)
    }

    /// Return the payload length of the record at `addr`.
    pub fn payload_len(&self, addr: Addr) -> Result<usize, Error> {
        self.locate(addr).map(|(_, _, len)| len)
    }

    fn locate_as(&self, addr: Addr, want: RecordType) -> Result<(usize, usize), Error> {
        let (kind, payload, len) = self.locate(addr)?;
        if kind != want {
            error!("arena: record at {} is {:?}, expected {:?}", addr.offset, kind, want);
            return Err(km_err!(UnknownError, "record is {:?} not {:?}", kind, want));
        }
        Ok((payload, len))
    }

    /// Return the payload of the record at `addr`, which must be of kind `want`.
    pub(crate) fn payload(&self, addr: Addr, want: RecordType) -> Result<&[u8], Error> {
        let (start, len) = self.locate_as(addr, want)?;
        Ok(&self.buf[start..start + len])
    }

    /// Mutable version of [`Heap::payload`].
    pub(crate) fn payload_mut(&mut self, addr: Addr, want: RecordType) -> Result<&mut [u8], Error> {
        let (start, len) = self.locate_as(addr, want)?;
        Ok(&mut self.buf[start..start + len])
    }

    /// Take `len` bytes of scratch space from the reclaim region at the end of the arena.
    pub fn alloc_reclaimable(&mut self, len: usize) -> Result<Scratch, Error> {
        if len >= self.capacity() / 2 {
            return Err(Error::Alloc("scratch request too large"));
        }
        match self.reclaim.checked_sub(len) {
            Some(start) if start >= self.top => {
                self.reclaim = start;
                Ok(Scratch { offset: start as u16, len: len as u16, epoch: self.epoch })
            }
            _ => Err(Error::Alloc("scratch region exhausted")),
        }
    }

    /// Access scratch space previously handed out by [`Heap::alloc_reclaimable`].
    pub fn scratch_mut(&mut self, scratch: &Scratch) -> Result<&mut [u8], Error> {
        let start = scratch.offset as usize;
        if scratch.epoch != self.epoch || start < self.reclaim {
            error!("arena: access to released scratch block at {}", start);
            return Err(km_err!(UnknownError, "scratch block at {} not live", start));
        }
        Ok(&mut self.buf[start..start + scratch.len()])
    }

    /// Return scratch space; only the most recent outstanding block may be returned.
    pub fn reclaim(&mut self, scratch: Scratch) -> Result<(), Error> {
        let start = scratch.offset as usize;
        if scratch.epoch != self.epoch || start != self.reclaim {
            error!("arena: out-of-order reclaim of {} (cursor {})", start, self.reclaim);
            return Err(km_err!(UnknownError, "scratch block at {} reclaimed out of order", start));
        }
        self.buf[start..start + scratch.len()].zeroize();
        self.reclaim = start + scratch.len();
        Ok(())
    }

    /// Drop every record without clearing memory.
    pub fn reset(&mut self) {
        self.top = 0;
        self.epoch = self.epoch.wrapping_add(1);
    }

    /// Zeroize every record and all outstanding scratch space, returning the arena to its initial
    /// state in a new generation.
    pub fn clean(&mut self) {
        let top = self.top;
        let reclaim = self.reclaim.min(self.capacity());
        self.buf[..top].zeroize();
        self.buf[reclaim..].zeroize();
        self.top = 0;
        self.reclaim = self.capacity();
        self.epoch = self.epoch.wrapping_add(1);
    }

    /// Emulate loss of transient memory: contents and both cursors drop to zero.
    pub fn power_loss(&mut self) {
        self.buf.as_mut_slice().zeroize();
        self.top = 0;
        self.reclaim = 0;
        self.epoch = self.epoch.wrapping_add(1);
    }

    /// Indicate whether transient memory was lost since the last call to [`Heap::on_process`].
    pub fn reset_event_occurred(&self) -> bool {
        self.reclaim != self.capacity()
    }

    /// Prepare the arena for a new command.
    pub fn on_process(&mut self) {
        self.reclaim = self.capacity();
    }
}

#[cfg(test)]
mod tests;
