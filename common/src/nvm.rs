//! Durable storage collaborator and the transaction guard used for every multi-write update.

use crate::{km_err, vec_try, Error};
use alloc::vec::Vec;
use log::{error, warn};

/// Byte-addressed durable memory with all-or-nothing transactions.
///
/// An implementation must guarantee that after a power failure the contents reflect either all
/// or none of the writes made since the last [`PersistentStore::begin`].
pub trait PersistentStore {
    /// Total size of the store in bytes.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fill `buf` with the bytes starting at `offset`.
    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), Error>;

    /// Overwrite the bytes starting at `offset`. Only valid inside a transaction.
    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), Error>;

    /// Start a transaction. Transactions do not nest.
    fn begin(&mut self) -> Result<(), Error>;

    /// Make every write since [`PersistentStore::begin`] durable.
    fn commit(&mut self) -> Result<(), Error>;

    /// Undo every write since [`PersistentStore::begin`].
    fn abort(&mut self);

    fn in_transaction(&self) -> bool;
}

/// Check that `[offset, offset + len)` lies within a store of `size` bytes.
fn check_range(size: usize, offset: usize, len: usize) -> Result<usize, Error> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(end),
        _ => {
            error!("store: access [{}, +{}) outside store of {} bytes", offset, len, size);
            Err(km_err!(UnknownError, "store access at {} len {} out of range", offset, len))
        }
    }
}

/// In-memory [`PersistentStore`] that keeps an undo journal of the previous contents of every
/// byte range written inside a transaction.
///
/// For testing it can also simulate a power failure part way through a write: see
/// [`MemoryStore::fail_after`] and [`MemoryStore::power_cycle`].
#[derive(Debug)]
pub struct MemoryStore {
    data: Vec<u8>,
    journal: Option<Vec<(usize, Vec<u8>)>>,
    fail_after: Option<usize>,
    powered: bool,
}

impl MemoryStore {
    /// Create a zero-filled store of `size` bytes.
    pub fn new(size: usize) -> Result<Self, Error> {
        Ok(Self { data: vec_try![0u8; size]?, journal: None, fail_after: None, powered: true })
    }

    /// Arrange for power to fail once `bytes` more bytes have been written. The write that
    /// crosses the limit is torn: only its leading part reaches the store.
    pub fn fail_after(&mut self, bytes: usize) {
        self.fail_after = Some(bytes);
    }

    /// Restore power, rolling back any transaction that was still open when it was lost.
    pub fn power_cycle(&mut self) {
        if let Some(journal) = self.journal.take() {
            warn!("store: rolling back {} uncommitted writes at power-up", journal.len());
            Self::roll_back(&mut self.data, journal);
        }
        self.fail_after = None;
        self.powered = true;
    }

    pub fn is_powered(&self) -> bool {
        self.powered
    }

    /// Raw contents of the store.
    pub fn contents(&self) -> &[u8] {
        &self.data
    }

    fn roll_back(data: &mut [u8], journal: Vec<(usize, Vec<u8>)>) {
        for (offset, old) in journal.into_iter().rev() {
            data[offset..offset + old.len()].copy_from_slice(&old);
        }
    }

    fn check_powered(&self) -> Result<(), Error> {
        if self.powered {
            Ok(())
        } else {
            Err(km_err!(SecureHwCommunicationFailed, "store has no power"))
        }
    }
}

impl PersistentStore for MemoryStore {
    fn len(&self) -> usize {
        self.data.len()
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), Error> {
        self.check_powered()?;
        let end = check_range(self.data.len(), offset, buf.len())?;
        buf.copy_from_slice(&self.data[offset..end]);
        Ok(())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), Error> {
        self.check_powered()?;
        let end = check_range(self.data.len(), offset, data.len())?;
        let journal = match self.journal.as_mut() {
            Some(j) => j,
            None => {
                error!("store: write at {} outside a transaction", offset);
                return Err(km_err!(UnknownError, "write at {} outside transaction", offset));
            }
        };
        journal.try_reserve(1).map_err(|_e| Error::Alloc("store journal"))?;
        journal.push((offset, vec_try!(from &self.data[offset..end])?));

        if let Some(budget) = self.fail_after {
            if data.len() > budget {
                self.data[offset..offset + budget].copy_from_slice(&data[..budget]);
                self.fail_after = None;
                self.powered = false;
                warn!("store: power lost after {} of {} bytes at {}", budget, data.len(), offset);
                return Err(km_err!(SecureHwCommunicationFailed, "power lost during write"));
            }
            self.fail_after = Some(budget - data.len());
        }
        self.data[offset..end].copy_from_slice(data);
        Ok(())
    }

    fn begin(&mut self) -> Result<(), Error> {
        self.check_powered()?;
        if self.journal.is_some() {
            error!("store: nested transaction");
            return Err(km_err!(UnknownError, "transaction already open"));
        }
        self.journal = Some(Vec::new());
        Ok(())
    }

    fn commit(&mut self) -> Result<(), Error> {
        self.check_powered()?;
        match self.journal.take() {
            Some(_) => Ok(()),
            None => {
                error!("store: commit without transaction");
                Err(km_err!(UnknownError, "no transaction to commit"))
            }
        }
    }

    fn abort(&mut self) {
        // Without power the journal stays put until `power_cycle` replays it.
        if !self.powered {
            return;
        }
        if let Some(journal) = self.journal.take() {
            Self::roll_back(&mut self.data, journal);
        }
    }

    fn in_transaction(&self) -> bool {
        self.journal.is_some()
    }
}

/// Scoped transaction over a [`PersistentStore`]. Dropping the guard without calling
/// [`Transaction::commit`] undoes every write made through it.
pub struct Transaction<'a, S: PersistentStore + ?Sized> {
    store: &'a mut S,
    committed: bool,
}

impl<'a, S: PersistentStore + ?Sized> Transaction<'a, S> {
    pub fn begin(store: &'a mut S) -> Result<Self, Error> {
        store.begin()?;
        Ok(Self { store, committed: false })
    }

    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), Error> {
        self.store.write(offset, data)
    }

    /// Fill `buf` from `offset`, observing writes already made in this transaction.
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), Error> {
        self.store.read(offset, buf)
    }

    pub fn commit(mut self) -> Result<(), Error> {
        self.store.commit()?;
        self.committed = true;
        Ok(())
    }
}

impl<S: PersistentStore + ?Sized> Drop for Transaction<'_, S> {
    fn drop(&mut self) {
        if !self.committed {
            self.store.abort();
        }
    }
}
