//! Durable table of in-flight operations.
//!
//! Each slot in the store holds `status | handle | state`. The crypto operation object that goes
//! with an active slot lives only in memory and is lost on a reset, at which point
//! [`Repository::release_all`] clears the durable side to match.

use crate::operation::{OpHandle, OperationState, OPERATION_STATE_SIZE};
use alloc::{boxed::Box, vec::Vec};
use kmse_common::crypto::CryptoOperation;
use kmse_common::nvm::{PersistentStore, Transaction};
use kmse_common::table::DATA_MEM_SIZE;
use kmse_common::{km_err, Error};
use kmse_wire::OPERATION_HANDLE_SIZE;
use log::{debug, error, warn};

/// Default number of operation slots.
pub const MAX_OPS: usize = 4;

/// Store offset of the first slot; the data table occupies the bytes below.
pub const REPOSITORY_OFFSET: usize = DATA_MEM_SIZE;

const SLOT_FREE: u8 = 0;
const SLOT_ACTIVE: u8 = 1;

/// Size of one slot in the store.
pub const SLOT_SIZE: usize = 1 + OPERATION_HANDLE_SIZE + OPERATION_STATE_SIZE;

/// Size of store needed to hold the data table and `max_ops` operation slots.
pub const fn required_store_size(max_ops: usize) -> usize {
    REPOSITORY_OFFSET + max_ops * SLOT_SIZE
}

fn slot_offset(slot: usize) -> usize {
    REPOSITORY_OFFSET + slot * SLOT_SIZE
}

/// Claim on a free slot, taken before the crypto operation is created so that a full table is
/// detected first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Reservation {
    slot: usize,
    handle: OpHandle,
}

impl Reservation {
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn handle(&self) -> OpHandle {
        self.handle
    }
}

/// Operation slots: durable state in the store plus the volatile crypto operations.
pub struct Repository {
    ops: Vec<Option<Box<dyn CryptoOperation>>>,
    reserved: Vec<Option<OpHandle>>,
}

impl Repository {
    pub fn new(max_ops: usize) -> Result<Self, Error> {
        let mut ops = Vec::new();
        ops.try_reserve(max_ops).map_err(|_e| Error::Alloc("operation table"))?;
        ops.resize_with(max_ops, || None);
        let mut reserved = Vec::new();
        reserved.try_reserve(max_ops).map_err(|_e| Error::Alloc("operation table"))?;
        reserved.resize(max_ops, None);
        Ok(Self { ops, reserved })
    }

    pub fn capacity(&self) -> usize {
        self.ops.len()
    }

    fn check_slot(&self, slot: usize) -> Result<(), Error> {
        if slot >= self.ops.len() {
            error!("repository: slot {} of {}", slot, self.ops.len());
            return Err(km_err!(UnknownError, "operation slot {} out of range", slot));
        }
        Ok(())
    }

    /// Read the status and handle of a slot.
    fn slot_header(
        &self,
        store: &dyn PersistentStore,
        slot: usize,
    ) -> Result<(u8, OpHandle), Error> {
        let mut buf = [0u8; 1 + OPERATION_HANDLE_SIZE];
        store.read(slot_offset(slot), &mut buf)?;
        let status = buf[0];
        if status != SLOT_FREE && status != SLOT_ACTIVE {
            error!("repository: slot {} has status {}", slot, status);
            return Err(km_err!(UnknownError, "corrupt operation slot {}", slot));
        }
        let mut handle = [0u8; OPERATION_HANDLE_SIZE];
        handle.copy_from_slice(&buf[1..]);
        Ok((status, OpHandle::from_be_bytes(handle)))
    }

    fn active_slot(
        &self,
        store: &dyn PersistentStore,
        handle: OpHandle,
    ) -> Result<Option<usize>, Error> {
        for slot in 0..self.ops.len() {
            let (status, slot_handle) = self.slot_header(store, slot)?;
            if status == SLOT_ACTIVE && slot_handle == handle {
                return Ok(Some(slot));
            }
        }
        Ok(None)
    }

    /// Claim a free slot for an operation about to begin.
    pub fn reserve(
        &mut self,
        store: &dyn PersistentStore,
        handle: OpHandle,
    ) -> Result<Reservation, Error> {
        for slot in 0..self.ops.len() {
            if self.reserved[slot].is_some() {
                continue;
            }
            let (status, _) = self.slot_header(store, slot)?;
            if status == SLOT_FREE {
                self.reserved[slot] = Some(handle);
                return Ok(Reservation { slot, handle });
            }
        }
        Err(km_err!(TooManyOperations, "all {} operation slots in use", self.ops.len()))
    }

    /// Give up a reservation that will not be persisted.
    pub fn cancel(&mut self, reservation: Reservation) {
        if let Some(entry) = self.reserved.get_mut(reservation.slot) {
            if *entry == Some(reservation.handle) {
                *entry = None;
            }
        }
    }

    /// Store `state` for the operation identified by `handle` and install its crypto operation.
    ///
    /// An active slot with the same handle is updated in place; otherwise the slot reserved for
    /// the handle (or failing that the first free slot) is claimed. The durable update is a single
    /// transaction, and `op` is only installed once it has committed; on failure `op` is
    /// aborted. Returns the slot used.
    pub fn persist(
        &mut self,
        store: &mut dyn PersistentStore,
        state: &OperationState,
        handle: OpHandle,
        op: Box<dyn CryptoOperation>,
    ) -> Result<usize, Error> {
        match self.write_slot(store, state, handle) {
            Ok(slot) => {
                self.reserved[slot] = None;
                if let Some(old) = self.ops[slot].replace(op) {
                    warn!("repository: replacing live operation in slot {}", slot);
                    old.abort();
                }
                Ok(slot)
            }
            Err(e) => {
                self.reserved.iter_mut().filter(|r| **r == Some(handle)).for_each(|r| *r = None);
                op.abort();
                Err(e)
            }
        }
    }

    fn write_slot(
        &mut self,
        store: &mut dyn PersistentStore,
        state: &OperationState,
        handle: OpHandle,
    ) -> Result<usize, Error> {
        if let Some(slot) = self.active_slot(store, handle)? {
            let mut txn = Transaction::begin(store)?;
            txn.write(slot_offset(slot) + 1 + OPERATION_HANDLE_SIZE, &state.to_bytes())?;
            txn.commit()?;
            debug!("repository: updated {:?} in slot {}", handle, slot);
            return Ok(slot);
        }
        let slot = match self.reserved.iter().position(|r| *r == Some(handle)) {
            Some(slot) => slot,
            None => self.first_free(store)?,
        };
        let offset = slot_offset(slot);
        let mut txn = Transaction::begin(store)?;
        txn.write(offset + 1, &handle.to_be_bytes())?;
        txn.write(offset + 1 + OPERATION_HANDLE_SIZE, &state.to_bytes())?;
        txn.write(offset, &[SLOT_ACTIVE])?;
        txn.commit()?;
        debug!("repository: stored {:?} in slot {}", handle, slot);
        Ok(slot)
    }

    fn first_free(&self, store: &dyn PersistentStore) -> Result<usize, Error> {
        for slot in 0..self.ops.len() {
            if self.reserved[slot].is_none() && self.slot_header(store, slot)?.0 == SLOT_FREE {
                return Ok(slot);
            }
        }
        Err(km_err!(TooManyOperations, "no free operation slot"))
    }

    /// Look up an active operation by handle, returning its slot and stored state.
    pub fn find(
        &self,
        store: &dyn PersistentStore,
        handle: OpHandle,
    ) -> Result<(usize, OperationState), Error> {
        let slot = self
            .active_slot(store, handle)?
            .ok_or_else(|| km_err!(InvalidOperationHandle, "operation {:?} not found", handle))?;
        let mut data = [0u8; OPERATION_STATE_SIZE];
        store.read(slot_offset(slot) + 1 + OPERATION_HANDLE_SIZE, &mut data)?;
        Ok((slot, OperationState::from_bytes(&data)?))
    }

    /// Indicate whether an active operation has the given handle.
    pub fn contains(&self, store: &dyn PersistentStore, handle: OpHandle) -> Result<bool, Error> {
        Ok(self.active_slot(store, handle)?.is_some())
    }

    /// Move the crypto operation out of a slot.
    pub fn take_operation(&mut self, slot: usize) -> Result<Box<dyn CryptoOperation>, Error> {
        self.check_slot(slot)?;
        self.ops[slot].take().ok_or_else(|| {
            km_err!(InvalidOperationHandle, "no crypto operation in slot {}", slot)
        })
    }

    /// Put back a crypto operation taken with [`Repository::take_operation`].
    pub fn restore_operation(
        &mut self,
        slot: usize,
        op: Box<dyn CryptoOperation>,
    ) -> Result<(), Error> {
        if let Err(e) = self.check_slot(slot) {
            op.abort();
            return Err(e);
        }
        if let Some(old) = self.ops[slot].replace(op) {
            old.abort();
        }
        Ok(())
    }

    /// Free a slot, aborting its crypto operation if still present.
    pub fn release(&mut self, store: &mut dyn PersistentStore, slot: usize) -> Result<(), Error> {
        self.check_slot(slot)?;
        if let Some(op) = self.ops[slot].take() {
            op.abort();
        }
        self.reserved[slot] = None;
        let mut txn = Transaction::begin(store)?;
        txn.write(slot_offset(slot), &[0u8; SLOT_SIZE])?;
        txn.commit()?;
        debug!("repository: released slot {}", slot);
        Ok(())
    }

    /// Abort every operation and free every slot.
    pub fn release_all(&mut self, store: &mut dyn PersistentStore) -> Result<(), Error> {
        for op in self.ops.iter_mut() {
            if let Some(op) = op.take() {
                op.abort();
            }
        }
        self.reserved.iter_mut().for_each(|r| *r = None);
        let mut txn = Transaction::begin(store)?;
        for slot in 0..self.ops.len() {
            txn.write(slot_offset(slot), &[0u8; SLOT_SIZE])?;
        }
        txn.commit()?;
        debug!("repository: released all {} slots", self.ops.len());
        Ok(())
    }

    /// Number of durably active operations.
    pub fn active_count(&self, store: &dyn PersistentStore) -> Result<usize, Error> {
        let mut count = 0;
        for slot in 0..self.ops.len() {
            if self.slot_header(store, slot)?.0 == SLOT_ACTIVE {
                count += 1;
            }
        }
        Ok(count)
    }
}
