//! Persistent table of named device fields (boot parameters, patch levels, attestation IDs, HMAC
//! sharing state, lock state), laid out in the first [`DATA_MEM_SIZE`] bytes of the store.
//!
//! Layout: a u16 allocation cursor, [`DATA_INDEX_SIZE`] index entries of (length u16, offset
//! u16), then the data area. An entry is allocated on first write and keeps its offset and
//! length for the life of the device; later writes must have the same length.

use crate::nvm::{PersistentStore, Transaction};
use crate::wire::keymint::{Tag, VerifiedBootState};
use crate::{km_err, vec_try, Error};
use alloc::vec::Vec;
use enumn::N;
use log::{debug, error};

/// Number of index entries.
pub const DATA_INDEX_SIZE: usize = 22;

/// Size of one index entry: length u16 then offset u16.
pub const DATA_INDEX_ENTRY_SIZE: usize = 4;

/// Total size of the table region, including the index.
pub const DATA_MEM_SIZE: usize = 2048;

/// Offset of the first data byte; everything below is cursor and index.
const DATA_START: usize = 2 + DATA_INDEX_SIZE * DATA_INDEX_ENTRY_SIZE;

pub const OS_VERSION_SIZE: usize = 4;
pub const PATCH_LEVEL_SIZE: usize = 4;
pub const BOOT_KEY_MAX_SIZE: usize = 32;
pub const BOOT_HASH_MAX_SIZE: usize = 32;
pub const HMAC_SEED_NONCE_SIZE: usize = 32;
pub const COMPUTED_HMAC_KEY_SIZE: usize = 32;
pub const DEVICE_LOCK_TS_SIZE: usize = 8;

/// Longest attestation ID value that can be provisioned.
pub const ATTESTATION_ID_MAX_SIZE: usize = 64;

/// Attestation IDs live in fixed slots (length byte then padded value) so that they can be
/// destroyed and provisioned again with a different length.
const ATTESTATION_ID_SLOT_SIZE: usize = 1 + ATTESTATION_ID_MAX_SIZE;

const DEVICE_LOCKED_FLAG: u8 = 0x01;
const DEVICE_LOCKED_PASSWORD_ONLY_FLAG: u8 = 0x02;

/// Index of each field in the table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, N)]
#[repr(u8)]
pub enum DataId {
    AttestationIdBrand = 0,
    AttestationIdDevice = 1,
    AttestationIdProduct = 2,
    AttestationIdSerial = 3,
    AttestationIdImei = 4,
    AttestationIdMeid = 5,
    AttestationIdManufacturer = 6,
    AttestationIdModel = 7,
    ComputedHmacKey = 8,
    HmacNonce = 9,
    CertIssuer = 10,
    CertExpiryTime = 11,
    OsVersion = 12,
    OsPatchLevel = 13,
    VendorPatchLevel = 14,
    BootPatchLevel = 15,
    VerifiedBootKey = 16,
    VerifiedBootHash = 17,
    VerifiedBootState = 18,
    DeviceBootLocked = 19,
    DeviceLockedTime = 20,
    DeviceLocked = 21,
}

/// Every attestation ID entry, in index order.
pub const ATTESTATION_IDS: [DataId; 8] = [
    DataId::AttestationIdBrand,
    DataId::AttestationIdDevice,
    DataId::AttestationIdProduct,
    DataId::AttestationIdSerial,
    DataId::AttestationIdImei,
    DataId::AttestationIdMeid,
    DataId::AttestationIdManufacturer,
    DataId::AttestationIdModel,
];

impl DataId {
    /// Entry that holds the attestation ID for `tag`, if `tag` is an attestation ID tag.
    pub fn for_attestation_tag(tag: Tag) -> Option<Self> {
        match tag {
            Tag::AttestationIdBrand => Some(DataId::AttestationIdBrand),
            Tag::AttestationIdDevice => Some(DataId::AttestationIdDevice),
            Tag::AttestationIdProduct => Some(DataId::AttestationIdProduct),
            Tag::AttestationIdSerial => Some(DataId::AttestationIdSerial),
            Tag::AttestationIdImei => Some(DataId::AttestationIdImei),
            Tag::AttestationIdMeid => Some(DataId::AttestationIdMeid),
            Tag::AttestationIdManufacturer => Some(DataId::AttestationIdManufacturer),
            Tag::AttestationIdModel => Some(DataId::AttestationIdModel),
            _ => None,
        }
    }

    fn index_offset(self) -> usize {
        2 + self as usize * DATA_INDEX_ENTRY_SIZE
    }
}

/// Device lock state as recorded by the last device-locked command.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceLockFlags {
    pub locked: bool,
    pub password_only: bool,
}

/// View of the data table inside a [`PersistentStore`].
pub struct DataTable<'a, S: PersistentStore + ?Sized> {
    store: &'a mut S,
}

impl<'a, S: PersistentStore + ?Sized> DataTable<'a, S> {
    pub fn new(store: &'a mut S) -> Result<Self, Error> {
        if store.len() < DATA_MEM_SIZE {
            return Err(km_err!(
                UnknownError,
                "store of {} bytes cannot hold {} byte table",
                store.len(),
                DATA_MEM_SIZE
            ));
        }
        Ok(Self { store })
    }

    /// Return the (length, offset) index entry for `id`; length zero means unallocated.
    fn index(&self, id: DataId) -> Result<(usize, usize), Error> {
        let mut raw = [0u8; DATA_INDEX_ENTRY_SIZE];
        self.store.read(id.index_offset(), &mut raw)?;
        let len = u16::from_be_bytes([raw[0], raw[1]]) as usize;
        let offset = u16::from_be_bytes([raw[2], raw[3]]) as usize;
        if len != 0 && (offset < DATA_START || offset + len > DATA_MEM_SIZE) {
            error!("table: corrupt index entry {:?}: offset {} len {}", id, offset, len);
            return Err(km_err!(UnknownError, "corrupt index entry for {:?}", id));
        }
        Ok((len, offset))
    }

    fn cursor(&self) -> Result<usize, Error> {
        let mut raw = [0u8; 2];
        self.store.read(0, &mut raw)?;
        match u16::from_be_bytes(raw) as usize {
            0 => Ok(DATA_START),
            c if (DATA_START..=DATA_MEM_SIZE).contains(&c) => Ok(c),
            c => {
                error!("table: corrupt allocation cursor {}", c);
                Err(km_err!(UnknownError, "corrupt table cursor {}", c))
            }
        }
    }

    /// Store `data` as the value of `id`, allocating the entry on first use.
    pub fn write_entry(&mut self, id: DataId, data: &[u8]) -> Result<(), Error> {
        if data.is_empty() {
            return Err(km_err!(InvalidArgument, "empty value for {:?}", id));
        }
        let (len, offset) = self.index(id)?;
        if len == 0 {
            let start = self.cursor()?;
            let end = start + data.len();
            if end > DATA_MEM_SIZE {
                return Err(km_err!(
                    InsufficientBufferSpace,
                    "no room for {} bytes of {:?}",
                    data.len(),
                    id
                ));
            }
            debug!("table: allocating {} bytes at {} for {:?}", data.len(), start, id);
            let mut entry = [0u8; DATA_INDEX_ENTRY_SIZE];
            entry[..2].copy_from_slice(&(data.len() as u16).to_be_bytes());
            entry[2..].copy_from_slice(&(start as u16).to_be_bytes());

            let mut txn = Transaction::begin(&mut *self.store)?;
            txn.write(start, data)?;
            txn.write(id.index_offset(), &entry)?;
            txn.write(0, &(end as u16).to_be_bytes())?;
            txn.commit()
        } else if len != data.len() {
            error!("table: rewrite of {:?} with {} bytes, entry holds {}", id, data.len(), len);
            Err(km_err!(UnknownError, "length mismatch for {:?}", id))
        } else {
            let mut txn = Transaction::begin(&mut *self.store)?;
            txn.write(offset, data)?;
            txn.commit()
        }
    }

    /// Copy the value of `id` into `buf`, returning its length (zero if never written).
    pub fn read_entry(&self, id: DataId, buf: &mut [u8]) -> Result<usize, Error> {
        let (len, offset) = self.index(id)?;
        if len == 0 {
            return Ok(0);
        }
        if buf.len() < len {
            return Err(km_err!(
                InsufficientBufferSpace,
                "{:?} needs {} bytes, buffer has {}",
                id,
                len,
                buf.len()
            ));
        }
        self.store.read(offset, &mut buf[..len])?;
        Ok(len)
    }

    /// Length of the value of `id`, zero if never written.
    pub fn entry_len(&self, id: DataId) -> Result<usize, Error> {
        self.index(id).map(|(len, _)| len)
    }

    pub fn read_entry_to_vec(&self, id: DataId) -> Result<Vec<u8>, Error> {
        let mut buf = vec_try![0u8; self.entry_len(id)?]?;
        self.read_entry(id, &mut buf)?;
        Ok(buf)
    }

    /// Zero-fill the values of `ids` in a single transaction. Entries keep their allocation.
    pub fn clear_entries(&mut self, ids: &[DataId]) -> Result<(), Error> {
        let mut ranges = Vec::new();
        ranges.try_reserve(ids.len()).map_err(|_e| Error::Alloc("table clear"))?;
        for id in ids {
            let (len, offset) = self.index(*id)?;
            if len != 0 {
                ranges.push((offset, len));
            }
        }
        let zeroes = [0u8; ATTESTATION_ID_SLOT_SIZE];
        let mut txn = Transaction::begin(&mut *self.store)?;
        for (offset, len) in ranges {
            for chunk_start in (offset..offset + len).step_by(zeroes.len()) {
                let n = core::cmp::min(zeroes.len(), offset + len - chunk_start);
                txn.write(chunk_start, &zeroes[..n])?;
            }
        }
        txn.commit()
    }

    pub fn clear_entry(&mut self, id: DataId) -> Result<(), Error> {
        self.clear_entries(&[id])
    }

    fn read_array<const N: usize>(&self, id: DataId) -> Result<Option<[u8; N]>, Error> {
        match self.entry_len(id)? {
            0 => Ok(None),
            len if len == N => {
                let mut buf = [0u8; N];
                self.read_entry(id, &mut buf)?;
                Ok(Some(buf))
            }
            len => {
                error!("table: {:?} holds {} bytes, expected {}", id, len, N);
                Err(km_err!(UnknownError, "unexpected length {} for {:?}", len, id))
            }
        }
    }

    fn write_u32(&mut self, id: DataId, value: u32) -> Result<(), Error> {
        self.write_entry(id, &value.to_be_bytes())
    }

    fn read_u32(&self, id: DataId) -> Result<Option<u32>, Error> {
        Ok(self.read_array::<4>(id)?.map(u32::from_be_bytes))
    }

    /// Write `data` zero-padded to `N` bytes.
    fn write_padded<const N: usize>(&mut self, id: DataId, data: &[u8]) -> Result<(), Error> {
        if data.len() > N {
            return Err(km_err!(
                InvalidInputLength,
                "{} bytes too long for {:?} (max {})",
                data.len(),
                id,
                N
            ));
        }
        let mut slot = [0u8; N];
        slot[..data.len()].copy_from_slice(data);
        self.write_entry(id, &slot)
    }

    pub fn set_os_version(&mut self, value: u32) -> Result<(), Error> {
        self.write_u32(DataId::OsVersion, value)
    }

    pub fn os_version(&self) -> Result<Option<u32>, Error> {
        self.read_u32(DataId::OsVersion)
    }

    pub fn set_os_patch_level(&mut self, value: u32) -> Result<(), Error> {
        self.write_u32(DataId::OsPatchLevel, value)
    }

    pub fn os_patch_level(&self) -> Result<Option<u32>, Error> {
        self.read_u32(DataId::OsPatchLevel)
    }

    pub fn set_vendor_patch_level(&mut self, value: u32) -> Result<(), Error> {
        self.write_u32(DataId::VendorPatchLevel, value)
    }

    pub fn vendor_patch_level(&self) -> Result<Option<u32>, Error> {
        self.read_u32(DataId::VendorPatchLevel)
    }

    pub fn set_boot_patch_level(&mut self, value: u32) -> Result<(), Error> {
        self.write_u32(DataId::BootPatchLevel, value)
    }

    pub fn boot_patch_level(&self) -> Result<Option<u32>, Error> {
        self.read_u32(DataId::BootPatchLevel)
    }

    /// Record the verified boot key, at most [`BOOT_KEY_MAX_SIZE`] bytes.
    pub fn set_boot_key(&mut self, key: &[u8]) -> Result<(), Error> {
        self.write_padded::<BOOT_KEY_MAX_SIZE>(DataId::VerifiedBootKey, key)
    }

    /// Verified boot key, zero-padded to [`BOOT_KEY_MAX_SIZE`] bytes.
    pub fn boot_key(&self) -> Result<Option<[u8; BOOT_KEY_MAX_SIZE]>, Error> {
        self.read_array(DataId::VerifiedBootKey)
    }

    /// Record the verified boot hash, at most [`BOOT_HASH_MAX_SIZE`] bytes.
    pub fn set_boot_hash(&mut self, hash: &[u8]) -> Result<(), Error> {
        self.write_padded::<BOOT_HASH_MAX_SIZE>(DataId::VerifiedBootHash, hash)
    }

    pub fn boot_hash(&self) -> Result<Option<[u8; BOOT_HASH_MAX_SIZE]>, Error> {
        self.read_array(DataId::VerifiedBootHash)
    }

    pub fn set_boot_state(&mut self, state: VerifiedBootState) -> Result<(), Error> {
        self.write_entry(DataId::VerifiedBootState, &[state as u8])
    }

    pub fn boot_state(&self) -> Result<Option<VerifiedBootState>, Error> {
        match self.read_array::<1>(DataId::VerifiedBootState)? {
            None => Ok(None),
            Some([raw]) => match VerifiedBootState::n(raw as i32) {
                Some(state) => Ok(Some(state)),
                None => {
                    error!("table: stored boot state {} invalid", raw);
                    Err(km_err!(UnknownError, "invalid stored boot state {}", raw))
                }
            },
        }
    }

    /// Record whether the bootloader reported the device as locked.
    pub fn set_device_boot_locked(&mut self, locked: bool) -> Result<(), Error> {
        let flags = if locked { DEVICE_LOCKED_FLAG } else { 0 };
        self.write_entry(DataId::DeviceBootLocked, &[flags])
    }

    pub fn device_boot_locked(&self) -> Result<Option<bool>, Error> {
        Ok(self.read_array::<1>(DataId::DeviceBootLocked)?.map(|[f]| f & DEVICE_LOCKED_FLAG != 0))
    }

    pub fn set_device_locked(&mut self, flags: DeviceLockFlags) -> Result<(), Error> {
        let mut raw = 0;
        if flags.locked {
            raw |= DEVICE_LOCKED_FLAG;
        }
        if flags.password_only {
            raw |= DEVICE_LOCKED_PASSWORD_ONLY_FLAG;
        }
        self.write_entry(DataId::DeviceLocked, &[raw])
    }

    /// Current device lock state; unlocked if never set.
    pub fn device_locked(&self) -> Result<DeviceLockFlags, Error> {
        Ok(match self.read_array::<1>(DataId::DeviceLocked)? {
            Some([raw]) => DeviceLockFlags {
                locked: raw & DEVICE_LOCKED_FLAG != 0,
                password_only: raw & DEVICE_LOCKED_PASSWORD_ONLY_FLAG != 0,
            },
            None => DeviceLockFlags::default(),
        })
    }

    pub fn set_device_locked_time(&mut self, millis: u64) -> Result<(), Error> {
        self.write_entry(DataId::DeviceLockedTime, &millis.to_be_bytes())
    }

    /// Time the device was locked, zero if unset or cleared.
    pub fn device_locked_time(&self) -> Result<u64, Error> {
        Ok(self
            .read_array::<DEVICE_LOCK_TS_SIZE>(DataId::DeviceLockedTime)?
            .map(u64::from_be_bytes)
            .unwrap_or(0))
    }

    pub fn clear_device_locked_time(&mut self) -> Result<(), Error> {
        self.clear_entry(DataId::DeviceLockedTime)
    }

    pub fn set_hmac_nonce(&mut self, nonce: &[u8; HMAC_SEED_NONCE_SIZE]) -> Result<(), Error> {
        self.write_entry(DataId::HmacNonce, nonce)
    }

    pub fn hmac_nonce(&self) -> Result<Option<[u8; HMAC_SEED_NONCE_SIZE]>, Error> {
        self.read_array(DataId::HmacNonce)
    }

    pub fn set_computed_hmac_key(
        &mut self,
        key: &[u8; COMPUTED_HMAC_KEY_SIZE],
    ) -> Result<(), Error> {
        self.write_entry(DataId::ComputedHmacKey, key)
    }

    pub fn computed_hmac_key(&self) -> Result<Option<[u8; COMPUTED_HMAC_KEY_SIZE]>, Error> {
        self.read_array(DataId::ComputedHmacKey)
    }

    fn attestation_entry(tag: Tag) -> Result<DataId, Error> {
        DataId::for_attestation_tag(tag)
            .ok_or_else(|| km_err!(InvalidTag, "{:?} is not an attestation ID tag", tag))
    }

    /// Provision the attestation ID identified by `tag`.
    pub fn set_attestation_id(&mut self, tag: Tag, value: &[u8]) -> Result<(), Error> {
        let id = Self::attestation_entry(tag)?;
        if value.is_empty() || value.len() > ATTESTATION_ID_MAX_SIZE {
            return Err(km_err!(
                InvalidInputLength,
                "attestation ID {:?} of {} bytes",
                tag,
                value.len()
            ));
        }
        let mut slot = [0u8; ATTESTATION_ID_SLOT_SIZE];
        slot[0] = value.len() as u8;
        slot[1..1 + value.len()].copy_from_slice(value);
        self.write_entry(id, &slot)
    }

    /// Provisioned value of the attestation ID identified by `tag`, if any.
    pub fn attestation_id(&self, tag: Tag) -> Result<Option<Vec<u8>>, Error> {
        let id = Self::attestation_entry(tag)?;
        let slot = match self.read_array::<ATTESTATION_ID_SLOT_SIZE>(id)? {
            Some(slot) => slot,
            None => return Ok(None),
        };
        match slot[0] as usize {
            0 => Ok(None),
            len if len <= ATTESTATION_ID_MAX_SIZE => Ok(Some(vec_try!(from &slot[1..1 + len])?)),
            len => {
                error!("table: attestation ID {:?} claims {} bytes", id, len);
                Err(km_err!(UnknownError, "corrupt attestation ID {:?}", id))
            }
        }
    }

    /// Erase every attestation ID.
    pub fn delete_attestation_ids(&mut self) -> Result<(), Error> {
        self.clear_entries(&ATTESTATION_IDS)
    }

    /// Root of trust: boot key, boot hash, boot state and bootloader lock status, concatenated.
    /// `None` until all four have been set.
    pub fn root_of_trust(&self) -> Result<Option<Vec<u8>>, Error> {
        let ids = [
            DataId::VerifiedBootKey,
            DataId::VerifiedBootHash,
            DataId::VerifiedBootState,
            DataId::DeviceBootLocked,
        ];
        let mut rot = Vec::new();
        for id in ids {
            let len = self.entry_len(id)?;
            if len == 0 {
                return Ok(None);
            }
            rot.try_reserve(len).map_err(|_e| Error::Alloc("root of trust"))?;
            let start = rot.len();
            rot.resize(start + len, 0);
            self.read_entry(id, &mut rot[start..])?;
        }
        Ok(Some(rot))
    }
}
