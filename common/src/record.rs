//! Typed views over the tagged records held in a [`Heap`].
//!
//! A view is a small `Copy` value wrapping an [`Addr`]; every accessor takes the arena explicitly
//! and re-validates the address, so a view that outlives an arena reset fails cleanly rather than
//! reading whatever now occupies its old location.

use crate::cose::{CoseHeaders, CoseKey, CoseKeyPair};
use crate::heap::{Addr, Heap, UNSET};
use crate::wire::keymint::{
    Algorithm, BlockMode, DeviceLockState, Digest, EcCurve, HardwareAuthenticatorType, KeyOrigin,
    KeyPurpose, PaddingMode, SecurityLevel, Tag, VerifiedBootState,
};
use crate::{km_err, CborError, Error};
use enumn::N;
use log::error;

mod keymint;
pub use keymint::*;


/// Discriminant stored in the first byte of every record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, N)]
#[repr(u8)]
pub enum RecordType {
    ByteBlob = 0x01,
    TextString = 0x02,
    Integer = 0x03,
    NegInteger = 0x04,
    Simple = 0x05,
    Enum = 0x06,
    Array = 0x07,
    Map = 0x08,
    KeyParam = 0x09,
    KeyParams = 0x0a,
    KeyChars = 0x0b,
    HwAuthToken = 0x0c,
    VerificationToken = 0x0d,
    HmacSharingParams = 0x0e,
    CoseKeyPair = 0x0f,
    CoseKey = 0x10,
    CoseHeaders = 0x11,
}

/// Enumeration that an [`Enum`] record's value is drawn from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, N)]
#[repr(u8)]
pub enum EnumType {
    Purpose = 1,
    Algorithm = 2,
    BlockMode = 3,
    Digest = 4,
    Padding = 5,
    EcCurve = 6,
    UserAuthType = 7,
    Origin = 8,
    SecurityLevel = 9,
    VerifiedBootState = 10,
    DeviceLocked = 11,
    /// Unconstrained single-byte value.
    Any = 0xff,
}

impl EnumType {
    /// Enumeration used for the values of an `Enum`-typed tag.
    pub fn for_tag(tag: Tag) -> EnumType {
        match tag {
            Tag::Algorithm => EnumType::Algorithm,
            Tag::EcCurve => EnumType::EcCurve,
            Tag::HardwareType => EnumType::SecurityLevel,
            Tag::UserAuthType => EnumType::UserAuthType,
            Tag::Origin => EnumType::Origin,
            _ => EnumType::Any,
        }
    }

    /// Indicate whether `value` is a member of this enumeration.
    pub fn is_valid(self, value: u8) -> bool {
        let v = value as i32;
        match self {
            EnumType::Purpose => KeyPurpose::n(v).is_some(),
            EnumType::Algorithm => Algorithm::n(v).is_some(),
            EnumType::BlockMode => BlockMode::n(v).is_some(),
            EnumType::Digest => Digest::n(v).is_some(),
            EnumType::Padding => PaddingMode::n(v).is_some(),
            EnumType::EcCurve => EcCurve::n(v).is_some(),
            // Authenticator types combine as a bitmask, with `Any` covering everything.
            EnumType::UserAuthType => {
                value == HardwareAuthenticatorType::Any as u8
                    || value
                        & !(HardwareAuthenticatorType::Password as u8
                            | HardwareAuthenticatorType::Fingerprint as u8)
                        == 0
            }
            EnumType::Origin => KeyOrigin::n(v).is_some(),
            EnumType::SecurityLevel => SecurityLevel::n(v).is_some(),
            EnumType::VerifiedBootState => VerifiedBootState::n(v).is_some(),
            EnumType::DeviceLocked => DeviceLockState::n(v).is_some(),
            EnumType::Any => true,
        }
    }
}

/// Common behaviour of every typed record view.
pub trait Record: Copy {
    /// Record kind this view accepts.
    const KIND: RecordType;

    /// Wrap `addr` after checking that it refers to a live record of kind [`Record::KIND`].
    fn cast(heap: &Heap, addr: Addr) -> Result<Self, Error>;

    /// Arena address of the record.
    fn addr(&self) -> Addr;
}

/// Declare a view type over records of the given kind.
macro_rules! record_view {
    { $(#[$meta:meta])* $name:ident => $kind:ident } => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq)]
        pub struct $name($crate::heap::Addr);

        impl $crate::record::Record for $name {
            const KIND: $crate::record::RecordType = $crate::record::RecordType::$kind;

            fn cast(
                heap: &$crate::heap::Heap,
                addr: $crate::heap::Addr,
            ) -> Result<Self, $crate::Error> {
                heap.payload(addr, Self::KIND)?;
                Ok(Self(addr))
            }

            fn addr(&self) -> $crate::heap::Addr {
                self.0
            }
        }

        impl $name {
            #[allow(dead_code)]
            fn payload<'h>(
                &self,
                heap: &'h $crate::heap::Heap,
            ) -> Result<&'h [u8], $crate::Error> {
                heap.payload(self.0, <Self as $crate::record::Record>::KIND)
            }

            #[allow(dead_code)]
            fn payload_mut<'h>(
                &self,
                heap: &'h mut $crate::heap::Heap,
            ) -> Result<&'h mut [u8], $crate::Error> {
                heap.payload_mut(self.0, <Self as $crate::record::Record>::KIND)
            }
        }
    };
}
pub(crate) use record_view;

/// Read a big-endian `u16` at `pos` in a record payload.
pub(crate) fn read_u16(data: &[u8], pos: usize) -> Result<u16, Error> {
    match data.get(pos..pos + 2) {
        Some(b) => Ok(u16::from_be_bytes([b[0], b[1]])),
        None => {
            error!("record: payload too short for field at {}", pos);
            Err(km_err!(UnknownError, "payload too short for field at {}", pos))
        }
    }
}

/// Write a big-endian `u16` at `pos` in a record payload.
pub(crate) fn write_u16(data: &mut [u8], pos: usize, value: u16) -> Result<(), Error> {
    match data.get_mut(pos..pos + 2) {
        Some(b) => {
            b.copy_from_slice(&value.to_be_bytes());
            Ok(())
        }
        None => {
            error!("record: payload too short for field at {}", pos);
            Err(km_err!(UnknownError, "payload too short for field at {}", pos))
        }
    }
}

/// Closed sum over every record kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum View {
    ByteBlob(ByteBlob),
    TextString(TextString),
    Integer(Integer),
    NegInteger(NegInteger),
    Simple(Simple),
    Enum(Enum),
    Array(Array),
    Map(Map),
    KeyParam(KeyParam),
    KeyParams(KeyParams),
    KeyChars(KeyChars),
    HwAuthToken(HwAuthToken),
    VerificationToken(VerificationToken),
    HmacSharingParams(HmacSharingParams),
    CoseKeyPair(CoseKeyPair),
    CoseKey(CoseKey),
    CoseHeaders(CoseHeaders),
}

impl View {
    /// Resolve `addr` to the view matching the stored record kind.
    pub fn of(heap: &Heap, addr: Addr) -> Result<View, Error> {
        Ok(match heap.kind(addr)? {
            RecordType::ByteBlob => View::ByteBlob(ByteBlob(addr)),
            RecordType::TextString => View::TextString(TextString(addr)),
            RecordType::Integer => View::Integer(Integer(addr)),
            RecordType::NegInteger => View::NegInteger(NegInteger(addr)),
            RecordType::Simple => View::Simple(Simple(addr)),
            RecordType::Enum => View::Enum(Enum(addr)),
            RecordType::Array => View::Array(Array(addr)),
            RecordType::Map => View::Map(Map(addr)),
            RecordType::KeyParam => View::KeyParam(KeyParam::cast(heap, addr)?),
            RecordType::KeyParams => View::KeyParams(KeyParams::cast(heap, addr)?),
            RecordType::KeyChars => View::KeyChars(KeyChars::cast(heap, addr)?),
            RecordType::HwAuthToken => View::HwAuthToken(HwAuthToken::cast(heap, addr)?),
            RecordType::VerificationToken => {
                View::VerificationToken(VerificationToken::cast(heap, addr)?)
            }
            RecordType::HmacSharingParams => {
                View::HmacSharingParams(HmacSharingParams::cast(heap, addr)?)
            }
            RecordType::CoseKeyPair => View::CoseKeyPair(CoseKeyPair::cast(heap, addr)?),
            RecordType::CoseKey => View::CoseKey(CoseKey::cast(heap, addr)?),
            RecordType::CoseHeaders => View::CoseHeaders(CoseHeaders::cast(heap, addr)?),
        })
    }
}

record_view! {
    /// Opaque byte string.
    ByteBlob => ByteBlob
}

impl ByteBlob {
    /// Allocate a zero-filled blob of `len` bytes.
    pub fn instance(heap: &mut Heap, len: usize) -> Result<Self, Error> {
        Ok(Self(heap.instance(RecordType::ByteBlob, len)?))
    }

    /// Allocate a blob holding a copy of `data`.
    pub fn from_slice(heap: &mut Heap, data: &[u8]) -> Result<Self, Error> {
        let blob = Self::instance(heap, data.len())?;
        blob.data_mut(heap)?.copy_from_slice(data);
        Ok(blob)
    }

    pub fn data<'h>(&self, heap: &'h Heap) -> Result<&'h [u8], Error> {
        self.payload(heap)
    }

    pub fn data_mut<'h>(&self, heap: &'h mut Heap) -> Result<&'h mut [u8], Error> {
        self.payload_mut(heap)
    }

    pub fn len(&self, heap: &Heap) -> Result<usize, Error> {
        Ok(self.payload(heap)?.len())
    }
}

record_view! {
    /// UTF-8 text. Content is stored as given; validity is checked on decode.
    TextString => TextString
}

impl TextString {
    pub fn instance(heap: &mut Heap, len: usize) -> Result<Self, Error> {
        Ok(Self(heap.instance(RecordType::TextString, len)?))
    }

    pub fn from_text(heap: &mut Heap, text: &str) -> Result<Self, Error> {
        let s = Self::instance(heap, text.len())?;
        s.data_mut(heap)?.copy_from_slice(text.as_bytes());
        Ok(s)
    }

    pub fn data<'h>(&self, heap: &'h Heap) -> Result<&'h [u8], Error> {
        self.payload(heap)
    }

    pub fn data_mut<'h>(&self, heap: &'h mut Heap) -> Result<&'h mut [u8], Error> {
        self.payload_mut(heap)
    }

    pub fn len(&self, heap: &Heap) -> Result<usize, Error> {
        Ok(self.payload(heap)?.len())
    }
}

record_view! {
    /// Unsigned integer, held in 4 or 8 big-endian bytes.
    Integer => Integer
}

impl Integer {
    pub fn from_u32(heap: &mut Heap, value: u32) -> Result<Self, Error> {
        let addr = heap.instance(RecordType::Integer, 4)?;
        heap.payload_mut(addr, RecordType::Integer)?.copy_from_slice(&value.to_be_bytes());
        Ok(Self(addr))
    }

    pub fn from_u64(heap: &mut Heap, value: u64) -> Result<Self, Error> {
        let addr = heap.instance(RecordType::Integer, 8)?;
        heap.payload_mut(addr, RecordType::Integer)?.copy_from_slice(&value.to_be_bytes());
        Ok(Self(addr))
    }

    /// Build from up to 8 big-endian bytes, left-padding to the nearest of 4 or 8 bytes.
    pub fn from_be_bytes(heap: &mut Heap, data: &[u8]) -> Result<Self, Error> {
        let width = match data.len() {
            0..=4 => 4,
            5..=8 => 8,
            n => return Err(km_err!(InvalidArgument, "integer of {} bytes too wide", n)),
        };
        let addr = heap.instance(RecordType::Integer, width)?;
        heap.payload_mut(addr, RecordType::Integer)?[width - data.len()..].copy_from_slice(data);
        Ok(Self(addr))
    }

    pub fn value(&self, heap: &Heap) -> Result<u64, Error> {
        let data = self.payload(heap)?;
        match data.len() {
            4 => Ok(u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as u64),
            8 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(data);
                Ok(u64::from_be_bytes(buf))
            }
            n => {
                error!("record: integer with {} byte payload", n);
                Err(km_err!(UnknownError, "integer with {} byte payload", n))
            }
        }
    }

    /// Value as a `u32`; fails for anything larger.
    pub fn as_u32(&self, heap: &Heap) -> Result<u32, Error> {
        Ok(u32::try_from(self.value(heap)?).map_err(CborError::from)?)
    }

    pub fn as_u16(&self, heap: &Heap) -> Result<u16, Error> {
        Ok(u16::try_from(self.value(heap)?).map_err(CborError::from)?)
    }

    /// Indicate whether the integer occupies the 8-byte form.
    pub fn is_wide(&self, heap: &Heap) -> Result<bool, Error> {
        Ok(self.payload(heap)?.len() == 8)
    }
}

record_view! {
    /// Negative integer, held as 4 or 8 bytes of big-endian two's complement.
    NegInteger => NegInteger
}

impl NegInteger {
    pub fn from_i64(heap: &mut Heap, value: i64) -> Result<Self, Error> {
        if value >= 0 {
            return Err(km_err!(InvalidArgument, "{} is not negative", value));
        }
        let addr = if value >= i32::MIN as i64 {
            let addr = heap.instance(RecordType::NegInteger, 4)?;
            heap.payload_mut(addr, RecordType::NegInteger)?
                .copy_from_slice(&(value as i32).to_be_bytes());
            addr
        } else {
            let addr = heap.instance(RecordType::NegInteger, 8)?;
            heap.payload_mut(addr, RecordType::NegInteger)?.copy_from_slice(&value.to_be_bytes());
            addr
        };
        Ok(Self(addr))
    }

    /// Build from exactly 4 or 8 bytes of two's complement.
    pub fn from_be_bytes(heap: &mut Heap, data: &[u8]) -> Result<Self, Error> {
        if data.len() != 4 && data.len() != 8 {
            return Err(km_err!(InvalidArgument, "negative integer of {} bytes", data.len()));
        }
        if data[0] & 0x80 == 0 {
            return Err(km_err!(InvalidArgument, "two's complement value is not negative"));
        }
        let addr = heap.instance(RecordType::NegInteger, data.len())?;
        heap.payload_mut(addr, RecordType::NegInteger)?.copy_from_slice(data);
        Ok(Self(addr))
    }

    pub fn value(&self, heap: &Heap) -> Result<i64, Error> {
        let data = self.payload(heap)?;
        match data.len() {
            4 => Ok(i32::from_be_bytes([data[0], data[1], data[2], data[3]]) as i64),
            8 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(data);
                Ok(i64::from_be_bytes(buf))
            }
            n => {
                error!("record: negative integer with {} byte payload", n);
                Err(km_err!(UnknownError, "negative integer with {} byte payload", n))
            }
        }
    }
}

record_view! {
    /// CBOR simple value (major type 7, values 0..=23).
    Simple => Simple
}

impl Simple {
    pub const FALSE: u8 = 20;
    pub const TRUE: u8 = 21;
    pub const NULL: u8 = 22;
    pub const UNDEFINED: u8 = 23;

    pub fn instance(heap: &mut Heap, value: u8) -> Result<Self, Error> {
        if value > Self::UNDEFINED {
            return Err(km_err!(InvalidArgument, "simple value {} out of range", value));
        }
        let addr = heap.instance(RecordType::Simple, 1)?;
        heap.payload_mut(addr, RecordType::Simple)?[0] = value;
        Ok(Self(addr))
    }

    pub fn from_bool(heap: &mut Heap, value: bool) -> Result<Self, Error> {
        Self::instance(heap, if value { Self::TRUE } else { Self::FALSE })
    }

    pub fn value(&self, heap: &Heap) -> Result<u8, Error> {
        Ok(self.payload(heap)?[0])
    }

    pub fn as_bool(&self, heap: &Heap) -> Result<bool, Error> {
        match self.value(heap)? {
            Self::TRUE => Ok(true),
            Self::FALSE => Ok(false),
            _ => Err(CborError::UnexpectedItem("simple", "bool").into()),
        }
    }
}

record_view! {
    /// Single-byte member of a known enumeration.
    Enum => Enum
}

impl Enum {
    pub fn instance(heap: &mut Heap, enum_type: EnumType, value: u8) -> Result<Self, Error> {
        if !enum_type.is_valid(value) {
            return Err(CborError::NonEnumValue.into());
        }
        let addr = heap.instance(RecordType::Enum, 2)?;
        let data = heap.payload_mut(addr, RecordType::Enum)?;
        data[0] = enum_type as u8;
        data[1] = value;
        Ok(Self(addr))
    }

    pub fn enum_type(&self, heap: &Heap) -> Result<EnumType, Error> {
        let raw = self.payload(heap)?[0];
        EnumType::n(raw).ok_or_else(|| {
            error!("record: unknown enum type {}", raw);
            km_err!(UnknownError, "unknown enum type {}", raw)
        })
    }

    pub fn value(&self, heap: &Heap) -> Result<u8, Error> {
        Ok(self.payload(heap)?[1])
    }
}

record_view! {
    /// Fixed-length sequence of record addresses.
    Array => Array
}

impl Array {
    /// Allocate an array with `len` unset slots.
    pub fn instance(heap: &mut Heap, len: usize) -> Result<Self, Error> {
        let count = u16::try_from(len).map_err(|_e| Error::Alloc("array too long"))?;
        let addr = heap.instance(RecordType::Array, 2 + 2 * len)?;
        let data = heap.payload_mut(addr, RecordType::Array)?;
        data[..2].copy_from_slice(&count.to_be_bytes());
        for slot in data[2..].chunks_exact_mut(2) {
            slot.copy_from_slice(&UNSET.to_be_bytes());
        }
        Ok(Self(addr))
    }

    /// Allocate an array holding the given records, in order.
    pub fn from_addrs(heap: &mut Heap, items: &[Addr]) -> Result<Self, Error> {
        let arr = Self::instance(heap, items.len())?;
        for (idx, item) in items.iter().enumerate() {
            arr.add(heap, idx, *item)?;
        }
        Ok(arr)
    }

    pub fn len(&self, heap: &Heap) -> Result<usize, Error> {
        Ok(read_u16(self.payload(heap)?, 0)? as usize)
    }

    fn slot(&self, heap: &Heap, idx: usize) -> Result<usize, Error> {
        let len = self.len(heap)?;
        if idx >= len {
            error!("record: array index {} out of range {}", idx, len);
            return Err(km_err!(UnknownError, "array index {} out of range {}", idx, len));
        }
        Ok(2 + 2 * idx)
    }

    /// Store `item` at position `idx`.
    pub fn add(&self, heap: &mut Heap, idx: usize, item: Addr) -> Result<(), Error> {
        heap.kind(item)?;
        let pos = self.slot(heap, idx)?;
        write_u16(self.payload_mut(heap)?, pos, item.offset())
    }

    /// Return the address stored at `idx`, failing if the slot was never filled.
    pub fn get(&self, heap: &Heap, idx: usize) -> Result<Addr, Error> {
        let pos = self.slot(heap, idx)?;
        heap.addr_at(read_u16(self.payload(heap)?, pos)?)
    }

    /// Return the record at `idx` as a typed view.
    pub fn get_as<T: Record>(&self, heap: &Heap, idx: usize) -> Result<T, Error> {
        T::cast(heap, self.get(heap, idx)?)
    }
}

record_view! {
    /// Fixed-length sequence of key/value address pairs.
    Map => Map
}

impl Map {
    pub fn instance(heap: &mut Heap, len: usize) -> Result<Self, Error> {
        let count = u16::try_from(len).map_err(|_e| Error::Alloc("map too long"))?;
        let addr = heap.instance(RecordType::Map, 2 + 4 * len)?;
        let data = heap.payload_mut(addr, RecordType::Map)?;
        data[..2].copy_from_slice(&count.to_be_bytes());
        for slot in data[2..].chunks_exact_mut(2) {
            slot.copy_from_slice(&UNSET.to_be_bytes());
        }
        Ok(Self(addr))
    }

    pub fn len(&self, heap: &Heap) -> Result<usize, Error> {
        Ok(read_u16(self.payload(heap)?, 0)? as usize)
    }

    fn slot(&self, heap: &Heap, idx: usize) -> Result<usize, Error> {
        let len = self.len(heap)?;
        if idx >= len {
            error!("record: map index {} out of range {}", idx, len);
            return Err(km_err!(UnknownError, "map index {} out of range {}", idx, len));
        }
        Ok(2 + 4 * idx)
    }

    pub fn add(&self, heap: &mut Heap, idx: usize, key: Addr, value: Addr) -> Result<(), Error> {
        heap.kind(key)?;
        heap.kind(value)?;
        let pos = self.slot(heap, idx)?;
        let data = self.payload_mut(heap)?;
        write_u16(data, pos, key.offset())?;
        write_u16(data, pos + 2, value.offset())
    }

    /// Store only the key of entry `idx`, leaving its value to be filled in later.
    pub(crate) fn set_key(&self, heap: &mut Heap, idx: usize, key: Addr) -> Result<(), Error> {
        heap.kind(key)?;
        let pos = self.slot(heap, idx)?;
        write_u16(self.payload_mut(heap)?, pos, key.offset())
    }

    /// Store only the value of entry `idx`.
    pub(crate) fn set_value(&self, heap: &mut Heap, idx: usize, value: Addr) -> Result<(), Error> {
        heap.kind(value)?;
        let pos = self.slot(heap, idx)?;
        write_u16(self.payload_mut(heap)?, pos + 2, value.offset())
    }

    pub fn key(&self, heap: &Heap, idx: usize) -> Result<Addr, Error> {
        let pos = self.slot(heap, idx)?;
        heap.addr_at(read_u16(self.payload(heap)?, pos)?)
    }

    pub fn value(&self, heap: &Heap, idx: usize) -> Result<Addr, Error> {
        let pos = self.slot(heap, idx)?;
        heap.addr_at(read_u16(self.payload(heap)?, pos + 2)?)
    }
}
