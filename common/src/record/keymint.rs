//! Record views for KeyMint-specific structures: key parameters and the token types.

use super::{
    read_u16, record_view, write_u16, Array, ByteBlob, Enum, EnumType, Integer, Record,
    RecordType,
};
use crate::heap::{Addr, Heap, UNSET};
use crate::wire::keymint::{
    self, tag_type, HardwareAuthenticatorType, KeyParamValue, SecurityLevel, Tag, TagType,
};
use crate::{km_err, CborError, Error};
use alloc::vec::Vec;
use log::error;

/// Store a single array address inside a new record of kind `kind`.
fn wrap_array(heap: &mut Heap, kind: RecordType, arr: Array, arity: usize) -> Result<Addr, Error> {
    let len = arr.len(heap)?;
    if len != arity {
        error!("record: {:?} needs {} fields, got {}", kind, arity, len);
        return Err(km_err!(UnknownError, "{:?} needs {} fields, got {}", kind, arity, len));
    }
    let addr = heap.instance(kind, 2)?;
    write_u16(heap.payload_mut(addr, kind)?, 0, arr.addr().offset())?;
    Ok(addr)
}

/// Retrieve the array held by a wrapper record.
fn wrapped_array(heap: &Heap, addr: Addr, kind: RecordType) -> Result<Array, Error> {
    let offset = read_u16(heap.payload(addr, kind)?, 0)?;
    Array::cast(heap, heap.addr_at(offset)?)
}

fn integer_field(heap: &Heap, arr: Array, idx: usize) -> Result<u64, Error> {
    arr.get_as::<Integer>(heap, idx)?.value(heap)
}

fn enum_field(heap: &Heap, arr: Array, idx: usize) -> Result<u8, Error> {
    arr.get_as::<Enum>(heap, idx)?.value(heap)
}

fn blob_field(heap: &Heap, arr: Array, idx: usize) -> Result<&[u8], Error> {
    arr.get_as::<ByteBlob>(heap, idx)?.data(heap)
}

record_view! {
    /// Tag and value of a single key parameter.
    KeyParam => KeyParam
}

impl KeyParam {
    /// Build a key parameter. `Bool` tags carry no value; every other tag type needs a value
    /// record of the matching kind.
    pub fn instance(heap: &mut Heap, tag: Tag, value: Option<Addr>) -> Result<Self, Error> {
        let want = match tag_type(tag) {
            TagType::Bool => None,
            TagType::Enum => Some(RecordType::Enum),
            TagType::EnumRep | TagType::Bytes | TagType::Bignum => Some(RecordType::ByteBlob),
            TagType::Uint | TagType::Ulong | TagType::Date => Some(RecordType::Integer),
            TagType::UintRep | TagType::UlongRep => Some(RecordType::Array),
            TagType::Invalid => return Err(km_err!(InvalidTag, "tag {:?} has no type", tag)),
        };
        let mismatch =
            || Error::from(CborError::UnexpectedItem("value", "value matching tag type"));
        let offset = match (want, value) {
            (None, None) => UNSET,
            (Some(kind), Some(addr)) => {
                if heap.kind(addr)? != kind {
                    return Err(mismatch());
                }
                if kind == RecordType::Enum {
                    let et = Enum::cast(heap, addr)?.enum_type(heap)?;
                    if et != EnumType::Any && et != EnumType::for_tag(tag) {
                        return Err(CborError::NonEnumValue.into());
                    }
                }
                addr.offset()
            }
            _ => return Err(mismatch()),
        };
        let addr = heap.instance(RecordType::KeyParam, 6)?;
        let data = heap.payload_mut(addr, RecordType::KeyParam)?;
        data[..4].copy_from_slice(&tag.raw().to_be_bytes());
        write_u16(data, 4, offset)?;
        Ok(Self(addr))
    }

    pub fn tag(&self, heap: &Heap) -> Result<Tag, Error> {
        let data = self.payload(heap)?;
        let raw = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        Tag::from_raw(raw).ok_or_else(|| {
            error!("record: unknown tag {:#010x} in key parameter", raw);
            km_err!(UnknownError, "unknown tag {:#010x}", raw)
        })
    }

    pub fn tag_type(&self, heap: &Heap) -> Result<TagType, Error> {
        Ok(tag_type(self.tag(heap)?))
    }

    /// Address of the value record; `None` for `Bool` tags.
    pub fn value(&self, heap: &Heap) -> Result<Option<Addr>, Error> {
        match read_u16(self.payload(heap)?, 4)? {
            UNSET => Ok(None),
            offset => Ok(Some(heap.addr_at(offset)?)),
        }
    }

    fn value_as<T: Record>(&self, heap: &Heap) -> Result<T, Error> {
        match self.value(heap)? {
            Some(addr) => T::cast(heap, addr),
            None => Err(km_err!(InvalidTag, "key parameter has no value")),
        }
    }

    pub fn as_enum(&self, heap: &Heap) -> Result<u8, Error> {
        self.value_as::<Enum>(heap)?.value(heap)
    }

    pub fn as_integer(&self, heap: &Heap) -> Result<u64, Error> {
        self.value_as::<Integer>(heap)?.value(heap)
    }

    pub fn as_bytes<'h>(&self, heap: &'h Heap) -> Result<&'h [u8], Error> {
        self.value_as::<ByteBlob>(heap)?.data(heap)
    }

    pub fn as_integer_list(&self, heap: &Heap) -> Result<Vec<u64>, Error> {
        let arr = self.value_as::<Array>(heap)?;
        let len = arr.len(heap)?;
        let mut vals = Vec::new();
        vals.try_reserve(len).map_err(|_e| Error::Alloc("integer list"))?;
        for idx in 0..len {
            vals.push(integer_field(heap, arr, idx)?);
        }
        Ok(vals)
    }

    /// Copy the parameter out of the arena.
    pub fn to_wire(&self, heap: &Heap) -> Result<keymint::KeyParam, Error> {
        let tag = self.tag(heap)?;
        let value = match tag_type(tag) {
            TagType::Bool => KeyParamValue::True,
            TagType::Enum => KeyParamValue::Enum(self.as_enum(heap)?),
            TagType::EnumRep => {
                KeyParamValue::EnumList(crate::vec_try![from self.as_bytes(heap)?]?)
            }
            TagType::Uint | TagType::Ulong | TagType::Date => {
                KeyParamValue::Integer(self.as_integer(heap)?)
            }
            TagType::UintRep | TagType::UlongRep => {
                KeyParamValue::IntegerList(self.as_integer_list(heap)?)
            }
            TagType::Bytes | TagType::Bignum => {
                KeyParamValue::Blob(crate::vec_try![from self.as_bytes(heap)?]?)
            }
            TagType::Invalid => return Err(km_err!(InvalidTag, "tag {:?} has no type", tag)),
        };
        Ok(keymint::KeyParam { tag, value })
    }

    /// Build a key parameter record from its plain form.
    pub fn from_wire(heap: &mut Heap, param: &keymint::KeyParam) -> Result<Self, Error> {
        let value = match &param.value {
            KeyParamValue::True => None,
            KeyParamValue::Enum(v) => {
                Some(Enum::instance(heap, EnumType::for_tag(param.tag), *v)?.addr())
            }
            KeyParamValue::EnumList(v) | KeyParamValue::Blob(v) => {
                Some(ByteBlob::from_slice(heap, v)?.addr())
            }
            KeyParamValue::Integer(v) => Some(Integer::from_u64(heap, *v)?.addr()),
            KeyParamValue::IntegerList(vals) => {
                let arr = Array::instance(heap, vals.len())?;
                for (idx, v) in vals.iter().enumerate() {
                    let item = Integer::from_u64(heap, *v)?;
                    arr.add(heap, idx, item.addr())?;
                }
                Some(arr.addr())
            }
        };
        Self::instance(heap, param.tag, value)
    }
}

record_view! {
    /// Ordered collection of key parameters, encoded as a map.
    KeyParams => KeyParams
}

impl KeyParams {
    /// Wrap an array whose elements are (or will be) [`KeyParam`] records.
    pub fn instance(heap: &mut Heap, params: Array) -> Result<Self, Error> {
        let addr = heap.instance(RecordType::KeyParams, 2)?;
        write_u16(heap.payload_mut(addr, RecordType::KeyParams)?, 0, params.addr().offset())?;
        Ok(Self(addr))
    }

    /// Build an empty parameter list.
    pub fn empty(heap: &mut Heap) -> Result<Self, Error> {
        let arr = Array::instance(heap, 0)?;
        Self::instance(heap, arr)
    }

    pub fn array(&self, heap: &Heap) -> Result<Array, Error> {
        wrapped_array(heap, self.0, RecordType::KeyParams)
    }

    pub fn len(&self, heap: &Heap) -> Result<usize, Error> {
        self.array(heap)?.len(heap)
    }

    pub fn get(&self, heap: &Heap, idx: usize) -> Result<KeyParam, Error> {
        self.array(heap)?.get_as::<KeyParam>(heap, idx)
    }

    /// Return the first parameter carrying `tag`.
    pub fn find(&self, heap: &Heap, tag: Tag) -> Result<Option<KeyParam>, Error> {
        let arr = self.array(heap)?;
        for idx in 0..arr.len(heap)? {
            let param = arr.get_as::<KeyParam>(heap, idx)?;
            if param.tag(heap)? == tag {
                return Ok(Some(param));
            }
        }
        Ok(None)
    }

    pub fn get_enum(&self, heap: &Heap, tag: Tag) -> Result<Option<u8>, Error> {
        match self.find(heap, tag)? {
            Some(p) => Ok(Some(p.as_enum(heap)?)),
            None => Ok(None),
        }
    }

    pub fn get_integer(&self, heap: &Heap, tag: Tag) -> Result<Option<u64>, Error> {
        match self.find(heap, tag)? {
            Some(p) => Ok(Some(p.as_integer(heap)?)),
            None => Ok(None),
        }
    }

    pub fn get_bytes<'h>(&self, heap: &'h Heap, tag: Tag) -> Result<Option<&'h [u8]>, Error> {
        match self.find(heap, tag)? {
            Some(p) => Ok(Some(p.as_bytes(heap)?)),
            None => Ok(None),
        }
    }

    pub fn has_bool(&self, heap: &Heap, tag: Tag) -> Result<bool, Error> {
        Ok(tag_type(tag) == TagType::Bool && self.find(heap, tag)?.is_some())
    }

    pub fn to_wire(&self, heap: &Heap) -> Result<keymint::KeyParams, Error> {
        let arr = self.array(heap)?;
        let len = arr.len(heap)?;
        let mut params = Vec::new();
        params.try_reserve(len).map_err(|_e| Error::Alloc("key parameters"))?;
        for idx in 0..len {
            params.push(arr.get_as::<KeyParam>(heap, idx)?.to_wire(heap)?);
        }
        Ok(keymint::KeyParams(params))
    }

    pub fn from_wire(heap: &mut Heap, params: &keymint::KeyParams) -> Result<Self, Error> {
        let arr = Array::instance(heap, params.0.len())?;
        for (idx, param) in params.0.iter().enumerate() {
            let p = KeyParam::from_wire(heap, param)?;
            arr.add(heap, idx, p.addr())?;
        }
        Self::instance(heap, arr)
    }
}

record_view! {
    /// Key characteristics split by enforcing security level.
    KeyChars => KeyChars
}

impl KeyChars {
    /// Wrap an array of three [`KeyParams`]: strongbox, TEE and keystore enforced.
    pub fn instance(heap: &mut Heap, arr: Array) -> Result<Self, Error> {
        Ok(Self(wrap_array(heap, RecordType::KeyChars, arr, 3)?))
    }

    pub fn from_params(
        heap: &mut Heap,
        strongbox: KeyParams,
        tee: KeyParams,
        keystore: KeyParams,
    ) -> Result<Self, Error> {
        let arr = Array::from_addrs(heap, &[strongbox.addr(), tee.addr(), keystore.addr()])?;
        Self::instance(heap, arr)
    }

    pub fn array(&self, heap: &Heap) -> Result<Array, Error> {
        wrapped_array(heap, self.0, RecordType::KeyChars)
    }

    pub fn strongbox_enforced(&self, heap: &Heap) -> Result<KeyParams, Error> {
        self.array(heap)?.get_as(heap, 0)
    }

    pub fn tee_enforced(&self, heap: &Heap) -> Result<KeyParams, Error> {
        self.array(heap)?.get_as(heap, 1)
    }

    pub fn keystore_enforced(&self, heap: &Heap) -> Result<KeyParams, Error> {
        self.array(heap)?.get_as(heap, 2)
    }
}

record_view! {
    /// Hardware authentication token.
    HwAuthToken => HwAuthToken
}

impl HwAuthToken {
    /// Wrap an array of [challenge, user id, authenticator id, authenticator type, timestamp,
    /// mac].
    pub fn instance(heap: &mut Heap, arr: Array) -> Result<Self, Error> {
        Ok(Self(wrap_array(heap, RecordType::HwAuthToken, arr, 6)?))
    }

    pub fn array(&self, heap: &Heap) -> Result<Array, Error> {
        wrapped_array(heap, self.0, RecordType::HwAuthToken)
    }

    pub fn challenge(&self, heap: &Heap) -> Result<u64, Error> {
        integer_field(heap, self.array(heap)?, 0)
    }

    pub fn user_id(&self, heap: &Heap) -> Result<u64, Error> {
        integer_field(heap, self.array(heap)?, 1)
    }

    pub fn authenticator_id(&self, heap: &Heap) -> Result<u64, Error> {
        integer_field(heap, self.array(heap)?, 2)
    }

    pub fn authenticator_type(&self, heap: &Heap) -> Result<u8, Error> {
        enum_field(heap, self.array(heap)?, 3)
    }

    pub fn timestamp(&self, heap: &Heap) -> Result<u64, Error> {
        integer_field(heap, self.array(heap)?, 4)
    }

    pub fn mac<'h>(&self, heap: &'h Heap) -> Result<&'h [u8], Error> {
        blob_field(heap, self.array(heap)?, 5)
    }

    pub fn from_wire(heap: &mut Heap, token: &keymint::HardwareAuthToken) -> Result<Self, Error> {
        let items = [
            Integer::from_u64(heap, token.challenge)?.addr(),
            Integer::from_u64(heap, token.user_id)?.addr(),
            Integer::from_u64(heap, token.authenticator_id)?.addr(),
            Enum::instance(heap, EnumType::UserAuthType, token.authenticator_type as u8)?.addr(),
            Integer::from_u64(heap, token.timestamp)?.addr(),
            ByteBlob::from_slice(heap, &token.mac)?.addr(),
        ];
        let arr = Array::from_addrs(heap, &items)?;
        Self::instance(heap, arr)
    }

    pub fn to_wire(&self, heap: &Heap) -> Result<keymint::HardwareAuthToken, Error> {
        let auth_type = self.authenticator_type(heap)?;
        Ok(keymint::HardwareAuthToken {
            challenge: self.challenge(heap)?,
            user_id: self.user_id(heap)?,
            authenticator_id: self.authenticator_id(heap)?,
            authenticator_type: HardwareAuthenticatorType::n(auth_type as i32)
                .ok_or(CborError::NonEnumValue)?,
            timestamp: self.timestamp(heap)?,
            mac: crate::vec_try![from self.mac(heap)?]?,
        })
    }
}

record_view! {
    /// Verification token issued by a peer secure environment.
    VerificationToken => VerificationToken
}

impl VerificationToken {
    /// Wrap an array of [challenge, timestamp, parameters verified, security level, mac].
    pub fn instance(heap: &mut Heap, arr: Array) -> Result<Self, Error> {
        Ok(Self(wrap_array(heap, RecordType::VerificationToken, arr, 5)?))
    }

    pub fn array(&self, heap: &Heap) -> Result<Array, Error> {
        wrapped_array(heap, self.0, RecordType::VerificationToken)
    }

    pub fn challenge(&self, heap: &Heap) -> Result<u64, Error> {
        integer_field(heap, self.array(heap)?, 0)
    }

    pub fn timestamp(&self, heap: &Heap) -> Result<u64, Error> {
        integer_field(heap, self.array(heap)?, 1)
    }

    pub fn parameters_verified(&self, heap: &Heap) -> Result<KeyParams, Error> {
        self.array(heap)?.get_as(heap, 2)
    }

    pub fn security_level(&self, heap: &Heap) -> Result<u8, Error> {
        enum_field(heap, self.array(heap)?, 3)
    }

    pub fn mac<'h>(&self, heap: &'h Heap) -> Result<&'h [u8], Error> {
        blob_field(heap, self.array(heap)?, 4)
    }

    pub fn from_wire(heap: &mut Heap, token: &keymint::VerificationToken) -> Result<Self, Error> {
        let items = [
            Integer::from_u64(heap, token.challenge)?.addr(),
            Integer::from_u64(heap, token.timestamp)?.addr(),
            KeyParams::from_wire(heap, &token.parameters_verified)?.addr(),
            Enum::instance(heap, EnumType::SecurityLevel, token.security_level as u8)?.addr(),
            ByteBlob::from_slice(heap, &token.mac)?.addr(),
        ];
        let arr = Array::from_addrs(heap, &items)?;
        Self::instance(heap, arr)
    }

    pub fn to_wire(&self, heap: &Heap) -> Result<keymint::VerificationToken, Error> {
        let level = self.security_level(heap)?;
        Ok(keymint::VerificationToken {
            challenge: self.challenge(heap)?,
            timestamp: self.timestamp(heap)?,
            parameters_verified: self.parameters_verified(heap)?.to_wire(heap)?,
            security_level: SecurityLevel::n(level as i32).ok_or(CborError::NonEnumValue)?,
            mac: crate::vec_try![from self.mac(heap)?]?,
        })
    }
}

record_view! {
    /// Seed and nonce contributed to HMAC key agreement.
    HmacSharingParams => HmacSharingParams
}

impl HmacSharingParams {
    /// Wrap an array of [seed, nonce].
    pub fn instance(heap: &mut Heap, arr: Array) -> Result<Self, Error> {
        Ok(Self(wrap_array(heap, RecordType::HmacSharingParams, arr, 2)?))
    }

    pub fn from_parts(heap: &mut Heap, seed: &[u8], nonce: &[u8]) -> Result<Self, Error> {
        let items =
            [ByteBlob::from_slice(heap, seed)?.addr(), ByteBlob::from_slice(heap, nonce)?.addr()];
        let arr = Array::from_addrs(heap, &items)?;
        Self::instance(heap, arr)
    }

    pub fn array(&self, heap: &Heap) -> Result<Array, Error> {
        wrapped_array(heap, self.0, RecordType::HmacSharingParams)
    }

    pub fn seed<'h>(&self, heap: &'h Heap) -> Result<&'h [u8], Error> {
        blob_field(heap, self.array(heap)?, 0)
    }

    pub fn nonce<'h>(&self, heap: &'h Heap) -> Result<&'h [u8], Error> {
        blob_field(heap, self.array(heap)?, 1)
    }
}
