//! CBOR to record graph, guided by a [`Template`].

use super::{
    major_name, Template, AI_EIGHT_BYTES, AI_FOUR_BYTES, AI_INDEFINITE, AI_ONE_BYTE,
    AI_TWO_BYTES, HMAC_SHARING_FIELDS, HW_AUTH_TOKEN_FIELDS, KEY_CHARS_FIELDS, MAJOR_ARRAY,
    MAJOR_BSTR, MAJOR_MAP, MAJOR_NINT, MAJOR_SIMPLE, MAJOR_TSTR, MAJOR_UINT,
    VERIFICATION_TOKEN_FIELDS,
};
use crate::cose::{label_value, CoseHeaders, CoseKey, CoseKeyPair, LabelScope, LabelValue};
use crate::heap::{Addr, Heap};
use crate::record::{
    Array, ByteBlob, Enum, EnumType, HmacSharingParams, HwAuthToken, Integer, KeyChars,
    KeyParam, KeyParams, Map, NegInteger, Record, Simple, TextString, VerificationToken,
};
use crate::wire::keymint::{tag_type, Tag, TagType};
use crate::wire::EndOfFile;
use crate::{cbor, km_err, CborError, Error};
use alloc::vec::Vec;
use log::error;

/// Default depth of the decoder work stack.
pub const DECODER_STACK_SIZE: usize = 32;

/// Where a freshly decoded record gets attached.
#[derive(Clone, Copy, Debug)]
enum Dest {
    Root,
    Element { arr: Array, idx: usize },
    MapKey { map: Map, idx: usize },
    MapValue { map: Map, idx: usize },
    /// Value of key parameter `idx`; the [`KeyParam`] is built once the value exists.
    ParamValue { arr: Array, idx: usize, tag: Tag },
    /// Value of COSE pair `idx`; the [`CoseKeyPair`] is built (and checked) once the value exists.
    PairValue { arr: Array, idx: usize, key: Addr, scope: LabelScope },
}

/// Pending decode work.
#[derive(Clone, Copy, Debug)]
enum Work<'t> {
    /// Decode one item matching `tmpl` and attach it to `dest`.
    Item { tmpl: &'t Template, dest: Dest },
    /// Remaining fields of a fixed-layout array.
    Elements { fields: &'t [Template], arr: Array, idx: usize },
    /// Remaining elements of a variable-length array.
    Repeat { tmpl: &'t Template, arr: Array, idx: usize },
    /// Remaining entries of a generic map.
    MapEntries { key: &'t Template, value: &'t Template, map: Map, idx: usize },
    /// Remaining entries of a key parameter map.
    KeyParamEntries { arr: Array, idx: usize },
    /// Remaining entries of a COSE key or header map.
    CosePairs { arr: Array, idx: usize, scope: LabelScope },
}

fn eof() -> CborError {
    CborError::DecodeFailed(cbor::de::Error::Io(EndOfFile))
}

/// Cursor over the input bytes.
struct Input<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Input<'a> {
    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], CborError> {
        if len > self.remaining() {
            return Err(eof());
        }
        let out = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn be_uint(&mut self, len: usize) -> Result<u64, CborError> {
        Ok(self.take(len)?.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64))
    }

    /// Read an item header, returning the major type and its argument (or, for major type 7,
    /// the additional-information value).
    fn header(&mut self) -> Result<(u8, u64), CborError> {
        let initial = self.take(1)?[0];
        let major = initial >> 5;
        let ai = initial & 0x1f;
        if major == MAJOR_SIMPLE {
            return match ai {
                0..=23 => Ok((major, ai as u64)),
                AI_TWO_BYTES | AI_FOUR_BYTES | AI_EIGHT_BYTES => {
                    Err(CborError::UnexpectedItem("float", "non-float"))
                }
                _ => Err(CborError::UnexpectedItem("extended simple", "simple value < 24")),
            };
        }
        let arg = match ai {
            0..=23 => ai as u64,
            AI_ONE_BYTE => self.be_uint(1)?,
            AI_TWO_BYTES => self.be_uint(2)?,
            AI_FOUR_BYTES => self.be_uint(4)?,
            AI_EIGHT_BYTES => self.be_uint(8)?,
            AI_INDEFINITE => {
                return Err(CborError::UnexpectedItem("indefinite length", "definite length"))
            }
            _ => return Err(CborError::UnexpectedItem("reserved info", "valid header")),
        };
        if major == super::MAJOR_TAG {
            return Err(CborError::UnexpectedItem("tag", "untagged item"));
        }
        Ok((major, arg))
    }

    /// Read a header that must have the given major type.
    fn expect(&mut self, want: u8) -> Result<u64, CborError> {
        let (major, arg) = self.header()?;
        if major != want {
            return Err(CborError::UnexpectedItem(major_name(major), major_name(want)));
        }
        Ok(arg)
    }

    /// Read a length argument, rejecting counts the remaining input could never satisfy.
    fn count(&mut self, want: u8) -> Result<usize, CborError> {
        let arg = self.expect(want)?;
        if arg > self.remaining() as u64 {
            return Err(eof());
        }
        Ok(arg as usize)
    }

    /// Read an integer of either sign.
    fn int(&mut self) -> Result<i64, CborError> {
        let (major, arg) = self.header()?;
        let value = i64::try_from(arg)?;
        match major {
            MAJOR_UINT => Ok(value),
            MAJOR_NINT => Ok(!value),
            _ => Err(CborError::UnexpectedItem(major_name(major), "int")),
        }
    }
}

/// Bounded LIFO of pending work.
struct Stack<'t> {
    items: Vec<Work<'t>>,
    limit: usize,
}

impl<'t> Stack<'t> {
    fn push(&mut self, work: Work<'t>) -> Result<(), CborError> {
        if self.items.len() >= self.limit {
            return Err(CborError::NestingTooDeep);
        }
        self.items.push(work);
        Ok(())
    }
}

/// Template to use for the value of a key parameter with the given tag.
fn param_template(tag: Tag) -> Result<&'static Template, CborError> {
    Ok(match tag_type(tag) {
        TagType::Enum => match EnumType::for_tag(tag) {
            EnumType::Algorithm => &Template::Enum(EnumType::Algorithm),
            EnumType::EcCurve => &Template::Enum(EnumType::EcCurve),
            EnumType::SecurityLevel => &Template::Enum(EnumType::SecurityLevel),
            EnumType::UserAuthType => &Template::Enum(EnumType::UserAuthType),
            EnumType::Origin => &Template::Enum(EnumType::Origin),
            _ => &Template::Enum(EnumType::Any),
        },
        TagType::EnumRep | TagType::Bytes | TagType::Bignum => &Template::ByteBlob,
        TagType::Uint | TagType::Ulong | TagType::Date => &Template::Integer,
        TagType::UintRep | TagType::UlongRep => &Template::ArrayOf(&Template::Integer),
        TagType::Bool | TagType::Invalid => {
            return Err(CborError::UnexpectedItem("tag without value template", "valued tag"))
        }
    })
}

/// Template to use for the value under a COSE label.
fn pair_template(label: i64, scope: LabelScope) -> Result<&'static Template, CborError> {
    match label_value(label, scope) {
        Some(LabelValue::Int(_)) => Ok(&Template::Int),
        Some(LabelValue::Bytes) => Ok(&Template::ByteBlob),
        Some(LabelValue::Null) => Ok(&Template::Simple),
        Some(LabelValue::Key) => Ok(&Template::CoseKey),
        None => Err(CborError::UnexpectedItem("unknown COSE label", "known COSE label")),
    }
}

/// Parses CBOR into arena records.
#[derive(Clone, Debug)]
pub struct Decoder {
    stack_size: usize,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    pub fn new() -> Self {
        Self::with_stack_size(DECODER_STACK_SIZE)
    }

    pub fn with_stack_size(stack_size: usize) -> Self {
        Self { stack_size }
    }

    /// Decode the whole of `data` against `tmpl`.
    pub fn decode(&self, heap: &mut Heap, tmpl: &Template, data: &[u8]) -> Result<Addr, Error> {
        let (root, consumed) = self.decode_partial(heap, tmpl, data)?;
        if consumed != data.len() {
            return Err(CborError::ExtraneousData.into());
        }
        Ok(root)
    }

    /// Decode the leading item of `data` against `tmpl`, returning the root record and the
    /// number of bytes consumed.
    pub fn decode_partial(
        &self,
        heap: &mut Heap,
        tmpl: &Template,
        data: &[u8],
    ) -> Result<(Addr, usize), Error> {
        let mut input = Input { data, pos: 0 };
        let mut items = Vec::new();
        items.try_reserve(self.stack_size).map_err(|_e| Error::Alloc("decoder stack"))?;
        let mut stack = Stack { items, limit: self.stack_size };
        let mut root = None;
        stack.push(Work::Item { tmpl, dest: Dest::Root })?;

        while let Some(work) = stack.items.pop() {
            match work {
                Work::Item { tmpl, dest } => {
                    let addr = self.item(heap, &mut input, &mut stack, tmpl)?;
                    if let Dest::Root = dest {
                        root = Some(addr);
                    } else {
                        attach(heap, dest, addr)?;
                    }
                }
                Work::Elements { fields, arr, idx } => {
                    if idx < fields.len() {
                        stack.push(Work::Elements { fields, arr, idx: idx + 1 })?;
                        let dest = Dest::Element { arr, idx };
                        stack.push(Work::Item { tmpl: &fields[idx], dest })?;
                    }
                }
                Work::Repeat { tmpl, arr, idx } => {
                    if idx < arr.len(heap)? {
                        stack.push(Work::Repeat { tmpl, arr, idx: idx + 1 })?;
                        stack.push(Work::Item { tmpl, dest: Dest::Element { arr, idx } })?;
                    }
                }
                Work::MapEntries { key, value, map, idx } => {
                    if idx < map.len(heap)? {
                        stack.push(Work::MapEntries { key, value, map, idx: idx + 1 })?;
                        let (key_dest, value_dest) =
                            (Dest::MapKey { map, idx }, Dest::MapValue { map, idx });
                        stack.push(Work::Item { tmpl: value, dest: value_dest })?;
                        stack.push(Work::Item { tmpl: key, dest: key_dest })?;
                    }
                }
                Work::KeyParamEntries { arr, idx } => {
                    if idx < arr.len(heap)? {
                        stack.push(Work::KeyParamEntries { arr, idx: idx + 1 })?;
                        let raw = input.expect(MAJOR_UINT)?;
                        let raw = u32::try_from(raw).map_err(CborError::from)?;
                        let tag = Tag::from_raw(raw).ok_or(CborError::NonEnumValue)?;
                        if tag_type(tag) == TagType::Bool {
                            if input.expect(MAJOR_UINT)? != 1 {
                                return Err(
                                    CborError::UnexpectedItem("bool tag value", "1").into()
                                );
                            }
                            let param = KeyParam::instance(heap, tag, None)?;
                            arr.add(heap, idx, param.addr())?;
                        } else {
                            let tmpl = param_template(tag)?;
                            let dest = Dest::ParamValue { arr, idx, tag };
                            stack.push(Work::Item { tmpl, dest })?;
                        }
                    }
                }
                Work::CosePairs { arr, idx, scope } => {
                    if idx < arr.len(heap)? {
                        stack.push(Work::CosePairs { arr, idx: idx + 1, scope })?;
                        let label = input.int()?;
                        let tmpl = pair_template(label, scope)?;
                        let key = crate::cose::int_record(heap, label)?;
                        stack.push(Work::Item {
                            tmpl,
                            dest: Dest::PairValue { arr, idx, key, scope },
                        })?;
                    }
                }
            }
        }
        match root {
            Some(addr) => Ok((addr, input.pos)),
            None => {
                error!("decoder: work stack drained without a root");
                Err(km_err!(UnknownError, "decode produced no root record"))
            }
        }
    }

    /// Decode a single item's header (and, for scalars, its content), creating its record and
    /// scheduling work for any children.
    fn item<'t>(
        &self,
        heap: &mut Heap,
        input: &mut Input,
        stack: &mut Stack<'t>,
        tmpl: &'t Template,
    ) -> Result<Addr, Error> {
        let addr = match tmpl {
            Template::ByteBlob => {
                let len = input.count(MAJOR_BSTR)?;
                ByteBlob::from_slice(heap, input.take(len)?)?.addr()
            }
            Template::TextString => {
                let len = input.count(MAJOR_TSTR)?;
                let text = core::str::from_utf8(input.take(len)?)
                    .map_err(|_e| CborError::UnexpectedItem("invalid utf-8", "tstr"))?;
                TextString::from_text(heap, text)?.addr()
            }
            Template::Integer => uint_record(heap, input.expect(MAJOR_UINT)?)?,
            Template::NegInteger => {
                let arg = input.expect(MAJOR_NINT)?;
                let value = !i64::try_from(arg).map_err(CborError::from)?;
                NegInteger::from_i64(heap, value)?.addr()
            }
            Template::Int => match input.int()? {
                v if v < 0 => NegInteger::from_i64(heap, v)?.addr(),
                v => uint_record(heap, v as u64)?,
            },
            Template::Simple => {
                let value = input.expect(MAJOR_SIMPLE)?;
                Simple::instance(heap, value as u8)?.addr()
            }
            Template::Enum(enum_type) => {
                let value = u8::try_from(input.expect(MAJOR_UINT)?).map_err(CborError::from)?;
                Enum::instance(heap, *enum_type, value)?.addr()
            }
            Template::Array(fields) => {
                let arr = fixed_array(heap, input, fields.len())?;
                stack.push(Work::Elements { fields: *fields, arr, idx: 0 })?;
                arr.addr()
            }
            Template::ArrayOf(elem) => {
                let len = input.count(MAJOR_ARRAY)?;
                let arr = Array::instance(heap, len)?;
                stack.push(Work::Repeat { tmpl: *elem, arr, idx: 0 })?;
                arr.addr()
            }
            Template::Map(key, value) => {
                let len = input.count(MAJOR_MAP)?;
                let map = Map::instance(heap, len)?;
                stack.push(Work::MapEntries { key: *key, value: *value, map, idx: 0 })?;
                map.addr()
            }
            Template::KeyParams => {
                let len = input.count(MAJOR_MAP)?;
                let arr = Array::instance(heap, len)?;
                stack.push(Work::KeyParamEntries { arr, idx: 0 })?;
                KeyParams::instance(heap, arr)?.addr()
            }
            Template::KeyChars => {
                let arr = fixed_array(heap, input, KEY_CHARS_FIELDS.len())?;
                stack.push(Work::Elements { fields: KEY_CHARS_FIELDS, arr, idx: 0 })?;
                KeyChars::instance(heap, arr)?.addr()
            }
            Template::HwAuthToken => {
                let arr = fixed_array(heap, input, HW_AUTH_TOKEN_FIELDS.len())?;
                stack.push(Work::Elements { fields: HW_AUTH_TOKEN_FIELDS, arr, idx: 0 })?;
                HwAuthToken::instance(heap, arr)?.addr()
            }
            Template::VerificationToken => {
                let arr = fixed_array(heap, input, VERIFICATION_TOKEN_FIELDS.len())?;
                let fields = VERIFICATION_TOKEN_FIELDS;
                stack.push(Work::Elements { fields, arr, idx: 0 })?;
                VerificationToken::instance(heap, arr)?.addr()
            }
            Template::HmacSharingParams => {
                let arr = fixed_array(heap, input, HMAC_SHARING_FIELDS.len())?;
                stack.push(Work::Elements { fields: HMAC_SHARING_FIELDS, arr, idx: 0 })?;
                HmacSharingParams::instance(heap, arr)?.addr()
            }
            Template::CoseKey => {
                let len = input.count(MAJOR_MAP)?;
                let arr = Array::instance(heap, len)?;
                stack.push(Work::CosePairs { arr, idx: 0, scope: LabelScope::Key })?;
                CoseKey::instance(heap, arr)?.addr()
            }
            Template::CoseHeaders => {
                let len = input.count(MAJOR_MAP)?;
                let arr = Array::instance(heap, len)?;
                stack.push(Work::CosePairs { arr, idx: 0, scope: LabelScope::Header })?;
                CoseHeaders::instance(heap, arr)?.addr()
            }
        };
        Ok(addr)
    }
}

fn uint_record(heap: &mut Heap, value: u64) -> Result<Addr, Error> {
    match u32::try_from(value) {
        Ok(v) => Ok(Integer::from_u32(heap, v)?.addr()),
        Err(_) => Ok(Integer::from_u64(heap, value)?.addr()),
    }
}

/// Read an array header of exactly `arity` elements and allocate the array.
fn fixed_array(heap: &mut Heap, input: &mut Input, arity: usize) -> Result<Array, Error> {
    let len = input.count(MAJOR_ARRAY)?;
    if len != arity {
        return Err(CborError::UnexpectedItem("array of other length", "fixed length array").into());
    }
    Array::instance(heap, len)
}

fn attach(heap: &mut Heap, dest: Dest, addr: Addr) -> Result<(), Error> {
    match dest {
        Dest::Root => Ok(()),
        Dest::Element { arr, idx } => arr.add(heap, idx, addr),
        Dest::MapKey { map, idx } => map.set_key(heap, idx, addr),
        Dest::MapValue { map, idx } => map.set_value(heap, idx, addr),
        Dest::ParamValue { arr, idx, tag } => {
            let param = KeyParam::instance(heap, tag, Some(addr))?;
            arr.add(heap, idx, param.addr())
        }
        Dest::PairValue { arr, idx, key, scope } => {
            let pair = CoseKeyPair::instance(heap, key, addr, scope)?;
            arr.add(heap, idx, pair.addr())
        }
    }
}
