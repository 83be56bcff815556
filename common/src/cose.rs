//! COSE keys, header buckets and message structures held as arena records.
//!
//! Only the labels and values the applet actually exchanges are accepted; anything else is
//! rejected when a [`CoseKeyPair`] is built, which is also the point at which decoded input is
//! checked.

use crate::heap::{Addr, Heap};
use crate::record::{
    read_u16, record_view, write_u16, Array, ByteBlob, Integer, Map, NegInteger, Record,
    RecordType, Simple, TextString, View,
};
use crate::{km_err, CborError, Error};
use alloc::vec::Vec;
use coset::iana;
use log::error;


/// Private label marking a COSE key as a test-mode key; its value is always null.
pub const COSE_TEST_KEY_LABEL: i64 = -70000;

/// Context string of the MAC0 structure.
pub const MAC_CONTEXT: &str = "MAC0";
/// Context string of the Signature1 structure.
pub const SIGNATURE_CONTEXT: &str = "Signature1";
/// Context string of the Encrypt structure.
pub const ENCRYPT_CONTEXT: &str = "Encrypt";

/// Label namespace for a [`CoseKeyPair`]: the same integer means different things in a key and
/// in a header map.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LabelScope {
    Key,
    Header,
}

/// Kind of value a label carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LabelValue {
    /// Integer drawn from a fixed set.
    Int(&'static [i64]),
    Bytes,
    /// The simple value `null`.
    Null,
    /// A nested COSE key.
    Key,
}

const ALGORITHMS: &[i64] = &[
    iana::Algorithm::A256GCM as i64,
    iana::Algorithm::HMAC_256_256 as i64,
    iana::Algorithm::ECDH_ES_HKDF_256 as i64,
    iana::Algorithm::ES256 as i64,
];
const KEY_TYPES: &[i64] = &[iana::KeyType::EC2 as i64, iana::KeyType::Symmetric as i64];
const KEY_OPS: &[i64] = &[
    iana::KeyOperation::Sign as i64,
    iana::KeyOperation::Verify as i64,
    iana::KeyOperation::Encrypt as i64,
    iana::KeyOperation::Decrypt as i64,
];
const CURVES: &[i64] = &[iana::EllipticCurve::P_256 as i64];

/// Return the kind of value allowed for `label` in `scope`, or `None` if the label is not
/// accepted.
pub(crate) fn label_value(label: i64, scope: LabelScope) -> Option<LabelValue> {
    match scope {
        LabelScope::Key => match label {
            l if l == iana::KeyParameter::Kty as i64 => Some(LabelValue::Int(KEY_TYPES)),
            l if l == iana::KeyParameter::Kid as i64 => Some(LabelValue::Bytes),
            l if l == iana::KeyParameter::Alg as i64 => Some(LabelValue::Int(ALGORITHMS)),
            l if l == iana::KeyParameter::KeyOps as i64 => Some(LabelValue::Int(KEY_OPS)),
            l if l == iana::Ec2KeyParameter::Crv as i64 => Some(LabelValue::Int(CURVES)),
            l if l == iana::Ec2KeyParameter::X as i64
                || l == iana::Ec2KeyParameter::Y as i64
                || l == iana::Ec2KeyParameter::D as i64 =>
            {
                Some(LabelValue::Bytes)
            }
            COSE_TEST_KEY_LABEL => Some(LabelValue::Null),
            _ => None,
        },
        LabelScope::Header => match label {
            l if l == iana::HeaderParameter::Alg as i64 => Some(LabelValue::Int(ALGORITHMS)),
            l if l == iana::HeaderParameter::Kid as i64
                || l == iana::HeaderParameter::Iv as i64 =>
            {
                Some(LabelValue::Bytes)
            }
            l if l == iana::HeaderAlgorithmParameter::EphemeralKey as i64 => Some(LabelValue::Key),
            _ => None,
        },
    }
}

/// Build an integer record of whichever sign `value` has.
pub fn int_record(heap: &mut Heap, value: i64) -> Result<Addr, Error> {
    if value < 0 {
        Ok(NegInteger::from_i64(heap, value)?.addr())
    } else if value <= u32::MAX as i64 {
        Ok(Integer::from_u32(heap, value as u32)?.addr())
    } else {
        Ok(Integer::from_u64(heap, value as u64)?.addr())
    }
}

/// Read an integer record of either sign.
pub fn int_value(heap: &Heap, addr: Addr) -> Result<i64, Error> {
    match View::of(heap, addr)? {
        View::Integer(i) => Ok(i64::try_from(i.value(heap)?).map_err(CborError::from)?),
        View::NegInteger(n) => n.value(heap),
        _ => Err(CborError::UnexpectedItem("non-int", "int").into()),
    }
}

fn check_value(heap: &Heap, label: i64, value: Addr, scope: LabelScope) -> Result<(), Error> {
    let allowed = label_value(label, scope)
        .ok_or(CborError::UnexpectedItem("unknown COSE label", "known COSE label"))?;
    let ok = match (allowed, View::of(heap, value)?) {
        (LabelValue::Int(set), View::Integer(_) | View::NegInteger(_)) => {
            set.contains(&int_value(heap, value)?)
        }
        (LabelValue::Bytes, View::ByteBlob(_)) => true,
        (LabelValue::Null, View::Simple(s)) => s.value(heap)? == Simple::NULL,
        (LabelValue::Key, View::CoseKey(_)) => true,
        _ => false,
    };
    if ok {
        Ok(())
    } else {
        Err(CborError::UnexpectedItem("COSE value", "value permitted for label").into())
    }
}

record_view! {
    /// Single label/value entry of a COSE key or header map.
    CoseKeyPair => CoseKeyPair
}

impl CoseKeyPair {
    /// Build an entry after checking the label and value against the accepted set for `scope`.
    pub fn instance(
        heap: &mut Heap,
        key: Addr,
        value: Addr,
        scope: LabelScope,
    ) -> Result<Self, Error> {
        let label = int_value(heap, key)?;
        check_value(heap, label, value, scope)?;
        let addr = heap.instance(RecordType::CoseKeyPair, 4)?;
        let data = heap.payload_mut(addr, RecordType::CoseKeyPair)?;
        write_u16(data, 0, key.offset())?;
        write_u16(data, 2, value.offset())?;
        Ok(Self(addr))
    }

    pub fn key(&self, heap: &Heap) -> Result<Addr, Error> {
        heap.addr_at(read_u16(self.payload(heap)?, 0)?)
    }

    pub fn label(&self, heap: &Heap) -> Result<i64, Error> {
        int_value(heap, self.key(heap)?)
    }

    pub fn value(&self, heap: &Heap) -> Result<Addr, Error> {
        heap.addr_at(read_u16(self.payload(heap)?, 2)?)
    }
}

fn pairs_array(heap: &Heap, addr: Addr, kind: RecordType) -> Result<Array, Error> {
    let offset = read_u16(heap.payload(addr, kind)?, 0)?;
    Array::cast(heap, heap.addr_at(offset)?)
}

fn wrap_pairs(heap: &mut Heap, kind: RecordType, pairs: Array) -> Result<Addr, Error> {
    let addr = heap.instance(kind, 2)?;
    write_u16(heap.payload_mut(addr, kind)?, 0, pairs.addr().offset())?;
    Ok(addr)
}

/// Find the value stored under `label`.
fn find_label(heap: &Heap, pairs: Array, label: i64) -> Result<Option<Addr>, Error> {
    for idx in 0..pairs.len(heap)? {
        let pair = pairs.get_as::<CoseKeyPair>(heap, idx)?;
        if pair.label(heap)? == label {
            return Ok(Some(pair.value(heap)?));
        }
    }
    Ok(None)
}

fn find_int(heap: &Heap, pairs: Array, label: i64) -> Result<Option<i64>, Error> {
    match find_label(heap, pairs, label)? {
        Some(v) => Ok(Some(int_value(heap, v)?)),
        None => Ok(None),
    }
}

fn find_bytes(heap: &Heap, pairs: Array, label: i64) -> Result<Option<&[u8]>, Error> {
    match find_label(heap, pairs, label)? {
        Some(v) => Ok(Some(ByteBlob::cast(heap, v)?.data(heap)?)),
        None => Ok(None),
    }
}

/// Build a pair list from `(label, value)` entries.
fn build_pairs(
    heap: &mut Heap,
    entries: &[(i64, Addr)],
    scope: LabelScope,
) -> Result<Array, Error> {
    let arr = Array::instance(heap, entries.len())?;
    for (idx, (label, value)) in entries.iter().enumerate() {
        let key = int_record(heap, *label)?;
        let pair = CoseKeyPair::instance(heap, key, *value, scope)?;
        arr.add(heap, idx, pair.addr())?;
    }
    Ok(arr)
}

record_view! {
    /// COSE_Key, held as a list of [`CoseKeyPair`] entries and encoded as a map.
    CoseKey => CoseKey
}

/// Fields used to assemble a [`CoseKey`]; `None` fields are left out.
#[derive(Clone, Debug, Default)]
pub struct CoseKeyFields<'a> {
    pub key_type: i64,
    pub key_id: Option<&'a [u8]>,
    pub algorithm: Option<i64>,
    pub key_op: Option<i64>,
    pub curve: Option<i64>,
    pub x: Option<&'a [u8]>,
    pub y: Option<&'a [u8]>,
    /// Mark the key with the private test-key label.
    pub test_key: bool,
}

impl CoseKey {
    /// Wrap an array whose elements are (or will be) [`CoseKeyPair`] records.
    pub fn instance(heap: &mut Heap, pairs: Array) -> Result<Self, Error> {
        Ok(Self(wrap_pairs(heap, RecordType::CoseKey, pairs)?))
    }

    pub fn array(&self, heap: &Heap) -> Result<Array, Error> {
        pairs_array(heap, self.0, RecordType::CoseKey)
    }

    pub fn len(&self, heap: &Heap) -> Result<usize, Error> {
        self.array(heap)?.len(heap)
    }

    /// Value stored under `label`, if any.
    pub fn get(&self, heap: &Heap, label: i64) -> Result<Option<Addr>, Error> {
        find_label(heap, self.array(heap)?, label)
    }

    pub fn key_type(&self, heap: &Heap) -> Result<Option<i64>, Error> {
        find_int(heap, self.array(heap)?, iana::KeyParameter::Kty as i64)
    }

    pub fn algorithm(&self, heap: &Heap) -> Result<Option<i64>, Error> {
        find_int(heap, self.array(heap)?, iana::KeyParameter::Alg as i64)
    }

    pub fn key_id<'h>(&self, heap: &'h Heap) -> Result<Option<&'h [u8]>, Error> {
        find_bytes(heap, self.array(heap)?, iana::KeyParameter::Kid as i64)
    }

    pub fn curve(&self, heap: &Heap) -> Result<Option<i64>, Error> {
        find_int(heap, self.array(heap)?, iana::Ec2KeyParameter::Crv as i64)
    }

    /// Public key as an uncompressed SEC1 point (`0x04 || x || y`).
    pub fn ec_public_key(&self, heap: &Heap) -> Result<Option<Vec<u8>>, Error> {
        let pairs = self.array(heap)?;
        let x = find_bytes(heap, pairs, iana::Ec2KeyParameter::X as i64)?;
        let y = find_bytes(heap, pairs, iana::Ec2KeyParameter::Y as i64)?;
        match (x, y) {
            (Some(x), Some(y)) => {
                let mut point = Vec::new();
                point.try_reserve(1 + x.len() + y.len()).map_err(|_e| Error::Alloc("ec point"))?;
                point.push(0x04);
                point.extend_from_slice(x);
                point.extend_from_slice(y);
                Ok(Some(point))
            }
            _ => Ok(None),
        }
    }

    pub fn is_test_key(&self, heap: &Heap) -> Result<bool, Error> {
        Ok(self.get(heap, COSE_TEST_KEY_LABEL)?.is_some())
    }

    /// Check that every supplied field is present with the given value.
    pub fn is_data_valid(
        &self,
        heap: &Heap,
        key_type: i64,
        key_id: Option<&[u8]>,
        algorithm: Option<i64>,
        key_op: Option<i64>,
        curve: Option<i64>,
    ) -> Result<bool, Error> {
        let pairs = self.array(heap)?;
        if find_int(heap, pairs, iana::KeyParameter::Kty as i64)? != Some(key_type) {
            return Ok(false);
        }
        if let Some(kid) = key_id {
            if find_bytes(heap, pairs, iana::KeyParameter::Kid as i64)? != Some(kid) {
                return Ok(false);
            }
        }
        let ints = [
            (iana::KeyParameter::Alg as i64, algorithm),
            (iana::KeyParameter::KeyOps as i64, key_op),
            (iana::Ec2KeyParameter::Crv as i64, curve),
        ];
        for (label, want) in ints {
            if want.is_some() && find_int(heap, pairs, label)? != want {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

record_view! {
    /// Protected or unprotected header bucket, encoded as a map.
    CoseHeaders => CoseHeaders
}

impl CoseHeaders {
    pub fn instance(heap: &mut Heap, pairs: Array) -> Result<Self, Error> {
        Ok(Self(wrap_pairs(heap, RecordType::CoseHeaders, pairs)?))
    }

    pub fn array(&self, heap: &Heap) -> Result<Array, Error> {
        pairs_array(heap, self.0, RecordType::CoseHeaders)
    }

    pub fn len(&self, heap: &Heap) -> Result<usize, Error> {
        self.array(heap)?.len(heap)
    }

    pub fn algorithm(&self, heap: &Heap) -> Result<Option<i64>, Error> {
        find_int(heap, self.array(heap)?, iana::HeaderParameter::Alg as i64)
    }

    pub fn key_identifier<'h>(&self, heap: &'h Heap) -> Result<Option<&'h [u8]>, Error> {
        find_bytes(heap, self.array(heap)?, iana::HeaderParameter::Kid as i64)
    }

    pub fn iv<'h>(&self, heap: &'h Heap) -> Result<Option<&'h [u8]>, Error> {
        find_bytes(heap, self.array(heap)?, iana::HeaderParameter::Iv as i64)
    }

    /// Ephemeral COSE key carried in the header, if any.
    pub fn cose_key(&self, heap: &Heap) -> Result<Option<CoseKey>, Error> {
        let label = iana::HeaderAlgorithmParameter::EphemeralKey as i64;
        match find_label(heap, self.array(heap)?, label)? {
            Some(addr) => Ok(Some(CoseKey::cast(heap, addr)?)),
            None => Ok(None),
        }
    }

    /// Check that every supplied field is present with the given value.
    pub fn is_data_valid(
        &self,
        heap: &Heap,
        algorithm: Option<i64>,
        key_id: Option<&[u8]>,
    ) -> Result<bool, Error> {
        if algorithm.is_some() && self.algorithm(heap)? != algorithm {
            return Ok(false);
        }
        if key_id.is_some() && self.key_identifier(heap)? != key_id {
            return Ok(false);
        }
        Ok(true)
    }
}

/// Assemble a COSE key from its fields.
pub fn construct_cose_key(heap: &mut Heap, fields: &CoseKeyFields) -> Result<CoseKey, Error> {
    let mut entries: Vec<(i64, Addr)> = Vec::new();
    entries.try_reserve(8).map_err(|_e| Error::Alloc("cose key entries"))?;
    entries.push((iana::KeyParameter::Kty as i64, int_record(heap, fields.key_type)?));
    if let Some(kid) = fields.key_id {
        entries.push((iana::KeyParameter::Kid as i64, ByteBlob::from_slice(heap, kid)?.addr()));
    }
    if let Some(alg) = fields.algorithm {
        entries.push((iana::KeyParameter::Alg as i64, int_record(heap, alg)?));
    }
    if let Some(op) = fields.key_op {
        entries.push((iana::KeyParameter::KeyOps as i64, int_record(heap, op)?));
    }
    if let Some(crv) = fields.curve {
        entries.push((iana::Ec2KeyParameter::Crv as i64, int_record(heap, crv)?));
    }
    if let Some(x) = fields.x {
        entries.push((iana::Ec2KeyParameter::X as i64, ByteBlob::from_slice(heap, x)?.addr()));
    }
    if let Some(y) = fields.y {
        entries.push((iana::Ec2KeyParameter::Y as i64, ByteBlob::from_slice(heap, y)?.addr()));
    }
    if fields.test_key {
        entries.push((COSE_TEST_KEY_LABEL, Simple::instance(heap, Simple::NULL)?.addr()));
    }
    let pairs = build_pairs(heap, &entries, LabelScope::Key)?;
    CoseKey::instance(heap, pairs)
}

/// Assemble a header bucket; `None` fields are left out.
pub fn construct_headers(
    heap: &mut Heap,
    algorithm: Option<i64>,
    key_id: Option<&[u8]>,
    iv: Option<&[u8]>,
    ephemeral_key: Option<CoseKey>,
) -> Result<CoseHeaders, Error> {
    let mut entries: Vec<(i64, Addr)> = Vec::new();
    entries.try_reserve(4).map_err(|_e| Error::Alloc("cose header entries"))?;
    if let Some(alg) = algorithm {
        entries.push((iana::HeaderParameter::Alg as i64, int_record(heap, alg)?));
    }
    if let Some(kid) = key_id {
        let kid = ByteBlob::from_slice(heap, kid)?.addr();
        entries.push((iana::HeaderParameter::Kid as i64, kid));
    }
    if let Some(iv) = iv {
        let iv = ByteBlob::from_slice(heap, iv)?.addr();
        entries.push((iana::HeaderParameter::Iv as i64, iv));
    }
    if let Some(key) = ephemeral_key {
        entries.push((iana::HeaderAlgorithmParameter::EphemeralKey as i64, key.addr()));
    }
    let pairs = build_pairs(heap, &entries, LabelScope::Header)?;
    CoseHeaders::instance(heap, pairs)
}

fn context_structure(
    heap: &mut Heap,
    context: &str,
    protected: ByteBlob,
    external_aad: ByteBlob,
    payload: Option<ByteBlob>,
) -> Result<Array, Error> {
    let ctx = TextString::from_text(heap, context)?.addr();
    match payload {
        Some(p) => Array::from_addrs(heap, &[ctx, protected.addr(), external_aad.addr(), p.addr()]),
        None => Array::from_addrs(heap, &[ctx, protected.addr(), external_aad.addr()]),
    }
}

/// Build the MAC_structure that is fed to the MAC for a COSE_Mac0.
pub fn mac_structure(
    heap: &mut Heap,
    protected: ByteBlob,
    external_aad: ByteBlob,
    payload: ByteBlob,
) -> Result<Array, Error> {
    context_structure(heap, MAC_CONTEXT, protected, external_aad, Some(payload))
}

/// Build a COSE_Mac0 with an empty unprotected bucket.
pub fn cose_mac0(
    heap: &mut Heap,
    protected: ByteBlob,
    payload: ByteBlob,
    tag: ByteBlob,
) -> Result<Array, Error> {
    let unprotected = Map::instance(heap, 0)?;
    Array::from_addrs(heap, &[protected.addr(), unprotected.addr(), payload.addr(), tag.addr()])
}

/// Build the Sig_structure that is signed for a COSE_Sign1.
pub fn signature_structure(
    heap: &mut Heap,
    protected: ByteBlob,
    external_aad: ByteBlob,
    payload: ByteBlob,
) -> Result<Array, Error> {
    context_structure(heap, SIGNATURE_CONTEXT, protected, external_aad, Some(payload))
}

/// Build a COSE_Sign1. `unprotected` must be a [`CoseHeaders`] or an empty [`Map`].
pub fn cose_sign1(
    heap: &mut Heap,
    protected: ByteBlob,
    unprotected: Addr,
    payload: ByteBlob,
    signature: ByteBlob,
) -> Result<Array, Error> {
    check_bucket(heap, unprotected)?;
    Array::from_addrs(heap, &[protected.addr(), unprotected, payload.addr(), signature.addr()])
}

/// Build the Enc_structure used as AAD for a COSE_Encrypt.
pub fn encrypt_structure(
    heap: &mut Heap,
    protected: ByteBlob,
    external_aad: ByteBlob,
) -> Result<Array, Error> {
    context_structure(heap, ENCRYPT_CONTEXT, protected, external_aad, None)
}

/// Build a COSE_Encrypt with the given recipients array.
pub fn cose_encrypt(
    heap: &mut Heap,
    protected: ByteBlob,
    unprotected: Addr,
    ciphertext: ByteBlob,
    recipients: Array,
) -> Result<Array, Error> {
    check_bucket(heap, unprotected)?;
    Array::from_addrs(
        heap,
        &[protected.addr(), unprotected, ciphertext.addr(), recipients.addr()],
    )
}

/// Build a COSE_recipient.
pub fn cose_recipient(
    heap: &mut Heap,
    protected: ByteBlob,
    unprotected: Addr,
    ciphertext: ByteBlob,
) -> Result<Array, Error> {
    check_bucket(heap, unprotected)?;
    Array::from_addrs(heap, &[protected.addr(), unprotected, ciphertext.addr()])
}

fn check_bucket(heap: &Heap, addr: Addr) -> Result<(), Error> {
    match View::of(heap, addr)? {
        View::CoseHeaders(_) | View::Map(_) => Ok(()),
        other => {
            error!("cose: header bucket is {:?}", other);
            Err(km_err!(UnknownError, "header bucket must be a map"))
        }
    }
}
