//! Local types that are equivalent to those of the KeyMint HAL interfaces, as carried on the
//! applet wire.
//!
//! - Enums are encoded as exhaustive Rust enums backed by `i32`, using Rust naming
//!   conventions (CamelCase values).
//! - Structs have all fields `pub`, using Rust naming conventions (snake_case fields), and encode
//!   as CBOR arrays in field order.
//!
//! Special cases:
//! - `KeyParam` is a (tag, value) pair rather than the KeyMint `KeyParameter` union; a list of
//!   them (`KeyParams`) encodes as a CBOR map keyed by the 32-bit tag value, with repeated tags
//!   grouped into one entry.
//! - `HardwareAuthenticatorType::Any` is carried as a single byte (255).

use crate::{cbor, cbor_type_error, enum_as_cbor, AsCborValue, CborError};
use alloc::vec::Vec;
use enumn::N;

/// Possible verified boot state values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, N)]
#[repr(i32)]
pub enum VerifiedBootState {
    Verified = 0,
    SelfSigned = 1,
    Unverified = 2,
    Failed = 3,
}
enum_as_cbor!(VerifiedBootState);

/// Device lock state reported by the bootloader.
#[derive(Clone, Copy, Debug, PartialEq, Eq, N)]
#[repr(i32)]
pub enum DeviceLockState {
    Unlocked = 0,
    Locked = 1,
}
enum_as_cbor!(DeviceLockState);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, N)]
#[repr(i32)]
pub enum Algorithm {
    Rsa = 1,
    Ec = 3,
    Aes = 32,
    TripleDes = 33,
    Hmac = 128,
}
enum_as_cbor!(Algorithm);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, N)]
#[repr(i32)]
pub enum BlockMode {
    Ecb = 1,
    Cbc = 2,
    Ctr = 3,
    Gcm = 32,
}
enum_as_cbor!(BlockMode);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, N)]
#[repr(i32)]
pub enum Digest {
    None = 0,
    Md5 = 1,
    Sha1 = 2,
    Sha224 = 3,
    Sha256 = 4,
    Sha384 = 5,
    Sha512 = 6,
}
enum_as_cbor!(Digest);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, N)]
#[repr(i32)]
pub enum EcCurve {
    P224 = 0,
    P256 = 1,
    P384 = 2,
    P521 = 3,
    Curve25519 = 4,
}
enum_as_cbor!(EcCurve);

/// Error codes, as negative values. On the wire the applet reports the magnitude.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, N)]
#[repr(i32)]
pub enum ErrorCode {
    Ok = 0,
    RootOfTrustAlreadySet = -1,
    UnsupportedPurpose = -2,
    IncompatiblePurpose = -3,
    UnsupportedAlgorithm = -4,
    IncompatibleAlgorithm = -5,
    UnsupportedKeySize = -6,
    UnsupportedBlockMode = -7,
    IncompatibleBlockMode = -8,
    UnsupportedMacLength = -9,
    UnsupportedPaddingMode = -10,
    IncompatiblePaddingMode = -11,
    UnsupportedDigest = -12,
    IncompatibleDigest = -13,
    InvalidInputLength = -21,
    KeyUserNotAuthenticated = -26,
    InvalidOperationHandle = -28,
    InsufficientBufferSpace = -29,
    VerificationFailed = -30,
    TooManyOperations = -31,
    InvalidKeyBlob = -33,
    InvalidArgument = -38,
    UnsupportedTag = -39,
    InvalidTag = -40,
    MemoryAllocationFailed = -41,
    SecureHwAccessDenied = -45,
    OperationCancelled = -46,
    SecureHwBusy = -48,
    SecureHwCommunicationFailed = -49,
    InvalidNonce = -52,
    InvalidMacLength = -57,
    DeviceLocked = -72,
    AttestationIdsNotProvisioned = -75,
    InvalidOperation = -76,
    Unimplemented = -100,
    VersionMismatch = -101,
    UnknownError = -1000,
}
enum_as_cbor!(ErrorCode);

/// User authentication types, as a single byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, N)]
#[repr(i32)]
pub enum HardwareAuthenticatorType {
    None = 0,
    Password = 1,
    Fingerprint = 2,
    Any = 255,
}
enum_as_cbor!(HardwareAuthenticatorType);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, N)]
#[repr(i32)]
pub enum KeyOrigin {
    Generated = 0,
    Derived = 1,
    Imported = 2,
    Reserved = 3,
    SecurelyImported = 4,
}
enum_as_cbor!(KeyOrigin);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, N)]
#[repr(i32)]
pub enum KeyPurpose {
    Encrypt = 0,
    Decrypt = 1,
    Sign = 2,
    Verify = 3,
    WrapKey = 5,
    AgreeKey = 6,
    AttestKey = 7,
}
enum_as_cbor!(KeyPurpose);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, N)]
#[repr(i32)]
pub enum PaddingMode {
    None = 1,
    RsaOaep = 2,
    RsaPss = 3,
    RsaPkcs115Encrypt = 4,
    RsaPkcs115Sign = 5,
    Pkcs7 = 64,
}
enum_as_cbor!(PaddingMode);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, N)]
#[repr(i32)]
pub enum SecurityLevel {
    Software = 0,
    TrustedEnvironment = 1,
    Strongbox = 2,
    Keystore = 100,
}
enum_as_cbor!(SecurityLevel);

/// Tags understood by the applet. The top nibble of each value holds the [`TagType`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, N)]
#[repr(i32)]
pub enum Tag {
    Invalid = 0,
    Purpose = 536870913,
    Algorithm = 268435458,
    KeySize = 805306371,
    BlockMode = 536870916,
    Digest = 536870917,
    Padding = 536870918,
    CallerNonce = 1879048199,
    MinMacLength = 805306376,
    EcCurve = 268435466,
    HardwareType = 268435760,
    ActiveDatetime = 1610613136,
    UserSecureId = -1610612234,
    NoAuthRequired = 1879048695,
    UserAuthType = 268435960,
    AuthTimeout = 805306873,
    ApplicationId = -1879047591,
    ApplicationData = -1879047492,
    CreationDatetime = 1610613437,
    Origin = 268436158,
    OsVersion = 805307073,
    OsPatchlevel = 805307074,
    AttestationIdBrand = -1879047482,
    AttestationIdDevice = -1879047481,
    AttestationIdProduct = -1879047480,
    AttestationIdSerial = -1879047479,
    AttestationIdImei = -1879047478,
    AttestationIdMeid = -1879047477,
    AttestationIdManufacturer = -1879047476,
    AttestationIdModel = -1879047475,
    VendorPatchlevel = 805307086,
    BootPatchlevel = 805307087,
    AssociatedData = -1879047192,
    Nonce = -1879047191,
    MacLength = 805307371,
}

impl Tag {
    /// Return the tag as the unsigned 32-bit value carried on the wire.
    pub fn raw(self) -> u32 {
        self as i32 as u32
    }

    /// Look up a tag from its unsigned 32-bit wire value.
    pub fn from_raw(raw: u32) -> Option<Tag> {
        Tag::n(raw as i32)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, N)]
#[repr(i32)]
pub enum TagType {
    Invalid = 0,
    Enum = 268435456,
    EnumRep = 536870912,
    Uint = 805306368,
    UintRep = 1073741824,
    Ulong = 1342177280,
    Date = 1610612736,
    Bool = 1879048192,
    Bignum = -2147483648,
    Bytes = -1879048192,
    UlongRep = -1610612736,
}

/// Determine the tag type for a raw 32-bit tag value.
pub fn raw_tag_type(raw: u32) -> TagType {
    TagType::n((raw & 0xf0000000u32) as i32).unwrap_or(TagType::Invalid)
}

/// Determine the tag type for a tag.
pub fn tag_type(tag: Tag) -> TagType {
    raw_tag_type(tag.raw())
}

/// Determine the raw tag value with tag type information stripped out.
pub fn raw_tag_value(tag: Tag) -> u32 {
    tag.raw() & 0x0fffffffu32
}

/// Value carried for a key parameter; the variant must agree with the tag's [`TagType`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeyParamValue {
    /// `Bool` tags; presence means true.
    True,
    /// `Enum` tags.
    Enum(u8),
    /// `EnumRep` tags.
    EnumList(Vec<u8>),
    /// `Uint`, `Ulong` and `Date` tags.
    Integer(u64),
    /// `UintRep` and `UlongRep` tags.
    IntegerList(Vec<u64>),
    /// `Bytes` and `Bignum` tags.
    Blob(Vec<u8>),
}

/// A single key parameter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyParam {
    pub tag: Tag,
    pub value: KeyParamValue,
}

impl KeyParam {
    /// Build a key parameter, checking that the value variant suits the tag type.
    pub fn new(tag: Tag, value: KeyParamValue) -> Result<Self, CborError> {
        let ok = matches!(
            (tag_type(tag), &value),
            (TagType::Bool, KeyParamValue::True)
                | (TagType::Enum, KeyParamValue::Enum(_))
                | (TagType::EnumRep, KeyParamValue::EnumList(_))
                | (TagType::Uint | TagType::Ulong | TagType::Date, KeyParamValue::Integer(_))
                | (TagType::UintRep | TagType::UlongRep, KeyParamValue::IntegerList(_))
                | (TagType::Bytes | TagType::Bignum, KeyParamValue::Blob(_))
        );
        if ok {
            Ok(KeyParam { tag, value })
        } else {
            Err(CborError::UnexpectedItem("value", "value matching tag type"))
        }
    }
}

/// Ordered list of key parameters, encoded as a CBOR map.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyParams(pub Vec<KeyParam>);

impl KeyParams {
    /// Return the value associated with `tag`, if present.
    pub fn get(&self, tag: Tag) -> Option<&KeyParamValue> {
        self.0.iter().find(|p| p.tag == tag).map(|p| &p.value)
    }
}

fn int_value(value: cbor::value::Value) -> Result<u64, CborError> {
    <u64>::from_cbor_value(value)
}

impl AsCborValue for KeyParams {
    fn from_cbor_value(value: cbor::value::Value) -> Result<Self, CborError> {
        let entries = match value {
            cbor::value::Value::Map(m) => m,
            _ => return cbor_type_error(&value, "map"),
        };
        let mut params = Vec::new();
        params.try_reserve(entries.len()).map_err(|_e| CborError::AllocationFailed)?;
        for (k, v) in entries {
            let raw: u32 = <u32>::from_cbor_value(k)?;
            let tag = Tag::from_raw(raw).ok_or(CborError::NonEnumValue)?;
            let value = match tag_type(tag) {
                TagType::Bool => match int_value(v)? {
                    1 => KeyParamValue::True,
                    _ => return Err(CborError::UnexpectedItem("bool tag value", "1")),
                },
                TagType::Enum => KeyParamValue::Enum(int_value(v)?.try_into()?),
                TagType::EnumRep => KeyParamValue::EnumList(<Vec<u8>>::from_cbor_value(v)?),
                TagType::Uint | TagType::Ulong | TagType::Date => {
                    KeyParamValue::Integer(int_value(v)?)
                }
                TagType::UintRep | TagType::UlongRep => {
                    let arr = match v {
                        cbor::value::Value::Array(a) => a,
                        _ => return cbor_type_error(&v, "arr"),
                    };
                    let vals: Result<Vec<_>, _> = arr.into_iter().map(int_value).collect();
                    KeyParamValue::IntegerList(vals?)
                }
                TagType::Bytes | TagType::Bignum => {
                    KeyParamValue::Blob(<Vec<u8>>::from_cbor_value(v)?)
                }
                TagType::Invalid => return Err(CborError::NonEnumValue),
            };
            params.push(KeyParam { tag, value });
        }
        Ok(KeyParams(params))
    }

    fn to_cbor_value(self) -> Result<cbor::value::Value, CborError> {
        let mut entries = Vec::new();
        entries.try_reserve(self.0.len()).map_err(|_e| CborError::AllocationFailed)?;
        for param in self.0 {
            let key = cbor::value::Value::Integer(param.tag.raw().into());
            let value = match param.value {
                KeyParamValue::True => cbor::value::Value::Integer(1u8.into()),
                KeyParamValue::Enum(v) => cbor::value::Value::Integer(v.into()),
                KeyParamValue::EnumList(v) | KeyParamValue::Blob(v) => {
                    cbor::value::Value::Bytes(v)
                }
                KeyParamValue::Integer(v) => cbor::value::Value::Integer(v.into()),
                KeyParamValue::IntegerList(vals) => cbor::value::Value::Array(
                    vals.into_iter().map(|v| cbor::value::Value::Integer(v.into())).collect(),
                ),
            };
            entries.push((key, value));
        }
        Ok(cbor::value::Value::Map(entries))
    }
}

/// Pull exactly `N` items out of a CBOR array.
pub(crate) fn fixed_array<const N: usize>(
    value: cbor::value::Value,
) -> Result<[cbor::value::Value; N], CborError> {
    let arr = match value {
        cbor::value::Value::Array(a) => a,
        _ => return cbor_type_error(&value, "arr"),
    };
    arr.try_into().map_err(|_e| CborError::UnexpectedItem("arr other len", "arr specific len"))
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HardwareAuthToken {
    pub challenge: u64,
    pub user_id: u64,
    pub authenticator_id: u64,
    pub authenticator_type: HardwareAuthenticatorType,
    pub timestamp: u64,
    pub mac: Vec<u8>,
}

impl Default for HardwareAuthToken {
    fn default() -> Self {
        Self {
            challenge: 0,
            user_id: 0,
            authenticator_id: 0,
            authenticator_type: HardwareAuthenticatorType::None,
            timestamp: 0,
            mac: Vec::new(),
        }
    }
}

impl AsCborValue for HardwareAuthToken {
    fn from_cbor_value(value: cbor::value::Value) -> Result<Self, CborError> {
        let [challenge, user_id, authenticator_id, authenticator_type, timestamp, mac] =
            fixed_array::<6>(value)?;
        Ok(Self {
            challenge: <u64>::from_cbor_value(challenge)?,
            user_id: <u64>::from_cbor_value(user_id)?,
            authenticator_id: <u64>::from_cbor_value(authenticator_id)?,
            authenticator_type: HardwareAuthenticatorType::from_cbor_value(authenticator_type)?,
            timestamp: <u64>::from_cbor_value(timestamp)?,
            mac: <Vec<u8>>::from_cbor_value(mac)?,
        })
    }

    fn to_cbor_value(self) -> Result<cbor::value::Value, CborError> {
        Ok(cbor::value::Value::Array(alloc::vec![
            self.challenge.to_cbor_value()?,
            self.user_id.to_cbor_value()?,
            self.authenticator_id.to_cbor_value()?,
            self.authenticator_type.to_cbor_value()?,
            self.timestamp.to_cbor_value()?,
            self.mac.to_cbor_value()?,
        ]))
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VerificationToken {
    pub challenge: u64,
    pub timestamp: u64,
    pub parameters_verified: KeyParams,
    pub security_level: SecurityLevel,
    pub mac: Vec<u8>,
}

impl Default for VerificationToken {
    fn default() -> Self {
        Self {
            challenge: 0,
            timestamp: 0,
            parameters_verified: KeyParams::default(),
            security_level: SecurityLevel::Software,
            mac: Vec::new(),
        }
    }
}

impl AsCborValue for VerificationToken {
    fn from_cbor_value(value: cbor::value::Value) -> Result<Self, CborError> {
        let [challenge, timestamp, parameters_verified, security_level, mac] =
            fixed_array::<5>(value)?;
        Ok(Self {
            challenge: <u64>::from_cbor_value(challenge)?,
            timestamp: <u64>::from_cbor_value(timestamp)?,
            parameters_verified: KeyParams::from_cbor_value(parameters_verified)?,
            security_level: SecurityLevel::from_cbor_value(security_level)?,
            mac: <Vec<u8>>::from_cbor_value(mac)?,
        })
    }

    fn to_cbor_value(self) -> Result<cbor::value::Value, CborError> {
        Ok(cbor::value::Value::Array(alloc::vec![
            self.challenge.to_cbor_value()?,
            self.timestamp.to_cbor_value()?,
            self.parameters_verified.to_cbor_value()?,
            self.security_level.to_cbor_value()?,
            self.mac.to_cbor_value()?,
        ]))
    }
}

/// Parameters used for HMAC key agreement between KeyMint instances.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HmacSharingParameters {
    pub seed: Vec<u8>,
    pub nonce: [u8; 32],
}

impl AsCborValue for HmacSharingParameters {
    fn from_cbor_value(value: cbor::value::Value) -> Result<Self, CborError> {
        let [seed, nonce] = fixed_array::<2>(value)?;
        Ok(Self {
            seed: <Vec<u8>>::from_cbor_value(seed)?,
            nonce: <[u8; 32]>::from_cbor_value(nonce)?,
        })
    }

    fn to_cbor_value(self) -> Result<cbor::value::Value, CborError> {
        Ok(cbor::value::Value::Array(alloc::vec![
            self.seed.to_cbor_value()?,
            self.nonce.to_cbor_value()?,
        ]))
    }
}
