//! Canonical CBOR encoding and template-driven decoding of arena records.
//!
//! Both directions walk the record graph with an explicit, bounded work stack rather than
//! recursion, so a hostile input can exhaust the stack (and fail cleanly) but never the call
//! stack.

use crate::record::EnumType;
use crate::CborError;

mod decoder;
mod encoder;
pub use decoder::{Decoder, DECODER_STACK_SIZE};
pub use encoder::{Encoder, ENCODER_STACK_SIZE};


pub(crate) const MAJOR_UINT: u8 = 0;
pub(crate) const MAJOR_NINT: u8 = 1;
pub(crate) const MAJOR_BSTR: u8 = 2;
pub(crate) const MAJOR_TSTR: u8 = 3;
pub(crate) const MAJOR_ARRAY: u8 = 4;
pub(crate) const MAJOR_MAP: u8 = 5;
pub(crate) const MAJOR_TAG: u8 = 6;
pub(crate) const MAJOR_SIMPLE: u8 = 7;

/// Additional-information values that introduce a 1, 2, 4 or 8 byte argument.
const AI_ONE_BYTE: u8 = 24;
const AI_TWO_BYTES: u8 = 25;
const AI_FOUR_BYTES: u8 = 26;
const AI_EIGHT_BYTES: u8 = 27;
const AI_INDEFINITE: u8 = 31;

/// Expected shape of a CBOR item, used to drive decoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Template {
    ByteBlob,
    TextString,
    /// Unsigned integer (major type 0).
    Integer,
    /// Negative integer (major type 1).
    NegInteger,
    /// Integer of either sign.
    Int,
    /// Simple value 0..=23.
    Simple,
    /// Unsigned integer that must be a member of the given enumeration.
    Enum(EnumType),
    /// Array with exactly one element per listed template.
    Array(&'static [Template]),
    /// Array of any length whose elements all match the template.
    ArrayOf(&'static Template),
    /// Map of any length with keys and values matching the two templates.
    Map(&'static Template, &'static Template),
    KeyParams,
    KeyChars,
    HwAuthToken,
    VerificationToken,
    HmacSharingParams,
    CoseKey,
    CoseHeaders,
}

/// Field layout of an encoded key-characteristics triple.
pub const KEY_CHARS_FIELDS: &[Template] =
    &[Template::KeyParams, Template::KeyParams, Template::KeyParams];

/// Field layout of an encoded hardware authentication token.
pub const HW_AUTH_TOKEN_FIELDS: &[Template] = &[
    Template::Integer,
    Template::Integer,
    Template::Integer,
    Template::Enum(EnumType::UserAuthType),
    Template::Integer,
    Template::ByteBlob,
];

/// Field layout of an encoded verification token.
pub const VERIFICATION_TOKEN_FIELDS: &[Template] = &[
    Template::Integer,
    Template::Integer,
    Template::KeyParams,
    Template::Enum(EnumType::SecurityLevel),
    Template::ByteBlob,
];

/// Field layout of encoded HMAC sharing parameters.
pub const HMAC_SHARING_FIELDS: &[Template] = &[Template::ByteBlob, Template::ByteBlob];

/// Encode the header of an item with the given major type and argument, using the shortest
/// form. Returns the buffer and the number of bytes used.
pub(crate) fn encode_header(major: u8, arg: u64) -> ([u8; 9], usize) {
    let mut buf = [0u8; 9];
    let mt = major << 5;
    let len = if arg < AI_ONE_BYTE as u64 {
        buf[0] = mt | arg as u8;
        1
    } else if arg <= u8::MAX as u64 {
        buf[0] = mt | AI_ONE_BYTE;
        buf[1] = arg as u8;
        2
    } else if arg <= u16::MAX as u64 {
        buf[0] = mt | AI_TWO_BYTES;
        buf[1..3].copy_from_slice(&(arg as u16).to_be_bytes());
        3
    } else if arg <= u32::MAX as u64 {
        buf[0] = mt | AI_FOUR_BYTES;
        buf[1..5].copy_from_slice(&(arg as u32).to_be_bytes());
        5
    } else {
        buf[0] = mt | AI_EIGHT_BYTES;
        buf[1..9].copy_from_slice(&arg.to_be_bytes());
        9
    };
    (buf, len)
}

/// Name of a major type, for error messages.
pub(crate) fn major_name(major: u8) -> &'static str {
    match major {
        MAJOR_UINT => "uint",
        MAJOR_NINT => "nint",
        MAJOR_BSTR => "bstr",
        MAJOR_TSTR => "tstr",
        MAJOR_ARRAY => "array",
        MAJOR_MAP => "map",
        MAJOR_TAG => "tag",
        _ => "simple/float",
    }
}

/// Encode a bare status word, as sent when a command fails.
pub fn encode_error(word: u32, out: &mut [u8]) -> Result<usize, CborError> {
    let (hdr, len) = encode_header(MAJOR_UINT, word as u64);
    if out.len() < len {
        return Err(CborError::BufferOverrun);
    }
    out[..len].copy_from_slice(&hdr[..len]);
    Ok(len)
}
