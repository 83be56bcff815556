//! Wire vocabulary shared by the secure-element applet and its host: CBOR helpers, the
//! key-management enums and the command messages.

#![no_std]
extern crate alloc;

use alloc::vec::Vec;

/// Re-export of crate used for CBOR encoding.
pub use ciborium as cbor;

pub mod keymint;
pub mod types;
pub use types::*;


/// Macro that emits an implementation of [`AsCborValue`] for an `i32`-backed enum type that has
/// `[derive(N)]` attached to it. The enum is encoded as its integer value.
#[macro_export]
macro_rules! enum_as_cbor {
    { $ename:ident } => {
        impl $crate::AsCborValue for $ename {
            fn from_cbor_value(
                value: $crate::cbor::value::Value,
            ) -> Result<Self, $crate::CborError> {
                let v = <i32 as $crate::AsCborValue>::from_cbor_value(value)?;
                Self::n(v).ok_or($crate::CborError::NonEnumValue)
            }
            fn to_cbor_value(self) -> Result<$crate::cbor::value::Value, $crate::CborError> {
                Ok($crate::cbor::value::Value::Integer((self as i32).into()))
            }
        }
    };
}

/// Build a vector of `len` copies of `elem`, reporting allocation failure as `alloc_err()`.
pub fn try_filled<T: Clone, E>(elem: T, len: usize, alloc_err: fn() -> E) -> Result<Vec<T>, E> {
    let mut v = Vec::new();
    v.try_reserve(len).map_err(|_e| alloc_err())?;
    v.resize(len, elem);
    Ok(v)
}

/// Copy `data` into a new vector, reporting allocation failure as `alloc_err()`.
pub fn try_copied<T: Clone, E>(data: &[T], alloc_err: fn() -> E) -> Result<Vec<T>, E> {
    let mut v = Vec::new();
    v.try_reserve(data.len()).map_err(|_e| alloc_err())?;
    v.extend_from_slice(data);
    Ok(v)
}

/// Fallible `vec!`: `vec_try![0u8; len]` or `vec_try![from slice]`. Failure is
/// [`CborError::AllocationFailed`], which converts into the engine's allocation error.
#[macro_export]
macro_rules! vec_try {
    { from $data:expr } => {
        $crate::try_copied($data, || $crate::CborError::AllocationFailed)
    };
    { $elem:expr ; $len:expr } => {
        $crate::try_filled($elem, $len, || $crate::CborError::AllocationFailed)
    };
}

/// Marker structure indicating that the EOF was encountered when reading CBOR data.
#[derive(Debug)]
pub struct EndOfFile;

/// Error type for failures in encoding or decoding CBOR types.
pub enum CborError {
    /// CBOR decoding failure.
    DecodeFailed(cbor::de::Error<EndOfFile>),
    /// CBOR encoding failure.
    EncodeFailed,
    /// CBOR input had extra data.
    ExtraneousData,
    /// Integer value outside expected range.
    OutOfRangeIntegerValue,
    /// Integer value that doesn't match expected set of allowed enum values.
    NonEnumValue,
    /// Unexpected CBOR item encountered (got, want).
    UnexpectedItem(&'static str, &'static str),
    /// Value conversion failure.
    InvalidValue,
    /// Allocation failure.
    AllocationFailed,
    /// Encoded output would not fit in the destination buffer.
    BufferOverrun,
    /// Nesting exceeds the capacity of the codec's work stack.
    NestingTooDeep,
}

impl From<cbor::de::Error<EndOfFile>> for CborError {
    fn from(e: cbor::de::Error<EndOfFile>) -> Self {
        CborError::DecodeFailed(e)
    }
}

impl<T> From<cbor::ser::Error<T>> for CborError {
    fn from(_e: cbor::ser::Error<T>) -> Self {
        CborError::EncodeFailed
    }
}

impl From<cbor::value::Error> for CborError {
    fn from(_e: cbor::value::Error) -> Self {
        CborError::InvalidValue
    }
}

impl From<core::num::TryFromIntError> for CborError {
    fn from(_: core::num::TryFromIntError) -> Self {
        CborError::OutOfRangeIntegerValue
    }
}

impl core::fmt::Debug for CborError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            CborError::DecodeFailed(de) => write!(f, "decode CBOR failure: {:?}", de),
            CborError::EncodeFailed => write!(f, "encode CBOR failure"),
            CborError::ExtraneousData => write!(f, "extraneous data in CBOR input"),
            CborError::OutOfRangeIntegerValue => write!(f, "out of range integer value"),
            CborError::NonEnumValue => write!(f, "integer not a valid enum value"),
            CborError::UnexpectedItem(got, want) => write!(f, "got {}, expected {}", got, want),
            CborError::InvalidValue => write!(f, "invalid CBOR value"),
            CborError::AllocationFailed => write!(f, "allocation failed"),
            CborError::BufferOverrun => write!(f, "output buffer overrun"),
            CborError::NestingTooDeep => write!(f, "nesting exceeds codec stack"),
        }
    }
}

/// Return an error indicating that an unexpected CBOR type was encountered.
pub fn cbor_type_error<T>(value: &cbor::value::Value, want: &'static str) -> Result<T, CborError> {
    use cbor::value::Value;
    let got = match value {
        Value::Integer(_) => "int",
        Value::Bytes(_) => "bstr",
        Value::Text(_) => "tstr",
        Value::Array(_) => "array",
        Value::Map(_) => "map",
        Value::Tag(_, _) => "tag",
        Value::Float(_) => "float",
        Value::Bool(_) => "bool",
        Value::Null => "null",
        _ => "unknown",
    };
    Err(CborError::UnexpectedItem(got, want))
}

/// Byte slice reader that tracks what is left over.
struct SliceReader<'a>(&'a [u8]);

impl ciborium_io::Read for &mut SliceReader<'_> {
    type Error = EndOfFile;

    fn read_exact(&mut self, data: &mut [u8]) -> Result<(), Self::Error> {
        if data.len() > self.0.len() {
            return Err(EndOfFile);
        }
        let (head, rest) = self.0.split_at(data.len());
        data.copy_from_slice(head);
        self.0 = rest;
        Ok(())
    }
}

/// Read one CBOR item that must occupy all of `slice`.
pub fn read_to_value(slice: &[u8]) -> Result<cbor::value::Value, CborError> {
    let mut reader = SliceReader(slice);
    let value = cbor::de::from_reader(&mut reader)?;
    match reader.0.is_empty() {
        true => Ok(value),
        false => Err(CborError::ExtraneousData),
    }
}

/// Trait for types that can be converted to/from a [`cbor::value::Value`].
pub trait AsCborValue: Sized {
    /// Convert a [`cbor::value::Value`] into an instance of the type.
    fn from_cbor_value(value: cbor::value::Value) -> Result<Self, CborError>;

    /// Convert the object into a [`cbor::value::Value`], consuming it along the way.
    fn to_cbor_value(self) -> Result<cbor::value::Value, CborError>;

    /// Create an object instance from serialized CBOR data in a slice.
    fn from_slice(slice: &[u8]) -> Result<Self, CborError> {
        Self::from_cbor_value(read_to_value(slice)?)
    }

    /// Serialize this object to a vector, consuming it along the way.
    fn into_vec(self) -> Result<Vec<u8>, CborError> {
        let mut data = Vec::new();
        cbor::ser::into_writer(&self.to_cbor_value()?, &mut data)?;
        Ok(data)
    }
}

impl AsCborValue for Vec<u8> {
    fn from_cbor_value(value: cbor::value::Value) -> Result<Self, CborError> {
        match value {
            cbor::value::Value::Bytes(bstr) => Ok(bstr),
            _ => cbor_type_error(&value, "bstr"),
        }
    }

    fn to_cbor_value(self) -> Result<cbor::value::Value, CborError> {
        Ok(cbor::value::Value::Bytes(self))
    }
}

impl<const N: usize> AsCborValue for [u8; N] {
    fn from_cbor_value(value: cbor::value::Value) -> Result<Self, CborError> {
        let data = match value {
            cbor::value::Value::Bytes(bstr) => bstr,
            _ => return cbor_type_error(&value, "bstr"),
        };
        data.try_into()
            .map_err(|_e| CborError::UnexpectedItem("bstr other size", "bstr specific size"))
    }

    fn to_cbor_value(self) -> Result<cbor::value::Value, CborError> {
        Ok(cbor::value::Value::Bytes(vec_try![from &self[..]]?))
    }
}

/// Integers travel as CBOR ints of any width that fits the target type.
macro_rules! int_as_cbor {
    { $($ty:ty),* } => { $(
        impl AsCborValue for $ty {
            fn from_cbor_value(value: cbor::value::Value) -> Result<Self, CborError> {
                match value {
                    cbor::value::Value::Integer(i) => {
                        i.try_into().map_err(|_e| CborError::OutOfRangeIntegerValue)
                    }
                    v => cbor_type_error(&v, stringify!($ty)),
                }
            }

            fn to_cbor_value(self) -> Result<cbor::value::Value, CborError> {
                Ok(cbor::value::Value::Integer(self.into()))
            }
        }
    )* };
}

int_as_cbor!(u64, u32, i32);

impl AsCborValue for bool {
    fn from_cbor_value(value: cbor::value::Value) -> Result<Self, CborError> {
        match value {
            cbor::value::Value::Bool(b) => Ok(b),
            v => cbor_type_error(&v, "bool"),
        }
    }

    fn to_cbor_value(self) -> Result<cbor::value::Value, CborError> {
        Ok(cbor::value::Value::Bool(self))
    }
}
