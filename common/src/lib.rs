//! Functionality for the secure-element applet that sits below command processing: the record
//! arena, the CBOR codec over it, COSE structures, and durable storage.

#![no_std]
extern crate alloc;

use alloc::string::String;
use kmse_wire::keymint::ErrorCode;

/// Re-export of crate used for CBOR encoding.
pub use kmse_wire::cbor;
/// Re-export of the wire vocabulary crate.
pub use kmse_wire as wire;
pub use kmse_wire::{vec_try, CborError};

pub mod codec;
pub mod cose;
pub mod crypto;
pub mod heap;
pub mod nvm;
pub mod record;
pub mod table;

/// General error type.
#[derive(Debug)]
pub enum Error {
    /// Structural problem with CBOR input or output.
    Cbor(CborError),
    /// Failure with an associated [`ErrorCode`] and diagnostic message.
    Hal(ErrorCode, String),
    /// Fixed-capacity storage exhausted.
    Alloc(&'static str),
}

/// Macro to build an [`Error::Hal`] instance for a specific [`ErrorCode`] value known at compile
/// time: `km_err!(InvalidTag, "some {} format", arg)`.
#[macro_export]
macro_rules! km_err {
    { $error_code:ident, $($arg:tt)+ } => {
        $crate::Error::Hal($crate::wire::keymint::ErrorCode::$error_code,
                           alloc::format!("{}:{}: {}", file!(), line!(), format_args!($($arg)+))) };
}

/// Macro to build an [`Error::Hal`] instance:
/// `km_verr!(rc, "some {} format", arg)`.
#[macro_export]
macro_rules! km_verr {
    { $error_code:expr, $($arg:tt)+ } => {
        $crate::Error::Hal($error_code,
                           alloc::format!("{}:{}: {}", file!(), line!(), format_args!($($arg)+))) };
}

impl From<Error> for ErrorCode {
    fn from(e: Error) -> Self {
        match e {
            Error::Cbor(_) => ErrorCode::InvalidArgument,
            Error::Hal(e, _msg) => e,
            Error::Alloc(_) => ErrorCode::MemoryAllocationFailed,
        }
    }
}

impl From<CborError> for Error {
    fn from(e: CborError) -> Self {
        match e {
            CborError::AllocationFailed => Error::Alloc("CBOR allocation failed"),
            e => Error::Cbor(e),
        }
    }
}

/// Check for an expected error.
#[macro_export]
macro_rules! expect_err {
    ($result:expr, $err_msg:expr) => {
        assert!(
            $result.is_err(),
            "Expected error containing '{}', got success {:?}",
            $err_msg,
            $result
        );
        let err = $result.err();
        assert!(
            alloc::format!("{:?}", err).contains($err_msg),
            "Unexpected error {:?}, doesn't contain '{}'",
            err,
            $err_msg
        );
    };
}
