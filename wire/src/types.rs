//! Command codes, response framing and the request/response messages exchanged with the applet.

use crate::keymint::{
    DeviceLockState, ErrorCode, HardwareAuthToken, HmacSharingParameters, KeyParams, KeyPurpose,
    VerificationToken, VerifiedBootState,
};
use crate::{cbor, cbor_type_error, AsCborValue, CborError};
use alloc::vec::Vec;
use enumn::N;

/// Default maximum supported size for CBOR-serialized messages.
pub const DEFAULT_MAX_SIZE: usize = 4096;

/// Flag set in the upper half of a response status word when the applet detected a power reset
/// before processing the command.
pub const POWER_RESET_FLAG: u16 = 0x4000;

/// Size of an operation handle, in bytes.
pub const OPERATION_HANDLE_SIZE: usize = 8;

/// Trait that associates an enum value of the specified type with a type.
/// Values of the `enum` type `T` are used to identify particular message types.
/// A message type implements `Code<T>` to indicate which `enum` value it is
/// associated with.
pub trait Code<T> {
    /// The enum value identifying this request/response.
    const CODE: T;
    /// Return the enum value associated with the underlying type of this item.
    fn code(&self) -> T {
        Self::CODE
    }
}

/// Instruction byte identifying each command understood by the applet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, N)]
#[repr(u8)]
pub enum Ins {
    ProvisionAttestIds = 0x04,
    SetBootParams = 0x06,
    SetVersionPatchlevel = 0x09,
    DestroyAttIds = 0x2b,
    GetHmacSharingParams = 0x2d,
    Begin = 0x30,
    Update = 0x31,
    Finish = 0x32,
    Abort = 0x33,
    DeviceLocked = 0x34,
}

/// Decoded form of the 32-bit status word that heads every response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResponseStatus {
    pub error_code: ErrorCode,
    pub power_reset: bool,
}

impl ResponseStatus {
    pub fn new(error_code: ErrorCode, power_reset: bool) -> Self {
        Self { error_code, power_reset }
    }

    /// Pack into the wire form: reset flags in the upper 16 bits, error magnitude in the lower.
    pub fn to_word(self) -> u32 {
        let flags = if self.power_reset { POWER_RESET_FLAG } else { 0 };
        let magnitude = (self.error_code as i32).unsigned_abs() & 0xffff;
        ((flags as u32) << 16) | magnitude
    }

    /// Unpack the wire form.
    pub fn from_word(word: u32) -> Result<Self, CborError> {
        let flags = (word >> 16) as u16;
        let magnitude = (word & 0xffff) as i32;
        let error_code = ErrorCode::n(-magnitude).ok_or(CborError::NonEnumValue)?;
        Ok(Self { error_code, power_reset: flags & POWER_RESET_FLAG != 0 })
    }
}

/// Emit a struct with `pub` fields together with an [`AsCborValue`] implementation that encodes
/// it as a CBOR array holding the fields in declaration order.
macro_rules! cbor_struct {
    {
        $(#[$meta:meta])*
        pub struct $name:ident { $(pub $field:ident : $fty:ty),* $(,)? }
    } => {
        $(#[$meta])*
        pub struct $name { $(pub $field: $fty),* }

        impl AsCborValue for $name {
            #[allow(unused_mut, unused_variables)]
            fn from_cbor_value(value: cbor::value::Value) -> Result<Self, CborError> {
                let arr = match value {
                    cbor::value::Value::Array(a) => a,
                    _ => return cbor_type_error(&value, "arr"),
                };
                let fields: &[&str] = &[$(stringify!($field)),*];
                if arr.len() != fields.len() {
                    return Err(CborError::UnexpectedItem(
                        "arr other len",
                        "arr with one item per field",
                    ));
                }
                let mut items = arr.into_iter();
                Ok(Self {
                    $($field: <$fty>::from_cbor_value(
                        items.next().ok_or(CborError::UnexpectedItem("short arr", "field"))?,
                    )?,)*
                })
            }

            fn to_cbor_value(self) -> Result<cbor::value::Value, CborError> {
                Ok(cbor::value::Value::Array(alloc::vec![$(self.$field.to_cbor_value()?),*]))
            }
        }
    };
}

cbor_struct! {
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct ProvisionAttestIdsRequest {
        pub ids: KeyParams,
    }
}

cbor_struct! {
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct SetBootParamsRequest {
        pub boot_patchlevel: u32,
        pub verified_boot_key: Vec<u8>,
        pub verified_boot_hash: Vec<u8>,
        pub verified_boot_state: VerifiedBootState,
        pub device_boot_locked: DeviceLockState,
    }
}

cbor_struct! {
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct SetVersionPatchlevelRequest {
        pub os_version: u32,
        pub os_patchlevel: u32,
        pub vendor_patchlevel: u32,
    }
}

cbor_struct! {
    #[derive(Clone, Debug, Default, PartialEq, Eq)]
    pub struct DestroyAttIdsRequest {}
}

cbor_struct! {
    #[derive(Clone, Debug, Default, PartialEq, Eq)]
    pub struct GetHmacSharingParamsRequest {}
}

cbor_struct! {
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct BeginRequest {
        pub purpose: KeyPurpose,
        pub key_blob: Vec<u8>,
        pub params: KeyParams,
        pub auth_token: HardwareAuthToken,
    }
}

cbor_struct! {
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct UpdateRequest {
        pub op_handle: u64,
        pub input: Vec<u8>,
        pub auth_token: HardwareAuthToken,
        pub verification_token: VerificationToken,
    }
}

cbor_struct! {
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct FinishRequest {
        pub op_handle: u64,
        pub input: Vec<u8>,
        pub signature: Vec<u8>,
        pub auth_token: HardwareAuthToken,
        pub verification_token: VerificationToken,
    }
}

cbor_struct! {
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct AbortRequest {
        pub op_handle: u64,
    }
}

cbor_struct! {
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct DeviceLockedRequest {
        pub password_only: bool,
        pub verification_token: VerificationToken,
    }
}

cbor_struct! {
    /// Response body for commands that return nothing beyond the status word.
    #[derive(Clone, Debug, Default, PartialEq, Eq)]
    pub struct EmptyResponse {}
}

cbor_struct! {
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct GetHmacSharingParamsResponse {
        pub params: HmacSharingParameters,
    }
}

cbor_struct! {
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct BeginResponse {
        pub params: KeyParams,
        pub op_handle: u64,
    }
}

cbor_struct! {
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct OperationOutputResponse {
        pub output: Vec<u8>,
    }
}

impl Code<Ins> for ProvisionAttestIdsRequest {
    const CODE: Ins = Ins::ProvisionAttestIds;
}
impl Code<Ins> for SetBootParamsRequest {
    const CODE: Ins = Ins::SetBootParams;
}
impl Code<Ins> for SetVersionPatchlevelRequest {
    const CODE: Ins = Ins::SetVersionPatchlevel;
}
impl Code<Ins> for DestroyAttIdsRequest {
    const CODE: Ins = Ins::DestroyAttIds;
}
impl Code<Ins> for GetHmacSharingParamsRequest {
    const CODE: Ins = Ins::GetHmacSharingParams;
}
impl Code<Ins> for BeginRequest {
    const CODE: Ins = Ins::Begin;
}
impl Code<Ins> for UpdateRequest {
    const CODE: Ins = Ins::Update;
}
impl Code<Ins> for FinishRequest {
    const CODE: Ins = Ins::Finish;
}
impl Code<Ins> for AbortRequest {
    const CODE: Ins = Ins::Abort;
}
impl Code<Ins> for DeviceLockedRequest {
    const CODE: Ins = Ins::DeviceLocked;
}
