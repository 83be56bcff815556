//! Typed access to the applet's commands.

use crate::{channel_execute, Error, Response, Result, SerializedChannel};
use kmse_wire::keymint::{
    DeviceLockState, ErrorCode, HardwareAuthToken, HmacSharingParameters, KeyParam, KeyParams,
    KeyPurpose, VerificationToken, VerifiedBootState,
};
use kmse_wire::*;
use log::info;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

/// Maximum size of input data in operation messages, allowing for overhead.
///
/// A serialized `FinishRequest` includes the following additional bytes over and
/// above the size of the input (at most):
/// -    1: array wrapper (0x85)
///   -  9: int (0x1b + u64) [op_handle]
///   -  9: input data length
///   -  3: signature data length
///   - 256: signature data (RSA-2048)
///   -  1: array wrapper (0x86) [auth_token]
///      - 36: three u64 ints and an authenticator type
///      -  9: int (0x1b + u64) [timestamp]
///      -  2: bstr header [mac]
///      - 32: bstr [mac]
///   -  1: array wrapper (0x85) [verification_token]
///      - 18: two u64 ints
///      -  1: empty map
///      -  1: security level
///      - 34: bstr [mac]
///
/// Add some leeway in case encodings change.
pub const MAX_DATA_SIZE: usize = DEFAULT_MAX_SIZE - 450;

fn lock<T>(channel: &Mutex<T>) -> Result<MutexGuard<T>> {
    channel.lock().map_err(|_e| Error::Channel("channel mutex poisoned".to_string()))
}

/// Device-level commands, converted to serialized requests that are sent down the associated
/// channel.
pub struct Device<T: SerializedChannel> {
    channel: Arc<Mutex<T>>,
}

impl<T: SerializedChannel> Device<T> {
    /// Construct a new instance that uses the provided channel.
    pub fn new(channel: Arc<Mutex<T>>) -> Self {
        Self { channel }
    }

    fn execute<R, S>(&self, req: R) -> Result<Response<S>>
    where
        R: AsCborValue + Code<Ins>,
        S: AsCborValue,
    {
        channel_execute(&mut *lock(&self.channel)?, req)
    }

    pub fn provision_attestation_ids(&self, ids: Vec<KeyParam>) -> Result<()> {
        info!("provision->attestation IDs for {} tags", ids.len());
        let _rsp: Response<EmptyResponse> =
            self.execute(ProvisionAttestIdsRequest { ids: KeyParams(ids) })?;
        Ok(())
    }

    /// Let the applet know information about the boot environment.
    pub fn set_boot_params(
        &self,
        boot_patchlevel: u32,
        verified_boot_key: &[u8],
        verified_boot_hash: &[u8],
        verified_boot_state: VerifiedBootState,
        device_boot_locked: bool,
    ) -> Result<()> {
        let req = SetBootParamsRequest {
            boot_patchlevel,
            verified_boot_key: verified_boot_key.to_vec(),
            verified_boot_hash: verified_boot_hash.to_vec(),
            verified_boot_state,
            device_boot_locked: if device_boot_locked {
                DeviceLockState::Locked
            } else {
                DeviceLockState::Unlocked
            },
        };
        info!("boot->applet: boot state {:?}", req.verified_boot_state);
        let _rsp: Response<EmptyResponse> = self.execute(req)?;
        Ok(())
    }

    pub fn set_version_patchlevel(
        &self,
        os_version: u32,
        os_patchlevel: u32,
        vendor_patchlevel: u32,
    ) -> Result<()> {
        let req = SetVersionPatchlevelRequest { os_version, os_patchlevel, vendor_patchlevel };
        info!("HAL->applet: {:?}", req);
        let _rsp: Response<EmptyResponse> = self.execute(req)?;
        Ok(())
    }

    pub fn destroy_attestation_ids(&self) -> Result<()> {
        let _rsp: Response<EmptyResponse> = self.execute(DestroyAttIdsRequest {})?;
        Ok(())
    }

    pub fn get_hmac_sharing_parameters(&self) -> Result<HmacSharingParameters> {
        let rsp: Response<GetHmacSharingParamsResponse> =
            self.execute(GetHmacSharingParamsRequest {})?;
        Ok(rsp.body.params)
    }

    pub fn device_locked(
        &self,
        password_only: bool,
        verification_token: Option<VerificationToken>,
    ) -> Result<()> {
        let _rsp: Response<EmptyResponse> = self.execute(DeviceLockedRequest {
            password_only,
            verification_token: verification_token.unwrap_or_default(),
        })?;
        Ok(())
    }

    /// Start an operation. A missing auth token is sent as an empty token.
    pub fn begin(
        &self,
        purpose: KeyPurpose,
        key_blob: &[u8],
        params: Vec<KeyParam>,
        auth_token: Option<HardwareAuthToken>,
    ) -> Result<Operation<T>> {
        let rsp: Response<BeginResponse> = self.execute(BeginRequest {
            purpose,
            key_blob: key_blob.to_vec(),
            params: KeyParams(params),
            auth_token: auth_token.unwrap_or_default(),
        })?;
        Ok(Operation {
            channel: self.channel.clone(),
            op_handle: RwLock::new(Some(rsp.body.op_handle)),
            params: rsp.body.params,
        })
    }
}

/// An in-progress operation. Any failure, and any finish or abort, ends it.
pub struct Operation<T: SerializedChannel> {
    channel: Arc<Mutex<T>>,
    op_handle: RwLock<Option<u64>>,
    params: KeyParams,
}

impl<T: SerializedChannel> Operation<T> {
    /// Parameters returned by the applet when the operation began.
    pub fn params(&self) -> &KeyParams {
        &self.params
    }

    /// Invalidate the operation.
    fn invalidate(&self) {
        if let Ok(mut handle) = self.op_handle.write() {
            *handle = None;
        }
    }

    /// Retrieve the operation handle, if not already failed.
    pub fn handle(&self) -> Result<u64> {
        self.op_handle
            .read()
            .map_err(|_e| Error::Channel("operation lock poisoned".to_string()))?
            .ok_or(Error::Status(ResponseStatus::new(ErrorCode::InvalidOperationHandle, false)))
    }

    /// Execute the given request as part of the operation.  If the request fails, the operation is
    /// invalidated (and any future requests for the operation will fail).
    fn execute<R, S>(&self, req: R) -> Result<S>
    where
        R: AsCborValue + Code<Ins>,
        S: AsCborValue,
    {
        let result = lock(&self.channel).and_then(|mut ch| channel_execute(&mut *ch, req));
        match result {
            Ok(rsp) => Ok(rsp.body),
            Err(e) => {
                // Any failed method on an operation terminates the operation.
                self.invalidate();
                Err(e)
            }
        }
    }

    /// Feed `input` to the operation, in chunks that fit the channel.
    pub fn update(
        &self,
        mut input: &[u8],
        auth_token: Option<&HardwareAuthToken>,
        verification_token: Option<&VerificationToken>,
    ) -> Result<Vec<u8>> {
        let req_template = UpdateRequest {
            op_handle: self.handle()?,
            input: vec![],
            auth_token: auth_token.cloned().unwrap_or_default(),
            verification_token: verification_token.cloned().unwrap_or_default(),
        };
        let mut output = vec![];
        while !input.is_empty() {
            let mut req = req_template.clone();
            let batch_len = core::cmp::min(MAX_DATA_SIZE, input.len());
            req.input = input[..batch_len].to_vec();
            input = &input[batch_len..];
            let rsp: OperationOutputResponse = self.execute(req)?;
            output.extend_from_slice(&rsp.output);
        }
        Ok(output)
    }

    /// Complete the operation. Input beyond what fits in one message goes in preceding updates.
    pub fn finish(
        &self,
        mut input: &[u8],
        signature: &[u8],
        auth_token: Option<&HardwareAuthToken>,
        verification_token: Option<&VerificationToken>,
    ) -> Result<Vec<u8>> {
        let op_handle = self.handle()?;
        let auth_token = auth_token.cloned().unwrap_or_default();
        let verification_token = verification_token.cloned().unwrap_or_default();

        let mut output = vec![];
        while input.len() > MAX_DATA_SIZE {
            let req = UpdateRequest {
                op_handle,
                input: input[..MAX_DATA_SIZE].to_vec(),
                auth_token: auth_token.clone(),
                verification_token: verification_token.clone(),
            };
            input = &input[MAX_DATA_SIZE..];
            let rsp: OperationOutputResponse = self.execute(req)?;
            output.extend_from_slice(&rsp.output);
        }
        let result: Result<OperationOutputResponse> = self.execute(FinishRequest {
            op_handle,
            input: input.to_vec(),
            signature: signature.to_vec(),
            auth_token,
            verification_token,
        });
        // Finish always invalidates the operation.
        self.invalidate();
        let rsp = result?;
        output.extend_from_slice(&rsp.output);
        Ok(output)
    }

    pub fn abort(&self) -> Result<()> {
        let op_handle = self.handle()?;
        let result: Result<EmptyResponse> = self.execute(AbortRequest { op_handle });
        // Abort always invalidates the operation.
        self.invalidate();
        result?;
        Ok(())
    }
}
