//! Applet functionality related to in-progress crypto operations.

use crate::KeymasterApplet;
use kmse_common::crypto::OperationParams;
use kmse_common::heap::Heap;
use kmse_common::record::{
    Array, ByteBlob, Enum, HwAuthToken, Integer, KeyParams, Record,
};
use kmse_common::{km_err, Error};
use kmse_wire::keymint::{
    Algorithm, BlockMode, Digest, ErrorCode, KeyPurpose, PaddingMode, Tag,
};
use kmse_wire::OPERATION_HANDLE_SIZE;
use log::{debug, error, info, warn};

/// Size of the serialized [`OperationState`].
pub const OPERATION_STATE_SIZE: usize = 22;

/// Marker for an optional enum value that is absent in the serialized state.
const ABSENT: u8 = 0xff;

/// Every update and finish needs an auth token whose challenge is the operation handle.
pub const FLAG_AUTH_PER_OP: u8 = 0x01;
/// An auth token has been seen for a key with an authentication timeout.
pub const FLAG_AUTH_TIMEOUT_VALIDATED: u8 = 0x02;
/// The key is bound to user secure IDs.
pub const FLAG_SECURE_USER_ID_REQUIRED: u8 = 0x04;
/// Associated data may still be supplied (GCM before any input).
pub const FLAG_AAD_ALLOWED: u8 = 0x08;

/// Newtype for operation handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpHandle(pub u64);

impl OpHandle {
    pub fn to_be_bytes(self) -> [u8; OPERATION_HANDLE_SIZE] {
        self.0.to_be_bytes()
    }

    pub fn from_be_bytes(data: [u8; OPERATION_HANDLE_SIZE]) -> Self {
        Self(u64::from_be_bytes(data))
    }
}

/// Durable state of an operation, held in a repository slot between commands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OperationState {
    pub params: OperationParams,
    pub flags: u8,
    /// Timestamp of the auth token that satisfied a timeout-bound key, in milliseconds.
    pub auth_time: u64,
}

fn opt_byte(value: Option<i32>) -> u8 {
    value.map(|v| v as u8).unwrap_or(ABSENT)
}

fn corrupt(what: &str, value: u8) -> Error {
    error!("operation state: stored {} {} is not valid", what, value);
    km_err!(UnknownError, "corrupt operation state: {} {}", what, value)
}

fn opt_enum<T>(raw: u8, what: &str, n: fn(i32) -> Option<T>) -> Result<Option<T>, Error> {
    if raw == ABSENT {
        return Ok(None);
    }
    n(raw as i32).map(Some).ok_or_else(|| corrupt(what, raw))
}

impl OperationState {
    pub fn new(params: OperationParams) -> Self {
        Self { params, flags: 0, auth_time: 0 }
    }

    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    pub fn set(&mut self, flag: u8, on: bool) {
        if on {
            self.flags |= flag;
        } else {
            self.flags &= !flag;
        }
    }

    /// Fixed-size big-endian form:
    /// purpose, algorithm, digest, padding, block mode, key size (4), MAC length (4), flags,
    /// auth time (8).
    pub fn to_bytes(&self) -> [u8; OPERATION_STATE_SIZE] {
        let p = &self.params;
        let mut out = [0u8; OPERATION_STATE_SIZE];
        out[0] = p.purpose as u8;
        out[1] = p.algorithm as u8;
        out[2] = opt_byte(p.digest.map(|d| d as i32));
        out[3] = opt_byte(p.padding.map(|d| d as i32));
        out[4] = opt_byte(p.block_mode.map(|d| d as i32));
        out[5..9].copy_from_slice(&p.key_size.to_be_bytes());
        out[9..13].copy_from_slice(&p.mac_length.to_be_bytes());
        out[13] = self.flags;
        out[14..22].copy_from_slice(&self.auth_time.to_be_bytes());
        out
    }

    pub fn from_bytes(data: &[u8; OPERATION_STATE_SIZE]) -> Result<Self, Error> {
        let purpose = KeyPurpose::n(data[0] as i32).ok_or_else(|| corrupt("purpose", data[0]))?;
        let algorithm =
            Algorithm::n(data[1] as i32).ok_or_else(|| corrupt("algorithm", data[1]))?;
        let mut key_size = [0u8; 4];
        key_size.copy_from_slice(&data[5..9]);
        let mut mac_length = [0u8; 4];
        mac_length.copy_from_slice(&data[9..13]);
        let mut auth_time = [0u8; 8];
        auth_time.copy_from_slice(&data[14..22]);
        Ok(Self {
            params: OperationParams {
                purpose,
                algorithm,
                digest: opt_enum(data[2], "digest", Digest::n)?,
                padding: opt_enum(data[3], "padding", PaddingMode::n)?,
                block_mode: opt_enum(data[4], "block mode", BlockMode::n)?,
                key_size: u32::from_be_bytes(key_size),
                mac_length: u32::from_be_bytes(mac_length),
            },
            flags: data[13],
            auth_time: u64::from_be_bytes(auth_time),
        })
    }
}

/// First value of a repeatable enum tag, if present.
fn first_enum<T>(
    heap: &Heap,
    params: KeyParams,
    tag: Tag,
    code: ErrorCode,
    n: fn(i32) -> Option<T>,
) -> Result<Option<T>, Error> {
    match params.get_bytes(heap, tag)?.and_then(|v| v.first().copied()) {
        None => Ok(None),
        Some(raw) => n(raw as i32)
            .map(Some)
            .ok_or_else(|| kmse_common::km_verr!(code, "{:?} value {} not supported", tag, raw)),
    }
}

fn u32_param(heap: &Heap, params: KeyParams, tag: Tag) -> Result<u32, Error> {
    match params.get_integer(heap, tag)? {
        None => Ok(0),
        Some(v) => u32::try_from(v).map_err(|_e| km_err!(InvalidArgument, "{:?} too large", tag)),
    }
}

/// Extract the primitive selection for an operation from the request parameters.
pub(crate) fn operation_params(
    heap: &Heap,
    purpose: KeyPurpose,
    params: KeyParams,
) -> Result<OperationParams, Error> {
    let algorithm = params
        .get_enum(heap, Tag::Algorithm)?
        .ok_or_else(|| km_err!(UnsupportedAlgorithm, "no algorithm specified"))?;
    let algorithm = Algorithm::n(algorithm as i32)
        .ok_or_else(|| km_err!(UnsupportedAlgorithm, "algorithm {} not supported", algorithm))?;
    if let Some(purposes) = params.get_bytes(heap, Tag::Purpose)? {
        if !purposes.contains(&(purpose as u8)) {
            return Err(km_err!(IncompatiblePurpose, "{:?} not among key purposes", purpose));
        }
    }
    Ok(OperationParams {
        purpose,
        algorithm,
        digest: first_enum(heap, params, Tag::Digest, ErrorCode::UnsupportedDigest, Digest::n)?,
        padding: first_enum(
            heap,
            params,
            Tag::Padding,
            ErrorCode::UnsupportedPaddingMode,
            PaddingMode::n,
        )?,
        block_mode: first_enum(
            heap,
            params,
            Tag::BlockMode,
            ErrorCode::UnsupportedBlockMode,
            BlockMode::n,
        )?,
        key_size: u32_param(heap, params, Tag::KeySize)?,
        mac_length: u32_param(heap, params, Tag::MacLength)?,
    })
}

/// Whether a token carries anything; an all-empty token stands in for "no token".
fn token_present(heap: &Heap, token: HwAuthToken) -> Result<bool, Error> {
    Ok(!token.mac(heap)?.is_empty())
}

impl<'a> KeymasterApplet<'a> {
    pub(crate) fn begin_operation(&mut self, args: Array) -> Result<Array, Error> {
        let heap = &self.heap;
        let purpose = args.get_as::<Enum>(heap, 0)?.value(heap)?;
        let purpose = KeyPurpose::n(purpose as i32)
            .ok_or_else(|| km_err!(UnsupportedPurpose, "purpose {} not supported", purpose))?;
        let key_blob = args.get_as::<ByteBlob>(heap, 1)?;
        let params = args.get_as::<KeyParams>(heap, 2)?;
        let auth_token = args.get_as::<HwAuthToken>(heap, 3)?;

        let mut state = OperationState::new(operation_params(heap, purpose, params)?);
        let secure_ids = params.find(heap, Tag::UserSecureId)?.is_some();
        if secure_ids && !params.has_bool(heap, Tag::NoAuthRequired)? {
            state.set(FLAG_SECURE_USER_ID_REQUIRED, true);
            if params.get_integer(heap, Tag::AuthTimeout)?.is_none() {
                state.set(FLAG_AUTH_PER_OP, true);
            } else if token_present(heap, auth_token)? {
                state.set(FLAG_AUTH_TIMEOUT_VALIDATED, true);
                state.auth_time = auth_token.timestamp(heap)?;
            }
        }
        if state.params.block_mode == Some(BlockMode::Gcm) {
            state.set(FLAG_AAD_ALLOWED, true);
        }

        let handle = self.new_op_handle()?;
        let reservation = self.repository.reserve(&*self.store, handle)?;
        let op = match self.imp.provider.begin(&state.params, key_blob.data(&self.heap)?) {
            Ok(op) => op,
            Err(e) => {
                self.repository.cancel(reservation);
                return Err(e);
            }
        };
        let slot = self.repository.persist(&mut *self.store, &state, handle, op)?;
        info!(
            "began {:?} {:?} operation {:?} in slot {}",
            purpose, state.params.algorithm, handle, slot
        );

        let out_params = KeyParams::empty(&mut self.heap)?;
        let handle_rec = Integer::from_u64(&mut self.heap, handle.0)?;
        self.response(&[out_params.addr(), handle_rec.addr()])
    }

    pub(crate) fn update_operation(&mut self, args: Array) -> Result<Array, Error> {
        let handle = OpHandle(args.get_as::<Integer>(&self.heap, 0)?.value(&self.heap)?);
        let input = args.get_as::<ByteBlob>(&self.heap, 1)?;
        let auth_token = args.get_as::<HwAuthToken>(&self.heap, 2)?;
        let (slot, state) = self.repository.find(&*self.store, handle)?;
        match self.update_in_slot(slot, state, handle, input, auth_token) {
            Ok(output) => self.response(&[output.addr()]),
            Err(e) => {
                // A failure destroys the operation.
                self.release_after_failure(slot, handle);
                Err(e)
            }
        }
    }

    fn update_in_slot(
        &mut self,
        slot: usize,
        mut state: OperationState,
        handle: OpHandle,
        input: ByteBlob,
        auth_token: HwAuthToken,
    ) -> Result<ByteBlob, Error> {
        let mut changed = self.check_auth(&mut state, handle, auth_token)?;
        let mut op = self.repository.take_operation(slot)?;
        let data = input.data(&self.heap)?;
        let output = match op.update(data) {
            Ok(output) => output,
            Err(e) => {
                op.abort();
                return Err(e);
            }
        };
        if state.has(FLAG_AAD_ALLOWED) && !data.is_empty() {
            state.set(FLAG_AAD_ALLOWED, false);
            changed = true;
        }
        if changed {
            self.repository.persist(&mut *self.store, &state, handle, op)?;
        } else {
            self.repository.restore_operation(slot, op)?;
        }
        debug!("updated {:?} with {} bytes, {} out", handle, data.len(), output.len());
        ByteBlob::from_slice(&mut self.heap, &output)
    }

    pub(crate) fn finish_operation(&mut self, args: Array) -> Result<Array, Error> {
        let handle = OpHandle(args.get_as::<Integer>(&self.heap, 0)?.value(&self.heap)?);
        let input = args.get_as::<ByteBlob>(&self.heap, 1)?;
        let signature = args.get_as::<ByteBlob>(&self.heap, 2)?;
        let auth_token = args.get_as::<HwAuthToken>(&self.heap, 3)?;
        let (slot, mut state) = self.repository.find(&*self.store, handle)?;

        let result = self.check_auth(&mut state, handle, auth_token).and_then(|_changed| {
            let op = self.repository.take_operation(slot)?;
            op.finish(input.data(&self.heap)?, signature.data(&self.heap)?)
        });
        // The slot is released whatever the outcome.
        self.repository.release(&mut *self.store, slot)?;
        let output = result?;
        info!("finished {:?}", handle);
        let output = ByteBlob::from_slice(&mut self.heap, &output)?;
        self.response(&[output.addr()])
    }

    pub(crate) fn abort_operation(&mut self, args: Array) -> Result<Array, Error> {
        let handle = OpHandle(args.get_as::<Integer>(&self.heap, 0)?.value(&self.heap)?);
        let (slot, _state) = self.repository.find(&*self.store, handle)?;
        self.repository.release(&mut *self.store, slot)?;
        info!("aborted {:?}", handle);
        self.response(&[])
    }

    /// Check authentication for an operation that has already begun. Returns an indication of
    /// whether `state` changed and needs to be stored again.
    fn check_auth(
        &self,
        state: &mut OperationState,
        handle: OpHandle,
        auth_token: HwAuthToken,
    ) -> Result<bool, Error> {
        let heap = &self.heap;
        if state.has(FLAG_AUTH_PER_OP) {
            if !token_present(heap, auth_token)? || auth_token.challenge(heap)? != handle.0 {
                return Err(km_err!(
                    KeyUserNotAuthenticated,
                    "no auth token with challenge {:?}",
                    handle
                ));
            }
            return Ok(false);
        }
        if state.has(FLAG_SECURE_USER_ID_REQUIRED) && !state.has(FLAG_AUTH_TIMEOUT_VALIDATED) {
            if !token_present(heap, auth_token)? {
                return Err(km_err!(KeyUserNotAuthenticated, "no auth token for {:?}", handle));
            }
            state.set(FLAG_AUTH_TIMEOUT_VALIDATED, true);
            state.auth_time = auth_token.timestamp(heap)?;
            return Ok(true);
        }
        Ok(false)
    }

    fn release_after_failure(&mut self, slot: usize, handle: OpHandle) {
        if let Err(e) = self.repository.release(&mut *self.store, slot) {
            warn!("failed to release {:?} after failure: {:?}", handle, e);
        }
    }

    /// Return a new operation handle value that is not currently in use.
    fn new_op_handle(&mut self) -> Result<OpHandle, Error> {
        loop {
            let handle = OpHandle(self.imp.rng.next_u64());
            if handle.0 != 0 && !self.repository.contains(&*self.store, handle)? {
                return Ok(handle);
            }
            // Handle already in use, go around again.
        }
    }
}
