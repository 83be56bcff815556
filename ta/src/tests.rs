//! Tests

use super::*;
use crate::operation::{OpHandle, FLAG_AAD_ALLOWED};
use alloc::{boxed::Box, format, rc::Rc, vec, vec::Vec};
use core::cell::Cell;
use kmse_common::crypto::{CryptoOperation, CryptoProvider, Implementation, OperationParams, Rng};
use kmse_common::nvm::MemoryStore;
use kmse_common::table::DataTable;
use kmse_wire::cbor::value::Value;
use kmse_wire::keymint::{
    Algorithm, BlockMode, DeviceLockState, HardwareAuthToken, HardwareAuthenticatorType,
    HmacSharingParameters, KeyParam, KeyParamValue, KeyParams, KeyPurpose, Tag,
    VerificationToken, VerifiedBootState,
};
use kmse_wire::{
    read_to_value, AbortRequest, AsCborValue, BeginRequest, Code, DestroyAttIdsRequest,
    DeviceLockedRequest, FinishRequest, GetHmacSharingParamsRequest, ProvisionAttestIdsRequest,
    SetBootParamsRequest, SetVersionPatchlevelRequest, UpdateRequest,
};

/// Deterministic generator producing 1, 2, 3, ...
struct CountingRng(u8);

impl Rng for CountingRng {
    fn add_entropy(&mut self, _data: &[u8]) {}
    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for b in dest.iter_mut() {
            self.0 = self.0.wrapping_add(1);
            *b = self.0;
        }
    }
}

/// Provider whose operations echo their input. Key blob "bad" is rejected.
#[derive(Default)]
struct EchoProvider {
    aborted: Rc<Cell<usize>>,
}

struct EchoOp {
    seen: Vec<u8>,
    aborted: Rc<Cell<usize>>,
}

impl CryptoProvider for EchoProvider {
    fn begin(
        &self,
        _params: &OperationParams,
        key_blob: &[u8],
    ) -> Result<Box<dyn CryptoOperation>, Error> {
        if key_blob == b"bad" {
            return Err(km_err!(InvalidKeyBlob, "unusable key"));
        }
        Ok(Box::new(EchoOp { seen: Vec::new(), aborted: self.aborted.clone() }))
    }
}

impl CryptoOperation for EchoOp {
    fn update(&mut self, data: &[u8]) -> Result<Vec<u8>, Error> {
        self.seen.extend_from_slice(data);
        Ok(data.to_vec())
    }

    fn finish(self: Box<Self>, input: &[u8], signature: &[u8]) -> Result<Vec<u8>, Error> {
        let mut out = self.seen;
        out.extend_from_slice(input);
        out.extend_from_slice(signature);
        Ok(out)
    }

    fn abort(self: Box<Self>) {
        self.aborted.set(self.aborted.get() + 1);
    }
}

fn new_store() -> MemoryStore {
    MemoryStore::new(required_store_size(MAX_OPS)).unwrap()
}

fn applet<'a>(
    store: &'a mut MemoryStore,
    rng: &'a mut CountingRng,
    provider: &'a EchoProvider,
) -> KeymasterApplet<'a> {
    KeymasterApplet::new(Implementation { rng, provider }, store, AppletConfig::default()).unwrap()
}

/// Send a request, returning the status word and the response items that follow it.
fn send<T: AsCborValue + Code<Ins>>(applet: &mut KeymasterApplet, req: T) -> (u32, Vec<Value>) {
    let ins = req.code() as u8;
    let rsp = applet.process(ins, &req.into_vec().unwrap());
    match read_to_value(&rsp).unwrap() {
        Value::Array(mut items) => {
            let status = u32::from_cbor_value(items.remove(0)).unwrap();
            (status, items)
        }
        value => (u32::from_cbor_value(value).unwrap(), Vec::new()),
    }
}

fn status(code: ErrorCode) -> u32 {
    ResponseStatus::new(code, false).to_word()
}

fn param(tag: Tag, value: KeyParamValue) -> KeyParam {
    KeyParam::new(tag, value).unwrap()
}

fn aes_params() -> Vec<KeyParam> {
    vec![
        param(Tag::Algorithm, KeyParamValue::Enum(Algorithm::Aes as u8)),
        param(Tag::BlockMode, KeyParamValue::EnumList(vec![BlockMode::Cbc as u8])),
        param(Tag::KeySize, KeyParamValue::Integer(128)),
    ]
}

fn begin_req(params: Vec<KeyParam>) -> BeginRequest {
    BeginRequest {
        purpose: KeyPurpose::Encrypt,
        key_blob: b"key".to_vec(),
        params: KeyParams(params),
        auth_token: HardwareAuthToken::default(),
    }
}

fn begin(applet: &mut KeymasterApplet, params: Vec<KeyParam>) -> u64 {
    let (word, body) = send(applet, begin_req(params));
    assert_eq!(word, 0);
    assert_eq!(body.len(), 2);
    assert_eq!(body[0], Value::Map(Vec::new()));
    u64::from_cbor_value(body[1].clone()).unwrap()
}

fn update_req(op_handle: u64, input: &[u8]) -> UpdateRequest {
    UpdateRequest {
        op_handle,
        input: input.to_vec(),
        auth_token: HardwareAuthToken::default(),
        verification_token: VerificationToken::default(),
    }
}

fn finish_req(op_handle: u64, input: &[u8]) -> FinishRequest {
    FinishRequest {
        op_handle,
        input: input.to_vec(),
        signature: Vec::new(),
        auth_token: HardwareAuthToken::default(),
        verification_token: VerificationToken::default(),
    }
}

#[test]
fn test_store_too_small() {
    let mut store = MemoryStore::new(required_store_size(MAX_OPS) - 1).unwrap();
    let mut rng = CountingRng(0);
    let provider = EchoProvider::default();
    let result = KeymasterApplet::new(
        Implementation { rng: &mut rng, provider: &provider },
        &mut store,
        AppletConfig::default(),
    );
    let err = result.err().unwrap();
    assert!(format!("{:?}", err).contains("too small"), "{:?}", err);
}

#[test]
fn test_malformed_commands() {
    let mut store = new_store();
    let mut rng = CountingRng(0);
    let provider = EchoProvider::default();
    let mut applet = applet(&mut store, &mut rng, &provider);

    let tests = [
        // Unknown instruction.
        (0x7f, "80", "1864"),
        // Byte string where the handle should be.
        (Ins::Abort as u8, "8140", "1826"),
        // Trailing data.
        (Ins::Abort as u8, "8101ff", "1826"),
        // Wrong arity.
        (Ins::Abort as u8, "820102", "1826"),
        // Not an array at all.
        (Ins::GetHmacSharingParams as u8, "00", "1826"),
        // Boot state outside its enum.
        (Ins::SetBootParams as u8, "850040400900", "1826"),
    ];
    for (ins, input, want) in tests {
        let data = hex::decode(input).unwrap();
        let rsp = applet.process(ins, &data);
        assert_eq!(hex::encode(rsp), want, "for ins {:#04x} input {}", ins, input);
    }
}

#[test]
fn test_device_state_commands() {
    let mut store = new_store();
    let mut rng = CountingRng(0);
    let provider = EchoProvider::default();
    {
        let mut applet = applet(&mut store, &mut rng, &provider);
        let (word, body) = send(
            &mut applet,
            SetVersionPatchlevelRequest {
                os_version: 130000,
                os_patchlevel: 202401,
                vendor_patchlevel: 20240105,
            },
        );
        assert_eq!((word, body.len()), (0, 0));

        let (word, _) = send(
            &mut applet,
            SetBootParamsRequest {
                boot_patchlevel: 20240105,
                verified_boot_key: vec![0xaa; 32],
                verified_boot_hash: vec![0xbb; 32],
                verified_boot_state: VerifiedBootState::Verified,
                device_boot_locked: DeviceLockState::Locked,
            },
        );
        assert_eq!(word, 0);

        let ids = vec![
            param(Tag::AttestationIdBrand, KeyParamValue::Blob(b"brand".to_vec())),
            param(Tag::AttestationIdModel, KeyParamValue::Blob(b"model".to_vec())),
        ];
        let (word, _) = send(&mut applet, ProvisionAttestIdsRequest { ids: KeyParams(ids) });
        assert_eq!(word, 0);

        let token = VerificationToken { timestamp: 5000, ..Default::default() };
        let (word, _) = send(
            &mut applet,
            DeviceLockedRequest { password_only: true, verification_token: token },
        );
        assert_eq!(word, 0);

        // Only attestation ID tags may be provisioned.
        let ids = vec![param(Tag::KeySize, KeyParamValue::Integer(128))];
        let (word, _) = send(&mut applet, ProvisionAttestIdsRequest { ids: KeyParams(ids) });
        assert_eq!(word, status(ErrorCode::InvalidTag));
    }

    let table = DataTable::new(&mut store).unwrap();
    assert_eq!(table.os_version().unwrap(), Some(130000));
    assert_eq!(table.os_patch_level().unwrap(), Some(202401));
    assert_eq!(table.vendor_patch_level().unwrap(), Some(20240105));
    assert_eq!(table.boot_patch_level().unwrap(), Some(20240105));
    assert_eq!(table.boot_state().unwrap(), Some(VerifiedBootState::Verified));
    assert_eq!(table.device_boot_locked().unwrap(), Some(true));
    let rot = table.root_of_trust().unwrap().unwrap();
    assert_eq!(&rot[..32], &[0xaa; 32]);
    assert_eq!(&rot[32..64], &[0xbb; 32]);
    assert_eq!(table.attestation_id(Tag::AttestationIdBrand).unwrap(), Some(b"brand".to_vec()));
    assert_eq!(table.attestation_id(Tag::AttestationIdModel).unwrap(), Some(b"model".to_vec()));
    assert_eq!(table.attestation_id(Tag::AttestationIdImei).unwrap(), None);
    let flags = table.device_locked().unwrap();
    assert!(flags.locked);
    assert!(flags.password_only);
    assert_eq!(table.device_locked_time().unwrap(), 5000);
}

#[test]
fn test_destroy_attest_ids() {
    let mut store = new_store();
    let mut rng = CountingRng(0);
    let provider = EchoProvider::default();
    {
        let mut applet = applet(&mut store, &mut rng, &provider);
        let ids = vec![param(Tag::AttestationIdSerial, KeyParamValue::Blob(b"1234".to_vec()))];
        let (word, _) = send(&mut applet, ProvisionAttestIdsRequest { ids: KeyParams(ids) });
        assert_eq!(word, 0);
        let (word, _) = send(&mut applet, DestroyAttIdsRequest {});
        assert_eq!(word, 0);
    }
    let table = DataTable::new(&mut store).unwrap();
    assert_eq!(table.attestation_id(Tag::AttestationIdSerial).unwrap(), None);
}

#[test]
fn test_hmac_sharing_nonce_is_stable() {
    let mut store = new_store();
    let mut rng = CountingRng(0);
    let provider = EchoProvider::default();
    let mut applet = applet(&mut store, &mut rng, &provider);

    let (word, mut body) = send(&mut applet, GetHmacSharingParamsRequest {});
    assert_eq!(word, 0);
    let first = HmacSharingParameters::from_cbor_value(body.remove(0)).unwrap();
    assert!(first.seed.is_empty());
    let want: Vec<u8> = (1..=32).collect();
    assert_eq!(first.nonce.to_vec(), want);

    let (word, mut body) = send(&mut applet, GetHmacSharingParamsRequest {});
    assert_eq!(word, 0);
    let second = HmacSharingParameters::from_cbor_value(body.remove(0)).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_operation_lifecycle() {
    let mut store = new_store();
    let mut rng = CountingRng(0);
    let provider = EchoProvider::default();
    let mut applet = applet(&mut store, &mut rng, &provider);

    let handle = begin(&mut applet, aes_params());
    assert_ne!(handle, 0);
    assert_eq!(applet.active_operations().unwrap(), 1);

    let (word, body) = send(&mut applet, update_req(handle, b"abc"));
    assert_eq!(word, 0);
    assert_eq!(body, vec![Value::Bytes(b"abc".to_vec())]);

    let (word, body) = send(&mut applet, finish_req(handle, b"de"));
    assert_eq!(word, 0);
    assert_eq!(body, vec![Value::Bytes(b"abcde".to_vec())]);
    assert_eq!(applet.active_operations().unwrap(), 0);
    assert_eq!(provider.aborted.get(), 0);

    // The handle is gone once finished.
    let (word, body) = send(&mut applet, update_req(handle, b"abc"));
    assert_eq!(word, status(ErrorCode::InvalidOperationHandle));
    assert!(body.is_empty());
    let (word, _) = send(&mut applet, AbortRequest { op_handle: handle });
    assert_eq!(word, status(ErrorCode::InvalidOperationHandle));
}

#[test]
fn test_too_many_operations() {
    let mut store = new_store();
    let mut rng = CountingRng(0);
    let provider = EchoProvider::default();
    let mut applet = applet(&mut store, &mut rng, &provider);

    let handles: Vec<u64> = (0..MAX_OPS).map(|_| begin(&mut applet, aes_params())).collect();
    for (idx, h) in handles.iter().enumerate() {
        assert!(!handles[idx + 1..].contains(h), "duplicate handle {}", h);
    }
    let (word, _) = send(&mut applet, begin_req(aes_params()));
    assert_eq!(word, status(ErrorCode::TooManyOperations));

    let (word, body) = send(&mut applet, AbortRequest { op_handle: handles[1] });
    assert_eq!((word, body.len()), (0, 0));
    assert_eq!(provider.aborted.get(), 1);
    assert_eq!(applet.active_operations().unwrap(), MAX_OPS - 1);

    begin(&mut applet, aes_params());
    assert_eq!(applet.active_operations().unwrap(), MAX_OPS);
}

#[test]
fn test_begin_failures_leave_slots_free() {
    let mut store = new_store();
    let mut rng = CountingRng(0);
    let provider = EchoProvider::default();
    let mut applet = applet(&mut store, &mut rng, &provider);

    let mut req = begin_req(aes_params());
    req.key_blob = b"bad".to_vec();
    for _ in 0..MAX_OPS + 1 {
        let (word, _) = send(&mut applet, req.clone());
        assert_eq!(word, status(ErrorCode::InvalidKeyBlob));
    }
    assert_eq!(applet.active_operations().unwrap(), 0);

    let (word, _) = send(&mut applet, begin_req(Vec::new()));
    assert_eq!(word, status(ErrorCode::UnsupportedAlgorithm));

    let mut params = aes_params();
    params.push(param(Tag::Purpose, KeyParamValue::EnumList(vec![KeyPurpose::Sign as u8])));
    let (word, _) = send(&mut applet, begin_req(params));
    assert_eq!(word, status(ErrorCode::IncompatiblePurpose));

    let mut params = aes_params();
    params[1] = param(Tag::BlockMode, KeyParamValue::EnumList(vec![9]));
    let (word, _) = send(&mut applet, begin_req(params));
    assert_eq!(word, status(ErrorCode::UnsupportedBlockMode));

    for _ in 0..MAX_OPS {
        begin(&mut applet, aes_params());
    }
}

#[test]
fn test_reset_releases_operations() {
    let mut store = new_store();
    let mut rng = CountingRng(0);
    let provider = EchoProvider::default();
    let mut applet = applet(&mut store, &mut rng, &provider);

    let first = begin(&mut applet, aes_params());
    let second = begin(&mut applet, aes_params());
    applet.power_loss();

    // The first response after the reset carries the flag, even when it reports failure.
    let rsp = applet.process(Ins::Update as u8, &update_req(first, b"x").into_vec().unwrap());
    assert_eq!(hex::encode(rsp), "1a4000001c");
    assert_eq!(provider.aborted.get(), 2);
    assert_eq!(applet.active_operations().unwrap(), 0);

    // Subsequent responses do not.
    let (word, _) = send(&mut applet, update_req(second, b"x"));
    assert_eq!(word, status(ErrorCode::InvalidOperationHandle));
    let (word, _) = send(&mut applet, GetHmacSharingParamsRequest {});
    assert_eq!(word, 0);
}

#[test]
fn test_reset_flag_on_success() {
    let mut store = new_store();
    let mut rng = CountingRng(0);
    let provider = EchoProvider::default();
    let mut applet = applet(&mut store, &mut rng, &provider);

    applet.power_loss();
    let (word, body) = send(&mut applet, GetHmacSharingParamsRequest {});
    let rsp_status = ResponseStatus::from_word(word).unwrap();
    assert_eq!(rsp_status, ResponseStatus::new(ErrorCode::Ok, true));
    assert_eq!(body.len(), 1);
}

#[test]
fn test_per_operation_auth() {
    let mut store = new_store();
    let mut rng = CountingRng(0);
    let provider = EchoProvider::default();
    let mut applet = applet(&mut store, &mut rng, &provider);

    let mut params = aes_params();
    params.push(param(Tag::UserSecureId, KeyParamValue::IntegerList(vec![42])));

    // No token: the update fails and the operation is gone.
    let handle = begin(&mut applet, params.clone());
    let (word, _) = send(&mut applet, update_req(handle, b"abc"));
    assert_eq!(word, status(ErrorCode::KeyUserNotAuthenticated));
    assert_eq!(provider.aborted.get(), 1);
    let (word, _) = send(&mut applet, update_req(handle, b"abc"));
    assert_eq!(word, status(ErrorCode::InvalidOperationHandle));

    // A token for some other operation does not help either.
    let handle = begin(&mut applet, params.clone());
    let mut req = update_req(handle, b"abc");
    req.auth_token = HardwareAuthToken {
        challenge: handle.wrapping_add(1),
        authenticator_type: HardwareAuthenticatorType::Password,
        mac: vec![1; 32],
        ..Default::default()
    };
    let (word, _) = send(&mut applet, req);
    assert_eq!(word, status(ErrorCode::KeyUserNotAuthenticated));

    let handle = begin(&mut applet, params);
    let token = HardwareAuthToken {
        challenge: handle,
        authenticator_type: HardwareAuthenticatorType::Password,
        mac: vec![1; 32],
        ..Default::default()
    };
    let mut req = update_req(handle, b"abc");
    req.auth_token = token.clone();
    let (word, _) = send(&mut applet, req);
    assert_eq!(word, 0);
    let mut req = finish_req(handle, b"");
    req.auth_token = token;
    let (word, body) = send(&mut applet, req);
    assert_eq!(word, 0);
    assert_eq!(body, vec![Value::Bytes(b"abc".to_vec())]);
    assert_eq!(applet.active_operations().unwrap(), 0);
}

#[test]
fn test_no_auth_required_overrides_secure_ids() {
    let mut store = new_store();
    let mut rng = CountingRng(0);
    let provider = EchoProvider::default();
    let mut applet = applet(&mut store, &mut rng, &provider);

    let mut params = aes_params();
    params.push(param(Tag::UserSecureId, KeyParamValue::IntegerList(vec![42])));
    params.push(param(Tag::NoAuthRequired, KeyParamValue::True));
    let handle = begin(&mut applet, params);
    let (word, _) = send(&mut applet, update_req(handle, b"abc"));
    assert_eq!(word, 0);
}

#[test]
fn test_timeout_auth_recorded_once() {
    let mut store = new_store();
    let mut rng = CountingRng(0);
    let provider = EchoProvider::default();
    let mut applet = applet(&mut store, &mut rng, &provider);

    let mut params = aes_params();
    params.push(param(Tag::UserSecureId, KeyParamValue::IntegerList(vec![42])));
    params.push(param(Tag::AuthTimeout, KeyParamValue::Integer(300)));
    let handle = begin(&mut applet, params);

    let mut req = update_req(handle, b"abc");
    req.auth_token = HardwareAuthToken {
        timestamp: 777,
        authenticator_type: HardwareAuthenticatorType::Fingerprint,
        mac: vec![2; 32],
        ..Default::default()
    };
    let (word, _) = send(&mut applet, req);
    assert_eq!(word, 0);
    let (_, state) = applet.repository.find(&*applet.store, OpHandle(handle)).unwrap();
    assert_eq!(state.auth_time, 777);

    // Later updates need no token.
    let (word, _) = send(&mut applet, update_req(handle, b"def"));
    assert_eq!(word, 0);
}

fn aad_allowed(applet: &KeymasterApplet, handle: u64) -> bool {
    let (_, state) = applet.repository.find(&*applet.store, OpHandle(handle)).unwrap();
    state.has(FLAG_AAD_ALLOWED)
}

#[test]
fn test_gcm_associated_data_window() {
    let mut store = new_store();
    let mut rng = CountingRng(0);
    let provider = EchoProvider::default();
    let mut applet = applet(&mut store, &mut rng, &provider);

    let mut params = aes_params();
    params[1] = param(Tag::BlockMode, KeyParamValue::EnumList(vec![BlockMode::Gcm as u8]));
    let handle = begin(&mut applet, params);
    assert!(aad_allowed(&applet, handle));

    let (word, _) = send(&mut applet, update_req(handle, b""));
    assert_eq!(word, 0);
    assert!(aad_allowed(&applet, handle));

    let (word, _) = send(&mut applet, update_req(handle, b"data"));
    assert_eq!(word, 0);
    assert!(!aad_allowed(&applet, handle));
}

#[test]
fn test_response_too_large() {
    let mut store = new_store();
    let mut rng = CountingRng(0);
    let provider = EchoProvider::default();
    let config = AppletConfig { max_response_size: 8, ..Default::default() };
    let mut applet = KeymasterApplet::new(
        Implementation { rng: &mut rng, provider: &provider },
        &mut store,
        config,
    )
    .unwrap();
    assert_eq!(applet.config().max_response_size, 8);

    let (word, _) = send(&mut applet, GetHmacSharingParamsRequest {});
    assert_eq!(word, status(ErrorCode::UnknownError));
}
