// Integration test: drive the applet through the host-side API.

use kmse_common::crypto::Implementation;
use kmse_common::table::DataTable;
use kmse_hal::keymint::{Device, MAX_DATA_SIZE};
use kmse_hal::{channel_execute, Error, Response};
use kmse_ta::repository::MAX_OPS;
use kmse_ta::{AppletConfig, KeymasterApplet};
use kmse_tests::{new_store, FakeRng, TaChannel, XorProvider, XOR_TAG_SIZE};
use kmse_wire::keymint::{
    Algorithm, BlockMode, Digest, ErrorCode, HardwareAuthToken, HardwareAuthenticatorType,
    KeyParam, KeyParamValue, KeyPurpose, Tag, VerificationToken, VerifiedBootState,
};
use kmse_wire::{GetHmacSharingParamsRequest, GetHmacSharingParamsResponse};
use std::sync::{Arc, Mutex};

fn param(tag: Tag, value: KeyParamValue) -> KeyParam {
    KeyParam::new(tag, value).unwrap()
}

fn aes_params() -> Vec<KeyParam> {
    vec![
        param(Tag::Algorithm, KeyParamValue::Enum(Algorithm::Aes as u8)),
        param(Tag::BlockMode, KeyParamValue::EnumList(vec![BlockMode::Ctr as u8])),
        param(Tag::KeySize, KeyParamValue::Integer(128)),
    ]
}

fn hmac_params() -> Vec<KeyParam> {
    vec![
        param(Tag::Algorithm, KeyParamValue::Enum(Algorithm::Hmac as u8)),
        param(Tag::Digest, KeyParamValue::EnumList(vec![Digest::Sha256 as u8])),
        param(Tag::MacLength, KeyParamValue::Integer(64)),
    ]
}

fn status_of(err: &Error) -> (ErrorCode, bool) {
    match err {
        Error::Status(status) => (status.error_code, status.power_reset),
        e => panic!("unexpected error {:?}", e),
    }
}

#[test]
fn test_provision_and_operate() {
    let mut store = new_store(MAX_OPS);
    let mut rng = FakeRng::default();
    let provider = XorProvider::default();
    {
        let applet = KeymasterApplet::new(
            Implementation { rng: &mut rng, provider: &provider },
            &mut store,
            AppletConfig::default(),
        )
        .unwrap();
        let channel = Arc::new(Mutex::new(TaChannel::new(applet)));
        let device = Device::new(channel.clone());

        device
            .set_boot_params(20240105, &[0x11; 32], &[0x22; 32], VerifiedBootState::Verified, true)
            .unwrap();
        device.set_version_patchlevel(140000, 202406, 20240605).unwrap();
        device
            .provision_attestation_ids(vec![param(
                Tag::AttestationIdManufacturer,
                KeyParamValue::Blob(b"acme".to_vec()),
            )])
            .unwrap();
        let first = device.get_hmac_sharing_parameters().unwrap();
        let second = device.get_hmac_sharing_parameters().unwrap();
        assert_eq!(first, second);

        // Input bigger than one message is split across updates.
        let msg: Vec<u8> = (0..MAX_DATA_SIZE + 100).map(|i| i as u8).collect();
        let op = device.begin(KeyPurpose::Encrypt, b"key", aes_params(), None).unwrap();
        let mut ct = op.update(&msg[..100], None, None).unwrap();
        ct.extend_from_slice(&op.finish(&msg[100..], &[], None, None).unwrap());
        assert_eq!(ct.len(), msg.len());
        assert_ne!(ct, msg);

        let op = device.begin(KeyPurpose::Decrypt, b"key", aes_params(), None).unwrap();
        let pt = op.finish(&ct, &[], None, None).unwrap();
        assert_eq!(pt, msg);

        let op = device.begin(KeyPurpose::Sign, b"mac key", hmac_params(), None).unwrap();
        op.update(b"to be signed", None, None).unwrap();
        let tag = op.finish(&[], &[], None, None).unwrap();
        assert_eq!(tag.len(), XOR_TAG_SIZE);

        let op = device.begin(KeyPurpose::Verify, b"mac key", hmac_params(), None).unwrap();
        assert!(op.finish(b"to be signed", &tag, None, None).unwrap().is_empty());

        let op = device.begin(KeyPurpose::Verify, b"mac key", hmac_params(), None).unwrap();
        let err = op.finish(b"to be forged", &tag, None, None).unwrap_err();
        assert_eq!(status_of(&err), (ErrorCode::VerificationFailed, false));

        let token = VerificationToken { timestamp: 99, ..Default::default() };
        device.device_locked(false, Some(token)).unwrap();

        assert_eq!(channel.lock().unwrap().applet().active_operations().unwrap(), 0);
    }
    assert_eq!(provider.aborted(), 0);

    let table = DataTable::new(&mut store).unwrap();
    assert_eq!(table.os_version().unwrap(), Some(140000));
    assert_eq!(table.boot_key().unwrap(), Some([0x11; 32]));
    assert_eq!(
        table.attestation_id(Tag::AttestationIdManufacturer).unwrap(),
        Some(b"acme".to_vec())
    );
    let flags = table.device_locked().unwrap();
    assert!(flags.locked);
    assert!(!flags.password_only);
    assert_eq!(table.device_locked_time().unwrap(), 99);
}

#[test]
fn test_power_loss_reported_once() {
    let mut store = new_store(MAX_OPS);
    let mut rng = FakeRng::default();
    let provider = XorProvider::default();
    let applet = KeymasterApplet::new(
        Implementation { rng: &mut rng, provider: &provider },
        &mut store,
        AppletConfig::default(),
    )
    .unwrap();
    let channel = Arc::new(Mutex::new(TaChannel::new(applet)));
    let device = Device::new(channel.clone());

    let ops: Vec<_> = (0..MAX_OPS)
        .map(|_| device.begin(KeyPurpose::Encrypt, b"key", aes_params(), None).unwrap())
        .collect();
    channel.lock().unwrap().power_loss();

    let err = ops[0].update(b"data", None, None).unwrap_err();
    assert_eq!(status_of(&err), (ErrorCode::InvalidOperationHandle, true));
    assert_eq!(provider.aborted(), MAX_OPS);

    // Later commands see no flag, and the other handles are gone too.
    let err = ops[1].update(b"data", None, None).unwrap_err();
    assert_eq!(status_of(&err), (ErrorCode::InvalidOperationHandle, false));
    let rsp: Response<GetHmacSharingParamsResponse> =
        channel_execute(&mut *channel.lock().unwrap(), GetHmacSharingParamsRequest {}).unwrap();
    assert!(!rsp.power_reset);

    // Every slot is free again.
    for _ in 0..MAX_OPS {
        device.begin(KeyPurpose::Encrypt, b"key", aes_params(), None).unwrap();
    }
}

#[test]
fn test_operation_table_limits() {
    let mut store = new_store(2);
    let mut rng = FakeRng::default();
    let provider = XorProvider::default();
    let config = AppletConfig { max_operations: 2, ..Default::default() };
    let applet = KeymasterApplet::new(
        Implementation { rng: &mut rng, provider: &provider },
        &mut store,
        config,
    )
    .unwrap();
    let device = Device::new(Arc::new(Mutex::new(TaChannel::new(applet))));

    let first = device.begin(KeyPurpose::Encrypt, b"key", aes_params(), None).unwrap();
    let _second = device.begin(KeyPurpose::Encrypt, b"key", aes_params(), None).unwrap();
    let err = device.begin(KeyPurpose::Encrypt, b"key", aes_params(), None).err().unwrap();
    assert_eq!(status_of(&err), (ErrorCode::TooManyOperations, false));

    first.abort().unwrap();
    assert_eq!(provider.aborted(), 1);
    let third = device.begin(KeyPurpose::Encrypt, b"key", aes_params(), None).unwrap();
    assert_eq!(third.update(b"x", None, None).unwrap().len(), 1);
    third.abort().unwrap();

    // A provider refusal does not consume a slot.
    let err = device.begin(KeyPurpose::AgreeKey, b"key", aes_params(), None).err().unwrap();
    assert_eq!(status_of(&err), (ErrorCode::UnsupportedPurpose, false));
    let err = device.begin(KeyPurpose::Encrypt, b"", aes_params(), None).err().unwrap();
    assert_eq!(status_of(&err), (ErrorCode::InvalidKeyBlob, false));
    let _third = device.begin(KeyPurpose::Encrypt, b"key", aes_params(), None).unwrap();
    assert_eq!(provider.aborted(), 2);
}

#[test]
fn test_user_auth_per_operation() {
    let mut store = new_store(MAX_OPS);
    let mut rng = FakeRng::default();
    let provider = XorProvider::default();
    let applet = KeymasterApplet::new(
        Implementation { rng: &mut rng, provider: &provider },
        &mut store,
        AppletConfig::default(),
    )
    .unwrap();
    let device = Device::new(Arc::new(Mutex::new(TaChannel::new(applet))));

    let mut params = hmac_params();
    params.push(param(Tag::UserSecureId, KeyParamValue::IntegerList(vec![0x1234])));

    let op = device.begin(KeyPurpose::Sign, b"mac key", params.clone(), None).unwrap();
    let err = op.update(b"data", None, None).unwrap_err();
    assert_eq!(status_of(&err), (ErrorCode::KeyUserNotAuthenticated, false));
    // The operation is gone on both sides.
    assert_eq!(status_of(&op.abort().unwrap_err()), (ErrorCode::InvalidOperationHandle, false));

    let op = device.begin(KeyPurpose::Sign, b"mac key", params, None).unwrap();
    let token = HardwareAuthToken {
        challenge: op.handle().unwrap(),
        user_id: 0x1234,
        authenticator_type: HardwareAuthenticatorType::Password,
        timestamp: 1000,
        mac: vec![0x42; 32],
        ..Default::default()
    };
    op.update(b"data", Some(&token), None).unwrap();
    let tag = op.finish(&[], &[], Some(&token), None).unwrap();
    assert_eq!(tag.len(), XOR_TAG_SIZE);
    assert_eq!(provider.aborted(), 1);
}
