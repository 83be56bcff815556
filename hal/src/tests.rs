use super::*;
use crate::keymint::{Device, MAX_DATA_SIZE};
use kmse_wire::{AbortRequest, DestroyAttIdsRequest, EmptyResponse};
use kmse_wire::keymint::{KeyParam, KeyParamValue, KeyPurpose, Tag, VerifiedBootState};
use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::{Arc, Mutex};

/// Channel that records requests and replays canned responses in order.
#[derive(Clone, Debug, Default)]
struct TestChannel {
    reqs: Arc<Mutex<Vec<(u8, Vec<u8>)>>>,
    rsps: Arc<Mutex<VecDeque<Vec<u8>>>>,
}

impl TestChannel {
    fn new(rsps: &[&str]) -> Self {
        let channel = Self::default();
        for rsp in rsps {
            channel.rsps.lock().unwrap().push_back(hex::decode(rsp).unwrap());
        }
        channel
    }
    fn req_data(&self) -> Vec<(u8, String)> {
        self.reqs.lock().unwrap().iter().map(|(ins, data)| (*ins, hex::encode(data))).collect()
    }
    fn req_count(&self) -> usize {
        self.reqs.lock().unwrap().len()
    }
}

impl SerializedChannel for TestChannel {
    const MAX_SIZE: usize = 4096;
    fn execute(&mut self, ins: u8, serialized_req: &[u8]) -> Result<Vec<u8>> {
        self.reqs.lock().unwrap().push((ins, serialized_req.to_vec()));
        self.rsps
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| Error::Channel("no response queued".to_string()))
    }
}

fn device(channel: &TestChannel) -> Device<TestChannel> {
    Device::new(Arc::new(Mutex::new(channel.clone())))
}

#[test]
fn test_method_roundtrip() {
    let channel = TestChannel::new(&["8100"]);
    let imp = device(&channel);

    imp.set_version_patchlevel(1, 2, 3).unwrap();

    let want_req = concat!(
        "83", // 3-arr (SetVersionPatchlevelRequest)
        "01", // os_version
        "02", // os_patchlevel
        "03", // vendor_patchlevel
    );
    assert_eq!(channel.req_data(), vec![(Ins::SetVersionPatchlevel as u8, want_req.to_string())]);
}

#[test]
fn test_method_err_roundtrip() {
    let channel = TestChannel::new(&[
        "02",         // bare status word: UnsupportedPurpose
        "1a40000026", // power reset + InvalidArgument
    ]);
    let imp = device(&channel);

    let result = imp.destroy_attestation_ids();
    match result {
        Err(Error::Status(status)) => {
            assert_eq!(status, ResponseStatus::new(ErrorCode::UnsupportedPurpose, false))
        }
        other => panic!("unexpected result {:?}", other),
    }
    assert_eq!(channel.req_data(), vec![(Ins::DestroyAttIds as u8, "80".to_string())]);

    let err = imp.destroy_attestation_ids().unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);
    assert!(matches!(err, Error::Status(ResponseStatus { power_reset: true, .. })));
}

#[test]
fn test_success_with_reset_flag() {
    let channel = TestChannel::new(&["811a40000000"]);
    let imp = device(&channel);
    let rsp: Response<EmptyResponse> = {
        let mut ch = channel.clone();
        channel_execute(&mut ch, DestroyAttIdsRequest {}).unwrap()
    };
    assert!(rsp.power_reset);
    // The device handle shares the channel, and nothing is left queued.
    let result = imp.destroy_attestation_ids();
    assert!(matches!(result, Err(Error::Channel(_))));
}

#[test]
fn test_boot_params() {
    let channel = TestChannel::new(&["8100"]);
    let imp = device(&channel);
    imp.set_boot_params(7, &[0xaa], &[0xbb, 0xcc], VerifiedBootState::SelfSigned, true).unwrap();
    let want_req = concat!(
        "85",     // 5-arr (SetBootParamsRequest)
        "07",     // boot_patchlevel
        "41aa",   // verified_boot_key
        "42bbcc", // verified_boot_hash
        "01",     // SelfSigned
        "01",     // Locked
    );
    assert_eq!(channel.req_data(), vec![(Ins::SetBootParams as u8, want_req.to_string())]);
}

#[test]
fn test_hmac_sharing_params() {
    let nonce = "0102030405060708091011121314151617181920212223242526272829303132";
    let rsp = format!("8200824058 20{}", nonce).replace(' ', "");
    let channel = TestChannel::new(&[&rsp]);
    let imp = device(&channel);
    let params = imp.get_hmac_sharing_parameters().unwrap();
    assert!(params.seed.is_empty());
    assert_eq!(hex::encode(params.nonce), nonce);
}

#[test]
fn test_request_too_large() {
    let channel = TestChannel::new(&[]);
    let imp = device(&channel);
    let ids = vec![KeyParam::new(Tag::AttestationIdBrand, KeyParamValue::Blob(vec![0; 5000]))
        .unwrap()];
    let err = imp.provision_attestation_ids(ids).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidInputLength);
    assert_eq!(channel.req_count(), 0);
}

const BEGIN_RSP: &str = concat!(
    "83",                 // 3-arr
    "00",                 // status
    "a0",                 // no output parameters
    "1b0102030405060708", // operation handle
);

#[test]
fn test_operation_update_in_chunks() {
    let channel = TestChannel::new(&[BEGIN_RSP, "82004161", "82004162", "8200426364"]);
    let imp = device(&channel);

    let op = imp.begin(KeyPurpose::Encrypt, &[0x01], vec![], None).unwrap();
    assert_eq!(op.handle().unwrap(), 0x0102030405060708);
    assert!(op.params().0.is_empty());

    let input = vec![0x5a; MAX_DATA_SIZE + 10];
    let output = op.update(&input, None, None).unwrap();
    assert_eq!(output, b"ab");

    let output = op.finish(&[], &[], None, None).unwrap();
    assert_eq!(output, b"cd");

    let reqs = channel.req_data();
    let ins: Vec<u8> = reqs.iter().map(|(ins, _)| *ins).collect();
    assert_eq!(
        ins,
        vec![Ins::Begin as u8, Ins::Update as u8, Ins::Update as u8, Ins::Finish as u8]
    );
    assert_eq!(
        reqs[0].1,
        concat!(
            "84",             // 4-arr (BeginRequest)
            "00",             // Encrypt
            "4101",           // key blob
            "a0",             // no parameters
            "86000000000040", // empty auth token
        )
    );
    // The second chunk holds what the first could not.
    assert!(reqs[2].1.starts_with("841b01020304050607084a5a5a"));

    // Finished operations are gone.
    let err = op.update(&[1], None, None).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidOperationHandle);
    assert_eq!(channel.req_count(), 4);
}

#[test]
fn test_operation_failure_invalidates() {
    let channel = TestChannel::new(&[BEGIN_RSP, "181a"]);
    let imp = device(&channel);
    let op = imp.begin(KeyPurpose::Sign, &[0x01], vec![], None).unwrap();

    let err = op.update(&[1, 2, 3], None, None).unwrap_err();
    assert_eq!(err.code(), ErrorCode::KeyUserNotAuthenticated);
    let err = op.abort().unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidOperationHandle);
    assert_eq!(channel.req_count(), 2);
}

#[test]
fn test_operation_abort() {
    let channel = TestChannel::new(&[BEGIN_RSP, "8100"]);
    let imp = device(&channel);
    let op = imp.begin(KeyPurpose::Sign, &[0x01], vec![], None).unwrap();
    op.abort().unwrap();
    assert_eq!(channel.req_data()[1], (Ins::Abort as u8, "811b0102030405060708".to_string()));
    assert!(op.handle().is_err());
}

#[test]
fn test_split_rsp() {
    let tests = [
        ("00", ErrorCode::Ok, false, 0),
        ("8100", ErrorCode::Ok, false, 0),
        ("83000102", ErrorCode::Ok, false, 2),
        ("1a40000000", ErrorCode::Ok, true, 0),
        ("181c", ErrorCode::InvalidOperationHandle, false, 0),
    ];
    for (input, code, power_reset, len) in tests {
        let (status, items) = split_rsp(&hex::decode(input).unwrap()).unwrap();
        assert_eq!(status, ResponseStatus::new(code, power_reset), "for {}", input);
        assert_eq!(items.len(), len, "for {}", input);
    }

    let bad = [
        "80",         // no status word
        "40",         // wrong type
        "1a00001234", // not an error code
        "8100ff",     // trailing data
    ];
    for input in bad {
        assert!(split_rsp(&hex::decode(input).unwrap()).is_err(), "for {}", input);
    }
}

#[test]
fn test_message_channel() {
    let mut framed = vec![0, 0, 0, 2];
    framed.extend_from_slice(&[0x81, 0x00]);
    let mut channel = MessageChannel::new(Cursor::new(framed), Vec::new());

    let rsp: Response<EmptyResponse> =
        channel_execute(&mut channel, AbortRequest { op_handle: 3 }).unwrap();
    assert!(!rsp.power_reset);
    assert_eq!(hex::encode(&channel.w), "33000000028103");

    // Nothing left to read.
    let result = channel.execute(Ins::Abort as u8, &[0x81, 0x03]);
    assert!(matches!(result, Err(Error::Channel(_))));
}

#[test]
fn test_read_msg_truncated() {
    let mut r = Cursor::new(vec![0, 0, 0, 4, 0x01]);
    assert!(matches!(read_msg(&mut r), Err(Error::Channel(_))));
}
