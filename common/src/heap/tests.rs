use super::*;
use crate::expect_err;
use crate::record::{ByteBlob, Integer, Record};

#[test]
fn test_new_bounds() {
    assert!(Heap::new(0).is_err());
    assert!(Heap::new(u16::MAX as usize + 1).is_err());
    let heap = Heap::new(u16::MAX as usize).unwrap();
    assert_eq!(heap.capacity(), 65535);
    assert_eq!(heap.used(), 0);
    assert_eq!(heap.available(), 65535);
    assert!(!heap.reset_event_occurred());
}

#[test]
fn test_instance_layout() {
    let mut heap = Heap::new(64).unwrap();
    let a = heap.instance(RecordType::ByteBlob, 4).unwrap();
    let b = heap.instance(RecordType::Integer, 8).unwrap();
    assert_eq!(a.offset(), 0);
    assert_eq!(b.offset(), (TLV_HEADER_SIZE + 4) as u16);
    assert_eq!(heap.used(), 2 * TLV_HEADER_SIZE + 12);
    assert_eq!(heap.kind(a).unwrap(), RecordType::ByteBlob);
    assert_eq!(heap.payload_len(b).unwrap(), 8);
    assert_eq!(hex::encode(&heap.buf[..TLV_HEADER_SIZE]), "010004");
}

#[test]
fn test_alloc_exhaustion() {
    let mut heap = Heap::new(16).unwrap();
    heap.alloc(10).unwrap();
    heap.alloc(6).unwrap();
    assert_eq!(heap.available(), 0);
    let result = heap.alloc(1);
    assert!(matches!(result, Err(Error::Alloc(_))));
    let result = heap.instance(RecordType::ByteBlob, 0);
    assert!(matches!(result, Err(Error::Alloc(_))));
}

#[test]
fn test_payload_kind_checked() {
    let mut heap = Heap::new(64).unwrap();
    let addr = heap.instance(RecordType::ByteBlob, 2).unwrap();
    assert_eq!(heap.payload(addr, RecordType::ByteBlob).unwrap(), &[0, 0]);
    let result = heap.payload(addr, RecordType::Integer);
    expect_err!(result, "not Integer");
    let result = Integer::cast(&heap, addr);
    expect_err!(result, "UnknownError");
}

#[test]
fn test_stale_address_after_reset() {
    let mut heap = Heap::new(64).unwrap();
    let blob = ByteBlob::from_slice(&mut heap, b"abc").unwrap();
    let epoch = heap.epoch();
    heap.reset();
    assert_eq!(heap.epoch(), epoch + 1);
    // The same offset is reused in the new generation.
    let other = ByteBlob::from_slice(&mut heap, b"xyz").unwrap();
    assert_eq!(other.addr().offset(), blob.addr().offset());
    let result = blob.data(&heap);
    expect_err!(result, "address from epoch 0 used in 1");
    assert_eq!(other.data(&heap).unwrap(), b"xyz");
}

#[test]
fn test_reset_reuse_zero_fills() {
    let mut heap = Heap::new(64).unwrap();
    ByteBlob::from_slice(&mut heap, &[0xff; 8]).unwrap();
    heap.reset();
    let blob = ByteBlob::instance(&mut heap, 8).unwrap();
    assert_eq!(blob.data(&heap).unwrap(), &[0; 8]);
}

#[test]
fn test_address_beyond_cursor() {
    let mut heap = Heap::new(64).unwrap();
    heap.instance(RecordType::ByteBlob, 1).unwrap();
    let result = heap.addr_at(40).and_then(|addr| heap.kind(addr));
    expect_err!(result, "out of bounds");
    let result = heap.addr_at(UNSET);
    expect_err!(result, "unset record slot");
}

#[test]
fn test_clean_zeroizes() {
    let mut heap = Heap::new(32).unwrap();
    ByteBlob::from_slice(&mut heap, &[0x55; 5]).unwrap();
    let scratch = heap.alloc_reclaimable(4).unwrap();
    heap.scratch_mut(&scratch).unwrap().fill(0x66);
    heap.clean();
    assert!(heap.buf.iter().all(|b| *b == 0));
    assert_eq!(heap.used(), 0);
    assert_eq!(heap.available(), 32);
    assert!(!heap.reset_event_occurred());
    let result = heap.scratch_mut(&scratch);
    expect_err!(result, "not live");
}

#[test]
fn test_reclaimable_lifo() {
    let mut heap = Heap::new(100).unwrap();
    heap.alloc(10).unwrap();
    let first = heap.alloc_reclaimable(20).unwrap();
    let second = heap.alloc_reclaimable(30).unwrap();
    assert_eq!(heap.available(), 40);
    heap.scratch_mut(&second).unwrap().fill(1);

    let result = heap.reclaim(first);
    expect_err!(result, "out of order");
    heap.reclaim(second).unwrap();
    assert_eq!(heap.available(), 70);
    // Forward allocation cannot cross into outstanding scratch space.
    let result = heap.alloc(71);
    assert!(matches!(result, Err(Error::Alloc(_))));
}

#[test]
fn test_reclaimable_limits() {
    let mut heap = Heap::new(100).unwrap();
    let result = heap.alloc_reclaimable(50);
    assert!(matches!(result, Err(Error::Alloc("scratch request too large"))));
    heap.alloc(60).unwrap();
    // Scratch space may end exactly at the forward cursor but not cross it.
    let result = heap.alloc_reclaimable(41);
    assert!(matches!(result, Err(Error::Alloc("scratch region exhausted"))));
    let scratch = heap.alloc_reclaimable(40).unwrap();
    assert_eq!(scratch.len(), 40);
    assert_eq!(heap.available(), 0);
    assert!(heap.reset_event_occurred());
    let result = heap.alloc(1);
    assert!(matches!(result, Err(Error::Alloc("arena exhausted"))));
    heap.reclaim(scratch).unwrap();
    assert!(!heap.reset_event_occurred());
}

#[test]
fn test_power_loss_detected() {
    let mut heap = Heap::new(64).unwrap();
    let blob = ByteBlob::from_slice(&mut heap, b"secret").unwrap();
    heap.power_loss();
    assert!(heap.reset_event_occurred());
    assert!(heap.buf.iter().all(|b| *b == 0));
    assert!(blob.data(&heap).is_err());
    heap.on_process();
    assert!(!heap.reset_event_occurred());
    assert_eq!(heap.available(), 64);
}
