//! Fake collaborators for driving the applet end to end, plus checks of their basic behaviour.

// Explicitly include alloc because macros from `kmse_common` assume it.
extern crate alloc;

use kmse_common::crypto::{CryptoOperation, CryptoProvider, OperationParams, Rng};
use kmse_common::nvm::MemoryStore;
use kmse_common::{km_err, Error};
use kmse_hal::SerializedChannel;
use kmse_ta::repository::required_store_size;
use kmse_ta::KeymasterApplet;
use kmse_wire::keymint::KeyPurpose;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Length of the tag produced by [`XorProvider`] signing operations.
pub const XOR_TAG_SIZE: usize = 8;

/// Create a store big enough for the data table and `max_ops` operation slots.
pub fn new_store(max_ops: usize) -> MemoryStore {
    match MemoryStore::new(required_store_size(max_ops)) {
        Ok(store) => store,
        Err(e) => panic!("failed to allocate store: {:?}", e),
    }
}

/// Deterministic xorshift generator.
#[derive(Clone, Debug)]
pub struct FakeRng(u64);

impl Default for FakeRng {
    fn default() -> Self {
        Self(0x2545_f491_4f6c_dd1d)
    }
}

impl Rng for FakeRng {
    fn add_entropy(&mut self, data: &[u8]) {
        for b in data {
            self.0 = self.0.rotate_left(8) ^ (*b as u64);
        }
        if self.0 == 0 {
            self.0 = 1;
        }
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for chunk in dest.chunks_mut(8) {
            self.0 ^= self.0 << 13;
            self.0 ^= self.0 >> 7;
            self.0 ^= self.0 << 17;
            chunk.copy_from_slice(&self.0.to_le_bytes()[..chunk.len()]);
        }
    }
}

/// Provider of toy operations keyed by the key blob itself. Encryption and decryption XOR the
/// data with the repeated key; signing produces an [`XOR_TAG_SIZE`]-byte XOR fold of the keyed
/// data, which verification recomputes and compares.
#[derive(Clone, Debug, Default)]
pub struct XorProvider {
    aborted: Arc<AtomicUsize>,
}

impl XorProvider {
    /// Number of operations abandoned so far.
    pub fn aborted(&self) -> usize {
        self.aborted.load(Ordering::SeqCst)
    }
}

impl CryptoProvider for XorProvider {
    fn begin(
        &self,
        params: &OperationParams,
        key_blob: &[u8],
    ) -> Result<Box<dyn CryptoOperation>, Error> {
        if key_blob.is_empty() {
            return Err(km_err!(InvalidKeyBlob, "empty key blob"));
        }
        match params.purpose {
            KeyPurpose::Encrypt | KeyPurpose::Decrypt | KeyPurpose::Sign | KeyPurpose::Verify => {}
            p => return Err(km_err!(UnsupportedPurpose, "{:?} not supported", p)),
        }
        Ok(Box::new(XorOperation {
            purpose: params.purpose,
            key: key_blob.to_vec(),
            pos: 0,
            tag: [0; XOR_TAG_SIZE],
            aborted: self.aborted.clone(),
        }))
    }
}

struct XorOperation {
    purpose: KeyPurpose,
    key: Vec<u8>,
    pos: usize,
    tag: [u8; XOR_TAG_SIZE],
    aborted: Arc<AtomicUsize>,
}

impl XorOperation {
    fn apply(&mut self, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len());
        for b in data {
            let keyed = b ^ self.key[self.pos % self.key.len()];
            self.tag[self.pos % XOR_TAG_SIZE] ^= keyed;
            self.pos += 1;
            out.push(keyed);
        }
        out
    }
}

impl CryptoOperation for XorOperation {
    fn update(&mut self, data: &[u8]) -> Result<Vec<u8>, Error> {
        let out = self.apply(data);
        match self.purpose {
            KeyPurpose::Sign | KeyPurpose::Verify => Ok(Vec::new()),
            _ => Ok(out),
        }
    }

    fn finish(mut self: Box<Self>, input: &[u8], signature: &[u8]) -> Result<Vec<u8>, Error> {
        let out = self.apply(input);
        match self.purpose {
            KeyPurpose::Sign => Ok(self.tag.to_vec()),
            KeyPurpose::Verify if signature == self.tag => Ok(Vec::new()),
            KeyPurpose::Verify => Err(km_err!(VerificationFailed, "tag mismatch")),
            _ => Ok(out),
        }
    }

    fn abort(self: Box<Self>) {
        self.aborted.fetch_add(1, Ordering::SeqCst);
    }
}

/// Channel that hands requests straight to an in-process applet.
pub struct TaChannel<'a> {
    applet: KeymasterApplet<'a>,
}

impl<'a> TaChannel<'a> {
    pub fn new(applet: KeymasterApplet<'a>) -> Self {
        Self { applet }
    }

    /// Drop the applet's transient memory, as a card reset would.
    pub fn power_loss(&mut self) {
        self.applet.power_loss();
    }

    pub fn applet(&self) -> &KeymasterApplet<'a> {
        &self.applet
    }
}

impl core::fmt::Debug for TaChannel<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TaChannel").field("config", self.applet.config()).finish()
    }
}

impl SerializedChannel for TaChannel<'_> {
    const MAX_SIZE: usize = kmse_wire::DEFAULT_MAX_SIZE;

    fn execute(&mut self, ins: u8, serialized_req: &[u8]) -> kmse_hal::Result<Vec<u8>> {
        Ok(self.applet.process(ins, serialized_req))
    }
}

/// Test basic [`Rng`] functionality.
pub fn test_rng<R: Rng>(rng: &mut R) {
    let u1 = rng.next_u64();
    let u2 = rng.next_u64();
    assert_ne!(u1, u2);

    let mut b1 = [0u8; 16];
    let mut b2 = [0u8; 16];
    rng.fill_bytes(&mut b1);
    rng.fill_bytes(&mut b2);
    assert_ne!(b1, b2);

    rng.add_entropy(&b1);
    rng.add_entropy(&[]);
    rng.fill_bytes(&mut b1);
    assert_ne!(b1, b2);
}

/// Test that an encrypt then decrypt pair from `provider` restores the plaintext.
pub fn test_cipher_round_trip<P: CryptoProvider>(provider: &P, params: &OperationParams) {
    let msg = b"the quick brown fox";
    let encrypt = OperationParams { purpose: KeyPurpose::Encrypt, ..*params };
    let mut op = provider.begin(&encrypt, b"key").unwrap();
    let mut ct = op.update(&msg[..5]).unwrap();
    ct.extend_from_slice(&op.finish(&msg[5..], &[]).unwrap());
    assert_ne!(&ct[..], &msg[..]);

    let decrypt = OperationParams { purpose: KeyPurpose::Decrypt, ..*params };
    let op = provider.begin(&decrypt, b"key").unwrap();
    let pt = op.finish(&ct, &[]).unwrap();
    assert_eq!(&pt[..], &msg[..]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use kmse_wire::keymint::{Algorithm, BlockMode};

    fn params(purpose: KeyPurpose) -> OperationParams {
        OperationParams {
            purpose,
            algorithm: Algorithm::Aes,
            digest: None,
            padding: None,
            block_mode: Some(BlockMode::Ctr),
            key_size: 128,
            mac_length: 0,
        }
    }

    #[test]
    fn test_fake_rng() {
        test_rng(&mut FakeRng::default());
    }

    #[test]
    fn test_xor_cipher() {
        test_cipher_round_trip(&XorProvider::default(), &params(KeyPurpose::Encrypt));
    }

    #[test]
    fn test_xor_sign_verify() {
        let provider = XorProvider::default();
        let mut op = provider.begin(&params(KeyPurpose::Sign), b"k").unwrap();
        assert!(op.update(b"hello").unwrap().is_empty());
        let tag = op.finish(b" world", &[]).unwrap();
        assert_eq!(tag.len(), XOR_TAG_SIZE);

        let op = provider.begin(&params(KeyPurpose::Verify), b"k").unwrap();
        assert!(op.finish(b"hello world", &tag).unwrap().is_empty());

        let op = provider.begin(&params(KeyPurpose::Verify), b"k").unwrap();
        let result = op.finish(b"hello there", &tag);
        kmse_common::expect_err!(result, "tag mismatch");

        let op = provider.begin(&params(KeyPurpose::Sign), b"k").unwrap();
        op.abort();
        assert_eq!(provider.aborted(), 1);

        let result = provider.begin(&params(KeyPurpose::AgreeKey), b"k").map(|_op| ());
        kmse_common::expect_err!(result, "not supported");
        let result = provider.begin(&params(KeyPurpose::Sign), b"").map(|_op| ());
        kmse_common::expect_err!(result, "empty key blob");
    }
}
