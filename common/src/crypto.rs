//! Abstractions of the cryptographic functionality the applet relies on. The applet never
//! implements primitives itself; an environment supplies them through these traits.

use crate::wire::keymint::{Algorithm, BlockMode, Digest, KeyPurpose, PaddingMode};
use crate::Error;
use alloc::{boxed::Box, vec::Vec};

/// Combined collection of trait implementations that must be provided.
pub struct Implementation<'a> {
    /// Random number generator.
    pub rng: &'a mut dyn Rng,

    /// Source of in-progress cryptographic operations.
    pub provider: &'a dyn CryptoProvider,
}

/// Abstraction of a random number generator that is cryptographically secure
/// and which accepts additional entropy to be mixed in.
pub trait Rng {
    /// Add entropy to the generator's pool.
    fn add_entropy(&mut self, data: &[u8]);
    /// Generate random data.
    fn fill_bytes(&mut self, dest: &mut [u8]);
    /// Return a random `u64` value.
    fn next_u64(&mut self) -> u64 {
        let mut buf = [0u8; 8];
        self.fill_bytes(&mut buf);
        u64::from_le_bytes(buf)
    }
}

/// Parameters that select the primitive behind an operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OperationParams {
    pub purpose: KeyPurpose,
    pub algorithm: Algorithm,
    pub digest: Option<Digest>,
    pub padding: Option<PaddingMode>,
    pub block_mode: Option<BlockMode>,
    /// Key size in bits, zero if not specified.
    pub key_size: u32,
    /// MAC or tag length in bits, zero if not specified.
    pub mac_length: u32,
}

/// Factory for cryptographic operations.
pub trait CryptoProvider {
    /// Start an operation with the key held in `key_blob`.
    fn begin(
        &self,
        params: &OperationParams,
        key_blob: &[u8],
    ) -> Result<Box<dyn CryptoOperation>, Error>;
}

/// Abstraction of an in-progress operation.
pub trait CryptoOperation {
    /// Update operation with data, returning any output produced so far.
    fn update(&mut self, data: &[u8]) -> Result<Vec<u8>, Error>;

    /// Complete operation with final `input` and, for verification, the `signature` to check.
    fn finish(self: Box<Self>, input: &[u8], signature: &[u8]) -> Result<Vec<u8>, Error>;

    /// Abandon the operation, releasing any resources it holds.
    fn abort(self: Box<Self>);
}
