//! Rolling Digest Module
//!
//! Incremental MD5 over a sequence of chunk bodies. The finished digest is
//! interpreted as a big-endian 128-bit integer, which is what the cluster
//! stores as the object checksum and what clients see as the ETag (rendered
//! as 32 lowercase hex characters).

use md5::{Digest, Md5};

/// Incremental MD5 state advanced chunk by chunk.
///
/// The digest must only be advanced with bytes that were durably stored, in
/// ascending chunk index order. That is what keeps the final value equal to
/// `MD5(concat of committed chunk bodies)`.
#[derive(Clone)]
pub struct RollingDigest {
    hasher: Md5,
}

impl RollingDigest {
    pub fn new() -> Self {
        Self { hasher: Md5::new() }
    }

    /// Advance the digest with the next committed chunk body.
    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    /// Consume the state and return the 16-byte MD5 digest.
    pub fn finalize(self) -> [u8; 16] {
        self.hasher.finalize().into()
    }

    /// Consume the state and return the digest as a big-endian u128.
    pub fn finalize_u128(self) -> u128 {
        u128::from_be_bytes(self.finalize())
    }
}

impl Default for RollingDigest {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot MD5 of a complete body, as a big-endian u128.
pub fn md5_u128(bytes: &[u8]) -> u128 {
    let mut hasher = Md5::new();
    hasher.update(bytes);
    u128::from_be_bytes(hasher.finalize().into())
}

/// Render a 128-bit digest the way clients expect an ETag: 32 lowercase hex.
pub fn format_etag(digest: u128) -> String {
    format!("{:032x}", digest)
}
