//! Header Hash Kernel Seam
//!
//! The production proof-of-work kernel is a native library maintained
//! outside this repository. The pool only ever needs `H(bytes) -> 32
//! bytes`, so the kernel is a trait object injected where submissions
//! are validated; tests substitute a scripted kernel.

use sha2::{Digest, Sha256};

/// An opaque header-hash function
pub trait HeaderHasher: Send + Sync {
    /// Hash a serialized mineable header
    fn hash_header(&self, header_bytes: &[u8]) -> [u8; 32];
}

/// Double-SHA-256 reference kernel
#[derive(Debug, Default, Clone, Copy)]
pub struct DoubleSha256Kernel;

impl HeaderHasher for DoubleSha256Kernel {
    fn hash_header(&self, header_bytes: &[u8]) -> [u8; 32] {
        let first = Sha256::digest(header_bytes);
        let second = Sha256::digest(first);
        let mut out = [0u8; 32];
        out.copy_from_slice(&second);
        out
    }
}
