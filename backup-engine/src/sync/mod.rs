//! Delta-sync primitives built on fast_rsync.

pub mod apply;
pub mod delta;
pub mod signature;

use sha2::{Digest, Sha256};

pub use signature::{FileRecord, FileSignature, SignatureIndex, SignatureSet};

/// Lowercase hex SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
