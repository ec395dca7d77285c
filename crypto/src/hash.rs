//! Various hash functions

use sha2::{Digest, Sha256 as Sha256Hasher};

/// Secure hashing algorithm v2
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Sha256(pub [u8; 32]);

/// Calculate the SHA256 hash
pub fn calculate_sha256(bytes: &[u8]) -> Sha256 {
    let mut hasher = Sha256Hasher::new();
    hasher.update(bytes);
    Sha256(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_empty_input() {
        let Sha256(hash) = calculate_sha256(b"");

        assert_eq!(
            hash[..4],
            [0xe3, 0xb0, 0xc4, 0x42],
            "unexpected SHA256 of the empty string"
        );
    }

    #[test]
    fn sha256_known_vector() {
        let Sha256(hash) = calculate_sha256(b"abc");

        assert_eq!(hash[..4], [0xba, 0x78, 0x16, 0xbf]);
        assert_eq!(hash[28..], [0xf2, 0x00, 0x15, 0xad]);
    }
}
