use alloy_primitives::B256;
use sha2::{Digest as _, Sha256};
use sha3::{Digest as _, Keccak256};

pub(crate) fn keccak256(bytes: impl AsRef<[u8]>) -> B256 {
    let mut hasher = Keccak256::new();
    hasher.update(bytes.as_ref());
    B256::from_slice(hasher.finalize().as_slice())
}

/// EIP-191 personal-message hash over a raw 32-byte digest.
pub(crate) fn eip191_hash(message: &[u8]) -> B256 {
    let prefix = format!("\x19Ethereum Signed Message:\n{}", message.len());
    let mut hasher = Keccak256::new();
    hasher.update(prefix.as_bytes());
    hasher.update(message);
    B256::from_slice(hasher.finalize().as_slice())
}

/// SHA-256 of a DER certificate, as raw bytes.
pub(crate) fn sha256_bytes(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let mut out = [0_u8; 32];
    out.copy_from_slice(hasher.finalize().as_slice());
    out
}

/// First four bytes of the Keccak hash of a function signature.
pub(crate) fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    let mut out = [0_u8; 4];
    out.copy_from_slice(&hash[..4]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keccak_of_empty_input() {
        assert_eq!(
            hex::encode(keccak256(b"")),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn test_well_known_selectors() {
        assert_eq!(selector("transfer(address,uint256)"), [0xa9, 0x05, 0x9c, 0xbb]);
        assert_eq!(selector("execute(bytes32,bytes)"), [0xe9, 0xae, 0x5c, 0x53]);
    }

    #[test]
    fn test_sha256_known_vector() {
        assert_eq!(
            hex::encode(sha256_bytes(b"abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_eip191_differs_from_plain_keccak() {
        let digest = [0x11_u8; 32];
        assert_ne!(eip191_hash(&digest), keccak256(digest));
    }
}
