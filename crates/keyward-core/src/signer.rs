//! secp256k1 signing identities.
//!
//! Both the principal (master identity, used only for enablement) and the
//! session key sign 32-byte digests with the EIP-191 personal-message prefix
//! and produce 65-byte `r || s || v` signatures with `v` in {27, 28}.

use std::fmt;

use alloy_primitives::{Address, B256};
use async_trait::async_trait;
use k256::ecdsa::{RecoveryId, Signature as EcdsaSignature, SigningKey, VerifyingKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::digest::{eip191_hash, keccak256};
use crate::error::{KeywardError, KeywardResult};

/// Length of an encoded signature.
pub const SIGNATURE_LEN: usize = 65;

/// 65-byte recoverable signature.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RawSignature(pub [u8; SIGNATURE_LEN]);

/// Placeholder used during fee estimation.
///
/// Well-formed (low-s, v = 28) so validators that parse the signature before
/// failing do not short-circuit gas accounting, but it recovers to no key
/// anyone holds.
pub const MOCK_SIGNATURE: RawSignature = {
    let mut bytes = [0xff_u8; SIGNATURE_LEN];
    bytes[32] = 0x7f;
    bytes[64] = 0x1c;
    RawSignature(bytes)
};

impl RawSignature {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn from_slice(bytes: &[u8]) -> KeywardResult<Self> {
        let arr: [u8; SIGNATURE_LEN] = bytes.try_into().map_err(|_| KeywardError::Signer {
            message: format!("signature must be {SIGNATURE_LEN} bytes, got {}", bytes.len()),
        })?;
        Ok(Self(arr))
    }

    /// Signer of `digest` (EIP-191 prehashed), if the signature is valid.
    pub fn recover(&self, digest: B256) -> KeywardResult<Address> {
        let sig = EcdsaSignature::try_from(&self.0[..64]).map_err(|e| KeywardError::Signer {
            message: format!("invalid ECDSA signature bytes: {e}"),
        })?;
        let recovery_id = normalize_recovery_id(self.0[64])?;
        let prehash = eip191_hash(digest.as_slice());
        let key = VerifyingKey::recover_from_prehash(prehash.as_slice(), &sig, recovery_id)
            .map_err(|e| KeywardError::Signer {
                message: format!("failed recovering signer: {e}"),
            })?;
        Ok(address_of(&key))
    }
}

impl fmt::Debug for RawSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawSignature(0x{})", hex::encode(self.0))
    }
}

impl Serialize for RawSignature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(self.0)))
    }
}

impl<'de> Deserialize<'de> for RawSignature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let bytes = hex::decode(raw.trim_start_matches("0x")).map_err(serde::de::Error::custom)?;
        Self::from_slice(&bytes).map_err(serde::de::Error::custom)
    }
}

fn normalize_recovery_id(raw: u8) -> KeywardResult<RecoveryId> {
    let id = match raw {
        27 | 28 => raw - 27,
        0 | 1 => raw,
        _ => {
            return Err(KeywardError::Signer {
                message: "signature recovery id must be 0/1 or 27/28".to_string(),
            })
        }
    };
    RecoveryId::try_from(id).map_err(|_| KeywardError::Signer {
        message: "signature recovery id is invalid".to_string(),
    })
}

fn address_of(key: &VerifyingKey) -> Address {
    let encoded = key.to_encoded_point(false);
    // Uncompressed SEC1: 0x04 || x || y
    let hash = keccak256(&encoded.as_bytes()[1..]);
    Address::from_slice(&hash[12..])
}

/// Something that can sign operation and enablement digests.
///
/// Remote signers (hardware wallets, KMS) implement this as well; failures
/// surface as [`KeywardError::Signer`] and are never retried.
#[async_trait]
pub trait DigestSigner: Send + Sync {
    /// Public identity of the signer.
    fn address(&self) -> Address;

    /// Sign a 32-byte digest with the EIP-191 prefix.
    async fn sign_digest(&self, digest: B256) -> KeywardResult<RawSignature>;
}

/// In-process secp256k1 key.
pub struct LocalSigner {
    key: SigningKey,
    address: Address,
}

impl LocalSigner {
    /// Parse a hex secret (with or without `0x`).
    pub fn from_hex(secret: &str) -> KeywardResult<Self> {
        let bytes = hex::decode(secret.trim().trim_start_matches("0x")).map_err(|e| {
            KeywardError::Signer {
                message: format!("invalid key hex: {e}"),
            }
        })?;
        let key = SigningKey::from_slice(&bytes).map_err(|e| KeywardError::Signer {
            message: format!("invalid secp256k1 key: {e}"),
        })?;
        Ok(Self::from_key(key))
    }

    /// Fresh random key, used for new session signers.
    pub fn random() -> Self {
        Self::from_key(SigningKey::random(&mut rand::thread_rng()))
    }

    fn from_key(key: SigningKey) -> Self {
        let address = address_of(key.verifying_key());
        Self { key, address }
    }

    /// Hex secret, for handing a freshly generated session key to its holder.
    pub fn secret_hex(&self) -> String {
        format!("0x{}", hex::encode(self.key.to_bytes()))
    }

    fn sign_sync(&self, digest: B256) -> KeywardResult<RawSignature> {
        let prehash = eip191_hash(digest.as_slice());
        let (sig, recid) = self
            .key
            .sign_prehash_recoverable(prehash.as_slice())
            .map_err(|e| KeywardError::Signer {
                message: format!("signing failed: {e}"),
            })?;
        let mut out = [0_u8; SIGNATURE_LEN];
        out[..64].copy_from_slice(&sig.to_bytes());
        out[64] = recid.to_byte() + 27;
        Ok(RawSignature(out))
    }
}

impl fmt::Debug for LocalSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalSigner")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl DigestSigner for LocalSigner {
    fn address(&self) -> Address {
        self.address
    }

    async fn sign_digest(&self, digest: B256) -> KeywardResult<RawSignature> {
        self.sign_sync(digest)
    }
}
