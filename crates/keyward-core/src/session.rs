//! Session descriptors, the session builder and enablement.
//!
//! A [`SessionDescriptor`] names a session signer and the policies it operates
//! under. It becomes usable only through [`SessionDescriptor::into_enabled`],
//! which checks the principal's enablement proof; everything that authorizes
//! operations takes the resulting [`EnabledSession`].

use std::ops::Deref;

use alloy_primitives::{Address, FixedBytes, B256, U256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::abi::{self, Token};
use crate::digest::{keccak256, selector};
use crate::error::{KeywardError, KeywardResult};
use crate::policy::{AllowanceKind, Classified, PolicyKind, TokenDirectory, TransferAsset, TransferIntent};
use crate::signer::{DigestSigner, RawSignature};
use crate::types::{decimal, Call, SmartAccount};

/// Selector of native value transfers (no call data).
pub const NATIVE_SELECTOR: FixedBytes<4> = FixedBytes::ZERO;

/// One allowed (destination, selector) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionTarget {
    pub target: Address,
    pub selector: FixedBytes<4>,
}

impl ActionTarget {
    fn matches(&self, call: &Call) -> bool {
        self.target == call.to && self.selector.0 == call.selector()
    }
}

/// Principal's signed authorization of one descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnablementProof {
    /// Permission id the proof was produced for.
    pub permission_id: B256,

    /// Digest returned by the session module.
    pub digest: B256,

    /// Master identity that signed.
    pub principal: Address,

    pub signature: RawSignature,
}

/// One delegated authorization scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    /// Identity that signs operations under this session.
    pub session_signer: Address,

    pub policies: Vec<PolicyKind>,

    /// Allowed call targets. Empty means no restriction beyond the policies.
    #[serde(default)]
    pub target_actions: Vec<ActionTarget>,

    pub salt: B256,

    #[serde(with = "decimal::u64_string")]
    pub chain_id: u64,

    pub allow_paymaster: bool,

    /// Absent until enablement completes.
    #[serde(default)]
    pub enablement: Option<EnablementProof>,
}

impl SessionDescriptor {
    /// Deterministic encoding of everything but the enablement proof.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128);
        out.extend_from_slice(b"keyward.session.v1");
        out.extend_from_slice(self.session_signer.as_slice());
        out.extend_from_slice(self.salt.as_slice());
        out.extend_from_slice(&self.chain_id.to_be_bytes());
        out.push(u8::from(self.allow_paymaster));

        out.extend_from_slice(&(self.policies.len() as u32).to_be_bytes());
        for policy in &self.policies {
            policy.write_canonical(&mut out);
        }

        out.extend_from_slice(&(self.target_actions.len() as u32).to_be_bytes());
        for action in &self.target_actions {
            out.extend_from_slice(action.target.as_slice());
            out.extend_from_slice(action.selector.as_slice());
        }
        out
    }

    /// Identifier of this descriptor on the session module.
    pub fn permission_id(&self) -> B256 {
        keccak256(self.canonical_bytes())
    }

    /// Store slot of the descriptor, from its first policy.
    pub fn kind(&self) -> Option<AllowanceKind> {
        self.policies.first().map(PolicyKind::allowance_kind)
    }

    /// Check the enablement proof against `account`.
    ///
    /// `expected_digest` is the digest the session module derives for this
    /// descriptor; the proof must carry exactly that digest, signed by the
    /// account owner.
    pub fn verify_enablement(
        &self,
        account: &SmartAccount,
        expected_digest: B256,
    ) -> KeywardResult<()> {
        let owner = account.owner;
        let proof = self.enablement.as_ref().ok_or_else(|| KeywardError::NotEnabled {
            reason: "descriptor carries no enablement signature".to_string(),
        })?;

        let permission_id = self.permission_id();
        if proof.permission_id != permission_id {
            return Err(KeywardError::NotEnabled {
                reason: format!(
                    "proof is for permission {} but descriptor encodes {}",
                    proof.permission_id, permission_id
                ),
            });
        }
        if proof.digest != expected_digest {
            return Err(KeywardError::NotEnabled {
                reason: format!(
                    "proof signs digest {} but permission {permission_id} requires {expected_digest}",
                    proof.digest
                ),
            });
        }
        if proof.principal != owner {
            return Err(KeywardError::NotEnabled {
                reason: format!("enabled by {} instead of owner {owner}", proof.principal),
            });
        }

        let recovered = proof
            .signature
            .recover(proof.digest)
            .map_err(|e| KeywardError::NotEnabled {
                reason: e.to_string(),
            })?;
        if recovered != owner {
            return Err(KeywardError::NotEnabled {
                reason: format!("enablement signed by {recovered}, expected {owner}"),
            });
        }
        Ok(())
    }

    /// Promote to an [`EnabledSession`] if the proof verifies against the
    /// digest `module` derives for this descriptor.
    pub async fn into_enabled(
        self,
        account: &SmartAccount,
        module: &dyn SessionModule,
    ) -> KeywardResult<EnabledSession> {
        let expected = fetch_digest(module, account, &self).await?;
        self.promote(account, expected)
    }

    fn promote(self, account: &SmartAccount, expected_digest: B256) -> KeywardResult<EnabledSession> {
        self.verify_enablement(account, expected_digest)?;
        Ok(EnabledSession {
            permission_id: self.permission_id(),
            descriptor: self,
        })
    }
}

/// A descriptor whose enablement proof has been verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnabledSession {
    descriptor: SessionDescriptor,
    permission_id: B256,
}

impl EnabledSession {
    pub fn descriptor(&self) -> &SessionDescriptor {
        &self.descriptor
    }

    pub fn into_descriptor(self) -> SessionDescriptor {
        self.descriptor
    }

    pub fn permission_id(&self) -> B256 {
        self.permission_id
    }

    /// Local pre-flight of `calls` against the session's policies.
    ///
    /// On-chain enforcement stays authoritative; this only fails fast on
    /// operations that are certain to be rejected.
    pub fn permits(&self, calls: &[Call], now_ms: u64) -> KeywardResult<()> {
        let descriptor = &self.descriptor;

        if !descriptor.target_actions.is_empty() {
            for call in calls {
                if !descriptor.target_actions.iter().any(|a| a.matches(call)) {
                    return Err(KeywardError::ActionNotPermitted {
                        target: call.to,
                        selector: format!("0x{}", hex::encode(call.selector())),
                    });
                }
            }
        }

        let total_value = calls
            .iter()
            .fold(U256::ZERO, |acc, c| acc.saturating_add(c.value));

        for policy in &descriptor.policies {
            match policy {
                PolicyKind::TimeWindow {
                    valid_after,
                    valid_until,
                } => {
                    if now_ms < *valid_after {
                        return Err(KeywardError::SessionNotActive {
                            reason: format!("valid from {valid_after}, now {now_ms}"),
                        });
                    }
                    if now_ms >= *valid_until {
                        return Err(KeywardError::SessionNotActive {
                            reason: format!("expired at {valid_until}, now {now_ms}"),
                        });
                    }
                }
                PolicyKind::ValueLimit { limit, target } => {
                    if total_value > *limit {
                        return Err(KeywardError::ValueLimitExceeded {
                            requested: total_value.to_string(),
                            limit: limit.to_string(),
                        });
                    }
                    if let Some(target) = target {
                        if let Some(call) =
                            calls.iter().find(|c| !c.value.is_zero() && c.to != *target)
                        {
                            return Err(KeywardError::ActionNotPermitted {
                                target: call.to,
                                selector: format!("0x{}", hex::encode(call.selector())),
                            });
                        }
                    }
                }
                PolicyKind::SpendLimit { token, limit } => {
                    let spent = calls
                        .iter()
                        .filter(|c| c.to == *token)
                        .filter_map(erc20_transfer_amount)
                        .fold(U256::ZERO, U256::saturating_add);
                    if spent > *limit {
                        return Err(KeywardError::ValueLimitExceeded {
                            requested: spent.to_string(),
                            limit: limit.to_string(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

impl Deref for EnabledSession {
    type Target = SessionDescriptor;

    fn deref(&self) -> &Self::Target {
        &self.descriptor
    }
}

fn erc20_transfer_amount(call: &Call) -> Option<U256> {
    if call.selector() != selector("transfer(address,uint256)") || call.data.len() < 68 {
        return None;
    }
    Some(U256::from_be_slice(&call.data[36..68]))
}

/// Builds descriptors from classified payloads.
#[derive(Debug, Clone)]
pub struct SessionBuilder {
    chain_id: u64,
    allow_paymaster: bool,
    tokens: TokenDirectory,
}

impl SessionBuilder {
    pub fn new(chain_id: u64, allow_paymaster: bool, tokens: TokenDirectory) -> Self {
        Self {
            chain_id,
            allow_paymaster,
            tokens,
        }
    }

    pub fn tokens(&self) -> &TokenDirectory {
        &self.tokens
    }

    /// Turn a classified policy payload into a [`PolicyKind`].
    ///
    /// Resolves token symbols and converts relative seconds to absolute epoch
    /// milliseconds at `now_ms`. Transfers are not policies and are refused.
    pub fn resolve_policy(&self, classified: &Classified, now_ms: u64) -> KeywardResult<PolicyKind> {
        match classified {
            Classified::SpendLimit { token, limit } => Ok(PolicyKind::SpendLimit {
                token: self.tokens.resolve(token)?,
                limit: *limit,
            }),
            Classified::TimeWindow {
                valid_after_secs,
                valid_until_secs,
            } => Ok(PolicyKind::TimeWindow {
                valid_after: relative_to_absolute_ms(now_ms, *valid_after_secs),
                valid_until: relative_to_absolute_ms(now_ms, *valid_until_secs),
            }),
            Classified::ValueLimit { limit, target } => Ok(PolicyKind::ValueLimit {
                limit: *limit,
                target: *target,
            }),
            Classified::Transfer(_) => Err(KeywardError::Enablement {
                message: "a transfer is not a policy and cannot be enabled".to_string(),
            }),
        }
    }

    /// Compose one policy into a fresh, unenabled descriptor.
    ///
    /// With a transfer trigger, the transfer's call target becomes the only
    /// allowed action.
    pub fn build_session(
        &self,
        policy: PolicyKind,
        session_signer: Address,
        trigger: Option<&TransferIntent>,
    ) -> KeywardResult<SessionDescriptor> {
        let target_actions = match trigger {
            Some(intent) => vec![self.action_for(intent)?],
            None => Vec::new(),
        };

        let descriptor = SessionDescriptor {
            session_signer,
            policies: vec![policy],
            target_actions,
            salt: B256::from(rand::random::<[u8; 32]>()),
            chain_id: self.chain_id,
            allow_paymaster: self.allow_paymaster,
            enablement: None,
        };
        debug!(
            permission_id = %descriptor.permission_id(),
            signer = %session_signer,
            "built session descriptor"
        );
        Ok(descriptor)
    }

    /// Call that executes `intent`.
    pub fn transfer_call(&self, intent: &TransferIntent) -> KeywardResult<Call> {
        match &intent.asset {
            TransferAsset::Native { value } => Ok(Call::native(intent.to, *value)),
            TransferAsset::Token { token, amount } => {
                let token = self.tokens.resolve(token)?;
                let data = abi::encode_call(
                    selector("transfer(address,uint256)"),
                    &[Token::Address(intent.to), Token::Uint(*amount)],
                );
                Ok(Call {
                    to: token,
                    value: U256::ZERO,
                    data: data.into(),
                })
            }
        }
    }

    fn action_for(&self, intent: &TransferIntent) -> KeywardResult<ActionTarget> {
        let call = self.transfer_call(intent)?;
        Ok(ActionTarget {
            target: call.to,
            selector: FixedBytes(call.selector()),
        })
    }
}

fn relative_to_absolute_ms(now_ms: u64, secs: u64) -> u64 {
    now_ms.saturating_add(secs.saturating_mul(1000))
}

/// Current time in epoch milliseconds.
pub fn now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
}

/// On-chain session module that issues enablement digests.
#[async_trait]
pub trait SessionModule: Send + Sync {
    /// Digest the principal must sign to enable `descriptor` on `account`.
    ///
    /// Returned as raw bytes; anything other than 32 bytes is malformed.
    async fn enablement_digest(
        &self,
        account: &SmartAccount,
        descriptor: &SessionDescriptor,
    ) -> KeywardResult<Vec<u8>>;
}

/// Offline session module with a deterministic digest:
/// `keccak(abi.encode(typeHash, chainId, account, permissionId))`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalSessionModule;

impl LocalSessionModule {
    pub fn digest(account: &SmartAccount, permission_id: B256) -> B256 {
        let type_hash =
            keccak256(b"EnableSession(uint256 chainId,address account,bytes32 permissionId)");
        keccak256(abi::encode(&[
            Token::Word(type_hash),
            Token::Uint(U256::from(account.chain_id)),
            Token::Address(account.address),
            Token::Word(permission_id),
        ]))
    }
}

#[async_trait]
impl SessionModule for LocalSessionModule {
    async fn enablement_digest(
        &self,
        account: &SmartAccount,
        descriptor: &SessionDescriptor,
    ) -> KeywardResult<Vec<u8>> {
        Ok(Self::digest(account, descriptor.permission_id()).to_vec())
    }
}

async fn fetch_digest(
    module: &dyn SessionModule,
    account: &SmartAccount,
    descriptor: &SessionDescriptor,
) -> KeywardResult<B256> {
    let raw = module
        .enablement_digest(account, descriptor)
        .await
        .map_err(|e| match e {
            KeywardError::Enablement { .. } => e,
            other => KeywardError::Enablement {
                message: format!("session module unavailable: {other}"),
            },
        })?;
    if raw.len() != 32 {
        return Err(KeywardError::Enablement {
            message: format!("malformed enablement digest: {} bytes", raw.len()),
        });
    }
    Ok(B256::from_slice(&raw))
}

/// Enable `descriptor` with the principal's master identity.
///
/// Module failures and malformed digests are [`KeywardError::Enablement`];
/// nothing is retried and no other key is tried.
pub async fn enable(
    mut descriptor: SessionDescriptor,
    account: &SmartAccount,
    module: &dyn SessionModule,
    principal: &dyn DigestSigner,
) -> KeywardResult<EnabledSession> {
    if principal.address() != account.owner {
        return Err(KeywardError::Enablement {
            message: format!(
                "signer {} is not the account owner {}",
                principal.address(),
                account.owner
            ),
        });
    }

    let permission_id = descriptor.permission_id();
    let digest = fetch_digest(module, account, &descriptor).await?;

    let signature = principal.sign_digest(digest).await?;
    descriptor.enablement = Some(EnablementProof {
        permission_id,
        digest,
        principal: principal.address(),
        signature,
    });

    let enabled = descriptor.promote(account, digest)?;
    info!(
        permission_id = %permission_id,
        kind = ?enabled.kind(),
        "session enabled"
    );
    Ok(enabled)
}
