//! Operation authorization pipeline.
//!
//! One call to [`AuthorizationPipeline::authorize`] runs the full sequence for
//! one operation:
//!
//! 1. resolve the enabled session (store lookup or a freshly enabled one)
//! 2. guard destinations against the denylist, then local policy pre-flight
//! 3. derive the validator's nonce key and read the nonce
//! 4. build the unsigned operation
//! 5. mock-sign and estimate
//! 6. fix gas fields and compute the canonical hash
//! 7. sign the hash with the session key
//! 8. submit
//! 9. wait for a terminal receipt, bounded by the configured timeout
//! 10. record a newly installed session in the allowance store
//!
//! Steps 1-4 fail before any relayer traffic. Nothing is retried; a receipt
//! timeout leaves the operation's outcome unknown.

use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, B256};
use tracing::{debug, info, warn};

use crate::client::Relayer;
use crate::denylist::Denylist;
use crate::digest::selector;
use crate::error::{KeywardError, KeywardResult};
use crate::operation::{nonce_key, SessionSignature, UnsignedOperation};
use crate::policy::AllowanceKind;
use crate::session::{now_ms, EnabledSession, LocalSessionModule, SessionModule};
use crate::signer::DigestSigner;
use crate::store::{AllowanceRecord, AllowanceStore};
use crate::types::{Call, OperationReceipt, SmartAccount};

/// Where the session for an operation comes from.
#[derive(Debug, Clone)]
pub enum SessionSource {
    /// Currently enabled session of this kind in the allowance store.
    Stored(AllowanceKind),

    /// Session enabled by the caller and not yet installed on-chain.
    Fresh(EnabledSession),
}

/// Result of one authorization.
#[derive(Debug, Clone)]
pub struct Authorization {
    /// Canonical hash the session key signed.
    pub op_hash: B256,

    pub receipt: OperationReceipt,

    /// Whether this operation installed the session and it was recorded.
    pub recorded: bool,
}

/// Drives operations from session lookup to receipt.
pub struct AuthorizationPipeline {
    account: SmartAccount,
    session_validator: Address,
    store: AllowanceStore,
    relayer: Arc<dyn Relayer>,
    denylist: Arc<dyn Denylist>,
    module: Arc<dyn SessionModule>,
    receipt_timeout: Duration,
    poll_interval: Duration,
}

impl AuthorizationPipeline {
    pub fn new(
        account: SmartAccount,
        session_validator: Address,
        store: AllowanceStore,
        relayer: Arc<dyn Relayer>,
        denylist: Arc<dyn Denylist>,
    ) -> Self {
        Self {
            account,
            session_validator,
            store,
            relayer,
            denylist,
            module: Arc::new(LocalSessionModule),
            receipt_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_secs(2),
        }
    }

    /// Session module that re-derives enablement digests for stored sessions.
    pub fn with_session_module(mut self, module: Arc<dyn SessionModule>) -> Self {
        self.module = module;
        self
    }

    /// Bound on step 9.
    pub fn with_receipt_timeout(mut self, timeout: Duration) -> Self {
        self.receipt_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn account(&self) -> &SmartAccount {
        &self.account
    }

    pub fn store(&self) -> &AllowanceStore {
        &self.store
    }

    /// Authorize and submit `calls` under the session from `source`.
    pub async fn authorize(
        &self,
        source: SessionSource,
        calls: Vec<Call>,
        signer: &dyn DigestSigner,
    ) -> KeywardResult<Authorization> {
        // 1. resolve session
        let (session, kind, installed) = self.resolve(source).await?;
        if signer.address() != session.session_signer {
            return Err(KeywardError::Signer {
                message: format!(
                    "signer {} is not the session signer {}",
                    signer.address(),
                    session.session_signer
                ),
            });
        }
        debug!(kind = %kind, permission_id = %session.permission_id(), installed, "session resolved");

        // 2. guard
        self.guard(&calls)?;
        session.permits(&calls, now_ms())?;

        // 3. nonce
        let key = nonce_key(self.session_validator);
        let nonce = self.relayer.nonce(&self.account, key).await?;

        // 4. build
        let unsigned = UnsignedOperation::new(&self.account, nonce, &calls);
        let encoding = if installed {
            SessionSignature::Use {
                permission_id: session.permission_id(),
            }
        } else {
            let proof = session
                .enablement
                .as_ref()
                .ok_or_else(|| KeywardError::NotEnabled {
                    reason: "enabled session lost its proof".to_string(),
                })?;
            SessionSignature::Enable {
                permission_id: session.permission_id(),
                descriptor: session.canonical_bytes(),
                enable_signature: proof.signature,
            }
        };
        debug!(nonce = %nonce, calls = calls.len(), "operation built");

        // 5. mock-sign and estimate
        let fees = self.relayer.fee_params().await?;
        let mock = unsigned.with_fees(fees).mock_sign(&encoding);
        let gas = self.relayer.estimate(&mock).await?;

        // 6. canonical hash
        let hashed = mock.apply_estimate(gas, session.allow_paymaster);
        let op_hash = hashed.hash();
        debug!(op_hash = %op_hash, "operation hashed");

        // 7. real signature
        let signed = hashed.sign(signer, &encoding).await?;

        // 8. submit
        let relayer_hash = self.relayer.submit(&signed).await?;
        if relayer_hash != op_hash {
            warn!(
                op_hash = %op_hash,
                relayer_hash = %relayer_hash,
                "relayer reported a different operation hash"
            );
        }

        // 9. receipt
        let receipt = self.await_receipt(relayer_hash).await?;
        if receipt.success {
            info!(op_hash = %relayer_hash, tx_hash = ?receipt.tx_hash, "operation confirmed");
        } else {
            warn!(
                op_hash = %relayer_hash,
                reason = receipt.reason.as_deref().unwrap_or("unknown"),
                "operation failed on-chain"
            );
        }

        // 10. record
        let recorded = if receipt.success && !installed {
            self.record(kind, session, relayer_hash).await
        } else {
            false
        };

        Ok(Authorization {
            op_hash,
            receipt,
            recorded,
        })
    }

    async fn resolve(
        &self,
        source: SessionSource,
    ) -> KeywardResult<(EnabledSession, AllowanceKind, bool)> {
        match source {
            SessionSource::Stored(kind) => {
                let record = self
                    .store
                    .get(kind)
                    .await
                    .ok_or(KeywardError::NoActiveSession { kind })?;
                let installed = record.op_hash.is_some();
                let session = record
                    .session
                    .into_enabled(&self.account, self.module.as_ref())
                    .await?;
                Ok((session, kind, installed))
            }
            SessionSource::Fresh(session) => {
                let kind = session.kind().ok_or_else(|| KeywardError::NotEnabled {
                    reason: "session carries no policy".to_string(),
                })?;
                Ok((session, kind, false))
            }
        }
    }

    fn guard(&self, calls: &[Call]) -> KeywardResult<()> {
        for call in calls {
            for destination in destinations(call) {
                if self.denylist.is_blocked(&destination) {
                    warn!(destination = %destination, "destination blocked");
                    return Err(KeywardError::DestinationBlocked { destination });
                }
            }
        }
        Ok(())
    }

    async fn await_receipt(&self, op_hash: B256) -> KeywardResult<OperationReceipt> {
        let poll = async {
            loop {
                match self.relayer.receipt(op_hash).await {
                    Ok(Some(receipt)) => return receipt,
                    Ok(None) => debug!(op_hash = %op_hash, "receipt pending"),
                    Err(e) => warn!(op_hash = %op_hash, error = %e, "receipt lookup failed"),
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        };

        tokio::time::timeout(self.receipt_timeout, poll)
            .await
            .map_err(|_| {
                warn!(op_hash = %op_hash, "receipt timeout, outcome unknown");
                KeywardError::ReceiptTimeout {
                    op_hash,
                    timeout: self.receipt_timeout,
                }
            })
    }

    async fn record(&self, kind: AllowanceKind, session: EnabledSession, op_hash: B256) -> bool {
        let record = AllowanceRecord::new(session.into_descriptor()).with_op_hash(op_hash);
        match self.store.put(kind, record).await {
            Ok(()) => true,
            Err(e) => {
                warn!(kind = %kind, error = %e, "session installed but not persisted");
                false
            }
        }
    }
}

/// Addresses a call moves value to: the call target, plus the recipient of
/// an ERC-20 `transfer`.
fn destinations(call: &Call) -> Vec<Address> {
    let mut out = vec![call.to];
    if call.selector() == selector("transfer(address,uint256)") && call.data.len() >= 36 {
        out.push(Address::from_slice(&call.data[16..36]));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::U256;

    #[test]
    fn test_destinations_include_token_recipient() {
        let recipient = Address::repeat_byte(0xde);
        let mut data = selector("transfer(address,uint256)").to_vec();
        data.extend_from_slice(recipient.into_word().as_slice());
        data.extend_from_slice(&U256::from(5_u64).to_be_bytes::<32>());
        let call = Call {
            to: Address::repeat_byte(0x01),
            value: U256::ZERO,
            data: data.into(),
        };

        assert_eq!(
            destinations(&call),
            vec![Address::repeat_byte(0x01), recipient]
        );
        assert_eq!(
            destinations(&Call::native(recipient, U256::from(1_u64))),
            vec![recipient]
        );
    }
}
