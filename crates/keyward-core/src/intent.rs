//! Processing of translated payload arrays.
//!
//! Policy payloads are enabled and stored; transfer payloads run through the
//! authorization pipeline under the currently stored session of their kind.
//! Entries are handled in order and a failing entry never stops the rest.

use std::sync::Arc;

use alloy_primitives::B256;
use serde_json::Value;
use tracing::{info, warn};

use crate::error::{KeywardError, KeywardResult};
use crate::pipeline::{Authorization, AuthorizationPipeline, SessionSource};
use crate::policy::{classify, AllowanceKind, Classified, TransferIntent};
use crate::session::{enable, now_ms, SessionBuilder, SessionModule};
use crate::signer::DigestSigner;
use crate::store::AllowanceRecord;
use crate::translate::IntentTranslator;

/// Outcome of one payload.
#[derive(Debug)]
pub enum EntryOutcome {
    /// Policy enabled; `persisted` is false if the store flush failed.
    Enabled {
        index: usize,
        kind: AllowanceKind,
        permission_id: B256,
        persisted: bool,
    },

    /// Transfer submitted and a terminal receipt observed.
    Executed {
        index: usize,
        authorization: Authorization,
    },

    /// Payload matched no known shape.
    Skipped { index: usize, error: KeywardError },

    /// Payload was understood but its enablement or submission failed.
    Failed { index: usize, error: KeywardError },
}

impl EntryOutcome {
    pub fn index(&self) -> usize {
        match self {
            Self::Enabled { index, .. }
            | Self::Executed { index, .. }
            | Self::Skipped { index, .. }
            | Self::Failed { index, .. } => *index,
        }
    }

    pub fn error(&self) -> Option<&KeywardError> {
        match self {
            Self::Skipped { error, .. } | Self::Failed { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Per-entry outcomes of one payload array.
#[derive(Debug, Default)]
pub struct ProcessReport {
    pub outcomes: Vec<EntryOutcome>,

    /// Attestation of the translation the payloads came from.
    pub attestation: Option<B256>,
}

impl ProcessReport {
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|o| match o {
            EntryOutcome::Executed { authorization, .. } => authorization.receipt.success,
            other => other.error().is_none(),
        })
    }

    /// Highest exit code among failed entries; 0 when everything succeeded.
    pub fn exit_code(&self) -> i32 {
        let worst = self
            .outcomes
            .iter()
            .filter_map(EntryOutcome::error)
            .map(KeywardError::exit_code)
            .max()
            .unwrap_or(0);
        if worst == 0 && !self.is_success() {
            2
        } else {
            worst
        }
    }
}

/// Walks payload arrays and dispatches each entry.
pub struct IntentProcessor {
    builder: SessionBuilder,
    module: Arc<dyn SessionModule>,
    principal: Arc<dyn DigestSigner>,
    session_signer: Arc<dyn DigestSigner>,
    pipeline: AuthorizationPipeline,
}

impl IntentProcessor {
    pub fn new(
        builder: SessionBuilder,
        module: Arc<dyn SessionModule>,
        principal: Arc<dyn DigestSigner>,
        session_signer: Arc<dyn DigestSigner>,
        pipeline: AuthorizationPipeline,
    ) -> Self {
        Self {
            builder,
            pipeline: pipeline.with_session_module(module.clone()),
            module,
            principal,
            session_signer,
        }
    }

    pub fn pipeline(&self) -> &AuthorizationPipeline {
        &self.pipeline
    }

    /// Translate `prompt` and process the result.
    pub async fn process_prompt(
        &self,
        translator: &dyn IntentTranslator,
        prompt: &str,
    ) -> KeywardResult<ProcessReport> {
        let translation = translator.translate(prompt).await?;
        let mut report = self.process(&translation.payloads).await;
        report.attestation = Some(translation.attestation);
        Ok(report)
    }

    /// Process every payload in order.
    pub async fn process(&self, payloads: &[Value]) -> ProcessReport {
        let mut outcomes = Vec::with_capacity(payloads.len());
        for (index, payload) in payloads.iter().enumerate() {
            let outcome = match classify(index, payload) {
                Ok(classified) => self.dispatch(index, classified).await,
                Err(error) => {
                    warn!(index, error = %error, "skipping payload");
                    EntryOutcome::Skipped { index, error }
                }
            };
            outcomes.push(outcome);
        }
        ProcessReport {
            outcomes,
            attestation: None,
        }
    }

    async fn dispatch(&self, index: usize, classified: Classified) -> EntryOutcome {
        let result = match classified {
            Classified::Transfer(intent) => self.execute(intent).await.map(|authorization| {
                EntryOutcome::Executed {
                    index,
                    authorization,
                }
            }),
            policy => self.enable_policy(index, &policy).await,
        };
        result.unwrap_or_else(|error| {
            warn!(index, kind = error.kind(), error = %error, "payload failed");
            EntryOutcome::Failed { index, error }
        })
    }

    async fn enable_policy(&self, index: usize, classified: &Classified) -> KeywardResult<EntryOutcome> {
        let policy = self.builder.resolve_policy(classified, now_ms())?;
        let kind = policy.allowance_kind();
        let descriptor =
            self.builder
                .build_session(policy, self.session_signer.address(), None)?;

        let enabled = enable(
            descriptor,
            self.pipeline.account(),
            self.module.as_ref(),
            self.principal.as_ref(),
        )
        .await?;
        let permission_id = enabled.permission_id();

        let persisted = match self
            .pipeline
            .store()
            .put(kind, AllowanceRecord::new(enabled.into_descriptor()))
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(kind = %kind, error = %e, "enabled session not persisted");
                false
            }
        };
        info!(index, kind = %kind, permission_id = %permission_id, persisted, "policy enabled");

        Ok(EntryOutcome::Enabled {
            index,
            kind,
            permission_id,
            persisted,
        })
    }

    async fn execute(&self, intent: TransferIntent) -> KeywardResult<Authorization> {
        let call = self.builder.transfer_call(&intent)?;
        self.pipeline
            .authorize(
                SessionSource::Stored(intent.allowance_kind()),
                vec![call],
                self.session_signer.as_ref(),
            )
            .await
    }
}
