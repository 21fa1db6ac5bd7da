//! Scoped session keys for smart accounts, driven by natural-language intent.
//!
//! A principal describes what an agent may do ("spend up to 1000 USDC",
//! "valid for a day"); an external service translates that into policy
//! payloads; this crate turns each policy into a session descriptor enabled by
//! the principal's master key, stores it per kind, and later authorizes ledger
//! operations with the session key only:
//!
//! - Policy classification and session building ([`policy`], [`session`])
//! - Persistent allowance store, one session per kind ([`store`])
//! - Two-phase (mock, then real) operation signing ([`operation`])
//! - The authorization pipeline and relayer client ([`pipeline`], [`client`])
//! - Certificate pinning for the translation channel ([`pinning`])
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use keyward_core::{
//!     AllowanceStore, AuthorizationPipeline, BundlerClient, DigestSigner, IntentProcessor,
//!     KeywardConfig, LocalSessionModule, LocalSigner, SessionBuilder, StaticDenylist,
//! };
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = KeywardConfig::from_env()?;
//! let owner = Arc::new(LocalSigner::from_hex(&std::env::var("KEYWARD_OWNER_KEY")?)?);
//! let session_key = Arc::new(LocalSigner::from_hex(&std::env::var("KEYWARD_SESSION_KEY")?)?);
//!
//! let pipeline = AuthorizationPipeline::new(
//!     config.smart_account(owner.address())?,
//!     config.session_validator,
//!     AllowanceStore::open(config.allowances_path()?).await,
//!     Arc::new(BundlerClient::from_config(&config)?),
//!     Arc::new(StaticDenylist::new(config.denylist.clone())),
//! );
//! let processor = IntentProcessor::new(
//!     SessionBuilder::new(config.chain_id, config.allow_paymaster, config.token_directory()),
//!     Arc::new(LocalSessionModule),
//!     owner,
//!     session_key,
//!     pipeline,
//! );
//!
//! let payloads = serde_json::from_str::<Vec<serde_json::Value>>(
//!     r#"[{"token":"USDC","limit":1000},{"validAfter":0,"validUntil":86400}]"#,
//! )?;
//! let report = processor.process(&payloads).await;
//! println!("exit code {}", report.exit_code());
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//!
//! | Environment Variable | Description |
//! |---------------------|-------------|
//! | `KEYWARD_TRANSLATOR_URL` | Translation service URL (https) |
//! | `KEYWARD_TRANSLATOR_PIN` | SHA-256 fingerprint of the translator's leaf certificate |
//! | `KEYWARD_BUNDLER_URL` | ERC-4337 bundler endpoint |
//! | `KEYWARD_RPC_URL` | Chain RPC for nonce reads (default: Base Sepolia) |
//! | `KEYWARD_ACCOUNT` | Smart account address |
//! | `KEYWARD_ALLOWANCES_FILE` | Allowance store path (default: data dir `keyward/allowances.json`) |
//! | `KEYWARD_RECEIPT_TIMEOUT` | Receipt wait bound in seconds (default: 120) |
//! | `KEYWARD_DENYLIST` | Comma-separated blocked addresses |
//!
//! See [`KeywardConfig::from_env`] for the full list.

mod abi;
pub mod client;
pub mod config;
pub mod denylist;
mod digest;
pub mod error;
pub mod intent;
pub mod operation;
pub mod pinning;
pub mod pipeline;
pub mod policy;
pub mod session;
pub mod signer;
pub mod store;
pub mod translate;
pub mod types;

// Re-export main types
pub use client::{BundlerClient, Relayer};
pub use config::KeywardConfig;
pub use denylist::{Denylist, StaticDenylist};
pub use error::{KeywardError, KeywardResult};
pub use intent::{EntryOutcome, IntentProcessor, ProcessReport};
pub use operation::{
    encode_execute, nonce_key, HashedOperation, MockSignedOperation, SessionSignature,
    SignedOperation, UnsignedOperation, UserOperation,
};
pub use pinning::{Fingerprint, PinnedCertVerifier, PinnedClient, PinningGate};
pub use pipeline::{Authorization, AuthorizationPipeline, SessionSource};
pub use policy::{
    classify, AllowanceKind, Classified, PayloadTag, PolicyKind, TokenDirectory, TransferAsset,
    TransferIntent, CLASSIFICATION_ORDER,
};
pub use session::{
    enable, ActionTarget, EnabledSession, EnablementProof, LocalSessionModule, SessionBuilder,
    SessionDescriptor, SessionModule,
};
pub use signer::{DigestSigner, LocalSigner, RawSignature, MOCK_SIGNATURE};
pub use store::{AllowanceRecord, AllowanceStore};
pub use translate::{
    attest, normalize_arithmetic, parse_payloads, HttpTranslator, IntentTranslator, Translation,
};
pub use types::{Call, FeeParams, GasEstimate, OperationReceipt, PaymasterFields, SmartAccount};
