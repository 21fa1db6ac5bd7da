//! Error types for session enablement and operation authorization.

use std::time::Duration;

use alloy_primitives::{Address, B256};

use crate::policy::AllowanceKind;

/// Keyward errors.
#[derive(Debug, thiserror::Error)]
pub enum KeywardError {
    /// A translated payload matched no known policy or transfer shape.
    #[error("payload {index} not classifiable: {reason}")]
    Classification { index: usize, reason: String },

    /// Translation service returned something that is not a payload array.
    #[error("translation failed: {message}")]
    Translation { message: String },

    /// Session enablement failed (module unreachable or malformed digest).
    #[error("enablement failed: {message}")]
    Enablement { message: String },

    /// Session descriptor is not enabled or its enablement does not verify.
    #[error("session not enabled: {reason}")]
    NotEnabled { reason: String },

    /// No enabled session stored for the requested kind.
    #[error("no active session for kind '{kind}'")]
    NoActiveSession { kind: AllowanceKind },

    /// Call destination is on the denylist.
    #[error("destination blocked: {destination}")]
    DestinationBlocked { destination: Address },

    /// Call falls outside the session's allowed action targets.
    #[error("action not permitted by session: {target} selector {selector}")]
    ActionNotPermitted { target: Address, selector: String },

    /// Session time window not open at submission time.
    #[error("session not active: {reason}")]
    SessionNotActive { reason: String },

    /// Summed call value exceeds the session's value limit.
    #[error("value {requested} exceeds session limit {limit}")]
    ValueLimitExceeded { requested: String, limit: String },

    /// Token symbol could not be resolved to a contract address.
    #[error("unknown token: {token}")]
    UnknownToken { token: String },

    /// Signer unavailable or signing failed.
    #[error("signing failed: {message}")]
    Signer { message: String },

    /// Leaf certificate fingerprint differs from the pinned value.
    #[error("certificate pin mismatch for {host}: expected {expected}, got {actual}")]
    PinningMismatch {
        host: String,
        expected: String,
        actual: String,
    },

    /// No terminal receipt observed before the caller's deadline.
    #[error("no receipt for operation {op_hash} within {timeout:?}; outcome unknown")]
    ReceiptTimeout { op_hash: B256, timeout: Duration },

    /// Relayer refused the operation.
    #[error("relayer rejected operation: {message}")]
    RelayerRejected { message: String },

    /// Allowance store read/write failure.
    #[error("allowance store error: {message}")]
    StoreIo { message: String },

    /// Network error.
    #[error("network error: {message}")]
    Network { message: String },

    /// Invalid response from a collaborator.
    #[error("invalid response: {message}")]
    InvalidResponse { message: String },

    /// Configuration error.
    #[error("configuration error: {message}")]
    Config { message: String },
}

impl KeywardError {
    /// Stable machine-readable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Classification { .. } => "classification",
            Self::Translation { .. } => "translation",
            Self::Enablement { .. } => "enablement",
            Self::NotEnabled { .. } => "not_enabled",
            Self::NoActiveSession { .. } => "no_active_session",
            Self::DestinationBlocked { .. } => "destination_blocked",
            Self::ActionNotPermitted { .. } => "action_not_permitted",
            Self::SessionNotActive { .. } => "session_not_active",
            Self::ValueLimitExceeded { .. } => "value_limit_exceeded",
            Self::UnknownToken { .. } => "unknown_token",
            Self::Signer { .. } => "signer",
            Self::PinningMismatch { .. } => "pinning_mismatch",
            Self::ReceiptTimeout { .. } => "receipt_timeout",
            Self::RelayerRejected { .. } => "relayer_rejected",
            Self::StoreIo { .. } => "store_io",
            Self::Network { .. } => "network",
            Self::InvalidResponse { .. } => "invalid_response",
            Self::Config { .. } => "config",
        }
    }

    /// Exit code for CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            // Config / usage
            Self::Config { .. } => 1,

            // Security issues
            Self::PinningMismatch { .. } => 3,
            Self::DestinationBlocked { .. } => 3,
            Self::NotEnabled { .. } => 3,

            // Everything else fails the submission
            _ => 2,
        }
    }

    /// Whether the error leaves an on-chain outcome unknown.
    ///
    /// Such errors must be reconciled out-of-band, never resubmitted blindly.
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, Self::ReceiptTimeout { .. })
    }
}

impl From<reqwest::Error> for KeywardError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network {
            message: err.to_string(),
        }
    }
}

/// Result type for keyward operations.
pub type KeywardResult<T> = Result<T, KeywardError>;
