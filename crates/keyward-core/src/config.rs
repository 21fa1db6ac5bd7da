//! Runtime configuration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use alloy_primitives::{address, Address};
use serde::{Deserialize, Serialize};

use crate::error::{KeywardError, KeywardResult};
use crate::policy::TokenDirectory;
use crate::types::SmartAccount;

/// Entry point v0.7, same address on every chain.
pub const ENTRY_POINT_V07: Address = address!("0000000071727De22E5E9d8BAf0edAc6f37da032");

/// Smart-session validator module.
pub const DEFAULT_SESSION_VALIDATOR: Address = address!("00000000002B0eCfbD0496EE71e01257dA0E37DE");

/// Base Sepolia.
pub const DEFAULT_CHAIN_ID: u64 = 84532;

/// Keyward configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywardConfig {
    /// Intent translation endpoint (https only).
    #[serde(default)]
    pub translator_url: Option<String>,

    /// SHA-256 fingerprint of the translator's leaf certificate.
    #[serde(default)]
    pub translator_pin: Option<String>,

    /// Translation request timeout in seconds.
    #[serde(default = "default_translator_timeout")]
    pub translator_timeout_secs: u64,

    /// Chain RPC, used for nonce lookups.
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,

    /// Bundler endpoint for estimation, submission and receipts.
    #[serde(default)]
    pub bundler_url: Option<String>,

    #[serde(default = "default_chain_id")]
    pub chain_id: u64,

    #[serde(default = "default_entry_point")]
    pub entry_point: Address,

    /// Smart account address.
    #[serde(default)]
    pub account: Option<Address>,

    /// Session validator module; also the operation nonce key.
    #[serde(default = "default_session_validator")]
    pub session_validator: Address,

    /// Allowance store location. Defaults to the user data directory.
    #[serde(default)]
    pub allowances_file: Option<PathBuf>,

    /// Upper bound on waiting for a receipt, in seconds.
    #[serde(default = "default_receipt_timeout")]
    pub receipt_timeout_secs: u64,

    /// Receipt polling interval in milliseconds.
    #[serde(default = "default_receipt_poll_ms")]
    pub receipt_poll_ms: u64,

    /// Whether sessions may be sponsored by a paymaster.
    #[serde(default = "default_allow_paymaster")]
    pub allow_paymaster: bool,

    /// Blocked destinations.
    #[serde(default)]
    pub denylist: Vec<Address>,

    /// Extra token symbols on top of the built-in directory.
    #[serde(default)]
    pub tokens: BTreeMap<String, Address>,
}

fn default_translator_timeout() -> u64 {
    30
}

fn default_rpc_url() -> String {
    "https://sepolia.base.org".to_string()
}

fn default_chain_id() -> u64 {
    DEFAULT_CHAIN_ID
}

fn default_entry_point() -> Address {
    ENTRY_POINT_V07
}

fn default_session_validator() -> Address {
    DEFAULT_SESSION_VALIDATOR
}

fn default_receipt_timeout() -> u64 {
    120
}

fn default_receipt_poll_ms() -> u64 {
    2000
}

fn default_allow_paymaster() -> bool {
    true
}

impl Default for KeywardConfig {
    fn default() -> Self {
        Self {
            translator_url: None,
            translator_pin: None,
            translator_timeout_secs: default_translator_timeout(),
            rpc_url: default_rpc_url(),
            bundler_url: None,
            chain_id: default_chain_id(),
            entry_point: default_entry_point(),
            account: None,
            session_validator: default_session_validator(),
            allowances_file: None,
            receipt_timeout_secs: default_receipt_timeout(),
            receipt_poll_ms: default_receipt_poll_ms(),
            allow_paymaster: default_allow_paymaster(),
            denylist: Vec::new(),
            tokens: BTreeMap::new(),
        }
    }
}

impl KeywardConfig {
    /// Create config from environment variables.
    ///
    /// | Variable | Description |
    /// |----------|-------------|
    /// | `KEYWARD_TRANSLATOR_URL` | Translation service URL |
    /// | `KEYWARD_TRANSLATOR_PIN` | Leaf certificate SHA-256 fingerprint |
    /// | `KEYWARD_TRANSLATOR_TIMEOUT` | Translation timeout (seconds) |
    /// | `KEYWARD_RPC_URL` | Chain RPC URL |
    /// | `KEYWARD_BUNDLER_URL` | Bundler URL |
    /// | `KEYWARD_CHAIN_ID` | Chain id |
    /// | `KEYWARD_ENTRY_POINT` | Entry point address |
    /// | `KEYWARD_ACCOUNT` | Smart account address |
    /// | `KEYWARD_SESSION_VALIDATOR` | Session validator module |
    /// | `KEYWARD_ALLOWANCES_FILE` | Allowance store path |
    /// | `KEYWARD_RECEIPT_TIMEOUT` | Receipt wait bound (seconds) |
    /// | `KEYWARD_RECEIPT_POLL_MS` | Receipt poll interval |
    /// | `KEYWARD_ALLOW_PAYMASTER` | Allow sponsored operations |
    /// | `KEYWARD_DENYLIST` | Comma-separated blocked addresses |
    ///
    /// Unset variables keep their defaults; malformed ones are a config error.
    pub fn from_env() -> KeywardResult<Self> {
        let mut config = Self::default();

        config.translator_url = env_var("KEYWARD_TRANSLATOR_URL");
        config.translator_pin = env_var("KEYWARD_TRANSLATOR_PIN");
        if let Some(v) = env_var("KEYWARD_TRANSLATOR_TIMEOUT") {
            config.translator_timeout_secs = parse_env("KEYWARD_TRANSLATOR_TIMEOUT", &v)?;
        }
        if let Some(v) = env_var("KEYWARD_RPC_URL") {
            config.rpc_url = v;
        }
        config.bundler_url = env_var("KEYWARD_BUNDLER_URL");
        if let Some(v) = env_var("KEYWARD_CHAIN_ID") {
            config.chain_id = parse_env("KEYWARD_CHAIN_ID", &v)?;
        }
        if let Some(v) = env_var("KEYWARD_ENTRY_POINT") {
            config.entry_point = parse_env("KEYWARD_ENTRY_POINT", &v)?;
        }
        if let Some(v) = env_var("KEYWARD_ACCOUNT") {
            config.account = Some(parse_env("KEYWARD_ACCOUNT", &v)?);
        }
        if let Some(v) = env_var("KEYWARD_SESSION_VALIDATOR") {
            config.session_validator = parse_env("KEYWARD_SESSION_VALIDATOR", &v)?;
        }
        config.allowances_file = env_var("KEYWARD_ALLOWANCES_FILE").map(PathBuf::from);
        if let Some(v) = env_var("KEYWARD_RECEIPT_TIMEOUT") {
            config.receipt_timeout_secs = parse_env("KEYWARD_RECEIPT_TIMEOUT", &v)?;
        }
        if let Some(v) = env_var("KEYWARD_RECEIPT_POLL_MS") {
            config.receipt_poll_ms = parse_env("KEYWARD_RECEIPT_POLL_MS", &v)?;
        }
        if let Some(v) = env_var("KEYWARD_ALLOW_PAYMASTER") {
            config.allow_paymaster = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Some(v) = env_var("KEYWARD_DENYLIST") {
            config.denylist = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| parse_env("KEYWARD_DENYLIST", s))
                .collect::<KeywardResult<_>>()?;
        }

        Ok(config)
    }

    /// Load config from a YAML file. Missing keys take their defaults.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> KeywardResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| KeywardError::Config {
            message: format!("failed to read {}: {e}", path.display()),
        })?;
        serde_yaml::from_str(&content).map_err(|e| KeywardError::Config {
            message: format!("invalid config {}: {e}", path.display()),
        })
    }

    /// Set the translation service URL and its pinned fingerprint.
    pub fn with_translator(mut self, url: impl Into<String>, pin: impl Into<String>) -> Self {
        self.translator_url = Some(url.into());
        self.translator_pin = Some(pin.into());
        self
    }

    /// Set the bundler URL.
    pub fn with_bundler_url(mut self, url: impl Into<String>) -> Self {
        self.bundler_url = Some(url.into());
        self
    }

    /// Set the chain RPC URL.
    pub fn with_rpc_url(mut self, url: impl Into<String>) -> Self {
        self.rpc_url = url.into();
        self
    }

    /// Set the smart account address.
    pub fn with_account(mut self, account: Address) -> Self {
        self.account = Some(account);
        self
    }

    /// Set the allowance store path.
    pub fn with_allowances_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.allowances_file = Some(path.into());
        self
    }

    /// Set the receipt wait bound.
    pub fn with_receipt_timeout(mut self, timeout: Duration) -> Self {
        self.receipt_timeout_secs = timeout.as_secs();
        self
    }

    /// Add a blocked destination.
    pub fn with_blocked(mut self, destination: Address) -> Self {
        self.denylist.push(destination);
        self
    }

    /// Register a token symbol.
    pub fn with_token(mut self, symbol: impl Into<String>, address: Address) -> Self {
        self.tokens.insert(symbol.into(), address);
        self
    }

    pub fn receipt_timeout(&self) -> Duration {
        Duration::from_secs(self.receipt_timeout_secs)
    }

    pub fn receipt_poll_interval(&self) -> Duration {
        Duration::from_millis(self.receipt_poll_ms)
    }

    pub fn translator_timeout(&self) -> Duration {
        Duration::from_secs(self.translator_timeout_secs)
    }

    /// Allowance store path, falling back to the user data directory.
    pub fn allowances_path(&self) -> KeywardResult<PathBuf> {
        if let Some(path) = &self.allowances_file {
            return Ok(path.clone());
        }
        let base = dirs::data_dir()
            .or_else(dirs::home_dir)
            .ok_or_else(|| KeywardError::Config {
                message: "could not determine data directory".to_string(),
            })?;
        Ok(base.join("keyward").join("allowances.json"))
    }

    /// Built-in tokens plus configured ones.
    pub fn token_directory(&self) -> TokenDirectory {
        let mut entries: Vec<(String, Address)> = vec![(
            "USDC".to_string(),
            crate::policy::BASE_SEPOLIA_USDC,
        )];
        entries.extend(self.tokens.iter().map(|(s, a)| (s.clone(), *a)));
        TokenDirectory::new(entries)
    }

    /// Account descriptor for the given owner identity.
    pub fn smart_account(&self, owner: Address) -> KeywardResult<SmartAccount> {
        let address = self.account.ok_or_else(|| KeywardError::Config {
            message: "no smart account configured (KEYWARD_ACCOUNT)".to_string(),
        })?;
        Ok(SmartAccount {
            address,
            owner,
            chain_id: self.chain_id,
            entry_point: self.entry_point,
        })
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_env<T>(name: &str, raw: &str) -> KeywardResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse().map_err(|e| KeywardError::Config {
        message: format!("{name}: invalid value {raw:?}: {e}"),
    })
}
