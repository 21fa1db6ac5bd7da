//! Intent translation client.
//!
//! The translation service turns a natural-language prompt into a JSON array
//! of policy and transfer payloads. Its reply is text, and models like to
//! leave arithmetic in it (`"validUntil": 60 * 60 * 24`), so products are
//! folded before the text is parsed.

use std::sync::OnceLock;

use alloy_primitives::B256;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use url::Url;

use crate::config::KeywardConfig;
use crate::digest::keccak256;
use crate::error::{KeywardError, KeywardResult};
use crate::pinning::{Fingerprint, PinnedClient, PinningGate};

/// Translated payloads plus the exchange they came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Translation {
    pub payloads: Vec<Value>,

    /// Text exactly as returned by the service.
    pub raw_text: String,

    /// `keccak(prompt ‖ raw_text)`, for anchoring the exchange externally.
    pub attestation: B256,
}

/// Text-in, payloads-out oracle.
#[async_trait]
pub trait IntentTranslator: Send + Sync {
    async fn translate(&self, prompt: &str) -> KeywardResult<Translation>;
}

#[derive(Debug, Serialize)]
struct TranslateRequest<'a> {
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TranslateResponse {
    translated_text: String,
}

/// HTTPS translation client. Always pinned.
#[derive(Debug, Clone)]
pub struct HttpTranslator {
    url: Url,
    client: PinnedClient,
}

impl HttpTranslator {
    /// Create a translator for `url`, which must be https.
    pub fn new(url: &str, gate: &PinningGate, timeout: std::time::Duration) -> KeywardResult<Self> {
        let url = Url::parse(url).map_err(|e| KeywardError::Config {
            message: format!("invalid translator URL {url:?}: {e}"),
        })?;
        if url.scheme() != "https" {
            return Err(KeywardError::Config {
                message: format!("translator URL must be https, got {}", url.scheme()),
            });
        }
        Ok(Self {
            url,
            client: gate.http_client(timeout)?,
        })
    }

    /// Build from config; URL and pin are both required.
    pub fn from_config(config: &KeywardConfig) -> KeywardResult<Self> {
        let url = config
            .translator_url
            .as_deref()
            .ok_or_else(|| KeywardError::Config {
                message: "no translator URL configured (KEYWARD_TRANSLATOR_URL)".to_string(),
            })?;
        let pin: Fingerprint = config
            .translator_pin
            .as_deref()
            .ok_or_else(|| KeywardError::Config {
                message: "translator pin is required (KEYWARD_TRANSLATOR_PIN)".to_string(),
            })?
            .parse()?;
        Self::new(url, &PinningGate::new(pin), config.translator_timeout())
    }
}

#[async_trait]
impl IntentTranslator for HttpTranslator {
    async fn translate(&self, prompt: &str) -> KeywardResult<Translation> {
        debug!(url = %self.url, "requesting translation");
        let response: TranslateResponse = self
            .client
            .post_json(&self.url, &TranslateRequest { prompt })
            .await?;

        let payloads = parse_payloads(&response.translated_text)?;
        let attestation = attest(prompt, &response.translated_text);
        info!(
            count = payloads.len(),
            attestation = %attestation,
            "translation received"
        );
        Ok(Translation {
            payloads,
            raw_text: response.translated_text,
            attestation,
        })
    }
}

/// Attestation digest of one prompt/translation exchange.
pub fn attest(prompt: &str, translated_text: &str) -> B256 {
    let mut bytes = Vec::with_capacity(prompt.len() + translated_text.len());
    bytes.extend_from_slice(prompt.as_bytes());
    bytes.extend_from_slice(translated_text.as_bytes());
    keccak256(bytes)
}

/// Parse translated text into payload objects.
///
/// The top level must be an array; a bare object is an error.
pub fn parse_payloads(text: &str) -> KeywardResult<Vec<Value>> {
    let normalized = normalize_arithmetic(strip_code_fence(text));
    let value: Value =
        serde_json::from_str(&normalized).map_err(|e| KeywardError::Translation {
            message: format!("translated text is not JSON: {e}"),
        })?;
    match value {
        Value::Array(items) => Ok(items),
        other => Err(KeywardError::Translation {
            message: format!(
                "translated text must be a JSON array, got {}",
                json_type(&other)
            ),
        }),
    }
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

static PRODUCT: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();

/// Fold integer products (`3600 * 24`, `60 * 60 * 24`) into their value.
///
/// Operands that are part of a larger token (decimals, exponents, hex,
/// identifiers) are left alone, as are products that overflow `u128`.
pub fn normalize_arithmetic(text: &str) -> String {
    let Ok(re) = PRODUCT
        .get_or_init(|| Regex::new(r"(\d+)\s*\*\s*(\d+)"))
        .as_ref()
    else {
        return text.to_string();
    };

    let mut current = text.to_string();
    loop {
        let next = fold_once(re, &current);
        if next == current {
            return next;
        }
        current = next;
    }
}

fn fold_once(re: &Regex, text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut last = 0;

    for caps in re.captures_iter(text) {
        let (Some(whole), Some(lhs), Some(rhs)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let before = whole.start().checked_sub(1).map(|i| bytes[i]);
        let after = bytes.get(whole.end()).copied();
        if before.is_some_and(joins_operand) || after.is_some_and(joins_operand) {
            continue;
        }

        let product = lhs
            .as_str()
            .parse::<u128>()
            .ok()
            .zip(rhs.as_str().parse::<u128>().ok())
            .and_then(|(a, b)| a.checked_mul(b));
        if let Some(product) = product {
            out.push_str(&text[last..whole.start()]);
            out.push_str(&product.to_string());
            last = whole.end();
        }
    }

    out.push_str(&text[last..]);
    out
}

/// Characters that make a digit run part of a larger token (`1.5`, `1e3`, `0x10`).
fn joins_operand(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'.' || b == b'_'
}
