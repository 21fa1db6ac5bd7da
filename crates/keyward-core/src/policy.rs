//! Policy model and translated-payload classification.
//!
//! The translation service returns untyped JSON objects; which policy an object
//! describes is inferred from the fields it carries. A payload can satisfy more
//! than one shape (a transfer carries a limit-like amount, a spend limit may
//! also carry a bare `limit`), so the shapes are tried in the fixed order of
//! [`CLASSIFICATION_ORDER`] and the first match wins.

use std::collections::BTreeMap;
use std::fmt;

use alloy_primitives::{address, Address, U256};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{KeywardError, KeywardResult};
use crate::types::decimal;

/// Largest relative duration accepted from the translator (ten years).
///
/// Anything larger is an absolute epoch value, which is rejected rather than
/// guessed at.
pub const RELATIVE_HORIZON_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// USDC on Base Sepolia.
pub const BASE_SEPOLIA_USDC: Address = address!("036CbD53842c5426634e7929541eC2318f3dCF7e");

/// Allowance store key: one active session per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllowanceKind {
    Token,
    Time,
    Eth,
}

impl AllowanceKind {
    pub const ALL: [AllowanceKind; 3] = [Self::Token, Self::Time, Self::Eth];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Token => "token",
            Self::Time => "time",
            Self::Eth => "eth",
        }
    }
}

impl fmt::Display for AllowanceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resolved constraint on what a session may authorize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PolicyKind {
    /// Cumulative ERC-20 spend cap for one token.
    SpendLimit {
        token: Address,
        #[serde(with = "decimal")]
        limit: U256,
    },

    /// Validity window, epoch milliseconds.
    TimeWindow {
        #[serde(with = "decimal::u64_string")]
        valid_after: u64,
        #[serde(with = "decimal::u64_string")]
        valid_until: u64,
    },

    /// Native value cap, optionally bound to one recipient.
    ValueLimit {
        #[serde(with = "decimal")]
        limit: U256,
        #[serde(default)]
        target: Option<Address>,
    },
}

impl PolicyKind {
    /// Store slot this policy is delegated under.
    pub fn allowance_kind(&self) -> AllowanceKind {
        match self {
            Self::SpendLimit { .. } => AllowanceKind::Token,
            Self::TimeWindow { .. } => AllowanceKind::Time,
            Self::ValueLimit { .. } => AllowanceKind::Eth,
        }
    }

    /// Deterministic byte encoding, part of the descriptor's canonical form.
    pub(crate) fn write_canonical(&self, out: &mut Vec<u8>) {
        match self {
            Self::SpendLimit { token, limit } => {
                out.push(0x01);
                out.extend_from_slice(token.as_slice());
                out.extend_from_slice(&limit.to_be_bytes::<32>());
            }
            Self::TimeWindow {
                valid_after,
                valid_until,
            } => {
                out.push(0x02);
                out.extend_from_slice(&valid_after.to_be_bytes());
                out.extend_from_slice(&valid_until.to_be_bytes());
            }
            Self::ValueLimit { limit, target } => {
                out.push(0x03);
                out.extend_from_slice(&limit.to_be_bytes::<32>());
                match target {
                    Some(target) => {
                        out.push(1);
                        out.extend_from_slice(target.as_slice());
                    }
                    None => out.push(0),
                }
            }
        }
    }
}

/// Shape tags a payload can be classified as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadTag {
    SpendLimit,
    TimeWindow,
    ValueLimit,
    TransferIntent,
}

type Predicate = fn(&Map<String, Value>) -> bool;

/// Predicates in evaluation order. The first predicate that holds decides.
pub const CLASSIFICATION_ORDER: [(PayloadTag, Predicate); 4] = [
    (PayloadTag::SpendLimit, is_spend_limit),
    (PayloadTag::TimeWindow, is_time_window),
    (PayloadTag::ValueLimit, is_value_limit),
    (PayloadTag::TransferIntent, is_transfer),
];

/// A classified payload, before token resolution and time normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classified {
    SpendLimit { token: String, limit: U256 },
    TimeWindow { valid_after_secs: u64, valid_until_secs: u64 },
    ValueLimit { limit: U256, target: Option<Address> },
    Transfer(TransferIntent),
}

impl Classified {
    pub fn tag(&self) -> PayloadTag {
        match self {
            Self::SpendLimit { .. } => PayloadTag::SpendLimit,
            Self::TimeWindow { .. } => PayloadTag::TimeWindow,
            Self::ValueLimit { .. } => PayloadTag::ValueLimit,
            Self::Transfer(_) => PayloadTag::TransferIntent,
        }
    }
}

/// Immediate-execution instruction routed to an already enabled session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferIntent {
    pub to: Address,
    pub asset: TransferAsset,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferAsset {
    Native { value: U256 },
    Token { token: String, amount: U256 },
}

impl TransferIntent {
    /// Session kind that must already be enabled to execute this transfer.
    pub fn allowance_kind(&self) -> AllowanceKind {
        match self.asset {
            TransferAsset::Native { .. } => AllowanceKind::Eth,
            TransferAsset::Token { .. } => AllowanceKind::Token,
        }
    }
}

/// Classify one translated payload.
///
/// `index` is the payload's position in the translated array and is carried
/// into the error for reporting.
pub fn classify(index: usize, payload: &Value) -> KeywardResult<Classified> {
    let obj = payload
        .as_object()
        .ok_or_else(|| KeywardError::Classification {
            index,
            reason: "payload is not a JSON object".to_string(),
        })?;

    let tag = CLASSIFICATION_ORDER
        .iter()
        .find(|(_, predicate)| predicate(obj))
        .map(|(tag, _)| *tag)
        .ok_or_else(|| KeywardError::Classification {
            index,
            reason: diagnose(obj),
        })?;

    extract(tag, obj).ok_or_else(|| KeywardError::Classification {
        index,
        reason: format!("fields for {tag:?} could not be extracted"),
    })
}

fn extract(tag: PayloadTag, obj: &Map<String, Value>) -> Option<Classified> {
    match tag {
        PayloadTag::SpendLimit => Some(Classified::SpendLimit {
            token: token_field(obj)?,
            limit: positive_amount(obj.get("limit")?)?,
        }),
        PayloadTag::TimeWindow => Some(Classified::TimeWindow {
            valid_after_secs: seconds(obj.get("validAfter")?)?,
            valid_until_secs: seconds(obj.get("validUntil")?)?,
        }),
        PayloadTag::ValueLimit => Some(Classified::ValueLimit {
            limit: positive_amount(obj.get("limit")?)?,
            target: match obj.get("target") {
                Some(raw) => Some(address_field(raw)?),
                None => None,
            },
        }),
        PayloadTag::TransferIntent => {
            let to = address_field(obj.get("to")?)?;
            let asset = match (token_field(obj), obj.get("amount")) {
                (Some(token), Some(amount)) => TransferAsset::Token {
                    token,
                    amount: positive_amount(amount)?,
                },
                _ => TransferAsset::Native {
                    value: positive_amount(obj.get("eth")?)?,
                },
            };
            Some(Classified::Transfer(TransferIntent { to, asset }))
        }
    }
}

fn is_spend_limit(obj: &Map<String, Value>) -> bool {
    token_field(obj).is_some() && obj.get("limit").and_then(positive_amount).is_some()
}

fn is_time_window(obj: &Map<String, Value>) -> bool {
    let after = obj.get("validAfter").and_then(seconds);
    let until = obj.get("validUntil").and_then(seconds);
    match (after, until) {
        (Some(after), Some(until)) => until > 0 && after < until,
        _ => false,
    }
}

fn is_value_limit(obj: &Map<String, Value>) -> bool {
    obj.get("limit").and_then(positive_amount).is_some()
        && !obj.contains_key("token")
        && !obj.contains_key("validAfter")
        && !obj.contains_key("validUntil")
        && obj.get("target").map_or(true, |t| address_field(t).is_some())
}

fn is_transfer(obj: &Map<String, Value>) -> bool {
    if obj.get("method").and_then(Value::as_str) != Some("transfer") {
        return false;
    }
    if obj.get("to").and_then(address_field).is_none() {
        return false;
    }
    let token_amount = token_field(obj).is_some()
        && obj.get("amount").and_then(positive_amount).is_some();
    let native = obj.get("eth").and_then(positive_amount).is_some();
    token_amount || native
}

/// Best-effort reason for a payload no predicate accepted.
fn diagnose(obj: &Map<String, Value>) -> String {
    for key in ["validAfter", "validUntil"] {
        if let Some(raw) = obj.get(key) {
            if let Some(n) = whole_seconds(raw) {
                if n >= RELATIVE_HORIZON_SECS {
                    return format!(
                        "{key}={n} looks like an absolute timestamp; relative seconds expected"
                    );
                }
            } else {
                return format!("{key} must be a non-negative integer number of seconds");
            }
        }
    }
    if obj.contains_key("validUntil") {
        return "time window needs validAfter >= 0 and validUntil > validAfter".to_string();
    }
    if obj.get("method").and_then(Value::as_str) == Some("transfer") {
        return "transfer needs a valid 'to' address and a positive 'eth' or token 'amount'"
            .to_string();
    }
    if let Some(limit) = obj.get("limit") {
        if positive_amount(limit).is_none() {
            return format!("limit {limit} is not a positive integer amount");
        }
    }
    let mut keys: Vec<&str> = obj.keys().map(String::as_str).collect();
    keys.sort_unstable();
    format!("no policy shape matches fields {keys:?}")
}

fn token_field(obj: &Map<String, Value>) -> Option<String> {
    obj.get("token")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from)
}

fn address_field(raw: &Value) -> Option<Address> {
    raw.as_str()?.trim().parse().ok()
}

/// Non-negative integer seconds within the relative horizon.
fn seconds(raw: &Value) -> Option<u64> {
    whole_seconds(raw).filter(|n| *n < RELATIVE_HORIZON_SECS)
}

/// JSON integer or decimal string that fits in `u64`.
fn whole_seconds(raw: &Value) -> Option<u64> {
    match raw {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => u64::try_from(decimal::parse(s).ok()?).ok(),
        _ => None,
    }
}

/// Positive integer amount: JSON integer or decimal string.
fn positive_amount(raw: &Value) -> Option<U256> {
    let amount = match raw {
        Value::Number(n) => U256::from(n.as_u64()?),
        Value::String(s) => decimal::parse(s).ok()?,
        _ => return None,
    };
    (!amount.is_zero()).then_some(amount)
}

/// Symbol → contract address map for spend limits and token transfers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenDirectory {
    entries: BTreeMap<String, Address>,
}

impl TokenDirectory {
    pub fn new(entries: impl IntoIterator<Item = (String, Address)>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|(symbol, address)| (symbol.to_ascii_uppercase(), address))
                .collect(),
        }
    }

    /// Resolve a symbol (case-insensitive) or a literal 0x address.
    pub fn resolve(&self, token: &str) -> KeywardResult<Address> {
        let token = token.trim();
        if token.starts_with("0x") {
            return token.parse().map_err(|_| KeywardError::UnknownToken {
                token: token.to_string(),
            });
        }
        self.entries
            .get(&token.to_ascii_uppercase())
            .copied()
            .ok_or_else(|| KeywardError::UnknownToken {
                token: token.to_string(),
            })
    }
}

impl Default for TokenDirectory {
    fn default() -> Self {
        Self::new([("USDC".to_string(), BASE_SEPOLIA_USDC)])
    }
}
