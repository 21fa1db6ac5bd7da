//! Ledger-facing value types shared by the builder, the pipeline and the clients.

use alloy_primitives::{Address, Bytes, B256, U256};
use serde::{Deserialize, Serialize};

/// Smart account the session keys act on behalf of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmartAccount {
    /// Account address (the operation sender).
    pub address: Address,

    /// Principal's master identity; the only key that may enable sessions.
    pub owner: Address,

    /// Chain the account lives on.
    pub chain_id: u64,

    /// Entry point contract the account is bound to.
    pub entry_point: Address,
}

/// One (destination, value, payload) call inside an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Call {
    pub to: Address,

    #[serde(with = "decimal")]
    pub value: U256,

    #[serde(default)]
    pub data: Bytes,
}

impl Call {
    /// Plain native-value transfer.
    pub fn native(to: Address, value: U256) -> Self {
        Self {
            to,
            value,
            data: Bytes::new(),
        }
    }

    /// Function selector of the call, zero for calls without one.
    pub fn selector(&self) -> [u8; 4] {
        let mut out = [0_u8; 4];
        if self.data.len() >= 4 {
            out.copy_from_slice(&self.data[..4]);
        }
        out
    }
}

/// Current fee parameters supplied by the relayer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FeeParams {
    pub max_fee_per_gas: u128,
    pub max_priority_fee_per_gas: u128,
}

/// Gas limits returned by fee estimation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GasEstimate {
    pub call_gas_limit: u128,
    pub verification_gas_limit: u128,
    pub pre_verification_gas: u128,

    /// Sponsorship fields, when a paymaster covers the operation.
    pub paymaster: Option<PaymasterFields>,
}

/// Paymaster section of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymasterFields {
    pub paymaster: Address,
    pub verification_gas_limit: u128,
    pub post_op_gas_limit: u128,
    pub data: Bytes,
}

/// Terminal receipt of a submitted operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationReceipt {
    /// Operation hash the relayer indexed the receipt under.
    pub op_hash: B256,

    /// Whether execution succeeded on-chain.
    pub success: bool,

    /// Transaction that included the operation.
    #[serde(default)]
    pub tx_hash: Option<B256>,

    /// Actual gas cost charged.
    #[serde(with = "decimal", default)]
    pub actual_gas_cost: U256,

    /// Revert reason, when execution failed.
    #[serde(default)]
    pub reason: Option<String>,
}

/// Decimal-string serialization for 256-bit amounts.
///
/// Values beyond 2^53 are not representable as JSON numbers in most readers,
/// so amounts cross every storage boundary as base-10 strings.
pub mod decimal {
    use alloy_primitives::U256;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }

    /// Parse a base-10 amount.
    pub fn parse(raw: &str) -> Result<U256, String> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(format!("not a decimal integer: {raw:?}"));
        }
        U256::from_str_radix(trimmed, 10).map_err(|e| format!("invalid amount {raw:?}: {e}"))
    }

    /// Same contract for `u64` fields such as chain ids.
    pub mod u64_string {
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
            serializer.serialize_str(&value.to_string())
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
            let raw = String::deserialize(deserializer)?;
            raw.parse().map_err(serde::de::Error::custom)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_of_short_data_is_zero() {
        let call = Call::native(Address::ZERO, U256::from(1_u64));
        assert_eq!(call.selector(), [0, 0, 0, 0]);

        let call = Call {
            to: Address::ZERO,
            value: U256::ZERO,
            data: Bytes::from(vec![0xa9, 0x05, 0x9c, 0xbb, 0x01]),
        };
        assert_eq!(call.selector(), [0xa9, 0x05, 0x9c, 0xbb]);
    }

    #[test]
    fn test_call_value_serialized_as_decimal_string() {
        let value = U256::from(1_u64) << 200;
        let call = Call::native(Address::ZERO, value);
        let json = serde_json::to_value(&call).unwrap();
        assert_eq!(json["value"], serde_json::json!(value.to_string()));

        let back: Call = serde_json::from_value(json).unwrap();
        assert_eq!(back.value, value);
    }

    #[test]
    fn test_decimal_parse_rejects_non_decimal() {
        assert!(decimal::parse("0x10").is_err());
        assert!(decimal::parse("-5").is_err());
        assert!(decimal::parse("1.5").is_err());
        assert!(decimal::parse("").is_err());
        assert_eq!(decimal::parse("42").unwrap(), U256::from(42_u64));
    }
}
