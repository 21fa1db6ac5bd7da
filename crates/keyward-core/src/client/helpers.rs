//! Decoding helpers for bundler replies.

use alloy_primitives::{Address, Bytes, B256, U256};
use serde_json::Value;

use crate::error::{KeywardError, KeywardResult};
use crate::types::{decimal, FeeParams, GasEstimate, OperationReceipt, PaymasterFields};

fn invalid(message: String) -> KeywardError {
    KeywardError::InvalidResponse { message }
}

/// Hex quantity (`0x1a`) or decimal number/string.
pub(crate) fn parse_u256(value: &Value, field: &str) -> KeywardResult<U256> {
    match value {
        Value::String(s) if s.starts_with("0x") => {
            let digits = &s[2..];
            if digits.is_empty() {
                return Ok(U256::ZERO);
            }
            U256::from_str_radix(digits, 16)
                .map_err(|e| invalid(format!("{field}: invalid hex quantity {s:?}: {e}")))
        }
        Value::String(s) => decimal::parse(s).map_err(|e| invalid(format!("{field}: {e}"))),
        Value::Number(n) => n
            .as_u64()
            .map(U256::from)
            .ok_or_else(|| invalid(format!("{field}: not an unsigned integer: {n}"))),
        other => Err(invalid(format!("{field}: expected quantity, got {other}"))),
    }
}

pub(crate) fn parse_u128(value: &Value, field: &str) -> KeywardResult<u128> {
    let wide = parse_u256(value, field)?;
    u128::try_from(wide).map_err(|_| invalid(format!("{field}: quantity exceeds 128 bits")))
}

fn field<'a>(obj: &'a Value, name: &str) -> KeywardResult<&'a Value> {
    obj.get(name)
        .filter(|v| !v.is_null())
        .ok_or_else(|| invalid(format!("missing field '{name}'")))
}

fn parse_string<T: std::str::FromStr>(value: &Value, name: &str) -> KeywardResult<T>
where
    T::Err: std::fmt::Display,
{
    value
        .as_str()
        .ok_or_else(|| invalid(format!("{name}: expected string")))?
        .parse()
        .map_err(|e| invalid(format!("{name}: {e}")))
}

/// `pimlico_getUserOperationGasPrice` reply; the `fast` tier is used.
pub(crate) fn parse_fee_params(result: &Value) -> KeywardResult<FeeParams> {
    let tier = field(result, "fast")?;
    Ok(FeeParams {
        max_fee_per_gas: parse_u128(field(tier, "maxFeePerGas")?, "maxFeePerGas")?,
        max_priority_fee_per_gas: parse_u128(
            field(tier, "maxPriorityFeePerGas")?,
            "maxPriorityFeePerGas",
        )?,
    })
}

/// `eth_estimateUserOperationGas` or `pm_sponsorUserOperation` reply.
pub(crate) fn parse_gas_estimate(result: &Value) -> KeywardResult<GasEstimate> {
    let paymaster = match result.get("paymaster").filter(|v| !v.is_null()) {
        Some(address) => Some(PaymasterFields {
            paymaster: parse_string::<Address>(address, "paymaster")?,
            verification_gas_limit: parse_u128(
                field(result, "paymasterVerificationGasLimit")?,
                "paymasterVerificationGasLimit",
            )?,
            post_op_gas_limit: parse_u128(
                field(result, "paymasterPostOpGasLimit")?,
                "paymasterPostOpGasLimit",
            )?,
            data: match result.get("paymasterData").filter(|v| !v.is_null()) {
                Some(data) => parse_string::<Bytes>(data, "paymasterData")?,
                None => Bytes::new(),
            },
        }),
        None => None,
    };

    Ok(GasEstimate {
        call_gas_limit: parse_u128(field(result, "callGasLimit")?, "callGasLimit")?,
        verification_gas_limit: parse_u128(
            field(result, "verificationGasLimit")?,
            "verificationGasLimit",
        )?,
        pre_verification_gas: parse_u128(
            field(result, "preVerificationGas")?,
            "preVerificationGas",
        )?,
        paymaster,
    })
}

pub(crate) fn parse_hash(result: &Value, name: &str) -> KeywardResult<B256> {
    parse_string(result, name)
}

/// `eth_getUserOperationReceipt` reply; `null` while pending.
pub(crate) fn parse_receipt(result: &Value) -> KeywardResult<Option<OperationReceipt>> {
    if result.is_null() {
        return Ok(None);
    }

    let success = field(result, "success")?
        .as_bool()
        .ok_or_else(|| invalid("success: expected boolean".to_string()))?;
    let tx_hash = result
        .get("receipt")
        .and_then(|r| r.get("transactionHash"))
        .filter(|v| !v.is_null())
        .map(|v| parse_hash(v, "transactionHash"))
        .transpose()?;
    let actual_gas_cost = match result.get("actualGasCost").filter(|v| !v.is_null()) {
        Some(v) => parse_u256(v, "actualGasCost")?,
        None => U256::ZERO,
    };
    let reason = result
        .get("reason")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty() && *s != "0x")
        .map(String::from);

    Ok(Some(OperationReceipt {
        op_hash: parse_hash(field(result, "userOpHash")?, "userOpHash")?,
        success,
        tx_hash,
        actual_gas_cost,
        reason,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_quantities() {
        assert_eq!(parse_u256(&json!("0x1a"), "x").unwrap(), U256::from(26_u64));
        assert_eq!(parse_u256(&json!("0x"), "x").unwrap(), U256::ZERO);
        assert_eq!(parse_u256(&json!(7), "x").unwrap(), U256::from(7_u64));
        assert_eq!(parse_u256(&json!("42"), "x").unwrap(), U256::from(42_u64));
        assert!(parse_u256(&json!("0xzz"), "x").is_err());
        assert!(parse_u128(&json!(format!("0x1{}", "0".repeat(32))), "x").is_err());
    }

    #[test]
    fn test_pending_receipt_is_none() {
        assert!(parse_receipt(&Value::Null).unwrap().is_none());
    }

    #[test]
    fn test_failed_receipt_keeps_reason() {
        let receipt = parse_receipt(&json!({
            "userOpHash": format!("0x{}", "ab".repeat(32)),
            "success": false,
            "actualGasCost": "0x10",
            "reason": "0x08c379a0",
            "receipt": { "transactionHash": format!("0x{}", "cd".repeat(32)) }
        }))
        .unwrap()
        .unwrap();
        assert!(!receipt.success);
        assert_eq!(receipt.actual_gas_cost, U256::from(16_u64));
        assert_eq!(receipt.reason.as_deref(), Some("0x08c379a0"));
        assert_eq!(receipt.tx_hash, Some(B256::repeat_byte(0xcd)));
    }

    #[test]
    fn test_sponsored_estimate() {
        let estimate = parse_gas_estimate(&json!({
            "callGasLimit": "0x100",
            "verificationGasLimit": "0x200",
            "preVerificationGas": "0x300",
            "paymaster": "0x4444444444444444444444444444444444444444",
            "paymasterVerificationGasLimit": "0x10",
            "paymasterPostOpGasLimit": "0x1",
            "paymasterData": "0xdeadbeef"
        }))
        .unwrap();
        let pm = estimate.paymaster.unwrap();
        assert_eq!(pm.paymaster, Address::repeat_byte(0x44));
        assert_eq!(pm.data.len(), 4);
        assert_eq!(estimate.pre_verification_gas, 0x300);
    }
}
