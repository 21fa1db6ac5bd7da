//! Integration tests for the JSON-RPC bundler client.
//!
//! Uses wiremock to stand in for both the bundler and the chain RPC.

use std::time::Duration;

use alloy_primitives::{address, Address, B256, U256};
use keyward_core::{
    BundlerClient, Call, FeeParams, KeywardError, LocalSigner, MockSignedOperation, Relayer,
    SessionSignature, SignedOperation, SmartAccount, UnsignedOperation,
};
use serde_json::{json, Value};
use wiremock::matchers::{body_partial_json, method};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn create_test_client(mock_server: &MockServer) -> BundlerClient {
    BundlerClient::new(
        &mock_server.uri(),
        &mock_server.uri(),
        Duration::from_secs(5),
    )
    .expect("Failed to create client")
}

fn account() -> SmartAccount {
    SmartAccount {
        address: Address::repeat_byte(0xaa),
        owner: Address::repeat_byte(0xbb),
        chain_id: 84532,
        entry_point: address!("0000000071727De22E5E9d8BAf0edAc6f37da032"),
    }
}

fn rpc_result(result: Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": result}))
}

fn rpc_error(code: i64, message: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "jsonrpc": "2.0",
        "id": 1,
        "error": {"code": code, "message": message}
    }))
}

fn mock_signed() -> MockSignedOperation {
    let call = Call::native(Address::repeat_byte(0x12), U256::from(5_u64));
    UnsignedOperation::new(&account(), U256::from(7_u64), &[call])
        .with_fees(FeeParams {
            max_fee_per_gas: 100,
            max_priority_fee_per_gas: 10,
        })
        .mock_sign(&SessionSignature::Use {
            permission_id: B256::repeat_byte(0x01),
        })
}

async fn signed() -> SignedOperation {
    let encoding = SessionSignature::Use {
        permission_id: B256::repeat_byte(0x01),
    };
    let hashed = mock_signed().apply_estimate(
        keyward_core::GasEstimate {
            call_gas_limit: 1,
            verification_gas_limit: 2,
            pre_verification_gas: 3,
            paymaster: None,
        },
        false,
    );
    hashed
        .sign(&LocalSigner::random(), &encoding)
        .await
        .expect("sign")
}

#[tokio::test]
async fn test_nonce_reads_entry_point() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(body_partial_json(json!({"method": "eth_call"})))
        .respond_with(rpc_result(json!(
            "0x0000000000000000000000000000000000000000000000000000000000000003"
        )))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server);
    let nonce = client.nonce(&account(), U256::from(1_u64)).await.unwrap();
    assert_eq!(nonce, U256::from(3_u64));

    let requests = mock_server.received_requests().await.unwrap();
    let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
    let call = &body["params"][0];
    assert_eq!(
        call["to"].as_str().unwrap().to_lowercase(),
        "0x0000000071727de22e5e9d8baf0edac6f37da032"
    );
    // getNonce(address,uint192)
    assert!(call["data"].as_str().unwrap().starts_with("0x35567e1a"));
    assert_eq!(body["params"][1], "latest");
}

#[tokio::test]
async fn test_fee_params_uses_fast_tier() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(body_partial_json(
            json!({"method": "pimlico_getUserOperationGasPrice"}),
        ))
        .respond_with(rpc_result(json!({
            "slow": {"maxFeePerGas": "0x1", "maxPriorityFeePerGas": "0x1"},
            "standard": {"maxFeePerGas": "0x2", "maxPriorityFeePerGas": "0x1"},
            "fast": {"maxFeePerGas": "0x3b9aca00", "maxPriorityFeePerGas": "0x5f5e100"}
        })))
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server);
    let fees = client.fee_params().await.unwrap();
    assert_eq!(fees.max_fee_per_gas, 1_000_000_000);
    assert_eq!(fees.max_priority_fee_per_gas, 100_000_000);
}

#[tokio::test]
async fn test_estimate_sends_placeholder_operation() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(body_partial_json(
            json!({"method": "eth_estimateUserOperationGas"}),
        ))
        .respond_with(rpc_result(json!({
            "callGasLimit": "0x13880",
            "verificationGasLimit": "0x249f0",
            "preVerificationGas": "0xea60"
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server);
    let gas = client.estimate(&mock_signed()).await.unwrap();
    assert_eq!(gas.call_gas_limit, 80_000);
    assert_eq!(gas.verification_gas_limit, 150_000);
    assert_eq!(gas.pre_verification_gas, 60_000);
    assert!(gas.paymaster.is_none());

    let requests = mock_server.received_requests().await.unwrap();
    let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
    let signature = body["params"][0]["signature"].as_str().unwrap();
    // use-mode prefix, then the placeholder's 0xff run
    assert!(signature.starts_with("0x000101"));
    assert!(signature.ends_with("1c"));
}

#[tokio::test]
async fn test_sponsored_estimate_returns_paymaster() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(body_partial_json(json!({"method": "pm_sponsorUserOperation"})))
        .respond_with(rpc_result(json!({
            "callGasLimit": "0x1",
            "verificationGasLimit": "0x2",
            "preVerificationGas": "0x3",
            "paymaster": "0x7777777777777777777777777777777777777777",
            "paymasterVerificationGasLimit": "0x4",
            "paymasterPostOpGasLimit": "0x5",
            "paymasterData": "0xabcd"
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server).with_sponsorship(true);
    let gas = client.estimate(&mock_signed()).await.unwrap();
    let paymaster = gas.paymaster.expect("paymaster fields");
    assert_eq!(paymaster.paymaster, Address::repeat_byte(0x77));
    assert_eq!(paymaster.verification_gas_limit, 4);
    assert_eq!(paymaster.post_op_gas_limit, 5);
    assert_eq!(paymaster.data.to_vec(), vec![0xab_u8, 0xcd]);
}

#[tokio::test]
async fn test_submit_returns_operation_hash() {
    let mock_server = MockServer::start().await;
    let op = signed().await;

    Mock::given(method("POST"))
        .and(body_partial_json(json!({"method": "eth_sendUserOperation"})))
        .respond_with(rpc_result(json!(op.hash().to_string())))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server);
    assert_eq!(client.submit(&op).await.unwrap(), op.hash());
}

#[tokio::test]
async fn test_submit_rejection_is_relayer_rejected() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(body_partial_json(json!({"method": "eth_sendUserOperation"})))
        .respond_with(rpc_error(-32500, "AA24 signature error"))
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server);
    let err = client.submit(&signed().await).await.unwrap_err();
    match err {
        KeywardError::RelayerRejected { message } => assert!(message.contains("AA24")),
        other => panic!("Expected RelayerRejected, got: {other:?}"),
    }
}

#[tokio::test]
async fn test_receipt_pending_then_final() {
    let mock_server = MockServer::start().await;
    let op_hash = B256::repeat_byte(0x42);

    Mock::given(method("POST"))
        .and(body_partial_json(
            json!({"method": "eth_getUserOperationReceipt"}),
        ))
        .respond_with(rpc_result(Value::Null))
        .up_to_n_times(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .and(body_partial_json(
            json!({"method": "eth_getUserOperationReceipt"}),
        ))
        .respond_with(rpc_result(json!({
            "userOpHash": op_hash.to_string(),
            "success": false,
            "actualGasCost": "0x5208",
            "reason": "0x08c379a0",
            "receipt": {"transactionHash": B256::repeat_byte(0x09).to_string()}
        })))
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server);
    assert!(client.receipt(op_hash).await.unwrap().is_none());

    let receipt = client.receipt(op_hash).await.unwrap().expect("receipt");
    assert_eq!(receipt.op_hash, op_hash);
    assert!(!receipt.success);
    assert_eq!(receipt.actual_gas_cost, U256::from(21_000_u64));
    assert_eq!(receipt.tx_hash, Some(B256::repeat_byte(0x09)));
    assert_eq!(receipt.reason.as_deref(), Some("0x08c379a0"));
}

#[tokio::test]
async fn test_server_error_is_network() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream down"))
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server);
    let err = client.fee_params().await.unwrap_err();
    assert!(matches!(err, KeywardError::Network { .. }), "got {err:?}");
}

#[tokio::test]
async fn test_non_rpc_client_error_is_invalid_response() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(404).set_body_string("not found"))
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server);
    let err = client.nonce(&account(), U256::ZERO).await.unwrap_err();
    assert!(matches!(err, KeywardError::InvalidResponse { .. }), "got {err:?}");
}
