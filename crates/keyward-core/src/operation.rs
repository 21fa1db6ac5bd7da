//! User operations and the two-phase signing state machine.
//!
//! ```text
//! UnsignedOperation ──mock_sign──▶ MockSignedOperation ──apply_estimate──▶ HashedOperation
//!                                         │ (estimation only)                    │ sign
//!                                                                                ▼
//!                                                                         SignedOperation ──▶ relayer
//! ```
//!
//! Only [`SignedOperation`] is accepted by [`Relayer::submit`], so a placeholder
//! signature cannot reach the relayer.
//!
//! [`Relayer::submit`]: crate::client::Relayer::submit

use alloy_primitives::ruint::UintTryFrom;
use alloy_primitives::{Address, Bytes, B256, U256};
use serde_json::{json, Map, Value};

use crate::abi::{self, Token};
use crate::digest::{keccak256, selector};
use crate::error::{KeywardError, KeywardResult};
use crate::signer::{DigestSigner, RawSignature, MOCK_SIGNATURE};
use crate::types::{Call, FeeParams, GasEstimate, PaymasterFields, SmartAccount};

const MODE_SINGLE: u8 = 0x00;
const MODE_BATCH: u8 = 0x01;

/// ERC-7579 `execute(bytes32,bytes)` call data for `calls`.
pub fn encode_execute(calls: &[Call]) -> Bytes {
    let mut mode = [0_u8; 32];
    let execution = match calls {
        [call] => {
            mode[0] = MODE_SINGLE;
            let mut packed = Vec::with_capacity(52 + call.data.len());
            packed.extend_from_slice(call.to.as_slice());
            packed.extend_from_slice(&call.value.to_be_bytes::<32>());
            packed.extend_from_slice(&call.data);
            packed
        }
        _ => {
            mode[0] = MODE_BATCH;
            abi::encode(&[Token::Array(
                calls
                    .iter()
                    .map(|c| {
                        Token::Tuple(vec![
                            Token::Address(c.to),
                            Token::Uint(c.value),
                            Token::Bytes(c.data.to_vec()),
                        ])
                    })
                    .collect(),
            )])
        }
    };

    abi::encode_call(
        selector("execute(bytes32,bytes)"),
        &[Token::Word(B256::from(mode)), Token::Bytes(execution)],
    )
    .into()
}

/// 192-bit nonce key of a validator: its address right-padded to 24 bytes.
///
/// Operations validated by different modules draw from disjoint nonce
/// sequences on the same account.
pub fn nonce_key(validator: Address) -> U256 {
    let mut key = [0_u8; 24];
    key[..20].copy_from_slice(validator.as_slice());
    U256::from_be_slice(&key)
}

/// How the session signature is wrapped for the validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionSignature {
    /// Session already installed on-chain.
    Use { permission_id: B256 },

    /// Install the session with this operation, then use it.
    Enable {
        permission_id: B256,
        descriptor: Vec<u8>,
        enable_signature: RawSignature,
    },
}

impl SessionSignature {
    /// `mode ‖ permissionId [‖ len ‖ descriptor ‖ enableSig] ‖ signature`.
    pub fn encode(&self, signature: &RawSignature) -> Bytes {
        let mut out = Vec::new();
        match self {
            Self::Use { permission_id } => {
                out.push(0x00);
                out.extend_from_slice(permission_id.as_slice());
            }
            Self::Enable {
                permission_id,
                descriptor,
                enable_signature,
            } => {
                out.push(0x01);
                out.extend_from_slice(permission_id.as_slice());
                out.extend_from_slice(&(descriptor.len() as u32).to_be_bytes());
                out.extend_from_slice(descriptor);
                out.extend_from_slice(enable_signature.as_bytes());
            }
        }
        out.extend_from_slice(signature.as_bytes());
        out.into()
    }

    pub fn permission_id(&self) -> B256 {
        match self {
            Self::Use { permission_id } | Self::Enable { permission_id, .. } => *permission_id,
        }
    }
}

/// Entry point v0.7 user operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserOperation {
    pub sender: Address,
    pub nonce: U256,
    pub factory: Option<Address>,
    pub factory_data: Bytes,
    pub call_data: Bytes,
    pub call_gas_limit: u128,
    pub verification_gas_limit: u128,
    pub pre_verification_gas: u128,
    pub max_fee_per_gas: u128,
    pub max_priority_fee_per_gas: u128,
    pub paymaster: Option<PaymasterFields>,
    pub signature: Bytes,
}

impl UserOperation {
    fn init_code(&self) -> Vec<u8> {
        match self.factory {
            Some(factory) => {
                let mut out = factory.to_vec();
                out.extend_from_slice(&self.factory_data);
                out
            }
            None => Vec::new(),
        }
    }

    fn paymaster_and_data(&self) -> Vec<u8> {
        match &self.paymaster {
            Some(pm) => {
                let mut out = pm.paymaster.to_vec();
                out.extend_from_slice(&pm.verification_gas_limit.to_be_bytes());
                out.extend_from_slice(&pm.post_op_gas_limit.to_be_bytes());
                out.extend_from_slice(&pm.data);
                out
            }
            None => Vec::new(),
        }
    }

    /// Canonical hash: `keccak(abi.encode(keccak(pack(op)), entryPoint, chainId))`.
    ///
    /// The signature field is not covered.
    pub fn hash(&self, entry_point: Address, chain_id: u64) -> B256 {
        let packed = abi::encode(&[
            Token::Address(self.sender),
            Token::Uint(self.nonce),
            Token::Word(keccak256(self.init_code())),
            Token::Word(keccak256(&self.call_data)),
            Token::Word(pack_u128_pair(
                self.verification_gas_limit,
                self.call_gas_limit,
            )),
            Token::Uint(U256::from(self.pre_verification_gas)),
            Token::Word(pack_u128_pair(
                self.max_priority_fee_per_gas,
                self.max_fee_per_gas,
            )),
            Token::Word(keccak256(self.paymaster_and_data())),
        ]);

        keccak256(abi::encode(&[
            Token::Word(keccak256(packed)),
            Token::Address(entry_point),
            Token::Uint(U256::from(chain_id)),
        ]))
    }

    /// JSON-RPC representation (hex quantities, camelCase).
    pub fn to_rpc_json(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("sender".into(), json!(self.sender));
        obj.insert("nonce".into(), json!(quantity(self.nonce)));
        if let Some(factory) = self.factory {
            obj.insert("factory".into(), json!(factory));
            obj.insert("factoryData".into(), json!(self.factory_data));
        }
        obj.insert("callData".into(), json!(self.call_data));
        obj.insert("callGasLimit".into(), json!(quantity(self.call_gas_limit)));
        obj.insert(
            "verificationGasLimit".into(),
            json!(quantity(self.verification_gas_limit)),
        );
        obj.insert(
            "preVerificationGas".into(),
            json!(quantity(self.pre_verification_gas)),
        );
        obj.insert("maxFeePerGas".into(), json!(quantity(self.max_fee_per_gas)));
        obj.insert(
            "maxPriorityFeePerGas".into(),
            json!(quantity(self.max_priority_fee_per_gas)),
        );
        if let Some(pm) = &self.paymaster {
            obj.insert("paymaster".into(), json!(pm.paymaster));
            obj.insert(
                "paymasterVerificationGasLimit".into(),
                json!(quantity(pm.verification_gas_limit)),
            );
            obj.insert(
                "paymasterPostOpGasLimit".into(),
                json!(quantity(pm.post_op_gas_limit)),
            );
            obj.insert("paymasterData".into(), json!(pm.data));
        }
        obj.insert("signature".into(), json!(self.signature));
        Value::Object(obj)
    }
}

fn pack_u128_pair(high: u128, low: u128) -> B256 {
    let mut out = [0_u8; 32];
    out[..16].copy_from_slice(&high.to_be_bytes());
    out[16..].copy_from_slice(&low.to_be_bytes());
    B256::from(out)
}

/// `0x`-prefixed minimal hex quantity.
pub(crate) fn quantity<T>(value: T) -> String
where
    U256: UintTryFrom<T>,
{
    format!("0x{:x}", U256::from(value))
}

/// Chain binding shared by every state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Binding {
    entry_point: Address,
    chain_id: u64,
}

/// Operation with calls and nonce but no signature.
#[derive(Debug, Clone)]
pub struct UnsignedOperation {
    op: UserOperation,
    binding: Binding,
}

impl UnsignedOperation {
    pub fn new(account: &SmartAccount, nonce: U256, calls: &[Call]) -> Self {
        Self {
            op: UserOperation {
                sender: account.address,
                nonce,
                factory: None,
                factory_data: Bytes::new(),
                call_data: encode_execute(calls),
                call_gas_limit: 0,
                verification_gas_limit: 0,
                pre_verification_gas: 0,
                max_fee_per_gas: 0,
                max_priority_fee_per_gas: 0,
                paymaster: None,
                signature: Bytes::new(),
            },
            binding: Binding {
                entry_point: account.entry_point,
                chain_id: account.chain_id,
            },
        }
    }

    pub fn with_fees(mut self, fees: FeeParams) -> Self {
        self.op.max_fee_per_gas = fees.max_fee_per_gas;
        self.op.max_priority_fee_per_gas = fees.max_priority_fee_per_gas;
        self
    }

    pub fn operation(&self) -> &UserOperation {
        &self.op
    }

    /// Attach the placeholder signature, wrapped exactly as the real one will be.
    pub fn mock_sign(mut self, encoding: &SessionSignature) -> MockSignedOperation {
        self.op.signature = encoding.encode(&MOCK_SIGNATURE);
        MockSignedOperation {
            op: self.op,
            binding: self.binding,
        }
    }
}

/// Placeholder-signed operation. Valid input for gas estimation only.
#[derive(Debug, Clone)]
pub struct MockSignedOperation {
    op: UserOperation,
    binding: Binding,
}

impl MockSignedOperation {
    pub fn operation(&self) -> &UserOperation {
        &self.op
    }

    pub fn entry_point(&self) -> Address {
        self.binding.entry_point
    }

    /// Fix the gas fields and compute the canonical hash over them.
    ///
    /// Paymaster fields from the estimate are applied only when
    /// `allow_paymaster` is set.
    pub fn apply_estimate(mut self, gas: GasEstimate, allow_paymaster: bool) -> HashedOperation {
        self.op.call_gas_limit = gas.call_gas_limit;
        self.op.verification_gas_limit = gas.verification_gas_limit;
        self.op.pre_verification_gas = gas.pre_verification_gas;
        self.op.paymaster = if allow_paymaster { gas.paymaster } else { None };
        self.op.signature = Bytes::new();

        let hash = self
            .op
            .hash(self.binding.entry_point, self.binding.chain_id);
        HashedOperation {
            op: self.op,
            binding: self.binding,
            hash,
        }
    }
}

/// Final fields fixed, hash known, not yet signed.
#[derive(Debug, Clone)]
pub struct HashedOperation {
    op: UserOperation,
    binding: Binding,
    hash: B256,
}

impl HashedOperation {
    pub fn hash(&self) -> B256 {
        self.hash
    }

    pub fn operation(&self) -> &UserOperation {
        &self.op
    }

    /// Sign the canonical hash with the session signer.
    pub async fn sign(
        mut self,
        signer: &dyn DigestSigner,
        encoding: &SessionSignature,
    ) -> KeywardResult<SignedOperation> {
        let raw = signer.sign_digest(self.hash).await?;
        if raw.recover(self.hash)? != signer.address() {
            return Err(KeywardError::Signer {
                message: "signature does not recover to the session signer".to_string(),
            });
        }
        self.op.signature = encoding.encode(&raw);
        Ok(SignedOperation {
            op: self.op,
            binding: self.binding,
            hash: self.hash,
        })
    }
}

/// Fully signed operation, ready for submission.
#[derive(Debug, Clone)]
pub struct SignedOperation {
    op: UserOperation,
    binding: Binding,
    hash: B256,
}

impl SignedOperation {
    pub fn hash(&self) -> B256 {
        self.hash
    }

    pub fn operation(&self) -> &UserOperation {
        &self.op
    }

    pub fn entry_point(&self) -> Address {
        self.binding.entry_point
    }
}
