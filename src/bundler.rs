use crate::encoding::{fmt_address, fmt_h256, parse_h256, parse_optional_u256_field};
use crate::rpc::JsonRpcTransport;
use crate::types::UserOperationReceipt;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
use serde_json::Value;

/// Gas fields returned by `eth_estimateUserOperationGas`; any of them may be absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BundlerGasEstimate {
    pub call_gas_limit: Option<U256>,
    pub verification_gas_limit: Option<U256>,
    pub pre_verification_gas: Option<U256>,
    pub max_fee_per_gas: Option<U256>,
    pub max_priority_fee_per_gas: Option<U256>,
}

/// ERC-4337 bundler JSON-RPC surface used by the pipeline.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Bundler: Send + Sync {
    async fn estimate_user_operation_gas(
        &self,
        user_op: Value,
        entrypoint: Address,
    ) -> Result<BundlerGasEstimate>;

    async fn send_user_operation(&self, user_op: Value, entrypoint: Address) -> Result<H256>;

    /// `None` while the operation has not been included.
    async fn get_user_operation_receipt(
        &self,
        user_op_hash: H256,
    ) -> Result<Option<UserOperationReceipt>>;
}

/// [`Bundler`] over HTTP JSON-RPC.
#[derive(Debug, Clone)]
pub struct BundlerClient {
    rpc: JsonRpcTransport,
}

impl BundlerClient {
    pub fn new(url: String) -> Self {
        Self {
            rpc: JsonRpcTransport::new(url),
        }
    }
}

#[async_trait]
impl Bundler for BundlerClient {
    async fn estimate_user_operation_gas(
        &self,
        user_op: Value,
        entrypoint: Address,
    ) -> Result<BundlerGasEstimate> {
        let params = serde_json::json!([user_op, fmt_address(entrypoint)]);
        let res = self
            .rpc
            .request("eth_estimateUserOperationGas", params)
            .await
            .context("eth_estimateUserOperationGas failed")?;
        parse_gas_estimate(&res)
    }

    async fn send_user_operation(&self, user_op: Value, entrypoint: Address) -> Result<H256> {
        let params = serde_json::json!([user_op, fmt_address(entrypoint)]);
        let res = self
            .rpc
            .request("eth_sendUserOperation", params)
            .await
            .context("eth_sendUserOperation failed")?;
        parse_userop_hash(&res)
    }

    async fn get_user_operation_receipt(
        &self,
        user_op_hash: H256,
    ) -> Result<Option<UserOperationReceipt>> {
        let params = serde_json::json!([fmt_h256(user_op_hash)]);
        let res = self
            .rpc
            .request("eth_getUserOperationReceipt", params)
            .await
            .context("eth_getUserOperationReceipt failed")?;
        if res.is_null() {
            return Ok(None);
        }
        parse_receipt(user_op_hash, res).map(Some)
    }
}

fn parse_gas_estimate(res: &Value) -> Result<BundlerGasEstimate> {
    Ok(BundlerGasEstimate {
        call_gas_limit: parse_optional_u256_field(res, "callGasLimit")?,
        verification_gas_limit: parse_optional_u256_field(res, "verificationGasLimit")?,
        pre_verification_gas: parse_optional_u256_field(res, "preVerificationGas")?,
        max_fee_per_gas: parse_optional_u256_field(res, "maxFeePerGas")?,
        max_priority_fee_per_gas: parse_optional_u256_field(res, "maxPriorityFeePerGas")?,
    })
}

/// Keys under which some bundlers wrap the hash instead of returning a bare string.
const HASH_WRAPPER_KEYS: [&str; 3] = ["result", "userOpHash", "userOperationHash"];

fn parse_userop_hash(res: &Value) -> Result<H256> {
    let raw = res
        .as_str()
        .or_else(|| {
            HASH_WRAPPER_KEYS
                .iter()
                .find_map(|key| res.get(*key).and_then(Value::as_str))
        })
        .ok_or_else(|| anyhow!("eth_sendUserOperation returned no user operation hash: {res}"))?;
    parse_h256(raw)
}

fn parse_receipt(user_op_hash: H256, res: Value) -> Result<UserOperationReceipt> {
    let success = res.get("success").and_then(Value::as_bool).unwrap_or(false);
    // v0.6 receipts nest the transaction under `receipt`; accept a top-level hash too.
    let tx_hash = res
        .get("receipt")
        .and_then(|r| r.get("transactionHash"))
        .or_else(|| res.get("transactionHash"))
        .and_then(Value::as_str)
        .map(parse_h256)
        .transpose()
        .context("invalid transactionHash in receipt")?;

    Ok(UserOperationReceipt {
        user_op_hash,
        success,
        transaction_hash: tx_hash,
        raw: res,
    })
}
