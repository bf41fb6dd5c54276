use anyhow::{Context, Result};
use async_trait::async_trait;
use ethers::abi::AbiParser;
use ethers::prelude::*;
use ethers::providers::Middleware;
use ethers::types::transaction::eip2718::TypedTransaction;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;

/// EIP-1559 fee fields as reported by the chain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FeeData {
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
}

/// Read-only chain queries the pipeline depends on.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn get_code(&self, address: Address) -> Result<Bytes>;

    /// `EntryPoint.getNonce(sender, key)`.
    async fn get_nonce(&self, entry_point: Address, sender: Address, key: U256) -> Result<U256>;

    async fn fee_data(&self) -> Result<FeeData>;

    /// Gas simulation for an arbitrary call.
    async fn estimate_gas(&self, from: Address, to: Address, data: Bytes) -> Result<U256>;

    /// `eth_call` returning raw output.
    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes>;
}

/// [`ChainClient`] backed by an ethers middleware stack.
#[derive(Debug, Clone)]
pub struct ProviderChainClient<M> {
    client: Arc<M>,
}

impl<M: Middleware + 'static> ProviderChainClient<M> {
    pub fn new(client: Arc<M>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl<M: Middleware + 'static> ChainClient for ProviderChainClient<M> {
    async fn get_code(&self, address: Address) -> Result<Bytes> {
        self.client
            .get_code(address, None)
            .await
            .context("eth_getCode failed")
    }

    async fn get_nonce(&self, entry_point: Address, sender: Address, key: U256) -> Result<U256> {
        let entrypoint_abi = AbiParser::default()
            .parse(&["function getNonce(address sender, uint192 key) view returns (uint256)"])?;
        let entrypoint_c = Contract::new(entry_point, entrypoint_abi, self.client.clone());

        let nonce: U256 = entrypoint_c
            .method("getNonce", (sender, key))?
            .call()
            .await
            .context("entryPoint.getNonce failed")?;
        Ok(nonce)
    }

    async fn fee_data(&self) -> Result<FeeData> {
        match self.client.estimate_eip1559_fees(None).await {
            Ok((max_fee_per_gas, max_priority_fee_per_gas)) => Ok(FeeData {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            }),
            Err(e) => {
                // Legacy chains: fall back to a single gas price for both fields.
                tracing::debug!(error = %e, "eip-1559 fee estimate unavailable, using gas price");
                let gas_price = self
                    .client
                    .get_gas_price()
                    .await
                    .context("failed to fetch gas price")?;
                Ok(FeeData {
                    max_fee_per_gas: gas_price,
                    max_priority_fee_per_gas: gas_price,
                })
            }
        }
    }

    async fn estimate_gas(&self, from: Address, to: Address, data: Bytes) -> Result<U256> {
        let tx: TypedTransaction = TransactionRequest::new().from(from).to(to).data(data).into();
        self.client
            .estimate_gas(&tx, None)
            .await
            .context("eth_estimateGas failed")
    }

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes> {
        let tx: TypedTransaction = TransactionRequest::new().to(to).data(data).into();
        self.client
            .call(&tx, None)
            .await
            .context("eth_call failed")
    }
}

/// Memoizing "is the account deployed" check.
///
/// Only positive results are cached: an address moves from unknown to deployed and
/// never back, so entries are never invalidated.
#[derive(Debug, Default)]
pub struct DeploymentCache {
    deployed: RwLock<HashSet<Address>>,
}

impl DeploymentCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn is_deployed(&self, chain: &dyn ChainClient, address: Address) -> Result<bool> {
        if self.deployed.read().await.contains(&address) {
            return Ok(true);
        }

        let code = chain.get_code(address).await?;
        let deployed = !code.as_ref().is_empty();
        if deployed {
            self.deployed.write().await.insert(address);
        }
        tracing::debug!(%address, deployed, "checked account deployment");
        Ok(deployed)
    }

    /// Records an address as deployed without a chain query (e.g. after a receipt).
    pub async fn mark_deployed(&self, address: Address) {
        self.deployed.write().await.insert(address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn positive_deployment_result_is_cached() {
        let mut chain = MockChainClient::new();
        chain
            .expect_get_code()
            .times(1)
            .returning(|_| Ok(Bytes::from(vec![0x60, 0x80])));

        let cache = DeploymentCache::new();
        let addr = Address::repeat_byte(0x01);
        assert!(cache.is_deployed(&chain, addr).await.unwrap());
        assert!(cache.is_deployed(&chain, addr).await.unwrap());
    }

    #[tokio::test]
    async fn negative_result_is_rechecked() {
        let mut chain = MockChainClient::new();
        let mut seq = mockall::Sequence::new();
        chain
            .expect_get_code()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Bytes::default()));
        chain
            .expect_get_code()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Bytes::from(vec![0x01])));

        let cache = DeploymentCache::new();
        let addr = Address::repeat_byte(0x02);
        assert!(!cache.is_deployed(&chain, addr).await.unwrap());
        assert!(cache.is_deployed(&chain, addr).await.unwrap());
    }

    #[tokio::test]
    async fn marked_address_skips_chain() {
        let chain = MockChainClient::new();
        let cache = DeploymentCache::new();
        let addr = Address::repeat_byte(0x03);
        cache.mark_deployed(addr).await;
        assert!(cache.is_deployed(&chain, addr).await.unwrap());
    }
}
