//! Counterfactual account address derivation for the modular account factory.

use crate::chain::ChainClient;
use crate::error::{AccountError, Result};
use ethers::abi::{AbiParser, Token};
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::{get_create2_address_from_hash, keccak256};
use std::collections::HashMap;
use std::str::FromStr;
use tokio::sync::RwLock;

const ACCOUNT_INIT: &str =
    "function init(address handler, address moduleSetupContract, bytes moduleSetupData)";
const DEPLOY_ACCOUNT: &str = "function deployCounterFactualAccount(address moduleSetupContract, bytes moduleSetupData, uint256 index) returns (address)";
const GET_ADDRESS: &str = "function getAddressForCounterFactualAccount(address moduleSetupContract, bytes moduleSetupData, uint256 index) view returns (address)";
const ACCOUNT_CREATION_CODE: &str = "function accountCreationCode() pure returns (bytes)";

/// The on-chain factory and the account implementation it deploys proxies for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FactoryIdentity {
    pub address: Address,
    pub implementation: Address,
    pub fallback_handler: Address,
    /// Proxy creation code. When absent it is read from the factory once and cached.
    pub proxy_creation_code: Option<Bytes>,
}

impl FactoryIdentity {
    /// Parses the factory address, rejecting anything that is not a 20-byte hex address.
    pub fn parse(
        factory: &str,
        implementation: Address,
        fallback_handler: Address,
        proxy_creation_code: Option<Bytes>,
    ) -> Result<Self> {
        let address = Address::from_str(factory)
            .map_err(|e| AccountError::Resolution(format!("invalid factory `{factory}`: {e}")))?;
        let identity = Self {
            address,
            implementation,
            fallback_handler,
            proxy_creation_code,
        };
        identity.validate()?;
        Ok(identity)
    }

    fn validate(&self) -> Result<()> {
        if self.address.is_zero() {
            return Err(AccountError::Resolution(
                "factory address is the zero address".to_string(),
            ));
        }
        Ok(())
    }
}

/// `(factory, module init data, index)`: fixes the counterfactual address forever.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeploymentIdentity {
    pub factory: FactoryIdentity,
    pub module: Address,
    pub module_setup_data: Bytes,
    pub index: U256,
}

impl DeploymentIdentity {
    /// `init(handler, module, setupData)` calldata; the factory salts with its hash.
    pub fn initializer(&self) -> Result<Bytes> {
        let f = parse_function(ACCOUNT_INIT)?;
        let data = f
            .encode_input(&[
                Token::Address(self.factory.fallback_handler),
                Token::Address(self.module),
                Token::Bytes(self.module_setup_data.to_vec()),
            ])
            .map_err(|e| AccountError::Resolution(format!("failed to encode initializer: {e}")))?;
        Ok(Bytes::from(data))
    }

    /// `keccak256(keccak256(initializer) ‖ uint256(index))`.
    pub fn salt(&self) -> Result<H256> {
        let initializer = self.initializer()?;
        let mut packed = Vec::with_capacity(64);
        packed.extend_from_slice(&keccak256(&initializer));
        let mut index = [0u8; 32];
        self.index.to_big_endian(&mut index);
        packed.extend_from_slice(&index);
        Ok(H256::from(keccak256(packed)))
    }

    /// `factory ‖ deployCounterFactualAccount(module, setupData, index)`.
    pub fn init_code(&self) -> Result<Bytes> {
        self.factory.validate()?;
        let data = self.factory_call(DEPLOY_ACCOUNT)?;
        let mut v = Vec::with_capacity(20 + data.len());
        v.extend_from_slice(self.factory.address.as_bytes());
        v.extend_from_slice(data.as_ref());
        Ok(Bytes::from(v))
    }

    fn factory_call(&self, signature: &str) -> Result<Bytes> {
        let f = parse_function(signature)?;
        let data = f
            .encode_input(&[
                Token::Address(self.module),
                Token::Bytes(self.module_setup_data.to_vec()),
                Token::Uint(self.index),
            ])
            .map_err(|e| AccountError::Resolution(format!("failed to encode factory call: {e}")))?;
        Ok(Bytes::from(data))
    }
}

fn parse_function(signature: &str) -> Result<ethers::abi::Function> {
    AbiParser::default()
        .parse_function(signature)
        .map_err(|e| AccountError::Config(format!("invalid ABI signature `{signature}`: {e}")))
}

/// `keccak256(creationCode ‖ uint256(implementation))`.
pub fn proxy_init_code_hash(creation_code: &[u8], implementation: Address) -> H256 {
    let mut code = Vec::with_capacity(creation_code.len() + 32);
    code.extend_from_slice(creation_code);
    code.extend_from_slice(&[0u8; 12]);
    code.extend_from_slice(implementation.as_bytes());
    H256::from(keccak256(code))
}

/// Pure create2 derivation given the proxy init-code hash.
pub fn counterfactual_address(identity: &DeploymentIdentity, init_code_hash: H256) -> Result<Address> {
    identity.factory.validate()?;
    let salt = identity.salt()?;
    Ok(get_create2_address_from_hash(
        identity.factory.address,
        salt.as_bytes(),
        init_code_hash.as_bytes(),
    ))
}

/// Resolves counterfactual addresses, caching each factory's proxy init-code hash so
/// repeated resolutions never touch the network.
#[derive(Debug, Default)]
pub struct AddressResolver {
    init_code_hashes: RwLock<HashMap<(Address, Address), H256>>,
}

impl AddressResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn resolve_address(
        &self,
        chain: &dyn ChainClient,
        identity: &DeploymentIdentity,
    ) -> Result<Address> {
        identity.factory.validate()?;

        match self.init_code_hash(chain, &identity.factory).await {
            Ok(hash) => counterfactual_address(identity, hash),
            Err(e) => {
                tracing::warn!(
                    factory = %identity.factory.address,
                    error = %e,
                    "proxy creation code unavailable, asking factory for the address"
                );
                self.resolve_via_factory(chain, identity).await
            }
        }
    }

    async fn init_code_hash(&self, chain: &dyn ChainClient, factory: &FactoryIdentity) -> Result<H256> {
        let key = (factory.address, factory.implementation);
        if let Some(hash) = self.init_code_hashes.read().await.get(&key) {
            return Ok(*hash);
        }

        let creation_code = match factory.proxy_creation_code.as_ref() {
            Some(code) => code.clone(),
            None => {
                let f = parse_function(ACCOUNT_CREATION_CODE)?;
                let out = chain
                    .call(factory.address, Bytes::from(f.short_signature().to_vec()))
                    .await
                    .map_err(|e| AccountError::chain("accountCreationCode", e))?;
                let mut tokens = f.decode_output(&out).map_err(|e| {
                    AccountError::Resolution(format!("invalid accountCreationCode output: {e}"))
                })?;
                tokens
                    .pop()
                    .and_then(Token::into_bytes)
                    .map(Bytes::from)
                    .ok_or_else(|| {
                        AccountError::Resolution("empty accountCreationCode output".to_string())
                    })?
            }
        };
        if creation_code.is_empty() {
            return Err(AccountError::Resolution(
                "proxy creation code is empty".to_string(),
            ));
        }

        let hash = proxy_init_code_hash(&creation_code, factory.implementation);
        self.init_code_hashes.write().await.insert(key, hash);
        Ok(hash)
    }

    async fn resolve_via_factory(
        &self,
        chain: &dyn ChainClient,
        identity: &DeploymentIdentity,
    ) -> Result<Address> {
        let f = parse_function(GET_ADDRESS)?;
        let data = identity.factory_call(GET_ADDRESS)?;
        let out = chain
            .call(identity.factory.address, data)
            .await
            .map_err(|e| AccountError::chain("getAddressForCounterFactualAccount", e))?;
        let mut tokens = f.decode_output(&out).map_err(|e| {
            AccountError::Resolution(format!("invalid getAddressForCounterFactualAccount output: {e}"))
        })?;
        tokens
            .pop()
            .and_then(Token::into_address)
            .ok_or_else(|| AccountError::Resolution("factory returned no address".to_string()))
    }
}
