use crate::address::FactoryIdentity;
use crate::encoding::parse_hex_bytes;
use crate::gas::GasConfig;
use anyhow::{anyhow, Context, Result};
use ethers::types::{Address, U256};
use serde::Deserialize;
use std::{env, fs, path::Path};

/// Account configuration file as written by deployment tooling.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountConfigRaw {
    pub chain_id: u64,
    pub rpc: String,
    #[serde(default)]
    pub rpc_env_var: Option<String>,
    pub entry_point: String,
    pub factory: String,
    pub implementation: String,
    pub fallback_handler: String,
    #[serde(default)]
    pub proxy_creation_code: Option<String>,
    pub ecdsa_module: String,
    #[serde(default)]
    pub bundler_url: Option<String>,
    #[serde(default)]
    pub paymaster_url: Option<String>,
    #[serde(default)]
    pub strict_sponsorship: bool,
    #[serde(default)]
    pub index: u64,
    #[serde(default)]
    pub gas: GasConfig,
}

#[derive(Debug, Clone)]
pub struct AccountConfig {
    pub chain_id: u64,
    pub rpc_url: String,
    pub entry_point: Address,
    pub factory: FactoryIdentity,
    pub ecdsa_module: Address,
    pub bundler_url: Option<String>,
    pub paymaster_url: Option<String>,
    pub strict_sponsorship: bool,
    pub index: U256,
    pub gas: GasConfig,
}

/// Loads the account config. `rpc_override` wins over `rpcEnvVar`, which wins over `rpc`.
pub fn load_config(path: &Path, rpc_override: Option<String>) -> Result<AccountConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read account config at {}", path.display()))?;
    let raw: AccountConfigRaw = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse account config at {}", path.display()))?;
    resolve(raw, rpc_override)
}

fn resolve(raw: AccountConfigRaw, rpc_override: Option<String>) -> Result<AccountConfig> {
    let rpc_url = if let Some(rpc) = rpc_override {
        rpc
    } else if let Some(env_var) = raw.rpc_env_var.as_deref() {
        env::var(env_var).unwrap_or_else(|_| raw.rpc.clone())
    } else {
        raw.rpc.clone()
    };

    let proxy_creation_code = raw
        .proxy_creation_code
        .as_deref()
        .map(parse_hex_bytes)
        .transpose()
        .context("invalid proxyCreationCode")?;
    let factory = FactoryIdentity::parse(
        &raw.factory,
        parse_addr(&raw.implementation).context("invalid implementation address")?,
        parse_addr(&raw.fallback_handler).context("invalid fallbackHandler address")?,
        proxy_creation_code,
    )?;

    if raw.gas.overheads.bundle_size == 0 {
        return Err(anyhow!("gas.overheads.bundleSize must be at least 1"));
    }

    Ok(AccountConfig {
        chain_id: raw.chain_id,
        rpc_url,
        entry_point: parse_addr(&raw.entry_point).context("invalid entryPoint address")?,
        factory,
        ecdsa_module: parse_addr(&raw.ecdsa_module).context("invalid ecdsaModule address")?,
        bundler_url: raw.bundler_url,
        paymaster_url: raw.paymaster_url,
        strict_sponsorship: raw.strict_sponsorship,
        index: U256::from(raw.index),
        gas: raw.gas,
    })
}

pub fn parse_addr(s: &str) -> Result<Address> {
    s.parse::<Address>().map_err(|e| anyhow!("{e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(extra: serde_json::Value) -> AccountConfigRaw {
        let mut base = json!({
            "chainId": 84532,
            "rpc": "https://sepolia.base.org",
            "entryPoint": "0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789",
            "factory": "0x000000a56Aaca3e9a4C479ea6b6CD0DbcB6634F5",
            "implementation": "0x0000002512019Dafb59528B82CB92D3c5D2423aC",
            "fallbackHandler": "0x0bBa6d96BD616BedC6BFaa341742FD43c60b83C1",
            "ecdsaModule": "0x0000001c5b32F37F5beA87BDD5374eB2aC54eA8e"
        });
        if let (Some(obj), Some(more)) = (base.as_object_mut(), extra.as_object()) {
            for (k, v) in more {
                obj.insert(k.clone(), v.clone());
            }
        }
        serde_json::from_value(base).unwrap()
    }

    #[test]
    fn defaults_apply_when_optional_fields_are_absent() {
        let cfg = resolve(raw(json!({})), None).unwrap();
        assert_eq!(cfg.chain_id, 84532);
        assert_eq!(cfg.index, U256::zero());
        assert!(!cfg.strict_sponsorship);
        assert_eq!(cfg.gas, GasConfig::default());
        assert!(cfg.factory.proxy_creation_code.is_none());
    }

    #[test]
    fn partial_gas_config_keeps_other_defaults() {
        let cfg = resolve(
            raw(json!({ "gas": { "gasMultiplierBps": 12500, "overheads": { "perUserOp": 20000 } } })),
            None,
        )
        .unwrap();
        assert_eq!(cfg.gas.gas_multiplier_bps, 12_500);
        assert_eq!(cfg.gas.overheads.per_user_op, 20_000);
        assert_eq!(cfg.gas.overheads.fixed, 21_000);
        assert_eq!(cfg.gas.base_verification_gas, 100_000);
    }

    #[test]
    fn rpc_override_wins() {
        let cfg = resolve(raw(json!({})), Some("http://localhost:8545".to_string())).unwrap();
        assert_eq!(cfg.rpc_url, "http://localhost:8545");
    }

    #[test]
    fn malformed_factory_is_rejected() {
        assert!(resolve(raw(json!({ "factory": "0x1234" })), None).is_err());
    }

    #[test]
    fn proxy_creation_code_is_decoded() {
        let cfg = resolve(raw(json!({ "proxyCreationCode": "0x6080" })), None).unwrap();
        assert_eq!(
            cfg.factory.proxy_creation_code.unwrap().to_vec(),
            vec![0x60, 0x80]
        );
    }
}
