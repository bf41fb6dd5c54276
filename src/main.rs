use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use ethers::prelude::*;
use modular_aa::bundler::BundlerClient;
use modular_aa::chain::ProviderChainClient;
use modular_aa::config::{load_config, parse_addr, AccountConfig};
use modular_aa::encoding::{self, parse_hex_bytes, user_op_to_json};
use modular_aa::modules::EcdsaOwnershipModule;
use modular_aa::paymaster::{PaymasterClient, PaymasterIntegrator};
use modular_aa::{AccountParams, BuildOptions, Call, InclusionOutcome, SmartAccount};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "modular-aa", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the counterfactual smart account address (and deployment status).
    Account(AccountArgs),

    /// Build and sign a UserOperation, print it and its hash without sending.
    Hash(OpArgs),

    /// Build, optionally sponsor, sign and submit a UserOperation.
    Send(SendArgs),
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Account config JSON.
    #[arg(long, default_value = "config/base-sepolia.json")]
    config: PathBuf,

    /// Override the config's RPC URL.
    #[arg(long, env = "MODULAR_AA_RPC_URL")]
    rpc: Option<String>,

    /// Owner key for the ECDSA ownership module.
    #[arg(long, env = "MODULAR_AA_OWNER_PRIVATE_KEY", hide_env_values = true)]
    owner_private_key: String,

    /// Override the deployment index from the config.
    #[arg(long)]
    index: Option<u64>,

    /// Print machine-readable JSON on stdout.
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug)]
struct AccountArgs {
    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Args, Debug)]
struct OpArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Call as `to:value:data` (value in wei, data hex). Repeat for a batch.
    #[arg(long = "call", required = true)]
    calls: Vec<String>,

    /// Encode a single call with executeBatch.
    #[arg(long, default_value_t = false)]
    force_batch: bool,

    #[arg(long, env = "MODULAR_AA_BUNDLER_URL")]
    bundler: Option<String>,

    /// Estimate gas from the chain only.
    #[arg(long, default_value_t = false)]
    skip_bundler_estimate: bool,

    #[arg(long, env = "MODULAR_AA_GAS_MULTIPLIER_BPS")]
    gas_multiplier_bps: Option<u64>,

    #[arg(long)]
    nonce_key: Option<u64>,
}

#[derive(Args, Debug)]
struct SendArgs {
    #[command(flatten)]
    op: OpArgs,

    /// Ask the paymaster to sponsor gas.
    #[arg(long, default_value_t = false)]
    sponsor: bool,

    #[arg(long, env = "MODULAR_AA_PAYMASTER_URL")]
    paymaster_url: Option<String>,

    /// Fail instead of self-funding when sponsorship fails.
    #[arg(long, default_value_t = false)]
    strict_sponsorship: bool,

    /// Wait for the receipt after submitting.
    #[arg(long, default_value_t = false)]
    wait: bool,

    #[arg(long, default_value_t = 180)]
    timeout_secs: u64,

    #[arg(long, default_value_t = 1500)]
    poll_interval_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        // Always write logs to stderr so stdout can be used for script-friendly outputs.
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.cmd {
        Command::Account(args) => cmd_account(args).await,
        Command::Hash(args) => cmd_hash(args).await,
        Command::Send(args) => cmd_send(args).await,
    }
}

async fn connect(
    common: &CommonArgs,
    gas_multiplier_bps: Option<u64>,
) -> Result<(AccountConfig, SmartAccount)> {
    let mut cfg = load_config(&common.config, common.rpc.clone())?;
    if let Some(index) = common.index {
        cfg.index = U256::from(index);
    }
    if let Some(bps) = gas_multiplier_bps {
        cfg.gas.gas_multiplier_bps = bps;
    }

    let provider =
        Provider::<Http>::try_from(cfg.rpc_url.as_str())?.interval(Duration::from_millis(350));
    let chain_id = provider.get_chainid().await?.as_u64();
    if chain_id != cfg.chain_id {
        return Err(anyhow!(
            "chainId mismatch: config has {}, RPC returned {}",
            cfg.chain_id,
            chain_id
        ));
    }

    let wallet: LocalWallet = common
        .owner_private_key
        .parse::<LocalWallet>()
        .context("invalid owner private key")?
        .with_chain_id(chain_id);
    tracing::info!(owner = ?wallet.address(), "loaded owner key");

    let module = Arc::new(EcdsaOwnershipModule::new(cfg.ecdsa_module, wallet));
    let params = AccountParams {
        chain_id,
        entry_point: cfg.entry_point,
        factory: cfg.factory.clone(),
        index: cfg.index,
        gas: cfg.gas,
    };
    let chain = Arc::new(ProviderChainClient::new(Arc::new(provider)));
    Ok((cfg, SmartAccount::new(chain, params, module)))
}

async fn cmd_account(args: AccountArgs) -> Result<()> {
    let (cfg, account) = connect(&args.common, None).await?;
    let address = account.account_address().await?;
    let deployed = account.is_deployed().await?;

    if args.common.json {
        let out = serde_json::json!({
            "chainId": cfg.chain_id,
            "factory": encoding::fmt_address(cfg.factory.address),
            "index": cfg.index.to_string(),
            "smartAccount": encoding::fmt_address(address),
            "deployed": deployed,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!("smart account: {}", encoding::fmt_address(address));
        println!("deployed:      {}", deployed);
        if !deployed {
            println!("initCode:      {}", encoding::fmt_bytes(&account.init_code()?));
        }
    }
    Ok(())
}

fn parse_call(s: &str) -> Result<Call> {
    let mut parts = s.splitn(3, ':');
    let to = parts.next().ok_or_else(|| anyhow!("missing call target in `{s}`"))?;
    let value = parts.next().unwrap_or("0");
    let data = parts.next().unwrap_or("0x");
    Ok(Call::new(
        parse_addr(to).with_context(|| format!("invalid call target `{to}`"))?,
        U256::from_dec_str(value).with_context(|| format!("invalid call value `{value}`"))?,
        parse_hex_bytes(data).with_context(|| format!("invalid call data `{data}`"))?,
    ))
}

fn configure(
    cfg: &AccountConfig,
    args: &OpArgs,
    mut account: SmartAccount,
) -> Result<(SmartAccount, BuildOptions, Vec<Call>)> {
    let calls = args
        .calls
        .iter()
        .map(|c| parse_call(c))
        .collect::<Result<Vec<_>>>()?;

    if let Some(url) = args.bundler.clone().or_else(|| cfg.bundler_url.clone()) {
        account = account.with_bundler(Arc::new(BundlerClient::new(url)));
    }

    let options = BuildOptions {
        nonce_key: U256::from(args.nonce_key.unwrap_or_default()),
        force_batch: args.force_batch,
        skip_bundler_estimate: args.skip_bundler_estimate,
        ..Default::default()
    };
    Ok((account, options, calls))
}

async fn cmd_hash(args: OpArgs) -> Result<()> {
    let (cfg, account) = connect(&args.common, args.gas_multiplier_bps).await?;
    let (account, options, calls) = configure(&cfg, &args, account)?;

    let req = account.build(&calls, &options).await?;
    let op = account.sign(req).await?;
    let hash = account.hash(&op);

    if args.common.json {
        let out = serde_json::json!({
            "userOpHash": encoding::fmt_h256(hash),
            "userOperation": user_op_to_json(&op),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!("UserOperation:\n{}", serde_json::to_string_pretty(&user_op_to_json(&op))?);
        println!("userOpHash: {}", encoding::fmt_h256(hash));
    }
    Ok(())
}

async fn cmd_send(args: SendArgs) -> Result<()> {
    let op_args = &args.op;
    let (cfg, account) = connect(&op_args.common, op_args.gas_multiplier_bps).await?;
    let (mut account, mut options, calls) = configure(&cfg, op_args, account)?;

    if args.sponsor {
        let url = args
            .paymaster_url
            .clone()
            .or_else(|| cfg.paymaster_url.clone())
            .ok_or_else(|| {
                anyhow!("--sponsor requires --paymaster-url (or MODULAR_AA_PAYMASTER_URL)")
            })?;
        let strict = args.strict_sponsorship || cfg.strict_sponsorship;
        account = account.with_paymaster(PaymasterIntegrator::new(
            Arc::new(PaymasterClient::new(url)),
            strict,
        ));
        options.sponsored = true;
    }

    let user_op_hash = account.send(&calls, &options).await?;
    println!("userOpHash: {}", encoding::fmt_h256(user_op_hash));

    if !args.wait {
        return Ok(());
    }
    let outcome = account
        .await_inclusion(
            user_op_hash,
            Duration::from_secs(args.timeout_secs),
            Duration::from_millis(args.poll_interval_ms),
        )
        .await?;
    match outcome {
        InclusionOutcome::Included(receipt) => {
            println!("success: {}", receipt.success);
            if let Some(tx) = receipt.transaction_hash {
                println!("transactionHash: {}", encoding::fmt_h256(tx));
            }
            if !receipt.success {
                return Err(anyhow!("user operation reverted"));
            }
        }
        InclusionOutcome::NotFound => {
            println!("not included within {}s", args.timeout_secs);
        }
    }
    Ok(())
}
