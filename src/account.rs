//! The modular smart account: builds, prices, signs and submits UserOperations.
//!
//! A [`SmartAccount`] owns one deployment identity (factory, default module, index),
//! the module registry and the collaborators the pipeline consults. Building follows
//! a fixed order: call data, sender, nonce and init code, dummy signature, gas.
//! Paymaster data is attached separately, then the operation is signed and submitted.

use crate::address::{AddressResolver, DeploymentIdentity, FactoryIdentity};
use crate::bundler::Bundler;
use crate::calldata::encode_calls;
use crate::chain::{ChainClient, DeploymentCache};
use crate::dispatch::DispatchGateway;
use crate::error::{AccountError, Result};
use crate::gas::{EstimateOptions, GasConfig, GasEstimationOrchestrator, GasOverrides};
use crate::hash::HashEngine;
use crate::modules::{wrap_signature, MultiChainItem, ValidationModule, ValidationModuleRegistry};
use crate::paymaster::{
    FeeQuotesResponse, PaymasterIntegrator, SponsorOutcome, TokenInfo, TokenPaymasterRequest,
    TokenUserOp,
};
use crate::types::{Call, InclusionOutcome, UserOperation, UserOperationRequest};
use ethers::types::{Address, Bytes, H256, U256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

/// Fixed inputs of a smart account.
#[derive(Clone, Debug)]
pub struct AccountParams {
    pub chain_id: u64,
    pub entry_point: Address,
    pub factory: FactoryIdentity,
    /// Deployment index; different indexes give different accounts for one owner.
    pub index: U256,
    pub gas: GasConfig,
}

/// Per-build options.
#[derive(Clone, Debug, Default)]
pub struct BuildOptions {
    pub overrides: GasOverrides,
    /// Used verbatim instead of querying the entry point.
    pub nonce_override: Option<U256>,
    /// 192-bit nonce key (parallel nonce space).
    pub nonce_key: U256,
    /// Added to the resolved nonce, for queuing several operations.
    pub nonce_offset: U256,
    /// Encode a single call with `executeBatch`.
    pub force_batch: bool,
    pub skip_bundler_estimate: bool,
    /// Ask the attached paymaster for call and verification limits.
    pub sponsored: bool,
}

pub struct SmartAccount {
    chain: Arc<dyn ChainClient>,
    params: AccountParams,
    hash_engine: HashEngine,
    registry: ValidationModuleRegistry,
    resolver: AddressResolver,
    deployments: DeploymentCache,
    gas: GasEstimationOrchestrator,
    paymaster: Option<PaymasterIntegrator>,
    dispatch: Option<DispatchGateway>,
    address: OnceCell<Address>,
}

impl SmartAccount {
    /// `default_module` fixes the deployment identity and starts out as the active module.
    pub fn new(
        chain: Arc<dyn ChainClient>,
        params: AccountParams,
        default_module: Arc<dyn ValidationModule>,
    ) -> Self {
        Self {
            hash_engine: HashEngine::new(params.entry_point, params.chain_id),
            gas: GasEstimationOrchestrator::new(chain.clone(), None, params.entry_point, params.gas),
            registry: ValidationModuleRegistry::new(default_module),
            resolver: AddressResolver::new(),
            deployments: DeploymentCache::new(),
            paymaster: None,
            dispatch: None,
            address: OnceCell::new(),
            chain,
            params,
        }
    }

    /// Uses `bundler` for gas estimation and submission.
    pub fn with_bundler(mut self, bundler: Arc<dyn Bundler>) -> Self {
        self.gas = GasEstimationOrchestrator::new(
            self.chain.clone(),
            Some(bundler.clone()),
            self.params.entry_point,
            self.params.gas,
        );
        self.dispatch = Some(DispatchGateway::new(bundler, self.params.entry_point));
        self
    }

    pub fn with_paymaster(mut self, paymaster: PaymasterIntegrator) -> Self {
        self.paymaster = Some(paymaster);
        self
    }

    pub fn chain_id(&self) -> u64 {
        self.params.chain_id
    }

    pub fn entry_point(&self) -> Address {
        self.params.entry_point
    }

    pub fn registry(&self) -> &ValidationModuleRegistry {
        &self.registry
    }

    /// Swaps the signing module. Must not race with an in-flight build or sign.
    pub fn set_active_module(&mut self, module: Arc<dyn ValidationModule>) {
        self.registry.set_active(module);
    }

    /// Deployment identity derived from the default module, never the active one.
    pub fn deployment_identity(&self) -> Result<DeploymentIdentity> {
        let module = self.registry.get_default()?;
        Ok(DeploymentIdentity {
            factory: self.params.factory.clone(),
            module: module.address(),
            module_setup_data: module.init_data()?,
            index: self.params.index,
        })
    }

    pub async fn account_address(&self) -> Result<Address> {
        self.address
            .get_or_try_init(|| async {
                let identity = self.deployment_identity()?;
                let address = self
                    .resolver
                    .resolve_address(self.chain.as_ref(), &identity)
                    .await?;
                tracing::info!(account = ?address, index = %identity.index, "resolved counterfactual address");
                Ok::<_, AccountError>(address)
            })
            .await
            .copied()
    }

    pub async fn is_deployed(&self) -> Result<bool> {
        let address = self.account_address().await?;
        self.deployments
            .is_deployed(self.chain.as_ref(), address)
            .await
            .map_err(|e| AccountError::chain("eth_getCode", e))
    }

    /// `factory ‖ deployCounterFactualAccount(...)` for the default module.
    pub fn init_code(&self) -> Result<Bytes> {
        self.deployment_identity()?.init_code()
    }

    async fn resolve_nonce(
        &self,
        sender: Address,
        is_deployed: bool,
        options: &BuildOptions,
    ) -> Result<U256> {
        if let Some(nonce) = options.nonce_override {
            return Ok(nonce);
        }
        let base = if is_deployed {
            self.chain
                .get_nonce(self.params.entry_point, sender, options.nonce_key)
                .await
                .map_err(|e| AccountError::chain("getNonce", e))?
        } else {
            // Nothing has been sent from an account without code: sequence zero in this key.
            options.nonce_key << 64
        };
        Ok(base + options.nonce_offset)
    }

    async fn assemble_with_status(
        &self,
        calls: &[Call],
        options: &BuildOptions,
    ) -> Result<(UserOperationRequest, bool)> {
        if calls.is_empty() {
            return Err(AccountError::EmptyBatch);
        }
        let call_data = encode_calls(calls, options.force_batch)?;
        let sender = self.account_address().await?;
        let is_deployed = self.is_deployed().await?;
        let nonce = self.resolve_nonce(sender, is_deployed, options).await?;
        let init_code = if is_deployed {
            Bytes::default()
        } else {
            self.init_code()?
        };

        let module = self.registry.get_active()?;
        let dummy = wrap_signature(&module.dummy_signature(&call_data)?, module.address());

        tracing::debug!(
            ?sender,
            %nonce,
            is_deployed,
            calls = calls.len(),
            module = ?module.address(),
            "assembled user operation"
        );
        let req = UserOperationRequest {
            sender: Some(sender),
            nonce: Some(nonce),
            init_code: Some(init_code),
            call_data: Some(call_data),
            paymaster_and_data: Some(Bytes::default()),
            signature: Some(dummy),
            ..Default::default()
        };
        Ok((req, is_deployed))
    }

    /// Everything but gas: call data, sender, nonce, init code and a dummy signature.
    pub async fn assemble(
        &self,
        calls: &[Call],
        options: &BuildOptions,
    ) -> Result<UserOperationRequest> {
        self.assemble_with_status(calls, options)
            .await
            .map(|(req, _)| req)
    }

    /// Assembles and prices an operation. Paymaster data is left empty.
    pub async fn build(
        &self,
        calls: &[Call],
        options: &BuildOptions,
    ) -> Result<UserOperationRequest> {
        self.build_with_sponsorship(calls, options)
            .await
            .map(|(req, _)| req)
    }

    async fn build_with_sponsorship(
        &self,
        calls: &[Call],
        options: &BuildOptions,
    ) -> Result<(UserOperationRequest, Option<SponsorOutcome>)> {
        let (req, is_deployed) = self.assemble_with_status(calls, options).await?;
        let estimate = self.estimate_options(options, is_deployed);
        self.gas.estimate_with_sponsorship(req, &estimate).await
    }

    fn estimate_options(&self, options: &BuildOptions, is_deployed: bool) -> EstimateOptions<'_> {
        EstimateOptions {
            overrides: options.overrides,
            skip_bundler: options.skip_bundler_estimate,
            is_deployed,
            sponsor: if options.sponsored {
                self.paymaster.as_ref()
            } else {
                None
            },
        }
    }

    fn paymaster(&self) -> Result<&PaymasterIntegrator> {
        self.paymaster
            .as_ref()
            .ok_or_else(|| AccountError::Config("no paymaster configured".to_string()))
    }

    /// Sponsor mode: sets `paymasterAndData` from `service_data` or the paymaster service.
    pub async fn attach_paymaster(
        &self,
        req: UserOperationRequest,
        service_data: Option<Bytes>,
    ) -> Result<UserOperationRequest> {
        self.paymaster()?.attach(req, service_data).await
    }

    pub async fn fee_quotes(
        &self,
        req: &UserOperationRequest,
        token_info: TokenInfo,
    ) -> Result<FeeQuotesResponse> {
        self.paymaster()?.fee_quotes(req, token_info).await
    }

    /// Token mode: prepends the fee-token approval and re-prices the operation.
    pub async fn build_token_user_op(
        &self,
        req: UserOperationRequest,
        token: &TokenPaymasterRequest,
        options: &BuildOptions,
    ) -> Result<TokenUserOp> {
        let is_deployed = self.is_deployed().await?;
        let mut estimate = self.estimate_options(options, is_deployed);
        estimate.sponsor = None;
        self.paymaster()?
            .build_token_user_op(req, token, &self.gas, &estimate)
            .await
    }

    /// Protocol hash of `op` on this account's chain and entry point.
    pub fn hash(&self, op: &UserOperation) -> H256 {
        self.hash_engine.hash(op)
    }

    /// Signs with the active module and wraps the result with the module address.
    ///
    /// Every field but the signature must be set; any later change invalidates the
    /// signature.
    pub async fn sign(&self, req: UserOperationRequest) -> Result<UserOperation> {
        let mut op = req.into_user_operation(false)?;
        let module = self.registry.get_active()?;
        let user_op_hash = self.hash_engine.hash(&op);

        let module_signature = module.sign_user_op_hash(user_op_hash, &op).await?;
        op.signature = wrap_signature(&module_signature, module.address());
        tracing::info!(
            user_op_hash = ?user_op_hash,
            module = ?module.address(),
            "user operation signed"
        );
        Ok(op)
    }

    /// One owner signature over a batch of operations on different chains.
    ///
    /// The active module must support multi-chain signing. Each returned operation
    /// carries its own Merkle proof.
    pub async fn sign_multichain(&self, items: Vec<MultiChainItem>) -> Result<Vec<UserOperation>> {
        let module = self.registry.get_active()?;
        let multi_chain = module.as_multi_chain().ok_or_else(|| {
            AccountError::Signing(format!(
                "module {:?} does not support multi-chain signing",
                module.address()
            ))
        })?;

        let signatures = multi_chain.sign_batch(&items).await?;
        tracing::info!(operations = items.len(), "multi-chain batch signed");
        Ok(items
            .into_iter()
            .zip(signatures)
            .map(|(item, sig)| {
                let mut op = item.user_op;
                op.signature = wrap_signature(&sig, module.address());
                op
            })
            .collect())
    }

    fn dispatch(&self) -> Result<&DispatchGateway> {
        self.dispatch
            .as_ref()
            .ok_or_else(|| AccountError::Config("no bundler configured".to_string()))
    }

    pub async fn submit(&self, op: &UserOperation) -> Result<H256> {
        self.dispatch()?.submit(op).await
    }

    /// Polls for inclusion. A successful inclusion marks the account as deployed.
    pub async fn await_inclusion(
        &self,
        user_op_hash: H256,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<InclusionOutcome> {
        let outcome = self
            .dispatch()?
            .await_inclusion(user_op_hash, timeout, poll_interval)
            .await;
        if let InclusionOutcome::Included(receipt) = &outcome {
            if receipt.success {
                self.deployments
                    .mark_deployed(self.account_address().await?)
                    .await;
            }
        }
        Ok(outcome)
    }

    /// Build, optionally sponsor, sign and submit.
    ///
    /// A sponsorship obtained while estimating is attached as-is; the paymaster is
    /// only asked again when estimation did not consult it.
    pub async fn send(&self, calls: &[Call], options: &BuildOptions) -> Result<H256> {
        let (mut req, sponsorship) = self.build_with_sponsorship(calls, options).await?;
        if options.sponsored {
            let service_data = sponsorship.map(|outcome| outcome.paymaster_and_data());
            req = self.attach_paymaster(req, service_data).await?;
        }
        let op = self.sign(req).await?;
        self.submit(&op).await
    }
}
