//! Gas field estimation for UserOperations.
//!
//! Each of the five gas fields is resolved independently. A caller override wins,
//! then a sponsoring paymaster (limits only), then the bundler estimator, then
//! direct chain queries. Pre-verification gas is only ever computed locally.

use crate::bundler::Bundler;
use crate::chain::ChainClient;
use crate::encoding::user_op_to_json;
use crate::error::{AccountError, Result};
use crate::hash::encode_full;
use crate::paymaster::{PaymasterIntegrator, SponsorOutcome};
use crate::types::{UserOperation, UserOperationRequest};
use ethers::types::{Address, Bytes, U256};
use serde::Deserialize;
use std::sync::Arc;

/// Calldata overheads charged by the bundler for posting an operation on chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GasOverheads {
    pub fixed: u64,
    pub per_user_op: u64,
    pub per_user_op_word: u64,
    pub zero_byte: u64,
    pub non_zero_byte: u64,
    pub bundle_size: u64,
    /// Minimum signature length assumed when pricing an unsigned operation.
    pub sig_size: u64,
}

impl Default for GasOverheads {
    fn default() -> Self {
        Self {
            fixed: 21_000,
            per_user_op: 18_300,
            per_user_op_word: 4,
            zero_byte: 4,
            non_zero_byte: 16,
            bundle_size: 1,
            sig_size: 65,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GasConfig {
    pub overheads: GasOverheads,
    /// Flat verification allowance before signature and deployment costs.
    pub base_verification_gas: u64,
    pub verification_gas_per_signature_byte: u64,
    /// Headroom on locally simulated call gas while the account has no code.
    pub undeployed_call_gas_multiplier_bps: u64,
    /// Multiplier on chain fee data (10000 = 1x).
    pub gas_multiplier_bps: u64,
}

impl Default for GasConfig {
    fn default() -> Self {
        Self {
            overheads: GasOverheads::default(),
            base_verification_gas: 100_000,
            verification_gas_per_signature_byte: 16,
            undeployed_call_gas_multiplier_bps: 10_000,
            gas_multiplier_bps: 10_000,
        }
    }
}

/// Caller-supplied gas values, used verbatim.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GasOverrides {
    pub call_gas_limit: Option<U256>,
    pub verification_gas_limit: Option<U256>,
    pub pre_verification_gas: Option<U256>,
    pub max_fee_per_gas: Option<U256>,
    pub max_priority_fee_per_gas: Option<U256>,
}

impl GasOverrides {
    fn apply(&self, req: &mut UserOperationRequest) {
        req.call_gas_limit = self.call_gas_limit.or(req.call_gas_limit);
        req.verification_gas_limit = self.verification_gas_limit.or(req.verification_gas_limit);
        req.pre_verification_gas = self.pre_verification_gas.or(req.pre_verification_gas);
        req.max_fee_per_gas = self.max_fee_per_gas.or(req.max_fee_per_gas);
        req.max_priority_fee_per_gas = self
            .max_priority_fee_per_gas
            .or(req.max_priority_fee_per_gas);
    }
}

/// Per-estimate inputs.
#[derive(Clone, Copy, Default)]
pub struct EstimateOptions<'a> {
    pub overrides: GasOverrides,
    pub skip_bundler: bool,
    /// Whether the sender already has code; undeployed accounts get call-gas headroom.
    pub is_deployed: bool,
    /// Sponsoring paymaster consulted for call and verification limits.
    pub sponsor: Option<&'a PaymasterIntegrator>,
}

/// Static pre-verification gas: calldata cost of the fully encoded operation plus
/// the per-bundle and per-operation overheads.
///
/// The operation is priced with `pre_verification_gas = fixed` and a signature of
/// `0x01` bytes at least `sig_size` long, so an unsigned operation is not underpriced.
pub fn calc_pre_verification_gas(op: &UserOperation, ov: &GasOverheads) -> U256 {
    let sig_len = op.signature.len().max(ov.sig_size as usize);
    let mut priced = op.clone();
    priced.pre_verification_gas = U256::from(ov.fixed);
    priced.signature = Bytes::from(vec![1u8; sig_len]);

    let packed = encode_full(&priced);
    let length_in_words = (packed.len() as u64 + 31) / 32;
    let call_data_cost: u64 = packed
        .iter()
        .map(|&b| if b == 0 { ov.zero_byte } else { ov.non_zero_byte })
        .sum();

    U256::from(ov.fixed / ov.bundle_size.max(1))
        + U256::from(call_data_cost)
        + U256::from(ov.per_user_op)
        + U256::from(ov.per_user_op_word) * U256::from(length_in_words)
}

fn apply_bps(value: U256, bps: u64) -> U256 {
    value * U256::from(bps) / U256::from(10_000u64)
}

pub struct GasEstimationOrchestrator {
    chain: Arc<dyn ChainClient>,
    bundler: Option<Arc<dyn Bundler>>,
    entry_point: Address,
    config: GasConfig,
}

impl GasEstimationOrchestrator {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        bundler: Option<Arc<dyn Bundler>>,
        entry_point: Address,
        config: GasConfig,
    ) -> Self {
        Self {
            chain,
            bundler,
            entry_point,
            config,
        }
    }

    /// Fills every unset gas field of `req`. Fields already set are kept.
    ///
    /// Fails with [`AccountError::GasEstimation`] naming the first field that no
    /// source could provide.
    pub async fn estimate(
        &self,
        req: UserOperationRequest,
        options: &EstimateOptions<'_>,
    ) -> Result<UserOperationRequest> {
        self.estimate_with_sponsorship(req, options)
            .await
            .map(|(req, _)| req)
    }

    /// Like [`estimate`](Self::estimate), also returning the sponsor's answer when
    /// one was consulted, so its paymaster data can be attached without asking again.
    pub async fn estimate_with_sponsorship(
        &self,
        mut req: UserOperationRequest,
        options: &EstimateOptions<'_>,
    ) -> Result<(UserOperationRequest, Option<SponsorOutcome>)> {
        options.overrides.apply(&mut req);

        let mut sponsorship = None;
        if let Some(sponsor) = options.sponsor {
            if req.call_gas_limit.is_none() || req.verification_gas_limit.is_none() {
                let probe = self.probe(&req, options);
                let outcome = sponsor.sponsor_gas_estimate(&probe).await?;
                if let SponsorOutcome::Granted(data) = &outcome {
                    req.call_gas_limit = req.call_gas_limit.or(data.call_gas_limit);
                    req.verification_gas_limit =
                        req.verification_gas_limit.or(data.verification_gas_limit);
                }
                sponsorship = Some(outcome);
            }
        }

        if !options.skip_bundler && needs_remote(&req) {
            if let Some(bundler) = self.bundler.as_ref() {
                let probe = self.probe(&req, options);
                match bundler
                    .estimate_user_operation_gas(user_op_to_json(&probe), self.entry_point)
                    .await
                {
                    Ok(est) => {
                        tracing::debug!(?est, "bundler gas estimate");
                        req.call_gas_limit = req.call_gas_limit.or(est.call_gas_limit);
                        req.verification_gas_limit =
                            req.verification_gas_limit.or(est.verification_gas_limit);
                        req.max_fee_per_gas = req.max_fee_per_gas.or(est.max_fee_per_gas);
                        req.max_priority_fee_per_gas =
                            req.max_priority_fee_per_gas.or(est.max_priority_fee_per_gas);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "bundler gas estimate failed, falling back to chain");
                    }
                }
            }
        }

        self.fill_fees_locally(&mut req).await?;
        self.fill_limits_locally(&mut req, options.is_deployed).await?;

        if req.pre_verification_gas.is_none() {
            let op = self.probe(&req, options);
            req.pre_verification_gas = Some(calc_pre_verification_gas(&op, &self.config.overheads));
        }

        tracing::debug!(
            call_gas_limit = ?req.call_gas_limit,
            verification_gas_limit = ?req.verification_gas_limit,
            pre_verification_gas = ?req.pre_verification_gas,
            max_fee_per_gas = ?req.max_fee_per_gas,
            max_priority_fee_per_gas = ?req.max_priority_fee_per_gas,
            "gas fields resolved"
        );
        Ok((req, sponsorship))
    }

    /// Zero-filled copy of `req` used for estimation requests. A sponsored
    /// operation carries the paymaster's stub so its calldata is not underpriced.
    fn probe(&self, req: &UserOperationRequest, options: &EstimateOptions<'_>) -> UserOperation {
        let mut op = req.to_zero_filled();
        if let Some(sponsor) = options.sponsor {
            if op.paymaster_and_data.is_empty() {
                op.paymaster_and_data = sponsor.dummy_paymaster_and_data().clone();
            }
        }
        op
    }

    async fn fill_fees_locally(&self, req: &mut UserOperationRequest) -> Result<()> {
        if req.max_fee_per_gas.is_some() && req.max_priority_fee_per_gas.is_some() {
            return Ok(());
        }
        let field = if req.max_fee_per_gas.is_none() {
            "maxFeePerGas"
        } else {
            "maxPriorityFeePerGas"
        };
        let fees = self
            .chain
            .fee_data()
            .await
            .map_err(|e| AccountError::gas(field, e))?;

        let bps = self.config.gas_multiplier_bps.max(1);
        if bps != 10_000 {
            tracing::info!(bps, "gas multiplier applied to chain fee data");
        }
        req.max_fee_per_gas = req
            .max_fee_per_gas
            .or(Some(apply_bps(fees.max_fee_per_gas, bps)));
        req.max_priority_fee_per_gas = req
            .max_priority_fee_per_gas
            .or(Some(apply_bps(fees.max_priority_fee_per_gas, bps)));
        Ok(())
    }

    async fn fill_limits_locally(
        &self,
        req: &mut UserOperationRequest,
        is_deployed: bool,
    ) -> Result<()> {
        if req.call_gas_limit.is_none() {
            let sender = req.sender.ok_or(AccountError::IncompleteOperation("sender"))?;
            let call_data = req
                .call_data
                .clone()
                .ok_or(AccountError::IncompleteOperation("callData"))?;
            let gas = self
                .chain
                .estimate_gas(self.entry_point, sender, call_data)
                .await
                .map_err(|e| AccountError::gas("callGasLimit", e))?;
            let gas = if is_deployed {
                gas
            } else {
                apply_bps(gas, self.config.undeployed_call_gas_multiplier_bps.max(1))
            };
            req.call_gas_limit = Some(gas);
        }

        if req.verification_gas_limit.is_none() {
            let sig_len = req.signature.as_ref().map_or(0, |s| s.len()) as u64;
            let mut gas = U256::from(self.config.base_verification_gas)
                + U256::from(self.config.verification_gas_per_signature_byte) * U256::from(sig_len);

            let init_code = req.init_code.clone().unwrap_or_default();
            if !init_code.is_empty() {
                if init_code.len() < 20 {
                    return Err(AccountError::gas(
                        "verificationGasLimit",
                        "initCode is shorter than a factory address",
                    ));
                }
                let factory = Address::from_slice(&init_code[..20]);
                let deploy_data = Bytes::from(init_code[20..].to_vec());
                let deploy_gas = self
                    .chain
                    .estimate_gas(self.entry_point, factory, deploy_data)
                    .await
                    .map_err(|e| AccountError::gas("verificationGasLimit", e))?;
                gas += deploy_gas;
            }
            req.verification_gas_limit = Some(gas);
        }
        Ok(())
    }
}

fn needs_remote(req: &UserOperationRequest) -> bool {
    req.call_gas_limit.is_none()
        || req.verification_gas_limit.is_none()
        || req.max_fee_per_gas.is_none()
        || req.max_priority_fee_per_gas.is_none()
}
