use crate::calldata::{decode_calls, encode_approve, encode_execute_batch};
use crate::encoding::{fmt_address, parse_hex_bytes, parse_optional_u256_field, user_op_to_json};
use crate::error::{AccountError, Result};
use crate::gas::{EstimateOptions, GasEstimationOrchestrator};
use crate::rpc::JsonRpcTransport;
use crate::types::{Call, UserOperation, UserOperationRequest};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use ethers::types::{Address, Bytes, U256};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

const SPONSOR_METHOD: &str = "pm_sponsorUserOperation";
const FEE_QUOTE_METHOD: &str = "pm_getFeeQuoteOrData";

/// Stub length used while pricing a sponsored operation: paymaster address,
/// two packed validity timestamps and a 65-byte signature.
const DUMMY_PAYMASTER_AND_DATA_LEN: usize = 20 + 64 + 65;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SponsorshipMode {
    /// The paymaster pays gas outright.
    Sponsored,
    /// Gas is paid in `fee_token` through the token paymaster.
    Erc20 { fee_token: Address },
}

/// Token preferences sent with a fee quote request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TokenInfo {
    pub preferred_token: Option<Address>,
    pub token_list: Vec<Address>,
}

/// Sponsorship response. Gas fields are only present in sponsored mode and only
/// when the service calculated limits.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SponsorData {
    pub paymaster_and_data: Bytes,
    pub call_gas_limit: Option<U256>,
    pub verification_gas_limit: Option<U256>,
    pub pre_verification_gas: Option<U256>,
}

/// What the service answered when asked to sponsor during estimation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SponsorOutcome {
    Granted(SponsorData),
    /// A lenient integrator swallowed the failure; the account pays for itself.
    Declined,
}

impl SponsorOutcome {
    /// Paymaster data to attach: the granted payload, or empty when declined.
    pub fn paymaster_and_data(&self) -> Bytes {
        match self {
            Self::Granted(data) => data.paymaster_and_data.clone(),
            Self::Declined => Bytes::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeQuote {
    pub symbol: String,
    pub decimal: u8,
    pub token_address: Address,
    /// Maximum fee in whole token units.
    pub max_gas_fee: f64,
    #[serde(default, rename = "maxGasFeeUSD")]
    pub max_gas_fee_usd: Option<f64>,
    #[serde(default)]
    pub exchange_rate: Option<f64>,
    #[serde(default)]
    pub premium_percentage: Option<f64>,
    #[serde(default)]
    pub valid_until: Option<u64>,
    #[serde(default)]
    pub logo_url: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeQuotesResponse {
    #[serde(default)]
    pub fee_quotes: Vec<FeeQuote>,
    pub token_paymaster_address: Address,
}

/// What to pay with when building a pay-in-token operation.
#[derive(Clone, Debug, PartialEq)]
pub struct TokenPaymasterRequest {
    pub fee_quote: FeeQuote,
    /// The token paymaster, which must be approved to pull the fee.
    pub spender: Address,
    /// Approve `U256::MAX` instead of the quoted fee.
    pub max_approval: bool,
}

/// Outcome of [`PaymasterIntegrator::build_token_user_op`].
#[derive(Debug)]
pub enum TokenUserOp {
    Patched(UserOperationRequest),
    /// The call data could not be decoded; the operation is returned untouched.
    Unchanged {
        user_op: UserOperationRequest,
        reason: AccountError,
    },
}

/// Paymaster web service (Biconomy-style `pm_*` JSON-RPC).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PaymasterService: Send + Sync {
    async fn sponsor_user_operation(
        &self,
        user_op: Value,
        mode: SponsorshipMode,
    ) -> anyhow::Result<SponsorData>;

    async fn get_fee_quotes(
        &self,
        user_op: Value,
        token_info: TokenInfo,
    ) -> anyhow::Result<FeeQuotesResponse>;
}

#[derive(Debug, Clone)]
pub struct PaymasterClient {
    rpc: JsonRpcTransport,
    sponsorship_info: Value,
    calculate_gas_limits: bool,
}

impl PaymasterClient {
    pub fn new(url: String) -> Self {
        Self {
            rpc: JsonRpcTransport::new(url),
            sponsorship_info: serde_json::json!({
                "webhookData": {},
                "smartAccountInfo": { "name": "BICONOMY", "version": "2.0.0" },
            }),
            calculate_gas_limits: true,
        }
    }

    /// Free-form context forwarded as `sponsorshipInfo` (policy ids, webhook data).
    pub fn with_sponsorship_info(mut self, info: Value) -> Self {
        self.sponsorship_info = info;
        self
    }

    pub fn with_calculate_gas_limits(mut self, calculate: bool) -> Self {
        self.calculate_gas_limits = calculate;
        self
    }

    fn sponsor_context(&self, mode: &SponsorshipMode) -> Value {
        match mode {
            SponsorshipMode::Sponsored => serde_json::json!({
                "mode": "SPONSORED",
                "calculateGasLimits": self.calculate_gas_limits,
                "sponsorshipInfo": self.sponsorship_info,
            }),
            SponsorshipMode::Erc20 { fee_token } => serde_json::json!({
                "mode": "ERC20",
                "calculateGasLimits": self.calculate_gas_limits,
                "tokenInfo": { "feeTokenAddress": fmt_address(*fee_token) },
            }),
        }
    }
}

#[async_trait]
impl PaymasterService for PaymasterClient {
    async fn sponsor_user_operation(
        &self,
        user_op: Value,
        mode: SponsorshipMode,
    ) -> anyhow::Result<SponsorData> {
        let params = serde_json::json!([user_op, self.sponsor_context(&mode)]);
        let res = self
            .rpc
            .request(SPONSOR_METHOD, params)
            .await
            .with_context(|| format!("{SPONSOR_METHOD} RPC failed"))?;
        parse_sponsor_data(&res)
    }

    async fn get_fee_quotes(
        &self,
        user_op: Value,
        token_info: TokenInfo,
    ) -> anyhow::Result<FeeQuotesResponse> {
        let mut info = serde_json::json!({
            "tokenList": token_info.token_list.iter().map(|t| fmt_address(*t)).collect::<Vec<_>>(),
        });
        if let (Some(obj), Some(preferred)) = (info.as_object_mut(), token_info.preferred_token) {
            obj.insert(
                "preferredToken".to_string(),
                Value::String(fmt_address(preferred)),
            );
        }
        let params = serde_json::json!([user_op, { "mode": "ERC20", "tokenInfo": info }]);
        let res = self
            .rpc
            .request(FEE_QUOTE_METHOD, params)
            .await
            .with_context(|| format!("{FEE_QUOTE_METHOD} RPC failed"))?;
        serde_json::from_value(res).context("invalid fee quote response")
    }
}

fn parse_sponsor_data(result: &Value) -> anyhow::Result<SponsorData> {
    // Some services nest v0.6 data under `entrypointV06Response`; accept both shapes.
    let v06 = result
        .get("entrypointV06Response")
        .or_else(|| result.get("entryPointV06Response"))
        .unwrap_or(result);

    let paymaster_and_data = v06
        .get("paymasterAndData")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("missing paymasterAndData in sponsorship response"))?;

    Ok(SponsorData {
        paymaster_and_data: parse_hex_bytes(paymaster_and_data)
            .context("invalid hex in paymasterAndData")?,
        call_gas_limit: parse_optional_u256_field(v06, "callGasLimit")?,
        verification_gas_limit: parse_optional_u256_field(v06, "verificationGasLimit")?,
        pre_verification_gas: parse_optional_u256_field(v06, "preVerificationGas")?,
    })
}

/// `ceil(max_gas_fee * 10^decimal)` in token base units, or `U256::MAX` on request.
pub fn approval_amount(quote: &FeeQuote, max_approval: bool) -> Result<U256> {
    if max_approval {
        return Ok(U256::MAX);
    }
    if !quote.max_gas_fee.is_finite() || quote.max_gas_fee < 0.0 {
        return Err(AccountError::sponsorship(
            FEE_QUOTE_METHOD,
            format!("invalid maxGasFee {} for {}", quote.max_gas_fee, quote.symbol),
        ));
    }

    // f64 Display never uses exponent notation, so the decimal string is exact
    // for the value the quote carried.
    let repr = quote.max_gas_fee.to_string();
    let (int_part, frac_part) = repr.split_once('.').unwrap_or((repr.as_str(), ""));
    let decimals = quote.decimal as usize;

    let (kept, dropped) = if frac_part.len() > decimals {
        frac_part.split_at(decimals)
    } else {
        (frac_part, "")
    };
    let digits = format!("{int_part}{kept:0<decimals$}");
    let mut amount = U256::from_dec_str(&digits).map_err(|e| {
        AccountError::sponsorship(FEE_QUOTE_METHOD, format!("cannot scale maxGasFee: {e}"))
    })?;
    if dropped.bytes().any(|b| b != b'0') {
        amount += U256::one();
    }
    Ok(amount)
}

/// Attaches paymaster data to operations and builds pay-in-token operations.
///
/// In lenient mode a failed sponsorship leaves `paymasterAndData` empty so the
/// account pays for itself; in strict mode it is an error.
pub struct PaymasterIntegrator {
    service: Arc<dyn PaymasterService>,
    strict: bool,
    dummy_paymaster_and_data: Bytes,
}

impl PaymasterIntegrator {
    pub fn new(service: Arc<dyn PaymasterService>, strict: bool) -> Self {
        Self {
            service,
            strict,
            dummy_paymaster_and_data: Bytes::from(vec![0x01; DUMMY_PAYMASTER_AND_DATA_LEN]),
        }
    }

    pub fn with_dummy_paymaster_and_data(mut self, stub: Bytes) -> Self {
        self.dummy_paymaster_and_data = stub;
        self
    }

    pub fn dummy_paymaster_and_data(&self) -> &Bytes {
        &self.dummy_paymaster_and_data
    }

    async fn sponsor(&self, op: &UserOperation, mode: SponsorshipMode) -> Result<Option<SponsorData>> {
        match self
            .service
            .sponsor_user_operation(user_op_to_json(op), mode)
            .await
        {
            Ok(data) => Ok(Some(data)),
            Err(e) if self.strict => Err(AccountError::sponsorship(SPONSOR_METHOD, e)),
            Err(e) => {
                tracing::warn!(
                    error = %format!("{e:#}"),
                    "paymaster sponsorship failed, continuing without paymaster"
                );
                Ok(None)
            }
        }
    }

    /// Asks for sponsor-mode data and gas limits while estimating.
    pub async fn sponsor_gas_estimate(&self, op: &UserOperation) -> Result<SponsorOutcome> {
        Ok(self
            .sponsor(op, SponsorshipMode::Sponsored)
            .await?
            .map_or(SponsorOutcome::Declined, SponsorOutcome::Granted))
    }

    /// Sets `paymasterAndData` and nothing else.
    ///
    /// `service_data` is used as-is when the caller already holds sponsorship data;
    /// otherwise the service is asked to sponsor the operation.
    pub async fn attach(
        &self,
        mut req: UserOperationRequest,
        service_data: Option<Bytes>,
    ) -> Result<UserOperationRequest> {
        let paymaster_and_data = match service_data {
            Some(data) => data,
            None => self
                .sponsor(&req.to_zero_filled(), SponsorshipMode::Sponsored)
                .await?
                .map(|d| d.paymaster_and_data)
                .unwrap_or_default(),
        };
        tracing::info!(
            sponsored = !paymaster_and_data.is_empty(),
            "paymaster data attached"
        );
        req.paymaster_and_data = Some(paymaster_and_data);
        Ok(req)
    }

    pub async fn fee_quotes(
        &self,
        req: &UserOperationRequest,
        token_info: TokenInfo,
    ) -> Result<FeeQuotesResponse> {
        self.service
            .get_fee_quotes(user_op_to_json(&req.to_zero_filled()), token_info)
            .await
            .map_err(|e| AccountError::sponsorship(FEE_QUOTE_METHOD, e))
    }

    /// Rewrites the operation to pay gas in the quoted token.
    ///
    /// Prepends an `approve(spender, amount)` call unless one is already present,
    /// re-encodes the batch, re-estimates gas (the call data changed) and asks the
    /// service for ERC20 paymaster data. Pre-verification gas is priced with the
    /// dummy paymaster stub in place of the payload that is attached afterwards.
    pub async fn build_token_user_op(
        &self,
        mut req: UserOperationRequest,
        token: &TokenPaymasterRequest,
        estimator: &GasEstimationOrchestrator,
        options: &EstimateOptions<'_>,
    ) -> Result<TokenUserOp> {
        let call_data = req
            .call_data
            .clone()
            .ok_or(AccountError::IncompleteOperation("callData"))?;
        let mut calls = match decode_calls(&call_data) {
            Ok(decoded) => decoded.into_calls(),
            Err(reason) => {
                tracing::warn!(error = %reason, "cannot splice token approval, operation left unchanged");
                return Ok(TokenUserOp::Unchanged {
                    user_op: req,
                    reason,
                });
            }
        };

        let fee_token = token.fee_quote.token_address;
        if !has_approval(&calls, fee_token, token.spender) {
            let amount = approval_amount(&token.fee_quote, token.max_approval)?;
            tracing::info!(
                token = %token.fee_quote.symbol,
                %amount,
                spender = ?token.spender,
                "prepending fee token approval"
            );
            let approve = Call::new(fee_token, U256::zero(), encode_approve(token.spender, amount)?);
            calls.insert(0, approve);
        }

        req.call_data = Some(encode_execute_batch(&calls)?);
        req.clear_gas();
        req.paymaster_and_data = Some(self.dummy_paymaster_and_data.clone());

        let mut req = estimator.estimate(req, options).await?;
        let mut sponsor_op = req.to_zero_filled();
        sponsor_op.paymaster_and_data = Bytes::default();
        let paymaster_and_data = self
            .sponsor(&sponsor_op, SponsorshipMode::Erc20 { fee_token })
            .await?
            .map(|d| d.paymaster_and_data)
            .unwrap_or_default();
        req.paymaster_and_data = Some(paymaster_and_data);
        Ok(TokenUserOp::Patched(req))
    }
}

fn has_approval(calls: &[Call], token: Address, spender: Address) -> bool {
    let Ok(approve) = encode_approve(spender, U256::zero()) else {
        return false;
    };
    // selector + spender word
    let prefix = &approve[..36];
    calls
        .iter()
        .any(|c| c.to == token && c.data.len() >= 36 && &c.data[..36] == prefix)
}
