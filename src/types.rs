use crate::error::{AccountError, Result};
use ethers::types::{Address, Bytes, H256, U256};

/// ERC-4337 UserOperation (EntryPoint v0.6 layout).
///
/// This is the complete form: every field is populated and the value can be hashed.
/// Operations under construction are carried as [`UserOperationRequest`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserOperation {
    pub sender: Address,
    pub nonce: U256,
    pub init_code: Bytes,
    pub call_data: Bytes,
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    pub paymaster_and_data: Bytes,
    pub signature: Bytes,
}

impl UserOperation {
    /// Fails fast if the operation cannot be handed to a bundler.
    ///
    /// Every other field is guaranteed by the type; the sender must be set and the
    /// operation must carry a signature.
    pub fn ensure_dispatchable(&self) -> Result<()> {
        if self.sender.is_zero() {
            return Err(AccountError::IncompleteOperation("sender"));
        }
        if self.signature.is_empty() {
            return Err(AccountError::IncompleteOperation("signature"));
        }
        Ok(())
    }

    /// Paymaster address encoded in the first 20 bytes of `paymaster_and_data`, if any.
    pub fn paymaster(&self) -> Option<Address> {
        self.paymaster_and_data
            .get(..20)
            .map(Address::from_slice)
    }
}

/// A UserOperation under construction.
///
/// Fields stay `None` until the builder, gas estimator or paymaster fills them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserOperationRequest {
    pub sender: Option<Address>,
    pub nonce: Option<U256>,
    pub init_code: Option<Bytes>,
    pub call_data: Option<Bytes>,
    pub call_gas_limit: Option<U256>,
    pub verification_gas_limit: Option<U256>,
    pub pre_verification_gas: Option<U256>,
    pub max_fee_per_gas: Option<U256>,
    pub max_priority_fee_per_gas: Option<U256>,
    pub paymaster_and_data: Option<Bytes>,
    pub signature: Option<Bytes>,
}

impl UserOperationRequest {
    /// Converts into a complete [`UserOperation`], failing with the first missing field.
    ///
    /// When `require_signature` is false a missing signature becomes an empty payload.
    pub fn into_user_operation(self, require_signature: bool) -> Result<UserOperation> {
        let signature = match self.signature {
            Some(sig) => sig,
            None if require_signature => {
                return Err(AccountError::IncompleteOperation("signature"))
            }
            None => Bytes::default(),
        };

        Ok(UserOperation {
            sender: required(self.sender, "sender")?,
            nonce: required(self.nonce, "nonce")?,
            init_code: required(self.init_code, "initCode")?,
            call_data: required(self.call_data, "callData")?,
            call_gas_limit: required(self.call_gas_limit, "callGasLimit")?,
            verification_gas_limit: required(
                self.verification_gas_limit,
                "verificationGasLimit",
            )?,
            pre_verification_gas: required(self.pre_verification_gas, "preVerificationGas")?,
            max_fee_per_gas: required(self.max_fee_per_gas, "maxFeePerGas")?,
            max_priority_fee_per_gas: required(
                self.max_priority_fee_per_gas,
                "maxPriorityFeePerGas",
            )?,
            paymaster_and_data: required(self.paymaster_and_data, "paymasterAndData")?,
            signature,
        })
    }

    /// Fills every unset field with its zero value, as bundlers and paymasters expect
    /// for estimation requests.
    pub fn to_zero_filled(&self) -> UserOperation {
        UserOperation {
            sender: self.sender.unwrap_or_default(),
            nonce: self.nonce.unwrap_or_default(),
            init_code: self.init_code.clone().unwrap_or_default(),
            call_data: self.call_data.clone().unwrap_or_default(),
            call_gas_limit: self.call_gas_limit.unwrap_or_default(),
            verification_gas_limit: self.verification_gas_limit.unwrap_or_default(),
            pre_verification_gas: self.pre_verification_gas.unwrap_or_default(),
            max_fee_per_gas: self.max_fee_per_gas.unwrap_or_default(),
            max_priority_fee_per_gas: self.max_priority_fee_per_gas.unwrap_or_default(),
            paymaster_and_data: self.paymaster_and_data.clone().unwrap_or_default(),
            signature: self.signature.clone().unwrap_or_default(),
        }
    }

    /// Clears everything gas-related so a fresh estimate can run (used after call data changes).
    pub fn clear_gas(&mut self) {
        self.call_gas_limit = None;
        self.verification_gas_limit = None;
        self.pre_verification_gas = None;
    }
}

fn required<T>(value: Option<T>, field: &'static str) -> Result<T> {
    value.ok_or(AccountError::IncompleteOperation(field))
}

impl From<UserOperation> for UserOperationRequest {
    fn from(op: UserOperation) -> Self {
        Self {
            sender: Some(op.sender),
            nonce: Some(op.nonce),
            init_code: Some(op.init_code),
            call_data: Some(op.call_data),
            call_gas_limit: Some(op.call_gas_limit),
            verification_gas_limit: Some(op.verification_gas_limit),
            pre_verification_gas: Some(op.pre_verification_gas),
            max_fee_per_gas: Some(op.max_fee_per_gas),
            max_priority_fee_per_gas: Some(op.max_priority_fee_per_gas),
            paymaster_and_data: Some(op.paymaster_and_data),
            signature: Some(op.signature),
        }
    }
}

/// One call the smart account should perform.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Call {
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
}

impl Call {
    pub fn new(to: Address, value: U256, data: Bytes) -> Self {
        Self { to, value, data }
    }

    /// The 4-byte function selector of `data`, if it has one.
    pub fn selector(&self) -> Option<[u8; 4]> {
        if self.data.len() < 4 {
            return None;
        }
        let mut sel = [0u8; 4];
        sel.copy_from_slice(&self.data[..4]);
        Some(sel)
    }
}

/// Bundler receipt for an included UserOperation.
#[derive(Clone, Debug, PartialEq)]
pub struct UserOperationReceipt {
    pub user_op_hash: H256,
    pub success: bool,
    pub transaction_hash: Option<H256>,
    pub raw: serde_json::Value,
}

/// Result of polling for inclusion. Not being found before the timeout is a normal outcome.
#[derive(Clone, Debug, PartialEq)]
pub enum InclusionOutcome {
    Included(UserOperationReceipt),
    NotFound,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete_request() -> UserOperationRequest {
        UserOperationRequest {
            sender: Some(Address::repeat_byte(0x11)),
            nonce: Some(U256::from(1)),
            init_code: Some(Bytes::default()),
            call_data: Some(Bytes::from(vec![0xab])),
            call_gas_limit: Some(U256::from(50_000)),
            verification_gas_limit: Some(U256::from(100_000)),
            pre_verification_gas: Some(U256::from(45_000)),
            max_fee_per_gas: Some(U256::from(10)),
            max_priority_fee_per_gas: Some(U256::from(1)),
            paymaster_and_data: Some(Bytes::default()),
            signature: None,
        }
    }

    #[test]
    fn request_without_signature_completes_when_not_required() {
        let op = complete_request().into_user_operation(false).unwrap();
        assert!(op.signature.is_empty());
        assert_eq!(op.nonce, U256::from(1));
    }

    #[test]
    fn request_reports_missing_signature_for_dispatch() {
        let err = complete_request().into_user_operation(true).unwrap_err();
        assert!(matches!(err, AccountError::IncompleteOperation("signature")));
    }

    #[test]
    fn request_reports_first_missing_gas_field() {
        let mut req = complete_request();
        req.max_priority_fee_per_gas = None;
        let err = req.into_user_operation(false).unwrap_err();
        assert!(matches!(
            err,
            AccountError::IncompleteOperation("maxPriorityFeePerGas")
        ));
    }

    #[test]
    fn unsigned_operation_is_not_dispatchable() {
        let op = complete_request().into_user_operation(false).unwrap();
        assert!(matches!(
            op.ensure_dispatchable(),
            Err(AccountError::IncompleteOperation("signature"))
        ));
    }

    #[test]
    fn paymaster_is_read_from_prefix() {
        let mut op = complete_request().into_user_operation(false).unwrap();
        assert_eq!(op.paymaster(), None);
        let pm = Address::repeat_byte(0x22);
        let mut data = pm.as_bytes().to_vec();
        data.extend_from_slice(&[1, 2, 3]);
        op.paymaster_and_data = Bytes::from(data);
        assert_eq!(op.paymaster(), Some(pm));
    }

    #[test]
    fn call_selector_requires_four_bytes() {
        let call = Call::new(Address::zero(), U256::zero(), Bytes::from(vec![1, 2, 3]));
        assert_eq!(call.selector(), None);
        let call = Call::new(Address::zero(), U256::zero(), Bytes::from(vec![1, 2, 3, 4, 5]));
        assert_eq!(call.selector(), Some([1, 2, 3, 4]));
    }
}
