//! Canonical UserOperation encodings and the EntryPoint v0.6 `getUserOpHash`.
//!
//! The hash must match the on-chain verifier bit for bit, so field order and widths
//! here follow the Solidity struct exactly.

use crate::error::{AccountError, Result};
use crate::types::UserOperation;
use ethers::abi::{decode, encode, ParamType, Token};
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::keccak256;

/// Computes protocol hashes for one EntryPoint on one chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HashEngine {
    entry_point: Address,
    chain_id: u64,
}

impl HashEngine {
    pub fn new(entry_point: Address, chain_id: u64) -> Self {
        Self {
            entry_point,
            chain_id,
        }
    }

    pub fn entry_point(&self) -> Address {
        self.entry_point
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// `keccak256(abi.encode(keccak256(pack(op)), entryPoint, chainId))`.
    pub fn hash(&self, op: &UserOperation) -> H256 {
        user_op_hash(op, self.entry_point, self.chain_id)
    }
}

/// Encodes `op` either for signing (variable fields hashed, no signature) or in full.
///
/// The full encoding carries the raw variable-length fields and the signature and is only
/// used for calldata cost accounting.
pub fn canonical_encode(op: &UserOperation, for_signature: bool) -> Bytes {
    if for_signature {
        pack_for_signature(op)
    } else {
        encode_full(op)
    }
}

pub fn pack_for_signature(op: &UserOperation) -> Bytes {
    encode(&[
        Token::Address(op.sender),
        Token::Uint(op.nonce),
        Token::FixedBytes(keccak256(&op.init_code).to_vec()),
        Token::FixedBytes(keccak256(&op.call_data).to_vec()),
        Token::Uint(op.call_gas_limit),
        Token::Uint(op.verification_gas_limit),
        Token::Uint(op.pre_verification_gas),
        Token::Uint(op.max_fee_per_gas),
        Token::Uint(op.max_priority_fee_per_gas),
        Token::FixedBytes(keccak256(&op.paymaster_and_data).to_vec()),
    ])
    .into()
}

/// `abi.encode(UserOperation)` as the struct would be passed to `handleOps`.
pub fn encode_full(op: &UserOperation) -> Bytes {
    encode(&[Token::Tuple(vec![
        Token::Address(op.sender),
        Token::Uint(op.nonce),
        Token::Bytes(op.init_code.to_vec()),
        Token::Bytes(op.call_data.to_vec()),
        Token::Uint(op.call_gas_limit),
        Token::Uint(op.verification_gas_limit),
        Token::Uint(op.pre_verification_gas),
        Token::Uint(op.max_fee_per_gas),
        Token::Uint(op.max_priority_fee_per_gas),
        Token::Bytes(op.paymaster_and_data.to_vec()),
        Token::Bytes(op.signature.to_vec()),
    ])])
    .into()
}

fn user_op_param_type() -> ParamType {
    ParamType::Tuple(vec![
        ParamType::Address,
        ParamType::Uint(256),
        ParamType::Bytes,
        ParamType::Bytes,
        ParamType::Uint(256),
        ParamType::Uint(256),
        ParamType::Uint(256),
        ParamType::Uint(256),
        ParamType::Uint(256),
        ParamType::Bytes,
        ParamType::Bytes,
    ])
}

/// Inverse of [`encode_full`].
pub fn decode_full(data: &[u8]) -> Result<UserOperation> {
    let mut tokens = decode(&[user_op_param_type()], data)
        .map_err(|e| AccountError::CallDataDecode(format!("user operation: {e}")))?;
    let fields = match tokens.pop() {
        Some(Token::Tuple(fields)) if fields.len() == 11 => fields,
        _ => {
            return Err(AccountError::CallDataDecode(
                "user operation: expected an 11-field tuple".to_string(),
            ))
        }
    };

    let mut it = fields.into_iter();
    let mut next = || it.next().unwrap_or(Token::Bool(false));
    let op = UserOperation {
        sender: token_address(next())?,
        nonce: token_uint(next())?,
        init_code: token_bytes(next())?,
        call_data: token_bytes(next())?,
        call_gas_limit: token_uint(next())?,
        verification_gas_limit: token_uint(next())?,
        pre_verification_gas: token_uint(next())?,
        max_fee_per_gas: token_uint(next())?,
        max_priority_fee_per_gas: token_uint(next())?,
        paymaster_and_data: token_bytes(next())?,
        signature: token_bytes(next())?,
    };
    Ok(op)
}

fn token_address(t: Token) -> Result<Address> {
    t.into_address()
        .ok_or_else(|| AccountError::CallDataDecode("expected address".to_string()))
}

fn token_uint(t: Token) -> Result<U256> {
    t.into_uint()
        .ok_or_else(|| AccountError::CallDataDecode("expected uint256".to_string()))
}

fn token_bytes(t: Token) -> Result<Bytes> {
    t.into_bytes()
        .map(Bytes::from)
        .ok_or_else(|| AccountError::CallDataDecode("expected bytes".to_string()))
}

pub fn user_op_hash(op: &UserOperation, entry_point: Address, chain_id: u64) -> H256 {
    keccak256(encode(&[
        Token::FixedBytes(keccak256(pack_for_signature(op)).to_vec()),
        Token::Address(entry_point),
        Token::Uint(U256::from(chain_id)),
    ]))
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    const ENTRY_POINT: &str = "0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789";

    fn sample_op() -> UserOperation {
        UserOperation {
            sender: Address::from_str("0x9406Cc6185a346906296840746125a0E44976454").unwrap(),
            nonce: U256::from(3),
            init_code: Bytes::default(),
            call_data: Bytes::from(vec![0xb6, 0x1d, 0x27, 0xf6, 0x00, 0x01]),
            call_gas_limit: U256::from(35_000),
            verification_gas_limit: U256::from(70_000),
            pre_verification_gas: U256::from(21_000),
            max_fee_per_gas: U256::from(1_500_000_000u64),
            max_priority_fee_per_gas: U256::from(1_000_000_000u64),
            paymaster_and_data: Bytes::default(),
            signature: Bytes::from(vec![0x01; 65]),
        }
    }

    fn engine() -> HashEngine {
        HashEngine::new(Address::from_str(ENTRY_POINT).unwrap(), 1)
    }

    #[test]
    fn hash_matches_manual_double_keccak() {
        let op = sample_op();
        let inner = keccak256(pack_for_signature(&op));
        let mut outer = Vec::with_capacity(96);
        outer.extend_from_slice(&inner);
        outer.extend_from_slice(&[0u8; 12]);
        outer.extend_from_slice(Address::from_str(ENTRY_POINT).unwrap().as_bytes());
        let mut chain = [0u8; 32];
        chain[31] = 1;
        outer.extend_from_slice(&chain);
        assert_eq!(engine().hash(&op), H256::from(keccak256(outer)));
    }

    #[test]
    fn signature_encoding_has_ten_words() {
        assert_eq!(canonical_encode(&sample_op(), true).len(), 10 * 32);
    }

    #[test]
    fn signature_does_not_change_hash() {
        let op = sample_op();
        let mut resigned = op.clone();
        resigned.signature = Bytes::from(vec![0x02; 65]);
        assert_eq!(engine().hash(&op), engine().hash(&resigned));
    }

    #[test]
    fn every_hashed_field_changes_hash() {
        let base = sample_op();
        let h = engine().hash(&base);
        let mutations: Vec<Box<dyn Fn(&mut UserOperation)>> = vec![
            Box::new(|o| o.sender = Address::repeat_byte(0x42)),
            Box::new(|o| o.nonce += U256::one()),
            Box::new(|o| o.init_code = Bytes::from(vec![0x01])),
            Box::new(|o| o.call_data = Bytes::from(vec![0x02])),
            Box::new(|o| o.call_gas_limit += U256::one()),
            Box::new(|o| o.verification_gas_limit += U256::one()),
            Box::new(|o| o.pre_verification_gas += U256::one()),
            Box::new(|o| o.max_fee_per_gas += U256::one()),
            Box::new(|o| o.max_priority_fee_per_gas += U256::one()),
            Box::new(|o| o.paymaster_and_data = Bytes::from(vec![0x03])),
        ];
        for mutate in mutations {
            let mut op = base.clone();
            mutate(&mut op);
            assert_ne!(engine().hash(&op), h);
        }
    }

    #[test]
    fn hash_is_bound_to_chain_and_entry_point() {
        let op = sample_op();
        let other_chain = HashEngine::new(Address::from_str(ENTRY_POINT).unwrap(), 137);
        let other_ep = HashEngine::new(Address::repeat_byte(0x01), 1);
        assert_ne!(engine().hash(&op), other_chain.hash(&op));
        assert_ne!(engine().hash(&op), other_ep.hash(&op));
    }

    #[test]
    fn full_encoding_is_stable_under_decode() {
        let op = sample_op();
        let encoded = encode_full(&op);
        let decoded = decode_full(&encoded).unwrap();
        assert_eq!(decoded, op);
        assert_eq!(encode_full(&decoded), encoded);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_full(&[0x01, 0x02]).is_err());
    }
}
