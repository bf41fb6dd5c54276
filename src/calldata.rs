//! Smart account call-data: `execute` / `executeBatch` encoding and decoding, plus the
//! ERC-20 `approve` call used by the token paymaster flow.

use crate::error::{AccountError, Result};
use crate::types::Call;
use ethers::abi::{AbiParser, Function, Token};
use ethers::types::{Address, Bytes, U256};

const EXECUTE: &str = "function execute(address dest, uint256 value, bytes func)";
const EXECUTE_BATCH: &str =
    "function executeBatch(address[] dest, uint256[] value, bytes[] func)";
const APPROVE: &str = "function approve(address spender, uint256 amount) returns (bool)";

/// Decoded shape of an account's call data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AccountCallData {
    Single(Call),
    Batch(Vec<Call>),
}

impl AccountCallData {
    pub fn into_calls(self) -> Vec<Call> {
        match self {
            AccountCallData::Single(call) => vec![call],
            AccountCallData::Batch(calls) => calls,
        }
    }

    pub fn is_batch(&self) -> bool {
        matches!(self, AccountCallData::Batch(_))
    }
}

fn parse_function(signature: &str) -> Result<Function> {
    AbiParser::default()
        .parse_function(signature)
        .map_err(|e| AccountError::Config(format!("invalid ABI signature `{signature}`: {e}")))
}

/// One call encodes as `execute`, two or more (or `force_batch`) as `executeBatch`.
pub fn encode_calls(calls: &[Call], force_batch: bool) -> Result<Bytes> {
    match calls {
        [] => Err(AccountError::EmptyBatch),
        [call] if !force_batch => encode_execute(call),
        _ => encode_execute_batch(calls),
    }
}

pub fn encode_execute(call: &Call) -> Result<Bytes> {
    let f = parse_function(EXECUTE)?;
    let data = f
        .encode_input(&[
            Token::Address(call.to),
            Token::Uint(call.value),
            Token::Bytes(call.data.to_vec()),
        ])
        .map_err(|e| AccountError::Config(format!("failed to build execute calldata: {e}")))?;
    Ok(Bytes::from(data))
}

pub fn encode_execute_batch(calls: &[Call]) -> Result<Bytes> {
    let f = parse_function(EXECUTE_BATCH)?;
    let dests = calls.iter().map(|c| Token::Address(c.to)).collect();
    let values = calls.iter().map(|c| Token::Uint(c.value)).collect();
    let funcs = calls.iter().map(|c| Token::Bytes(c.data.to_vec())).collect();
    let data = f
        .encode_input(&[
            Token::Array(dests),
            Token::Array(values),
            Token::Array(funcs),
        ])
        .map_err(|e| {
            AccountError::Config(format!("failed to build executeBatch calldata: {e}"))
        })?;
    Ok(Bytes::from(data))
}

/// Parses account call data back into its calls.
pub fn decode_calls(call_data: &[u8]) -> Result<AccountCallData> {
    if call_data.len() < 4 {
        return Err(AccountError::CallDataDecode(format!(
            "call data is {} bytes, expected a 4-byte selector",
            call_data.len()
        )));
    }
    let (selector, args) = call_data.split_at(4);

    let execute = parse_function(EXECUTE)?;
    if selector == execute.short_signature() {
        let tokens = execute
            .decode_input(args)
            .map_err(|e| AccountError::CallDataDecode(format!("execute: {e}")))?;
        let mut it = tokens.into_iter();
        let to = next_address(&mut it)?;
        let value = next_uint(&mut it)?;
        let data = next_bytes(&mut it)?;
        return Ok(AccountCallData::Single(Call { to, value, data }));
    }

    let batch = parse_function(EXECUTE_BATCH)?;
    if selector == batch.short_signature() {
        let tokens = batch
            .decode_input(args)
            .map_err(|e| AccountError::CallDataDecode(format!("executeBatch: {e}")))?;
        let mut it = tokens.into_iter();
        let dests = next_array(&mut it)?;
        let values = next_array(&mut it)?;
        let funcs = next_array(&mut it)?;

        // The account contract accepts an empty value array as "all zero".
        if dests.len() != funcs.len() || (!values.is_empty() && values.len() != dests.len()) {
            return Err(AccountError::CallDataDecode(format!(
                "executeBatch arrays differ in length ({} dest, {} value, {} func)",
                dests.len(),
                values.len(),
                funcs.len()
            )));
        }

        let mut values = values.into_iter();
        let mut calls = Vec::with_capacity(dests.len());
        for (dest, func) in dests.into_iter().zip(funcs) {
            let value = match values.next() {
                Some(v) => token_uint(v)?,
                None => U256::zero(),
            };
            calls.push(Call {
                to: token_address(dest)?,
                value,
                data: token_bytes(func)?,
            });
        }
        return Ok(AccountCallData::Batch(calls));
    }

    Err(AccountError::CallDataDecode(format!(
        "unknown account selector 0x{}",
        hex::encode(selector)
    )))
}

/// ERC-20 `approve(spender, amount)` call data.
pub fn encode_approve(spender: Address, amount: U256) -> Result<Bytes> {
    let f = parse_function(APPROVE)?;
    let data = f
        .encode_input(&[Token::Address(spender), Token::Uint(amount)])
        .map_err(|e| AccountError::Config(format!("failed to build approve calldata: {e}")))?;
    Ok(Bytes::from(data))
}

fn next_token(it: &mut impl Iterator<Item = Token>) -> Result<Token> {
    it.next()
        .ok_or_else(|| AccountError::CallDataDecode("missing argument".to_string()))
}

fn next_address(it: &mut impl Iterator<Item = Token>) -> Result<Address> {
    token_address(next_token(it)?)
}

fn next_uint(it: &mut impl Iterator<Item = Token>) -> Result<U256> {
    token_uint(next_token(it)?)
}

fn next_bytes(it: &mut impl Iterator<Item = Token>) -> Result<Bytes> {
    token_bytes(next_token(it)?)
}

fn next_array(it: &mut impl Iterator<Item = Token>) -> Result<Vec<Token>> {
    next_token(it)?
        .into_array()
        .ok_or_else(|| AccountError::CallDataDecode("expected array".to_string()))
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

#[cfg(test)]
mod tests {
    use super::*;

    fn call(byte: u8, value: u64, data: Vec<u8>) -> Call {
        Call::new(Address::repeat_byte(byte), U256::from(value), Bytes::from(data))
    }

    #[test]
    fn single_call_encodes_as_execute() {
        let c = call(0xaa, 10, vec![]);
        let data = encode_calls(&[c.clone()], false).unwrap();
        let execute = parse_function(EXECUTE).unwrap();
        assert_eq!(&data[..4], &execute.short_signature());
        assert_eq!(decode_calls(&data).unwrap(), AccountCallData::Single(c));
    }

    #[test]
    fn two_calls_encode_as_batch() {
        let calls = vec![call(0xaa, 1, vec![0x01, 0x02]), call(0xbb, 0, vec![0xde, 0xad])];
        let data = encode_calls(&calls, false).unwrap();
        let batch = parse_function(EXECUTE_BATCH).unwrap();
        assert_eq!(&data[..4], &batch.short_signature());
        assert_eq!(decode_calls(&data).unwrap(), AccountCallData::Batch(calls));
    }

    #[test]
    fn force_batch_wraps_single_call() {
        let calls = vec![call(0xaa, 7, vec![0x01])];
        let data = encode_calls(&calls, true).unwrap();
        let decoded = decode_calls(&data).unwrap();
        assert!(decoded.is_batch());
        assert_eq!(decoded.into_calls(), calls);
    }

    #[test]
    fn empty_batch_is_rejected() {
        assert!(matches!(encode_calls(&[], false), Err(AccountError::EmptyBatch)));
    }

    #[test]
    fn batch_with_empty_values_decodes_as_zero_value() {
        let f = parse_function(EXECUTE_BATCH).unwrap();
        let data = f
            .encode_input(&[
                Token::Array(vec![Token::Address(Address::repeat_byte(0x01))]),
                Token::Array(vec![]),
                Token::Array(vec![Token::Bytes(vec![0x11])]),
            ])
            .unwrap();
        let calls = decode_calls(&data).unwrap().into_calls();
        assert_eq!(calls, vec![call(0x01, 0, vec![0x11])]);
    }

    #[test]
    fn unknown_selector_fails_to_decode() {
        let err = decode_calls(&[0xde, 0xad, 0xbe, 0xef, 0x00]).unwrap_err();
        assert!(matches!(err, AccountError::CallDataDecode(_)));
    }

    #[test]
    fn short_call_data_fails_to_decode() {
        assert!(matches!(
            decode_calls(&[0x01]),
            Err(AccountError::CallDataDecode(_))
        ));
    }

    #[test]
    fn approve_has_erc20_selector() {
        let data = encode_approve(Address::repeat_byte(0x01), U256::from(5)).unwrap();
        assert_eq!(hex::encode(&data[..4]), "095ea7b3");
    }
}
