//! Hex and JSON-RPC quantity encoding for UserOperations sent over the wire.

use crate::types::UserOperation;
use anyhow::{anyhow, bail, Context};
use ethers::types::{Address, Bytes, H256, U256};
use serde_json::{Map, Value};

fn strip_0x(s: &str) -> &str {
    s.strip_prefix("0x").unwrap_or(s)
}

fn fmt_hex(data: impl AsRef<[u8]>) -> String {
    format!("0x{}", hex::encode(data))
}

pub fn fmt_address(addr: Address) -> String {
    fmt_hex(addr)
}

pub fn fmt_h256(h: H256) -> String {
    fmt_hex(h)
}

pub fn fmt_bytes(b: &Bytes) -> String {
    fmt_hex(b)
}

/// JSON-RPC quantity: minimal hex, `0x0` for zero.
pub fn fmt_u256(v: U256) -> String {
    format!("{v:#x}")
}

/// Bundler and paymaster wire form of `op`: camelCase keys, hex strings.
pub fn user_op_to_json(op: &UserOperation) -> Value {
    let fields = [
        ("sender", fmt_address(op.sender)),
        ("nonce", fmt_u256(op.nonce)),
        ("initCode", fmt_bytes(&op.init_code)),
        ("callData", fmt_bytes(&op.call_data)),
        ("callGasLimit", fmt_u256(op.call_gas_limit)),
        ("verificationGasLimit", fmt_u256(op.verification_gas_limit)),
        ("preVerificationGas", fmt_u256(op.pre_verification_gas)),
        ("maxFeePerGas", fmt_u256(op.max_fee_per_gas)),
        ("maxPriorityFeePerGas", fmt_u256(op.max_priority_fee_per_gas)),
        ("paymasterAndData", fmt_bytes(&op.paymaster_and_data)),
        ("signature", fmt_bytes(&op.signature)),
    ];
    Value::Object(
        fields
            .into_iter()
            .map(|(key, value)| (key.to_string(), Value::String(value)))
            .collect::<Map<_, _>>(),
    )
}

/// Parses a hex quantity. `0x` alone reads as zero.
pub fn parse_u256_quantity(s: &str) -> anyhow::Result<U256> {
    match strip_0x(s) {
        "" => Ok(U256::zero()),
        digits => U256::from_str_radix(digits, 16).map_err(|e| anyhow!("invalid quantity {s}: {e}")),
    }
}

/// Reads an optional gas quantity. Bundlers and paymasters answer with hex strings,
/// some with plain JSON numbers.
pub fn parse_optional_u256_field(v: &Value, key: &str) -> anyhow::Result<Option<U256>> {
    match v.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => parse_u256_quantity(s)
            .with_context(|| format!("invalid quantity in field {key}"))
            .map(Some),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(|n| Some(U256::from(n)))
            .ok_or_else(|| anyhow!("field {key} is not an unsigned integer")),
        Some(other) => Err(anyhow!("field {key} has unexpected type: {other}")),
    }
}

pub fn parse_hex_bytes(s: &str) -> anyhow::Result<Bytes> {
    hex::decode(strip_0x(s))
        .map(Bytes::from)
        .context("invalid hex bytes")
}

pub fn parse_h256(s: &str) -> anyhow::Result<H256> {
    let bytes = parse_hex_bytes(s)?;
    if bytes.len() != 32 {
        bail!("expected 32-byte hex, got {} bytes", bytes.len());
    }
    Ok(H256::from_slice(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn quantity_formatting_uses_minimal_hex() {
        assert_eq!(fmt_u256(U256::zero()), "0x0");
        assert_eq!(fmt_u256(U256::from(255)), "0xff");
    }

    #[test]
    fn optional_quantity_accepts_hex_and_numbers() {
        let v = json!({ "a": "0x10", "b": 7, "c": null });
        assert_eq!(parse_optional_u256_field(&v, "a").unwrap(), Some(U256::from(16)));
        assert_eq!(parse_optional_u256_field(&v, "b").unwrap(), Some(U256::from(7)));
        assert_eq!(parse_optional_u256_field(&v, "c").unwrap(), None);
        assert_eq!(parse_optional_u256_field(&v, "d").unwrap(), None);
    }

    #[test]
    fn h256_requires_exactly_32_bytes() {
        assert!(parse_h256("0x1234").is_err());
        let h = H256::repeat_byte(0xab);
        assert_eq!(parse_h256(&fmt_h256(h)).unwrap(), h);
    }

    #[test]
    fn optional_quantity_rejects_garbage() {
        let v = json!({ "a": "0xzz", "b": true });
        assert!(parse_optional_u256_field(&v, "a").is_err());
        assert!(parse_optional_u256_field(&v, "b").is_err());
    }

    #[test]
    fn user_op_json_uses_camel_case_hex() {
        let op = UserOperation {
            nonce: U256::from(3),
            ..Default::default()
        };
        let v = user_op_to_json(&op);
        assert_eq!(v["nonce"], "0x3");
        assert_eq!(v["initCode"], "0x");
        assert_eq!(v["paymasterAndData"], "0x");
    }
}
