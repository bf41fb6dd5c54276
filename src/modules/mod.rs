//! Validation modules: pluggable signing strategies attached to a smart account.
//!
//! A module can produce the account's deployment init data, a dummy signature sized for
//! gas estimation, and a signature over a UserOperation hash. Signatures leave the module
//! raw; [`wrap_signature`] tags them with the module address so the account knows which
//! validator to delegate to.

mod batched_session;
mod ecdsa;
pub mod merkle;
mod multichain;
mod registry;
mod session;

pub use batched_session::BatchedSessionRouterModule;
pub use ecdsa::EcdsaOwnershipModule;
pub use multichain::{recover_batch_signer, MultiChainItem, MultiChainValidationModule};
pub use registry::ValidationModuleRegistry;
pub use session::{Session, SessionKeyManagerModule, SessionLeaf, SessionPermission};

use crate::error::{AccountError, Result};
use crate::types::UserOperation;
use async_trait::async_trait;
use ethers::abi::{decode, encode, ParamType, Token};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Bytes, H256};
use std::fmt;

/// 65-byte ECDSA signature used wherever a module needs a placeholder of the right shape.
pub const DUMMY_ECDSA_SIGNATURE: &str = "0x73c3ac716c487ca34bb858247b5ccf1dc354fbaabdd089af3b2ac8e78ba85a4959a2d76250325bd67c11771c31fccda87c33ceec17cc0de912690521bb95ffcb1b";

#[async_trait]
pub trait ValidationModule: Send + Sync + fmt::Debug {
    /// On-chain address of the module contract.
    fn address(&self) -> Address;

    /// Setup data the account factory passes to the module on deployment.
    fn init_data(&self) -> Result<Bytes>;

    /// Raw placeholder signature for an operation carrying `call_data`.
    fn dummy_signature(&self, call_data: &[u8]) -> Result<Bytes>;

    /// Raw signature over `user_op_hash`. `user_op` is the operation being signed, for
    /// modules that restrict which calls they authorise.
    async fn sign_user_op_hash(&self, user_op_hash: H256, user_op: &UserOperation)
        -> Result<Bytes>;

    /// Multi-chain batch signing, for modules that support it.
    fn as_multi_chain(&self) -> Option<&MultiChainValidationModule> {
        None
    }
}

/// Largest timestamp the modules' `uint48` validity fields can hold.
pub const MAX_UINT48: u64 = (1 << 48) - 1;

/// Rejects validity bounds that would be truncated when packed as `uint48`.
pub(crate) fn ensure_validity_window(valid_after: u64, valid_until: u64) -> Result<()> {
    for (field, value) in [("validAfter", valid_after), ("validUntil", valid_until)] {
        if value > MAX_UINT48 {
            return Err(AccountError::Config(format!(
                "{field} {value} does not fit in uint48"
            )));
        }
    }
    Ok(())
}

/// `abi.encode(bytes moduleSignature, address module)`.
pub fn wrap_signature(module_signature: &[u8], module: Address) -> Bytes {
    encode(&[
        Token::Bytes(module_signature.to_vec()),
        Token::Address(module),
    ])
    .into()
}

/// Splits a wrapped signature back into `(moduleSignature, module)`.
pub fn unwrap_signature(signature: &[u8]) -> Result<(Bytes, Address)> {
    let mut tokens = decode(&[ParamType::Bytes, ParamType::Address], signature)
        .map_err(|e| AccountError::Signing(format!("malformed module signature: {e}")))?;
    let module = tokens.pop().and_then(Token::into_address);
    let sig = tokens.pop().and_then(Token::into_bytes);
    match (sig, module) {
        (Some(sig), Some(module)) => Ok((Bytes::from(sig), module)),
        _ => Err(AccountError::Signing(
            "malformed module signature".to_string(),
        )),
    }
}

pub(crate) fn dummy_ecdsa_signature() -> Result<Bytes> {
    DUMMY_ECDSA_SIGNATURE
        .parse::<Bytes>()
        .map_err(|e| AccountError::Config(format!("invalid dummy signature: {e}")))
}

/// EIP-191 personal-message signature over `message`.
pub(crate) async fn personal_sign(signer: &LocalWallet, message: &[u8]) -> Result<Bytes> {
    let sig = signer
        .sign_message(message)
        .await
        .map_err(AccountError::signing)?;
    Ok(Bytes::from(sig.to_vec()))
}

/// `initForSmartAccount(address owner)` calldata shared by the owner-based modules.
pub(crate) fn owner_init_data(owner: Address) -> Result<Bytes> {
    let f = ethers::abi::AbiParser::default()
        .parse_function("function initForSmartAccount(address eoaOwner) returns (address)")
        .map_err(|e| AccountError::Config(format!("invalid initForSmartAccount ABI: {e}")))?;
    let data = f
        .encode_input(&[Token::Address(owner)])
        .map_err(|e| AccountError::Config(format!("failed to encode init data: {e}")))?;
    Ok(Bytes::from(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapped_signature_round_trips() {
        let module = Address::repeat_byte(0x0e);
        let wrapped = wrap_signature(&[0xaa; 65], module);
        let (sig, m) = unwrap_signature(&wrapped).unwrap();
        assert_eq!(m, module);
        assert_eq!(sig.to_vec(), vec![0xaa; 65]);
    }

    #[test]
    fn dummy_signature_is_65_bytes() {
        assert_eq!(dummy_ecdsa_signature().unwrap().len(), 65);
    }
}
