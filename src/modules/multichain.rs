use super::merkle::MerkleTree;
use super::{
    dummy_ecdsa_signature, ensure_validity_window, owner_init_data, personal_sign,
    ValidationModule,
};
use crate::error::{AccountError, Result};
use crate::hash::user_op_hash;
use crate::types::UserOperation;
use async_trait::async_trait;
use ethers::abi::{decode, encode, ParamType, Token};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Bytes, Signature, H256, U256};
use ethers::utils::keccak256;

/// One operation in a multi-chain batch, with the verifier and chain it is bound to.
#[derive(Clone, Debug)]
pub struct MultiChainItem {
    pub user_op: UserOperation,
    pub entry_point: Address,
    pub chain_id: u64,
}

impl MultiChainItem {
    pub fn hash(&self) -> H256 {
        user_op_hash(&self.user_op, self.entry_point, self.chain_id)
    }
}

/// Owner-based module whose signature can authorise several chain-scoped operations at once.
///
/// Alone it signs like the ECDSA module. In a batch the owner signs the root of a Merkle tree
/// over every `(validUntil, validAfter, userOpHash)` leaf, and each operation carries its own
/// inclusion proof.
#[derive(Debug, Clone)]
pub struct MultiChainValidationModule {
    address: Address,
    signer: LocalWallet,
    valid_until: u64,
    valid_after: u64,
}

impl MultiChainValidationModule {
    pub fn new(address: Address, signer: LocalWallet) -> Self {
        Self {
            address,
            signer,
            valid_until: 0,
            valid_after: 0,
        }
    }

    /// Validity window embedded in every leaf. `valid_until == 0` means no expiry.
    pub fn with_validity(mut self, valid_after: u64, valid_until: u64) -> Result<Self> {
        ensure_validity_window(valid_after, valid_until)?;
        self.valid_after = valid_after;
        self.valid_until = valid_until;
        Ok(self)
    }

    pub fn owner(&self) -> Address {
        self.signer.address()
    }

    fn leaf(&self, user_op_hash: H256) -> H256 {
        leaf_hash(self.valid_until, self.valid_after, user_op_hash)
    }

    /// Signs every operation with one owner signature over the batch root.
    ///
    /// Returns raw module signatures in input order; they differ only in their proofs.
    pub async fn sign_batch(&self, items: &[MultiChainItem]) -> Result<Vec<Bytes>> {
        if items.is_empty() {
            return Err(AccountError::EmptyBatch);
        }

        let leaves: Vec<H256> = items.iter().map(|item| self.leaf(item.hash())).collect();
        let tree = MerkleTree::new(leaves)
            .ok_or_else(|| AccountError::Signing("empty multi-chain batch".to_string()))?;
        let root = tree.root();
        let root_signature = personal_sign(&self.signer, root.as_bytes()).await?;

        tracing::debug!(root = ?root, ops = items.len(), "signed multi-chain root");

        let mut signatures = Vec::with_capacity(items.len());
        for i in 0..items.len() {
            let proof = tree
                .proof(i)
                .ok_or_else(|| AccountError::Signing(format!("no merkle proof for op {i}")))?;
            signatures.push(
                encode(&[
                    Token::Uint(U256::from(self.valid_until)),
                    Token::Uint(U256::from(self.valid_after)),
                    Token::FixedBytes(root.as_bytes().to_vec()),
                    Token::Array(
                        proof
                            .iter()
                            .map(|p| Token::FixedBytes(p.as_bytes().to_vec()))
                            .collect(),
                    ),
                    Token::Bytes(root_signature.to_vec()),
                ])
                .into(),
            );
        }
        Ok(signatures)
    }
}

/// `keccak256(uint48 validUntil ‖ uint48 validAfter ‖ userOpHash)`.
fn leaf_hash(valid_until: u64, valid_after: u64, user_op_hash: H256) -> H256 {
    let mut packed = Vec::with_capacity(6 + 6 + 32);
    packed.extend_from_slice(&valid_until.to_be_bytes()[2..]);
    packed.extend_from_slice(&valid_after.to_be_bytes()[2..]);
    packed.extend_from_slice(user_op_hash.as_bytes());
    H256::from(keccak256(packed))
}

/// Recovers the signer of a raw multi-chain module signature for `user_op_hash`.
///
/// Fails if the embedded proof does not place this operation under the signed root.
pub fn recover_batch_signer(module_signature: &[u8], user_op_hash: H256) -> Result<Address> {
    let tokens = decode(
        &[
            ParamType::Uint(48),
            ParamType::Uint(48),
            ParamType::FixedBytes(32),
            ParamType::Array(Box::new(ParamType::FixedBytes(32))),
            ParamType::Bytes,
        ],
        module_signature,
    )
    .map_err(|e| AccountError::Signing(format!("malformed multi-chain signature: {e}")))?;

    let malformed = || AccountError::Signing("malformed multi-chain signature".to_string());
    let mut it = tokens.into_iter();
    let valid_until = it.next().and_then(Token::into_uint).ok_or_else(malformed)?;
    let valid_after = it.next().and_then(Token::into_uint).ok_or_else(malformed)?;
    let root = it
        .next()
        .and_then(Token::into_fixed_bytes)
        .map(|b| H256::from_slice(&b))
        .ok_or_else(malformed)?;
    let proof: Vec<H256> = it
        .next()
        .and_then(Token::into_array)
        .ok_or_else(malformed)?
        .into_iter()
        .filter_map(Token::into_fixed_bytes)
        .map(|b| H256::from_slice(&b))
        .collect();
    let root_signature = it.next().and_then(Token::into_bytes).ok_or_else(malformed)?;

    let leaf = leaf_hash(valid_until.low_u64(), valid_after.low_u64(), user_op_hash);
    if !MerkleTree::verify(&proof, leaf, root) {
        return Err(AccountError::Signing(
            "operation is not part of the signed batch".to_string(),
        ));
    }

    let sig = Signature::try_from(root_signature.as_slice()).map_err(AccountError::signing)?;
    sig.recover(root.as_bytes()).map_err(AccountError::signing)
}

#[async_trait]
impl ValidationModule for MultiChainValidationModule {
    fn address(&self) -> Address {
        self.address
    }

    fn init_data(&self) -> Result<Bytes> {
        owner_init_data(self.owner())
    }

    fn dummy_signature(&self, _call_data: &[u8]) -> Result<Bytes> {
        dummy_ecdsa_signature()
    }

    async fn sign_user_op_hash(
        &self,
        user_op_hash: H256,
        _user_op: &UserOperation,
    ) -> Result<Bytes> {
        personal_sign(&self.signer, user_op_hash.as_bytes()).await
    }

    fn as_multi_chain(&self) -> Option<&MultiChainValidationModule> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OWNER_KEY: &str = "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

    fn item(chain_id: u64, nonce: u64) -> MultiChainItem {
        MultiChainItem {
            user_op: UserOperation {
                sender: Address::repeat_byte(0x5a),
                nonce: U256::from(nonce),
                call_data: Bytes::from(vec![0x01, 0x02]),
                ..Default::default()
            },
            entry_point: Address::repeat_byte(0xe0),
            chain_id,
        }
    }

    fn module() -> MultiChainValidationModule {
        let wallet: LocalWallet = OWNER_KEY.parse().unwrap();
        MultiChainValidationModule::new(Address::repeat_byte(0x3c), wallet)
    }

    #[tokio::test]
    async fn batch_signatures_validate_per_chain() {
        let module = module();
        let items = vec![item(1, 0), item(137, 0)];
        let sigs = module.sign_batch(&items).await.unwrap();
        assert_eq!(sigs.len(), 2);
        assert_ne!(sigs[0], sigs[1]);

        for (sig, item) in sigs.iter().zip(&items) {
            let signer = recover_batch_signer(sig, item.hash()).unwrap();
            assert_eq!(signer, module.owner());
        }
    }

    #[tokio::test]
    async fn batch_signature_does_not_validate_other_operation() {
        let module = module();
        let items = vec![item(1, 0), item(137, 0)];
        let sigs = module.sign_batch(&items).await.unwrap();
        let foreign = item(10, 5);
        assert!(recover_batch_signer(&sigs[0], foreign.hash()).is_err());
    }

    #[tokio::test]
    async fn empty_batch_is_rejected() {
        assert!(matches!(
            module().sign_batch(&[]).await,
            Err(AccountError::EmptyBatch)
        ));
    }

    #[test]
    fn validity_beyond_uint48_is_rejected() {
        assert!(matches!(
            module().with_validity(0, crate::modules::MAX_UINT48 + 1),
            Err(AccountError::Config(_))
        ));
        let module = module()
            .with_validity(1, crate::modules::MAX_UINT48)
            .unwrap();
        assert_eq!(module.valid_until, crate::modules::MAX_UINT48);
    }

    #[test]
    fn leaf_packs_uint48_fields() {
        let h = H256::repeat_byte(0x01);
        let mut packed = vec![0, 0, 0, 0, 0, 9, 0, 0, 0, 0, 0, 3];
        packed.extend_from_slice(h.as_bytes());
        assert_eq!(leaf_hash(9, 3, h), H256::from(keccak256(packed)));
    }
}
