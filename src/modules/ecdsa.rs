use super::{dummy_ecdsa_signature, owner_init_data, personal_sign, ValidationModule};
use crate::error::Result;
use crate::types::UserOperation;
use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Bytes, H256};

/// Single-owner module: one EOA signs every operation.
#[derive(Debug, Clone)]
pub struct EcdsaOwnershipModule {
    address: Address,
    signer: LocalWallet,
}

impl EcdsaOwnershipModule {
    pub fn new(address: Address, signer: LocalWallet) -> Self {
        Self { address, signer }
    }

    pub fn owner(&self) -> Address {
        self.signer.address()
    }
}

#[async_trait]
impl ValidationModule for EcdsaOwnershipModule {
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::Signature;

    const OWNER_KEY: &str = "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

    #[tokio::test]
    async fn signature_recovers_to_owner() {
        let wallet: LocalWallet = OWNER_KEY.parse().unwrap();
        let module = EcdsaOwnershipModule::new(Address::repeat_byte(0x0e), wallet.clone());
        let hash = H256::repeat_byte(0x42);
        let sig = module
            .sign_user_op_hash(hash, &UserOperation::default())
            .await
            .unwrap();
        assert_eq!(sig.len(), 65);
        let sig = Signature::try_from(sig.as_ref()).unwrap();
        assert_eq!(sig.recover(hash.as_bytes()).unwrap(), wallet.address());
    }

    #[test]
    fn init_data_encodes_owner() {
        let wallet: LocalWallet = OWNER_KEY.parse().unwrap();
        let module = EcdsaOwnershipModule::new(Address::repeat_byte(0x0e), wallet.clone());
        let data = module.init_data().unwrap();
        assert_eq!(data.len(), 4 + 32);
        assert_eq!(&data[16..], wallet.address().as_bytes());
    }
}
