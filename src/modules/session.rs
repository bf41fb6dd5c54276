use super::merkle::MerkleTree;
use super::{dummy_ecdsa_signature, ensure_validity_window, personal_sign, ValidationModule};
use crate::calldata::decode_calls;
use crate::error::{AccountError, Result};
use crate::types::{Call, UserOperation};
use async_trait::async_trait;
use ethers::abi::{encode, AbiParser, Token};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::keccak256;
use rand::rngs::OsRng;
use std::time::{SystemTime, UNIX_EPOCH};

/// What a session key may do: call `target`, optionally only `selector`, moving at most
/// `max_value` wei per call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionPermission {
    pub target: Address,
    pub selector: Option<[u8; 4]>,
    pub max_value: U256,
}

impl SessionPermission {
    pub fn allows(&self, call: &Call) -> bool {
        if call.to != self.target || call.value > self.max_value {
            return false;
        }
        match self.selector {
            Some(selector) => call.selector() == Some(selector),
            None => true,
        }
    }
}

/// A leaf of the session Merkle tree as stored by the session-key manager contract.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionLeaf {
    pub valid_until: u64,
    pub valid_after: u64,
    pub session_validation_module: Address,
    pub session_key_data: Bytes,
}

impl SessionLeaf {
    /// `keccak256(uint48 validUntil ‖ uint48 validAfter ‖ address module ‖ sessionKeyData)`.
    pub fn hash(&self) -> H256 {
        let mut packed = Vec::with_capacity(6 + 6 + 20 + self.session_key_data.len());
        packed.extend_from_slice(&self.valid_until.to_be_bytes()[2..]);
        packed.extend_from_slice(&self.valid_after.to_be_bytes()[2..]);
        packed.extend_from_slice(self.session_validation_module.as_bytes());
        packed.extend_from_slice(&self.session_key_data);
        H256::from(keccak256(packed))
    }

    /// `valid_until == 0` means the session never expires.
    pub fn is_active(&self, now: u64) -> bool {
        self.valid_after <= now && (self.valid_until == 0 || now <= self.valid_until)
    }
}

/// A delegated signer together with its on-chain leaf and the permission it encodes.
#[derive(Clone, Debug)]
pub struct Session {
    pub leaf: SessionLeaf,
    pub permission: SessionPermission,
    signer: LocalWallet,
}

impl Session {
    pub fn new(
        signer: LocalWallet,
        permission: SessionPermission,
        session_validation_module: Address,
        valid_after: u64,
        valid_until: u64,
    ) -> Result<Self> {
        ensure_validity_window(valid_after, valid_until)?;
        let session_key_data = encode(&[
            Token::Address(signer.address()),
            Token::Address(permission.target),
            Token::FixedBytes(permission.selector.unwrap_or_default().to_vec()),
            Token::Uint(permission.max_value),
        ])
        .into();

        Ok(Self {
            leaf: SessionLeaf {
                valid_until,
                valid_after,
                session_validation_module,
                session_key_data,
            },
            permission,
            signer,
        })
    }

    /// Creates a session with a freshly generated key.
    pub fn generate(
        permission: SessionPermission,
        session_validation_module: Address,
        valid_after: u64,
        valid_until: u64,
    ) -> Result<Self> {
        Self::new(
            LocalWallet::new(&mut OsRng),
            permission,
            session_validation_module,
            valid_after,
            valid_until,
        )
    }

    pub fn session_key(&self) -> Address {
        self.signer.address()
    }

    pub(super) fn signer(&self) -> &LocalWallet {
        &self.signer
    }

    fn permits(&self, call: &Call, now: u64) -> bool {
        self.leaf.is_active(now) && self.permission.allows(call)
    }
}

pub(super) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Session-key manager: a Merkle root of session leaves lives on-chain; each operation is
/// signed by one session key and proves its session is in the tree.
#[derive(Clone, Debug)]
pub struct SessionKeyManagerModule {
    address: Address,
    sessions: Vec<Session>,
    tree: Option<MerkleTree>,
}

impl SessionKeyManagerModule {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            sessions: Vec::new(),
            tree: None,
        }
    }

    pub fn with_session(mut self, session: Session) -> Self {
        self.sessions.push(session);
        self.tree = MerkleTree::new(self.sessions.iter().map(|s| s.leaf.hash()).collect());
        self
    }

    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    pub fn merkle_root(&self) -> H256 {
        self.tree.as_ref().map(MerkleTree::root).unwrap_or_default()
    }

    fn set_merkle_root_data(&self) -> Result<Bytes> {
        let f = AbiParser::default()
            .parse_function("function setMerkleRoot(bytes32 _merkleRoot)")
            .map_err(|e| AccountError::Config(format!("invalid setMerkleRoot ABI: {e}")))?;
        let data = f
            .encode_input(&[Token::FixedBytes(self.merkle_root().as_bytes().to_vec())])
            .map_err(|e| AccountError::Config(format!("failed to encode setMerkleRoot: {e}")))?;
        Ok(Bytes::from(data))
    }

    /// The account call that registers the current session tree on-chain.
    pub fn set_merkle_root_call(&self) -> Result<Call> {
        Ok(Call::new(self.address, U256::zero(), self.set_merkle_root_data()?))
    }

    /// First session permitting every call in `calls` at `now`.
    pub(super) fn session_for_calls(&self, calls: &[Call], now: u64) -> Result<usize> {
        self.sessions
            .iter()
            .position(|s| calls.iter().all(|c| s.permits(c, now)))
            .ok_or_else(|| {
                AccountError::SessionPermission(format!(
                    "no active session permits calls to [{}]",
                    calls
                        .iter()
                        .map(|c| format!("{:?}", c.to))
                        .collect::<Vec<_>>()
                        .join(", ")
                ))
            })
    }

    pub(super) fn session(&self, index: usize) -> Option<&Session> {
        self.sessions.get(index)
    }

    pub(super) fn proof(&self, index: usize) -> Result<Vec<H256>> {
        self.tree
            .as_ref()
            .and_then(|t| t.proof(index))
            .ok_or_else(|| AccountError::SessionPermission(format!("no session at index {index}")))
    }

    /// `(validUntil, validAfter, module, sessionKeyData, proof)` tokens for session `index`.
    pub(super) fn session_tokens(&self, index: usize) -> Result<Vec<Token>> {
        let session = self
            .session(index)
            .ok_or_else(|| AccountError::SessionPermission(format!("no session at index {index}")))?;
        let proof = self.proof(index)?;
        Ok(vec![
            Token::Uint(U256::from(session.leaf.valid_until)),
            Token::Uint(U256::from(session.leaf.valid_after)),
            Token::Address(session.leaf.session_validation_module),
            Token::Bytes(session.leaf.session_key_data.to_vec()),
            Token::Array(
                proof
                    .iter()
                    .map(|p| Token::FixedBytes(p.as_bytes().to_vec()))
                    .collect(),
            ),
        ])
    }

    fn encode_signature(&self, index: usize, session_signature: &[u8]) -> Result<Bytes> {
        let mut tokens = self.session_tokens(index)?;
        tokens.push(Token::Bytes(session_signature.to_vec()));
        Ok(encode(&tokens).into())
    }
}

#[async_trait]
impl ValidationModule for SessionKeyManagerModule {
    fn address(&self) -> Address {
        self.address
    }

    fn init_data(&self) -> Result<Bytes> {
        self.set_merkle_root_data()
    }

    fn dummy_signature(&self, call_data: &[u8]) -> Result<Bytes> {
        if self.sessions.is_empty() {
            return Err(AccountError::SessionPermission(
                "session-key manager has no sessions".to_string(),
            ));
        }
        // Estimation only needs the right shape, so any session will do if none matches.
        let index = decode_calls(call_data)
            .ok()
            .and_then(|c| self.session_for_calls(&c.into_calls(), unix_now()).ok())
            .unwrap_or_default();
        self.encode_signature(index, &dummy_ecdsa_signature()?)
    }

    async fn sign_user_op_hash(
        &self,
        user_op_hash: H256,
        user_op: &UserOperation,
    ) -> Result<Bytes> {
        let calls = decode_calls(&user_op.call_data)?.into_calls();
        let index = self.session_for_calls(&calls, unix_now())?;
        let session = self
            .session(index)
            .ok_or_else(|| AccountError::SessionPermission(format!("no session at index {index}")))?;

        tracing::debug!(
            session_key = %session.session_key(),
            calls = calls.len(),
            "signing with session key"
        );
        let sig = personal_sign(session.signer(), user_op_hash.as_bytes()).await?;
        self.encode_signature(index, &sig)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calldata::encode_calls;
    use crate::modules::merkle::MerkleTree;
    use ethers::abi::{decode, ParamType};

    const TRANSFER: [u8; 4] = [0xa9, 0x05, 0x9c, 0xbb];

    fn permission(target: u8) -> SessionPermission {
        SessionPermission {
            target: Address::repeat_byte(target),
            selector: Some(TRANSFER),
            max_value: U256::zero(),
        }
    }

    fn manager() -> SessionKeyManagerModule {
        let svm = Address::repeat_byte(0x5f);
        SessionKeyManagerModule::new(Address::repeat_byte(0x5e))
            .with_session(Session::generate(permission(0x10), svm, 0, 0).unwrap())
            .with_session(Session::generate(permission(0x20), svm, 0, 0).unwrap())
    }

    fn transfer_call(target: u8) -> Call {
        let mut data = TRANSFER.to_vec();
        data.extend_from_slice(&[0u8; 64]);
        Call::new(Address::repeat_byte(target), U256::zero(), Bytes::from(data))
    }

    fn op_for(calls: &[Call]) -> UserOperation {
        UserOperation {
            call_data: encode_calls(calls, false).unwrap(),
            ..Default::default()
        }
    }

    #[test]
    fn generated_sessions_get_distinct_keys() {
        let svm = Address::repeat_byte(0x5f);
        let a = Session::generate(permission(0x10), svm, 0, 0).unwrap();
        let b = Session::generate(permission(0x10), svm, 0, 0).unwrap();
        assert_ne!(a.session_key(), b.session_key());
        assert_ne!(a.leaf.hash(), b.leaf.hash());
    }

    #[test]
    fn session_window_beyond_uint48_is_rejected() {
        let svm = Address::repeat_byte(0x5f);
        let too_late = crate::modules::MAX_UINT48 + 1;
        assert!(matches!(
            Session::generate(permission(0x10), svm, too_late, 0),
            Err(AccountError::Config(_))
        ));
        assert!(Session::generate(permission(0x10), svm, 0, crate::modules::MAX_UINT48).is_ok());
    }

    #[test]
    fn permission_checks_target_selector_and_value() {
        let p = permission(0x10);
        assert!(p.allows(&transfer_call(0x10)));
        assert!(!p.allows(&transfer_call(0x11)));
        let mut valued = transfer_call(0x10);
        valued.value = U256::one();
        assert!(!p.allows(&valued));
        let other = Call::new(Address::repeat_byte(0x10), U256::zero(), Bytes::from(vec![1, 2, 3, 4]));
        assert!(!p.allows(&other));
    }

    #[test]
    fn validity_window_is_inclusive() {
        let leaf = SessionLeaf {
            valid_until: 200,
            valid_after: 100,
            session_validation_module: Address::zero(),
            session_key_data: Bytes::default(),
        };
        assert!(!leaf.is_active(99));
        assert!(leaf.is_active(100));
        assert!(leaf.is_active(200));
        assert!(!leaf.is_active(201));
    }

    #[tokio::test]
    async fn signs_with_matching_session_and_valid_proof() {
        let manager = manager();
        let op = op_for(&[transfer_call(0x20)]);
        let sig = manager
            .sign_user_op_hash(H256::repeat_byte(0x01), &op)
            .await
            .unwrap();

        let tokens = decode(
            &[
                ParamType::Uint(48),
                ParamType::Uint(48),
                ParamType::Address,
                ParamType::Bytes,
                ParamType::Array(Box::new(ParamType::FixedBytes(32))),
                ParamType::Bytes,
            ],
            &sig,
        )
        .unwrap();
        let proof: Vec<H256> = tokens[4]
            .clone()
            .into_array()
            .unwrap()
            .into_iter()
            .map(|t| H256::from_slice(&t.into_fixed_bytes().unwrap()))
            .collect();
        let leaf = manager.sessions()[1].leaf.hash();
        assert!(MerkleTree::verify(&proof, leaf, manager.merkle_root()));
    }

    #[tokio::test]
    async fn refuses_call_outside_permission() {
        let manager = manager();
        let op = op_for(&[transfer_call(0x30)]);
        let err = manager
            .sign_user_op_hash(H256::zero(), &op)
            .await
            .unwrap_err();
        assert!(matches!(err, AccountError::SessionPermission(_)));
    }

    #[tokio::test]
    async fn refuses_expired_session() {
        let svm = Address::repeat_byte(0x5f);
        let manager = SessionKeyManagerModule::new(Address::repeat_byte(0x5e))
            .with_session(Session::generate(permission(0x10), svm, 0, 1).unwrap());
        let op = op_for(&[transfer_call(0x10)]);
        assert!(matches!(
            manager.sign_user_op_hash(H256::zero(), &op).await,
            Err(AccountError::SessionPermission(_))
        ));
    }

    #[test]
    fn dummy_signature_matches_real_shape() {
        let manager = manager();
        let op = op_for(&[transfer_call(0x10)]);
        let dummy = manager.dummy_signature(&op.call_data).unwrap();
        // 6 head words + sessionKeyData (4 words + length) + proof (1 word + length) + 65-byte sig (3 words + length)
        assert_eq!(dummy.len(), 32 * (6 + 5 + 2 + 4));
    }

    #[test]
    fn set_merkle_root_call_targets_module() {
        let manager = manager();
        let call = manager.set_merkle_root_call().unwrap();
        assert_eq!(call.to, Address::repeat_byte(0x5e));
        assert_eq!(&call.data[4..], manager.merkle_root().as_bytes());
    }
}
