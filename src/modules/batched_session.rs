use super::session::{unix_now, SessionKeyManagerModule};
use super::{dummy_ecdsa_signature, personal_sign, ValidationModule};
use crate::calldata::decode_calls;
use crate::error::{AccountError, Result};
use crate::types::{Call, UserOperation};
use async_trait::async_trait;
use ethers::abi::{encode, Token};
use ethers::types::{Address, Bytes, H256};
use std::sync::Arc;

/// Routes each call of a batched operation to its own session in a shared
/// session-key manager, so one operation can span several session scopes.
///
/// Every session used by an operation must belong to the same session key.
#[derive(Clone, Debug)]
pub struct BatchedSessionRouterModule {
    address: Address,
    session_manager: Arc<SessionKeyManagerModule>,
}

impl BatchedSessionRouterModule {
    pub fn new(address: Address, session_manager: Arc<SessionKeyManagerModule>) -> Self {
        Self {
            address,
            session_manager,
        }
    }

    pub fn session_manager(&self) -> &SessionKeyManagerModule {
        &self.session_manager
    }

    /// Session index for each call, in call order.
    fn route(&self, calls: &[Call], now: u64) -> Result<Vec<usize>> {
        calls
            .iter()
            .map(|call| {
                self.session_manager
                    .session_for_calls(std::slice::from_ref(call), now)
            })
            .collect()
    }

    fn encode_signature(&self, sessions: &[usize], session_signature: &[u8]) -> Result<Bytes> {
        let mut session_data = Vec::with_capacity(sessions.len());
        for &index in sessions {
            let mut fields = self.session_manager.session_tokens(index)?;
            // callSpecificData
            fields.push(Token::Bytes(Vec::new()));
            session_data.push(Token::Tuple(fields));
        }
        Ok(encode(&[
            Token::Address(self.session_manager.address()),
            Token::Array(session_data),
            Token::Bytes(session_signature.to_vec()),
        ])
        .into())
    }
}

#[async_trait]
impl ValidationModule for BatchedSessionRouterModule {
    fn address(&self) -> Address {
        self.address
    }

    fn init_data(&self) -> Result<Bytes> {
        Err(AccountError::Config(
            "batched session router cannot initialise an account".to_string(),
        ))
    }

    fn dummy_signature(&self, call_data: &[u8]) -> Result<Bytes> {
        let calls = decode_calls(call_data)?.into_calls();
        let routes = self
            .route(&calls, unix_now())
            .unwrap_or_else(|_| vec![0; calls.len()]);
        self.encode_signature(&routes, &dummy_ecdsa_signature()?)
    }

    async fn sign_user_op_hash(
        &self,
        user_op_hash: H256,
        user_op: &UserOperation,
    ) -> Result<Bytes> {
        let calls = decode_calls(&user_op.call_data)?.into_calls();
        let routes = self.route(&calls, unix_now())?;

        let mut signer: Option<&crate::modules::Session> = None;
        for &index in &routes {
            let session = self.session_manager.session(index).ok_or_else(|| {
                AccountError::SessionPermission(format!("no session at index {index}"))
            })?;
            if let Some(first) = signer {
                if first.session_key() != session.session_key() {
                    return Err(AccountError::SessionPermission(format!(
                        "calls span different session keys ({:?} and {:?})",
                        first.session_key(),
                        session.session_key()
                    )));
                }
            } else {
                signer = Some(session);
            }
        }
        let session = signer.ok_or(AccountError::EmptyBatch)?;

        let sig = personal_sign(session.signer(), user_op_hash.as_bytes()).await?;
        self.encode_signature(&routes, &sig)
    }
}
