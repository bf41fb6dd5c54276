use crate::bundler::Bundler;
use crate::encoding::{fmt_h256, user_op_to_json};
use crate::error::{AccountError, Result};
use crate::types::{InclusionOutcome, UserOperation};
use ethers::types::{Address, H256};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Hands finished operations to the bundler and waits for their inclusion.
#[derive(Clone)]
pub struct DispatchGateway {
    bundler: Arc<dyn Bundler>,
    entry_point: Address,
}

impl DispatchGateway {
    pub fn new(bundler: Arc<dyn Bundler>, entry_point: Address) -> Self {
        Self {
            bundler,
            entry_point,
        }
    }

    /// Validates the operation and submits it. Returns the bundler's userOpHash.
    pub async fn submit(&self, op: &UserOperation) -> Result<H256> {
        op.ensure_dispatchable()?;

        let user_op_hash = self
            .bundler
            .send_user_operation(user_op_to_json(op), self.entry_point)
            .await
            .map_err(|e| AccountError::Bundler {
                method: "eth_sendUserOperation",
                reason: format!("{e:#}"),
            })?;

        tracing::info!(
            user_op_hash = %fmt_h256(user_op_hash),
            sender = ?op.sender,
            nonce = %op.nonce,
            paymaster = ?op.paymaster(),
            "user operation submitted"
        );
        Ok(user_op_hash)
    }

    /// Polls for a receipt every `poll_interval` until `timeout` elapses.
    ///
    /// Poll errors are logged and polling continues; reaching the timeout yields
    /// [`InclusionOutcome::NotFound`].
    pub async fn await_inclusion(
        &self,
        user_op_hash: H256,
        timeout: Duration,
        poll_interval: Duration,
    ) -> InclusionOutcome {
        let start = Instant::now();
        loop {
            match self.bundler.get_user_operation_receipt(user_op_hash).await {
                Ok(Some(receipt)) => {
                    tracing::info!(
                        user_op_hash = %fmt_h256(user_op_hash),
                        success = receipt.success,
                        "user operation included"
                    );
                    return InclusionOutcome::Included(receipt);
                }
                Ok(None) => {}
                Err(e) => {
                    // transient errors are common on free-tier bundlers; keep polling
                    tracing::warn!(error = %e, "bundler receipt poll error");
                }
            }

            if start.elapsed() + poll_interval > timeout {
                tracing::info!(
                    user_op_hash = %fmt_h256(user_op_hash),
                    ?timeout,
                    "no receipt before timeout"
                );
                return InclusionOutcome::NotFound;
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundler::MockBundler;
    use crate::types::UserOperationReceipt;
    use ethers::types::Bytes;

    fn signed_op() -> UserOperation {
        UserOperation {
            sender: Address::repeat_byte(0x01),
            signature: Bytes::from(vec![0x01; 65]),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn unsigned_operation_fails_before_network() {
        let bundler = MockBundler::new();
        let gateway = DispatchGateway::new(Arc::new(bundler), Address::zero());
        let mut op = signed_op();
        op.signature = Bytes::default();
        assert!(matches!(
            gateway.submit(&op).await,
            Err(AccountError::IncompleteOperation("signature"))
        ));
    }

    #[tokio::test]
    async fn submit_returns_bundler_hash() {
        let mut bundler = MockBundler::new();
        bundler
            .expect_send_user_operation()
            .times(1)
            .returning(|_, _| Ok(H256::repeat_byte(0xab)));
        let gateway = DispatchGateway::new(Arc::new(bundler), Address::zero());
        assert_eq!(gateway.submit(&signed_op()).await.unwrap(), H256::repeat_byte(0xab));
    }

    #[tokio::test]
    async fn bundler_rejection_names_method() {
        let mut bundler = MockBundler::new();
        bundler
            .expect_send_user_operation()
            .returning(|_, _| Err(anyhow::anyhow!("AA21 didn't pay prefund")));
        let gateway = DispatchGateway::new(Arc::new(bundler), Address::zero());
        let err = gateway.submit(&signed_op()).await.unwrap_err();
        assert!(matches!(
            err,
            AccountError::Bundler {
                method: "eth_sendUserOperation",
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_yields_not_found() {
        let mut bundler = MockBundler::new();
        bundler
            .expect_get_user_operation_receipt()
            .returning(|_| Ok(None));
        let gateway = DispatchGateway::new(Arc::new(bundler), Address::zero());
        let outcome = gateway
            .await_inclusion(
                H256::zero(),
                Duration::from_millis(50),
                Duration::from_millis(10),
            )
            .await;
        assert_eq!(outcome, InclusionOutcome::NotFound);
    }

    #[tokio::test(start_paused = true)]
    async fn polls_once_per_interval_until_timeout() {
        let mut bundler = MockBundler::new();
        // t = 0, 10, 20, 30, 40, 50ms; the next sleep would cross the timeout
        bundler
            .expect_get_user_operation_receipt()
            .times(6)
            .returning(|_| Ok(None));
        let gateway = DispatchGateway::new(Arc::new(bundler), Address::zero());
        let start = Instant::now();
        let outcome = gateway
            .await_inclusion(
                H256::zero(),
                Duration::from_millis(50),
                Duration::from_millis(10),
            )
            .await;
        assert_eq!(outcome, InclusionOutcome::NotFound);
        assert_eq!(start.elapsed(), Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn poll_errors_do_not_stop_polling() {
        let mut bundler = MockBundler::new();
        let mut seq = mockall::Sequence::new();
        bundler
            .expect_get_user_operation_receipt()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(anyhow::anyhow!("rate limited")));
        bundler
            .expect_get_user_operation_receipt()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|hash| {
                Ok(Some(UserOperationReceipt {
                    user_op_hash: hash,
                    success: true,
                    transaction_hash: Some(H256::repeat_byte(0x02)),
                    raw: serde_json::Value::Null,
                }))
            });
        let gateway = DispatchGateway::new(Arc::new(bundler), Address::zero());
        let outcome = gateway
            .await_inclusion(
                H256::repeat_byte(0x01),
                Duration::from_secs(10),
                Duration::from_millis(10),
            )
            .await;
        match outcome {
            InclusionOutcome::Included(r) => assert_eq!(r.user_op_hash, H256::repeat_byte(0x01)),
            InclusionOutcome::NotFound => panic!("expected inclusion"),
        }
    }
}
