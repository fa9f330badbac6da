use std::sync::Arc;

use chrono::Utc;
use nyantebot_common::teloxide::prelude::UserId;
use nyantebot_common::utils::rpc::{Address, ChainClient};

use crate::ledger::{compute_fee, validate_amount, Ledger, LedgerError, Operation};
use crate::stores::{
    PendingWithdrawal, PendingWithdrawalStore, Transfer, TransferKind, TransferTarget,
    WithdrawalState,
};

/// Cap on how many withdrawals one multiTransfer batch carries.
const MAX_BATCH: usize = 50;

#[derive(Debug)]
pub struct WithdrawalQuote {
    pub amount: u128,
    pub fee: u128,
    pub gas: u128,
}

pub struct DrainOutcome {
    pub withdrawals: Vec<PendingWithdrawal>,
    /// Tx hash on success, the submission error otherwise.
    pub result: Result<String, LedgerError>,
}

/// The withdrawal pipeline. `enqueue` debits into an explicit pending record
/// keyed by an idempotency key; the payout worker drains queued records into
/// one batched chain submission and either finalizes or compensates them.
pub struct WithdrawalQueue {
    ledger: Arc<Ledger>,
    pending: Arc<dyn PendingWithdrawalStore>,
    chain: Arc<dyn ChainClient>,
}

impl WithdrawalQueue {
    pub fn new(
        ledger: Arc<Ledger>,
        pending: Arc<dyn PendingWithdrawalStore>,
        chain: Arc<dyn ChainClient>,
    ) -> Self {
        Self {
            ledger,
            pending,
            chain,
        }
    }

    /// Validates a withdrawal and prices it without mutating anything.
    pub async fn quote(
        &self,
        user_id: UserId,
        to: Address,
        amount: u128,
    ) -> Result<WithdrawalQuote, LedgerError> {
        validate_amount(amount, Operation::Withdrawal)?;
        let account = self
            .ledger
            .account(user_id)
            .await?
            .ok_or(LedgerError::InsufficientBalance {
                available: 0,
                required: amount,
            })?;
        if account.balance < amount {
            return Err(LedgerError::InsufficientBalance {
                available: account.balance,
                required: amount,
            });
        }
        let fee = compute_fee(amount);
        let gas = self
            .chain
            .estimate_fee(&[(to, amount - fee)])
            .await
            .map_err(|err| LedgerError::ChainUnavailable(err.to_string()))?;
        if account.bnb_fee_balance < gas {
            return Err(LedgerError::FeeFundInsufficient {
                available: account.bnb_fee_balance,
                required: gas,
            });
        }
        Ok(WithdrawalQuote { amount, fee, gas })
    }

    /// Debits the user and queues the withdrawal for the next payout batch.
    /// Returns `None` when the key already exists: a replayed confirmation
    /// callback hits the same key and must not debit twice.
    pub async fn enqueue(
        &self,
        key: String,
        user_id: UserId,
        to: Address,
        amount: u128,
    ) -> Result<Option<PendingWithdrawal>, LedgerError> {
        validate_amount(amount, Operation::Withdrawal)?;
        let fee = compute_fee(amount);
        let gas = self
            .chain
            .estimate_fee(&[(to, amount - fee)])
            .await
            .map_err(|err| LedgerError::ChainUnavailable(err.to_string()))?;
        let withdrawal = PendingWithdrawal {
            key: key.clone(),
            user_id,
            to,
            amount,
            fee,
            gas_charged: gas,
            state: WithdrawalState::Queued,
            created_at: Utc::now(),
        };
        if !self.pending.create(withdrawal.clone()).await? {
            return Ok(None);
        }
        if let Err(err) = self.ledger.withdraw_hold(user_id, amount, gas).await {
            if let Err(remove_err) = self.pending.remove(&key).await {
                log::error!("Failed to remove rejected withdrawal {key}: {remove_err:?}");
            }
            return Err(err);
        }
        Ok(Some(withdrawal))
    }

    /// Submits the next batch of queued withdrawals as one transaction.
    /// Returns `None` when the queue is empty. On submission failure every
    /// withdrawal in the batch is compensated in full.
    pub async fn drain(&self) -> Result<Option<DrainOutcome>, LedgerError> {
        let mut queued: Vec<PendingWithdrawal> = self
            .pending
            .all()
            .await?
            .into_iter()
            .filter(|w| w.state == WithdrawalState::Queued)
            .collect();
        if queued.is_empty() {
            return Ok(None);
        }
        queued.sort_by_key(|w| w.created_at);
        queued.truncate(MAX_BATCH);

        // Mark before submitting: a record stuck in Submitting after a crash
        // means the outcome is unknown
        for withdrawal in &mut queued {
            withdrawal.state = WithdrawalState::Submitting;
            self.pending.update(withdrawal.clone()).await?;
        }

        let transfers: Vec<(Address, u128)> = queued
            .iter()
            .map(|w| (w.to, w.amount - w.fee))
            .collect();
        match self.chain.submit(&transfers).await {
            Ok(tx_hash) => {
                for withdrawal in &queued {
                    let transfer = Transfer::new(
                        TransferKind::Withdrawal,
                        Some(withdrawal.user_id),
                        TransferTarget::External(withdrawal.to),
                        withdrawal.amount,
                    )
                    .with_fee(withdrawal.fee)
                    .with_tx_hash(tx_hash.clone());
                    if let Err(err) = self.ledger.record_transfer(transfer).await {
                        log::error!("Failed to record withdrawal transfer: {err:?}");
                    }
                    if let Err(err) = self.pending.remove(&withdrawal.key).await {
                        log::error!(
                            "Failed to remove finalized withdrawal {}: {err:?}",
                            withdrawal.key
                        );
                    }
                }
                Ok(Some(DrainOutcome {
                    withdrawals: queued,
                    result: Ok(tx_hash),
                }))
            }
            Err(err) => {
                let err = LedgerError::ChainSubmissionFailed(err.to_string());
                log::error!("Withdrawal batch submission failed: {err}");
                for withdrawal in &queued {
                    if let Err(refund_err) = self
                        .ledger
                        .withdraw_refund(
                            withdrawal.user_id,
                            withdrawal.amount,
                            withdrawal.gas_charged,
                        )
                        .await
                    {
                        log::error!(
                            "Failed to compensate withdrawal {}: {refund_err:?}",
                            withdrawal.key
                        );
                        continue;
                    }
                    if let Err(remove_err) = self.pending.remove(&withdrawal.key).await {
                        log::error!(
                            "Failed to remove compensated withdrawal {}: {remove_err:?}",
                            withdrawal.key
                        );
                    }
                }
                Ok(Some(DrainOutcome {
                    withdrawals: queued,
                    result: Err(err),
                }))
            }
        }
    }

    /// Startup pass over leftover pending records. Queued records resume with
    /// the next batch; Submitting records are surfaced for the operator, not
    /// auto-refunded, since their transaction may have landed.
    pub async fn recover(&self) -> Result<(), LedgerError> {
        for withdrawal in self.pending.all().await? {
            match withdrawal.state {
                WithdrawalState::Queued => {
                    log::info!(
                        "Resuming queued withdrawal {} for {}",
                        withdrawal.key,
                        withdrawal.user_id
                    );
                }
                WithdrawalState::Submitting => {
                    log::error!(
                        "Withdrawal {} for {} was mid-submission at shutdown; reconcile on chain before refunding",
                        withdrawal.key,
                        withdrawal.user_id
                    );
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{
        MemoryAccountStore, MemoryPendingWithdrawalStore, MemoryTransferStore,
    };
    use async_trait::async_trait;
    use nyantebot_common::utils::tokens::ONE_TOKEN;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    const ALICE: UserId = UserId(1);
    const GAS: u128 = 21_000 * 5_000_000_000;

    struct FakeChain {
        fail_submission: AtomicBool,
        submissions: AtomicUsize,
    }

    impl FakeChain {
        fn new() -> Self {
            Self {
                fail_submission: AtomicBool::new(false),
                submissions: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ChainClient for FakeChain {
        async fn estimate_fee(
            &self,
            _transfers: &[(Address, u128)],
        ) -> Result<u128, anyhow::Error> {
            Ok(GAS)
        }

        async fn submit(&self, _transfers: &[(Address, u128)]) -> Result<String, anyhow::Error> {
            self.submissions.fetch_add(1, Ordering::SeqCst);
            if self.fail_submission.load(Ordering::SeqCst) {
                Err(anyhow::anyhow!("nonce too low"))
            } else {
                Ok("0xdeadbeef".to_string())
            }
        }

        async fn token_balance(&self, _address: Address) -> Result<u128, anyhow::Error> {
            Ok(0)
        }

        async fn bnb_balance(&self, _address: Address) -> Result<u128, anyhow::Error> {
            Ok(0)
        }

        async fn new_deposit_account(&self) -> Result<Address, anyhow::Error> {
            Ok(Address([0x11; 20]))
        }
    }

    fn queue() -> (Arc<Ledger>, Arc<FakeChain>, WithdrawalQueue) {
        let ledger = Arc::new(Ledger::new(
            Arc::new(MemoryAccountStore::default()),
            Arc::new(MemoryTransferStore::default()),
        ));
        let chain = Arc::new(FakeChain::new());
        let queue = WithdrawalQueue::new(
            Arc::clone(&ledger),
            Arc::new(MemoryPendingWithdrawalStore::default()),
            chain.clone(),
        );
        (ledger, chain, queue)
    }

    fn dest() -> Address {
        "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed".parse().unwrap()
    }

    async fn fund(ledger: &Ledger, user_id: UserId, tokens: u128, wei: u128) {
        ledger
            .reconcile_deposit(user_id, tokens, wei)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn quote_applies_the_fee_tier() {
        let (ledger, _, queue) = queue();
        fund(&ledger, ALICE, 5_000_000 * ONE_TOKEN, GAS).await;
        let quote = queue
            .quote(ALICE, dest(), 1_500_000 * ONE_TOKEN)
            .await
            .unwrap();
        assert_eq!(quote.fee, 15_000 * ONE_TOKEN);
        assert_eq!(quote.gas, GAS);
    }

    #[tokio::test]
    async fn quote_rejects_small_and_unfunded_withdrawals() {
        let (ledger, _, queue) = queue();
        fund(&ledger, ALICE, 5_000_000 * ONE_TOKEN, 0).await;
        assert!(matches!(
            queue.quote(ALICE, dest(), 1_000 * ONE_TOKEN).await.unwrap_err(),
            LedgerError::BelowMinimum { .. }
        ));
        assert!(matches!(
            queue
                .quote(ALICE, dest(), 6_000_000 * ONE_TOKEN)
                .await
                .unwrap_err(),
            LedgerError::InsufficientBalance { .. }
        ));
        // Tokens are there but the BNB gas fund is empty
        assert!(matches!(
            queue
                .quote(ALICE, dest(), 1_500_000 * ONE_TOKEN)
                .await
                .unwrap_err(),
            LedgerError::FeeFundInsufficient { .. }
        ));
    }

    #[tokio::test]
    async fn successful_drain_finalizes_the_batch() {
        let (ledger, chain, queue) = queue();
        fund(&ledger, ALICE, 5_000_000 * ONE_TOKEN, GAS).await;
        queue
            .enqueue("wd-1".to_string(), ALICE, dest(), 1_500_000 * ONE_TOKEN)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            ledger.balance(ALICE).await.unwrap(),
            3_500_000 * ONE_TOKEN
        );
        let outcome = queue.drain().await.unwrap().unwrap();
        assert_eq!(outcome.result.unwrap(), "0xdeadbeef");
        assert_eq!(chain.submissions.load(Ordering::SeqCst), 1);
        // Balance stays debited, the pending record is gone
        assert_eq!(
            ledger.balance(ALICE).await.unwrap(),
            3_500_000 * ONE_TOKEN
        );
        assert!(queue.pending.all().await.unwrap().is_empty());
        assert!(queue.drain().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_submission_compensates_in_full() {
        let (ledger, chain, queue) = queue();
        chain.fail_submission.store(true, Ordering::SeqCst);
        fund(&ledger, ALICE, 5_000_000 * ONE_TOKEN, GAS).await;
        queue
            .enqueue("wd-1".to_string(), ALICE, dest(), 1_500_000 * ONE_TOKEN)
            .await
            .unwrap()
            .unwrap();
        let outcome = queue.drain().await.unwrap().unwrap();
        assert!(outcome.result.is_err());
        let account = ledger.account(ALICE).await.unwrap().unwrap();
        assert_eq!(account.balance, 5_000_000 * ONE_TOKEN);
        assert_eq!(account.bnb_fee_balance, GAS);
        assert!(queue.pending.all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn replayed_confirmation_does_not_double_debit() {
        let (ledger, _, queue) = queue();
        fund(&ledger, ALICE, 5_000_000 * ONE_TOKEN, 2 * GAS).await;
        let first = queue
            .enqueue("wd-1".to_string(), ALICE, dest(), 1_500_000 * ONE_TOKEN)
            .await
            .unwrap();
        assert!(first.is_some());
        let replay = queue
            .enqueue("wd-1".to_string(), ALICE, dest(), 1_500_000 * ONE_TOKEN)
            .await
            .unwrap();
        assert!(replay.is_none());
        assert_eq!(
            ledger.balance(ALICE).await.unwrap(),
            3_500_000 * ONE_TOKEN
        );
    }

    #[tokio::test]
    async fn rejected_enqueue_leaves_no_pending_record() {
        let (ledger, _, queue) = queue();
        fund(&ledger, ALICE, 2_000_000 * ONE_TOKEN, 0).await;
        let err = queue
            .enqueue("wd-1".to_string(), ALICE, dest(), 1_500_000 * ONE_TOKEN)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::FeeFundInsufficient { .. }));
        assert!(queue.pending.all().await.unwrap().is_empty());
        assert_eq!(
            ledger.balance(ALICE).await.unwrap(),
            2_000_000 * ONE_TOKEN
        );
    }

    #[tokio::test]
    async fn drain_batches_multiple_withdrawals_into_one_submission() {
        let (ledger, chain, queue) = queue();
        let bob = UserId(2);
        fund(&ledger, ALICE, 5_000_000 * ONE_TOKEN, GAS).await;
        fund(&ledger, bob, 5_000_000 * ONE_TOKEN, GAS).await;
        queue
            .enqueue("wd-1".to_string(), ALICE, dest(), 1_000_000 * ONE_TOKEN)
            .await
            .unwrap()
            .unwrap();
        queue
            .enqueue("wd-2".to_string(), bob, dest(), 2_000_000 * ONE_TOKEN)
            .await
            .unwrap()
            .unwrap();
        let outcome = queue.drain().await.unwrap().unwrap();
        assert_eq!(outcome.withdrawals.len(), 2);
        assert_eq!(chain.submissions.load(Ordering::SeqCst), 1);
    }
}
