use std::sync::Arc;

use dashmap::DashMap;
use nyantebot_common::teloxide::prelude::UserId;
use nyantebot_common::utils::rpc::Address;
use nyantebot_common::utils::tokens::{format_bnb, format_tokens, ONE_TOKEN};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::stores::{Account, AccountStore, Transfer, TransferStore};

/// Withdrawals below this amount are rejected; at or above it the 1% fee
/// tier applies.
pub const WITHDRAWABLE_THRESHOLD: u128 = 1_000_000 * ONE_TOKEN;

pub const FEE_DIVISOR: u128 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Tip,
    Rain,
    Draw,
    Withdrawal,
}

impl Operation {
    pub fn minimum(&self) -> u128 {
        match self {
            Operation::Tip | Operation::Rain | Operation::Draw => ONE_TOKEN,
            Operation::Withdrawal => WITHDRAWABLE_THRESHOLD,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Operation::Tip => "tip",
            Operation::Rain => "rain",
            Operation::Draw => "draw",
            Operation::Withdrawal => "withdrawal",
        }
    }
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("insufficient balance: have {available}, need {required}")]
    InsufficientBalance { available: u128, required: u128 },
    #[error("minimum {op} amount is {minimum}")]
    BelowMinimum { op: &'static str, minimum: u128 },
    #[error("amount must be positive")]
    ZeroAmount,
    #[error("recipient not found")]
    RecipientNotFound,
    #[error("no recipients to distribute to")]
    EmptyRecipientSet,
    #[error("no participants in this round")]
    NoParticipants,
    #[error("the round is not open")]
    RoundClosed,
    #[error("invalid address")]
    InvalidAddress,
    #[error("insufficient BNB fee balance: have {available}, need {required}")]
    FeeFundInsufficient { available: u128, required: u128 },
    #[error("chain submission failed: {0}")]
    ChainSubmissionFailed(String),
    #[error("chain RPC unavailable: {0}")]
    ChainUnavailable(String),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl LedgerError {
    /// The reply shown to the user, or `None` for internal failures that
    /// only belong in the logs.
    pub fn user_message(&self) -> Option<String> {
        match self {
            LedgerError::InsufficientBalance { available, .. } => Some(format!(
                "Insufficient balance. You have {}.",
                format_tokens(*available)
            )),
            LedgerError::BelowMinimum { op, minimum } => Some(format!(
                "Minimum {op} amount is {}.",
                format_tokens(*minimum)
            )),
            LedgerError::ZeroAmount => Some("Amount must be positive.".to_string()),
            LedgerError::RecipientNotFound => {
                Some("Recipient not found. They need to message the bot first.".to_string())
            }
            LedgerError::EmptyRecipientSet => {
                Some("Nobody has been active here recently.".to_string())
            }
            LedgerError::NoParticipants => Some("No participants in this round.".to_string()),
            LedgerError::RoundClosed => {
                Some("This round is being settled, try again later.".to_string())
            }
            LedgerError::InvalidAddress => {
                Some("That doesn't look like a valid BSC address.".to_string())
            }
            LedgerError::FeeFundInsufficient { available, required } => Some(format!(
                "Not enough BNB for gas: you have {}, the transaction needs {}. Deposit BNB to your deposit address.",
                format_bnb(*available),
                format_bnb(*required)
            )),
            LedgerError::ChainSubmissionFailed(_) => {
                Some("The chain transaction failed. Your balance was not touched.".to_string())
            }
            LedgerError::ChainUnavailable(_) => {
                Some("The chain RPC is unavailable right now, try again later.".to_string())
            }
            LedgerError::Store(_) => None,
        }
    }
}

pub fn validate_amount(amount: u128, op: Operation) -> Result<(), LedgerError> {
    if amount == 0 {
        return Err(LedgerError::ZeroAmount);
    }
    if amount < op.minimum() {
        return Err(LedgerError::BelowMinimum {
            op: op.name(),
            minimum: op.minimum(),
        });
    }
    Ok(())
}

/// 1% above the withdrawable threshold, zero below it. Computed at the full
/// 18-decimal precision of the raw unit, floored.
pub fn compute_fee(amount: u128) -> u128 {
    if amount < WITHDRAWABLE_THRESHOLD {
        0
    } else {
        amount / FEE_DIVISOR
    }
}

/// Single source of truth for balances. Every mutation happens under the
/// account's async mutex; multi-account operations take their locks in
/// ascending user-id order so they can't deadlock each other.
pub struct Ledger {
    accounts: Arc<dyn AccountStore>,
    transfers: Arc<dyn TransferStore>,
    locks: DashMap<UserId, Arc<Mutex<()>>>,
}

impl Ledger {
    pub fn new(accounts: Arc<dyn AccountStore>, transfers: Arc<dyn TransferStore>) -> Self {
        Self {
            accounts,
            transfers,
            locks: DashMap::new(),
        }
    }

    fn lock_handle(&self, user_id: UserId) -> Arc<Mutex<()>> {
        self.locks
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn lock_all(&self, user_ids: &[UserId]) -> Vec<OwnedMutexGuard<()>> {
        let mut sorted = user_ids.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        let mut guards = Vec::with_capacity(sorted.len());
        for user_id in sorted {
            guards.push(self.lock_handle(user_id).lock_owned().await);
        }
        guards
    }

    pub async fn account(&self, user_id: UserId) -> Result<Option<Account>, LedgerError> {
        Ok(self.accounts.get(user_id).await?)
    }

    pub async fn balance(&self, user_id: UserId) -> Result<u128, LedgerError> {
        Ok(self
            .accounts
            .get(user_id)
            .await?
            .map(|a| a.balance)
            .unwrap_or(0))
    }

    /// Creates the account on first contact and keeps the username current.
    pub async fn ensure_account(
        &self,
        user_id: UserId,
        username: Option<&str>,
    ) -> Result<(), LedgerError> {
        let _guard = self.lock_handle(user_id).lock_owned().await;
        let existing = self.accounts.get(user_id).await?;
        let username = username.map(|u| u.to_string());
        match existing {
            Some(account) if account.username == username => Ok(()),
            Some(mut account) => {
                account.username = username;
                Ok(self.accounts.put(user_id, account).await?)
            }
            None => {
                let account = Account {
                    username,
                    ..Account::default()
                };
                Ok(self.accounts.put(user_id, account).await?)
            }
        }
    }

    /// Assigns a deposit address if the account doesn't have one yet and
    /// returns the address on record. The loser of a racing double `/deposit`
    /// leaves an unused keystore account behind, which is harmless.
    pub async fn assign_deposit_address(
        &self,
        user_id: UserId,
        address: Address,
    ) -> Result<Address, LedgerError> {
        let _guard = self.lock_handle(user_id).lock_owned().await;
        let mut account = self.accounts.get(user_id).await?.unwrap_or_default();
        if let Some(existing) = account.deposit_address {
            return Ok(existing);
        }
        account.deposit_address = Some(address);
        self.accounts.put(user_id, account).await?;
        Ok(address)
    }

    pub async fn credit(&self, user_id: UserId, amount: u128) -> Result<(), LedgerError> {
        if amount == 0 {
            return Err(LedgerError::ZeroAmount);
        }
        let _guard = self.lock_handle(user_id).lock_owned().await;
        self.credit_locked(user_id, amount).await
    }

    pub async fn debit(
        &self,
        user_id: UserId,
        amount: u128,
        op: Operation,
    ) -> Result<(), LedgerError> {
        validate_amount(amount, op)?;
        let _guard = self.lock_handle(user_id).lock_owned().await;
        self.debit_locked(user_id, amount).await
    }

    /// Atomic debit + credit. The recipient must already have an account;
    /// that is validated before anything is written.
    pub async fn transfer(
        &self,
        from: UserId,
        to: UserId,
        amount: u128,
        op: Operation,
    ) -> Result<(), LedgerError> {
        validate_amount(amount, op)?;
        if self.accounts.get(to).await?.is_none() {
            return Err(LedgerError::RecipientNotFound);
        }
        let _guards = self.lock_all(&[from, to]).await;
        self.debit_locked(from, amount).await?;
        if let Err(err) = self.credit_locked(to, amount).await {
            log::error!("Credit of {amount} to {to} failed after debit, compensating: {err:?}");
            self.credit_locked(from, amount).await?;
            return Err(err);
        }
        Ok(())
    }

    /// One debit fanned out into many credits, all inside one lock-ordered
    /// critical section. Zero shares (possible when the amount doesn't reach
    /// one raw unit per recipient) are skipped.
    pub async fn transfer_many(
        &self,
        from: UserId,
        shares: &[(UserId, u128)],
        op: Operation,
    ) -> Result<(), LedgerError> {
        let total = shares
            .iter()
            .try_fold(0u128, |acc, (_, amount)| acc.checked_add(*amount))
            .ok_or_else(|| LedgerError::Store(anyhow::anyhow!("distribution total overflow")))?;
        validate_amount(total, op)?;
        for (user_id, _) in shares {
            if self.accounts.get(*user_id).await?.is_none() {
                return Err(LedgerError::RecipientNotFound);
            }
        }
        let mut ids: Vec<UserId> = shares.iter().map(|(user_id, _)| *user_id).collect();
        ids.push(from);
        let _guards = self.lock_all(&ids).await;
        self.debit_locked(from, total).await?;
        let mut applied: Vec<(UserId, u128)> = Vec::new();
        for (user_id, amount) in shares {
            if *amount == 0 {
                continue;
            }
            if let Err(err) = self.credit_locked(*user_id, *amount).await {
                log::error!("Distribution credit to {user_id} failed, rolling back: {err:?}");
                self.rollback_credits(&applied).await;
                if let Err(refund_err) = self.credit_locked(from, total).await {
                    log::error!("Failed to refund {from} after distribution rollback: {refund_err:?}");
                }
                return Err(err);
            }
            applied.push((*user_id, *amount));
        }
        Ok(())
    }

    /// Credits without a paired debit, used to pay out a draw pot that was
    /// staked earlier.
    pub async fn credit_many(&self, shares: &[(UserId, u128)]) -> Result<(), LedgerError> {
        let ids: Vec<UserId> = shares.iter().map(|(user_id, _)| *user_id).collect();
        let _guards = self.lock_all(&ids).await;
        let mut applied: Vec<(UserId, u128)> = Vec::new();
        for (user_id, amount) in shares {
            if *amount == 0 {
                continue;
            }
            if let Err(err) = self.credit_locked(*user_id, *amount).await {
                log::error!("Pot payout credit to {user_id} failed, rolling back: {err:?}");
                self.rollback_credits(&applied).await;
                return Err(err);
            }
            applied.push((*user_id, *amount));
        }
        Ok(())
    }

    /// Debits the withdrawal amount and the gas charge together, re-checking
    /// both funds under the lock. Either both are taken or neither.
    pub async fn withdraw_hold(
        &self,
        user_id: UserId,
        amount: u128,
        gas: u128,
    ) -> Result<(), LedgerError> {
        validate_amount(amount, Operation::Withdrawal)?;
        let _guard = self.lock_handle(user_id).lock_owned().await;
        let mut account =
            self.accounts
                .get(user_id)
                .await?
                .ok_or(LedgerError::InsufficientBalance {
                    available: 0,
                    required: amount,
                })?;
        let balance =
            account
                .balance
                .checked_sub(amount)
                .ok_or(LedgerError::InsufficientBalance {
                    available: account.balance,
                    required: amount,
                })?;
        let bnb_fee_balance = account.bnb_fee_balance.checked_sub(gas).ok_or(
            LedgerError::FeeFundInsufficient {
                available: account.bnb_fee_balance,
                required: gas,
            },
        )?;
        account.balance = balance;
        account.bnb_fee_balance = bnb_fee_balance;
        self.accounts.put(user_id, account).await?;
        Ok(())
    }

    /// Compensating write for a withdrawal whose chain submission failed.
    pub async fn withdraw_refund(
        &self,
        user_id: UserId,
        amount: u128,
        gas: u128,
    ) -> Result<(), LedgerError> {
        let _guard = self.lock_handle(user_id).lock_owned().await;
        let mut account = self.accounts.get(user_id).await?.unwrap_or_default();
        account.balance = account
            .balance
            .checked_add(amount)
            .ok_or_else(|| LedgerError::Store(anyhow::anyhow!("balance overflow on refund")))?;
        account.bnb_fee_balance = account
            .bnb_fee_balance
            .checked_add(gas)
            .ok_or_else(|| LedgerError::Store(anyhow::anyhow!("fee balance overflow on refund")))?;
        self.accounts.put(user_id, account).await?;
        Ok(())
    }

    /// Credits the delta between the observed on-chain balances of the
    /// user's deposit address and the recorded high-water marks. Idempotent:
    /// re-observing the same balances credits nothing.
    pub async fn reconcile_deposit(
        &self,
        user_id: UserId,
        observed_token: u128,
        observed_bnb: u128,
    ) -> Result<(u128, u128), LedgerError> {
        let _guard = self.lock_handle(user_id).lock_owned().await;
        let mut account = self.accounts.get(user_id).await?.unwrap_or_default();
        let token_delta = observed_token.saturating_sub(account.token_deposited);
        let bnb_delta = observed_bnb.saturating_sub(account.bnb_deposited);
        if token_delta == 0 && bnb_delta == 0 {
            return Ok((0, 0));
        }
        account.balance = account
            .balance
            .checked_add(token_delta)
            .ok_or_else(|| LedgerError::Store(anyhow::anyhow!("balance overflow on deposit")))?;
        account.bnb_fee_balance = account.bnb_fee_balance.checked_add(bnb_delta).ok_or_else(
            || LedgerError::Store(anyhow::anyhow!("fee balance overflow on deposit")),
        )?;
        account.token_deposited = observed_token;
        account.bnb_deposited = observed_bnb;
        self.accounts.put(user_id, account).await?;
        Ok((token_delta, bnb_delta))
    }

    pub async fn record_transfer(&self, transfer: Transfer) -> Result<(), LedgerError> {
        Ok(self.transfers.append(transfer).await?)
    }

    async fn credit_locked(&self, user_id: UserId, amount: u128) -> Result<(), LedgerError> {
        let mut account = self.accounts.get(user_id).await?.unwrap_or_default();
        account.balance = account
            .balance
            .checked_add(amount)
            .ok_or_else(|| LedgerError::Store(anyhow::anyhow!("balance overflow")))?;
        self.accounts.put(user_id, account).await?;
        Ok(())
    }

    async fn debit_locked(&self, user_id: UserId, amount: u128) -> Result<(), LedgerError> {
        let mut account =
            self.accounts
                .get(user_id)
                .await?
                .ok_or(LedgerError::InsufficientBalance {
                    available: 0,
                    required: amount,
                })?;
        account.balance =
            account
                .balance
                .checked_sub(amount)
                .ok_or(LedgerError::InsufficientBalance {
                    available: account.balance,
                    required: amount,
                })?;
        self.accounts.put(user_id, account).await?;
        Ok(())
    }

    async fn rollback_credits(&self, applied: &[(UserId, u128)]) {
        for (user_id, amount) in applied {
            if let Err(err) = self.debit_locked(*user_id, *amount).await {
                log::error!("Failed to roll back credit of {amount} to {user_id}: {err:?}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryAccountStore, MemoryTransferStore};
    use crate::stores::{TransferKind, TransferTarget};

    fn ledger() -> (Arc<Ledger>, Arc<MemoryTransferStore>) {
        let transfers = Arc::new(MemoryTransferStore::default());
        let ledger = Arc::new(Ledger::new(
            Arc::new(MemoryAccountStore::default()),
            transfers.clone(),
        ));
        (ledger, transfers)
    }

    const ALICE: UserId = UserId(1);
    const BOB: UserId = UserId(2);

    #[tokio::test]
    async fn credit_then_debit() {
        let (ledger, _) = ledger();
        ledger.credit(ALICE, 5 * ONE_TOKEN).await.unwrap();
        assert_eq!(ledger.balance(ALICE).await.unwrap(), 5 * ONE_TOKEN);
        ledger.debit(ALICE, 2 * ONE_TOKEN, Operation::Tip).await.unwrap();
        assert_eq!(ledger.balance(ALICE).await.unwrap(), 3 * ONE_TOKEN);
    }

    #[tokio::test]
    async fn debit_rejections_leave_balance_untouched() {
        let (ledger, _) = ledger();
        ledger.credit(ALICE, 5 * ONE_TOKEN).await.unwrap();
        // Tip of 10 from a balance of 5 fails the same way every time
        for _ in 0..3 {
            let err = ledger
                .debit(ALICE, 10 * ONE_TOKEN, Operation::Tip)
                .await
                .unwrap_err();
            assert!(matches!(err, LedgerError::InsufficientBalance { .. }));
            assert_eq!(ledger.balance(ALICE).await.unwrap(), 5 * ONE_TOKEN);
        }
    }

    #[tokio::test]
    async fn debit_below_minimum() {
        let (ledger, _) = ledger();
        ledger.credit(ALICE, 5 * ONE_TOKEN).await.unwrap();
        let err = ledger
            .debit(ALICE, ONE_TOKEN / 2, Operation::Tip)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::BelowMinimum { .. }));
        assert_eq!(ledger.balance(ALICE).await.unwrap(), 5 * ONE_TOKEN);
        assert!(matches!(
            ledger.debit(ALICE, 0, Operation::Tip).await.unwrap_err(),
            LedgerError::ZeroAmount
        ));
    }

    #[tokio::test]
    async fn transfer_to_unknown_recipient_mutates_nothing() {
        let (ledger, _) = ledger();
        ledger.credit(ALICE, 5 * ONE_TOKEN).await.unwrap();
        let err = ledger
            .transfer(ALICE, BOB, 2 * ONE_TOKEN, Operation::Tip)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::RecipientNotFound));
        assert_eq!(ledger.balance(ALICE).await.unwrap(), 5 * ONE_TOKEN);
        assert_eq!(ledger.balance(BOB).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn transfer_moves_the_exact_amount() {
        let (ledger, _) = ledger();
        ledger.credit(ALICE, 5 * ONE_TOKEN).await.unwrap();
        ledger.ensure_account(BOB, None).await.unwrap();
        ledger
            .transfer(ALICE, BOB, 2 * ONE_TOKEN, Operation::Tip)
            .await
            .unwrap();
        assert_eq!(ledger.balance(ALICE).await.unwrap(), 3 * ONE_TOKEN);
        assert_eq!(ledger.balance(BOB).await.unwrap(), 2 * ONE_TOKEN);
    }

    #[tokio::test]
    async fn fee_tiers() {
        assert_eq!(compute_fee(999_999 * ONE_TOKEN), 0);
        assert_eq!(compute_fee(1_000_000 * ONE_TOKEN), 10_000 * ONE_TOKEN);
        assert_eq!(compute_fee(1_500_000 * ONE_TOKEN), 15_000 * ONE_TOKEN);
    }

    #[tokio::test]
    async fn withdrawal_scenario_from_five_million() {
        let (ledger, _) = ledger();
        ledger.credit(ALICE, 5_000_000 * ONE_TOKEN).await.unwrap();
        let amount = 1_500_000 * ONE_TOKEN;
        let fee = compute_fee(amount);
        assert_eq!(fee, 15_000 * ONE_TOKEN);
        ledger.withdraw_hold(ALICE, amount, 0).await.unwrap();
        // The fee comes out of the transferred amount, not the balance again
        assert_eq!(ledger.balance(ALICE).await.unwrap(), 3_500_000 * ONE_TOKEN);
    }

    #[tokio::test]
    async fn withdraw_hold_needs_both_funds() {
        let (ledger, _) = ledger();
        ledger.credit(ALICE, 2_000_000 * ONE_TOKEN).await.unwrap();
        let err = ledger
            .withdraw_hold(ALICE, 1_000_000 * ONE_TOKEN, 100)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::FeeFundInsufficient { .. }));
        // Neither fund was touched
        assert_eq!(ledger.balance(ALICE).await.unwrap(), 2_000_000 * ONE_TOKEN);
        ledger.reconcile_deposit(ALICE, 0, 100).await.unwrap();
        ledger
            .withdraw_hold(ALICE, 1_000_000 * ONE_TOKEN, 100)
            .await
            .unwrap();
        assert_eq!(ledger.balance(ALICE).await.unwrap(), 1_000_000 * ONE_TOKEN);
        let account = ledger.account(ALICE).await.unwrap().unwrap();
        assert_eq!(account.bnb_fee_balance, 0);
    }

    #[tokio::test]
    async fn refund_restores_both_funds() {
        let (ledger, _) = ledger();
        ledger.credit(ALICE, 1_000_000 * ONE_TOKEN).await.unwrap();
        ledger.reconcile_deposit(ALICE, 0, 500).await.unwrap();
        ledger
            .withdraw_hold(ALICE, 1_000_000 * ONE_TOKEN, 500)
            .await
            .unwrap();
        ledger
            .withdraw_refund(ALICE, 1_000_000 * ONE_TOKEN, 500)
            .await
            .unwrap();
        let account = ledger.account(ALICE).await.unwrap().unwrap();
        assert_eq!(account.balance, 1_000_000 * ONE_TOKEN);
        assert_eq!(account.bnb_fee_balance, 500);
    }

    #[tokio::test]
    async fn deposits_reconcile_idempotently() {
        let (ledger, _) = ledger();
        let (token, bnb) = ledger
            .reconcile_deposit(ALICE, 7 * ONE_TOKEN, 1_000)
            .await
            .unwrap();
        assert_eq!((token, bnb), (7 * ONE_TOKEN, 1_000));
        // Same observation again credits nothing
        let (token, bnb) = ledger
            .reconcile_deposit(ALICE, 7 * ONE_TOKEN, 1_000)
            .await
            .unwrap();
        assert_eq!((token, bnb), (0, 0));
        let (token, _) = ledger
            .reconcile_deposit(ALICE, 9 * ONE_TOKEN, 1_000)
            .await
            .unwrap();
        assert_eq!(token, 2 * ONE_TOKEN);
        assert_eq!(ledger.balance(ALICE).await.unwrap(), 9 * ONE_TOKEN);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_debits_never_go_negative() {
        let (ledger, _) = ledger();
        ledger.credit(ALICE, 10 * ONE_TOKEN).await.unwrap();
        let mut handles = Vec::new();
        for _ in 0..20 {
            let ledger = Arc::clone(&ledger);
            handles.push(tokio::spawn(async move {
                ledger.debit(ALICE, ONE_TOKEN, Operation::Tip).await.is_ok()
            }));
        }
        let mut succeeded = 0;
        for handle in handles {
            if handle.await.unwrap() {
                succeeded += 1;
            }
        }
        assert_eq!(succeeded, 10);
        assert_eq!(ledger.balance(ALICE).await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_transfers_conserve_total() {
        let (ledger, _) = ledger();
        ledger.credit(ALICE, 50 * ONE_TOKEN).await.unwrap();
        ledger.credit(BOB, 50 * ONE_TOKEN).await.unwrap();
        let mut handles = Vec::new();
        for i in 0..30 {
            let ledger = Arc::clone(&ledger);
            let (from, to) = if i % 2 == 0 { (ALICE, BOB) } else { (BOB, ALICE) };
            handles.push(tokio::spawn(async move {
                let _ = ledger.transfer(from, to, ONE_TOKEN, Operation::Tip).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let total =
            ledger.balance(ALICE).await.unwrap() + ledger.balance(BOB).await.unwrap();
        assert_eq!(total, 100 * ONE_TOKEN);
    }

    #[tokio::test]
    async fn recorded_transfers_are_appended() {
        let (ledger, transfers) = ledger();
        ledger.credit(ALICE, 5 * ONE_TOKEN).await.unwrap();
        ledger.ensure_account(BOB, None).await.unwrap();
        ledger
            .transfer(ALICE, BOB, 2 * ONE_TOKEN, Operation::Tip)
            .await
            .unwrap();
        ledger
            .record_transfer(Transfer::new(
                TransferKind::Tip,
                Some(ALICE),
                TransferTarget::User(BOB),
                2 * ONE_TOKEN,
            ))
            .await
            .unwrap();
        let recorded = transfers.transfers().await;
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].amount, 2 * ONE_TOKEN);
        assert_eq!(recorded[0].kind, TransferKind::Tip);
    }
}
