use std::sync::Arc;

use nyantebot_common::teloxide::prelude::UserId;

use crate::ledger::{Ledger, LedgerError, Operation};
use crate::stores::{
    generate_id, DistributionJournal, DistributionShare, PendingDistribution, Transfer,
    TransferKind, TransferTarget,
};

/// Splits `amount` into `recipients` shares that sum to `amount` exactly.
/// Integer division leaves a remainder of at most `recipients - 1` raw
/// units; the last share absorbs it.
pub fn split_equally(amount: u128, recipients: usize) -> Result<Vec<u128>, LedgerError> {
    if recipients == 0 {
        return Err(LedgerError::EmptyRecipientSet);
    }
    if amount == 0 {
        return Err(LedgerError::ZeroAmount);
    }
    let n = recipients as u128;
    let share = amount / n;
    let mut shares = vec![share; recipients];
    *shares.last_mut().expect("recipients >= 1") += amount - share * n;
    Ok(shares)
}

/// Applies multi-recipient distributions on top of the Ledger, bracketing
/// each one with a journal record for crash recovery.
pub struct Distributor {
    ledger: Arc<Ledger>,
    journal: Arc<dyn DistributionJournal>,
}

impl Distributor {
    pub fn new(ledger: Arc<Ledger>, journal: Arc<dyn DistributionJournal>) -> Self {
        Self { ledger, journal }
    }

    /// Debits `from` once and credits every recipient an equal share.
    /// Returns the applied shares in recipient order.
    pub async fn distribute(
        &self,
        from: UserId,
        recipients: &[UserId],
        amount: u128,
        op: Operation,
    ) -> Result<Vec<(UserId, u128)>, LedgerError> {
        let shares = split_equally(amount, recipients.len())?;
        let pairs: Vec<(UserId, u128)> = recipients.iter().copied().zip(shares).collect();
        let record = PendingDistribution {
            id: generate_id(),
            kind: op.transfer_kind(),
            from: Some(from),
            shares: pairs
                .iter()
                .map(|(user_id, amount)| DistributionShare {
                    user_id: *user_id,
                    amount: *amount,
                })
                .collect(),
        };
        let record_id = record.id.clone();
        self.journal.begin(record).await?;
        let result = self.ledger.transfer_many(from, &pairs, op).await;
        match result {
            Ok(()) => {
                for (user_id, amount) in &pairs {
                    if *amount == 0 {
                        continue;
                    }
                    let transfer = Transfer::new(
                        op.transfer_kind(),
                        Some(from),
                        TransferTarget::User(*user_id),
                        *amount,
                    );
                    if let Err(err) = self.ledger.record_transfer(transfer).await {
                        log::error!("Failed to record distribution transfer: {err:?}");
                    }
                }
                self.journal.end(&record_id).await?;
                Ok(pairs)
            }
            Err(err) => {
                // The ledger compensated already, the journal record is moot
                self.journal.end(&record_id).await?;
                Err(err)
            }
        }
    }

    /// Startup pass: any journal record still present marks a crash in the
    /// middle of a distribution. Surfaced for the operator, who has the full
    /// share list in the record to reconcile against the transfer history.
    pub async fn recover(&self) -> Result<(), LedgerError> {
        for record in self.journal.pending().await? {
            log::error!(
                "Distribution {} ({:?}, {} shares) was interrupted; reconcile before resuming",
                record.id,
                record.kind,
                record.shares.len()
            );
        }
        Ok(())
    }

    /// Pays out an already-staked pot: credits only, no debit.
    pub async fn distribute_pot(
        &self,
        recipients: &[UserId],
        amount: u128,
        kind: TransferKind,
    ) -> Result<Vec<(UserId, u128)>, LedgerError> {
        let shares = split_equally(amount, recipients.len())?;
        let pairs: Vec<(UserId, u128)> = recipients.iter().copied().zip(shares).collect();
        let record = PendingDistribution {
            id: generate_id(),
            kind,
            from: None,
            shares: pairs
                .iter()
                .map(|(user_id, amount)| DistributionShare {
                    user_id: *user_id,
                    amount: *amount,
                })
                .collect(),
        };
        let record_id = record.id.clone();
        self.journal.begin(record).await?;
        let result = self.ledger.credit_many(&pairs).await;
        match result {
            Ok(()) => {
                for (user_id, amount) in &pairs {
                    if *amount == 0 {
                        continue;
                    }
                    let transfer =
                        Transfer::new(kind, None, TransferTarget::User(*user_id), *amount);
                    if let Err(err) = self.ledger.record_transfer(transfer).await {
                        log::error!("Failed to record pot payout transfer: {err:?}");
                    }
                }
                self.journal.end(&record_id).await?;
                Ok(pairs)
            }
            Err(err) => {
                self.journal.end(&record_id).await?;
                Err(err)
            }
        }
    }
}

impl Operation {
    pub fn transfer_kind(&self) -> TransferKind {
        match self {
            Operation::Tip => TransferKind::Tip,
            Operation::Rain => TransferKind::Rain,
            Operation::Draw => TransferKind::Draw,
            Operation::Withdrawal => TransferKind::Withdrawal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Ledger;
    use crate::memory::{MemoryAccountStore, MemoryDistributionJournal, MemoryTransferStore};
    use nyantebot_common::utils::tokens::ONE_TOKEN;
    use proptest::prelude::*;

    #[test]
    fn splits_100_by_3_as_33_33_34() {
        assert_eq!(split_equally(100, 3).unwrap(), vec![33, 33, 34]);
    }

    #[test]
    fn split_edge_cases() {
        assert_eq!(split_equally(100, 1).unwrap(), vec![100]);
        assert_eq!(split_equally(2, 3).unwrap(), vec![0, 0, 2]);
        assert!(matches!(
            split_equally(100, 0).unwrap_err(),
            LedgerError::EmptyRecipientSet
        ));
        assert!(matches!(
            split_equally(0, 3).unwrap_err(),
            LedgerError::ZeroAmount
        ));
    }

    proptest! {
        #[test]
        fn split_always_sums_to_the_amount(amount in 1u128..u128::MAX / 2, n in 1usize..500) {
            let shares = split_equally(amount, n).unwrap();
            prop_assert_eq!(shares.len(), n);
            prop_assert_eq!(shares.iter().sum::<u128>(), amount);
            // Every share but the last is the floored quotient
            let share = amount / n as u128;
            prop_assert!(shares[..n - 1].iter().all(|s| *s == share));
        }
    }

    fn distributor() -> (Arc<Ledger>, Distributor, Arc<MemoryDistributionJournal>) {
        let ledger = Arc::new(Ledger::new(
            Arc::new(MemoryAccountStore::default()),
            Arc::new(MemoryTransferStore::default()),
        ));
        let journal = Arc::new(MemoryDistributionJournal::default());
        let distributor = Distributor::new(Arc::clone(&ledger), journal.clone());
        (ledger, distributor, journal)
    }

    #[tokio::test]
    async fn rain_distributes_exactly() {
        let (ledger, distributor, journal) = distributor();
        let sender = UserId(1);
        let recipients = [UserId(2), UserId(3), UserId(4)];
        ledger.credit(sender, 200 * ONE_TOKEN).await.unwrap();
        for user_id in recipients {
            ledger.ensure_account(user_id, None).await.unwrap();
        }
        let pairs = distributor
            .distribute(sender, &recipients, 100 * ONE_TOKEN, Operation::Rain)
            .await
            .unwrap();
        let credited: u128 = pairs.iter().map(|(_, amount)| amount).sum();
        assert_eq!(credited, 100 * ONE_TOKEN);
        assert_eq!(ledger.balance(sender).await.unwrap(), 100 * ONE_TOKEN);
        let mut total = 0;
        for user_id in recipients {
            total += ledger.balance(user_id).await.unwrap();
        }
        assert_eq!(total, 100 * ONE_TOKEN);
        // The journal record was consumed
        assert!(journal.pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rain_to_unknown_recipient_mutates_nothing() {
        let (ledger, distributor, _) = distributor();
        let sender = UserId(1);
        ledger.credit(sender, 200 * ONE_TOKEN).await.unwrap();
        ledger.ensure_account(UserId(2), None).await.unwrap();
        let err = distributor
            .distribute(
                sender,
                &[UserId(2), UserId(99)],
                100 * ONE_TOKEN,
                Operation::Rain,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::RecipientNotFound));
        assert_eq!(ledger.balance(sender).await.unwrap(), 200 * ONE_TOKEN);
        assert_eq!(ledger.balance(UserId(2)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn rain_with_insufficient_balance_fails_cleanly() {
        let (ledger, distributor, _) = distributor();
        let sender = UserId(1);
        ledger.credit(sender, ONE_TOKEN).await.unwrap();
        ledger.ensure_account(UserId(2), None).await.unwrap();
        let err = distributor
            .distribute(sender, &[UserId(2)], 100 * ONE_TOKEN, Operation::Rain)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientBalance { .. }));
        assert_eq!(ledger.balance(sender).await.unwrap(), ONE_TOKEN);
    }
}
