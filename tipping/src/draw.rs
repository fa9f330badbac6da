use std::sync::Arc;

use itertools::Itertools;
use nyantebot_common::teloxide::prelude::{ChatId, UserId};

use crate::distributor::Distributor;
use crate::ledger::{Ledger, LedgerError, Operation};
use crate::stores::{DrawEntry, DrawRound, DrawState, DrawStore, TransferKind};

#[derive(Debug)]
pub struct SettleOutcome {
    pub pot: u128,
    pub payouts: Vec<(UserId, u128)>,
}

/// Draw rounds, one per chat. A round moves `Open -> Settling -> Closed` and
/// never back; a closed round is replaced by a fresh one on the next entry.
pub struct Draws {
    store: Arc<dyn DrawStore>,
    ledger: Arc<Ledger>,
    distributor: Arc<Distributor>,
}

impl Draws {
    pub fn new(
        store: Arc<dyn DrawStore>,
        ledger: Arc<Ledger>,
        distributor: Arc<Distributor>,
    ) -> Self {
        Self {
            store,
            ledger,
            distributor,
        }
    }

    pub async fn round(&self, chat_id: ChatId) -> Result<Option<DrawRound>, LedgerError> {
        Ok(self.store.get(chat_id).await?)
    }

    /// Stakes `amount` into the chat's open round, creating the round if
    /// there is none. The first entrant becomes the initiator.
    pub async fn enter(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        amount: u128,
    ) -> Result<DrawRound, LedgerError> {
        let mut round = match self.store.get(chat_id).await? {
            Some(round) if round.state == DrawState::Open => round,
            Some(round) if round.state == DrawState::Settling => {
                return Err(LedgerError::RoundClosed)
            }
            _ => DrawRound::new(chat_id, user_id),
        };
        self.ledger.debit(user_id, amount, Operation::Draw).await?;
        round.entries.push(DrawEntry { user_id, amount });
        if let Err(err) = self.store.put(chat_id, round.clone()).await {
            // The stake was taken but the entry didn't commit
            log::error!("Failed to record draw entry, refunding stake: {err:?}");
            if let Err(refund_err) = self.ledger.credit(user_id, amount).await {
                log::error!("Failed to refund draw stake of {amount} to {user_id}: {refund_err:?}");
            }
            return Err(err.into());
        }
        Ok(round)
    }

    /// Settles the round: distributes the pot equally among the entrants.
    /// A round with no entries closes immediately with `NoParticipants`.
    pub async fn settle(&self, chat_id: ChatId) -> Result<SettleOutcome, LedgerError> {
        let Some(mut round) = self.store.get(chat_id).await? else {
            return Err(LedgerError::NoParticipants);
        };
        if round.state != DrawState::Open {
            return Err(LedgerError::RoundClosed);
        }
        if round.entries.is_empty() {
            round.state = DrawState::Closed;
            self.store.put(chat_id, round).await?;
            return Err(LedgerError::NoParticipants);
        }
        round.state = DrawState::Settling;
        self.store.put(chat_id, round.clone()).await?;

        let recipients: Vec<UserId> = round.entries.iter().map(|e| e.user_id).unique().collect();
        let pot = round.pot();
        let payouts = match self
            .distributor
            .distribute_pot(&recipients, pot, TransferKind::Draw)
            .await
        {
            Ok(payouts) => payouts,
            Err(err) => {
                // No way back to Open; the round stays in Settling for the
                // operator, the distribution journal has the full picture
                log::error!("Draw settlement for {chat_id} failed mid-distribution: {err:?}");
                return Err(err);
            }
        };

        round.state = DrawState::Closed;
        self.store.put(chat_id, round).await?;
        Ok(SettleOutcome { pot, payouts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{
        MemoryAccountStore, MemoryDistributionJournal, MemoryDrawStore, MemoryTransferStore,
    };
    use nyantebot_common::utils::tokens::ONE_TOKEN;

    const CHAT: ChatId = ChatId(-100);

    fn draws() -> (Arc<Ledger>, Draws) {
        let ledger = Arc::new(Ledger::new(
            Arc::new(MemoryAccountStore::default()),
            Arc::new(MemoryTransferStore::default()),
        ));
        let distributor = Arc::new(Distributor::new(
            Arc::clone(&ledger),
            Arc::new(MemoryDistributionJournal::default()),
        ));
        let draws = Draws::new(
            Arc::new(MemoryDrawStore::default()),
            Arc::clone(&ledger),
            distributor,
        );
        (ledger, draws)
    }

    #[tokio::test]
    async fn entering_stakes_the_amount() {
        let (ledger, draws) = draws();
        ledger.credit(UserId(1), 10 * ONE_TOKEN).await.unwrap();
        let round = draws.enter(CHAT, UserId(1), 3 * ONE_TOKEN).await.unwrap();
        assert_eq!(round.state, DrawState::Open);
        assert_eq!(round.initiator, UserId(1));
        assert_eq!(round.pot(), 3 * ONE_TOKEN);
        assert_eq!(ledger.balance(UserId(1)).await.unwrap(), 7 * ONE_TOKEN);
    }

    #[tokio::test]
    async fn entering_without_funds_fails() {
        let (ledger, draws) = draws();
        ledger.credit(UserId(1), ONE_TOKEN).await.unwrap();
        let err = draws
            .enter(CHAT, UserId(1), 5 * ONE_TOKEN)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientBalance { .. }));
        assert!(draws.round(CHAT).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn settling_splits_the_pot_exactly() {
        let (ledger, draws) = draws();
        for user_id in [UserId(1), UserId(2), UserId(3)] {
            ledger.credit(user_id, 100 * ONE_TOKEN).await.unwrap();
        }
        draws.enter(CHAT, UserId(1), 40 * ONE_TOKEN).await.unwrap();
        draws.enter(CHAT, UserId(2), 30 * ONE_TOKEN).await.unwrap();
        draws.enter(CHAT, UserId(3), 30 * ONE_TOKEN).await.unwrap();

        let outcome = draws.settle(CHAT).await.unwrap();
        assert_eq!(outcome.pot, 100 * ONE_TOKEN);
        let paid: u128 = outcome.payouts.iter().map(|(_, amount)| amount).sum();
        assert_eq!(paid, 100 * ONE_TOKEN);

        let round = draws.round(CHAT).await.unwrap().unwrap();
        assert_eq!(round.state, DrawState::Closed);

        // Money is conserved across the whole round
        let mut total = 0;
        for user_id in [UserId(1), UserId(2), UserId(3)] {
            total += ledger.balance(user_id).await.unwrap();
        }
        assert_eq!(total, 300 * ONE_TOKEN);
    }

    #[tokio::test]
    async fn settling_an_empty_round_reports_no_participants() {
        let (ledger, draws) = draws();
        // A round that exists but has no entries closes with no payout
        draws
            .store
            .put(CHAT, DrawRound::new(CHAT, UserId(1)))
            .await
            .unwrap();
        let err = draws.settle(CHAT).await.unwrap_err();
        assert!(matches!(err, LedgerError::NoParticipants));
        let round = draws.round(CHAT).await.unwrap().unwrap();
        assert_eq!(round.state, DrawState::Closed);
        assert_eq!(ledger.balance(UserId(1)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn settling_a_missing_round_reports_no_participants() {
        let (_, draws) = draws();
        assert!(matches!(
            draws.settle(CHAT).await.unwrap_err(),
            LedgerError::NoParticipants
        ));
    }

    #[tokio::test]
    async fn closed_rounds_never_reopen() {
        let (ledger, draws) = draws();
        ledger.credit(UserId(1), 10 * ONE_TOKEN).await.unwrap();
        draws.enter(CHAT, UserId(1), 2 * ONE_TOKEN).await.unwrap();
        draws.settle(CHAT).await.unwrap();
        assert!(matches!(
            draws.settle(CHAT).await.unwrap_err(),
            LedgerError::RoundClosed
        ));
        // A new entry starts a fresh round instead of reviving the old one
        let round = draws.enter(CHAT, UserId(1), 2 * ONE_TOKEN).await.unwrap();
        assert_eq!(round.state, DrawState::Open);
        assert_eq!(round.entries.len(), 1);
    }

    #[tokio::test]
    async fn repeat_entries_accumulate_but_pay_once_per_user() {
        let (ledger, draws) = draws();
        ledger.credit(UserId(1), 10 * ONE_TOKEN).await.unwrap();
        ledger.credit(UserId(2), 10 * ONE_TOKEN).await.unwrap();
        draws.enter(CHAT, UserId(1), 2 * ONE_TOKEN).await.unwrap();
        draws.enter(CHAT, UserId(1), 2 * ONE_TOKEN).await.unwrap();
        draws.enter(CHAT, UserId(2), 2 * ONE_TOKEN).await.unwrap();
        let outcome = draws.settle(CHAT).await.unwrap();
        assert_eq!(outcome.pot, 6 * ONE_TOKEN);
        assert_eq!(outcome.payouts.len(), 2);
    }
}
