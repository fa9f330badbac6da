//! In-memory store implementations for tests and embedding.

use async_trait::async_trait;
use dashmap::DashMap;
use nyantebot_common::teloxide::prelude::{ChatId, UserId};
use tokio::sync::Mutex;

use crate::stores::{
    Account, AccountStore, DistributionJournal, DrawRound, DrawStore, PendingDistribution,
    PendingWithdrawal, PendingWithdrawalStore, Transfer, TransferStore,
};

#[derive(Default)]
pub struct MemoryAccountStore {
    accounts: DashMap<UserId, Account>,
}

#[async_trait]
impl AccountStore for MemoryAccountStore {
    async fn get(&self, user_id: UserId) -> Result<Option<Account>, anyhow::Error> {
        Ok(self.accounts.get(&user_id).map(|a| a.clone()))
    }

    async fn put(&self, user_id: UserId, account: Account) -> Result<(), anyhow::Error> {
        self.accounts.insert(user_id, account);
        Ok(())
    }

    async fn all(&self) -> Result<Vec<(UserId, Account)>, anyhow::Error> {
        Ok(self
            .accounts
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryTransferStore {
    transfers: Mutex<Vec<Transfer>>,
}

impl MemoryTransferStore {
    pub async fn transfers(&self) -> Vec<Transfer> {
        self.transfers.lock().await.clone()
    }
}

#[async_trait]
impl TransferStore for MemoryTransferStore {
    async fn append(&self, transfer: Transfer) -> Result<(), anyhow::Error> {
        self.transfers.lock().await.push(transfer);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryDrawStore {
    rounds: DashMap<ChatId, DrawRound>,
}

#[async_trait]
impl DrawStore for MemoryDrawStore {
    async fn get(&self, chat_id: ChatId) -> Result<Option<DrawRound>, anyhow::Error> {
        Ok(self.rounds.get(&chat_id).map(|r| r.clone()))
    }

    async fn put(&self, chat_id: ChatId, round: DrawRound) -> Result<(), anyhow::Error> {
        self.rounds.insert(chat_id, round);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryPendingWithdrawalStore {
    withdrawals: DashMap<String, PendingWithdrawal>,
}

#[async_trait]
impl PendingWithdrawalStore for MemoryPendingWithdrawalStore {
    async fn create(&self, withdrawal: PendingWithdrawal) -> Result<bool, anyhow::Error> {
        match self.withdrawals.entry(withdrawal.key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Ok(false),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(withdrawal);
                Ok(true)
            }
        }
    }

    async fn update(&self, withdrawal: PendingWithdrawal) -> Result<(), anyhow::Error> {
        self.withdrawals.insert(withdrawal.key.clone(), withdrawal);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), anyhow::Error> {
        self.withdrawals.remove(key);
        Ok(())
    }

    async fn all(&self) -> Result<Vec<PendingWithdrawal>, anyhow::Error> {
        Ok(self
            .withdrawals
            .iter()
            .map(|entry| entry.value().clone())
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryDistributionJournal {
    distributions: DashMap<String, PendingDistribution>,
}

#[async_trait]
impl DistributionJournal for MemoryDistributionJournal {
    async fn begin(&self, distribution: PendingDistribution) -> Result<(), anyhow::Error> {
        self.distributions
            .insert(distribution.id.clone(), distribution);
        Ok(())
    }

    async fn end(&self, id: &str) -> Result<(), anyhow::Error> {
        self.distributions.remove(id);
        Ok(())
    }

    async fn pending(&self) -> Result<Vec<PendingDistribution>, anyhow::Error> {
        Ok(self
            .distributions
            .iter()
            .map(|entry| entry.value().clone())
            .collect())
    }
}
