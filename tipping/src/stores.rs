use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nyantebot_common::mongodb::Database;
use nyantebot_common::teloxide::prelude::{ChatId, UserId};
use nyantebot_common::utils::rpc::Address;
use nyantebot_common::utils::store::{PersistentCachedStore, PersistentUncachedStore};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr};

/// Random 128-bit identifier for transfers, rounds and journal records.
pub fn generate_id() -> String {
    format!("{:032x}", rand::thread_rng().gen::<u128>())
}

/// A user's custodial balances. Token amounts are raw units (10^-18 tokens),
/// BNB amounts are wei. Stringified in storage because BSON has no u128.
#[serde_as]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Account {
    #[serde_as(as = "DisplayFromStr")]
    pub balance: u128,
    #[serde_as(as = "DisplayFromStr")]
    pub bnb_fee_balance: u128,
    pub deposit_address: Option<Address>,
    /// High-water marks of observed on-chain deposits, advanced by the
    /// reconciliation worker.
    #[serde_as(as = "DisplayFromStr")]
    pub token_deposited: u128,
    #[serde_as(as = "DisplayFromStr")]
    pub bnb_deposited: u128,
    pub username: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferKind {
    Deposit,
    BnbDeposit,
    Tip,
    Rain,
    Draw,
    Withdrawal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferTarget {
    User(UserId),
    External(Address),
}

/// Immutable record of a committed balance movement. Appended only after
/// every paired mutation has succeeded.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transfer {
    pub id: String,
    pub kind: TransferKind,
    /// `None` for movements that originate outside the ledger (deposits,
    /// draw pot payouts).
    pub from: Option<UserId>,
    pub to: TransferTarget,
    #[serde_as(as = "DisplayFromStr")]
    pub amount: u128,
    #[serde_as(as = "DisplayFromStr")]
    pub fee: u128,
    pub tx_hash: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Transfer {
    pub fn new(kind: TransferKind, from: Option<UserId>, to: TransferTarget, amount: u128) -> Self {
        Self {
            id: generate_id(),
            kind,
            from,
            to,
            amount,
            fee: 0,
            tx_hash: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_fee(mut self, fee: u128) -> Self {
        self.fee = fee;
        self
    }

    pub fn with_tx_hash(mut self, tx_hash: String) -> Self {
        self.tx_hash = Some(tx_hash);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DrawState {
    Open,
    Settling,
    Closed,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrawEntry {
    pub user_id: UserId,
    #[serde_as(as = "DisplayFromStr")]
    pub amount: u128,
}

/// One draw round per chat. Entries are staked at entry time and consumed
/// when the round settles; a closed round stays in the store as a record
/// until the next round replaces it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrawRound {
    pub id: String,
    pub chat_id: ChatId,
    pub initiator: UserId,
    pub state: DrawState,
    pub entries: Vec<DrawEntry>,
}

impl DrawRound {
    pub fn new(chat_id: ChatId, initiator: UserId) -> Self {
        Self {
            id: generate_id(),
            chat_id,
            initiator,
            state: DrawState::Open,
            entries: Vec::new(),
        }
    }

    pub fn pot(&self) -> u128 {
        self.entries.iter().map(|e| e.amount).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WithdrawalState {
    /// Debited, waiting for the next payout batch.
    Queued,
    /// Handed to the chain; a record stuck here after a crash means the
    /// outcome is unknown and needs manual reconciliation.
    Submitting,
}

/// Write-ahead record of a withdrawal in flight. The key doubles as the
/// idempotency key: a replayed confirmation callback maps to the same key
/// and cannot debit twice.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingWithdrawal {
    pub key: String,
    pub user_id: UserId,
    pub to: Address,
    #[serde_as(as = "DisplayFromStr")]
    pub amount: u128,
    #[serde_as(as = "DisplayFromStr")]
    pub fee: u128,
    #[serde_as(as = "DisplayFromStr")]
    pub gas_charged: u128,
    pub state: WithdrawalState,
    pub created_at: DateTime<Utc>,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionShare {
    pub user_id: UserId,
    #[serde_as(as = "DisplayFromStr")]
    pub amount: u128,
}

/// Write-ahead record of a full multi-recipient distribution, written before
/// the first mutation and removed after the last. One found at startup marks
/// a crash mid-distribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingDistribution {
    pub id: String,
    pub kind: TransferKind,
    pub from: Option<UserId>,
    pub shares: Vec<DistributionShare>,
}

#[async_trait]
pub trait AccountStore: Send + Sync + 'static {
    async fn get(&self, user_id: UserId) -> Result<Option<Account>, anyhow::Error>;
    async fn put(&self, user_id: UserId, account: Account) -> Result<(), anyhow::Error>;
    async fn all(&self) -> Result<Vec<(UserId, Account)>, anyhow::Error>;
}

#[async_trait]
pub trait TransferStore: Send + Sync + 'static {
    async fn append(&self, transfer: Transfer) -> Result<(), anyhow::Error>;
}

#[async_trait]
pub trait DrawStore: Send + Sync + 'static {
    async fn get(&self, chat_id: ChatId) -> Result<Option<DrawRound>, anyhow::Error>;
    async fn put(&self, chat_id: ChatId, round: DrawRound) -> Result<(), anyhow::Error>;
}

#[async_trait]
pub trait PendingWithdrawalStore: Send + Sync + 'static {
    /// Returns false if a record with this key already exists.
    async fn create(&self, withdrawal: PendingWithdrawal) -> Result<bool, anyhow::Error>;
    async fn update(&self, withdrawal: PendingWithdrawal) -> Result<(), anyhow::Error>;
    async fn remove(&self, key: &str) -> Result<(), anyhow::Error>;
    async fn all(&self) -> Result<Vec<PendingWithdrawal>, anyhow::Error>;
}

#[async_trait]
pub trait DistributionJournal: Send + Sync + 'static {
    async fn begin(&self, distribution: PendingDistribution) -> Result<(), anyhow::Error>;
    async fn end(&self, id: &str) -> Result<(), anyhow::Error>;
    async fn pending(&self) -> Result<Vec<PendingDistribution>, anyhow::Error>;
}

pub struct MongoAccountStore(PersistentCachedStore<UserId, Account>);

impl MongoAccountStore {
    pub async fn new(db: Database) -> Result<Self, anyhow::Error> {
        Ok(Self(
            PersistentCachedStore::new(db, "tipping_accounts").await?,
        ))
    }
}

#[async_trait]
impl AccountStore for MongoAccountStore {
    async fn get(&self, user_id: UserId) -> Result<Option<Account>, anyhow::Error> {
        Ok(self.0.get(&user_id).await)
    }

    async fn put(&self, user_id: UserId, account: Account) -> Result<(), anyhow::Error> {
        self.0.insert_or_update(user_id, account).await
    }

    async fn all(&self) -> Result<Vec<(UserId, Account)>, anyhow::Error> {
        Ok(self
            .0
            .values()
            .await?
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect())
    }
}

pub struct MongoTransferStore(PersistentUncachedStore<String, Transfer>);

impl MongoTransferStore {
    pub async fn new(db: Database) -> Result<Self, anyhow::Error> {
        Ok(Self(
            PersistentUncachedStore::new(db, "tipping_transfers").await?,
        ))
    }
}

#[async_trait]
impl TransferStore for MongoTransferStore {
    async fn append(&self, transfer: Transfer) -> Result<(), anyhow::Error> {
        self.0.insert_or_update(transfer.id.clone(), transfer).await
    }
}

pub struct MongoDrawStore(PersistentCachedStore<ChatId, DrawRound>);

impl MongoDrawStore {
    pub async fn new(db: Database) -> Result<Self, anyhow::Error> {
        Ok(Self(PersistentCachedStore::new(db, "tipping_draws").await?))
    }
}

#[async_trait]
impl DrawStore for MongoDrawStore {
    async fn get(&self, chat_id: ChatId) -> Result<Option<DrawRound>, anyhow::Error> {
        Ok(self.0.get(&chat_id).await)
    }

    async fn put(&self, chat_id: ChatId, round: DrawRound) -> Result<(), anyhow::Error> {
        self.0.insert_or_update(chat_id, round).await
    }
}

pub struct MongoPendingWithdrawalStore(PersistentCachedStore<String, PendingWithdrawal>);

impl MongoPendingWithdrawalStore {
    pub async fn new(db: Database) -> Result<Self, anyhow::Error> {
        Ok(Self(
            PersistentCachedStore::new(db, "tipping_pending_withdrawals").await?,
        ))
    }
}

#[async_trait]
impl PendingWithdrawalStore for MongoPendingWithdrawalStore {
    async fn create(&self, withdrawal: PendingWithdrawal) -> Result<bool, anyhow::Error> {
        self.0
            .insert_if_not_exists(withdrawal.key.clone(), withdrawal)
            .await
    }

    async fn update(&self, withdrawal: PendingWithdrawal) -> Result<(), anyhow::Error> {
        self.0
            .insert_or_update(withdrawal.key.clone(), withdrawal)
            .await
    }

    async fn remove(&self, key: &str) -> Result<(), anyhow::Error> {
        self.0.remove(&key.to_string()).await?;
        Ok(())
    }

    async fn all(&self) -> Result<Vec<PendingWithdrawal>, anyhow::Error> {
        Ok(self
            .0
            .values()
            .await?
            .map(|entry| entry.value().clone())
            .collect())
    }
}

pub struct MongoDistributionJournal(PersistentCachedStore<String, PendingDistribution>);

impl MongoDistributionJournal {
    pub async fn new(db: Database) -> Result<Self, anyhow::Error> {
        Ok(Self(
            PersistentCachedStore::new(db, "tipping_distribution_journal").await?,
        ))
    }
}

#[async_trait]
impl DistributionJournal for MongoDistributionJournal {
    async fn begin(&self, distribution: PendingDistribution) -> Result<(), anyhow::Error> {
        self.0
            .insert_or_update(distribution.id.clone(), distribution)
            .await
    }

    async fn end(&self, id: &str) -> Result<(), anyhow::Error> {
        self.0.remove(&id.to_string()).await?;
        Ok(())
    }

    async fn pending(&self) -> Result<Vec<PendingDistribution>, anyhow::Error> {
        Ok(self
            .0
            .values()
            .await?
            .map(|entry| entry.value().clone())
            .collect())
    }
}
