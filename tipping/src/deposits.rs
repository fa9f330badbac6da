use std::sync::Arc;

use nyantebot_common::teloxide::prelude::UserId;
use nyantebot_common::utils::rpc::ChainClient;

use crate::ledger::{Ledger, LedgerError};
use crate::stores::{AccountStore, Transfer, TransferKind, TransferTarget};

pub struct DepositEvent {
    pub user_id: UserId,
    pub token_delta: u128,
    pub bnb_delta: u128,
}

/// Reconciles the off-chain ledger against on-chain deposit addresses. New
/// funds observed above an account's high-water mark are credited; a failed
/// RPC read skips the account until the next pass and never touches the
/// ledger.
pub struct DepositWatcher {
    ledger: Arc<Ledger>,
    accounts: Arc<dyn AccountStore>,
    chain: Arc<dyn ChainClient>,
}

impl DepositWatcher {
    pub fn new(
        ledger: Arc<Ledger>,
        accounts: Arc<dyn AccountStore>,
        chain: Arc<dyn ChainClient>,
    ) -> Self {
        Self {
            ledger,
            accounts,
            chain,
        }
    }

    pub async fn reconcile_once(&self) -> Result<Vec<DepositEvent>, LedgerError> {
        let mut events = Vec::new();
        for (user_id, account) in self.accounts.all().await? {
            let Some(address) = account.deposit_address else {
                continue;
            };
            let observed_token = match self.chain.token_balance(address).await {
                Ok(balance) => balance,
                Err(err) => {
                    log::warn!("Skipping deposit check for {user_id}: {err:?}");
                    continue;
                }
            };
            let observed_bnb = match self.chain.bnb_balance(address).await {
                Ok(balance) => balance,
                Err(err) => {
                    log::warn!("Skipping BNB deposit check for {user_id}: {err:?}");
                    continue;
                }
            };
            let (token_delta, bnb_delta) = self
                .ledger
                .reconcile_deposit(user_id, observed_token, observed_bnb)
                .await?;
            if token_delta == 0 && bnb_delta == 0 {
                continue;
            }
            if token_delta > 0 {
                let transfer = Transfer::new(
                    TransferKind::Deposit,
                    None,
                    TransferTarget::User(user_id),
                    token_delta,
                );
                if let Err(err) = self.ledger.record_transfer(transfer).await {
                    log::error!("Failed to record deposit transfer: {err:?}");
                }
            }
            if bnb_delta > 0 {
                let transfer = Transfer::new(
                    TransferKind::BnbDeposit,
                    None,
                    TransferTarget::User(user_id),
                    bnb_delta,
                );
                if let Err(err) = self.ledger.record_transfer(transfer).await {
                    log::error!("Failed to record BNB deposit transfer: {err:?}");
                }
            }
            events.push(DepositEvent {
                user_id,
                token_delta,
                bnb_delta,
            });
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryAccountStore, MemoryTransferStore};
    use async_trait::async_trait;
    use dashmap::DashMap;
    use nyantebot_common::utils::rpc::Address;
    use nyantebot_common::utils::tokens::ONE_TOKEN;

    const ALICE: UserId = UserId(1);
    const DEPOSIT: Address = Address([0x22; 20]);

    #[derive(Default)]
    struct FakeChain {
        token_balances: DashMap<Address, u128>,
        bnb_balances: DashMap<Address, u128>,
    }

    #[async_trait]
    impl ChainClient for FakeChain {
        async fn estimate_fee(
            &self,
            _transfers: &[(Address, u128)],
        ) -> Result<u128, anyhow::Error> {
            Ok(0)
        }

        async fn submit(&self, _transfers: &[(Address, u128)]) -> Result<String, anyhow::Error> {
            Err(anyhow::anyhow!("not supported"))
        }

        async fn token_balance(&self, address: Address) -> Result<u128, anyhow::Error> {
            Ok(self.token_balances.get(&address).map(|b| *b).unwrap_or(0))
        }

        async fn bnb_balance(&self, address: Address) -> Result<u128, anyhow::Error> {
            Ok(self.bnb_balances.get(&address).map(|b| *b).unwrap_or(0))
        }

        async fn new_deposit_account(&self) -> Result<Address, anyhow::Error> {
            Ok(DEPOSIT)
        }
    }

    #[tokio::test]
    async fn credits_observed_deposits_once() {
        let accounts = Arc::new(MemoryAccountStore::default());
        let ledger = Arc::new(Ledger::new(
            accounts.clone(),
            Arc::new(MemoryTransferStore::default()),
        ));
        let chain = Arc::new(FakeChain::default());
        let watcher = DepositWatcher::new(Arc::clone(&ledger), accounts, chain.clone());

        ledger.ensure_account(ALICE, None).await.unwrap();
        ledger.assign_deposit_address(ALICE, DEPOSIT).await.unwrap();
        chain.token_balances.insert(DEPOSIT, 5 * ONE_TOKEN);

        let events = watcher.reconcile_once().await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].token_delta, 5 * ONE_TOKEN);
        assert_eq!(ledger.balance(ALICE).await.unwrap(), 5 * ONE_TOKEN);

        // Nothing changed on chain, nothing gets credited again
        let events = watcher.reconcile_once().await.unwrap();
        assert!(events.is_empty());
        assert_eq!(ledger.balance(ALICE).await.unwrap(), 5 * ONE_TOKEN);

        // A further deposit credits only the delta
        chain.token_balances.insert(DEPOSIT, 8 * ONE_TOKEN);
        chain.bnb_balances.insert(DEPOSIT, 1_000);
        let events = watcher.reconcile_once().await.unwrap();
        assert_eq!(events[0].token_delta, 3 * ONE_TOKEN);
        assert_eq!(events[0].bnb_delta, 1_000);
        assert_eq!(ledger.balance(ALICE).await.unwrap(), 8 * ONE_TOKEN);
    }
}
