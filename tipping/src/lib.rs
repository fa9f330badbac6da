pub mod deposits;
pub mod distributor;
pub mod draw;
pub mod ledger;
pub mod memory;
pub mod stores;
pub mod withdraw;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use nyantebot_common::app::{AppState, BotModule};
use nyantebot_common::bot_commands::{MessageCommand, TgCommand};
use nyantebot_common::teloxide::prelude::{ChatId, Message, UserId};
use nyantebot_common::teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup};
use nyantebot_common::teloxide::utils::markdown;
use nyantebot_common::tgbot::{BotData, MustAnswerCallbackQuery, TgCallbackContext};
use nyantebot_common::utils::rpc::{Address, BscRpc, ChainClient};
use nyantebot_common::utils::store::PersistentCachedStore;
use nyantebot_common::utils::tokens::{format_bnb, format_tokens, parse_token_amount};

use crate::deposits::DepositWatcher;
use crate::distributor::Distributor;
use crate::draw::Draws;
use crate::ledger::{Ledger, LedgerError, Operation};
use crate::stores::{
    AccountStore, MongoAccountStore, MongoDistributionJournal, MongoDrawStore,
    MongoPendingWithdrawalStore, MongoTransferStore, Transfer, TransferKind, TransferTarget,
};
use crate::withdraw::WithdrawalQueue;

const PAYOUT_INTERVAL: Duration = Duration::from_secs(30);
const DEPOSIT_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// How long a user counts as "active" for `/rain` after their last message.
const RAIN_WINDOW_HOURS: i64 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ActiveUser {
    user_id: UserId,
    last_seen: DateTime<Utc>,
}

pub struct TippingModule {
    app: Arc<AppState>,
    ledger: Arc<Ledger>,
    distributor: Arc<Distributor>,
    draws: Draws,
    withdrawals: Arc<WithdrawalQueue>,
    watcher: Arc<DepositWatcher>,
    chain: Arc<dyn ChainClient>,
    usernames: PersistentCachedStore<String, UserId>,
    chat_activity: PersistentCachedStore<ChatId, Vec<ActiveUser>>,
}

impl TippingModule {
    pub async fn new(app: Arc<AppState>) -> Result<Self, anyhow::Error> {
        let db = app.db();
        let chain: Arc<dyn ChainClient> = Arc::new(BscRpc::from_env()?);
        let accounts: Arc<dyn AccountStore> = Arc::new(MongoAccountStore::new(db.clone()).await?);
        let transfers = Arc::new(MongoTransferStore::new(db.clone()).await?);
        let ledger = Arc::new(Ledger::new(Arc::clone(&accounts), transfers));
        let distributor = Arc::new(Distributor::new(
            Arc::clone(&ledger),
            Arc::new(MongoDistributionJournal::new(db.clone()).await?),
        ));
        let draws = Draws::new(
            Arc::new(MongoDrawStore::new(db.clone()).await?),
            Arc::clone(&ledger),
            Arc::clone(&distributor),
        );
        let withdrawals = Arc::new(WithdrawalQueue::new(
            Arc::clone(&ledger),
            Arc::new(MongoPendingWithdrawalStore::new(db.clone()).await?),
            Arc::clone(&chain),
        ));
        let watcher = Arc::new(DepositWatcher::new(
            Arc::clone(&ledger),
            Arc::clone(&accounts),
            Arc::clone(&chain),
        ));
        Ok(Self {
            app,
            ledger,
            distributor,
            draws,
            withdrawals,
            watcher,
            chain,
            usernames: PersistentCachedStore::new(db.clone(), "tipping_usernames").await?,
            chat_activity: PersistentCachedStore::new(db.clone(), "tipping_chat_activity").await?,
        })
    }

    /// Single entry point mapping command names to handlers.
    async fn dispatch(
        &self,
        bot: &BotData,
        user_id: UserId,
        chat_id: ChatId,
        name: &str,
        args: &[&str],
        message: &Message,
    ) -> Result<(), anyhow::Error> {
        match name {
            "balance" => self.cmd_balance(bot, user_id, chat_id).await,
            "deposit" => self.cmd_deposit(bot, user_id, chat_id).await,
            "myaddress" => self.cmd_myaddress(bot, user_id, chat_id).await,
            "withdraw" => self.cmd_withdraw(bot, user_id, chat_id, args).await,
            "tip" => self.cmd_tip(bot, user_id, chat_id, args, message).await,
            "rain" => self.cmd_rain(bot, user_id, chat_id, args).await,
            "draw" => self.cmd_draw(bot, user_id, chat_id, args).await,
            _ => Ok(()),
        }
    }

    async fn cmd_balance(
        &self,
        bot: &BotData,
        user_id: UserId,
        chat_id: ChatId,
    ) -> Result<(), anyhow::Error> {
        let account = self.ledger.account(user_id).await?.unwrap_or_default();
        let message = format!(
            "Your balance is {}\\.\nBNB for gas: {}\\.",
            markdown::escape(&format_tokens(account.balance)),
            markdown::escape(&format_bnb(account.bnb_fee_balance)),
        );
        bot.send_text_message(chat_id, message, no_buttons()).await?;
        Ok(())
    }

    async fn cmd_deposit(
        &self,
        bot: &BotData,
        user_id: UserId,
        chat_id: ChatId,
    ) -> Result<(), anyhow::Error> {
        if !chat_id.is_user() {
            bot.send_text_message(
                chat_id,
                "This command can only be used in a private chat\\.".to_string(),
                no_buttons(),
            )
            .await?;
            return Ok(());
        }
        let account = self.ledger.account(user_id).await?.unwrap_or_default();
        let address = match account.deposit_address {
            Some(address) => address,
            None => {
                let address = match self.chain.new_deposit_account().await {
                    Ok(address) => address,
                    Err(err) => {
                        log::error!("Failed to create deposit account: {err:?}");
                        bot.send_text_message(
                            chat_id,
                            "Could not create a deposit address right now, try again later\\."
                                .to_string(),
                            no_buttons(),
                        )
                        .await?;
                        return Ok(());
                    }
                };
                self.ledger.assign_deposit_address(user_id, address).await?
            }
        };
        let message = format!(
            "Your deposit address is:\n`{address}`\n\nSend NYANTE there to top up your balance, and some BNB to cover withdrawal gas\\. Deposits are credited within a minute of confirmation\\.",
        );
        bot.send_text_message(chat_id, message, no_buttons()).await?;
        Ok(())
    }

    async fn cmd_myaddress(
        &self,
        bot: &BotData,
        user_id: UserId,
        chat_id: ChatId,
    ) -> Result<(), anyhow::Error> {
        let account = self.ledger.account(user_id).await?.unwrap_or_default();
        let message = match account.deposit_address {
            Some(address) => format!(
                "Your deposit address is `{address}`\\.\nBalance: {}\\.\nBNB for gas: {}\\.",
                markdown::escape(&format_tokens(account.balance)),
                markdown::escape(&format_bnb(account.bnb_fee_balance)),
            ),
            None => "You don't have a deposit address yet\\. Use /deposit to create one\\."
                .to_string(),
        };
        bot.send_text_message(chat_id, message, no_buttons()).await?;
        Ok(())
    }

    async fn cmd_withdraw(
        &self,
        bot: &BotData,
        user_id: UserId,
        chat_id: ChatId,
        args: &[&str],
    ) -> Result<(), anyhow::Error> {
        if !chat_id.is_user() {
            bot.send_text_message(
                chat_id,
                "Withdrawals only work in a private chat\\.".to_string(),
                no_buttons(),
            )
            .await?;
            return Ok(());
        }
        if args.is_empty() {
            bot.set_dm_message_command(user_id, MessageCommand::WithdrawPrompt)
                .await?;
            bot.send_text_message(
                chat_id,
                "Send the destination address and amount, e\\.g\\. `0x1234… 1000000`\\."
                    .to_string(),
                no_buttons(),
            )
            .await?;
            return Ok(());
        }
        let Ok([address, amount]) = <[&str; 2]>::try_from(args.to_vec()) else {
            bot.send_text_message(
                chat_id,
                "Usage: /withdraw `<address>` `<amount>`".to_string(),
                no_buttons(),
            )
            .await?;
            return Ok(());
        };
        let Ok(to) = address.parse::<Address>() else {
            return self
                .reply_error(bot, chat_id, LedgerError::InvalidAddress)
                .await;
        };
        let Some(amount) = parse_token_amount(amount) else {
            bot.send_text_message(
                chat_id,
                "That doesn't look like a valid amount\\.".to_string(),
                no_buttons(),
            )
            .await?;
            return Ok(());
        };
        match self.withdrawals.quote(user_id, to, amount).await {
            Ok(quote) => {
                let message = format!(
                    "Withdraw {amount} to `{to}`?\n\nFee: {fee}, the recipient receives {received}\\.\nEstimated gas: {gas}, charged to your BNB balance\\.",
                    amount = markdown::escape(&format_tokens(quote.amount)),
                    fee = markdown::escape(&format_tokens(quote.fee)),
                    received = markdown::escape(&format_tokens(quote.amount - quote.fee)),
                    gas = markdown::escape(&format_bnb(quote.gas)),
                );
                let buttons = vec![
                    vec![InlineKeyboardButton::callback(
                        "✅ Confirm",
                        bot.to_callback_data(&TgCommand::WithdrawConfirm { to, amount })
                            .await,
                    )],
                    vec![InlineKeyboardButton::callback(
                        "❌ Cancel",
                        bot.to_callback_data(&TgCommand::WithdrawCancel).await,
                    )],
                ];
                bot.send_text_message(chat_id, message, InlineKeyboardMarkup::new(buttons))
                    .await?;
                Ok(())
            }
            Err(err) => self.reply_error(bot, chat_id, err).await,
        }
    }

    async fn cmd_tip(
        &self,
        bot: &BotData,
        user_id: UserId,
        chat_id: ChatId,
        args: &[&str],
        message: &Message,
    ) -> Result<(), anyhow::Error> {
        let (recipient, amount_str) = match args {
            // Reply-tip: /tip <amount> as a reply to the recipient's message
            [amount] => {
                let Some(reply_to_user) = message
                    .reply_to_message()
                    .and_then(|reply| reply.from.as_ref())
                else {
                    bot.send_text_message(
                        chat_id,
                        "Reply to a message with /tip `<amount>`, or use /tip `@user` `<amount>`\\."
                            .to_string(),
                        no_buttons(),
                    )
                    .await?;
                    return Ok(());
                };
                // The replied-to user is visibly real, register them on the fly
                self.ledger
                    .ensure_account(reply_to_user.id, reply_to_user.username.as_deref())
                    .await?;
                (reply_to_user.id, *amount)
            }
            [username, amount] => {
                let key = username.trim_start_matches('@').to_lowercase();
                let Some(recipient) = self.usernames.get(&key).await else {
                    return self
                        .reply_error(bot, chat_id, LedgerError::RecipientNotFound)
                        .await;
                };
                (recipient, *amount)
            }
            _ => {
                bot.send_text_message(
                    chat_id,
                    "Usage: /tip `@user` `<amount>`".to_string(),
                    no_buttons(),
                )
                .await?;
                return Ok(());
            }
        };
        let Some(amount) = parse_token_amount(amount_str) else {
            bot.send_text_message(
                chat_id,
                "That doesn't look like a valid amount\\.".to_string(),
                no_buttons(),
            )
            .await?;
            return Ok(());
        };
        if recipient == user_id {
            bot.send_text_message(
                chat_id,
                "You can't tip yourself\\.".to_string(),
                no_buttons(),
            )
            .await?;
            return Ok(());
        }
        match self
            .ledger
            .transfer(user_id, recipient, amount, Operation::Tip)
            .await
        {
            Ok(()) => {
                self.ledger
                    .record_transfer(Transfer::new(
                        TransferKind::Tip,
                        Some(user_id),
                        TransferTarget::User(recipient),
                        amount,
                    ))
                    .await?;
                let message = format!(
                    "You tipped {} to {}\\!",
                    markdown::escape(&format_tokens(amount)),
                    self.mention(recipient).await,
                );
                bot.send_text_message(chat_id, message, no_buttons()).await?;
                Ok(())
            }
            Err(err) => self.reply_error(bot, chat_id, err).await,
        }
    }

    async fn cmd_rain(
        &self,
        bot: &BotData,
        user_id: UserId,
        chat_id: ChatId,
        args: &[&str],
    ) -> Result<(), anyhow::Error> {
        if chat_id.is_user() {
            bot.send_text_message(
                chat_id,
                "Rain only works in a group chat\\.".to_string(),
                no_buttons(),
            )
            .await?;
            return Ok(());
        }
        let Ok([amount]) = <[&str; 1]>::try_from(args.to_vec()) else {
            bot.send_text_message(
                chat_id,
                "Usage: /rain `<amount>`".to_string(),
                no_buttons(),
            )
            .await?;
            return Ok(());
        };
        let Some(amount) = parse_token_amount(amount) else {
            bot.send_text_message(
                chat_id,
                "That doesn't look like a valid amount\\.".to_string(),
                no_buttons(),
            )
            .await?;
            return Ok(());
        };
        let recipients = self.active_users(chat_id, user_id).await?;
        if recipients.is_empty() {
            return self
                .reply_error(bot, chat_id, LedgerError::EmptyRecipientSet)
                .await;
        }
        match self
            .distributor
            .distribute(user_id, &recipients, amount, Operation::Rain)
            .await
        {
            Ok(pairs) => {
                let message = format!(
                    "☔ You rained {} on {} users\\!",
                    markdown::escape(&format_tokens(amount)),
                    pairs.iter().filter(|(_, share)| *share > 0).count(),
                );
                bot.send_text_message(chat_id, message, no_buttons()).await?;
                Ok(())
            }
            Err(err) => self.reply_error(bot, chat_id, err).await,
        }
    }

    async fn cmd_draw(
        &self,
        bot: &BotData,
        user_id: UserId,
        chat_id: ChatId,
        args: &[&str],
    ) -> Result<(), anyhow::Error> {
        if chat_id.is_user() {
            bot.send_text_message(
                chat_id,
                "Draws only work in a group chat\\.".to_string(),
                no_buttons(),
            )
            .await?;
            return Ok(());
        }
        let Ok([amount]) = <[&str; 1]>::try_from(args.to_vec()) else {
            bot.send_text_message(
                chat_id,
                "Usage: /draw `<amount>` to enter the round\\. The first entrant gets the settle button\\."
                    .to_string(),
                no_buttons(),
            )
            .await?;
            return Ok(());
        };
        let Some(amount) = parse_token_amount(amount) else {
            bot.send_text_message(
                chat_id,
                "That doesn't look like a valid amount\\.".to_string(),
                no_buttons(),
            )
            .await?;
            return Ok(());
        };
        match self.draws.enter(chat_id, user_id, amount).await {
            Ok(round) => {
                let entrants = round
                    .entries
                    .iter()
                    .map(|entry| entry.user_id)
                    .unique()
                    .count();
                let message = format!(
                    "🎲 {} entered the draw with {}\\. Pot: {}, {} participants\\.",
                    self.mention(user_id).await,
                    markdown::escape(&format_tokens(amount)),
                    markdown::escape(&format_tokens(round.pot())),
                    entrants,
                );
                let buttons = vec![vec![InlineKeyboardButton::callback(
                    "🎰 Settle",
                    bot.to_callback_data(&TgCommand::DrawSettle {
                        target_chat_id: chat_id,
                    })
                    .await,
                )]];
                bot.send_text_message(chat_id, message, InlineKeyboardMarkup::new(buttons))
                    .await?;
                Ok(())
            }
            Err(err) => self.reply_error(bot, chat_id, err).await,
        }
    }

    /// Users who spoke in the chat within the rain window, minus the sender.
    async fn active_users(
        &self,
        chat_id: ChatId,
        sender: UserId,
    ) -> Result<Vec<UserId>, anyhow::Error> {
        let active = self.chat_activity.get(&chat_id).await.unwrap_or_default();
        let cutoff = Utc::now() - chrono::Duration::hours(RAIN_WINDOW_HOURS);
        Ok(active
            .into_iter()
            .filter(|entry| entry.last_seen >= cutoff && entry.user_id != sender)
            .map(|entry| entry.user_id)
            .collect())
    }

    /// Keeps the account row, username index and rain activity window fresh
    /// for every message we see.
    async fn track_user(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        message: &Message,
    ) -> Result<(), anyhow::Error> {
        let username = message.from.as_ref().and_then(|user| user.username.clone());
        self.ledger
            .ensure_account(user_id, username.as_deref())
            .await?;
        if let Some(username) = &username {
            self.usernames
                .insert_or_update(username.to_lowercase(), user_id)
                .await?;
        }
        if !chat_id.is_user() {
            let now = Utc::now();
            let cutoff = now - chrono::Duration::hours(RAIN_WINDOW_HOURS);
            self.chat_activity
                .edit(
                    chat_id,
                    |active| {
                        active.retain(|entry| entry.last_seen >= cutoff);
                        if let Some(entry) =
                            active.iter_mut().find(|entry| entry.user_id == user_id)
                        {
                            entry.last_seen = now;
                        } else {
                            active.push(ActiveUser {
                                user_id,
                                last_seen: now,
                            });
                        }
                    },
                    Some(Vec::new()),
                )
                .await?;
        }
        Ok(())
    }

    async fn mention(&self, user_id: UserId) -> String {
        match self
            .ledger
            .account(user_id)
            .await
            .ok()
            .flatten()
            .and_then(|account| account.username)
        {
            Some(username) => markdown::escape(&format!("@{username}")),
            None => format!("[user](tg://user?id={})", user_id.0),
        }
    }

    async fn reply_error(
        &self,
        bot: &BotData,
        chat_id: ChatId,
        err: LedgerError,
    ) -> Result<(), anyhow::Error> {
        match err.user_message() {
            Some(text) => {
                bot.send_text_message(chat_id, markdown::escape(&text), no_buttons())
                    .await?;
                Ok(())
            }
            None => Err(err.into()),
        }
    }
}

#[async_trait]
impl BotModule for TippingModule {
    fn name(&self) -> &'static str {
        "Tipping"
    }

    async fn start(&self) -> Result<(), anyhow::Error> {
        self.withdrawals.recover().await?;
        self.distributor.recover().await?;

        let withdrawals = Arc::clone(&self.withdrawals);
        let app = Arc::clone(&self.app);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(PAYOUT_INTERVAL).await;
                match withdrawals.drain().await {
                    Ok(None) => {}
                    Ok(Some(outcome)) => {
                        for withdrawal in &outcome.withdrawals {
                            let text = match &outcome.result {
                                Ok(tx_hash) => format!(
                                    "Withdrawal of {} sent: https://bscscan.com/tx/{tx_hash}",
                                    format_tokens(withdrawal.amount),
                                ),
                                Err(_) => format!(
                                    "Your withdrawal of {} could not be submitted and was refunded in full.",
                                    format_tokens(withdrawal.amount),
                                ),
                            };
                            dm(&app, withdrawal.user_id, text).await;
                        }
                    }
                    Err(err) => log::error!("Payout batch failed: {err:?}"),
                }
            }
        });

        let watcher = Arc::clone(&self.watcher);
        let app = Arc::clone(&self.app);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(DEPOSIT_POLL_INTERVAL).await;
                match watcher.reconcile_once().await {
                    Ok(events) => {
                        for event in events {
                            let mut lines = Vec::new();
                            if event.token_delta > 0 {
                                lines.push(format!(
                                    "Deposit received: {}",
                                    format_tokens(event.token_delta)
                                ));
                            }
                            if event.bnb_delta > 0 {
                                lines.push(format!(
                                    "BNB received for gas: {}",
                                    format_bnb(event.bnb_delta)
                                ));
                            }
                            dm(&app, event.user_id, lines.join("\n")).await;
                        }
                    }
                    Err(err) => log::warn!("Deposit reconciliation pass failed: {err:?}"),
                }
            }
        });

        Ok(())
    }

    async fn handle_message(
        &self,
        bot: &BotData,
        user_id: Option<UserId>,
        chat_id: ChatId,
        command: MessageCommand,
        text: &str,
        message: &Message,
    ) -> Result<(), anyhow::Error> {
        let Some(user_id) = user_id else {
            return Ok(());
        };

        match command {
            MessageCommand::Start(_) => {
                self.track_user(user_id, chat_id, message).await?;
            }
            MessageCommand::WithdrawPrompt => {
                if !chat_id.is_user() {
                    return Ok(());
                }
                bot.remove_dm_message_command(&user_id).await?;
                let args: Vec<&str> = text.split_whitespace().collect();
                self.cmd_withdraw(bot, user_id, chat_id, &args).await?;
            }
            MessageCommand::None => {
                self.track_user(user_id, chat_id, message).await?;
                let Some(command_text) = text.strip_prefix('/') else {
                    return Ok(());
                };
                let mut parts = command_text.split_whitespace();
                let Some(name) = parts.next() else {
                    return Ok(());
                };
                // Strip the bot mention from /tip@OurBot in groups
                let name = name.split('@').next().unwrap_or(name);
                let args: Vec<&str> = parts.collect();
                self.dispatch(bot, user_id, chat_id, name, &args, message)
                    .await?;
            }
        }
        Ok(())
    }

    async fn handle_callback<'a>(
        &'a self,
        mut context: TgCallbackContext<'a>,
        _query: &mut Option<MustAnswerCallbackQuery>,
    ) -> Result<(), anyhow::Error> {
        match context.parse_command().await? {
            TgCommand::WithdrawConfirm { to, amount } => {
                if !context.chat_id().is_user() {
                    return Ok(());
                }
                let key = format!(
                    "wd-{}-{}",
                    context.user_id().0,
                    context.message_id().map(|id| id.0).unwrap_or_default()
                );
                match self
                    .withdrawals
                    .enqueue(key, context.user_id(), to, amount)
                    .await
                {
                    Ok(Some(withdrawal)) => {
                        let message = format!(
                            "✅ Withdrawal of {} to `{to}` queued\\. You'll get a message when it's on chain\\.",
                            markdown::escape(&format_tokens(withdrawal.amount)),
                        );
                        context.edit_or_send(message, no_buttons()).await?;
                    }
                    // A replayed press of the same button; the first one won
                    Ok(None) => {}
                    Err(err) => match err.user_message() {
                        Some(text) => {
                            context
                                .edit_or_send(markdown::escape(&text), no_buttons())
                                .await?;
                        }
                        None => return Err(err.into()),
                    },
                }
            }
            TgCommand::WithdrawCancel => {
                if !context.chat_id().is_user() {
                    return Ok(());
                }
                context
                    .edit_or_send("Withdrawal cancelled\\.".to_string(), no_buttons())
                    .await?;
            }
            TgCommand::DrawSettle { target_chat_id } => {
                let Some(round) = self.draws.round(target_chat_id).await? else {
                    return Ok(());
                };
                if round.initiator != context.user_id() {
                    return Ok(());
                }
                match self.draws.settle(target_chat_id).await {
                    Ok(outcome) => {
                        let mut lines = vec![format!(
                            "🎉 Draw settled\\! Pot: {}",
                            markdown::escape(&format_tokens(outcome.pot)),
                        )];
                        for (user_id, amount) in &outcome.payouts {
                            lines.push(format!(
                                "{} won {}",
                                self.mention(*user_id).await,
                                markdown::escape(&format_tokens(*amount)),
                            ));
                        }
                        context.edit_or_send(lines.join("\n"), no_buttons()).await?;
                    }
                    Err(err) => match err.user_message() {
                        Some(text) => {
                            context
                                .edit_or_send(markdown::escape(&text), no_buttons())
                                .await?;
                        }
                        None => return Err(err.into()),
                    },
                }
            }
        }
        Ok(())
    }
}

async fn dm(app: &AppState, user_id: UserId, text: String) {
    let bots = app.bots();
    let Some(bot) = bots.first() else {
        return;
    };
    if let Err(err) = bot
        .value()
        .send_text_message(
            ChatId(user_id.0 as i64),
            markdown::escape(&text),
            no_buttons(),
        )
        .await
    {
        log::warn!("Failed to DM {user_id}: {err:?}");
    }
}

fn no_buttons() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(Vec::<Vec<InlineKeyboardButton>>::new())
}
