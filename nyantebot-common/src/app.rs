use std::sync::Arc;

use crate::{
    bot_commands::MessageCommand,
    tgbot::{BotData, MustAnswerCallbackQuery, TgCallbackContext},
};

use async_trait::async_trait;
use dashmap::{
    mapref::{multiple::RefMulti, one::Ref},
    DashMap,
};
use mongodb::{Client, Database};
use teloxide::prelude::{ChatId, Message, UserId};
use tokio::sync::{RwLock, RwLockReadGuard};

/// Top-level application handle. Owns the shared state and drives the
/// `init -> serve -> shutdown` lifecycle.
pub struct App {
    state: Arc<AppState>,
}

impl App {
    pub async fn new(client: Client, db: Database) -> Result<Self, anyhow::Error> {
        let state = Arc::new(AppState::new(client, db));
        Ok(Self { state })
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn arc_clone_state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    pub async fn start_tg_bots(&self) -> Result<(), anyhow::Error> {
        for module in self.state.bot_modules().await.iter() {
            module.start().await?;
        }

        for bot in self.state.bots() {
            bot.start_polling().await?;
        }

        Ok(())
    }

    /// Closes the MongoDB connection pool. Telegram polling tasks are
    /// detached and die with the process.
    pub async fn shutdown(self) -> Result<(), anyhow::Error> {
        let client = self.state.client.clone();
        client.shutdown().await;
        Ok(())
    }
}

pub struct AppState {
    bots: DashMap<UserId, BotData>,
    bot_modules: RwLock<Vec<Arc<dyn BotModule>>>,
    client: Client,
    db: Database,
}

impl AppState {
    pub fn new(client: Client, db: Database) -> Self {
        Self {
            bots: DashMap::new(),
            bot_modules: RwLock::new(Vec::new()),
            client,
            db,
        }
    }

    pub async fn add_bot(&self, bot: BotData) -> Result<(), anyhow::Error> {
        let user_id = bot.id();
        self.bots.insert(user_id, bot);
        Ok(())
    }

    pub fn bot(&self, user_id: &UserId) -> Option<Ref<UserId, BotData>> {
        self.bots.get(user_id)
    }

    pub fn bots(&self) -> Vec<RefMulti<UserId, BotData>> {
        self.bots.iter().collect()
    }

    pub async fn add_bot_module<M: BotModule>(&self, module: impl Into<Arc<M>>) {
        self.bot_modules.write().await.push(module.into());
    }

    pub async fn bot_modules(&self) -> RwLockReadGuard<Vec<Arc<dyn BotModule>>> {
        self.bot_modules.read().await
    }

    pub fn db(&self) -> Database {
        self.db.clone()
    }
}

#[async_trait]
pub trait BotModule: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Called once before polling starts. Spawn background workers here.
    async fn start(&self) -> Result<(), anyhow::Error> {
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
    ) -> Result<(), anyhow::Error>;

    async fn handle_callback<'a>(
        &'a self,
        ctx: TgCallbackContext<'a>,
        query: &mut Option<MustAnswerCallbackQuery>,
    ) -> Result<(), anyhow::Error>;
}
