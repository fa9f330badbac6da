use std::sync::Arc;

use log::warn;
use sha3::{Digest, Keccak256};
use teloxide::payloads::{EditMessageTextSetters, SendMessageSetters};
use teloxide::prelude::dptree;
use teloxide::prelude::CallbackQuery;
use teloxide::prelude::Dispatcher;
use teloxide::prelude::Message;
use teloxide::prelude::Requester;
use teloxide::prelude::Update;
use teloxide::prelude::UserId;
use teloxide::types::{
    InlineKeyboardMarkup, LinkPreviewOptions, MessageId, ParseMode, ReplyMarkup, ReplyParameters,
};
use teloxide::{adaptors::throttle::Throttle, prelude::ChatId};
use teloxide::{adaptors::CacheMe, dispatching::UpdateFilterExt};
use teloxide::{ApiError, Bot, RequestError};

use crate::app::AppState;
use crate::bot_commands::{MessageCommand, TgCommand};
use crate::utils::store::PersistentCachedStore;

pub type TgBot = CacheMe<Throttle<Bot>>;

/// Use this as callback data if you're 100% sure that the callback data will never be used
pub const DONT_CARE: &str = "dontcare";

pub struct BotData {
    bot: TgBot,
    bot_id: UserId,
    app: Arc<AppState>,
    callback_data_cache: PersistentCachedStore<String, String>,
    dm_message_commands: PersistentCachedStore<UserId, MessageCommand>,
}

impl BotData {
    pub async fn new(bot: TgBot, app: Arc<AppState>) -> Result<Self, anyhow::Error> {
        let bot_id = bot.get_me().await?.id;
        let db = app.db();

        Ok(Self {
            bot,
            bot_id,
            app,
            callback_data_cache: PersistentCachedStore::new(
                db.clone(),
                &format!("bot{bot_id}_callback_data_cache"),
            )
            .await?,
            dm_message_commands: PersistentCachedStore::new(
                db.clone(),
                &format!("bot{bot_id}_message_commands_dm"),
            )
            .await?,
        })
    }

    pub async fn start_polling(&self) -> Result<(), anyhow::Error> {
        let bot = self.bot.clone();
        let (msg_sender, mut msg_receiver) = tokio::sync::mpsc::channel(1000);
        let (callback_query_sender, mut callback_query_receiver) = tokio::sync::mpsc::channel(1000);

        tokio::spawn(async move {
            let handler = dptree::entry()
                .branch(Update::filter_message().endpoint(move |msg: Message| {
                    let msg_sender = msg_sender.clone();
                    async move {
                        msg_sender.send(msg).await.unwrap();
                        Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
                    }
                }))
                .branch(Update::filter_callback_query().endpoint(
                    move |callback_query: CallbackQuery| {
                        let callback_query_sender = callback_query_sender.clone();
                        async move {
                            callback_query_sender.send(callback_query).await.unwrap();
                            Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
                        }
                    },
                ));
            Dispatcher::builder(bot, handler).build().dispatch().await;
        });

        let me = self.id();
        let app = Arc::clone(&self.app);
        tokio::spawn(async move {
            while let Some(msg) = msg_receiver.recv().await {
                let app = Arc::clone(&app);
                tokio::spawn(async move {
                    let text = msg.text().or(msg.caption()).unwrap_or_default();
                    for module in app.bot_modules().await.iter() {
                        let bot = app.bot(&me).unwrap();
                        let result = if text.starts_with("/start") {
                            let data = if text.len() > "/start ".len() {
                                &text["/start ".len()..]
                            } else {
                                ""
                            }
                            .to_string();
                            module
                                .handle_message(
                                    &bot,
                                    msg.from.as_ref().map(|u| u.id),
                                    msg.chat.id,
                                    MessageCommand::Start(data),
                                    text,
                                    &msg,
                                )
                                .await
                        } else if let Some(from_id) =
                            msg.from.as_ref().map(|u| u.id).or_else(|| {
                                if msg.chat.id.is_user() {
                                    Some(UserId(msg.chat.id.0.try_into().unwrap()))
                                } else {
                                    None
                                }
                            })
                        {
                            let dm_command = if msg.chat.id.is_user() {
                                bot.get_dm_message_command(&from_id).await
                            } else {
                                None
                            };
                            if let Some(command) = dm_command {
                                log::debug!(
                                    "chat={:?} (command {command:?}): {text}, module: {}",
                                    msg.chat.id,
                                    module.name()
                                );
                                module
                                    .handle_message(
                                        &bot,
                                        Some(from_id),
                                        msg.chat.id,
                                        command,
                                        text,
                                        &msg,
                                    )
                                    .await
                            } else {
                                log::debug!(
                                    "chat={:?} message (no command): {text}, module: {}",
                                    msg.chat.id,
                                    module.name()
                                );
                                module
                                    .handle_message(
                                        &bot,
                                        Some(from_id),
                                        msg.chat.id,
                                        MessageCommand::None,
                                        text,
                                        &msg,
                                    )
                                    .await
                            }
                        } else {
                            Ok(())
                        };
                        if let Err(err) = result {
                            warn!(
                                "Error handling message {} in module {}: {:?}",
                                text,
                                module.name(),
                                err
                            );
                        }
                    }
                });
            }
        });
        let app = Arc::clone(&self.app);
        tokio::spawn(async move {
            while let Some(callback_query) = callback_query_receiver.recv().await {
                let app = Arc::clone(&app);
                tokio::spawn(async move {
                    if let (Some(data), Some(message)) =
                        (callback_query.data, callback_query.message)
                    {
                        for module in app.bot_modules().await.iter() {
                            let bot = app.bot(&me).unwrap();
                            let context = TgCallbackContext::new(
                                bot.value(),
                                callback_query.from.id,
                                message.chat().id,
                                Some(message.id()),
                                &data,
                            );
                            log::debug!("Callback data: {data}, module: {}", module.name());
                            let mut query = Some(MustAnswerCallbackQuery {
                                bot_id: me,
                                callback_query: callback_query.id.clone(),
                                callback_query_answered: false,
                            });
                            if let Err(err) = module.handle_callback(context, &mut query).await {
                                warn!(
                                    "Error handling callback data {} in module {}: {:?}",
                                    data,
                                    module.name(),
                                    err
                                );
                            }
                            if let Some(query) = query {
                                query.answer_callback_query(&app).await;
                            }
                        }
                    }
                });
            }
        });
        Ok(())
    }

    pub fn bot(&self) -> &TgBot {
        &self.bot
    }

    pub fn app(&self) -> &Arc<AppState> {
        &self.app
    }

    pub fn id(&self) -> UserId {
        self.bot_id
    }

    pub async fn send_text_message(
        &self,
        chat_id: ChatId,
        message: String,
        reply_markup: impl Into<ReplyMarkup>,
    ) -> Result<Message, anyhow::Error> {
        Ok(self
            .bot
            .send_message(chat_id, &message)
            .parse_mode(ParseMode::MarkdownV2)
            .reply_markup(reply_markup)
            .link_preview_options(LinkPreviewOptions {
                is_disabled: true,
                url: None,
                prefer_small_media: false,
                prefer_large_media: false,
                show_above_text: false,
            })
            .await
            .inspect_err(log_parse_error(message))?)
    }

    /// Stores `data` under a short hash so it fits into Telegram's 64-byte
    /// callback data limit.
    pub async fn create_hash_reference(&self, data: String) -> Result<String, anyhow::Error> {
        let digest = Keccak256::digest(data.as_bytes());
        let reference = hex::encode(&digest[..16]);
        self.callback_data_cache
            .insert_if_not_exists(reference.clone(), data)
            .await?;
        Ok(reference)
    }

    pub async fn to_callback_data(&self, data: &TgCommand) -> String {
        let data = serde_json::to_string(data).unwrap();
        self.create_hash_reference(data)
            .await
            .expect("Error creating callback data")
    }

    pub async fn parse_callback_data(&self, reference: &str) -> Result<TgCommand, anyhow::Error> {
        let data = self
            .callback_data_cache
            .get(&reference.to_string())
            .await
            .ok_or_else(|| anyhow::anyhow!("Callback data cannot be restored"))?;
        Ok(serde_json::from_str(&data)?)
    }

    pub async fn get_dm_message_command(&self, user_id: &UserId) -> Option<MessageCommand> {
        self.dm_message_commands.get(user_id).await
    }

    pub async fn set_dm_message_command(
        &self,
        user_id: UserId,
        command: MessageCommand,
    ) -> Result<(), anyhow::Error> {
        self.dm_message_commands
            .insert_or_update(user_id, command)
            .await?;
        Ok(())
    }

    pub async fn remove_dm_message_command(&self, user_id: &UserId) -> Result<(), anyhow::Error> {
        self.dm_message_commands.remove(user_id).await?;
        Ok(())
    }
}

pub struct TgCallbackContext<'a> {
    bot: &'a BotData,
    user_id: UserId,
    chat_id: ChatId,
    last_message: Option<MessageId>,
    data: &'a str,
}

impl<'a> TgCallbackContext<'a> {
    pub fn new(
        bot: &'a BotData,
        user_id: UserId,
        chat_id: ChatId,
        last_message: Option<MessageId>,
        data: &'a str,
    ) -> Self {
        Self {
            bot,
            user_id,
            chat_id,
            last_message,
            data,
        }
    }

    pub fn bot(&self) -> &BotData {
        self.bot
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn chat_id(&self) -> ChatId {
        self.chat_id
    }

    pub fn message_id(&self) -> Option<MessageId> {
        self.last_message
    }

    pub async fn parse_command(&self) -> Result<TgCommand, anyhow::Error> {
        if self.data == DONT_CARE {
            return Err(anyhow::anyhow!("Tried to parse DONT_CARE callback data"));
        }
        self.bot.parse_callback_data(self.data).await
    }

    pub async fn edit_or_send(
        &mut self,
        text: impl Into<String>,
        reply_markup: InlineKeyboardMarkup,
    ) -> Result<(), anyhow::Error> {
        let text = text.into();
        if let Some(message_id) = self.last_message {
            let edit_result = self
                .bot
                .bot()
                .edit_message_text(self.chat_id, message_id, text.clone())
                .parse_mode(ParseMode::MarkdownV2)
                .link_preview_options(LinkPreviewOptions {
                    is_disabled: true,
                    url: None,
                    prefer_small_media: false,
                    prefer_large_media: false,
                    show_above_text: false,
                })
                .reply_markup(reply_markup.clone())
                .await;
            match edit_result {
                Ok(_) => {}
                Err(RequestError::Api(ApiError::MessageNotModified)) => {}
                Err(RequestError::Api(ApiError::Unknown(error_text))) => {
                    if error_text == "Bad Request: there is no text in the message to edit" {
                        let message = self
                            .bot
                            .send_text_message(self.chat_id, text, reply_markup)
                            .await?;
                        self.last_message = Some(message.id);
                    } else {
                        return Err(anyhow::anyhow!(
                            "Error editing message: Unknown error: {:?}",
                            error_text
                        ));
                    }
                }
                Err(err) => {
                    return Err(anyhow::anyhow!("Error editing message: {:?}", err));
                }
            }
        } else {
            let message = self
                .bot
                .send_text_message(self.chat_id, text, reply_markup)
                .await?;
            self.last_message = Some(message.id);
        }
        Ok(())
    }

    pub async fn reply(
        &self,
        text: impl Into<String>,
        reply_markup: impl Into<ReplyMarkup>,
    ) -> Result<Message, anyhow::Error> {
        let text = text.into();
        let message = self
            .bot
            .bot()
            .send_message(self.chat_id, text.clone())
            .reply_parameters(ReplyParameters {
                message_id: self
                    .message_id()
                    .ok_or_else(|| anyhow::anyhow!("No message to reply to"))?,
                allow_sending_without_reply: Some(true),
                ..Default::default()
            })
            .parse_mode(ParseMode::MarkdownV2)
            .reply_markup(reply_markup)
            .link_preview_options(LinkPreviewOptions {
                is_disabled: true,
                url: None,
                prefer_small_media: false,
                prefer_large_media: false,
                show_above_text: false,
            })
            .await
            .inspect_err(log_parse_error(text))?;
        Ok(message)
    }
}

pub struct MustAnswerCallbackQuery {
    bot_id: UserId,
    callback_query: String,
    callback_query_answered: bool,
}

impl MustAnswerCallbackQuery {
    pub async fn answer_callback_query(mut self, app: &AppState) {
        let bot = app
            .bot(&self.bot_id)
            .expect("Bot not found while answering a callback query");
        if let Err(err) = bot
            .bot()
            .answer_callback_query(self.callback_query.clone())
            .await
        {
            warn!(
                "Error answering callback query {}: {:?}",
                self.callback_query, err
            );
        }
        self.callback_query_answered = true;
    }
}

impl Drop for MustAnswerCallbackQuery {
    fn drop(&mut self) {
        if !self.callback_query_answered {
            panic!("Callback query {} was not answered", self.callback_query);
        }
    }
}

fn log_parse_error(text: impl Into<String>) -> impl FnOnce(&RequestError) {
    let text = text.into();
    move |err| {
        if let RequestError::Api(ApiError::CantParseEntities(s)) = err {
            log::warn!("Can't parse entities in message: {s}\n{text:?}");
        }
    }
}
