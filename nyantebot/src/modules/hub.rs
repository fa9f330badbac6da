use std::sync::Arc;

use async_trait::async_trait;
use nyantebot_common::app::{AppState, BotModule};
use nyantebot_common::bot_commands::MessageCommand;
use nyantebot_common::teloxide::prelude::{ChatId, Message, UserId};
use nyantebot_common::teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup};
use nyantebot_common::tgbot::{BotData, MustAnswerCallbackQuery, TgCallbackContext};

const HELP_TEXT: &str = "Available commands:

/deposit \\- get your deposit address \\(DM only\\)
/myaddress \\- show your deposit address and balance
/balance \\- show your NYANTE and BNB balances
/withdraw `<address>` `<amount>` \\- withdraw to an external address \\(DM only\\)
/tip `@user` `<amount>` \\- send tokens to another user, or reply with /tip `<amount>`
/rain `<amount>` \\- split tokens among everyone active in the chat
/draw `<amount>` \\- enter the chat's draw round
/help \\- show this message";

/// Serves `/start` and `/help`. Everything with a balance behind it lives in
/// the tipping module.
pub struct HubModule {
    #[allow(dead_code)]
    app: Arc<AppState>,
}

impl HubModule {
    pub fn new(app: Arc<AppState>) -> Self {
        Self { app }
    }
}

#[async_trait]
impl BotModule for HubModule {
    fn name(&self) -> &'static str {
        "Hub"
    }

    async fn handle_message(
        &self,
        bot: &BotData,
        user_id: Option<UserId>,
        chat_id: ChatId,
        command: MessageCommand,
        text: &str,
        _message: &Message,
    ) -> Result<(), anyhow::Error> {
        if user_id.is_none() {
            return Ok(());
        }
        match command {
            MessageCommand::Start(_) => {
                let message = format!(
                    "Hi\\! I'm the Nyantereum International tip bot\\.\n\n{HELP_TEXT}"
                );
                bot.send_text_message(chat_id, message, no_buttons()).await?;
            }
            MessageCommand::None => {
                if text.trim_end() == "/help" || text.starts_with("/help@") {
                    bot.send_text_message(chat_id, HELP_TEXT.to_string(), no_buttons())
                        .await?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn handle_callback<'a>(
        &'a self,
        _context: TgCallbackContext<'a>,
        _query: &mut Option<MustAnswerCallbackQuery>,
    ) -> Result<(), anyhow::Error> {
        Ok(())
    }
}

fn no_buttons() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(Vec::<Vec<InlineKeyboardButton>>::new())
}
