use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr};
use teloxide::prelude::ChatId;

use crate::utils::rpc::Address;

/// State of a multi-message conversation with a user in DM. Stored per user,
/// applied to the next message they send.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum MessageCommand {
    None,
    Start(String),
    /// The user was asked to send `<address> <amount>` for a withdrawal.
    WithdrawPrompt,
}

/// Commands encoded in inline keyboard callback data. Serialized to JSON and
/// stored behind a hash reference, since Telegram limits callback data to 64
/// bytes. Amounts are raw token units, stringified because JSON numbers
/// can't hold a u128.
#[serde_as]
#[derive(Serialize, Deserialize, Debug)]
pub enum TgCommand {
    WithdrawConfirm {
        to: Address,
        #[serde_as(as = "DisplayFromStr")]
        amount: u128,
    },
    WithdrawCancel,
    DrawSettle {
        target_chat_id: ChatId,
    },
}
