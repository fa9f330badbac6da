pub mod app;
pub mod bot_commands;
pub mod tgbot;
pub mod utils;

pub use mongodb;
pub use teloxide;
