//! Alert channel contract (spec §6) plus the Telegram implementation and
//! the operator command loop built on top of it.

pub mod operator;
pub mod telegram;

pub use operator::OperatorLoop;
pub use telegram::{AlertChannel, Chat, Message, TelegramChannel, Update, User};
