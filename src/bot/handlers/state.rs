use crate::config::Config;
use crate::db::Db;
use crate::panel::XuiGateway;
use crate::shop::Shop;
use std::collections::HashMap;
use std::sync::Arc;
use teloxide::types::Message;
use tokio::sync::Mutex;

#[derive(Clone)]
pub struct BotState {
    pub config: Arc<Config>,
    pub shop: Arc<Shop<XuiGateway>>,
    pub bot_username: Option<String>,
    /// Free-text answers the bot is waiting for, keyed by Telegram id.
    pub awaiting_input: Arc<Mutex<HashMap<i64, PendingInput>>>,
}

/// What the next plain-text message from a user answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingInput {
    CustomName {
        product_id: i64,
        discount_code: Option<String>,
    },
    DiscountCode {
        product_id: i64,
    },
    GiftCode,
    Ticket,
    /// Owner follow-up on their own ticket.
    TicketReply {
        ticket_id: i64,
    },
    /// Admin answer to a ticket.
    TicketAnswer {
        ticket_id: i64,
    },
}

impl BotState {
    pub fn db(&self) -> &Db {
        self.shop.db()
    }
}

pub fn sender_user_id(msg: &Message) -> Option<i64> {
    msg.from.as_ref().map(|user| user.id.0 as i64)
}

pub fn is_admin_message(msg: &Message, state: &BotState) -> bool {
    sender_user_id(msg).is_some_and(|user_id| state.config.is_admin(user_id))
}
