use super::format::{render_service_card, service_button_title};
use super::state::{BotState, PendingInput};
use crate::db::DiscountKind;
use crate::shop::ShopError;
use anyhow::anyhow;
use image::{DynamicImage, ImageFormat, Luma};
use qrcode::QrCode;
use std::io::Cursor;
use teloxide::prelude::*;
use teloxide::types::{InlineKeyboardMarkup, InputFile, MessageId};

pub type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Keeps `buy_confirm:<id>:<code>` inside Telegram's 64-byte callback limit.
pub const MAX_CODE_LEN: usize = 32;

/// Referral code from a `/start <code>` deep link.
pub fn parse_start_token(text: &str) -> Option<String> {
    let mut parts = text.split_whitespace();
    let command = parts.next()?;
    if !command.starts_with("/start") {
        return None;
    }
    let token = parts.next()?.trim();
    if token.is_empty() {
        return None;
    }

    let decoded = match urlencoding::decode(token) {
        Ok(value) => value.into_owned(),
        Err(_) => token.to_string(),
    };
    let normalized = decoded.trim().trim_matches('`').trim();
    if normalized.is_empty() {
        None
    } else {
        Some(normalized.to_string())
    }
}

pub fn parse_callback_id(data: &str, prefix: &str) -> Result<i64, anyhow::Error> {
    data.strip_prefix(prefix)
        .ok_or_else(|| anyhow!("Malformed callback payload"))?
        .parse::<i64>()
        .map_err(|_| anyhow!("Malformed callback id"))
}

pub fn parse_callback_pair(data: &str, prefix: &str) -> Result<(i64, i64), anyhow::Error> {
    let payload = data
        .strip_prefix(prefix)
        .ok_or_else(|| anyhow!("Malformed callback payload"))?;
    let mut parts = payload.split(':');
    let first = parts
        .next()
        .ok_or_else(|| anyhow!("Missing first callback value"))?
        .parse::<i64>()
        .map_err(|_| anyhow!("Malformed first callback value"))?;
    let second = parts
        .next()
        .ok_or_else(|| anyhow!("Missing second callback value"))?
        .parse::<i64>()
        .map_err(|_| anyhow!("Malformed second callback value"))?;
    Ok((first, second))
}

pub fn callback_message_target(q: &CallbackQuery) -> Option<(ChatId, MessageId)> {
    q.message.as_ref().map(|msg| (msg.chat().id, msg.id()))
}

pub fn callback_prefix_filter(prefix: &'static str) -> impl Fn(CallbackQuery) -> Option<CallbackQuery> {
    move |q: CallbackQuery| {
        if q.data.as_deref().is_some_and(|payload| payload.starts_with(prefix)) {
            Some(q)
        } else {
            None
        }
    }
}

pub async fn require_admin_callback(
    bot: &Bot,
    q: &CallbackQuery,
    state: &BotState,
) -> Result<Option<i64>, anyhow::Error> {
    let admin_id = q.from.id.0 as i64;
    if !state.config.is_admin(admin_id) {
        bot.answer_callback_query(q.id.clone())
            .text("⛔ دسترسی ندارید")
            .show_alert(true)
            .await?;
        return Ok(None);
    }
    Ok(Some(admin_id))
}

pub fn build_referral_link(bot_username: &str, code: &str) -> String {
    let normalized = bot_username.trim_start_matches('@');
    format!("https://t.me/{}?start={}", normalized, code)
}

pub fn build_qr_png_bytes(payload: &str) -> Result<Vec<u8>, anyhow::Error> {
    let qr = QrCode::new(payload.as_bytes())?;
    let image = qr
        .render::<Luma<u8>>()
        .quiet_zone(true)
        .min_dimensions(512, 512)
        .build();
    let mut bytes = Vec::new();
    {
        let mut cursor = Cursor::new(&mut bytes);
        DynamicImage::ImageLuma8(image).write_to(&mut cursor, ImageFormat::Png)?;
    }
    Ok(bytes)
}

pub async fn send_link_qr(bot: &Bot, chat_id: ChatId, link: &str, name: &str) -> HandlerResult {
    let png = build_qr_png_bytes(link)?;
    bot.send_photo(
        chat_id,
        InputFile::memory(png).file_name(format!("{}.png", name)),
    )
    .caption(format!("📷 QR کد سرویس {}", name))
    .await?;
    Ok(())
}

/// Posts to the reports chat, if one is configured. Failures are only logged.
pub async fn send_report(bot: &Bot, state: &BotState, text: String) {
    let Some(chat_id) = state.config.reports_chat_id else {
        return;
    };
    if let Err(error) = bot.send_message(ChatId(chat_id), text).await {
        tracing::warn!(chat_id, error = %error, "Failed to deliver report");
    }
}

/// Logs the failure and shows the user-facing text in `chat_id`.
pub async fn reply_shop_error(bot: &Bot, chat_id: ChatId, error: &ShopError) -> HandlerResult {
    match error {
        ShopError::Panel(_) | ShopError::Storage(_) => {
            tracing::error!(error = %error, "Shop operation failed")
        }
        _ => tracing::info!(error = %error, "Shop operation declined"),
    }
    bot.send_message(chat_id, error.user_message()).await?;
    Ok(())
}

pub async fn show_services_page(
    bot: &Bot,
    chat_id: ChatId,
    state: &BotState,
    tg_user_id: i64,
    requested_page: i64,
    message_id: Option<MessageId>,
) -> HandlerResult {
    let Some(user) = state.db().get_user_by_tg(tg_user_id).await? else {
        bot.send_message(chat_id, "❌ ابتدا /start را ارسال کنید.").await?;
        return Ok(());
    };
    let total = state.db().count_user_services(user.id).await?;
    let page_size = state.config.services_page_size.max(1);
    if total <= 0 {
        let text = "📦 هنوز سرویسی ندارید. از «🛒 خرید سرویس» شروع کنید.";
        if let Some(message_id) = message_id {
            bot.edit_message_text(chat_id, message_id, text)
                .reply_markup(InlineKeyboardMarkup::default())
                .await?;
        } else {
            bot.send_message(chat_id, text).await?;
        }
        return Ok(());
    }

    let total_pages = ((total + page_size - 1) / page_size).max(1);
    let page = requested_page.clamp(1, total_pages);
    let offset = (page - 1) * page_size;
    let services = state
        .db()
        .list_user_services_page(user.id, page_size, offset)
        .await?;
    let titles: Vec<(i64, String)> = services
        .iter()
        .map(|service| (service.id, service_button_title(service)))
        .collect();

    let text = format!(
        "📦 سرویس‌های شما\nتعداد: {}\nصفحه: {}/{}\n\nبرای مشاهده جزئیات روی سرویس بزنید.",
        total, page, total_pages
    );
    let keyboard = crate::bot::keyboards::services_page_keyboard(&titles, page, total_pages);
    if let Some(message_id) = message_id {
        bot.edit_message_text(chat_id, message_id, text)
            .reply_markup(keyboard)
            .await?;
    } else {
        bot.send_message(chat_id, text).reply_markup(keyboard).await?;
    }
    Ok(())
}

pub async fn show_service_card(
    bot: &Bot,
    chat_id: ChatId,
    message_id: MessageId,
    state: &BotState,
    tg_user_id: i64,
    service_id: i64,
    page: i64,
) -> HandlerResult {
    let snapshot = match state.shop.service_status(tg_user_id, service_id).await {
        Ok(snapshot) => snapshot,
        Err(error) => return reply_shop_error(bot, chat_id, &error).await,
    };
    bot.edit_message_text(
        chat_id,
        message_id,
        render_service_card(&snapshot, chrono::Utc::now()),
    )
    .reply_markup(crate::bot::keyboards::service_card_keyboard(service_id, page))
    .await?;
    Ok(())
}

pub async fn mark_pending_input(state: &BotState, tg_user_id: i64, input: PendingInput) {
    state.awaiting_input.lock().await.insert(tg_user_id, input);
}

pub async fn take_pending_input(state: &BotState, tg_user_id: i64) -> Option<PendingInput> {
    state.awaiting_input.lock().await.remove(&tg_user_id)
}

/// Sends `text` to every admin; delivery failures are only logged.
pub async fn notify_admins(
    bot: &Bot,
    state: &BotState,
    text: &str,
    keyboard: Option<InlineKeyboardMarkup>,
) {
    for &admin_id in &state.config.admin_ids {
        let mut request = bot.send_message(ChatId(admin_id), text);
        if let Some(keyboard) = keyboard.clone() {
            request = request.reply_markup(keyboard);
        }
        if let Err(error) = request.await {
            tracing::warn!(admin_id, error = %error, "Failed to notify admin");
        }
    }
}

/// Runs the purchase and delivers the receipt, QR code and report.
pub async fn complete_purchase(
    bot: &Bot,
    chat_id: ChatId,
    state: &BotState,
    tg_user_id: i64,
    product_id: i64,
    custom_name: Option<&str>,
    discount_code: Option<&str>,
) -> HandlerResult {
    let purchase = match state
        .shop
        .purchase(tg_user_id, product_id, custom_name, discount_code)
        .await
    {
        Ok(purchase) => purchase,
        Err(error) => return reply_shop_error(bot, chat_id, &error).await,
    };

    let is_admin = state.config.is_admin(tg_user_id);
    bot.send_message(chat_id, super::format::render_purchase_receipt(&purchase))
        .reply_markup(crate::bot::keyboards::menu_for(is_admin))
        .await?;
    if let Some(link) = purchase.subscription_link.as_deref() {
        send_link_qr(bot, chat_id, link, &purchase.service.client_name).await?;
    }

    if let Some(user) = state.db().get_user_by_tg(tg_user_id).await? {
        send_report(bot, state, super::format::purchase_report(&user, &purchase)).await;
    }
    Ok(())
}

pub struct TopUpArgs {
    pub tg_user_id: i64,
    pub amount: i64,
}

pub fn parse_topup_args(text: &str) -> Option<TopUpArgs> {
    let mut parts = text.split_whitespace().skip(1);
    let tg_user_id = parts.next()?.parse::<i64>().ok()?;
    let amount = parts.next()?.replace(',', "").parse::<i64>().ok()?;
    if amount <= 0 || parts.next().is_some() {
        return None;
    }
    Some(TopUpArgs { tg_user_id, amount })
}

#[derive(Debug, PartialEq)]
pub struct AddPanelArgs {
    pub name: String,
    pub api_url: String,
    pub username: String,
    pub password: String,
    pub inbound_id: i64,
    pub subscription_url: Option<String>,
}

pub fn parse_addpanel_args(text: &str) -> Option<AddPanelArgs> {
    let args: Vec<&str> = text.split_whitespace().skip(1).collect();
    if !(5..=6).contains(&args.len()) {
        return None;
    }
    let api_url = args[1];
    if !(api_url.starts_with("http://") || api_url.starts_with("https://")) {
        return None;
    }
    Some(AddPanelArgs {
        name: args[0].to_string(),
        api_url: api_url.to_string(),
        username: args[2].to_string(),
        password: args[3].to_string(),
        inbound_id: args[4].parse().ok()?,
        subscription_url: args.get(5).map(|url| url.to_string()),
    })
}

#[derive(Debug, PartialEq)]
pub struct AddProductArgs {
    pub panel_id: i64,
    pub volume_gb: i64,
    pub duration_days: i64,
    pub price: i64,
    pub name: String,
}

pub fn parse_addproduct_args(text: &str) -> Option<AddProductArgs> {
    let mut parts = text.split_whitespace().skip(1);
    let panel_id = parts.next()?.parse::<i64>().ok()?;
    let volume_gb = parts.next()?.parse::<i64>().ok()?;
    let duration_days = parts.next()?.parse::<i64>().ok()?;
    let price = parts.next()?.replace(',', "").parse::<i64>().ok()?;
    let name = parts.collect::<Vec<_>>().join(" ");
    if name.is_empty() || volume_gb < 0 || duration_days < 0 || price < 0 {
        return None;
    }
    Some(AddProductArgs {
        panel_id,
        volume_gb,
        duration_days,
        price,
        name,
    })
}

/// `buy_confirm:<product_id>[:<discount code>]`.
pub fn parse_buy_confirm(data: &str) -> Result<(i64, Option<String>), anyhow::Error> {
    let payload = data
        .strip_prefix("buy_confirm:")
        .ok_or_else(|| anyhow!("Malformed callback payload"))?;
    let (product, code) = match payload.split_once(':') {
        Some((product, code)) => (product, Some(code)),
        None => (payload, None),
    };
    let product_id = product
        .parse::<i64>()
        .map_err(|_| anyhow!("Malformed callback id"))?;
    let code = code
        .map(crate::naming::clean_name)
        .filter(|code| !code.is_empty());
    Ok((product_id, code))
}

#[derive(Debug, PartialEq)]
pub struct GiftCodeArgs {
    pub amount: i64,
    pub max_uses: i64,
    pub valid_days: Option<i64>,
    pub code: Option<String>,
}

/// `/addgift <amount> <max_uses> [days] [code]`; `days = 0` means no expiry.
pub fn parse_addgift_args(text: &str) -> Option<GiftCodeArgs> {
    let mut parts = text.split_whitespace().skip(1);
    let amount = parts.next()?.replace(',', "").parse::<i64>().ok()?;
    let max_uses = parts.next()?.parse::<i64>().ok()?;
    let (valid_days, code) = parse_code_tail(&mut parts)?;
    if amount <= 0 || max_uses < 0 {
        return None;
    }
    Some(GiftCodeArgs {
        amount,
        max_uses,
        valid_days,
        code,
    })
}

#[derive(Debug, PartialEq)]
pub struct DiscountCodeArgs {
    pub kind: DiscountKind,
    pub value: i64,
    pub max_uses: i64,
    pub valid_days: Option<i64>,
    pub code: Option<String>,
}

/// `/adddiscount <value>[%] <max_uses> [days] [code]`.
pub fn parse_adddiscount_args(text: &str) -> Option<DiscountCodeArgs> {
    let mut parts = text.split_whitespace().skip(1);
    let raw_value = parts.next()?.replace(',', "");
    let (kind, value) = match raw_value.strip_suffix('%') {
        Some(percent) => (DiscountKind::Percent, percent.parse::<i64>().ok()?),
        None => (DiscountKind::Fixed, raw_value.parse::<i64>().ok()?),
    };
    let max_uses = parts.next()?.parse::<i64>().ok()?;
    let (valid_days, code) = parse_code_tail(&mut parts)?;
    let value_ok = match kind {
        DiscountKind::Percent => (1..=100).contains(&value),
        DiscountKind::Fixed => value > 0,
    };
    if !value_ok || max_uses < 0 {
        return None;
    }
    Some(DiscountCodeArgs {
        kind,
        value,
        max_uses,
        valid_days,
        code,
    })
}

fn parse_code_tail<'a>(
    parts: &mut impl Iterator<Item = &'a str>,
) -> Option<(Option<i64>, Option<String>)> {
    let valid_days = match parts.next() {
        Some(days) => Some(days.parse::<i64>().ok()?).filter(|days| *days > 0),
        None => None,
    };
    let code = match parts.next() {
        Some(code) => {
            let code = crate::naming::clean_name(code);
            if code.is_empty() || code.len() > MAX_CODE_LEN {
                return None;
            }
            Some(code)
        }
        None => None,
    };
    if parts.next().is_some() {
        return None;
    }
    Some((valid_days, code))
}

/// `/reply <ticket_id> <text...>`.
pub fn parse_reply_args(text: &str) -> Option<(i64, String)> {
    let rest = text.split_once(char::is_whitespace)?.1.trim_start();
    let (id, body) = rest.split_once(char::is_whitespace)?;
    let body = body.trim();
    if body.is_empty() {
        return None;
    }
    Some((id.parse().ok()?, body.to_string()))
}

/// First argument of a command as an id.
pub fn parse_id_arg(text: &str) -> Option<i64> {
    text.split_whitespace().nth(1)?.parse().ok()
}
