use super::commands::{admin_show_panels, admin_show_stats, cmd_help};
use super::format::{
    admin_help_text, help_text, render_gift_receipt, render_purchase_preview, render_referral,
    render_spin_outcome, render_wallet, ticket_notice,
};
use super::shared::{
    build_referral_link, complete_purchase, mark_pending_input, notify_admins, reply_shop_error,
    show_services_page, take_pending_input, HandlerResult, MAX_CODE_LEN,
};
use super::state::{sender_user_id, BotState, PendingInput};
use crate::bot::keyboards;
use crate::naming::clean_name;
use teloxide::prelude::*;

const RECENT_TRANSACTIONS: i64 = 5;

pub async fn handle_menu_buttons(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    let Some(text) = msg.text() else {
        return Ok(());
    };
    let Some(user_id) = sender_user_id(&msg) else {
        return Ok(());
    };
    let is_admin = state.config.is_admin(user_id);

    if try_process_pending_input(&bot, &msg, &state, user_id).await? {
        return Ok(());
    }

    match text {
        keyboards::BTN_BUY => {
            show_panels_for_purchase(&bot, msg.chat.id, &state).await?;
        }
        keyboards::BTN_SERVICES => {
            show_services_page(&bot, msg.chat.id, &state, user_id, 1, None).await?;
        }
        keyboards::BTN_WALLET => {
            show_wallet(&bot, msg.chat.id, &state, user_id).await?;
        }
        keyboards::BTN_REFERRAL => {
            show_referral(&bot, msg.chat.id, &state, user_id).await?;
        }
        keyboards::BTN_GIFT => {
            mark_pending_input(&state, user_id, PendingInput::GiftCode).await;
            bot.send_message(msg.chat.id, "🎁 کد هدیه خود را ارسال کنید:")
                .reply_markup(keyboards::prompt_cancel_keyboard())
                .await?;
        }
        keyboards::BTN_WHEEL => {
            spin_wheel(&bot, msg.chat.id, &state, user_id).await?;
        }
        keyboards::BTN_SUPPORT => {
            mark_pending_input(&state, user_id, PendingInput::Ticket).await;
            bot.send_message(
                msg.chat.id,
                "🎫 پیام خود را برای پشتیبانی بنویسید. یک تیکت ثبت می‌شود و پاسخ را همین‌جا دریافت می‌کنید:",
            )
            .reply_markup(keyboards::prompt_cancel_keyboard())
            .await?;
        }
        keyboards::BTN_HELP => {
            bot.send_message(msg.chat.id, help_text())
                .reply_markup(keyboards::menu_for(is_admin))
                .await?;
        }
        keyboards::BTN_ADMIN_STATS if is_admin => {
            admin_show_stats(&bot, msg.chat.id, &state).await?;
        }
        keyboards::BTN_ADMIN_PANELS if is_admin => {
            admin_show_panels(&bot, msg.chat.id, &state).await?;
        }
        keyboards::BTN_ADMIN_HELP if is_admin => {
            bot.send_message(msg.chat.id, admin_help_text())
                .reply_markup(keyboards::admin_menu())
                .await?;
        }
        _ if text.starts_with('/') => {
            cmd_help(bot, msg, state).await?;
        }
        _ => {
            bot.send_message(msg.chat.id, "متوجه نشدم. لطفاً از دکمه‌های منو استفاده کنید.")
                .reply_markup(keyboards::menu_for(is_admin))
                .await?;
        }
    }
    Ok(())
}

/// Consumes a pending prompt; returns `true` when the message was its answer.
/// Commands and menu buttons drop the prompt and are routed as usual.
async fn try_process_pending_input(
    bot: &Bot,
    msg: &Message,
    state: &BotState,
    user_id: i64,
) -> Result<bool, Box<dyn std::error::Error + Send + Sync>> {
    let text = msg.text().unwrap_or("").trim();
    if text.starts_with('/') {
        return Ok(false);
    }
    let Some(pending) = take_pending_input(state, user_id).await else {
        return Ok(false);
    };
    if keyboards::is_menu_button(text) {
        tracing::debug!(user_id, ?pending, "Pending prompt dropped by menu button");
        return Ok(false);
    }

    let chat_id = msg.chat.id;
    match pending {
        PendingInput::CustomName {
            product_id,
            discount_code,
        } => {
            if clean_name(text).is_empty() {
                mark_pending_input(
                    state,
                    user_id,
                    PendingInput::CustomName {
                        product_id,
                        discount_code,
                    },
                )
                .await;
                bot.send_message(
                    chat_id,
                    "❌ نام باید شامل حروف یا اعداد انگلیسی باشد. دوباره ارسال کنید:",
                )
                .reply_markup(keyboards::prompt_cancel_keyboard())
                .await?;
                return Ok(true);
            }
            complete_purchase(
                bot,
                chat_id,
                state,
                user_id,
                product_id,
                Some(text),
                discount_code.as_deref(),
            )
            .await?;
        }
        PendingInput::DiscountCode { product_id } => {
            let code = clean_name(text);
            if code.is_empty() || code.len() > MAX_CODE_LEN {
                mark_pending_input(state, user_id, PendingInput::DiscountCode { product_id }).await;
                bot.send_message(chat_id, "❌ کد تخفیف نامعتبر است. دوباره ارسال کنید:")
                    .reply_markup(keyboards::prompt_cancel_keyboard())
                    .await?;
                return Ok(true);
            }
            let quote = match state
                .shop
                .quote_purchase(user_id, product_id, Some(&code))
                .await
            {
                Ok(quote) => quote,
                Err(error) => {
                    reply_shop_error(bot, chat_id, &error).await?;
                    return Ok(true);
                }
            };
            let mut request = bot.send_message(chat_id, render_purchase_preview(&quote));
            if quote.affordable() {
                request = request.reply_markup(keyboards::purchase_confirm_keyboard(
                    product_id,
                    Some(&code),
                ));
            }
            request.await?;
        }
        PendingInput::GiftCode => match state.shop.redeem_gift_code(user_id, text).await {
            Ok(receipt) => {
                bot.send_message(chat_id, render_gift_receipt(&receipt))
                    .reply_markup(keyboards::menu_for(state.config.is_admin(user_id)))
                    .await?;
            }
            Err(error) => reply_shop_error(bot, chat_id, &error).await?,
        },
        PendingInput::Ticket => {
            let ticket = match state.shop.open_ticket(user_id, text).await {
                Ok(ticket) => ticket,
                Err(error) => {
                    reply_shop_error(bot, chat_id, &error).await?;
                    return Ok(true);
                }
            };
            bot.send_message(
                chat_id,
                format!(
                    "✅ تیکت #{} ثبت شد. پاسخ پشتیبانی در همین گفتگو ارسال می‌شود.",
                    ticket.id
                ),
            )
            .await?;
            let notice = ticket_notice(&ticket, &sender_label(msg, user_id), text, true);
            notify_admins(bot, state, &notice, Some(keyboards::ticket_admin_keyboard(ticket.id)))
                .await;
        }
        PendingInput::TicketReply { ticket_id } => {
            let ticket = match state
                .shop
                .add_user_ticket_message(user_id, ticket_id, text)
                .await
            {
                Ok(ticket) => ticket,
                Err(error) => {
                    reply_shop_error(bot, chat_id, &error).await?;
                    return Ok(true);
                }
            };
            bot.send_message(chat_id, format!("✅ پیام شما به تیکت #{} اضافه شد.", ticket.id))
                .await?;
            let notice = ticket_notice(&ticket, &sender_label(msg, user_id), text, false);
            notify_admins(bot, state, &notice, Some(keyboards::ticket_admin_keyboard(ticket.id)))
                .await;
        }
        PendingInput::TicketAnswer { ticket_id } => {
            answer_ticket(bot, chat_id, state, user_id, ticket_id, text).await?;
        }
    }
    Ok(true)
}

fn sender_label(msg: &Message, user_id: i64) -> String {
    let name = msg
        .from
        .as_ref()
        .map(|from| {
            crate::naming::format_display_name(
                from.username.as_deref(),
                Some(from.first_name.as_str()),
                from.last_name.as_deref(),
            )
        })
        .unwrap_or_default();
    format!("{} ({})", name, user_id)
}

/// Sends an admin answer to the ticket owner.
pub async fn answer_ticket(
    bot: &Bot,
    chat_id: ChatId,
    state: &BotState,
    admin_id: i64,
    ticket_id: i64,
    body: &str,
) -> HandlerResult {
    if !state.config.is_admin(admin_id) {
        return Ok(());
    }
    let (ticket, owner_tg_id) = match state.shop.answer_ticket(admin_id, ticket_id, body).await {
        Ok(answered) => answered,
        Err(error) => return reply_shop_error(bot, chat_id, &error).await,
    };
    let delivered = bot
        .send_message(
            ChatId(owner_tg_id),
            format!("📩 پاسخ پشتیبانی به تیکت #{}:\n\n{}", ticket.id, body),
        )
        .reply_markup(keyboards::ticket_reply_keyboard(ticket.id))
        .await;
    let text = match delivered {
        Ok(_) => format!("✅ پاسخ تیکت #{} ارسال شد.", ticket.id),
        Err(error) => {
            tracing::warn!(ticket_id, owner_tg_id, error = %error, "Failed to deliver ticket answer");
            format!("⚠️ پاسخ ثبت شد اما به کاربر تحویل نشد: {}", error)
        }
    };
    bot.send_message(chat_id, text).await?;
    Ok(())
}

async fn spin_wheel(bot: &Bot, chat_id: ChatId, state: &BotState, tg_user_id: i64) -> HandlerResult {
    match state.shop.spin_wheel(tg_user_id).await {
        Ok(outcome) => {
            bot.send_message(chat_id, render_spin_outcome(&outcome)).await?;
            Ok(())
        }
        Err(error) => reply_shop_error(bot, chat_id, &error).await,
    }
}

pub async fn show_panels_for_purchase(bot: &Bot, chat_id: ChatId, state: &BotState) -> HandlerResult {
    let panels = state.db().list_panels(true).await?;
    if panels.is_empty() {
        bot.send_message(chat_id, "در حال حاضر سروری برای فروش موجود نیست.")
            .await?;
        return Ok(());
    }
    bot.send_message(chat_id, "🌐 سرور مورد نظر را انتخاب کنید:")
        .reply_markup(keyboards::panels_keyboard(&panels))
        .await?;
    Ok(())
}

async fn show_wallet(bot: &Bot, chat_id: ChatId, state: &BotState, tg_user_id: i64) -> HandlerResult {
    let Some(user) = state.db().get_user_by_tg(tg_user_id).await? else {
        bot.send_message(chat_id, "❌ ابتدا /start را ارسال کنید.").await?;
        return Ok(());
    };
    let transactions = state
        .db()
        .list_transactions(user.id, RECENT_TRANSACTIONS)
        .await?;
    bot.send_message(chat_id, render_wallet(&user, &transactions))
        .reply_markup(keyboards::menu_for(state.config.is_admin(tg_user_id)))
        .await?;
    Ok(())
}

async fn show_referral(
    bot: &Bot,
    chat_id: ChatId,
    state: &BotState,
    tg_user_id: i64,
) -> HandlerResult {
    let Some(user) = state.db().get_user_by_tg(tg_user_id).await? else {
        bot.send_message(chat_id, "❌ ابتدا /start را ارسال کنید.").await?;
        return Ok(());
    };
    let invited = state.db().count_referrals(user.id).await?;
    let link = state
        .bot_username
        .as_deref()
        .map(|bot_username| build_referral_link(bot_username, &user.referral_code));
    let referral = &state.config.referral;
    bot.send_message(
        chat_id,
        render_referral(
            &user,
            invited,
            link.as_deref(),
            referral.reward_amount,
            referral.enabled,
        ),
    )
    .await?;
    Ok(())
}
