use super::commands::admin_close_ticket;
use super::format::{
    render_purchase_preview, render_renewal_quote, render_renewal_receipt, renewal_report,
};
use super::shared::{
    callback_message_target, callback_prefix_filter, complete_purchase, mark_pending_input,
    parse_buy_confirm, parse_callback_id, parse_callback_pair, reply_shop_error,
    require_admin_callback, send_link_qr, send_report, show_service_card, show_services_page,
    take_pending_input, HandlerResult,
};
use super::state::{BotState, PendingInput};
use crate::bot::keyboards;
use crate::naming::NamingMethod;
use crate::renewal::RenewalMethod;
use teloxide::dptree;
use teloxide::prelude::*;
use teloxide::types::InlineKeyboardMarkup;

pub fn handler() -> teloxide::dispatching::UpdateHandler<Box<dyn std::error::Error + Send + Sync + 'static>> {
    Update::filter_callback_query()
        .branch(dptree::filter_map(callback_prefix_filter("cancel")).endpoint(callback_cancel))
        .branch(dptree::filter_map(callback_prefix_filter("buy_back")).endpoint(callback_buy_back))
        .branch(dptree::filter_map(callback_prefix_filter("buy_panel:")).endpoint(callback_buy_panel))
        .branch(
            dptree::filter_map(callback_prefix_filter("buy_product:")).endpoint(callback_buy_product),
        )
        .branch(
            dptree::filter_map(callback_prefix_filter("buy_confirm:")).endpoint(callback_buy_confirm),
        )
        .branch(dptree::filter_map(callback_prefix_filter("buy_code:")).endpoint(callback_buy_code))
        .branch(dptree::filter_map(callback_prefix_filter("svc_page:")).endpoint(callback_services_page))
        .branch(dptree::filter_map(callback_prefix_filter("svc_open:")).endpoint(callback_service_open))
        .branch(dptree::filter_map(callback_prefix_filter("svc_qr:")).endpoint(callback_service_qr))
        .branch(dptree::filter_map(callback_prefix_filter("svc_renew:")).endpoint(callback_service_renew))
        .branch(dptree::filter_map(callback_prefix_filter("renew_pick:")).endpoint(callback_renew_pick))
        .branch(dptree::filter_map(callback_prefix_filter("renew_ok:")).endpoint(callback_renew_confirm))
        .branch(
            dptree::filter_map(callback_prefix_filter("set_renewal:")).endpoint(callback_set_renewal),
        )
        .branch(dptree::filter_map(callback_prefix_filter("set_naming:")).endpoint(callback_set_naming))
        .branch(
            dptree::filter_map(callback_prefix_filter("ticket_reply:")).endpoint(callback_ticket_reply),
        )
        .branch(
            dptree::filter_map(callback_prefix_filter("ticket_answer:"))
                .endpoint(callback_ticket_answer),
        )
        .branch(
            dptree::filter_map(callback_prefix_filter("ticket_close:")).endpoint(callback_ticket_close),
        )
}

async fn callback_cancel(bot: Bot, q: CallbackQuery, state: BotState) -> HandlerResult {
    take_pending_input(&state, q.from.id.0 as i64).await;
    bot.answer_callback_query(q.id.clone()).text("لغو شد").await?;
    if let Some((chat_id, message_id)) = callback_message_target(&q) {
        bot.edit_message_text(chat_id, message_id, "❌ عملیات لغو شد.")
            .reply_markup(InlineKeyboardMarkup::default())
            .await?;
    }
    Ok(())
}

async fn callback_buy_back(bot: Bot, q: CallbackQuery, state: BotState) -> HandlerResult {
    bot.answer_callback_query(q.id.clone()).await?;
    let Some((chat_id, message_id)) = callback_message_target(&q) else {
        return Ok(());
    };
    let panels = state.db().list_panels(true).await?;
    bot.edit_message_text(chat_id, message_id, "🌐 سرور مورد نظر را انتخاب کنید:")
        .reply_markup(keyboards::panels_keyboard(&panels))
        .await?;
    Ok(())
}

async fn callback_buy_panel(bot: Bot, q: CallbackQuery, state: BotState) -> HandlerResult {
    let data = q.data.as_deref().unwrap_or("");
    let panel_id = parse_callback_id(data, "buy_panel:")?;
    let products = state.db().list_products(panel_id).await?;
    if products.is_empty() {
        bot.answer_callback_query(q.id.clone())
            .text("برای این سرور محصولی تعریف نشده است")
            .show_alert(true)
            .await?;
        return Ok(());
    }

    bot.answer_callback_query(q.id.clone()).await?;
    if let Some((chat_id, message_id)) = callback_message_target(&q) {
        bot.edit_message_text(chat_id, message_id, "📦 بسته مورد نظر را انتخاب کنید:")
            .reply_markup(keyboards::products_keyboard(&products))
            .await?;
    }
    Ok(())
}

async fn callback_buy_product(bot: Bot, q: CallbackQuery, state: BotState) -> HandlerResult {
    let data = q.data.as_deref().unwrap_or("");
    let product_id = parse_callback_id(data, "buy_product:")?;
    let tg_user_id = q.from.id.0 as i64;

    let quote = match state.shop.quote_purchase(tg_user_id, product_id, None).await {
        Ok(quote) => quote,
        Err(error) => {
            tracing::info!(tg_user_id, product_id, error = %error, "Purchase quote declined");
            bot.answer_callback_query(q.id.clone())
                .text(error.user_message())
                .show_alert(true)
                .await?;
            return Ok(());
        }
    };

    bot.answer_callback_query(q.id.clone()).await?;
    if let Some((chat_id, message_id)) = callback_message_target(&q) {
        let keyboard = if quote.affordable() {
            keyboards::purchase_confirm_keyboard(product_id, None)
        } else {
            InlineKeyboardMarkup::default().append_row(vec![
                teloxide::types::InlineKeyboardButton::callback("🔙 بازگشت", "buy_back"),
            ])
        };
        bot.edit_message_text(chat_id, message_id, render_purchase_preview(&quote))
            .reply_markup(keyboard)
            .await?;
    }
    Ok(())
}

async fn callback_buy_code(bot: Bot, q: CallbackQuery, state: BotState) -> HandlerResult {
    let data = q.data.as_deref().unwrap_or("");
    let product_id = parse_callback_id(data, "buy_code:")?;
    bot.answer_callback_query(q.id.clone()).await?;
    let Some((chat_id, _)) = callback_message_target(&q) else {
        return Ok(());
    };
    mark_pending_input(
        &state,
        q.from.id.0 as i64,
        PendingInput::DiscountCode { product_id },
    )
    .await;
    bot.send_message(chat_id, "🎟 کد تخفیف خود را ارسال کنید:")
        .reply_markup(keyboards::prompt_cancel_keyboard())
        .await?;
    Ok(())
}

async fn callback_buy_confirm(bot: Bot, q: CallbackQuery, state: BotState) -> HandlerResult {
    let data = q.data.as_deref().unwrap_or("");
    let (product_id, discount_code) = parse_buy_confirm(data)?;
    let tg_user_id = q.from.id.0 as i64;
    let Some((chat_id, message_id)) = callback_message_target(&q) else {
        bot.answer_callback_query(q.id.clone()).await?;
        return Ok(());
    };
    tracing::info!(tg_user_id, product_id, discount_code = ?discount_code, "Purchase confirmed");

    bot.answer_callback_query(q.id.clone()).text("در حال ساخت سرویس...").await?;
    bot.edit_message_reply_markup(chat_id, message_id)
        .reply_markup(InlineKeyboardMarkup::default())
        .await?;

    let naming = state.shop.naming_method().await?;
    if matches!(
        naming,
        NamingMethod::UserCustom | NamingMethod::UserCustomRandom
    ) {
        mark_pending_input(
            &state,
            tg_user_id,
            PendingInput::CustomName {
                product_id,
                discount_code,
            },
        )
        .await;
        bot.send_message(
            chat_id,
            "✏️ یک نام برای سرویس خود ارسال کنید (حروف و اعداد انگلیسی):",
        )
        .reply_markup(keyboards::prompt_cancel_keyboard())
        .await?;
        return Ok(());
    }

    complete_purchase(
        &bot,
        chat_id,
        &state,
        tg_user_id,
        product_id,
        None,
        discount_code.as_deref(),
    )
    .await
}

async fn callback_services_page(bot: Bot, q: CallbackQuery, state: BotState) -> HandlerResult {
    let data = q.data.as_deref().unwrap_or("");
    let page = parse_callback_id(data, "svc_page:")?.max(1);
    bot.answer_callback_query(q.id.clone()).await?;
    if let Some((chat_id, message_id)) = callback_message_target(&q) {
        show_services_page(&bot, chat_id, &state, q.from.id.0 as i64, page, Some(message_id))
            .await?;
    }
    Ok(())
}

async fn callback_service_open(bot: Bot, q: CallbackQuery, state: BotState) -> HandlerResult {
    let data = q.data.as_deref().unwrap_or("");
    let (service_id, page) = parse_callback_pair(data, "svc_open:")?;
    bot.answer_callback_query(q.id.clone()).await?;
    if let Some((chat_id, message_id)) = callback_message_target(&q) {
        show_service_card(
            &bot,
            chat_id,
            message_id,
            &state,
            q.from.id.0 as i64,
            service_id,
            page.max(1),
        )
        .await?;
    }
    Ok(())
}

async fn callback_service_qr(bot: Bot, q: CallbackQuery, state: BotState) -> HandlerResult {
    let data = q.data.as_deref().unwrap_or("");
    let service_id = parse_callback_id(data, "svc_qr:")?;
    let Some((chat_id, _)) = callback_message_target(&q) else {
        bot.answer_callback_query(q.id.clone()).await?;
        return Ok(());
    };

    let snapshot = match state
        .shop
        .service_status(q.from.id.0 as i64, service_id)
        .await
    {
        Ok(snapshot) => snapshot,
        Err(error) => {
            bot.answer_callback_query(q.id.clone()).await?;
            return reply_shop_error(&bot, chat_id, &error).await;
        }
    };
    let Some(link) = snapshot.subscription_link() else {
        bot.answer_callback_query(q.id.clone())
            .text("لینک اشتراک برای این سرور تنظیم نشده است")
            .show_alert(true)
            .await?;
        return Ok(());
    };

    bot.answer_callback_query(q.id.clone()).await?;
    send_link_qr(&bot, chat_id, &link, &snapshot.service.client_name).await
}

async fn callback_service_renew(bot: Bot, q: CallbackQuery, state: BotState) -> HandlerResult {
    let data = q.data.as_deref().unwrap_or("");
    let service_id = parse_callback_id(data, "svc_renew:")?;
    let Some((chat_id, message_id)) = callback_message_target(&q) else {
        bot.answer_callback_query(q.id.clone()).await?;
        return Ok(());
    };

    let products = match state
        .shop
        .renewal_products(q.from.id.0 as i64, service_id)
        .await
    {
        Ok(products) => products,
        Err(error) => {
            bot.answer_callback_query(q.id.clone()).await?;
            return reply_shop_error(&bot, chat_id, &error).await;
        }
    };
    if products.is_empty() {
        bot.answer_callback_query(q.id.clone())
            .text("بسته‌ای برای تمدید موجود نیست")
            .show_alert(true)
            .await?;
        return Ok(());
    }

    let method = state.shop.renewal_method().await?;
    bot.answer_callback_query(q.id.clone()).await?;
    bot.edit_message_text(
        chat_id,
        message_id,
        format!(
            "♻️ بسته تمدید را انتخاب کنید.\nروش تمدید: {}",
            method.display_name()
        ),
    )
    .reply_markup(keyboards::renewal_products_keyboard(service_id, &products))
    .await?;
    Ok(())
}

async fn callback_renew_pick(bot: Bot, q: CallbackQuery, state: BotState) -> HandlerResult {
    let data = q.data.as_deref().unwrap_or("");
    let (service_id, product_id) = parse_callback_pair(data, "renew_pick:")?;
    let Some((chat_id, message_id)) = callback_message_target(&q) else {
        bot.answer_callback_query(q.id.clone()).await?;
        return Ok(());
    };
    bot.answer_callback_query(q.id.clone()).await?;

    let quote = match state
        .shop
        .quote_renewal(q.from.id.0 as i64, service_id, product_id)
        .await
    {
        Ok(quote) => quote,
        Err(error) => return reply_shop_error(&bot, chat_id, &error).await,
    };

    let keyboard = if quote.affordable() {
        keyboards::renewal_confirm_keyboard(service_id, product_id)
    } else {
        InlineKeyboardMarkup::default().append_row(vec![
            teloxide::types::InlineKeyboardButton::callback(
                "🔙 انتخاب بسته دیگر",
                format!("svc_renew:{}", service_id),
            ),
        ])
    };
    bot.edit_message_text(chat_id, message_id, render_renewal_quote(&quote))
        .reply_markup(keyboard)
        .await?;
    Ok(())
}

async fn callback_renew_confirm(bot: Bot, q: CallbackQuery, state: BotState) -> HandlerResult {
    let data = q.data.as_deref().unwrap_or("");
    let (service_id, product_id) = parse_callback_pair(data, "renew_ok:")?;
    let tg_user_id = q.from.id.0 as i64;
    let Some((chat_id, message_id)) = callback_message_target(&q) else {
        bot.answer_callback_query(q.id.clone()).await?;
        return Ok(());
    };
    tracing::info!(tg_user_id, service_id, product_id, "Renewal confirmed");

    bot.answer_callback_query(q.id.clone()).text("در حال تمدید...").await?;
    bot.edit_message_reply_markup(chat_id, message_id)
        .reply_markup(InlineKeyboardMarkup::default())
        .await?;

    let receipt = match state.shop.renew(tg_user_id, service_id, product_id).await {
        Ok(receipt) => receipt,
        Err(error) => return reply_shop_error(&bot, chat_id, &error).await,
    };

    bot.edit_message_text(chat_id, message_id, render_renewal_receipt(&receipt))
        .reply_markup(InlineKeyboardMarkup::default().append_row(vec![
            teloxide::types::InlineKeyboardButton::callback(
                "📦 مشاهده سرویس",
                format!("svc_open:{}:1", service_id),
            ),
        ]))
        .await?;

    if let Some(user) = state.db().get_user_by_tg(tg_user_id).await? {
        send_report(&bot, &state, renewal_report(&user, &receipt)).await;
    }
    Ok(())
}

async fn callback_set_renewal(bot: Bot, q: CallbackQuery, state: BotState) -> HandlerResult {
    if require_admin_callback(&bot, &q, &state).await?.is_none() {
        return Ok(());
    }

    let data = q.data.as_deref().unwrap_or("");
    let method = RenewalMethod::from_value(parse_callback_id(data, "set_renewal:")?);
    state.shop.set_renewal_method(method).await?;
    tracing::info!(method = method.value(), "Renewal method changed");

    bot.answer_callback_query(q.id.clone())
        .text("روش تمدید ذخیره شد")
        .await?;
    if let Some((chat_id, message_id)) = callback_message_target(&q) {
        bot.edit_message_text(
            chat_id,
            message_id,
            format!("روش تمدید فعلی:\n{}", method.display_name()),
        )
        .reply_markup(keyboards::renewal_method_keyboard(method))
        .await?;
    }
    Ok(())
}

async fn callback_set_naming(bot: Bot, q: CallbackQuery, state: BotState) -> HandlerResult {
    if require_admin_callback(&bot, &q, &state).await?.is_none() {
        return Ok(());
    }

    let data = q.data.as_deref().unwrap_or("");
    let method = NamingMethod::from_value(parse_callback_id(data, "set_naming:")?);
    state.shop.set_naming_method(method).await?;
    tracing::info!(
        method = method.value(),
        sequential = method.is_sequential(),
        "Naming method changed"
    );

    bot.answer_callback_query(q.id.clone())
        .text("روش نام‌گذاری ذخیره شد")
        .await?;
    if let Some((chat_id, message_id)) = callback_message_target(&q) {
        bot.edit_message_text(
            chat_id,
            message_id,
            format!("روش نام‌گذاری فعلی:\n{}", method.display_name()),
        )
        .reply_markup(keyboards::naming_method_keyboard(method))
        .await?;
    }
    Ok(())
}

async fn callback_ticket_reply(bot: Bot, q: CallbackQuery, state: BotState) -> HandlerResult {
    let data = q.data.as_deref().unwrap_or("");
    let ticket_id = parse_callback_id(data, "ticket_reply:")?;
    bot.answer_callback_query(q.id.clone()).await?;
    let Some((chat_id, _)) = callback_message_target(&q) else {
        return Ok(());
    };
    mark_pending_input(&state, q.from.id.0 as i64, PendingInput::TicketReply { ticket_id }).await;
    bot.send_message(chat_id, format!("✉️ پیام خود برای تیکت #{} را ارسال کنید:", ticket_id))
        .reply_markup(keyboards::prompt_cancel_keyboard())
        .await?;
    Ok(())
}

async fn callback_ticket_answer(bot: Bot, q: CallbackQuery, state: BotState) -> HandlerResult {
    let Some(admin_id) = require_admin_callback(&bot, &q, &state).await? else {
        return Ok(());
    };
    let data = q.data.as_deref().unwrap_or("");
    let ticket_id = parse_callback_id(data, "ticket_answer:")?;
    bot.answer_callback_query(q.id.clone()).await?;
    let Some((chat_id, _)) = callback_message_target(&q) else {
        return Ok(());
    };
    mark_pending_input(&state, admin_id, PendingInput::TicketAnswer { ticket_id }).await;
    bot.send_message(chat_id, format!("✉️ پاسخ تیکت #{} را بنویسید:", ticket_id))
        .reply_markup(keyboards::prompt_cancel_keyboard())
        .await?;
    Ok(())
}

async fn callback_ticket_close(bot: Bot, q: CallbackQuery, state: BotState) -> HandlerResult {
    if require_admin_callback(&bot, &q, &state).await?.is_none() {
        return Ok(());
    }
    let data = q.data.as_deref().unwrap_or("");
    let ticket_id = parse_callback_id(data, "ticket_close:")?;
    bot.answer_callback_query(q.id.clone()).await?;
    let Some((chat_id, message_id)) = callback_message_target(&q) else {
        return Ok(());
    };
    bot.edit_message_reply_markup(chat_id, message_id)
        .reply_markup(InlineKeyboardMarkup::default())
        .await?;
    admin_close_ticket(&bot, chat_id, &state, ticket_id).await
}
