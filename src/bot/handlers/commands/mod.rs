use super::format::{
    admin_help_text, help_text, render_codes, render_discount_created, render_gift_created,
    render_gift_receipt, render_panels, render_stats, render_ticket_list, render_ticket_thread,
    welcome_text,
};
use super::menu::answer_ticket;
use super::shared::{
    mark_pending_input, parse_addgift_args, parse_adddiscount_args, parse_addpanel_args,
    parse_addproduct_args, parse_id_arg, parse_reply_args, parse_start_token, parse_topup_args,
    reply_shop_error, take_pending_input, HandlerResult,
};
use super::state::{is_admin_message, sender_user_id, BotState, PendingInput};
use crate::bot::keyboards;
use crate::db::{NewPanel, TransactionKind};
use crate::naming::{format_balance, NamingMethod};
use crate::panel::XuiClient;
use crate::renewal::RenewalMethod;
use teloxide::dptree;
use teloxide::prelude::*;
use teloxide::utils::command::BotCommands;

#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase")]
pub enum BotCommand {
    #[command(description = "شروع و ثبت‌نام")]
    Start,
    #[command(description = "راهنما")]
    Help,
    #[command(description = "ثبت کد هدیه")]
    Gift,
    #[command(description = "شارژ کیف پول کاربر (ادمین)")]
    TopUp,
    #[command(description = "کسر از کیف پول کاربر (ادمین)")]
    Deduct,
    #[command(description = "روش تمدید (ادمین)")]
    RenewalMethod,
    #[command(description = "روش نام‌گذاری کلاینت (ادمین)")]
    Naming,
    #[command(description = "افزودن پنل (ادمین)")]
    AddPanel,
    #[command(description = "افزودن محصول (ادمین)")]
    AddProduct,
    #[command(description = "لیست پنل‌ها (ادمین)")]
    Panels,
    #[command(description = "آمار (ادمین)")]
    Stats,
    #[command(description = "حذف سرویس (ادمین)")]
    DelService,
    #[command(description = "ساخت کد هدیه (ادمین)")]
    AddGift,
    #[command(description = "ساخت کد تخفیف (ادمین)")]
    AddDiscount,
    #[command(description = "لیست کدها (ادمین)")]
    Codes,
    #[command(description = "تیکت‌های باز (ادمین)")]
    Tickets,
    #[command(description = "مشاهده تیکت (ادمین)")]
    Ticket,
    #[command(description = "پاسخ به تیکت (ادمین)")]
    Reply,
    #[command(description = "بستن تیکت (ادمین)")]
    CloseTicket,
}

const ADMIN_LIST_LIMIT: i64 = 20;

pub fn handler() -> teloxide::dispatching::UpdateHandler<Box<dyn std::error::Error + Send + Sync + 'static>> {
    teloxide::filter_command::<BotCommand, _>()
        .branch(dptree::case![BotCommand::Start].endpoint(start_cmd))
        .branch(dptree::case![BotCommand::Help].endpoint(cmd_help))
        .branch(dptree::case![BotCommand::Gift].endpoint(cmd_gift))
        .branch(dptree::case![BotCommand::TopUp].endpoint(cmd_topup))
        .branch(dptree::case![BotCommand::Deduct].endpoint(cmd_deduct))
        .branch(dptree::case![BotCommand::RenewalMethod].endpoint(cmd_renewal_method))
        .branch(dptree::case![BotCommand::Naming].endpoint(cmd_naming))
        .branch(dptree::case![BotCommand::AddPanel].endpoint(cmd_add_panel))
        .branch(dptree::case![BotCommand::AddProduct].endpoint(cmd_add_product))
        .branch(dptree::case![BotCommand::Panels].endpoint(cmd_panels))
        .branch(dptree::case![BotCommand::Stats].endpoint(cmd_stats))
        .branch(dptree::case![BotCommand::DelService].endpoint(cmd_del_service))
        .branch(dptree::case![BotCommand::AddGift].endpoint(cmd_add_gift))
        .branch(dptree::case![BotCommand::AddDiscount].endpoint(cmd_add_discount))
        .branch(dptree::case![BotCommand::Codes].endpoint(cmd_codes))
        .branch(dptree::case![BotCommand::Tickets].endpoint(cmd_tickets))
        .branch(dptree::case![BotCommand::Ticket].endpoint(cmd_ticket))
        .branch(dptree::case![BotCommand::Reply].endpoint(cmd_reply))
        .branch(dptree::case![BotCommand::CloseTicket].endpoint(cmd_close_ticket))
}

pub async fn cmd_help(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    if let Some(user_id) = sender_user_id(&msg) {
        take_pending_input(&state, user_id).await;
    }
    let is_admin = is_admin_message(&msg, &state);
    let text = if is_admin {
        format!("{}\n\n{}", help_text(), admin_help_text())
    } else {
        help_text().to_string()
    };
    bot.send_message(msg.chat.id, text)
        .reply_markup(keyboards::menu_for(is_admin))
        .await?;
    Ok(())
}

async fn start_cmd(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    let Some(from) = msg.from.as_ref() else {
        tracing::warn!("Received /start without sender");
        return Ok(());
    };
    let user_id = from.id.0 as i64;
    let referral_code = parse_start_token(msg.text().unwrap_or(""));
    tracing::info!(
        user_id = user_id,
        username = ?from.username,
        referral_code = ?referral_code,
        "Received /start command"
    );
    take_pending_input(&state, user_id).await;

    let outcome = match state
        .shop
        .register(
            user_id,
            from.username.as_deref(),
            Some(from.first_name.as_str()),
            from.last_name.as_deref(),
            referral_code.as_deref(),
        )
        .await
    {
        Ok(outcome) => outcome,
        Err(error) => return reply_shop_error(&bot, msg.chat.id, &error).await,
    };

    let is_admin = state.config.is_admin(user_id);
    bot.send_message(
        msg.chat.id,
        welcome_text(
            &outcome.user,
            outcome.is_new,
            state.config.referral.welcome_bonus,
        ),
    )
    .reply_markup(keyboards::menu_for(is_admin))
    .await?;

    if let Some(referrer) = outcome.referrer.as_ref() {
        let text = format!(
            "🎉 یک کاربر جدید با لینک دعوت شما عضو شد!\n{} به کیف پول شما اضافه شد.",
            format_balance(state.config.referral.reward_amount)
        );
        if let Err(error) = bot.send_message(ChatId(referrer.tg_user_id), text).await {
            tracing::warn!(
                referrer_id = referrer.tg_user_id,
                error = %error,
                "Failed to notify referrer"
            );
        }
    }
    Ok(())
}

async fn cmd_topup(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    if !is_admin_message(&msg, &state) {
        return Ok(());
    }

    let Some(args) = parse_topup_args(msg.text().unwrap_or("")) else {
        bot.send_message(msg.chat.id, "استفاده: /topup <tg_id> <amount>")
            .await?;
        return Ok(());
    };
    tracing::info!(
        tg_user_id = args.tg_user_id,
        amount = args.amount,
        "Admin command /topup"
    );

    let Some(user) = state.db().get_user_by_tg(args.tg_user_id).await? else {
        bot.send_message(
            msg.chat.id,
            "کاربر پیدا نشد. کاربر باید حداقل یک بار /start را ارسال کرده باشد.",
        )
        .await?;
        return Ok(());
    };

    let description = sender_user_id(&msg).map(|admin_id| format!("admin {}", admin_id));
    let balance = state
        .db()
        .add_balance(
            user.id,
            args.amount,
            TransactionKind::TopUp,
            description.as_deref(),
        )
        .await?;

    bot.send_message(
        msg.chat.id,
        format!(
            "✅ کیف پول {} به مبلغ {} شارژ شد.\nموجودی جدید: {}",
            args.tg_user_id,
            format_balance(args.amount),
            format_balance(balance)
        ),
    )
    .await?;

    let notice = format!(
        "💰 کیف پول شما به مبلغ {} شارژ شد.\nموجودی: {}",
        format_balance(args.amount),
        format_balance(balance)
    );
    if let Err(error) = bot.send_message(ChatId(args.tg_user_id), notice).await {
        tracing::warn!(tg_user_id = args.tg_user_id, error = %error, "Failed to notify user about top-up");
    }
    Ok(())
}

async fn cmd_deduct(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    if !is_admin_message(&msg, &state) {
        return Ok(());
    }

    let Some(args) = parse_topup_args(msg.text().unwrap_or("")) else {
        bot.send_message(msg.chat.id, "استفاده: /deduct <tg_id> <amount>")
            .await?;
        return Ok(());
    };
    tracing::info!(
        tg_user_id = args.tg_user_id,
        amount = args.amount,
        "Admin command /deduct"
    );

    let Some(user) = state.db().get_user_by_tg(args.tg_user_id).await? else {
        bot.send_message(msg.chat.id, "کاربر پیدا نشد.").await?;
        return Ok(());
    };

    let description = sender_user_id(&msg).map(|admin_id| format!("admin {}", admin_id));
    let deducted = state
        .db()
        .deduct_balance(
            user.id,
            args.amount,
            TransactionKind::Adjustment,
            description.as_deref(),
        )
        .await?;

    let text = match deducted {
        Some(balance) => format!(
            "✅ مبلغ {} از کیف پول {} کسر شد.\nموجودی جدید: {}",
            format_balance(args.amount),
            args.tg_user_id,
            format_balance(balance)
        ),
        None => format!(
            "❌ موجودی کاربر کافی نیست. موجودی فعلی: {}",
            format_balance(user.balance)
        ),
    };
    bot.send_message(msg.chat.id, text).await?;
    Ok(())
}

async fn cmd_renewal_method(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    if !is_admin_message(&msg, &state) {
        return Ok(());
    }

    let text = msg.text().unwrap_or("");
    if let Some(arg) = text.split_whitespace().nth(1) {
        let method = match arg.parse::<i64>() {
            Ok(code @ 1..=5) => RenewalMethod::from_value(code),
            _ => {
                bot.send_message(msg.chat.id, "استفاده: /renewalmethod [1-5]")
                    .await?;
                return Ok(());
            }
        };
        state.shop.set_renewal_method(method).await?;
        tracing::info!(method = method.value(), "Renewal method changed");
        bot.send_message(
            msg.chat.id,
            format!("✅ روش تمدید تغییر کرد به:\n{}", method.display_name()),
        )
        .await?;
        return Ok(());
    }

    let current = state.shop.renewal_method().await?;
    bot.send_message(
        msg.chat.id,
        format!("روش تمدید فعلی:\n{}\n\nروش جدید را انتخاب کنید:", current.display_name()),
    )
    .reply_markup(keyboards::renewal_method_keyboard(current))
    .await?;
    Ok(())
}

async fn cmd_naming(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    if !is_admin_message(&msg, &state) {
        return Ok(());
    }

    let text = msg.text().unwrap_or("");
    if let Some(arg) = text.split_whitespace().nth(1) {
        let method = match arg.parse::<i64>() {
            Ok(code @ 1..=8) => NamingMethod::from_value(code),
            _ => {
                bot.send_message(msg.chat.id, "استفاده: /naming [1-8]").await?;
                return Ok(());
            }
        };
        state.shop.set_naming_method(method).await?;
        tracing::info!(method = method.value(), "Naming method changed");
        bot.send_message(
            msg.chat.id,
            format!("✅ روش نام‌گذاری تغییر کرد به:\n{}", method.display_name()),
        )
        .await?;
        return Ok(());
    }

    let current = state.shop.naming_method().await?;
    bot.send_message(
        msg.chat.id,
        format!(
            "روش نام‌گذاری فعلی:\n{}\n\nروش جدید را انتخاب کنید:",
            current.display_name()
        ),
    )
    .reply_markup(keyboards::naming_method_keyboard(current))
    .await?;
    Ok(())
}

async fn cmd_add_panel(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    if !is_admin_message(&msg, &state) {
        return Ok(());
    }

    let Some(args) = parse_addpanel_args(msg.text().unwrap_or("")) else {
        bot.send_message(
            msg.chat.id,
            "استفاده: /addpanel <name> <api_url> <username> <password> <inbound_id> [sub_url]",
        )
        .await?;
        return Ok(());
    };
    tracing::info!(name = %args.name, api_url = %args.api_url, "Admin command /addpanel");

    let check = match XuiClient::new(&args.api_url, &args.username, &args.password, &state.config.panel) {
        Ok(client) => client.list_inbounds().await,
        Err(error) => Err(error),
    };
    let connectivity = match check {
        Ok(inbounds) => match inbounds.iter().find(|inbound| inbound.id == args.inbound_id) {
            Some(inbound) => format!(
                "🟢 اتصال برقرار است. Inbound: {} ({}:{})",
                inbound.remark, inbound.protocol, inbound.port
            ),
            None => {
                let available: Vec<String> = inbounds
                    .iter()
                    .map(|inbound| format!("#{} {}", inbound.id, inbound.remark))
                    .collect();
                bot.send_message(
                    msg.chat.id,
                    format!(
                        "❌ Inbound #{} روی این پنل وجود ندارد.\nInboundهای موجود:\n{}",
                        args.inbound_id,
                        available.join("\n")
                    ),
                )
                .await?;
                return Ok(());
            }
        },
        Err(error) => {
            tracing::warn!(api_url = %args.api_url, error = %error, "Panel check failed, saving anyway");
            format!("⚠️ اتصال به پنل برقرار نشد: {}", error)
        }
    };

    let panel = state
        .db()
        .add_panel(&NewPanel {
            name: &args.name,
            api_url: &args.api_url,
            username: &args.username,
            password: &args.password,
            inbound_id: args.inbound_id,
            subscription_url: args.subscription_url.as_deref(),
        })
        .await?;

    bot.send_message(
        msg.chat.id,
        format!(
            "✅ پنل {} با شناسه #{} ثبت شد.\n{}\n\nبرای افزودن محصول:\n/addproduct {} <gb> <days> <price> <name>",
            panel.name, panel.id, connectivity, panel.id
        ),
    )
    .await?;
    Ok(())
}

async fn cmd_add_product(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    if !is_admin_message(&msg, &state) {
        return Ok(());
    }

    let Some(args) = parse_addproduct_args(msg.text().unwrap_or("")) else {
        bot.send_message(
            msg.chat.id,
            "استفاده: /addproduct <panel_id> <gb> <days> <price> <name...>",
        )
        .await?;
        return Ok(());
    };

    if state.db().get_panel(args.panel_id).await?.is_none() {
        bot.send_message(msg.chat.id, format!("پنل #{} پیدا نشد.", args.panel_id))
            .await?;
        return Ok(());
    }

    let product = state
        .db()
        .add_product(
            args.panel_id,
            &args.name,
            args.volume_gb,
            args.duration_days,
            args.price,
        )
        .await?;
    tracing::info!(
        product_id = product.id,
        panel_id = product.panel_id,
        "Product added"
    );

    bot.send_message(
        msg.chat.id,
        format!(
            "✅ محصول #{} ثبت شد:\n{}",
            product.id,
            keyboards::product_title(&product)
        ),
    )
    .await?;
    Ok(())
}

async fn cmd_panels(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    if !is_admin_message(&msg, &state) {
        return Ok(());
    }
    admin_show_panels(&bot, msg.chat.id, &state).await
}

async fn cmd_stats(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    if !is_admin_message(&msg, &state) {
        return Ok(());
    }
    admin_show_stats(&bot, msg.chat.id, &state).await
}

async fn cmd_del_service(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    if !is_admin_message(&msg, &state) {
        return Ok(());
    }

    let text = msg.text().unwrap_or("");
    let service_id: i64 = match text.split_whitespace().nth(1).unwrap_or("").parse() {
        Ok(id) => id,
        Err(_) => {
            bot.send_message(msg.chat.id, "استفاده: /delservice <service_id>")
                .await?;
            return Ok(());
        }
    };
    tracing::info!(service_id = service_id, "Admin command /delservice");

    let service = match state.shop.delete_service(service_id).await {
        Ok(service) => service,
        Err(error) => return reply_shop_error(&bot, msg.chat.id, &error).await,
    };
    bot.send_message(
        msg.chat.id,
        format!("🗑 سرویس {} (#{}) حذف شد.", service.client_name, service.id),
    )
    .await?;

    if let Some(owner) = state.db().get_user(service.user_id).await?
        && let Err(error) = bot
            .send_message(
                ChatId(owner.tg_user_id),
                format!("🗑 سرویس {} توسط مدیریت حذف شد.", service.client_name),
            )
            .await
    {
        tracing::warn!(
            tg_user_id = owner.tg_user_id,
            error = %error,
            "Failed to notify owner about deleted service"
        );
    }
    Ok(())
}

async fn cmd_gift(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    let Some(user_id) = sender_user_id(&msg) else {
        return Ok(());
    };
    let Some(code) = msg.text().unwrap_or("").split_whitespace().nth(1) else {
        mark_pending_input(&state, user_id, PendingInput::GiftCode).await;
        bot.send_message(msg.chat.id, "🎁 کد هدیه خود را ارسال کنید:")
            .reply_markup(keyboards::prompt_cancel_keyboard())
            .await?;
        return Ok(());
    };
    take_pending_input(&state, user_id).await;
    match state.shop.redeem_gift_code(user_id, code).await {
        Ok(receipt) => {
            bot.send_message(msg.chat.id, render_gift_receipt(&receipt))
                .await?;
            Ok(())
        }
        Err(error) => reply_shop_error(&bot, msg.chat.id, &error).await,
    }
}

async fn cmd_add_gift(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    if !is_admin_message(&msg, &state) {
        return Ok(());
    }
    let Some(args) = parse_addgift_args(msg.text().unwrap_or("")) else {
        bot.send_message(
            msg.chat.id,
            "استفاده: /addgift <amount> <max_uses> [days] [code]\nmax_uses یا days برابر 0 یعنی نامحدود.",
        )
        .await?;
        return Ok(());
    };
    let admin_id = sender_user_id(&msg).unwrap_or_default();
    tracing::info!(admin_id, amount = args.amount, max_uses = args.max_uses, "Admin command /addgift");

    match state
        .shop
        .create_gift_code(
            admin_id,
            args.code.as_deref(),
            args.amount,
            args.max_uses,
            args.valid_days,
        )
        .await
    {
        Ok(gift) => {
            bot.send_message(msg.chat.id, render_gift_created(&gift)).await?;
            Ok(())
        }
        Err(error) => reply_shop_error(&bot, msg.chat.id, &error).await,
    }
}

async fn cmd_add_discount(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    if !is_admin_message(&msg, &state) {
        return Ok(());
    }
    let Some(args) = parse_adddiscount_args(msg.text().unwrap_or("")) else {
        bot.send_message(
            msg.chat.id,
            "استفاده: /adddiscount <value>[%] <max_uses> [days] [code]\nمثال: /adddiscount 15% 100 30 SPRING",
        )
        .await?;
        return Ok(());
    };
    tracing::info!(kind = ?args.kind, value = args.value, max_uses = args.max_uses, "Admin command /adddiscount");

    match state
        .shop
        .create_discount_code(
            args.code.as_deref(),
            args.kind,
            args.value,
            args.max_uses,
            args.valid_days,
        )
        .await
    {
        Ok(discount) => {
            bot.send_message(msg.chat.id, render_discount_created(&discount))
                .await?;
            Ok(())
        }
        Err(error) => reply_shop_error(&bot, msg.chat.id, &error).await,
    }
}

async fn cmd_codes(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    if !is_admin_message(&msg, &state) {
        return Ok(());
    }
    let gifts = state.db().list_gift_codes(ADMIN_LIST_LIMIT).await?;
    let discounts = state.db().list_discount_codes(ADMIN_LIST_LIMIT).await?;
    bot.send_message(
        msg.chat.id,
        render_codes(&gifts, &discounts, chrono::Utc::now().timestamp()),
    )
    .await?;
    Ok(())
}

async fn cmd_tickets(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    if !is_admin_message(&msg, &state) {
        return Ok(());
    }
    let tickets = state.db().list_pending_tickets(ADMIN_LIST_LIMIT).await?;
    bot.send_message(msg.chat.id, render_ticket_list(&tickets))
        .await?;
    Ok(())
}

async fn cmd_ticket(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    if !is_admin_message(&msg, &state) {
        return Ok(());
    }
    let Some(ticket_id) = parse_id_arg(msg.text().unwrap_or("")) else {
        bot.send_message(msg.chat.id, "استفاده: /ticket <id>").await?;
        return Ok(());
    };
    let (ticket, messages) = match state.shop.ticket_thread(ticket_id).await {
        Ok(thread) => thread,
        Err(error) => return reply_shop_error(&bot, msg.chat.id, &error).await,
    };
    bot.send_message(msg.chat.id, render_ticket_thread(&ticket, &messages))
        .reply_markup(keyboards::ticket_admin_keyboard(ticket.id))
        .await?;
    Ok(())
}

async fn cmd_reply(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    if !is_admin_message(&msg, &state) {
        return Ok(());
    }
    let Some((ticket_id, body)) = parse_reply_args(msg.text().unwrap_or("")) else {
        bot.send_message(msg.chat.id, "استفاده: /reply <ticket_id> <text>")
            .await?;
        return Ok(());
    };
    let admin_id = sender_user_id(&msg).unwrap_or_default();
    answer_ticket(&bot, msg.chat.id, &state, admin_id, ticket_id, &body).await
}

async fn cmd_close_ticket(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    if !is_admin_message(&msg, &state) {
        return Ok(());
    }
    let Some(ticket_id) = parse_id_arg(msg.text().unwrap_or("")) else {
        bot.send_message(msg.chat.id, "استفاده: /closeticket <id>").await?;
        return Ok(());
    };
    admin_close_ticket(&bot, msg.chat.id, &state, ticket_id).await
}

/// Closes the ticket and tells its owner.
pub async fn admin_close_ticket(
    bot: &Bot,
    chat_id: ChatId,
    state: &BotState,
    ticket_id: i64,
) -> HandlerResult {
    let (ticket, owner_tg_id) = match state.shop.close_ticket(ticket_id).await {
        Ok(closed) => closed,
        Err(error) => return reply_shop_error(bot, chat_id, &error).await,
    };
    bot.send_message(chat_id, format!("🔒 تیکت #{} بسته شد.", ticket.id))
        .await?;
    if let Err(error) = bot
        .send_message(
            ChatId(owner_tg_id),
            format!("🔒 تیکت #{} ({}) توسط پشتیبانی بسته شد.", ticket.id, ticket.subject),
        )
        .await
    {
        tracing::warn!(ticket_id, owner_tg_id, error = %error, "Failed to notify owner about closed ticket");
    }
    Ok(())
}

pub async fn admin_show_stats(bot: &Bot, chat_id: ChatId, state: &BotState) -> HandlerResult {
    let stats = state.db().admin_stats().await?;
    bot.send_message(chat_id, render_stats(&stats))
        .reply_markup(keyboards::admin_menu())
        .await?;
    Ok(())
}

pub async fn admin_show_panels(bot: &Bot, chat_id: ChatId, state: &BotState) -> HandlerResult {
    let panels = state.db().list_panels(false).await?;
    let mut listing = Vec::with_capacity(panels.len());
    for panel in panels {
        let products = state.db().list_products(panel.id).await?;
        listing.push((panel, products));
    }
    bot.send_message(chat_id, render_panels(&listing))
        .reply_markup(keyboards::admin_menu())
        .await?;
    Ok(())
}
