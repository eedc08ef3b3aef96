use crate::db::{
    AdminStats, BalanceTransaction, DiscountCode, DiscountKind, GiftCode, Panel, Product, Service,
    Ticket, TicketMessage, TicketStatus, User,
};
use crate::naming::{
    format_balance, format_data_amount, format_display_name, format_status, format_time_remaining,
};
use crate::renewal;
use crate::shop::{
    GiftReceipt, Purchase, PurchaseQuote, RenewalQuote, RenewalReceipt, ServiceSnapshot,
    SpinOutcome,
};
use crate::wheel::PrizeKind;
use chrono::{DateTime, Local, Utc};

pub fn format_date(ts: i64) -> String {
    DateTime::<Utc>::from_timestamp(ts, 0)
        .map(|dt| dt.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn format_expiry(expires_at: Option<DateTime<Utc>>) -> String {
    expires_at
        .map(|at| format_date(at.timestamp()))
        .unwrap_or_else(|| "نامحدود".to_string())
}

fn format_quota(total_gb: f64) -> String {
    if total_gb <= 0.0 {
        "نامحدود".to_string()
    } else {
        format_data_amount(total_gb)
    }
}

pub fn user_display_name(user: &User) -> String {
    format_display_name(
        user.username.as_deref(),
        user.first_name.as_deref(),
        user.last_name.as_deref(),
    )
}

pub fn welcome_text(user: &User, is_new: bool, welcome_bonus: i64) -> String {
    let mut text = format!("👋 سلام {}!\nبه ربات فروش سرویس خوش آمدید.", user_display_name(user));
    if is_new && welcome_bonus > 0 {
        text.push_str(&format!(
            "\n\n🎁 هدیه ثبت‌نام: {} به کیف پول شما اضافه شد.",
            format_balance(welcome_bonus)
        ));
    }
    text.push_str("\n\nاز منوی زیر استفاده کنید.");
    text
}

pub fn help_text() -> &'static str {
    r#"❓ راهنمای ربات

🛒 خرید سرویس: انتخاب سرور و بسته، پرداخت از کیف پول.
📦 سرویس‌های من: مشاهده حجم و زمان باقیمانده، لینک اشتراک، QR کد و تمدید.
💰 کیف پول: موجودی و تراکنش‌های اخیر. برای شارژ به پشتیبانی پیام دهید.
👥 دعوت دوستان: با لینک اختصاصی خود دوستانتان را دعوت کنید و هدیه بگیرید.
🎁 کد هدیه: کد هدیه را وارد کنید تا مبلغ آن به کیف پولتان اضافه شود (یا /gift <code>).
🎡 گردونه شانس: هر روز یک بار شانس خود را برای اعتبار یا کد تخفیف امتحان کنید.
🎫 پشتیبانی: پیام خود را بفرستید تا یک تیکت برای پشتیبانی ثبت شود.
🎟 کد تخفیف: هنگام خرید، پیش از تایید روی «کد تخفیف» بزنید."#
}

pub fn admin_help_text() -> &'static str {
    r#"🛠 دستورات ادمین

/topup <tg_id> <amount> - شارژ کیف پول کاربر
/deduct <tg_id> <amount> - کسر از کیف پول کاربر
/renewalmethod [1-5] - نمایش یا تغییر روش تمدید
/naming [1-8] - نمایش یا تغییر روش نام‌گذاری کلاینت
/addpanel <name> <api_url> <username> <password> <inbound_id> [sub_url] - افزودن پنل 3x-ui
/addproduct <panel_id> <gb> <days> <price> <name...> - افزودن محصول
/panels - لیست پنل‌ها و محصولات
/stats - آمار ربات
/delservice <service_id> - حذف سرویس از پنل و ربات
/addgift <amount> <max_uses> [days] [code] - ساخت کد هدیه (0 یعنی نامحدود)
/adddiscount <value>[%] <max_uses> [days] [code] - ساخت کد تخفیف درصدی یا مبلغی
/codes - لیست کدهای هدیه و تخفیف
/tickets - تیکت‌های باز
/ticket <id> - مشاهده گفتگوی تیکت
/reply <id> <text> - پاسخ به تیکت
/closeticket <id> - بستن تیکت"#
}

pub fn render_wallet(user: &User, transactions: &[BalanceTransaction]) -> String {
    let mut text = format!(
        "💰 کیف پول\n\nموجودی: {}\nمجموع خرید: {}",
        format_balance(user.balance),
        format_balance(user.total_spent)
    );
    if transactions.is_empty() {
        text.push_str("\n\nتراکنشی ثبت نشده است.");
        return text;
    }
    text.push_str("\n\n🧾 تراکنش‌های اخیر:");
    for tx in transactions {
        let sign = if tx.amount > 0 { "➕" } else { "➖" };
        text.push_str(&format!(
            "\n{} {} | {} | {}",
            sign,
            format_balance(tx.amount.abs()),
            transaction_label(&tx.kind),
            format_date(tx.created_at)
        ));
    }
    text
}

fn transaction_label(kind: &str) -> &str {
    match kind {
        "topup" => "شارژ",
        "purchase" => "خرید",
        "renewal" => "تمدید",
        "welcome_bonus" => "هدیه ثبت‌نام",
        "referral_reward" => "پاداش دعوت",
        "adjustment" => "اصلاح ادمین",
        "refund" => "بازگشت وجه",
        "gift_code" => "کد هدیه",
        "wheel_prize" => "جایزه گردونه",
        "wheel_spin" => "هزینه گردونه",
        other => other,
    }
}

pub fn render_referral(
    user: &User,
    invited: i64,
    link: Option<&str>,
    reward: i64,
    enabled: bool,
) -> String {
    if !enabled {
        return "👥 سیستم دعوت در حال حاضر غیرفعال است.".to_string();
    }
    let link = link
        .map(str::to_string)
        .unwrap_or_else(|| format!("کد دعوت: {}", user.referral_code));
    format!(
        "👥 دعوت دوستان\n\n\
         به ازای هر دوستی که با لینک شما عضو شود {} هدیه می‌گیرید.\n\n\
         🔗 {}\n\n\
         تعداد دعوت‌شده‌ها: {}",
        format_balance(reward),
        link,
        invited
    )
}

pub fn render_purchase_preview(quote: &PurchaseQuote) -> String {
    let product = &quote.product;
    let mut text = format!(
        "🛒 پیش‌فاکتور\n\n\
         سرور: {}\n\
         بسته: {}\n\
         حجم: {} گیگابایت\n\
         مدت: {} روز\n\
         قیمت: {}",
        quote.panel.name,
        product.name,
        product.volume_gb,
        product.duration_days,
        format_balance(product.price)
    );
    if let Some(discount) = &quote.discount {
        text.push_str(&format!(
            "\n🎟 کد تخفیف {}: {}-\nمبلغ قابل پرداخت: {}",
            discount.code,
            format_balance(quote.discount_amount),
            format_balance(quote.price())
        ));
    }
    text.push_str(&format!("\n\nموجودی شما: {}", format_balance(quote.balance)));
    if !quote.affordable() {
        text.push_str(&format!(
            "\n\n❌ موجودی کافی نیست. کمبود: {}",
            format_balance(quote.price() - quote.balance)
        ));
    }
    text
}

pub fn render_purchase_receipt(purchase: &Purchase) -> String {
    let link = purchase
        .subscription_link
        .as_deref()
        .unwrap_or("برای دریافت لینک با پشتیبانی تماس بگیرید.");
    format!(
        "✅ خرید با موفقیت انجام شد!\n\n\
         نام سرویس: {}\n\
         سرور: {}\n\
         حجم: {}\n\
         انقضا: {}\n\
         مبلغ پرداختی: {}\n\
         موجودی باقیمانده: {}\n\n\
         🔗 لینک اشتراک:\n{}",
        purchase.service.client_name,
        purchase.panel.name,
        format_quota(purchase.service.total_gb),
        format_expiry(
            purchase
                .service
                .expires_at
                .and_then(|ts| DateTime::from_timestamp(ts, 0))
        ),
        format_balance(purchase.price),
        format_balance(purchase.balance),
        link
    )
}

pub fn service_button_title(service: &Service) -> String {
    let marker = match service.status {
        crate::db::ServiceStatus::Active => "🟢",
        crate::db::ServiceStatus::Expired => "⏰",
        _ => "🔴",
    };
    format!("{} {} ({})", marker, service.client_name, format_quota(service.total_gb))
}

pub fn render_service_card(snapshot: &ServiceSnapshot, now: DateTime<Utc>) -> String {
    let time_left = match snapshot.expires_at {
        Some(at) => format_time_remaining((at - now).num_seconds()),
        None => "نامحدود".to_string(),
    };
    let mut text = format!(
        "📦 سرویس {}\n\n\
         وضعیت: {}\n\
         سرور: {}\n\
         حجم کل: {}\n\
         مصرف شده: {}\n\
         باقیمانده: {}\n\
         انقضا: {}\n\
         زمان باقیمانده: {}",
        snapshot.service.client_name,
        format_status(snapshot.status.as_str()),
        snapshot.panel.name,
        format_quota(snapshot.total_gb),
        format_data_amount(snapshot.used_gb),
        if snapshot.total_gb > 0.0 {
            format_data_amount(snapshot.remaining_gb())
        } else {
            "نامحدود".to_string()
        },
        format_expiry(snapshot.expires_at),
        time_left
    );
    if snapshot.renewals > 0 {
        text.push_str(&format!("\nتعداد تمدید: {}", snapshot.renewals));
    }
    if let Some(link) = snapshot.subscription_link() {
        text.push_str(&format!("\n\n🔗 لینک اشتراک:\n{}", link));
    }
    if !snapshot.live {
        text.push_str("\n\n⚠️ سرور در دسترس نیست؛ آخرین اطلاعات ذخیره شده نمایش داده شد.");
    }
    text
}

pub fn render_renewal_quote(quote: &RenewalQuote) -> String {
    let mut text = format!(
        "♻️ تمدید سرویس {}\n\n\
         باقیمانده فعلی: {} و {} روز\n\
         بسته انتخابی: {}\n\n\
         {}\n\n\
         💳 مبلغ: {}\n\
         موجودی شما: {}",
        quote.snapshot.service.client_name,
        format_data_amount(quote.remaining_gb),
        quote.remaining_days,
        quote.product.name,
        renewal::format_summary(quote.method, &quote.outcome),
        format_balance(quote.price()),
        format_balance(quote.balance)
    );
    if !quote.affordable() {
        text.push_str(&format!(
            "\n\n❌ موجودی کافی نیست. کمبود: {}",
            format_balance(quote.price() - quote.balance)
        ));
    }
    text
}

pub fn render_renewal_receipt(receipt: &RenewalReceipt) -> String {
    format!(
        "✅ سرویس {} با موفقیت تمدید شد!\n\n\
         حجم جدید: {}\n\
         انقضا: {}\n\
         موجودی باقیمانده: {}",
        receipt.quote.snapshot.service.client_name,
        format_quota(receipt.quote.outcome.final_data_gb),
        format_expiry(receipt.expires_at),
        format_balance(receipt.balance)
    )
}

pub fn render_stats(stats: &AdminStats) -> String {
    format!(
        "📊 آمار ربات\n\n\
         کاربران: {}\n\
         سرویس‌های فعال: {}\n\
         تعداد تمدیدها: {}\n\
         مجموع فروش: {}\n\
         مجموع موجودی کاربران: {}\n\
         تیکت‌های باز: {}",
        stats.users,
        stats.active_services,
        stats.renewals,
        format_balance(stats.revenue),
        format_balance(stats.total_balance),
        stats.open_tickets
    )
}

pub fn render_panels(panels: &[(Panel, Vec<Product>)]) -> String {
    if panels.is_empty() {
        return "هیچ پنلی ثبت نشده است. از /addpanel استفاده کنید.".to_string();
    }
    let mut text = String::from("🖥 پنل‌ها");
    for (panel, products) in panels {
        let state = if panel.is_active { "🟢" } else { "🔴" };
        text.push_str(&format!(
            "\n\n{} #{} {}\nAPI: {}\nInbound: {}",
            state, panel.id, panel.name, panel.api_url, panel.inbound_id
        ));
        if products.is_empty() {
            text.push_str("\n  - بدون محصول");
        }
        for product in products {
            text.push_str(&format!(
                "\n  • #{} {} | {} گیگ | {} روز | {}",
                product.id,
                product.name,
                product.volume_gb,
                product.duration_days,
                format_balance(product.price)
            ));
        }
    }
    text
}

pub fn purchase_report(user: &User, purchase: &Purchase) -> String {
    let mut text = format!(
        "🛒 خرید جدید\n\n\
         کاربر: {} ({})\n\
         سرویس: {} (#{})\n\
         سرور: {}\n\
         بسته: {}\n\
         مبلغ: {}",
        user_display_name(user),
        user.tg_user_id,
        purchase.service.client_name,
        purchase.service.id,
        purchase.panel.name,
        purchase.product.name,
        format_balance(purchase.price)
    );
    if let Some(code) = &purchase.discount_code {
        text.push_str(&format!("\nکد تخفیف: {}", code));
    }
    text
}

pub fn renewal_report(user: &User, receipt: &RenewalReceipt) -> String {
    let quote = &receipt.quote;
    format!(
        "♻️ تمدید سرویس\n\n\
         کاربر: {} ({})\n\
         سرویس: {} (#{})\n\
         روش: {}\n\
         بسته: {}\n\
         نتیجه: {}\n\
         مبلغ: {}",
        user_display_name(user),
        user.tg_user_id,
        quote.snapshot.service.client_name,
        quote.snapshot.service.id,
        quote.method.display_name(),
        quote.product.name,
        quote.outcome.description,
        format_balance(quote.price())
    )
}

fn code_usage(max_uses: i64, used_count: i64) -> String {
    if max_uses > 0 {
        format!("{}/{}", used_count, max_uses)
    } else {
        format!("{}/∞", used_count)
    }
}

pub fn render_gift_receipt(receipt: &GiftReceipt) -> String {
    format!(
        "🎁 کد {} با موفقیت ثبت شد!\n\n\
         مبلغ هدیه: {}\n\
         موجودی جدید: {}",
        receipt.code,
        format_balance(receipt.amount),
        format_balance(receipt.balance)
    )
}

pub fn render_spin_outcome(outcome: &SpinOutcome) -> String {
    let mut text = format!("🎡 گردونه چرخید...\n\nنتیجه: {}", outcome.prize.label);
    match outcome.prize.kind {
        PrizeKind::Balance => text.push_str(&format!(
            "\n\n🎉 {} به کیف پول شما اضافه شد.",
            format_balance(outcome.prize.value)
        )),
        PrizeKind::Discount => {
            if let Some(code) = &outcome.discount_code {
                text.push_str(&format!(
                    "\n\n🎟 کد تخفیف شما: {}\nاین کد تا ۷ روز و فقط برای یک خرید معتبر است.",
                    code
                ));
            }
        }
        PrizeKind::Nothing => text.push_str("\n\nاین بار شانس با شما نبود، فردا دوباره امتحان کنید!"),
    }
    text.push_str(&format!("\n\nموجودی: {}", format_balance(outcome.balance)));
    text
}

pub fn render_gift_created(gift: &GiftCode) -> String {
    format!(
        "✅ کد هدیه ساخته شد:\n\n\
         کد: {}\n\
         مبلغ: {}\n\
         ظرفیت: {}\n\
         انقضا: {}",
        gift.code,
        format_balance(gift.amount),
        code_usage(gift.max_uses, gift.used_count),
        format_expiry(gift.expires_at.and_then(|ts| DateTime::from_timestamp(ts, 0)))
    )
}

fn discount_value(discount: &DiscountCode) -> String {
    match discount.kind {
        DiscountKind::Percent => format!("{}٪", discount.value),
        DiscountKind::Fixed => format_balance(discount.value),
    }
}

pub fn render_discount_created(discount: &DiscountCode) -> String {
    format!(
        "✅ کد تخفیف ساخته شد:\n\n\
         کد: {}\n\
         تخفیف: {}\n\
         ظرفیت: {}\n\
         انقضا: {}",
        discount.code,
        discount_value(discount),
        code_usage(discount.max_uses, discount.used_count),
        format_expiry(discount.expires_at.and_then(|ts| DateTime::from_timestamp(ts, 0)))
    )
}

pub fn render_codes(gifts: &[GiftCode], discounts: &[DiscountCode], now: i64) -> String {
    let mut text = String::from("🎁 کدهای هدیه");
    if gifts.is_empty() {
        text.push_str("\n  - موردی ثبت نشده است");
    }
    for gift in gifts {
        let mark = if gift.rejection(now).is_none() { "🟢" } else { "🔴" };
        text.push_str(&format!(
            "\n{} {} | {} | {}",
            mark,
            gift.code,
            format_balance(gift.amount),
            code_usage(gift.max_uses, gift.used_count)
        ));
    }
    text.push_str("\n\n🎟 کدهای تخفیف");
    if discounts.is_empty() {
        text.push_str("\n  - موردی ثبت نشده است");
    }
    for discount in discounts {
        let mark = if discount.rejection(0, now).is_none() { "🟢" } else { "🔴" };
        text.push_str(&format!(
            "\n{} {} | {} | {}",
            mark,
            discount.code,
            discount_value(discount),
            code_usage(discount.max_uses, discount.used_count)
        ));
    }
    text
}

fn ticket_status_label(status: TicketStatus) -> &'static str {
    match status {
        TicketStatus::Open => "🟡 در انتظار پاسخ",
        TicketStatus::Answered => "🟢 پاسخ داده شده",
        TicketStatus::Closed => "⚪️ بسته شده",
    }
}

pub fn render_ticket_list(tickets: &[Ticket]) -> String {
    if tickets.is_empty() {
        return "🎫 تیکت بازی وجود ندارد.".to_string();
    }
    let mut text = String::from("🎫 تیکت‌های باز");
    for ticket in tickets {
        text.push_str(&format!(
            "\n\n#{} {}\n{} | {}",
            ticket.id,
            ticket.subject,
            ticket_status_label(ticket.status),
            format_date(ticket.updated_at)
        ));
    }
    text.push_str("\n\nمشاهده: /ticket <id>");
    text
}

pub fn render_ticket_thread(ticket: &Ticket, messages: &[TicketMessage]) -> String {
    let mut text = format!(
        "🎫 تیکت #{}\nموضوع: {}\nوضعیت: {}",
        ticket.id,
        ticket.subject,
        ticket_status_label(ticket.status)
    );
    for message in messages {
        let sender = if message.is_admin { "🛠 پشتیبانی" } else { "👤 کاربر" };
        text.push_str(&format!(
            "\n\n{} | {}\n{}",
            sender,
            format_date(message.created_at),
            message.body
        ));
    }
    text
}

pub fn ticket_notice(ticket: &Ticket, from: &str, body: &str, is_new: bool) -> String {
    let title = if is_new { "🎫 تیکت جدید" } else { "✉️ پیام جدید در تیکت" };
    format!(
        "{} #{}\nاز: {}\nموضوع: {}\n\n{}",
        title, ticket.id, from, ticket.subject, body
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ServiceStatus;

    fn user() -> User {
        User {
            id: 1,
            tg_user_id: 777,
            username: Some("sara".to_string()),
            first_name: Some("Sara".to_string()),
            last_name: None,
            balance: 25_000,
            referral_code: "AbCd1234".to_string(),
            referred_by: None,
            total_spent: 150_000,
            created_at: 0,
        }
    }

    fn snapshot(live: bool) -> ServiceSnapshot {
        ServiceSnapshot {
            service: Service {
                id: 5,
                user_id: 1,
                panel_id: 1,
                product_id: Some(1),
                client_name: "SARA1".to_string(),
                client_uuid: "uuid".to_string(),
                email: "SARA1".to_string(),
                inbound_id: 1,
                sub_id: "abcdef0123456789".to_string(),
                total_gb: 30.0,
                used_gb: 10.0,
                expires_at: None,
                status: ServiceStatus::Active,
                created_at: 0,
                alerts_sent: 0,
            },
            panel: Panel {
                id: 1,
                name: "de-1".to_string(),
                api_url: "https://de.example.com".to_string(),
                username: "admin".to_string(),
                password: "admin".to_string(),
                inbound_id: 1,
                subscription_url: Some("https://de.example.com/sub".to_string()),
                is_active: true,
                created_at: 0,
            },
            used_gb: 10.0,
            total_gb: 30.0,
            expires_at: None,
            status: ServiceStatus::Active,
            renewals: if live { 2 } else { 0 },
            live,
        }
    }

    #[test]
    fn service_card_shows_usage_and_link() {
        let text = render_service_card(&snapshot(true), Utc::now());
        assert!(text.contains("SARA1"));
        assert!(text.contains("30.0GB"));
        assert!(text.contains("20.0GB"));
        assert!(text.contains("https://de.example.com/sub/abcdef0123456789"));
        assert!(text.contains("تعداد تمدید: 2"));
        assert!(!text.contains("⚠️"));

        let cached = render_service_card(&snapshot(false), Utc::now());
        assert!(cached.contains("⚠️"));
        assert!(!cached.contains("تعداد تمدید"));
    }

    #[test]
    fn wallet_lists_transactions() {
        let txs = vec![BalanceTransaction {
            id: 1,
            user_id: 1,
            amount: -150_000,
            kind: "purchase".to_string(),
            description: None,
            created_at: 0,
        }];
        let text = render_wallet(&user(), &txs);
        assert!(text.contains("25,000 تومان"));
        assert!(text.contains("➖ 150,000 تومان | خرید"));
        assert!(render_wallet(&user(), &[]).contains("تراکنشی ثبت نشده"));
    }

    #[test]
    fn referral_falls_back_to_code_without_link() {
        let text = render_referral(&user(), 2, None, 3000, true);
        assert!(text.contains("AbCd1234"));
        assert!(text.contains("3,000 تومان"));
        assert!(render_referral(&user(), 0, None, 3000, false).contains("غیرفعال"));
    }

    #[test]
    fn welcome_mentions_bonus_only_for_new_users() {
        assert!(welcome_text(&user(), true, 1000).contains("1,000 تومان"));
        assert!(!welcome_text(&user(), false, 1000).contains("هدیه"));
    }

    fn quote(discount: Option<DiscountCode>, balance: i64) -> PurchaseQuote {
        let product = Product {
            id: 2,
            panel_id: 1,
            name: "Monthly".to_string(),
            volume_gb: 30,
            duration_days: 30,
            price: 100_000,
            is_active: true,
        };
        let discount_amount = discount
            .as_ref()
            .map(|discount| discount.discount_for(product.price))
            .unwrap_or(0);
        PurchaseQuote {
            product,
            panel: snapshot(true).panel,
            balance,
            discount,
            discount_amount,
        }
    }

    fn discount(kind: DiscountKind, value: i64) -> DiscountCode {
        DiscountCode {
            id: 1,
            code: "OFF20".to_string(),
            kind,
            value,
            max_uses: 0,
            used_count: 3,
            owner_user_id: None,
            expires_at: None,
            is_active: true,
            created_at: 0,
        }
    }

    #[test]
    fn preview_shows_discounted_price_and_shortfall() {
        let text = render_purchase_preview(&quote(Some(discount(DiscountKind::Percent, 20)), 90_000));
        assert!(text.contains("OFF20"));
        assert!(text.contains("20,000 تومان-"));
        assert!(text.contains("80,000 تومان"));
        assert!(!text.contains("کمبود"));

        let short = render_purchase_preview(&quote(None, 40_000));
        assert!(short.contains("کمبود: 60,000 تومان"));
    }

    #[test]
    fn codes_list_marks_usage() {
        let text = render_codes(&[], &[discount(DiscountKind::Fixed, 15_000)], 0);
        assert!(text.contains("موردی ثبت نشده"));
        assert!(text.contains("🟢 OFF20 | 15,000 تومان | 3/∞"));
    }

    #[test]
    fn ticket_thread_labels_senders() {
        let ticket = Ticket {
            id: 9,
            user_id: 1,
            subject: "اتصال قطع است".to_string(),
            status: TicketStatus::Answered,
            created_at: 0,
            updated_at: 0,
        };
        let message = |is_admin, body: &str| TicketMessage {
            id: 0,
            ticket_id: 9,
            sender_tg_id: 777,
            is_admin,
            body: body.to_string(),
            created_at: 0,
        };
        let text = render_ticket_thread(
            &ticket,
            &[message(false, "سرویس وصل نمی‌شود"), message(true, "بررسی شد")],
        );
        assert!(text.contains("#9"));
        assert!(text.contains("👤 کاربر"));
        assert!(text.contains("🛠 پشتیبانی"));
        assert!(text.contains("پاسخ داده شده"));
        assert!(render_ticket_list(&[]).contains("وجود ندارد"));
    }

    #[test]
    fn spin_outcome_names_the_prize() {
        let outcome = SpinOutcome {
            prize: crate::wheel::default_prizes()[4].clone(),
            balance: 5_000,
            discount_code: Some("ABCD123456".to_string()),
        };
        let text = render_spin_outcome(&outcome);
        assert!(text.contains("کد تخفیف ۱۰٪"));
        assert!(text.contains("ABCD123456"));

        let miss = SpinOutcome {
            prize: crate::wheel::WheelPrize::nothing(),
            balance: 5_000,
            discount_code: None,
        };
        assert!(render_spin_outcome(&miss).contains("شانس با شما نبود"));
    }
}
