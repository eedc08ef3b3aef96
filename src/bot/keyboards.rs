//! Bot keyboards: the persistent reply menu and inline flows.

use crate::db::{Panel, Product};
use crate::naming::{self, NamingMethod};
use crate::renewal::RenewalMethod;
use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup, KeyboardButton, KeyboardMarkup};

pub const BTN_BUY: &str = "🛒 خرید سرویس";
pub const BTN_SERVICES: &str = "📦 سرویس‌های من";
pub const BTN_WALLET: &str = "💰 کیف پول";
pub const BTN_REFERRAL: &str = "👥 دعوت دوستان";
pub const BTN_GIFT: &str = "🎁 کد هدیه";
pub const BTN_WHEEL: &str = "🎡 گردونه شانس";
pub const BTN_SUPPORT: &str = "🎫 پشتیبانی";
pub const BTN_HELP: &str = "❓ راهنما";

pub const BTN_ADMIN_STATS: &str = "📊 آمار";
pub const BTN_ADMIN_PANELS: &str = "🖥 پنل‌ها";
pub const BTN_ADMIN_HELP: &str = "🛠 دستورات ادمین";

const MENU_BUTTONS: [&str; 11] = [
    BTN_BUY,
    BTN_SERVICES,
    BTN_WALLET,
    BTN_REFERRAL,
    BTN_GIFT,
    BTN_WHEEL,
    BTN_SUPPORT,
    BTN_HELP,
    BTN_ADMIN_STATS,
    BTN_ADMIN_PANELS,
    BTN_ADMIN_HELP,
];

/// Text sent by one of the reply-menu buttons.
pub fn is_menu_button(text: &str) -> bool {
    MENU_BUTTONS.contains(&text)
}

fn user_rows() -> Vec<Vec<KeyboardButton>> {
    vec![
        vec![KeyboardButton::new(BTN_BUY), KeyboardButton::new(BTN_SERVICES)],
        vec![
            KeyboardButton::new(BTN_WALLET),
            KeyboardButton::new(BTN_REFERRAL),
        ],
        vec![KeyboardButton::new(BTN_GIFT), KeyboardButton::new(BTN_WHEEL)],
        vec![KeyboardButton::new(BTN_SUPPORT), KeyboardButton::new(BTN_HELP)],
    ]
}

pub fn user_menu() -> KeyboardMarkup {
    KeyboardMarkup::new(user_rows())
        .resize_keyboard()
        .persistent()
}

pub fn admin_menu() -> KeyboardMarkup {
    let mut rows = user_rows();
    rows.push(vec![
        KeyboardButton::new(BTN_ADMIN_STATS),
        KeyboardButton::new(BTN_ADMIN_PANELS),
    ]);
    rows.push(vec![KeyboardButton::new(BTN_ADMIN_HELP)]);
    KeyboardMarkup::new(rows).resize_keyboard().persistent()
}

pub fn menu_for(is_admin: bool) -> KeyboardMarkup {
    if is_admin { admin_menu() } else { user_menu() }
}

fn cancel_row() -> Vec<InlineKeyboardButton> {
    vec![InlineKeyboardButton::callback("❌ انصراف", "cancel")]
}

/// Attached to free-text prompts so the user can back out.
pub fn prompt_cancel_keyboard() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::default().append_row(cancel_row())
}

pub fn product_title(product: &Product) -> String {
    format!(
        "{} | {} گیگ | {} روز | {}",
        product.name,
        product.volume_gb,
        product.duration_days,
        naming::format_balance(product.price)
    )
}

pub fn panels_keyboard(panels: &[Panel]) -> InlineKeyboardMarkup {
    let mut keyboard = InlineKeyboardMarkup::default();
    for panel in panels {
        keyboard = keyboard.append_row(vec![InlineKeyboardButton::callback(
            format!("🌐 {}", panel.name),
            format!("buy_panel:{}", panel.id),
        )]);
    }
    keyboard.append_row(cancel_row())
}

pub fn products_keyboard(products: &[Product]) -> InlineKeyboardMarkup {
    let mut keyboard = InlineKeyboardMarkup::default();
    for product in products {
        keyboard = keyboard.append_row(vec![InlineKeyboardButton::callback(
            product_title(product),
            format!("buy_product:{}", product.id),
        )]);
    }
    keyboard
        .append_row(vec![InlineKeyboardButton::callback("🔙 بازگشت", "buy_back")])
        .append_row(cancel_row())
}

pub fn purchase_confirm_keyboard(
    product_id: i64,
    discount_code: Option<&str>,
) -> InlineKeyboardMarkup {
    let confirm = match discount_code {
        Some(code) => format!("buy_confirm:{}:{}", product_id, code),
        None => format!("buy_confirm:{}", product_id),
    };
    let mut keyboard = InlineKeyboardMarkup::default()
        .append_row(vec![InlineKeyboardButton::callback("✅ تایید و پرداخت", confirm)]);
    if discount_code.is_none() {
        keyboard = keyboard.append_row(vec![InlineKeyboardButton::callback(
            "🎟 کد تخفیف",
            format!("buy_code:{}", product_id),
        )]);
    }
    keyboard.append_row(cancel_row())
}

/// `services` holds `(service_id, title)` pairs for the current page.
pub fn services_page_keyboard(
    services: &[(i64, String)],
    page: i64,
    total_pages: i64,
) -> InlineKeyboardMarkup {
    let mut keyboard = InlineKeyboardMarkup::default();
    for (service_id, title) in services {
        keyboard = keyboard.append_row(vec![InlineKeyboardButton::callback(
            title.clone(),
            format!("svc_open:{}:{}", service_id, page),
        )]);
    }

    let mut nav = Vec::new();
    if page > 1 {
        nav.push(InlineKeyboardButton::callback(
            "⬅️ قبلی",
            format!("svc_page:{}", page - 1),
        ));
    }
    if page < total_pages {
        nav.push(InlineKeyboardButton::callback(
            "بعدی ➡️",
            format!("svc_page:{}", page + 1),
        ));
    }
    if !nav.is_empty() {
        keyboard = keyboard.append_row(nav);
    }
    keyboard
}

pub fn service_card_keyboard(service_id: i64, page: i64) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::default()
        .append_row(vec![
            InlineKeyboardButton::callback("🔄 بروزرسانی", format!("svc_open:{}:{}", service_id, page)),
            InlineKeyboardButton::callback("📷 QR کد", format!("svc_qr:{}", service_id)),
        ])
        .append_row(vec![InlineKeyboardButton::callback(
            "♻️ تمدید سرویس",
            format!("svc_renew:{}", service_id),
        )])
        .append_row(vec![InlineKeyboardButton::callback(
            "🔙 لیست سرویس‌ها",
            format!("svc_page:{}", page),
        )])
}

/// Shortcut under monitor alerts.
pub fn service_alert_keyboard(service_id: i64) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::default().append_row(vec![
        InlineKeyboardButton::callback("♻️ تمدید سرویس", format!("svc_renew:{}", service_id)),
        InlineKeyboardButton::callback("📦 مشاهده سرویس", format!("svc_open:{}:1", service_id)),
    ])
}

pub fn ticket_reply_keyboard(ticket_id: i64) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::default().append_row(vec![InlineKeyboardButton::callback(
        "✉️ ارسال پاسخ",
        format!("ticket_reply:{}", ticket_id),
    )])
}

pub fn ticket_admin_keyboard(ticket_id: i64) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::default().append_row(vec![
        InlineKeyboardButton::callback("✉️ پاسخ", format!("ticket_answer:{}", ticket_id)),
        InlineKeyboardButton::callback("🔒 بستن", format!("ticket_close:{}", ticket_id)),
    ])
}

pub fn renewal_products_keyboard(service_id: i64, products: &[Product]) -> InlineKeyboardMarkup {
    let mut keyboard = InlineKeyboardMarkup::default();
    for product in products {
        keyboard = keyboard.append_row(vec![InlineKeyboardButton::callback(
            product_title(product),
            format!("renew_pick:{}:{}", service_id, product.id),
        )]);
    }
    keyboard
        .append_row(vec![InlineKeyboardButton::callback(
            "🔙 بازگشت",
            format!("svc_open:{}:1", service_id),
        )])
        .append_row(cancel_row())
}

pub fn renewal_confirm_keyboard(service_id: i64, product_id: i64) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::default()
        .append_row(vec![InlineKeyboardButton::callback(
            "✅ تایید تمدید",
            format!("renew_ok:{}:{}", service_id, product_id),
        )])
        .append_row(vec![InlineKeyboardButton::callback(
            "🔙 انتخاب بسته دیگر",
            format!("svc_renew:{}", service_id),
        )])
        .append_row(cancel_row())
}

pub fn renewal_method_keyboard(current: RenewalMethod) -> InlineKeyboardMarkup {
    let mut keyboard = InlineKeyboardMarkup::default();
    for method in RenewalMethod::all() {
        let mark = if method == current { "✅ " } else { "" };
        keyboard = keyboard.append_row(vec![InlineKeyboardButton::callback(
            format!("{}{}. {}", mark, method.value(), method.display_name()),
            format!("set_renewal:{}", method.value()),
        )]);
    }
    keyboard
}

pub fn naming_method_keyboard(current: NamingMethod) -> InlineKeyboardMarkup {
    let mut keyboard = InlineKeyboardMarkup::default();
    for method in NamingMethod::all() {
        let mark = if method == current { "✅ " } else { "" };
        keyboard = keyboard.append_row(vec![InlineKeyboardButton::callback(
            format!("{}{}. {}", mark, method.value(), method.display_name()),
            format!("set_naming:{}", method.value()),
        )]);
    }
    keyboard
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_menu_row_is_a_known_button() {
        assert!(is_menu_button(BTN_WALLET));
        assert!(is_menu_button(BTN_ADMIN_HELP));
        assert!(!is_menu_button("MyName"));
        assert!(!is_menu_button("💰"));
        assert_eq!(user_rows().iter().map(Vec::len).sum::<usize>(), 8);
    }

    #[test]
    fn discount_button_only_before_a_code_is_applied() {
        let plain = purchase_confirm_keyboard(4, None);
        assert_eq!(plain.inline_keyboard.len(), 3);
        let with_code = purchase_confirm_keyboard(4, Some("OFF20"));
        assert_eq!(with_code.inline_keyboard.len(), 2);
    }
}
