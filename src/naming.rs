//! Panel client names and the display helpers used in bot messages.

use rand::Rng;
use rand::distr::{Alphanumeric, SampleString};

const UPPER_ALNUM: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const DIGITS: &[u8] = b"0123456789";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamingMethod {
    UsernameSequential,
    IdRandom,
    UserCustom,
    UserCustomRandom,
    AdminTextRandom,
    AdminTextSequential,
    IdSequential,
    ResellerSequential,
}

impl NamingMethod {
    pub fn all() -> [NamingMethod; 8] {
        [
            NamingMethod::UsernameSequential,
            NamingMethod::IdRandom,
            NamingMethod::UserCustom,
            NamingMethod::UserCustomRandom,
            NamingMethod::AdminTextRandom,
            NamingMethod::AdminTextSequential,
            NamingMethod::IdSequential,
            NamingMethod::ResellerSequential,
        ]
    }

    pub fn value(self) -> i64 {
        match self {
            NamingMethod::UsernameSequential => 1,
            NamingMethod::IdRandom => 2,
            NamingMethod::UserCustom => 3,
            NamingMethod::UserCustomRandom => 4,
            NamingMethod::AdminTextRandom => 5,
            NamingMethod::AdminTextSequential => 6,
            NamingMethod::IdSequential => 7,
            NamingMethod::ResellerSequential => 8,
        }
    }

    pub fn from_value(value: i64) -> Self {
        match value {
            1 => NamingMethod::UsernameSequential,
            3 => NamingMethod::UserCustom,
            4 => NamingMethod::UserCustomRandom,
            5 => NamingMethod::AdminTextRandom,
            6 => NamingMethod::AdminTextSequential,
            7 => NamingMethod::IdSequential,
            8 => NamingMethod::ResellerSequential,
            _ => NamingMethod::IdRandom,
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            NamingMethod::UsernameSequential => "📝 نام کاربری + شماره ترتیبی",
            NamingMethod::IdRandom => "🔢 آیدی عددی + رندوم",
            NamingMethod::UserCustom => "✏️ نام دلخواه کاربر",
            NamingMethod::UserCustomRandom => "🎲 نام دلخواه + رندوم",
            NamingMethod::AdminTextRandom => "👤 متن ادمین + رندوم",
            NamingMethod::AdminTextSequential => "📊 متن ادمین + ترتیبی",
            NamingMethod::IdSequential => "🔗 آیدی + ترتیبی",
            NamingMethod::ResellerSequential => "💼 متن نماینده + ترتیبی",
        }
    }

    pub fn is_sequential(self) -> bool {
        matches!(
            self,
            NamingMethod::UsernameSequential
                | NamingMethod::AdminTextSequential
                | NamingMethod::IdSequential
                | NamingMethod::ResellerSequential
        )
    }

    /// Settings key of the persistent counter, if the method needs one.
    pub fn sequence_key(self, panel_id: i64) -> Option<String> {
        let scope = match self {
            NamingMethod::UsernameSequential => "user",
            NamingMethod::AdminTextSequential => "admin",
            NamingMethod::IdSequential => "id",
            NamingMethod::ResellerSequential => "reseller",
            _ => return None,
        };
        Some(format!("username_seq_{}_{}", scope, panel_id))
    }
}

#[derive(Debug, Clone, Default)]
pub struct NamingContext<'a> {
    pub tg_user_id: i64,
    pub username: Option<&'a str>,
    pub first_name: Option<&'a str>,
    pub custom_name: Option<&'a str>,
    pub admin_prefix: Option<&'a str>,
    pub reseller_prefix: Option<&'a str>,
}

/// Builds a client name. Sequential methods expect `sequence` from the
/// persistent counter; `None` is treated as 1.
pub fn generate_client_name<R: Rng + ?Sized>(
    method: NamingMethod,
    ctx: &NamingContext<'_>,
    sequence: Option<i64>,
    rng: &mut R,
) -> String {
    let seq = sequence.unwrap_or(1);
    match method {
        NamingMethod::UsernameSequential => {
            let base = clean_name(ctx.username.or(ctx.first_name).unwrap_or("user"));
            let base = if base.is_empty() { "USER".to_string() } else { base };
            format!("{}{}", truncate(&base, 8), seq)
        }
        NamingMethod::IdRandom => id_random(ctx.tg_user_id, rng),
        NamingMethod::UserCustom => match ctx.custom_name.map(clean_name) {
            Some(name) if !name.is_empty() => {
                let mut name = truncate(&name, 12);
                if name.len() < 4 {
                    name.push_str(&id_tail(ctx.tg_user_id));
                }
                name
            }
            _ => id_random(ctx.tg_user_id, rng),
        },
        NamingMethod::UserCustomRandom => match ctx.custom_name.map(clean_name) {
            Some(name) if !name.is_empty() => {
                format!("{}{}", truncate(&name, 6), random_from(DIGITS, 4, rng))
            }
            _ => id_random(ctx.tg_user_id, rng),
        },
        NamingMethod::AdminTextRandom => format!(
            "{}{}",
            prefix_or(ctx.admin_prefix, "VIP", 4),
            random_from(UPPER_ALNUM, 6, rng)
        ),
        NamingMethod::AdminTextSequential => {
            format!("{}{:04}", prefix_or(ctx.admin_prefix, "VIP", 4), seq)
        }
        NamingMethod::IdSequential => format!("{}{:04}", id_tail(ctx.tg_user_id), seq),
        NamingMethod::ResellerSequential => {
            format!("{}{:05}", prefix_or(ctx.reseller_prefix, "RS", 3), seq)
        }
    }
}

fn id_random<R: Rng + ?Sized>(tg_user_id: i64, rng: &mut R) -> String {
    format!("{}{}", id_tail(tg_user_id), random_from(UPPER_ALNUM, 4, rng))
}

fn id_tail(tg_user_id: i64) -> String {
    let id = tg_user_id.unsigned_abs().to_string();
    id[id.len().saturating_sub(4)..].to_string()
}

fn prefix_or(prefix: Option<&str>, fallback: &str, max: usize) -> String {
    let cleaned = prefix.map(clean_name).unwrap_or_default();
    if cleaned.is_empty() {
        truncate(fallback, max)
    } else {
        truncate(&cleaned, max)
    }
}

fn random_from<R: Rng + ?Sized>(alphabet: &[u8], len: usize, rng: &mut R) -> String {
    (0..len)
        .map(|_| alphabet[rng.random_range(0..alphabet.len())] as char)
        .collect()
}

fn truncate(value: &str, max: usize) -> String {
    value.chars().take(max).collect()
}

/// Keeps ASCII letters and digits, upper-cased.
pub fn clean_name(name: &str) -> String {
    name.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Subscription id for a 3x-ui client: 16 lowercase hex characters.
pub fn generate_sub_id() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes)
}

pub fn generate_referral_code() -> String {
    Alphanumeric.sample_string(&mut rand::rng(), 8)
}

/// Gift and discount codes: 10 upper-case letters and digits.
pub fn generate_promo_code() -> String {
    Alphanumeric
        .sample_string(&mut rand::rng(), 10)
        .to_ascii_uppercase()
}

pub fn format_display_name(
    username: Option<&str>,
    first_name: Option<&str>,
    last_name: Option<&str>,
) -> String {
    if let Some(first_name) = first_name.filter(|name| !name.trim().is_empty()) {
        let mut display = first_name.trim().to_string();
        if let Some(last_name) = last_name.filter(|name| !name.trim().is_empty()) {
            display.push(' ');
            display.push_str(last_name.trim());
        }
        return truncate(&display, 20);
    }
    if let Some(username) = username {
        let cleaned: String = username
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '.')
            .collect();
        if !cleaned.is_empty() {
            return truncate(&cleaned, 15);
        }
    }
    "کاربر".to_string()
}

/// `1234567` -> `1,234,567 تومان`
pub fn format_balance(amount: i64) -> String {
    let digits = amount.unsigned_abs().to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (index, ch) in digits.chars().enumerate() {
        if index > 0 && (digits.len() - index) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    let sign = if amount < 0 { "-" } else { "" };
    format!("{}{} تومان", sign, grouped)
}

pub fn format_data_amount(gb: f64) -> String {
    if gb >= 1000.0 {
        format!("{:.1}TB", gb / 1000.0)
    } else if gb >= 1.0 {
        format!("{:.1}GB", gb)
    } else {
        format!("{}MB", (gb * 1024.0).round() as i64)
    }
}

pub fn format_time_remaining(seconds: i64) -> String {
    if seconds <= 0 {
        return "منقضی شده".to_string();
    }
    let days = seconds / 86_400;
    let hours = (seconds % 86_400) / 3_600;
    let minutes = (seconds % 3_600) / 60;
    if days > 0 {
        format!("{} روز و {} ساعت", days, hours)
    } else if hours > 0 {
        format!("{} ساعت و {} دقیقه", hours, minutes)
    } else {
        format!("{} دقیقه", minutes)
    }
}

pub fn format_status(status: &str) -> String {
    match status.to_lowercase().as_str() {
        "active" => "🟢 فعال".to_string(),
        "inactive" | "disabled" => "🔴 غیرفعال".to_string(),
        "expired" => "⏰ منقضی شده".to_string(),
        "suspended" => "⏸️ معلق".to_string(),
        "deleted" => "🗑 حذف شده".to_string(),
        other => format!("⚪ {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn ctx(tg_user_id: i64) -> NamingContext<'static> {
        NamingContext {
            tg_user_id,
            ..Default::default()
        }
    }

    #[test]
    fn id_random_uses_last_four_digits() {
        let mut rng = StdRng::seed_from_u64(7);
        let name = generate_client_name(NamingMethod::IdRandom, &ctx(123456789), None, &mut rng);
        assert_eq!(name.len(), 8);
        assert!(name.starts_with("6789"));
        assert!(name[4..].chars().all(|c| UPPER_ALNUM.contains(&(c as u8))));
    }

    #[test]
    fn sequential_methods_pad_counter() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut context = ctx(555001);
        context.admin_prefix = Some("gold-vip");
        context.reseller_prefix = Some("shop");
        assert_eq!(
            generate_client_name(NamingMethod::AdminTextSequential, &context, Some(7), &mut rng),
            "GOLD0007"
        );
        assert_eq!(
            generate_client_name(NamingMethod::IdSequential, &context, Some(12), &mut rng),
            "50010012"
        );
        assert_eq!(
            generate_client_name(NamingMethod::ResellerSequential, &context, Some(3), &mut rng),
            "SHO00003"
        );
    }

    #[test]
    fn username_sequential_falls_back_to_first_name() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut context = ctx(1);
        context.first_name = Some("Reza!");
        assert_eq!(
            generate_client_name(NamingMethod::UsernameSequential, &context, Some(4), &mut rng),
            "REZA4"
        );
        context.username = Some("a_very_long_username");
        assert_eq!(
            generate_client_name(NamingMethod::UsernameSequential, &context, Some(4), &mut rng),
            "AVERYLON4"
        );
    }

    #[test]
    fn custom_name_without_input_is_random() {
        let mut rng = StdRng::seed_from_u64(3);
        let name = generate_client_name(NamingMethod::UserCustom, &ctx(98765), None, &mut rng);
        assert!(name.starts_with("8765"));

        let mut context = ctx(98765);
        context.custom_name = Some("ab");
        let name = generate_client_name(NamingMethod::UserCustom, &context, None, &mut rng);
        assert_eq!(name, "AB8765");
    }

    #[test]
    fn sequence_keys_only_for_sequential_methods() {
        assert_eq!(
            NamingMethod::IdSequential.sequence_key(3).as_deref(),
            Some("username_seq_id_3")
        );
        assert!(NamingMethod::IdRandom.sequence_key(3).is_none());
        for value in 1..=8 {
            let method = NamingMethod::from_value(value);
            assert_eq!(method.is_sequential(), method.sequence_key(1).is_some());
        }
        assert_eq!(NamingMethod::from_value(99), NamingMethod::IdRandom);
    }

    #[test]
    fn balance_is_grouped() {
        assert_eq!(format_balance(0), "0 تومان");
        assert_eq!(format_balance(950), "950 تومان");
        assert_eq!(format_balance(1000), "1,000 تومان");
        assert_eq!(format_balance(1234567), "1,234,567 تومان");
        assert_eq!(format_balance(-25000), "-25,000 تومان");
    }

    #[test]
    fn time_remaining_units() {
        assert_eq!(format_time_remaining(-5), "منقضی شده");
        assert_eq!(format_time_remaining(90_000), "1 روز و 1 ساعت");
        assert_eq!(format_time_remaining(7_260), "2 ساعت و 1 دقیقه");
        assert_eq!(format_time_remaining(300), "5 دقیقه");
    }

    #[test]
    fn data_amount_units() {
        assert_eq!(format_data_amount(1500.0), "1.5TB");
        assert_eq!(format_data_amount(20.0), "20.0GB");
        assert_eq!(format_data_amount(0.5), "512MB");
    }

    #[test]
    fn display_name_priority() {
        assert_eq!(format_display_name(Some("nick"), Some("Ali"), Some("Karimi")), "Ali Karimi");
        assert_eq!(format_display_name(Some("@nick!"), None, None), "nick");
        assert_eq!(format_display_name(None, Some("  "), None), "کاربر");
    }

    #[test]
    fn promo_codes_survive_cleaning() {
        let code = generate_promo_code();
        assert_eq!(code.len(), 10);
        assert_eq!(clean_name(&code), code);
        assert_eq!(clean_name(" summer-20 "), "SUMMER20");
    }

    #[test]
    fn sub_id_is_hex() {
        let sub_id = generate_sub_id();
        assert_eq!(sub_id.len(), 16);
        assert!(sub_id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(generate_referral_code().len(), 8);
    }
}
