//! Bot configuration loaded from a TOML file.

use crate::wheel::{self, WheelPrize};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    bot_token: Option<String>,
    #[serde(default)]
    pub admin_ids: Vec<i64>,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Chat that receives purchase and renewal reports.
    #[serde(default)]
    pub reports_chat_id: Option<i64>,
    #[serde(default = "default_services_page_size")]
    pub services_page_size: i64,
    #[serde(default)]
    pub referral: ReferralConfig,
    #[serde(default)]
    pub renewal: RenewalConfig,
    #[serde(default)]
    pub naming: NamingConfig,
    #[serde(default)]
    pub panel: PanelConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub wheel: WheelConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReferralConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_reward_amount")]
    pub reward_amount: i64,
    #[serde(default = "default_welcome_bonus")]
    pub welcome_bonus: i64,
}

impl Default for ReferralConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            reward_amount: default_reward_amount(),
            welcome_bonus: default_welcome_bonus(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RenewalConfig {
    /// Used until an admin picks a method with /renewalmethod.
    #[serde(default = "default_renewal_method")]
    pub default_method: i64,
}

impl Default for RenewalConfig {
    fn default() -> Self {
        Self {
            default_method: default_renewal_method(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NamingConfig {
    #[serde(default = "default_naming_method")]
    pub method: i64,
    #[serde(default)]
    pub admin_prefix: Option<String>,
    #[serde(default)]
    pub reseller_prefix: Option<String>,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            method: default_naming_method(),
            admin_prefix: None,
            reseller_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PanelConfig {
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// 3x-ui panels are commonly deployed with self-signed certificates.
    #[serde(default = "default_true")]
    pub accept_invalid_certs: bool,
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
            accept_invalid_certs: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_monitor_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_usage_warning_percent")]
    pub usage_warning_percent: f64,
    #[serde(default = "default_expiry_warning_days")]
    pub expiry_warning_days: i64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_monitor_interval_secs(),
            usage_warning_percent: default_usage_warning_percent(),
            expiry_warning_days: default_expiry_warning_days(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WheelConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_wheel_cooldown_hours")]
    pub cooldown_hours: i64,
    #[serde(default)]
    pub spin_cost: i64,
    #[serde(default = "wheel::default_prizes")]
    pub prizes: Vec<WheelPrize>,
}

impl Default for WheelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cooldown_hours: default_wheel_cooldown_hours(),
            spin_cost: 0,
            prizes: wheel::default_prizes(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/hooshnet-bot/bot.db")
}

fn default_services_page_size() -> i64 {
    8
}

fn default_true() -> bool {
    true
}

fn default_reward_amount() -> i64 {
    3000
}

fn default_welcome_bonus() -> i64 {
    1000
}

fn default_renewal_method() -> i64 {
    1
}

fn default_naming_method() -> i64 {
    2
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_monitor_interval_secs() -> u64 {
    600
}

fn default_usage_warning_percent() -> f64 {
    70.0
}

fn default_expiry_warning_days() -> i64 {
    3
}

fn default_wheel_cooldown_hours() -> i64 {
    24
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, anyhow::Error> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("Failed to read config {}: {}", path.display(), e)
        })?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, anyhow::Error> {
        let config: Config =
            toml::from_str(raw).map_err(|e| anyhow::anyhow!("Invalid config: {}", e))?;
        if config.admin_ids.is_empty() {
            tracing::warn!("admin_ids is empty, admin commands will be unavailable");
        }
        Ok(config)
    }

    /// `BOT_TOKEN` from the environment takes precedence over the file.
    pub fn bot_token(&self) -> Result<String, anyhow::Error> {
        if let Ok(token) = std::env::var("BOT_TOKEN")
            && !token.trim().is_empty()
        {
            return Ok(token.trim().to_string());
        }
        self.bot_token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("bot_token is not set (config or BOT_TOKEN)"))
    }

    pub fn is_admin(&self, tg_user_id: i64) -> bool {
        self.admin_ids.contains(&tg_user_id)
    }
}
