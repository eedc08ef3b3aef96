//! hooshnet-bot: Telegram shop bot selling and renewing 3x-ui VPN services.

mod bot;
mod config;
mod db;
mod monitor;
mod naming;
mod panel;
mod renewal;
mod shop;
mod wheel;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use teloxide::dispatching::Dispatcher;
use teloxide::prelude::*;
use tokio::sync::Mutex;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/etc/hooshnet-bot.toml"));
    tracing::info!("Starting hooshnet-bot with config {}", config_path.display());

    let config = Arc::new(config::Config::load(&config_path)?);
    let token = config.bot_token()?;
    tracing::info!(
        admin_count = config.admin_ids.len(),
        db_path = %config.db_path.display(),
        reports_chat_id = ?config.reports_chat_id,
        services_page_size = config.services_page_size,
        referral_enabled = config.referral.enabled,
        monitor_enabled = config.monitor.enabled,
        wheel_enabled = config.wheel.enabled,
        "Configuration loaded"
    );

    let db = Arc::new(db::Db::open(&config.db_path).await?);
    let gateway = panel::XuiGateway::new(config.panel.clone());
    let shop = Arc::new(shop::Shop::new(db, gateway, config.clone()));

    let bot = Bot::new(token);
    let bot_username = match bot.get_me().await {
        Ok(me) => me.user.username.clone(),
        Err(error) => {
            tracing::warn!(
                error = %error,
                "Failed to fetch bot username via getMe, referral links disabled"
            );
            None
        }
    };

    if config.monitor.enabled {
        monitor::spawn(bot.clone(), shop.clone(), config.monitor.interval_secs);
    }

    let state = bot::handlers::BotState {
        config,
        shop,
        bot_username,
        awaiting_input: Arc::new(Mutex::new(HashMap::new())),
    };
    tracing::info!("Dispatcher initialized, bot is ready");

    Dispatcher::builder(bot, bot::handlers::schema())
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    Ok(())
}
