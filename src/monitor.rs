//! Background usage monitor: refreshes cached usage from the panels and
//! warns users once per threshold before a service runs out.

use crate::bot::keyboards;
use crate::config::MonitorConfig;
use crate::db::{Service, alert_bits};
use crate::naming::{format_data_amount, format_time_remaining};
use crate::panel::{ClientUsage, PanelGateway};
use crate::shop::{Shop, UsageAlert};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use teloxide::prelude::*;
use tokio::time::MissedTickBehavior;

const MIN_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    UsageWarning,
    DataExhausted,
    ExpiryWarning,
    Expired,
}

impl AlertKind {
    fn bit(self) -> i64 {
        match self {
            AlertKind::UsageWarning => alert_bits::USAGE_WARNING,
            AlertKind::DataExhausted => alert_bits::DATA_EXHAUSTED,
            AlertKind::ExpiryWarning => alert_bits::EXPIRY_WARNING,
            AlertKind::Expired => alert_bits::EXPIRED,
        }
    }

    /// Bits to record once delivered; a final alert also settles its warning.
    pub fn settled_bits(self) -> i64 {
        match self {
            AlertKind::DataExhausted => alert_bits::DATA_EXHAUSTED | alert_bits::USAGE_WARNING,
            AlertKind::Expired => alert_bits::EXPIRED | alert_bits::EXPIRY_WARNING,
            other => other.bit(),
        }
    }
}

/// Alerts `usage` calls for that are not already in `sent`.
pub fn due_alerts(
    usage: &ClientUsage,
    now: DateTime<Utc>,
    settings: &MonitorConfig,
    sent: i64,
) -> Vec<AlertKind> {
    let mut due = Vec::new();
    if usage.total_gb > 0.0 && usage.remaining_gb() <= 0.0 {
        due.push(AlertKind::DataExhausted);
    } else if usage
        .used_percent()
        .is_some_and(|percent| percent >= settings.usage_warning_percent)
    {
        due.push(AlertKind::UsageWarning);
    }

    if let Some(expires_at) = usage.expires_at {
        if expires_at <= now {
            due.push(AlertKind::Expired);
        } else if settings.expiry_warning_days > 0
            && expires_at - now <= Duration::days(settings.expiry_warning_days)
        {
            due.push(AlertKind::ExpiryWarning);
        }
    }

    due.retain(|alert| sent & alert.bit() == 0);
    due
}

pub fn alert_text(
    kind: AlertKind,
    service: &Service,
    usage: &ClientUsage,
    now: DateTime<Utc>,
) -> String {
    match kind {
        AlertKind::UsageWarning => format!(
            "⚠️ هشدار مصرف\n\n\
             از حجم سرویس {} حدود {:.0}٪ مصرف شده است.\n\
             باقیمانده: {}\n\n\
             برای جلوگیری از قطع سرویس، تمدید کنید.",
            service.client_name,
            usage.used_percent().unwrap_or(0.0),
            format_data_amount(usage.remaining_gb())
        ),
        AlertKind::DataExhausted => format!(
            "🔴 حجم سرویس {} به پایان رسید.\n\nبرای ادامه استفاده، سرویس را تمدید کنید.",
            service.client_name
        ),
        AlertKind::ExpiryWarning => {
            let left = usage
                .expires_at
                .map(|at| format_time_remaining((at - now).num_seconds()))
                .unwrap_or_default();
            format!(
                "⏰ یادآوری انقضا\n\n\
                 تا پایان اعتبار سرویس {} {} باقی مانده است.\n\n\
                 برای جلوگیری از قطع سرویس، تمدید کنید.",
                service.client_name, left
            )
        }
        AlertKind::Expired => format!(
            "🔴 مهلت سرویس {} به پایان رسید.\n\nبرای فعال‌سازی مجدد، سرویس را تمدید کنید.",
            service.client_name
        ),
    }
}

/// Runs a sync every `interval_secs`; the first one starts immediately.
pub fn spawn<G: PanelGateway + 'static>(bot: Bot, shop: Arc<Shop<G>>, interval_secs: u64) {
    let period = std::time::Duration::from_secs(interval_secs.max(MIN_INTERVAL_SECS));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            run_once(&bot, &shop).await;
        }
    });
    tracing::info!(interval_secs = period.as_secs(), "Usage monitor started");
}

async fn run_once<G: PanelGateway>(bot: &Bot, shop: &Shop<G>) {
    let alerts = match shop.sync_usage().await {
        Ok(alerts) => alerts,
        Err(error) => {
            tracing::warn!(error = %error, "Usage sync failed");
            return;
        }
    };
    if !alerts.is_empty() {
        tracing::info!(alerts = alerts.len(), "Sending usage alerts");
    }
    let now = Utc::now();
    for alert in alerts {
        send_alert(bot, &alert, now).await;
    }
}

async fn send_alert(bot: &Bot, alert: &UsageAlert, now: DateTime<Utc>) {
    let text = alert_text(alert.kind, &alert.service, &alert.usage, now);
    if let Err(error) = bot
        .send_message(ChatId(alert.tg_user_id), text)
        .reply_markup(keyboards::service_alert_keyboard(alert.service.id))
        .await
    {
        tracing::warn!(
            tg_user_id = alert.tg_user_id,
            service_id = alert.service.id,
            error = %error,
            "Failed to deliver usage alert"
        );
    }
}
