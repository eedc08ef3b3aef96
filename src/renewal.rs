//! Renewal calculator: combines what is left of a service with a new package.

use chrono::{DateTime, Duration, Utc};

/// How a renewal merges the remaining quota with the purchased package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenewalMethod {
    /// Data and time restart from the new package.
    FullReset,
    /// New data and days are stacked on top of the remainder.
    AddToRemaining,
    /// Remaining data is kept and extended, time restarts.
    ResetTimeKeepData,
    /// Data restarts, new days are added to the remaining ones.
    ResetDataAddTime,
    /// New data plus the old remainder, time restarts.
    NewPlusRemaining,
}

impl RenewalMethod {
    pub fn all() -> [RenewalMethod; 5] {
        [
            RenewalMethod::FullReset,
            RenewalMethod::AddToRemaining,
            RenewalMethod::ResetTimeKeepData,
            RenewalMethod::ResetDataAddTime,
            RenewalMethod::NewPlusRemaining,
        ]
    }

    pub fn value(self) -> i64 {
        match self {
            RenewalMethod::FullReset => 1,
            RenewalMethod::AddToRemaining => 2,
            RenewalMethod::ResetTimeKeepData => 3,
            RenewalMethod::ResetDataAddTime => 4,
            RenewalMethod::NewPlusRemaining => 5,
        }
    }

    /// Unknown codes fall back to a full reset.
    pub fn from_value(value: i64) -> Self {
        match value {
            2 => RenewalMethod::AddToRemaining,
            3 => RenewalMethod::ResetTimeKeepData,
            4 => RenewalMethod::ResetDataAddTime,
            5 => RenewalMethod::NewPlusRemaining,
            _ => RenewalMethod::FullReset,
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            RenewalMethod::FullReset => "🔄 ریست کامل (حجم و زمان از صفر)",
            RenewalMethod::AddToRemaining => "➕ اضافه به باقیمانده",
            RenewalMethod::ResetTimeKeepData => "⏰ ریست زمان + حفظ حجم باقیمانده",
            RenewalMethod::ResetDataAddTime => "📊 ریست حجم + اضافه زمان",
            RenewalMethod::NewPlusRemaining => "📦 حجم جدید + باقیمانده قبلی",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenewalOutcome {
    pub final_data_gb: f64,
    pub final_duration_days: i64,
    /// Previously consumed traffic is discarded rather than carried over.
    pub reset_used: bool,
    pub description: String,
}

/// Computes the final quota of a renewed service.
///
/// Negative remainders (an already expired or over-used service) count as zero.
pub fn calculate(
    method: RenewalMethod,
    current_data_remaining_gb: f64,
    current_time_remaining_days: i64,
    new_data_gb: f64,
    new_duration_days: i64,
) -> RenewalOutcome {
    let data_remaining = current_data_remaining_gb.max(0.0);
    let time_remaining = current_time_remaining_days.max(0);

    match method {
        RenewalMethod::FullReset => RenewalOutcome {
            final_data_gb: new_data_gb,
            final_duration_days: new_duration_days,
            reset_used: true,
            description: format!(
                "ریست کامل به {} گیگ و {} روز",
                new_data_gb, new_duration_days
            ),
        },
        RenewalMethod::AddToRemaining => {
            let data = data_remaining + new_data_gb;
            let days = time_remaining + new_duration_days;
            RenewalOutcome {
                final_data_gb: data,
                final_duration_days: days,
                reset_used: false,
                description: format!("اضافه به باقیمانده: {:.1} گیگ و {} روز", data, days),
            }
        }
        RenewalMethod::ResetTimeKeepData => {
            let data = data_remaining + new_data_gb;
            RenewalOutcome {
                final_data_gb: data,
                final_duration_days: new_duration_days,
                reset_used: false,
                description: format!(
                    "حجم {:.1} گیگ، زمان {} روز (ریست)",
                    data, new_duration_days
                ),
            }
        }
        RenewalMethod::ResetDataAddTime => {
            let days = time_remaining + new_duration_days;
            RenewalOutcome {
                final_data_gb: new_data_gb,
                final_duration_days: days,
                reset_used: true,
                description: format!("حجم {} گیگ (ریست)، زمان {} روز", new_data_gb, days),
            }
        }
        RenewalMethod::NewPlusRemaining => {
            let data = new_data_gb + data_remaining;
            RenewalOutcome {
                final_data_gb: data,
                final_duration_days: new_duration_days,
                reset_used: false,
                description: format!(
                    "حجم جدید + باقیمانده = {:.1} گیگ، {} روز",
                    data, new_duration_days
                ),
            }
        }
    }
}

pub fn expiry_from_duration(duration_days: i64, from: DateTime<Utc>) -> DateTime<Utc> {
    from + Duration::days(duration_days)
}

/// Whole days left until `expires_at`; never negative.
pub fn remaining_days(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> i64 {
    match expires_at {
        Some(expires_at) => (expires_at - now).num_days().max(0),
        None => 0,
    }
}

pub fn format_summary(method: RenewalMethod, outcome: &RenewalOutcome) -> String {
    format!(
        "📦 خلاصه تمدید:\n\
         • روش: {}\n\
         • حجم نهایی: {:.1} گیگابایت\n\
         • مدت نهایی: {} روز\n\
         • {}",
        method.display_name(),
        outcome.final_data_gb,
        outcome.final_duration_days,
        outcome.description
    )
}
