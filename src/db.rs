//! SQLite layer: users and wallets, panels, products, services and renewal history,
//! plus gift and discount codes, support tickets and wheel spins.

use crate::naming::{generate_promo_code, generate_referral_code};
use crate::wheel::{PrizeKind, WheelPrize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool};
use sqlx::{FromRow, Sqlite, Transaction};
use std::path::Path;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
pub enum ServiceStatus {
    Active,
    Expired,
    Disabled,
    Deleted,
}

impl ServiceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceStatus::Active => "active",
            ServiceStatus::Expired => "expired",
            ServiceStatus::Disabled => "disabled",
            ServiceStatus::Deleted => "deleted",
        }
    }
}

/// Ledger entry categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    TopUp,
    Purchase,
    Renewal,
    WelcomeBonus,
    ReferralReward,
    Adjustment,
    Refund,
    GiftCode,
    WheelPrize,
    WheelSpin,
}

impl TransactionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionKind::TopUp => "topup",
            TransactionKind::Purchase => "purchase",
            TransactionKind::Renewal => "renewal",
            TransactionKind::WelcomeBonus => "welcome_bonus",
            TransactionKind::ReferralReward => "referral_reward",
            TransactionKind::Adjustment => "adjustment",
            TransactionKind::Refund => "refund",
            TransactionKind::GiftCode => "gift_code",
            TransactionKind::WheelPrize => "wheel_prize",
            TransactionKind::WheelSpin => "wheel_spin",
        }
    }

    /// Debits of these kinds count towards `users.total_spent`.
    pub fn is_spending(self) -> bool {
        matches!(self, TransactionKind::Purchase | TransactionKind::Renewal)
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: i64,
    pub tg_user_id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub balance: i64,
    pub referral_code: String,
    pub referred_by: Option<i64>,
    pub total_spent: i64,
    pub created_at: i64,
}

#[derive(Debug)]
pub struct RegisterOutcome {
    pub user: User,
    pub is_new: bool,
    /// Inviter, only resolved for freshly created users.
    pub referrer: Option<User>,
}

#[derive(Debug, Clone, FromRow)]
pub struct Panel {
    pub id: i64,
    pub name: String,
    pub api_url: String,
    pub username: String,
    pub password: String,
    pub inbound_id: i64,
    pub subscription_url: Option<String>,
    pub is_active: bool,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct NewPanel<'a> {
    pub name: &'a str,
    pub api_url: &'a str,
    pub username: &'a str,
    pub password: &'a str,
    pub inbound_id: i64,
    pub subscription_url: Option<&'a str>,
}

#[derive(Debug, Clone, FromRow)]
pub struct Product {
    pub id: i64,
    pub panel_id: i64,
    pub name: String,
    pub volume_gb: i64,
    pub duration_days: i64,
    pub price: i64,
    pub is_active: bool,
}

#[derive(Debug, Clone, FromRow)]
pub struct Service {
    pub id: i64,
    pub user_id: i64,
    pub panel_id: i64,
    pub product_id: Option<i64>,
    pub client_name: String,
    pub client_uuid: String,
    pub email: String,
    pub inbound_id: i64,
    pub sub_id: String,
    pub total_gb: f64,
    pub used_gb: f64,
    pub expires_at: Option<i64>,
    pub status: ServiceStatus,
    pub created_at: i64,
    /// Bitmask of `alert_bits` already delivered for the current term.
    pub alerts_sent: i64,
}

/// Monitor notifications recorded in `services.alerts_sent`.
pub mod alert_bits {
    pub const USAGE_WARNING: i64 = 1;
    pub const DATA_EXHAUSTED: i64 = 2;
    pub const EXPIRY_WARNING: i64 = 4;
    pub const EXPIRED: i64 = 8;
}

#[derive(Debug, Clone)]
pub struct NewService {
    pub user_id: i64,
    pub panel_id: i64,
    pub product_id: i64,
    pub client_name: String,
    pub client_uuid: String,
    pub email: String,
    pub inbound_id: i64,
    pub sub_id: String,
    pub total_gb: f64,
    pub expires_at: Option<i64>,
}

#[derive(Debug, Clone, FromRow)]
pub struct BalanceTransaction {
    pub id: i64,
    pub user_id: i64,
    pub amount: i64,
    pub kind: String,
    pub description: Option<String>,
    pub created_at: i64,
}

/// Everything written when a renewal is committed.
#[derive(Debug, Clone)]
pub struct RenewalRecord {
    pub service_id: i64,
    pub user_id: i64,
    pub product_id: i64,
    pub method: i64,
    pub previous_remaining_gb: f64,
    pub previous_remaining_days: i64,
    pub final_data_gb: f64,
    pub final_duration_days: i64,
    pub reset_used: bool,
    pub new_expires_at: Option<i64>,
    pub price: i64,
}

#[derive(Debug, Clone)]
pub struct AdminStats {
    pub users: i64,
    pub active_services: i64,
    pub total_balance: i64,
    pub renewals: i64,
    pub revenue: i64,
    pub open_tickets: i64,
}

/// Why a gift or discount code was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeRejection {
    NotFound,
    Inactive,
    Expired,
    Exhausted,
    AlreadyUsed,
    /// Personal code issued to someone else.
    NotOwner,
}

/// Shared validity rules; `max_uses = 0` means unlimited.
fn code_rejection(
    is_active: bool,
    expires_at: Option<i64>,
    max_uses: i64,
    used_count: i64,
    now: i64,
) -> Option<CodeRejection> {
    if !is_active {
        Some(CodeRejection::Inactive)
    } else if expires_at.is_some_and(|at| at <= now) {
        Some(CodeRejection::Expired)
    } else if max_uses > 0 && used_count >= max_uses {
        Some(CodeRejection::Exhausted)
    } else {
        None
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct GiftCode {
    pub id: i64,
    pub code: String,
    pub amount: i64,
    pub max_uses: i64,
    pub used_count: i64,
    pub expires_at: Option<i64>,
    pub is_active: bool,
    pub created_by: Option<i64>,
    pub created_at: i64,
}

impl GiftCode {
    pub fn rejection(&self, now: i64) -> Option<CodeRejection> {
        code_rejection(self.is_active, self.expires_at, self.max_uses, self.used_count, now)
    }
}

#[derive(Debug)]
pub enum GiftRedemption {
    Credited { amount: i64, balance: i64 },
    Rejected(CodeRejection),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
pub enum DiscountKind {
    Percent,
    Fixed,
}

#[derive(Debug, Clone, FromRow)]
pub struct DiscountCode {
    pub id: i64,
    pub code: String,
    pub kind: DiscountKind,
    pub value: i64,
    pub max_uses: i64,
    pub used_count: i64,
    pub owner_user_id: Option<i64>,
    pub expires_at: Option<i64>,
    pub is_active: bool,
    pub created_at: i64,
}

impl DiscountCode {
    pub fn rejection(&self, user_id: i64, now: i64) -> Option<CodeRejection> {
        if self.owner_user_id.is_some_and(|owner| owner != user_id) {
            return Some(CodeRejection::NotOwner);
        }
        code_rejection(self.is_active, self.expires_at, self.max_uses, self.used_count, now)
    }

    /// Amount taken off `price`, never more than the price itself.
    pub fn discount_for(&self, price: i64) -> i64 {
        let price = price.max(0);
        let raw = match self.kind {
            DiscountKind::Percent => price * self.value.clamp(0, 100) / 100,
            DiscountKind::Fixed => self.value.max(0),
        };
        raw.min(price)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AppliedDiscount {
    pub code_id: i64,
    pub discount_amount: i64,
}

#[derive(Debug)]
pub enum PurchaseWrite {
    Stored(Service),
    InsufficientFunds,
    DiscountRejected(CodeRejection),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
pub enum TicketStatus {
    Open,
    Answered,
    Closed,
}

#[derive(Debug, Clone, FromRow)]
pub struct Ticket {
    pub id: i64,
    pub user_id: i64,
    pub subject: String,
    pub status: TicketStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct TicketMessage {
    pub id: i64,
    pub ticket_id: i64,
    pub sender_tg_id: i64,
    pub is_admin: bool,
    pub body: String,
    pub created_at: i64,
}

#[derive(Debug)]
pub enum SpinWrite {
    Recorded {
        balance: i64,
        discount_code: Option<String>,
    },
    CoolingDown {
        last_spin_at: i64,
    },
    InsufficientFunds,
}

/// Lifetime of a discount code won on the wheel.
const WHEEL_DISCOUNT_TTL_SECS: i64 = 7 * 24 * 3600;

const USER_COLUMNS: &str =
    "id, tg_user_id, username, first_name, last_name, balance, referral_code, referred_by, total_spent, created_at";
const SERVICE_COLUMNS: &str = "id, user_id, panel_id, product_id, client_name, client_uuid, email, inbound_id, sub_id, total_gb, used_gb, expires_at, status, created_at, alerts_sent";
const PANEL_COLUMNS: &str =
    "id, name, api_url, username, password, inbound_id, subscription_url, is_active, created_at";
const PRODUCT_COLUMNS: &str = "id, panel_id, name, volume_gb, duration_days, price, is_active";
const GIFT_COLUMNS: &str =
    "id, code, amount, max_uses, used_count, expires_at, is_active, created_by, created_at";
const DISCOUNT_COLUMNS: &str = "id, code, kind, value, max_uses, used_count, owner_user_id, expires_at, is_active, created_at";
const TICKET_COLUMNS: &str = "id, user_id, subject, status, created_at, updated_at";

pub struct Db {
    pool: SqlitePool,
}

fn current_unix_timestamp() -> Result<i64, anyhow::Error> {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .map_err(|err| anyhow::anyhow!("System clock is before UNIX_EPOCH: {}", err))
}

impl Db {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| anyhow::anyhow!("Failed to create database directory: {}", e))?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePool::connect_with(opts)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to connect to SQLite: {}", e))?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<(), anyhow::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tg_user_id INTEGER NOT NULL UNIQUE,
                username TEXT,
                first_name TEXT,
                last_name TEXT,
                balance INTEGER NOT NULL DEFAULT 0,
                referral_code TEXT NOT NULL UNIQUE,
                referred_by INTEGER REFERENCES users(id) ON DELETE SET NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_users_username ON users(username);

            CREATE TABLE IF NOT EXISTS panels (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                api_url TEXT NOT NULL,
                username TEXT NOT NULL,
                password TEXT NOT NULL,
                inbound_id INTEGER NOT NULL,
                subscription_url TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS products (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                panel_id INTEGER NOT NULL REFERENCES panels(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                volume_gb INTEGER NOT NULL,
                duration_days INTEGER NOT NULL,
                price INTEGER NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_products_panel ON products(panel_id);

            CREATE TABLE IF NOT EXISTS services (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                panel_id INTEGER NOT NULL REFERENCES panels(id) ON DELETE CASCADE,
                product_id INTEGER REFERENCES products(id) ON DELETE SET NULL,
                client_name TEXT NOT NULL,
                client_uuid TEXT NOT NULL UNIQUE,
                email TEXT NOT NULL,
                inbound_id INTEGER NOT NULL,
                sub_id TEXT NOT NULL,
                total_gb REAL NOT NULL DEFAULT 0,
                used_gb REAL NOT NULL DEFAULT 0,
                expires_at INTEGER,
                status TEXT NOT NULL DEFAULT 'active',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_services_user ON services(user_id);
            CREATE INDEX IF NOT EXISTS idx_services_status ON services(status);

            CREATE TABLE IF NOT EXISTS balance_transactions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                amount INTEGER NOT NULL,
                kind TEXT NOT NULL,
                description TEXT,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_transactions_user ON balance_transactions(user_id);

            CREATE TABLE IF NOT EXISTS renewals (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                service_id INTEGER NOT NULL REFERENCES services(id) ON DELETE CASCADE,
                user_id INTEGER NOT NULL,
                product_id INTEGER NOT NULL,
                method INTEGER NOT NULL,
                previous_remaining_gb REAL NOT NULL,
                previous_remaining_days INTEGER NOT NULL,
                final_data_gb REAL NOT NULL,
                final_duration_days INTEGER NOT NULL,
                reset_used INTEGER NOT NULL,
                price INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS gift_codes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                code TEXT NOT NULL UNIQUE,
                amount INTEGER NOT NULL,
                max_uses INTEGER NOT NULL DEFAULT 1,
                used_count INTEGER NOT NULL DEFAULT 0,
                expires_at INTEGER,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_by INTEGER,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS gift_redemptions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                code_id INTEGER NOT NULL REFERENCES gift_codes(id) ON DELETE CASCADE,
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                amount INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                UNIQUE(code_id, user_id)
            );

            CREATE TABLE IF NOT EXISTS discount_codes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                code TEXT NOT NULL UNIQUE,
                kind TEXT NOT NULL,
                value INTEGER NOT NULL,
                max_uses INTEGER NOT NULL DEFAULT 0,
                used_count INTEGER NOT NULL DEFAULT 0,
                owner_user_id INTEGER REFERENCES users(id) ON DELETE CASCADE,
                expires_at INTEGER,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS discount_redemptions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                code_id INTEGER NOT NULL REFERENCES discount_codes(id) ON DELETE CASCADE,
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                service_id INTEGER NOT NULL REFERENCES services(id) ON DELETE CASCADE,
                discount_amount INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                UNIQUE(code_id, user_id)
            );

            CREATE TABLE IF NOT EXISTS tickets (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                subject TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'open',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tickets_status ON tickets(status);

            CREATE TABLE IF NOT EXISTS ticket_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ticket_id INTEGER NOT NULL REFERENCES tickets(id) ON DELETE CASCADE,
                sender_tg_id INTEGER NOT NULL,
                is_admin INTEGER NOT NULL,
                body TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS wheel_spins (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                prize_kind TEXT NOT NULL,
                prize_value INTEGER NOT NULL,
                label TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_wheel_spins_user ON wheel_spins(user_id, created_at);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow::anyhow!("Database migration: {}", e))?;

        self.ensure_column_exists("users", "total_spent", "INTEGER NOT NULL DEFAULT 0")
            .await?;
        self.ensure_column_exists("services", "alerts_sent", "INTEGER NOT NULL DEFAULT 0")
            .await?;

        Ok(())
    }

    async fn ensure_column_exists(
        &self,
        table: &str,
        column: &str,
        sql_type: &str,
    ) -> Result<(), anyhow::Error> {
        let count = sqlx::query_scalar::<_, i64>(&format!(
            "SELECT COUNT(*) FROM pragma_table_info('{}') WHERE name = '{}'",
            table, column
        ))
        .fetch_one(&self.pool)
        .await?;
        if count == 0 {
            sqlx::query(&format!(
                "ALTER TABLE {} ADD COLUMN {} {}",
                table, column, sql_type
            ))
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    // ---- users ----

    /// Creates the user on first contact, refreshes profile fields otherwise.
    pub async fn register_or_get(
        &self,
        tg_user_id: i64,
        username: Option<&str>,
        first_name: Option<&str>,
        last_name: Option<&str>,
        inviter_code: Option<&str>,
    ) -> Result<RegisterOutcome, anyhow::Error> {
        if let Some(user) = self.get_user_by_tg(tg_user_id).await? {
            sqlx::query(
                "UPDATE users SET username = ?, first_name = ?, last_name = ? WHERE id = ?",
            )
            .bind(username)
            .bind(first_name)
            .bind(last_name)
            .bind(user.id)
            .execute(&self.pool)
            .await?;
            let user = self
                .get_user_by_tg(tg_user_id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("user {} vanished during update", tg_user_id))?;
            return Ok(RegisterOutcome {
                user,
                is_new: false,
                referrer: None,
            });
        }

        let referrer = match inviter_code {
            Some(code) => self
                .find_user_by_referral_code(code)
                .await?
                .filter(|inviter| inviter.tg_user_id != tg_user_id),
            None => None,
        };

        let now = current_unix_timestamp()?;
        for _ in 0..8 {
            let code = generate_referral_code();
            let result = sqlx::query(
                "INSERT INTO users (tg_user_id, username, first_name, last_name, referral_code, referred_by, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(tg_user_id)
            .bind(username)
            .bind(first_name)
            .bind(last_name)
            .bind(&code)
            .bind(referrer.as_ref().map(|inviter| inviter.id))
            .bind(now)
            .execute(&self.pool)
            .await;

            match result {
                Ok(_) => {
                    let user = self
                        .get_user_by_tg(tg_user_id)
                        .await?
                        .ok_or_else(|| anyhow::anyhow!("user was just inserted"))?;
                    return Ok(RegisterOutcome {
                        user,
                        is_new: true,
                        referrer,
                    });
                }
                Err(err) => {
                    let message = err.to_string().to_lowercase();
                    if message.contains("users.referral_code") {
                        continue;
                    }
                    return Err(anyhow::anyhow!("Failed to create user: {}", err));
                }
            }
        }

        Err(anyhow::anyhow!("Failed to generate a unique referral code"))
    }

    pub async fn get_user_by_tg(&self, tg_user_id: i64) -> Result<Option<User>, anyhow::Error> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {} FROM users WHERE tg_user_id = ?",
            USER_COLUMNS
        ))
        .bind(tg_user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    pub async fn get_user(&self, user_id: i64) -> Result<Option<User>, anyhow::Error> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {} FROM users WHERE id = ?",
            USER_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    pub async fn find_user_by_referral_code(
        &self,
        code: &str,
    ) -> Result<Option<User>, anyhow::Error> {
        let code = code.trim();
        if code.is_empty() {
            return Ok(None);
        }
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {} FROM users WHERE referral_code = ?",
            USER_COLUMNS
        ))
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    pub async fn user_count(&self) -> Result<i64, anyhow::Error> {
        let total = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM users")
            .fetch_one(&self.pool)
            .await?;
        Ok(total)
    }

    pub async fn count_referrals(&self, user_id: i64) -> Result<i64, anyhow::Error> {
        let total = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM users WHERE referred_by = ?")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(total)
    }

    // ---- wallet ----

    async fn insert_transaction(
        tx: &mut Transaction<'_, Sqlite>,
        user_id: i64,
        amount: i64,
        kind: TransactionKind,
        description: Option<&str>,
        now: i64,
    ) -> Result<(), anyhow::Error> {
        sqlx::query(
            "INSERT INTO balance_transactions (user_id, amount, kind, description, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(amount)
        .bind(kind.as_str())
        .bind(description)
        .bind(now)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Debits inside `tx`; `false` when the balance does not cover `amount`.
    async fn debit(
        tx: &mut Transaction<'_, Sqlite>,
        user_id: i64,
        amount: i64,
        kind: TransactionKind,
    ) -> Result<bool, anyhow::Error> {
        let spent = if kind.is_spending() { amount } else { 0 };
        let result = sqlx::query(
            "UPDATE users SET balance = balance - ?, total_spent = total_spent + ? WHERE id = ? AND balance >= ?",
        )
        .bind(amount)
        .bind(spent)
        .bind(user_id)
        .bind(amount)
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Credits the wallet and returns the new balance.
    pub async fn add_balance(
        &self,
        user_id: i64,
        amount: i64,
        kind: TransactionKind,
        description: Option<&str>,
    ) -> Result<i64, anyhow::Error> {
        if amount <= 0 {
            return Err(anyhow::anyhow!("Credit amount must be positive, got {}", amount));
        }
        let now = current_unix_timestamp()?;
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query("UPDATE users SET balance = balance + ? WHERE id = ?")
            .bind(amount)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        if updated.rows_affected() == 0 {
            return Err(anyhow::anyhow!("User #{} not found", user_id));
        }
        Self::insert_transaction(&mut tx, user_id, amount, kind, description, now).await?;
        let balance = sqlx::query_scalar::<_, i64>("SELECT balance FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(balance)
    }

    /// Debits the wallet; `None` when funds are insufficient.
    pub async fn deduct_balance(
        &self,
        user_id: i64,
        amount: i64,
        kind: TransactionKind,
        description: Option<&str>,
    ) -> Result<Option<i64>, anyhow::Error> {
        let now = current_unix_timestamp()?;
        let mut tx = self.pool.begin().await?;
        if !Self::debit(&mut tx, user_id, amount, kind).await? {
            return Ok(None);
        }
        Self::insert_transaction(&mut tx, user_id, -amount, kind, description, now).await?;
        let balance = sqlx::query_scalar::<_, i64>("SELECT balance FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(Some(balance))
    }

    pub async fn list_transactions(
        &self,
        user_id: i64,
        limit: i64,
    ) -> Result<Vec<BalanceTransaction>, anyhow::Error> {
        let rows = sqlx::query_as::<_, BalanceTransaction>(
            "SELECT id, user_id, amount, kind, description, created_at
             FROM balance_transactions
             WHERE user_id = ?
             ORDER BY id DESC
             LIMIT ?",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // ---- panels & products ----

    pub async fn add_panel(&self, panel: &NewPanel<'_>) -> Result<Panel, anyhow::Error> {
        let now = current_unix_timestamp()?;
        let id = sqlx::query(
            "INSERT INTO panels (name, api_url, username, password, inbound_id, subscription_url, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(panel.name)
        .bind(panel.api_url.trim_end_matches('/'))
        .bind(panel.username)
        .bind(panel.password)
        .bind(panel.inbound_id)
        .bind(panel.subscription_url.map(|url| url.trim_end_matches('/')))
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to add panel {}: {}", panel.name, e))?
        .last_insert_rowid();

        self.get_panel(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("panel was just inserted"))
    }

    pub async fn get_panel(&self, panel_id: i64) -> Result<Option<Panel>, anyhow::Error> {
        let panel = sqlx::query_as::<_, Panel>(&format!(
            "SELECT {} FROM panels WHERE id = ?",
            PANEL_COLUMNS
        ))
        .bind(panel_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(panel)
    }

    pub async fn list_panels(&self, active_only: bool) -> Result<Vec<Panel>, anyhow::Error> {
        let sql = if active_only {
            format!("SELECT {} FROM panels WHERE is_active = 1 ORDER BY id", PANEL_COLUMNS)
        } else {
            format!("SELECT {} FROM panels ORDER BY id", PANEL_COLUMNS)
        };
        let rows = sqlx::query_as::<_, Panel>(&sql).fetch_all(&self.pool).await?;
        Ok(rows)
    }

    pub async fn add_product(
        &self,
        panel_id: i64,
        name: &str,
        volume_gb: i64,
        duration_days: i64,
        price: i64,
    ) -> Result<Product, anyhow::Error> {
        let now = current_unix_timestamp()?;
        let id = sqlx::query(
            "INSERT INTO products (panel_id, name, volume_gb, duration_days, price, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(panel_id)
        .bind(name)
        .bind(volume_gb)
        .bind(duration_days)
        .bind(price)
        .bind(now)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        self.get_product(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("product was just inserted"))
    }

    pub async fn get_product(&self, product_id: i64) -> Result<Option<Product>, anyhow::Error> {
        let product = sqlx::query_as::<_, Product>(&format!(
            "SELECT {} FROM products WHERE id = ?",
            PRODUCT_COLUMNS
        ))
        .bind(product_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(product)
    }

    pub async fn list_products(&self, panel_id: i64) -> Result<Vec<Product>, anyhow::Error> {
        let rows = sqlx::query_as::<_, Product>(&format!(
            "SELECT {} FROM products WHERE panel_id = ? AND is_active = 1 ORDER BY price ASC",
            PRODUCT_COLUMNS
        ))
        .bind(panel_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // ---- services ----

    /// Charges `price` and stores the service in one transaction, claiming
    /// `discount` on the way. Nothing is written unless `Stored` comes back.
    pub async fn insert_purchased_service(
        &self,
        service: &NewService,
        price: i64,
        description: &str,
        discount: Option<AppliedDiscount>,
    ) -> Result<PurchaseWrite, anyhow::Error> {
        let now = current_unix_timestamp()?;
        let mut tx = self.pool.begin().await?;
        if !Self::debit(&mut tx, service.user_id, price, TransactionKind::Purchase).await?
        {
            return Ok(PurchaseWrite::InsufficientFunds);
        }
        Self::insert_transaction(
            &mut tx,
            service.user_id,
            -price,
            TransactionKind::Purchase,
            Some(description),
            now,
        )
        .await?;

        let id = sqlx::query(
            "INSERT INTO services
             (user_id, panel_id, product_id, client_name, client_uuid, email, inbound_id, sub_id, total_gb, used_gb, expires_at, status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?, ?)",
        )
        .bind(service.user_id)
        .bind(service.panel_id)
        .bind(service.product_id)
        .bind(&service.client_name)
        .bind(&service.client_uuid)
        .bind(&service.email)
        .bind(service.inbound_id)
        .bind(&service.sub_id)
        .bind(service.total_gb)
        .bind(service.expires_at)
        .bind(ServiceStatus::Active)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        if let Some(discount) = discount {
            let claimed = sqlx::query(
                "UPDATE discount_codes SET used_count = used_count + 1
                 WHERE id = ? AND is_active = 1
                   AND (max_uses = 0 OR used_count < max_uses)
                   AND (expires_at IS NULL OR expires_at > ?)",
            )
            .bind(discount.code_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            if claimed.rows_affected() == 0 {
                return Ok(PurchaseWrite::DiscountRejected(CodeRejection::Exhausted));
            }
            let recorded = sqlx::query(
                "INSERT OR IGNORE INTO discount_redemptions (code_id, user_id, service_id, discount_amount, created_at)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(discount.code_id)
            .bind(service.user_id)
            .bind(id)
            .bind(discount.discount_amount)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            if recorded.rows_affected() == 0 {
                return Ok(PurchaseWrite::DiscountRejected(CodeRejection::AlreadyUsed));
            }
        }

        tx.commit().await?;
        let stored = self
            .get_service(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("service was just inserted"))?;
        Ok(PurchaseWrite::Stored(stored))
    }

    pub async fn get_service(&self, service_id: i64) -> Result<Option<Service>, anyhow::Error> {
        let service = sqlx::query_as::<_, Service>(&format!(
            "SELECT {} FROM services WHERE id = ?",
            SERVICE_COLUMNS
        ))
        .bind(service_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(service)
    }

    /// Only returns the service when it belongs to `user_id` and is not deleted.
    pub async fn get_service_for_user(
        &self,
        service_id: i64,
        user_id: i64,
    ) -> Result<Option<Service>, anyhow::Error> {
        let service = sqlx::query_as::<_, Service>(&format!(
            "SELECT {} FROM services WHERE id = ? AND user_id = ? AND status != ?",
            SERVICE_COLUMNS
        ))
        .bind(service_id)
        .bind(user_id)
        .bind(ServiceStatus::Deleted)
        .fetch_optional(&self.pool)
        .await?;
        Ok(service)
    }

    pub async fn count_user_services(&self, user_id: i64) -> Result<i64, anyhow::Error> {
        let total = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM services WHERE user_id = ? AND status != ?",
        )
        .bind(user_id)
        .bind(ServiceStatus::Deleted)
        .fetch_one(&self.pool)
        .await?;
        Ok(total)
    }

    pub async fn list_user_services_page(
        &self,
        user_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Service>, anyhow::Error> {
        let rows = sqlx::query_as::<_, Service>(&format!(
            "SELECT {}
             FROM services
             WHERE user_id = ? AND status != ?
             ORDER BY created_at DESC, id DESC
             LIMIT ? OFFSET ?",
            SERVICE_COLUMNS
        ))
        .bind(user_id)
        .bind(ServiceStatus::Deleted)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Caches the latest usage reported by the panel.
    pub async fn update_service_usage(
        &self,
        service_id: i64,
        used_gb: f64,
        status: ServiceStatus,
    ) -> Result<(), anyhow::Error> {
        let now = current_unix_timestamp()?;
        sqlx::query("UPDATE services SET used_gb = ?, status = ?, updated_at = ? WHERE id = ? AND status != ?")
            .bind(used_gb)
            .bind(status)
            .bind(now)
            .bind(service_id)
            .bind(ServiceStatus::Deleted)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Services the usage monitor looks after.
    pub async fn list_monitored_services(&self) -> Result<Vec<Service>, anyhow::Error> {
        let rows = sqlx::query_as::<_, Service>(&format!(
            "SELECT {} FROM services WHERE status != ? ORDER BY panel_id, id",
            SERVICE_COLUMNS
        ))
        .bind(ServiceStatus::Deleted)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn mark_alerts_sent(&self, service_id: i64, bits: i64) -> Result<(), anyhow::Error> {
        sqlx::query("UPDATE services SET alerts_sent = alerts_sent | ? WHERE id = ?")
            .bind(bits)
            .bind(service_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Charges the renewal and rewrites the service quota atomically.
    /// Returns the renewal id, or `None` without writing anything when funds
    /// are insufficient.
    pub async fn apply_renewal(&self, record: &RenewalRecord) -> Result<Option<i64>, anyhow::Error> {
        let now = current_unix_timestamp()?;
        let mut tx = self.pool.begin().await?;
        if !Self::debit(&mut tx, record.user_id, record.price, TransactionKind::Renewal).await?
        {
            return Ok(None);
        }
        let description = format!("renewal of service #{}", record.service_id);
        Self::insert_transaction(
            &mut tx,
            record.user_id,
            -record.price,
            TransactionKind::Renewal,
            Some(&description),
            now,
        )
        .await?;

        sqlx::query(
            "UPDATE services
             SET total_gb = ?, used_gb = 0, expires_at = ?, product_id = ?, status = ?, alerts_sent = 0, updated_at = ?
             WHERE id = ?",
        )
        .bind(record.final_data_gb)
        .bind(record.new_expires_at)
        .bind(record.product_id)
        .bind(ServiceStatus::Active)
        .bind(now)
        .bind(record.service_id)
        .execute(&mut *tx)
        .await?;

        let renewal_id = sqlx::query(
            "INSERT INTO renewals
             (service_id, user_id, product_id, method, previous_remaining_gb, previous_remaining_days, final_data_gb, final_duration_days, reset_used, price, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.service_id)
        .bind(record.user_id)
        .bind(record.product_id)
        .bind(record.method)
        .bind(record.previous_remaining_gb)
        .bind(record.previous_remaining_days)
        .bind(record.final_data_gb)
        .bind(record.final_duration_days)
        .bind(record.reset_used)
        .bind(record.price)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        tx.commit().await?;
        Ok(Some(renewal_id))
    }

    /// Undoes a committed renewal: refunds the charge and restores `previous`.
    /// `false` when the renewal was already reverted.
    pub async fn revert_renewal(
        &self,
        renewal_id: i64,
        previous: &Service,
        refund: i64,
    ) -> Result<bool, anyhow::Error> {
        let now = current_unix_timestamp()?;
        let mut tx = self.pool.begin().await?;
        let removed = sqlx::query("DELETE FROM renewals WHERE id = ? AND service_id = ?")
            .bind(renewal_id)
            .bind(previous.id)
            .execute(&mut *tx)
            .await?;
        if removed.rows_affected() == 0 {
            return Ok(false);
        }

        sqlx::query(
            "UPDATE users SET balance = balance + ?, total_spent = MAX(total_spent - ?, 0) WHERE id = ?",
        )
        .bind(refund)
        .bind(refund)
        .bind(previous.user_id)
        .execute(&mut *tx)
        .await?;
        let description = format!("refund of renewal of service #{}", previous.id);
        Self::insert_transaction(
            &mut tx,
            previous.user_id,
            refund,
            TransactionKind::Refund,
            Some(&description),
            now,
        )
        .await?;

        sqlx::query(
            "UPDATE services
             SET total_gb = ?, used_gb = ?, expires_at = ?, product_id = ?, status = ?, alerts_sent = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(previous.total_gb)
        .bind(previous.used_gb)
        .bind(previous.expires_at)
        .bind(previous.product_id)
        .bind(previous.status)
        .bind(previous.alerts_sent)
        .bind(now)
        .bind(previous.id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    pub async fn count_renewals(&self, service_id: i64) -> Result<i64, anyhow::Error> {
        let total = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM renewals WHERE service_id = ?")
            .bind(service_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(total)
    }

    pub async fn mark_service_deleted(&self, service_id: i64) -> Result<bool, anyhow::Error> {
        let now = current_unix_timestamp()?;
        let result = sqlx::query(
            "UPDATE services SET status = ?, updated_at = ? WHERE id = ? AND status != ?",
        )
        .bind(ServiceStatus::Deleted)
        .bind(now)
        .bind(service_id)
        .bind(ServiceStatus::Deleted)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // ---- settings ----

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>, anyhow::Error> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<(), anyhow::Error> {
        let now = current_unix_timestamp()?;
        sqlx::query(
            "INSERT INTO settings (key, value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Increments and returns a persistent counter stored in settings.
    /// A single upsert, so concurrent callers never upgrade a read lock.
    pub async fn next_sequence(&self, key: &str) -> Result<i64, anyhow::Error> {
        let now = current_unix_timestamp()?;
        let next = sqlx::query_scalar::<_, i64>(
            "INSERT INTO settings (key, value, updated_at) VALUES (?, '1', ?)
             ON CONFLICT(key) DO UPDATE SET value = CAST(value AS INTEGER) + 1, updated_at = excluded.updated_at
             RETURNING CAST(value AS INTEGER)",
        )
        .bind(key)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to advance counter {}: {}", key, e))?;
        Ok(next)
    }

    // ---- gift codes ----

    /// `None` when the code is already taken.
    pub async fn create_gift_code(
        &self,
        code: &str,
        amount: i64,
        max_uses: i64,
        expires_at: Option<i64>,
        created_by: Option<i64>,
    ) -> Result<Option<GiftCode>, anyhow::Error> {
        let now = current_unix_timestamp()?;
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO gift_codes (code, amount, max_uses, expires_at, created_by, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(code)
        .bind(amount)
        .bind(max_uses)
        .bind(expires_at)
        .bind(created_by)
        .bind(now)
        .execute(&self.pool)
        .await?;
        if inserted.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_gift_code(code).await
    }

    pub async fn get_gift_code(&self, code: &str) -> Result<Option<GiftCode>, anyhow::Error> {
        let gift = sqlx::query_as::<_, GiftCode>(&format!(
            "SELECT {} FROM gift_codes WHERE code = ?",
            GIFT_COLUMNS
        ))
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        Ok(gift)
    }

    pub async fn list_gift_codes(&self, limit: i64) -> Result<Vec<GiftCode>, anyhow::Error> {
        let rows = sqlx::query_as::<_, GiftCode>(&format!(
            "SELECT {} FROM gift_codes ORDER BY id DESC LIMIT ?",
            GIFT_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Claims one use of the code and credits the wallet atomically.
    pub async fn redeem_gift_code(
        &self,
        user_id: i64,
        code: &str,
    ) -> Result<GiftRedemption, anyhow::Error> {
        let now = current_unix_timestamp()?;
        let mut tx = self.pool.begin().await?;
        let claimed = sqlx::query_as::<_, (i64, i64)>(
            "UPDATE gift_codes SET used_count = used_count + 1
             WHERE code = ? AND is_active = 1
               AND (max_uses = 0 OR used_count < max_uses)
               AND (expires_at IS NULL OR expires_at > ?)
             RETURNING id, amount",
        )
        .bind(code)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;
        let Some((code_id, amount)) = claimed else {
            drop(tx);
            let rejection = match self.get_gift_code(code).await? {
                Some(gift) => gift.rejection(now).unwrap_or(CodeRejection::Exhausted),
                None => CodeRejection::NotFound,
            };
            return Ok(GiftRedemption::Rejected(rejection));
        };

        let recorded = sqlx::query(
            "INSERT OR IGNORE INTO gift_redemptions (code_id, user_id, amount, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(code_id)
        .bind(user_id)
        .bind(amount)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        if recorded.rows_affected() == 0 {
            return Ok(GiftRedemption::Rejected(CodeRejection::AlreadyUsed));
        }

        sqlx::query("UPDATE users SET balance = balance + ? WHERE id = ?")
            .bind(amount)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        let description = format!("gift code {}", code);
        Self::insert_transaction(
            &mut tx,
            user_id,
            amount,
            TransactionKind::GiftCode,
            Some(&description),
            now,
        )
        .await?;
        let balance = sqlx::query_scalar::<_, i64>("SELECT balance FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(GiftRedemption::Credited { amount, balance })
    }

    // ---- discount codes ----

    /// `None` when the code is already taken.
    pub async fn create_discount_code(
        &self,
        code: &str,
        kind: DiscountKind,
        value: i64,
        max_uses: i64,
        expires_at: Option<i64>,
    ) -> Result<Option<DiscountCode>, anyhow::Error> {
        let now = current_unix_timestamp()?;
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO discount_codes (code, kind, value, max_uses, expires_at, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(code)
        .bind(kind)
        .bind(value)
        .bind(max_uses)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?;
        if inserted.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_discount_code(code).await
    }

    pub async fn get_discount_code(
        &self,
        code: &str,
    ) -> Result<Option<DiscountCode>, anyhow::Error> {
        let discount = sqlx::query_as::<_, DiscountCode>(&format!(
            "SELECT {} FROM discount_codes WHERE code = ?",
            DISCOUNT_COLUMNS
        ))
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        Ok(discount)
    }

    /// Public codes only; personal wheel codes are left out.
    pub async fn list_discount_codes(&self, limit: i64) -> Result<Vec<DiscountCode>, anyhow::Error> {
        let rows = sqlx::query_as::<_, DiscountCode>(&format!(
            "SELECT {} FROM discount_codes WHERE owner_user_id IS NULL ORDER BY id DESC LIMIT ?",
            DISCOUNT_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn discount_used_by(&self, code_id: i64, user_id: i64) -> Result<bool, anyhow::Error> {
        let used = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM discount_redemptions WHERE code_id = ? AND user_id = ?",
        )
        .bind(code_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(used > 0)
    }

    // ---- tickets ----

    pub async fn open_ticket(
        &self,
        user_id: i64,
        sender_tg_id: i64,
        subject: &str,
        body: &str,
    ) -> Result<Ticket, anyhow::Error> {
        let now = current_unix_timestamp()?;
        let mut tx = self.pool.begin().await?;
        let ticket = sqlx::query_as::<_, Ticket>(&format!(
            "INSERT INTO tickets (user_id, subject, status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?)
             RETURNING {}",
            TICKET_COLUMNS
        ))
        .bind(user_id)
        .bind(subject)
        .bind(TicketStatus::Open)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;
        Self::insert_ticket_message(&mut tx, ticket.id, sender_tg_id, false, body, now).await?;
        tx.commit().await?;
        Ok(ticket)
    }

    async fn insert_ticket_message(
        tx: &mut Transaction<'_, Sqlite>,
        ticket_id: i64,
        sender_tg_id: i64,
        is_admin: bool,
        body: &str,
        now: i64,
    ) -> Result<(), anyhow::Error> {
        sqlx::query(
            "INSERT INTO ticket_messages (ticket_id, sender_tg_id, is_admin, body, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(ticket_id)
        .bind(sender_tg_id)
        .bind(is_admin)
        .bind(body)
        .bind(now)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Appends to a ticket that is not closed. An admin reply marks it
    /// answered, a user message reopens it. `None` for closed or unknown tickets.
    pub async fn add_ticket_message(
        &self,
        ticket_id: i64,
        sender_tg_id: i64,
        is_admin: bool,
        body: &str,
    ) -> Result<Option<Ticket>, anyhow::Error> {
        let now = current_unix_timestamp()?;
        let status = if is_admin {
            TicketStatus::Answered
        } else {
            TicketStatus::Open
        };
        let mut tx = self.pool.begin().await?;
        let ticket = sqlx::query_as::<_, Ticket>(&format!(
            "UPDATE tickets SET status = ?, updated_at = ? WHERE id = ? AND status != ? RETURNING {}",
            TICKET_COLUMNS
        ))
        .bind(status)
        .bind(now)
        .bind(ticket_id)
        .bind(TicketStatus::Closed)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(ticket) = ticket else {
            return Ok(None);
        };
        Self::insert_ticket_message(&mut tx, ticket.id, sender_tg_id, is_admin, body, now).await?;
        tx.commit().await?;
        Ok(Some(ticket))
    }

    /// `None` when the ticket is unknown or already closed.
    pub async fn close_ticket(&self, ticket_id: i64) -> Result<Option<Ticket>, anyhow::Error> {
        let now = current_unix_timestamp()?;
        let ticket = sqlx::query_as::<_, Ticket>(&format!(
            "UPDATE tickets SET status = ?, updated_at = ? WHERE id = ? AND status != ? RETURNING {}",
            TICKET_COLUMNS
        ))
        .bind(TicketStatus::Closed)
        .bind(now)
        .bind(ticket_id)
        .bind(TicketStatus::Closed)
        .fetch_optional(&self.pool)
        .await?;
        Ok(ticket)
    }

    pub async fn get_ticket(&self, ticket_id: i64) -> Result<Option<Ticket>, anyhow::Error> {
        let ticket = sqlx::query_as::<_, Ticket>(&format!(
            "SELECT {} FROM tickets WHERE id = ?",
            TICKET_COLUMNS
        ))
        .bind(ticket_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(ticket)
    }

    /// Tickets that are not closed, most recently active first.
    pub async fn list_pending_tickets(&self, limit: i64) -> Result<Vec<Ticket>, anyhow::Error> {
        let rows = sqlx::query_as::<_, Ticket>(&format!(
            "SELECT {} FROM tickets WHERE status != ? ORDER BY updated_at DESC, id DESC LIMIT ?",
            TICKET_COLUMNS
        ))
        .bind(TicketStatus::Closed)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn list_ticket_messages(
        &self,
        ticket_id: i64,
    ) -> Result<Vec<TicketMessage>, anyhow::Error> {
        let rows = sqlx::query_as::<_, TicketMessage>(
            "SELECT id, ticket_id, sender_tg_id, is_admin, body, created_at
             FROM ticket_messages WHERE ticket_id = ? ORDER BY id",
        )
        .bind(ticket_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // ---- wheel ----

    /// Records a spin unless the user spun within `cooldown_secs`, then
    /// charges `cost` and pays out `prize`, all in one transaction.
    pub async fn record_spin(
        &self,
        user_id: i64,
        prize: &WheelPrize,
        cost: i64,
        cooldown_secs: i64,
    ) -> Result<SpinWrite, anyhow::Error> {
        let now = current_unix_timestamp()?;
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            "INSERT INTO wheel_spins (user_id, prize_kind, prize_value, label, created_at)
             SELECT ?, ?, ?, ?, ?
             WHERE NOT EXISTS (SELECT 1 FROM wheel_spins WHERE user_id = ? AND created_at > ?)",
        )
        .bind(user_id)
        .bind(prize.kind.as_str())
        .bind(prize.value)
        .bind(&prize.label)
        .bind(now)
        .bind(user_id)
        .bind(now - cooldown_secs)
        .execute(&mut *tx)
        .await?;
        if inserted.rows_affected() == 0 {
            let last_spin_at = sqlx::query_scalar::<_, Option<i64>>(
                "SELECT MAX(created_at) FROM wheel_spins WHERE user_id = ?",
            )
            .bind(user_id)
            .fetch_one(&mut *tx)
            .await?
            .unwrap_or(now);
            return Ok(SpinWrite::CoolingDown { last_spin_at });
        }

        if cost > 0 {
            if !Self::debit(&mut tx, user_id, cost, TransactionKind::WheelSpin).await? {
                return Ok(SpinWrite::InsufficientFunds);
            }
            Self::insert_transaction(
                &mut tx,
                user_id,
                -cost,
                TransactionKind::WheelSpin,
                Some("wheel spin"),
                now,
            )
            .await?;
        }

        let mut discount_code = None;
        match prize.kind {
            PrizeKind::Balance if prize.value > 0 => {
                sqlx::query("UPDATE users SET balance = balance + ? WHERE id = ?")
                    .bind(prize.value)
                    .bind(user_id)
                    .execute(&mut *tx)
                    .await?;
                Self::insert_transaction(
                    &mut tx,
                    user_id,
                    prize.value,
                    TransactionKind::WheelPrize,
                    Some(&prize.label),
                    now,
                )
                .await?;
            }
            PrizeKind::Discount if prize.value > 0 => {
                let code = generate_promo_code();
                sqlx::query(
                    "INSERT INTO discount_codes (code, kind, value, max_uses, owner_user_id, expires_at, created_at)
                     VALUES (?, ?, ?, 1, ?, ?, ?)",
                )
                .bind(&code)
                .bind(DiscountKind::Percent)
                .bind(prize.value)
                .bind(user_id)
                .bind(now + WHEEL_DISCOUNT_TTL_SECS)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                discount_code = Some(code);
            }
            _ => {}
        }

        let balance = sqlx::query_scalar::<_, i64>("SELECT balance FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(SpinWrite::Recorded {
            balance,
            discount_code,
        })
    }

    // ---- stats ----

    pub async fn admin_stats(&self) -> Result<AdminStats, anyhow::Error> {
        let users = self.user_count().await?;
        let active_services =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM services WHERE status = ?")
                .bind(ServiceStatus::Active)
                .fetch_one(&self.pool)
                .await?;
        let total_balance =
            sqlx::query_scalar::<_, i64>("SELECT COALESCE(SUM(balance), 0) FROM users")
                .fetch_one(&self.pool)
                .await?;
        let renewals = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM renewals")
            .fetch_one(&self.pool)
            .await?;
        let revenue = sqlx::query_scalar::<_, i64>(
            "SELECT COALESCE(-SUM(amount), 0) FROM balance_transactions WHERE kind IN (?, ?, ?)",
        )
        .bind(TransactionKind::Purchase.as_str())
        .bind(TransactionKind::Renewal.as_str())
        .bind(TransactionKind::Refund.as_str())
        .fetch_one(&self.pool)
        .await?;
        let open_tickets =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM tickets WHERE status = ?")
                .bind(TicketStatus::Open)
                .fetch_one(&self.pool)
                .await?;

        Ok(AdminStats {
            users,
            active_services,
            total_balance,
            renewals,
            revenue,
            open_tickets,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_temp() -> (TempDir, Db) {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(dir.path().join("bot.db")).await.unwrap();
        (dir, db)
    }

    async fn seed_panel_and_product(db: &Db) -> (Panel, Product) {
        let panel = db
            .add_panel(&NewPanel {
                name: "de-1",
                api_url: "https://panel.example.com:2053/",
                username: "admin",
                password: "secret",
                inbound_id: 3,
                subscription_url: Some("https://sub.example.com/sub/"),
            })
            .await
            .unwrap();
        let product = db.add_product(panel.id, "30GB", 30, 30, 150_000).await.unwrap();
        (panel, product)
    }

    fn new_service(user_id: i64, panel: &Panel, product: &Product) -> NewService {
        NewService {
            user_id,
            panel_id: panel.id,
            product_id: product.id,
            client_name: "ABCD1234".to_string(),
            client_uuid: "0b1c2d3e-0000-4000-8000-000000000001".to_string(),
            email: "ABCD1234".to_string(),
            inbound_id: panel.inbound_id,
            sub_id: "00112233aabbccdd".to_string(),
            total_gb: product.volume_gb as f64,
            expires_at: Some(1_900_000_000),
        }
    }

    fn stored(write: PurchaseWrite) -> Service {
        match write {
            PurchaseWrite::Stored(service) => service,
            other => panic!("purchase not stored: {:?}", other),
        }
    }

    async fn funded_user(db: &Db, tg_user_id: i64, amount: i64) -> User {
        let user = db
            .register_or_get(tg_user_id, None, None, None, None)
            .await
            .unwrap()
            .user;
        if amount > 0 {
            db.add_balance(user.id, amount, TransactionKind::TopUp, None)
                .await
                .unwrap();
        }
        user
    }

    #[tokio::test]
    async fn register_is_idempotent_and_tracks_referrer() {
        let (_dir, db) = open_temp().await;
        let inviter = db
            .register_or_get(100, Some("inviter"), Some("Ali"), None, None)
            .await
            .unwrap();
        assert!(inviter.is_new);
        assert!(inviter.referrer.is_none());
        assert_eq!(inviter.user.referral_code.len(), 8);

        let again = db
            .register_or_get(100, Some("renamed"), Some("Ali"), None, None)
            .await
            .unwrap();
        assert!(!again.is_new);
        assert_eq!(again.user.id, inviter.user.id);
        assert_eq!(again.user.username.as_deref(), Some("renamed"));

        let invited = db
            .register_or_get(200, None, Some("Sara"), None, Some(&inviter.user.referral_code))
            .await
            .unwrap();
        assert!(invited.is_new);
        assert_eq!(invited.referrer.map(|u| u.id), Some(inviter.user.id));
        assert_eq!(invited.user.referred_by, Some(inviter.user.id));
        assert_eq!(db.count_referrals(inviter.user.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn self_referral_is_ignored() {
        let (_dir, db) = open_temp().await;
        let user = db.register_or_get(1, None, None, None, Some("nope")).await.unwrap();
        assert!(user.referrer.is_none());
        assert!(db.find_user_by_referral_code("").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn wallet_never_goes_negative() {
        let (_dir, db) = open_temp().await;
        let user = db.register_or_get(1, None, None, None, None).await.unwrap().user;

        let balance = db
            .add_balance(user.id, 50_000, TransactionKind::TopUp, Some("manual"))
            .await
            .unwrap();
        assert_eq!(balance, 50_000);

        let after = db
            .deduct_balance(user.id, 20_000, TransactionKind::Purchase, None)
            .await
            .unwrap();
        assert_eq!(after, Some(30_000));

        let refused = db
            .deduct_balance(user.id, 40_000, TransactionKind::Purchase, None)
            .await
            .unwrap();
        assert_eq!(refused, None);

        let corrected = db
            .deduct_balance(user.id, 5_000, TransactionKind::Adjustment, Some("admin 1"))
            .await
            .unwrap();
        assert_eq!(corrected, Some(25_000));

        let user = db.get_user(user.id).await.unwrap().unwrap();
        assert_eq!(user.balance, 25_000);
        assert_eq!(user.total_spent, 20_000);

        let ledger = db.list_transactions(user.id, 10).await.unwrap();
        assert_eq!(ledger.len(), 3);
        assert_eq!(ledger[0].kind, "adjustment");
        assert_eq!(ledger[1].amount, -20_000);
        assert_eq!(ledger[2].kind, "topup");

        assert!(db.add_balance(user.id, 0, TransactionKind::TopUp, None).await.is_err());
    }

    #[tokio::test]
    async fn purchase_requires_funds() {
        let (_dir, db) = open_temp().await;
        let (panel, product) = seed_panel_and_product(&db).await;
        assert_eq!(panel.api_url, "https://panel.example.com:2053");
        assert_eq!(panel.subscription_url.as_deref(), Some("https://sub.example.com/sub"));

        let user = db.register_or_get(1, None, None, None, None).await.unwrap().user;
        let service = new_service(user.id, &panel, &product);

        let refused = db
            .insert_purchased_service(&service, product.price, "buy", None)
            .await
            .unwrap();
        assert!(matches!(refused, PurchaseWrite::InsufficientFunds));
        assert_eq!(db.count_user_services(user.id).await.unwrap(), 0);

        db.add_balance(user.id, 200_000, TransactionKind::TopUp, None)
            .await
            .unwrap();
        let stored = stored(
            db.insert_purchased_service(&service, product.price, "buy", None)
                .await
                .unwrap(),
        );
        assert_eq!(stored.alerts_sent, 0);
        assert_eq!(stored.status, ServiceStatus::Active);
        assert_eq!(stored.total_gb, 30.0);
        assert_eq!(db.get_user(user.id).await.unwrap().unwrap().balance, 50_000);

        let page = db.list_user_services_page(user.id, 10, 0).await.unwrap();
        assert_eq!(page.len(), 1);
        assert!(db.get_service_for_user(stored.id, user.id + 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn renewal_updates_service_and_history() {
        let (_dir, db) = open_temp().await;
        let (panel, product) = seed_panel_and_product(&db).await;
        let user = db.register_or_get(1, None, None, None, None).await.unwrap().user;
        db.add_balance(user.id, 300_000, TransactionKind::TopUp, None)
            .await
            .unwrap();
        let service = stored(
            db.insert_purchased_service(&new_service(user.id, &panel, &product), product.price, "buy", None)
                .await
                .unwrap(),
        );
        db.update_service_usage(service.id, 12.5, ServiceStatus::Active)
            .await
            .unwrap();
        db.mark_alerts_sent(service.id, alert_bits::USAGE_WARNING)
            .await
            .unwrap();

        let record = RenewalRecord {
            service_id: service.id,
            user_id: user.id,
            product_id: product.id,
            method: 2,
            previous_remaining_gb: 17.5,
            previous_remaining_days: 10,
            final_data_gb: 47.5,
            final_duration_days: 40,
            reset_used: false,
            new_expires_at: Some(2_000_000_000),
            price: product.price,
        };
        assert!(db.apply_renewal(&record).await.unwrap().is_some());

        let renewed = db.get_service(service.id).await.unwrap().unwrap();
        assert_eq!(renewed.total_gb, 47.5);
        assert_eq!(renewed.used_gb, 0.0);
        assert_eq!(renewed.alerts_sent, 0);
        assert_eq!(renewed.expires_at, Some(2_000_000_000));
        assert_eq!(db.count_renewals(service.id).await.unwrap(), 1);
        assert_eq!(db.get_user(user.id).await.unwrap().unwrap().balance, 0);

        // Wallet is now empty.
        assert!(db.apply_renewal(&record).await.unwrap().is_none());
        assert_eq!(db.count_renewals(service.id).await.unwrap(), 1);

        let stats = db.admin_stats().await.unwrap();
        assert_eq!(stats.users, 1);
        assert_eq!(stats.active_services, 1);
        assert_eq!(stats.renewals, 1);
        assert_eq!(stats.revenue, 300_000);
        assert_eq!(stats.total_balance, 0);
        assert_eq!(stats.open_tickets, 0);
    }

    #[tokio::test]
    async fn reverted_renewal_refunds_and_restores_quota() {
        let (_dir, db) = open_temp().await;
        let (panel, product) = seed_panel_and_product(&db).await;
        let user = funded_user(&db, 1, 300_000).await;
        let service = stored(
            db.insert_purchased_service(&new_service(user.id, &panel, &product), product.price, "buy", None)
                .await
                .unwrap(),
        );
        db.update_service_usage(service.id, 20.0, ServiceStatus::Active)
            .await
            .unwrap();
        db.mark_alerts_sent(service.id, alert_bits::USAGE_WARNING)
            .await
            .unwrap();
        let before = db.get_service(service.id).await.unwrap().unwrap();

        let record = RenewalRecord {
            service_id: service.id,
            user_id: user.id,
            product_id: product.id,
            method: 1,
            previous_remaining_gb: 10.0,
            previous_remaining_days: 5,
            final_data_gb: 30.0,
            final_duration_days: 30,
            reset_used: true,
            new_expires_at: Some(2_000_000_000),
            price: product.price,
        };
        let renewal_id = db.apply_renewal(&record).await.unwrap().unwrap();
        assert!(db.revert_renewal(renewal_id, &before, product.price).await.unwrap());
        assert!(!db.revert_renewal(renewal_id, &before, product.price).await.unwrap());

        let restored = db.get_service(service.id).await.unwrap().unwrap();
        assert_eq!(restored.used_gb, 20.0);
        assert_eq!(restored.expires_at, before.expires_at);
        assert_eq!(restored.alerts_sent, alert_bits::USAGE_WARNING);
        assert_eq!(db.count_renewals(service.id).await.unwrap(), 0);

        let user = db.get_user(user.id).await.unwrap().unwrap();
        assert_eq!(user.balance, 150_000);
        assert_eq!(user.total_spent, 150_000);
        let ledger = db.list_transactions(user.id, 1).await.unwrap();
        assert_eq!(ledger[0].kind, "refund");
        assert_eq!(ledger[0].amount, 150_000);
        assert_eq!(db.admin_stats().await.unwrap().revenue, 150_000);
    }

    #[tokio::test]
    async fn monitored_services_skip_deleted_and_keep_alert_bits() {
        let (_dir, db) = open_temp().await;
        let (panel, product) = seed_panel_and_product(&db).await;
        let user = funded_user(&db, 1, 300_000).await;
        let kept = stored(
            db.insert_purchased_service(&new_service(user.id, &panel, &product), product.price, "buy", None)
                .await
                .unwrap(),
        );
        let mut other = new_service(user.id, &panel, &product);
        other.client_uuid = "0b1c2d3e-0000-4000-8000-000000000002".to_string();
        let dropped = stored(
            db.insert_purchased_service(&other, product.price, "buy", None)
                .await
                .unwrap(),
        );
        db.mark_service_deleted(dropped.id).await.unwrap();

        db.mark_alerts_sent(kept.id, alert_bits::EXPIRY_WARNING)
            .await
            .unwrap();
        db.mark_alerts_sent(kept.id, alert_bits::USAGE_WARNING)
            .await
            .unwrap();

        let monitored = db.list_monitored_services().await.unwrap();
        assert_eq!(monitored.len(), 1);
        assert_eq!(monitored[0].id, kept.id);
        assert_eq!(
            monitored[0].alerts_sent,
            alert_bits::EXPIRY_WARNING | alert_bits::USAGE_WARNING
        );
    }

    #[tokio::test]
    async fn gift_codes_credit_once_per_user() {
        let (_dir, db) = open_temp().await;
        let first = funded_user(&db, 1, 0).await;
        let second = funded_user(&db, 2, 0).await;
        let third = funded_user(&db, 3, 0).await;

        let gift = db
            .create_gift_code("WELCOME", 20_000, 2, None, Some(99))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(gift.used_count, 0);
        assert!(db.create_gift_code("WELCOME", 1, 1, None, None).await.unwrap().is_none());

        match db.redeem_gift_code(first.id, "WELCOME").await.unwrap() {
            GiftRedemption::Credited { amount, balance } => {
                assert_eq!(amount, 20_000);
                assert_eq!(balance, 20_000);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            db.redeem_gift_code(first.id, "WELCOME").await.unwrap(),
            GiftRedemption::Rejected(CodeRejection::AlreadyUsed)
        ));
        assert!(matches!(
            db.redeem_gift_code(second.id, "WELCOME").await.unwrap(),
            GiftRedemption::Credited { .. }
        ));
        assert!(matches!(
            db.redeem_gift_code(third.id, "WELCOME").await.unwrap(),
            GiftRedemption::Rejected(CodeRejection::Exhausted)
        ));
        assert!(matches!(
            db.redeem_gift_code(third.id, "NOPE").await.unwrap(),
            GiftRedemption::Rejected(CodeRejection::NotFound)
        ));

        db.create_gift_code("OLD", 5_000, 0, Some(1), None)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            db.redeem_gift_code(third.id, "OLD").await.unwrap(),
            GiftRedemption::Rejected(CodeRejection::Expired)
        ));

        // The refused duplicate must not have consumed a use.
        assert_eq!(db.get_gift_code("WELCOME").await.unwrap().unwrap().used_count, 2);
        let ledger = db.list_transactions(first.id, 10).await.unwrap();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].kind, "gift_code");
        assert_eq!(db.list_gift_codes(10).await.unwrap().len(), 2);
    }

    #[test]
    fn discount_amounts_are_capped() {
        let mut code = DiscountCode {
            id: 1,
            code: "OFF".to_string(),
            kind: DiscountKind::Percent,
            value: 20,
            max_uses: 0,
            used_count: 0,
            owner_user_id: None,
            expires_at: None,
            is_active: true,
            created_at: 0,
        };
        assert_eq!(code.discount_for(150_000), 30_000);
        code.value = 250;
        assert_eq!(code.discount_for(150_000), 150_000);
        code.kind = DiscountKind::Fixed;
        code.value = 20_000;
        assert_eq!(code.discount_for(150_000), 20_000);
        assert_eq!(code.discount_for(5_000), 5_000);

        assert_eq!(code.rejection(7, 100), None);
        code.owner_user_id = Some(8);
        assert_eq!(code.rejection(7, 100), Some(CodeRejection::NotOwner));
        code.owner_user_id = None;
        code.expires_at = Some(100);
        assert_eq!(code.rejection(7, 100), Some(CodeRejection::Expired));
        code.expires_at = None;
        code.max_uses = 3;
        code.used_count = 3;
        assert_eq!(code.rejection(7, 100), Some(CodeRejection::Exhausted));
        code.is_active = false;
        assert_eq!(code.rejection(7, 100), Some(CodeRejection::Inactive));
    }

    #[tokio::test]
    async fn discount_is_claimed_with_the_purchase() {
        let (_dir, db) = open_temp().await;
        let (panel, product) = seed_panel_and_product(&db).await;
        let first = funded_user(&db, 1, 200_000).await;
        let second = funded_user(&db, 2, 200_000).await;
        let code = db
            .create_discount_code("SPRING", DiscountKind::Percent, 20, 1, None)
            .await
            .unwrap()
            .unwrap();
        let applied = AppliedDiscount {
            code_id: code.id,
            discount_amount: code.discount_for(product.price),
        };

        let service = stored(
            db.insert_purchased_service(
                &new_service(first.id, &panel, &product),
                product.price - applied.discount_amount,
                "buy",
                Some(applied),
            )
            .await
            .unwrap(),
        );
        assert!(db.discount_used_by(code.id, first.id).await.unwrap());
        assert_eq!(db.get_user(first.id).await.unwrap().unwrap().balance, 80_000);
        assert_eq!(db.get_discount_code("SPRING").await.unwrap().unwrap().used_count, 1);

        let mut other = new_service(second.id, &panel, &product);
        other.client_uuid = "0b1c2d3e-0000-4000-8000-000000000002".to_string();
        let refused = db
            .insert_purchased_service(&other, product.price - 30_000, "buy", Some(applied))
            .await
            .unwrap();
        assert!(matches!(
            refused,
            PurchaseWrite::DiscountRejected(CodeRejection::Exhausted)
        ));
        // Rolled back: no charge, no service.
        assert_eq!(db.get_user(second.id).await.unwrap().unwrap().balance, 200_000);
        assert_eq!(db.count_user_services(second.id).await.unwrap(), 0);
        assert!(service.id > 0);
        assert_eq!(db.list_discount_codes(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn tickets_follow_the_conversation() {
        let (_dir, db) = open_temp().await;
        let user = funded_user(&db, 55, 0).await;
        let ticket = db
            .open_ticket(user.id, 55, "connection", "cannot connect")
            .await
            .unwrap();
        assert_eq!(ticket.status, TicketStatus::Open);
        assert_eq!(db.admin_stats().await.unwrap().open_tickets, 1);

        let answered = db
            .add_ticket_message(ticket.id, 1, true, "try again")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(answered.status, TicketStatus::Answered);
        let reopened = db
            .add_ticket_message(ticket.id, 55, false, "still broken")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reopened.status, TicketStatus::Open);
        assert_eq!(db.list_pending_tickets(10).await.unwrap().len(), 1);

        let closed = db.close_ticket(ticket.id).await.unwrap().unwrap();
        assert_eq!(closed.status, TicketStatus::Closed);
        assert!(db.close_ticket(ticket.id).await.unwrap().is_none());
        assert!(db
            .add_ticket_message(ticket.id, 55, false, "hello?")
            .await
            .unwrap()
            .is_none());
        assert!(db.list_pending_tickets(10).await.unwrap().is_empty());

        let thread = db.list_ticket_messages(ticket.id).await.unwrap();
        assert_eq!(thread.len(), 3);
        assert!(thread[1].is_admin);
        assert_eq!(thread[2].body, "still broken");
        assert_eq!(db.get_ticket(ticket.id).await.unwrap().unwrap().subject, "connection");
    }

    #[tokio::test]
    async fn wheel_spins_respect_cooldown_and_pay_prizes() {
        let (_dir, db) = open_temp().await;
        let user = funded_user(&db, 1, 0).await;
        let balance_prize = WheelPrize {
            kind: PrizeKind::Balance,
            value: 5_000,
            weight: 1,
            label: "5000".to_string(),
        };
        match db.record_spin(user.id, &balance_prize, 0, 3600).await.unwrap() {
            SpinWrite::Recorded {
                balance,
                discount_code,
            } => {
                assert_eq!(balance, 5_000);
                assert!(discount_code.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            db.record_spin(user.id, &balance_prize, 0, 3600).await.unwrap(),
            SpinWrite::CoolingDown { .. }
        ));

        let other = funded_user(&db, 2, 0).await;
        assert!(matches!(
            db.record_spin(other.id, &balance_prize, 1_000, 0).await.unwrap(),
            SpinWrite::InsufficientFunds
        ));

        let discount_prize = WheelPrize {
            kind: PrizeKind::Discount,
            value: 10,
            weight: 1,
            label: "10%".to_string(),
        };
        let code = match db.record_spin(other.id, &discount_prize, 0, 0).await.unwrap() {
            SpinWrite::Recorded {
                discount_code: Some(code),
                ..
            } => code,
            other => panic!("unexpected {:?}", other),
        };
        let personal = db.get_discount_code(&code).await.unwrap().unwrap();
        assert_eq!(personal.owner_user_id, Some(other.id));
        assert_eq!(personal.max_uses, 1);
        assert!(personal.expires_at.is_some());
        assert!(db.list_discount_codes(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn deleted_services_are_hidden() {
        let (_dir, db) = open_temp().await;
        let (panel, product) = seed_panel_and_product(&db).await;
        let user = db.register_or_get(1, None, None, None, None).await.unwrap().user;
        db.add_balance(user.id, 150_000, TransactionKind::TopUp, None)
            .await
            .unwrap();
        let service = stored(
            db.insert_purchased_service(&new_service(user.id, &panel, &product), product.price, "buy", None)
                .await
                .unwrap(),
        );

        assert!(db.mark_service_deleted(service.id).await.unwrap());
        assert!(!db.mark_service_deleted(service.id).await.unwrap());
        assert_eq!(db.count_user_services(user.id).await.unwrap(), 0);
        assert!(db.get_service_for_user(service.id, user.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn settings_and_sequences() {
        let (_dir, db) = open_temp().await;
        assert_eq!(db.get_setting("renewal_method").await.unwrap(), None);
        db.set_setting("renewal_method", "3").await.unwrap();
        db.set_setting("renewal_method", "4").await.unwrap();
        assert_eq!(db.get_setting("renewal_method").await.unwrap().as_deref(), Some("4"));

        assert_eq!(db.next_sequence("seq").await.unwrap(), 1);
        assert_eq!(db.next_sequence("seq").await.unwrap(), 2);
        assert_eq!(db.next_sequence("other").await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_sequences_never_collide() {
        let (_dir, db) = open_temp().await;
        let db = std::sync::Arc::new(db);
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let db = db.clone();
                tokio::spawn(async move { db.next_sequence("username_seq_id_1").await })
            })
            .collect();

        let mut values = Vec::new();
        for handle in handles {
            values.push(handle.await.unwrap().unwrap());
        }
        values.sort_unstable();
        assert_eq!(values, (1..=16).collect::<Vec<i64>>());
    }
}
