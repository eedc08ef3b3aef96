//! Purchases, renewals and wallet rewards, tying the database to a panel gateway.
//! Also hosts gift and discount codes, support tickets, the wheel and usage sync.

use crate::config::Config;
use crate::db::{
    AppliedDiscount, CodeRejection, Db, DiscountCode, DiscountKind, GiftCode, GiftRedemption,
    NewService, Panel, Product, PurchaseWrite, RegisterOutcome, RenewalRecord, Service,
    ServiceStatus, SpinWrite, Ticket, TicketMessage, TransactionKind, User,
};
use crate::monitor::{self, AlertKind};
use crate::naming::{self, NamingContext, NamingMethod};
use crate::panel::{ClientQuota, ClientUsage, NewClient, PanelError, PanelGateway};
use crate::renewal::{self, RenewalMethod, RenewalOutcome};
use crate::wheel::{self, WheelPrize};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

const RENEWAL_METHOD_KEY: &str = "renewal_method";
const NAMING_METHOD_KEY: &str = "naming_method";

#[derive(Debug, Error)]
pub enum ShopError {
    #[error("insufficient balance: required {required}, available {available}")]
    InsufficientBalance { required: i64, available: i64 },
    #[error("user {0} is not registered")]
    UnknownUser(i64),
    #[error("product {0} not found")]
    UnknownProduct(i64),
    #[error("service {0} not found")]
    UnknownService(i64),
    #[error("panel {0} not found")]
    UnknownPanel(i64),
    #[error("product {product_id} is not sold on panel {panel_id}")]
    ProductPanelMismatch { product_id: i64, panel_id: i64 },
    #[error("code rejected: {0:?}")]
    CodeRejected(CodeRejection),
    #[error("code {0} already exists")]
    CodeTaken(String),
    #[error("ticket {0} not found")]
    UnknownTicket(i64),
    #[error("ticket {0} is closed")]
    TicketClosed(i64),
    #[error("wheel is disabled")]
    WheelDisabled,
    #[error("wheel cooling down for {remaining_secs}s")]
    WheelCooldown { remaining_secs: i64 },
    #[error(transparent)]
    Panel(#[from] PanelError),
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl ShopError {
    /// Text safe to show to the Telegram user.
    pub fn user_message(&self) -> String {
        match self {
            ShopError::InsufficientBalance {
                required,
                available,
            } => format!(
                "❌ موجودی کافی نیست.\nمبلغ مورد نیاز: {}\nموجودی شما: {}",
                naming::format_balance(*required),
                naming::format_balance(*available)
            ),
            ShopError::UnknownUser(_) => "❌ ابتدا /start را ارسال کنید.".to_string(),
            ShopError::UnknownProduct(_) => "❌ این محصول در دسترس نیست.".to_string(),
            ShopError::UnknownService(_) => "❌ سرویس پیدا نشد.".to_string(),
            ShopError::UnknownPanel(_) => "❌ سرور این سرویس در دسترس نیست.".to_string(),
            ShopError::ProductPanelMismatch { .. } => {
                "❌ این بسته برای سرور این سرویس قابل استفاده نیست.".to_string()
            }
            ShopError::CodeRejected(rejection) => code_rejection_message(*rejection).to_string(),
            ShopError::CodeTaken(code) => format!("❌ کد {} قبلاً ثبت شده است.", code),
            ShopError::UnknownTicket(_) => "❌ تیکت پیدا نشد.".to_string(),
            ShopError::TicketClosed(_) => {
                "❌ این تیکت بسته شده است. برای پیام جدید یک تیکت تازه باز کنید.".to_string()
            }
            ShopError::WheelDisabled => "❌ گردونه شانس در حال حاضر فعال نیست.".to_string(),
            ShopError::WheelCooldown { remaining_secs } => format!(
                "⏳ هنوز نوبت چرخش بعدی نرسیده است.\nزمان باقیمانده: {}",
                naming::format_time_remaining(*remaining_secs)
            ),
            ShopError::Panel(PanelError::Rejected { .. }) => {
                "❌ سرور درخواست را نپذیرفت. اگر نام دلخواه وارد کرده‌اید، نام دیگری امتحان کنید."
                    .to_string()
            }
            ShopError::Panel(_) => {
                "❌ ارتباط با سرور برقرار نشد. لطفاً کمی بعد دوباره تلاش کنید.".to_string()
            }
            ShopError::Storage(_) => "❌ خطای داخلی. لطفاً دوباره تلاش کنید.".to_string(),
        }
    }
}

fn code_rejection_message(rejection: CodeRejection) -> &'static str {
    match rejection {
        CodeRejection::NotFound => "❌ کد وارد شده معتبر نیست.",
        CodeRejection::Inactive => "❌ این کد غیرفعال شده است.",
        CodeRejection::Expired => "❌ مهلت استفاده از این کد تمام شده است.",
        CodeRejection::Exhausted => "❌ ظرفیت استفاده از این کد تکمیل شده است.",
        CodeRejection::AlreadyUsed => "❌ شما قبلاً از این کد استفاده کرده‌اید.",
        CodeRejection::NotOwner => "❌ این کد متعلق به حساب دیگری است.",
    }
}

/// Price of a product for one user, with an optional discount code applied.
#[derive(Debug, Clone)]
pub struct PurchaseQuote {
    pub product: Product,
    pub panel: Panel,
    pub balance: i64,
    pub discount: Option<DiscountCode>,
    pub discount_amount: i64,
}

impl PurchaseQuote {
    pub fn price(&self) -> i64 {
        self.product.price - self.discount_amount
    }

    pub fn affordable(&self) -> bool {
        self.balance >= self.price()
    }
}

#[derive(Debug, Clone)]
pub struct Purchase {
    pub service: Service,
    pub panel: Panel,
    pub product: Product,
    /// Amount actually charged.
    pub price: i64,
    pub discount_code: Option<String>,
    pub balance: i64,
    pub subscription_link: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GiftReceipt {
    pub code: String,
    pub amount: i64,
    pub balance: i64,
}

#[derive(Debug, Clone)]
pub struct SpinOutcome {
    pub prize: WheelPrize,
    pub balance: i64,
    pub discount_code: Option<String>,
}

/// A monitor notification for the owner of `service`.
#[derive(Debug, Clone)]
pub struct UsageAlert {
    pub tg_user_id: i64,
    pub kind: AlertKind,
    pub service: Service,
    pub usage: ClientUsage,
}

/// Service state as seen by the user, live from the panel when reachable.
#[derive(Debug, Clone)]
pub struct ServiceSnapshot {
    pub service: Service,
    pub panel: Panel,
    pub used_gb: f64,
    pub total_gb: f64,
    pub expires_at: Option<DateTime<Utc>>,
    pub status: ServiceStatus,
    pub renewals: i64,
    /// `false` when the panel could not be reached and cached values are shown.
    pub live: bool,
}

impl ServiceSnapshot {
    pub fn remaining_gb(&self) -> f64 {
        if self.total_gb <= 0.0 {
            return 0.0;
        }
        (self.total_gb - self.used_gb).max(0.0)
    }

    pub fn remaining_days(&self, now: DateTime<Utc>) -> i64 {
        renewal::remaining_days(self.expires_at, now)
    }

    pub fn subscription_link(&self) -> Option<String> {
        subscription_link(&self.panel, &self.service)
    }
}

#[derive(Debug, Clone)]
pub struct RenewalQuote {
    pub snapshot: ServiceSnapshot,
    pub product: Product,
    pub method: RenewalMethod,
    pub remaining_gb: f64,
    pub remaining_days: i64,
    pub outcome: RenewalOutcome,
    pub balance: i64,
}

impl RenewalQuote {
    pub fn price(&self) -> i64 {
        self.product.price
    }

    pub fn affordable(&self) -> bool {
        self.balance >= self.product.price
    }
}

#[derive(Debug, Clone)]
pub struct RenewalReceipt {
    pub quote: RenewalQuote,
    pub expires_at: Option<DateTime<Utc>>,
    pub balance: i64,
}

pub fn subscription_link(panel: &Panel, service: &Service) -> Option<String> {
    panel
        .subscription_url
        .as_deref()
        .filter(|url| !url.trim().is_empty())
        .map(|url| format!("{}/{}", url.trim_end_matches('/'), service.sub_id))
}

fn to_unix(at: Option<DateTime<Utc>>) -> Option<i64> {
    at.map(|at| at.timestamp())
}

fn from_unix(ts: Option<i64>) -> Option<DateTime<Utc>> {
    ts.and_then(|ts| DateTime::from_timestamp(ts, 0))
}

fn expiry_for(days: i64, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    (days > 0).then(|| renewal::expiry_from_duration(days, now))
}

/// Status implied by live panel usage.
fn status_from_usage(usage: &ClientUsage, now: DateTime<Utc>) -> ServiceStatus {
    let expired = usage.expires_at.is_some_and(|at| at <= now)
        || (usage.total_gb > 0.0 && usage.remaining_gb() <= 0.0);
    if !usage.enabled {
        ServiceStatus::Disabled
    } else if expired {
        ServiceStatus::Expired
    } else {
        ServiceStatus::Active
    }
}

/// Ticket subject: the first line of the message, shortened.
fn ticket_subject(body: &str) -> String {
    const MAX_CHARS: usize = 40;
    let first_line = body.lines().map(str::trim).find(|line| !line.is_empty()).unwrap_or("-");
    if first_line.chars().count() > MAX_CHARS {
        let cut: String = first_line.chars().take(MAX_CHARS).collect();
        format!("{}…", cut)
    } else {
        first_line.to_string()
    }
}

fn code_or_generated(code: Option<&str>) -> String {
    code.map(naming::clean_name)
        .filter(|code| !code.is_empty())
        .unwrap_or_else(naming::generate_promo_code)
}

fn expiry_after_days(days: Option<i64>, now: DateTime<Utc>) -> Option<i64> {
    days.filter(|days| *days > 0)
        .map(|days| (now + chrono::Duration::days(days)).timestamp())
}

pub struct Shop<G> {
    db: Arc<Db>,
    gateway: G,
    config: Arc<Config>,
}

impl<G: PanelGateway> Shop<G> {
    pub fn new(db: Arc<Db>, gateway: G, config: Arc<Config>) -> Self {
        Self {
            db,
            gateway,
            config,
        }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    /// Registers on first contact and pays out the welcome bonus and referral reward.
    pub async fn register(
        &self,
        tg_user_id: i64,
        username: Option<&str>,
        first_name: Option<&str>,
        last_name: Option<&str>,
        referral_code: Option<&str>,
    ) -> Result<RegisterOutcome, ShopError> {
        let referral_code = referral_code.filter(|_| self.config.referral.enabled);
        let mut outcome = self
            .db
            .register_or_get(tg_user_id, username, first_name, last_name, referral_code)
            .await?;
        if !outcome.is_new {
            return Ok(outcome);
        }

        let bonus = self.config.referral.welcome_bonus;
        if bonus > 0 {
            outcome.user.balance = self
                .db
                .add_balance(
                    outcome.user.id,
                    bonus,
                    TransactionKind::WelcomeBonus,
                    Some("welcome bonus"),
                )
                .await?;
        }

        let reward = self.config.referral.reward_amount;
        if let Some(referrer) = outcome.referrer.as_mut()
            && reward > 0
        {
            let description = format!("referral of {}", tg_user_id);
            referrer.balance = self
                .db
                .add_balance(
                    referrer.id,
                    reward,
                    TransactionKind::ReferralReward,
                    Some(&description),
                )
                .await?;
            tracing::info!(
                referrer_id = referrer.tg_user_id,
                invited_id = tg_user_id,
                reward,
                "Referral reward credited"
            );
        }

        Ok(outcome)
    }

    pub async fn renewal_method(&self) -> Result<RenewalMethod, ShopError> {
        let stored = self.db.get_setting(RENEWAL_METHOD_KEY).await?;
        let code = stored
            .and_then(|value| value.trim().parse::<i64>().ok())
            .unwrap_or(self.config.renewal.default_method);
        Ok(RenewalMethod::from_value(code))
    }

    pub async fn set_renewal_method(&self, method: RenewalMethod) -> Result<(), ShopError> {
        self.db
            .set_setting(RENEWAL_METHOD_KEY, &method.value().to_string())
            .await?;
        Ok(())
    }

    pub async fn naming_method(&self) -> Result<NamingMethod, ShopError> {
        let stored = self.db.get_setting(NAMING_METHOD_KEY).await?;
        let code = stored
            .and_then(|value| value.trim().parse::<i64>().ok())
            .unwrap_or(self.config.naming.method);
        Ok(NamingMethod::from_value(code))
    }

    pub async fn set_naming_method(&self, method: NamingMethod) -> Result<(), ShopError> {
        self.db
            .set_setting(NAMING_METHOD_KEY, &method.value().to_string())
            .await?;
        Ok(())
    }

    async fn active_product(&self, product_id: i64) -> Result<Product, ShopError> {
        self.db
            .get_product(product_id)
            .await?
            .filter(|product| product.is_active)
            .ok_or(ShopError::UnknownProduct(product_id))
    }

    async fn panel(&self, panel_id: i64) -> Result<Panel, ShopError> {
        self.db
            .get_panel(panel_id)
            .await?
            .ok_or(ShopError::UnknownPanel(panel_id))
    }

    async fn client_name(
        &self,
        panel_id: i64,
        tg_user_id: i64,
        username: Option<&str>,
        first_name: Option<&str>,
        custom_name: Option<&str>,
    ) -> Result<String, ShopError> {
        let method = self.naming_method().await?;
        let sequence = match method.sequence_key(panel_id) {
            Some(key) => Some(self.db.next_sequence(&key).await?),
            None => None,
        };
        let ctx = NamingContext {
            tg_user_id,
            username,
            first_name,
            custom_name,
            admin_prefix: self.config.naming.admin_prefix.as_deref(),
            reseller_prefix: self.config.naming.reseller_prefix.as_deref(),
        };
        Ok(naming::generate_client_name(
            method,
            &ctx,
            sequence,
            &mut rand::rng(),
        ))
    }

    async fn registered_user(&self, tg_user_id: i64) -> Result<User, ShopError> {
        self.db
            .get_user_by_tg(tg_user_id)
            .await?
            .ok_or(ShopError::UnknownUser(tg_user_id))
    }

    async fn current_balance(&self, user_id: i64) -> Result<i64, ShopError> {
        Ok(self
            .db
            .get_user(user_id)
            .await?
            .map(|user| user.balance)
            .unwrap_or(0))
    }

    /// A discount code `user_id` may still use.
    async fn usable_discount(&self, user_id: i64, code: &str) -> Result<DiscountCode, ShopError> {
        let code = naming::clean_name(code);
        if code.is_empty() {
            return Err(ShopError::CodeRejected(CodeRejection::NotFound));
        }
        let discount = self
            .db
            .get_discount_code(&code)
            .await?
            .ok_or(ShopError::CodeRejected(CodeRejection::NotFound))?;
        if let Some(rejection) = discount.rejection(user_id, Utc::now().timestamp()) {
            return Err(ShopError::CodeRejected(rejection));
        }
        if self.db.discount_used_by(discount.id, user_id).await? {
            return Err(ShopError::CodeRejected(CodeRejection::AlreadyUsed));
        }
        Ok(discount)
    }

    /// Prices `product_id` for the user, validating `discount_code` if given.
    pub async fn quote_purchase(
        &self,
        tg_user_id: i64,
        product_id: i64,
        discount_code: Option<&str>,
    ) -> Result<PurchaseQuote, ShopError> {
        let user = self.registered_user(tg_user_id).await?;
        let product = self.active_product(product_id).await?;
        let panel = self.panel(product.panel_id).await?;
        if !panel.is_active {
            return Err(ShopError::UnknownPanel(panel.id));
        }
        let discount = match discount_code {
            Some(code) => Some(self.usable_discount(user.id, code).await?),
            None => None,
        };
        let discount_amount = discount
            .as_ref()
            .map(|discount| discount.discount_for(product.price))
            .unwrap_or(0);
        Ok(PurchaseQuote {
            product,
            panel,
            balance: user.balance,
            discount,
            discount_amount,
        })
    }

    /// Removes a panel client whose service row was never committed.
    async fn discard_client(&self, panel: &Panel, service: &NewService, created_at: i64) {
        let orphan = Service {
            id: 0,
            user_id: service.user_id,
            panel_id: service.panel_id,
            product_id: Some(service.product_id),
            client_name: service.client_name.clone(),
            client_uuid: service.client_uuid.clone(),
            email: service.email.clone(),
            inbound_id: service.inbound_id,
            sub_id: service.sub_id.clone(),
            total_gb: service.total_gb,
            used_gb: 0.0,
            expires_at: service.expires_at,
            status: ServiceStatus::Deleted,
            created_at,
            alerts_sent: 0,
        };
        if let Err(error) = self.gateway.remove_client(panel, &orphan).await {
            tracing::warn!(
                email = %orphan.email,
                error = %error,
                "Failed to roll back panel client after failed purchase"
            );
        }
    }

    /// Buys `product_id`: funds are checked first, the panel client is created,
    /// then the charge, the discount claim and the service row are committed
    /// together. The client is removed again if that commit does not happen.
    pub async fn purchase(
        &self,
        tg_user_id: i64,
        product_id: i64,
        custom_name: Option<&str>,
        discount_code: Option<&str>,
    ) -> Result<Purchase, ShopError> {
        let quote = self
            .quote_purchase(tg_user_id, product_id, discount_code)
            .await?;
        if !quote.affordable() {
            return Err(ShopError::InsufficientBalance {
                required: quote.price(),
                available: quote.balance,
            });
        }
        let user = self.registered_user(tg_user_id).await?;
        let PurchaseQuote {
            product,
            panel,
            discount,
            discount_amount,
            ..
        } = quote;
        let price = product.price - discount_amount;

        let name = self
            .client_name(
                panel.id,
                tg_user_id,
                user.username.as_deref(),
                user.first_name.as_deref(),
                custom_name,
            )
            .await?;
        let now = Utc::now();
        let expires_at = expiry_for(product.duration_days, now);
        let new_client = NewClient {
            inbound_id: panel.inbound_id,
            email: name.clone(),
            uuid: uuid::Uuid::new_v4().to_string(),
            sub_id: naming::generate_sub_id(),
            total_gb: product.volume_gb as f64,
            expires_at,
            tg_user_id,
        };
        self.gateway.create_client(&panel, &new_client).await?;

        let new_service = NewService {
            user_id: user.id,
            panel_id: panel.id,
            product_id: product.id,
            client_name: name,
            client_uuid: new_client.uuid.clone(),
            email: new_client.email.clone(),
            inbound_id: new_client.inbound_id,
            sub_id: new_client.sub_id.clone(),
            total_gb: new_client.total_gb,
            expires_at: to_unix(expires_at),
        };
        let description = match &discount {
            Some(discount) => format!("purchase of {} with code {}", product.name, discount.code),
            None => format!("purchase of {}", product.name),
        };
        let applied = discount.as_ref().map(|discount| AppliedDiscount {
            code_id: discount.id,
            discount_amount,
        });
        let written = self
            .db
            .insert_purchased_service(&new_service, price, &description, applied)
            .await;

        let service = match written {
            Ok(PurchaseWrite::Stored(service)) => service,
            Ok(PurchaseWrite::InsufficientFunds) => {
                // Balance changed between the check and the commit.
                self.discard_client(&panel, &new_service, now.timestamp()).await;
                return Err(ShopError::InsufficientBalance {
                    required: price,
                    available: self.current_balance(user.id).await?,
                });
            }
            Ok(PurchaseWrite::DiscountRejected(rejection)) => {
                self.discard_client(&panel, &new_service, now.timestamp()).await;
                return Err(ShopError::CodeRejected(rejection));
            }
            Err(error) => {
                self.discard_client(&panel, &new_service, now.timestamp()).await;
                return Err(error.into());
            }
        };

        let balance = self.current_balance(user.id).await?;
        tracing::info!(
            tg_user_id,
            service_id = service.id,
            product_id = product.id,
            panel_id = panel.id,
            price,
            discount_amount,
            "Service purchased"
        );
        let subscription_link = subscription_link(&panel, &service);
        Ok(Purchase {
            service,
            panel,
            product,
            price,
            discount_code: discount.map(|discount| discount.code),
            balance,
            subscription_link,
        })
    }

    async fn owned_service(&self, tg_user_id: i64, service_id: i64) -> Result<Service, ShopError> {
        let user = self.registered_user(tg_user_id).await?;
        self.db
            .get_service_for_user(service_id, user.id)
            .await?
            .ok_or(ShopError::UnknownService(service_id))
    }

    async fn snapshot(&self, service: Service) -> Result<ServiceSnapshot, ShopError> {
        let panel = self.panel(service.panel_id).await?;
        let renewals = self.db.count_renewals(service.id).await?;
        match self.gateway.client_usage(&panel, &service).await {
            Ok(usage) => {
                let status = status_from_usage(&usage, Utc::now());
                self.db
                    .update_service_usage(service.id, usage.used_gb, status)
                    .await?;
                Ok(ServiceSnapshot {
                    used_gb: usage.used_gb,
                    total_gb: usage.total_gb,
                    expires_at: usage.expires_at,
                    status,
                    renewals,
                    live: true,
                    service,
                    panel,
                })
            }
            Err(error) => {
                tracing::warn!(
                    service_id = service.id,
                    panel_id = panel.id,
                    error = %error,
                    "Panel unreachable, using cached service usage"
                );
                Ok(ServiceSnapshot {
                    used_gb: service.used_gb,
                    total_gb: service.total_gb,
                    expires_at: from_unix(service.expires_at),
                    status: service.status,
                    renewals,
                    live: false,
                    service,
                    panel,
                })
            }
        }
    }

    pub async fn service_status(
        &self,
        tg_user_id: i64,
        service_id: i64,
    ) -> Result<ServiceSnapshot, ShopError> {
        let service = self.owned_service(tg_user_id, service_id).await?;
        self.snapshot(service).await
    }

    /// Products the service can be renewed with.
    pub async fn renewal_products(
        &self,
        tg_user_id: i64,
        service_id: i64,
    ) -> Result<Vec<Product>, ShopError> {
        let service = self.owned_service(tg_user_id, service_id).await?;
        Ok(self.db.list_products(service.panel_id).await?)
    }

    pub async fn quote_renewal(
        &self,
        tg_user_id: i64,
        service_id: i64,
        product_id: i64,
    ) -> Result<RenewalQuote, ShopError> {
        let service = self.owned_service(tg_user_id, service_id).await?;
        let product = self.active_product(product_id).await?;
        if product.panel_id != service.panel_id {
            return Err(ShopError::ProductPanelMismatch {
                product_id,
                panel_id: service.panel_id,
            });
        }
        let balance = self.current_balance(service.user_id).await?;

        let snapshot = self.snapshot(service).await?;
        let method = self.renewal_method().await?;
        let remaining_gb = snapshot.remaining_gb();
        let remaining_days = snapshot.remaining_days(Utc::now());
        let outcome = renewal::calculate(
            method,
            remaining_gb,
            remaining_days,
            product.volume_gb as f64,
            product.duration_days,
        );

        Ok(RenewalQuote {
            snapshot,
            product,
            method,
            remaining_gb,
            remaining_days,
            outcome,
            balance,
        })
    }

    /// Re-quotes and commits the charge, then pushes the new limits to the
    /// panel. If the panel refuses, the charge is refunded and the cached
    /// quota restored.
    pub async fn renew(
        &self,
        tg_user_id: i64,
        service_id: i64,
        product_id: i64,
    ) -> Result<RenewalReceipt, ShopError> {
        let quote = self
            .quote_renewal(tg_user_id, service_id, product_id)
            .await?;
        if !quote.affordable() {
            return Err(ShopError::InsufficientBalance {
                required: quote.price(),
                available: quote.balance,
            });
        }

        let expires_at = expiry_for(quote.outcome.final_duration_days, Utc::now());
        let record = RenewalRecord {
            service_id,
            user_id: quote.snapshot.service.user_id,
            product_id,
            method: quote.method.value(),
            previous_remaining_gb: quote.remaining_gb,
            previous_remaining_days: quote.remaining_days,
            final_data_gb: quote.outcome.final_data_gb,
            final_duration_days: quote.outcome.final_duration_days,
            reset_used: quote.outcome.reset_used,
            new_expires_at: to_unix(expires_at),
            price: quote.price(),
        };
        let Some(renewal_id) = self.db.apply_renewal(&record).await? else {
            return Err(ShopError::InsufficientBalance {
                required: quote.price(),
                available: self.current_balance(record.user_id).await?,
            });
        };

        let quota = ClientQuota {
            total_gb: quote.outcome.final_data_gb,
            expires_at,
        };
        if let Err(error) = self
            .gateway
            .apply_renewal(&quote.snapshot.panel, &quote.snapshot.service, &quota)
            .await
        {
            let previous = Service {
                used_gb: quote.snapshot.used_gb,
                status: quote.snapshot.status,
                ..quote.snapshot.service.clone()
            };
            match self
                .db
                .revert_renewal(renewal_id, &previous, record.price)
                .await
            {
                Ok(_) => tracing::warn!(
                    service_id,
                    tg_user_id,
                    error = %error,
                    "Panel refused renewal, charge refunded"
                ),
                Err(revert_error) => tracing::error!(
                    service_id,
                    tg_user_id,
                    renewal_id,
                    error = %revert_error,
                    "Failed to refund renewal after panel error"
                ),
            }
            return Err(error.into());
        }

        let balance = self.current_balance(record.user_id).await?;
        tracing::info!(
            tg_user_id,
            service_id,
            product_id,
            method = quote.method.value(),
            final_data_gb = quote.outcome.final_data_gb,
            final_duration_days = quote.outcome.final_duration_days,
            "Service renewed"
        );
        Ok(RenewalReceipt {
            quote,
            expires_at,
            balance,
        })
    }

    /// Admin removal: the panel client goes first, then the row is marked deleted.
    pub async fn delete_service(&self, service_id: i64) -> Result<Service, ShopError> {
        let service = self
            .db
            .get_service(service_id)
            .await?
            .filter(|service| service.status != ServiceStatus::Deleted)
            .ok_or(ShopError::UnknownService(service_id))?;
        let panel = self.panel(service.panel_id).await?;

        match self.gateway.remove_client(&panel, &service).await {
            Ok(()) => {}
            Err(PanelError::ClientNotFound(email)) => {
                tracing::warn!(service_id, email = %email, "Client already gone from panel");
            }
            Err(error) => return Err(error.into()),
        }
        self.db.mark_service_deleted(service_id).await?;
        tracing::info!(service_id, panel_id = panel.id, "Service deleted");
        Ok(service)
    }

    // ---- gift and discount codes ----

    /// Admin: issues a gift code worth `amount`; a code is generated when none is given.
    pub async fn create_gift_code(
        &self,
        created_by: i64,
        code: Option<&str>,
        amount: i64,
        max_uses: i64,
        valid_days: Option<i64>,
    ) -> Result<GiftCode, ShopError> {
        let code = code_or_generated(code);
        let expires_at = expiry_after_days(valid_days, Utc::now());
        let gift = self
            .db
            .create_gift_code(&code, amount, max_uses, expires_at, Some(created_by))
            .await?
            .ok_or_else(|| ShopError::CodeTaken(code.clone()))?;
        tracing::info!(code = %gift.code, amount, max_uses, created_by, "Gift code created");
        Ok(gift)
    }

    pub async fn redeem_gift_code(
        &self,
        tg_user_id: i64,
        code: &str,
    ) -> Result<GiftReceipt, ShopError> {
        let user = self.registered_user(tg_user_id).await?;
        let code = naming::clean_name(code);
        if code.is_empty() {
            return Err(ShopError::CodeRejected(CodeRejection::NotFound));
        }
        match self.db.redeem_gift_code(user.id, &code).await? {
            GiftRedemption::Credited { amount, balance } => {
                tracing::info!(tg_user_id, code = %code, amount, "Gift code redeemed");
                Ok(GiftReceipt {
                    code,
                    amount,
                    balance,
                })
            }
            GiftRedemption::Rejected(rejection) => {
                tracing::debug!(tg_user_id, code = %code, ?rejection, "Gift code refused");
                Err(ShopError::CodeRejected(rejection))
            }
        }
    }

    /// Admin: issues a public discount code.
    pub async fn create_discount_code(
        &self,
        code: Option<&str>,
        kind: DiscountKind,
        value: i64,
        max_uses: i64,
        valid_days: Option<i64>,
    ) -> Result<DiscountCode, ShopError> {
        let code = code_or_generated(code);
        let expires_at = expiry_after_days(valid_days, Utc::now());
        let discount = self
            .db
            .create_discount_code(&code, kind, value, max_uses, expires_at)
            .await?
            .ok_or_else(|| ShopError::CodeTaken(code.clone()))?;
        tracing::info!(code = %discount.code, ?kind, value, max_uses, "Discount code created");
        Ok(discount)
    }

    // ---- wheel ----

    pub async fn spin_wheel(&self, tg_user_id: i64) -> Result<SpinOutcome, ShopError> {
        let settings = &self.config.wheel;
        if !settings.enabled {
            return Err(ShopError::WheelDisabled);
        }
        let user = self.registered_user(tg_user_id).await?;
        let prize = wheel::spin(&settings.prizes, &mut rand::rng())
            .cloned()
            .unwrap_or_else(WheelPrize::nothing);
        let cooldown_secs = settings.cooldown_hours.max(0) * 3600;

        match self
            .db
            .record_spin(user.id, &prize, settings.spin_cost, cooldown_secs)
            .await?
        {
            SpinWrite::Recorded {
                balance,
                discount_code,
            } => {
                tracing::info!(
                    tg_user_id,
                    prize = prize.kind.as_str(),
                    value = prize.value,
                    "Wheel spun"
                );
                Ok(SpinOutcome {
                    prize,
                    balance,
                    discount_code,
                })
            }
            SpinWrite::CoolingDown { last_spin_at } => Err(ShopError::WheelCooldown {
                remaining_secs: last_spin_at + cooldown_secs - Utc::now().timestamp(),
            }),
            SpinWrite::InsufficientFunds => Err(ShopError::InsufficientBalance {
                required: settings.spin_cost,
                available: self.current_balance(user.id).await?,
            }),
        }
    }

    // ---- support tickets ----

    pub async fn open_ticket(&self, tg_user_id: i64, body: &str) -> Result<Ticket, ShopError> {
        let user = self.registered_user(tg_user_id).await?;
        let ticket = self
            .db
            .open_ticket(user.id, tg_user_id, &ticket_subject(body), body)
            .await?;
        tracing::info!(tg_user_id, ticket_id = ticket.id, "Ticket opened");
        Ok(ticket)
    }

    /// Follow-up from the ticket owner; reopens an answered ticket.
    pub async fn add_user_ticket_message(
        &self,
        tg_user_id: i64,
        ticket_id: i64,
        body: &str,
    ) -> Result<Ticket, ShopError> {
        let user = self.registered_user(tg_user_id).await?;
        self.db
            .get_ticket(ticket_id)
            .await?
            .filter(|ticket| ticket.user_id == user.id)
            .ok_or(ShopError::UnknownTicket(ticket_id))?;
        self.db
            .add_ticket_message(ticket_id, tg_user_id, false, body)
            .await?
            .ok_or(ShopError::TicketClosed(ticket_id))
    }

    /// Admin answer; returns the ticket and its owner's Telegram id.
    pub async fn answer_ticket(
        &self,
        admin_tg_id: i64,
        ticket_id: i64,
        body: &str,
    ) -> Result<(Ticket, i64), ShopError> {
        let ticket = self
            .db
            .add_ticket_message(ticket_id, admin_tg_id, true, body)
            .await?;
        let ticket = match ticket {
            Some(ticket) => ticket,
            None if self.db.get_ticket(ticket_id).await?.is_some() => {
                return Err(ShopError::TicketClosed(ticket_id));
            }
            None => return Err(ShopError::UnknownTicket(ticket_id)),
        };
        let owner = self.ticket_owner(&ticket).await?;
        tracing::info!(ticket_id, admin_tg_id, "Ticket answered");
        Ok((ticket, owner))
    }

    /// Returns the closed ticket and its owner's Telegram id.
    pub async fn close_ticket(&self, ticket_id: i64) -> Result<(Ticket, i64), ShopError> {
        let ticket = self
            .db
            .close_ticket(ticket_id)
            .await?
            .ok_or(ShopError::UnknownTicket(ticket_id))?;
        let owner = self.ticket_owner(&ticket).await?;
        tracing::info!(ticket_id, "Ticket closed");
        Ok((ticket, owner))
    }

    pub async fn ticket_thread(
        &self,
        ticket_id: i64,
    ) -> Result<(Ticket, Vec<TicketMessage>), ShopError> {
        let ticket = self
            .db
            .get_ticket(ticket_id)
            .await?
            .ok_or(ShopError::UnknownTicket(ticket_id))?;
        let messages = self.db.list_ticket_messages(ticket_id).await?;
        Ok((ticket, messages))
    }

    async fn ticket_owner(&self, ticket: &Ticket) -> Result<i64, ShopError> {
        self.db
            .get_user(ticket.user_id)
            .await?
            .map(|user| user.tg_user_id)
            .ok_or(ShopError::UnknownUser(ticket.user_id))
    }

    // ---- usage monitor ----

    /// Refreshes cached usage for every live service and returns the alerts
    /// now due. Alerts are recorded as sent before they are returned, so a
    /// failed delivery is not retried.
    pub async fn sync_usage(&self) -> Result<Vec<UsageAlert>, ShopError> {
        let settings = &self.config.monitor;
        let services = self.db.list_monitored_services().await?;
        let now = Utc::now();
        // `None` marks panels that are inactive or unreachable this round.
        let mut panels: HashMap<i64, Option<Panel>> = HashMap::new();
        let mut owners: HashMap<i64, i64> = HashMap::new();
        let mut alerts = Vec::new();

        for service in services {
            if !panels.contains_key(&service.panel_id) {
                let panel = self
                    .db
                    .get_panel(service.panel_id)
                    .await?
                    .filter(|panel| panel.is_active);
                panels.insert(service.panel_id, panel);
            }
            let Some(panel) = panels.get(&service.panel_id).cloned().flatten() else {
                continue;
            };

            let usage = match self.gateway.client_usage(&panel, &service).await {
                Ok(usage) => usage,
                Err(PanelError::ClientNotFound(email)) => {
                    tracing::debug!(service_id = service.id, email = %email, "Client missing on panel");
                    continue;
                }
                Err(error) => {
                    tracing::warn!(
                        panel_id = panel.id,
                        error = %error,
                        "Panel unreachable, skipping its services this round"
                    );
                    panels.insert(panel.id, None);
                    continue;
                }
            };
            let status = status_from_usage(&usage, now);
            self.db
                .update_service_usage(service.id, usage.used_gb, status)
                .await?;

            let due = monitor::due_alerts(&usage, now, settings, service.alerts_sent);
            if due.is_empty() {
                continue;
            }
            let bits = due
                .iter()
                .fold(0, |bits, alert| bits | alert.settled_bits());
            self.db.mark_alerts_sent(service.id, bits).await?;

            let tg_user_id = match owners.get(&service.user_id) {
                Some(tg_user_id) => *tg_user_id,
                None => {
                    let Some(user) = self.db.get_user(service.user_id).await? else {
                        continue;
                    };
                    owners.insert(service.user_id, user.tg_user_id);
                    user.tg_user_id
                }
            };
            for kind in due {
                alerts.push(UsageAlert {
                    tg_user_id,
                    kind,
                    service: service.clone(),
                    usage: usage.clone(),
                });
            }
        }
        Ok(alerts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::NewPanel;
    use crate::panel::ClientUsage;
    use chrono::Duration;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeGateway {
        created: Mutex<Vec<NewClient>>,
        renewed: Mutex<Vec<ClientQuota>>,
        removed: Mutex<Vec<String>>,
        usage: Mutex<Option<ClientUsage>>,
        offline: AtomicBool,
        missing_client: AtomicBool,
        fail_renewal: AtomicBool,
        /// Empties this user's wallet on the next create or usage call,
        /// standing in for a concurrent spend from another chat.
        drain: Mutex<Option<(Arc<Db>, i64)>>,
    }

    impl FakeGateway {
        fn check_online(&self) -> Result<(), PanelError> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(PanelError::Login("offline".to_string()));
            }
            Ok(())
        }

        async fn drain_wallet(&self) {
            let target = self.drain.lock().unwrap().take();
            if let Some((db, user_id)) = target {
                let balance = db.get_user(user_id).await.unwrap().unwrap().balance;
                db.deduct_balance(user_id, balance, TransactionKind::Adjustment, Some("drain"))
                    .await
                    .unwrap();
            }
        }
    }

    impl PanelGateway for FakeGateway {
        async fn create_client(&self, _panel: &Panel, new_client: &NewClient) -> Result<(), PanelError> {
            self.check_online()?;
            self.created.lock().unwrap().push(new_client.clone());
            self.drain_wallet().await;
            Ok(())
        }

        async fn client_usage(
            &self,
            _panel: &Panel,
            service: &Service,
        ) -> Result<ClientUsage, PanelError> {
            self.check_online()?;
            self.drain_wallet().await;
            self.usage
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| PanelError::ClientNotFound(service.email.clone()))
        }

        async fn apply_renewal(
            &self,
            _panel: &Panel,
            _service: &Service,
            quota: &ClientQuota,
        ) -> Result<(), PanelError> {
            self.check_online()?;
            if self.fail_renewal.load(Ordering::SeqCst) {
                return Err(PanelError::Rejected {
                    action: "update client",
                    message: "boom".to_string(),
                });
            }
            self.renewed.lock().unwrap().push(quota.clone());
            Ok(())
        }

        async fn remove_client(&self, _panel: &Panel, service: &Service) -> Result<(), PanelError> {
            self.check_online()?;
            if self.missing_client.load(Ordering::SeqCst) {
                return Err(PanelError::ClientNotFound(service.email.clone()));
            }
            self.removed.lock().unwrap().push(service.client_uuid.clone());
            Ok(())
        }
    }

    struct Fixture {
        _dir: TempDir,
        db: Arc<Db>,
        shop: Shop<FakeGateway>,
        panel: Panel,
        product: Product,
    }

    async fn fixture(raw_config: &str) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Db::open(dir.path().join("bot.db")).await.unwrap());
        let config = Arc::new(Config::parse(raw_config).unwrap());
        let panel = db
            .add_panel(&NewPanel {
                name: "nl-1",
                api_url: "https://nl.example.com",
                username: "admin",
                password: "admin",
                inbound_id: 1,
                subscription_url: Some("https://nl.example.com/sub"),
            })
            .await
            .unwrap();
        let product = db.add_product(panel.id, "20GB", 20, 30, 100_000).await.unwrap();
        let shop = Shop::new(db.clone(), FakeGateway::default(), config);
        Fixture {
            _dir: dir,
            db,
            shop,
            panel,
            product,
        }
    }

    async fn funded_user(shop: &Shop<FakeGateway>, tg_user_id: i64, amount: i64) -> i64 {
        let user = shop
            .register(tg_user_id, Some("reza"), Some("Reza"), None, None)
            .await
            .unwrap()
            .user;
        if amount > 0 {
            shop.db()
                .add_balance(user.id, amount, TransactionKind::TopUp, None)
                .await
                .unwrap();
        }
        user.id
    }

    #[tokio::test]
    async fn registration_pays_bonus_and_referral_reward() {
        let fx = fixture("admin_ids = [1]").await;
        let inviter = fx.shop.register(10, None, None, None, None).await.unwrap();
        assert_eq!(inviter.user.balance, 1000);

        let invited = fx
            .shop
            .register(11, None, None, None, Some(&inviter.user.referral_code))
            .await
            .unwrap();
        assert!(invited.is_new);
        assert_eq!(invited.referrer.as_ref().map(|u| u.balance), Some(4000));

        let again = fx.shop.register(11, None, None, None, None).await.unwrap();
        assert!(!again.is_new);
        assert_eq!(again.user.balance, 1000);
    }

    #[tokio::test]
    async fn disabled_referrals_skip_reward() {
        let fx = fixture("[referral]\nenabled = false\nwelcome_bonus = 0").await;
        let inviter = fx.shop.register(10, None, None, None, None).await.unwrap();
        assert_eq!(inviter.user.balance, 0);
        let invited = fx
            .shop
            .register(11, None, None, None, Some(&inviter.user.referral_code))
            .await
            .unwrap();
        assert!(invited.referrer.is_none());
        assert_eq!(invited.user.referred_by, None);
    }

    #[tokio::test]
    async fn purchase_without_funds_touches_nothing() {
        let fx = fixture("[referral]\nwelcome_bonus = 0").await;
        funded_user(&fx.shop, 20, 50_000).await;

        let err = fx.shop.purchase(20, fx.product.id, None, None).await.unwrap_err();
        assert!(matches!(
            err,
            ShopError::InsufficientBalance {
                required: 100_000,
                available: 50_000
            }
        ));
        assert!(fx.shop.gateway.created.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn purchase_creates_client_and_service() {
        let fx = fixture("[referral]\nwelcome_bonus = 0\n[naming]\nmethod = 7").await;
        let user_id = funded_user(&fx.shop, 5551234, 120_000).await;

        let purchase = fx.shop.purchase(5551234, fx.product.id, None, None).await.unwrap();
        assert_eq!(purchase.balance, 20_000);
        assert_eq!(purchase.service.user_id, user_id);
        assert_eq!(purchase.service.client_name, "12340001");
        assert_eq!(
            purchase.subscription_link,
            Some(format!("https://nl.example.com/sub/{}", purchase.service.sub_id))
        );

        let created = fx.shop.gateway.created.lock().unwrap().clone();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].total_gb, 20.0);
        assert_eq!(created[0].uuid, purchase.service.client_uuid);
        assert!(created[0].expires_at.is_some());

        let second = fx.shop.purchase(5551234, fx.product.id, None, None).await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn unknown_user_cannot_buy() {
        let fx = fixture("").await;
        let err = fx.shop.purchase(99, fx.product.id, None, None).await.unwrap_err();
        assert!(matches!(err, ShopError::UnknownUser(99)));
    }

    #[tokio::test]
    async fn status_falls_back_to_cached_values() {
        let fx = fixture("[referral]\nwelcome_bonus = 0").await;
        funded_user(&fx.shop, 30, 100_000).await;
        let purchase = fx.shop.purchase(30, fx.product.id, None, None).await.unwrap();

        *fx.shop.gateway.usage.lock().unwrap() = Some(ClientUsage {
            used_gb: 4.0,
            total_gb: 20.0,
            expires_at: Some(Utc::now() + Duration::days(12) + Duration::hours(1)),
            enabled: true,
        });
        let live = fx.shop.service_status(30, purchase.service.id).await.unwrap();
        assert!(live.live);
        assert_eq!(live.remaining_gb(), 16.0);
        assert_eq!(live.remaining_days(Utc::now()), 12);

        fx.shop.gateway.offline.store(true, Ordering::SeqCst);
        let cached = fx.shop.service_status(30, purchase.service.id).await.unwrap();
        assert!(!cached.live);
        assert_eq!(cached.used_gb, 4.0);
        assert_eq!(cached.total_gb, 20.0);

        let err = fx.shop.service_status(31, purchase.service.id).await.unwrap_err();
        assert!(matches!(err, ShopError::UnknownUser(31)));
    }

    #[tokio::test]
    async fn renewal_uses_configured_method() {
        let fx = fixture("[referral]\nwelcome_bonus = 0").await;
        funded_user(&fx.shop, 40, 200_000).await;
        let purchase = fx.shop.purchase(40, fx.product.id, None, None).await.unwrap();
        *fx.shop.gateway.usage.lock().unwrap() = Some(ClientUsage {
            used_gb: 15.0,
            total_gb: 20.0,
            expires_at: Some(Utc::now() + Duration::days(5) + Duration::hours(1)),
            enabled: true,
        });

        assert_eq!(fx.shop.renewal_method().await.unwrap(), RenewalMethod::FullReset);
        fx.shop
            .set_renewal_method(RenewalMethod::AddToRemaining)
            .await
            .unwrap();

        let quote = fx
            .shop
            .quote_renewal(40, purchase.service.id, fx.product.id)
            .await
            .unwrap();
        assert_eq!(quote.method, RenewalMethod::AddToRemaining);
        assert_eq!(quote.remaining_gb, 5.0);
        assert_eq!(quote.remaining_days, 5);
        assert_eq!(quote.outcome.final_data_gb, 25.0);
        assert_eq!(quote.outcome.final_duration_days, 35);
        assert!(quote.affordable());

        let receipt = fx
            .shop
            .renew(40, purchase.service.id, fx.product.id)
            .await
            .unwrap();
        assert_eq!(receipt.balance, 0);
        let renewed = fx.shop.gateway.renewed.lock().unwrap().clone();
        assert_eq!(renewed.len(), 1);
        assert_eq!(renewed[0].total_gb, 25.0);

        let service = fx.shop.db().get_service(purchase.service.id).await.unwrap().unwrap();
        assert_eq!(service.total_gb, 25.0);
        assert_eq!(fx.shop.db().count_renewals(service.id).await.unwrap(), 1);

        let err = fx
            .shop
            .renew(40, purchase.service.id, fx.product.id)
            .await
            .unwrap_err();
        assert!(matches!(err, ShopError::InsufficientBalance { .. }));
        assert_eq!(fx.shop.gateway.renewed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn renewal_rejects_product_from_other_panel() {
        let fx = fixture("[referral]\nwelcome_bonus = 0").await;
        funded_user(&fx.shop, 50, 100_000).await;
        let purchase = fx.shop.purchase(50, fx.product.id, None, None).await.unwrap();

        let other = fx
            .shop
            .db()
            .add_panel(&NewPanel {
                name: "fi-1",
                api_url: "https://fi.example.com",
                username: "admin",
                password: "admin",
                inbound_id: 2,
                subscription_url: None,
            })
            .await
            .unwrap();
        let foreign = fx.shop.db().add_product(other.id, "50GB", 50, 30, 1).await.unwrap();

        let err = fx
            .shop
            .quote_renewal(50, purchase.service.id, foreign.id)
            .await
            .unwrap_err();
        assert!(matches!(err, ShopError::ProductPanelMismatch { .. }));
        assert_eq!(fx.panel.id, purchase.panel.id);
    }

    #[tokio::test]
    async fn delete_removes_client_and_hides_service() {
        let fx = fixture("[referral]\nwelcome_bonus = 0").await;
        funded_user(&fx.shop, 60, 100_000).await;
        let purchase = fx.shop.purchase(60, fx.product.id, None, None).await.unwrap();

        let deleted = fx.shop.delete_service(purchase.service.id).await.unwrap();
        assert_eq!(
            fx.shop.gateway.removed.lock().unwrap().as_slice(),
            [deleted.client_uuid.clone()]
        );
        assert!(matches!(
            fx.shop.service_status(60, purchase.service.id).await,
            Err(ShopError::UnknownService(_))
        ));
        assert!(matches!(
            fx.shop.delete_service(purchase.service.id).await,
            Err(ShopError::UnknownService(_))
        ));
    }

    fn usage(used_gb: f64, total_gb: f64, days_left: i64) -> ClientUsage {
        ClientUsage {
            used_gb,
            total_gb,
            expires_at: Some(Utc::now() + Duration::days(days_left) + Duration::hours(1)),
            enabled: true,
        }
    }

    #[tokio::test]
    async fn declined_charge_removes_the_new_client() {
        let fx = fixture("[referral]\nwelcome_bonus = 0").await;
        let user_id = funded_user(&fx.shop, 70, 100_000).await;
        *fx.shop.gateway.drain.lock().unwrap() = Some((fx.db.clone(), user_id));

        let err = fx.shop.purchase(70, fx.product.id, None, None).await.unwrap_err();
        assert!(matches!(
            err,
            ShopError::InsufficientBalance {
                required: 100_000,
                available: 0
            }
        ));
        let created = fx.shop.gateway.created.lock().unwrap().clone();
        assert_eq!(created.len(), 1);
        assert_eq!(
            fx.shop.gateway.removed.lock().unwrap().as_slice(),
            [created[0].uuid.clone()]
        );
        assert_eq!(fx.db.count_user_services(user_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn delete_tolerates_client_missing_on_panel() {
        let fx = fixture("[referral]\nwelcome_bonus = 0").await;
        let user_id = funded_user(&fx.shop, 61, 100_000).await;
        let purchase = fx.shop.purchase(61, fx.product.id, None, None).await.unwrap();

        fx.shop.gateway.missing_client.store(true, Ordering::SeqCst);
        fx.shop.delete_service(purchase.service.id).await.unwrap();
        assert!(fx.shop.gateway.removed.lock().unwrap().is_empty());
        let service = fx.db.get_service(purchase.service.id).await.unwrap().unwrap();
        assert_eq!(service.status, ServiceStatus::Deleted);
        assert_eq!(fx.db.count_user_services(user_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn renewal_refused_by_panel_is_refunded() {
        let fx = fixture("[referral]\nwelcome_bonus = 0").await;
        let user_id = funded_user(&fx.shop, 41, 200_000).await;
        let purchase = fx.shop.purchase(41, fx.product.id, None, None).await.unwrap();
        *fx.shop.gateway.usage.lock().unwrap() = Some(usage(15.0, 20.0, 5));
        fx.shop.gateway.fail_renewal.store(true, Ordering::SeqCst);

        let err = fx
            .shop
            .renew(41, purchase.service.id, fx.product.id)
            .await
            .unwrap_err();
        assert!(matches!(err, ShopError::Panel(PanelError::Rejected { .. })));

        let user = fx.db.get_user(user_id).await.unwrap().unwrap();
        assert_eq!(user.balance, 100_000);
        assert_eq!(user.total_spent, 100_000);
        let service = fx.db.get_service(purchase.service.id).await.unwrap().unwrap();
        assert_eq!(service.total_gb, 20.0);
        assert_eq!(service.used_gb, 15.0);
        assert_eq!(service.expires_at, purchase.service.expires_at);
        assert_eq!(fx.db.count_renewals(service.id).await.unwrap(), 0);
        assert_eq!(fx.db.list_transactions(user_id, 1).await.unwrap()[0].kind, "refund");
    }

    #[tokio::test]
    async fn renewal_with_drained_wallet_never_reaches_panel() {
        let fx = fixture("[referral]\nwelcome_bonus = 0").await;
        let user_id = funded_user(&fx.shop, 42, 200_000).await;
        let purchase = fx.shop.purchase(42, fx.product.id, None, None).await.unwrap();
        *fx.shop.gateway.usage.lock().unwrap() = Some(usage(15.0, 20.0, 5));
        *fx.shop.gateway.drain.lock().unwrap() = Some((fx.db.clone(), user_id));

        let err = fx
            .shop
            .renew(42, purchase.service.id, fx.product.id)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ShopError::InsufficientBalance {
                required: 100_000,
                available: 0
            }
        ));
        assert!(fx.shop.gateway.renewed.lock().unwrap().is_empty());
        assert_eq!(fx.db.count_renewals(purchase.service.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn discount_code_lowers_the_price_once() {
        let fx = fixture("[referral]\nwelcome_bonus = 0").await;
        let user_id = funded_user(&fx.shop, 80, 200_000).await;
        let code = fx
            .shop
            .create_discount_code(Some("spring-20"), DiscountKind::Percent, 20, 0, Some(30))
            .await
            .unwrap();
        assert_eq!(code.code, "SPRING20");
        assert!(code.expires_at.is_some());

        let quote = fx
            .shop
            .quote_purchase(80, fx.product.id, Some("spring20"))
            .await
            .unwrap();
        assert_eq!(quote.discount_amount, 20_000);
        assert_eq!(quote.price(), 80_000);

        let purchase = fx
            .shop
            .purchase(80, fx.product.id, None, Some("spring20"))
            .await
            .unwrap();
        assert_eq!(purchase.price, 80_000);
        assert_eq!(purchase.discount_code.as_deref(), Some("SPRING20"));
        assert_eq!(purchase.balance, 120_000);
        assert_eq!(fx.db.get_user(user_id).await.unwrap().unwrap().total_spent, 80_000);

        let again = fx
            .shop
            .purchase(80, fx.product.id, None, Some("SPRING20"))
            .await
            .unwrap_err();
        assert!(matches!(again, ShopError::CodeRejected(CodeRejection::AlreadyUsed)));
        assert!(matches!(
            fx.shop.quote_purchase(80, fx.product.id, Some("missing")).await,
            Err(ShopError::CodeRejected(CodeRejection::NotFound))
        ));
        assert_eq!(fx.shop.gateway.created.lock().unwrap().len(), 1);
        assert!(matches!(
            fx.shop
                .create_discount_code(Some("SPRING20"), DiscountKind::Fixed, 1, 0, None)
                .await,
            Err(ShopError::CodeTaken(_))
        ));
    }

    #[tokio::test]
    async fn gift_codes_are_redeemed_once() {
        let fx = fixture("[referral]\nwelcome_bonus = 0").await;
        funded_user(&fx.shop, 90, 0).await;
        funded_user(&fx.shop, 91, 0).await;
        let gift = fx
            .shop
            .create_gift_code(1, None, 15_000, 1, Some(7))
            .await
            .unwrap();
        assert_eq!(gift.code.len(), 10);

        let receipt = fx
            .shop
            .redeem_gift_code(90, &gift.code.to_lowercase())
            .await
            .unwrap();
        assert_eq!(receipt.amount, 15_000);
        assert_eq!(receipt.balance, 15_000);
        assert!(matches!(
            fx.shop.redeem_gift_code(90, &gift.code).await,
            Err(ShopError::CodeRejected(CodeRejection::AlreadyUsed))
        ));
        assert!(matches!(
            fx.shop.redeem_gift_code(91, &gift.code).await,
            Err(ShopError::CodeRejected(CodeRejection::Exhausted))
        ));
        assert!(matches!(
            fx.shop.redeem_gift_code(91, "  ").await,
            Err(ShopError::CodeRejected(CodeRejection::NotFound))
        ));
        assert!(matches!(
            fx.shop.redeem_gift_code(99, &gift.code).await,
            Err(ShopError::UnknownUser(99))
        ));
    }

    #[tokio::test]
    async fn wheel_pays_out_then_cools_down() {
        let raw = r#"
            [referral]
            welcome_bonus = 0

            [[wheel.prizes]]
            kind = "balance"
            value = 7000
            weight = 1
            label = "7000"
        "#;
        let fx = fixture(raw).await;
        funded_user(&fx.shop, 95, 0).await;

        let outcome = fx.shop.spin_wheel(95).await.unwrap();
        assert_eq!(outcome.prize.value, 7000);
        assert_eq!(outcome.balance, 7000);
        assert!(outcome.discount_code.is_none());

        match fx.shop.spin_wheel(95).await.unwrap_err() {
            ShopError::WheelCooldown { remaining_secs } => {
                assert!(remaining_secs > 23 * 3600 && remaining_secs <= 24 * 3600);
            }
            other => panic!("unexpected {:?}", other),
        }

        let off = fixture("[wheel]\nenabled = false").await;
        assert!(matches!(off.shop.spin_wheel(95).await, Err(ShopError::WheelDisabled)));
    }

    #[tokio::test]
    async fn tickets_reach_admin_and_back() {
        let fx = fixture("[referral]\nwelcome_bonus = 0").await;
        funded_user(&fx.shop, 120, 0).await;
        funded_user(&fx.shop, 121, 0).await;

        let ticket = fx
            .shop
            .open_ticket(120, "VPN is slow tonight\nsince 9pm")
            .await
            .unwrap();
        assert_eq!(ticket.subject, "VPN is slow tonight");

        let (answered, owner) = fx.shop.answer_ticket(1, ticket.id, "checking").await.unwrap();
        assert_eq!(owner, 120);
        assert_eq!(answered.status, crate::db::TicketStatus::Answered);

        assert!(matches!(
            fx.shop.add_user_ticket_message(121, ticket.id, "me too").await,
            Err(ShopError::UnknownTicket(_))
        ));
        fx.shop
            .add_user_ticket_message(120, ticket.id, "thanks")
            .await
            .unwrap();

        let (_, owner) = fx.shop.close_ticket(ticket.id).await.unwrap();
        assert_eq!(owner, 120);
        assert!(matches!(
            fx.shop.answer_ticket(1, ticket.id, "late").await,
            Err(ShopError::TicketClosed(_))
        ));
        assert!(matches!(
            fx.shop.answer_ticket(1, 404, "nobody").await,
            Err(ShopError::UnknownTicket(404))
        ));
        let (_, thread) = fx.shop.ticket_thread(ticket.id).await.unwrap();
        assert_eq!(thread.len(), 3);
    }

    #[tokio::test]
    async fn usage_sync_alerts_once_per_threshold() {
        let fx = fixture("[referral]\nwelcome_bonus = 0").await;
        funded_user(&fx.shop, 130, 100_000).await;
        let purchase = fx.shop.purchase(130, fx.product.id, None, None).await.unwrap();

        *fx.shop.gateway.usage.lock().unwrap() = Some(usage(15.0, 20.0, 20));
        let alerts = fx.shop.sync_usage().await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].tg_user_id, 130);
        assert_eq!(alerts[0].kind, AlertKind::UsageWarning);
        assert!(fx.shop.sync_usage().await.unwrap().is_empty());
        let cached = fx.db.get_service(purchase.service.id).await.unwrap().unwrap();
        assert_eq!(cached.used_gb, 15.0);

        *fx.shop.gateway.usage.lock().unwrap() = Some(usage(20.0, 20.0, 20));
        let alerts = fx.shop.sync_usage().await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::DataExhausted);
        let cached = fx.db.get_service(purchase.service.id).await.unwrap().unwrap();
        assert_eq!(cached.status, ServiceStatus::Expired);

        fx.shop.gateway.offline.store(true, Ordering::SeqCst);
        assert!(fx.shop.sync_usage().await.unwrap().is_empty());
    }

    #[test]
    fn panel_rejection_has_its_own_message() {
        let rejected = ShopError::Panel(PanelError::Rejected {
            action: "add client",
            message: "Duplicate email".to_string(),
        });
        let unreachable = ShopError::Panel(PanelError::Login("timeout".to_string()));
        assert!(rejected.user_message().contains("نام دیگری"));
        assert_ne!(rejected.user_message(), unreachable.user_message());
    }

    #[test]
    fn ticket_subject_uses_first_line() {
        assert_eq!(ticket_subject("\n  hello  \nworld"), "hello");
        assert_eq!(ticket_subject(""), "-");
        let long = "a".repeat(60);
        assert_eq!(ticket_subject(&long).chars().count(), 41);
    }

    #[test]
    fn insufficient_balance_message_shows_amounts() {
        let err = ShopError::InsufficientBalance {
            required: 150_000,
            available: 20_000,
        };
        let text = err.user_message();
        assert!(text.contains("150,000"));
        assert!(text.contains("20,000"));
    }
}
