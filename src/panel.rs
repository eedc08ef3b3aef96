//! 3x-ui panel API client and the gateway the shop talks to.

use crate::config::PanelConfig;
use crate::db::{Panel, Service};
use chrono::{DateTime, Utc};
use rand::distr::{Alphanumeric, SampleString};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::Mutex;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Error)]
pub enum PanelError {
    #[error("panel request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("panel login rejected: {0}")]
    Login(String),
    #[error("panel rejected {action}: {message}")]
    Rejected {
        action: &'static str,
        message: String,
    },
    #[error("inbound {0} not found on panel")]
    InboundNotFound(i64),
    #[error("client {0} not found on panel")]
    ClientNotFound(String),
    #[error("unexpected panel payload: {0}")]
    Payload(String),
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(default)]
    msg: String,
    obj: Option<T>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Inbound {
    pub id: i64,
    #[serde(default)]
    pub remark: String,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub port: i64,
    #[serde(default)]
    pub enable: bool,
    /// JSON document encoded as a string, holds the `clients` array.
    #[serde(default)]
    pub settings: String,
}

impl Inbound {
    pub fn clients(&self) -> Result<Vec<XuiClientEntry>, PanelError> {
        #[derive(Deserialize)]
        struct Settings {
            #[serde(default)]
            clients: Vec<XuiClientEntry>,
        }
        if self.settings.trim().is_empty() {
            return Ok(Vec::new());
        }
        let settings: Settings = serde_json::from_str(&self.settings)
            .map_err(|e| PanelError::Payload(format!("inbound {} settings: {}", self.id, e)))?;
        Ok(settings.clients)
    }

    /// Looks a client up by the key this inbound's protocol uses, see [`client_key`].
    pub fn find_client(&self, key: &str) -> Result<XuiClientEntry, PanelError> {
        self.clients()?
            .into_iter()
            .find(|client| client_key(&self.protocol, client) == key)
            .ok_or_else(|| PanelError::ClientNotFound(key.to_string()))
    }
}

/// One client inside an inbound's settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct XuiClientEntry {
    /// Only vless and vmess clients carry one.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub email: String,
    #[serde(default = "default_true")]
    pub enable: bool,
    /// Epoch milliseconds, 0 for no expiry.
    #[serde(default)]
    pub expiry_time: i64,
    #[serde(default)]
    pub flow: String,
    #[serde(default)]
    pub limit_ip: i64,
    /// Bytes, 0 for unlimited.
    #[serde(default, rename = "totalGB")]
    pub total_gb: i64,
    #[serde(default)]
    pub sub_id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub tg_id: String,
    #[serde(default)]
    pub reset: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

fn default_true() -> bool {
    true
}

/// `tgId` is stored as either a number or a string depending on the panel version.
fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    })
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientTraffic {
    #[serde(default)]
    pub inbound_id: i64,
    #[serde(default)]
    pub enable: bool,
    pub email: String,
    #[serde(default)]
    pub up: i64,
    #[serde(default)]
    pub down: i64,
    #[serde(default)]
    pub expiry_time: i64,
    #[serde(default)]
    pub total: i64,
}

pub fn gb_to_bytes(gb: f64) -> i64 {
    (gb.max(0.0) * BYTES_PER_GB).round() as i64
}

pub fn bytes_to_gb(bytes: i64) -> f64 {
    bytes.max(0) as f64 / BYTES_PER_GB
}

/// `expiryTime` value for a client; 0 (never) when there is no expiry.
pub fn expiry_ms(expires_at: Option<DateTime<Utc>>) -> i64 {
    expires_at.map(|at| at.timestamp_millis()).unwrap_or(0)
}

/// Negative values mean "starts on first use" and zero means unlimited; neither has a date.
pub fn expiry_from_ms(ms: i64) -> Option<DateTime<Utc>> {
    if ms <= 0 {
        return None;
    }
    DateTime::from_timestamp_millis(ms)
}

fn client_payload(inbound_id: i64, client: &XuiClientEntry) -> serde_json::Value {
    json!({
        "id": inbound_id,
        "settings": json!({ "clients": [client] }).to_string(),
    })
}

/// The identifier 3x-ui matches a client on in `updateClient` and `delClient`:
/// trojan clients by password, shadowsocks clients by email, the rest by id.
pub fn client_key<'a>(protocol: &str, client: &'a XuiClientEntry) -> &'a str {
    match protocol {
        "trojan" => client.password.as_deref().unwrap_or_default(),
        "shadowsocks" => &client.email,
        _ => &client.id,
    }
}

/// Key of a client this bot created; trojan passwords are the service uuid.
pub fn service_client_key<'a>(protocol: &str, service: &'a Service) -> &'a str {
    match protocol {
        "shadowsocks" => &service.email,
        _ => &service.client_uuid,
    }
}

/// Builds the panel entry for a new service on an inbound of `protocol`.
pub fn new_client_entry(protocol: &str, new_client: &NewClient) -> XuiClientEntry {
    let password = match protocol {
        "trojan" => Some(new_client.uuid.clone()),
        "shadowsocks" => Some(Alphanumeric.sample_string(&mut rand::rng(), 16)),
        _ => None,
    };
    XuiClientEntry {
        id: new_client.uuid.clone(),
        email: new_client.email.clone(),
        enable: true,
        expiry_time: expiry_ms(new_client.expires_at),
        flow: String::new(),
        limit_ip: 0,
        total_gb: gb_to_bytes(new_client.total_gb),
        sub_id: new_client.sub_id.clone(),
        tg_id: new_client.tg_user_id.to_string(),
        reset: 0,
        password,
    }
}

pub struct XuiClient {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    logged_in: AtomicBool,
}

impl XuiClient {
    pub fn new(
        base_url: &str,
        username: &str,
        password: &str,
        settings: &PanelConfig,
    ) -> Result<Self, PanelError> {
        let http = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(std::time::Duration::from_secs(settings.request_timeout_secs))
            .danger_accept_invalid_certs(settings.accept_invalid_certs)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
            logged_in: AtomicBool::new(false),
        })
    }

    pub async fn login(&self) -> Result<(), PanelError> {
        let response = self
            .http
            .post(format!("{}/login", self.base_url))
            .form(&[
                ("username", self.username.as_str()),
                ("password", self.password.as_str()),
            ])
            .send()
            .await
            .map_err(|e| {
                tracing::error!(base_url = %self.base_url, error = %e, "Failed to reach panel for login");
                e
            })?;

        let body: ApiResponse<serde_json::Value> = response.json().await?;
        if !body.success {
            tracing::error!(base_url = %self.base_url, msg = %body.msg, "Panel login rejected");
            return Err(PanelError::Login(body.msg));
        }
        self.logged_in.store(true, Ordering::Release);
        tracing::info!(base_url = %self.base_url, "Logged in to panel");
        Ok(())
    }

    /// Sends an authenticated request, logging in again once if the session expired.
    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
        action: &'static str,
    ) -> Result<Option<T>, PanelError> {
        for attempt in 0..2 {
            if !self.logged_in.load(Ordering::Acquire) {
                self.login().await?;
            }

            let mut request = self
                .http
                .request(method.clone(), format!("{}{}", self.base_url, path));
            if let Some(body) = body {
                request = request.json(body);
            }
            let response = request.send().await?;

            let status = response.status();
            if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::NOT_FOUND) && attempt == 0 {
                tracing::warn!(path, %status, "Panel session expired, logging in again");
                self.logged_in.store(false, Ordering::Release);
                continue;
            }
            if !status.is_success() {
                return Err(PanelError::Rejected {
                    action,
                    message: format!("HTTP {}", status),
                });
            }

            let body: ApiResponse<T> = response
                .json()
                .await
                .map_err(|e| PanelError::Payload(format!("{}: {}", action, e)))?;
            if !body.success {
                return Err(PanelError::Rejected {
                    action,
                    message: body.msg,
                });
            }
            return Ok(body.obj);
        }

        Err(PanelError::Login("session could not be re-established".to_string()))
    }

    pub async fn list_inbounds(&self) -> Result<Vec<Inbound>, PanelError> {
        let inbounds = self
            .call::<Vec<Inbound>>(Method::GET, "/panel/api/inbounds/list", None, "list inbounds")
            .await?;
        Ok(inbounds.unwrap_or_default())
    }

    pub async fn get_inbound(&self, inbound_id: i64) -> Result<Inbound, PanelError> {
        self.call::<Inbound>(
            Method::GET,
            &format!("/panel/api/inbounds/get/{}", inbound_id),
            None,
            "get inbound",
        )
        .await?
        .ok_or(PanelError::InboundNotFound(inbound_id))
    }

    pub async fn add_client(
        &self,
        inbound_id: i64,
        client: &XuiClientEntry,
    ) -> Result<(), PanelError> {
        let payload = client_payload(inbound_id, client);
        self.call::<serde_json::Value>(
            Method::POST,
            "/panel/api/inbounds/addClient",
            Some(&payload),
            "add client",
        )
        .await?;
        Ok(())
    }

    /// `key` is the client's current [`client_key`].
    pub async fn update_client(
        &self,
        inbound_id: i64,
        key: &str,
        client: &XuiClientEntry,
    ) -> Result<(), PanelError> {
        let payload = client_payload(inbound_id, client);
        self.call::<serde_json::Value>(
            Method::POST,
            &format!(
                "/panel/api/inbounds/updateClient/{}",
                urlencoding::encode(key)
            ),
            Some(&payload),
            "update client",
        )
        .await?;
        Ok(())
    }

    pub async fn reset_client_traffic(&self, inbound_id: i64, email: &str) -> Result<(), PanelError> {
        self.call::<serde_json::Value>(
            Method::POST,
            &format!(
                "/panel/api/inbounds/{}/resetClientTraffic/{}",
                inbound_id,
                urlencoding::encode(email)
            ),
            None,
            "reset client traffic",
        )
        .await?;
        Ok(())
    }

    pub async fn delete_client(&self, inbound_id: i64, key: &str) -> Result<(), PanelError> {
        self.call::<serde_json::Value>(
            Method::POST,
            &format!(
                "/panel/api/inbounds/{}/delClient/{}",
                inbound_id,
                urlencoding::encode(key)
            ),
            None,
            "delete client",
        )
        .await?;
        Ok(())
    }

    pub async fn client_traffic(&self, email: &str) -> Result<Option<ClientTraffic>, PanelError> {
        self.call::<ClientTraffic>(
            Method::GET,
            &format!(
                "/panel/api/inbounds/getClientTraffics/{}",
                urlencoding::encode(email)
            ),
            None,
            "client traffic",
        )
        .await
    }
}

/// Client to create for a purchased service.
#[derive(Debug, Clone)]
pub struct NewClient {
    pub inbound_id: i64,
    pub email: String,
    pub uuid: String,
    pub sub_id: String,
    pub total_gb: f64,
    pub expires_at: Option<DateTime<Utc>>,
    pub tg_user_id: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientUsage {
    pub used_gb: f64,
    /// 0 when the client has no data limit.
    pub total_gb: f64,
    pub expires_at: Option<DateTime<Utc>>,
    pub enabled: bool,
}

impl ClientUsage {
    pub fn remaining_gb(&self) -> f64 {
        if self.total_gb <= 0.0 {
            return 0.0;
        }
        (self.total_gb - self.used_gb).max(0.0)
    }

    /// Share of the data limit already used, `None` for unlimited clients.
    pub fn used_percent(&self) -> Option<f64> {
        (self.total_gb > 0.0).then(|| self.used_gb / self.total_gb * 100.0)
    }
}

impl From<ClientTraffic> for ClientUsage {
    fn from(traffic: ClientTraffic) -> Self {
        Self {
            used_gb: bytes_to_gb(traffic.up + traffic.down),
            total_gb: bytes_to_gb(traffic.total),
            expires_at: expiry_from_ms(traffic.expiry_time),
            enabled: traffic.enable,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientQuota {
    pub total_gb: f64,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Everything the shop needs from a VPN panel.
pub trait PanelGateway: Send + Sync {
    fn create_client(
        &self,
        panel: &Panel,
        new_client: &NewClient,
    ) -> impl Future<Output = Result<(), PanelError>> + Send;

    fn client_usage(
        &self,
        panel: &Panel,
        service: &Service,
    ) -> impl Future<Output = Result<ClientUsage, PanelError>> + Send;

    /// Replaces the client's quota and clears its traffic counters.
    fn apply_renewal(
        &self,
        panel: &Panel,
        service: &Service,
        quota: &ClientQuota,
    ) -> impl Future<Output = Result<(), PanelError>> + Send;

    fn remove_client(
        &self,
        panel: &Panel,
        service: &Service,
    ) -> impl Future<Output = Result<(), PanelError>> + Send;
}

/// [`PanelGateway`] backed by 3x-ui, with one logged-in client per panel.
pub struct XuiGateway {
    settings: PanelConfig,
    clients: Mutex<HashMap<i64, Arc<XuiClient>>>,
}

impl XuiGateway {
    pub fn new(settings: PanelConfig) -> Self {
        Self {
            settings,
            clients: Mutex::new(HashMap::new()),
        }
    }

    async fn client_for(&self, panel: &Panel) -> Result<Arc<XuiClient>, PanelError> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(&panel.id) {
            return Ok(client.clone());
        }
        let client = Arc::new(XuiClient::new(
            &panel.api_url,
            &panel.username,
            &panel.password,
            &self.settings,
        )?);
        clients.insert(panel.id, client.clone());
        Ok(client)
    }
}

impl PanelGateway for XuiGateway {
    async fn create_client(&self, panel: &Panel, new_client: &NewClient) -> Result<(), PanelError> {
        let client = self.client_for(panel).await?;
        let inbound = client.get_inbound(new_client.inbound_id).await?;
        let entry = new_client_entry(&inbound.protocol, new_client);
        client.add_client(new_client.inbound_id, &entry).await?;
        tracing::info!(
            panel_id = panel.id,
            inbound_id = new_client.inbound_id,
            email = %new_client.email,
            protocol = %inbound.protocol,
            "Created panel client"
        );
        Ok(())
    }

    async fn client_usage(&self, panel: &Panel, service: &Service) -> Result<ClientUsage, PanelError> {
        let client = self.client_for(panel).await?;
        let traffic = client
            .client_traffic(&service.email)
            .await?
            .ok_or_else(|| PanelError::ClientNotFound(service.email.clone()))?;
        Ok(traffic.into())
    }

    async fn apply_renewal(
        &self,
        panel: &Panel,
        service: &Service,
        quota: &ClientQuota,
    ) -> Result<(), PanelError> {
        let client = self.client_for(panel).await?;
        let inbound = client.get_inbound(service.inbound_id).await?;
        let key = service_client_key(&inbound.protocol, service);
        let mut entry = inbound.find_client(key)?;
        entry.total_gb = gb_to_bytes(quota.total_gb);
        entry.expiry_time = expiry_ms(quota.expires_at);
        entry.enable = true;
        client.update_client(service.inbound_id, key, &entry).await?;
        client
            .reset_client_traffic(service.inbound_id, &entry.email)
            .await?;
        tracing::info!(
            panel_id = panel.id,
            service_id = service.id,
            total_gb = quota.total_gb,
            "Applied renewal on panel"
        );
        Ok(())
    }

    async fn remove_client(&self, panel: &Panel, service: &Service) -> Result<(), PanelError> {
        let client = self.client_for(panel).await?;
        let inbound = client.get_inbound(service.inbound_id).await?;
        let key = service_client_key(&inbound.protocol, service);
        inbound.find_client(key)?;
        client.delete_client(service.inbound_id, key).await?;
        tracing::info!(panel_id = panel.id, service_id = service.id, "Removed panel client");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn gigabytes_and_bytes() {
        assert_eq!(gb_to_bytes(1.0), 1_073_741_824);
        assert_eq!(gb_to_bytes(0.5), 536_870_912);
        assert_eq!(gb_to_bytes(-3.0), 0);
        assert_eq!(bytes_to_gb(32_212_254_720), 30.0);
        assert_eq!(bytes_to_gb(-1), 0.0);
    }

    #[test]
    fn expiry_conversions() {
        let at = Utc.with_ymd_and_hms(2025, 1, 31, 0, 0, 0).unwrap();
        let ms = expiry_ms(Some(at));
        assert_eq!(ms, 1_738_281_600_000);
        assert_eq!(expiry_from_ms(ms), Some(at));
        assert_eq!(expiry_ms(None), 0);
        assert_eq!(expiry_from_ms(0), None);
        assert_eq!(expiry_from_ms(-86_400_000), None);
    }

    #[test]
    fn inbound_settings_are_parsed() {
        let raw = r#"{
            "success": true,
            "msg": "",
            "obj": {
                "id": 3,
                "remark": "DE-vless",
                "protocol": "vless",
                "port": 443,
                "enable": true,
                "settings": "{\"clients\":[{\"id\":\"u-1\",\"email\":\"ABCD\",\"enable\":true,\"expiryTime\":0,\"totalGB\":1073741824,\"subId\":\"s1\",\"tgId\":12345,\"limitIp\":0,\"flow\":\"\",\"reset\":0}],\"decryption\":\"none\"}"
            }
        }"#;
        let response: ApiResponse<Inbound> = serde_json::from_str(raw).unwrap();
        assert!(response.success);
        let inbound = response.obj.unwrap();
        assert_eq!(inbound.protocol, "vless");
        let clients = inbound.clients().unwrap();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].email, "ABCD");
        assert_eq!(clients[0].total_gb, 1_073_741_824);
        assert_eq!(clients[0].tg_id, "12345");
        assert_eq!(clients[0].password, None);
    }

    #[test]
    fn empty_settings_have_no_clients() {
        let inbound = Inbound {
            id: 1,
            remark: String::new(),
            protocol: "vmess".to_string(),
            port: 0,
            enable: true,
            settings: String::new(),
        };
        assert!(inbound.clients().unwrap().is_empty());

        let broken = Inbound {
            settings: "{".to_string(),
            ..inbound
        };
        assert!(matches!(broken.clients(), Err(PanelError::Payload(_))));
    }

    #[test]
    fn client_payload_nests_settings_as_string() {
        let entry = XuiClientEntry {
            id: "u-1".to_string(),
            email: "ABCD".to_string(),
            enable: true,
            expiry_time: 1_700_000_000_000,
            flow: String::new(),
            limit_ip: 0,
            total_gb: gb_to_bytes(10.0),
            sub_id: "s1".to_string(),
            tg_id: "42".to_string(),
            reset: 0,
            password: Some("pw".to_string()),
        };
        let payload = client_payload(7, &entry);
        assert_eq!(payload["id"], 7);
        let settings: serde_json::Value =
            serde_json::from_str(payload["settings"].as_str().unwrap()).unwrap();
        let client = &settings["clients"][0];
        assert_eq!(client["totalGB"], 10_737_418_240_i64);
        assert_eq!(client["expiryTime"], 1_700_000_000_000_i64);
        assert_eq!(client["subId"], "s1");
        assert_eq!(client["password"], "pw");
    }

    #[test]
    fn traffic_maps_to_usage() {
        let raw = r#"{"success":true,"msg":"","obj":{"id":9,"inboundId":3,"enable":true,"email":"ABCD","up":1073741824,"down":2147483648,"expiryTime":1738281600000,"total":10737418240}}"#;
        let response: ApiResponse<ClientTraffic> = serde_json::from_str(raw).unwrap();
        let usage = ClientUsage::from(response.obj.unwrap());
        assert_eq!(usage.used_gb, 3.0);
        assert_eq!(usage.total_gb, 10.0);
        assert_eq!(usage.remaining_gb(), 7.0);
        assert_eq!(usage.used_percent(), Some(30.0));
        assert_eq!(usage.expires_at, Some(Utc.with_ymd_and_hms(2025, 1, 31, 0, 0, 0).unwrap()));
        assert!(usage.enabled);

        let unlimited = ClientUsage::from(ClientTraffic {
            inbound_id: 3,
            enable: false,
            email: "ABCD".to_string(),
            up: 5,
            down: 5,
            expiry_time: 0,
            total: 0,
        });
        assert_eq!(unlimited.remaining_gb(), 0.0);
        assert_eq!(unlimited.used_percent(), None);
        assert_eq!(unlimited.expires_at, None);
        assert!(!unlimited.enabled);
    }

    fn sample_client() -> NewClient {
        NewClient {
            inbound_id: 2,
            email: "ABCD1234".to_string(),
            uuid: "0b1c2d3e-0000-4000-8000-000000000001".to_string(),
            sub_id: "00112233aabbccdd".to_string(),
            total_gb: 30.0,
            expires_at: None,
            tg_user_id: 42,
        }
    }

    fn service_for(new_client: &NewClient) -> Service {
        Service {
            id: 1,
            user_id: 1,
            panel_id: 1,
            product_id: Some(1),
            client_name: new_client.email.clone(),
            client_uuid: new_client.uuid.clone(),
            email: new_client.email.clone(),
            inbound_id: new_client.inbound_id,
            sub_id: new_client.sub_id.clone(),
            total_gb: new_client.total_gb,
            used_gb: 0.0,
            expires_at: None,
            status: crate::db::ServiceStatus::Active,
            alerts_sent: 0,
            created_at: 0,
        }
    }

    fn inbound_with(protocol: &str, clients: &[XuiClientEntry]) -> Inbound {
        Inbound {
            id: 2,
            remark: String::new(),
            protocol: protocol.to_string(),
            port: 443,
            enable: true,
            settings: json!({ "clients": clients }).to_string(),
        }
    }

    #[test]
    fn passwords_only_for_password_protocols() {
        let new_client = sample_client();
        assert_eq!(new_client_entry("vless", &new_client).password, None);
        assert_eq!(new_client_entry("vmess", &new_client).password, None);
        assert_eq!(
            new_client_entry("trojan", &new_client).password.as_deref(),
            Some(new_client.uuid.as_str())
        );
        let shadowsocks = new_client_entry("shadowsocks", &new_client);
        assert_eq!(shadowsocks.password.map(|pw| pw.len()), Some(16));
    }

    #[test]
    fn trojan_clients_without_id_are_parsed() {
        let inbound = Inbound {
            settings: r#"{"clients":[{"password":"p1","email":"manual","enable":true,"expiryTime":0,"totalGB":0,"subId":"","tgId":"","limitIp":0,"flow":"","reset":0}],"fallbacks":[]}"#.to_string(),
            ..inbound_with("trojan", &[])
        };
        let clients = inbound.clients().unwrap();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].id, "");
        assert_eq!(client_key("trojan", &clients[0]), "p1");
        assert_eq!(inbound.find_client("p1").unwrap().email, "manual");
        assert!(matches!(
            inbound.find_client("manual"),
            Err(PanelError::ClientNotFound(_))
        ));
    }

    #[test]
    fn bot_clients_are_found_by_protocol_key() {
        let new_client = sample_client();
        let service = service_for(&new_client);
        for protocol in ["vless", "vmess", "trojan", "shadowsocks"] {
            let mut manual = new_client_entry(protocol, &NewClient {
                email: "manual".to_string(),
                uuid: "ffffffff-0000-4000-8000-000000000000".to_string(),
                ..new_client.clone()
            });
            if protocol == "trojan" {
                manual.id.clear();
            }
            let inbound = inbound_with(protocol, &[manual, new_client_entry(protocol, &new_client)]);
            let key = service_client_key(protocol, &service);
            let found = inbound.find_client(key).unwrap();
            assert_eq!(found.email, "ABCD1234", "{protocol}");
            assert_eq!(client_key(protocol, &found), key, "{protocol}");
        }
        assert_eq!(service_client_key("shadowsocks", &service), "ABCD1234");
        assert_eq!(service_client_key("trojan", &service), new_client.uuid);
    }

    #[test]
    fn entries_without_id_omit_it_on_the_wire() {
        let mut entry = new_client_entry("trojan", &sample_client());
        entry.id.clear();
        let value = serde_json::to_value(&entry).unwrap();
        assert!(value.get("id").is_none());
        assert_eq!(value["password"], sample_client().uuid);
    }
}
