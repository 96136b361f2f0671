use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use reqwest::{Method, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{BrokerError, Result};
use crate::store::{PlatformCredential, PreAuthorizationCode, TenantCredential};
use crate::transport::{ApiExecutor, QueryPairs};

const PLATFORM_TOKEN_PATH: &str = "/cgi-bin/component/api_component_token";
const PRE_AUTH_CODE_PATH: &str = "/cgi-bin/component/api_create_preauthcode";
const QUERY_AUTH_PATH: &str = "/cgi-bin/component/api_query_auth";
const TENANT_TOKEN_PATH: &str = "/cgi-bin/component/api_authorizer_token";
const TENANT_LIST_PATH: &str = "/cgi-bin/component/api_get_authorizer_list";
const SIGNING_TICKET_PATH: &str = "/cgi-bin/ticket/getticket";

/// Per-tenant ticket used to sign client-side page configurations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningTicket {
    pub ticket: String,
    pub expires_at: DateTime<Utc>,
}

impl crate::store::Expiring for SigningTicket {
    fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

/// One entry of the tenant listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantSummary {
    #[serde(rename = "authorizer_appid")]
    pub tenant_id: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(rename = "auth_time", default)]
    pub authorized_at: i64,
}

impl TenantSummary {
    pub fn authorized_at_utc(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.authorized_at, 0).single()
    }
}

/// One page of the tenant listing as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TenantPage {
    #[serde(default)]
    pub total_count: usize,
    #[serde(rename = "list", default)]
    pub items: Vec<TenantSummary>,
}

#[derive(Deserialize)]
struct PlatformTokenResponse {
    component_access_token: String,
    expires_in: i64,
}

#[derive(Deserialize)]
struct PreAuthCodeResponse {
    pre_auth_code: String,
    expires_in: i64,
}

#[derive(Deserialize)]
struct QueryAuthResponse {
    authorization_info: AuthorizationInfo,
}

#[derive(Deserialize)]
struct AuthorizationInfo {
    authorizer_appid: String,
    authorizer_access_token: String,
    expires_in: i64,
    authorizer_refresh_token: String,
}

#[derive(Deserialize)]
struct TenantTokenResponse {
    authorizer_access_token: String,
    expires_in: i64,
    authorizer_refresh_token: String,
}

#[derive(Deserialize)]
struct SigningTicketResponse {
    ticket: String,
    expires_in: i64,
}

/// Typed remote operations the broker depends on.
#[derive(Clone)]
pub struct PlatformApi {
    executor: Arc<dyn ApiExecutor>,
    platform_id: String,
    platform_secret: String,
    authorize_base_url: String,
    refresh_margin: Duration,
}

impl PlatformApi {
    pub fn new(
        executor: Arc<dyn ApiExecutor>,
        platform_id: impl Into<String>,
        platform_secret: impl Into<String>,
    ) -> Self {
        Self {
            executor,
            platform_id: platform_id.into(),
            platform_secret: platform_secret.into(),
            authorize_base_url: crate::config::DEFAULT_AUTHORIZE_BASE_URL.to_string(),
            refresh_margin: Duration::seconds(crate::config::DEFAULT_REFRESH_MARGIN_SECS as i64),
        }
    }

    /// Seconds shaved off every remote `expires_in` so records expire locally
    /// before the remote side stops honouring them.
    pub fn with_refresh_margin(mut self, margin: std::time::Duration) -> Self {
        self.refresh_margin = Duration::from_std(margin).unwrap_or(self.refresh_margin);
        self
    }

    pub fn with_authorize_base_url(mut self, url: impl Into<String>) -> Self {
        self.authorize_base_url = url.into();
        self
    }

    pub fn platform_id(&self) -> &str {
        &self.platform_id
    }

    /// Local expiry for a remote lifetime: `expires_in` minus the margin,
    /// but never less than half the lifetime.
    fn expiry(&self, issued_at: DateTime<Utc>, expires_in: i64) -> DateTime<Utc> {
        let expires_in = expires_in.max(0);
        let effective = (expires_in - self.refresh_margin.num_seconds()).max(expires_in / 2);
        issued_at + Duration::seconds(effective)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: QueryPairs<'_>,
        body: Option<Value>,
    ) -> Result<T> {
        let value = self.executor.execute(method, path, query, body.as_ref()).await?;
        serde_json::from_value(value)
            .map_err(|e| BrokerError::Malformed(format!("unexpected response shape: {e}")))
    }

    pub async fn mint_platform_credential(&self, verify_ticket: &str) -> Result<PlatformCredential> {
        let body = json!({
            "component_appid": self.platform_id,
            "component_appsecret": self.platform_secret,
            "component_verify_ticket": verify_ticket,
        });
        let resp: PlatformTokenResponse = self.call(Method::POST, PLATFORM_TOKEN_PATH, &[], Some(body)).await?;

        let issued_at = Utc::now();
        debug!(expires_in = resp.expires_in, "platform credential minted");
        Ok(PlatformCredential {
            token: resp.component_access_token,
            issued_at,
            expires_at: self.expiry(issued_at, resp.expires_in),
        })
    }

    pub async fn mint_pre_authorization_code(
        &self,
        platform: &PlatformCredential,
    ) -> Result<PreAuthorizationCode> {
        let body = json!({ "component_appid": self.platform_id });
        let resp: PreAuthCodeResponse = self
            .call(Method::POST, PRE_AUTH_CODE_PATH, &platform_query(platform), Some(body))
            .await?;

        Ok(PreAuthorizationCode {
            code: resp.pre_auth_code,
            expires_at: self.expiry(Utc::now(), resp.expires_in),
        })
    }

    pub async fn exchange_authorization_code(
        &self,
        platform: &PlatformCredential,
        authorization_code: &str,
    ) -> Result<TenantCredential> {
        let body = json!({
            "component_appid": self.platform_id,
            "authorization_code": authorization_code,
        });
        let resp: QueryAuthResponse = self
            .call(Method::POST, QUERY_AUTH_PATH, &platform_query(platform), Some(body))
            .await?;
        let info = resp.authorization_info;

        let now = Utc::now();
        Ok(TenantCredential {
            tenant_id: info.authorizer_appid,
            access_token: info.authorizer_access_token,
            refresh_token: info.authorizer_refresh_token,
            expires_at: self.expiry(now, info.expires_in),
            updated_at: Some(now),
        })
    }

    pub async fn refresh_tenant_credential(
        &self,
        platform: &PlatformCredential,
        tenant_id: &str,
        refresh_token: &str,
    ) -> Result<TenantCredential> {
        let body = json!({
            "component_appid": self.platform_id,
            "authorizer_appid": tenant_id,
            "authorizer_refresh_token": refresh_token,
        });
        let resp: TenantTokenResponse = self
            .call(Method::POST, TENANT_TOKEN_PATH, &platform_query(platform), Some(body))
            .await?;

        let now = Utc::now();
        Ok(TenantCredential {
            tenant_id: tenant_id.to_string(),
            access_token: resp.authorizer_access_token,
            refresh_token: resp.authorizer_refresh_token,
            expires_at: self.expiry(now, resp.expires_in),
            updated_at: Some(now),
        })
    }

    pub async fn tenant_page(
        &self,
        platform: &PlatformCredential,
        offset: usize,
        count: usize,
    ) -> Result<TenantPage> {
        let body = json!({
            "component_appid": self.platform_id,
            "offset": offset,
            "count": count,
        });
        self.call(Method::POST, TENANT_LIST_PATH, &platform_query(platform), Some(body))
            .await
    }

    pub async fn fetch_signing_ticket(&self, tenant: &TenantCredential) -> Result<SigningTicket> {
        let query = [("access_token", tenant.access_token.as_str()), ("type", "jsapi")];
        let resp: SigningTicketResponse = self
            .call(Method::GET, SIGNING_TICKET_PATH, &query, None)
            .await?;

        Ok(SigningTicket {
            ticket: resp.ticket,
            expires_at: self.expiry(Utc::now(), resp.expires_in),
        })
    }

    /// Tenant-facing URL that starts the authorization flow.
    pub fn authorization_url(
        &self,
        pre_auth: &PreAuthorizationCode,
        redirect_uri: &str,
        auth_type: u8,
    ) -> Result<String> {
        let auth_type = auth_type.to_string();
        let url = Url::parse_with_params(
            &self.authorize_base_url,
            &[
                ("component_appid", self.platform_id.as_str()),
                ("pre_auth_code", pre_auth.code.as_str()),
                ("redirect_uri", redirect_uri),
                ("auth_type", auth_type.as_str()),
            ],
        )
        .map_err(|e| BrokerError::Validation(format!("invalid authorize base url: {e}")))?;
        Ok(url.into())
    }
}

fn platform_query(platform: &PlatformCredential) -> [(&'static str, &str); 1] {
    [("component_access_token", platform.token.as_str())]
}
