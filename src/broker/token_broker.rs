use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use crate::broker::single_flight::{FlightKey, FlightLocks};
use crate::error::{BrokerError, Result};
use crate::security::signature;
use crate::store::{
    CredentialKind, CredentialStore, Expiring, PlatformCredential, PreAuthorizationCode,
    TenantCredential,
};
use crate::transport::{PlatformApi, SigningTicket, TenantPage, TenantSummary};

/// Pagination and retry knobs for [`TokenBroker::list_all_tenants`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListingPolicy {
    pub page_size: usize,
    pub attempts: u32,
    pub backoff: Duration,
    pub max_pages: usize,
}

impl Default for ListingPolicy {
    fn default() -> Self {
        Self {
            page_size: 500,
            attempts: 3,
            backoff: Duration::from_millis(500),
            max_pages: 200,
        }
    }
}

/// Signature bundle a tenant page needs to configure the client SDK.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSignature {
    pub app_id: String,
    pub timestamp: i64,
    pub nonce_str: String,
    pub signature: String,
    pub url: String,
}

/// Mints, caches and refreshes every credential class.
///
/// Cached values are returned while `now < expires_at`. Otherwise exactly one
/// caller per [`FlightKey`] performs the remote call and persists the result;
/// concurrent callers wait for it and re-read the store.
#[derive(Clone)]
pub struct TokenBroker {
    store: Arc<dyn CredentialStore>,
    api: PlatformApi,
    flights: FlightLocks,
    signing_tickets: Arc<RwLock<HashMap<String, SigningTicket>>>,
    listing: ListingPolicy,
}

impl TokenBroker {
    pub fn new(store: Arc<dyn CredentialStore>, api: PlatformApi) -> Self {
        Self {
            store,
            api,
            flights: FlightLocks::new(),
            signing_tickets: Arc::new(RwLock::new(HashMap::new())),
            listing: ListingPolicy::default(),
        }
    }

    pub fn with_listing_policy(mut self, listing: ListingPolicy) -> Self {
        self.listing = listing;
        self
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    pub fn api(&self) -> &PlatformApi {
        &self.api
    }

    /// Cache check, lock, re-check, mint. `load` is called at most twice and
    /// `mint` at most once.
    async fn single_flight<T, L, LF, M, MF>(&self, key: FlightKey, load: L, mint: M) -> Result<T>
    where
        T: Expiring,
        L: Fn() -> LF,
        LF: Future<Output = Result<Option<T>>>,
        M: FnOnce() -> MF,
        MF: Future<Output = Result<T>>,
    {
        if let Some(cached) = load().await?.filter(|c| c.is_valid()) {
            return Ok(cached);
        }

        let _guard = self.flights.acquire(key.clone()).await;
        if let Some(cached) = load().await?.filter(|c| c.is_valid()) {
            debug!(key = ?key, "credential refreshed by a concurrent caller");
            return Ok(cached);
        }

        mint().await
    }

    /// Returns the platform credential, minting one from `verify_ticket` or
    /// the stored verify ticket when the cached one has expired.
    pub async fn platform_credential(&self, verify_ticket: Option<&str>) -> Result<PlatformCredential> {
        self.single_flight(
            FlightKey::Platform,
            move || self.load_platform(),
            move || self.mint_platform(verify_ticket),
        )
        .await
    }

    async fn load_platform(&self) -> Result<Option<PlatformCredential>> {
        Ok(self.store.platform_credential().await?)
    }

    async fn mint_platform(&self, verify_ticket: Option<&str>) -> Result<PlatformCredential> {
        let ticket = match verify_ticket {
            Some(ticket) => ticket.to_string(),
            None => self
                .store
                .verify_ticket()
                .await?
                .map(|t| t.ticket)
                .ok_or(BrokerError::CredentialUnavailable(CredentialKind::VerifyTicket))?,
        };

        let credential = self.api.mint_platform_credential(&ticket).await?;
        self.store.save_platform_credential(&credential).await?;
        info!(expires_at = %credential.expires_at, "platform credential minted");
        Ok(credential)
    }

    pub async fn pre_authorization_code(&self) -> Result<PreAuthorizationCode> {
        self.single_flight(
            FlightKey::PreAuth,
            move || self.load_pre_auth(),
            move || self.mint_pre_auth(),
        )
        .await
    }

    async fn load_pre_auth(&self) -> Result<Option<PreAuthorizationCode>> {
        Ok(self.store.pre_authorization_code().await?)
    }

    async fn mint_pre_auth(&self) -> Result<PreAuthorizationCode> {
        let platform = self.platform_credential(None).await?;
        let code = self.api.mint_pre_authorization_code(&platform).await?;
        self.store.save_pre_authorization_code(&code).await?;
        debug!(expires_at = %code.expires_at, "pre-authorization code minted");
        Ok(code)
    }

    /// Returns the tenant's access credential, refreshing it with the stored
    /// refresh token once it has expired.
    pub async fn tenant_credential(&self, tenant_id: &str) -> Result<TenantCredential> {
        self.single_flight(
            FlightKey::Tenant(tenant_id.to_string()),
            move || self.load_tenant(tenant_id),
            move || self.refresh_stored_tenant(tenant_id),
        )
        .await
    }

    async fn load_tenant(&self, tenant_id: &str) -> Result<Option<TenantCredential>> {
        Ok(self.store.tenant_credential(tenant_id).await?)
    }

    async fn refresh_stored_tenant(&self, tenant_id: &str) -> Result<TenantCredential> {
        let stored = self
            .store
            .tenant_credential(tenant_id)
            .await?
            .filter(|c| !c.refresh_token.is_empty())
            .ok_or(BrokerError::CredentialUnavailable(CredentialKind::Tenant))?;
        self.refresh_unlocked(tenant_id, &stored.refresh_token).await
    }

    /// Forces a refresh with an explicit refresh token.
    ///
    /// On success the stored record is replaced wholesale. A refresh token the
    /// remote side no longer accepts surfaces as [`BrokerError::Remote`] and
    /// leaves the store untouched.
    pub async fn refresh_tenant_credential(
        &self,
        tenant_id: &str,
        refresh_token: &str,
    ) -> Result<TenantCredential> {
        let _guard = self
            .flights
            .acquire(FlightKey::Tenant(tenant_id.to_string()))
            .await;
        self.refresh_unlocked(tenant_id, refresh_token).await
    }

    async fn refresh_unlocked(&self, tenant_id: &str, refresh_token: &str) -> Result<TenantCredential> {
        let platform = self.platform_credential(None).await?;
        let credential = match self
            .api
            .refresh_tenant_credential(&platform, tenant_id, refresh_token)
            .await
        {
            Ok(credential) => credential,
            Err(err) => {
                warn!(tenant_id = %tenant_id, error = %err, "tenant credential refresh failed");
                return Err(err);
            }
        };

        self.store.save_tenant_credential(&credential).await?;
        info!(tenant_id = %tenant_id, expires_at = %credential.expires_at, "tenant credential refreshed");
        Ok(credential)
    }

    /// Exchanges an authorization code for a tenant credential and stores it.
    pub async fn exchange_authorization_code(&self, authorization_code: &str) -> Result<TenantCredential> {
        let platform = self.platform_credential(None).await?;
        let credential = self
            .api
            .exchange_authorization_code(&platform, authorization_code)
            .await?;

        let _guard = self
            .flights
            .acquire(FlightKey::Tenant(credential.tenant_id.clone()))
            .await;
        self.store.save_tenant_credential(&credential).await?;
        self.signing_tickets.write().await.remove(&credential.tenant_id);
        info!(tenant_id = %credential.tenant_id, "tenant authorized");
        Ok(credential)
    }

    /// Enumerates every authorized tenant page by page.
    ///
    /// Each page is retried with linear backoff. The walk stops on a short
    /// page, once the server-reported total is reached, or at the page
    /// ceiling. A missing or zero `total_count` counts as unknown.
    pub async fn list_all_tenants(&self) -> Result<Vec<TenantSummary>> {
        let platform = self.platform_credential(None).await?;
        let page_size = self.listing.page_size.max(1);
        let mut tenants: Vec<TenantSummary> = Vec::new();
        let mut pages = 0usize;

        loop {
            if pages >= self.listing.max_pages {
                warn!(
                    pages,
                    fetched = tenants.len(),
                    "tenant listing hit the page ceiling; result may be incomplete"
                );
                break;
            }

            let page = self.tenant_page_with_retry(&platform, tenants.len(), page_size).await?;
            pages += 1;

            let received = page.items.len();
            let total = page.total_count;
            tenants.extend(page.items);
            debug!(page = pages, received, total, "tenant page fetched");

            if received < page_size || (total > 0 && tenants.len() >= total) {
                break;
            }
        }

        Ok(tenants)
    }

    async fn tenant_page_with_retry(
        &self,
        platform: &PlatformCredential,
        offset: usize,
        count: usize,
    ) -> Result<TenantPage> {
        let attempts = self.listing.attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.api.tenant_page(platform, offset, count).await {
                Ok(page) => return Ok(page),
                Err(err) if attempt < attempts => {
                    let delay = self.listing.backoff * attempt;
                    warn!(
                        offset,
                        attempt,
                        error = %err,
                        "tenant page failed; retrying in {}ms",
                        delay.as_millis()
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Composes the URL a tenant administrator visits to grant access.
    pub async fn authorization_url(&self, redirect_uri: &str, auth_type: u8) -> Result<String> {
        let pre_auth = self.pre_authorization_code().await?;
        self.api.authorization_url(&pre_auth, redirect_uri, auth_type)
    }

    /// Returns the tenant's client-page signing ticket, kept in memory only.
    pub async fn signing_ticket(&self, tenant_id: &str) -> Result<SigningTicket> {
        self.single_flight(
            FlightKey::SigningTicket(tenant_id.to_string()),
            move || self.load_signing_ticket(tenant_id),
            move || self.fetch_signing_ticket(tenant_id),
        )
        .await
    }

    async fn load_signing_ticket(&self, tenant_id: &str) -> Result<Option<SigningTicket>> {
        Ok(self.signing_tickets.read().await.get(tenant_id).cloned())
    }

    async fn fetch_signing_ticket(&self, tenant_id: &str) -> Result<SigningTicket> {
        let tenant = self.tenant_credential(tenant_id).await?;
        let ticket = self.api.fetch_signing_ticket(&tenant).await?;
        self.signing_tickets
            .write()
            .await
            .insert(tenant_id.to_string(), ticket.clone());
        debug!(tenant_id = %tenant_id, "signing ticket fetched");
        Ok(ticket)
    }

    pub async fn forget_tenant(&self, tenant_id: &str) -> Result<()> {
        let _guard = self
            .flights
            .acquire(FlightKey::Tenant(tenant_id.to_string()))
            .await;
        self.store.delete_tenant_credential(tenant_id).await?;
        self.signing_tickets.write().await.remove(tenant_id);
        Ok(())
    }

    /// Signs `page_url` for the tenant's client SDK with a fresh nonce.
    pub async fn client_signature(&self, tenant_id: &str, page_url: &str) -> Result<ClientSignature> {
        let ticket = self.signing_ticket(tenant_id).await?;
        let nonce_str: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(16)
            .map(char::from)
            .collect();
        let timestamp = Utc::now().timestamp();
        let url = page_url.split('#').next().unwrap_or(page_url).to_string();

        Ok(ClientSignature {
            app_id: tenant_id.to_string(),
            timestamp,
            signature: signature::sign_client_config(&ticket.ticket, &nonce_str, timestamp, &url),
            nonce_str,
            url,
        })
    }
}
