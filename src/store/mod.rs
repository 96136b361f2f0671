//! Credential storage contract and reference backends.
//!
//! Four record kinds are stored: the platform credential, the
//! pre-authorization code and the verify ticket (one each), plus one
//! tenant credential per tenant id. Every write replaces a whole record.
//! Expired singletons are deleted lazily by the read that observes them.

pub mod file;
pub mod memory;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use file::FileStore;
pub use memory::MemoryStore;

/// How long a pushed verify ticket stays usable.
pub const VERIFY_TICKET_LIFETIME_SECS: i64 = 12 * 60 * 60;

/// The kinds of credential the broker manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    Platform,
    Tenant,
    PreAuthorization,
    VerifyTicket,
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CredentialKind::Platform => "platform credential",
            CredentialKind::Tenant => "tenant credential",
            CredentialKind::PreAuthorization => "pre-authorization code",
            CredentialKind::VerifyTicket => "verify ticket",
        };
        f.write_str(name)
    }
}

/// Anything with a hard expiry instant.
pub trait Expiring {
    fn expires_at(&self) -> DateTime<Utc>;

    fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at()
    }

    fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }
}

/// Platform-wide bearer token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformCredential {
    pub token: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Per-tenant bearer token plus its single-use refresh token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantCredential {
    pub tenant_id: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Short-lived code used once to compose an authorization URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreAuthorizationCode {
    pub code: String,
    pub expires_at: DateTime<Utc>,
}

/// Seed pushed periodically by the remote server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyTicket {
    pub ticket: String,
    pub received_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl VerifyTicket {
    pub fn received_now(ticket: impl Into<String>) -> Self {
        let received_at = Utc::now();
        Self {
            ticket: ticket.into(),
            received_at,
            expires_at: received_at + Duration::seconds(VERIFY_TICKET_LIFETIME_SECS),
        }
    }
}

impl Expiring for PlatformCredential {
    fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

impl Expiring for TenantCredential {
    fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

impl Expiring for PreAuthorizationCode {
    fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

impl Expiring for VerifyTicket {
    fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("stored record is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("invalid tenant id {0:?}")]
    InvalidTenantId(String),
}

/// Durable storage for credentials.
///
/// Implementations may block on I/O; callers treat every method as a
/// suspension point.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn platform_credential(&self) -> Result<Option<PlatformCredential>, StoreError>;
    async fn save_platform_credential(&self, credential: &PlatformCredential) -> Result<(), StoreError>;
    async fn delete_platform_credential(&self) -> Result<(), StoreError>;

    async fn pre_authorization_code(&self) -> Result<Option<PreAuthorizationCode>, StoreError>;
    async fn save_pre_authorization_code(&self, code: &PreAuthorizationCode) -> Result<(), StoreError>;
    async fn delete_pre_authorization_code(&self) -> Result<(), StoreError>;

    async fn verify_ticket(&self) -> Result<Option<VerifyTicket>, StoreError>;
    async fn save_verify_ticket(&self, ticket: &VerifyTicket) -> Result<(), StoreError>;
    async fn delete_verify_ticket(&self) -> Result<(), StoreError>;

    /// Tenant records are returned even when the access token has expired,
    /// since the refresh token they carry is still needed.
    async fn tenant_credential(&self, tenant_id: &str) -> Result<Option<TenantCredential>, StoreError>;
    async fn save_tenant_credential(&self, credential: &TenantCredential) -> Result<(), StoreError>;
    async fn delete_tenant_credential(&self, tenant_id: &str) -> Result<(), StoreError>;
    async fn tenant_ids(&self) -> Result<Vec<String>, StoreError>;
    async fn delete_all_tenant_credentials(&self) -> Result<(), StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;
}

/// Drops a singleton that has expired, reporting whether it survived.
pub(crate) fn live<T: Expiring>(record: Option<T>) -> (Option<T>, bool) {
    match record {
        Some(r) if r.is_valid() => (Some(r), false),
        Some(_) => (None, true),
        None => (None, false),
    }
}

/// Clears `slot` only if the record it holds right now has expired.
///
/// Callers hold the write side of whatever guards `slot`, so a record saved
/// after an earlier expired read is left alone.
pub(crate) fn discard_expired<T: Expiring>(slot: &mut Option<T>) -> bool {
    if slot.as_ref().is_some_and(|r| !r.is_valid()) {
        *slot = None;
        return true;
    }
    false
}
