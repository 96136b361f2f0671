use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::broker::{ListingPolicy, TokenBroker};
use crate::comms::event_router::EventRouter;
use crate::security::key_ring::{KeyMaterial, KeyRing};
use crate::security::msg_crypto::AesKey;
use crate::store::{CredentialStore, FileStore, MemoryStore};
use crate::transport::{HttpExecutor, PlatformApi};

pub const DEFAULT_API_BASE_URL: &str = "https://api.weixin.qq.com";
pub const DEFAULT_AUTHORIZE_BASE_URL: &str = "https://mp.weixin.qq.com/cgi-bin/componentloginpage";
pub const DEFAULT_REFRESH_MARGIN_SECS: u64 = 300;

const ENV_PREFIX: &str = "BROKER_";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreConfig {
    #[default]
    Memory,
    File {
        dir: PathBuf,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub platform_id: String,
    pub platform_secret: String,
    /// Shared secret the remote server signs callbacks with.
    pub token: String,
    /// 43-character encoded callback key.
    pub encoding_aes_key: String,
    pub api_base_url: String,
    pub authorize_base_url: String,
    pub refresh_margin_secs: u64,
    pub request_timeout_secs: u64,
    pub timestamp_tolerance_secs: u64,
    pub accept_unstamped_events: bool,
    pub key_grace_secs: u64,
    pub tenant_page_size: usize,
    pub tenant_page_attempts: u32,
    pub tenant_page_backoff_ms: u64,
    pub tenant_max_pages: usize,
    pub store: StoreConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            platform_id: String::new(),
            platform_secret: String::new(),
            token: String::new(),
            encoding_aes_key: String::new(),
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            authorize_base_url: DEFAULT_AUTHORIZE_BASE_URL.to_string(),
            refresh_margin_secs: DEFAULT_REFRESH_MARGIN_SECS,
            request_timeout_secs: 10,
            timestamp_tolerance_secs: 300,
            accept_unstamped_events: true,
            key_grace_secs: 3600,
            tenant_page_size: 500,
            tenant_page_attempts: 3,
            tenant_page_backoff_ms: 500,
            tenant_max_pages: 200,
            store: StoreConfig::Memory,
        }
    }
}

fn parse_env<T: FromStr>(name: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| anyhow::anyhow!("{name}={raw:?}: {e}"))
}

impl BrokerConfig {
    pub fn from_file(path: &str) -> Result<Self> {
        let raw = fs::read_to_string(path).with_context(|| format!("reading config file {path}"))?;
        serde_json::from_str(&raw).context("parsing broker config JSON")
    }

    /// File (when given), then `BROKER_*` overrides, then validation.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|name| std::env::var(name).ok())
    }

    /// Applies overrides from `lookup`, keyed by the full `BROKER_*` name.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let get = |key: &str| {
            let name = format!("{ENV_PREFIX}{key}");
            lookup(&name).map(|value| (name, value))
        };

        for (key, field) in [
            ("PLATFORM_ID", &mut self.platform_id),
            ("PLATFORM_SECRET", &mut self.platform_secret),
            ("TOKEN", &mut self.token),
            ("ENCODING_AES_KEY", &mut self.encoding_aes_key),
            ("API_BASE_URL", &mut self.api_base_url),
            ("AUTHORIZE_BASE_URL", &mut self.authorize_base_url),
        ] {
            if let Some((_, value)) = get(key) {
                *field = value;
            }
        }

        for (key, field) in [
            ("REFRESH_MARGIN_SECS", &mut self.refresh_margin_secs),
            ("REQUEST_TIMEOUT_SECS", &mut self.request_timeout_secs),
            ("TIMESTAMP_TOLERANCE_SECS", &mut self.timestamp_tolerance_secs),
            ("KEY_GRACE_SECS", &mut self.key_grace_secs),
            ("TENANT_PAGE_BACKOFF_MS", &mut self.tenant_page_backoff_ms),
        ] {
            if let Some((name, value)) = get(key) {
                *field = parse_env(&name, &value)?;
            }
        }

        if let Some((name, value)) = get("TENANT_PAGE_SIZE") {
            self.tenant_page_size = parse_env(&name, &value)?;
        }
        if let Some((name, value)) = get("TENANT_MAX_PAGES") {
            self.tenant_max_pages = parse_env(&name, &value)?;
        }
        if let Some((name, value)) = get("TENANT_PAGE_ATTEMPTS") {
            self.tenant_page_attempts = parse_env(&name, &value)?;
        }
        if let Some((name, value)) = get("ACCEPT_UNSTAMPED_EVENTS") {
            self.accept_unstamped_events = parse_env(&name, &value)?;
        }
        if let Some((_, dir)) = get("STORE_DIR") {
            self.store = StoreConfig::File { dir: dir.into() };
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("platform_id", &self.platform_id),
            ("platform_secret", &self.platform_secret),
            ("token", &self.token),
            ("encoding_aes_key", &self.encoding_aes_key),
        ] {
            if value.trim().is_empty() {
                bail!("{name} is not configured");
            }
        }
        AesKey::from_encoded(&self.encoding_aes_key).context("encoding_aes_key")?;
        if self.tenant_page_size == 0 {
            bail!("tenant_page_size must be positive");
        }
        Ok(())
    }

    pub fn credential_store(&self) -> Result<Arc<dyn CredentialStore>> {
        Ok(match &self.store {
            StoreConfig::Memory => Arc::new(MemoryStore::new()),
            StoreConfig::File { dir } => {
                fs::create_dir_all(dir)
                    .with_context(|| format!("creating store directory {}", dir.display()))?;
                Arc::new(FileStore::new(dir))
            }
        })
    }

    pub fn key_ring(&self) -> Result<KeyRing> {
        let key = AesKey::from_encoded(&self.encoding_aes_key).context("encoding_aes_key")?;
        Ok(KeyRing::new(
            self.platform_id.clone(),
            KeyMaterial::new(key, self.token.clone()),
        ))
    }

    pub fn platform_api(&self) -> Result<PlatformApi> {
        let executor = HttpExecutor::new(
            self.api_base_url.clone(),
            Duration::from_secs(self.request_timeout_secs),
        )
        .context("building remote API client")?;
        Ok(
            PlatformApi::new(Arc::new(executor), &self.platform_id, &self.platform_secret)
                .with_refresh_margin(Duration::from_secs(self.refresh_margin_secs))
                .with_authorize_base_url(&self.authorize_base_url),
        )
    }

    pub fn listing_policy(&self) -> ListingPolicy {
        ListingPolicy {
            page_size: self.tenant_page_size,
            attempts: self.tenant_page_attempts,
            backoff: Duration::from_millis(self.tenant_page_backoff_ms),
            max_pages: self.tenant_max_pages,
        }
    }

    pub fn token_broker(&self, store: Arc<dyn CredentialStore>) -> Result<TokenBroker> {
        Ok(TokenBroker::new(store, self.platform_api()?).with_listing_policy(self.listing_policy()))
    }

    pub fn event_router(&self, key_ring: KeyRing, broker: TokenBroker) -> EventRouter {
        EventRouter::with_default_handlers(key_ring, broker)
            .with_timestamp_tolerance(i64::try_from(self.timestamp_tolerance_secs).unwrap_or(i64::MAX))
            .with_accept_unstamped_events(self.accept_unstamped_events)
    }

    pub fn key_grace(&self) -> Duration {
        Duration::from_secs(self.key_grace_secs)
    }
}
