//! Remote API access.
//!
//! The broker only needs one capability from the network: send a request and
//! get back parsed JSON or a structured error. [`ApiExecutor`] is that seam;
//! [`PlatformApi`] layers the typed remote operations on top of it.

pub mod http_executor;
pub mod platform_api;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;

use crate::error::{BrokerError, Result};

pub use http_executor::HttpExecutor;
pub use platform_api::{PlatformApi, SigningTicket, TenantPage, TenantSummary};

/// Query parameters as raw name/value pairs; executors percent-encode them.
pub type QueryPairs<'a> = &'a [(&'a str, &'a str)];

/// Executes one remote call.
///
/// `url` is either absolute or a path relative to the executor's base URL.
/// Implementations return [`BrokerError::Remote`] for structured failures
/// reported by the remote side.
#[async_trait]
pub trait ApiExecutor: Send + Sync {
    async fn execute(
        &self,
        method: Method,
        url: &str,
        query: QueryPairs<'_>,
        body: Option<&Value>,
    ) -> Result<Value>;
}

/// Turns a body carrying a non-zero `errcode` into [`BrokerError::Remote`].
pub fn check_errcode(value: Value) -> Result<Value> {
    let code = value.get("errcode").and_then(Value::as_i64).unwrap_or(0);
    if code != 0 {
        let message = value
            .get("errmsg")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        return Err(BrokerError::remote(code, message));
    }
    Ok(value)
}

/// Path without its query string, safe to log.
pub(crate) fn loggable_path(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}
