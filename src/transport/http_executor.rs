use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::Value;
use tracing::debug;

use crate::error::{BrokerError, Result};
use crate::transport::{check_errcode, loggable_path, ApiExecutor, QueryPairs};

/// reqwest-backed executor for the remote JSON API.
///
/// Non-2xx statuses become [`BrokerError::Remote`] carrying the HTTP status
/// as code; JSON bodies with a non-zero `errcode` do the same with the
/// remote code. Dropping the returned future aborts the request.
#[derive(Debug, Clone)]
pub struct HttpExecutor {
    base_url: String,
    http_client: Client,
}

impl HttpExecutor {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http_client = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(base_url, http_client))
    }

    pub fn with_client(base_url: impl Into<String>, http_client: Client) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        debug!("remote api executor initialized with base_url={}", base_url);
        Self {
            base_url,
            http_client,
        }
    }

    fn resolve(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("{}/{}", self.base_url, url.trim_start_matches('/'))
        }
    }
}

#[async_trait]
impl ApiExecutor for HttpExecutor {
    async fn execute(
        &self,
        method: Method,
        url: &str,
        query: QueryPairs<'_>,
        body: Option<&Value>,
    ) -> Result<Value> {
        let target = self.resolve(url);
        debug!(method = %method, path = %loggable_path(url), "calling remote api");

        let mut request = self.http_client.request(method, &target);
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            debug!(status = %status, path = %loggable_path(url), "remote api returned error status");
            return Err(BrokerError::remote(i64::from(status.as_u16()), text));
        }

        let value: Value = serde_json::from_str(&text)
            .map_err(|e| BrokerError::Malformed(format!("remote response is not JSON: {e}")))?;
        check_errcode(value)
    }
}
