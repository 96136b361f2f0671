use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{
        rejection::{BytesRejection, QueryRejection},
        DefaultBodyLimit, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::broker::TokenBroker;
use crate::comms::event_router::{CallbackQuery, EventRouter, ACKNOWLEDGEMENT};
use crate::config::BrokerConfig;
use crate::security::key_ring::spawn_grace_reaper;

type SharedState = Arc<AppState>;

/// Largest callback body read; anything bigger is acknowledged unread.
pub const MAX_CALLBACK_BODY_BYTES: usize = 8 * 1024 * 1024;

pub struct AppState {
    pub router: EventRouter,
    pub broker: TokenBroker,
}

impl AppState {
    pub fn new(router: EventRouter, broker: TokenBroker) -> Self {
        Self { router, broker }
    }

    pub fn from_config(config: &BrokerConfig) -> Result<Self> {
        let store = config.credential_store()?;
        let broker = config.token_broker(store)?;
        let key_ring = config.key_ring()?;
        let router = config.event_router(key_ring, broker.clone());
        Ok(Self::new(router, broker))
    }
}

#[derive(Debug, Deserialize)]
pub struct AuthorizeParams {
    pub redirect_uri: String,
    #[serde(default = "default_auth_type")]
    pub auth_type: u8,
}

fn default_auth_type() -> u8 {
    3
}

async fn health(State(state): State<SharedState>) -> impl IntoResponse {
    match state.broker.store().health_check().await {
        Ok(()) => (StatusCode::OK, Json(json!({"status": "ok"}))),
        Err(err) => {
            warn!(error = %err, "credential store health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"status": "unavailable", "error": err.to_string()})),
            )
        }
    }
}

async fn callback(
    State(state): State<SharedState>,
    query: std::result::Result<Query<CallbackQuery>, QueryRejection>,
    body: std::result::Result<Bytes, BytesRejection>,
) -> &'static str {
    let query = match query {
        Ok(Query(query)) => query,
        Err(rejection) => {
            debug!(error = %rejection, "unparseable callback query");
            CallbackQuery::default()
        }
    };
    let body = match body {
        Ok(body) => body,
        Err(rejection) => {
            warn!(error = %rejection, "callback body not read");
            return ACKNOWLEDGEMENT;
        }
    };
    let body = String::from_utf8_lossy(&body);
    state.router.handle(&query, &body).await
}

async fn authorize(
    State(state): State<SharedState>,
    Query(params): Query<AuthorizeParams>,
) -> Response {
    match state
        .broker
        .authorization_url(&params.redirect_uri, params.auth_type)
        .await
    {
        Ok(url) => Redirect::to(&url).into_response(),
        Err(err) => {
            warn!(error = %err, "could not compose authorization url");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({"error": err.to_string()})),
            )
                .into_response()
        }
    }
}

pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/callback",
            post(callback).layer(DefaultBodyLimit::max(MAX_CALLBACK_BODY_BYTES)),
        )
        .route("/authorize", get(authorize))
        .with_state(state)
}

pub async fn serve(config: BrokerConfig, port: u16) -> Result<()> {
    let state = Arc::new(AppState::from_config(&config)?);

    let reaper_interval = (config.key_grace() / 10).max(std::time::Duration::from_secs(1));
    spawn_grace_reaper(state.router.key_ring().clone(), config.key_grace(), reaper_interval);

    let app = create_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(platform_id = %config.platform_id, "callback server listening on {}", addr);
    axum::serve(listener, app).into_future().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::key_ring::{KeyMaterial, KeyRing};
    use crate::security::msg_crypto::AesKey;
    use crate::store::{CredentialStore, MemoryStore};
    use crate::transport::{HttpExecutor, PlatformApi};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn state() -> SharedState {
        let executor =
            HttpExecutor::new("http://127.0.0.1:9", std::time::Duration::from_millis(200)).unwrap();
        let api = PlatformApi::new(Arc::new(executor), "wx-platform", "secret");
        let store: Arc<dyn CredentialStore> = Arc::new(MemoryStore::new());
        let broker = TokenBroker::new(store, api);
        let ring = KeyRing::new("wx-platform", KeyMaterial::new(AesKey::generate(), "token"));
        Arc::new(AppState::new(
            EventRouter::with_default_handlers(ring, broker.clone()),
            broker,
        ))
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let response = create_router(state())
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn callback_always_acknowledges() {
        let response = create_router(state())
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/callback?encrypt_type=aes&timestamp=1&nonce=n&msg_signature=x")
                    .body(Body::from("not xml"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"success");
    }

    #[tokio::test]
    async fn oversized_callback_is_still_acknowledged() {
        let body = vec![b'a'; MAX_CALLBACK_BODY_BYTES + 1];
        let response = create_router(state())
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/callback")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"success");
    }

    #[tokio::test]
    async fn authorize_without_ticket_is_bad_gateway() {
        let response = create_router(state())
            .oneshot(
                Request::builder()
                    .uri("/authorize?redirect_uri=https%3A%2F%2Ftenant.example.com%2F")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
