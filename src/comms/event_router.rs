use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use serde::Deserialize;
use tracing::{debug, error, info, instrument};

use crate::broker::TokenBroker;
use crate::comms::events::{Envelope, EventKind, Notification};
use crate::comms::handlers::{
    AuthorizationHandler, EventHandler, KeyRotationHandler, RevocationHandler, VerifyTicketHandler,
};
use crate::error::{BrokerError, CryptoError, Result};
use crate::security::audit_log::AuditLogger;
use crate::security::key_ring::KeyRing;

/// Body returned for every callback, whatever happened internally.
pub const ACKNOWLEDGEMENT: &str = "success";

pub const DEFAULT_TIMESTAMP_TOLERANCE_SECS: i64 = 300;

/// Query parameters the remote server attaches to each callback.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackQuery {
    pub signature: Option<String>,
    pub timestamp: Option<String>,
    pub nonce: Option<String>,
    pub encrypt_type: Option<String>,
    pub msg_signature: Option<String>,
}

impl CallbackQuery {
    fn is_encrypted(&self) -> bool {
        self.encrypt_type
            .as_deref()
            .is_some_and(|t| t.eq_ignore_ascii_case("aes"))
    }
}

/// Validates, decrypts and dispatches callback notifications.
pub struct EventRouter {
    key_ring: KeyRing,
    handlers: HashMap<EventKind, Arc<dyn EventHandler>>,
    audit: AuditLogger,
    timestamp_tolerance_secs: i64,
    accept_unstamped_events: bool,
}

impl EventRouter {
    /// Router without handlers; every valid notification is logged and dropped.
    pub fn new(key_ring: KeyRing) -> Self {
        Self {
            key_ring,
            handlers: HashMap::new(),
            audit: AuditLogger::new(),
            timestamp_tolerance_secs: DEFAULT_TIMESTAMP_TOLERANCE_SECS,
            accept_unstamped_events: true,
        }
    }

    /// Router wired to the broker, its store and the key ring.
    pub fn with_default_handlers(key_ring: KeyRing, broker: TokenBroker) -> Self {
        let authorization: Arc<dyn EventHandler> = Arc::new(AuthorizationHandler::new(broker.clone()));
        let store = broker.store().clone();
        Self::new(key_ring.clone())
            .with_handler(EventKind::Authorized, authorization.clone())
            .with_handler(EventKind::UpdateAuthorized, authorization)
            .with_handler(EventKind::Unauthorized, Arc::new(RevocationHandler::new(broker)))
            .with_handler(
                EventKind::VerifyTicketRefresh,
                Arc::new(VerifyTicketHandler::new(store)),
            )
            .with_handler(EventKind::KeyRotation, Arc::new(KeyRotationHandler::new(key_ring)))
    }

    pub fn with_handler(mut self, kind: EventKind, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.insert(kind, handler);
        self
    }

    pub fn with_timestamp_tolerance(mut self, secs: i64) -> Self {
        self.timestamp_tolerance_secs = secs.max(0);
        self
    }

    /// Whether notifications with `CreateTime` 0 skip the freshness check.
    pub fn with_accept_unstamped_events(mut self, accept: bool) -> Self {
        self.accept_unstamped_events = accept;
        self
    }

    pub fn key_ring(&self) -> &KeyRing {
        &self.key_ring
    }

    pub fn platform_id(&self) -> &str {
        self.key_ring.origin_id()
    }

    /// Processes one callback and returns the acknowledgement. Never fails:
    /// errors and handler panics are logged and swallowed.
    #[instrument(skip_all, fields(nonce = query.nonce.as_deref().unwrap_or("")))]
    pub async fn handle(&self, query: &CallbackQuery, body: &str) -> &'static str {
        match AssertUnwindSafe(self.process(query, body)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!(error = %err, "callback not dispatched"),
            Err(_) => error!("callback handler panicked"),
        }
        ACKNOWLEDGEMENT
    }

    async fn process(&self, query: &CallbackQuery, body: &str) -> Result<()> {
        let envelope = Envelope::from_xml(body).inspect_err(|err| {
            self.audit.malformed(&err.to_string());
        })?;

        let timestamp = query.timestamp.as_deref().unwrap_or("");
        let nonce = query.nonce.as_deref().unwrap_or("");

        let notification = if query.is_encrypted() {
            let ciphertext = envelope.encrypted.as_deref().ok_or_else(|| {
                self.audit.malformed("encrypted callback without <Encrypt>");
                BrokerError::Malformed("missing <Encrypt>".into())
            })?;
            let provided = query.msg_signature.as_deref().unwrap_or("");
            self.check_signature(timestamp, nonce, ciphertext, provided).await?;

            let plaintext = self.key_ring.decrypt(ciphertext).await.map_err(|err| {
                match &err {
                    CryptoError::OriginMismatch { expected, found } => {
                        self.audit.origin_mismatch(expected, found)
                    }
                    other => self
                        .audit
                        .decrypt_failed(envelope.origin_id.as_deref(), &other.to_string()),
                }
                BrokerError::from(err)
            })?;
            let inner = String::from_utf8(plaintext).map_err(|_| {
                self.audit.malformed("decrypted body is not UTF-8");
                BrokerError::Malformed("decrypted body is not UTF-8".into())
            })?;
            self.parse_notification(&inner)?
        } else {
            let provided = query.signature.as_deref().unwrap_or("");
            self.check_signature(timestamp, nonce, "", provided).await?;
            let notification = self.parse_notification(envelope.plain_body())?;
            // key material only ever travels inside a sealed envelope
            if notification.event.kind() == Some(EventKind::KeyRotation) {
                self.audit.unsealed_key_rotation(&notification.origin_id);
                return Err(BrokerError::Validation(
                    "key rotation must arrive encrypted".into(),
                ));
            }
            notification
        };

        self.validate(&notification)?;
        self.dispatch(&notification).await
    }

    async fn check_signature(&self, timestamp: &str, nonce: &str, payload: &str, provided: &str) -> Result<()> {
        self.key_ring
            .verify_signature(timestamp, nonce, payload, provided)
            .await
            .map_err(|err| {
                self.audit.signature_invalid(nonce, timestamp);
                BrokerError::from(err)
            })
    }

    fn parse_notification(&self, xml: &str) -> Result<Notification> {
        Notification::from_xml(xml).inspect_err(|err| self.audit.malformed(&err.to_string()))
    }

    fn validate(&self, notification: &Notification) -> Result<()> {
        if notification.origin_id != self.platform_id() {
            self.audit
                .origin_mismatch(self.platform_id(), &notification.origin_id);
            return Err(BrokerError::Validation(format!(
                "notification addressed to {:?}",
                notification.origin_id
            )));
        }

        if notification.create_time == 0 && self.accept_unstamped_events {
            debug!(info_type = %notification.info_type, "unstamped notification accepted");
            return Ok(());
        }

        let skew = (Utc::now().timestamp() - notification.create_time).abs();
        if skew > self.timestamp_tolerance_secs {
            self.audit
                .stale_event(&notification.info_type, notification.create_time, skew);
            return Err(BrokerError::Validation(format!(
                "notification outside the {}s window (skew {}s)",
                self.timestamp_tolerance_secs, skew
            )));
        }
        Ok(())
    }

    async fn dispatch(&self, notification: &Notification) -> Result<()> {
        let Some(kind) = notification.event.kind() else {
            info!(info_type = %notification.info_type, "ignoring unsupported notification");
            return Ok(());
        };
        let Some(handler) = self.handlers.get(&kind) else {
            debug!(kind = kind.as_str(), "no handler registered");
            return Ok(());
        };

        handler.handle(notification).await.inspect_err(|err| {
            self.audit.handler_failed(kind.as_str(), &err.to_string());
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comms::events::CallbackEvent;
    use crate::security::key_ring::KeyMaterial;
    use crate::security::msg_crypto::AesKey;
    use crate::security::signature;
    use async_trait::async_trait;
    use std::sync::Mutex;

    const PLATFORM: &str = "wx-platform";
    const TOKEN: &str = "callback-token";

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<CallbackEvent>>,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        async fn handle(&self, notification: &Notification) -> Result<()> {
            self.seen.lock().unwrap().push(notification.event.clone());
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl EventHandler for Failing {
        async fn handle(&self, _: &Notification) -> Result<()> {
            Err(BrokerError::remote(40001, "invalid credential"))
        }
    }

    struct Panicking;

    #[async_trait]
    impl EventHandler for Panicking {
        async fn handle(&self, _: &Notification) -> Result<()> {
            panic!("handler bug")
        }
    }

    fn ring() -> KeyRing {
        KeyRing::new(PLATFORM, KeyMaterial::new(AesKey::generate(), TOKEN))
    }

    fn ticket_xml(app_id: &str, create_time: i64) -> String {
        format!(
            "<xml><AppId><![CDATA[{app_id}]]></AppId><CreateTime>{create_time}</CreateTime>\
             <InfoType><![CDATA[component_verify_ticket]]></InfoType>\
             <ComponentVerifyTicket><![CDATA[ticket@@@1]]></ComponentVerifyTicket></xml>"
        )
    }

    async fn encrypted_callback(ring: &KeyRing, inner: &str) -> (CallbackQuery, String) {
        let ciphertext = ring.encrypt(inner.as_bytes()).await.unwrap();
        let timestamp = Utc::now().timestamp().to_string();
        let query = CallbackQuery {
            msg_signature: Some(signature::sign(TOKEN, &timestamp, "n1", &ciphertext)),
            timestamp: Some(timestamp),
            nonce: Some("n1".into()),
            encrypt_type: Some("aes".into()),
            signature: None,
        };
        let body = format!("<xml><AppId><![CDATA[{PLATFORM}]]></AppId><Encrypt><![CDATA[{ciphertext}]]></Encrypt></xml>");
        (query, body)
    }

    fn recording_router(ring: KeyRing) -> (EventRouter, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let router = EventRouter::new(ring)
            .with_handler(EventKind::VerifyTicketRefresh, recorder.clone());
        (router, recorder)
    }

    fn seen(recorder: &Recorder) -> usize {
        recorder.seen.lock().unwrap().len()
    }

    #[tokio::test]
    async fn encrypted_notification_is_dispatched() {
        let ring = ring();
        let (router, recorder) = recording_router(ring.clone());
        let (query, body) = encrypted_callback(&ring, &ticket_xml(PLATFORM, Utc::now().timestamp())).await;

        assert_eq!(router.handle(&query, &body).await, ACKNOWLEDGEMENT);
        assert_eq!(
            recorder.seen.lock().unwrap().as_slice(),
            &[CallbackEvent::VerifyTicketRefresh {
                ticket: "ticket@@@1".into()
            }]
        );
    }

    #[tokio::test]
    async fn malformed_xml_is_acknowledged() {
        let (router, recorder) = recording_router(ring());
        let ack = router
            .handle(&CallbackQuery::default(), "<xml><AppId>oops</Foo>")
            .await;
        assert_eq!(ack, "success");
        assert_eq!(seen(&recorder), 0);
    }

    #[tokio::test]
    async fn bad_signature_is_not_dispatched() {
        let ring = ring();
        let (router, recorder) = recording_router(ring.clone());
        let (mut query, body) = encrypted_callback(&ring, &ticket_xml(PLATFORM, Utc::now().timestamp())).await;
        query.msg_signature = Some("0".repeat(40));

        assert_eq!(router.handle(&query, &body).await, ACKNOWLEDGEMENT);
        assert_eq!(seen(&recorder), 0);
    }

    #[tokio::test]
    async fn plain_notification_checks_query_signature() {
        let (router, recorder) = recording_router(ring());
        let body = ticket_xml(PLATFORM, Utc::now().timestamp());
        let mut query = CallbackQuery {
            signature: Some(signature::sign(TOKEN, "1700000000", "n", "")),
            timestamp: Some("1700000000".into()),
            nonce: Some("n".into()),
            ..CallbackQuery::default()
        };

        router.handle(&query, &body).await;
        assert_eq!(seen(&recorder), 1);

        query.signature = Some("deadbeef".into());
        router.handle(&query, &body).await;
        assert_eq!(seen(&recorder), 1);
    }

    #[tokio::test]
    async fn plain_notification_without_signature_is_rejected() {
        let (router, recorder) = recording_router(ring());
        let body = ticket_xml(PLATFORM, Utc::now().timestamp());
        let query = CallbackQuery {
            timestamp: Some(Utc::now().timestamp().to_string()),
            nonce: Some("n".into()),
            ..CallbackQuery::default()
        };

        assert_eq!(router.handle(&query, &body).await, ACKNOWLEDGEMENT);
        assert_eq!(seen(&recorder), 0);
        assert!(matches!(
            router.process(&CallbackQuery::default(), &body).await,
            Err(BrokerError::Crypto(CryptoError::SignatureMismatch))
        ));
    }

    #[tokio::test]
    async fn plain_key_rotation_is_refused_even_when_signed() {
        let ring = ring();
        let router = EventRouter::new(ring.clone())
            .with_handler(EventKind::KeyRotation, Arc::new(KeyRotationHandler::new(ring.clone())));
        let before = ring.current().await;

        let attacker_key = AesKey::generate();
        let body = format!(
            "<xml><AppId>{PLATFORM}</AppId><CreateTime>{}</CreateTime><InfoType>key_rotation</InfoType>\
             <EncodingAESKey>{}</EncodingAESKey><Token>attacker-token</Token></xml>",
            Utc::now().timestamp(),
            attacker_key.encoded()
        );

        let unsigned = CallbackQuery::default();
        assert_eq!(router.handle(&unsigned, &body).await, ACKNOWLEDGEMENT);

        let signed = CallbackQuery {
            signature: Some(signature::sign(TOKEN, "1700000000", "n", "")),
            timestamp: Some("1700000000".into()),
            nonce: Some("n".into()),
            ..CallbackQuery::default()
        };
        assert!(matches!(
            router.process(&signed, &body).await,
            Err(BrokerError::Validation(_))
        ));

        let after = ring.current().await;
        assert_eq!(after.key, before.key);
        assert_eq!(after.token, TOKEN);
        assert!(!ring.has_previous().await);
    }

    #[tokio::test]
    async fn verify_ticket_refresh_alias_is_dispatched() {
        let ring = ring();
        let (router, recorder) = recording_router(ring.clone());
        let inner = format!(
            "<xml><AppId>{PLATFORM}</AppId><CreateTime>{}</CreateTime>\
             <InfoType>verify_ticket_refresh</InfoType>\
             <ComponentVerifyTicket>ticket@@@alias</ComponentVerifyTicket></xml>",
            Utc::now().timestamp()
        );
        let (query, body) = encrypted_callback(&ring, &inner).await;

        router.handle(&query, &body).await;
        assert_eq!(
            recorder.seen.lock().unwrap().as_slice(),
            &[CallbackEvent::VerifyTicketRefresh {
                ticket: "ticket@@@alias".into()
            }]
        );
    }

    #[tokio::test]
    async fn stale_and_foreign_notifications_are_dropped() {
        let ring = ring();
        let (router, recorder) = recording_router(ring.clone());

        let stale = ticket_xml(PLATFORM, Utc::now().timestamp() - 3600);
        let (query, body) = encrypted_callback(&ring, &stale).await;
        router.handle(&query, &body).await;

        let foreign = ticket_xml("wx-someone-else", Utc::now().timestamp());
        let (query, body) = encrypted_callback(&ring, &foreign).await;
        router.handle(&query, &body).await;

        assert_eq!(seen(&recorder), 0);
    }

    #[tokio::test]
    async fn unstamped_notifications_follow_policy() {
        let ring = ring();
        let (router, recorder) = recording_router(ring.clone());
        let (query, body) = encrypted_callback(&ring, &ticket_xml(PLATFORM, 0)).await;

        router.handle(&query, &body).await;
        assert_eq!(seen(&recorder), 1);

        let strict = router.with_accept_unstamped_events(false);
        strict.handle(&query, &body).await;
        assert_eq!(seen(&recorder), 1);
    }

    #[tokio::test]
    async fn handler_failures_and_panics_are_swallowed() {
        let ring = ring();
        let (query, body) = encrypted_callback(&ring, &ticket_xml(PLATFORM, Utc::now().timestamp())).await;

        let failing = EventRouter::new(ring.clone()).with_handler(EventKind::VerifyTicketRefresh, Arc::new(Failing));
        assert_eq!(failing.handle(&query, &body).await, ACKNOWLEDGEMENT);

        let panicking =
            EventRouter::new(ring).with_handler(EventKind::VerifyTicketRefresh, Arc::new(Panicking));
        assert_eq!(panicking.handle(&query, &body).await, ACKNOWLEDGEMENT);
    }

    #[tokio::test]
    async fn key_rotation_keeps_old_key_for_in_flight_messages() {
        let ring = ring();
        let router = EventRouter::new(ring.clone())
            .with_handler(EventKind::KeyRotation, Arc::new(KeyRotationHandler::new(ring.clone())));
        let recorder = Arc::new(Recorder::default());
        let router = router.with_handler(EventKind::VerifyTicketRefresh, recorder.clone());

        // encrypted under the key that is about to be replaced
        let (late_query, late_body) =
            encrypted_callback(&ring, &ticket_xml(PLATFORM, Utc::now().timestamp())).await;

        let new_key = AesKey::generate();
        let rotation = format!(
            "<xml><AppId>{PLATFORM}</AppId><CreateTime>{}</CreateTime><InfoType>key_rotation</InfoType>\
             <EncodingAESKey>{}</EncodingAESKey></xml>",
            Utc::now().timestamp(),
            new_key.encoded()
        );
        let (query, body) = encrypted_callback(&ring, &rotation).await;
        router.handle(&query, &body).await;
        assert_eq!(ring.current().await.key, new_key);

        router.handle(&late_query, &late_body).await;
        assert_eq!(seen(&recorder), 1);

        ring.clear_previous().await;
        router.handle(&late_query, &late_body).await;
        assert_eq!(seen(&recorder), 1);
    }
}
