use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::broker::TokenBroker;
use crate::comms::events::{CallbackEvent, Notification};
use crate::error::Result;
use crate::security::audit_log::AuditLogger;
use crate::security::key_ring::KeyRing;
use crate::security::msg_crypto::AesKey;
use crate::store::{CredentialStore, VerifyTicket};

/// Reacts to one kind of validated notification.
///
/// Errors are logged and audited by the router; they never reach the sender.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, notification: &Notification) -> Result<()>;
}

/// `authorized` / `updateauthorized`: exchange the code for tenant credentials.
pub struct AuthorizationHandler {
    broker: TokenBroker,
    audit: AuditLogger,
}

impl AuthorizationHandler {
    pub fn new(broker: TokenBroker) -> Self {
        Self {
            broker,
            audit: AuditLogger::new(),
        }
    }
}

#[async_trait]
impl EventHandler for AuthorizationHandler {
    async fn handle(&self, notification: &Notification) -> Result<()> {
        let grant = match &notification.event {
            CallbackEvent::Authorized(grant) | CallbackEvent::UpdateAuthorized(grant) => grant,
            _ => return Ok(()),
        };

        let credential = self
            .broker
            .exchange_authorization_code(&grant.authorization_code)
            .await?;
        if credential.tenant_id != grant.tenant_id {
            info!(
                announced = %grant.tenant_id,
                exchanged = %credential.tenant_id,
                "authorization code resolved to a different tenant"
            );
        }
        self.audit
            .tenant_authorized(&credential.tenant_id, &notification.info_type);
        Ok(())
    }
}

/// `unauthorized`: the tenant revoked access, drop everything held for it.
pub struct RevocationHandler {
    broker: TokenBroker,
    audit: AuditLogger,
}

impl RevocationHandler {
    pub fn new(broker: TokenBroker) -> Self {
        Self {
            broker,
            audit: AuditLogger::new(),
        }
    }
}

#[async_trait]
impl EventHandler for RevocationHandler {
    async fn handle(&self, notification: &Notification) -> Result<()> {
        if let CallbackEvent::Unauthorized { tenant_id } = &notification.event {
            self.broker.forget_tenant(tenant_id).await?;
            self.audit.tenant_revoked(tenant_id);
        }
        Ok(())
    }
}

/// `component_verify_ticket`: persist the freshly pushed ticket.
pub struct VerifyTicketHandler {
    store: Arc<dyn CredentialStore>,
    audit: AuditLogger,
}

impl VerifyTicketHandler {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self {
            store,
            audit: AuditLogger::new(),
        }
    }
}

#[async_trait]
impl EventHandler for VerifyTicketHandler {
    async fn handle(&self, notification: &Notification) -> Result<()> {
        if let CallbackEvent::VerifyTicketRefresh { ticket } = &notification.event {
            self.store
                .save_verify_ticket(&VerifyTicket::received_now(ticket.as_str()))
                .await?;
            self.audit.verify_ticket_stored(notification.create_time);
        }
        Ok(())
    }
}

/// `key_rotation`: install the announced key, keeping the old one for the
/// grace window.
pub struct KeyRotationHandler {
    key_ring: KeyRing,
    audit: AuditLogger,
}

impl KeyRotationHandler {
    pub fn new(key_ring: KeyRing) -> Self {
        Self {
            key_ring,
            audit: AuditLogger::new(),
        }
    }
}

#[async_trait]
impl EventHandler for KeyRotationHandler {
    async fn handle(&self, notification: &Notification) -> Result<()> {
        if let CallbackEvent::KeyRotation {
            encoding_aes_key,
            token,
        } = &notification.event
        {
            let key = AesKey::from_encoded(encoding_aes_key)?;
            self.key_ring.rotate_key(key, token.clone()).await;
            self.audit.key_rotated(self.key_ring.origin_id());
        }
        Ok(())
    }
}
