use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::{
    discard_expired, live, CredentialStore, PlatformCredential, PreAuthorizationCode, StoreError, TenantCredential,
    VerifyTicket,
};

#[derive(Debug, Default)]
struct MemoryState {
    platform: Option<PlatformCredential>,
    pre_auth: Option<PreAuthorizationCode>,
    verify_ticket: Option<VerifyTicket>,
    tenants: HashMap<String, TenantCredential>,
}

/// In-process store. Cloning shares the underlying state.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn platform_credential(&self) -> Result<Option<PlatformCredential>, StoreError> {
        let (record, expired) = live(self.state.read().await.platform.clone());
        if expired && discard_expired(&mut self.state.write().await.platform) {
            debug!("dropped expired platform credential");
        }
        Ok(record)
    }

    async fn save_platform_credential(&self, credential: &PlatformCredential) -> Result<(), StoreError> {
        self.state.write().await.platform = Some(credential.clone());
        Ok(())
    }

    async fn delete_platform_credential(&self) -> Result<(), StoreError> {
        self.state.write().await.platform = None;
        Ok(())
    }

    async fn pre_authorization_code(&self) -> Result<Option<PreAuthorizationCode>, StoreError> {
        let (record, expired) = live(self.state.read().await.pre_auth.clone());
        if expired && discard_expired(&mut self.state.write().await.pre_auth) {
            debug!("dropped expired pre-authorization code");
        }
        Ok(record)
    }

    async fn save_pre_authorization_code(&self, code: &PreAuthorizationCode) -> Result<(), StoreError> {
        self.state.write().await.pre_auth = Some(code.clone());
        Ok(())
    }

    async fn delete_pre_authorization_code(&self) -> Result<(), StoreError> {
        self.state.write().await.pre_auth = None;
        Ok(())
    }

    async fn verify_ticket(&self) -> Result<Option<VerifyTicket>, StoreError> {
        let (record, expired) = live(self.state.read().await.verify_ticket.clone());
        if expired && discard_expired(&mut self.state.write().await.verify_ticket) {
            debug!("dropped expired verify ticket");
        }
        Ok(record)
    }

    async fn save_verify_ticket(&self, ticket: &VerifyTicket) -> Result<(), StoreError> {
        self.state.write().await.verify_ticket = Some(ticket.clone());
        Ok(())
    }

    async fn delete_verify_ticket(&self) -> Result<(), StoreError> {
        self.state.write().await.verify_ticket = None;
        Ok(())
    }

    async fn tenant_credential(&self, tenant_id: &str) -> Result<Option<TenantCredential>, StoreError> {
        Ok(self.state.read().await.tenants.get(tenant_id).cloned())
    }

    async fn save_tenant_credential(&self, credential: &TenantCredential) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state
            .tenants
            .insert(credential.tenant_id.clone(), credential.clone());
        Ok(())
    }

    async fn delete_tenant_credential(&self, tenant_id: &str) -> Result<(), StoreError> {
        self.state.write().await.tenants.remove(tenant_id);
        Ok(())
    }

    async fn tenant_ids(&self) -> Result<Vec<String>, StoreError> {
        let mut ids: Vec<String> = self.state.read().await.tenants.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn delete_all_tenant_credentials(&self) -> Result<(), StoreError> {
        self.state.write().await.tenants.clear();
        Ok(())
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
