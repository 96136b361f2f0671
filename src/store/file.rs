use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    live, CredentialStore, Expiring, PlatformCredential, PreAuthorizationCode, StoreError,
    TenantCredential, VerifyTicket,
};

const PLATFORM_FILE: &str = "platform_credential.json";
const PRE_AUTH_FILE: &str = "pre_auth_code.json";
const VERIFY_TICKET_FILE: &str = "verify_ticket.json";
const TENANTS_DIR: &str = "tenants";

/// JSON-document store rooted at a directory.
///
/// Layout: one document per singleton kind at the root and one document per
/// tenant under `tenants/`, named by tenant id. Writes go to a hidden temp
/// file first and are renamed over the target, so readers only ever see a
/// complete document.
///
/// Singleton reads, writes and deletes are serialized per handle (clones
/// share the lock), so an expired read never removes a document written
/// after it.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
    singletons: Arc<Mutex<()>>,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            singletons: Arc::new(Mutex::new(())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn tenants_dir(&self) -> PathBuf {
        self.root.join(TENANTS_DIR)
    }

    fn tenant_path(&self, tenant_id: &str) -> Result<PathBuf, StoreError> {
        validate_tenant_id(tenant_id)?;
        Ok(self.tenants_dir().join(format!("{tenant_id}.json")))
    }

    async fn read_singleton<T>(&self, file: &str) -> Result<Option<T>, StoreError>
    where
        T: DeserializeOwned + Expiring,
    {
        let path = self.root.join(file);
        let _guard = self.singletons.lock().await;
        let (record, expired) = live(read_json::<T>(&path).await?);
        if expired {
            debug!(file, "removing expired credential document");
            remove_if_exists(&path).await?;
        }
        Ok(record)
    }

    async fn write_singleton<T: Serialize>(&self, file: &str, value: &T) -> Result<(), StoreError> {
        let _guard = self.singletons.lock().await;
        write_json_atomic(&self.root.join(file), value).await
    }

    async fn remove_singleton(&self, file: &str) -> Result<(), StoreError> {
        let _guard = self.singletons.lock().await;
        remove_if_exists(&self.root.join(file)).await
    }
}

fn validate_tenant_id(tenant_id: &str) -> Result<(), StoreError> {
    let bad = tenant_id.is_empty()
        || tenant_id.starts_with('.')
        || tenant_id.contains(['/', '\\', '\0']);
    if bad {
        return Err(StoreError::InvalidTenantId(tenant_id.to_string()));
    }
    Ok(())
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).await?;

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = parent.join(format!(".{name}.{}.tmp", Uuid::new_v4()));

    fs::write(&tmp, serde_json::to_vec_pretty(value)?).await?;
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

async fn remove_if_exists(path: &Path) -> Result<(), StoreError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl CredentialStore for FileStore {
    async fn platform_credential(&self) -> Result<Option<PlatformCredential>, StoreError> {
        self.read_singleton(PLATFORM_FILE).await
    }

    async fn save_platform_credential(&self, credential: &PlatformCredential) -> Result<(), StoreError> {
        self.write_singleton(PLATFORM_FILE, credential).await
    }

    async fn delete_platform_credential(&self) -> Result<(), StoreError> {
        self.remove_singleton(PLATFORM_FILE).await
    }

    async fn pre_authorization_code(&self) -> Result<Option<PreAuthorizationCode>, StoreError> {
        self.read_singleton(PRE_AUTH_FILE).await
    }

    async fn save_pre_authorization_code(&self, code: &PreAuthorizationCode) -> Result<(), StoreError> {
        self.write_singleton(PRE_AUTH_FILE, code).await
    }

    async fn delete_pre_authorization_code(&self) -> Result<(), StoreError> {
        self.remove_singleton(PRE_AUTH_FILE).await
    }

    async fn verify_ticket(&self) -> Result<Option<VerifyTicket>, StoreError> {
        self.read_singleton(VERIFY_TICKET_FILE).await
    }

    async fn save_verify_ticket(&self, ticket: &VerifyTicket) -> Result<(), StoreError> {
        self.write_singleton(VERIFY_TICKET_FILE, ticket).await
    }

    async fn delete_verify_ticket(&self) -> Result<(), StoreError> {
        self.remove_singleton(VERIFY_TICKET_FILE).await
    }

    async fn tenant_credential(&self, tenant_id: &str) -> Result<Option<TenantCredential>, StoreError> {
        read_json(&self.tenant_path(tenant_id)?).await
    }

    async fn save_tenant_credential(&self, credential: &TenantCredential) -> Result<(), StoreError> {
        let path = self.tenant_path(&credential.tenant_id)?;
        write_json_atomic(&path, credential).await
    }

    async fn delete_tenant_credential(&self, tenant_id: &str) -> Result<(), StoreError> {
        remove_if_exists(&self.tenant_path(tenant_id)?).await
    }

    async fn tenant_ids(&self) -> Result<Vec<String>, StoreError> {
        let mut entries = match fs::read_dir(self.tenants_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            if let Some(id) = name.strip_suffix(".json") {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn delete_all_tenant_credentials(&self) -> Result<(), StoreError> {
        for id in self.tenant_ids().await? {
            if let Err(e) = self.delete_tenant_credential(&id).await {
                warn!(tenant_id = %id, error = %e, "failed to delete tenant credential");
                return Err(e);
            }
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        fs::create_dir_all(self.tenants_dir()).await?;
        let marker = self.root.join(".health");
        write_json_atomic(&marker, &"ok").await?;
        remove_if_exists(&marker).await
    }
}
