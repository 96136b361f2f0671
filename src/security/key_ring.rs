use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio::time::{sleep, Duration};
use tracing::{debug, info};

use crate::error::CryptoError;
use crate::security::msg_crypto::{self, AesKey};
use crate::security::signature;

/// A symmetric key plus the shared secret used in callback signatures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    pub key: AesKey,
    pub token: String,
}

impl KeyMaterial {
    pub fn new(key: AesKey, token: impl Into<String>) -> Self {
        Self {
            key,
            token: token.into(),
        }
    }
}

#[derive(Debug)]
struct RingState {
    current: KeyMaterial,
    previous: Option<KeyMaterial>,
    rotated_at: Option<DateTime<Utc>>,
}

/// Current and previous key material for one platform id.
///
/// Encryption always uses the current key. Decryption and signature checks
/// fall back to the previous material until the grace window is closed with
/// [`KeyRing::clear_previous`] or [`KeyRing::expire_previous`].
#[derive(Debug, Clone)]
pub struct KeyRing {
    origin_id: Arc<str>,
    state: Arc<RwLock<RingState>>,
}

impl KeyRing {
    pub fn new(origin_id: impl Into<String>, current: KeyMaterial) -> Self {
        Self {
            origin_id: Arc::from(origin_id.into()),
            state: Arc::new(RwLock::new(RingState {
                current,
                previous: None,
                rotated_at: None,
            })),
        }
    }

    pub fn origin_id(&self) -> &str {
        &self.origin_id
    }

    pub async fn current(&self) -> KeyMaterial {
        self.state.read().await.current.clone()
    }

    pub async fn has_previous(&self) -> bool {
        self.state.read().await.previous.is_some()
    }

    pub async fn rotated_at(&self) -> Option<DateTime<Utc>> {
        self.state.read().await.rotated_at
    }

    /// Installs `key` as current and keeps the old material as previous.
    ///
    /// `token` replaces the signing secret when given; otherwise the current
    /// secret carries over. Re-announcing the current key is a no-op.
    pub async fn rotate_key(&self, key: AesKey, token: Option<String>) {
        let mut state = self.state.write().await;
        let token = token.unwrap_or_else(|| state.current.token.clone());
        let next = KeyMaterial::new(key, token);
        if next == state.current {
            debug!("announced key matches current key; nothing to rotate");
            return;
        }

        let old = std::mem::replace(&mut state.current, next);
        state.previous = Some(old);
        state.rotated_at = Some(Utc::now());
        info!(origin_id = %self.origin_id, "callback key rotated; previous key kept for grace window");
    }

    pub async fn clear_previous(&self) {
        let mut state = self.state.write().await;
        if state.previous.take().is_some() {
            info!(origin_id = %self.origin_id, "previous callback key retired");
        }
    }

    /// Retires the previous key once `grace` has elapsed since rotation.
    /// Returns true when a key was retired.
    pub async fn expire_previous(&self, grace: Duration) -> bool {
        let mut state = self.state.write().await;
        let (Some(_), Some(rotated_at)) = (&state.previous, state.rotated_at) else {
            return false;
        };
        let elapsed = (Utc::now() - rotated_at).to_std().unwrap_or_default();
        if elapsed < grace {
            return false;
        }
        state.previous = None;
        info!(
            origin_id = %self.origin_id,
            elapsed_secs = elapsed.as_secs(),
            "grace window elapsed; previous callback key retired"
        );
        true
    }

    pub async fn encrypt(&self, plaintext: &[u8]) -> Result<String, CryptoError> {
        let key = self.state.read().await.current.key.clone();
        msg_crypto::encrypt(plaintext, &self.origin_id, &key)
    }

    /// Decrypts with the current key, then once with the previous key if the
    /// failure could be key-related. The first error is reported.
    pub async fn decrypt(&self, envelope: &str) -> Result<Vec<u8>, CryptoError> {
        let (current, previous) = {
            let state = self.state.read().await;
            (
                state.current.key.clone(),
                state.previous.as_ref().map(|m| m.key.clone()),
            )
        };

        match msg_crypto::decrypt_for(envelope, &current, &self.origin_id) {
            Ok(payload) => Ok(payload),
            Err(err) if err.is_key_dependent() => {
                let Some(previous) = previous else {
                    return Err(err);
                };
                debug!(error = %err, "current key failed; retrying with previous key");
                msg_crypto::decrypt_for(envelope, &previous, &self.origin_id).map_err(|_| err)
            }
            Err(err) => Err(err),
        }
    }

    pub async fn sign(&self, timestamp: &str, nonce: &str, payload: &str) -> String {
        let token = self.state.read().await.current.token.clone();
        signature::sign(&token, timestamp, nonce, payload)
    }

    /// Checks a callback signature against the current secret, then the
    /// previous one during a grace window.
    pub async fn verify_signature(
        &self,
        timestamp: &str,
        nonce: &str,
        payload: &str,
        provided: &str,
    ) -> Result<(), CryptoError> {
        let (current, previous) = {
            let state = self.state.read().await;
            (
                state.current.token.clone(),
                state.previous.as_ref().map(|m| m.token.clone()),
            )
        };

        match signature::verify(&current, timestamp, nonce, payload, provided) {
            Ok(()) => Ok(()),
            Err(err) => match previous {
                Some(token) if token != current => {
                    signature::verify(&token, timestamp, nonce, payload, provided).map_err(|_| err)
                }
                _ => Err(err),
            },
        }
    }
}

/// Background task that closes rotation grace windows.
///
/// Checks every `interval` and retires the previous key once it is older
/// than `grace`.
pub fn spawn_grace_reaper(
    ring: KeyRing,
    grace: Duration,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            sleep(interval).await;
            if ring.expire_previous(grace).await {
                debug!(origin_id = %ring.origin_id(), "grace reaper retired previous key");
            }
        }
    })
}
