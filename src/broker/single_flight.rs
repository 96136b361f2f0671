use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Identifies one independently refreshable credential.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FlightKey {
    Platform,
    PreAuth,
    Tenant(String),
    SigningTicket(String),
}

/// Lazily created async mutex per [`FlightKey`].
///
/// Holding the guard means "I am the one refreshing this credential"; other
/// callers for the same key wait and then re-read the cache.
#[derive(Debug, Clone, Default)]
pub struct FlightLocks {
    locks: Arc<Mutex<HashMap<FlightKey, Arc<Mutex<()>>>>>,
}

impl FlightLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, key: FlightKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            // idle per-tenant entries would otherwise accumulate forever
            locks.retain(|k, l| Arc::strong_count(l) > 1 || !is_per_tenant(k));
            locks.entry(key).or_default().clone()
        };
        lock.lock_owned().await
    }

    pub async fn tracked_keys(&self) -> usize {
        self.locks.lock().await.len()
    }
}

fn is_per_tenant(key: &FlightKey) -> bool {
    matches!(key, FlightKey::Tenant(_) | FlightKey::SigningTicket(_))
}
