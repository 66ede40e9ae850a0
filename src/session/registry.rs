//! Session registry
//!
//! Maps device-id to its live session. Connecting with an existing
//! device-id closes and replaces the prior session; removal fires the
//! session's cancellation token so in-flight provider calls abort.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use super::Session;

#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a session, closing any prior one for the same device
    pub async fn insert(&self, session: Arc<Session>) {
        let prior = {
            let mut map = self.inner.lock().await;
            map.insert(session.device_id.clone(), session.clone())
        };
        if let Some(old) = prior {
            info!(device = %old.device_id, "replacing existing session");
            old.shutdown().await;
        }
    }

    /// Remove a session by device id, but only if it is still the
    /// registered one (a replacement may already have taken the slot).
    pub async fn remove(&self, device_id: &str, session_id: &str) {
        let removed = {
            let mut map = self.inner.lock().await;
            match map.get(device_id) {
                Some(current) if current.session_id == session_id => map.remove(device_id),
                _ => None,
            }
        };
        if let Some(session) = removed {
            session.shutdown().await;
            info!(device = %device_id, "session removed");
        }
    }

    pub async fn get(&self, device_id: &str) -> Option<Arc<Session>> {
        self.inner.lock().await.get(device_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}
