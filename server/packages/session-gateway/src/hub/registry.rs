use std::collections::HashMap;
use std::sync::Arc;

use session_gateway_error::GatewayError;
use tokio::sync::Mutex;

use super::{HubDeps, HubSnapshot, SessionHub};

pub(super) type HubMap = Mutex<HashMap<String, Arc<SessionHub>>>;

/// One hub per session on this instance, created on first use.
///
/// Hubs leave on automation termination, or when they lose a lease race
/// with nobody subscribed.
pub struct HubRegistry {
    deps: HubDeps,
    hubs: Arc<HubMap>,
}

impl HubRegistry {
    pub fn new(deps: HubDeps) -> Self {
        Self {
            deps,
            hubs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn deps(&self) -> &HubDeps {
        &self.deps
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<SessionHub>> {
        self.hubs.lock().await.get(session_id).cloned()
    }

    pub async fn get_or_create(&self, session_id: &str) -> Result<Arc<SessionHub>, GatewayError> {
        let mut hubs = self.hubs.lock().await;
        if let Some(hub) = hubs.get(session_id) {
            return Ok(hub.clone());
        }

        let session = self
            .deps
            .persistence
            .get_session(session_id)
            .await?
            .ok_or_else(|| GatewayError::SessionNotFound {
                session_id: session_id.to_string(),
            })?;
        let hub = SessionHub::registered(session, self.deps.clone(), Arc::downgrade(&self.hubs));
        hubs.insert(session_id.to_string(), hub.clone());
        tracing::debug!(session_id = %session_id, "session hub created");
        Ok(hub)
    }

    /// Snapshot of the registered hub, or of the stored record when this
    /// instance has no hub for the session. Never registers one.
    pub async fn snapshot(&self, session_id: &str) -> Result<HubSnapshot, GatewayError> {
        if let Some(hub) = self.get(session_id).await {
            return Ok(hub.snapshot());
        }
        let session = self
            .deps
            .persistence
            .get_session(session_id)
            .await?
            .ok_or_else(|| GatewayError::SessionNotFound {
                session_id: session_id.to_string(),
            })?;
        Ok(SessionHub::new(session, self.deps.clone()).snapshot())
    }

    pub async fn describe(&self) -> Vec<HubSnapshot> {
        let hubs: Vec<_> = self.hubs.lock().await.values().cloned().collect();
        let mut snapshots: Vec<_> = hubs.iter().map(|hub| hub.snapshot()).collect();
        snapshots.sort_by(|a, b| a.session.id.cmp(&b.session.id));
        snapshots
    }

    pub async fn shutdown_all(&self) {
        let hubs: Vec<_> = self.hubs.lock().await.drain().map(|(_, hub)| hub).collect();
        tracing::info!(count = hubs.len(), "shutting down session hubs");
        futures::future::join_all(hubs.iter().map(|hub| hub.shutdown())).await;
    }
}

impl std::fmt::Debug for HubRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubRegistry")
            .field("instance_id", &self.deps.instance_id)
            .finish()
    }
}
