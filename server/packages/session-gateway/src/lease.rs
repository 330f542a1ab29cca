//! Owner lease bookkeeping for one session hub.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use session_gateway_error::GatewayError;
use session_gateway_lease_store::{LeaseAcquisition, LeaseStore, LeaseStoreError, OwnerLease};
use tokio::task::JoinHandle;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum OwnershipState {
    Unowned,
    Acquiring,
    Owned,
    Releasing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseSettings {
    pub ttl: Duration,
    pub renew_interval: Duration,
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            renew_interval: Duration::from_secs(10),
        }
    }
}

pub(crate) fn store_error(err: LeaseStoreError) -> GatewayError {
    GatewayError::LeaseStore {
        message: err.to_string(),
    }
}

/// Holds and renews the owner lease of one session on behalf of this instance.
///
/// Remote release and runtime-lease clearing only happen from `Owned`, so an
/// instance that lost a race never deletes the winner's lease.
pub struct LeaseManager {
    store: Arc<dyn LeaseStore>,
    session_id: String,
    instance_id: String,
    settings: LeaseSettings,
    state: Arc<Mutex<OwnershipState>>,
    renewal: Mutex<Option<JoinHandle<()>>>,
}

impl LeaseManager {
    pub fn new(
        store: Arc<dyn LeaseStore>,
        session_id: impl Into<String>,
        instance_id: impl Into<String>,
        settings: LeaseSettings,
    ) -> Self {
        Self {
            store,
            session_id: session_id.into(),
            instance_id: instance_id.into(),
            settings,
            state: Arc::new(Mutex::new(OwnershipState::Unowned)),
            renewal: Mutex::new(None),
        }
    }

    pub fn state(&self) -> OwnershipState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn owns_owner_lease(&self) -> bool {
        self.state() == OwnershipState::Owned
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn set_state(&self, state: OwnershipState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Moves `from -> to` atomically. Returns the state actually observed.
    fn transition(&self, from: OwnershipState, to: OwnershipState) -> Result<(), OwnershipState> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != from {
            return Err(*state);
        }
        *state = to;
        Ok(())
    }

    /// Acquires the owner lease, or refreshes it when already owned.
    pub async fn acquire(&self) -> Result<OwnerLease, GatewayError> {
        let refreshing = match self.transition(OwnershipState::Unowned, OwnershipState::Acquiring) {
            Ok(()) => false,
            Err(OwnershipState::Owned) => true,
            Err(other) => {
                return Err(GatewayError::Conflict {
                    message: format!(
                        "cannot acquire lease for session {} while {other:?}",
                        self.session_id
                    ),
                });
            }
        };

        let acquisition = self
            .store
            .acquire(&self.session_id, &self.instance_id, self.settings.ttl)
            .await;

        let acquisition = match acquisition {
            Ok(acquisition) => acquisition,
            Err(err) => {
                if !refreshing {
                    let _ = self.transition(OwnershipState::Acquiring, OwnershipState::Unowned);
                }
                return Err(store_error(err));
            }
        };

        let lease = match acquisition {
            LeaseAcquisition::Acquired(lease) => lease,
            LeaseAcquisition::Held(holder) => {
                if refreshing {
                    self.abort_renewal();
                    self.set_state(OwnershipState::Unowned);
                } else {
                    let _ = self.transition(OwnershipState::Acquiring, OwnershipState::Unowned);
                }
                tracing::info!(
                    session_id = %self.session_id,
                    instance_id = %self.instance_id,
                    holder = %holder.instance_id,
                    "owner lease held by another instance"
                );
                return Err(GatewayError::LeaseConflict {
                    session_id: self.session_id.clone(),
                    owner_instance_id: holder.instance_id,
                });
            }
        };

        if refreshing {
            return Ok(lease);
        }

        if self
            .transition(OwnershipState::Acquiring, OwnershipState::Owned)
            .is_err()
        {
            // Stopped while the store call was in flight; give the lease back.
            if let Err(err) = self.store.release(&self.session_id, &self.instance_id).await {
                tracing::warn!(session_id = %self.session_id, error = %err, "failed to release abandoned lease");
            }
            return Err(GatewayError::Conflict {
                message: format!("lease acquisition for session {} was cancelled", self.session_id),
            });
        }

        self.start_renewal();
        tracing::info!(
            session_id = %self.session_id,
            instance_id = %self.instance_id,
            expires_at = %lease.expires_at,
            "owner lease acquired"
        );
        Ok(lease)
    }

    fn start_renewal(&self) {
        let store = self.store.clone();
        let state = self.state.clone();
        let session_id = self.session_id.clone();
        let instance_id = self.instance_id.clone();
        let settings = self.settings;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(settings.renew_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match store.renew(&session_id, &instance_id, settings.ttl).await {
                    Ok(true) => {
                        tracing::trace!(session_id = %session_id, "owner lease renewed");
                    }
                    Ok(false) => {
                        let mut current = state.lock().unwrap_or_else(PoisonError::into_inner);
                        if *current == OwnershipState::Owned {
                            *current = OwnershipState::Unowned;
                        }
                        tracing::warn!(
                            session_id = %session_id,
                            instance_id = %instance_id,
                            "owner lease lost"
                        );
                        break;
                    }
                    Err(err) => {
                        tracing::warn!(session_id = %session_id, error = %err, "owner lease renewal failed");
                    }
                }
            }
        });

        let mut renewal = self.renewal.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = renewal.replace(handle) {
            previous.abort();
        }
    }

    fn abort_renewal(&self) {
        if let Some(handle) = self
            .renewal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }

    /// Records that this owner brought the runtime up.
    pub async fn write_runtime_lease(&self) -> Result<(), GatewayError> {
        if !self.owns_owner_lease() {
            return Err(GatewayError::Conflict {
                message: format!(
                    "instance {} does not own session {}",
                    self.instance_id, self.session_id
                ),
            });
        }
        self.store
            .set_runtime_lease(&self.session_id, &self.instance_id)
            .await
            .map_err(store_error)
    }

    /// Cancels renewal and, only when owned, releases the owner lease and
    /// clears the runtime lease. Always leaves the manager `Unowned`.
    pub async fn stop_lease_renewal(&self) {
        self.abort_renewal();

        if self
            .transition(OwnershipState::Owned, OwnershipState::Releasing)
            .is_err()
        {
            self.set_state(OwnershipState::Unowned);
            return;
        }

        match self.store.release(&self.session_id, &self.instance_id).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(session_id = %self.session_id, "owner lease was already gone on release");
            }
            Err(err) => {
                tracing::warn!(session_id = %self.session_id, error = %err, "owner lease release failed");
            }
        }
        if let Err(err) = self
            .store
            .clear_runtime_lease(&self.session_id, &self.instance_id)
            .await
        {
            tracing::warn!(session_id = %self.session_id, error = %err, "runtime lease clear failed");
        }

        self.set_state(OwnershipState::Unowned);
        tracing::info!(session_id = %self.session_id, instance_id = %self.instance_id, "owner lease released");
    }
}

impl Drop for LeaseManager {
    fn drop(&mut self) {
        self.abort_renewal();
    }
}

impl std::fmt::Debug for LeaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseManager")
            .field("session_id", &self.session_id)
            .field("instance_id", &self.instance_id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use session_gateway_lease_store::MemoryLeaseStore;

    use super::*;

    fn manager(store: &Arc<MemoryLeaseStore>, instance_id: &str) -> LeaseManager {
        let store: Arc<dyn LeaseStore> = store.clone();
        LeaseManager::new(store, "ses_1", instance_id, LeaseSettings::default())
    }

    #[tokio::test]
    async fn second_instance_gets_lease_conflict() {
        let store = Arc::new(MemoryLeaseStore::new());
        let first = manager(&store, "gw-a");
        let second = manager(&store, "gw-b");

        first.acquire().await.expect("acquire");
        let err = second.acquire().await.expect_err("conflict");
        assert_eq!(
            err,
            GatewayError::LeaseConflict {
                session_id: "ses_1".to_string(),
                owner_instance_id: "gw-a".to_string(),
            }
        );
        assert_eq!(second.state(), OwnershipState::Unowned);
        assert!(first.owns_owner_lease());
    }

    #[tokio::test]
    async fn stop_without_ownership_keeps_the_winner_lease() {
        let store = Arc::new(MemoryLeaseStore::new());
        let winner = manager(&store, "gw-a");
        let loser = manager(&store, "gw-b");
        winner.acquire().await.expect("acquire");
        winner.write_runtime_lease().await.expect("runtime lease");
        let _ = loser.acquire().await;

        loser.stop_lease_renewal().await;

        let owner = store.owner("ses_1").await.expect("owner").expect("still held");
        assert_eq!(owner.instance_id, "gw-a");
        assert!(store.runtime_lease("ses_1").await.expect("read").is_some());
    }

    #[tokio::test]
    async fn stop_releases_and_clears_when_owned() {
        let store = Arc::new(MemoryLeaseStore::new());
        let owner = manager(&store, "gw-a");
        owner.acquire().await.expect("acquire");
        owner.write_runtime_lease().await.expect("runtime lease");

        owner.stop_lease_renewal().await;
        owner.stop_lease_renewal().await;

        assert_eq!(owner.state(), OwnershipState::Unowned);
        assert!(store.owner("ses_1").await.expect("owner").is_none());
        assert!(store.runtime_lease("ses_1").await.expect("read").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_keeps_the_lease_past_its_ttl() {
        let store = Arc::new(MemoryLeaseStore::new());
        let owner = manager(&store, "gw-a");
        owner.acquire().await.expect("acquire");

        for _ in 0..10 {
            tokio::time::sleep(Duration::from_secs(10)).await;
        }

        let contender = manager(&store, "gw-b");
        assert!(contender.acquire().await.is_err());
        assert!(owner.owns_owner_lease());
    }

    #[tokio::test(start_paused = true)]
    async fn lost_lease_moves_to_unowned() {
        let store = Arc::new(MemoryLeaseStore::new());
        let owner = manager(&store, "gw-a");
        owner.acquire().await.expect("acquire");

        // Another instance takes over behind our back.
        store.release("ses_1", "gw-a").await.expect("release");
        store
            .acquire("ses_1", "gw-b", Duration::from_secs(30))
            .await
            .expect("takeover");

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(owner.state(), OwnershipState::Unowned);
    }
}
