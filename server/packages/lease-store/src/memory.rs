use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::{
    datetime_from_ms, now_ms, ttl_ms, LeaseAcquisition, LeaseFuture, LeaseStore, LeaseStoreError,
    OwnerLease, RuntimeLease,
};

/// Process-local lease store.
///
/// Expiry is judged on the tokio clock so paused-time tests can step past a
/// TTL. Sharing one instance across several hubs (behind an `Arc`) simulates
/// several gateway instances in one process.
#[derive(Debug, Default)]
pub struct MemoryLeaseStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    owners: HashMap<String, OwnerEntry>,
    runtimes: HashMap<String, RuntimeLease>,
}

#[derive(Debug, Clone)]
struct OwnerEntry {
    instance_id: String,
    deadline: Instant,
    expires_at: DateTime<Utc>,
}

impl OwnerEntry {
    fn new(instance_id: &str, ttl: Duration) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            deadline: Instant::now() + ttl,
            expires_at: datetime_from_ms(now_ms().saturating_add(ttl_ms(ttl))),
        }
    }

    fn is_live(&self) -> bool {
        self.deadline > Instant::now()
    }

    fn to_lease(&self, session_id: &str) -> OwnerLease {
        OwnerLease {
            session_id: session_id.to_string(),
            instance_id: self.instance_id.clone(),
            expires_at: self.expires_at,
        }
    }
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> Result<T, LeaseStoreError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| LeaseStoreError::Backend("memory lease store poisoned".to_string()))?;
        Ok(f(&mut state))
    }
}

impl LeaseStore for MemoryLeaseStore {
    fn acquire(
        &self,
        session_id: &str,
        instance_id: &str,
        ttl: Duration,
    ) -> LeaseFuture<'_, LeaseAcquisition> {
        let session_id = session_id.to_string();
        let instance_id = instance_id.to_string();
        Box::pin(async move {
            self.with_state(|state| {
                if let Some(existing) = state.owners.get(&session_id) {
                    if existing.is_live() && existing.instance_id != instance_id {
                        return LeaseAcquisition::Held(existing.to_lease(&session_id));
                    }
                }
                let entry = OwnerEntry::new(&instance_id, ttl);
                let lease = entry.to_lease(&session_id);
                state.owners.insert(session_id.clone(), entry);
                LeaseAcquisition::Acquired(lease)
            })
        })
    }

    fn renew(&self, session_id: &str, instance_id: &str, ttl: Duration) -> LeaseFuture<'_, bool> {
        let session_id = session_id.to_string();
        let instance_id = instance_id.to_string();
        Box::pin(async move {
            self.with_state(|state| match state.owners.get_mut(&session_id) {
                Some(entry) if entry.instance_id == instance_id => {
                    *entry = OwnerEntry::new(&instance_id, ttl);
                    true
                }
                _ => false,
            })
        })
    }

    fn release(&self, session_id: &str, instance_id: &str) -> LeaseFuture<'_, bool> {
        let session_id = session_id.to_string();
        let instance_id = instance_id.to_string();
        Box::pin(async move {
            self.with_state(|state| match state.owners.get(&session_id) {
                Some(entry) if entry.instance_id == instance_id => {
                    state.owners.remove(&session_id);
                    true
                }
                _ => false,
            })
        })
    }

    fn owner(&self, session_id: &str) -> LeaseFuture<'_, Option<OwnerLease>> {
        let session_id = session_id.to_string();
        Box::pin(async move {
            self.with_state(|state| {
                state
                    .owners
                    .get(&session_id)
                    .filter(|entry| entry.is_live())
                    .map(|entry| entry.to_lease(&session_id))
            })
        })
    }

    fn set_runtime_lease(&self, session_id: &str, owner_instance_id: &str) -> LeaseFuture<'_, ()> {
        let lease = RuntimeLease {
            session_id: session_id.to_string(),
            owner_instance_id: owner_instance_id.to_string(),
            recorded_at: Utc::now(),
        };
        Box::pin(async move {
            self.with_state(|state| {
                state.runtimes.insert(lease.session_id.clone(), lease);
            })
        })
    }

    fn clear_runtime_lease(
        &self,
        session_id: &str,
        owner_instance_id: &str,
    ) -> LeaseFuture<'_, bool> {
        let session_id = session_id.to_string();
        let owner_instance_id = owner_instance_id.to_string();
        Box::pin(async move {
            self.with_state(|state| match state.runtimes.get(&session_id) {
                Some(lease) if lease.owner_instance_id == owner_instance_id => {
                    state.runtimes.remove(&session_id);
                    true
                }
                _ => false,
            })
        })
    }

    fn runtime_lease(&self, session_id: &str) -> LeaseFuture<'_, Option<RuntimeLease>> {
        let session_id = session_id.to_string();
        Box::pin(async move { self.with_state(|state| state.runtimes.get(&session_id).cloned()) })
    }
}
