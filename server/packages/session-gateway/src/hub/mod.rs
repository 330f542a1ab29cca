//! The per-session hub: ownership, runtime bring-up and client fan-out.

mod monitor;
mod registry;

pub use monitor::{ExpiryMonitor, MonitorHandle, RuntimeMonitor};
pub use registry::HubRegistry;

use registry::HubMap;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use chrono::Utc;
use futures::{Stream, StreamExt};
use serde::Serialize;
use session_gateway_error::GatewayError;
use session_gateway_lease_store::LeaseStore;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use utoipa::ToSchema;

use crate::lease::{LeaseManager, LeaseSettings, OwnershipState};
use crate::persistence::Persistence;
use crate::policy::automation::is_completed_automation_session;
use crate::policy::{DisconnectContext, DisconnectDecision, InitialPromptDispatcher, PromptDispatch, ReconnectPolicy};
use crate::runtime::{Conversation, RuntimeLifecycle};
use crate::session::{Session, SessionPatch, SessionStatus};
use crate::tasks::BackgroundTasks;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Collaborators shared by every hub on this instance.
#[derive(Clone)]
pub struct HubDeps {
    pub instance_id: String,
    pub lease_store: Arc<dyn LeaseStore>,
    pub lease_settings: LeaseSettings,
    pub persistence: Arc<dyn Persistence>,
    pub runtime: Arc<dyn RuntimeLifecycle>,
    pub conversation: Arc<dyn Conversation>,
    pub monitor: Arc<dyn RuntimeMonitor>,
    pub reconnect: ReconnectPolicy,
    pub tasks: BackgroundTasks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityStatus {
    Connected,
    Reconnecting,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubEvent {
    Connectivity {
        status: ConnectivityStatus,
        attempt: Option<u32>,
    },
    SessionStatus {
        status: SessionStatus,
        pause_reason: Option<String>,
    },
    ToolCallStarted {
        tool: String,
        tool_call_id: String,
    },
    ToolCallEnded {
        tool: String,
        tool_call_id: String,
        success: bool,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnsureRuntimeOptions {
    pub skip_initial_prompt: bool,
}

/// In-memory view of the session record, kept equal to what was last persisted.
#[derive(Debug)]
pub struct HubContext {
    session: RwLock<Session>,
}

impl HubContext {
    fn new(session: Session) -> Self {
        Self {
            session: RwLock::new(session),
        }
    }

    pub fn session(&self) -> Session {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn apply(&self, patch: &SessionPatch) {
        let mut session = self.session.write().unwrap_or_else(PoisonError::into_inner);
        patch.apply_to(&mut session);
    }

    fn replace(&self, session: Session) {
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = session;
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HubSnapshot {
    #[schema(value_type = Object)]
    pub session: Session,
    pub instance_id: String,
    pub ownership: OwnershipState,
    pub runtime_ready: bool,
    pub active_tool_calls: usize,
    pub connected_clients: usize,
    pub pending_reconnect: bool,
}

/// A subscribed client. Counts toward the hub's connected clients until dropped.
pub struct ClientConnection {
    events: broadcast::Receiver<HubEvent>,
    guard: ConnectionGuard,
}

struct ConnectionGuard(Arc<AtomicUsize>);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl ClientConnection {
    pub async fn recv(&mut self) -> Option<HubEvent> {
        loop {
            match self.events.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "client lagged behind hub events");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<HubEvent> {
        self.events.try_recv().ok()
    }

    pub fn into_stream(self) -> impl Stream<Item = HubEvent> + Send + 'static {
        let ClientConnection { events, guard } = self;
        BroadcastStream::new(events).filter_map(move |item| {
            let _held = &guard;
            futures::future::ready(item.ok())
        })
    }
}

pub struct SessionHub {
    session_id: String,
    deps: HubDeps,
    context: HubContext,
    lease: LeaseManager,
    ready_lock: tokio::sync::Mutex<()>,
    runtime_ready: AtomicBool,
    active_tool_calls: AtomicUsize,
    initial_prompt: InitialPromptDispatcher,
    monitor: Mutex<Option<MonitorHandle>>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<HubEvent>,
    connected_clients: Arc<AtomicUsize>,
    registry: Weak<HubMap>,
    weak_self: Weak<SessionHub>,
}

impl SessionHub {
    /// A hub that no registry tracks.
    pub fn new(session: Session, deps: HubDeps) -> Arc<Self> {
        Self::registered(session, deps, Weak::new())
    }

    fn registered(session: Session, deps: HubDeps, registry: Weak<HubMap>) -> Arc<Self> {
        let session_id = session.id.clone();
        let lease = LeaseManager::new(
            deps.lease_store.clone(),
            session_id.clone(),
            deps.instance_id.clone(),
            deps.lease_settings,
        );
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new_cyclic(|weak_self| Self {
            session_id,
            deps,
            context: HubContext::new(session),
            lease,
            ready_lock: tokio::sync::Mutex::new(()),
            runtime_ready: AtomicBool::new(false),
            active_tool_calls: AtomicUsize::new(0),
            initial_prompt: InitialPromptDispatcher::new(),
            monitor: Mutex::new(None),
            reconnect_task: Mutex::new(None),
            events,
            connected_clients: Arc::new(AtomicUsize::new(0)),
            registry,
            weak_self: weak_self.clone(),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn context(&self) -> &HubContext {
        &self.context
    }

    pub fn instance_id(&self) -> &str {
        &self.deps.instance_id
    }

    pub fn ownership(&self) -> OwnershipState {
        self.lease.state()
    }

    pub fn owns_owner_lease(&self) -> bool {
        self.lease.owns_owner_lease()
    }

    pub fn is_runtime_ready(&self) -> bool {
        self.runtime_ready.load(Ordering::Acquire)
    }

    pub fn tasks(&self) -> &BackgroundTasks {
        &self.deps.tasks
    }

    pub(crate) fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.deps.persistence
    }

    pub(crate) fn conversation(&self) -> &Arc<dyn Conversation> {
        &self.deps.conversation
    }

    /// Acquires ownership, brings the runtime up, starts the monitor and
    /// records the runtime lease, in that order. A runtime failure releases
    /// ownership before the original error is returned.
    ///
    /// A newly won lease reloads the session record first, since another
    /// instance may have written it while this one did not own it.
    pub async fn ensure_runtime_ready(
        &self,
        options: EnsureRuntimeOptions,
    ) -> Result<(), GatewayError> {
        let _ready = self.ready_lock.lock().await;
        if self.is_runtime_ready() && self.lease.owns_owner_lease() {
            return Ok(());
        }
        self.runtime_ready.store(false, Ordering::Release);

        let newly_owned = !self.lease.owns_owner_lease();
        if let Err(err) = self.lease.acquire().await {
            if matches!(err, GatewayError::LeaseConflict { .. }) && self.connected_clients() == 0 {
                self.leave_registry().await;
            }
            return Err(err);
        }

        let session = if newly_owned {
            match self.reload_session().await {
                Ok(session) => session,
                Err(err) => {
                    tracing::warn!(session_id = %self.session_id, error = %err, "session reload failed");
                    self.lease.stop_lease_renewal().await;
                    return Err(err);
                }
            }
        } else {
            self.context.session()
        };
        let sandbox = match self.deps.runtime.ensure_ready(&session).await {
            Ok(sandbox) => sandbox,
            Err(err) => {
                tracing::warn!(session_id = %self.session_id, error = %err, "runtime bring-up failed");
                self.lease.stop_lease_renewal().await;
                return Err(err);
            }
        };

        let mut patch =
            SessionPatch::default().sandbox(Some(sandbox.sandbox_id.clone()), sandbox.expires_at);
        if !is_completed_automation_session(&session) {
            patch = patch.status(SessionStatus::Running).pause_reason(None);
        }
        if let Err(err) = self.persist_patch(patch).await {
            self.lease.stop_lease_renewal().await;
            return Err(err);
        }

        self.start_monitor();

        if let Err(err) = self.lease.write_runtime_lease().await {
            tracing::warn!(session_id = %self.session_id, error = %err, "runtime lease write failed");
            self.stop_monitor();
            self.lease.stop_lease_renewal().await;
            return Err(err);
        }

        self.runtime_ready.store(true, Ordering::Release);
        self.broadcast(HubEvent::Connectivity {
            status: ConnectivityStatus::Connected,
            attempt: None,
        });
        tracing::info!(
            session_id = %self.session_id,
            instance_id = %self.deps.instance_id,
            sandbox_id = %sandbox.sandbox_id,
            "runtime ready"
        );

        if !options.skip_initial_prompt {
            if let Err(err) = self.maybe_send_initial_prompt().await {
                tracing::warn!(session_id = %self.session_id, error = %err, "initial prompt not delivered");
            }
        }
        Ok(())
    }

    async fn reload_session(&self) -> Result<Session, GatewayError> {
        let session = self
            .deps
            .persistence
            .get_session(&self.session_id)
            .await?
            .ok_or_else(|| GatewayError::SessionNotFound {
                session_id: self.session_id.clone(),
            })?;
        self.context.replace(session.clone());
        Ok(session)
    }

    /// Drops this hub from its registry, if it is still the registered one.
    async fn leave_registry(&self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut hubs = registry.lock().await;
        let registered = hubs
            .get(&self.session_id)
            .is_some_and(|hub| std::ptr::eq(Arc::as_ptr(hub), self));
        if registered {
            hubs.remove(&self.session_id);
            tracing::debug!(session_id = %self.session_id, "session hub evicted");
        }
    }

    pub async fn maybe_send_initial_prompt(&self) -> Result<PromptDispatch, GatewayError> {
        self.initial_prompt.maybe_send(self).await
    }

    /// Persists `patch`, then mirrors it into the in-memory view.
    pub async fn persist_patch(&self, patch: SessionPatch) -> Result<Session, GatewayError> {
        if patch.is_empty() {
            return Ok(self.context.session());
        }
        let previous = self.context.session();
        self.deps
            .persistence
            .update_session(&self.session_id, patch.clone())
            .await?;
        self.context.apply(&patch);
        let current = self.context.session();

        if current.status != previous.status || current.pause_reason != previous.pause_reason {
            self.broadcast(HubEvent::SessionStatus {
                status: current.status,
                pause_reason: current.pause_reason.clone(),
            });
        }
        Ok(current)
    }

    pub fn track_tool_call_start(&self, tool: &str, tool_call_id: &str) {
        self.active_tool_calls.fetch_add(1, Ordering::AcqRel);
        self.broadcast(HubEvent::ToolCallStarted {
            tool: tool.to_string(),
            tool_call_id: tool_call_id.to_string(),
        });
    }

    pub fn track_tool_call_end(&self, tool: &str, tool_call_id: &str, success: bool) {
        let _ = self
            .active_tool_calls
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                Some(count.saturating_sub(1))
            });
        self.broadcast(HubEvent::ToolCallEnded {
            tool: tool.to_string(),
            tool_call_id: tool_call_id.to_string(),
            success,
        });
    }

    pub fn active_tool_calls(&self) -> usize {
        self.active_tool_calls.load(Ordering::Acquire)
    }

    pub fn subscribe(&self) -> ClientConnection {
        self.connected_clients.fetch_add(1, Ordering::AcqRel);
        ClientConnection {
            events: self.events.subscribe(),
            guard: ConnectionGuard(self.connected_clients.clone()),
        }
    }

    pub fn connected_clients(&self) -> usize {
        self.connected_clients.load(Ordering::Acquire)
    }

    fn broadcast(&self, event: HubEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    /// Runtime transport dropped. Consults the reconnect policy.
    pub fn handle_runtime_disconnect(&self, reason: &str) -> DisconnectDecision {
        self.runtime_ready.store(false, Ordering::Release);
        let session = self.context.session();
        let ctx = DisconnectContext {
            client_type: session.client_type,
            status: session.status,
            connected_clients: self.connected_clients(),
        };
        let decision = self.deps.reconnect.decide(&ctx);
        tracing::info!(
            session_id = %self.session_id,
            reason = %reason,
            schedule_reconnect = decision.schedule_reconnect,
            broadcast_status = decision.broadcast_status,
            "runtime disconnected"
        );

        if decision.broadcast_status {
            self.broadcast(HubEvent::Connectivity {
                status: ConnectivityStatus::Disconnected,
                attempt: None,
            });
        }
        if decision.schedule_reconnect {
            self.schedule_reconnect();
        }
        decision
    }

    fn schedule_reconnect(&self) {
        let hub = self.weak_self.clone();
        let policy = self.deps.reconnect;
        let events = self.events.clone();
        let session_id = self.session_id.clone();

        let handle = tokio::spawn(async move {
            for attempt in 1..=policy.max_attempts {
                let delay = policy.delay_for_attempt(attempt);
                let _ = events.send(HubEvent::Connectivity {
                    status: ConnectivityStatus::Reconnecting,
                    attempt: Some(attempt),
                });
                tracing::debug!(
                    session_id = %session_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "reconnect scheduled"
                );
                tokio::time::sleep(delay).await;

                let Some(hub) = hub.upgrade() else {
                    return;
                };
                if !hub.owns_owner_lease() {
                    tracing::debug!(session_id = %session_id, "reconnect abandoned, lease not owned");
                    return;
                }
                let session = hub.context.session();
                match hub.deps.runtime.reconnect(&session).await {
                    Ok(()) => {
                        hub.runtime_ready.store(true, Ordering::Release);
                        let _ = events.send(HubEvent::Connectivity {
                            status: ConnectivityStatus::Connected,
                            attempt: Some(attempt),
                        });
                        tracing::info!(session_id = %session_id, attempt, "runtime reconnected");
                        return;
                    }
                    Err(err) => {
                        tracing::warn!(session_id = %session_id, attempt, error = %err, "reconnect attempt failed");
                    }
                }
            }
            let _ = events.send(HubEvent::Connectivity {
                status: ConnectivityStatus::Disconnected,
                attempt: Some(policy.max_attempts),
            });
            tracing::warn!(session_id = %session_id, "reconnect attempts exhausted");
        });

        let mut slot = self
            .reconnect_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
    }

    pub fn pending_reconnect(&self) -> bool {
        self.reconnect_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    fn cancel_reconnect(&self) {
        if let Some(handle) = self
            .reconnect_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }

    fn start_monitor(&self) {
        let handle = self.deps.monitor.start(self.weak_self.clone());
        // Replacing drops (and stops) any previous monitor.
        *self.monitor.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    fn stop_monitor(&self) {
        self.monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Migrates to a fresh sandbox when the current one expires within
    /// `grace` and no tool call is running. Returns whether it migrated.
    pub async fn check_sandbox_expiry(&self, grace: chrono::Duration) -> Result<bool, GatewayError> {
        let session = self.context.session();
        let Some(expires_at) = session.sandbox_expires_at else {
            return Ok(false);
        };
        if expires_at - Utc::now() > grace {
            return Ok(false);
        }
        if self.active_tool_calls() > 0 {
            tracing::debug!(session_id = %self.session_id, "sandbox expiring, migration deferred for active tool calls");
            return Ok(false);
        }

        let _ready = self.ready_lock.lock().await;
        if !self.lease.owns_owner_lease() {
            return Ok(false);
        }
        let sandbox = self.deps.runtime.migrate(&session).await?;
        self.persist_patch(
            SessionPatch::default().sandbox(Some(sandbox.sandbox_id.clone()), sandbox.expires_at),
        )
        .await?;
        tracing::info!(
            session_id = %self.session_id,
            sandbox_id = %sandbox.sandbox_id,
            "sandbox migrated"
        );
        Ok(true)
    }

    /// Stops the runtime, gives up ownership and leaves the registry. The
    /// session record keeps whatever status the completion wrote.
    pub async fn terminate_for_automation(&self) -> Result<(), GatewayError> {
        let _ready = self.ready_lock.lock().await;
        self.stop_monitor();
        self.cancel_reconnect();
        self.runtime_ready.store(false, Ordering::Release);

        let result = if self.lease.owns_owner_lease() {
            let session = self.context.session();
            self.deps.runtime.stop(&session).await
        } else {
            Ok(())
        };
        self.lease.stop_lease_renewal().await;
        self.broadcast(HubEvent::Connectivity {
            status: ConnectivityStatus::Disconnected,
            attempt: None,
        });
        self.leave_registry().await;
        tracing::info!(session_id = %self.session_id, "automation runtime terminated");
        result
    }

    /// Graceful process shutdown: another instance may take the session over.
    pub async fn shutdown(&self) {
        let _ready = self.ready_lock.lock().await;
        self.stop_monitor();
        self.cancel_reconnect();
        self.runtime_ready.store(false, Ordering::Release);
        self.lease.stop_lease_renewal().await;
    }

    pub fn snapshot(&self) -> HubSnapshot {
        HubSnapshot {
            session: self.context.session(),
            instance_id: self.deps.instance_id.clone(),
            ownership: self.lease.state(),
            runtime_ready: self.is_runtime_ready(),
            active_tool_calls: self.active_tool_calls(),
            connected_clients: self.connected_clients(),
            pending_reconnect: self.pending_reconnect(),
        }
    }
}

impl Drop for SessionHub {
    fn drop(&mut self) {
        self.cancel_reconnect();
    }
}

impl std::fmt::Debug for SessionHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHub")
            .field("session_id", &self.session_id)
            .field("ownership", &self.lease.state())
            .field("runtime_ready", &self.is_runtime_ready())
            .finish()
    }
}
