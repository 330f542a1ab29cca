#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use chrono::{DateTime, Utc};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tokio::sync::Notify;
use tower::util::ServiceExt;

use session_gateway::config::GatewayConfig;
use session_gateway::hub::{HubDeps, MonitorHandle, RuntimeMonitor, SessionHub};
use session_gateway::persistence::MemoryPersistence;
use session_gateway::policy::ReconnectPolicy;
use session_gateway::router::{build_router, AppState, AuthConfig};
use session_gateway::runtime::{
    CommandOutput, Conversation, RuntimeFuture, RuntimeLifecycle, SandboxInfo, SandboxProvider,
};
use session_gateway::services::{Collaborators, GatewayServices};
use session_gateway::session::Session;
use session_gateway::tasks::BackgroundTasks;
use session_gateway::tools::{
    builtin_registry, ToolContext, ToolFuture, ToolHandler, ToolOutput, ToolRegistry,
};
use session_gateway_error::GatewayError;
use session_gateway_lease_store::{
    LeaseAcquisition, LeaseFuture, LeaseStore, MemoryLeaseStore, OwnerLease, RuntimeLease,
};

pub const SERVICE_TOKEN: &str = "svc-token";
pub const SANDBOX_TOKEN: &str = "sbx-token";

/// Ordered record of collaborator calls shared by every fake in a harness.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().expect("call log").push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().expect("call log").clone()
    }

    pub fn clear(&self) {
        self.0.lock().expect("call log").clear();
    }

    pub fn count(&self, entry: &str) -> usize {
        self.entries().iter().filter(|e| e.as_str() == entry).count()
    }
}

pub struct RecordingLeaseStore {
    inner: Arc<dyn LeaseStore>,
    log: CallLog,
}

impl RecordingLeaseStore {
    pub fn new(inner: Arc<dyn LeaseStore>, log: CallLog) -> Self {
        Self { inner, log }
    }
}

impl LeaseStore for RecordingLeaseStore {
    fn acquire(
        &self,
        session_id: &str,
        instance_id: &str,
        ttl: Duration,
    ) -> LeaseFuture<'_, LeaseAcquisition> {
        self.log.push("lease-acquire");
        self.inner.acquire(session_id, instance_id, ttl)
    }

    fn renew(&self, session_id: &str, instance_id: &str, ttl: Duration) -> LeaseFuture<'_, bool> {
        self.inner.renew(session_id, instance_id, ttl)
    }

    fn release(&self, session_id: &str, instance_id: &str) -> LeaseFuture<'_, bool> {
        self.log.push("lease-release");
        self.inner.release(session_id, instance_id)
    }

    fn owner(&self, session_id: &str) -> LeaseFuture<'_, Option<OwnerLease>> {
        self.inner.owner(session_id)
    }

    fn set_runtime_lease(&self, session_id: &str, owner_instance_id: &str) -> LeaseFuture<'_, ()> {
        self.log.push("runtime-lease-write");
        self.inner.set_runtime_lease(session_id, owner_instance_id)
    }

    fn clear_runtime_lease(
        &self,
        session_id: &str,
        owner_instance_id: &str,
    ) -> LeaseFuture<'_, bool> {
        self.log.push("runtime-lease-clear");
        self.inner.clear_runtime_lease(session_id, owner_instance_id)
    }

    fn runtime_lease(&self, session_id: &str) -> LeaseFuture<'_, Option<RuntimeLease>> {
        self.inner.runtime_lease(session_id)
    }
}

#[derive(Default)]
pub struct FakeRuntime {
    log: CallLog,
    init_error: Mutex<Option<GatewayError>>,
    expires_at: Mutex<Option<DateTime<Utc>>>,
    fail_reconnects: AtomicUsize,
    migrations: AtomicUsize,
}

impl FakeRuntime {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            ..Self::default()
        }
    }

    pub fn fail_init_with(&self, err: GatewayError) {
        *self.init_error.lock().expect("init error") = Some(err);
    }

    pub fn clear_init_failure(&self) {
        *self.init_error.lock().expect("init error") = None;
    }

    pub fn set_expires_at(&self, expires_at: Option<DateTime<Utc>>) {
        *self.expires_at.lock().expect("expires at") = expires_at;
    }

    pub fn fail_next_reconnects(&self, count: usize) {
        self.fail_reconnects.store(count, Ordering::SeqCst);
    }

    fn sandbox(&self, session: &Session, suffix: &str) -> SandboxInfo {
        SandboxInfo {
            sandbox_id: format!("sbx-{}{suffix}", session.id),
            expires_at: *self.expires_at.lock().expect("expires at"),
        }
    }
}

impl RuntimeLifecycle for FakeRuntime {
    fn ensure_ready(&self, session: &Session) -> RuntimeFuture<'_, SandboxInfo> {
        self.log.push("runtime-init");
        let result = match self.init_error.lock().expect("init error").clone() {
            Some(err) => Err(err),
            None => Ok(self.sandbox(session, "")),
        };
        Box::pin(async move { result })
    }

    fn reconnect(&self, _session: &Session) -> RuntimeFuture<'_, ()> {
        self.log.push("runtime-reconnect");
        let fail = self
            .fail_reconnects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        Box::pin(async move {
            if fail {
                Err(GatewayError::RuntimeInitFailure {
                    message: "transport still down".to_string(),
                })
            } else {
                Ok(())
            }
        })
    }

    fn migrate(&self, session: &Session) -> RuntimeFuture<'_, SandboxInfo> {
        self.log.push("runtime-migrate");
        let n = self.migrations.fetch_add(1, Ordering::SeqCst) + 1;
        let mut info = self.sandbox(session, &format!("-m{n}"));
        info.expires_at = Some(Utc::now() + chrono::Duration::hours(1));
        Box::pin(async move { Ok(info) })
    }

    fn stop(&self, _session: &Session) -> RuntimeFuture<'_, ()> {
        self.log.push("runtime-stop");
        Box::pin(async { Ok(()) })
    }
}

pub struct RecordingMonitor {
    log: CallLog,
}

impl RuntimeMonitor for RecordingMonitor {
    fn start(&self, _hub: Weak<SessionHub>) -> MonitorHandle {
        self.log.push("monitor-start");
        MonitorHandle::detached()
    }
}

#[derive(Default)]
pub struct FakeSandbox {
    commands: Mutex<Vec<Vec<String>>>,
    snapshots: AtomicUsize,
    fail_snapshot: AtomicBool,
    failing_execs: AtomicUsize,
}

impl FakeSandbox {
    pub fn commands(&self) -> Vec<Vec<String>> {
        self.commands.lock().expect("commands").clone()
    }

    pub fn fail_snapshots(&self) {
        self.fail_snapshot.store(true, Ordering::SeqCst);
    }

    /// The next `count` commands are recorded but report a timeout.
    pub fn fail_next_execs(&self, count: usize) {
        self.failing_execs.store(count, Ordering::SeqCst);
    }
}

impl SandboxProvider for FakeSandbox {
    fn exec_command(
        &self,
        _sandbox_id: &str,
        argv: Vec<String>,
        _timeout: Duration,
    ) -> RuntimeFuture<'_, CommandOutput> {
        self.commands.lock().expect("commands").push(argv);
        let fail = self
            .failing_execs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        Box::pin(async move {
            if fail {
                return Err(GatewayError::Timeout {
                    message: Some("sandbox command timed out".to_string()),
                });
            }
            Ok(CommandOutput {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            })
        })
    }

    fn snapshot(&self, sandbox_id: &str) -> RuntimeFuture<'_, String> {
        let result = if self.fail_snapshot.load(Ordering::SeqCst) {
            Err(GatewayError::SandboxCommand {
                message: "snapshot backend unavailable".to_string(),
            })
        } else {
            let n = self.snapshots.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("snap-{sandbox_id}-{n}"))
        };
        Box::pin(async move { result })
    }
}

#[derive(Default)]
pub struct FakeConversation {
    fail_remaining: AtomicUsize,
    attempts: AtomicUsize,
    delivered: Mutex<Vec<(String, String)>>,
}

impl FakeConversation {
    pub fn fail_next(&self, count: usize) {
        self.fail_remaining.store(count, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn delivered(&self) -> Vec<(String, String)> {
        self.delivered.lock().expect("delivered").clone()
    }
}

impl Conversation for FakeConversation {
    fn send_prompt(&self, session_id: &str, prompt: &str) -> RuntimeFuture<'_, ()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let fail = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let result = if fail {
            Err(GatewayError::RuntimeInitFailure {
                message: "conversation not attached".to_string(),
            })
        } else {
            self.delivered
                .lock()
                .expect("delivered")
                .push((session_id.to_string(), prompt.to_string()));
            Ok(())
        };
        Box::pin(async move { result })
    }
}

/// Counts invocations; optionally parks until released, optionally fails.
pub struct CountingTool {
    name: &'static str,
    invocations: AtomicUsize,
    gate: Option<Arc<Notify>>,
    fail: bool,
}

impl CountingTool {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            invocations: AtomicUsize::new(0),
            gate: None,
            fail: false,
        }
    }

    pub fn gated(name: &'static str, gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new(name)
        }
    }

    pub fn failing(name: &'static str) -> Self {
        Self {
            fail: true,
            ..Self::new(name)
        }
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

impl ToolHandler for CountingTool {
    fn name(&self) -> &'static str {
        self.name
    }

    fn call(&self, ctx: ToolContext, args: Value) -> ToolFuture<'_> {
        let invocation = self.invocations.fetch_add(1, Ordering::SeqCst) + 1;
        let gate = self.gate.clone();
        let fail = self.fail;
        Box::pin(async move {
            if let Some(gate) = gate {
                gate.notified().await;
            }
            if fail {
                return Err(GatewayError::SandboxCommand {
                    message: "tool exploded".to_string(),
                });
            }
            Ok(ToolOutput::text(format!("call {} done", ctx.tool_call_id)).with_data(json!({
                "invocation": invocation,
                "args": args,
            })))
        })
    }
}

/// Fakes for every collaborator plus a config tuned for tests.
///
/// Harnesses made with [`Harness::peer`] share stores with the original and
/// act as a second gateway instance.
#[derive(Clone)]
pub struct Harness {
    pub log: CallLog,
    pub lease_store: Arc<dyn LeaseStore>,
    pub persistence: Arc<MemoryPersistence>,
    pub runtime: Arc<FakeRuntime>,
    pub sandbox: Arc<FakeSandbox>,
    pub conversation: Arc<FakeConversation>,
    pub config: GatewayConfig,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_lease_store(Arc::new(MemoryLeaseStore::new()))
    }

    pub fn with_lease_store(lease_store: Arc<dyn LeaseStore>) -> Self {
        let log = CallLog::default();
        let mut config = GatewayConfig::default();
        config.instance_id = "gw-a".to_string();
        config.reconnect = ReconnectPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            jitter: false,
        };
        Self {
            runtime: Arc::new(FakeRuntime::new(log.clone())),
            log,
            lease_store,
            persistence: Arc::new(MemoryPersistence::with_write_journal()),
            sandbox: Arc::new(FakeSandbox::default()),
            conversation: Arc::new(FakeConversation::default()),
            config,
        }
    }

    /// Another gateway instance over the same lease store and records.
    pub fn peer(&self, instance_id: &str) -> Self {
        let mut peer = self.clone();
        peer.log = CallLog::default();
        peer.runtime = Arc::new(FakeRuntime::new(peer.log.clone()));
        peer.config.instance_id = instance_id.to_string();
        peer
    }

    pub fn insert_session(&self, session: Session) {
        self.persistence.insert_session(session);
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            lease_store: Arc::new(RecordingLeaseStore::new(
                self.lease_store.clone(),
                self.log.clone(),
            )),
            persistence: self.persistence.clone(),
            runtime: self.runtime.clone(),
            sandbox: self.sandbox.clone(),
            conversation: self.conversation.clone(),
            monitor: Arc::new(RecordingMonitor {
                log: self.log.clone(),
            }),
        }
    }

    pub fn deps(&self) -> HubDeps {
        let collaborators = self.collaborators();
        HubDeps {
            instance_id: self.config.instance_id.clone(),
            lease_store: collaborators.lease_store,
            lease_settings: self.config.lease,
            persistence: collaborators.persistence,
            runtime: collaborators.runtime,
            conversation: collaborators.conversation,
            monitor: collaborators.monitor,
            reconnect: self.config.reconnect,
            tasks: BackgroundTasks::new(),
        }
    }

    /// Stores `session` and builds a standalone hub for it.
    pub fn hub(&self, session: Session) -> Arc<SessionHub> {
        self.insert_session(session.clone());
        SessionHub::new(session, self.deps())
    }

    pub fn services(&self, tools: ToolRegistry) -> GatewayServices {
        GatewayServices::new(&self.config, self.collaborators(), tools)
    }

    /// Built-in tools plus `extra`.
    pub fn services_with(&self, extra: Vec<Arc<dyn ToolHandler>>) -> GatewayServices {
        let mut tools =
            builtin_registry(self.sandbox.clone(), self.config.aux_timeout).expect("builtin tools");
        for tool in extra {
            tools.register(tool).expect("register tool");
        }
        self.services(tools)
    }
}

pub struct TestApp {
    pub app: Router,
    pub services: Arc<GatewayServices>,
}

impl TestApp {
    pub fn new(harness: &Harness, auth: AuthConfig, extra: Vec<Arc<dyn ToolHandler>>) -> Self {
        let services = Arc::new(harness.services_with(extra));
        let app = build_router(AppState::new(auth, services.clone()));
        Self { app, services }
    }
}

pub fn token_auth() -> AuthConfig {
    AuthConfig {
        service_token: Some(SERVICE_TOKEN.to_string()),
        sandbox_token: Some(SANDBOX_TOKEN.to_string()),
    }
}

pub async fn send_json(
    app: &Router,
    method: Method,
    path: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder()
        .method(method)
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    let request = builder
        .body(Body::from(body.map(|value| value.to_string()).unwrap_or_default()))
        .expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    let payload = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, payload)
}

/// Waits for background work such as `terminate_for_automation`.
pub async fn settle(tasks: &BackgroundTasks) {
    tokio::time::timeout(Duration::from_secs(5), tasks.drain())
        .await
        .expect("background tasks settle");
}
