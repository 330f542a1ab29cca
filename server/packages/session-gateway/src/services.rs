//! Wires collaborators, hubs and the tool gateway together.

use std::sync::Arc;

use session_gateway_error::GatewayError;
use session_gateway_lease_store::{LeaseStore, MemoryLeaseStore, SqliteLeaseStore};

use crate::config::{GatewayConfig, LeaseStoreConfig};
use crate::hub::{HubDeps, HubRegistry, RuntimeMonitor};
use crate::lease::store_error;
use crate::persistence::{MemoryPersistence, Persistence};
use crate::runtime::{Conversation, LocalRuntime, LoggingConversation, RuntimeLifecycle, SandboxProvider};
use crate::tasks::BackgroundTasks;
use crate::tools::{builtin_registry, ToolGateway, ToolRegistry};

/// External systems the gateway talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub lease_store: Arc<dyn LeaseStore>,
    pub persistence: Arc<dyn Persistence>,
    pub runtime: Arc<dyn RuntimeLifecycle>,
    pub sandbox: Arc<dyn SandboxProvider>,
    pub conversation: Arc<dyn Conversation>,
    pub monitor: Arc<dyn RuntimeMonitor>,
}

impl Collaborators {
    /// In-process collaborators for running one gateway on a workstation.
    pub async fn local(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let lease_store: Arc<dyn LeaseStore> = match &config.lease_store {
            LeaseStoreConfig::Memory => Arc::new(MemoryLeaseStore::new()),
            LeaseStoreConfig::Sqlite(path) => {
                Arc::new(SqliteLeaseStore::open(path).await.map_err(store_error)?)
            }
        };
        let persistence = match &config.sessions_file {
            Some(path) => MemoryPersistence::from_json_file(path)?,
            None => MemoryPersistence::new(),
        };
        let runtime = Arc::new(LocalRuntime::new(config.sandbox_root.clone()));

        Ok(Self {
            lease_store,
            persistence: Arc::new(persistence),
            runtime: runtime.clone(),
            sandbox: runtime,
            conversation: Arc::new(LoggingConversation),
            monitor: Arc::new(config.monitor),
        })
    }
}

pub struct GatewayServices {
    pub instance_id: String,
    pub hubs: Arc<HubRegistry>,
    pub tools: Arc<ToolGateway>,
    pub tasks: BackgroundTasks,
}

impl GatewayServices {
    pub fn new(config: &GatewayConfig, collaborators: Collaborators, tools: ToolRegistry) -> Self {
        let tasks = BackgroundTasks::new();
        let deps = HubDeps {
            instance_id: config.instance_id.clone(),
            lease_store: collaborators.lease_store,
            lease_settings: config.lease,
            persistence: collaborators.persistence,
            runtime: collaborators.runtime,
            conversation: collaborators.conversation,
            monitor: collaborators.monitor,
            reconnect: config.reconnect,
            tasks: tasks.clone(),
        };
        let hubs = Arc::new(HubRegistry::new(deps));
        let tools = Arc::new(ToolGateway::new(
            hubs.clone(),
            Arc::new(tools),
            config.tool_retention,
            config.tool_timeout,
        ));
        Self {
            instance_id: config.instance_id.clone(),
            hubs,
            tools,
            tasks,
        }
    }

    pub fn with_builtin_tools(
        config: &GatewayConfig,
        collaborators: Collaborators,
    ) -> Result<Self, GatewayError> {
        let tools = builtin_registry(collaborators.sandbox.clone(), config.aux_timeout)?;
        Ok(Self::new(config, collaborators, tools))
    }

    /// Stops every hub, then waits for background work.
    pub async fn shutdown(&self) {
        self.hubs.shutdown_all().await;
        self.tasks.drain().await;
        tracing::info!(instance_id = %self.instance_id, "gateway services stopped");
    }
}
