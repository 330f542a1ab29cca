//! Tools the sandboxed agent can call back into the gateway.

mod automation;
mod cache;
mod gateway;
mod snapshot;

pub use automation::AutomationCompleteTool;
pub use cache::{CacheKey, CacheLookup, IdempotencyCache};
pub use gateway::{Principal, ToolGateway};
pub use snapshot::SaveSnapshotTool;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use session_gateway_error::GatewayError;
use utoipa::ToSchema;

use crate::hub::SessionHub;
use crate::runtime::SandboxProvider;

pub type ToolFuture<'a> = Pin<Box<dyn Future<Output = Result<ToolOutput, GatewayError>> + Send + 'a>>;

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub session_id: String,
    pub tool: String,
    pub tool_call_id: String,
    pub args: Value,
}

/// Body returned for every executed tool call, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ToolCallResult {
    pub success: bool,
    pub result: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ToolCallResult {
    pub fn success(output: ToolOutput) -> Self {
        Self {
            success: true,
            result: output.result,
            data: output.data,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            result: message.into(),
            data: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub result: String,
    pub data: Option<Value>,
}

impl ToolOutput {
    pub fn text(result: impl Into<String>) -> Self {
        Self {
            result: result.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

#[derive(Clone)]
pub struct ToolContext {
    pub hub: Arc<SessionHub>,
    pub tool_call_id: String,
}

pub trait ToolHandler: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn call(&self, ctx: ToolContext, args: Value) -> ToolFuture<'_>;
}

/// Handlers by tool name. Filled at startup, read-only while serving.
#[derive(Default)]
pub struct ToolRegistry {
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn ToolHandler>) -> Result<(), GatewayError> {
        let name = handler.name();
        if self.handlers.contains_key(name) {
            return Err(GatewayError::Conflict {
                message: format!("tool {name} is already registered"),
            });
        }
        self.handlers.insert(name.to_string(), handler);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

/// `automation_complete` and `save_snapshot`.
pub fn builtin_registry(
    sandbox: Arc<dyn SandboxProvider>,
    aux_timeout: Duration,
) -> Result<ToolRegistry, GatewayError> {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(AutomationCompleteTool))?;
    registry.register(Arc::new(SaveSnapshotTool::new(sandbox, aux_timeout)))?;
    Ok(registry)
}
