use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde_json::Value;
use session_gateway_error::GatewayError;

use super::cache::{CacheKey, CacheLookup, IdempotencyCache};
use super::{ToolCallRequest, ToolCallResult, ToolContext, ToolHandler, ToolRegistry};
use crate::hub::{EnsureRuntimeOptions, HubRegistry, SessionHub};

const MAX_ID_LEN: usize = 256;

/// Who is calling, as resolved by the HTTP auth layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Principal {
    /// The session's own sandbox, holding the sandbox token.
    Sandbox,
    /// Operators and dashboards holding the service token.
    Service,
    /// Auth is disabled; every caller is trusted.
    Local,
    Anonymous,
}

impl Principal {
    pub fn may_call_tools(self) -> bool {
        matches!(self, Self::Sandbox | Self::Local)
    }

    pub fn may_read_sessions(self) -> bool {
        matches!(self, Self::Service | Self::Local)
    }
}

/// Deduplicating entry point for sandbox tool callbacks.
pub struct ToolGateway {
    hubs: Arc<HubRegistry>,
    tools: Arc<ToolRegistry>,
    cache: IdempotencyCache,
    handler_timeout: Duration,
}

impl ToolGateway {
    pub fn new(
        hubs: Arc<HubRegistry>,
        tools: Arc<ToolRegistry>,
        retention: Duration,
        handler_timeout: Duration,
    ) -> Self {
        Self {
            hubs,
            tools,
            cache: IdempotencyCache::new(retention),
            handler_timeout,
        }
    }

    pub fn cache(&self) -> &IdempotencyCache {
        &self.cache
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Runs a tool call at most once per `(session, tool, call id)`.
    ///
    /// Handler failures come back as `success: false` results and are cached.
    /// Errors are reserved for request, auth and ownership problems; those
    /// are never cached.
    pub async fn execute(
        &self,
        principal: Principal,
        request: ToolCallRequest,
    ) -> Result<ToolCallResult, GatewayError> {
        if !principal.may_call_tools() {
            return Err(GatewayError::PermissionDenied {
                message: Some("tool calls are restricted to the session sandbox".to_string()),
            });
        }
        validate_id("session id", &request.session_id)?;
        validate_id("tool name", &request.tool)?;
        validate_id("tool call id", &request.tool_call_id)?;

        let handler = self
            .tools
            .get(&request.tool)
            .ok_or_else(|| GatewayError::UnknownTool {
                tool: request.tool.clone(),
            })?;

        let key = CacheKey::new(&request.session_id, &request.tool, &request.tool_call_id);
        match self.cache.lookup(&key) {
            CacheLookup::Completed(result) => {
                tracing::debug!(key = %key, "tool result replayed from cache");
                return Ok(result);
            }
            CacheLookup::InFlight(pending) => {
                tracing::debug!(key = %key, "joining in-flight tool call");
                return Ok(pending.await);
            }
            CacheLookup::Miss => {}
        }

        let hub = self.hubs.get_or_create(&request.session_id).await?;
        hub.ensure_runtime_ready(EnsureRuntimeOptions::default())
            .await?;

        let lookup = self.cache.get_or_start(&key, || {
            let execution = execute_once(
                self.cache.clone(),
                key.clone(),
                hub,
                handler,
                request.args,
                self.handler_timeout,
            );
            let task = tokio::spawn(execution);
            async move {
                task.await.unwrap_or_else(|err| {
                    ToolCallResult::failure(format!("tool execution aborted: {err}"))
                })
            }
            .boxed()
        });

        match lookup {
            CacheLookup::Completed(result) => Ok(result),
            CacheLookup::InFlight(pending) => Ok(pending.await),
            CacheLookup::Miss => Err(GatewayError::Conflict {
                message: format!("tool call {key} could not be recorded"),
            }),
        }
    }
}

fn validate_id(label: &str, value: &str) -> Result<(), GatewayError> {
    if value.trim().is_empty() {
        return Err(GatewayError::InvalidRequest {
            message: format!("{label} is required"),
        });
    }
    if value.len() > MAX_ID_LEN || value.chars().any(char::is_control) {
        return Err(GatewayError::InvalidRequest {
            message: format!("{label} is invalid"),
        });
    }
    Ok(())
}

/// Brackets one handler run with start/end notifications. The end
/// notification fires from `Drop`, so a panicking handler still ends.
struct ToolCallTracker {
    hub: Arc<SessionHub>,
    tool: String,
    tool_call_id: String,
    success: bool,
}

impl ToolCallTracker {
    fn start(hub: Arc<SessionHub>, tool: &str, tool_call_id: &str) -> Self {
        hub.track_tool_call_start(tool, tool_call_id);
        Self {
            hub,
            tool: tool.to_string(),
            tool_call_id: tool_call_id.to_string(),
            success: false,
        }
    }
}

impl Drop for ToolCallTracker {
    fn drop(&mut self) {
        self.hub
            .track_tool_call_end(&self.tool, &self.tool_call_id, self.success);
    }
}

async fn execute_once(
    cache: IdempotencyCache,
    key: CacheKey,
    hub: Arc<SessionHub>,
    handler: Arc<dyn ToolHandler>,
    args: Value,
    timeout: Duration,
) -> ToolCallResult {
    let run = tokio::spawn(run_handler(
        hub,
        handler,
        key.tool_call_id.clone(),
        args,
        timeout,
    ));
    let result = match run.await {
        Ok(result) => result,
        Err(err) => {
            tracing::error!(key = %key, error = %err, "tool handler panicked");
            ToolCallResult::failure("tool handler panicked")
        }
    };
    cache.complete(&key, result.clone());
    result
}

async fn run_handler(
    hub: Arc<SessionHub>,
    handler: Arc<dyn ToolHandler>,
    tool_call_id: String,
    args: Value,
    timeout: Duration,
) -> ToolCallResult {
    let tool = handler.name();
    let mut tracker = ToolCallTracker::start(hub.clone(), tool, &tool_call_id);
    let ctx = ToolContext {
        hub,
        tool_call_id: tool_call_id.clone(),
    };

    let outcome = tokio::time::timeout(timeout, handler.call(ctx, args)).await;
    let result = match outcome {
        Ok(Ok(output)) => ToolCallResult::success(output),
        Ok(Err(err)) => {
            tracing::info!(tool, tool_call_id = %tool_call_id, error = %err, "tool handler failed");
            ToolCallResult::failure(err.to_string())
        }
        Err(_) => {
            tracing::warn!(tool, tool_call_id = %tool_call_id, "tool handler timed out");
            ToolCallResult::failure(format!(
                "tool {tool} timed out after {}ms",
                timeout.as_millis()
            ))
        }
    };
    tracker.success = result.success;
    result
}
