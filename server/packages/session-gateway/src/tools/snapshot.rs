use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use session_gateway_error::GatewayError;

use super::{ToolContext, ToolFuture, ToolHandler, ToolOutput};
use crate::runtime::{exec_with_timeout, SandboxProvider};

/// Env file holding injected secrets inside the sandbox.
pub const DEFAULT_ENV_FILE: &str = ".session-env";

const SCRUB_SCRIPT: &str = r#"[ ! -f "$1" ] || mv -f "$1" "$1.scrubbed""#;
const RESTORE_SCRIPT: &str = r#"[ ! -f "$1.scrubbed" ] || mv -f "$1.scrubbed" "$1""#;

/// Captures the sandbox filesystem with secrets moved out of the way.
///
/// The env file is always put back, even when the snapshot fails.
pub struct SaveSnapshotTool {
    sandbox: Arc<dyn SandboxProvider>,
    aux_timeout: Duration,
    env_file: String,
}

impl SaveSnapshotTool {
    pub fn new(sandbox: Arc<dyn SandboxProvider>, aux_timeout: Duration) -> Self {
        Self {
            sandbox,
            aux_timeout,
            env_file: DEFAULT_ENV_FILE.to_string(),
        }
    }

    pub fn with_env_file(mut self, env_file: impl Into<String>) -> Self {
        self.env_file = env_file.into();
        self
    }

    fn script(&self, script: &str) -> Vec<String> {
        vec![
            "sh".to_string(),
            "-c".to_string(),
            script.to_string(),
            "sh".to_string(),
            self.env_file.clone(),
        ]
    }

    async fn restore(&self, sandbox_id: &str) -> Result<(), GatewayError> {
        exec_with_timeout(
            self.sandbox.as_ref(),
            sandbox_id,
            self.script(RESTORE_SCRIPT),
            self.aux_timeout,
        )
        .await
        .map(|_| ())
    }
}

impl ToolHandler for SaveSnapshotTool {
    fn name(&self) -> &'static str {
        "save_snapshot"
    }

    fn call(&self, ctx: ToolContext, _args: Value) -> ToolFuture<'_> {
        Box::pin(async move {
            let session = ctx.hub.context().session();
            let sandbox_id = session.sandbox_id.ok_or_else(|| GatewayError::InvalidRequest {
                message: format!("session {} has no sandbox", session.id),
            })?;

            let scrubbed = exec_with_timeout(
                self.sandbox.as_ref(),
                &sandbox_id,
                self.script(SCRUB_SCRIPT),
                self.aux_timeout,
            )
            .await;
            if let Err(err) = scrubbed {
                // A timed-out scrub may still have moved the file.
                if let Err(restore_err) = self.restore(&sandbox_id).await {
                    tracing::error!(sandbox_id = %sandbox_id, error = %restore_err, "env re-apply failed after scrub failure");
                }
                return Err(err);
            }

            let snapshot = self.sandbox.snapshot(&sandbox_id).await;
            let restored = self.restore(&sandbox_id).await;

            let snapshot_id = match (snapshot, restored) {
                (Ok(snapshot_id), Ok(_)) => snapshot_id,
                (Err(err), restored) => {
                    if let Err(restore_err) = restored {
                        tracing::error!(sandbox_id = %sandbox_id, error = %restore_err, "env re-apply failed after snapshot failure");
                    }
                    return Err(err);
                }
                (Ok(_), Err(err)) => {
                    tracing::error!(sandbox_id = %sandbox_id, error = %err, "env re-apply failed");
                    return Err(err);
                }
            };

            tracing::info!(session_id = %session.id, sandbox_id = %sandbox_id, snapshot_id = %snapshot_id, "snapshot saved");
            Ok(ToolOutput::text(format!("snapshot {snapshot_id} saved"))
                .with_data(json!({ "snapshotId": snapshot_id })))
        })
    }
}
