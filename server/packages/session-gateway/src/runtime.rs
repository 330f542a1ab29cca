//! Runtime collaborators: sandbox lifecycle, sandbox commands and conversation delivery.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use session_gateway_error::GatewayError;
use tokio::process::Command;

use crate::session::Session;

pub type RuntimeFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, GatewayError>> + Send + 'a>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxInfo {
    pub sandbox_id: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Brings a session's sandbox runtime up and keeps it attached.
pub trait RuntimeLifecycle: Send + Sync + 'static {
    fn ensure_ready(&self, session: &Session) -> RuntimeFuture<'_, SandboxInfo>;

    /// Re-attaches to a runtime whose transport dropped.
    fn reconnect(&self, session: &Session) -> RuntimeFuture<'_, ()>;

    /// Moves the session to a fresh sandbox before the current one expires.
    fn migrate(&self, session: &Session) -> RuntimeFuture<'_, SandboxInfo>;

    fn stop(&self, session: &Session) -> RuntimeFuture<'_, ()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

pub trait SandboxProvider: Send + Sync + 'static {
    fn exec_command(
        &self,
        sandbox_id: &str,
        argv: Vec<String>,
        timeout: Duration,
    ) -> RuntimeFuture<'_, CommandOutput>;

    /// Captures the sandbox filesystem. Returns the snapshot id.
    fn snapshot(&self, sandbox_id: &str) -> RuntimeFuture<'_, String>;
}

pub trait Conversation: Send + Sync + 'static {
    fn send_prompt(&self, session_id: &str, prompt: &str) -> RuntimeFuture<'_, ()>;
}

/// Runs a command with a hard ceiling. A non-zero exit is an error.
pub async fn exec_with_timeout(
    provider: &dyn SandboxProvider,
    sandbox_id: &str,
    argv: Vec<String>,
    timeout: Duration,
) -> Result<CommandOutput, GatewayError> {
    let program = argv.first().cloned().unwrap_or_default();
    let output = tokio::time::timeout(timeout, provider.exec_command(sandbox_id, argv, timeout))
        .await
        .map_err(|_| GatewayError::Timeout {
            message: Some(format!(
                "sandbox command {program} exceeded {}ms",
                timeout.as_millis()
            )),
        })??;

    if output.exit_code != 0 {
        return Err(GatewayError::SandboxCommand {
            message: format!(
                "{program} exited with {}: {}",
                output.exit_code,
                output.stderr.trim()
            ),
        });
    }
    Ok(output)
}

/// Sandboxes as directories on the local machine.
///
/// Each session gets `<root>/local-<session id>`; commands run there with
/// `tokio::process`, snapshots copy the directory under `<root>/snapshots`.
#[derive(Debug, Clone)]
pub struct LocalRuntime {
    root: PathBuf,
    sandbox_lifetime: chrono::Duration,
}

impl LocalRuntime {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            sandbox_lifetime: chrono::Duration::hours(1),
        }
    }

    pub fn with_sandbox_lifetime(mut self, lifetime: chrono::Duration) -> Self {
        self.sandbox_lifetime = lifetime;
        self
    }

    pub fn default_root() -> PathBuf {
        dirs::data_dir()
            .map(|dir| dir.join("session-gateway").join("sandboxes"))
            .unwrap_or_else(|| PathBuf::from(".").join(".session-gateway").join("sandboxes"))
    }

    pub fn sandbox_dir(&self, sandbox_id: &str) -> PathBuf {
        self.root.join(sandbox_id)
    }

    fn sandbox_id_for(session: &Session) -> String {
        format!("local-{}", session.id)
    }

    async fn provision(&self, session: &Session) -> Result<SandboxInfo, GatewayError> {
        let sandbox_id = Self::sandbox_id_for(session);
        let dir = self.sandbox_dir(&sandbox_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|err| GatewayError::RuntimeInitFailure {
                message: format!("failed to create sandbox {}: {err}", dir.display()),
            })?;
        Ok(SandboxInfo {
            sandbox_id,
            expires_at: Some(Utc::now() + self.sandbox_lifetime),
        })
    }
}

impl RuntimeLifecycle for LocalRuntime {
    fn ensure_ready(&self, session: &Session) -> RuntimeFuture<'_, SandboxInfo> {
        let session = session.clone();
        Box::pin(async move {
            let info = self.provision(&session).await?;
            tracing::info!(session_id = %session.id, sandbox_id = %info.sandbox_id, "local sandbox ready");
            Ok(info)
        })
    }

    fn reconnect(&self, session: &Session) -> RuntimeFuture<'_, ()> {
        let dir = self.sandbox_dir(&Self::sandbox_id_for(session));
        Box::pin(async move {
            if tokio::fs::try_exists(&dir).await.unwrap_or(false) {
                Ok(())
            } else {
                Err(GatewayError::RuntimeInitFailure {
                    message: format!("sandbox directory {} is gone", dir.display()),
                })
            }
        })
    }

    fn migrate(&self, session: &Session) -> RuntimeFuture<'_, SandboxInfo> {
        let session = session.clone();
        Box::pin(async move { self.provision(&session).await })
    }

    fn stop(&self, session: &Session) -> RuntimeFuture<'_, ()> {
        let session_id = session.id.clone();
        Box::pin(async move {
            tracing::info!(session_id = %session_id, "local sandbox stopped");
            Ok(())
        })
    }
}

impl SandboxProvider for LocalRuntime {
    fn exec_command(
        &self,
        sandbox_id: &str,
        argv: Vec<String>,
        timeout: Duration,
    ) -> RuntimeFuture<'_, CommandOutput> {
        let dir = self.sandbox_dir(sandbox_id);
        Box::pin(async move {
            let Some((program, args)) = argv.split_first() else {
                return Err(GatewayError::InvalidRequest {
                    message: "empty sandbox command".to_string(),
                });
            };
            let mut cmd = Command::new(program);
            cmd.args(args)
                .current_dir(&dir)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);

            let output = tokio::time::timeout(timeout, cmd.output())
                .await
                .map_err(|_| GatewayError::Timeout {
                    message: Some(format!("{program} timed out")),
                })?
                .map_err(|err| GatewayError::SandboxCommand {
                    message: format!("failed to run {program}: {err}"),
                })?;

            Ok(CommandOutput {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        })
    }

    fn snapshot(&self, sandbox_id: &str) -> RuntimeFuture<'_, String> {
        let source = self.sandbox_dir(sandbox_id);
        let snapshot_id = format!("snap-{sandbox_id}-{}", Utc::now().timestamp_millis());
        let target = self.root.join("snapshots").join(&snapshot_id);
        Box::pin(async move {
            tokio::task::spawn_blocking(move || copy_dir(&source, &target))
                .await
                .map_err(|err| GatewayError::SandboxCommand {
                    message: format!("snapshot task failed: {err}"),
                })?
                .map_err(|err| GatewayError::SandboxCommand {
                    message: format!("snapshot copy failed: {err}"),
                })?;
            Ok(snapshot_id)
        })
    }
}

fn copy_dir(source: &Path, target: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(target)?;
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let path = entry.path();
        let dest = target.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&path, &dest)?;
        } else {
            std::fs::copy(&path, &dest)?;
        }
    }
    Ok(())
}

/// Delivers prompts to the log. Used when no agent transport is wired in.
#[derive(Debug, Default, Clone)]
pub struct LoggingConversation;

impl Conversation for LoggingConversation {
    fn send_prompt(&self, session_id: &str, prompt: &str) -> RuntimeFuture<'_, ()> {
        tracing::info!(session_id = %session_id, prompt_len = prompt.len(), "initial prompt delivered");
        Box::pin(async { Ok(()) })
    }
}
