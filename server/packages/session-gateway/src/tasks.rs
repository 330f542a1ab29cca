//! Tracked background work submitted after a response has gone out.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use session_gateway_error::GatewayError;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOutcome {
    pub name: String,
    pub session_id: Option<String>,
    pub error: Option<String>,
}

impl TaskOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Clone)]
pub struct BackgroundTasks {
    inner: Arc<TasksInner>,
}

struct TasksInner {
    handles: Mutex<Vec<JoinHandle<()>>>,
    outcomes: broadcast::Sender<TaskOutcome>,
}

impl Default for BackgroundTasks {
    fn default() -> Self {
        Self::new()
    }
}

impl BackgroundTasks {
    pub fn new() -> Self {
        let (outcomes, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(TasksInner {
                handles: Mutex::new(Vec::new()),
                outcomes,
            }),
        }
    }

    /// Spawns `task`. Failures are logged and published, never returned.
    pub fn submit<F>(&self, name: &str, session_id: Option<&str>, task: F)
    where
        F: Future<Output = Result<(), GatewayError>> + Send + 'static,
    {
        let outcomes = self.inner.outcomes.clone();
        let name = name.to_string();
        let session_id = session_id.map(str::to_string);
        tracing::debug!(task = %name, session_id = ?session_id, "background task submitted");

        let handle = tokio::spawn(async move {
            let error = match task.await {
                Ok(()) => None,
                Err(err) => {
                    tracing::warn!(task = %name, session_id = ?session_id, error = %err, "background task failed");
                    Some(err.to_string())
                }
            };
            let _ = outcomes.send(TaskOutcome {
                name,
                session_id,
                error,
            });
        });

        let mut handles = self
            .inner
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        handles.retain(|handle| !handle.is_finished());
        handles.push(handle);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskOutcome> {
        self.inner.outcomes.subscribe()
    }

    pub fn pending(&self) -> usize {
        self.inner
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    /// Waits for every task submitted so far, including ones submitted while draining.
    pub async fn drain(&self) {
        loop {
            let handles = std::mem::take(
                &mut *self
                    .inner
                    .handles
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner),
            );
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                if let Err(err) = handle.await {
                    tracing::warn!(error = %err, "background task panicked");
                }
            }
        }
    }
}

impl std::fmt::Debug for BackgroundTasks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundTasks")
            .field("pending", &self.pending())
            .finish()
    }
}
