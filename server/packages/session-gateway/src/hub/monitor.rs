use std::sync::Weak;
use std::time::Duration;

use tokio::task::JoinHandle;

use super::SessionHub;

/// Watches a hub's runtime after bring-up.
pub trait RuntimeMonitor: Send + Sync + 'static {
    fn start(&self, hub: Weak<SessionHub>) -> MonitorHandle;
}

/// Stops the monitor task when dropped.
#[derive(Debug, Default)]
pub struct MonitorHandle {
    task: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    pub fn new(task: JoinHandle<()>) -> Self {
        Self { task: Some(task) }
    }

    /// A handle with nothing behind it.
    pub fn detached() -> Self {
        Self::default()
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Migrates sessions whose sandbox is about to expire.
#[derive(Debug, Clone, Copy)]
pub struct ExpiryMonitor {
    pub interval: Duration,
    pub grace: Duration,
}

impl Default for ExpiryMonitor {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            grace: Duration::from_secs(5 * 60),
        }
    }
}

impl RuntimeMonitor for ExpiryMonitor {
    fn start(&self, hub: Weak<SessionHub>) -> MonitorHandle {
        let interval = self.interval;
        let grace = chrono::Duration::from_std(self.grace).unwrap_or_else(|_| chrono::Duration::days(365));
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(hub) = hub.upgrade() else {
                    return;
                };
                if !hub.owns_owner_lease() {
                    tracing::debug!(session_id = %hub.session_id(), "monitor stopping, lease not owned");
                    return;
                }
                if let Err(err) = hub.check_sandbox_expiry(grace).await {
                    tracing::warn!(session_id = %hub.session_id(), error = %err, "sandbox migration failed");
                }
            }
        });
        MonitorHandle::new(task)
    }
}
