use std::time::Duration;

use rand::Rng;

use crate::session::{ClientType, SessionStatus};

/// What the hub knows when a runtime transport drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectContext {
    pub client_type: ClientType,
    pub status: SessionStatus,
    pub connected_clients: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectDecision {
    pub schedule_reconnect: bool,
    pub broadcast_status: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl ReconnectPolicy {
    /// A running headless session has nobody watching liveness, so it gets
    /// neither a reconnect schedule nor a status broadcast.
    pub fn decide(&self, ctx: &DisconnectContext) -> DisconnectDecision {
        let suppress = ctx.client_type.is_headless() && ctx.status == SessionStatus::Running;
        if suppress {
            tracing::info!(
                client_type = ?ctx.client_type,
                connected_clients = ctx.connected_clients,
                "reconnect suppressed for headless running session"
            );
            return DisconnectDecision {
                schedule_reconnect: false,
                broadcast_status: false,
            };
        }
        DisconnectDecision {
            schedule_reconnect: self.max_attempts > 0,
            broadcast_status: true,
        }
    }

    /// Delay before `attempt` (1-based): `min(base * 2^(attempt-1), max)`,
    /// scaled by a factor in `[0.9, 1.1)` when jitter is on.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let base = self
            .base_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);
        if !self.jitter {
            return base;
        }
        let factor = rand::rng().random_range(0.9..1.1);
        base.mul_f64(factor)
    }
}
