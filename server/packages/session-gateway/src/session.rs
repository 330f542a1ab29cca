//! Session records as the gateway reads and writes them.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Pause reason written when an automation run reports its terminal outcome.
pub const PAUSE_REASON_AUTOMATION_COMPLETED: &str = "automation_completed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Starting,
    Running,
    Paused,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ClientType {
    /// A human is attached through the dashboard or CLI.
    Interactive,
    /// Started by a trigger; nobody watches liveness.
    Automation,
}

impl ClientType {
    pub fn is_headless(self) -> bool {
        matches!(self, Self::Automation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    Succeeded,
    Failed,
    NeedsHuman,
}

impl SessionOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::NeedsHuman => "needs_human",
        }
    }
}

impl fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub status: SessionStatus,
    pub client_type: ClientType,
    #[serde(default)]
    pub pause_reason: Option<String>,
    #[serde(default)]
    pub outcome: Option<SessionOutcome>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub initial_prompt: Option<String>,
    #[serde(default)]
    pub initial_prompt_sent_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sandbox_id: Option<String>,
    #[serde(default)]
    pub sandbox_expires_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(id: impl Into<String>, client_type: ClientType) -> Self {
        Self {
            id: id.into(),
            status: SessionStatus::Starting,
            client_type,
            pause_reason: None,
            outcome: None,
            summary: None,
            initial_prompt: None,
            initial_prompt_sent_at: None,
            sandbox_id: None,
            sandbox_expires_at: None,
        }
    }

    pub fn with_initial_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.initial_prompt = Some(prompt.into());
        self
    }

    pub fn with_status(mut self, status: SessionStatus) -> Self {
        self.status = status;
        self
    }
}

/// Partial update of a session record.
///
/// `None` leaves a field untouched; `Some(None)` clears a nullable field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionPatch {
    pub status: Option<SessionStatus>,
    pub pause_reason: Option<Option<String>>,
    pub outcome: Option<Option<SessionOutcome>>,
    pub summary: Option<Option<String>>,
    pub initial_prompt_sent_at: Option<Option<DateTime<Utc>>>,
    pub sandbox_id: Option<Option<String>>,
    pub sandbox_expires_at: Option<Option<DateTime<Utc>>>,
}

impl SessionPatch {
    pub fn status(mut self, status: SessionStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn pause_reason(mut self, reason: Option<String>) -> Self {
        self.pause_reason = Some(reason);
        self
    }

    pub fn outcome(mut self, outcome: Option<SessionOutcome>) -> Self {
        self.outcome = Some(outcome);
        self
    }

    pub fn summary(mut self, summary: Option<String>) -> Self {
        self.summary = Some(summary);
        self
    }

    pub fn initial_prompt_sent_at(mut self, sent_at: Option<DateTime<Utc>>) -> Self {
        self.initial_prompt_sent_at = Some(sent_at);
        self
    }

    pub fn sandbox(mut self, sandbox_id: Option<String>, expires_at: Option<DateTime<Utc>>) -> Self {
        self.sandbox_id = Some(sandbox_id);
        self.sandbox_expires_at = Some(expires_at);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn apply_to(&self, session: &mut Session) {
        if let Some(status) = self.status {
            session.status = status;
        }
        if let Some(reason) = &self.pause_reason {
            session.pause_reason = reason.clone();
        }
        if let Some(outcome) = self.outcome {
            session.outcome = outcome;
        }
        if let Some(summary) = &self.summary {
            session.summary = summary.clone();
        }
        if let Some(sent_at) = self.initial_prompt_sent_at {
            session.initial_prompt_sent_at = sent_at;
        }
        if let Some(sandbox_id) = &self.sandbox_id {
            session.sandbox_id = sandbox_id.clone();
        }
        if let Some(expires_at) = self.sandbox_expires_at {
            session.sandbox_expires_at = expires_at;
        }
    }
}
