//! Persistence collaborator: session, automation run and trigger event records.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use session_gateway_error::GatewayError;

use crate::session::{Session, SessionOutcome, SessionPatch};

pub type PersistenceFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, GatewayError>> + Send + 'a>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationRun {
    pub run_id: String,
    pub session_id: String,
    #[serde(default)]
    pub completion_id: Option<String>,
    #[serde(default)]
    pub outcome: Option<SessionOutcome>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub trigger_event_id: Option<String>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl AutomationRun {
    pub fn new(run_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            session_id: session_id.into(),
            completion_id: None,
            outcome: None,
            summary: None,
            trigger_event_id: None,
            completed_at: None,
        }
    }

    pub fn with_trigger_event(mut self, trigger_event_id: impl Into<String>) -> Self {
        self.trigger_event_id = Some(trigger_event_id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunCompletion {
    pub run_id: String,
    pub completion_id: String,
    pub outcome: SessionOutcome,
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerEventStatus {
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerEventUpdate {
    pub trigger_event_id: String,
    pub status: TriggerEventStatus,
    pub reason: Option<String>,
}

/// Record store shared by every gateway instance.
///
/// `complete_run` must be idempotent per completion id: retries that land on
/// another instance after a lease handoff rely on it.
pub trait Persistence: Send + Sync + 'static {
    fn get_session(&self, session_id: &str) -> PersistenceFuture<'_, Option<Session>>;

    fn update_session(&self, session_id: &str, patch: SessionPatch)
        -> PersistenceFuture<'_, Session>;

    fn get_run(&self, run_id: &str) -> PersistenceFuture<'_, Option<AutomationRun>>;

    fn complete_run(&self, completion: RunCompletion) -> PersistenceFuture<'_, AutomationRun>;

    fn update_trigger_event(&self, update: TriggerEventUpdate) -> PersistenceFuture<'_, ()>;
}

/// Seed file accepted by [`MemoryPersistence::from_json_file`].
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SeedFile {
    #[serde(default)]
    sessions: Vec<Session>,
    #[serde(default)]
    runs: Vec<AutomationRun>,
}

#[derive(Debug, Default)]
pub struct MemoryPersistence {
    state: Mutex<MemoryRecords>,
}

#[derive(Debug, Default)]
struct MemoryRecords {
    sessions: HashMap<String, Session>,
    runs: HashMap<String, AutomationRun>,
    trigger_events: HashMap<String, TriggerEventUpdate>,
    /// Present only when built with [`MemoryPersistence::with_write_journal`].
    session_writes: Option<Vec<(String, SessionPatch)>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also records every session patch, for inspecting write order.
    pub fn with_write_journal() -> Self {
        let persistence = Self::default();
        persistence.records().session_writes = Some(Vec::new());
        persistence
    }

    pub fn from_json_file(path: &Path) -> Result<Self, GatewayError> {
        let raw = std::fs::read_to_string(path).map_err(|err| GatewayError::Persistence {
            message: format!("failed to read {}: {err}", path.display()),
        })?;
        let seed: SeedFile =
            serde_json::from_str(&raw).map_err(|err| GatewayError::Persistence {
                message: format!("invalid seed file {}: {err}", path.display()),
            })?;

        let persistence = Self::new();
        for session in seed.sessions {
            persistence.insert_session(session);
        }
        for run in seed.runs {
            persistence.insert_run(run);
        }
        Ok(persistence)
    }

    fn records(&self) -> std::sync::MutexGuard<'_, MemoryRecords> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert_session(&self, session: Session) {
        self.records().sessions.insert(session.id.clone(), session);
    }

    pub fn remove_session(&self, session_id: &str) -> Option<Session> {
        self.records().sessions.remove(session_id)
    }

    pub fn insert_run(&self, run: AutomationRun) {
        self.records().runs.insert(run.run_id.clone(), run);
    }

    pub fn session(&self, session_id: &str) -> Option<Session> {
        self.records().sessions.get(session_id).cloned()
    }

    pub fn run(&self, run_id: &str) -> Option<AutomationRun> {
        self.records().runs.get(run_id).cloned()
    }

    pub fn trigger_event(&self, trigger_event_id: &str) -> Option<TriggerEventUpdate> {
        self.records().trigger_events.get(trigger_event_id).cloned()
    }

    /// Every session patch applied so far, in order. Empty without a journal.
    pub fn session_writes(&self, session_id: &str) -> Vec<SessionPatch> {
        self.records()
            .session_writes
            .iter()
            .flatten()
            .filter(|(id, _)| id == session_id)
            .map(|(_, patch)| patch.clone())
            .collect()
    }
}

impl Persistence for MemoryPersistence {
    fn get_session(&self, session_id: &str) -> PersistenceFuture<'_, Option<Session>> {
        let session = self.session(session_id);
        Box::pin(async move { Ok(session) })
    }

    fn update_session(
        &self,
        session_id: &str,
        patch: SessionPatch,
    ) -> PersistenceFuture<'_, Session> {
        let session_id = session_id.to_string();
        Box::pin(async move {
            let mut records = self.records();
            let session = records
                .sessions
                .get_mut(&session_id)
                .ok_or_else(|| GatewayError::SessionNotFound {
                    session_id: session_id.clone(),
                })?;
            patch.apply_to(session);
            let updated = session.clone();
            if let Some(journal) = records.session_writes.as_mut() {
                journal.push((session_id, patch));
            }
            Ok(updated)
        })
    }

    fn get_run(&self, run_id: &str) -> PersistenceFuture<'_, Option<AutomationRun>> {
        let run = self.run(run_id);
        Box::pin(async move { Ok(run) })
    }

    fn complete_run(&self, completion: RunCompletion) -> PersistenceFuture<'_, AutomationRun> {
        Box::pin(async move {
            let mut records = self.records();
            let run = records.runs.get_mut(&completion.run_id).ok_or_else(|| {
                GatewayError::RunNotFound {
                    run_id: completion.run_id.clone(),
                }
            })?;

            match run.completion_id.as_deref() {
                Some(existing) if existing == completion.completion_id => {
                    return Ok(run.clone());
                }
                Some(existing) => {
                    return Err(GatewayError::Conflict {
                        message: format!(
                            "run {} was already completed by {existing}",
                            completion.run_id
                        ),
                    });
                }
                None => {}
            }

            run.completion_id = Some(completion.completion_id);
            run.outcome = Some(completion.outcome);
            run.summary = completion.summary;
            run.completed_at = Some(Utc::now());
            Ok(run.clone())
        })
    }

    fn update_trigger_event(&self, update: TriggerEventUpdate) -> PersistenceFuture<'_, ()> {
        Box::pin(async move {
            self.records()
                .trigger_events
                .insert(update.trigger_event_id.clone(), update);
            Ok(())
        })
    }
}
