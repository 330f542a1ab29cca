//! Terminal outcome handling for automation runs.
//!
//! Completion pauses the session instead of tearing it down so the transcript
//! stays inspectable.

use session_gateway_error::GatewayError;

use crate::hub::SessionHub;
use crate::persistence::{AutomationRun, RunCompletion, TriggerEventStatus, TriggerEventUpdate};
use crate::session::{
    ClientType, Session, SessionOutcome, SessionPatch, SessionStatus,
    PAUSE_REASON_AUTOMATION_COMPLETED,
};

/// Maps free-text outcome input onto exactly one outcome. Case and `-`/space
/// separators are normalized; anything else is rejected.
pub fn parse_outcome(raw: &str) -> Result<SessionOutcome, GatewayError> {
    let normalized: String = raw
        .trim()
        .chars()
        .map(|c| match c {
            '-' | ' ' => '_',
            other => other.to_ascii_lowercase(),
        })
        .collect();
    match normalized.as_str() {
        "succeeded" => Ok(SessionOutcome::Succeeded),
        "failed" => Ok(SessionOutcome::Failed),
        "needs_human" => Ok(SessionOutcome::NeedsHuman),
        _ => Err(GatewayError::InvalidOutcome {
            value: raw.to_string(),
        }),
    }
}

/// Trigger event status and reason for an outcome. Only success has no reason.
pub fn trigger_event_transition(
    outcome: SessionOutcome,
    summary: Option<&str>,
) -> (TriggerEventStatus, Option<String>) {
    let with_summary = |prefix: &str| match summary.map(str::trim).filter(|s| !s.is_empty()) {
        Some(summary) => format!("{prefix}: {summary}"),
        None => prefix.to_string(),
    };
    match outcome {
        SessionOutcome::Succeeded => (TriggerEventStatus::Completed, None),
        SessionOutcome::Failed => (
            TriggerEventStatus::Failed,
            Some(with_summary("automation run failed")),
        ),
        SessionOutcome::NeedsHuman => (
            TriggerEventStatus::Skipped,
            Some(with_summary("automation run needs human review")),
        ),
    }
}

pub fn is_completed_automation_session(session: &Session) -> bool {
    session.client_type == ClientType::Automation
        && matches!(session.status, SessionStatus::Paused | SessionStatus::Stopped)
        && session.pause_reason.as_deref() == Some(PAUSE_REASON_AUTOMATION_COMPLETED)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutomationCompletion {
    pub run_id: String,
    pub completion_id: String,
    pub outcome: String,
    pub summary: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedAutomation {
    pub run: AutomationRun,
    pub session: Session,
    pub trigger_event: Option<TriggerEventUpdate>,
}

/// Records the run outcome, updates its trigger event, then pauses the
/// session with `automation_completed`. The outcome is validated before
/// anything is written.
pub async fn complete_automation(
    hub: &SessionHub,
    completion: AutomationCompletion,
) -> Result<CompletedAutomation, GatewayError> {
    let outcome = parse_outcome(&completion.outcome)?;
    let persistence = hub.persistence();

    let run = persistence
        .get_run(&completion.run_id)
        .await?
        .ok_or_else(|| GatewayError::RunNotFound {
            run_id: completion.run_id.clone(),
        })?;
    if run.session_id != hub.session_id() {
        return Err(GatewayError::InvalidRequest {
            message: format!(
                "run {} does not belong to session {}",
                run.run_id,
                hub.session_id()
            ),
        });
    }

    let run = persistence
        .complete_run(RunCompletion {
            run_id: completion.run_id.clone(),
            completion_id: completion.completion_id.clone(),
            outcome,
            summary: completion.summary.clone(),
        })
        .await?;
    // A replayed completion reports what was recorded the first time.
    let outcome = run.outcome.unwrap_or(outcome);
    let summary = run.summary.clone().or(completion.summary);

    let trigger_event = match run.trigger_event_id.clone() {
        Some(trigger_event_id) => {
            let (status, reason) = trigger_event_transition(outcome, summary.as_deref());
            let update = TriggerEventUpdate {
                trigger_event_id,
                status,
                reason,
            };
            persistence.update_trigger_event(update.clone()).await?;
            Some(update)
        }
        None => None,
    };

    let session = hub
        .persist_patch(
            SessionPatch::default()
                .outcome(Some(outcome))
                .summary(summary)
                .status(SessionStatus::Paused)
                .pause_reason(Some(PAUSE_REASON_AUTOMATION_COMPLETED.to_string())),
        )
        .await?;

    tracing::info!(
        session_id = %hub.session_id(),
        run_id = %run.run_id,
        outcome = %outcome,
        "automation run completed"
    );
    Ok(CompletedAutomation {
        run,
        session,
        trigger_event,
    })
}
