use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use session_gateway_error::GatewayError;

use crate::hub::SessionHub;
use crate::session::SessionPatch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptDispatch {
    NotConfigured,
    AlreadySent,
    InProgress,
    Sent,
}

/// Sends a session's initial prompt at most once.
///
/// The persisted `initialPromptSentAt` marker guards across lifecycles and
/// instances; the `sending` flag collapses concurrent triggers here.
#[derive(Debug, Default)]
pub struct InitialPromptDispatcher {
    sending: AtomicBool,
}

struct SendingGuard<'a>(&'a AtomicBool);

impl Drop for SendingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl InitialPromptDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_sending(&self) -> bool {
        self.sending.load(Ordering::Acquire)
    }

    pub async fn maybe_send(&self, hub: &SessionHub) -> Result<PromptDispatch, GatewayError> {
        let session = hub.context().session();
        let Some(prompt) = session
            .initial_prompt
            .filter(|prompt| !prompt.trim().is_empty())
        else {
            return Ok(PromptDispatch::NotConfigured);
        };
        if session.initial_prompt_sent_at.is_some() {
            return Ok(PromptDispatch::AlreadySent);
        }
        if self
            .sending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(PromptDispatch::InProgress);
        }
        let _sending = SendingGuard(&self.sending);

        // A send that finished between the first read and taking the flag.
        if hub.context().session().initial_prompt_sent_at.is_some() {
            return Ok(PromptDispatch::AlreadySent);
        }

        hub.persist_patch(SessionPatch::default().initial_prompt_sent_at(Some(Utc::now())))
            .await?;

        if let Err(err) = hub.conversation().send_prompt(hub.session_id(), &prompt).await {
            tracing::warn!(session_id = %hub.session_id(), error = %err, "initial prompt delivery failed, rolling back marker");
            if let Err(rollback) = hub
                .persist_patch(SessionPatch::default().initial_prompt_sent_at(None))
                .await
            {
                tracing::error!(session_id = %hub.session_id(), error = %rollback, "initial prompt marker rollback failed");
            }
            return Err(err);
        }

        tracing::info!(session_id = %hub.session_id(), "initial prompt sent");
        Ok(PromptDispatch::Sent)
    }
}
