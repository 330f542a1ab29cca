//! Lifecycle decisions consulted by the session hub.

pub mod automation;
pub mod initial_prompt;
pub mod reconnect;

pub use automation::{
    complete_automation, is_completed_automation_session, parse_outcome, trigger_event_transition,
    AutomationCompletion, CompletedAutomation,
};
pub use initial_prompt::{InitialPromptDispatcher, PromptDispatch};
pub use reconnect::{DisconnectContext, DisconnectDecision, ReconnectPolicy};
