use serde::Deserialize;
use serde_json::{json, Value};
use session_gateway_error::GatewayError;

use super::{ToolContext, ToolFuture, ToolHandler, ToolOutput};
use crate::policy::{complete_automation, AutomationCompletion};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AutomationCompleteArgs {
    #[serde(alias = "run_id")]
    run_id: String,
    outcome: String,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default, alias = "completion_id")]
    completion_id: Option<String>,
}

/// Reports an automation run's terminal outcome, then stops the runtime in
/// the background.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutomationCompleteTool;

impl ToolHandler for AutomationCompleteTool {
    fn name(&self) -> &'static str {
        "automation_complete"
    }

    fn call(&self, ctx: ToolContext, args: Value) -> ToolFuture<'_> {
        Box::pin(async move {
            let args: AutomationCompleteArgs =
                serde_json::from_value(args).map_err(|err| GatewayError::InvalidRequest {
                    message: format!("invalid automation_complete arguments: {err}"),
                })?;

            let completed = complete_automation(
                &ctx.hub,
                AutomationCompletion {
                    run_id: args.run_id,
                    completion_id: args.completion_id.unwrap_or(ctx.tool_call_id),
                    outcome: args.outcome,
                    summary: args.summary,
                },
            )
            .await?;

            let hub = ctx.hub.clone();
            ctx.hub.tasks().submit(
                "terminate_for_automation",
                Some(ctx.hub.session_id()),
                async move { hub.terminate_for_automation().await },
            );

            let outcome = completed
                .run
                .outcome
                .map(|outcome| outcome.as_str())
                .unwrap_or_default();
            Ok(
                ToolOutput::text(format!("automation run {} recorded as {outcome}", completed.run.run_id))
                    .with_data(json!({
                        "runId": completed.run.run_id,
                        "outcome": completed.run.outcome,
                        "triggerEventStatus": completed.trigger_event.map(|event| event.status),
                        "sessionStatus": completed.session.status,
                    })),
            )
        })
    }
}
