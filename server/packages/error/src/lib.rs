use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    TokenInvalid,
    PermissionDenied,
    UnknownTool,
    SessionNotFound,
    RunNotFound,
    LeaseConflict,
    Conflict,
    InvalidOutcome,
    RuntimeInitFailure,
    LeaseStore,
    Persistence,
    SandboxCommand,
    Timeout,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "urn:session-gateway:error:invalid_request",
            Self::TokenInvalid => "urn:session-gateway:error:token_invalid",
            Self::PermissionDenied => "urn:session-gateway:error:permission_denied",
            Self::UnknownTool => "urn:session-gateway:error:unknown_tool",
            Self::SessionNotFound => "urn:session-gateway:error:session_not_found",
            Self::RunNotFound => "urn:session-gateway:error:run_not_found",
            Self::LeaseConflict => "urn:session-gateway:error:lease_conflict",
            Self::Conflict => "urn:session-gateway:error:conflict",
            Self::InvalidOutcome => "urn:session-gateway:error:invalid_outcome",
            Self::RuntimeInitFailure => "urn:session-gateway:error:runtime_init_failure",
            Self::LeaseStore => "urn:session-gateway:error:lease_store",
            Self::Persistence => "urn:session-gateway:error:persistence",
            Self::SandboxCommand => "urn:session-gateway:error:sandbox_command",
            Self::Timeout => "urn:session-gateway:error:timeout",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "Invalid Request",
            Self::TokenInvalid => "Token Invalid",
            Self::PermissionDenied => "Permission Denied",
            Self::UnknownTool => "Unknown Tool",
            Self::SessionNotFound => "Session Not Found",
            Self::RunNotFound => "Run Not Found",
            Self::LeaseConflict => "Lease Conflict",
            Self::Conflict => "Conflict",
            Self::InvalidOutcome => "Invalid Outcome",
            Self::RuntimeInitFailure => "Runtime Init Failure",
            Self::LeaseStore => "Lease Store Unavailable",
            Self::Persistence => "Persistence Error",
            Self::SandboxCommand => "Sandbox Command Failed",
            Self::Timeout => "Timeout",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::TokenInvalid => 401,
            Self::PermissionDenied => 403,
            Self::UnknownTool => 404,
            Self::SessionNotFound => 404,
            Self::RunNotFound => 404,
            Self::LeaseConflict => 409,
            Self::Conflict => 409,
            Self::InvalidOutcome => 400,
            Self::RuntimeInitFailure => 502,
            Self::LeaseStore => 503,
            Self::Persistence => 500,
            Self::SandboxCommand => 502,
            Self::Timeout => 504,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            instance: None,
            extensions: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("token invalid")]
    TokenInvalid { message: Option<String> },
    #[error("permission denied")]
    PermissionDenied { message: Option<String> },
    #[error("unknown tool: {tool}")]
    UnknownTool { tool: String },
    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },
    #[error("automation run not found: {run_id}")]
    RunNotFound { run_id: String },
    #[error("session {session_id} is owned by instance {owner_instance_id}")]
    LeaseConflict {
        session_id: String,
        owner_instance_id: String,
    },
    #[error("conflict: {message}")]
    Conflict { message: String },
    #[error("invalid outcome: {value}")]
    InvalidOutcome { value: String },
    #[error("runtime init failed: {message}")]
    RuntimeInitFailure { message: String },
    #[error("lease store error: {message}")]
    LeaseStore { message: String },
    #[error("persistence error: {message}")]
    Persistence { message: String },
    #[error("sandbox command failed: {message}")]
    SandboxCommand { message: String },
    #[error("timeout")]
    Timeout { message: Option<String> },
}

impl GatewayError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::TokenInvalid { .. } => ErrorType::TokenInvalid,
            Self::PermissionDenied { .. } => ErrorType::PermissionDenied,
            Self::UnknownTool { .. } => ErrorType::UnknownTool,
            Self::SessionNotFound { .. } => ErrorType::SessionNotFound,
            Self::RunNotFound { .. } => ErrorType::RunNotFound,
            Self::LeaseConflict { .. } => ErrorType::LeaseConflict,
            Self::Conflict { .. } => ErrorType::Conflict,
            Self::InvalidOutcome { .. } => ErrorType::InvalidOutcome,
            Self::RuntimeInitFailure { .. } => ErrorType::RuntimeInitFailure,
            Self::LeaseStore { .. } => ErrorType::LeaseStore,
            Self::Persistence { .. } => ErrorType::Persistence,
            Self::SandboxCommand { .. } => ErrorType::SandboxCommand,
            Self::Timeout { .. } => ErrorType::Timeout,
        }
    }

    /// True for errors the caller can fix by changing the request.
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.error_type().status_code())
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));
        let mut extensions = Map::new();

        match self {
            Self::TokenInvalid { message }
            | Self::PermissionDenied { message }
            | Self::Timeout { message } => {
                if let Some(message) = message {
                    extensions.insert("details".to_string(), message_details(message));
                }
            }
            Self::UnknownTool { tool } => {
                extensions.insert("tool".to_string(), Value::String(tool.clone()));
            }
            Self::SessionNotFound { session_id } => {
                extensions.insert("sessionId".to_string(), Value::String(session_id.clone()));
            }
            Self::RunNotFound { run_id } => {
                extensions.insert("runId".to_string(), Value::String(run_id.clone()));
            }
            Self::LeaseConflict {
                session_id,
                owner_instance_id,
            } => {
                extensions.insert("sessionId".to_string(), Value::String(session_id.clone()));
                let mut map = Map::new();
                map.insert(
                    "ownerInstanceId".to_string(),
                    Value::String(owner_instance_id.clone()),
                );
                extensions.insert("details".to_string(), Value::Object(map));
            }
            Self::InvalidOutcome { value } => {
                let mut map = Map::new();
                map.insert("outcome".to_string(), Value::String(value.clone()));
                map.insert(
                    "allowed".to_string(),
                    Value::Array(
                        ["succeeded", "failed", "needs_human"]
                            .iter()
                            .map(|value| Value::String(value.to_string()))
                            .collect(),
                    ),
                );
                extensions.insert("details".to_string(), Value::Object(map));
            }
            Self::InvalidRequest { .. }
            | Self::Conflict { .. }
            | Self::RuntimeInitFailure { .. }
            | Self::LeaseStore { .. }
            | Self::Persistence { .. }
            | Self::SandboxCommand { .. } => {}
        }

        problem.extensions = extensions;
        problem
    }
}

fn message_details(message: &str) -> Value {
    let mut map = Map::new();
    map.insert("message".to_string(), Value::String(message.to_string()));
    Value::Object(map)
}

impl From<GatewayError> for ProblemDetails {
    fn from(value: GatewayError) -> Self {
        value.to_problem_details()
    }
}

impl From<&GatewayError> for ProblemDetails {
    fn from(value: &GatewayError) -> Self {
        value.to_problem_details()
    }
}
