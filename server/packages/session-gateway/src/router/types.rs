use super::*;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub instance_id: String,
}

/// Body of a sandbox tool callback.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ToolCallBody {
    #[serde(alias = "toolCallId")]
    pub tool_call_id: String,
    #[serde(default)]
    pub args: Value,
}

impl ToolCallBody {
    pub(super) fn from_bytes(bytes: &[u8]) -> Result<Self, GatewayError> {
        if bytes.is_empty() {
            return Err(GatewayError::InvalidRequest {
                message: "request body is required".to_string(),
            });
        }
        let mut body: Self =
            serde_json::from_slice(bytes).map_err(|err| GatewayError::InvalidRequest {
                message: format!("invalid tool call body: {err}"),
            })?;
        if body.args.is_null() {
            body.args = Value::Object(serde_json::Map::new());
        }
        if !body.args.is_object() {
            return Err(GatewayError::InvalidRequest {
                message: "args must be a JSON object".to_string(),
            });
        }
        Ok(body)
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HubListResponse {
    pub hubs: Vec<HubSnapshot>,
}
