use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::middleware::Next;
use axum::response::sse::{Event, KeepAlive};
use axum::response::{IntoResponse, Response, Sse};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use base64::Engine;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use session_gateway_error::{ErrorType, GatewayError, ProblemDetails};
use tower_http::trace::TraceLayer;
use tracing::Span;
use utoipa::{Modify, OpenApi, ToSchema};

use crate::hub::{ConnectivityStatus, HubEvent, HubSnapshot};
use crate::lease::OwnershipState;
use crate::services::GatewayServices;
use crate::session::SessionStatus;
use crate::tools::{Principal, ToolCallRequest, ToolCallResult};

mod support;
mod types;

pub use support::ApiError;
use support::*;
pub use types::*;

#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    /// Held by operators and dashboards; may read session state.
    pub service_token: Option<String>,
    /// Injected into sandboxes; may call tools.
    pub sandbox_token: Option<String>,
}

impl AuthConfig {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.service_token.is_some() || self.sandbox_token.is_some()
    }
}

pub struct AppState {
    auth: AuthConfig,
    services: Arc<GatewayServices>,
}

impl AppState {
    pub fn new(auth: AuthConfig, services: Arc<GatewayServices>) -> Self {
        Self { auth, services }
    }

    pub fn services(&self) -> &Arc<GatewayServices> {
        &self.services
    }
}

pub fn build_router(state: AppState) -> Router {
    build_router_with_state(Arc::new(state)).0
}

pub fn build_router_with_state(shared: Arc<AppState>) -> (Router, Arc<AppState>) {
    let v1_router = Router::new()
        .route("/health", get(get_health))
        .route("/openapi.json", get(get_openapi))
        .route("/sessions", get(list_sessions))
        .route("/sessions/:session_id", get(get_session))
        .route("/sessions/:session_id/events/sse", get(get_events_sse))
        .route("/sessions/:session_id/tools/:tool", post(post_tool_call))
        .layer(axum::middleware::from_fn_with_state(
            shared.clone(),
            resolve_principal,
        ))
        .with_state(shared.clone());

    // Sandboxes call back on the unversioned path.
    let callback_router = Router::new()
        .route("/sessions/:session_id/tools/:tool", post(post_tool_call))
        .layer(axum::middleware::from_fn_with_state(
            shared.clone(),
            resolve_principal,
        ))
        .with_state(shared.clone());

    let mut router = Router::new()
        .nest("/v1", v1_router)
        .merge(callback_router)
        .fallback(not_found);

    if http_trace_enabled() {
        let include_headers = std::env::var("SESSION_GATEWAY_LOG_HTTP_HEADERS").is_ok();
        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(move |req: &Request<_>| request_span(req, include_headers))
            .on_request(|_req: &Request<_>, span: &Span| {
                tracing::info!(parent: span, "request");
            })
            .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
                tracing::info!(
                    parent: span,
                    status = %res.status(),
                    latency_ms = latency.as_millis()
                );
            });
        router = router.layer(trace_layer);
    }

    (router, shared)
}

pub async fn shutdown_services(state: &Arc<AppState>) {
    state.services.shutdown().await;
}

#[derive(OpenApi)]
#[openapi(
    paths(get_health, list_sessions, get_session, get_events_sse, post_tool_call),
    components(
        schemas(
            HealthResponse,
            ToolCallBody,
            ToolCallResult,
            HubSnapshot,
            HubListResponse,
            HubEvent,
            ConnectivityStatus,
            OwnershipState,
            SessionStatus,
            ProblemDetails,
            ErrorType
        )
    ),
    tags(
        (name = "meta", description = "Service metadata"),
        (name = "sessions", description = "Session hubs owned by this instance"),
        (name = "tools", description = "Sandbox tool callbacks")
    ),
    modifiers(&ServerAddon)
)]
pub struct ApiDoc;

struct ServerAddon;

impl Modify for ServerAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        openapi.servers = Some(vec![utoipa::openapi::Server::new("http://localhost:2470")]);
    }
}

#[utoipa::path(
    get,
    path = "/v1/health",
    responses((status = 200, body = HealthResponse)),
    tag = "meta"
)]
async fn get_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: crate::VERSION.to_string(),
        instance_id: state.services.instance_id.clone(),
    })
}

async fn get_openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

#[utoipa::path(
    get,
    path = "/v1/sessions",
    responses(
        (status = 200, body = HubListResponse),
        (status = 401, body = ProblemDetails),
        (status = 403, body = ProblemDetails)
    ),
    tag = "sessions"
)]
async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<HubListResponse>, ApiError> {
    require_reader(principal)?;
    Ok(Json(HubListResponse {
        hubs: state.services.hubs.describe().await,
    }))
}

#[utoipa::path(
    get,
    path = "/v1/sessions/{session_id}",
    responses(
        (status = 200, body = HubSnapshot),
        (status = 401, body = ProblemDetails),
        (status = 403, body = ProblemDetails),
        (status = 404, body = ProblemDetails)
    ),
    params(("session_id" = String, Path, description = "Session id")),
    tag = "sessions"
)]
async fn get_session(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(session_id): Path<String>,
) -> Result<Json<HubSnapshot>, ApiError> {
    require_reader(principal)?;
    Ok(Json(state.services.hubs.snapshot(&session_id).await?))
}

#[utoipa::path(
    get,
    path = "/v1/sessions/{session_id}/events/sse",
    responses(
        (status = 200, description = "Hub events as server-sent events"),
        (status = 404, body = ProblemDetails)
    ),
    params(("session_id" = String, Path, description = "Session id")),
    tag = "sessions"
)]
async fn get_events_sse(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(session_id): Path<String>,
) -> Result<Sse<impl futures::Stream<Item = Result<Event, Infallible>>>, ApiError> {
    require_reader(principal)?;
    let hub = state.services.hubs.get_or_create(&session_id).await?;
    let stream = hub
        .subscribe()
        .into_stream()
        .map(|event| Ok::<Event, Infallible>(to_sse_event(&event)));
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

#[utoipa::path(
    post,
    path = "/v1/sessions/{session_id}/tools/{tool}",
    request_body = ToolCallBody,
    responses(
        (status = 200, body = ToolCallResult, description = "Handler result, including handler failures"),
        (status = 400, body = ProblemDetails),
        (status = 401, body = ProblemDetails),
        (status = 403, body = ProblemDetails),
        (status = 404, body = ProblemDetails),
        (status = 409, body = ProblemDetails)
    ),
    params(
        ("session_id" = String, Path, description = "Session id"),
        ("tool" = String, Path, description = "Registered tool name")
    ),
    tag = "tools"
)]
async fn post_tool_call(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path((session_id, tool)): Path<(String, String)>,
    body: Bytes,
) -> Result<Json<ToolCallResult>, ApiError> {
    if !principal.may_call_tools() {
        return Err(GatewayError::PermissionDenied {
            message: Some("tool calls are restricted to the session sandbox".to_string()),
        }
        .into());
    }
    let body = ToolCallBody::from_bytes(&body)?;
    let result = state
        .services
        .tools
        .execute(
            principal,
            ToolCallRequest {
                session_id,
                tool,
                tool_call_id: body.tool_call_id,
                args: body.args,
            },
        )
        .await?;
    Ok(Json(result))
}
