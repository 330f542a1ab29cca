use super::*;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem: ProblemDetails = match &self {
            ApiError::Gateway(err) => err.to_problem_details(),
        };
        problem_response(problem)
    }
}

fn problem_response(problem: ProblemDetails) -> Response {
    let status = StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        [(header::CONTENT_TYPE, "application/problem+json")],
        Json(problem),
    )
        .into_response()
}

pub(super) async fn not_found() -> Response {
    problem_response(ProblemDetails {
        type_: ErrorType::InvalidRequest.as_urn().to_string(),
        title: "Not Found".to_string(),
        status: 404,
        detail: Some("endpoint not found".to_string()),
        instance: None,
        extensions: serde_json::Map::new(),
    })
}

/// Resolves the caller's principal and stores it as a request extension.
///
/// A presented token that matches neither configured token is rejected here;
/// which principal may use which route is decided by the handlers.
pub(super) async fn resolve_principal(
    State(state): State<Arc<AppState>>,
    mut request: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let path = request.uri().path();
    if path == "/v1/health" || path == "/health" {
        return Ok(next.run(request).await);
    }

    let principal = state.auth.principal_for(extract_token(request.headers()).as_deref())?;
    request.extensions_mut().insert(principal);
    Ok(next.run(request).await)
}

impl AuthConfig {
    pub(super) fn principal_for(&self, provided: Option<&str>) -> Result<Principal, GatewayError> {
        if !self.is_enabled() {
            return Ok(Principal::Local);
        }
        let Some(provided) = provided else {
            return Ok(Principal::Anonymous);
        };
        if self.sandbox_token.as_deref() == Some(provided) {
            return Ok(Principal::Sandbox);
        }
        if self.service_token.as_deref() == Some(provided) {
            return Ok(Principal::Service);
        }
        Err(GatewayError::TokenInvalid {
            message: Some("invalid token".to_string()),
        })
    }
}

pub(super) fn require_reader(principal: Principal) -> Result<(), GatewayError> {
    match principal {
        principal if principal.may_read_sessions() => Ok(()),
        Principal::Anonymous => Err(GatewayError::TokenInvalid {
            message: Some("missing token".to_string()),
        }),
        _ => Err(GatewayError::PermissionDenied {
            message: Some("session reads require the service token".to_string()),
        }),
    }
}

pub(super) fn extract_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, rest) = value.split_once(' ')?;
    let rest = rest.trim();
    match scheme.to_ascii_lowercase().as_str() {
        "bearer" | "token" => Some(rest.to_string()),
        "basic" => {
            let engines = [
                base64::engine::general_purpose::STANDARD,
                base64::engine::general_purpose::STANDARD_NO_PAD,
            ];
            engines.into_iter().find_map(|engine| {
                let decoded = String::from_utf8(engine.decode(rest).ok()?).ok()?;
                match decoded.split_once(':') {
                    Some((_, password)) => Some(password.to_string()),
                    None if !decoded.is_empty() => Some(decoded),
                    None => None,
                }
            })
        }
        _ => None,
    }
}

pub(super) fn to_sse_event(event: &HubEvent) -> Event {
    Event::default()
        .json_data(event)
        .unwrap_or_else(|_| Event::default().data("{}"))
}

pub(super) fn http_trace_enabled() -> bool {
    !matches!(
        std::env::var("SESSION_GATEWAY_LOG_HTTP"),
        Ok(value) if value == "0" || value.eq_ignore_ascii_case("false")
    )
}

pub(super) fn request_span(req: &Request<axum::body::Body>, include_headers: bool) -> Span {
    if include_headers {
        let headers: Vec<(String, String)> = req
            .headers()
            .iter()
            .map(|(name, value)| {
                let display_value = if name.as_str().eq_ignore_ascii_case("authorization") {
                    "<redacted>".to_string()
                } else {
                    value.to_str().unwrap_or("<binary>").to_string()
                };
                (name.as_str().to_string(), display_value)
            })
            .collect();
        tracing::info_span!(
            "http.request",
            method = %req.method(),
            uri = %req.uri(),
            headers = ?headers
        )
    } else {
        tracing::info_span!("http.request", method = %req.method(), uri = %req.uri())
    }
}
