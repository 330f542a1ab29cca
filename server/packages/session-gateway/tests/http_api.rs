mod common;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use serde_json::json;
use session_gateway::router::AuthConfig;
use session_gateway::session::{ClientType, Session};
use session_gateway::tools::ToolHandler;
use tower::util::ServiceExt;

use common::{send_json, token_auth, CountingTool, Harness, TestApp, SANDBOX_TOKEN, SERVICE_TOKEN};

fn app_with_counter(auth: AuthConfig) -> (TestApp, Arc<CountingTool>, Harness) {
    let harness = Harness::new();
    harness.insert_session(Session::new("ses_http", ClientType::Interactive));
    let tool = Arc::new(CountingTool::new("counting"));
    let app = TestApp::new(&harness, auth, vec![tool.clone() as Arc<dyn ToolHandler>]);
    (app, tool, harness)
}

#[tokio::test]
async fn health_is_public() {
    let (test_app, _, _) = app_with_counter(token_auth());

    let (status, body) = send_json(&test_app.app, Method::GET, "/v1/health", None, None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["instanceId"], "gw-a");
    assert_eq!(body["version"], session_gateway::VERSION);
}

#[tokio::test]
async fn openapi_lists_tool_route() {
    let (test_app, _, _) = app_with_counter(AuthConfig::disabled());

    let (status, body) =
        send_json(&test_app.app, Method::GET, "/v1/openapi.json", None, None).await;

    assert_eq!(status, StatusCode::OK);
    assert!(body["paths"]["/v1/sessions/{session_id}/tools/{tool}"]["post"].is_object());
    assert!(body["components"]["schemas"]["ToolCallResult"].is_object());
}

#[tokio::test]
async fn tool_callback_executes_once_per_call_id() {
    let (test_app, tool, _) = app_with_counter(token_auth());
    let body = json!({ "tool_call_id": "call_1", "args": { "path": "/tmp" } });

    let (status, first) = send_json(
        &test_app.app,
        Method::POST,
        "/sessions/ses_http/tools/counting",
        Some(SANDBOX_TOKEN),
        Some(body.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["success"], true);
    assert_eq!(first["data"]["args"]["path"], "/tmp");

    let (status, replay) = send_json(
        &test_app.app,
        Method::POST,
        "/v1/sessions/ses_http/tools/counting",
        Some(SANDBOX_TOKEN),
        Some(body),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(replay, first);
    assert_eq!(tool.invocations(), 1);
}

#[tokio::test]
async fn camel_case_call_id_and_null_args_are_accepted() {
    let (test_app, _, _) = app_with_counter(AuthConfig::disabled());

    let (status, body) = send_json(
        &test_app.app,
        Method::POST,
        "/sessions/ses_http/tools/counting",
        None,
        Some(json!({ "toolCallId": "call_camel", "args": null })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["args"], json!({}));
}

#[tokio::test]
async fn malformed_bodies_are_rejected() {
    let (test_app, tool, _) = app_with_counter(token_auth());

    for body in [
        json!({ "args": {} }),
        json!({ "tool_call_id": "call_1", "args": [1, 2] }),
        json!({ "tool_call_id": "", "args": {} }),
    ] {
        let (status, problem) = send_json(
            &test_app.app,
            Method::POST,
            "/sessions/ses_http/tools/counting",
            Some(SANDBOX_TOKEN),
            Some(body.clone()),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "body {body}");
        assert_eq!(problem["status"], 400);
    }

    let (status, _) = send_json(
        &test_app.app,
        Method::POST,
        "/sessions/ses_http/tools/counting",
        Some(SANDBOX_TOKEN),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(tool.invocations(), 0);
}

#[tokio::test]
async fn tokens_gate_routes_by_principal() {
    let (test_app, tool, _) = app_with_counter(token_auth());
    let body = json!({ "tool_call_id": "call_1" });
    let path = "/sessions/ses_http/tools/counting";

    let (status, problem) =
        send_json(&test_app.app, Method::POST, path, Some("wrong"), Some(body.clone())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(problem["type"], "urn:session-gateway:error:token_invalid");

    let (status, _) =
        send_json(&test_app.app, Method::POST, path, Some(SERVICE_TOKEN), Some(body.clone())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send_json(&test_app.app, Method::POST, path, None, Some(body)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(tool.invocations(), 0);

    let (status, _) = send_json(&test_app.app, Method::GET, "/v1/sessions", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) =
        send_json(&test_app.app, Method::GET, "/v1/sessions", Some(SANDBOX_TOKEN), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, body) =
        send_json(&test_app.app, Method::GET, "/v1/sessions", Some(SERVICE_TOKEN), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["hubs"], json!([]));
}

#[tokio::test]
async fn unknown_tool_and_session_are_not_found() {
    let (test_app, _, _) = app_with_counter(token_auth());

    let (status, problem) = send_json(
        &test_app.app,
        Method::POST,
        "/sessions/ses_http/tools/teleport",
        Some(SANDBOX_TOKEN),
        Some(json!({ "tool_call_id": "call_1" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(problem["type"], "urn:session-gateway:error:unknown_tool");

    let (status, _) = send_json(
        &test_app.app,
        Method::POST,
        "/sessions/ses_missing/tools/counting",
        Some(SANDBOX_TOKEN),
        Some(json!({ "tool_call_id": "call_1" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send_json(&test_app.app, Method::GET, "/v2/nothing", None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn lease_conflict_maps_to_409() {
    let (test_app, _, harness) = app_with_counter(token_auth());
    let peer = harness.peer("gw-b");
    let other = TestApp::new(&peer, token_auth(), Vec::new());

    let (status, _) = send_json(
        &test_app.app,
        Method::POST,
        "/sessions/ses_http/tools/counting",
        Some(SANDBOX_TOKEN),
        Some(json!({ "tool_call_id": "call_1" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, problem) = send_json(
        &other.app,
        Method::POST,
        "/sessions/ses_http/tools/save_snapshot",
        Some(SANDBOX_TOKEN),
        Some(json!({ "tool_call_id": "call_2" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(problem["type"], "urn:session-gateway:error:lease_conflict");
    assert!(other.services.hubs.get("ses_http").await.is_none());
}

#[tokio::test]
async fn reading_a_session_does_not_register_a_hub() {
    let (test_app, _, _) = app_with_counter(token_auth());

    let (status, body) = send_json(
        &test_app.app,
        Method::GET,
        "/v1/sessions/ses_http",
        Some(SERVICE_TOKEN),
        None,
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ownership"], "unowned");
    assert_eq!(body["session"]["id"], "ses_http");
    assert!(test_app.services.hubs.describe().await.is_empty());

    let (status, _) = send_json(
        &test_app.app,
        Method::GET,
        "/v1/sessions/ses_missing",
        Some(SERVICE_TOKEN),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn session_snapshot_reflects_ownership() {
    let (test_app, _, _) = app_with_counter(token_auth());
    send_json(
        &test_app.app,
        Method::POST,
        "/sessions/ses_http/tools/counting",
        Some(SANDBOX_TOKEN),
        Some(json!({ "tool_call_id": "call_1" })),
    )
    .await;

    let (status, body) = send_json(
        &test_app.app,
        Method::GET,
        "/v1/sessions/ses_http",
        Some(SERVICE_TOKEN),
        None,
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ownership"], "owned");
    assert_eq!(body["runtimeReady"], true);
    assert_eq!(body["activeToolCalls"], 0);
    assert_eq!(body["session"]["status"], "running");

    test_app.services.shutdown().await;
    assert!(test_app.services.hubs.describe().await.is_empty());
}

#[tokio::test]
async fn event_stream_opens_for_readers() {
    let (test_app, _, _) = app_with_counter(token_auth());

    let request = Request::builder()
        .method(Method::GET)
        .uri("/v1/sessions/ses_http/events/sse")
        .header(header::AUTHORIZATION, format!("Bearer {SERVICE_TOKEN}"))
        .body(Body::empty())
        .expect("request");
    let response = test_app.app.clone().oneshot(request).await.expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    assert!(content_type.starts_with("text/event-stream"));
}
