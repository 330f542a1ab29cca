use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use reqwest::blocking::Client as HttpClient;
use serde_json::Value;
use thiserror::Error;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{ConfigError, GatewayConfig, LeaseStoreConfig};
use crate::router::{build_router_with_state, shutdown_services, AppState, AuthConfig};
use crate::services::{Collaborators, GatewayServices};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 2470;

#[derive(Parser, Debug)]
#[command(name = "session-gateway", bin_name = "session-gateway")]
#[command(about = "Session lease gateway", version = crate::VERSION)]
#[command(arg_required_else_help = true)]
pub struct SessionGatewayCli {
    #[command(subcommand)]
    command: Command,

    /// Service token for session reads (and for `call-tool`, the sandbox token).
    #[arg(long, short = 't', global = true)]
    token: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the gateway HTTP server.
    Server(ServerArgs),
    /// Send one tool callback to a running gateway, the way a sandbox would.
    CallTool(CallToolArgs),
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    #[arg(long, short = 'H', default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, short = 'p', default_value_t = DEFAULT_PORT)]
    port: u16,

    /// `memory` or `sqlite:<path>`.
    #[arg(long, default_value = "memory")]
    lease_store: String,

    /// Token sandboxes present on tool callbacks.
    #[arg(long)]
    sandbox_token: Option<String>,

    /// JSON file with `sessions` and `runs` to load at startup.
    #[arg(long)]
    sessions_file: Option<PathBuf>,

    /// Directory holding local sandboxes.
    #[arg(long)]
    sandbox_root: Option<PathBuf>,

    #[arg(long)]
    instance_id: Option<String>,

    /// Dashboard origins allowed to read sessions from a browser.
    #[arg(long = "cors-allow-origin", short = 'O')]
    cors_allow_origin: Vec<String>,
}

#[derive(Args, Debug)]
pub struct CallToolArgs {
    #[arg(long, short = 'e', default_value_t = format!("http://{DEFAULT_HOST}:{DEFAULT_PORT}"))]
    endpoint: String,

    session_id: String,

    tool: String,

    #[arg(long)]
    tool_call_id: String,

    /// Tool arguments as a JSON object.
    #[arg(long, default_value = "{}")]
    args: String,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid cors origin: {0}")]
    InvalidCorsOrigin(String),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("server error: {0}")]
    Server(String),
    #[error("unexpected http status: {0}")]
    HttpStatus(reqwest::StatusCode),
}

pub fn run_session_gateway() -> Result<(), CliError> {
    let cli = SessionGatewayCli::parse();
    init_logging();
    run_command(&cli.command, cli.token)
}

pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
}

fn run_command(command: &Command, token: Option<String>) -> Result<(), CliError> {
    match command {
        Command::Server(args) => run_server(args, token),
        Command::CallTool(args) => call_tool(args, token),
    }
}

fn server_config(args: &ServerArgs) -> Result<GatewayConfig, CliError> {
    let mut config = GatewayConfig::from_env();
    config.lease_store = args.lease_store.parse::<LeaseStoreConfig>()?;
    config.sessions_file = args.sessions_file.clone();
    if let Some(root) = &args.sandbox_root {
        config.sandbox_root = root.clone();
    }
    if let Some(instance_id) = &args.instance_id {
        config.instance_id = instance_id.clone();
    }
    config.validate()?;
    Ok(config)
}

fn run_server(args: &ServerArgs, token: Option<String>) -> Result<(), CliError> {
    let config = server_config(args)?;
    let auth = AuthConfig {
        service_token: token,
        sandbox_token: args.sandbox_token.clone(),
    };
    if !auth.is_enabled() {
        tracing::warn!("no tokens configured, every caller is trusted");
    }
    let cors = build_cors_layer(args)?;
    let addr = format!("{}:{}", args.host, args.port);

    // One event loop per instance; cross-instance exclusion lives in the lease store.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;

    runtime.block_on(async move {
        let collaborators = Collaborators::local(&config)
            .await
            .map_err(|err| CliError::Server(err.to_string()))?;
        let services = GatewayServices::with_builtin_tools(&config, collaborators)
            .map_err(|err| CliError::Server(err.to_string()))?;
        let state = Arc::new(AppState::new(auth, Arc::new(services)));
        let (mut router, state) = build_router_with_state(state);
        if let Some(cors) = cors {
            router = router.layer(cors);
        }

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(
            addr = %addr,
            instance_id = %config.instance_id,
            lease_store = ?config.lease_store,
            "server listening"
        );
        let shutdown_state = state.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = tokio::signal::ctrl_c().await;
                shutdown_services(&shutdown_state).await;
            })
            .await
            .map_err(|err| CliError::Server(err.to_string()))
    })
}

fn build_cors_layer(args: &ServerArgs) -> Result<Option<CorsLayer>, CliError> {
    if args.cors_allow_origin.is_empty() {
        return Ok(None);
    }
    let origins = args
        .cors_allow_origin
        .iter()
        .map(|origin| {
            origin
                .parse::<axum::http::HeaderValue>()
                .map_err(|_| CliError::InvalidCorsOrigin(origin.clone()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
            .allow_headers([
                axum::http::header::AUTHORIZATION,
                axum::http::header::CONTENT_TYPE,
            ]),
    ))
}

fn call_tool(args: &CallToolArgs, token: Option<String>) -> Result<(), CliError> {
    let tool_args: Value = serde_json::from_str(&args.args)?;
    let url = format!(
        "{}/sessions/{}/tools/{}",
        args.endpoint.trim_end_matches('/'),
        args.session_id,
        args.tool
    );
    let mut request = HttpClient::new().post(url).json(&serde_json::json!({
        "tool_call_id": args.tool_call_id,
        "args": tool_args,
    }));
    if let Some(token) = token {
        request = request.bearer_auth(token);
    }

    let response = request.send()?;
    let status = response.status();
    let text = response.text()?;
    if !status.is_success() {
        print_error_body(&text)?;
        return Err(CliError::HttpStatus(status));
    }
    let parsed: Value = serde_json::from_str(&text)?;
    write_stdout_line(&serde_json::to_string_pretty(&parsed)?)?;
    Ok(())
}

fn print_error_body(text: &str) -> Result<(), CliError> {
    if let Ok(json) = serde_json::from_str::<Value>(text) {
        let pretty = serde_json::to_string_pretty(&json)?;
        write_stderr_line(&pretty)?;
    } else {
        write_stderr_line(text)?;
    }
    Ok(())
}

fn write_stdout_line(text: &str) -> Result<(), CliError> {
    let mut out = std::io::stdout();
    out.write_all(text.as_bytes())?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}

fn write_stderr_line(text: &str) -> Result<(), CliError> {
    let mut out = std::io::stderr();
    out.write_all(text.as_bytes())?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}
