fn main() {
    if let Err(err) = session_gateway::cli::run_session_gateway() {
        tracing::error!(error = %err, "session-gateway failed");
        std::process::exit(1);
    }
}
