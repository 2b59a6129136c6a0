//! # Gemini Server
//!
//! Serves a greeting capsule over the Gemini protocol.
//!
//! ## Features
//! - TLS with the `gemini` protocol id via `tokio-rustls`
//! - Transient client certificates surfaced as fingerprints
//! - Optional per-IP connection rate limiting and connection cap
//! - Health metrics over HTTP
//! - Environment-based configuration loading

use gemini_server::{
    config::ServerConfig,
    server::{health, Request, Response, Server, ServerStream},
    server::response::ResponseError,
};
use tokio::signal;
use tracing::{error, info};

/// Entry point for the Gemini server.
///
/// Initializes logging, loads configuration from the environment,
/// and serves until Ctrl+C.
///
/// # Errors
/// Returns an error if configuration validation fails or if the server fails to bind.
#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let _ = dotenv::dotenv();
    tracing_subscriber::fmt::init();

    let config = ServerConfig::from_env()?;
    let metrics_port = config.metrics_port;

    let server = Server::new(config, greet)?;
    let listener = server.bind().await?;
    info!("Server listening on {}", server.config().listen_address());

    if let Some(port) = metrics_port {
        let metrics = server.metrics().clone();
        tokio::spawn(async move {
            if let Err(e) = health::serve_metrics_http(metrics, port).await {
                error!("Metrics endpoint stopped: {}", e);
            }
        });
    }

    server.serve_with_shutdown(listener, shutdown_signal()).await?;
    info!("Shutting down gracefully");
    Ok(())
}

/// Answers every request with a page echoing its path and the client's identity.
async fn greet(request: Request, response: Response<ServerStream>) -> Result<(), ResponseError> {
    let identity = match request.client_fingerprint() {
        Some(fingerprint) => format!("Your certificate fingerprint is {}.", fingerprint),
        None => "You did not present a client certificate.".to_owned(),
    };
    let body = format!(
        "# Hello, Gemini\n\nYou requested {}\n\n{}\n",
        request.path(),
        identity
    );
    response.send("text/gemini; charset=utf-8", body.as_bytes()).await
}

/// Resolves on Ctrl+C. If the signal handler cannot be installed the server runs until killed.
async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
