use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use claimflow::config::AppConfig;
use claimflow::server::{create_router, AppState};
use claimflow::shutdown::{graceful_shutdown, wait_for_shutdown};
use claimflow::workflow::RunStatus;

#[derive(Parser)]
#[command(name = "claimflow", about = "Claim verification pipeline with resilient evidence fan-out")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Verify the claims in this JSON file once and print the manifest
    #[arg(long)]
    claims: Option<String>,

    /// Tenant recorded on one-shot runs
    #[arg(long, default_value = "default")]
    tenant: String,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    let config = AppConfig::load(cli.config.as_deref())?;
    let state = Arc::new(AppState::new(config.clone())?);

    if let Some(path) = cli.claims.as_deref() {
        return run_once(&state, path, &cli.tenant).await;
    }

    tracing::info!(
        host = %config.server.host,
        port = %config.server.port,
        backends = config.enabled_backends().count(),
        "Starting claimflow server"
    );

    let app = create_router(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind(format!(
        "{}:{}",
        config.server.host, config.server.port
    ))
    .await?;

    tracing::info!("Listening on {}", listener.local_addr()?);

    // Cancel in-flight runs as soon as the signal arrives so connections can drain
    let shutdown = state.shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            wait_for_shutdown().await;
            shutdown.cancel();
        })
        .await?;

    graceful_shutdown(&state).await;

    Ok(())
}

/// Verify a claims file and print the manifest to stdout.
///
/// The file holds either a bare array of claims or `{"claims": [...]}`.
async fn run_once(state: &Arc<AppState>, path: &str, tenant: &str) -> anyhow::Result<()> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read claims file {path}"))?;
    let parsed: serde_json::Value =
        serde_json::from_str(&raw).with_context(|| format!("Claims file {path} is not JSON"))?;
    let input = match parsed {
        serde_json::Value::Array(claims) => serde_json::json!({ "claims": claims }),
        other => other,
    };

    let shutdown = state.shutdown.clone();
    let signal = tokio::spawn(async move {
        wait_for_shutdown().await;
        shutdown.cancel();
    });

    let manifest = state.run_claims(tenant, input).await?;
    signal.abort();

    println!("{}", serde_json::to_string_pretty(&manifest)?);

    if manifest.status == RunStatus::Failed {
        anyhow::bail!("Run {} failed", manifest.run_id);
    }
    Ok(())
}
