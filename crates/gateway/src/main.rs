use std::sync::Arc;

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use clap::{Parser, Subcommand};
use chrono::Utc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use courier_domain::config::Config;
use courier_gateway::api;
use courier_gateway::bootstrap::{build_app_state, spawn_background};

/// Courier — multi-tenant report scheduling and delivery platform.
#[derive(Debug, Parser)]
#[command(name = "courier", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the API server with the scheduler loop and an in-process
    /// worker (default when no subcommand is given).
    Serve,
    /// Consume report tasks without serving HTTP or scanning schedules.
    Worker,
    /// Run one artifact retention sweep and print the report.
    Sweep {
        /// Retention horizon in days (defaults to RETENTION_DAYS).
        #[arg(long)]
        retention_days: Option<i64>,
        /// Report what would be deleted without mutating anything.
        #[arg(long)]
        dry_run: bool,
    },
    /// Print version information.
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Arc::new(Config::from_env());

    match cli.command {
        None | Some(Command::Serve) => {
            init_tracing(&config.log_level);
            run_server(config).await
        }
        Some(Command::Worker) => {
            init_tracing(&config.log_level);
            run_worker(config).await
        }
        Some(Command::Sweep {
            retention_days,
            dry_run,
        }) => {
            init_tracing(&config.log_level);
            let state = build_app_state(config.clone()).await?;
            let days = retention_days.unwrap_or(config.retention_days);
            let report = state.sweeper.sweep(days, dry_run, Utc::now()).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Some(Command::Version) => {
            println!("courier {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Structured JSON tracing, filterable via RUST_LOG.
fn init_tracing(log_level: &str) {
    let default = format!("{log_level},courier_gateway=debug");
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .json()
        .init();
}

async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!(environment = %config.environment, "Courier starting");
    let state = build_app_state(config.clone()).await?;

    let _background = spawn_background(&state, config.enable_scheduler, true);
    if !config.enable_scheduler {
        tracing::info!("scheduler loop disabled (ENABLE_SCHEDULER=false)");
    }

    let app = api::router()
        .with_state(state)
        .layer(cors_layer(&config))
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, "listening");
    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}

async fn run_worker(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!(environment = %config.environment, "Courier worker starting");
    let state = build_app_state(config).await?;
    let handles = spawn_background(&state, false, true);
    for handle in handles {
        let _ = handle.await;
    }
    Ok(())
}

fn cors_layer(config: &Config) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "ignoring unparsable CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
        ])
        .allow_headers(Any)
}
