use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use tokio::signal;
use tracing::{error, info, warn};

mod api;
mod assembler;
mod compiler;
mod config;
mod credentials;
mod error;
mod execution;
mod observability;
mod pipeline;
mod registry;
mod routing;
mod stages;

use credentials::{CredentialManager, SelfCheck};
use observability::DebugSink;
use pipeline::PipelineManager;
use registry::ModuleRegistry;
use stages::HttpTransport;

/// Exit codes: 0 normal, 2 config error, 3 no runnable pipeline, 4 bind error.
const EXIT_CONFIG: i32 = 2;
const EXIT_ASSEMBLY: i32 = 3;
const EXIT_BIND: i32 = 4;

#[tokio::main]
async fn main() {
    // Initialise tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "llm_relay=info,tower_http=warn".into()),
        )
        .init();

    // Config path: CLI argument, then env var, then the default location.
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| std::env::var("LLM_RELAY_CONFIG").ok().map(PathBuf::from))
        .unwrap_or_else(|| relay_home().join("config.json"));
    let credentials_dir = std::env::var("LLM_RELAY_CREDENTIALS")
        .ok()
        .map(PathBuf::from)
        .unwrap_or_else(|| relay_home().join("credentials"));

    // Compile: config document → routing table → pipeline configs.
    let table = match config::preprocess(&config_path, &credentials_dir) {
        Ok(table) => table,
        Err(e) => {
            error!(path = %config_path.display(), error = %e, "config compilation failed");
            std::process::exit(EXIT_CONFIG);
        }
    };
    info!(
        path = %table.metadata.config_path.display(),
        providers = table.providers.len(),
        routes = table.routes.len(),
        source = %table.metadata.source_format,
        elapsed_ms = table.metadata.processing_time_ms,
        "routing table compiled"
    );

    let credentials = match CredentialManager::from_providers(&credentials_dir, &table.providers) {
        Ok(credentials) => credentials,
        Err(e) => {
            error!(error = %e, "credential loading failed");
            std::process::exit(EXIT_CONFIG);
        }
    };

    let compiled = match compiler::compile(&table) {
        Ok(compiled) => compiled,
        Err(e) => {
            error!(error = %e, "router compilation failed");
            std::process::exit(EXIT_CONFIG);
        }
    };
    for warning in &compiled.warnings {
        warn!("{warning}");
    }

    // Assemble the fleet.
    let registry =
        ModuleRegistry::builtin(Arc::clone(&credentials), Arc::new(HttpTransport::new()));
    info!(modules = registry.len(), "module registry initialised");
    let manager = PipelineManager::new(Arc::new(DebugSink::new(&table.server)));
    let result = assembler::assemble(&compiled.pipelines, &registry, &manager);
    info!(
        total = result.stats.total_pipelines,
        assembled = result.stats.assembled_pipelines,
        failed = result.stats.failed_pipelines,
        elapsed_ms = result.stats.assembly_time_ms,
        "pipeline assembly finished"
    );
    for assembly_error in &result.errors {
        warn!(error = %assembly_error, "pipeline unavailable");
    }
    tracing::debug!(pipelines = ?result.pipeline_ids, "registered pipeline ids");
    if result.stats.assembled_pipelines == 0 {
        error!("no runnable pipelines — nothing to serve");
        std::process::exit(EXIT_ASSEMBLY);
    }

    // Background credential upkeep.
    SelfCheck::new(Arc::clone(&credentials), Arc::clone(&manager)).spawn();

    // Bind and serve.
    let addr: SocketAddr = match format!("{}:{}", table.server.host, table.server.port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(host = %table.server.host, port = table.server.port, error = %e, "invalid listen address");
            std::process::exit(EXIT_BIND);
        }
    };
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(%addr, error = %e, "failed to bind listener");
            std::process::exit(EXIT_BIND);
        }
    };
    info!(%addr, "accepting requests");

    let trace_layer = tower_http::trace::TraceLayer::new_for_http()
        .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO))
        .on_response(tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO));

    let app = api::messages::router(Arc::clone(&manager)).layer(trace_layer);

    tokio::select! {
        result = axum::serve(listener, app) => {
            if let Err(e) = result {
                error!(error = %e, "server error");
            }
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }

    // Stop and deregister the fleet before exit.
    for pipeline_id in manager.pipeline_ids() {
        manager.remove_pipeline(&pipeline_id);
    }
}

fn relay_home() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".llm-relay"))
        .unwrap_or_else(|| PathBuf::from(".llm-relay"))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
