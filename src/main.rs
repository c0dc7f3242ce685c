//! Tesseract workspace server
//!
//! A self-hosted control plane that turns container images into long-lived,
//! addressable developer workspaces: container lifecycle, an SSH TCP
//! forwarder, subdomain HTTP forwarding, and a Dockerfile template build
//! pipeline.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use tokio::signal;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;
mod domain;
mod error;
mod infra;
mod service;

pub use config::Config;
pub use error::{Error, Result};

use infra::docker::DockerManager;
use infra::http_proxy::HttpProxy;
use infra::ssh_proxy::SshProxy;
use infra::template_repository::TemplateRepository;
use infra::workspace_repository::WorkspaceRepository;
use service::template::TemplateService;
use service::workspace::WorkspaceService;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub workspace_service: Arc<WorkspaceService>,
    pub template_service: Arc<TemplateService>,
    pub http_proxy: Arc<HttpProxy>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.json".to_string());
    let config = Config::load(Path::new(&config_path))?;

    let default_level = if config.debug {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .init();

    info!("Starting Tesseract");

    std::fs::create_dir_all(&config.template_directory_path)?;
    std::fs::create_dir_all(&config.host_key_directory_path)?;

    // Initialize infrastructure
    let pool = infra::sqlite::init(&config.database_path).await?;
    let workspace_repository = Arc::new(WorkspaceRepository::new(pool.clone()));
    let template_repository = Arc::new(TemplateRepository::new(pool.clone()));
    let docker = Arc::new(DockerManager::new(None)?);
    let ssh_proxy = Arc::new(SshProxy::new());
    let http_proxy = Arc::new(HttpProxy::new(
        config.host_name.clone(),
        reqwest::Client::new(),
    ));

    // Reconcile persisted workspaces against live engine state before
    // serving any requests
    info!("Syncing all workspaces...");
    service::sync::sync_all(
        &pool,
        &workspace_repository,
        &docker,
        &ssh_proxy,
        &http_proxy,
    )
    .await?;

    // Initialize services
    let workspace_service = Arc::new(WorkspaceService::new(
        workspace_repository,
        template_repository.clone(),
        docker.clone(),
        ssh_proxy,
        http_proxy.clone(),
        pool.clone(),
    ));
    let template_service = Arc::new(TemplateService::new(template_repository, docker, pool));

    let state = AppState {
        workspace_service,
        template_service,
        http_proxy,
    };

    let app = api::http::create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("HTTP listening on {}", addr);

    axum::serve(
        tokio::net::TcpListener::bind(addr).await?,
        app.into_make_service(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received shutdown signal");
}
