//! Startup reconciliation
//!
//! Runs once before the HTTP server starts serving: adopts the containers the
//! database knows about, deletes rows whose containers are gone, and rebuilds
//! the SSH forwarder and HTTP router state. This is the only place a missing
//! container is treated as proof of deletion.

use std::sync::Arc;

use futures::future::join_all;
use reqwest::Url;
use sqlx::SqlitePool;
use tracing::info;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::infra::docker::{self, DockerManager};
use crate::infra::http_proxy::HttpProxy;
use crate::infra::ssh_proxy::SshProxy;
use crate::infra::workspace_repository::WorkspaceRepository;

enum Outcome {
    Synced,
    Missing(Uuid),
}

/// Bring the forwarder, router and store into agreement with the engine.
///
/// Fail-stop: any engine error other than a missing container aborts startup.
pub async fn sync_all(
    pool: &SqlitePool,
    repository: &Arc<WorkspaceRepository>,
    docker: &Arc<DockerManager>,
    ssh_proxy: &Arc<SshProxy>,
    http_proxy: &Arc<HttpProxy>,
) -> Result<()> {
    let workspaces = repository.list_ids_and_containers().await?;

    let results = join_all(workspaces.into_iter().map(|(id, container_id)| {
        let docker = docker.clone();
        let ssh_proxy = ssh_proxy.clone();
        async move {
            match docker.start_container(&container_id).await {
                Err(e) if docker::error_is_not_found(&e) => Ok(Outcome::Missing(id)),
                Err(e) => Err(e),
                Ok(()) => {
                    let inspect = docker.inspect_container(&container_id).await?;
                    if let Some(host_port) = docker::ssh_host_port(&inspect) {
                        ssh_proxy.add_entry(host_port).await?;
                    }
                    Ok(Outcome::Synced)
                }
            }
        }
    }))
    .await;

    let mut missing = Vec::new();
    let mut errors = Vec::new();
    for result in results {
        match result {
            Ok(Outcome::Missing(id)) => missing.push(id),
            Ok(Outcome::Synced) => {}
            Err(e) => errors.push(e.to_string()),
        }
    }

    if !errors.is_empty() {
        return Err(Error::Internal(errors.join("; ")));
    }

    if !missing.is_empty() {
        let mut tx = pool.begin().await?;
        repository.delete_by_ids(&mut tx, &missing).await?;
        tx.commit().await?;
        info!(
            "Removed {} workspaces whose containers no longer exist",
            missing.len()
        );
    }

    initialize_http_proxies(repository, docker, http_proxy).await
}

/// Re-register every persisted port mapping with the router
async fn initialize_http_proxies(
    repository: &Arc<WorkspaceRepository>,
    docker: &Arc<DockerManager>,
    http_proxy: &Arc<HttpProxy>,
) -> Result<()> {
    let mappings = repository.list_port_mappings_with_containers().await?;

    let results = join_all(mappings.into_iter().map(|(mapping, container_id)| {
        let docker = docker.clone();
        let http_proxy = http_proxy.clone();
        async move {
            let inspect = docker.inspect_container(&container_id).await?;
            let ip = docker::container_ip(&inspect).ok_or_else(|| {
                Error::Internal(format!("container {} has no IP address", container_id))
            })?;

            let url = Url::parse(&format!("http://{}:{}", ip, mapping.container_port))
                .map_err(|e| Error::Internal(e.to_string()))?;

            http_proxy.add_entry(&mapping.subdomain, url)
        }
    }))
    .await;

    let errors: Vec<String> = results
        .into_iter()
        .filter_map(|r| r.err())
        .map(|e| e.to_string())
        .collect();

    if !errors.is_empty() {
        return Err(Error::Internal(errors.join("; ")));
    }

    Ok(())
}
