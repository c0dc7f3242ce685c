//! Workspace service: lifecycle, port mappings, live status overlay

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use reqwest::Url;
use sqlx::SqlitePool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::workspace::{PortMapping, Workspace, WorkspaceRuntime, WorkspaceStatus};
use crate::error::{Error, Result};
use crate::infra::docker::{self, DockerManager};
use crate::infra::http_proxy::HttpProxy;
use crate::infra::ssh_proxy::SshProxy;
use crate::infra::template_repository::TemplateRepository;
use crate::infra::workspace_repository::WorkspaceRepository;

pub struct CreateWorkspaceOptions {
    pub name: String,
    pub image_id: String,
    pub runtime: String,
}

/// Workspace service keeping the store, engine and both proxies consistent
pub struct WorkspaceService {
    repository: Arc<WorkspaceRepository>,
    templates: Arc<TemplateRepository>,
    docker: Arc<DockerManager>,
    ssh_proxy: Arc<SshProxy>,
    http_proxy: Arc<HttpProxy>,
    pool: SqlitePool,
}

impl WorkspaceService {
    pub fn new(
        repository: Arc<WorkspaceRepository>,
        templates: Arc<TemplateRepository>,
        docker: Arc<DockerManager>,
        ssh_proxy: Arc<SshProxy>,
        http_proxy: Arc<HttpProxy>,
        pool: SqlitePool,
    ) -> Self {
        Self {
            repository,
            templates,
            docker,
            ssh_proxy,
            http_proxy,
            pool,
        }
    }

    pub async fn has(&self, name: &str) -> Result<bool> {
        self.repository.exists(name).await
    }

    pub async fn find(&self, name: &str) -> Result<Workspace> {
        self.repository.find_by_name(name).await
    }

    pub async fn runtimes(&self) -> Result<Vec<WorkspaceRuntime>> {
        self.docker.runtimes().await
    }

    /// Create a workspace: container, SSH forwarder entry, database row.
    ///
    /// Engine-side resources are not rolled back on a late failure; the
    /// startup sync adopts or collects whatever was left behind.
    pub async fn create(&self, opts: CreateWorkspaceOptions) -> Result<Workspace> {
        if !self.docker.has_runtime(&opts.runtime).await? {
            return Err(Error::RuntimeNotFound(opts.runtime));
        }

        let mut tx = self.pool.begin().await?;

        let image = self.templates.find_image_by_id(&opts.image_id).await?;

        let container_id = match self
            .docker
            .create_workspace_container(&opts.name, &image.image_id, &opts.runtime)
            .await
        {
            Err(Error::Engine(e)) if docker::is_conflict(&e) => {
                return Err(Error::WorkspaceExists(docker::daemon_message(&e)));
            }
            other => other?,
        };

        self.docker.start_container(&container_id).await?;

        let inspect = self.docker.inspect_container(&container_id).await?;
        let host_port = docker::ssh_host_port(&inspect)
            .ok_or_else(|| Error::Internal("failed to bind ssh port for container".to_string()))?;

        let external_port = self.ssh_proxy.add_entry(host_port).await?;

        let workspace = Workspace {
            id: Uuid::now_v7(),
            name: opts.name,
            container_id,
            image_tag: image.image_tag,
            created_at: Utc::now(),
            status: WorkspaceStatus::Running,
            ssh_port: Some(external_port),
            port_mappings: Vec::new(),
        };

        self.repository.insert(&mut tx, &workspace).await?;
        tx.commit().await?;

        info!("Workspace {} created", workspace.name);
        Ok(workspace)
    }

    /// Start the workspace's container and refresh its forwarder entry;
    /// the engine may have bound a new SSH host port
    pub async fn start(&self, workspace: &mut Workspace) -> Result<()> {
        self.docker.start_container(&workspace.container_id).await?;

        let inspect = self.docker.inspect_container(&workspace.container_id).await?;
        if let Some(host_port) = docker::ssh_host_port(&inspect) {
            let external_port = self.ssh_proxy.add_entry(host_port).await?;
            workspace.ssh_port = Some(external_port);
        }

        workspace.status = WorkspaceStatus::Running;
        Ok(())
    }

    /// Stop the workspace's container. The forwarder entry goes stale and is
    /// replaced on the next start.
    pub async fn stop(&self, workspace: &mut Workspace) -> Result<()> {
        self.docker.stop_container(&workspace.container_id).await?;
        workspace.status = WorkspaceStatus::Stopped;
        Ok(())
    }

    /// Tear down a workspace: container, row, and router entries
    pub async fn delete(&self, name: &str) -> Result<()> {
        let workspace = self.repository.find_by_name(name).await?;

        let mut tx = self.pool.begin().await?;

        let inspect = self.docker.inspect_container(&workspace.container_id).await?;
        if docker::is_running(&inspect) {
            self.docker.stop_container(&workspace.container_id).await?;
        }
        self.docker.remove_container(&workspace.container_id).await?;

        let deleted = self.repository.delete_by_name(&mut tx, name).await?;
        if deleted == 0 {
            return Err(Error::WorkspaceNotFound(name.to_string()));
        }
        if deleted != 1 {
            return Err(Error::TransactionAborted(format!(
                "unexpected number of workspaces deleted: {}",
                deleted
            )));
        }
        tx.commit().await?;

        for mapping in &workspace.port_mappings {
            self.http_proxy.remove_entry(&mapping.subdomain);
        }

        info!("Workspace {} deleted", name);
        Ok(())
    }

    /// Attach a batch of port mappings, registering each with the router
    pub async fn add_port_mappings(
        &self,
        workspace: &mut Workspace,
        mut mappings: Vec<PortMapping>,
    ) -> Result<()> {
        let inspect = self.docker.inspect_container(&workspace.container_id).await?;
        let container_ip = docker::container_ip(&inspect)
            .ok_or_else(|| Error::Internal("container has no IP address".to_string()))?;

        let mut urls = Vec::with_capacity(mappings.len());
        for mapping in &mappings {
            let url = Url::parse(&format!("http://{}:{}", container_ip, mapping.container_port))
                .map_err(|e| Error::Internal(e.to_string()))?;
            urls.push(url);
        }

        let mut tx = self.pool.begin().await?;

        let mut registered: Vec<String> = Vec::with_capacity(mappings.len());
        let mut conflicts = Vec::new();
        for (mapping, url) in mappings.iter_mut().zip(urls) {
            mapping.workspace_id = workspace.id;
            match self.http_proxy.add_entry(&mapping.subdomain, url) {
                Ok(()) => registered.push(mapping.subdomain.clone()),
                Err(_) => conflicts.push(mapping.subdomain.clone()),
            }
        }

        if !conflicts.is_empty() {
            for subdomain in &registered {
                self.http_proxy.remove_entry(subdomain);
            }
            return Err(Error::PortMappingConflict(conflicts.join(", ")));
        }

        let result: Result<()> = async {
            self.repository.insert_port_mappings(&mut tx, &mappings).await?;
            tx.commit().await?;
            Ok(())
        }
        .await;

        if let Err(e) = result {
            for mapping in &mappings {
                self.http_proxy.remove_entry(&mapping.subdomain);
            }
            return Err(e);
        }

        workspace.port_mappings.extend(mappings);
        Ok(())
    }

    /// Remove one port mapping and its router entry
    pub async fn delete_port_mapping(
        &self,
        workspace: &Workspace,
        subdomain: &str,
        container_port: u16,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        self.repository
            .delete_port_mapping(&mut tx, workspace.id, subdomain, container_port)
            .await?;
        tx.commit().await?;

        self.http_proxy.remove_entry(subdomain);
        Ok(())
    }

    /// All workspaces with live status and SSH port overlaid from the engine
    pub async fn list(&self) -> Result<Vec<Workspace>> {
        let mut workspaces = self.repository.list_with_port_mappings().await?;
        if workspaces.is_empty() {
            return Ok(workspaces);
        }

        let inspections = join_all(
            workspaces
                .iter()
                .map(|w| self.docker.inspect_container(&w.container_id)),
        )
        .await;

        let mut errors = Vec::new();
        for (workspace, inspection) in workspaces.iter_mut().zip(inspections) {
            match inspection {
                Ok(inspect) => {
                    workspace.status =
                        WorkspaceStatus::from_engine_status(&docker::engine_status(&inspect));

                    if let Some(host_port) = docker::ssh_host_port(&inspect) {
                        if let Some(external) = self.ssh_proxy.external_port_for(host_port) {
                            workspace.ssh_port = Some(external);
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        "Failed to inspect container {}: {}",
                        workspace.container_id, e
                    );
                    errors.push(e.to_string());
                }
            }
        }

        if !errors.is_empty() {
            return Err(Error::Internal(errors.join("; ")));
        }

        Ok(workspaces)
    }
}
