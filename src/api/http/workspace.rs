//! Workspace HTTP handlers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use crate::domain::workspace::{is_valid_name, PortMapping, Workspace, WorkspaceRuntime};
use crate::service::workspace::CreateWorkspaceOptions;
use crate::{AppState, Error, Result};

/// Create-or-update request body. Create takes `imageId` and `runtime`;
/// update takes `status` and/or `ports`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertWorkspaceRequest {
    pub image_id: Option<String>,
    pub runtime: Option<String>,
    pub status: Option<String>,
    pub ports: Option<Vec<PortMappingRequest>>,
}

#[derive(Debug, Deserialize)]
pub struct PortMappingRequest {
    pub port: u16,
    pub subdomain: String,
}

#[derive(Debug, Deserialize)]
pub struct DeletePortMappingQuery {
    pub port: u16,
}

/// List all workspaces with live status
pub async fn list_workspaces(State(state): State<AppState>) -> Result<Json<Vec<Workspace>>> {
    let workspaces = state.workspace_service.list().await?;
    Ok(Json(workspaces))
}

/// Create a workspace if the name is free, otherwise apply updates
pub async fn update_or_create_workspace(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<UpsertWorkspaceRequest>,
) -> Result<Json<Workspace>> {
    if !is_valid_name(&name) {
        return Err(Error::WorkspaceNotFound(name));
    }

    if !state.workspace_service.has(&name).await? {
        let image_id = body
            .image_id
            .ok_or_else(|| Error::BadRequest("imageId is required".to_string()))?;
        let runtime = body
            .runtime
            .ok_or_else(|| Error::BadRequest("runtime is required".to_string()))?;

        let workspace = state
            .workspace_service
            .create(CreateWorkspaceOptions {
                name,
                image_id,
                runtime,
            })
            .await?;

        return Ok(Json(workspace));
    }

    let mut workspace = state.workspace_service.find(&name).await?;

    match body.status.as_deref() {
        Some("running") => state.workspace_service.start(&mut workspace).await?,
        Some("stopped") => state.workspace_service.stop(&mut workspace).await?,
        _ => {}
    }

    if let Some(ports) = body.ports {
        let mappings = ports
            .into_iter()
            .map(|p| PortMapping {
                workspace_id: workspace.id,
                container_port: p.port,
                subdomain: p.subdomain,
            })
            .collect();

        state
            .workspace_service
            .add_port_mappings(&mut workspace, mappings)
            .await?;
    }

    Ok(Json(workspace))
}

/// Tear down a workspace's container and rows
pub async fn delete_workspace(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode> {
    if !is_valid_name(&name) {
        return Err(Error::WorkspaceNotFound(name));
    }

    state.workspace_service.delete(&name).await?;
    Ok(StatusCode::OK)
}

/// Remove one forwarded port from a workspace
pub async fn delete_port_mapping(
    State(state): State<AppState>,
    Path((name, subdomain)): Path<(String, String)>,
    Query(query): Query<DeletePortMappingQuery>,
) -> Result<StatusCode> {
    if !is_valid_name(&name) {
        return Err(Error::WorkspaceNotFound(name));
    }

    let workspace = state.workspace_service.find(&name).await?;
    state
        .workspace_service
        .delete_port_mapping(&workspace, &subdomain, query.port)
        .await?;

    Ok(StatusCode::OK)
}

/// The engine's runtime catalog
pub async fn list_runtimes(State(state): State<AppState>) -> Result<Json<Vec<WorkspaceRuntime>>> {
    let runtimes = state.workspace_service.runtimes().await?;
    Ok(Json(runtimes))
}
