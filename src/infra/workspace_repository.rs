//! Workspace and port-mapping persistence

use chrono::{DateTime, Utc};
use sqlx::{FromRow, Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use crate::domain::workspace::{PortMapping, Workspace, WorkspaceStatus};
use crate::error::{Error, Result};

#[derive(Debug, FromRow)]
struct WorkspaceRow {
    id: String,
    name: String,
    container_id: String,
    image_tag: String,
    created_at: String,
}

impl TryFrom<WorkspaceRow> for Workspace {
    type Error = Error;

    fn try_from(row: WorkspaceRow) -> Result<Self> {
        let id = Uuid::parse_str(&row.id)
            .map_err(|e| Error::Internal(format!("Failed to parse workspace id: {}", e)))?;

        let created_at = DateTime::parse_from_rfc3339(&row.created_at)
            .map_err(|e| Error::Internal(format!("Failed to parse created_at: {}", e)))?
            .with_timezone(&Utc);

        Ok(Workspace {
            id,
            name: row.name,
            container_id: row.container_id,
            image_tag: row.image_tag,
            created_at,
            status: WorkspaceStatus::Unknown,
            ssh_port: None,
            port_mappings: Vec::new(),
        })
    }
}

#[derive(Debug, FromRow)]
struct PortMappingRow {
    workspace_id: String,
    container_port: i64,
    subdomain: String,
}

impl TryFrom<PortMappingRow> for PortMapping {
    type Error = Error;

    fn try_from(row: PortMappingRow) -> Result<Self> {
        let workspace_id = Uuid::parse_str(&row.workspace_id)
            .map_err(|e| Error::Internal(format!("Failed to parse workspace id: {}", e)))?;

        let container_port = u16::try_from(row.container_port)
            .map_err(|_| Error::Internal(format!("Invalid container port: {}", row.container_port)))?;

        Ok(PortMapping {
            workspace_id,
            container_port,
            subdomain: row.subdomain,
        })
    }
}

/// Workspace repository for database operations
pub struct WorkspaceRepository {
    pool: SqlitePool,
}

impl WorkspaceRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Load every workspace with its port mappings attached
    pub async fn list_with_port_mappings(&self) -> Result<Vec<Workspace>> {
        let rows: Vec<WorkspaceRow> = sqlx::query_as(
            r#"
            SELECT id, name, container_id, image_tag, created_at
            FROM workspaces
            ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut workspaces: Vec<Workspace> = rows
            .into_iter()
            .map(Workspace::try_from)
            .collect::<Result<_>>()?;

        let mapping_rows: Vec<PortMappingRow> = sqlx::query_as(
            r#"
            SELECT workspace_id, container_port, subdomain
            FROM port_mappings
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        for row in mapping_rows {
            let mapping = PortMapping::try_from(row)?;
            if let Some(w) = workspaces.iter_mut().find(|w| w.id == mapping.workspace_id) {
                w.port_mappings.push(mapping);
            }
        }

        Ok(workspaces)
    }

    /// Find a workspace by name, port mappings attached
    pub async fn find_by_name(&self, name: &str) -> Result<Workspace> {
        let row: WorkspaceRow = sqlx::query_as(
            r#"
            SELECT id, name, container_id, image_tag, created_at
            FROM workspaces
            WHERE name = ?
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::WorkspaceNotFound(name.to_string()))?;

        let mut workspace = Workspace::try_from(row)?;

        let mapping_rows: Vec<PortMappingRow> = sqlx::query_as(
            r#"
            SELECT workspace_id, container_port, subdomain
            FROM port_mappings
            WHERE workspace_id = ?
            "#,
        )
        .bind(workspace.id.to_string())
        .fetch_all(&self.pool)
        .await?;

        workspace.port_mappings = mapping_rows
            .into_iter()
            .map(PortMapping::try_from)
            .collect::<Result<_>>()?;

        Ok(workspace)
    }

    /// Whether a workspace with this name exists
    pub async fn exists(&self, name: &str) -> Result<bool> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM workspaces WHERE name = ?")
                .bind(name)
                .fetch_one(&self.pool)
                .await?;

        Ok(count > 0)
    }

    /// Insert a workspace row
    pub async fn insert(
        &self,
        tx: &mut Transaction<'static, Sqlite>,
        workspace: &Workspace,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workspaces (id, name, container_id, image_tag, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(workspace.id.to_string())
        .bind(&workspace.name)
        .bind(&workspace.container_id)
        .bind(&workspace.image_tag)
        .bind(workspace.created_at.to_rfc3339())
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Delete a workspace row by name; returns the number of rows removed
    pub async fn delete_by_name(
        &self,
        tx: &mut Transaction<'static, Sqlite>,
        name: &str,
    ) -> Result<u64> {
        let result = sqlx::query("DELETE FROM workspaces WHERE name = ?")
            .bind(name)
            .execute(&mut **tx)
            .await?;

        Ok(result.rows_affected())
    }

    /// Delete a batch of workspaces by id
    pub async fn delete_by_ids(
        &self,
        tx: &mut Transaction<'static, Sqlite>,
        ids: &[Uuid],
    ) -> Result<u64> {
        let mut deleted = 0;
        for id in ids {
            let result = sqlx::query("DELETE FROM workspaces WHERE id = ?")
                .bind(id.to_string())
                .execute(&mut **tx)
                .await?;
            deleted += result.rows_affected();
        }
        Ok(deleted)
    }

    /// Ids and container ids of every persisted workspace
    pub async fn list_ids_and_containers(&self) -> Result<Vec<(Uuid, String)>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT id, container_id FROM workspaces")
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter()
            .map(|(id, container_id)| {
                let id = Uuid::parse_str(&id)
                    .map_err(|e| Error::Internal(format!("Failed to parse workspace id: {}", e)))?;
                Ok((id, container_id))
            })
            .collect()
    }

    /// Insert a batch of port mappings
    pub async fn insert_port_mappings(
        &self,
        tx: &mut Transaction<'static, Sqlite>,
        mappings: &[PortMapping],
    ) -> Result<()> {
        for mapping in mappings {
            sqlx::query(
                r#"
                INSERT INTO port_mappings (workspace_id, container_port, subdomain)
                VALUES (?, ?, ?)
                "#,
            )
            .bind(mapping.workspace_id.to_string())
            .bind(i64::from(mapping.container_port))
            .bind(&mapping.subdomain)
            .execute(&mut **tx)
            .await?;
        }

        Ok(())
    }

    /// Delete one port mapping by its full key; returns rows removed
    pub async fn delete_port_mapping(
        &self,
        tx: &mut Transaction<'static, Sqlite>,
        workspace_id: Uuid,
        subdomain: &str,
        container_port: u16,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM port_mappings
            WHERE workspace_id = ? AND subdomain = ? AND container_port = ?
            "#,
        )
        .bind(workspace_id.to_string())
        .bind(subdomain)
        .bind(i64::from(container_port))
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected())
    }

    /// Every port mapping joined with its workspace's container id
    pub async fn list_port_mappings_with_containers(&self) -> Result<Vec<(PortMapping, String)>> {
        let rows: Vec<(String, i64, String, String)> = sqlx::query_as(
            r#"
            SELECT m.workspace_id, m.container_port, m.subdomain, w.container_id
            FROM port_mappings m
            JOIN workspaces w ON w.id = m.workspace_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(workspace_id, container_port, subdomain, container_id)| {
                let mapping = PortMapping::try_from(PortMappingRow {
                    workspace_id,
                    container_port,
                    subdomain,
                })?;
                Ok((mapping, container_id))
            })
            .collect()
    }
}
