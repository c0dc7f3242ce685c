//! Workspace domain model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Live status of a workspace, as reported by the container engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceStatus {
    Running,
    Stopped,
    Paused,
    Restarting,
    Unknown,
}

impl WorkspaceStatus {
    /// Map an engine status string to a workspace status
    pub fn from_engine_status(s: &str) -> Self {
        match s {
            "running" => WorkspaceStatus::Running,
            "exited" => WorkspaceStatus::Stopped,
            "paused" => WorkspaceStatus::Paused,
            "restarting" => WorkspaceStatus::Restarting,
            _ => WorkspaceStatus::Unknown,
        }
    }
}

/// Workspace entity
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    #[serde(skip)]
    pub id: Uuid,

    pub name: String,

    /// ID of the container backing this workspace
    pub container_id: String,

    pub image_tag: String,

    pub created_at: DateTime<Utc>,

    pub status: WorkspaceStatus,

    /// External port of the SSH forwarder entry, when one is registered
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_port: Option<u16>,

    #[serde(rename = "ports", skip_serializing_if = "Vec::is_empty")]
    pub port_mappings: Vec<PortMapping>,
}

/// One exposed in-container HTTP port, addressed by subdomain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortMapping {
    #[serde(skip)]
    pub workspace_id: Uuid,

    #[serde(rename = "port")]
    pub container_port: u16,

    pub subdomain: String,
}

/// A container runtime reported by the engine
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceRuntime {
    pub name: String,
    pub path: String,
}

/// Whether a name is usable for a workspace or template.
/// Accepted names match `^[A-Za-z0-9_-]+$`.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_names() {
        assert!(is_valid_name("dev-box"));
        assert!(is_valid_name("my_workspace"));
        assert!(is_valid_name("a1"));
    }

    #[test]
    fn invalid_names() {
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("bad name"));
        assert!(!is_valid_name("dot.name"));
        assert!(!is_valid_name("slash/name"));
        assert!(!is_valid_name("ünïcode"));
    }

    #[test]
    fn engine_status_mapping() {
        assert_eq!(
            WorkspaceStatus::from_engine_status("running"),
            WorkspaceStatus::Running
        );
        assert_eq!(
            WorkspaceStatus::from_engine_status("exited"),
            WorkspaceStatus::Stopped
        );
        assert_eq!(
            WorkspaceStatus::from_engine_status("paused"),
            WorkspaceStatus::Paused
        );
        assert_eq!(
            WorkspaceStatus::from_engine_status("restarting"),
            WorkspaceStatus::Restarting
        );
        assert_eq!(
            WorkspaceStatus::from_engine_status("dead"),
            WorkspaceStatus::Unknown
        );
    }

    #[test]
    fn workspace_serializes_wire_names() {
        let w = Workspace {
            id: Uuid::now_v7(),
            name: "dev".into(),
            container_id: "abc123".into(),
            image_tag: "tesseract/dev:1".into(),
            created_at: Utc::now(),
            status: WorkspaceStatus::Running,
            ssh_port: Some(32801),
            port_mappings: vec![PortMapping {
                workspace_id: Uuid::now_v7(),
                container_port: 8080,
                subdomain: "web".into(),
            }],
        };

        let json = serde_json::to_value(&w).expect("Failed to serialize");
        assert_eq!(json["containerId"], "abc123");
        assert_eq!(json["imageTag"], "tesseract/dev:1");
        assert_eq!(json["sshPort"], 32801);
        assert_eq!(json["ports"][0]["port"], 8080);
        assert_eq!(json["ports"][0]["subdomain"], "web");
        assert!(json.get("id").is_none());
    }

    #[test]
    fn workspace_omits_empty_optionals() {
        let w = Workspace {
            id: Uuid::now_v7(),
            name: "dev".into(),
            container_id: "abc123".into(),
            image_tag: "t:1".into(),
            created_at: Utc::now(),
            status: WorkspaceStatus::Stopped,
            ssh_port: None,
            port_mappings: Vec::new(),
        };

        let json = serde_json::to_value(&w).expect("Failed to serialize");
        assert!(json.get("sshPort").is_none());
        assert!(json.get("ports").is_none());
    }
}
