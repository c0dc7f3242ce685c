//! Container engine adapter

use std::collections::HashMap;

use bollard::{
    container::{
        Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions,
        StopContainerOptions,
    },
    image::BuildImageOptions,
    models::{BuildInfo, ContainerInspectResponse, HostConfig, PortBinding},
    Docker,
};
use bytes::Bytes;
use futures::Stream;
use tracing::info;

use crate::domain::workspace::WorkspaceRuntime;
use crate::error::{Error, Result};

/// The in-container SSH port every workspace image is expected to expose
pub const SSH_PORT: &str = "22/tcp";

const DAEMON_ERROR_PREFIX: &str = "Error response from daemon: ";

/// Thin facade over the engine client
pub struct DockerManager {
    client: Docker,
}

impl DockerManager {
    /// Connect to the local engine socket
    pub fn new(socket_path: Option<&str>) -> Result<Self> {
        let client = match socket_path {
            Some(path) => Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION)?,
            None => Docker::connect_with_local_defaults()?,
        };

        Ok(Self { client })
    }

    /// Create a workspace container: tty, SSH exposed, bound to an ephemeral
    /// loopback host port, running under the given runtime
    pub async fn create_workspace_container(
        &self,
        name: &str,
        image_id: &str,
        runtime: &str,
    ) -> Result<String> {
        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(SSH_PORT.to_string(), HashMap::new());

        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            SSH_PORT.to_string(),
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                host_port: Some(String::new()),
            }]),
        );

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            runtime: Some(runtime.to_string()),
            ..Default::default()
        };

        let config = Config {
            tty: Some(true),
            image: Some(image_id.to_string()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        };

        let response = self.client.create_container(Some(options), config).await?;

        info!("Container {} created with ID: {}", name, response.id);
        Ok(response.id)
    }

    /// Start a container
    pub async fn start_container(&self, id: &str) -> Result<()> {
        self.client
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;

        info!("Container {} started", id);
        Ok(())
    }

    /// Stop a container
    pub async fn stop_container(&self, id: &str) -> Result<()> {
        self.client
            .stop_container(id, Some(StopContainerOptions { t: 10 }))
            .await?;

        info!("Container {} stopped", id);
        Ok(())
    }

    /// Remove a container along with its anonymous volumes
    pub async fn remove_container(&self, id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            v: true,
            ..Default::default()
        };

        self.client.remove_container(id, Some(options)).await?;

        info!("Container {} removed", id);
        Ok(())
    }

    /// Inspect a container
    pub async fn inspect_container(&self, id: &str) -> Result<ContainerInspectResponse> {
        Ok(self.client.inspect_container(id, None).await?)
    }

    /// List the runtimes the engine can place containers on
    pub async fn runtimes(&self) -> Result<Vec<WorkspaceRuntime>> {
        let info = self.client.info().await?;

        let runtimes = info
            .runtimes
            .unwrap_or_default()
            .into_iter()
            .map(|(name, runtime)| WorkspaceRuntime {
                name,
                path: runtime.path.unwrap_or_default(),
            })
            .collect();

        Ok(runtimes)
    }

    /// Whether the engine knows the given runtime
    pub async fn has_runtime(&self, runtime: &str) -> Result<bool> {
        let info = self.client.info().await?;
        Ok(info
            .runtimes
            .map(|r| r.contains_key(runtime))
            .unwrap_or(false))
    }

    /// Start a build from an in-memory tar context, returning the engine's
    /// progress stream
    pub fn build_image(
        &self,
        tar: Bytes,
        image_tag: &str,
        build_args: HashMap<String, String>,
    ) -> impl Stream<Item = std::result::Result<BuildInfo, bollard::errors::Error>> + use<'_> {
        let options = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: image_tag.to_string(),
            buildargs: build_args,
            ..Default::default()
        };

        self.client.build_image(options, None, Some(tar.into()))
    }
}

/// First host-side port bound to the container's SSH port, if any
pub fn ssh_host_port(inspect: &ContainerInspectResponse) -> Option<u16> {
    host_port_for(inspect, SSH_PORT)
}

/// First host-side port bound to the given container port spec
pub fn host_port_for(inspect: &ContainerInspectResponse, port: &str) -> Option<u16> {
    inspect
        .network_settings
        .as_ref()?
        .ports
        .as_ref()?
        .get(port)?
        .as_ref()?
        .first()?
        .host_port
        .as_ref()?
        .parse()
        .ok()
}

/// The container's primary IP address
pub fn container_ip(inspect: &ContainerInspectResponse) -> Option<String> {
    inspect
        .network_settings
        .as_ref()?
        .ip_address
        .clone()
        .filter(|ip| !ip.is_empty())
}

/// Whether the container is currently running
pub fn is_running(inspect: &ContainerInspectResponse) -> bool {
    inspect
        .state
        .as_ref()
        .and_then(|s| s.running)
        .unwrap_or(false)
}

/// Engine status string, e.g. "running" or "exited"
pub fn engine_status(inspect: &ContainerInspectResponse) -> String {
    inspect
        .state
        .as_ref()
        .and_then(|s| s.status)
        .map(|s| s.to_string())
        .unwrap_or_default()
}

/// Strip the engine's standard error prefix from a daemon message
pub fn clean_error_message(message: &str) -> &str {
    message.strip_prefix(DAEMON_ERROR_PREFIX).unwrap_or(message)
}

/// The daemon's own message for a server-reported error, cleaned of its
/// standard prefix; other errors render through Display
pub fn daemon_message(err: &bollard::errors::Error) -> String {
    match err {
        bollard::errors::Error::DockerResponseServerError { message, .. } => {
            clean_error_message(message).to_string()
        }
        other => other.to_string(),
    }
}

fn response_status(err: &bollard::errors::Error) -> Option<u16> {
    match err {
        bollard::errors::Error::DockerResponseServerError { status_code, .. } => {
            Some(*status_code)
        }
        _ => None,
    }
}

/// The engine reported the referenced object does not exist
pub fn is_not_found(err: &bollard::errors::Error) -> bool {
    response_status(err) == Some(404)
}

/// The engine reported a conflict, e.g. a container name already in use
pub fn is_conflict(err: &bollard::errors::Error) -> bool {
    response_status(err) == Some(409)
}

/// The engine rejected the request as malformed, e.g. an unparseable Dockerfile
pub fn is_invalid_parameter(err: &bollard::errors::Error) -> bool {
    response_status(err) == Some(400)
}

/// Same classification, reaching through the crate error wrapper
pub fn error_is_not_found(err: &Error) -> bool {
    matches!(err, Error::Engine(e) if is_not_found(e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::{ContainerState, ContainerStateStatusEnum, NetworkSettings};

    fn inspect_with_ports(
        ports: HashMap<String, Option<Vec<PortBinding>>>,
    ) -> ContainerInspectResponse {
        ContainerInspectResponse {
            network_settings: Some(NetworkSettings {
                ports: Some(ports),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn ssh_host_port_reads_first_binding() {
        let mut ports = HashMap::new();
        ports.insert(
            SSH_PORT.to_string(),
            Some(vec![
                PortBinding {
                    host_ip: Some("127.0.0.1".into()),
                    host_port: Some("32801".into()),
                },
                PortBinding {
                    host_ip: Some("::1".into()),
                    host_port: Some("32802".into()),
                },
            ]),
        );

        assert_eq!(ssh_host_port(&inspect_with_ports(ports)), Some(32801));
    }

    #[test]
    fn ssh_host_port_missing_binding_is_none() {
        assert_eq!(ssh_host_port(&inspect_with_ports(HashMap::new())), None);

        let mut ports = HashMap::new();
        ports.insert(SSH_PORT.to_string(), Some(Vec::new()));
        assert_eq!(ssh_host_port(&inspect_with_ports(ports)), None);
    }

    #[test]
    fn ssh_host_port_unparseable_is_none() {
        let mut ports = HashMap::new();
        ports.insert(
            SSH_PORT.to_string(),
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".into()),
                host_port: Some("not-a-port".into()),
            }]),
        );

        assert_eq!(ssh_host_port(&inspect_with_ports(ports)), None);
    }

    #[test]
    fn clean_error_message_strips_daemon_prefix() {
        assert_eq!(
            clean_error_message(
                "Error response from daemon: dockerfile parse error on line 1: unknown instruction: FR"
            ),
            "dockerfile parse error on line 1: unknown instruction: FR"
        );
        assert_eq!(clean_error_message("plain message"), "plain message");
    }

    #[test]
    fn daemon_message_reaches_the_server_message() {
        let err = bollard::errors::Error::DockerResponseServerError {
            status_code: 400,
            message: "Error response from daemon: dockerfile parse error on line 1".into(),
        };
        assert_eq!(daemon_message(&err), "dockerfile parse error on line 1");
    }

    #[test]
    fn error_classification_by_status() {
        let not_found = bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "No such container".into(),
        };
        let conflict = bollard::errors::Error::DockerResponseServerError {
            status_code: 409,
            message: "name already in use".into(),
        };
        let invalid = bollard::errors::Error::DockerResponseServerError {
            status_code: 400,
            message: "dockerfile parse error".into(),
        };

        assert!(is_not_found(&not_found));
        assert!(!is_conflict(&not_found));
        assert!(is_conflict(&conflict));
        assert!(is_invalid_parameter(&invalid));
        assert!(!is_not_found(&invalid));
    }

    #[test]
    fn running_flag_and_status() {
        let inspect = ContainerInspectResponse {
            state: Some(ContainerState {
                status: Some(ContainerStateStatusEnum::RUNNING),
                running: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        };

        assert!(is_running(&inspect));
        assert_eq!(engine_status(&inspect), "running");
        assert!(!is_running(&ContainerInspectResponse::default()));
    }
}
