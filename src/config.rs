//! Server configuration

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Server configuration, loaded from a JSON file
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// HTTP server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Path to the SQLite database file
    pub database_path: PathBuf,

    /// Directory for template working files
    pub template_directory_path: PathBuf,

    /// Directory for SSH host keys
    pub host_key_directory_path: PathBuf,

    /// Parent domain for subdomain-based port forwarding
    pub host_name: String,

    /// Enable debug logging
    #[serde(default)]
    pub debug: bool,
}

fn default_port() -> u16 {
    8080
}

impl Config {
    /// Load configuration from a JSON file, resolving all paths to absolute
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = serde_json::from_str(&contents)?;

        config.database_path = std::path::absolute(&config.database_path)?;
        config.template_directory_path = std::path::absolute(&config.template_directory_path)?;
        config.host_key_directory_path = std::path::absolute(&config.host_key_directory_path)?;

        Ok(config)
    }
}
