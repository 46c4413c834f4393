use crate::messages::types::ProtocolVersion;
use crate::network::client::Endpoint;
use crate::network::manager::ConnectionConfig;
use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Host of the collector or agent to connect to
    pub host: String,
    pub port: u16,
    pub tls: bool,
    /// Certificate name to verify when it differs from `host`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_server_name: Option<String>,
    pub protocol_major: i32,
    pub protocol_minor: i32,
    pub auto_reconnect: bool,
    pub connect_timeout_secs: u64,
    /// Repository that live view requests are scoped to
    pub repository_id: Uuid,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4500,
            tls: false,
            tls_server_name: None,
            protocol_major: ProtocolVersion::CURRENT.major,
            protocol_minor: ProtocolVersion::CURRENT.minor,
            auto_reconnect: true,
            connect_timeout_secs: 10,
            repository_id: Uuid::nil(),
        }
    }
}

impl Config {
    /// Get the default config directory
    pub fn default_config_dir() -> Result<PathBuf> {
        ProjectDirs::from("dev", "sessionlink", "sessionlink")
            .map(|proj_dirs| proj_dirs.config_dir().to_path_buf())
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))
    }

    /// Get the default config file path
    pub fn default_config_file() -> Result<PathBuf> {
        Ok(Self::default_config_dir()?.join("config.toml"))
    }

    /// Load from `path` when given, otherwise from the default location
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from(path),
            None => Self::load_or_create_default(),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse configuration file: {}", path.display()))?;
        Ok(config)
    }

    /// Load configuration from file, creating default if it doesn't exist
    pub fn load_or_create_default() -> Result<Self> {
        let config_file = Self::default_config_file()?;

        if config_file.exists() {
            Self::load_from(&config_file)
        } else {
            let config = Config::default();
            config.save_to(&config_file)?;
            Ok(config)
        }
    }

    /// Save configuration to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        // Ensure config directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        std::fs::write(path, content).context("Failed to write configuration file")?;

        Ok(())
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        ProtocolVersion::new(self.protocol_major, self.protocol_minor)
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port).with_tls(self.tls)
    }

    pub fn to_connection_config(&self) -> Result<ConnectionConfig> {
        if self.host.trim().is_empty() {
            anyhow::bail!("Configured host must not be empty");
        }
        if self.protocol_major < 1 {
            anyhow::bail!("Unsupported protocol version {}", self.protocol_version());
        }

        let mut config = ConnectionConfig::new(self.endpoint())
            .with_protocol_version(self.protocol_version())
            .with_auto_reconnect(self.auto_reconnect)
            .with_connect_timeout(Duration::from_secs(self.connect_timeout_secs.max(1)));
        if let Some(server_name) = &self.tls_server_name {
            config = config.with_tls_server_name(server_name.clone());
        }
        Ok(config)
    }
}
