use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::info;

pub const APP_NAME: &str = "reclip-server";
pub const DEFAULT_PORT: u16 = 41286;
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Server configuration, read from `config.toml` in the app data directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Overridden by `--port` on the command line.
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_task_queue_capacity")]
    pub task_queue_capacity: usize,
    #[serde(default = "default_write_queue_capacity")]
    pub write_queue_capacity: usize,
    #[serde(default = "default_max_pending_handshakes")]
    pub max_pending_handshakes: usize,
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub clients: Vec<ClientConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub secret: String,
    pub public_id: u64,
    pub name: String,
}

fn default_task_queue_capacity() -> usize {
    crate::group::task_queue::DEFAULT_CAPACITY
}

fn default_write_queue_capacity() -> usize {
    crate::net::connection::WRITE_QUEUE_SIZE
}

fn default_max_pending_handshakes() -> usize {
    64
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: None,
            task_queue_capacity: default_task_queue_capacity(),
            write_queue_capacity: default_write_queue_capacity(),
            max_pending_handshakes: default_max_pending_handshakes(),
            groups: Vec::new(),
        }
    }
}

impl Config {
    pub fn load(app_data_dir: &Path) -> Result<Self> {
        let path = app_data_dir.join(CONFIG_FILE_NAME);
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        Self::from_toml(&contents)
            .with_context(|| format!("Invalid config in {}", path.display()))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.task_queue_capacity == 0 {
            bail!("task_queue_capacity must be positive");
        }
        if self.write_queue_capacity == 0 {
            bail!("write_queue_capacity must be positive");
        }
        if self.max_pending_handshakes == 0 {
            bail!("max_pending_handshakes must be positive");
        }

        let mut secrets = HashSet::new();
        for (index, group) in self.groups.iter().enumerate() {
            let group_name = group.display_name(index);
            let mut ids = HashSet::new();
            for client in &group.clients {
                if client.secret.is_empty() {
                    bail!("Client {} in {} has an empty secret", client.public_id, group_name);
                }
                if !secrets.insert(client.secret.as_str()) {
                    bail!(
                        "Secret of client {} in {} is already used by another client",
                        client.public_id,
                        group_name
                    );
                }
                if !ids.insert(client.public_id) {
                    bail!("Duplicate client id {} in {}", client.public_id, group_name);
                }
            }
        }
        Ok(())
    }

    pub fn client_count(&self) -> usize {
        self.groups.iter().map(|group| group.clients.len()).sum()
    }
}

impl GroupConfig {
    /// Configured name, or a positional one for unnamed groups.
    pub fn display_name(&self, index: usize) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("group-{index}"),
        }
    }
}

pub fn default_app_data_dir() -> Result<PathBuf> {
    Ok(dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?
        .join(APP_NAME))
}

/// Resolves the app data directory, which must already exist.
pub fn init_app_data_dir(overridden: Option<PathBuf>) -> Result<PathBuf> {
    let path = match overridden {
        Some(path) => path,
        None => default_app_data_dir()?,
    };
    let metadata = std::fs::metadata(&path).with_context(|| {
        format!("Application data directory {} is not accessible", path.display())
    })?;
    if !metadata.is_dir() {
        bail!("Application data path {} is not a directory", path.display());
    }
    info!("Server application data directory is {}", path.display());
    Ok(path)
}
