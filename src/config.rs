//! Configuration system.
//!
//! Loads configuration from YAML files with a cascading priority system:
//! 1. `./wyre.yaml` (current directory - highest priority)
//! 2. `~/.wyre.yaml` (home directory)
//! 3. user config directory (`wyre/wyre.yaml`)
//! 4. `/etc/wyre/wyre.yaml` (system - lowest priority)
//!
//! Values from higher priority files override those from lower priority
//! files.
//!
//! # YAML Structure
//!
//! ```yaml
//! net:
//!   listen_addr: "0.0.0.0"
//!   listen_port: 30303
//!   client_version: "wyre/0.1.0"
//!   local_networking: false
//! node:
//!   identity:
//!     id: "aabb..."            # 64 hex chars; generated when absent
//! peers:
//!   - addr: "1.2.3.4:30303"
//!     id: "ccdd..."            # optional expected identity
//!     force: false             # accept a different identity anyway
//! ```

use crate::identity::{IdentityError, NodeId};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default config filename.
const CONFIG_FILENAME: &str = "wyre.yaml";

/// Default listen address.
const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0";

/// Default listen port.
const DEFAULT_LISTEN_PORT: u16 = 30303;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ParseYaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),
}

/// Network configuration (`net.*`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetConfig {
    /// Listen address (`net.listen_addr`). Defaults to "0.0.0.0".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen_addr: Option<String>,

    /// Listen port (`net.listen_port`). Defaults to 30303.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen_port: Option<u16>,

    /// Client version string advertised in the handshake
    /// (`net.client_version`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_version: Option<String>,

    /// Accept and gossip private addresses (`net.local_networking`).
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub local_networking: bool,
}

impl NetConfig {
    /// Get the listen address, using the default if not configured.
    pub fn listen_addr(&self) -> &str {
        self.listen_addr.as_deref().unwrap_or(DEFAULT_LISTEN_ADDR)
    }

    /// Get the listen port, using the default if not configured.
    pub fn listen_port(&self) -> u16 {
        self.listen_port.unwrap_or(DEFAULT_LISTEN_PORT)
    }

    /// Get the client version string, using the crate version if not
    /// configured.
    pub fn client_version(&self) -> String {
        self.client_version
            .clone()
            .unwrap_or_else(|| format!("wyre/{}", env!("CARGO_PKG_VERSION")))
    }
}

/// Identity configuration (`node.identity.*`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Node id in hex (`node.identity.id`). If not specified, a new
    /// random identity will be generated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// Node configuration (`node.*`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Identity configuration (`node.identity.*`).
    #[serde(default)]
    pub identity: IdentityConfig,
}

/// A statically configured peer to dial at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerEntry {
    /// Dial address, "host:port".
    pub addr: String,

    /// Expected identity in hex; sessions without one accept whatever
    /// identity the remote presents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Accept a different-than-expected identity anyway.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub force: bool,
}

impl PeerEntry {
    /// Parse the expected identity, if configured.
    pub fn node_id(&self) -> Result<Option<NodeId>, IdentityError> {
        self.id.as_deref().map(NodeId::from_hex).transpose()
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Network configuration (`net.*`).
    #[serde(default)]
    pub net: NetConfig,

    /// Node configuration (`node.*`).
    #[serde(default)]
    pub node: NodeConfig,

    /// Static peers to dial at startup.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub peers: Vec<PeerEntry>,
}

impl Config {
    /// Create a new empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from the standard search paths.
    ///
    /// Files are loaded in reverse priority order and merged. Returns a
    /// tuple of (config, paths_loaded) where paths_loaded contains the
    /// paths that were successfully loaded.
    pub fn load() -> Result<(Self, Vec<PathBuf>), ConfigError> {
        let search_paths = Self::search_paths();
        Self::load_from_paths(&search_paths)
    }

    /// Load configuration from specific paths.
    ///
    /// Paths are processed in order, with later paths overriding earlier
    /// ones.
    pub fn load_from_paths(paths: &[PathBuf]) -> Result<(Self, Vec<PathBuf>), ConfigError> {
        let mut config = Config::default();
        let mut loaded_paths = Vec::new();

        for path in paths {
            if path.exists() {
                let file_config = Self::load_file(path)?;
                config.merge(file_config);
                loaded_paths.push(path.clone());
            }
        }

        Ok((config, loaded_paths))
    }

    /// Load configuration from a single file.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;

        serde_yaml::from_str(&contents).map_err(|e| ConfigError::ParseYaml {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Get the standard search paths in priority order (lowest to
    /// highest).
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        // System config (lowest priority)
        paths.push(PathBuf::from("/etc/wyre").join(CONFIG_FILENAME));

        // User config directory
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("wyre").join(CONFIG_FILENAME));
        }

        // Home directory
        if let Some(home_dir) = dirs::home_dir() {
            paths.push(home_dir.join(".wyre.yaml"));
        }

        // Current directory (highest priority)
        paths.push(PathBuf::from(".").join(CONFIG_FILENAME));

        paths
    }

    /// Merge another configuration into this one.
    ///
    /// Values from `other` override values in `self` when present.
    pub fn merge(&mut self, other: Config) {
        if other.net.listen_addr.is_some() {
            self.net.listen_addr = other.net.listen_addr;
        }
        if other.net.listen_port.is_some() {
            self.net.listen_port = other.net.listen_port;
        }
        if other.net.client_version.is_some() {
            self.net.client_version = other.net.client_version;
        }
        if other.net.local_networking {
            self.net.local_networking = true;
        }
        if other.node.identity.id.is_some() {
            self.node.identity.id = other.node.identity.id;
        }
        if !other.peers.is_empty() {
            self.peers = other.peers;
        }
    }

    /// Create a NodeId from this configuration.
    ///
    /// If an id is configured, parses that. Otherwise, generates a new
    /// random identity.
    pub fn create_node_id(&self) -> Result<NodeId, ConfigError> {
        match &self.node.identity.id {
            Some(id) => Ok(NodeId::from_hex(id)?),
            None => Ok(NodeId::random()),
        }
    }

    /// Check if an identity is configured (vs. will be generated).
    pub fn has_identity(&self) -> bool {
        self.node.identity.id.is_some()
    }

    /// Serialize this configuration to YAML.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}
