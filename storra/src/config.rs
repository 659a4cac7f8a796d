use std::{net::{IpAddr, Ipv4Addr, SocketAddr}, path::Path};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use storra_embedded::EmbeddedConfig;
use storra_mongodb::MongoDbConfig;

use crate::error::{ServerError, ServerResult};

/// Which storage backend serves requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Embedded,
    Mongodb,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Embedded => "embedded",
            BackendKind::Mongodb => "mongodb",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: IpAddr,
    pub port: u16,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 8888,
        }
    }
}

/// Process configuration, built once at startup and handed to the backend and router.
///
/// Every section has defaults, so a configuration file only needs the values it changes:
///
/// ```toml
/// backend = "mongodb"
///
/// [server]
/// port = 9000
///
/// [mongodb]
/// database = "inventory"
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorraConfig {
    pub server: ServerConfig,
    pub backend: BackendKind,
    pub embedded: EmbeddedConfig,
    pub mongodb: MongoDbConfig,
    /// Default log filter, used when `RUST_LOG` is not set.
    pub log_level: String,
}

impl Default for StorraConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            backend: BackendKind::default(),
            embedded: EmbeddedConfig::default(),
            mongodb: MongoDbConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl StorraConfig {
    /// Reads a TOML configuration file and merges it over the defaults.
    ///
    /// Returns `None` if the file does not exist; callers fall back to the defaults.
    pub fn load(path: &Path) -> ServerResult<Option<Self>> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::from_toml_str(&content).map(Some),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(ServerError::Config(format!("{}: {err}", path.display()))),
        }
    }

    pub fn from_toml_str(content: &str) -> ServerResult<Self> {
        toml::from_str(content).map_err(|e| ServerError::Config(e.to_string()))
    }
}
