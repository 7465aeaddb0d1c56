//! Server configuration.
//!
//! One YAML file describes every virtual host. Each host owns one
//! listening port, a document root, and a table of locations that
//! decide which paths are handed to CGI and where uploads land.

use std::error::Error;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub servers: Vec<ServerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    #[serde(default = "default_server_name")]
    pub server_name: String,
    pub root: PathBuf,
    #[serde(default)]
    pub locations: Vec<Location>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Location {
    /// Path prefix this location matches, e.g. `/cgi-bin`.
    pub path: String,
    /// Requests under this prefix are executed as CGI scripts.
    #[serde(default)]
    pub cgi: bool,
    /// Upload directory relative to the document root. Presence of
    /// this field is what puts UPLOAD_PATH into the CGI environment.
    #[serde(default)]
    pub upload_dir: Option<String>,
}

fn default_server_name() -> String {
    "localhost".to_string()
}

impl ServerConfig {
    /// Longest-prefix match over the location table.
    pub fn matched_location(&self, path: &str) -> Option<&Location> {
        self.locations
            .iter()
            .filter(|loc| path.starts_with(loc.path.as_str()))
            .max_by_key(|loc| loc.path.len())
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&text).map_err(ConfigError::Yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// The config used when the CLI is handed a bare port: one host,
    /// `./www` document root, no locations.
    pub fn single_port(port: u16) -> Self {
        Config {
            servers: vec![ServerConfig {
                port,
                server_name: default_server_name(),
                root: PathBuf::from("./www"),
                locations: Vec::new(),
            }],
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.servers.is_empty() {
            return Err(ConfigError::Invalid("no servers configured"));
        }
        let mut ports: Vec<u16> = self.servers.iter().map(|s| s.port).collect();
        ports.sort_unstable();
        ports.dedup();
        if ports.len() != self.servers.len() {
            return Err(ConfigError::Invalid("duplicate listen port"));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(PathBuf, std::io::Error),
    Yaml(serde_yaml::Error),
    Invalid(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(path, e) => write!(f, "cannot read {}: {}", path.display(), e),
            ConfigError::Yaml(e) => write!(f, "invalid config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ConfigError::Io(_, e) => Some(e),
            ConfigError::Yaml(e) => Some(e),
            ConfigError::Invalid(_) => None,
        }
    }
}
