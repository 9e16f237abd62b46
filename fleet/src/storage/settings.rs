//! Settings file management

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::logs::LogLevel;

/// fleetd settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit JSON log lines
    #[serde(default)]
    pub log_json: bool,

    /// Also write daily-rolling log files here
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerSettings,

    /// Deployment pipeline configuration
    #[serde(default)]
    pub deploy: DeploySettings,

    /// Remote transport configuration
    #[serde(default)]
    pub transport: TransportSettings,

    /// Simulate remote hosts instead of connecting to them
    #[serde(default)]
    pub dry_run: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_json: false,
            log_dir: None,
            server: ServerSettings::default(),
            deploy: DeploySettings::default(),
            transport: TransportSettings::default(),
            dry_run: false,
        }
    }
}

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_server_host")]
    pub host: String,

    #[serde(default = "default_server_port")]
    pub port: u16,
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    3030
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
        }
    }
}

/// Deployment settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploySettings {
    /// Maximum number of targets deployed at once
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// Upper bound for a single stage
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,

    /// Events buffered per batch feed before slow subscribers lag
    #[serde(default = "default_feed_capacity")]
    pub feed_capacity: usize,

    /// npm package installed on each target
    #[serde(default = "default_package")]
    pub package: String,

    /// Binary provided by the package
    #[serde(default = "default_binary")]
    pub binary: String,

    /// Minimum Node.js major version
    #[serde(default = "default_min_node_major")]
    pub min_node_major: u32,

    #[serde(default = "default_nvm_install_url")]
    pub nvm_install_url: String,

    /// Remote config directory, relative to the remote home
    #[serde(default = "default_remote_config_dir")]
    pub remote_config_dir: String,

    #[serde(default = "default_remote_config_file")]
    pub remote_config_file: String,

    /// Local JSON document written to every target by the config stage
    #[serde(default)]
    pub payload_file: Option<PathBuf>,
}

fn default_max_parallel() -> usize {
    5
}

fn default_stage_timeout_secs() -> u64 {
    600
}

fn default_feed_capacity() -> usize {
    1024
}

fn default_package() -> String {
    "openclaw".to_string()
}

fn default_binary() -> String {
    "openclaw".to_string()
}

fn default_min_node_major() -> u32 {
    22
}

fn default_nvm_install_url() -> String {
    "https://raw.githubusercontent.com/nvm-sh/nvm/v0.39.0/install.sh".to_string()
}

fn default_remote_config_dir() -> String {
    ".openclaw".to_string()
}

fn default_remote_config_file() -> String {
    "openclaw.json".to_string()
}

impl Default for DeploySettings {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            stage_timeout_secs: default_stage_timeout_secs(),
            feed_capacity: default_feed_capacity(),
            package: default_package(),
            binary: default_binary(),
            min_node_major: default_min_node_major(),
            nvm_install_url: default_nvm_install_url(),
            remote_config_dir: default_remote_config_dir(),
            remote_config_file: default_remote_config_file(),
            payload_file: None,
        }
    }
}

/// Remote transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSettings {
    #[serde(default = "default_ssh_binary")]
    pub ssh_binary: String,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Refuse hosts whose key is not already in known_hosts
    #[serde(default = "default_true")]
    pub strict_host_keys: bool,
}

fn default_ssh_binary() -> String {
    "ssh".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            ssh_binary: default_ssh_binary(),
            connect_timeout_secs: default_connect_timeout_secs(),
            strict_host_keys: true,
        }
    }
}
