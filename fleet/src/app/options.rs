//! Application configuration options

use std::time::Duration;

use crate::deploy::CoordinatorOptions;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::{DeploySettings, Settings, TransportSettings};

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Storage configuration
    pub storage: StorageOptions,

    /// Enable the HTTP server
    pub enable_socket_server: bool,

    /// Server configuration
    pub server: ServerOptions,

    /// Deployment pipeline configuration
    pub deploy: DeploySettings,

    /// Remote transport configuration
    pub transport: TransportSettings,

    /// Simulate remote hosts instead of connecting to them
    pub dry_run: bool,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            lifecycle: LifecycleOptions::default(),
            storage: StorageOptions::default(),
            enable_socket_server: true,
            server: ServerOptions::default(),
            deploy: DeploySettings::default(),
            transport: TransportSettings::default(),
            dry_run: false,
        }
    }
}

impl AppOptions {
    /// Build options from a settings file rooted at `layout`
    pub fn from_settings(settings: &Settings, layout: StorageLayout) -> Self {
        Self {
            storage: StorageOptions { layout },
            server: ServerOptions {
                host: settings.server.host.clone(),
                port: settings.server.port,
            },
            deploy: settings.deploy.clone(),
            transport: settings.transport.clone(),
            dry_run: settings.dry_run,
            ..Default::default()
        }
    }

    pub fn coordinator(&self) -> CoordinatorOptions {
        CoordinatorOptions::from_settings(&self.deploy)
    }
}

/// Lifecycle options
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

/// Storage configuration options
#[derive(Debug, Clone, Default)]
pub struct StorageOptions {
    /// Storage layout paths
    pub layout: StorageLayout,
}

/// HTTP server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3030,
        }
    }
}
