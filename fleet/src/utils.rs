//! Utility functions

use serde::{Deserialize, Serialize};

/// Version information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Get version information
pub fn version_info() -> VersionInfo {
    VersionInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        git_hash: option_env!("GIT_HASH").unwrap_or("unknown").to_string(),
        build_time: option_env!("BUILD_TIME").unwrap_or("unknown").to_string(),
    }
}

/// Generate a registry id for a server target
pub fn generate_server_id() -> String {
    format!("srv-{}", uuid::Uuid::new_v4().simple())
}

/// Generate a batch id
pub fn generate_batch_id() -> String {
    format!("batch-{}", uuid::Uuid::new_v4().simple())
}

/// Current Unix timestamp in seconds
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
