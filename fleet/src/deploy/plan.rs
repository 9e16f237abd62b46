//! Remote commands run by the pipeline and by rollback

use serde_json::Value;
use tracing::info;

use crate::errors::FleetError;
use crate::filesys::file::File;
use crate::storage::settings::DeploySettings;

/// Makes an nvm-installed node visible to non-interactive shells
const NVM_PRELUDE: &str = r#"export NVM_DIR="$HOME/.nvm"
[ -s "$NVM_DIR/nvm.sh" ] && \. "$NVM_DIR/nvm.sh""#;

const CONFIG_HEREDOC_MARKER: &str = "FLEETD_CONFIG_EOF";

/// Everything the pipeline needs to know about what it installs
#[derive(Debug, Clone)]
pub struct DeployPlan {
    pub package: String,
    pub binary: String,
    pub min_node_major: u32,
    pub nvm_install_url: String,
    pub remote_config_dir: String,
    pub remote_config_file: String,
    /// JSON document written by the config stage
    pub payload: Value,
}

impl DeployPlan {
    /// Build the plan from settings, reading the payload file if one is set
    pub async fn from_settings(settings: &DeploySettings) -> Result<Self, FleetError> {
        let payload = match &settings.payload_file {
            Some(path) => {
                let payload: Value = File::new(path).read_json().await.map_err(|e| {
                    FleetError::ConfigError(format!(
                        "cannot read payload file {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                info!("Loaded deployment payload from {}", path.display());
                payload
            }
            None => Value::Object(Default::default()),
        };

        Ok(Self::with_payload(settings, payload))
    }

    pub fn with_payload(settings: &DeploySettings, payload: Value) -> Self {
        Self {
            package: settings.package.clone(),
            binary: settings.binary.clone(),
            min_node_major: settings.min_node_major,
            nvm_install_url: settings.nvm_install_url.clone(),
            remote_config_dir: settings.remote_config_dir.clone(),
            remote_config_file: settings.remote_config_file.clone(),
            payload,
        }
    }

    // ===== Forward stages =====

    pub fn node_version_command(&self) -> String {
        format!("{}\nnode --version 2>/dev/null", NVM_PRELUDE)
    }

    /// Parse the major version from `node --version` output (e.g. "v22.12.0")
    pub fn parse_node_major(version: &str) -> Option<u32> {
        let trimmed = version.trim().trim_start_matches('v');
        trimmed.split('.').next()?.parse().ok()
    }

    pub fn node_install_command(&self) -> String {
        let major = self.min_node_major;
        format!(
            r#"set -e
curl -o- {url} | bash
{prelude}
nvm install {major}
nvm use {major}
nvm alias default {major}
node --version"#,
            url = self.nvm_install_url,
            prelude = NVM_PRELUDE,
        )
    }

    pub fn agent_install_command(&self) -> String {
        format!("{}\nnpm install -g {}", NVM_PRELUDE, self.package)
    }

    /// Write the payload through a quoted heredoc so nothing in it is expanded
    pub fn write_config_command(&self) -> Result<String, FleetError> {
        let json = serde_json::to_string_pretty(&self.payload)?;
        Ok(format!(
            "mkdir -p \"{dir}\" && cat > \"{path}\" << '{marker}'\n{json}\n{marker}",
            dir = self.remote_config_dir_path(),
            path = self.remote_config_path(),
            marker = CONFIG_HEREDOC_MARKER,
        ))
    }

    pub fn daemon_install_command(&self) -> String {
        format!("{}\n{} install-daemon", NVM_PRELUDE, self.binary)
    }

    pub fn daemon_start_command(&self) -> String {
        format!("{}\n{} start", NVM_PRELUDE, self.binary)
    }

    // ===== Compensation =====

    pub fn stop_daemon_command(&self) -> String {
        format!(
            "{}\n{bin} daemon stop 2>/dev/null || pkill -f \"{bin}\" 2>/dev/null || true",
            NVM_PRELUDE,
            bin = self.binary
        )
    }

    pub fn remove_config_command(&self) -> String {
        format!("rm -f \"{}\"", self.remote_config_path())
    }

    pub fn uninstall_command(&self) -> String {
        format!("{}\nnpm uninstall -g {}", NVM_PRELUDE, self.package)
    }

    fn remote_config_dir_path(&self) -> String {
        format!("$HOME/{}", self.remote_config_dir)
    }

    fn remote_config_path(&self) -> String {
        format!(
            "{}/{}",
            self.remote_config_dir_path(),
            self.remote_config_file
        )
    }
}
