// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Provisioner Configuration
//
// Settings for one provisioner instance:
// - Provisioner identity (the name claims request through their storage class)
// - Export root and export backend selection
// - Controller resync period
// - Address advertised to clients in provisioned volumes
//
// Loaded from YAML, then overridden by environment variables, then by
// command-line flags (applied by the binary).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::claim::validate_provisioner_name;
use crate::domain::export::ExporterKind;

/// Environment variable naming a configuration file
pub const CONFIG_PATH_ENV: &str = "NFS_PROVISIONER_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionerConfig {
    /// Name claims must request to be served by this instance
    #[serde(default = "default_provisioner_name")]
    pub provisioner: String,

    /// Directory under which one subdirectory per volume is created
    #[serde(default = "default_export_root")]
    pub export_root: PathBuf,

    #[serde(default)]
    pub exporter: ExporterConfig,

    /// Controller resync period
    #[serde(default = "default_resync_period", with = "humantime_serde")]
    pub resync_period: Duration,

    /// NFS server address written into provisioned volumes
    #[serde(default = "default_server_address")]
    pub server_address: String,

    /// Prometheus listener port (disabled when absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExporterConfig {
    /// Which backend activates exports
    #[serde(default = "default_exporter_kind")]
    pub kind: ExporterKind,

    /// Config file read by NFS-Ganesha
    #[serde(default = "default_ganesha_config")]
    pub ganesha_config: PathBuf,

    /// Config file read by the kernel server
    #[serde(default = "default_kernel_config")]
    pub kernel_config: PathBuf,

    /// Command that makes the kernel re-read its export table
    #[serde(default = "default_reload_command")]
    pub reload_command: Vec<String>,
}

impl ExporterConfig {
    /// Config file of the selected backend
    pub fn config_path(&self) -> &Path {
        match self.kind {
            ExporterKind::Ganesha => &self.ganesha_config,
            ExporterKind::Kernel => &self.kernel_config,
        }
    }
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            kind: default_exporter_kind(),
            ganesha_config: default_ganesha_config(),
            kernel_config: default_kernel_config(),
            reload_command: default_reload_command(),
        }
    }
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            provisioner: default_provisioner_name(),
            export_root: default_export_root(),
            exporter: ExporterConfig::default(),
            resync_period: default_resync_period(),
            server_address: default_server_address(),
            metrics_port: None,
        }
    }
}

impl ProvisionerConfig {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Load configuration from an explicit path, the `NFS_PROVISIONER_CONFIG`
    /// path, or built-in defaults, then apply environment overrides
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        let path = cli_path.or_else(|| std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from));

        let mut config = match path {
            Some(path) => {
                tracing::info!("Loading configuration from {:?}", path);
                Self::from_yaml_file(&path).map_err(|e| {
                    anyhow::anyhow!("Failed to load config at {:?}: {}", path, e)
                })?
            }
            None => {
                tracing::info!("No configuration file given, using defaults");
                Self::default()
            }
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Environment variables take precedence over the file
    pub fn apply_env_overrides(&mut self) {
        if let Ok(name) = std::env::var("NFS_PROVISIONER_NAME") {
            if !name.is_empty() {
                self.provisioner = name;
            }
        }

        // The server address normally comes from the downward API
        if let Ok(server) = std::env::var("NFS_PROVISIONER_SERVER").or_else(|_| std::env::var("POD_IP")) {
            if !server.is_empty() {
                self.server_address = server;
            }
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        validate_provisioner_name(&self.provisioner)?;

        if !self.export_root.is_absolute() {
            anyhow::bail!("export_root must be an absolute path, got {:?}", self.export_root);
        }

        if self.resync_period.is_zero() {
            anyhow::bail!("resync_period must be greater than zero");
        }

        if self.server_address.is_empty() {
            anyhow::bail!("server_address cannot be empty");
        }

        if self.exporter.kind == ExporterKind::Kernel && self.exporter.reload_command.is_empty() {
            anyhow::bail!("exporter.reload_command cannot be empty for the kernel exporter");
        }

        Ok(())
    }
}

fn default_provisioner_name() -> String {
    "example.com/nfs".to_string()
}

fn default_export_root() -> PathBuf {
    PathBuf::from("/export")
}

fn default_exporter_kind() -> ExporterKind {
    ExporterKind::Ganesha
}

fn default_ganesha_config() -> PathBuf {
    PathBuf::from("/export/vfs.conf")
}

fn default_kernel_config() -> PathBuf {
    PathBuf::from("/etc/exports")
}

fn default_reload_command() -> Vec<String> {
    vec!["exportfs".to_string(), "-r".to_string()]
}

fn default_resync_period() -> Duration {
    Duration::from_secs(15)
}

fn default_server_address() -> String {
    "127.0.0.1".to_string()
}
