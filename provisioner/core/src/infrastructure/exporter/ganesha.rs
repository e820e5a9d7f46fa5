// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! NFS-Ganesha Exporter
//!
//! Ganesha reads its exports from a config file but only picks up changes
//! when told to through its export manager on the system bus:
//!
//! - `AddExport(config_path, "export(export_id = N)")` - load block N
//! - `RemoveExport(uint16 N)` - drop export N
//!
//! Bus and remote errors are wrapped and returned as-is; nothing is retried
//! here.

use async_trait::async_trait;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::debug;

use crate::domain::export::{ExportId, Exporter, ExporterError, ExporterKind};

pub const GANESHA_SERVICE: &str = "org.ganesha.nfsd";
pub const GANESHA_EXPORT_MGR_PATH: &str = "/org/ganesha/nfsd/ExportMgr";
pub const GANESHA_EXPORT_MGR_INTERFACE: &str = "org.ganesha.nfsd.exportmgr";

/// The two export manager methods the exporter needs
#[async_trait]
pub trait ExportManagerBus: Send + Sync {
    async fn add_export(&self, config_path: &Path, expression: &str) -> Result<(), ExporterError>;

    async fn remove_export(&self, id: u16) -> Result<(), ExporterError>;
}

/// Export manager reached over the system D-Bus
pub struct SystemBusExportManager;

impl SystemBusExportManager {
    async fn call<B>(&self, method: &str, body: &B) -> Result<(), ExporterError>
    where
        B: serde::Serialize + zbus::zvariant::DynamicType,
    {
        let connection = zbus::Connection::system()
            .await
            .map_err(|e| ExporterError::BusConnection(e.to_string()))?;

        connection
            .call_method(
                Some(GANESHA_SERVICE),
                GANESHA_EXPORT_MGR_PATH,
                Some(GANESHA_EXPORT_MGR_INTERFACE),
                method,
                body,
            )
            .await
            .map_err(|e| ExporterError::BusCall {
                method: format!("{}.{}", GANESHA_EXPORT_MGR_INTERFACE, method),
                reason: e.to_string(),
            })?;

        Ok(())
    }
}

#[async_trait]
impl ExportManagerBus for SystemBusExportManager {
    async fn add_export(&self, config_path: &Path, expression: &str) -> Result<(), ExporterError> {
        let body = (config_path.to_string_lossy().to_string(), expression.to_string());
        self.call("AddExport", &body).await
    }

    async fn remove_export(&self, id: u16) -> Result<(), ExporterError> {
        self.call("RemoveExport", &(id,)).await
    }
}

pub struct GaneshaExporter {
    config_path: PathBuf,
    bus: Arc<dyn ExportManagerBus>,
}

impl GaneshaExporter {
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        Self::with_bus(config_path, Arc::new(SystemBusExportManager))
    }

    pub fn with_bus(config_path: impl Into<PathBuf>, bus: Arc<dyn ExportManagerBus>) -> Self {
        Self {
            config_path: config_path.into(),
            bus,
        }
    }
}

fn export_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)Export_Id\s*=\s*(\d+)\s*;").expect("static regex"))
}

#[async_trait]
impl Exporter for GaneshaExporter {
    fn kind(&self) -> ExporterKind {
        ExporterKind::Ganesha
    }

    fn config_path(&self) -> &Path {
        &self.config_path
    }

    fn render_block(&self, id: ExportId, path: &Path) -> String {
        let path = path.display();
        format!(
            "EXPORT\n{{\n\tExport_Id = {id};\n\tPath = {path};\n\tPseudo = {path};\n\tAccess_Type = RW;\n\tSquash = no_root_squash;\n\tSecType = sys;\n\tFilesystem_id = {id}.{id};\n\tFSAL {{\n\t\tName = VFS;\n\t}}\n}}\n"
        )
    }

    fn existing_ids(&self, contents: &str) -> Vec<ExportId> {
        export_id_regex()
            .captures_iter(contents)
            .filter_map(|c| c[1].parse::<u16>().ok())
            .map(ExportId)
            .collect()
    }

    async fn export(&self, id: ExportId, _path: &Path, _block: &str) -> Result<(), ExporterError> {
        let expression = format!("export(export_id = {})", id);
        debug!(export_id = %id, config = %self.config_path.display(), "Adding export over D-Bus");
        self.bus.add_export(&self.config_path, &expression).await
    }

    async fn unexport(&self, id: Option<ExportId>) -> Result<(), ExporterError> {
        let id = id.ok_or(ExporterError::MissingExportId)?;
        debug!(export_id = %id, "Removing export over D-Bus");
        self.bus.remove_export(id.value()).await
    }
}
