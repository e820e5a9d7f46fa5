// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Exporter Trait - Anti-Corruption Layer for the running NFS server
//!
//! Isolates the provisioner from the way an export is activated on the
//! server. Two implementations exist (see `crate::infrastructure::exporter`):
//!
//! - **Ganesha**: daemon-managed, one method call over the system bus
//! - **Kernel**: kernel-managed, `exportfs -r` re-reads the config file
//!
//! The implementation is chosen once at startup. Nothing outside the
//! exporter module inspects which one is active; code that needs a
//! backend-specific detail (block template, id pattern) asks the trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Number of export slots available to the allocator.
pub const EXPORT_ID_SLOTS: usize = u16::MAX as usize + 1;

/// Numeric export slot, unique among live exports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExportId(pub u16);

impl ExportId {
    pub fn value(self) -> u16 {
        self.0
    }

    /// Parse an export id as stored in a volume annotation
    pub fn parse(s: &str) -> Result<Self, std::num::ParseIntError> {
        s.trim().parse::<u16>().map(Self)
    }
}

impl std::fmt::Display for ExportId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which export backend produced a volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExporterKind {
    /// NFS-Ganesha, managed over D-Bus
    Ganesha,
    /// In-kernel nfsd, managed through /etc/exports
    Kernel,
}

impl ExporterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ganesha => "ganesha",
            Self::Kernel => "kernel",
        }
    }
}

impl std::fmt::Display for ExporterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExporterKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ganesha" => Ok(Self::Ganesha),
            "kernel" => Ok(Self::Kernel),
            other => Err(format!("unknown exporter kind '{}', expected 'ganesha' or 'kernel'", other)),
        }
    }
}

/// Activates and deactivates exports on the running NFS server
///
/// The config file named by [`Exporter::config_path`] is the single source
/// of truth: the provisioner edits it, the backend reads it.
#[async_trait]
pub trait Exporter: Send + Sync {
    /// Backend identity recorded on provisioned volumes
    fn kind(&self) -> ExporterKind;

    /// Path of the export config file this backend reads (GetConfig)
    fn config_path(&self) -> &Path;

    /// Render the config block for one export.
    ///
    /// The returned text is written to the config file verbatim and stored on
    /// the volume, so it must be deterministic for a given id and path.
    fn render_block(&self, id: ExportId, path: &Path) -> String;

    /// Export ids referenced by existing blocks in `contents`
    fn existing_ids(&self, contents: &str) -> Vec<ExportId>;

    /// Activate an export whose block is already in the config file
    async fn export(&self, id: ExportId, path: &Path, block: &str) -> Result<(), ExporterError>;

    /// Deactivate an export whose block was already removed from the config file
    ///
    /// `id` is `None` when the volume carried no id annotation. Backends that
    /// address exports by id fail with [`ExporterError::MissingExportId`].
    async fn unexport(&self, id: Option<ExportId>) -> Result<(), ExporterError>;
}

/// Exporter errors
#[derive(Debug, Error)]
pub enum ExporterError {
    #[error("error connecting to the system bus: {0}")]
    BusConnection(String),

    #[error("error calling {method}: {reason}")]
    BusCall { method: String, reason: String },

    #[error("export id is required to remove an export from the server")]
    MissingExportId,

    #[error("failed to run {command}: {reason}")]
    CommandSpawn { command: String, reason: String },

    #[error("{command} failed with {status}, output: {output}")]
    CommandFailed {
        command: String,
        status: String,
        output: String,
    },
}
