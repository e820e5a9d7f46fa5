// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Provisioner Application Service
//!
//! Creates and destroys the full export of one volume:
//! - backing directory under the export root
//! - export id from the allocator
//! - config block in the export config file
//! - activation on the running server through the exporter
//!
//! Provision unwinds its own partial work on failure. Delete never unwinds;
//! it reports how far it got so the remaining steps can be finished by hand.

use async_trait::async_trait;
use std::fmt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::domain::claim::{validate_volume_name, ClaimRequest, ValidationError};
use crate::domain::export::{ExportId, Exporter, ExporterError};
use crate::domain::volume::{
    ClaimRef, NfsSource, ProvisionedVolume, VolumePhase, ANN_EXPORT_BLOCK,
};
use crate::infrastructure::export_config::{ConfigFileError, ExportConfigFile};
use crate::infrastructure::id_allocator::{AllocatorError, ExportIdAllocator};

/// Export id 0 is the pseudo root on both servers and is never handed out
pub const RESERVED_EXPORT_ID: ExportId = ExportId(0);

const DIRECTORY_MODE: u32 = 0o777;

// ============================================================================
// Service Trait
// ============================================================================

#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Create the backing storage and export for a claim
    async fn provision(&self, claim: &ClaimRequest) -> Result<ProvisionedVolume, ProvisionError>;

    /// Reverse everything Provision did for a volume
    async fn delete(&self, volume: &ProvisionedVolume) -> Result<(), DeleteError>;
}

// ============================================================================
// Errors
// ============================================================================

/// Cause of a single failed step
#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Allocator(#[from] AllocatorError),

    #[error(transparent)]
    ConfigFile(#[from] ConfigFileError),

    #[error(transparent)]
    Exporter(#[from] ExporterError),

    #[error("volume has no {0} annotation")]
    MissingAnnotation(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionStep {
    CreateDirectory,
    AllocateId,
    AppendBlock,
    Export,
}

impl fmt::Display for ProvisionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::CreateDirectory => "create backing directory",
            Self::AllocateId => "allocate export id",
            Self::AppendBlock => "append config block",
            Self::Export => "activate export",
        })
    }
}

/// A side effect Provision could not undo
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Leftover {
    Directory { path: PathBuf, reason: String },
    ConfigBlock { file: PathBuf, reason: String },
}

impl fmt::Display for Leftover {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Directory { path, reason } => {
                write!(f, "directory {} still present ({})", path.display(), reason)
            }
            Self::ConfigBlock { file, reason } => {
                write!(f, "config block still in {} ({})", file.display(), reason)
            }
        }
    }
}

/// Everything left in place after an unwind
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Residue(pub Vec<Leftover>);

impl Residue {
    pub fn is_clean(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Residue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("all completed steps were undone");
        }
        f.write_str("left in place: ")?;
        for (i, leftover) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", leftover)?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error(transparent)]
    InvalidClaim(#[from] ValidationError),

    #[error("provisioning {volume} failed to {step}: {source}; {left_behind}")]
    StepFailed {
        volume: String,
        step: ProvisionStep,
        #[source]
        source: StepError,
        left_behind: Residue,
    },
}

/// Delete steps, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteStep {
    VerifyDirectory = 1,
    RemoveDirectory = 2,
    FreeExportId = 3,
    RequireBlock = 4,
    RemoveBlock = 5,
    Unexport = 6,
}

impl DeleteStep {
    pub fn number(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for DeleteStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::VerifyDirectory => "verify backing directory",
            Self::RemoveDirectory => "remove backing directory",
            Self::FreeExportId => "free export id",
            Self::RequireBlock => "read config block annotation",
            Self::RemoveBlock => "remove config block",
            Self::Unexport => "deactivate export",
        })
    }
}

fn step_narrative(failed: &DeleteStep) -> String {
    let completed = match failed.number() - 1 {
        0 => "no steps completed".to_string(),
        1 => "completed step 1".to_string(),
        k => format!("completed steps 1..{}", k),
    };
    format!("{}, failed at step {} ({})", completed, failed.number(), failed)
}

#[derive(Debug, Error)]
pub enum DeleteError {
    #[error(transparent)]
    InvalidVolume(#[from] ValidationError),

    #[error("volume {volume} was not provisioned by this instance: {} does not exist", .path.display())]
    NotProvisioned { volume: String, path: PathBuf },

    #[error("deleting {volume}: {}: {source}", step_narrative(.failed))]
    StepFailed {
        volume: String,
        failed: DeleteStep,
        #[source]
        source: StepError,
    },
}

impl DeleteError {
    fn at(volume: &str, failed: DeleteStep, source: impl Into<StepError>) -> Self {
        Self::StepFailed {
            volume: volume.to_string(),
            failed,
            source: source.into(),
        }
    }

    /// Step the deletion stopped at, if it got past validation
    pub fn failed_step(&self) -> Option<DeleteStep> {
        match self {
            Self::InvalidVolume(_) => None,
            Self::NotProvisioned { .. } => Some(DeleteStep::VerifyDirectory),
            Self::StepFailed { failed, .. } => Some(*failed),
        }
    }
}

// ============================================================================
// NFS Implementation
// ============================================================================

pub struct NfsProvisioner {
    name: String,
    export_root: PathBuf,
    server_address: String,
    exporter: Arc<dyn Exporter>,
    allocator: Arc<ExportIdAllocator>,
    config_file: ExportConfigFile,
}

impl NfsProvisioner {
    /// The config file edited is always the one the exporter reads
    pub fn new(
        name: impl Into<String>,
        export_root: impl Into<PathBuf>,
        server_address: impl Into<String>,
        exporter: Arc<dyn Exporter>,
        allocator: Arc<ExportIdAllocator>,
    ) -> Self {
        let config_file = ExportConfigFile::new(exporter.config_path());
        Self {
            name: name.into(),
            export_root: export_root.into(),
            server_address: server_address.into(),
            exporter,
            allocator,
            config_file,
        }
    }

    /// Mark the reserved id and every id already present in the config file
    /// as used. Run once before the first Provision.
    pub async fn restore_allocations(&self) -> Result<usize, ConfigFileError> {
        let contents = self.config_file.read().await?;
        self.allocator.reserve(RESERVED_EXPORT_ID);

        let existing = self.exporter.existing_ids(&contents);
        for id in &existing {
            self.allocator.reserve(*id);
        }

        info!(
            config = %self.config_file.path().display(),
            existing = existing.len(),
            "Restored export id allocations"
        );
        record_ids_in_use(&self.allocator);
        Ok(existing.len())
    }

    fn volume_path(&self, volume_name: &str) -> PathBuf {
        self.export_root.join(volume_name)
    }

    /// A directory that cannot be given its mode is removed again; if that
    /// removal fails too, the directory is returned as residue.
    async fn create_directory(path: &Path) -> Result<(), (std::io::Error, Residue)> {
        tokio::fs::create_dir(path)
            .await
            .map_err(|e| (e, Residue::default()))?;
        // mode passed to mkdir is masked by the umask
        if let Err(e) =
            tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(DIRECTORY_MODE)).await
        {
            let removal = tokio::fs::remove_dir(path).await;
            let residue = Residue(leftover_directory(path, removal).into_iter().collect());
            return Err((e, residue));
        }
        Ok(())
    }

    /// Undo steps in reverse order, collecting whatever could not be undone
    async fn unwind(
        &self,
        path: &Path,
        id: Option<ExportId>,
        block: Option<&str>,
    ) -> Residue {
        let mut residue = Vec::new();

        if let Some(block) = block {
            if let Err(e) = self.config_file.remove_block(block).await {
                error!(error = %e, "Unwind could not remove config block");
                residue.push(Leftover::ConfigBlock {
                    file: self.config_file.path().to_path_buf(),
                    reason: e.to_string(),
                });
            }
        }

        if let Some(id) = id {
            self.allocator.free(id);
        }

        residue.extend(leftover_directory(path, tokio::fs::remove_dir_all(path).await));

        Residue(residue)
    }

    async fn failed(
        &self,
        volume: &str,
        step: ProvisionStep,
        source: impl Into<StepError>,
        path: &Path,
        id: Option<ExportId>,
        block: Option<&str>,
    ) -> ProvisionError {
        let source = source.into();
        warn!(volume = %volume, step = %step, error = %source, "Provision step failed, unwinding");
        let left_behind = self.unwind(path, id, block).await;
        record_ids_in_use(&self.allocator);
        ProvisionError::StepFailed {
            volume: volume.to_string(),
            step,
            source,
            left_behind,
        }
    }

    fn describe(&self, claim: &ClaimRequest, path: &Path) -> ProvisionedVolume {
        ProvisionedVolume {
            name: claim.volume_name(),
            capacity: claim.capacity.clone(),
            access_modes: claim.access_modes.clone(),
            reclaim_policy: claim.reclaim_policy,
            phase: VolumePhase::Pending,
            storage_class: claim.storage_class.clone(),
            claim_ref: Some(ClaimRef {
                namespace: claim.namespace.clone(),
                name: claim.name.clone(),
                uid: claim.uid.clone(),
            }),
            nfs: Some(NfsSource {
                server: self.server_address.clone(),
                path: path.to_string_lossy().to_string(),
            }),
            annotations: Default::default(),
        }
    }

    async fn provision_volume(&self, claim: &ClaimRequest) -> Result<ProvisionedVolume, ProvisionError> {
        claim.validate()?;

        let volume_name = claim.volume_name();
        let path = self.volume_path(&volume_name);

        if let Err((e, left_behind)) = Self::create_directory(&path).await {
            return Err(ProvisionError::StepFailed {
                volume: volume_name,
                step: ProvisionStep::CreateDirectory,
                source: e.into(),
                left_behind,
            });
        }

        let id = match self.allocator.allocate() {
            Ok(id) => id,
            Err(e) => {
                return Err(self
                    .failed(&volume_name, ProvisionStep::AllocateId, e, &path, None, None)
                    .await)
            }
        };
        record_ids_in_use(&self.allocator);

        let block = self.exporter.render_block(id, &path);

        if let Err(e) = self.config_file.append(&block).await {
            return Err(self
                .failed(&volume_name, ProvisionStep::AppendBlock, e, &path, Some(id), None)
                .await);
        }

        if let Err(e) = self.exporter.export(id, &path, &block).await {
            return Err(self
                .failed(&volume_name, ProvisionStep::Export, e, &path, Some(id), Some(&block))
                .await);
        }

        let mut volume = self.describe(claim, &path);
        volume.record_export(&self.name, id, self.exporter.kind(), &path, &block);

        info!(
            claim = %claim.key(),
            volume = %volume.name,
            export_id = %id,
            exporter = %self.exporter.kind(),
            "Provisioned volume"
        );
        Ok(volume)
    }

    async fn delete_volume(&self, volume: &ProvisionedVolume) -> Result<(), DeleteError> {
        validate_volume_name(&volume.name)?;
        let path = self.volume_path(&volume.name);

        // 1. the directory is the proof this instance provisioned the volume
        let not_provisioned = || DeleteError::NotProvisioned {
            volume: volume.name.clone(),
            path: path.clone(),
        };
        if volume.export_path().is_some_and(|recorded| recorded != path) {
            return Err(not_provisioned());
        }
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Err(not_provisioned()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(not_provisioned()),
            Err(e) => return Err(DeleteError::at(&volume.name, DeleteStep::VerifyDirectory, e)),
        }

        // 2.
        tokio::fs::remove_dir_all(&path)
            .await
            .map_err(|e| DeleteError::at(&volume.name, DeleteStep::RemoveDirectory, e))?;
        debug!(volume = %volume.name, path = %path.display(), "Removed backing directory");

        // 3. best effort
        let id = match volume.export_id_annotation().map(ExportId::parse) {
            Some(Ok(id)) => {
                self.allocator.free(id);
                record_ids_in_use(&self.allocator);
                Some(id)
            }
            Some(Err(e)) => {
                warn!(volume = %volume.name, error = %e, "Ignoring malformed export id annotation");
                None
            }
            None => {
                debug!(volume = %volume.name, "Volume has no export id annotation");
                None
            }
        };

        // 4.
        let block = volume.export_block().ok_or_else(|| {
            DeleteError::at(
                &volume.name,
                DeleteStep::RequireBlock,
                StepError::MissingAnnotation(ANN_EXPORT_BLOCK),
            )
        })?;

        // 5.
        self.config_file
            .remove_block(block)
            .await
            .map_err(|e| DeleteError::at(&volume.name, DeleteStep::RemoveBlock, e))?;

        // 6.
        self.exporter
            .unexport(id)
            .await
            .map_err(|e| DeleteError::at(&volume.name, DeleteStep::Unexport, e))?;

        info!(volume = %volume.name, "Deleted volume");
        Ok(())
    }
}

#[async_trait]
impl Provisioner for NfsProvisioner {
    async fn provision(&self, claim: &ClaimRequest) -> Result<ProvisionedVolume, ProvisionError> {
        let result = self.provision_volume(claim).await;
        let outcome = if result.is_ok() { "success" } else { "error" };
        metrics::counter!("nfs_provisioner_provision_total", "result" => outcome).increment(1);
        result
    }

    async fn delete(&self, volume: &ProvisionedVolume) -> Result<(), DeleteError> {
        let result = self.delete_volume(volume).await;
        let outcome = match &result {
            Ok(()) => "success",
            Err(DeleteError::NotProvisioned { .. }) => "not_provisioned",
            Err(_) => "error",
        };
        metrics::counter!("nfs_provisioner_delete_total", "result" => outcome).increment(1);
        result
    }
}

fn leftover_directory(path: &Path, removal: std::io::Result<()>) -> Option<Leftover> {
    let e = removal.err()?;
    error!(path = %path.display(), error = %e, "Could not remove backing directory");
    Some(Leftover::Directory {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn record_ids_in_use(allocator: &ExportIdAllocator) {
    metrics::gauge!("nfs_provisioner_export_ids_in_use").set(allocator.in_use() as f64);
}
