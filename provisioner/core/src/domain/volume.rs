// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::domain::export::{ExportId, ExporterKind};

// ============================================================================
// Annotation keys
// ============================================================================

/// Export id reserved for the volume
pub const ANN_EXPORT_ID: &str = "nfs-provisioner.100monkeys.ai/export-id";
/// Exact config block text written for the volume
pub const ANN_EXPORT_BLOCK: &str = "nfs-provisioner.100monkeys.ai/export-block";
/// Exporter kind that activated the export
pub const ANN_EXPORTER_KIND: &str = "nfs-provisioner.100monkeys.ai/exporter-kind";
/// Backing directory on the server
pub const ANN_EXPORT_PATH: &str = "nfs-provisioner.100monkeys.ai/path";
/// Standard platform annotation naming the provisioner that created a volume
pub const ANN_PROVISIONED_BY: &str = "pv.kubernetes.io/provisioned-by";

// ============================================================================
// Value Objects
// ============================================================================

/// Volume access mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessMode {
    ReadWriteOnce,
    ReadOnlyMany,
    ReadWriteMany,
    ReadWriteOncePod,
}

impl AccessMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadWriteOnce => "ReadWriteOnce",
            Self::ReadOnlyMany => "ReadOnlyMany",
            Self::ReadWriteMany => "ReadWriteMany",
            Self::ReadWriteOncePod => "ReadWriteOncePod",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ReadWriteOnce" => Some(Self::ReadWriteOnce),
            "ReadOnlyMany" => Some(Self::ReadOnlyMany),
            "ReadWriteMany" => Some(Self::ReadWriteMany),
            "ReadWriteOncePod" => Some(Self::ReadWriteOncePod),
            _ => None,
        }
    }
}

/// What happens to a volume once its claim is released
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReclaimPolicy {
    #[default]
    Delete,
    Retain,
    Recycle,
}

impl ReclaimPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delete => "Delete",
            Self::Retain => "Retain",
            Self::Recycle => "Recycle",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Delete" => Some(Self::Delete),
            "Retain" => Some(Self::Retain),
            "Recycle" => Some(Self::Recycle),
            _ => None,
        }
    }
}

/// Volume lifecycle phase as reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VolumePhase {
    #[default]
    Pending,
    Available,
    Bound,
    Released,
    Failed,
}

impl VolumePhase {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Pending" => Some(Self::Pending),
            "Available" => Some(Self::Available),
            "Bound" => Some(Self::Bound),
            "Released" => Some(Self::Released),
            "Failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Back-reference from a volume to the claim it was provisioned for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRef {
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

/// Where clients mount the volume from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NfsSource {
    pub server: String,
    pub path: String,
}

// ============================================================================
// Provisioned Volume
// ============================================================================

/// A volume created by Provision.
///
/// Everything Delete needs to reverse the provisioning lives in
/// `annotations`, so no separate index is kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedVolume {
    pub name: String,
    pub capacity: String,
    #[serde(default)]
    pub access_modes: Vec<AccessMode>,
    #[serde(default)]
    pub reclaim_policy: ReclaimPolicy,
    #[serde(default)]
    pub phase: VolumePhase,
    #[serde(default)]
    pub storage_class: Option<String>,
    #[serde(default)]
    pub claim_ref: Option<ClaimRef>,
    #[serde(default)]
    pub nfs: Option<NfsSource>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl ProvisionedVolume {
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    /// Raw export id annotation, if present
    pub fn export_id_annotation(&self) -> Option<&str> {
        self.annotation(ANN_EXPORT_ID)
    }

    pub fn export_block(&self) -> Option<&str> {
        self.annotation(ANN_EXPORT_BLOCK)
    }

    pub fn exporter_kind(&self) -> Option<ExporterKind> {
        self.annotation(ANN_EXPORTER_KIND).and_then(|k| k.parse().ok())
    }

    pub fn export_path(&self) -> Option<PathBuf> {
        self.annotation(ANN_EXPORT_PATH).map(PathBuf::from)
    }

    pub fn provisioned_by(&self) -> Option<&str> {
        self.annotation(ANN_PROVISIONED_BY)
    }

    /// Annotate the volume with everything Delete needs
    pub fn record_export(
        &mut self,
        provisioner: &str,
        id: ExportId,
        kind: ExporterKind,
        path: &std::path::Path,
        block: &str,
    ) {
        self.annotations
            .insert(ANN_PROVISIONED_BY.to_string(), provisioner.to_string());
        self.annotations
            .insert(ANN_EXPORT_ID.to_string(), id.to_string());
        self.annotations
            .insert(ANN_EXPORTER_KIND.to_string(), kind.to_string());
        self.annotations
            .insert(ANN_EXPORT_PATH.to_string(), path.to_string_lossy().to_string());
        self.annotations
            .insert(ANN_EXPORT_BLOCK.to_string(), block.to_string());
    }

    /// Whether the platform has let go of this volume and its reclaim policy
    /// asks for the backing storage to be deleted
    pub fn awaits_deletion(&self) -> bool {
        self.reclaim_policy == ReclaimPolicy::Delete
            && matches!(self.phase, VolumePhase::Released | VolumePhase::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn volume() -> ProvisionedVolume {
        ProvisionedVolume {
            name: "pvc-1".to_string(),
            capacity: "1Gi".to_string(),
            access_modes: vec![AccessMode::ReadWriteMany],
            reclaim_policy: ReclaimPolicy::Delete,
            phase: VolumePhase::Bound,
            storage_class: None,
            claim_ref: None,
            nfs: None,
            annotations: BTreeMap::new(),
        }
    }

    #[test]
    fn test_record_export_round_trips_through_accessors() {
        let mut v = volume();
        let block = "\n/export/pvc-1 *(rw,insecure,no_root_squash,fsid=7)\n";
        v.record_export(
            "example.com/nfs",
            ExportId(7),
            ExporterKind::Kernel,
            Path::new("/export/pvc-1"),
            block,
        );

        assert_eq!(v.export_id_annotation(), Some("7"));
        assert_eq!(v.export_block(), Some(block));
        assert_eq!(v.exporter_kind(), Some(ExporterKind::Kernel));
        assert_eq!(v.export_path(), Some(PathBuf::from("/export/pvc-1")));
        assert_eq!(v.provisioned_by(), Some("example.com/nfs"));
    }

    #[test]
    fn test_awaits_deletion() {
        let mut v = volume();
        assert!(!v.awaits_deletion());

        v.phase = VolumePhase::Released;
        assert!(v.awaits_deletion());

        v.phase = VolumePhase::Failed;
        assert!(v.awaits_deletion());

        v.reclaim_policy = ReclaimPolicy::Retain;
        assert!(!v.awaits_deletion());
    }

    #[test]
    fn test_enum_parsing() {
        assert_eq!(AccessMode::parse("ReadWriteMany"), Some(AccessMode::ReadWriteMany));
        assert_eq!(AccessMode::parse("rwx"), None);
        assert_eq!(ReclaimPolicy::parse("Retain"), Some(ReclaimPolicy::Retain));
        assert_eq!(VolumePhase::parse("Released"), Some(VolumePhase::Released));
        assert_eq!(VolumePhase::parse("Gone"), None);
    }
}
