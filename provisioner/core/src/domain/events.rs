// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::export::{ExportId, ExporterKind};

/// Volume lifecycle events published by the controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VolumeEvent {
    Provisioned {
        claim: String,
        volume: String,
        export_id: ExportId,
        exporter: ExporterKind,
        provisioned_at: DateTime<Utc>,
    },
    ProvisionFailed {
        claim: String,
        error: String,
        failed_at: DateTime<Utc>,
    },
    Deleted {
        volume: String,
        deleted_at: DateTime<Utc>,
    },
    DeleteFailed {
        volume: String,
        error: String,
        failed_at: DateTime<Utc>,
    },
}

impl VolumeEvent {
    /// Claim key or volume name the event is about
    pub fn subject(&self) -> &str {
        match self {
            Self::Provisioned { volume, .. } => volume,
            Self::ProvisionFailed { claim, .. } => claim,
            Self::Deleted { volume, .. } => volume,
            Self::DeleteFailed { volume, .. } => volume,
        }
    }
}
