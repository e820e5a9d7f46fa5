// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Cluster Interface
//!
//! What the controller needs from the orchestration platform, expressed in
//! domain types. Implemented in `crate::infrastructure::kube` against the
//! Kubernetes API; tests provide in-memory implementations.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::claim::ClaimRequest;
use crate::domain::volume::ProvisionedVolume;

#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Claims that are not yet bound to a volume, with their requested
    /// provisioner resolved where possible
    async fn list_pending_claims(&self) -> Result<Vec<ClaimRequest>, ClusterError>;

    /// All volumes currently known to the platform
    async fn list_volumes(&self) -> Result<Vec<ProvisionedVolume>, ClusterError>;

    /// Create the volume object for a freshly provisioned volume
    async fn create_volume(&self, volume: &ProvisionedVolume) -> Result<(), ClusterError>;

    /// Remove a volume object after its backing storage was deleted
    async fn delete_volume(&self, name: &str) -> Result<(), ClusterError>;
}

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("platform API error: {0}")]
    Api(String),

    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("malformed {kind} {name}: {reason}")]
    Malformed {
        kind: &'static str,
        name: String,
        reason: String,
    },
}
