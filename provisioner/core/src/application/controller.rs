// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Provisioning Controller - reconciliation loop over claims and volumes
//!
//! Every resync tick (or watch notification) the controller lists pending
//! claims and known volumes, then spawns one task per item that needs work:
//!
//! - claims asking for this provisioner get Provision, then a volume object
//! - own volumes released with a Delete policy get Delete, then removal
//!
//! Failures are logged and published; the item is picked up again on the
//! next tick. The stop signal is only checked between iterations and
//! spawned tasks always run to completion.

use chrono::Utc;
use dashmap::DashSet;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::application::provisioner::Provisioner;
use crate::domain::claim::ClaimRequest;
use crate::domain::cluster::{ClusterClient, ClusterError};
use crate::domain::events::VolumeEvent;
use crate::domain::export::ExportId;
use crate::domain::volume::ProvisionedVolume;
use crate::infrastructure::event_bus::EventBus;

/// Default resync period
pub const DEFAULT_RESYNC_PERIOD: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Only claims naming this provisioner are handled
    pub provisioner_name: String,
    pub resync_period: Duration,
}

/// Work started by one sync pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub provisions_started: usize,
    pub deletions_started: usize,
    pub skipped_in_flight: usize,
}

pub struct Controller {
    cluster: Arc<dyn ClusterClient>,
    provisioner: Arc<dyn Provisioner>,
    event_bus: Arc<EventBus>,
    config: ControllerConfig,
    shutdown_token: CancellationToken,
    trigger: Arc<Notify>,
    tasks: TaskTracker,
    in_flight: Arc<DashSet<String>>,
    // backing storage already deleted, only the volume object remains
    awaiting_removal: Arc<DashSet<String>>,
}

impl Controller {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        provisioner: Arc<dyn Provisioner>,
        event_bus: Arc<EventBus>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            cluster,
            provisioner,
            event_bus,
            config,
            shutdown_token: CancellationToken::new(),
            trigger: Arc::new(Notify::new()),
            tasks: TaskTracker::new(),
            in_flight: Arc::new(DashSet::new()),
            awaiting_removal: Arc::new(DashSet::new()),
        }
    }

    /// Get a handle to trigger shutdown
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Notifying this starts a sync pass without waiting for the next tick
    pub fn trigger(&self) -> Arc<Notify> {
        self.trigger.clone()
    }

    /// Run sync passes until shutdown, then wait for in-flight work
    pub async fn run(&self) {
        info!(
            provisioner = %self.config.provisioner_name,
            resync_period = ?self.config.resync_period,
            "Starting provisioning controller"
        );

        let mut tick = interval(self.config.resync_period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown_token.cancelled() => break,
                _ = tick.tick() => {}
                _ = self.trigger.notified() => {}
            }

            match self.sync_once().await {
                Ok(report) => debug!(?report, "Sync pass completed"),
                Err(e) => warn!("Sync pass failed, retrying next tick: {}", e),
            }
        }

        info!(in_flight = self.tasks.len(), "Shutdown signal received, waiting for in-flight operations");
        self.tasks.close();
        self.tasks.wait().await;
        info!("Provisioning controller stopped");
    }

    /// Wait until every spawned operation has finished
    pub async fn wait_idle(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    /// One reconciliation pass. Spawns work and returns without waiting for it.
    pub async fn sync_once(&self) -> Result<SyncReport, ClusterError> {
        let volumes = self.cluster.list_volumes().await?;
        let claims = self.cluster.list_pending_claims().await?;
        let existing: HashSet<&str> = volumes.iter().map(|v| v.name.as_str()).collect();

        // objects removed by someone else need no further removal
        self.awaiting_removal.retain(|name| {
            let present = existing.contains(name.as_str());
            if !present {
                debug!(volume = %name, "Volume object gone, dropping pending removal");
            }
            present
        });

        let mut report = SyncReport::default();

        for claim in claims {
            if !claim.requests(&self.config.provisioner_name) {
                continue;
            }
            if existing.contains(claim.volume_name().as_str()) {
                debug!(claim = %claim.key(), "Volume already exists for claim");
                continue;
            }
            if self.spawn_provision(claim) {
                report.provisions_started += 1;
            } else {
                report.skipped_in_flight += 1;
            }
        }

        for volume in volumes {
            if volume.provisioned_by() != Some(self.config.provisioner_name.as_str())
                || !volume.awaits_deletion()
            {
                continue;
            }
            if self.spawn_delete(volume) {
                report.deletions_started += 1;
            } else {
                report.skipped_in_flight += 1;
            }
        }

        Ok(report)
    }

    fn spawn_provision(&self, claim: ClaimRequest) -> bool {
        let Some(guard) = InFlight::acquire(&self.in_flight, format!("claim/{}", claim.uid)) else {
            return false;
        };

        let cluster = self.cluster.clone();
        let provisioner = self.provisioner.clone();
        let event_bus = self.event_bus.clone();

        self.tasks.spawn(async move {
            let _guard = guard;
            provision_claim(cluster.as_ref(), provisioner.as_ref(), &event_bus, &claim).await;
        });
        true
    }

    fn spawn_delete(&self, volume: ProvisionedVolume) -> bool {
        let Some(guard) = InFlight::acquire(&self.in_flight, format!("volume/{}", volume.name)) else {
            return false;
        };

        let cluster = self.cluster.clone();
        let provisioner = self.provisioner.clone();
        let event_bus = self.event_bus.clone();
        let awaiting_removal = self.awaiting_removal.clone();

        self.tasks.spawn(async move {
            let _guard = guard;
            delete_volume(
                cluster.as_ref(),
                provisioner.as_ref(),
                &event_bus,
                &awaiting_removal,
                &volume,
            )
            .await;
        });
        true
    }
}

async fn provision_claim(
    cluster: &dyn ClusterClient,
    provisioner: &dyn Provisioner,
    event_bus: &EventBus,
    claim: &ClaimRequest,
) {
    let volume = match provisioner.provision(claim).await {
        Ok(volume) => volume,
        Err(e) => {
            warn!(claim = %claim.key(), "Failed to provision volume: {}", e);
            event_bus.publish_volume_event(VolumeEvent::ProvisionFailed {
                claim: claim.key(),
                error: e.to_string(),
                failed_at: Utc::now(),
            });
            return;
        }
    };

    match cluster.create_volume(&volume).await {
        Ok(()) => {}
        // stored by an earlier create whose response was lost
        Err(ClusterError::AlreadyExists { .. }) => {
            debug!(claim = %claim.key(), volume = %volume.name, "Volume object already exists");
        }
        Err(e) => {
            warn!(claim = %claim.key(), volume = %volume.name, "Failed to create volume object, deleting backing storage: {}", e);
            if let Err(cleanup) = provisioner.delete(&volume).await {
                error!(volume = %volume.name, "Cleanup after failed volume creation failed: {}", cleanup);
            }
            event_bus.publish_volume_event(VolumeEvent::ProvisionFailed {
                claim: claim.key(),
                error: e.to_string(),
                failed_at: Utc::now(),
            });
            return;
        }
    }

    let export_id = volume
        .export_id_annotation()
        .and_then(|id| ExportId::parse(id).ok());
    info!(claim = %claim.key(), volume = %volume.name, "Volume provisioned and created");

    if let (Some(export_id), Some(exporter)) = (export_id, volume.exporter_kind()) {
        event_bus.publish_volume_event(VolumeEvent::Provisioned {
            claim: claim.key(),
            volume: volume.name.clone(),
            export_id,
            exporter,
            provisioned_at: Utc::now(),
        });
    }
}

async fn delete_volume(
    cluster: &dyn ClusterClient,
    provisioner: &dyn Provisioner,
    event_bus: &EventBus,
    awaiting_removal: &DashSet<String>,
    volume: &ProvisionedVolume,
) {
    if !awaiting_removal.contains(&volume.name) {
        if let Err(e) = provisioner.delete(volume).await {
            error!(volume = %volume.name, "Failed to delete volume, retrying next tick: {}", e);
            event_bus.publish_volume_event(VolumeEvent::DeleteFailed {
                volume: volume.name.clone(),
                error: e.to_string(),
                failed_at: Utc::now(),
            });
            return;
        }
        awaiting_removal.insert(volume.name.clone());
    }

    match cluster.delete_volume(&volume.name).await {
        Ok(()) | Err(ClusterError::NotFound { .. }) => {
            awaiting_removal.remove(&volume.name);
            info!(volume = %volume.name, "Volume deleted");
            event_bus.publish_volume_event(VolumeEvent::Deleted {
                volume: volume.name.clone(),
                deleted_at: Utc::now(),
            });
        }
        Err(e) => {
            warn!(volume = %volume.name, "Backing storage deleted but volume object removal failed: {}", e);
            event_bus.publish_volume_event(VolumeEvent::DeleteFailed {
                volume: volume.name.clone(),
                error: e.to_string(),
                failed_at: Utc::now(),
            });
        }
    }
}

/// Marks an item as being worked on until dropped
struct InFlight {
    set: Arc<DashSet<String>>,
    key: String,
}

impl InFlight {
    fn acquire(set: &Arc<DashSet<String>>, key: String) -> Option<Self> {
        if !set.insert(key.clone()) {
            debug!(key = %key, "Operation already in flight");
            return None;
        }
        Some(Self {
            set: set.clone(),
            key,
        })
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.set.remove(&self.key);
    }
}
