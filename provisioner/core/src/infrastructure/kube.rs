// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Kubernetes Cluster Client
//!
//! `ClusterClient` over the Kubernetes API: claims are PersistentVolumeClaims,
//! volumes are PersistentVolumes, and the provisioner a claim asks for is the
//! `provisioner` field of its StorageClass.

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{
    NFSVolumeSource, ObjectReference, PersistentVolume, PersistentVolumeClaim,
    PersistentVolumeSpec,
};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::runtime::watcher;
use kube::{Client, ResourceExt};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::claim::ClaimRequest;
use crate::domain::cluster::{ClusterClient, ClusterError};
use crate::domain::volume::{
    AccessMode, ClaimRef, NfsSource, ProvisionedVolume, ReclaimPolicy, VolumePhase,
};

/// Legacy claim annotation naming the storage class
pub const ANN_BETA_STORAGE_CLASS: &str = "volume.beta.kubernetes.io/storage-class";

const STORAGE: &str = "storage";

pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn try_default() -> Result<Self, ClusterError> {
        let client = Client::try_default().await.map_err(api_error)?;
        Ok(Self::new(client))
    }

    fn claims(&self) -> Api<PersistentVolumeClaim> {
        Api::all(self.client.clone())
    }

    fn volumes(&self) -> Api<PersistentVolume> {
        Api::all(self.client.clone())
    }

    fn storage_classes(&self) -> Api<StorageClass> {
        Api::all(self.client.clone())
    }

    /// Watch claims and volumes and poke `trigger` on every change until
    /// `cancel` fires. Watch errors are logged; the watcher backs off and
    /// reconnects on its own.
    pub async fn watch_changes(&self, trigger: Arc<Notify>, cancel: CancellationToken) {
        let claims = watcher(self.claims(), watcher::Config::default()).map(|e| e.map(|_| ()));
        let volumes = watcher(self.volumes(), watcher::Config::default()).map(|e| e.map(|_| ()));
        let mut changes = futures::stream::select(claims.boxed(), volumes.boxed());

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = changes.next() => match next {
                    Some(Ok(())) => trigger.notify_one(),
                    Some(Err(e)) => {
                        warn!(error = %e, "Watch error, retrying");
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    }
                    None => break,
                },
            }
        }
        debug!("Change watcher stopped");
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn list_pending_claims(&self) -> Result<Vec<ClaimRequest>, ClusterError> {
        let classes: HashMap<String, StorageClass> = self
            .storage_classes()
            .list(&ListParams::default())
            .await
            .map_err(api_error)?
            .items
            .into_iter()
            .map(|class| (class.name_any(), class))
            .collect();

        let claims = self
            .claims()
            .list(&ListParams::default())
            .await
            .map_err(api_error)?;

        let mut pending = Vec::new();
        for pvc in claims.items {
            match claim_from_pvc(&pvc, &classes) {
                Ok(Some(claim)) => pending.push(claim),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Skipping claim"),
            }
        }
        Ok(pending)
    }

    async fn list_volumes(&self) -> Result<Vec<ProvisionedVolume>, ClusterError> {
        let volumes = self
            .volumes()
            .list(&ListParams::default())
            .await
            .map_err(api_error)?;

        Ok(volumes.items.iter().map(volume_from_pv).collect())
    }

    async fn create_volume(&self, volume: &ProvisionedVolume) -> Result<(), ClusterError> {
        self.volumes()
            .create(&PostParams::default(), &pv_from_volume(volume))
            .await
            .map_err(|e| classify("PersistentVolume", &volume.name, e))?;
        debug!(volume = %volume.name, "Created PersistentVolume");
        Ok(())
    }

    async fn delete_volume(&self, name: &str) -> Result<(), ClusterError> {
        self.volumes()
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| classify("PersistentVolume", name, e))?;
        debug!(volume = %name, "Deleted PersistentVolume");
        Ok(())
    }
}

fn api_error(e: kube::Error) -> ClusterError {
    ClusterError::Api(e.to_string())
}

fn classify(kind: &'static str, name: &str, e: kube::Error) -> ClusterError {
    match e {
        kube::Error::Api(ref response) if response.code == 409 => ClusterError::AlreadyExists {
            kind,
            name: name.to_string(),
        },
        kube::Error::Api(ref response) if response.code == 404 => ClusterError::NotFound {
            kind,
            name: name.to_string(),
        },
        other => api_error(other),
    }
}

/// Storage class a claim asks for, new-style field first
pub fn claim_class(pvc: &PersistentVolumeClaim) -> Option<String> {
    pvc.spec
        .as_ref()
        .and_then(|spec| spec.storage_class_name.clone())
        .or_else(|| pvc.annotations().get(ANN_BETA_STORAGE_CLASS).cloned())
        .filter(|class| !class.is_empty())
}

/// Map an unbound claim to a request. Bound claims map to `None`.
pub fn claim_from_pvc(
    pvc: &PersistentVolumeClaim,
    classes: &HashMap<String, StorageClass>,
) -> Result<Option<ClaimRequest>, ClusterError> {
    let name = pvc.name_any();
    let spec = pvc.spec.as_ref().ok_or_else(|| ClusterError::Malformed {
        kind: "PersistentVolumeClaim",
        name: name.clone(),
        reason: "missing spec".to_string(),
    })?;

    let bound = spec.volume_name.as_deref().is_some_and(|v| !v.is_empty())
        || pvc
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .is_some_and(|phase| phase != "Pending");
    if bound {
        return Ok(None);
    }

    let storage_class = claim_class(pvc);
    let class = storage_class.as_ref().and_then(|c| classes.get(c));

    let capacity = spec
        .resources
        .as_ref()
        .and_then(|r| r.requests.as_ref())
        .and_then(|requests| requests.get(STORAGE))
        .map(|q| q.0.clone())
        .unwrap_or_default();

    let access_modes = spec
        .access_modes
        .iter()
        .flatten()
        .filter_map(|mode| AccessMode::parse(mode))
        .collect();

    Ok(Some(ClaimRequest {
        namespace: pvc.namespace().unwrap_or_default(),
        name,
        uid: pvc.uid().unwrap_or_default(),
        provisioner: class.map(|c| c.provisioner.clone()),
        capacity,
        access_modes,
        storage_class,
        reclaim_policy: class
            .and_then(|c| c.reclaim_policy.as_deref())
            .and_then(ReclaimPolicy::parse)
            .unwrap_or_default(),
    }))
}

pub fn volume_from_pv(pv: &PersistentVolume) -> ProvisionedVolume {
    let spec = pv.spec.clone().unwrap_or_default();

    ProvisionedVolume {
        name: pv.name_any(),
        capacity: spec
            .capacity
            .as_ref()
            .and_then(|c| c.get(STORAGE))
            .map(|q| q.0.clone())
            .unwrap_or_default(),
        access_modes: spec
            .access_modes
            .iter()
            .flatten()
            .filter_map(|mode| AccessMode::parse(mode))
            .collect(),
        reclaim_policy: spec
            .persistent_volume_reclaim_policy
            .as_deref()
            .and_then(ReclaimPolicy::parse)
            .unwrap_or_default(),
        phase: pv
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .and_then(VolumePhase::parse)
            .unwrap_or_default(),
        storage_class: spec.storage_class_name.clone(),
        claim_ref: spec.claim_ref.as_ref().map(|r| ClaimRef {
            namespace: r.namespace.clone().unwrap_or_default(),
            name: r.name.clone().unwrap_or_default(),
            uid: r.uid.clone().unwrap_or_default(),
        }),
        nfs: spec.nfs.as_ref().map(|nfs| NfsSource {
            server: nfs.server.clone(),
            path: nfs.path.clone(),
        }),
        annotations: pv.annotations().clone(),
    }
}

pub fn pv_from_volume(volume: &ProvisionedVolume) -> PersistentVolume {
    PersistentVolume {
        metadata: ObjectMeta {
            name: Some(volume.name.clone()),
            annotations: Some(volume.annotations.clone()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeSpec {
            capacity: Some(BTreeMap::from([(
                STORAGE.to_string(),
                Quantity(volume.capacity.clone()),
            )])),
            access_modes: Some(
                volume
                    .access_modes
                    .iter()
                    .map(|m| m.as_str().to_string())
                    .collect(),
            ),
            persistent_volume_reclaim_policy: Some(volume.reclaim_policy.as_str().to_string()),
            storage_class_name: volume.storage_class.clone(),
            claim_ref: volume.claim_ref.as_ref().map(|r| ObjectReference {
                api_version: Some("v1".to_string()),
                kind: Some("PersistentVolumeClaim".to_string()),
                namespace: Some(r.namespace.clone()),
                name: Some(r.name.clone()),
                uid: Some(r.uid.clone()),
                ..Default::default()
            }),
            nfs: volume.nfs.as_ref().map(|nfs| NFSVolumeSource {
                server: nfs.server.clone(),
                path: nfs.path.clone(),
                read_only: Some(false),
            }),
            ..Default::default()
        }),
        status: None,
    }
}
