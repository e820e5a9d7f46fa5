// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Integration tests for the volume lifecycle
//!
//! These tests verify:
//! 1. Provision then Delete restores directory, allocator and config file
//! 2. Kernel reload failures during Delete leave the documented intermediate state
//! 3. Ganesha export manager calls carry the allocated id
//! 4. The controller drives a real provisioner end to end against an in-memory cluster
//!
//! The kernel reload command is replaced by `sh -c` scripts; no NFS server
//! or cluster is required.

use async_trait::async_trait;
use nfs_provisioner_core::application::controller::{Controller, ControllerConfig};
use nfs_provisioner_core::application::provisioner::{
    DeleteError, DeleteStep, NfsProvisioner, Provisioner, RESERVED_EXPORT_ID,
};
use nfs_provisioner_core::domain::claim::ClaimRequest;
use nfs_provisioner_core::domain::cluster::{ClusterClient, ClusterError};
use nfs_provisioner_core::domain::events::VolumeEvent;
use nfs_provisioner_core::domain::export::{ExportId, Exporter, ExporterError, ExporterKind};
use nfs_provisioner_core::domain::volume::{AccessMode, ProvisionedVolume, ReclaimPolicy, VolumePhase};
use nfs_provisioner_core::infrastructure::event_bus::{DomainEvent, EventBus};
use nfs_provisioner_core::infrastructure::exporter::{ExportManagerBus, GaneshaExporter, KernelExporter};
use nfs_provisioner_core::infrastructure::id_allocator::ExportIdAllocator;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

const PREAMBLE: &str = "/export *(ro,fsid=0)\n";

struct Server {
    _dir: TempDir,
    root: PathBuf,
    config: PathBuf,
}

impl Server {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("export");
        std::fs::create_dir(&root).unwrap();
        let config = dir.path().join("exports");
        std::fs::write(&config, PREAMBLE).unwrap();
        Self {
            _dir: dir,
            root,
            config,
        }
    }

    fn config_contents(&self) -> String {
        std::fs::read_to_string(&self.config).unwrap()
    }
}

fn sh(script: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), script.to_string()]
}

fn claim(uid: &str) -> ClaimRequest {
    ClaimRequest {
        namespace: "default".to_string(),
        name: format!("data-{}", uid),
        uid: uid.to_string(),
        provisioner: Some("other/nfs".to_string()),
        capacity: "5Gi".to_string(),
        access_modes: vec![AccessMode::ReadWriteMany],
        storage_class: Some("nfs".to_string()),
        reclaim_policy: ReclaimPolicy::Delete,
    }
}

async fn kernel_provisioner(server: &Server, reload: Vec<String>) -> (NfsProvisioner, Arc<ExportIdAllocator>) {
    let exporter = Arc::new(KernelExporter::new(&server.config, reload));
    let allocator = Arc::new(ExportIdAllocator::new());
    let provisioner = NfsProvisioner::new("other/nfs", &server.root, "nfs.example.svc", exporter, allocator.clone());
    provisioner.restore_allocations().await.unwrap();
    (provisioner, allocator)
}

#[tokio::test]
async fn test_kernel_provision_then_delete_round_trip() {
    let server = Server::new();
    let (provisioner, allocator) = kernel_provisioner(&server, sh("exit 0")).await;

    // the preamble already holds fsid=0
    assert_eq!(allocator.in_use(), 1);

    let volume = provisioner.provision(&claim("rt")).await.unwrap();
    let path = server.root.join("pvc-rt");
    assert!(path.is_dir());
    assert_eq!(volume.export_id_annotation(), Some("1"));
    assert_eq!(
        server.config_contents(),
        format!("{}\n{} *(rw,insecure,no_root_squash,fsid=1)\n", PREAMBLE, path.display())
    );

    provisioner.delete(&volume).await.unwrap();

    assert!(!path.exists());
    assert!(!allocator.is_allocated(ExportId(1)));
    assert_eq!(server.config_contents(), PREAMBLE);
}

#[tokio::test]
async fn test_kernel_reload_failure_during_delete() {
    let server = Server::new();
    let (provisioner, _) = kernel_provisioner(&server, sh("exit 0")).await;
    let volume = provisioner.provision(&claim("bad")).await.unwrap();

    // same server state, reload now fails
    let (failing, _) = kernel_provisioner(
        &server,
        sh("echo 'exportfs: invalid export entry'; exit 1"),
    )
    .await;

    let err = failing.delete(&volume).await.unwrap_err();
    assert_eq!(err.failed_step(), Some(DeleteStep::Unexport));
    let message = err.to_string();
    assert!(message.contains("exportfs: invalid export entry"), "{}", message);
    assert!(message.contains("completed steps 1..5, failed at step 6"), "{}", message);

    // block removal is irreversible and already happened
    assert_eq!(server.config_contents(), PREAMBLE);
    assert!(!server.root.join("pvc-bad").exists());

    // a retry finds no directory and changes nothing
    let err = failing.delete(&volume).await.unwrap_err();
    assert!(matches!(err, DeleteError::NotProvisioned { .. }));
    assert_eq!(server.config_contents(), PREAMBLE);
}

#[tokio::test]
async fn test_foreign_volume_delete_mutates_nothing() {
    let server = Server::new();
    let (provisioner, allocator) = kernel_provisioner(&server, sh("exit 0")).await;
    let mut volume = provisioner.provision(&claim("mine")).await.unwrap();
    volume.name = "pvc-someone-else".to_string();
    let before = server.config_contents();

    let err = provisioner.delete(&volume).await.unwrap_err();
    assert!(matches!(err, DeleteError::NotProvisioned { .. }));
    assert!(err.to_string().contains("not provisioned by this instance"));

    assert_eq!(server.config_contents(), before);
    assert!(server.root.join("pvc-mine").is_dir());
    assert!(allocator.is_allocated(ExportId(1)));
}

#[tokio::test]
async fn test_concurrent_provisions_get_distinct_ids() {
    let server = Server::new();
    let (provisioner, allocator) = kernel_provisioner(&server, sh("exit 0")).await;
    let provisioner = Arc::new(provisioner);

    let uids: Vec<String> = (0..24).map(|_| Uuid::new_v4().to_string()).collect();
    let mut tasks = Vec::new();
    for uid in &uids {
        let provisioner = provisioner.clone();
        let claim = claim(uid);
        tasks.push(tokio::spawn(async move { provisioner.provision(&claim).await.unwrap() }));
    }

    let mut ids = Vec::new();
    for task in tasks {
        let volume = task.await.unwrap();
        ids.push(ExportId::parse(volume.export_id_annotation().unwrap()).unwrap());
    }
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 24);
    assert!(!ids.contains(&RESERVED_EXPORT_ID));
    assert_eq!(allocator.in_use(), 25);

    let contents = server.config_contents();
    for uid in &uids {
        let line = format!("{} *(rw", server.root.join(format!("pvc-{}", uid)).display());
        assert_eq!(contents.matches(&line).count(), 1);
    }
}

#[derive(Default)]
struct RecordingBus {
    calls: Mutex<Vec<String>>,
}

#[async_trait]
impl ExportManagerBus for RecordingBus {
    async fn add_export(&self, config_path: &Path, expression: &str) -> Result<(), ExporterError> {
        self.calls
            .lock()
            .push(format!("AddExport({}, {})", config_path.display(), expression));
        Ok(())
    }

    async fn remove_export(&self, id: u16) -> Result<(), ExporterError> {
        self.calls.lock().push(format!("RemoveExport({})", id));
        Ok(())
    }
}

#[tokio::test]
async fn test_ganesha_round_trip() {
    let server = Server::new();
    std::fs::write(&server.config, "").unwrap();
    let bus = Arc::new(RecordingBus::default());
    let exporter: Arc<dyn Exporter> = Arc::new(GaneshaExporter::with_bus(&server.config, bus.clone()));
    let allocator = Arc::new(ExportIdAllocator::new());
    let provisioner = NfsProvisioner::new("other/nfs", &server.root, "10.0.0.5", exporter, allocator);
    provisioner.restore_allocations().await.unwrap();

    let volume = provisioner.provision(&claim("g")).await.unwrap();
    assert_eq!(volume.exporter_kind(), Some(ExporterKind::Ganesha));
    assert!(server.config_contents().contains("\tExport_Id = 1;\n"));

    provisioner.delete(&volume).await.unwrap();
    assert_eq!(server.config_contents(), "");
    assert_eq!(
        *bus.calls.lock(),
        vec![
            format!("AddExport({}, export(export_id = 1))", server.config.display()),
            "RemoveExport(1)".to_string(),
        ]
    );
}

/// In-memory cluster that moves volumes to Released when asked
#[derive(Default)]
struct MemoryCluster {
    claims: Mutex<Vec<ClaimRequest>>,
    volumes: Mutex<Vec<ProvisionedVolume>>,
}

impl MemoryCluster {
    fn release_all(&self) {
        self.claims.lock().clear();
        for volume in self.volumes.lock().iter_mut() {
            volume.phase = VolumePhase::Released;
        }
    }
}

#[async_trait]
impl ClusterClient for MemoryCluster {
    async fn list_pending_claims(&self) -> Result<Vec<ClaimRequest>, ClusterError> {
        Ok(self.claims.lock().clone())
    }

    async fn list_volumes(&self) -> Result<Vec<ProvisionedVolume>, ClusterError> {
        Ok(self.volumes.lock().clone())
    }

    async fn create_volume(&self, volume: &ProvisionedVolume) -> Result<(), ClusterError> {
        let mut volume = volume.clone();
        volume.phase = VolumePhase::Bound;
        self.volumes.lock().push(volume);
        Ok(())
    }

    async fn delete_volume(&self, name: &str) -> Result<(), ClusterError> {
        self.volumes.lock().retain(|v| v.name != name);
        Ok(())
    }
}

#[tokio::test]
async fn test_controller_end_to_end() {
    let server = Server::new();
    let (provisioner, allocator) = kernel_provisioner(&server, sh("exit 0")).await;

    let cluster = Arc::new(MemoryCluster::default());
    cluster.claims.lock().push(claim("e2e"));
    let mut foreign = claim("foreign");
    foreign.provisioner = Some("vendor/nfs".to_string());
    cluster.claims.lock().push(foreign);

    let event_bus = Arc::new(EventBus::new(16));
    let mut events = event_bus.subscribe();
    let controller = Controller::new(
        cluster.clone(),
        Arc::new(provisioner),
        event_bus,
        ControllerConfig {
            provisioner_name: "other/nfs".to_string(),
            resync_period: Duration::from_secs(15),
        },
    );

    controller.sync_once().await.unwrap();
    controller.wait_idle().await;

    assert_eq!(cluster.volumes.lock().len(), 1);
    assert!(server.root.join("pvc-e2e").is_dir());
    assert!(!server.root.join("pvc-foreign").exists());
    assert!(matches!(
        events.recv().await.unwrap(),
        DomainEvent::Volume(VolumeEvent::Provisioned { .. })
    ));

    cluster.release_all();
    controller.sync_once().await.unwrap();
    controller.wait_idle().await;

    assert!(cluster.volumes.lock().is_empty());
    assert!(!server.root.join("pvc-e2e").exists());
    assert_eq!(server.config_contents(), PREAMBLE);
    assert_eq!(allocator.in_use(), 1);
    assert!(matches!(
        events.recv().await.unwrap(),
        DomainEvent::Volume(VolumeEvent::Deleted { .. })
    ));
}
