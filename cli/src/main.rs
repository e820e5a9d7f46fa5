// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # NFS Provisioner
//!
//! The `nfs-provisioner` binary runs next to an NFS server and serves
//! volume claims whose storage class names this provisioner.
//!
//! Configuration is layered: YAML file, then environment variables, then
//! the flags below. The NFS server daemon itself is started and stopped by
//! the surrounding container; this process only edits its export config and
//! tells it to reload.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use nfs_provisioner_core::application::controller::{Controller, ControllerConfig};
use nfs_provisioner_core::application::provisioner::NfsProvisioner;
use nfs_provisioner_core::domain::config::ProvisionerConfig;
use nfs_provisioner_core::domain::export::ExporterKind;
use nfs_provisioner_core::infrastructure::event_bus::{DomainEvent, EventBus, EventBusError};
use nfs_provisioner_core::infrastructure::exporter::create_exporter;
use nfs_provisioner_core::infrastructure::id_allocator::ExportIdAllocator;
use nfs_provisioner_core::infrastructure::kube::KubeCluster;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Dynamic NFS volume provisioner
#[derive(Parser, Debug)]
#[command(name = "nfs-provisioner")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Name of the provisioner; claims must request it through their storage class
    #[arg(long)]
    provisioner: Option<String>,

    /// Directory under which volume directories are created
    #[arg(long, value_name = "DIR")]
    export_root: Option<PathBuf>,

    /// Export backend (ganesha or kernel)
    #[arg(long)]
    exporter: Option<ExporterKind>,

    /// NFS server address written into provisioned volumes
    #[arg(long)]
    server_address: Option<String>,

    /// Controller resync period (e.g. 15s, 1m)
    #[arg(long, value_parser = humantime::parse_duration)]
    resync_period: Option<Duration>,

    /// Expose Prometheus metrics on this port
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "NFS_PROVISIONER_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

impl Cli {
    /// Flags take precedence over file and environment
    fn apply_overrides(&self, config: &mut ProvisionerConfig) {
        if let Some(name) = &self.provisioner {
            config.provisioner = name.clone();
        }
        if let Some(root) = &self.export_root {
            config.export_root = root.clone();
        }
        if let Some(kind) = self.exporter {
            config.exporter.kind = kind;
        }
        if let Some(server) = &self.server_address {
            config.server_address = server.clone();
        }
        if let Some(period) = self.resync_period {
            config.resync_period = period;
        }
        if let Some(port) = self.metrics_port {
            config.metrics_port = Some(port);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level, cli.log_format)?;

    let mut config = ProvisionerConfig::load_or_default(cli.config.clone())?;
    cli.apply_overrides(&mut config);
    config.validate().context("Invalid configuration")?;

    info!(
        provisioner = %config.provisioner,
        export_root = %config.export_root.display(),
        exporter = %config.exporter.kind,
        config_file = %config.exporter.config_path().display(),
        "Starting NFS provisioner"
    );

    if let Some(port) = config.metrics_port {
        PrometheusBuilder::new()
            .with_http_listener(([0, 0, 0, 0], port))
            .install()
            .context("Failed to start Prometheus listener")?;
        info!(port, "Serving Prometheus metrics");
    }

    let exporter = create_exporter(&config.exporter);
    let allocator = Arc::new(ExportIdAllocator::new());
    let provisioner = NfsProvisioner::new(
        config.provisioner.clone(),
        config.export_root.clone(),
        config.server_address.clone(),
        exporter,
        allocator,
    );
    provisioner
        .restore_allocations()
        .await
        .context("Failed to read export config file")?;

    let cluster = Arc::new(
        KubeCluster::try_default()
            .await
            .context("Failed to create Kubernetes client")?,
    );

    let event_bus = Arc::new(EventBus::with_default_capacity());
    let controller = Arc::new(Controller::new(
        cluster.clone(),
        Arc::new(provisioner),
        event_bus.clone(),
        ControllerConfig {
            provisioner_name: config.provisioner.clone(),
            resync_period: config.resync_period,
        },
    ));
    let shutdown = controller.shutdown_token();

    let event_logger = tokio::spawn(log_events(event_bus, shutdown.clone()));
    let watcher = tokio::spawn({
        let cluster = cluster.clone();
        let trigger = controller.trigger();
        let shutdown = shutdown.clone();
        async move { cluster.watch_changes(trigger, shutdown).await }
    });
    let runner = tokio::spawn({
        let controller = controller.clone();
        async move { controller.run().await }
    });

    shutdown_signal().await;
    info!("Stopping controller; in-flight operations will complete");
    shutdown.cancel();

    runner.await.context("Controller task panicked")?;
    watcher.await.context("Watch task panicked")?;
    event_logger.await.context("Event logger panicked")?;

    info!("NFS provisioner stopped");
    Ok(())
}

/// Initialize tracing subscriber for logging
fn init_logging(level: &str, format: LogFormat) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    match format {
        LogFormat::Text => builder.with_target(false).compact().init(),
        LogFormat::Json => builder.with_target(true).json().init(),
    }

    Ok(())
}

/// Write every volume lifecycle event to the log
async fn log_events(event_bus: Arc<EventBus>, shutdown: CancellationToken) {
    let mut receiver = event_bus.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = receiver.recv() => match event {
                Ok(DomainEvent::Volume(event)) => {
                    info!(subject = %event.subject(), event = ?event, "Volume event");
                }
                Err(EventBusError::Lagged(_)) | Err(EventBusError::Empty) => continue,
                Err(EventBusError::Closed) => break,
            },
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
