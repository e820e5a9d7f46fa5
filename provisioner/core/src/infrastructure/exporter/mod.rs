// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Exporter Infrastructure Module
//!
//! Concrete implementations of the Exporter trait, one per NFS server
//! flavour, plus the factory that picks one at startup.

pub mod ganesha;
pub mod kernel;

pub use ganesha::{ExportManagerBus, GaneshaExporter, SystemBusExportManager};
pub use kernel::KernelExporter;

use std::sync::Arc;

use crate::domain::config::ExporterConfig;
use crate::domain::export::{Exporter, ExporterKind};

/// Build the exporter selected by configuration. Called once at startup.
pub fn create_exporter(config: &ExporterConfig) -> Arc<dyn Exporter> {
    match config.kind {
        ExporterKind::Ganesha => Arc::new(GaneshaExporter::new(config.ganesha_config.clone())),
        ExporterKind::Kernel => Arc::new(KernelExporter::new(
            config.kernel_config.clone(),
            config.reload_command.clone(),
        )),
    }
}

// Re-export MockExporter for testing
pub use mock::{ExporterCall, MockExporter};

mod mock {
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::path::{Path, PathBuf};

    use crate::domain::export::{ExportId, Exporter, ExporterError, ExporterKind};

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum ExporterCall {
        Export(ExportId, PathBuf),
        Unexport(Option<ExportId>),
    }

    /// In-memory exporter that records calls and can be told to fail
    pub struct MockExporter {
        kind: ExporterKind,
        config_path: PathBuf,
        pub calls: Mutex<Vec<ExporterCall>>,
        pub fail_export: Mutex<Option<String>>,
        pub fail_unexport: Mutex<Option<String>>,
    }

    impl MockExporter {
        pub fn new(kind: ExporterKind, config_path: impl Into<PathBuf>) -> Self {
            Self {
                kind,
                config_path: config_path.into(),
                calls: Mutex::new(Vec::new()),
                fail_export: Mutex::new(None),
                fail_unexport: Mutex::new(None),
            }
        }

        pub fn fail_exports_with(&self, output: &str) {
            *self.fail_export.lock() = Some(output.to_string());
        }

        pub fn fail_unexports_with(&self, output: &str) {
            *self.fail_unexport.lock() = Some(output.to_string());
        }

        pub fn calls(&self) -> Vec<ExporterCall> {
            self.calls.lock().clone()
        }

        fn failure(output: &str) -> ExporterError {
            ExporterError::CommandFailed {
                command: "mock".to_string(),
                status: "exit status: 1".to_string(),
                output: output.to_string(),
            }
        }
    }

    #[async_trait]
    impl Exporter for MockExporter {
        fn kind(&self) -> ExporterKind {
            self.kind
        }

        fn config_path(&self) -> &Path {
            &self.config_path
        }

        fn render_block(&self, id: ExportId, path: &Path) -> String {
            format!("# export {}\n{} *(rw,fsid={})\n", id, path.display(), id)
        }

        fn existing_ids(&self, contents: &str) -> Vec<ExportId> {
            contents
                .lines()
                .filter_map(|line| line.strip_prefix("# export "))
                .filter_map(|id| ExportId::parse(id).ok())
                .collect()
        }

        async fn export(&self, id: ExportId, path: &Path, _block: &str) -> Result<(), ExporterError> {
            self.calls.lock().push(ExporterCall::Export(id, path.to_path_buf()));
            match self.fail_export.lock().as_deref() {
                Some(output) => Err(Self::failure(output)),
                None => Ok(()),
            }
        }

        async fn unexport(&self, id: Option<ExportId>) -> Result<(), ExporterError> {
            self.calls.lock().push(ExporterCall::Unexport(id));
            if self.kind == ExporterKind::Ganesha && id.is_none() {
                return Err(ExporterError::MissingExportId);
            }
            match self.fail_unexport.lock().as_deref() {
                Some(output) => Err(Self::failure(output)),
                None => Ok(()),
            }
        }
    }
}
