// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Kernel NFS Exporter
//!
//! The kernel server has no per-export activation call. Its export table is
//! derived from the config file alone; running the reload command
//! (`exportfs -r` by default) makes it re-read that file, which both adds
//! new blocks and drops removed ones.

use async_trait::async_trait;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tokio::process::Command;
use tracing::debug;

use crate::domain::export::{ExportId, Exporter, ExporterError, ExporterKind};

pub struct KernelExporter {
    config_path: PathBuf,
    reload_command: Vec<String>,
}

impl KernelExporter {
    /// `reload_command` is a program followed by its arguments
    pub fn new(config_path: impl Into<PathBuf>, reload_command: Vec<String>) -> Self {
        Self {
            config_path: config_path.into(),
            reload_command,
        }
    }

    fn command_line(&self) -> String {
        self.reload_command.join(" ")
    }

    /// Run the reload command; a non-zero exit carries stdout followed by
    /// stderr, verbatim
    async fn reload(&self) -> Result<(), ExporterError> {
        let (program, args) = self
            .reload_command
            .split_first()
            .ok_or_else(|| ExporterError::CommandSpawn {
                command: String::new(),
                reason: "reload command is empty".to_string(),
            })?;

        debug!(command = %self.command_line(), "Reloading kernel export table");

        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| ExporterError::CommandSpawn {
                command: self.command_line(),
                reason: e.to_string(),
            })?;

        if output.status.success() {
            return Ok(());
        }

        let mut combined = output.stdout;
        combined.extend_from_slice(&output.stderr);

        Err(ExporterError::CommandFailed {
            command: self.command_line(),
            status: output.status.to_string(),
            output: String::from_utf8_lossy(&combined).into_owned(),
        })
    }
}

fn fsid_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"fsid=(\d+)").expect("static regex"))
}

#[async_trait]
impl Exporter for KernelExporter {
    fn kind(&self) -> ExporterKind {
        ExporterKind::Kernel
    }

    fn config_path(&self) -> &Path {
        &self.config_path
    }

    fn render_block(&self, id: ExportId, path: &Path) -> String {
        format!("\n{} *(rw,insecure,no_root_squash,fsid={})\n", path.display(), id)
    }

    fn existing_ids(&self, contents: &str) -> Vec<ExportId> {
        fsid_regex()
            .captures_iter(contents)
            .filter_map(|c| c[1].parse::<u16>().ok())
            .map(ExportId)
            .collect()
    }

    async fn export(&self, _id: ExportId, _path: &Path, _block: &str) -> Result<(), ExporterError> {
        self.reload().await
    }

    async fn unexport(&self, _id: Option<ExportId>) -> Result<(), ExporterError> {
        self.reload().await
    }
}
