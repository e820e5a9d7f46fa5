// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Export Config File
//!
//! The text file the NFS server reads its exports from. Each export is one
//! contiguous block. Blocks are appended at the end and removed by exact
//! content; the file holds no other structure this module relies on.
//!
//! Every read-modify-write sequence runs under one async mutex, so
//! concurrent provisions and deletions never interleave their edits.

use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ConfigFileError {
    #[error("error reading export config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("error writing export config file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("export block not found verbatim in {path}; the stored block is stale or the file was edited")]
    BlockNotFound { path: PathBuf },
}

pub struct ExportConfigFile {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ExportConfigFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current file contents; a missing file reads as empty
    pub async fn read(&self) -> Result<String, ConfigFileError> {
        let _guard = self.lock.lock().await;
        self.read_unlocked().await
    }

    /// Append `block` at end-of-file, creating the file if needed
    pub async fn append(&self, block: &str) -> Result<(), ConfigFileError> {
        let _guard = self.lock.lock().await;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|source| self.write_error(source))?;
        file.write_all(block.as_bytes())
            .await
            .map_err(|source| self.write_error(source))?;
        file.flush().await.map_err(|source| self.write_error(source))?;

        debug!(path = %self.path.display(), bytes = block.len(), "Appended export block");
        Ok(())
    }

    /// Excise the first exact occurrence of `block`, leaving every other
    /// byte untouched
    pub async fn remove_block(&self, block: &str) -> Result<(), ConfigFileError> {
        let _guard = self.lock.lock().await;

        let contents = self.read_unlocked().await?;
        let start = match contents.find(block) {
            Some(start) if !block.is_empty() => start,
            _ => {
                return Err(ConfigFileError::BlockNotFound {
                    path: self.path.clone(),
                })
            }
        };

        let mut updated = String::with_capacity(contents.len() - block.len());
        updated.push_str(&contents[..start]);
        updated.push_str(&contents[start + block.len()..]);

        tokio::fs::write(&self.path, updated)
            .await
            .map_err(|source| self.write_error(source))?;

        debug!(path = %self.path.display(), offset = start, bytes = block.len(), "Removed export block");
        Ok(())
    }

    async fn read_unlocked(&self) -> Result<String, ConfigFileError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => Ok(contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(source) => Err(ConfigFileError::Read {
                path: self.path.clone(),
                source,
            }),
        }
    }

    fn write_error(&self, source: std::io::Error) -> ConfigFileError {
        ConfigFileError::Write {
            path: self.path.clone(),
            source,
        }
    }
}
