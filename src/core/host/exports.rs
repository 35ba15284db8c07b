// src/core/host/exports.rs

//! `exportfs`-backed export table.

use super::ExportTable;
use crate::core::errors::Result;
use crate::core::exec::CommandRunner;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const EXPORTFS: &str = "exportfs";

pub struct ExportFs {
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl ExportFs {
    pub fn new(runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        Self { runner, timeout }
    }

    async fn exportfs(&self, args: &[&str]) -> Result<String> {
        let output = self.runner.run(EXPORTFS, args, self.timeout).await?;
        Ok(output.into_result(EXPORTFS)?.stdout)
    }
}

#[async_trait]
impl ExportTable for ExportFs {
    async fn export_all(&self) -> Result<()> {
        self.exportfs(&["-ra"]).await.map(|_| ())
    }

    async fn unexport_all(&self) -> Result<()> {
        self.exportfs(&["-ua"]).await.map(|_| ())
    }

    async fn is_exported(&self, path: &Path) -> Result<bool> {
        let listing = self.exportfs(&["-v"]).await?;
        Ok(exported_paths(&listing).any(|p| Path::new(p) == path))
    }
}

/// Extracts the exported directory from each `exportfs -v` entry. Long paths
/// push the client list onto a continuation line, which starts with whitespace.
pub fn exported_paths(listing: &str) -> impl Iterator<Item = &str> {
    listing
        .lines()
        .filter(|line| !line.starts_with(char::is_whitespace))
        .filter_map(|line| line.split_whitespace().next())
}
