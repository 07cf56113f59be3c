//! Local Inventory - a one-time snapshot of the repository root
//!
//! The snapshot is taken before the pipeline starts and never refreshed, so
//! every sync task of a run sees the same view of what already exists locally.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// A single entry directly under the repository root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEntry {
    pub name: String,
    pub is_dir: bool,
}

#[derive(Debug, Clone, Default)]
pub struct LocalInventory {
    root: PathBuf,
    entries: Vec<LocalEntry>,
    repo_dirs: HashSet<String>,
}

impl LocalInventory {
    /// Read the immediate children of `root`
    pub fn snapshot(root: &Path) -> Result<Self> {
        let read_dir = std::fs::read_dir(root)
            .with_context(|| format!("Failed to read repository directory: {}", root.display()))?;

        let mut entries = Vec::new();
        for entry in read_dir {
            let entry = entry.with_context(|| {
                format!("Failed to read entry in repository directory: {}", root.display())
            })?;
            // Symlinks are not followed, a link to a directory does not count
            let is_dir = entry
                .file_type()
                .with_context(|| format!("Failed to stat {}", entry.path().display()))?
                .is_dir();

            entries.push(LocalEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir,
            });
        }

        let inventory = Self::from_entries(root, entries);
        info!(
            "Found {} local repositories in {}",
            inventory.repo_count(),
            root.display()
        );
        Ok(inventory)
    }

    pub fn from_entries(root: impl Into<PathBuf>, entries: Vec<LocalEntry>) -> Self {
        let repo_dirs = entries
            .iter()
            .filter(|entry| entry.is_dir)
            .map(|entry| entry.name.clone())
            .collect();

        Self {
            root: root.into(),
            entries,
            repo_dirs,
        }
    }

    /// Exact, case-sensitive match against directory entries only
    pub fn contains_repo(&self, name: &str) -> bool {
        let found = self.repo_dirs.contains(name);
        debug!("Local lookup for {}: {}", name, found);
        found
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entries(&self) -> &[LocalEntry] {
        &self.entries
    }

    pub fn repo_count(&self) -> usize {
        self.repo_dirs.len()
    }
}
