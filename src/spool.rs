//! Per-batch package spool.
//!
//! Packages built successfully earlier in a batch are put here and the
//! spool is exposed as an extra repository inside later roots, so packages
//! of one batch can build-depend on each other.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::pm::PackageManager;
use crate::util::fs::{create_dirs, hardlink_or_copy};

#[derive(Debug, Clone)]
pub struct Spool {
    path: PathBuf,
}

impl Spool {
    pub fn create(path: PathBuf, pm: &dyn PackageManager) -> Result<Self> {
        create_dirs(&path)?;
        pm.update_repository_metadata(&path)
            .with_context(|| format!("indexing spool '{}'", path.display()))?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn package_count(&self, pm: &dyn PackageManager) -> Result<usize> {
        let mut count = 0;
        for entry in fs::read_dir(&self.path)
            .with_context(|| format!("reading spool '{}'", self.path.display()))?
        {
            let path = entry?.path();
            if path.is_file() && pm.valid_binary(&path) {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Links the binary packages among `paths` into the spool and refreshes
    /// its index. Returns what was added.
    pub fn put_packages(&self, paths: &[PathBuf], pm: &dyn PackageManager) -> Result<Vec<PathBuf>> {
        let mut added = Vec::new();
        for path in paths.iter().filter(|p| pm.valid_binary(p)) {
            let Some(name) = path.file_name() else {
                continue;
            };
            let dest = self.path.join(name);
            hardlink_or_copy(path, &dest)?;
            added.push(dest);
        }
        if !added.is_empty() {
            log::debug!("added {} packages to spool {}", added.len(), self.path.display());
            pm.update_repository_metadata(&self.path)?;
        }
        Ok(added)
    }
}

/// The spool as exposed inside one root.
#[derive(Debug, Clone)]
pub struct RootSpool {
    pub host_path: PathBuf,
    pub in_root: String,
}
