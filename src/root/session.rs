//! Operations on one root, borrowed from the [`RootManager`](super::RootManager).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use super::Chroot;
use crate::config::TargetConfig;
use crate::logstore::{temp_file_with, OutputSink};
use crate::spool::{RootSpool, Spool};
use crate::su::SuWrapper;
use crate::util::fs::join_inside;

pub struct ChrootSession<'a> {
    su: &'a mut SuWrapper,
    root: &'a Chroot,
    cfg: &'a TargetConfig,
}

impl<'a> ChrootSession<'a> {
    pub fn new(su: &'a mut SuWrapper, root: &'a Chroot, cfg: &'a TargetConfig) -> Self {
        Self { su, root, cfg }
    }

    pub fn root(&self) -> &Chroot {
        self.root
    }

    pub fn config(&self) -> &TargetConfig {
        self.cfg
    }

    pub fn external_path(&self, inside: &str) -> PathBuf {
        join_inside(&self.root.path, inside)
    }

    pub fn run_package_manager(
        &mut self,
        pm: &str,
        args: &[String],
        sink: Option<&mut dyn OutputSink>,
    ) -> Result<String> {
        self.su.run_package_manager(
            pm,
            args,
            Some((self.root.path.as_path(), self.root.arch.as_str())),
            sink,
        )
    }

    pub fn run_as(
        &mut self,
        args: &[String],
        user: &str,
        timeout: Option<u64>,
        sink: Option<&mut dyn OutputSink>,
    ) -> Result<String> {
        self.su
            .run_as(args, user, &self.root.path, &self.root.arch, timeout, sink)
    }

    pub fn add_user(&mut self, user: &str, uid: u32) -> Result<()> {
        self.su
            .add_user(user, uid, &self.root.path, &self.root.arch)
    }

    /// Copies a host file into the in-root directory `dest_dir`; returns the
    /// file's in-root path.
    pub fn copy_in(
        &mut self,
        local: &Path,
        dest_dir: &str,
        uid: Option<u32>,
        mode: Option<u32>,
    ) -> Result<String> {
        let name = local
            .file_name()
            .with_context(|| format!("'{}' has no file name", local.display()))?
            .to_string_lossy()
            .into_owned();
        let dest = self.external_path(dest_dir);
        self.su.copy(&[local], &dest, uid, None, mode)?;
        Ok(format!("{}/{}", dest_dir.trim_end_matches('/'), name))
    }

    /// Writes `content` to the in-root file `dest`.
    pub fn write_file(&mut self, dest: &str, content: &str, uid: Option<u32>) -> Result<()> {
        let tmp = temp_file_with(content)?;
        let target = self.external_path(dest);
        self.su.copy(&[tmp.path()], &target, uid, None, None)
    }

    /// Copies in-root files to the host directory `dest`, owned by the
    /// invoking user. Returns the host paths.
    pub fn copy_out(&mut self, inside: &[String], dest: &Path) -> Result<Vec<PathBuf>> {
        let sources: Vec<PathBuf> = inside.iter().map(|p| self.external_path(p)).collect();
        let refs: Vec<&Path> = sources.iter().map(PathBuf::as_path).collect();
        let uid = nix::unistd::getuid().as_raw();
        let gid = nix::unistd::getgid().as_raw();
        self.su.copy_out(&refs, dest, uid, gid)?;
        Ok(sources
            .iter()
            .filter_map(|s| s.file_name().map(|n| dest.join(n)))
            .collect())
    }

    pub fn mkdir(&mut self, inside: &[String], uid: Option<u32>) -> Result<()> {
        let paths: Vec<PathBuf> = inside.iter().map(|p| self.external_path(p)).collect();
        let refs: Vec<&Path> = paths.iter().map(PathBuf::as_path).collect();
        self.su.mkdir(&refs, uid, None, None)
    }

    /// Expands a shell pattern of in-root paths.
    pub fn glob(&self, pattern: &str) -> Result<Vec<String>> {
        let external = self.external_path(pattern);
        let mut found = Vec::new();
        for entry in glob::glob(&external.to_string_lossy()).context("Invalid glob pattern")? {
            let path = entry.context("Failed to read glob entry")?;
            if let Ok(rel) = path.strip_prefix(&self.root.path) {
                found.push(format!("/{}", rel.display()));
            }
        }
        found.sort();
        Ok(found)
    }

    /// Exposes the batch spool inside the root at the configured location.
    pub fn make_spool_reachable(&mut self, spool: &Spool) -> Result<RootSpool> {
        let in_root = self.cfg.chroot_spool_dir.clone();
        let host_path = self.external_path(&in_root);
        if host_path.exists() {
            self.su.destroy_root(&host_path)?;
        }
        self.su.cheap_copy(spool.path(), &host_path)?;
        Ok(RootSpool { host_path, in_root })
    }

    pub fn discard_spool(&mut self, spool: RootSpool) -> Result<()> {
        self.su.destroy_root(&spool.host_path)
    }

    pub fn interactive_prepare(&mut self, user: &str) -> Result<()> {
        self.su
            .interactive_prepare(user, &self.root.path, &self.root.arch)
    }

    pub fn interactive_shell(&mut self, user: &str) -> Result<()> {
        self.su
            .interactive_shell(user, &self.root.path, &self.root.arch)
    }
}
