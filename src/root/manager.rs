//! Root lifecycle.
//!
//! ```text
//!   create_new ──> temp ──activate──> active ──deactivate──> old ──destroy──> (gone)
//!                   ^                   │  └─(keep marker)──> keep
//!                   └── old/keep roots can be activated again
//! ```
//!
//! Which state a root is in is decided only by the directory holding it;
//! every transition is a rename done by the privileged helper.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};

use super::{validate_root_name, Chroot, ChrootSession, RootState, RootStrategy, RootsLayout, LATEST};
use crate::agent::archive::checksum_path;
use crate::config::target::mode_name;
use crate::config::TargetConfig;
use crate::error::{is_fatal, Error};
use crate::logstore::LogStore;
use crate::pm::PackageManager;
use crate::su::SuWrapper;
use crate::util::current_user;
use crate::util::fs::{same_partition, FileLock};

const HOST_ARCH: &str = "host";

pub struct RootManager {
    cfg: TargetConfig,
    layout: RootsLayout,
    strategy: RootStrategy,
    su: SuWrapper,
}

impl RootManager {
    pub fn new(cfg: TargetConfig, su: SuWrapper, strategy: RootStrategy) -> Self {
        let layout = layout_for(&cfg);
        Self {
            cfg,
            layout,
            strategy,
            su,
        }
    }

    pub fn config(&self) -> &TargetConfig {
        &self.cfg
    }

    pub fn layout(&self) -> &RootsLayout {
        &self.layout
    }

    pub fn su(&mut self) -> &mut SuWrapper {
        &mut self.su
    }

    pub fn session<'a>(&'a mut self, root: &'a Chroot) -> ChrootSession<'a> {
        ChrootSession::new(&mut self.su, root, &self.cfg)
    }

    fn root_arch(&self, pm: &dyn PackageManager) -> Result<String> {
        if self.cfg.arch == HOST_ARCH {
            pm.system_arch().context("determining the host architecture")
        } else {
            Ok(self.cfg.arch.clone())
        }
    }

    fn check_new_root_name(&mut self, name: &str) -> Result<()> {
        validate_root_name(name)?;
        match self.layout.find(name) {
            None => Ok(()),
            Some((RootState::Temp, path)) => {
                log::warn!("removing leftover root {}", path.display());
                self.su.destroy_root(&path)
            }
            Some((state, path)) => Err(Error::RootState(format!(
                "the root name {name} conflicts with the existing root at {} ({state})",
                path.display()
            ))
            .into()),
        }
    }

    /// Creates a fresh root named `name` in the temp state (or tmpfs for
    /// volatile roots).
    pub fn create_new(
        &mut self,
        name: &str,
        pm: &dyn PackageManager,
        logs: &mut LogStore,
        interactive: bool,
    ) -> Result<Chroot> {
        self.check_new_root_name(name)?;
        self.layout.check_state_dirs(self.strategy.required_states())?;
        log::info!("creating {} root {name}", mode_name(interactive));
        let root = match self.strategy {
            RootStrategy::Plain => self.create_plain(name, pm, logs, interactive)?,
            RootStrategy::CompressedTemplate => self.create_from_archive(name, pm, logs, interactive)?,
            RootStrategy::Snapshot => self.create_from_snapshot(name, pm, logs, interactive)?,
            RootStrategy::Tmpfs => self.create_tmpfs(name, pm, logs, interactive)?,
        };
        self.layout.update_latest(interactive, root.state, &root.name)?;
        Ok(root)
    }

    fn new_chroot(
        &self,
        name: &str,
        state: RootState,
        pm: &dyn PackageManager,
        interactive: bool,
    ) -> Result<Chroot> {
        Ok(Chroot {
            name: name.to_string(),
            path: self.layout.root_path(state, name),
            arch: self.root_arch(pm)?,
            state,
            interactive,
        })
    }

    fn create_plain(
        &mut self,
        name: &str,
        pm: &dyn PackageManager,
        logs: &mut LogStore,
        interactive: bool,
    ) -> Result<Chroot> {
        let root = self.new_chroot(name, RootState::Temp, pm, interactive)?;
        self.su.mkdir(&[root.path.as_path()], None, None, None)?;
        self.layout.update_latest(interactive, root.state, &root.name)?;
        self.populate(&root, pm, logs)?;
        Ok(root)
    }

    /// Installs the base system into the existing directory of `root`,
    /// writes the marker files and runs the configured post command.
    fn populate(&mut self, root: &Chroot, pm: &dyn PackageManager, logs: &mut LogStore) -> Result<()> {
        pm.create_root(&mut self.su, &root.path, logs, root.interactive)?;
        if !self.cfg.devices.is_empty() {
            self.su.create_devices(&root.path)?;
        }

        let target_file = self.cfg.chroot_target_file.clone();
        let interactive_file = self.cfg.chroot_interactive_file.clone();
        let target_line = format!("{}\n", self.cfg.name);
        let copy_files = self.cfg.root_copy_files.clone();
        {
            let mut session = self.session(root);
            session.write_file(&target_file, &target_line, None)?;
            if root.interactive {
                session.write_file(&interactive_file, "yes\n", None)?;
            }
        }
        for file in &copy_files {
            if !file.exists() {
                log::debug!("{} does not exist, not copying it", file.display());
                continue;
            }
            let dest = root.external_path(&file.to_string_lossy());
            self.su.copy(&[file.as_path()], &dest, None, None, None)?;
        }
        self.su.post_root_command(&root.path, &root.arch)
    }

    fn create_from_archive(
        &mut self,
        name: &str,
        pm: &dyn PackageManager,
        logs: &mut LogStore,
        interactive: bool,
    ) -> Result<Chroot> {
        let archive = self.cfg.template_cache_path(interactive);
        let _lock = FileLock::acquire(&self.cfg.template_lock_path(interactive))?;
        if archive.is_file() && checksum_path(&archive).is_file() {
            let root = self.new_chroot(name, RootState::Temp, pm, interactive)?;
            log::info!("unpacking cached root {}", archive.display());
            self.su.mkdir(&[root.path.as_path()], None, None, None)?;
            match self.su.decompress_root(&archive, &root.path) {
                Ok(()) => return Ok(root),
                Err(e) if is_fatal(&e) => return Err(e),
                Err(e) => {
                    log::warn!("cannot use cached root {}, rebuilding it: {e:#}", archive.display());
                    self.su.destroy_root(&root.path)?;
                }
            }
        } else {
            log::info!("no cached root at {}, creating one", archive.display());
        }

        let root = self.create_plain(name, pm, logs, interactive)?;
        if !self.cfg.chroot_cache_dir.is_dir() {
            self.su
                .mkdir(&[self.cfg.chroot_cache_dir.as_path()], None, None, None)?;
        }
        self.su.compress_root(&root.path, &archive)?;
        Ok(root)
    }

    fn create_from_snapshot(
        &mut self,
        name: &str,
        pm: &dyn PackageManager,
        logs: &mut LogStore,
        interactive: bool,
    ) -> Result<Chroot> {
        let template_path = self.cfg.template_snapshot_path(interactive);
        let _lock = FileLock::acquire(&self.cfg.template_lock_path(interactive))?;
        let marker = crate::util::fs::join_inside(&template_path, &self.cfg.chroot_target_file);
        if !template_path.is_dir() {
            log::info!("creating base subvolume {}", template_path.display());
            self.su.btrfs_create(&template_path)?;
            let template = Chroot {
                name: name.to_string(),
                path: template_path.clone(),
                arch: self.root_arch(pm)?,
                state: RootState::Temp,
                interactive,
            };
            self.populate(&template, pm, logs)?;
        } else if !marker.exists() {
            return Err(Error::RootState(format!(
                "the base subvolume {} is incomplete, remove it to have it recreated",
                template_path.display()
            ))
            .into());
        }

        let root = self.new_chroot(name, RootState::Temp, pm, interactive)?;
        self.su.btrfs_snapshot(&template_path, &root.path)?;
        Ok(root)
    }

    fn create_tmpfs(
        &mut self,
        name: &str,
        pm: &dyn PackageManager,
        logs: &mut LogStore,
        interactive: bool,
    ) -> Result<Chroot> {
        let root = self.new_chroot(name, RootState::Tmpfs, pm, interactive)?;
        self.su.mkdir(&[root.path.as_path()], None, None, None)?;
        self.su.mount_tmpfs(&root.path)?;
        if let Err(e) = self.populate(&root, pm, logs) {
            if let Err(cleanup) = self.discard_tmpfs(&root) {
                log::error!("failed to discard {}: {cleanup:#}", root.path.display());
            }
            return Err(e);
        }
        Ok(root)
    }

    fn move_root(&mut self, root: &mut Chroot, to: RootState) -> Result<()> {
        self.layout.check_state_dirs(&[root.state, to])?;
        let from_dir = self.layout.state_dir(root.state);
        let to_dir = self.layout.state_dir(to);
        if !same_partition(&from_dir, &to_dir)? {
            return Err(Error::RootState(format!(
                "{} and {} must be on the same partition",
                from_dir.display(),
                to_dir.display()
            ))
            .into());
        }
        let dest = self.layout.root_path(to, &root.name);
        if fs::symlink_metadata(&dest).is_ok() {
            return Err(Error::RootState(format!(
                "cannot move root {} to {to}: '{}' already exists",
                root.name,
                dest.display()
            ))
            .into());
        }
        log::debug!("moving root {} from {} to {to}", root.name, root.state);
        self.su.rename(&root.path, &dest)?;
        root.path = dest;
        root.state = to;
        self.layout.update_latest(root.interactive, to, &root.name)
    }

    /// Moves the root to active and mounts its virtual filesystems.
    pub fn activate(&mut self, root: &mut Chroot) -> Result<()> {
        match root.state {
            RootState::Active => {
                return Err(Error::RootState(format!("root {} is already active", root.name)).into())
            }
            RootState::Tmpfs => {}
            _ => self.move_root(root, RootState::Active)?,
        }
        log::debug!("mounting virtual filesystems in {}", root.path.display());
        if let Err(e) = self.su.mount_virtual_filesystems(&root.path, &root.arch) {
            if root.state == RootState::Active {
                if let Err(undo) = self.deactivate(root) {
                    log::error!("failed to deactivate {}: {undo:#}", root.name);
                }
            }
            return Err(e);
        }
        self.layout.update_latest(root.interactive, root.state, &root.name)
    }

    /// Unmounts the root and moves it to keep when it carries the keep
    /// marker, to old otherwise. Volatile roots are discarded.
    pub fn deactivate(&mut self, root: &mut Chroot) -> Result<()> {
        match root.state {
            RootState::Tmpfs => self.discard_tmpfs(root),
            RootState::Active => {
                self.su
                    .umount_virtual_filesystems(&root.path, &root.arch)
                    .with_context(|| {
                        format!("unmounting {}, filesystems may still be mounted", root.path.display())
                    })?;
                let keep = root.external_path(&self.cfg.chroot_keep_file).exists();
                let to = if keep { RootState::Keep } else { RootState::Old };
                self.move_root(root, to)
            }
            other => {
                log::debug!("root {} is in {other}, nothing to deactivate", root.name);
                Ok(())
            }
        }
    }

    fn discard_tmpfs(&mut self, root: &Chroot) -> Result<()> {
        if root.path.exists() {
            self.su.umount_virtual_filesystems(&root.path, &root.arch)?;
            self.su.umount_tmpfs(&root.path)?;
            self.su.destroy_root(&root.path)?;
        }
        self.layout.clear_latest_if(RootState::Tmpfs, &root.name)
    }

    /// Removes an old root and any latest link pointing at it.
    pub fn destroy(&mut self, root: &Chroot) -> Result<()> {
        if root.state != RootState::Old {
            return Err(Error::RootState(format!(
                "cannot destroy root {}, it is in {} and not in {}",
                root.name,
                root.state,
                RootState::Old
            ))
            .into());
        }
        log::info!("destroying root {}", root.name);
        self.su.destroy_root(&root.path)?;
        self.layout.clear_latest_if(RootState::Old, &root.name)
    }

    /// Writes the keep marker; an old root is moved to keep right away.
    pub fn pin(&mut self, root: &mut Chroot) -> Result<()> {
        if root.state == RootState::Tmpfs {
            return Err(Error::RootState(format!("volatile root {} cannot be kept", root.name)).into());
        }
        let keep_file = self.cfg.chroot_keep_file.clone();
        self.session(root).write_file(&keep_file, "yes\n", None)?;
        if root.state == RootState::Old {
            self.move_root(root, RootState::Keep)?;
        }
        Ok(())
    }

    fn existing_root(&self, name: &str, interactive: bool) -> Result<(RootState, PathBuf)> {
        if name == LATEST {
            let (target, path) = self.layout.resolve_latest(interactive)?;
            return Ok((target.state, path));
        }
        validate_root_name(name)?;
        self.layout
            .find(name)
            .ok_or_else(|| Error::RootState(format!("no root named {name}")).into())
    }

    fn is_interactive(&self, path: &Path) -> bool {
        crate::util::fs::join_inside(path, &self.cfg.chroot_interactive_file).exists()
    }

    /// Looks up an existing root. `latest` resolves through the latest link
    /// of the requested mode. With `interactive` set, a root prepared for
    /// the other mode is refused.
    pub fn root_by_name(
        &self,
        name: &str,
        pm: &dyn PackageManager,
        interactive: Option<bool>,
    ) -> Result<Chroot> {
        let (state, path) = self.existing_root(name, interactive.unwrap_or(false))?;
        let real_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::RootState(format!("'{}' is not a root", path.display())))?;
        if state == RootState::Tmpfs {
            return Err(Error::RootState(format!(
                "volatile root {real_name} cannot be reused"
            ))
            .into());
        }
        let marked = self.is_interactive(&path);
        match interactive {
            Some(true) if !marked => {
                return Err(Error::RootState(format!(
                    "the root {real_name} is not prepared for interactive use"
                ))
                .into())
            }
            Some(false) if marked => {
                return Err(Error::RootState(format!(
                    "the root {real_name} is prepared for interactive use"
                ))
                .into())
            }
            _ => {}
        }
        Ok(Chroot {
            name: real_name,
            path,
            arch: self.root_arch(pm)?,
            state,
            interactive: marked,
        })
    }

    pub fn list_roots(&self) -> Result<Vec<(RootState, String)>> {
        self.layout.list_roots()
    }

    /// Target recorded in an existing root, if it can be found and read.
    pub fn guess_target_name(&self, name: &str, interactive: bool) -> Option<String> {
        read_target_marker(&self.layout, &self.cfg, name, interactive)
    }

    /// Removes old roots whose ctime is older than `max_age`, sparing any
    /// root a latest link points at. Returns the candidates.
    pub fn gc(&mut self, max_age: Duration, dry_run: bool) -> Result<Vec<PathBuf>> {
        use std::os::unix::fs::MetadataExt;

        let protected = self.layout.all_latest_targets()?;
        let now = SystemTime::now();
        let mut candidates = Vec::new();
        for name in self.layout.roots_in(RootState::Old)? {
            if protected
                .iter()
                .any(|t| t.state == RootState::Old && t.name == name)
            {
                log::debug!("keeping {name}, a latest link points at it");
                continue;
            }
            let path = self.layout.root_path(RootState::Old, &name);
            let md = fs::symlink_metadata(&path)
                .with_context(|| format!("reading '{}'", path.display()))?;
            let changed = SystemTime::UNIX_EPOCH + Duration::from_secs(md.ctime().max(0) as u64);
            let age = now.duration_since(changed).unwrap_or_default();
            if age < max_age {
                continue;
            }
            if dry_run {
                log::info!("would remove {}", path.display());
            } else {
                log::info!("removing {}", path.display());
                self.su.destroy_root(&path)?;
            }
            candidates.push(path);
        }
        Ok(candidates)
    }

    pub fn test_sudo(&mut self) -> Result<()> {
        self.su.test_sudo()
    }
}

/// Roots layout of `cfg` as seen by the invoking user.
pub fn layout_for(cfg: &TargetConfig) -> RootsLayout {
    RootsLayout::new(
        cfg.roots_path.clone(),
        current_user().0,
        cfg.latest_build_suffix.clone(),
        cfg.latest_interactive_suffix.clone(),
    )
}

/// Reads the target marker of root `name` under `layout`.
pub fn read_target_marker(
    layout: &RootsLayout,
    cfg: &TargetConfig,
    name: &str,
    interactive: bool,
) -> Option<String> {
    let path = if name == LATEST {
        layout.resolve_latest(interactive).ok()?.1
    } else {
        layout.find(name)?.1
    };
    let marker = crate::util::fs::join_inside(&path, &cfg.chroot_target_file);
    match fs::read_to_string(&marker) {
        Ok(raw) => raw.lines().next().map(|l| l.trim().to_string()).filter(|l| !l.is_empty()),
        Err(e) => {
            log::debug!("cannot read {}: {e}", marker.display());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::root::LatestTarget;
    use crate::testing::{self, FakePackageManager};
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        manager: RootManager,
        logs: LogStore,
        pm: FakePackageManager,
    }

    fn fixture_for(strategy: RootStrategy, adjust: impl FnOnce(&mut TargetConfig)) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let mut cfg = testing::target_config(tmp.path());
        adjust(&mut cfg);
        let su = testing::in_process_su(&cfg);
        let logs = LogStore::open(&cfg.logs_dir, "batch", false).unwrap();
        Fixture {
            manager: RootManager::new(cfg, su, strategy),
            logs,
            pm: FakePackageManager::default(),
            _tmp: tmp,
        }
    }

    fn fixture() -> Fixture {
        fixture_for(RootStrategy::Plain, |_| {})
    }

    #[test]
    fn test_lifecycle_and_latest_link() {
        let mut f = fixture();
        let layout = f.manager.layout().clone();

        let mut root = f.manager.create_new("rel1", &f.pm, &mut f.logs, false).unwrap();
        assert_eq!(root.state, RootState::Temp);
        assert!(layout.root_path(RootState::Temp, "rel1").join("etc").is_dir());
        assert_eq!(
            layout.read_latest(false).unwrap(),
            Some(LatestTarget::new(RootState::Temp, "rel1"))
        );
        assert_eq!(f.manager.guess_target_name("rel1", false).as_deref(), Some("t"));

        f.manager.activate(&mut root).unwrap();
        assert_eq!(root.path, layout.root_path(RootState::Active, "rel1"));
        assert!(!layout.root_path(RootState::Temp, "rel1").exists());
        assert!(f.manager.activate(&mut root).is_err());

        f.manager.deactivate(&mut root).unwrap();
        assert_eq!(root.state, RootState::Old);
        assert!(root.path.is_dir());
        let (latest, path) = layout.resolve_latest(false).unwrap();
        assert_eq!(latest, LatestTarget::new(RootState::Old, "rel1"));
        assert_eq!(path, root.path);

        f.manager.destroy(&root).unwrap();
        assert!(!root.path.exists());
        assert_eq!(layout.read_latest(false).unwrap(), None);
    }

    #[test]
    fn test_keep_marker_routes_to_keep() {
        let mut f = fixture();
        let mut root = f.manager.create_new("pinned", &f.pm, &mut f.logs, false).unwrap();
        f.manager.activate(&mut root).unwrap();
        f.manager.pin(&mut root).unwrap();
        f.manager.pin(&mut root).unwrap();
        f.manager.deactivate(&mut root).unwrap();
        assert_eq!(root.state, RootState::Keep);

        let err = f.manager.destroy(&root).unwrap_err();
        assert!(matches!(Error::find(&err), Some(Error::RootState(_))));
        assert!(root.path.is_dir());
    }

    #[test]
    fn test_reuse_checks_mode_and_names() {
        let mut f = fixture();
        let mut root = f.manager.create_new("shell", &f.pm, &mut f.logs, true).unwrap();
        f.manager.activate(&mut root).unwrap();
        f.manager.deactivate(&mut root).unwrap();

        assert!(f.manager.root_by_name("shell", &f.pm, Some(false)).is_err());
        let found = f.manager.root_by_name("latest", &f.pm, Some(true)).unwrap();
        assert_eq!(found.name, "shell");
        assert_eq!(found.state, RootState::Old);
        assert!(found.interactive);

        assert!(f.manager.create_new("shell", &f.pm, &mut f.logs, true).is_err());
        assert!(f.manager.create_new("latest", &f.pm, &mut f.logs, false).is_err());
        assert!(f.manager.create_new("a/b", &f.pm, &mut f.logs, false).is_err());
        assert!(f.manager.root_by_name("missing", &f.pm, None).is_err());
        assert_eq!(
            f.manager.list_roots().unwrap(),
            vec![(RootState::Old, "shell".to_string())]
        );
    }

    #[test]
    fn test_gc_spares_latest() {
        let mut f = fixture();
        for name in ["a", "b"] {
            let mut root = f.manager.create_new(name, &f.pm, &mut f.logs, false).unwrap();
            f.manager.activate(&mut root).unwrap();
            f.manager.deactivate(&mut root).unwrap();
        }
        let old = f.manager.layout().state_dir(RootState::Old);

        let dry = f.manager.gc(Duration::ZERO, true).unwrap();
        assert_eq!(dry, vec![old.join("a")]);
        assert!(old.join("a").is_dir());

        assert!(f.manager.gc(Duration::from_secs(3600), false).unwrap().is_empty());
        f.manager.gc(Duration::ZERO, false).unwrap();
        assert!(!old.join("a").exists());
        assert!(old.join("b").is_dir());
    }

    #[test]
    fn test_cached_template_is_reused_and_rebuilt_when_corrupt() {
        let mut f = fixture_for(RootStrategy::CompressedTemplate, |_| {});
        let logs_dir = f.manager.config().logs_dir.clone();
        let archive = f.manager.config().template_cache_path(false);
        let sidecar = checksum_path(&archive);
        let installed = |batch: &str| logs_dir.join(batch).join("chroot-install.log").exists();

        f.manager.create_new("c1", &f.pm, &mut f.logs, false).unwrap();
        assert!(installed("batch"));
        assert!(archive.is_file());
        assert!(sidecar.is_file());

        let mut second = LogStore::open(&logs_dir, "second", false).unwrap();
        let root = f.manager.create_new("c2", &f.pm, &mut second, false).unwrap();
        assert!(!installed("second"));
        assert!(root.path.join("etc").is_dir());
        assert_eq!(f.manager.guess_target_name("c2", false).as_deref(), Some("t"));

        fs::write(&sidecar, "0000\n").unwrap();
        let mut third = LogStore::open(&logs_dir, "third", false).unwrap();
        let root = f.manager.create_new("c3", &f.pm, &mut third, false).unwrap();
        assert!(installed("third"));
        assert!(root.path.join("etc").is_dir());
        let sum = crate::util::fs::sha256_file(&archive).unwrap();
        assert_eq!(fs::read_to_string(&sidecar).unwrap().trim(), sum);
    }

    #[test]
    fn test_tmpfs_root_is_discarded_on_deactivation() {
        let mut f = fixture_for(RootStrategy::Tmpfs, |cfg| {
            cfg.tmpfs_mount_command = vec!["true".into()];
            cfg.tmpfs_umount_command = vec!["true".into()];
        });
        let layout = f.manager.layout().clone();

        let mut root = f.manager.create_new("vol", &f.pm, &mut f.logs, false).unwrap();
        assert_eq!(root.state, RootState::Tmpfs);
        assert_eq!(root.path, layout.root_path(RootState::Tmpfs, "vol"));
        assert!(root.path.join("etc").is_dir());

        f.manager.activate(&mut root).unwrap();
        assert_eq!(root.state, RootState::Tmpfs);
        assert_eq!(
            layout.read_latest(false).unwrap(),
            Some(LatestTarget::new(RootState::Tmpfs, "vol"))
        );
        let err = f.manager.root_by_name("vol", &f.pm, None).unwrap_err();
        assert!(matches!(Error::find(&err), Some(Error::RootState(_))));
        assert!(f.manager.root_by_name("latest", &f.pm, Some(false)).is_err());
        assert!(f.manager.pin(&mut root).is_err());

        f.manager.deactivate(&mut root).unwrap();
        assert!(!root.path.exists());
        assert_eq!(layout.read_latest(false).unwrap(), None);
        assert!(layout.roots_in(RootState::Tmpfs).unwrap().is_empty());
    }
}
