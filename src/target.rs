//! Targets and the top-level facade used by the CLI.
//!
//! A [`Target`] bundles one target's configuration with the package
//! manager, privileged wrapper and root strategy its selectors name. The
//! implementations are looked up in [`Registries`], built once at startup.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use nix::unistd::{access, getgroups, AccessFlags, Group};

use crate::build::{BatchReport, BuildOptions, Builder};
use crate::config::{Config, TargetConfig};
use crate::error::Error;
use crate::pm::{self, PackageManager, PmFactory};
use crate::registry::Registry;
use crate::root::manager::{layout_for, read_target_marker};
use crate::root::strategy::{self, RootFactory};
use crate::root::{Chroot, RootManager, RootState, RootStrategy};
use crate::su::{self, SuFactory, SuWrapper};
use crate::util::current_user;

pub struct Registries {
    pub roots: Registry<RootFactory>,
    pub pms: Registry<PmFactory>,
    pub sus: Registry<SuFactory>,
}

impl Registries {
    pub fn standard() -> Self {
        Self {
            roots: strategy::standard_registry(),
            pms: pm::standard_registry(),
            sus: su::standard_registry(),
        }
    }
}

/// Group membership the helper requires.
pub fn check_group(cfg: &TargetConfig) -> Result<()> {
    log::debug!("checking membership of the {} group", cfg.jurt_group);
    let group = Group::from_name(&cfg.jurt_group)
        .with_context(|| format!("looking up group {}", cfg.jurt_group))?
        .ok_or_else(|| {
            Error::Setup(format!(
                "there is no system group '{}', check your jurt installation (see jurt-setup)",
                cfg.jurt_group
            ))
        })?;
    let (user, _) = current_user();
    if !group.mem.iter().any(|m| m == &user) {
        return Err(Error::Setup(format!(
            "your user {user} must be a member of the {} group, run (as root) jurt-setup -u {user}",
            cfg.jurt_group
        ))
        .into());
    }
    if !getgroups().context("reading supplementary groups")?.contains(&group.gid) {
        return Err(Error::Setup(format!(
            "you are not effectively running as a member of the {} group, restart your session",
            cfg.jurt_group
        ))
        .into());
    }
    Ok(())
}

/// Directories the controller writes to as the invoking user.
pub fn check_writable(cfg: &TargetConfig) -> Result<()> {
    for path in [
        &cfg.roots_path,
        &cfg.spool_dir,
        &cfg.logs_dir,
        &cfg.failure_dir,
        &cfg.success_dir,
    ] {
        log::debug!("checking write permission for {}", path.display());
        if access(path.as_path(), AccessFlags::W_OK).is_err() {
            return Err(Error::Setup(format!(
                "{} is not writable for you, check your jurt installation",
                path.display()
            ))
            .into());
        }
    }
    Ok(())
}

pub struct Target {
    cfg: TargetConfig,
    pm: Box<dyn PackageManager>,
    roots: RootManager,
}

impl Target {
    pub fn new(cfg: TargetConfig, registries: &Registries) -> Result<Self> {
        let pm_factory = registries.pms.get(&cfg.pm_type)?;
        let pm = pm_factory(&cfg)?;
        let su = (registries.sus.get(&cfg.su_type)?)(&cfg, pm_factory(&cfg)?)?;
        let strategy = (registries.roots.get(&cfg.root_type)?)(&cfg)?;
        Ok(Self::with_parts(cfg, pm, su, strategy))
    }

    pub fn with_parts(
        cfg: TargetConfig,
        pm: Box<dyn PackageManager>,
        su: SuWrapper,
        strategy: RootStrategy,
    ) -> Self {
        let roots = RootManager::new(cfg.clone(), su, strategy);
        Self { cfg, pm, roots }
    }

    pub fn name(&self) -> &str {
        &self.cfg.name
    }

    pub fn config(&self) -> &TargetConfig {
        &self.cfg
    }

    pub fn roots(&mut self) -> &mut RootManager {
        &mut self.roots
    }

    pub fn builder(&mut self) -> Builder<'_> {
        Builder::new(self.pm.as_ref(), &mut self.roots)
    }

    pub fn build(&mut self, paths: &[PathBuf], opts: &BuildOptions) -> Result<BatchReport> {
        self.builder().build(paths, opts)
    }

    pub fn shell(&mut self, id: Option<&str>, fresh: bool, tee: bool) -> Result<String> {
        if !self.cfg.allow_interactive_shell {
            return Err(Error::Config(format!(
                "interactive shells are disabled for target {}",
                self.cfg.name
            ))
            .into());
        }
        self.builder().shell(id, fresh, tee)
    }

    pub fn put(&mut self, paths: &[PathBuf], id: Option<&str>) -> Result<Vec<String>> {
        self.builder().put(paths, id)
    }

    /// Pins root `name` so deactivation moves it to keep.
    pub fn keep(&mut self, name: &str) -> Result<Chroot> {
        let mut root = self.roots.root_by_name(name, self.pm.as_ref(), None)?;
        self.roots.pin(&mut root)?;
        Ok(root)
    }

    pub fn gc(&mut self, max_age: Option<Duration>, dry_run: bool) -> Result<Vec<PathBuf>> {
        let max_age = max_age.unwrap_or_else(|| self.cfg.max_old_root_age());
        self.roots.gc(max_age, dry_run)
    }

    pub fn check_permissions(&mut self) -> Result<()> {
        check_group(&self.cfg)?;
        check_writable(&self.cfg)?;
        self.roots.test_sudo()
    }
}

/// Entry point of the library: picks targets and runs operations on them.
pub struct Jurt {
    config: Config,
    registries: Registries,
}

impl Jurt {
    pub fn new(config: Config) -> Self {
        Self::with_registries(config, Registries::standard())
    }

    pub fn with_registries(config: Config, registries: Registries) -> Self {
        Self { config, registries }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn target_names(&self) -> Vec<String> {
        self.config.target_names()
    }

    /// Target `name`; without one, the target recorded in root `root`,
    /// then the configured default.
    pub fn target(&self, name: Option<&str>, root: Option<&str>, interactive: bool) -> Result<Target> {
        if self.config.target_names().is_empty() {
            return Err(Error::Setup(
                "no build targets configured, see /etc/jurt/jurt.toml".into(),
            )
            .into());
        }
        let name = match name {
            Some(name) => name.to_string(),
            None => match root.and_then(|r| self.guess_target(r, interactive)) {
                Some(guessed) => {
                    log::debug!("using target {guessed} recorded in root {}", root.unwrap_or_default());
                    guessed
                }
                None => self.config.default_target().ok_or_else(|| {
                    Error::Config(
                        "no target name provided and no default target set in configuration"
                            .into(),
                    )
                })?,
            },
        };
        let mut target = Target::new(self.config.target(&name)?, &self.registries)?;
        if self.config.check_permissions() {
            target.check_permissions()?;
        }
        Ok(target)
    }

    fn guess_target(&self, root: &str, interactive: bool) -> Option<String> {
        let targets = match self.config.targets() {
            Ok(targets) => targets,
            Err(e) => {
                log::debug!("cannot load targets: {e:#}");
                return None;
            }
        };
        targets
            .iter()
            .find_map(|cfg| read_target_marker(&layout_for(cfg), cfg, root, interactive))
    }

    pub fn build(
        &self,
        paths: &[PathBuf],
        target: Option<&str>,
        opts: &BuildOptions,
    ) -> Result<BatchReport> {
        let mut target = self.target(target, opts.reuse.as_deref(), opts.stage.is_some())?;
        target.build(paths, opts)
    }

    pub fn shell(&self, target: Option<&str>, id: Option<&str>, fresh: bool, tee: bool) -> Result<String> {
        let lookup = if fresh { None } else { id.or(Some(crate::root::LATEST)) };
        self.target(target, lookup, true)?.shell(id, fresh, tee)
    }

    pub fn put(&self, target: Option<&str>, paths: &[PathBuf], id: Option<&str>) -> Result<Vec<String>> {
        let lookup = id.unwrap_or(crate::root::LATEST);
        self.target(target, Some(lookup), true)?.put(paths, id)
    }

    /// Roots of the given target, or of every target sharing distinct
    /// roots directories.
    pub fn list_roots(&self, target: Option<&str>) -> Result<Vec<(RootState, String)>> {
        let mut all = Vec::new();
        for cfg in self.selected(target)? {
            all.extend(layout_for(&cfg).list_roots()?);
        }
        Ok(all)
    }

    pub fn keep(&self, target: Option<&str>, root: &str) -> Result<Chroot> {
        self.target(target, Some(root), false)?.keep(root)
    }

    pub fn gc(&self, target: Option<&str>, max_age: Option<Duration>, dry_run: bool) -> Result<Vec<PathBuf>> {
        let mut removed = Vec::new();
        for cfg in self.selected(target)? {
            let mut target = Target::new(cfg, &self.registries)?;
            removed.extend(target.gc(max_age, dry_run)?);
        }
        Ok(removed)
    }

    /// Runs the full permission check on every target, returning the names
    /// of the targets checked.
    pub fn check_permissions(&self) -> Result<Vec<String>> {
        let targets = self.config.targets()?;
        if targets.is_empty() {
            return Err(Error::Setup(
                "no targets configured, at least one is needed for testing".into(),
            )
            .into());
        }
        let mut checked = Vec::new();
        for cfg in targets {
            log::info!("testing target {}", cfg.name);
            let name = cfg.name.clone();
            Target::new(cfg, &self.registries)?.check_permissions()?;
            checked.push(name);
        }
        Ok(checked)
    }

    /// `target`, or every target with a distinct roots directory.
    fn selected(&self, target: Option<&str>) -> Result<Vec<TargetConfig>> {
        if let Some(name) = target {
            return Ok(vec![self.config.target(name)?]);
        }
        let mut seen: BTreeSet<PathBuf> = BTreeSet::new();
        Ok(self
            .config
            .targets()?
            .into_iter()
            .filter(|cfg| seen.insert(cfg.roots_path.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::logstore::LogStore;
    use crate::testing;
    use tempfile::TempDir;

    fn test_registries() -> Registries {
        Registries {
            roots: strategy::standard_registry(),
            pms: testing::pm_registry(),
            sus: su::standard_registry(),
        }
    }

    #[test]
    fn test_target_selection() {
        let tmp = TempDir::new().unwrap();
        let cfg = testing::target_config(tmp.path());
        let mut config = testing::config(tmp.path());
        let jurt = Jurt::with_registries(config.clone(), test_registries());

        assert_eq!(jurt.target(None, None, false).unwrap().name(), "t");
        assert_eq!(jurt.target(Some("t"), None, false).unwrap().name(), "t");
        assert!(jurt.target(Some("nope"), None, false).is_err());

        let mut target = jurt.target(None, None, false).unwrap();
        let pm = testing::FakePackageManager::default();
        let mut logs = LogStore::open(&cfg.logs_dir, "sel", false).unwrap();
        target.roots().create_new("r1", &pm, &mut logs, false).unwrap();

        config.set_option("jurt.default-target=nope").unwrap();
        let jurt = Jurt::with_registries(config, test_registries());
        assert_eq!(jurt.target(None, Some("r1"), false).unwrap().name(), "t");
        assert!(jurt.target(None, Some("other"), false).is_err());
        assert_eq!(
            jurt.list_roots(None).unwrap(),
            Vec::<(RootState, String)>::new()
        );
    }

    #[test]
    fn test_unknown_selector_is_a_config_error() {
        let tmp = TempDir::new().unwrap();
        let mut config = testing::config(tmp.path());
        config.set_option("target.t.root-type=chroot-with-zfs").unwrap();
        let jurt = Jurt::with_registries(config, test_registries());
        let err = jurt.target(Some("t"), None, false).err().unwrap();
        assert!(matches!(Error::find(&err), Some(Error::Config(_))));
    }

    #[test]
    fn test_writable_dirs() {
        let tmp = TempDir::new().unwrap();
        let cfg = testing::target_config(tmp.path());
        let err = check_writable(&cfg).unwrap_err();
        assert!(matches!(Error::find(&err), Some(Error::Setup(_))));

        for dir in [&cfg.spool_dir, &cfg.logs_dir, &cfg.failure_dir, &cfg.success_dir] {
            fs::create_dir_all(dir).unwrap();
        }
        check_writable(&cfg).unwrap();
    }
}
