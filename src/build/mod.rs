//! Build orchestration.
//!
//! This module provides:
//! - [`Builder`] - drives a batch of source packages through their roots
//! - [`deliver`] - assembles logs and packages of a finished batch
//! - [`result`] - per-package and per-batch outcomes
//! - [`stage`] - build phases a build may stop at

pub mod deliver;
pub mod result;
pub mod stage;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use time::OffsetDateTime;

use crate::config::TargetConfig;
use crate::error::{is_fatal, Error};
use crate::logstore::LogStore;
use crate::pm::{BuildOutput, PackageInfo, PackageManager};
use crate::root::{validate_root_name, Chroot, RootManager, RootState, LATEST};
use crate::spool::Spool;
use crate::su::interrupt;
use crate::util::current_user;
use crate::util::fs::create_dirs;

pub use result::{BatchReport, BuildResult};
pub use stage::BuildStage;

#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Batch id; generated from the clock and the user when unset.
    pub id: Option<String>,
    /// Build inside this existing root (or `latest`) instead of a fresh
    /// root per package.
    pub reuse: Option<String>,
    /// Stop at this phase and open a shell in the root.
    pub stage: Option<BuildStage>,
    /// Seconds the build step may take.
    pub timeout: Option<u64>,
    pub keep_root: bool,
    /// Continue with the next package after a failure.
    pub keep_building: bool,
    /// Also copy build output to the terminal.
    pub tee: bool,
}

/// `<timefmt(now)>-<user>`.
pub fn batch_id(cfg: &TargetConfig) -> Result<String> {
    let format = time::format_description::parse(&cfg.buildid_timefmt)
        .map_err(|e| Error::Config(format!("invalid buildid-timefmt: {e}")))?;
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    let stamp = now
        .format(&format)
        .with_context(|| format!("formatting the time with '{}'", cfg.buildid_timefmt))?;
    Ok(format!("{stamp}-{}", current_user().0))
}

/// Errors that end the whole batch instead of failing one package.
fn failure_reason(output: &BuildOutput) -> Option<String> {
    if output.success {
        return None;
    }
    let what = if output.timed_out {
        "build timed out"
    } else {
        "build failed"
    };
    Some(match &output.log {
        Some(log) => format!("{what}, see {}", log.display()),
        None => what.to_string(),
    })
}

pub struct Builder<'a> {
    cfg: TargetConfig,
    pm: &'a dyn PackageManager,
    roots: &'a mut RootManager,
}

impl<'a> Builder<'a> {
    pub fn new(pm: &'a dyn PackageManager, roots: &'a mut RootManager) -> Self {
        Self {
            cfg: roots.config().clone(),
            pm,
            roots,
        }
    }

    fn build_user(&self, interactive: bool) -> (String, u32) {
        if interactive {
            current_user()
        } else {
            (self.cfg.build_user.clone(), self.cfg.builder_uid)
        }
    }

    /// Builds `paths` in order. Every source package is checked before
    /// any root is touched.
    pub fn build(&mut self, paths: &[PathBuf], opts: &BuildOptions) -> Result<BatchReport> {
        if paths.is_empty() {
            return Err(Error::Config("no source packages given".into()).into());
        }
        let mut packages = Vec::with_capacity(paths.len());
        for path in paths {
            self.pm
                .check_source_package(path)
                .with_context(|| format!("checking '{}'", path.display()))?;
            packages.push((path.as_path(), self.pm.source_info(path)?));
        }

        let id = match opts.id.as_deref() {
            Some(id) if id != LATEST => {
                validate_root_name(id)?;
                id.to_string()
            }
            _ => batch_id(&self.cfg)?,
        };
        let mut logs = LogStore::open(&self.cfg.logs_dir, &id, opts.tee)?;
        let spool = Spool::create(self.cfg.spool_dir.join(&id), self.pm)?;

        let mut results = Vec::with_capacity(packages.len());
        for (path, package) in packages {
            interrupt::check()?;
            let source_id = package.source_id().replace('/', "_");
            log::info!("working on {source_id}");
            let sublogs = logs.subpackage(&source_id)?;
            let mut result = self.build_one(&id, path, &source_id, package, sublogs, &spool, opts)?;
            if result.success {
                if let Err(e) = spool.put_packages(&result.artifacts, self.pm) {
                    if is_fatal(&e) {
                        return Err(e);
                    }
                    log::error!("{source_id}: adding packages to the spool: {e:#}");
                    result.success = false;
                    result.failure = Some(format!("adding packages to the spool: {e:#}"));
                }
            }
            let stop = !result.success && !opts.keep_building;
            results.push(result);
            if stop {
                log::warn!("{source_id} failed, stopping the batch");
                break;
            }
        }

        let delivery = deliver::deliver(&self.cfg, &id, &results, &logs)?;
        log::info!("done, see {}", delivery.display());
        Ok(BatchReport {
            id,
            results,
            delivery,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn build_one(
        &mut self,
        id: &str,
        source: &Path,
        source_id: &str,
        package: PackageInfo,
        logs: &mut LogStore,
        spool: &Spool,
        opts: &BuildOptions,
    ) -> Result<BuildResult> {
        let interactive = opts.stage.is_some() || self.cfg.interactive;
        let fresh = opts.reuse.is_none();
        let acquired = match &opts.reuse {
            Some(name) => {
                log::info!("preparing existing root {name}");
                self.roots.root_by_name(name, self.pm, Some(interactive))
            }
            None => self
                .roots
                .create_new(&format!("{id}-{source_id}"), self.pm, logs, interactive),
        };
        let mut root = match acquired {
            Ok(root) => root,
            Err(e) if is_fatal(&e) => return Err(e),
            Err(e) => {
                log::error!("{source_id}: {e:#}");
                return Ok(BuildResult::failed(id, source_id, package, format!("{e:#}")));
            }
        };

        let outcome = match self.roots.activate(&mut root) {
            Ok(()) => self.run_in_root(id, &root, fresh, source, logs, spool, opts),
            Err(e) => Err(e),
        };
        if let Err(e) = self.roots.deactivate(&mut root) {
            log::error!(
                "failed to deactivate root {}, filesystems may still be mounted",
                root.name
            );
            return Err(e.context(format!(
                "deactivating root {}, filesystems may still be mounted",
                root.name
            )));
        }
        let keep = opts.keep_root || opts.stage.is_some();
        if fresh && !keep && root.state == RootState::Old {
            if let Err(e) = self.roots.destroy(&root) {
                log::warn!("could not remove root {}: {e:#}", root.name);
            }
        }

        match outcome {
            Ok((output, artifacts)) => Ok(BuildResult {
                id: id.to_string(),
                source_id: source_id.to_string(),
                package,
                success: output.success,
                timed_out: output.timed_out,
                failure: failure_reason(&output),
                artifacts,
            }),
            Err(e) if is_fatal(&e) => Err(e),
            Err(e) => {
                log::error!("{source_id}: {e:#}");
                Ok(BuildResult::failed(id, source_id, package, format!("{e:#}")))
            }
        }
    }

    /// Steps run while the root is active. Returns the build output and the
    /// host paths of the collected packages.
    #[allow(clippy::too_many_arguments)]
    fn run_in_root(
        &mut self,
        id: &str,
        root: &Chroot,
        fresh: bool,
        source: &Path,
        logs: &mut LogStore,
        spool: &Spool,
        opts: &BuildOptions,
    ) -> Result<(BuildOutput, Vec<PathBuf>)> {
        let pm = self.pm;
        let (user, uid) = self.build_user(root.interactive);
        let home = self.cfg.builder_home_for(&user);
        let mut session = self.roots.session(root);

        if fresh {
            session.add_user(&user, uid)?;
            pm.setup_repositories(&mut session, logs, Some(spool))?;
            if root.interactive {
                session.interactive_prepare(&user)?;
            }
        }
        pm.build_prepare(&mut session, &home, uid)?;
        let srcpkg = session.copy_in(source, &home, Some(uid), None)?;
        let recipe = pm.extract_source(&srcpkg, &mut session, &user, &home, logs)?;

        interrupt::check()?;
        log::info!("installing build dependencies");
        pm.install_build_deps(&srcpkg, &mut session, logs, spool)?;

        interrupt::check()?;
        log::info!("building");
        let output = pm.build_source(
            &recipe,
            &mut session,
            logs,
            &user,
            &home,
            opts.stage,
            opts.timeout,
        )?;
        if opts.stage.is_some() {
            log::info!("stopped at stage, opening a shell in {}", root.name);
            session.interactive_shell(&user)?;
            return Ok((output, Vec::new()));
        }

        let base = if output.success {
            &self.cfg.success_dir
        } else {
            &self.cfg.failure_dir
        };
        let dest = base.join(id).join(&self.cfg.built_dir_name);
        create_dirs(&dest)?;
        let artifacts = if output.artifacts.is_empty() {
            Vec::new()
        } else {
            session.copy_out(&output.artifacts, &dest)?
        };
        Ok((output, artifacts))
    }

    /// Opens a shell in a fresh or existing interactive root. Returns the
    /// root's name.
    pub fn shell(&mut self, id: Option<&str>, fresh: bool, tee: bool) -> Result<String> {
        let name = match id {
            Some(id) => id.to_string(),
            None if fresh => format!("{}-shell", batch_id(&self.cfg)?),
            None => LATEST.to_string(),
        };
        let mut logs = LogStore::open(&self.cfg.logs_dir, &name, tee)?;
        let mut root = if fresh {
            self.roots.create_new(&name, self.pm, &mut logs, true)?
        } else {
            self.roots.root_by_name(&name, self.pm, Some(true))?
        };

        let outcome = match self.roots.activate(&mut root) {
            Ok(()) => self.shell_in_root(&root, fresh, &mut logs),
            Err(e) => Err(e),
        };
        self.roots.deactivate(&mut root).with_context(|| {
            format!("deactivating root {}, filesystems may still be mounted", root.name)
        })?;
        outcome.map(|()| root.name)
    }

    fn shell_in_root(&mut self, root: &Chroot, fresh: bool, logs: &mut LogStore) -> Result<()> {
        let pm = self.pm;
        let (user, uid) = self.build_user(true);
        let home = self.cfg.builder_home_for(&user);
        let mut session = self.roots.session(root);
        if fresh {
            pm.setup_repositories(&mut session, logs, None)?;
            session.add_user(&user, uid)?;
            session.interactive_prepare(&user)?;
            pm.build_prepare(&mut session, &home, uid)?;
        }
        session.interactive_shell(&user)
    }

    /// Copies host files into the builder's home of an interactive root.
    /// Returns their in-root paths.
    pub fn put(&mut self, paths: &[PathBuf], id: Option<&str>) -> Result<Vec<String>> {
        let root = self
            .roots
            .root_by_name(id.unwrap_or(LATEST), self.pm, Some(true))?;
        let (user, uid) = self.build_user(true);
        let home = self.cfg.builder_home_for(&user);
        let mut session = self.roots.session(&root);
        let mut placed = Vec::with_capacity(paths.len());
        for path in paths {
            placed.push(session.copy_in(path, &home, Some(uid), None)?);
        }
        Ok(placed)
    }
}
