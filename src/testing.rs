//! Test doubles: a package manager that fakes every packaging step with
//! plain files, and a target configuration that runs the privileged
//! operations in-process without chroot, su or device nodes.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::build::stage::BuildStage;
use crate::config::{Config, TargetConfig};
use crate::error::Error;
use crate::logstore::LogStore;
use crate::pm::{BuildOutput, PackageInfo, PackageManager, PmFactory};
use crate::registry::Registry;
use crate::root::{ChrootSession, RootState};
use crate::spool::Spool;
use crate::su::SuWrapper;

#[derive(Debug, Default)]
pub struct FakePackageManager {
    fail_builds: BTreeSet<String>,
    fail_deps: BTreeSet<String>,
    time_out: BTreeSet<String>,
    broken_spool: bool,
    indexed: RefCell<Vec<PathBuf>>,
}

impl FakePackageManager {
    pub fn failing_builds(mut self, names: &[&str]) -> Self {
        self.fail_builds.extend(names.iter().map(|n| n.to_string()));
        self
    }

    pub fn failing_deps(mut self, names: &[&str]) -> Self {
        self.fail_deps.extend(names.iter().map(|n| n.to_string()));
        self
    }

    pub fn timing_out(mut self, names: &[&str]) -> Self {
        self.time_out.extend(names.iter().map(|n| n.to_string()));
        self
    }

    /// Indexing fails once the directory holds any package.
    pub fn failing_spool(mut self) -> Self {
        self.broken_spool = true;
        self
    }

    /// Directories passed to `update_repository_metadata`, in call order.
    pub fn indexed(&self) -> Vec<PathBuf> {
        self.indexed.borrow().clone()
    }
}

fn split_nvr(file_name: &str) -> Option<(String, String, String)> {
    let stem = file_name.strip_suffix(".src.rpm")?;
    let mut parts = stem.rsplitn(3, '-');
    let release = parts.next()?;
    let version = parts.next()?;
    let name = parts.next()?;
    Some((name.to_string(), version.to_string(), release.to_string()))
}

fn recipe_name(path: &str) -> String {
    Path::new(path)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

impl PackageManager for FakePackageManager {
    fn system_arch(&self) -> Result<String> {
        Ok("x86_64".to_string())
    }

    fn create_root(
        &self,
        su: &mut SuWrapper,
        path: &Path,
        logs: &mut LogStore,
        interactive: bool,
    ) -> Result<()> {
        let mut log = logs.output_handler("chroot-install")?;
        writeln!(log, "installing base system (interactive: {interactive})")?;
        log.close()?;
        let dirs = [path.join("etc"), path.join("home"), path.join("tmp")];
        let refs: Vec<&Path> = dirs.iter().map(PathBuf::as_path).collect();
        su.mkdir(&refs, None, None, None)
    }

    fn install(
        &self,
        _packages: &[String],
        _session: &mut ChrootSession<'_>,
        _logs: &mut LogStore,
        _logname: &str,
    ) -> Result<()> {
        Ok(())
    }

    fn setup_repositories(
        &self,
        _session: &mut ChrootSession<'_>,
        _logs: &mut LogStore,
        _spool: Option<&Spool>,
    ) -> Result<()> {
        Ok(())
    }

    fn build_prepare(&self, session: &mut ChrootSession<'_>, homedir: &str, uid: u32) -> Result<()> {
        session.mkdir(
            &[format!("{homedir}/SPECS"), format!("{homedir}/RPMS")],
            Some(uid),
        )
    }

    fn extract_source(
        &self,
        srcpkg: &str,
        session: &mut ChrootSession<'_>,
        _username: &str,
        homedir: &str,
        _logs: &mut LogStore,
    ) -> Result<String> {
        let file_name = Path::new(srcpkg)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let (name, _, _) = split_nvr(&file_name)
            .ok_or_else(|| Error::package_manager(format!("cannot unpack {srcpkg}"), None))?;
        let spec = format!("{homedir}/SPECS/{name}.spec");
        session.write_file(&spec, &format!("Name: {name}\n"), None)?;
        Ok(spec)
    }

    fn install_build_deps(
        &self,
        srcpkg: &str,
        session: &mut ChrootSession<'_>,
        _logs: &mut LogStore,
        spool: &Spool,
    ) -> Result<()> {
        let reachable = session.make_spool_reachable(spool)?;
        session.discard_spool(reachable)?;
        let file_name = Path::new(srcpkg)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match split_nvr(&file_name) {
            Some((name, _, _)) if self.fail_deps.contains(&name) => Err(Error::package_manager(
                "failed to install build dependencies",
                None,
            )
            .into()),
            _ => Ok(()),
        }
    }

    fn build_source(
        &self,
        recipe: &str,
        session: &mut ChrootSession<'_>,
        logs: &mut LogStore,
        _username: &str,
        homedir: &str,
        stage: Option<BuildStage>,
        timeout: Option<u64>,
    ) -> Result<BuildOutput> {
        let name = recipe_name(recipe);
        let mut log = logs.output_handler("build")?;
        let location = log.path().to_path_buf();
        let failed = |timed_out| BuildOutput {
            success: false,
            timed_out,
            artifacts: Vec::new(),
            log: Some(location.clone()),
        };
        if self.time_out.contains(&name) {
            log.note(&format!("===== timeout after {:?}\n", timeout))?;
            log.close()?;
            return Ok(failed(true));
        }
        if self.fail_builds.contains(&name) {
            log.note("error: build failed\n")?;
            log.close()?;
            return Ok(failed(false));
        }
        log.note(&format!("building {name}\n"))?;
        log.close()?;
        if stage.is_none() {
            session.write_file(&format!("{homedir}/RPMS/{name}-1.0-1.x86_64.rpm"), "rpm", None)?;
        }
        Ok(BuildOutput {
            success: true,
            timed_out: false,
            artifacts: session.glob(&format!("{homedir}/RPMS/{name}-*.rpm"))?,
            log: Some(location),
        })
    }

    fn update_repository_metadata(&self, path: &Path) -> Result<()> {
        self.indexed.borrow_mut().push(path.to_path_buf());
        if self.broken_spool && fs::read_dir(path)?.next().is_some() {
            return Err(Error::package_manager(
                format!("cannot index {}", path.display()),
                None,
            )
            .into());
        }
        Ok(())
    }

    fn source_info(&self, path: &Path) -> Result<PackageInfo> {
        let invalid = || Error::package_manager(format!("{} is not a source package", path.display()), None);
        if !path.is_file() {
            return Err(invalid().into());
        }
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let (name, version, release) = split_nvr(&file_name).ok_or_else(invalid)?;
        Ok(PackageInfo {
            name,
            version,
            release,
            arch: None,
        })
    }

    fn valid_binary(&self, path: &Path) -> bool {
        let name = path.to_string_lossy();
        name.ends_with(".rpm") && !name.ends_with(".src.rpm")
    }

    fn validate_cmd_args(&self, _pm: &str, _args: &[String]) -> Result<()> {
        Ok(())
    }

    fn cmd_args(&self, _pm: &str, args: &[String]) -> Result<Vec<String>> {
        let mut cmd = vec!["true".to_string()];
        cmd.extend(args.iter().cloned());
        Ok(cmd)
    }

    fn allowed_pm_commands(&self) -> Vec<String> {
        vec!["/bin/rpm".to_string()]
    }
}

fn fake_factory(_cfg: &TargetConfig) -> Result<Box<dyn PackageManager>> {
    Ok(Box::new(FakePackageManager::default()))
}

pub fn pm_registry() -> Registry<PmFactory> {
    let mut reg: Registry<PmFactory> = Registry::new("package manager type");
    reg.register("fake", fake_factory);
    reg
}

/// Configuration with one target `t` storing everything below `base`.
pub fn config(base: &Path) -> Config {
    let uid = nix::unistd::geteuid().as_raw();
    let mut config = Config::new().unwrap();
    config
        .merge_str(&format!(
            r#"
[jurt]
default-target = "t"
check-permissions = false

[target.t]
jurt-base-dir = "{base}"
root-type = "chroot"
pm-type = "fake"
su-type = "in-process"
builder-uid = {uid}
delivery-dir = "{base}/delivery"
adduser-command = ["true"]
chroot-command = []
su-command = []
su-for-post-command = []
root-post-command = ""
root-copy-files = []
mountpoints = []
devices = []
"#,
            base = base.display()
        ))
        .unwrap();
    config
}

/// Target `t` of [`config`] with its state directories created.
pub fn target_config(base: &Path) -> TargetConfig {
    let cfg = config(base).target("t").unwrap();
    for state in RootState::ALL {
        fs::create_dir_all(cfg.state_dir(state)).unwrap();
    }
    cfg
}

pub fn in_process_su(cfg: &TargetConfig) -> SuWrapper {
    SuWrapper::in_process(cfg, Box::new(FakePackageManager::default())).unwrap()
}

/// A fake source package file named like `name-version-release.src.rpm`.
pub fn source_package(dir: &Path, nvr: &str) -> PathBuf {
    let path = dir.join(format!("{nvr}.src.rpm"));
    fs::write(&path, nvr).unwrap();
    path
}
