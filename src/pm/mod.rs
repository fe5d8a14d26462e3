//! Package manager abstraction.
//!
//! The build and root logic only talk to [`PackageManager`]; the concrete
//! implementation is picked by the target's `pm-type` through the registry
//! returned by [`standard_registry`].

pub mod repos;
pub mod urpmi;

use std::path::Path;

use anyhow::Result;
use serde::Serialize;

use crate::build::stage::BuildStage;
use crate::config::TargetConfig;
use crate::logstore::LogStore;
use crate::registry::Registry;
use crate::root::ChrootSession;
use crate::spool::Spool;
use crate::su::SuWrapper;

/// Identity of a (source) package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageInfo {
    pub name: String,
    pub version: String,
    pub release: String,
    pub arch: Option<String>,
}

impl PackageInfo {
    /// `name-version-release`, used to name per-package roots and logs.
    pub fn source_id(&self) -> String {
        format!("{}-{}-{}", self.name, self.version, self.release)
    }
}

/// What a build attempt produced.
#[derive(Debug, Clone, Default)]
pub struct BuildOutput {
    pub success: bool,
    pub timed_out: bool,
    /// Absolute in-root paths of the produced packages.
    pub artifacts: Vec<String>,
    pub log: Option<std::path::PathBuf>,
}

pub trait PackageManager {
    /// Architecture of the host as the package tools name it.
    fn system_arch(&self) -> Result<String>;

    /// Installs the base system into the empty directory `path`.
    fn create_root(
        &self,
        su: &mut SuWrapper,
        path: &Path,
        logs: &mut LogStore,
        interactive: bool,
    ) -> Result<()>;

    fn install(
        &self,
        packages: &[String],
        session: &mut ChrootSession<'_>,
        logs: &mut LogStore,
        logname: &str,
    ) -> Result<()>;

    /// Makes the configured repositories, plus the batch spool when given
    /// and non-empty, available inside the root.
    fn setup_repositories(
        &self,
        session: &mut ChrootSession<'_>,
        logs: &mut LogStore,
        spool: Option<&Spool>,
    ) -> Result<()>;

    /// Creates the build tree and macros in the builder's home.
    fn build_prepare(
        &self,
        session: &mut ChrootSession<'_>,
        homedir: &str,
        uid: u32,
    ) -> Result<()>;

    /// Unpacks the source package; returns the in-root path of the build
    /// recipe.
    fn extract_source(
        &self,
        srcpkg: &str,
        session: &mut ChrootSession<'_>,
        username: &str,
        homedir: &str,
        logs: &mut LogStore,
    ) -> Result<String>;

    fn install_build_deps(
        &self,
        srcpkg: &str,
        session: &mut ChrootSession<'_>,
        logs: &mut LogStore,
        spool: &Spool,
    ) -> Result<()>;

    /// Runs the build. A failed or timed out build is reported through
    /// [`BuildOutput`], not as an error.
    #[allow(clippy::too_many_arguments)]
    fn build_source(
        &self,
        recipe: &str,
        session: &mut ChrootSession<'_>,
        logs: &mut LogStore,
        username: &str,
        homedir: &str,
        stage: Option<BuildStage>,
        timeout: Option<u64>,
    ) -> Result<BuildOutput>;

    /// Regenerates the repository index of a spool directory.
    fn update_repository_metadata(&self, path: &Path) -> Result<()>;

    fn source_info(&self, path: &Path) -> Result<PackageInfo>;

    fn check_source_package(&self, path: &Path) -> Result<()> {
        self.source_info(path).map(|_| ())
    }

    /// Whether `path` names a binary package that may enter the spool.
    fn valid_binary(&self, path: &Path) -> bool;

    // Used by the privileged agent.

    /// Rejects package manager invocations the agent must not run.
    fn validate_cmd_args(&self, pm: &str, args: &[String]) -> Result<()>;

    fn cmd_args(&self, pm: &str, args: &[String]) -> Result<Vec<String>>;

    /// Commands the builder may run through sudo in interactive roots.
    fn allowed_pm_commands(&self) -> Vec<String>;
}

pub type PmFactory = fn(&TargetConfig) -> Result<Box<dyn PackageManager>>;

pub fn standard_registry() -> Registry<PmFactory> {
    let mut reg: Registry<PmFactory> = Registry::new("package manager type");
    reg.register("urpmi", urpmi::Urpmi::factory);
    reg
}
