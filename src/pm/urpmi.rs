//! urpmi/rpm based package manager.

use std::io::Write;
use std::path::Path;

use anyhow::Result;
use regex::Regex;

use super::repos::Repos;
use super::{BuildOutput, PackageInfo, PackageManager};
use crate::build::stage::BuildStage;
use crate::config::TargetConfig;
use crate::error::Error;
use crate::logstore::{LogStore, OutputSink};
use crate::root::ChrootSession;
use crate::spool::Spool;
use crate::su::SuWrapper;
use crate::util::fs::is_below;
use crate::util::run_command;

const URPMI: &str = "urpmi";
const ADDMEDIA: &str = "urpmi.addmedia";
const UPDATE: &str = "urpmi.update";
const SPOOL_MEDIA: &str = "build-spool";
const PACKAGER_UNDEFINED: &str = "PACKAGER_UNDEFINED";
const UNDEFINED: &str = "undefined";
const QUERY_FORMAT: &str = "%{name}/%{version}/%{release}/%{arch}\\n";

pub struct Urpmi {
    cfg: TargetConfig,
    fatal_output: Regex,
    ignore_medias: Regex,
}

fn compile(value: &str, field: &str) -> Result<Regex, Error> {
    Regex::new(value).map_err(|e| Error::Config(format!("invalid regexp in {field}: {value:?}: {e}")))
}

/// Interrupts and agent faults must reach the batch loop untouched; every
/// other failure becomes a package manager error pointing at the log.
fn pm_error(err: anyhow::Error, message: String, log: &Path) -> anyhow::Error {
    match Error::find(&err) {
        Some(Error::Interrupted | Error::Agent { .. }) => err,
        _ => {
            log::debug!("{err:#}");
            err.context(Error::package_manager(message, Some(log.to_path_buf())))
        }
    }
}

impl Urpmi {
    pub fn new(cfg: TargetConfig) -> Result<Self> {
        Ok(Self {
            fatal_output: compile(&cfg.urpmi_fatal_output, "urpmi-fatal-output")?,
            ignore_medias: compile(&cfg.urpmi_ignore_system_medias, "urpmi-ignore-system-medias")?,
            cfg,
        })
    }

    pub fn factory(cfg: &TargetConfig) -> Result<Box<dyn PackageManager>> {
        Ok(Box::new(Self::new(cfg.clone())?))
    }

    fn topdir(&self, homedir: &str) -> String {
        self.cfg.rpm_topdir.replace('~', homedir)
    }

    fn topdir_args(&self, homedir: &str) -> [String; 2] {
        ["--define".to_string(), format!("_topdir {}", self.topdir(homedir))]
    }

    fn auto_args(&self) -> Vec<String> {
        let mut args = self.cfg.urpmi_extra_options.clone();
        args.push("--auto".to_string());
        args
    }

    fn packager(&self) -> String {
        if self.cfg.rpm_packager != UNDEFINED {
            return self.cfg.rpm_packager.clone();
        }
        match run_command(&self.cfg.rpm_get_packager_command) {
            Ok(out) if !out.contains(PACKAGER_UNDEFINED) && !out.trim().is_empty() => {
                out.trim().to_string()
            }
            Ok(_) => self.cfg.rpm_packager_default.clone(),
            Err(e) => {
                log::error!("error while getting the packager macro: {e:#}");
                self.cfg.rpm_packager_default.clone()
            }
        }
    }

    /// Runs `urpmi.update` and then urpmi with `args`, failing when the
    /// output carried a fatal message even if urpmi exited with 0.
    fn update_and_install(
        &self,
        args: &[String],
        session: &mut ChrootSession<'_>,
        logs: &mut LogStore,
        logname: &str,
        message: &str,
    ) -> Result<()> {
        let mut log = logs.trapping_handler(logname, &self.fatal_output)?;
        let location = log.path().to_path_buf();
        let run = session
            .run_package_manager(UPDATE, &[], Some(&mut log))
            .and_then(|_| session.run_package_manager(URPMI, args, Some(&mut log)));
        let matches = log.close()?;
        let message = format!("{message}, see the logs at {}", location.display());
        run.map_err(|e| pm_error(e, message.clone(), &location))?;
        if !matches.is_empty() {
            log::debug!("fatal urpmi output: {matches:?}");
            return Err(Error::package_manager(message, Some(location)).into());
        }
        Ok(())
    }

    fn install_base(
        &self,
        su: &mut SuWrapper,
        root: &str,
        interactive: bool,
        log: &mut dyn OutputSink,
    ) -> Result<()> {
        let repos = Repos::resolve(
            &self.cfg.repos,
            &self.cfg.urpmi_list_medias_command,
            &self.ignore_medias,
        )?;
        if repos.is_empty() {
            log::warn!("no repositories configured for target {}", self.cfg.name);
        }
        for distrib in &repos.distribs {
            let args = vec![
                "--urpmi-root".to_string(),
                root.to_string(),
                "--distrib".to_string(),
                distrib.clone(),
            ];
            su.run_package_manager(ADDMEDIA, &args, None, Some(&mut *log))?;
        }
        for media in &repos.medias {
            let mut args = vec!["--urpmi-root".to_string(), root.to_string()];
            args.extend(media.iter().cloned());
            su.run_package_manager(ADDMEDIA, &args, None, Some(&mut *log))?;
        }

        let mut base = self.auto_args();
        base.extend(["--root", root, "--urpmi-root", root].map(String::from));
        let mut packages = base.clone();
        packages.extend(self.cfg.base_packages.iter().cloned());
        su.run_package_manager(URPMI, &packages, None, Some(&mut *log))?;

        if interactive && !self.cfg.interactive_packages.is_empty() {
            writeln!(log, ">>>> installing interactive packages")?;
            base.extend(self.cfg.interactive_packages.iter().cloned());
            su.run_package_manager(URPMI, &base, None, Some(&mut *log))?;
        }
        Ok(())
    }
}

impl PackageManager for Urpmi {
    fn system_arch(&self) -> Result<String> {
        Ok(run_command(&self.cfg.rpm_get_arch_command)?.trim().to_string())
    }

    fn create_root(
        &self,
        su: &mut SuWrapper,
        path: &Path,
        logs: &mut LogStore,
        interactive: bool,
    ) -> Result<()> {
        let mut log = logs.output_handler("chroot-install")?;
        let location = log.path().to_path_buf();
        let root = path.to_string_lossy();
        let result = self.install_base(su, &root, interactive, &mut log);
        log.close()?;
        result.map_err(|e| {
            pm_error(
                e,
                format!(
                    "failed to create the base root installation, detailed error log at: {}",
                    location.display()
                ),
                &location,
            )
        })
    }

    fn install(
        &self,
        packages: &[String],
        session: &mut ChrootSession<'_>,
        logs: &mut LogStore,
        logname: &str,
    ) -> Result<()> {
        let mut args = self.auto_args();
        args.extend(packages.iter().cloned());
        let message = format!("failed to install packages [{}]", packages.join(" "));
        self.update_and_install(&args, session, logs, logname, &message)
    }

    fn setup_repositories(
        &self,
        session: &mut ChrootSession<'_>,
        logs: &mut LogStore,
        spool: Option<&Spool>,
    ) -> Result<()> {
        let Some(spool) = spool else {
            return Ok(());
        };
        if spool.package_count(self)? == 0 {
            return Ok(());
        }
        let reachable = session.make_spool_reachable(spool)?;
        let mut log = logs.output_handler("addmedia")?;
        let location = log.path().to_path_buf();
        let args = vec![SPOOL_MEDIA.to_string(), reachable.in_root.clone()];
        let run = session.run_package_manager(ADDMEDIA, &args, Some(&mut log));
        log.close()?;
        let discarded = session.discard_spool(reachable);
        run.map_err(|e| {
            pm_error(
                e,
                format!("failed to setup repositories, see the logs at {}", location.display()),
                &location,
            )
        })?;
        discarded
    }

    fn build_prepare(
        &self,
        session: &mut ChrootSession<'_>,
        homedir: &str,
        uid: u32,
    ) -> Result<()> {
        let topdir = self.topdir(homedir);
        let mut dirs = vec![topdir.clone()];
        dirs.extend(
            self.cfg
                .rpm_topdir_subdirs
                .iter()
                .map(|sub| format!("{}/{sub}", topdir.trim_end_matches('/'))),
        );
        log::debug!("creating RPM build directories in {topdir}");
        session.mkdir(&dirs, Some(uid))?;

        let packager = self.packager();
        log::debug!("using {packager} as packager");
        let macros = format!("%_topdir {topdir}\n%packager {packager}\n");
        let macros_file = self.cfg.rpm_macros_file.replace('~', homedir);
        log::debug!("writing RPM macros to {macros_file}");
        session.write_file(&macros_file, &macros, Some(uid))
    }

    fn extract_source(
        &self,
        srcpkg: &str,
        session: &mut ChrootSession<'_>,
        username: &str,
        homedir: &str,
        logs: &mut LogStore,
    ) -> Result<String> {
        let mut args = self.cfg.rpm_install_source_command.clone();
        args.extend(self.topdir_args(homedir));
        args.push(srcpkg.to_string());
        let mut log = logs.output_handler("extractsource")?;
        let location = log.path().to_path_buf();
        let run = session.run_as(&args, username, None, Some(&mut log));
        log.close()?;
        run.map_err(|e| {
            pm_error(
                e,
                format!(
                    "failed to install the source package, error log at: {}",
                    location.display()
                ),
                &location,
            )
        })?;

        let pattern = format!("{}/SPECS/*.spec", self.topdir(homedir).trim_end_matches('/'));
        session.glob(&pattern)?.into_iter().next().ok_or_else(|| {
            Error::package_manager(
                format!(
                    "failed to extract {}, no spec files found",
                    session.external_path(srcpkg).display()
                ),
                Some(location),
            )
            .into()
        })
    }

    fn install_build_deps(
        &self,
        srcpkg: &str,
        session: &mut ChrootSession<'_>,
        logs: &mut LogStore,
        spool: &Spool,
    ) -> Result<()> {
        let mut args = self.auto_args();
        args.push("--buildrequires".to_string());
        args.push(srcpkg.to_string());
        let reachable = session.make_spool_reachable(spool)?;
        let result = self.update_and_install(
            &args,
            session,
            logs,
            "build-deps-install",
            "failed to install build dependencies",
        );
        let discarded = session.discard_spool(reachable);
        result?;
        discarded
    }

    fn build_source(
        &self,
        recipe: &str,
        session: &mut ChrootSession<'_>,
        logs: &mut LogStore,
        username: &str,
        homedir: &str,
        stage: Option<BuildStage>,
        timeout: Option<u64>,
    ) -> Result<BuildOutput> {
        let mut args = self.cfg.rpm_build_source_command.clone();
        args.extend(self.topdir_args(homedir));
        for (name, value) in &self.cfg.rpm_build_macros {
            args.push("--define".to_string());
            args.push(format!("{name} {value}"));
        }
        args.push(stage.map_or_else(|| "-ba".to_string(), BuildStage::as_flag));
        args.push(recipe.to_string());

        let mut log = logs.output_handler("build")?;
        let location = log.path().to_path_buf();
        let run = session.run_as(&args, username, timeout, Some(&mut log));
        let (success, timed_out) = match run {
            Ok(_) => (true, false),
            Err(e) => match Error::find(&e) {
                Some(Error::Timeout { .. }) => {
                    log.note("===== timeout\n")?;
                    log::error!("build timed out, see the logs at {}", location.display());
                    (false, true)
                }
                Some(Error::Command { .. }) => {
                    log::error!("build failed, see the logs at {}", location.display());
                    (false, false)
                }
                _ => {
                    log.close()?;
                    return Err(e);
                }
            },
        };
        log.close()?;

        let mut artifacts = Vec::new();
        if success {
            let topdir = self.topdir(homedir);
            for pattern in &self.cfg.rpm_collect_glob {
                artifacts.extend(session.glob(&format!("{}/{pattern}", topdir.trim_end_matches('/')))?);
            }
        }
        Ok(BuildOutput {
            success,
            timed_out,
            artifacts,
            log: Some(location),
        })
    }

    fn update_repository_metadata(&self, path: &Path) -> Result<()> {
        let mut args = self.cfg.genhdlist_command.clone();
        args.push(path.to_string_lossy().into_owned());
        run_command(&args).map(drop)
    }

    fn source_info(&self, path: &Path) -> Result<PackageInfo> {
        let mut args = self.cfg.rpm_query_command.clone();
        args.push(QUERY_FORMAT.to_string());
        args.push(path.to_string_lossy().into_owned());
        let output = run_command(&args).map_err(|e| {
            Error::package_manager(
                format!("{} does not seem to be a RPM package: {e:#}", path.display()),
                None,
            )
        })?;
        parse_query(&output).ok_or_else(|| {
            Error::package_manager(
                format!("{} does not seem to be a RPM package", path.display()),
                None,
            )
            .into()
        })
    }

    fn valid_binary(&self, path: &Path) -> bool {
        let name = path.to_string_lossy();
        name.ends_with(".rpm") && !name.ends_with(".src.rpm")
    }

    fn validate_cmd_args(&self, pm: &str, args: &[String]) -> Result<()> {
        if pm == URPMI && !args.iter().any(|a| a == "--auto") {
            return Err(Error::InvalidRequest("--auto is missing in urpmi command line".into()).into());
        }
        let mut tokens = args.iter();
        while let Some(token) = tokens.next() {
            if token == "--" {
                break;
            }
            let Some(option) = token.strip_prefix("--") else {
                if token.len() > 1 && token.starts_with('-') {
                    return Err(Error::InvalidRequest(format!("option not allowed: {token}")).into());
                }
                continue;
            };
            let (name, inline) = match option.split_once('=') {
                Some((name, value)) => (name, Some(value.to_string())),
                None => (option, None),
            };
            let takes_value = self.cfg.urpmi_valid_options.iter().any(|o| o == &format!("{name}="));
            let is_flag = self.cfg.urpmi_valid_options.iter().any(|o| o == name);
            let value = match (takes_value, is_flag, inline) {
                (true, _, Some(v)) => Some(v),
                (true, _, None) => Some(tokens.next().cloned().ok_or_else(|| {
                    Error::InvalidRequest(format!("--{name} expects a value"))
                })?),
                (false, true, None) => None,
                _ => {
                    return Err(Error::InvalidRequest(format!("option not allowed: --{name}")).into())
                }
            };
            if matches!(name, "root" | "urpmi-root") {
                let value = value.unwrap_or_default();
                if !is_below(&self.cfg.roots_path, Path::new(&value))? {
                    return Err(Error::InvalidRequest(format!(
                        "--{name} should be based on {}",
                        self.cfg.roots_path.display()
                    ))
                    .into());
                }
            }
        }
        Ok(())
    }

    fn cmd_args(&self, pm: &str, args: &[String]) -> Result<Vec<String>> {
        let mut cmd = match pm {
            URPMI => self.cfg.urpmi_command.clone(),
            ADDMEDIA => self.cfg.urpmiaddmedia_command.clone(),
            UPDATE => self.cfg.urpmi_update_command.clone(),
            other => {
                return Err(Error::InvalidRequest(format!("invalid package manager command: {other}")).into())
            }
        };
        cmd.extend(args.iter().cloned());
        Ok(cmd)
    }

    fn allowed_pm_commands(&self) -> Vec<String> {
        self.cfg.interactive_allowed_urpmi_commands.clone()
    }
}

fn parse_query(output: &str) -> Option<PackageInfo> {
    let line = output.lines().next()?.trim();
    let fields: Vec<&str> = line.split('/').collect();
    let [name, version, release, arch] = fields.as_slice() else {
        return None;
    };
    if name.is_empty() || version.is_empty() {
        return None;
    }
    Some(PackageInfo {
        name: name.to_string(),
        version: version.to_string(),
        release: release.to_string(),
        arch: (*arch != "(none)").then(|| arch.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::fs;
    use tempfile::TempDir;

    fn urpmi(tmp: &TempDir) -> Urpmi {
        let mut config = Config::new().unwrap();
        config
            .merge_str(&format!(
                "[target.cooker]\njurt-base-dir = \"{}\"\nrpm-packager = \"Tester <t@example.org>\"\n",
                tmp.path().display()
            ))
            .unwrap();
        Urpmi::new(config.target("cooker").unwrap()).unwrap()
    }

    #[test]
    fn test_validate_cmd_args() {
        let tmp = TempDir::new().unwrap();
        let pm = urpmi(&tmp);
        let root = pm.cfg.roots_path.join("temp/r1").display().to_string();
        let ok: Vec<String> = ["--no-suggests", "--auto", "--root", &root, "--urpmi-root", &root, "basesystem"]
            .map(String::from)
            .to_vec();
        pm.validate_cmd_args("urpmi", &ok).unwrap();

        let no_auto: Vec<String> = vec!["foo".into()];
        assert!(pm.validate_cmd_args("urpmi", &no_auto).is_err());

        let outside: Vec<String> = ["--auto", "--root=/"].map(String::from).to_vec();
        let err = pm.validate_cmd_args("urpmi", &outside).unwrap_err();
        assert!(matches!(Error::find(&err), Some(Error::InvalidRequest(_))));

        let unknown: Vec<String> = ["--auto", "--env", "/tmp"].map(String::from).to_vec();
        assert!(pm.validate_cmd_args("urpmi", &unknown).is_err());

        let addmedia: Vec<String> = ["--urpmi-root", &root, "main", "http://mirror/main"]
            .map(String::from)
            .to_vec();
        pm.validate_cmd_args("urpmi.addmedia", &addmedia).unwrap();
    }

    #[test]
    fn test_cmd_args_and_binaries() {
        let tmp = TempDir::new().unwrap();
        let pm = urpmi(&tmp);
        let args = pm.cmd_args("urpmi.update", &[]).unwrap();
        assert_eq!(args, vec!["/usr/sbin/urpmi.update", "-a"]);
        assert!(pm.cmd_args("rpm", &[]).is_err());

        assert!(pm.valid_binary(Path::new("/x/foo-1.0-1.x86_64.rpm")));
        assert!(!pm.valid_binary(Path::new("/x/foo-1.0-1.src.rpm")));
        assert!(!pm.valid_binary(Path::new("/x/foo.tar.gz")));
        assert_eq!(pm.packager(), "Tester <t@example.org>");
        assert_eq!(pm.topdir("/home/builder"), "/home/builder");
    }

    #[test]
    fn test_in_process_fatal_output_is_trapped() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::new().unwrap();
        config
            .merge_str(&format!(
                r#"[target.cooker]
jurt-base-dir = "{}"
urpmi-update-command = ["sh", "-c", "printf '%s %s\\n' 'A requested package' 'cannot be installed'"]
urpmi-command = ["sh", "-c", "echo \"$1 installing\"; printf '%s %s\\n' 'No space left' 'on device'; exit 1", "sh"]
"#,
                tmp.path().display()
            ))
            .unwrap();
        let cfg = config.target("cooker").unwrap();
        let pm = Urpmi::new(cfg.clone()).unwrap();
        let mut su = SuWrapper::in_process(&cfg, Urpmi::factory(&cfg).unwrap()).unwrap();

        let out = su.run_package_manager(UPDATE, &[], None, None).unwrap();
        assert!(out.contains("A requested package cannot be installed\n"));

        let mut logs = LogStore::open(tmp.path(), "batch", false).unwrap();
        let mut log = logs.trapping_handler("install", &pm.fatal_output).unwrap();
        su.run_package_manager(UPDATE, &[], None, Some(&mut log)).unwrap();
        let err = su
            .run_package_manager(URPMI, &["--auto".to_string()], None, Some(&mut log))
            .unwrap_err();
        match Error::find(&err) {
            Some(Error::Command { code: 1, output, .. }) => {
                assert!(output.contains("install.log"), "{output}")
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let matches = log.close().unwrap();
        assert_eq!(
            matches,
            vec!["A requested package cannot be installed", "No space left on device"]
        );
        let text = fs::read_to_string(tmp.path().join("batch/install.log")).unwrap();
        assert!(text.contains("--auto installing"));
    }

    #[test]
    fn test_parse_query() {
        let info = parse_query("foo/1.0/2mdv2011.0/x86_64\n").unwrap();
        assert_eq!(info.source_id(), "foo-1.0-2mdv2011.0");
        assert_eq!(info.arch.as_deref(), Some("x86_64"));
        assert!(parse_query("").is_none());
        assert!(parse_query("garbage").is_none());
    }
}
