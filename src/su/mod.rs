//! Typed front end for privileged operations.
//!
//! [`SuWrapper`] turns root-manager and build steps into [`AgentRequest`]s
//! and hands them to a backend: the long-lived privileged agent
//! (`jurt-root-wrapper`) or the same handlers running in this process
//! (`in-process`, for hosts where the controller already has the needed
//! rights, and for tests).

pub mod interrupt;
mod poll;
pub mod proxy;

use std::io::Write;
use std::path::Path;

use anyhow::Result;

use crate::agent::exec::Output;
use crate::agent::ops::RootCommand;
use crate::agent::protocol::{AgentRequest, OpType};
use crate::config::TargetConfig;
use crate::error::{Error, TIMEOUT_EXIT_STATUS};
use crate::logstore::OutputSink;
use crate::pm::PackageManager;
use crate::registry::Registry;
use crate::util::shell_join;

pub use proxy::AgentProxy;

pub enum SuBackend {
    Agent(AgentProxy),
    InProcess(Box<RootCommand>),
}

pub struct SuWrapper {
    target: String,
    user: String,
    backend: SuBackend,
}

pub type SuFactory = fn(&TargetConfig, Box<dyn PackageManager>) -> Result<SuWrapper>;

pub fn standard_registry() -> Registry<SuFactory> {
    let mut reg: Registry<SuFactory> = Registry::new("su type");
    reg.register("jurt-root-wrapper", SuWrapper::agent)
        .register("in-process", SuWrapper::in_process);
    reg
}

/// A status of 124 means "timed out" only for requests that asked for a
/// time limit; otherwise it is an ordinary failure of the command.
pub(crate) fn timeout_aware(req: &AgentRequest, result: Result<String>) -> Result<String> {
    let err = match result {
        Ok(output) => return Ok(output),
        Err(err) => err,
    };
    if req.timeout.is_some() {
        if let Some(Error::Command {
            code: TIMEOUT_EXIT_STATUS,
            cmdline,
            ..
        }) = Error::find(&err)
        {
            return Err(Error::Timeout {
                cmdline: cmdline.clone(),
            }
            .into());
        }
    }
    Err(err)
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

impl SuWrapper {
    pub fn agent(cfg: &TargetConfig, _pm: Box<dyn PackageManager>) -> Result<Self> {
        let mut command = cfg.sudo_command.clone();
        command.extend(cfg.root_command.iter().cloned());
        Ok(Self::with_backend(
            cfg,
            SuBackend::Agent(AgentProxy::new(command, cfg.poll_interval())),
        ))
    }

    pub fn in_process(cfg: &TargetConfig, pm: Box<dyn PackageManager>) -> Result<Self> {
        let handler = RootCommand::new(cfg.clone(), pm).without_root_check();
        Ok(Self::with_backend(cfg, SuBackend::InProcess(Box::new(handler))))
    }

    pub fn with_backend(cfg: &TargetConfig, backend: SuBackend) -> Self {
        Self {
            target: cfg.name.clone(),
            user: crate::util::current_user().0,
            backend,
        }
    }

    fn request(&self, op: OpType) -> AgentRequest {
        AgentRequest::new(op).target(self.target.clone())
    }

    /// Sends `req` to the backend. Output goes to `sink` when given and is
    /// returned otherwise.
    pub fn exec(&mut self, req: AgentRequest, sink: Option<&mut dyn OutputSink>) -> Result<String> {
        match &mut self.backend {
            SuBackend::Agent(proxy) => proxy.exec(&req, sink),
            SuBackend::InProcess(handler) => {
                let mut captured = Vec::new();
                let (result, location) = match sink {
                    Some(mut sink) => {
                        writeln!(sink, ">>>> running in-process: {}", shell_join(&req.to_args()))?;
                        let result = handler.handle_to(&req, &mut Output::Capture(&mut sink));
                        (result, Some(sink.location()))
                    }
                    None => (handler.handle_to(&req, &mut Output::Capture(&mut captured)), None),
                };
                let captured = String::from_utf8_lossy(&captured).into_owned();
                let result = match result {
                    Ok(()) => Ok(captured),
                    Err(mut err) => {
                        if let Some(Error::Command { output, .. }) = err.downcast_mut::<Error>() {
                            if output.is_empty() {
                                *output = match location {
                                    Some(loc) => format!("(output available in {loc})"),
                                    None => captured,
                                };
                            }
                        }
                        Err(err)
                    }
                };
                timeout_aware(&req, result)
            }
        }
    }

    fn exec_interactive(&mut self, req: AgentRequest) -> Result<()> {
        match &mut self.backend {
            SuBackend::Agent(proxy) => proxy.exec_interactive(&req),
            SuBackend::InProcess(handler) => handler.handle(&req),
        }
    }

    pub fn add_user(&mut self, user: &str, uid: u32, root: &Path, arch: &str) -> Result<()> {
        let req = self
            .request(OpType::AddUser)
            .root(root)
            .arch(arch)
            .owner(Some(uid), None)
            .arg(user);
        self.exec(req, None).map(drop)
    }

    pub fn run_package_manager(
        &mut self,
        pm: &str,
        args: &[String],
        root: Option<(&Path, &str)>,
        sink: Option<&mut dyn OutputSink>,
    ) -> Result<String> {
        let mut req = self.request(OpType::RunPm).pm(pm).args(args.iter().cloned());
        if let Some((root, arch)) = root {
            req = req.root(root).arch(arch);
        }
        self.exec(req, sink)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn run_as(
        &mut self,
        args: &[String],
        user: &str,
        root: &Path,
        arch: &str,
        timeout: Option<u64>,
        sink: Option<&mut dyn OutputSink>,
    ) -> Result<String> {
        let req = self
            .request(OpType::RunCmd)
            .root(root)
            .arch(arch)
            .run_as(user)
            .timeout(timeout)
            .args(args.iter().cloned());
        self.exec(req, sink)
    }

    pub fn rename(&mut self, src: &Path, dest: &Path) -> Result<()> {
        let req = self
            .request(OpType::Rename)
            .args([path_arg(src), path_arg(dest)]);
        self.exec(req, None).map(drop)
    }

    pub fn mkdir(&mut self, paths: &[&Path], uid: Option<u32>, gid: Option<u32>, mode: Option<u32>) -> Result<()> {
        let req = self
            .request(OpType::Mkdir)
            .owner(uid, gid)
            .mode(mode)
            .args(paths.iter().map(|p| path_arg(p)));
        self.exec(req, None).map(drop)
    }

    pub fn copy(&mut self, sources: &[&Path], dest: &Path, uid: Option<u32>, gid: Option<u32>, mode: Option<u32>) -> Result<()> {
        let req = self
            .request(OpType::Copy)
            .owner(uid, gid)
            .mode(mode)
            .args(sources.iter().map(|p| path_arg(p)))
            .arg(path_arg(dest));
        self.exec(req, None).map(drop)
    }

    pub fn copy_out(&mut self, sources: &[&Path], dest: &Path, uid: u32, gid: u32) -> Result<()> {
        let req = self
            .request(OpType::CopyOut)
            .owner(Some(uid), Some(gid))
            .args(sources.iter().map(|p| path_arg(p)))
            .arg(path_arg(dest));
        self.exec(req, None).map(drop)
    }

    pub fn cheap_copy(&mut self, src: &Path, dest: &Path) -> Result<()> {
        let req = self
            .request(OpType::CheapCopy)
            .args([path_arg(src), path_arg(dest)]);
        self.exec(req, None).map(drop)
    }

    pub fn create_devices(&mut self, root: &Path) -> Result<()> {
        let req = self.request(OpType::CreateDevs).root(root);
        self.exec(req, None).map(drop)
    }

    pub fn mount_virtual_filesystems(&mut self, root: &Path, arch: &str) -> Result<()> {
        let req = self.request(OpType::MountAll).root(root).arch(arch);
        self.exec(req, None).map(drop)
    }

    pub fn umount_virtual_filesystems(&mut self, root: &Path, arch: &str) -> Result<()> {
        let req = self.request(OpType::UmountAll).root(root).arch(arch);
        self.exec(req, None).map(drop)
    }

    pub fn mount_tmpfs(&mut self, path: &Path) -> Result<()> {
        let req = self.request(OpType::MountTmpfs).arg(path_arg(path));
        self.exec(req, None).map(drop)
    }

    pub fn umount_tmpfs(&mut self, path: &Path) -> Result<()> {
        let req = self.request(OpType::UmountTmpfs).arg(path_arg(path));
        self.exec(req, None).map(drop)
    }

    pub fn compress_root(&mut self, root: &Path, archive: &Path) -> Result<()> {
        let req = self
            .request(OpType::RootCompress)
            .args([path_arg(root), path_arg(archive)]);
        self.exec(req, None).map(drop)
    }

    pub fn decompress_root(&mut self, archive: &Path, root: &Path) -> Result<()> {
        let req = self
            .request(OpType::RootDecompress)
            .args([path_arg(archive), path_arg(root)]);
        self.exec(req, None).map(drop)
    }

    pub fn btrfs_create(&mut self, path: &Path) -> Result<()> {
        let req = self.request(OpType::BtrfsCreate).arg(path_arg(path));
        self.exec(req, None).map(drop)
    }

    pub fn btrfs_snapshot(&mut self, from: &Path, to: &Path) -> Result<()> {
        let req = self
            .request(OpType::BtrfsSnapshot)
            .args([path_arg(from), path_arg(to)]);
        self.exec(req, None).map(drop)
    }

    pub fn destroy_root(&mut self, path: &Path) -> Result<()> {
        let req = self.request(OpType::DestroyRoot).arg(path_arg(path));
        self.exec(req, None).map(drop)
    }

    pub fn post_root_command(&mut self, root: &Path, arch: &str) -> Result<()> {
        let req = self.request(OpType::PostCommand).root(root).arch(arch);
        self.exec(req, None).map(drop)
    }

    pub fn interactive_prepare(&mut self, user: &str, root: &Path, arch: &str) -> Result<()> {
        let req = self
            .request(OpType::InteractivePrepare)
            .root(root)
            .arch(arch)
            .arg(user);
        self.exec(req, None).map(drop)
    }

    pub fn interactive_shell(&mut self, user: &str, root: &Path, arch: &str) -> Result<()> {
        let req = self
            .request(OpType::InteractiveShell)
            .root(root)
            .arch(arch)
            .arg(user);
        self.exec_interactive(req)
    }

    /// Checks that the helper can be reached without a password.
    pub fn test_sudo(&mut self) -> Result<()> {
        let req = self.request(OpType::Test).quiet();
        match self.exec(req, None) {
            Ok(_) => Ok(()),
            Err(e) if matches!(
                Error::find(&e),
                Some(Error::Command { .. } | Error::Agent { .. } | Error::Setup(_))
            ) =>
            {
                log::debug!("helper test failed: {e:#}");
                Err(Error::SudoNotSetup {
                    user: self.user.clone(),
                }
                .into())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_mapping() {
        let command_err = || -> Result<String> {
            Err(Error::Command {
                code: TIMEOUT_EXIT_STATUS,
                cmdline: "rpmbuild".into(),
                output: String::new(),
            }
            .into())
        };
        let plain = AgentRequest::new(OpType::RunCmd);
        let err = timeout_aware(&plain, command_err()).unwrap_err();
        assert!(matches!(Error::find(&err), Some(Error::Command { code: 124, .. })));

        let limited = AgentRequest::new(OpType::RunCmd).timeout(Some(10));
        let err = timeout_aware(&limited, command_err()).unwrap_err();
        assert!(matches!(Error::find(&err), Some(Error::Timeout { .. })));
    }
}
