//! The privileged operations. Every path a request names is validated
//! against the target's directories before anything touches the host.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nix::sys::stat::{makedev, mknod, Mode, SFlag};
use nix::unistd::{chown, Gid, Group, Uid};

use super::archive;
use super::exec::{self, Output, Wrap};
use super::mounts;
use super::protocol::{AgentRequest, OpType};
use crate::config::{DeviceKind, TargetConfig};
use crate::error::Error;
use crate::pm::PackageManager;
use crate::util::fs::{
    clone_tree, is_below, join_inside, normalize, resolve_below, same_partition,
};

const DEFAULT_DIR_MODE: u32 = 0o755;
const DEFAULT_FILE_MODE: u32 = 0o644;
const SUDOERS_MODE: u32 = 0o440;
const COMMAND_NOT_FOUND: i32 = 127;

fn invalid(msg: impl Into<String>) -> anyhow::Error {
    Error::InvalidRequest(msg.into()).into()
}

/// Executes agent requests for one target.
pub struct RootCommand {
    cfg: TargetConfig,
    pm: Box<dyn PackageManager>,
    dry_run: bool,
    require_root: bool,
    host_arch: Option<String>,
}

impl RootCommand {
    pub fn new(cfg: TargetConfig, pm: Box<dyn PackageManager>) -> Self {
        Self {
            cfg,
            pm,
            dry_run: false,
            require_root: true,
            host_arch: None,
        }
    }

    /// Print commands instead of running them.
    pub fn dry_run(mut self, on: bool) -> Self {
        self.dry_run = on;
        self
    }

    /// Used when the operations run inside the controller's own process.
    pub fn without_root_check(mut self) -> Self {
        self.require_root = false;
        self
    }

    pub fn target(&self) -> &TargetConfig {
        &self.cfg
    }

    /// Handles `req` on the agent's own stdout and stderr.
    pub fn handle(&mut self, req: &AgentRequest) -> Result<()> {
        self.handle_to(req, &mut Output::Inherit)
    }

    pub fn handle_to(&mut self, req: &AgentRequest, out: &mut Output<'_>) -> Result<()> {
        log::debug!("handling {}", req.op);
        match req.op {
            OpType::AddUser => self.add_user(req, out),
            OpType::Copy => self.copy_in(req),
            OpType::CopyOut => self.copy_out(req),
            OpType::CheapCopy => self.cheap_copy(req),
            OpType::Mkdir => self.mkdir(req),
            OpType::CreateDevs => self.create_devices(req),
            OpType::Rename => self.rename(req),
            OpType::RunCmd => self.run_cmd(req, out),
            OpType::RunPm => self.run_pm(req, out),
            OpType::MountAll => self.mount_all(req, out),
            OpType::UmountAll => self.umount_all(req, out),
            OpType::MountTmpfs => self.mount_tmpfs(req, out),
            OpType::UmountTmpfs => self.umount_tmpfs(req, out),
            OpType::RootCompress => self.root_compress(req),
            OpType::RootDecompress => self.root_decompress(req),
            OpType::BtrfsSnapshot => self.btrfs_snapshot(req, out),
            OpType::BtrfsCreate => self.btrfs_create(req, out),
            OpType::DestroyRoot => self.destroy_root(req, out),
            OpType::PostCommand => self.post_command(req, out),
            OpType::InteractivePrepare => self.interactive_prepare(req),
            OpType::InteractiveShell => self.interactive_shell(req, out),
            OpType::Test => self.test(out),
        }
    }

    fn host_arch(&mut self) -> Option<String> {
        if self.host_arch.is_none() {
            match self.pm.system_arch() {
                Ok(arch) => self.host_arch = Some(arch),
                Err(e) => log::warn!("cannot determine host architecture: {e:#}"),
            }
        }
        self.host_arch.clone()
    }

    fn execute(
        &mut self,
        req: &AgentRequest,
        args: &[String],
        wrap: Wrap,
        out: &mut Output<'_>,
    ) -> Result<()> {
        let host = match (&req.root, &req.arch) {
            (Some(_), Some(_)) => self.host_arch(),
            _ => None,
        };
        let cmd = exec::compose(&self.cfg, req, args, host.as_deref(), wrap)?;
        exec::run(&cmd, req, wrap, self.dry_run, out)
    }

    fn run_plain(&self, req: &AgentRequest, cmd: Vec<String>, out: &mut Output<'_>) -> Result<()> {
        exec::run(&cmd, req, Wrap::default(), self.dry_run, out)
    }

    /// Normalized `path`, which must lie strictly below the roots path.
    fn under_roots(&self, path: &Path) -> Result<PathBuf> {
        if !is_below(&self.cfg.roots_path, path)? {
            return Err(invalid(format!(
                "'{}' is outside '{}'",
                path.display(),
                self.cfg.roots_path.display()
            )));
        }
        normalize(path)
    }

    /// `path` with symlinks resolved, which must still lie strictly below
    /// one of `bases`.
    fn resolved_below(&self, bases: &[&Path], path: &Path) -> Result<PathBuf> {
        resolve_below(bases, path)?.ok_or_else(|| {
            let bases: Vec<_> = bases.iter().map(|b| b.display().to_string()).collect();
            invalid(format!("'{}' escapes '{}'", path.display(), bases.join("' and '")))
        })
    }

    /// Like [`under_roots`](Self::under_roots), additionally resolving
    /// symlinks so a link planted inside a root cannot point the operation
    /// elsewhere.
    fn resolved_under_roots(&self, path: &Path) -> Result<PathBuf> {
        let path = self.under_roots(path)?;
        self.resolved_below(&[self.cfg.roots_path.as_path()], &path)
    }

    fn require_root(&self, req: &AgentRequest) -> Result<PathBuf> {
        let root = req
            .root
            .as_ref()
            .ok_or_else(|| invalid(format!("{} requires --root", req.op)))?;
        self.under_roots(root)
    }

    fn output_dir(&self, path: &Path) -> Result<PathBuf> {
        let allowed = [self.cfg.success_dir.as_path(), self.cfg.failure_dir.as_path()];
        for base in allowed {
            if is_below(base, path)? {
                return self.resolved_below(&allowed, path);
            }
        }
        Err(invalid(format!(
            "'{}' is not below the success or failure directories",
            path.display()
        )))
    }

    fn check_build_user(&self, user: &str) -> Result<()> {
        if user == self.cfg.build_user {
            return Ok(());
        }
        let group = Group::from_name(&self.cfg.jurt_group)
            .ok()
            .flatten()
            .ok_or_else(|| invalid(format!("group {} does not exist", self.cfg.jurt_group)))?;
        if group.mem.iter().any(|m| m == user) {
            return Ok(());
        }
        Err(invalid(format!(
            "user {user} is neither {} nor a member of {}",
            self.cfg.build_user, self.cfg.jurt_group
        )))
    }

    fn add_user(&mut self, req: &AgentRequest, out: &mut Output<'_>) -> Result<()> {
        self.require_root(req)?;
        let user = first_arg(req)?;
        if !user
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(invalid(format!("invalid user name: {user}")));
        }
        let uid = req
            .uid
            .ok_or_else(|| invalid("adduser requires --uid"))?;
        let mut args = self.cfg.adduser_command.clone();
        args.extend(["-u".to_string(), uid.to_string(), user.to_string()]);
        self.execute(req, &args, Wrap { chroot: true, interactive: false }, out)
    }

    fn copy_in(&mut self, req: &AgentRequest) -> Result<()> {
        let (dest, sources) = req
            .args
            .split_last()
            .filter(|(_, sources)| !sources.is_empty())
            .ok_or_else(|| invalid("copy requires sources and a destination"))?;
        let dest = self.resolved_under_roots(Path::new(dest))?;
        for src in sources {
            install_file(Path::new(src), &dest, req)?;
        }
        Ok(())
    }

    fn copy_out(&mut self, req: &AgentRequest) -> Result<()> {
        let (dest, sources) = req
            .args
            .split_last()
            .filter(|(_, sources)| !sources.is_empty())
            .ok_or_else(|| invalid("copyout requires sources and a destination"))?;
        let dest = self.output_dir(Path::new(dest))?;
        for src in sources {
            let src = self.resolved_under_roots(Path::new(src))?;
            install_file(&src, &dest, req)?;
        }
        Ok(())
    }

    fn cheap_copy(&mut self, req: &AgentRequest) -> Result<()> {
        let [src, dest] = req.args.as_slice() else {
            return Err(invalid("cheapcopy requires a source and a destination"));
        };
        let src = normalize(Path::new(src))?;
        let dest = self.resolved_under_roots(Path::new(dest))?;
        let target = match (dest.is_dir(), src.file_name()) {
            (true, Some(name)) => dest.join(name),
            _ => dest,
        };
        let link = same_partition(&src, &target)?;
        log::info!(
            "{} '{}' to '{}'",
            if link { "linking" } else { "copying" },
            src.display(),
            target.display()
        );
        if self.dry_run {
            return Ok(());
        }
        clone_tree(&src, &target, link)
    }

    fn mkdir(&mut self, req: &AgentRequest) -> Result<()> {
        if req.args.is_empty() {
            return Err(invalid("mkdir requires at least one path"));
        }
        for raw in &req.args {
            let path = self.resolved_under_roots(Path::new(raw))?;
            fs::create_dir_all(&path)
                .with_context(|| format!("creating '{}'", path.display()))?;
            fs::set_permissions(
                &path,
                fs::Permissions::from_mode(req.mode.unwrap_or(DEFAULT_DIR_MODE)),
            )?;
            set_owner(&path, req)?;
        }
        Ok(())
    }

    fn create_devices(&mut self, req: &AgentRequest) -> Result<()> {
        let root = self.require_root(req)?;
        for dev in &self.cfg.devices {
            let path = join_inside(&root, &dev.path);
            if fs::symlink_metadata(&path).is_ok() {
                continue;
            }
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let kind = match dev.kind {
                DeviceKind::Char => SFlag::S_IFCHR,
                DeviceKind::Block => SFlag::S_IFBLK,
            };
            mknod(
                &path,
                kind,
                Mode::from_bits_truncate(dev.mode),
                makedev(dev.major, dev.minor),
            )
            .with_context(|| format!("creating device '{}'", path.display()))?;
            fs::set_permissions(&path, fs::Permissions::from_mode(dev.mode))?;
        }
        Ok(())
    }

    fn rename(&mut self, req: &AgentRequest) -> Result<()> {
        let [src, dest] = req.args.as_slice() else {
            return Err(invalid("rename requires a source and a destination"));
        };
        let src = self.under_roots(Path::new(src))?;
        let dest = self.under_roots(Path::new(dest))?;
        if fs::symlink_metadata(&dest).is_ok() {
            return Err(invalid(format!("'{}' already exists", dest.display())));
        }
        log::info!("moving '{}' to '{}'", src.display(), dest.display());
        fs::rename(&src, &dest)
            .with_context(|| format!("moving '{}' to '{}'", src.display(), dest.display()))
    }

    fn run_cmd(&mut self, req: &AgentRequest, out: &mut Output<'_>) -> Result<()> {
        self.require_root(req)?;
        let user = req
            .run_as
            .as_deref()
            .ok_or_else(|| invalid("runcmd requires --run-as"))?;
        self.check_build_user(user)?;
        if req.args.is_empty() {
            return Err(invalid("runcmd requires a command"));
        }
        self.execute(req, &req.args, Wrap { chroot: true, interactive: false }, out)
    }

    fn run_pm(&mut self, req: &AgentRequest, out: &mut Output<'_>) -> Result<()> {
        let pm = req
            .pm
            .as_deref()
            .ok_or_else(|| invalid("runpm requires --pm"))?;
        if req.run_as.is_some() {
            return Err(invalid("runpm runs as root only"));
        }
        self.pm.validate_cmd_args(pm, &req.args)?;
        let args = self.pm.cmd_args(pm, &req.args)?;
        let chroot = match &req.root {
            Some(root) => {
                self.under_roots(root)?;
                true
            }
            None => false,
        };
        self.execute(req, &args, Wrap { chroot, interactive: false }, out)
    }

    fn mount_all(&mut self, req: &AgentRequest, out: &mut Output<'_>) -> Result<()> {
        let root = self.require_root(req)?;
        let mounted = mounts::mounted_paths()?;
        for mp in self.cfg.mountpoints.clone() {
            let target = join_inside(&root, &mp.path);
            if mounted.contains(&target) {
                log::debug!("{} already mounted", target.display());
                continue;
            }
            fs::create_dir_all(&target)
                .with_context(|| format!("creating mount point '{}'", target.display()))?;
            let mut cmd = self.cfg.mount_command.clone();
            if mp.bind {
                cmd.push("--rbind".into());
            } else {
                if let Some(fstype) = &mp.fstype {
                    cmd.extend(["-t".to_string(), fstype.clone()]);
                }
                if let Some(options) = &mp.options {
                    cmd.extend(["-o".to_string(), options.clone()]);
                }
            }
            cmd.push(mp.device.clone());
            cmd.push(target.to_string_lossy().into_owned());
            self.run_plain(req, cmd, out)?;
        }
        Ok(())
    }

    fn umount_all(&mut self, req: &AgentRequest, out: &mut Output<'_>) -> Result<()> {
        let root = self.require_root(req)?;
        let mounted = mounts::mounted_paths()?;
        let mut failed = Vec::new();
        for path in mounts::mounts_below(&mounted, &root) {
            if path == root {
                // The root itself is only a mount point for tmpfs roots.
                continue;
            }
            let mut cmd = self.cfg.umount_command.clone();
            cmd.push(path.to_string_lossy().into_owned());
            if let Err(e) = self.run_plain(req, cmd, out) {
                log::error!("failed to unmount {}: {e:#}", path.display());
                failed.push(path);
            }
        }
        if !failed.is_empty() {
            return Err(Error::Command {
                code: 1,
                cmdline: format!("umount below {}", root.display()),
                output: format!("still mounted: {failed:?}"),
            }
            .into());
        }
        Ok(())
    }

    fn mount_tmpfs(&mut self, req: &AgentRequest, out: &mut Output<'_>) -> Result<()> {
        let path = self.under_roots(Path::new(first_arg(req)?))?;
        if mounts::mounted_paths()?.contains(&path) {
            return Ok(());
        }
        fs::create_dir_all(&path)?;
        let mut cmd = self.cfg.tmpfs_mount_command.clone();
        cmd.push(path.to_string_lossy().into_owned());
        self.run_plain(req, cmd, out)
    }

    fn umount_tmpfs(&mut self, req: &AgentRequest, out: &mut Output<'_>) -> Result<()> {
        let path = self.under_roots(Path::new(first_arg(req)?))?;
        if !mounts::mounted_paths()?.contains(&path) {
            return Ok(());
        }
        let mut cmd = self.cfg.tmpfs_umount_command.clone();
        cmd.push(path.to_string_lossy().into_owned());
        self.run_plain(req, cmd, out)
    }

    fn root_compress(&mut self, req: &AgentRequest) -> Result<()> {
        let [root, file] = req.args.as_slice() else {
            return Err(invalid("rootcompress requires a root and an archive"));
        };
        let root = self.under_roots(Path::new(root))?;
        let file = self.cache_file(file)?;
        log::info!("compressing '{}' into '{}'", root.display(), file.display());
        if self.dry_run {
            return Ok(());
        }
        archive::compress_tree(&root, &file)
    }

    fn root_decompress(&mut self, req: &AgentRequest) -> Result<()> {
        let [file, root] = req.args.as_slice() else {
            return Err(invalid("rootdecompress requires an archive and a root"));
        };
        let file = self.cache_file(file)?;
        let root = self.under_roots(Path::new(root))?;
        log::info!("unpacking '{}' into '{}'", file.display(), root.display());
        if self.dry_run {
            return Ok(());
        }
        archive::decompress_tree(&file, &root)
    }

    fn cache_file(&self, raw: &str) -> Result<PathBuf> {
        let path = Path::new(raw);
        if !is_below(&self.cfg.chroot_cache_dir, path)? {
            return Err(invalid(format!(
                "'{raw}' is outside '{}'",
                self.cfg.chroot_cache_dir.display()
            )));
        }
        normalize(path)
    }

    fn btrfs_snapshot(&mut self, req: &AgentRequest, out: &mut Output<'_>) -> Result<()> {
        let [from, to] = req.args.as_slice() else {
            return Err(invalid("btrfssnapshot requires a source and a destination"));
        };
        let from = self.under_roots(Path::new(from))?;
        let to = self.under_roots(Path::new(to))?;
        let mut cmd = self.cfg.btrfs_snapshot_subvol_command.clone();
        cmd.push(from.to_string_lossy().into_owned());
        cmd.push(to.to_string_lossy().into_owned());
        self.run_plain(req, cmd, out)
    }

    fn btrfs_create(&mut self, req: &AgentRequest, out: &mut Output<'_>) -> Result<()> {
        let path = self.under_roots(Path::new(first_arg(req)?))?;
        let mut cmd = self.cfg.btrfs_create_subvol_command.clone();
        cmd.push(path.to_string_lossy().into_owned());
        self.run_plain(req, cmd, out)
    }

    fn destroy_root(&mut self, req: &AgentRequest, out: &mut Output<'_>) -> Result<()> {
        let path = self.under_roots(Path::new(first_arg(req)?))?;
        let depth = path
            .strip_prefix(normalize(&self.cfg.roots_path)?)
            .map(|rel| rel.components().count())
            .unwrap_or(0);
        if depth < 2 {
            return Err(invalid(format!(
                "refusing to remove '{}', it is not a root",
                path.display()
            )));
        }
        if fs::symlink_metadata(&path).is_err() {
            return Ok(());
        }
        let still_mounted = mounts::mounts_below(&mounts::mounted_paths()?, &path);
        if !still_mounted.is_empty() {
            return Err(Error::RootState(format!(
                "refusing to remove '{}', filesystems are still mounted: {:?}",
                path.display(),
                still_mounted
            ))
            .into());
        }
        log::info!("removing '{}'", path.display());
        if self.dry_run {
            return Ok(());
        }
        if self.cfg.root_type == "chroot-with-btrfs" && depth == 2 {
            let mut cmd = self.cfg.btrfs_delete_subvol_command.clone();
            cmd.push(path.to_string_lossy().into_owned());
            return self.run_plain(req, cmd, out);
        }
        fs::remove_dir_all(&path).with_context(|| format!("removing '{}'", path.display()))
    }

    fn post_command(&mut self, req: &AgentRequest, out: &mut Output<'_>) -> Result<()> {
        self.require_root(req)?;
        if self.cfg.root_post_command.trim().is_empty() {
            return Ok(());
        }
        let mut args = self.cfg.su_for_post_command.clone();
        args.push(self.cfg.root_post_command.clone());
        self.execute(req, &args, Wrap { chroot: true, interactive: false }, out)
    }

    fn interactive_prepare(&mut self, req: &AgentRequest) -> Result<()> {
        let root = self.require_root(req)?;
        let user = first_arg(req)?;
        self.check_build_user(user)?;
        let line = self
            .cfg
            .sudo_pm_allow_format
            .replace("${user}", user)
            .replace("${commands}", &self.pm.allowed_pm_commands().join(", "));
        let sudoers = join_inside(&root, &self.cfg.sudoers.to_string_lossy());
        log::info!("allowing {user} to run package tools in '{}'", sudoers.display());
        if self.dry_run {
            return Ok(());
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&sudoers)
            .with_context(|| format!("opening '{}'", sudoers.display()))?;
        writeln!(file, "{line}")?;
        fs::set_permissions(&sudoers, fs::Permissions::from_mode(SUDOERS_MODE))?;
        Ok(())
    }

    fn interactive_shell(&mut self, req: &AgentRequest, out: &mut Output<'_>) -> Result<()> {
        let root = self.require_root(req)?;
        if !self.cfg.allow_interactive_shell {
            return Err(invalid("interactive shells are disabled for this target"));
        }
        let user = first_arg(req)?;
        self.check_build_user(user)?;
        let mut args = self.cfg.sudo_interactive_shell_command.clone();
        args.extend(["-u".to_string(), user.to_string()]);
        let root_str = root.to_string_lossy();
        args.extend(self.cfg.interactive_shell_command.iter().map(|a| {
            a.replace("${target}", &self.cfg.name)
                .replace("${root}", &root_str)
        }));
        match self.execute(req, &args, Wrap { chroot: true, interactive: true }, out) {
            Err(e) => match Error::find(&e) {
                Some(Error::Command { code, .. }) if *code != COMMAND_NOT_FOUND => Ok(()),
                _ => Err(e),
            },
            ok => ok,
        }
    }

    fn test(&self, out: &mut Output<'_>) -> Result<()> {
        if self.require_root && !crate::util::is_root() {
            return Err(Error::Setup("the privileged helper is not running as root".into()).into());
        }
        out.reply("OK")?;
        Ok(())
    }
}

fn first_arg(req: &AgentRequest) -> Result<&str> {
    req.args
        .first()
        .map(String::as_str)
        .ok_or_else(|| invalid(format!("{} requires an argument", req.op)))
}

fn set_owner(path: &Path, req: &AgentRequest) -> Result<()> {
    if req.uid.is_none() && req.gid.is_none() {
        return Ok(());
    }
    chown(
        path,
        req.uid.map(Uid::from_raw),
        req.gid.map(Gid::from_raw),
    )
    .with_context(|| format!("changing owner of '{}'", path.display()))
}

/// Copies one file like `install(1)`: into `dest` when it is a directory,
/// onto it otherwise. A symlink at the target is replaced, never followed.
fn install_file(src: &Path, dest: &Path, req: &AgentRequest) -> Result<PathBuf> {
    let target = match (dest.is_dir(), src.file_name()) {
        (true, Some(name)) => dest.join(name),
        (true, None) => return Err(invalid(format!("cannot copy '{}'", src.display()))),
        (false, _) => dest.to_path_buf(),
    };
    if let Ok(md) = fs::symlink_metadata(&target) {
        if md.file_type().is_symlink() {
            fs::remove_file(&target)?;
        }
    }
    fs::copy(src, &target)
        .with_context(|| format!("copying '{}' to '{}'", src.display(), target.display()))?;
    fs::set_permissions(
        &target,
        fs::Permissions::from_mode(req.mode.unwrap_or(DEFAULT_FILE_MODE)),
    )?;
    set_owner(&target, req)?;
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::testing::FakePackageManager;
    use tempfile::TempDir;

    fn command(tmp: &TempDir) -> RootCommand {
        let base = tmp.path().display();
        let mut config = Config::new().unwrap();
        config
            .merge_str(&format!("[target.t]\njurt-base-dir = \"{base}\"\n"))
            .unwrap();
        let cfg = config.target("t").unwrap();
        fs::create_dir_all(cfg.roots_path.join("active/r1/home")).unwrap();
        RootCommand::new(cfg, Box::new(FakePackageManager::default())).without_root_check()
    }

    #[test]
    fn test_paths_outside_roots_are_refused() {
        let tmp = TempDir::new().unwrap();
        let mut cmd = command(&tmp);
        let req = AgentRequest::new(OpType::Mkdir).arg("/etc/evil");
        let err = cmd.handle(&req).unwrap_err();
        assert_eq!(Error::find(&err).unwrap().wire_status(), 2);

        let sneaky = format!("{}/../../etc", cmd.target().roots_path.display());
        let req = AgentRequest::new(OpType::Mkdir).arg(sneaky);
        assert!(cmd.handle(&req).is_err());
    }

    #[test]
    fn test_copy_into_root() {
        let tmp = TempDir::new().unwrap();
        let mut cmd = command(&tmp);
        let src = tmp.path().join("foo-1.0-1.src.rpm");
        fs::write(&src, "payload").unwrap();
        let home = cmd.target().roots_path.join("active/r1/home");

        let req = AgentRequest::new(OpType::Copy)
            .mode(Some(0o600))
            .args([src.display().to_string(), home.display().to_string()]);
        cmd.handle(&req).unwrap();
        let copied = home.join("foo-1.0-1.src.rpm");
        assert_eq!(fs::read_to_string(&copied).unwrap(), "payload");
        assert_eq!(fs::metadata(&copied).unwrap().permissions().mode() & 0o777, 0o600);
    }

    #[test]
    fn test_symlink_escape_is_refused() {
        let tmp = TempDir::new().unwrap();
        let mut cmd = command(&tmp);
        let outside = tmp.path().join("outside");
        fs::create_dir_all(&outside).unwrap();
        let link = cmd.target().roots_path.join("active/r1/home/evil");
        std::os::unix::fs::symlink(&outside, &link).unwrap();
        let src = tmp.path().join("f");
        fs::write(&src, "x").unwrap();

        let req = AgentRequest::new(OpType::Copy)
            .args([src.display().to_string(), link.join("f").display().to_string()]);
        assert!(cmd.handle(&req).is_err());
        assert!(!outside.join("f").exists());
    }

    #[test]
    fn test_mkdir_and_copy_out_do_not_follow_links_outside() {
        let tmp = TempDir::new().unwrap();
        let mut cmd = command(&tmp);
        let outside = tmp.path().join("outside");
        fs::create_dir_all(&outside).unwrap();
        fs::write(outside.join("secret"), "s").unwrap();
        let home = cmd.target().roots_path.join("active/r1/home");
        std::os::unix::fs::symlink(&outside, home.join("evil")).unwrap();
        std::os::unix::fs::symlink(outside.join("secret"), home.join("leak")).unwrap();

        let req = AgentRequest::new(OpType::Mkdir)
            .mode(Some(0o777))
            .arg(home.join("evil/made").display().to_string());
        let err = cmd.handle(&req).unwrap_err();
        assert_eq!(Error::find(&err).unwrap().wire_status(), 2);
        assert!(!outside.join("made").exists());

        let req = AgentRequest::new(OpType::Mkdir).arg(home.join("ok/nested").display().to_string());
        cmd.handle(&req).unwrap();
        assert!(home.join("ok/nested").is_dir());

        let dest = cmd.target().success_dir.join("b1");
        fs::create_dir_all(&dest).unwrap();
        let req = AgentRequest::new(OpType::CopyOut)
            .args([home.join("leak").display().to_string(), dest.display().to_string()]);
        assert!(cmd.handle(&req).is_err());
        assert!(!dest.join("leak").exists());

        std::os::unix::fs::symlink(&outside, dest.join("elsewhere")).unwrap();
        fs::write(home.join("pkg.rpm"), "rpm").unwrap();
        let req = AgentRequest::new(OpType::CopyOut).args([
            home.join("pkg.rpm").display().to_string(),
            dest.join("elsewhere").display().to_string(),
        ]);
        assert!(cmd.handle(&req).is_err());
        assert!(!outside.join("pkg.rpm").exists());

        let req = AgentRequest::new(OpType::CopyOut)
            .args([home.join("pkg.rpm").display().to_string(), dest.display().to_string()]);
        cmd.handle(&req).unwrap();
        assert_eq!(fs::read_to_string(dest.join("pkg.rpm")).unwrap(), "rpm");
    }

    #[test]
    fn test_captured_output() {
        let tmp = TempDir::new().unwrap();
        let mut cmd = command(&tmp);
        let mut buf = Vec::new();
        cmd.handle_to(&AgentRequest::new(OpType::Test), &mut Output::Capture(&mut buf))
            .unwrap();
        assert_eq!(buf, b"OK\n");
    }

    #[test]
    fn test_rename_and_destroy() {
        let tmp = TempDir::new().unwrap();
        let mut cmd = command(&tmp);
        let roots = cmd.target().roots_path.clone();
        fs::create_dir_all(roots.join("old")).unwrap();

        let req = AgentRequest::new(OpType::Rename).args([
            roots.join("active/r1").display().to_string(),
            roots.join("old/r1").display().to_string(),
        ]);
        cmd.handle(&req).unwrap();
        assert!(roots.join("old/r1/home").is_dir());

        let refuse = AgentRequest::new(OpType::DestroyRoot).arg(roots.join("old").display().to_string());
        assert!(cmd.handle(&refuse).is_err());
        assert!(roots.join("old").is_dir());

        let req = AgentRequest::new(OpType::DestroyRoot).arg(roots.join("old/r1").display().to_string());
        cmd.handle(&req).unwrap();
        assert!(!roots.join("old/r1").exists());
        // Destroying a missing root is a no-op.
        cmd.handle(&req).unwrap();
    }

    #[test]
    fn test_run_cmd_checks_user() {
        let tmp = TempDir::new().unwrap();
        let mut cmd = command(&tmp);
        let root = cmd.target().roots_path.join("active/r1");
        let req = AgentRequest::new(OpType::RunCmd)
            .root(&root)
            .run_as("mallory")
            .arg("true");
        assert!(cmd.handle(&req).is_err());
    }
}
