//! Composition and execution of the external commands behind agent ops.

use std::fs::File;
use std::io::{self, Write};
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use nix::fcntl::OFlag;

use super::protocol::AgentRequest;
use crate::config::TargetConfig;
use crate::error::Error;
use crate::util::shell_join;

/// How a request's command line is wrapped before execution.
#[derive(Debug, Clone, Copy, Default)]
pub struct Wrap {
    /// Enter the request's root with the chroot command.
    pub chroot: bool,
    /// Inherit the terminal instead of detaching stdin.
    pub interactive: bool,
}

/// Builds the full argv: `timeout`, arch personality, chroot, remount and
/// `su` are layered around `args` in that order, each only when requested.
pub fn compose(
    cfg: &TargetConfig,
    req: &AgentRequest,
    args: &[String],
    host_arch: Option<&str>,
    wrap: Wrap,
) -> Result<Vec<String>> {
    let mut cmd = Vec::new();
    if let Some(secs) = req.timeout {
        cmd.extend(cfg.timeout_command.iter().cloned());
        cmd.push(secs.to_string());
    }
    if let (Some(_), Some(arch)) = (&req.root, &req.arch) {
        if Some(arch.as_str()) != host_arch {
            if let Some(personality) = cfg.arch_map.get(arch) {
                cmd.extend(personality.iter().cloned());
            }
        }
    }
    if wrap.chroot && !cfg.chroot_command.is_empty() {
        let root = req.root.as_ref().ok_or_else(|| {
            Error::InvalidRequest(format!("{} requires --root", req.op))
        })?;
        cmd.extend(cfg.chroot_command.iter().cloned());
        cmd.push(root.to_string_lossy().into_owned());
    }
    if req.remount {
        cmd.extend(cfg.remount_command.iter().cloned());
    }
    match &req.run_as {
        Some(user) if !cfg.su_command.is_empty() => {
            cmd.extend(cfg.su_command.iter().cloned());
            cmd.push(user.clone());
            cmd.push("-c".to_string());
            cmd.push(shell_join(args));
        }
        _ => cmd.extend(args.iter().cloned()),
    }
    if cmd.is_empty() {
        return Err(Error::InvalidRequest(format!("{} got an empty command", req.op)).into());
    }
    Ok(cmd)
}

/// Where executed commands and the agent's own notes write to.
pub enum Output<'a> {
    /// The agent's stdout and stderr.
    Inherit,
    /// One writer taking the child's stdout and stderr in arrival order.
    Capture(&'a mut dyn Write),
}

impl Output<'_> {
    /// A progress or failure note; stderr when inheriting.
    pub fn note(&mut self, line: &str) -> io::Result<()> {
        match self {
            Output::Inherit => {
                eprintln!("{line}");
                Ok(())
            }
            Output::Capture(w) => writeln!(w, "{line}"),
        }
    }

    /// A reply line; stdout when inheriting.
    pub fn reply(&mut self, line: &str) -> io::Result<()> {
        match self {
            Output::Inherit => {
                println!("{line}");
                Ok(())
            }
            Output::Capture(w) => writeln!(w, "{line}"),
        }
    }
}

/// Runs `cmd`, sending its stdout (and stderr unless ignored) to `out`, and
/// turns a non-zero exit into [`Error::Command`] unless the request ignores
/// errors. Interactive commands always keep the terminal.
pub fn run(
    cmd: &[String],
    req: &AgentRequest,
    wrap: Wrap,
    dry_run: bool,
    out: &mut Output<'_>,
) -> Result<()> {
    let cmdline = shell_join(cmd);
    if !req.quiet && !wrap.interactive {
        out.note(&format!(">>>>>> running: {cmdline}"))?;
    }
    if dry_run {
        return Ok(());
    }
    let (program, rest) = cmd
        .split_first()
        .ok_or_else(|| Error::InvalidRequest("empty command".into()))?;
    let mut command = Command::new(program);
    command.args(rest);
    if !wrap.interactive {
        command.stdin(Stdio::null());
    }
    if req.ignore_stderr {
        command.stderr(Stdio::null());
    }
    let status = match out {
        Output::Capture(sink) if !wrap.interactive => {
            let (reader, writer) =
                nix::unistd::pipe2(OFlag::O_CLOEXEC).context("creating output pipe")?;
            if !req.ignore_stderr {
                command.stderr(Stdio::from(writer.try_clone()?));
            }
            command.stdout(Stdio::from(writer));
            let mut child = command
                .spawn()
                .with_context(|| format!("executing {program}"))?;
            // The write ends live in `command` until it is dropped.
            drop(command);
            io::copy(&mut File::from(reader), sink)
                .with_context(|| format!("reading output of {program}"))?;
            child.wait()?
        }
        _ => command
            .status()
            .with_context(|| format!("executing {program}"))?,
    };
    if status.success() {
        return Ok(());
    }
    let code = status.code().unwrap_or(-1);
    if req.ignore_errors {
        log::debug!("ignoring exit code {code} from {cmdline}");
        return Ok(());
    }
    if !req.quiet {
        out.note(&format!("command failed with {code} (output above)"))?;
    }
    Err(Error::Command {
        code,
        cmdline,
        output: String::new(),
    }
    .into())
}
