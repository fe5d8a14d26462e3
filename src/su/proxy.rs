//! Controller side of the privileged agent.
//!
//! The agent is started lazily through the configured sudo command and kept
//! for the whole session. Each request is one line on its stdin; the proxy
//! then multiplexes the agent's stdout and stderr with a bounded poll,
//! forwarding output to the caller's sink until the sentinel carrying this
//! proxy's cookie shows up on stderr.

use std::io::{self, Read, Write};
use std::os::fd::AsFd;
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};

use super::interrupt;
use super::poll::wait_readable;
use super::timeout_aware;
use crate::agent::protocol::{parse_sentinel, AgentRequest, Status};
use crate::error::Error;
use crate::logstore::OutputSink;
use crate::util::shell_join;

static NEXT_COOKIE: AtomicU64 = AtomicU64::new(0);

const READ_CHUNK: usize = 8192;

pub struct AgentProxy {
    command: Vec<String>,
    poll_interval: Duration,
    cookie: String,
    interrupt: &'static AtomicBool,
    agent: Option<RunningAgent>,
}

struct RunningAgent {
    child: Child,
    stdin: ChildStdin,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
}

enum Outcome {
    Reply(Status),
    Exited(String),
}

impl AgentProxy {
    /// `command` is the full privileged prefix, e.g. `sudo -n jurt-root-command`.
    pub fn new(command: Vec<String>, poll_interval: Duration) -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos();
        let cookie = format!(
            "jurt-{}-{:08x}-{}",
            std::process::id(),
            nanos,
            NEXT_COOKIE.fetch_add(1, Ordering::SeqCst)
        );
        Self {
            command,
            poll_interval,
            cookie,
            interrupt: interrupt::flag(),
            agent: None,
        }
    }

    /// Watches `flag` instead of the process-wide SIGINT flag.
    pub fn with_interrupt_flag(mut self, flag: &'static AtomicBool) -> Self {
        self.interrupt = flag;
        self
    }

    pub fn cookie(&self) -> &str {
        &self.cookie
    }

    pub fn is_running(&self) -> bool {
        self.agent.is_some()
    }

    fn spawn(&self) -> Result<RunningAgent> {
        let (program, rest) = self
            .command
            .split_first()
            .ok_or_else(|| Error::Config("empty privileged helper command".into()))?;
        let mut child = Command::new(program)
            .args(rest)
            .args(["--agent", "--cookie", &self.cookie])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("starting privileged agent {}", shell_join(&self.command)))?;
        log::debug!("started privileged agent (pid {})", child.id());
        Ok(RunningAgent {
            stdin: child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("agent stdin not captured"))?,
            stdout: child.stdout.take(),
            stderr: child.stderr.take(),
            child,
        })
    }

    /// Sends one request and waits for its completion. Output goes to `sink`
    /// when given and is returned otherwise.
    pub fn exec(
        &mut self,
        req: &AgentRequest,
        mut sink: Option<&mut dyn OutputSink>,
    ) -> Result<String> {
        let line = req.encode_line()?;
        let location = sink.as_ref().map(|s| s.location());
        if let Some(s) = sink.as_mut() {
            writeln!(s, ">>>> running privileged agent: {line}")?;
        }

        let mut captured = Vec::new();
        let outcome = match sink {
            Some(s) => self.round_trip(&line, s)?,
            None => self.round_trip(&line, &mut captured)?,
        };
        let output = || match &location {
            Some(loc) => format!("(output available in {loc})"),
            None => String::from_utf8_lossy(&captured).into_owned(),
        };
        let result = match outcome {
            Outcome::Reply(Status::Ok) => Ok(String::from_utf8_lossy(&captured).into_owned()),
            Outcome::Reply(Status::Error(code)) => Err(Error::Command {
                code,
                cmdline: line.clone(),
                output: output(),
            }
            .into()),
            Outcome::Exited(status) => Err(Error::Agent {
                status,
                output: output(),
            }
            .into()),
        };
        timeout_aware(req, result)
    }

    fn round_trip<W: Write + ?Sized>(&mut self, line: &str, out: &mut W) -> Result<Outcome> {
        if self.agent.is_none() {
            self.agent = Some(self.spawn()?);
        }
        let agent = self
            .agent
            .as_mut()
            .ok_or_else(|| anyhow!("agent not running"))?;
        let sent = agent
            .stdin
            .write_all(format!("{line}\n").as_bytes())
            .and_then(|_| agent.stdin.flush());
        if let Err(e) = sent {
            log::debug!("agent did not take the request: {e}");
            return Ok(Outcome::Exited(self.reap()));
        }

        let mut scanner = StderrScanner::default();
        let mut buf = [0u8; READ_CHUNK];
        loop {
            if self.interrupt.swap(false, Ordering::SeqCst) {
                self.reap();
                return Err(Error::Interrupted.into());
            }
            let agent = self
                .agent
                .as_mut()
                .ok_or_else(|| anyhow!("agent not running"))?;
            if agent.stdout.is_none() && agent.stderr.is_none() {
                return Ok(Outcome::Exited(self.reap()));
            }

            let ready = wait_readable(
                &[
                    agent.stdout.as_ref().map(AsFd::as_fd),
                    agent.stderr.as_ref().map(AsFd::as_fd),
                ],
                self.poll_interval,
            )?;
            if ready[0] {
                if let Some(n) = read_some(&mut agent.stdout, &mut buf) {
                    out.write_all(&buf[..n])?;
                }
            }
            if ready[1] {
                if let Some(n) = read_some(&mut agent.stderr, &mut buf) {
                    scanner.pending.extend_from_slice(&buf[..n]);
                    if let Some(status) = scanner.take_lines(&self.cookie, out)? {
                        drain_ready(&mut agent.stdout, &mut buf, out)?;
                        return Ok(Outcome::Reply(status));
                    }
                }
            }
            if !ready[0] && !ready[1] && agent.child.try_wait()?.is_some() {
                return Ok(Outcome::Exited(self.reap()));
            }
        }
    }

    /// Runs an interactive request as a one-shot helper invocation attached to
    /// the terminal, bypassing the running agent.
    pub fn exec_interactive(&mut self, req: &AgentRequest) -> Result<()> {
        let mut argv = self.command.clone();
        argv.extend(req.to_args());
        let cmdline = shell_join(&argv);
        let (program, rest) = argv
            .split_first()
            .ok_or_else(|| Error::Config("empty privileged helper command".into()))?;
        let status = Command::new(program)
            .args(rest)
            .status()
            .with_context(|| format!("running {cmdline}"))?;
        if status.success() {
            return Ok(());
        }
        Err(Error::Command {
            code: status.code().unwrap_or(-1),
            cmdline,
            output: "(interactive session, output went to the terminal)".into(),
        }
        .into())
    }

    /// Forgets the agent, killing it if it is still alive, and describes how
    /// it ended.
    fn reap(&mut self) -> String {
        let Some(mut agent) = self.agent.take() else {
            return "not running".into();
        };
        drop(agent.stdin);
        let status = match agent.child.try_wait() {
            Ok(Some(status)) => Ok(status),
            _ => {
                let _ = agent.child.kill();
                agent.child.wait()
            }
        };
        match status {
            Ok(status) => status.to_string(),
            Err(e) => format!("unknown status: {e}"),
        }
    }

    /// Closes the request pipe and waits for the agent to leave.
    pub fn shutdown(&mut self) {
        if let Some(mut agent) = self.agent.take() {
            drop(agent.stdin);
            if let Err(e) = agent.child.wait() {
                log::warn!("waiting for privileged agent: {e}");
            }
        }
    }
}

impl Drop for AgentProxy {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Reads once; closes the pipe on end of file or error.
fn read_some<R: Read>(pipe: &mut Option<R>, buf: &mut [u8]) -> Option<usize> {
    let reader = pipe.as_mut()?;
    match reader.read(buf) {
        Ok(0) => {
            *pipe = None;
            None
        }
        Ok(n) => Some(n),
        Err(e) if e.kind() == io::ErrorKind::Interrupted => None,
        Err(_) => {
            *pipe = None;
            None
        }
    }
}

/// Forwards whatever is already buffered on `pipe` without blocking.
fn drain_ready<R, W>(pipe: &mut Option<R>, buf: &mut [u8], out: &mut W) -> Result<()>
where
    R: Read + AsFd,
    W: Write + ?Sized,
{
    loop {
        if pipe.is_none() {
            return Ok(());
        }
        if !wait_readable(&[pipe.as_ref().map(AsFd::as_fd)], Duration::ZERO)?[0] {
            return Ok(());
        }
        match read_some(pipe, buf) {
            Some(n) => out.write_all(&buf[..n])?,
            None => return Ok(()),
        }
    }
}

/// Splits agent stderr into lines, forwarding output and catching the
/// sentinel. The blank line the agent emits right before a sentinel is
/// swallowed.
#[derive(Default)]
struct StderrScanner {
    pending: Vec<u8>,
    held_blank: bool,
}

impl StderrScanner {
    fn take_lines<W: Write + ?Sized>(&mut self, cookie: &str, out: &mut W) -> io::Result<Option<Status>> {
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line);
            if let Some(status) = parse_sentinel(cookie, text.trim()) {
                self.held_blank = false;
                if !self.pending.is_empty() {
                    out.write_all(&self.pending)?;
                    self.pending.clear();
                }
                return Ok(Some(status));
            }
            if self.held_blank {
                out.write_all(b"\n")?;
                self.held_blank = false;
            }
            if line == b"\n" {
                self.held_blank = true;
            } else {
                out.write_all(&line)?;
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::protocol::OpType;

    const ECHO_AGENT: &str = r#"
while read -r line; do
  echo "out: $line"
  echo "diag: $line" >&2
  printf '\n%s OK\n' "$3" >&2
done
"#;

    const FAILING_AGENT: &str = r#"
while read -r line; do
  echo "rpmbuild exploded" >&2
  printf '\n%s ERROR 124\n' "$3" >&2
done
"#;

    const DYING_AGENT: &str = r#"
read -r line
echo "partial" >&2
exit 3
"#;

    const ONE_SHOT_AGENT: &str = r#"
read -r line
printf '\n%s OK\n' "$3" >&2
exit 0
"#;

    fn proxy(script: &str) -> AgentProxy {
        AgentProxy::new(
            vec!["sh".into(), "-c".into(), script.into(), "fake-agent".into()],
            Duration::from_millis(20),
        )
    }

    fn request() -> AgentRequest {
        AgentRequest::new(OpType::RunCmd).arg("rpmbuild")
    }

    #[test]
    fn test_ok_reply_collects_output() {
        let mut proxy = proxy(ECHO_AGENT);
        let output = proxy.exec(&request(), None).unwrap();
        assert!(output.contains("out: runcmd -- rpmbuild"), "{output:?}");
        assert!(output.contains("diag: runcmd -- rpmbuild"), "{output:?}");
        assert!(!output.contains(proxy.cookie()));
        assert!(proxy.is_running());

        // The same agent serves the next request.
        proxy.exec(&request(), None).unwrap();
        assert!(proxy.is_running());
    }

    #[test]
    fn test_exit_124_without_timeout_is_command_error() {
        let mut proxy = proxy(FAILING_AGENT);
        let err = proxy.exec(&request(), None).unwrap_err();
        match Error::find(&err) {
            Some(Error::Command { code, output, .. }) => {
                assert_eq!(*code, 124);
                assert!(output.contains("rpmbuild exploded"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_exit_124_with_timeout_is_timeout() {
        let mut proxy = proxy(FAILING_AGENT);
        let err = proxy
            .exec(&request().timeout(Some(5)), None)
            .unwrap_err();
        assert!(matches!(Error::find(&err), Some(Error::Timeout { .. })));
    }

    #[test]
    fn test_agent_death_is_agent_error() {
        let mut proxy = proxy(DYING_AGENT);
        let err = proxy.exec(&request(), None).unwrap_err();
        match Error::find(&err) {
            Some(Error::Agent { status, output }) => {
                assert!(status.contains('3'), "{status}");
                assert!(output.contains("partial"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!proxy.is_running());
    }

    #[test]
    fn test_agent_is_restarted_after_exit() {
        let mut proxy = proxy(ONE_SHOT_AGENT);
        proxy.exec(&request(), None).unwrap();
        assert!(proxy.exec(&request(), None).is_err());
        assert!(!proxy.is_running());
        proxy.exec(&request(), None).unwrap();
    }

    #[test]
    fn test_interrupt_reaps_agent() {
        static FLAG: AtomicBool = AtomicBool::new(false);
        let mut proxy = proxy("while read -r line; do sleep 30; done").with_interrupt_flag(&FLAG);
        FLAG.store(true, Ordering::SeqCst);
        let err = proxy.exec(&request(), None).unwrap_err();
        assert!(crate::error::is_interrupted(&err));
        assert!(!proxy.is_running());
    }

    #[test]
    fn test_scanner_swallows_separator_only() {
        let mut scanner = StderrScanner::default();
        let mut out = Vec::new();
        scanner.pending.extend_from_slice(b"a\n\nb\nno newline");
        assert_eq!(scanner.take_lines("c", &mut out).unwrap(), None);
        scanner.pending.extend_from_slice(b"\n\nc ERROR 2\n");
        assert_eq!(
            scanner.take_lines("c", &mut out).unwrap(),
            Some(Status::Error(2))
        );
        assert_eq!(out, b"a\n\nb\nno newline\n");
    }
}
