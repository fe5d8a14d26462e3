//! Request loop of `jurt-root-command`.
//!
//! In agent mode requests arrive one per line on stdin. Command output goes
//! to stdout and diagnostics to stderr; after each request the loop flushes
//! stdout and writes `\n<cookie> OK` or `\n<cookie> ERROR <code>` on stderr.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::io::{self, BufRead, Write};

use anyhow::{Context, Result};

use super::ops::RootCommand;
use super::protocol::{sentinel_line, AgentRequest, OpType, Status};
use crate::config::Config;
use crate::error::Error;
use crate::pm::PmFactory;
use crate::registry::Registry;

pub trait RequestHandler {
    fn handle(&mut self, req: &AgentRequest) -> Result<()>;
}

impl RequestHandler for RootCommand {
    fn handle(&mut self, req: &AgentRequest) -> Result<()> {
        RootCommand::handle(self, req)
    }
}

/// Serves requests from `input` until it is closed.
pub fn serve<R: BufRead, W: Write>(
    input: R,
    diag: &mut W,
    cookie: &str,
    handler: &mut dyn RequestHandler,
) -> Result<()> {
    for line in input.lines() {
        let line = line.context("reading request")?;
        if line.trim().is_empty() {
            continue;
        }
        let status = match AgentRequest::decode_line(&line) {
            Ok(req) => match handler.handle(&req) {
                Ok(()) => Status::Ok,
                Err(e) => report(diag, &e),
            },
            Err(e) => report(diag, &e.into()),
        };
        let _ = io::stdout().flush();
        let written = write!(diag, "\n{}\n", sentinel_line(cookie, status)).and_then(|_| diag.flush());
        match written {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                log::debug!("controller went away");
                return Ok(());
            }
            Err(e) => return Err(e).context("writing status"),
        }
    }
    Ok(())
}

fn report<W: Write>(diag: &mut W, err: &anyhow::Error) -> Status {
    let _ = writeln!(diag, "error: {err:#}");
    Status::Error(Error::find(err).map_or(1, Error::wire_status))
}

/// Routes requests to one [`RootCommand`] per target, created on first use.
pub struct Dispatcher {
    config: Config,
    pms: Registry<PmFactory>,
    handlers: BTreeMap<String, RootCommand>,
    dry_run: bool,
    require_root: bool,
}

impl Dispatcher {
    pub fn new(config: Config, pms: Registry<PmFactory>) -> Self {
        Self {
            config,
            pms,
            handlers: BTreeMap::new(),
            dry_run: false,
            require_root: true,
        }
    }

    pub fn dry_run(mut self, on: bool) -> Self {
        self.dry_run = on;
        self
    }

    pub fn without_root_check(mut self) -> Self {
        self.require_root = false;
        self
    }

    fn handler_for(&mut self, target: &str) -> Result<&mut RootCommand> {
        match self.handlers.entry(target.to_string()) {
            Entry::Occupied(e) => Ok(e.into_mut()),
            Entry::Vacant(e) => {
                let cfg = self.config.target(target)?;
                let factory = self.pms.get(&cfg.pm_type)?;
                let pm = factory(&cfg)?;
                let mut cmd = RootCommand::new(cfg, pm).dry_run(self.dry_run);
                if !self.require_root {
                    cmd = cmd.without_root_check();
                }
                log::debug!("loaded target {target}");
                Ok(e.insert(cmd))
            }
        }
    }

    /// Runs one request outside the loop and returns the exit status.
    pub fn run_once(&mut self, req: &AgentRequest) -> i32 {
        match self.handle(req) {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("error: {e:#}");
                Error::find(&e).map_or(1, Error::wire_status)
            }
        }
    }
}

impl RequestHandler for Dispatcher {
    fn handle(&mut self, req: &AgentRequest) -> Result<()> {
        match &req.target {
            Some(target) => {
                let target = target.clone();
                self.handler_for(&target)?.handle(req)
            }
            None if req.op == OpType::Test => {
                if self.require_root && !crate::util::is_root() {
                    return Err(Error::Setup("the privileged helper is not running as root".into()).into());
                }
                println!("OK");
                Ok(())
            }
            None => Err(Error::InvalidRequest(format!("{} requires --target", req.op)).into()),
        }
    }
}

/// Agent mode: serve stdin until the controller closes it.
pub fn run_agent(cookie: &str, dispatcher: &mut Dispatcher) -> Result<()> {
    let stdin = io::stdin();
    let mut stderr = io::stderr();
    log::debug!("agent ready");
    serve(stdin.lock(), &mut stderr, cookie, dispatcher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use std::io::Cursor;
    use tempfile::TempDir;

    struct Scripted(Vec<Result<(), i32>>);

    impl RequestHandler for Scripted {
        fn handle(&mut self, _req: &AgentRequest) -> Result<()> {
            match self.0.remove(0) {
                Ok(()) => Ok(()),
                Err(code) => Err(Error::Command {
                    code,
                    cmdline: "false".into(),
                    output: String::new(),
                }
                .into()),
            }
        }
    }

    #[test]
    fn test_serve_writes_sentinels() {
        let input = Cursor::new("test\n\nrunpm --pm urpmi -- --auto foo\nbogus-op\n");
        let mut diag = Vec::new();
        let mut handler = Scripted(vec![Ok(()), Err(7)]);
        serve(input, &mut diag, "c00kie", &mut handler).unwrap();

        let diag = String::from_utf8(diag).unwrap();
        let sentinels: Vec<&str> = diag.lines().filter(|l| l.starts_with("c00kie")).collect();
        assert_eq!(sentinels, vec!["c00kie OK", "c00kie ERROR 7", "c00kie ERROR 2"]);
        assert!(diag.contains("error: invalid request"));
    }

    #[test]
    fn test_dispatcher_routes_by_target() {
        let tmp = TempDir::new().unwrap();
        let config = testing::config(tmp.path());
        let roots = config.target("t").unwrap().roots_path;
        std::fs::create_dir_all(&roots).unwrap();
        let mut dispatcher = Dispatcher::new(config, testing::pm_registry()).without_root_check();

        let req = AgentRequest::new(OpType::Mkdir)
            .target("t")
            .arg(roots.join("temp/r1").display().to_string());
        assert_eq!(dispatcher.run_once(&req), 0);
        assert!(roots.join("temp/r1").is_dir());

        let unknown = AgentRequest::new(OpType::Mkdir).target("nope").arg("/tmp/x");
        assert_eq!(dispatcher.run_once(&unknown), 2);
        assert_eq!(dispatcher.run_once(&AgentRequest::new(OpType::Test)), 0);
        assert_eq!(dispatcher.run_once(&AgentRequest::new(OpType::Mkdir)), 2);
    }
}
