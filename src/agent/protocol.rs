//! Line protocol between the controller and the privileged agent.
//!
//! Requests travel on the agent's stdin, one per line:
//!
//! ```text
//! request := op { flag } [ "--" { arg } ]
//! flag    := "--target" NAME | "--timeout" SECS | "--root" PATH
//!          | "--arch" ARCH | "--run-as" USER | "--pm" NAME
//!          | "--uid" N | "--gid" N | "--mode" OCTAL
//!          | "--remount" | "--ignore-errors" | "--quiet" | "--ignore-stderr"
//! ```
//!
//! Every token is shell-quoted, so arguments may hold spaces, quotes or be
//! empty; newlines are not representable. The op may also be given as
//! `--type OP` when the first token is a flag, which is the shape the one-shot
//! command line uses.
//!
//! Completion is reported on stderr with a sentinel line preceded by a
//! newline: `<cookie> OK` or `<cookie> ERROR <code>`. Everything else on the
//! agent's stdout and stderr is command output.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Result;

use crate::error::Error;
use crate::util::shell_join;

macro_rules! op_types {
    ($($variant:ident => $name:literal,)*) => {
        /// Privileged operations the agent knows how to perform.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum OpType {
            $($variant,)*
        }

        impl OpType {
            pub const ALL: &'static [OpType] = &[$(OpType::$variant,)*];

            pub fn as_str(self) -> &'static str {
                match self {
                    $(OpType::$variant => $name,)*
                }
            }
        }
    };
}

op_types! {
    AddUser => "adduser",
    Copy => "copy",
    CopyOut => "copyout",
    CheapCopy => "cheapcopy",
    Mkdir => "mkdir",
    CreateDevs => "createdevs",
    Rename => "rename",
    RunCmd => "runcmd",
    RunPm => "runpm",
    MountAll => "mountall",
    UmountAll => "umountall",
    MountTmpfs => "mounttmpfs",
    UmountTmpfs => "umounttmpfs",
    RootCompress => "rootcompress",
    RootDecompress => "rootdecompress",
    BtrfsSnapshot => "btrfssnapshot",
    BtrfsCreate => "btrfscreate",
    DestroyRoot => "destroyroot",
    PostCommand => "postcommand",
    InteractivePrepare => "interactiveprepare",
    InteractiveShell => "interactiveshell",
    Test => "test",
}

impl FromStr for OpType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        OpType::ALL
            .iter()
            .copied()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| Error::InvalidRequest(format!("unknown operation: {s}")))
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRequest {
    pub op: OpType,
    pub target: Option<String>,
    pub timeout: Option<u64>,
    pub root: Option<PathBuf>,
    pub arch: Option<String>,
    pub remount: bool,
    pub ignore_errors: bool,
    pub quiet: bool,
    pub ignore_stderr: bool,
    pub run_as: Option<String>,
    pub pm: Option<String>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub mode: Option<u32>,
    pub args: Vec<String>,
}

impl AgentRequest {
    pub fn new(op: OpType) -> Self {
        Self {
            op,
            target: None,
            timeout: None,
            root: None,
            arch: None,
            remount: false,
            ignore_errors: false,
            quiet: false,
            ignore_stderr: false,
            run_as: None,
            pm: None,
            uid: None,
            gid: None,
            mode: None,
            args: Vec::new(),
        }
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn timeout(mut self, secs: Option<u64>) -> Self {
        self.timeout = secs;
        self
    }

    pub fn root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    pub fn arch(mut self, arch: impl Into<String>) -> Self {
        self.arch = Some(arch.into());
        self
    }

    pub fn run_as(mut self, user: impl Into<String>) -> Self {
        self.run_as = Some(user.into());
        self
    }

    pub fn pm(mut self, pm: impl Into<String>) -> Self {
        self.pm = Some(pm.into());
        self
    }

    pub fn owner(mut self, uid: Option<u32>, gid: Option<u32>) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }

    pub fn mode(mut self, mode: Option<u32>) -> Self {
        self.mode = mode;
        self
    }

    pub fn ignore_errors(mut self) -> Self {
        self.ignore_errors = true;
        self
    }

    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Unquoted tokens, op first.
    pub fn to_args(&self) -> Vec<String> {
        let mut out = vec![self.op.as_str().to_string()];
        let mut opt = |flag: &str, value: Option<String>| {
            if let Some(value) = value {
                out.push(flag.to_string());
                out.push(value);
            }
        };
        opt("--target", self.target.clone());
        opt("--timeout", self.timeout.map(|t| t.to_string()));
        opt(
            "--root",
            self.root.as_ref().map(|r| r.to_string_lossy().into_owned()),
        );
        opt("--arch", self.arch.clone());
        opt("--run-as", self.run_as.clone());
        opt("--pm", self.pm.clone());
        opt("--uid", self.uid.map(|v| v.to_string()));
        opt("--gid", self.gid.map(|v| v.to_string()));
        opt("--mode", self.mode.map(|v| format!("{v:o}")));
        for (set, flag) in [
            (self.remount, "--remount"),
            (self.ignore_errors, "--ignore-errors"),
            (self.quiet, "--quiet"),
            (self.ignore_stderr, "--ignore-stderr"),
        ] {
            if set {
                out.push(flag.to_string());
            }
        }
        if !self.args.is_empty() {
            out.push("--".to_string());
            out.extend(self.args.iter().cloned());
        }
        out
    }

    /// One request line, without the trailing newline.
    pub fn encode_line(&self) -> Result<String, Error> {
        let tokens = self.to_args();
        if tokens.iter().any(|t| t.contains('\n') || t.contains('\r')) {
            return Err(Error::InvalidRequest(
                "arguments must not contain line breaks".into(),
            ));
        }
        Ok(shell_join(&tokens))
    }

    pub fn decode_line(line: &str) -> Result<Self, Error> {
        let tokens = shlex::split(line.trim_end_matches(['\r', '\n']))
            .ok_or_else(|| Error::InvalidRequest(format!("unbalanced quoting: {line}")))?;
        Self::from_args(tokens)
    }

    pub fn from_args<I, S>(tokens: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut tokens = tokens.into_iter().map(Into::into).peekable();
        let mut op = match tokens.peek() {
            Some(first) if !first.starts_with("--") => {
                let first = tokens.next().unwrap_or_default();
                Some(first.parse::<OpType>()?)
            }
            Some(_) => None,
            None => return Err(Error::InvalidRequest("empty request".into())),
        };

        let mut req = AgentRequest::new(OpType::Test);
        let mut positional = Vec::new();
        while let Some(token) = tokens.next() {
            let tokens = &mut tokens;
            match token.as_str() {
                "--" => {
                    positional.extend(tokens);
                    break;
                }
                "--type" => op = Some(flag_value(tokens, "--type")?.parse()?),
                "--target" => req.target = Some(flag_value(tokens, "--target")?),
                "--timeout" => {
                    req.timeout = Some(parse_number(&flag_value(tokens, "--timeout")?, 10)?)
                }
                "--root" => req.root = Some(PathBuf::from(flag_value(tokens, "--root")?)),
                "--arch" => req.arch = Some(flag_value(tokens, "--arch")?),
                "--run-as" => req.run_as = Some(flag_value(tokens, "--run-as")?),
                "--pm" => req.pm = Some(flag_value(tokens, "--pm")?),
                "--uid" => req.uid = Some(parse_number(&flag_value(tokens, "--uid")?, 10)?),
                "--gid" => req.gid = Some(parse_number(&flag_value(tokens, "--gid")?, 10)?),
                "--mode" => req.mode = Some(parse_number(&flag_value(tokens, "--mode")?, 8)?),
                "--remount" => req.remount = true,
                "--ignore-errors" => req.ignore_errors = true,
                "--quiet" => req.quiet = true,
                "--ignore-stderr" => req.ignore_stderr = true,
                other if other.starts_with("--") => {
                    return Err(Error::InvalidRequest(format!("unknown option: {other}")))
                }
                other => positional.push(other.to_string()),
            }
        }
        req.op = op.ok_or_else(|| Error::InvalidRequest("missing operation".into()))?;
        req.args = positional;
        Ok(req)
    }
}

fn flag_value(tokens: &mut impl Iterator<Item = String>, flag: &str) -> Result<String, Error> {
    tokens
        .next()
        .ok_or_else(|| Error::InvalidRequest(format!("{flag} expects a value")))
}

fn parse_number<T>(raw: &str, radix: u32) -> Result<T, Error>
where
    T: TryFrom<u64>,
{
    u64::from_str_radix(raw, radix)
        .ok()
        .and_then(|v| T::try_from(v).ok())
        .ok_or_else(|| Error::InvalidRequest(format!("invalid number: {raw}")))
}

/// Completion status carried by the sentinel line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Error(i32),
}

pub fn sentinel_line(cookie: &str, status: Status) -> String {
    match status {
        Status::Ok => format!("{cookie} OK"),
        Status::Error(code) => format!("{cookie} ERROR {code}"),
    }
}

/// Recognizes a sentinel for `cookie`; other lines are output.
pub fn parse_sentinel(cookie: &str, line: &str) -> Option<Status> {
    let mut words = line.split_whitespace();
    if words.next()? != cookie {
        return None;
    }
    match (words.next()?, words.next(), words.next()) {
        ("OK", None, None) => Some(Status::Ok),
        ("ERROR", Some(code), None) => code.parse().ok().map(Status::Error),
        _ => None,
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn token() -> impl Strategy<Value = String> {
        prop_oneof![
            "[^\\r\\n\\x00]{0,12}",
            prop::sample::select(vec!["", "--", "--root", "'", "\"", "a b", "\\", "$HOME", "!x", "#", "ü ö", "\t"])
                .prop_map(String::from),
        ]
    }

    fn request() -> impl Strategy<Value = AgentRequest> {
        (
            prop::sample::select(OpType::ALL),
            prop::option::of(token()),
            prop::option::of(any::<u64>()),
            prop::option::of(token()),
            prop::option::of(token()),
            prop::option::of(token()),
            prop::option::of(token()),
            prop::option::of(any::<u32>()),
            prop::option::of(any::<u32>()),
            prop::option::of(any::<u32>()),
            any::<[bool; 4]>(),
            prop::collection::vec(token(), 0..8),
        )
            .prop_map(
                |(op, target, timeout, root, arch, run_as, pm, uid, gid, mode, flags, args)| {
                    let mut req = AgentRequest::new(op)
                        .timeout(timeout)
                        .owner(uid, gid)
                        .mode(mode)
                        .args(args);
                    req.target = target;
                    req.root = root.map(PathBuf::from);
                    req.arch = arch;
                    req.run_as = run_as;
                    req.pm = pm;
                    req.remount = flags[0];
                    req.ignore_errors = flags[1];
                    req.quiet = flags[2];
                    req.ignore_stderr = flags[3];
                    req
                },
            )
    }

    proptest! {
        #[test]
        fn request_lines_round_trip(req in request()) {
            let line = req.encode_line().unwrap();
            prop_assert!(!line.contains('\n'));
            prop_assert_eq!(AgentRequest::decode_line(&line).unwrap(), req.clone());
            prop_assert_eq!(AgentRequest::from_args(req.to_args()).unwrap(), req);
        }
    }
}
