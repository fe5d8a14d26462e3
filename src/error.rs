//! Error taxonomy shared by the controller, the privileged agent and the
//! build orchestrator.
//!
//! Functions in this crate return [`anyhow::Result`]; the variants below are
//! attached to the chain so callers can branch on the category with
//! [`Error::find`] while still getting the full context when printing.

use std::path::PathBuf;

use thiserror::Error;

/// Exit status `timeout(1)` reports when the wrapped command ran out of time.
pub const TIMEOUT_EXIT_STATUS: i32 = 124;

/// Exit status the agent reports for requests it refused to execute.
pub const INVALID_REQUEST_STATUS: i32 = 2;

#[derive(Debug, Error)]
pub enum Error {
    /// A privileged request ran and finished with a non-zero status.
    #[error("command failed with exit code {code}: {cmdline}\n{output}")]
    Command {
        code: i32,
        cmdline: String,
        output: String,
    },

    /// A request carrying a time limit exceeded it.
    #[error("command timed out: {cmdline}")]
    Timeout { cmdline: String },

    /// The agent exited (or its pipes closed) without producing a reply.
    #[error("privileged agent exited unexpectedly ({status})\n{output}")]
    Agent { status: String, output: String },

    /// An operation is illegal for the current state of a root.
    #[error("{0}")]
    RootState(String),

    #[error("invalid root name: {0:?}")]
    InvalidRootName(String),

    /// Host prerequisites (groups, permissions, directories) are missing.
    #[error("{0}")]
    Setup(String),

    #[error("the privileged helper does not seem to be set up for user {user}, run jurt-setup as root")]
    SudoNotSetup { user: String },

    #[error("{message}")]
    PackageManager {
        message: String,
        log: Option<PathBuf>,
    },

    #[error("configuration error: {0}")]
    Config(String),

    /// The agent rejected a request during validation.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("interrupted")]
    Interrupted,
}

impl Error {
    /// Finds the first typed error in an anyhow chain.
    pub fn find(err: &anyhow::Error) -> Option<&Error> {
        err.chain().find_map(|e| e.downcast_ref::<Error>())
    }

    /// Status code the agent puts on the wire for this error.
    pub fn wire_status(&self) -> i32 {
        match self {
            Error::Command { code, .. } => *code,
            Error::Timeout { .. } => TIMEOUT_EXIT_STATUS,
            Error::InvalidRequest(_) | Error::InvalidRootName(_) | Error::Config(_) => {
                INVALID_REQUEST_STATUS
            }
            _ => 1,
        }
    }

    pub fn package_manager(message: impl Into<String>, log: Option<PathBuf>) -> Self {
        Error::PackageManager {
            message: message.into(),
            log,
        }
    }
}

/// True when the chain carries [`Error::Interrupted`].
pub fn is_interrupted(err: &anyhow::Error) -> bool {
    matches!(Error::find(err), Some(Error::Interrupted))
}

/// Errors no retry or fallback can get past: the user interrupted, or the
/// privileged helper is unusable.
pub fn is_fatal(err: &anyhow::Error) -> bool {
    matches!(
        Error::find(err),
        Some(Error::Interrupted | Error::Agent { .. } | Error::Setup(_) | Error::SudoNotSetup { .. })
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_find_through_context() {
        let err: anyhow::Result<()> = Err(Error::Timeout {
            cmdline: "rpmbuild -ba foo.spec".into(),
        })
        .context("building foo");
        let err = err.unwrap_err();
        assert!(matches!(Error::find(&err), Some(Error::Timeout { .. })));
        assert!(!is_interrupted(&err));
    }

    #[test]
    fn test_wire_status() {
        let err = Error::Command {
            code: 7,
            cmdline: "false".into(),
            output: String::new(),
        };
        assert_eq!(err.wire_status(), 7);
        assert_eq!(
            Error::InvalidRequest("nope".into()).wire_status(),
            INVALID_REQUEST_STATUS
        );
        assert_eq!(Error::Setup("x".into()).wire_status(), 1);
    }
}
