//! Build roots: lifecycle states, the on-disk layout and the manager that
//! moves roots between states through the privileged helper.

pub mod layout;
pub mod manager;
pub mod session;
pub mod strategy;

use std::fmt;
use std::path::{Component, Path, PathBuf};

use anyhow::Result;

use crate::error::Error;

pub use layout::RootsLayout;
pub use manager::RootManager;
pub use session::ChrootSession;
pub use strategy::RootStrategy;

/// Name that always resolves through the latest link.
pub const LATEST: &str = "latest";

/// Lifecycle state of a root; each maps to one directory under the roots
/// path and a root lives in exactly one of them at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RootState {
    /// Being created.
    Temp,
    /// In use, virtual filesystems mounted.
    Active,
    /// Finished, candidate for removal.
    Old,
    /// Finished and pinned by the keep marker.
    Keep,
    /// Memory-backed; discarded on deactivation.
    Tmpfs,
}

impl RootState {
    pub const ALL: [RootState; 5] = [
        RootState::Temp,
        RootState::Active,
        RootState::Old,
        RootState::Keep,
        RootState::Tmpfs,
    ];

    /// Order used when resolving a root by name.
    pub const LOOKUP_ORDER: [RootState; 5] = [
        RootState::Active,
        RootState::Keep,
        RootState::Old,
        RootState::Temp,
        RootState::Tmpfs,
    ];

    pub fn dir_name(self) -> &'static str {
        match self {
            RootState::Temp => "temp",
            RootState::Active => "active",
            RootState::Old => "old",
            RootState::Keep => "keep",
            RootState::Tmpfs => "tmpfs",
        }
    }

    pub fn from_dir_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.dir_name() == name)
    }
}

impl fmt::Display for RootState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.dir_name())
    }
}

pub fn validate_root_name(name: &str) -> Result<(), Error> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name == LATEST
        || name.starts_with('.')
        || name.contains('/')
        || name.contains('\0')
        || name.chars().any(char::is_whitespace);
    if bad {
        return Err(Error::InvalidRootName(name.to_string()));
    }
    Ok(())
}

/// Target of a latest link: exactly `<state-dir>/<root-name>`, relative to
/// the roots path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatestTarget {
    pub state: RootState,
    pub name: String,
}

impl LatestTarget {
    pub fn new(state: RootState, name: impl Into<String>) -> Self {
        Self {
            state,
            name: name.into(),
        }
    }

    pub fn link_target(&self) -> PathBuf {
        Path::new(self.state.dir_name()).join(&self.name)
    }

    /// Parses a link target, rejecting anything that is not two plain
    /// components naming a known state and a valid root.
    pub fn parse(target: &Path) -> Result<Self, Error> {
        let malformed = || {
            Error::RootState(format!(
                "malformed latest link target: '{}'",
                target.display()
            ))
        };
        let parts: Vec<&str> = target
            .components()
            .map(|c| match c {
                Component::Normal(s) => s.to_str().ok_or_else(malformed),
                _ => Err(malformed()),
            })
            .collect::<Result<_, _>>()?;
        let [state, name] = parts.as_slice() else {
            return Err(malformed());
        };
        let state = RootState::from_dir_name(state).ok_or_else(malformed)?;
        validate_root_name(name).map_err(|_| malformed())?;
        Ok(Self::new(state, *name))
    }
}

/// A build root as seen by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chroot {
    pub name: String,
    pub path: PathBuf,
    pub arch: String,
    pub state: RootState,
    pub interactive: bool,
}

impl Chroot {
    /// Host path of an absolute path inside the root.
    pub fn external_path(&self, inside: &str) -> PathBuf {
        crate::util::fs::join_inside(&self.path, inside)
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, RootState::Active | RootState::Tmpfs)
    }
}
