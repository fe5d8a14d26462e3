//! Package build bot running builds inside disposable chroots.
//!
//! The unprivileged controller (`jurt`) drives batches of source packages
//! through roots that move between lifecycle states on disk. Anything that
//! needs root goes through a privileged helper (`jurt-root-command`),
//! usually kept running as an agent behind sudo and fed requests over
//! pipes.
//!
//! - [`target`] - target selection and the [`Jurt`] facade used by the CLI
//! - [`build`] - batch orchestration, results and delivery
//! - [`root`] - root states, layout and lifecycle
//! - [`su`] - typed requests to the privileged side
//! - [`agent`] - the privileged side: wire format, validation, operations
//! - [`pm`] - package manager abstraction and the urpmi implementation
//! - [`config`] - layered TOML configuration

pub mod agent;
pub mod build;
pub mod config;
pub mod error;
pub mod logstore;
pub mod pm;
pub mod preflight;
pub mod registry;
pub mod root;
pub mod spool;
pub mod su;
pub mod target;
pub mod util;

#[cfg(test)]
pub(crate) mod testing;

pub use error::Error;
pub use target::{Jurt, Target};
