//! SIGINT handling for the controller.
//!
//! The handler only raises a flag; long waits (the agent proxy loop and the
//! batch loop) poll it and unwind with [`Error::Interrupted`].

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::error::Error;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_signal: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Installs the SIGINT handler. Call early in `main`, before any threads.
pub fn install_handler() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(on_sigint),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    // SAFETY: the handler only stores to an atomic.
    unsafe { signal::sigaction(Signal::SIGINT, &action) }.context("installing SIGINT handler")?;
    log::debug!("SIGINT handler installed");
    Ok(())
}

pub fn flag() -> &'static AtomicBool {
    &INTERRUPTED
}

/// Consumes a pending interrupt.
pub fn take() -> bool {
    INTERRUPTED.swap(false, Ordering::SeqCst)
}

/// Fails with [`Error::Interrupted`] if an interrupt is pending.
pub fn check() -> Result<()> {
    if take() {
        return Err(Error::Interrupted.into());
    }
    Ok(())
}
