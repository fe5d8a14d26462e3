use std::io;
use std::os::fd::BorrowedFd;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

/// Waits up to `timeout` for any of `fds` to become readable (or hang up).
/// Missing descriptors are never ready. An interrupted wait reports nothing
/// ready.
pub(crate) fn wait_readable(
    fds: &[Option<BorrowedFd<'_>>],
    timeout: Duration,
) -> io::Result<Vec<bool>> {
    let mut pfds: Vec<PollFd<'_>> = fds
        .iter()
        .flatten()
        .map(|fd| PollFd::new(*fd, PollFlags::POLLIN))
        .collect();
    let ms = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
    match poll(&mut pfds, PollTimeout::from(ms)) {
        Ok(_) => {}
        Err(Errno::EINTR) => return Ok(vec![false; fds.len()]),
        Err(e) => return Err(e.into()),
    }
    let ready = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
    let mut polled = pfds.iter();
    Ok(fds
        .iter()
        .map(|fd| {
            fd.is_some()
                && polled
                    .next()
                    .and_then(|p| p.revents())
                    .is_some_and(|r| r.intersects(ready))
        })
        .collect())
}
