//! Readiness polling on a single descriptor

use crate::Result;
use nix::poll::{PollFd, PollFlags, PollTimeout};
use std::os::fd::AsFd;
use std::time::Duration;

/// Block until `source` is readable or `timeout` expires
///
/// Error and hang-up conditions count as readable so they surface on the
/// following read.
pub fn wait_readable<F: AsFd>(source: &F, timeout: Duration) -> Result<bool> {
    let mut poll_fds = [PollFd::new(source.as_fd(), PollFlags::POLLIN)];
    let timeout_val = PollTimeout::try_from(timeout).unwrap_or(PollTimeout::MAX);

    loop {
        match nix::poll::poll(&mut poll_fds, timeout_val) {
            Ok(0) => return Ok(false),
            Ok(_) => break,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }

    let readable = poll_fds[0].revents().is_some_and(|revents| {
        revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR)
    });
    Ok(readable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket;
    use std::time::Instant;

    #[test]
    fn test_timeout_without_data() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let start = Instant::now();
        assert!(!wait_readable(&socket, Duration::from_millis(20)).unwrap());
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_readable_with_data() {
        let rx = UdpSocket::bind("127.0.0.1:0").unwrap();
        let tx = UdpSocket::bind("127.0.0.1:0").unwrap();
        tx.send_to(b"x", rx.local_addr().unwrap()).unwrap();
        assert!(wait_readable(&rx, Duration::from_secs(1)).unwrap());
    }
}
