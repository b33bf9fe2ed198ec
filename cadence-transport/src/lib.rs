//! Cadence Transport Layer
//!
//! This crate provides the socket plumbing for the cadence measurement
//! server and sender. All I/O is blocking with explicit timeouts so that the
//! calling flow thread owns its own pacing.
//!
//! ## Flow Sockets
//!
//! - **UDP**: [`UdpFlowSocket`], a socket connected to one peer
//! - **L2 capture**: [`PacketFlowSocket`], an AF_PACKET capture that delivers
//!   whole Ethernet frames for a UDP flow (Linux only)
//! - **TCP**: [`TcpFlowStream`], the receive side of one connection
//!
//! Both datagram variants implement [`FlowSocket`], which is what the UDP
//! receive loop is written against.
//!
//! ## Kernel Timestamps (Linux only)
//!
//! On Linux, receive timestamps can come from the kernel (SO_TIMESTAMPING,
//! falling back to SO_TIMESTAMP) rather than from a clock read after `recv()`
//! returns. See [`rx_timestamp`].
//!
//! ## Listeners
//!
//! [`UdpListener`] detects new UDP flows by their first datagram and hands
//! out a socket connected to the peer; [`TcpFlowListener`] wraps accept().
//!
//! ```rust,no_run
//! use cadence_transport::{FlowSocket, RecvOutcome, RxTimestampConfig, UdpFlowSocket, UdpListener};
//! use std::time::Duration;
//!
//! let mut listener = UdpListener::bind("0.0.0.0:5001".parse().unwrap()).unwrap();
//! if let Some((socket, peer)) = listener.accept(Duration::from_secs(1)).unwrap() {
//!     let mut flow = UdpFlowSocket::new(socket, &RxTimestampConfig::kernel()).unwrap();
//!     let mut buf = [0u8; 1470];
//!     if let RecvOutcome::Data { len, timestamp, .. } = flow.recv(&mut buf).unwrap() {
//!         println!("{len} bytes from {peer} at {:?}", timestamp);
//!     }
//! }
//! ```

use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),

    /// The peer could not be reached or reset the connection
    Connection(String),

    /// A socket option, device binding or capture socket was refused
    Setup(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::Connection(msg) => write!(f, "connection failed: {msg}"),
            Error::Setup(msg) => write!(f, "socket setup failed: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<nix::Error> for Error {
    fn from(err: nix::Error) -> Self {
        Error::Io(err.into())
    }
}

// =============================================================================
// Module declarations
// =============================================================================

pub mod listener;
pub mod poll;
pub mod tcp;
mod timestamp;
pub mod udp;

// Kernel receive timestamps and link-layer capture (Linux only)
#[cfg(target_os = "linux")]
pub mod packet;
#[cfg(target_os = "linux")]
pub mod rx_timestamp;

// =============================================================================
// Re-exports
// =============================================================================

pub use listener::{bind_reuse_udp, TcpFlowListener, UdpListener};
pub use poll::wait_readable;
pub use tcp::TcpFlowStream;
pub use timestamp::Timestamp;
pub use udp::{FlowSocket, RecvOutcome, RxTimestampConfig, UdpFlowSocket};

#[cfg(target_os = "linux")]
pub use packet::PacketFlowSocket;
