use std::fmt;

use cadence_common::WireError;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures of a flow, the listener or the pacing setup
///
/// Receive timeouts and out-of-range histogram inserts are not errors; they
/// come back as ordinary values.
#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),

    /// Socket setup or receive failure below the flow loop
    Transport(cadence_transport::Error),

    /// Buffer too short for the field being decoded
    Wire(WireError),

    /// A frame or datagram that cannot belong to the flow
    Malformed(String),

    /// Rejected settings, from profiles or from constructors
    Config(String),

    /// Histogram construction or merge failure
    Histogram(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::Transport(e) => write!(f, "transport: {e}"),
            Error::Wire(e) => write!(f, "wire format: {e}"),
            Error::Malformed(msg) => write!(f, "malformed packet: {msg}"),
            Error::Config(msg) => write!(f, "invalid configuration: {msg}"),
            Error::Histogram(msg) => write!(f, "histogram: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Transport(e) => Some(e),
            Error::Wire(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<WireError> for Error {
    fn from(err: WireError) -> Self {
        Error::Wire(err)
    }
}

impl From<cadence_transport::Error> for Error {
    fn from(err: cadence_transport::Error) -> Self {
        Error::Transport(err)
    }
}

/// Settings validation reports through `anyhow`
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Config(format!("{err:#}"))
    }
}
