//! Blocking transport primitives: UDP unicast, TCP with per-connection
//! workers, and multicast with optional source filtering.
//!
//! All sockets run with a short receive timeout so workers can poll their
//! `run` flag and shut down promptly.

pub mod multicast;
pub mod tcp;
pub mod udp;

use std::io;
use std::time::Duration;

/// Receive timeout applied to every socket; bounds how long a worker can sit
/// in a read before noticing a flipped `run` flag.
pub const READ_POLL: Duration = Duration::from_millis(100);

/// Retransmission policy applied when a send hits a would-block condition.
#[derive(Debug, Copy, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> RetryPolicy {
        RetryPolicy {
            attempts: 50,
            backoff: Duration::from_millis(100),
        }
    }
}

#[derive(Debug)]
pub enum NetError {
    /// The retry budget ran out without the payload leaving the socket.
    Exhausted,
    /// The socket is closed or the peer went away.
    Closed,
    Io(io::Error),
}

pub type NetResult<T> = Result<T, NetError>;

impl From<io::Error> for NetError {
    #[inline]
    fn from(err: io::Error) -> NetError {
        NetError::Io(err)
    }
}

/// True for the error kinds a read with `SO_RCVTIMEO` reports on timeout.
#[inline]
pub(crate) fn is_timeout(err: &io::Error) -> bool {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => true,
        _ => false,
    }
}
