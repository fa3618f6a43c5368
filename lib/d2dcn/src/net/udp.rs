//! UDP unicast primitives: an ephemeral-port listener used by command servers
//! and info writers, and a fixed-peer client used by proxies and readers.

use crate::net::{is_timeout, NetError, NetResult, RetryPolicy, READ_POLL};
use crate::MTU;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Sends a payload chunked into MTU-sized datagrams, retrying each chunk on a
/// would-block condition per the policy. Any other error fails the send.
pub(crate) fn send_chunks(
    sock: &UdpSocket,
    dest: SocketAddr,
    payload: &[u8],
    retry: &RetryPolicy,
) -> NetResult<()> {
    for chunk in payload.chunks(MTU) {
        let mut attempt = 0;
        loop {
            match sock.send_to(chunk, dest) {
                Ok(_) => break,
                Err(err) if is_timeout(&err) => {
                    attempt += 1;
                    if attempt >= retry.attempts {
                        return Err(NetError::Exhausted);
                    }
                    thread::sleep(retry.backoff);
                }
                Err(err) => return Err(NetError::Io(err)),
            }
        }
    }

    Ok(())
}

/// Reads one datagram, polling `open` between timeouts. `timeout = None`
/// blocks until data arrives or the socket is closed.
pub(crate) fn read_datagram(
    sock: &UdpSocket,
    open: &AtomicBool,
    timeout: Option<Duration>,
) -> Option<(Vec<u8>, SocketAddr)> {
    let deadline = timeout.map(|t| Instant::now() + t);
    let mut buf = [0u8; MTU];

    while open.load(Ordering::Relaxed) {
        match sock.recv_from(&mut buf) {
            Ok((count, peer)) => return Some((buf[..count].to_vec(), peer)),
            Err(err) if is_timeout(&err) => {
                if let Some(deadline) = deadline {
                    if Instant::now() >= deadline {
                        return None;
                    }
                }
            }
            Err(_) => return None,
        }
    }

    None
}

/// UDP listener bound to an ephemeral port on all interfaces.
pub struct UdpListener {
    sock: UdpSocket,
    open: AtomicBool,
    retry: RetryPolicy,
}

impl UdpListener {
    pub fn bind() -> io::Result<UdpListener> {
        Self::bind_with_retry(RetryPolicy::default())
    }

    pub fn bind_with_retry(retry: RetryPolicy) -> io::Result<UdpListener> {
        let sock = UdpSocket::bind("0.0.0.0:0")?;
        sock.set_read_timeout(Some(READ_POLL))?;

        Ok(UdpListener {
            sock,
            open: AtomicBool::new(true),
            retry,
        })
    }

    #[inline]
    pub fn port(&self) -> u16 {
        self.sock.local_addr().map(|addr| addr.port()).unwrap_or(0)
    }

    /// Returns one datagram and its sender, or `None` on timeout or close.
    pub fn read(&self, timeout: Option<Duration>) -> Option<(Vec<u8>, SocketAddr)> {
        read_datagram(&self.sock, &self.open, timeout)
    }

    pub fn send(&self, peer: SocketAddr, payload: &[u8]) -> NetResult<()> {
        send_chunks(&self.sock, peer, payload, &self.retry)
    }

    /// Unblocks pending reads; the socket itself closes on drop.
    pub fn close(&self) {
        self.open.store(false, Ordering::Relaxed);
    }
}

/// UDP client toward a fixed peer.
pub struct UdpClient {
    sock: UdpSocket,
    peer: SocketAddr,
    open: AtomicBool,
    retry: RetryPolicy,
}

impl UdpClient {
    pub fn new(peer: SocketAddr) -> io::Result<UdpClient> {
        let sock = UdpSocket::bind("0.0.0.0:0")?;
        sock.set_read_timeout(Some(READ_POLL))?;

        Ok(UdpClient {
            sock,
            peer,
            open: AtomicBool::new(true),
            retry: RetryPolicy::default(),
        })
    }

    pub fn read(&self, timeout: Option<Duration>) -> Option<Vec<u8>> {
        read_datagram(&self.sock, &self.open, timeout).map(|(payload, _)| payload)
    }

    pub fn send(&self, payload: &[u8]) -> NetResult<()> {
        send_chunks(&self.sock, self.peer, payload, &self.retry)
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn local(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    #[test]
    fn test_listener_client_roundtrip() {
        let listener = UdpListener::bind().unwrap();
        let client = UdpClient::new(local(listener.port())).unwrap();

        client.send(b"ping").unwrap();
        let (request, peer) = listener.read(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(request, b"ping");

        listener.send(peer, b"pong").unwrap();
        let response = client.read(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(response, b"pong");
    }

    #[test]
    fn test_read_timeout_returns_none() {
        let listener = UdpListener::bind().unwrap();
        assert!(listener.read(Some(Duration::from_millis(150))).is_none());
    }

    #[test]
    fn test_close_unblocks_read() {
        let listener = UdpListener::bind().unwrap();
        listener.close();
        assert!(listener.read(None).is_none());
    }

    #[test]
    fn test_send_chunks_large_payload() {
        let listener = UdpListener::bind().unwrap();
        let client = UdpClient::new(local(listener.port())).unwrap();

        let payload = vec![b'x'; MTU + 100];
        client.send(&payload).unwrap();

        let (first, _) = listener.read(Some(Duration::from_secs(1))).unwrap();
        let (second, _) = listener.read(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(first.len(), MTU);
        assert_eq!(second.len(), 100);
    }
}
