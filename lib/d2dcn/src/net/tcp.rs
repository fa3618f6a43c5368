//! TCP primitives: an ephemeral-port acceptor whose connections carry their
//! own read/send state, and a lazily connecting client that rebuilds its
//! connection once per failed exchange before giving up.

use crate::net::{is_timeout, NetError, NetResult, RetryPolicy, READ_POLL};
use crate::MTU;
use std::io;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

/// Writes a payload in MTU-sized segments, retrying each segment on a
/// would-block condition per the policy. Any other error fails the send.
fn send_segments(stream: &mut TcpStream, payload: &[u8], retry: &RetryPolicy) -> NetResult<()> {
    for chunk in payload.chunks(MTU) {
        let mut attempt = 0;
        loop {
            match stream.write_all(chunk) {
                Ok(()) => break,
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

/// One accepted connection. Read and send segment at the MTU boundary; a
/// higher layer reassembles JSON bodies.
pub struct TcpConnection {
    stream: Mutex<TcpStream>,
    open: AtomicBool,
    retry: RetryPolicy,
}

impl TcpConnection {
    fn new(stream: TcpStream, retry: RetryPolicy) -> io::Result<TcpConnection> {
        stream.set_read_timeout(Some(READ_POLL))?;

        Ok(TcpConnection {
            stream: Mutex::new(stream),
            open: AtomicBool::new(true),
            retry,
        })
    }

    /// Returns one segment, or `None` on timeout or once the connection is
    /// gone. Peer close and hard errors mark the connection disconnected.
    pub fn read(&self, timeout: Option<Duration>) -> Option<Vec<u8>> {
        let mut stream = match self.stream.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut buf = [0u8; MTU];

        while self.open.load(Ordering::Relaxed) {
            match stream.read(&mut buf) {
                Ok(0) => {
                    self.open.store(false, Ordering::Relaxed);
                    return None;
                }
                Ok(count) => return Some(buf[..count].to_vec()),
                Err(err) if is_timeout(&err) => {
                    if let Some(deadline) = deadline {
                        if Instant::now() >= deadline {
                            return None;
                        }
                    }
                }
                Err(_) => {
                    self.open.store(false, Ordering::Relaxed);
                    return None;
                }
            }
        }

        None
    }

    pub fn send(&self, payload: &[u8]) -> NetResult<()> {
        let mut stream = match self.stream.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        send_segments(&mut stream, payload, &self.retry)
    }

    pub fn is_connected(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::Relaxed);
    }
}

/// TCP listener on an ephemeral port. Accepts are polled so `close` unblocks
/// a pending `wait_connection`.
pub struct TcpServer {
    sock: TcpListener,
    open: AtomicBool,
    retry: RetryPolicy,
}

impl TcpServer {
    pub fn bind() -> io::Result<TcpServer> {
        Self::bind_with_retry(RetryPolicy::default())
    }

    pub fn bind_with_retry(retry: RetryPolicy) -> io::Result<TcpServer> {
        let sock = TcpListener::bind("0.0.0.0:0")?;
        sock.set_nonblocking(true)?;

        Ok(TcpServer {
            sock,
            open: AtomicBool::new(true),
            retry,
        })
    }

    #[inline]
    pub fn port(&self) -> u16 {
        self.sock.local_addr().map(|addr| addr.port()).unwrap_or(0)
    }

    /// Returns the next accepted connection, or `None` on timeout or close.
    pub fn wait_connection(&self, timeout: Option<Duration>) -> Option<TcpConnection> {
        let deadline = timeout.map(|t| Instant::now() + t);

        while self.open.load(Ordering::Relaxed) {
            match self.sock.accept() {
                Ok((stream, _)) => {
                    if stream.set_nonblocking(false).is_err() {
                        return None;
                    }
                    return TcpConnection::new(stream, self.retry).ok();
                }
                Err(err) if is_timeout(&err) => {
                    if let Some(deadline) = deadline {
                        if Instant::now() >= deadline {
                            return None;
                        }
                    }
                    thread::sleep(READ_POLL);
                }
                Err(_) => return None,
            }
        }

        None
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::Relaxed);
    }
}

/// TCP client toward a fixed peer. The connection is established on first use
/// and rebuilt once per failed exchange before the operation fails.
pub struct TcpClient {
    peer: SocketAddr,
    stream: Mutex<Option<TcpStream>>,
    retry: RetryPolicy,
}

impl TcpClient {
    pub fn new(peer: SocketAddr) -> TcpClient {
        TcpClient {
            peer,
            stream: Mutex::new(None),
            retry: RetryPolicy::default(),
        }
    }

    fn connect(&self, slot: &mut Option<TcpStream>) -> bool {
        if slot.is_some() {
            return true;
        }

        match TcpStream::connect(self.peer) {
            Ok(stream) => {
                if stream.set_read_timeout(Some(READ_POLL)).is_err() {
                    return false;
                }
                *slot = Some(stream);
                true
            }
            Err(_) => false,
        }
    }

    /// Returns one segment, or `None` on timeout or when the peer stays
    /// unreachable across one reconnect.
    pub fn read(&self, timeout: Option<Duration>) -> Option<Vec<u8>> {
        let mut slot = match self.stream.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if !self.connect(&mut slot) {
            return None;
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut buf = [0u8; MTU];
        let mut reconnected = false;

        loop {
            let stream = match slot.as_mut() {
                Some(stream) => stream,
                None => return None,
            };

            match stream.read(&mut buf) {
                Ok(count) if count > 0 => return Some(buf[..count].to_vec()),
                Err(err) if is_timeout(&err) => {
                    if let Some(deadline) = deadline {
                        if Instant::now() >= deadline {
                            return None;
                        }
                    }
                }
                // Peer close or hard error: one fresh connection, then fail.
                _ => {
                    *slot = None;
                    if reconnected || !self.connect(&mut slot) {
                        return None;
                    }
                    reconnected = true;
                }
            }
        }
    }

    pub fn send(&self, payload: &[u8]) -> NetResult<()> {
        let mut slot = match self.stream.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if !self.connect(&mut slot) {
            return Err(NetError::Closed);
        }

        let mut reconnected = false;

        loop {
            let stream = match slot.as_mut() {
                Some(stream) => stream,
                None => return Err(NetError::Closed),
            };

            match send_segments(stream, payload, &self.retry) {
                Ok(()) => return Ok(()),
                Err(NetError::Io(err)) => {
                    *slot = None;
                    if reconnected || !self.connect(&mut slot) {
                        return Err(NetError::Io(err));
                    }
                    reconnected = true;
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub fn close(&self) {
        let mut slot = match self.stream.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = None;
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
    fn test_client_server_roundtrip() {
        let server = TcpServer::bind().unwrap();
        let client = TcpClient::new(local(server.port()));

        client.send(b"ping").unwrap();
        let conn = server.wait_connection(Some(Duration::from_secs(1))).unwrap();

        let request = conn.read(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(request, b"ping");

        conn.send(b"pong").unwrap();
        let response = client.read(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(response, b"pong");
    }

    #[test]
    fn test_large_payload_segmented() {
        let server = TcpServer::bind().unwrap();
        let client = TcpClient::new(local(server.port()));

        let payload = vec![b'y'; MTU * 2 + 17];
        client.send(&payload).unwrap();

        let conn = server.wait_connection(Some(Duration::from_secs(1))).unwrap();
        let mut received = Vec::new();
        while received.len() < payload.len() {
            match conn.read(Some(Duration::from_secs(1))) {
                Some(chunk) => received.extend_from_slice(&chunk),
                None => break,
            }
        }

        assert_eq!(received, payload);
    }

    #[test]
    fn test_wait_connection_timeout() {
        let server = TcpServer::bind().unwrap();
        assert!(server.wait_connection(Some(Duration::from_millis(150))).is_none());
    }

    #[test]
    fn test_close_unblocks_wait() {
        let server = TcpServer::bind().unwrap();
        server.close();
        assert!(server.wait_connection(None).is_none());
    }

    #[test]
    fn test_connection_detects_peer_close() {
        let server = TcpServer::bind().unwrap();
        let client = TcpClient::new(local(server.port()));

        client.send(b"hello").unwrap();
        let conn = server.wait_connection(Some(Duration::from_secs(1))).unwrap();
        assert!(conn.read(Some(Duration::from_secs(1))).is_some());

        client.close();
        assert!(conn.read(Some(Duration::from_secs(1))).is_none());
        assert!(!conn.is_connected());
    }
}
