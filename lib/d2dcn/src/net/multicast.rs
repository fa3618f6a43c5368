//! Multicast send/receive on the shared update group. Receivers can join
//! source-specific so only datagrams from one writer are delivered.

use crate::net::udp::{read_datagram, send_chunks};
use crate::net::{NetResult, RetryPolicy, READ_POLL};
use crate::MULTICAST_GROUP;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Sends updates to the group. The socket's ephemeral port number doubles as
/// the group port readers join, and egress is pinned to the supplied
/// interface address so the datagram source matches the published writer IP.
pub struct MulticastSender {
    sock: UdpSocket,
    dest: SocketAddr,
    retry: RetryPolicy,
}

impl MulticastSender {
    pub fn new(iface: Ipv4Addr) -> io::Result<MulticastSender> {
        let sock = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        sock.bind(&SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)).into())?;

        if !iface.is_unspecified() {
            sock.set_multicast_if_v4(&iface)?;
        }
        sock.set_multicast_loop_v4(true)?;

        let sock: UdpSocket = sock.into();
        let port = sock.local_addr()?.port();

        Ok(MulticastSender {
            sock,
            dest: SocketAddr::V4(SocketAddrV4::new(MULTICAST_GROUP, port)),
            retry: RetryPolicy::default(),
        })
    }

    /// The group port assigned to this sender.
    #[inline]
    pub fn port(&self) -> u16 {
        self.dest.port()
    }

    pub fn send(&self, payload: &[u8]) -> NetResult<()> {
        send_chunks(&self.sock, self.dest, payload, &self.retry)
    }
}

/// Receives updates from the group on a fixed port, optionally filtered to a
/// single source address.
pub struct MulticastReceiver {
    sock: UdpSocket,
    open: AtomicBool,
}

impl MulticastReceiver {
    /// Joins the group on `port`. With `source` set, the membership is
    /// source-specific and only that writer's datagrams are delivered;
    /// `iface` selects the interface facing the source.
    pub fn join(port: u16, source: Option<Ipv4Addr>, iface: Ipv4Addr) -> io::Result<MulticastReceiver> {
        let sock = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        sock.set_reuse_address(true)?;

        // Binding to the group address keeps unrelated unicast traffic off
        // the socket; not every OS allows it.
        #[cfg(unix)]
        let bind_ip = MULTICAST_GROUP;
        #[cfg(not(unix))]
        let bind_ip = Ipv4Addr::UNSPECIFIED;

        sock.bind(&SocketAddr::V4(SocketAddrV4::new(bind_ip, port)).into())?;

        match source {
            Some(source) => sock.join_ssm_v4(&source, &MULTICAST_GROUP, &iface)?,
            None => sock.join_multicast_v4(&MULTICAST_GROUP, &iface)?,
        }

        sock.set_read_timeout(Some(READ_POLL))?;

        Ok(MulticastReceiver {
            sock: sock.into(),
            open: AtomicBool::new(true),
        })
    }

    /// Returns one datagram payload, or `None` on timeout or close.
    pub fn read(&self, timeout: Option<Duration>) -> Option<Vec<u8>> {
        read_datagram(&self.sock, &self.open, timeout).map(|(payload, _)| payload)
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::Relaxed);
    }
}
