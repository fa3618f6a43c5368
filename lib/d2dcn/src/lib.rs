//! Device-to-device control network: every participant publishes commands
//! (callable RPC endpoints with typed argument schemas) and info values
//! (typed live-updating variables) under a stable identity, discovered by
//! peers on the same LAN through a shared-table broker and exchanged
//! peer-to-peer over UDP, TCP and multicast.

#![allow(clippy::new_without_default)]

use std::net::Ipv4Addr;

/// Fixed first segment of every endpoint UID path.
pub const PATH_PREFIX: &str = "d2dcn";

/// Maximum datagram/segment size for user sockets.
pub const MTU: usize = 500;

/// Group carrying every writer's info updates; readers filter by source.
pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(232, 10, 10, 10);

/// Wire protocol label published in info descriptors.
pub const INFO_PROTOCOL_ASCII: &str = "ASCII";

/// The literal request datagram a writer answers with its current value.
pub const INFO_REQUEST: &[u8] = b"req";

pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 5;

/// Well-known category labels.
pub mod category {
    pub const GENERIC: &str = "generic";
    pub const GPIO: &str = "gpio";
    pub const CONFIGURATION: &str = "configuration";
}

pub mod logging;
pub mod time;

pub mod net;
pub mod path;
pub mod route;
pub mod types;

pub mod command;
pub mod directory;
pub mod info;
pub mod table;

pub mod node;

pub mod prelude;
