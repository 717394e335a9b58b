//! SLCP wire protocol: message types and shared constants.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use serde::{Deserialize, Serialize};

/// Image payloads travel over TCP in chunks of this size.
pub const CHUNK_SIZE: usize = 8 * 1024;

/// Subnet-wide broadcast address used when none is configured.
pub const DEFAULT_BROADCAST_ADDR: IpAddr = IpAddr::V4(Ipv4Addr::BROADCAST);

/// A peer as seen on the wire and in the directory: handle plus reachable address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Peer {
    pub handle: String,
    pub addr: SocketAddr,
}

impl Peer {
    pub fn new(handle: impl Into<String>, ip: IpAddr, port: u16) -> Self {
        Self {
            handle: handle.into(),
            addr: SocketAddr::new(ip, port),
        }
    }

    pub fn ip(&self) -> IpAddr {
        self.addr.ip()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

/// All SLCP commands. One message per line; see the `wire` module for the text form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Announce presence: `JOIN <handle> <port>`.
    Join { handle: String, port: u16 },
    /// Graceful leave: `LEAVE <handle>`.
    Leave { handle: String },
    /// Ask everyone for their directory: `WHO`.
    Who,
    /// Text message: `MSG <to> "<text>"`.
    Msg { to: String, text: String },
    /// Image header: `IMG <to> <size>`. Also the first line of a TCP image stream.
    Img { to: String, size: u64 },
    /// Directory dump sent in reply to WHO.
    KnownUsers { entries: Vec<Peer> },
    /// Point-to-point lookup of a single handle: `WHOIS <handle>`.
    Whois { handle: String },
    /// Reply to WHOIS: `IAM <handle> <ip> <port>`.
    Iam { peer: Peer },
    /// Anything that did not parse. Kept verbatim for logging.
    Unknown { raw: String },
}

impl Message {
    /// Leading token of the encoded line (`"UNKNOWN"` for unparsed input).
    pub fn command(&self) -> &'static str {
        match self {
            Message::Join { .. } => "JOIN",
            Message::Leave { .. } => "LEAVE",
            Message::Who => "WHO",
            Message::Msg { .. } => "MSG",
            Message::Img { .. } => "IMG",
            Message::KnownUsers { .. } => "KNOWNUSERS",
            Message::Whois { .. } => "WHOIS",
            Message::Iam { .. } => "IAM",
            Message::Unknown { .. } => "UNKNOWN",
        }
    }
}
