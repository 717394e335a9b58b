//! SLCP peer protocol engine.
//! Host-driven: no sockets here; the node feeds decoded traffic in and performs the returned actions.

pub mod directory;
pub mod discovery;
pub mod events;
pub mod protocol;
pub mod transfer;
pub mod wire;

pub use directory::PeerDirectory;
pub use discovery::{Action, Discovery, DiscoveryMode, DiscoveryState};
pub use events::{ChatEvent, ChatObserver, NoopObserver};
pub use protocol::{Message, Peer, CHUNK_SIZE, DEFAULT_BROADCAST_ADDR};
pub use transfer::{Direction, ImageNotices, TransferProgress, TransferSession};
pub use wire::{decode_datagram, decode_line, encode_line, parse_image_header, ProtocolError};
