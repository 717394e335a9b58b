//! Membership state machine. Host-driven: the host feeds decoded messages and
//! lifecycle calls in, sends the returned [`Action`]s out. No I/O here.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::Deserialize;

use crate::directory::PeerDirectory;
use crate::protocol::{Message, Peer};

/// Node lifecycle as seen by the rest of the LAN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    Offline,
    Joining,
    Online,
    Leaving,
}

/// Which "who is online" flavor the node answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryMode {
    /// `WHO` broadcast answered by `KNOWNUSERS` from every node.
    #[default]
    Broadcast,
    /// Additionally answer `WHOIS <handle>` for our own handle with `IAM`.
    Whois,
}

/// What the host must do after feeding an event in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Send to the broadcast address on the discovery port.
    Broadcast(Message),
    /// Send to one address.
    SendTo(SocketAddr, Message),
    /// A peer list arrived; hand it to the UI.
    KnownUsers(Vec<Peer>),
}

pub struct Discovery {
    directory: Arc<PeerDirectory>,
    advertised: SocketAddr,
    mode: DiscoveryMode,
    state: DiscoveryState,
}

impl Discovery {
    /// `advertised` is the address other peers should use to reach us; its
    /// port is the one announced in JOIN.
    pub fn new(directory: Arc<PeerDirectory>, advertised: SocketAddr, mode: DiscoveryMode) -> Self {
        Self {
            directory,
            advertised,
            mode,
            state: DiscoveryState::Offline,
        }
    }

    pub fn state(&self) -> DiscoveryState {
        self.state
    }

    pub fn mode(&self) -> DiscoveryMode {
        self.mode
    }

    pub fn directory(&self) -> &Arc<PeerDirectory> {
        &self.directory
    }

    /// Our own entry as it appears in KNOWNUSERS and IAM.
    pub fn local_peer(&self) -> Peer {
        Peer {
            handle: self.directory.local_handle().to_string(),
            addr: self.advertised,
        }
    }

    /// Announce ourselves. Calling it while online re-announces.
    pub fn start(&mut self) -> Vec<Action> {
        self.state = DiscoveryState::Joining;
        let join = Message::Join {
            handle: self.directory.local_handle().to_string(),
            port: self.advertised.port(),
        };
        self.state = DiscoveryState::Online;
        tracing::info!(handle = %self.directory.local_handle(), port = self.advertised.port(), "joining");
        vec![Action::Broadcast(join)]
    }

    /// Say goodbye. No-op when already offline.
    pub fn stop(&mut self) -> Vec<Action> {
        if self.state == DiscoveryState::Offline {
            return vec![];
        }
        self.state = DiscoveryState::Leaving;
        let leave = Message::Leave {
            handle: self.directory.local_handle().to_string(),
        };
        self.state = DiscoveryState::Offline;
        tracing::info!(handle = %self.directory.local_handle(), "leaving");
        vec![Action::Broadcast(leave)]
    }

    /// Ask the LAN who is online.
    pub fn who(&self) -> Vec<Action> {
        vec![Action::Broadcast(Message::Who)]
    }

    /// Ask the LAN where `handle` lives.
    pub fn whois(&self, handle: &str) -> Vec<Action> {
        vec![Action::Broadcast(Message::Whois {
            handle: handle.to_string(),
        })]
    }

    /// Merge one inbound message received from `from`. Non-membership
    /// messages produce no actions.
    pub fn on_message(&mut self, msg: &Message, from: SocketAddr) -> Vec<Action> {
        match msg {
            Message::Join { handle, port } => {
                if self.directory.upsert(handle, from.ip(), *port) {
                    tracing::info!(%handle, ip = %from.ip(), port, "peer joined");
                }
                vec![]
            }
            Message::Leave { handle } => {
                if self.directory.remove(handle).is_some() {
                    tracing::info!(%handle, "peer left");
                }
                vec![]
            }
            Message::Who => {
                if self.state != DiscoveryState::Online {
                    tracing::debug!(%from, "ignoring WHO while not online");
                    return vec![];
                }
                let mut entries = vec![self.local_peer()];
                entries.extend(self.directory.snapshot());
                vec![Action::SendTo(from, Message::KnownUsers { entries })]
            }
            Message::KnownUsers { entries } => {
                let local = self.directory.local_handle();
                // Dedupe by handle; later entries win like they do in the directory.
                let mut seen: BTreeMap<&str, &Peer> = BTreeMap::new();
                for peer in entries.iter().filter(|p| p.handle != local) {
                    self.directory.upsert(&peer.handle, peer.ip(), peer.port());
                    seen.insert(&peer.handle, peer);
                }
                tracing::debug!(%from, count = seen.len(), "known users merged");
                vec![Action::KnownUsers(seen.into_values().cloned().collect())]
            }
            Message::Whois { handle } => {
                let answers = self.mode == DiscoveryMode::Whois
                    && self.state == DiscoveryState::Online
                    && handle == self.directory.local_handle();
                if !answers {
                    return vec![];
                }
                vec![Action::SendTo(
                    from,
                    Message::Iam {
                        peer: self.local_peer(),
                    },
                )]
            }
            Message::Iam { peer } => {
                // Trust the source address over the claimed IP, as for JOIN.
                if !self.directory.upsert(&peer.handle, from.ip(), peer.port()) {
                    return vec![];
                }
                let seen = Peer::new(peer.handle.clone(), from.ip(), peer.port());
                vec![Action::KnownUsers(vec![seen])]
            }
            Message::Msg { .. } | Message::Img { .. } | Message::Unknown { .. } => vec![],
        }
    }
}
