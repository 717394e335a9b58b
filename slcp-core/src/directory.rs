//! Peer directory: handle -> address, shared by the datagram path and outbound requests.
//!
//! One mutex guards the whole map and no method calls out while holding it, so
//! there is no lock ordering to get wrong. Every insert goes through [`PeerDirectory::upsert`],
//! which refuses the local handle.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Mutex, MutexGuard};

use crate::protocol::Peer;

pub struct PeerDirectory {
    local_handle: String,
    peers: Mutex<HashMap<String, SocketAddr>>,
}

impl PeerDirectory {
    pub fn new(local_handle: impl Into<String>) -> Self {
        Self {
            local_handle: local_handle.into(),
            peers: Mutex::new(HashMap::new()),
        }
    }

    pub fn local_handle(&self) -> &str {
        &self.local_handle
    }

    /// Insert or overwrite a peer (last writer wins). Returns false, storing
    /// nothing, when `handle` is our own.
    pub fn upsert(&self, handle: &str, ip: IpAddr, port: u16) -> bool {
        if handle == self.local_handle {
            return false;
        }
        self.peers()
            .insert(handle.to_string(), SocketAddr::new(ip, port));
        true
    }

    pub fn remove(&self, handle: &str) -> Option<SocketAddr> {
        self.peers().remove(handle)
    }

    pub fn lookup(&self, handle: &str) -> Option<SocketAddr> {
        self.peers().get(handle).copied()
    }

    /// Copy of every entry, sorted by handle.
    pub fn snapshot(&self) -> Vec<Peer> {
        let mut out: Vec<Peer> = self
            .peers()
            .iter()
            .map(|(handle, addr)| Peer {
                handle: handle.clone(),
                addr: *addr,
            })
            .collect();
        out.sort_by(|a, b| a.handle.cmp(&b.handle));
        out
    }

    /// Handle registered at exactly this address.
    pub fn handle_for_addr(&self, addr: SocketAddr) -> Option<String> {
        self.peers()
            .iter()
            .filter(|(_, a)| **a == addr)
            .map(|(h, _)| h)
            .min()
            .cloned()
    }

    /// Handle registered at this IP on any port; the lexicographically first on ties.
    pub fn handle_for_ip(&self, ip: IpAddr) -> Option<String> {
        self.peers()
            .iter()
            .filter(|(_, a)| a.ip() == ip)
            .map(|(h, _)| h)
            .min()
            .cloned()
    }

    /// Number of handles registered at this IP.
    pub fn count_at_ip(&self, ip: IpAddr) -> usize {
        self.peers().values().filter(|a| a.ip() == ip).count()
    }

    pub fn len(&self) -> usize {
        self.peers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn peers(&self) -> MutexGuard<'_, HashMap<String, SocketAddr>> {
        // A panic while holding the guard cannot leave the map half-written.
        self.peers.lock().unwrap_or_else(|e| e.into_inner())
    }
}
