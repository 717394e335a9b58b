//! Observer port for the UI layer.
//!
//! The messenger calls these synchronously from its tasks, so implementations
//! must return quickly. Queue work elsewhere if it can block.

use std::path::{Path, PathBuf};

use crate::protocol::Peer;
use crate::transfer::TransferProgress;

/// Owned form of every observer callback, for channel-based delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    Message { sender: String, text: String },
    Image { sender: String, path: PathBuf },
    KnownUsers(Vec<Peer>),
    Progress(TransferProgress),
}

pub trait ChatObserver: Send + Sync {
    fn on_message(&self, _sender_display: &str, _text: &str) {}
    fn on_image(&self, _sender: &str, _path: &Path) {}
    fn on_known_users(&self, _peers: &[Peer]) {}
    fn on_transfer_progress(&self, _progress: &TransferProgress) {}
}

/// Discards everything.
pub struct NoopObserver;

impl ChatObserver for NoopObserver {}

/// Any `Fn(ChatEvent)` closure is an observer.
impl<F> ChatObserver for F
where
    F: Fn(ChatEvent) + Send + Sync,
{
    fn on_message(&self, sender_display: &str, text: &str) {
        self(ChatEvent::Message {
            sender: sender_display.to_string(),
            text: text.to_string(),
        })
    }

    fn on_image(&self, sender: &str, path: &Path) {
        self(ChatEvent::Image {
            sender: sender.to_string(),
            path: path.to_path_buf(),
        })
    }

    fn on_known_users(&self, peers: &[Peer]) {
        self(ChatEvent::KnownUsers(peers.to_vec()))
    }

    fn on_transfer_progress(&self, progress: &TransferProgress) {
        self(ChatEvent::Progress(progress.clone()))
    }
}
