//! Bounded-channel observer: the messenger enqueues, the UI drains at its own pace.

use std::path::Path;

use slcp_core::{ChatEvent, ChatObserver, Peer, TransferProgress};
use tokio::sync::mpsc::{self, error::TrySendError};

pub struct ChannelObserver {
    tx: mpsc::Sender<ChatEvent>,
}

impl ChannelObserver {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ChatEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Never blocks the network tasks: a full queue drops the event.
    fn push(&self, event: ChatEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                tracing::warn!(?event, "event queue full, dropping event");
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!("event receiver gone");
            }
        }
    }
}

impl ChatObserver for ChannelObserver {
    fn on_message(&self, sender_display: &str, text: &str) {
        self.push(ChatEvent::Message {
            sender: sender_display.to_string(),
            text: text.to_string(),
        });
    }

    fn on_image(&self, sender: &str, path: &Path) {
        self.push(ChatEvent::Image {
            sender: sender.to_string(),
            path: path.to_path_buf(),
        });
    }

    fn on_known_users(&self, peers: &[Peer]) {
        self.push(ChatEvent::KnownUsers(peers.to_vec()));
    }

    fn on_transfer_progress(&self, progress: &TransferProgress) {
        self.push(ChatEvent::Progress(progress.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        let (observer, mut rx) = ChannelObserver::new(1);
        observer.on_message("alice", "first");
        observer.on_message("alice", "second");
        assert_eq!(
            rx.recv().await,
            Some(ChatEvent::Message {
                sender: "alice".into(),
                text: "first".into()
            })
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn closed_receiver_is_ignored() {
        let (observer, rx) = ChannelObserver::new(4);
        drop(rx);
        observer.on_known_users(&[]);
    }
}
