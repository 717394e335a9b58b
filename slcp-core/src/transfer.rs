//! Image transfer bookkeeping: per-connection session state, progress, file naming.
//! The TCP side lives in the node; this module only counts bytes.

use std::collections::VecDeque;
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::protocol::CHUNK_SIZE;

/// File extensions accepted as images on the sending side.
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp", "webp"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Send,
    Receive,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Send => f.write_str("send"),
            Direction::Receive => f.write_str("receive"),
        }
    }
}

/// One progress report, emitted after every chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferProgress {
    pub direction: Direction,
    pub peer: String,
    pub bytes: u64,
    pub total: u64,
}

impl TransferProgress {
    /// 0.0 ..= 100.0
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        self.bytes as f64 * 100.0 / self.total as f64
    }
}

/// State of one image stream. `transferred` never exceeds `expected_size`.
#[derive(Debug, Clone)]
pub struct TransferSession {
    direction: Direction,
    peer_handle: String,
    expected_size: u64,
    transferred: u64,
    destination: Option<PathBuf>,
}

impl TransferSession {
    pub fn new(direction: Direction, peer_handle: impl Into<String>, expected_size: u64) -> Self {
        Self {
            direction,
            peer_handle: peer_handle.into(),
            expected_size,
            transferred: 0,
            destination: None,
        }
    }

    pub fn peer_handle(&self) -> &str {
        &self.peer_handle
    }

    pub fn expected_size(&self) -> u64 {
        self.expected_size
    }

    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    pub fn remaining(&self) -> u64 {
        self.expected_size - self.transferred
    }

    /// Size of the next read/write: a full chunk or whatever is left.
    pub fn next_chunk_len(&self) -> usize {
        self.remaining().min(CHUNK_SIZE as u64) as usize
    }

    pub fn is_complete(&self) -> bool {
        self.transferred == self.expected_size
    }

    /// Account for `n` more bytes and return the progress report for them.
    pub fn record(&mut self, n: usize) -> Result<TransferProgress, SessionError> {
        let n = n as u64;
        if n > self.remaining() {
            return Err(SessionError::Overrun {
                expected: self.expected_size,
                got: self.transferred + n,
            });
        }
        self.transferred += n;
        Ok(self.progress())
    }

    pub fn progress(&self) -> TransferProgress {
        TransferProgress {
            direction: self.direction,
            peer: self.peer_handle.clone(),
            bytes: self.transferred,
            total: self.expected_size,
        }
    }

    pub fn destination(&self) -> Option<&Path> {
        self.destination.as_deref()
    }

    pub fn set_destination(&mut self, path: PathBuf) {
        self.destination = Some(path);
    }
}

/// How long a UDP `IMG` notice waits for its TCP stream.
pub const NOTICE_TTL: Duration = Duration::from_secs(60);
const MAX_NOTICES: usize = 64;

struct Notice {
    ip: IpAddr,
    size: u64,
    handle: String,
    at: Instant,
}

/// UDP `IMG` notices not yet matched to a TCP stream.
///
/// The notice arrives from the sender's bound address, so its handle is exact
/// even when several peers share one IP. The receiver claims it by
/// (IP, size) once the stream's header is read. Entries expire after
/// [`NOTICE_TTL`] and the oldest are dropped beyond a fixed capacity.
#[derive(Default)]
pub struct ImageNotices {
    pending: Mutex<VecDeque<Notice>>,
}

impl ImageNotices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, ip: IpAddr, size: u64, handle: impl Into<String>, now: Instant) {
        let mut pending = self.pending();
        prune(&mut pending, now);
        if pending.len() == MAX_NOTICES {
            pending.pop_front();
        }
        pending.push_back(Notice {
            ip,
            size,
            handle: handle.into(),
            at: now,
        });
    }

    /// Take the oldest live notice from `ip` announcing `size` bytes.
    pub fn claim(&self, ip: IpAddr, size: u64, now: Instant) -> Option<String> {
        let mut pending = self.pending();
        prune(&mut pending, now);
        let i = pending.iter().position(|n| n.ip == ip && n.size == size)?;
        pending.remove(i).map(|n| n.handle)
    }

    pub fn len(&self) -> usize {
        self.pending().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn pending(&self) -> MutexGuard<'_, VecDeque<Notice>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn prune(pending: &mut VecDeque<Notice>, now: Instant) {
    pending.retain(|n| now.saturating_duration_since(n.at) < NOTICE_TTL);
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("received {got} bytes, expected {expected}")]
    Overrun { expected: u64, got: u64 },
}

/// True when the path carries one of [`IMAGE_EXTENSIONS`] (case-insensitive).
pub fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            let e = e.to_ascii_lowercase();
            IMAGE_EXTENSIONS.contains(&e.as_str())
        })
        .unwrap_or(false)
}

/// Guess an extension from the payload's magic bytes; `jpg` when unrecognized.
pub fn sniff_extension(payload: &[u8]) -> &'static str {
    if payload.starts_with(b"\x89PNG\r\n\x1a\n") {
        "png"
    } else if payload.starts_with(b"GIF87a") || payload.starts_with(b"GIF89a") {
        "gif"
    } else if payload.starts_with(b"BM") {
        "bmp"
    } else if payload.len() >= 12 && &payload[..4] == b"RIFF" && &payload[8..12] == b"WEBP" {
        "webp"
    } else {
        "jpg"
    }
}

/// `<ip>_<unix_seconds>_<handle>.<ext>` with the handle reduced to file-safe characters.
pub fn image_file_name(sender_ip: IpAddr, unix_secs: u64, handle: &str, ext: &str) -> String {
    let ip = sender_ip.to_string().replace(':', "-");
    let handle: String = handle
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let handle = if handle.is_empty() { "unknown".to_string() } else { handle };
    format!("{ip}_{unix_secs}_{handle}.{ext}")
}
