//! Image transfer over TCP: `IMG <to> <size>\n` header, then exactly `size` raw bytes.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use slcp_core::transfer::{has_image_extension, image_file_name, sniff_extension};
use slcp_core::wire::MAX_HEADER_LEN;
use slcp_core::{
    encode_line, parse_image_header, ChatObserver, Direction, ImageNotices, Message,
    PeerDirectory, TransferSession, CHUNK_SIZE,
};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::NodeError;

/// Timeouts for one transfer.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub connect: Duration,
    pub header: Duration,
    pub chunk: Duration,
}

/// An image opened for sending; `size` is what the header announces.
pub struct ImageFile {
    pub file: File,
    pub size: u64,
    pub path: PathBuf,
}

/// Open `path` and check that it is a non-empty image.
pub async fn open_image(path: &Path) -> Result<ImageFile, NodeError> {
    let meta = fs::metadata(path)
        .await
        .map_err(|e| NodeError::invalid_file(path, e.to_string()))?;
    if !meta.is_file() {
        return Err(NodeError::invalid_file(path, "not a regular file"));
    }
    if meta.len() == 0 {
        return Err(NodeError::invalid_file(path, "file is empty"));
    }
    if !has_image_extension(path) {
        return Err(NodeError::invalid_file(path, "not an image"));
    }
    let file = File::open(path)
        .await
        .map_err(|e| NodeError::invalid_file(path, e.to_string()))?;
    Ok(ImageFile {
        file,
        size: meta.len(),
        path: path.to_path_buf(),
    })
}

/// Stream an opened image to `addr`. Reports progress after every chunk; returns bytes sent.
pub async fn send_image(
    addr: SocketAddr,
    handle: &str,
    image: ImageFile,
    observer: &dyn ChatObserver,
    timeouts: Timeouts,
) -> Result<u64, NodeError> {
    let ImageFile {
        mut file,
        size,
        path,
    } = image;

    let mut stream = match timeout(timeouts.connect, TcpStream::connect(addr)).await {
        Err(_) => return Err(NodeError::TransferTimeout("connect")),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
            return Err(NodeError::ConnectionRefused(addr))
        }
        Ok(Err(e)) => return Err(e.into()),
        Ok(Ok(s)) => s,
    };

    let header = encode_line(&Message::Img {
        to: handle.to_string(),
        size,
    });
    let mut session = TransferSession::new(Direction::Send, handle, size);
    write_with_timeout(&mut stream, header.as_bytes(), &session, timeouts.chunk).await?;

    let mut buf = vec![0u8; CHUNK_SIZE];
    while !session.is_complete() {
        let want = session.next_chunk_len();
        let n = file.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(NodeError::invalid_file(&path, "file shrank while sending"));
        }
        write_with_timeout(&mut stream, &buf[..n], &session, timeouts.chunk).await?;
        let progress = session.record(n)?;
        observer.on_transfer_progress(&progress);
    }
    stream.flush().await?;
    // The peer may close first once it has every byte.
    let _ = stream.shutdown().await;
    tracing::info!(%handle, %addr, bytes = size, "image sent");
    Ok(size)
}

async fn write_with_timeout(
    stream: &mut TcpStream,
    bytes: &[u8],
    session: &TransferSession,
    limit: Duration,
) -> Result<(), NodeError> {
    match timeout(limit, stream.write_all(bytes)).await {
        Err(_) => Err(NodeError::TransferTimeout("write")),
        Ok(Err(e)) => Err(closed_or_io(e, session)),
        Ok(Ok(())) => Ok(()),
    }
}

fn closed_or_io(e: std::io::Error, session: &TransferSession) -> NodeError {
    use std::io::ErrorKind::*;
    match e.kind() {
        BrokenPipe | ConnectionReset | ConnectionAborted | UnexpectedEof => {
            NodeError::ConnectionClosed {
                transferred: session.transferred(),
                expected: session.expected_size(),
            }
        }
        _ => NodeError::Io(e),
    }
}

/// What the receiving side needs to know.
pub struct ReceiveContext<'a> {
    pub local_handle: &'a str,
    pub image_dir: &'a Path,
    pub directory: &'a PeerDirectory,
    pub notices: &'a ImageNotices,
    pub observer: &'a dyn ChatObserver,
    pub timeouts: Timeouts,
    pub max_image_bytes: u64,
}

/// A stored image.
#[derive(Debug, Clone)]
pub struct ReceivedImage {
    pub sender: String,
    pub path: PathBuf,
    pub size: u64,
}

/// Read one header and payload from an accepted connection and store it.
pub async fn receive_image(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: &ReceiveContext<'_>,
) -> Result<ReceivedImage, NodeError> {
    let mut reader = BufReader::new(stream);
    let header = match timeout(ctx.timeouts.header, read_header(&mut reader)).await {
        Err(_) => return Err(NodeError::TransferTimeout("header")),
        Ok(r) => r?,
    };
    let (to, size) = parse_image_header(&header)?;
    if to != ctx.local_handle {
        return Err(NodeError::Misaddressed(to));
    }
    if size > ctx.max_image_bytes {
        return Err(NodeError::ImageTooLarge {
            size,
            max: ctx.max_image_bytes,
        });
    }

    let sender = resolve_sender(ctx, peer.ip(), size).await;
    tracing::info!(%sender, %peer, bytes = size, "receiving image");

    let mut session = TransferSession::new(Direction::Receive, sender.clone(), size);
    let mut payload = Vec::with_capacity(size.min(1024 * 1024) as usize);
    let mut buf = vec![0u8; CHUNK_SIZE];
    while !session.is_complete() {
        let want = session.next_chunk_len();
        let n = match timeout(ctx.timeouts.chunk, reader.read(&mut buf[..want])).await {
            Err(_) => return Err(NodeError::TransferTimeout("chunk")),
            Ok(r) => r.map_err(|e| closed_or_io(e, &session))?,
        };
        if n == 0 {
            return Err(NodeError::ConnectionClosed {
                transferred: session.transferred(),
                expected: size,
            });
        }
        payload.extend_from_slice(&buf[..n]);
        let progress = session.record(n)?;
        ctx.observer.on_transfer_progress(&progress);
    }

    let name = image_file_name(peer.ip(), unix_now(), &sender, sniff_extension(&payload));
    let path = persist(ctx.image_dir, &name, &payload).await?;
    session.set_destination(path.clone());
    tracing::info!(
        sender = %session.peer_handle(),
        path = ?session.destination(),
        "image stored"
    );
    Ok(ReceivedImage { sender, path, size })
}

/// Polls for a UDP notice when the IP alone cannot tell peers apart.
const NOTICE_POLLS: u32 = 10;
const NOTICE_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Name the sender of a stream from `ip` announcing `size` bytes: the handle
/// of a matching UDP notice, else the first handle at that IP, else the IP.
async fn resolve_sender(ctx: &ReceiveContext<'_>, ip: IpAddr, size: u64) -> String {
    let ambiguous = ctx.directory.count_at_ip(ip) > 1;
    let mut polls = 0;
    loop {
        if let Some(handle) = ctx.notices.claim(ip, size, Instant::now()) {
            return handle;
        }
        if !ambiguous || polls == NOTICE_POLLS {
            break;
        }
        polls += 1;
        tokio::time::sleep(NOTICE_POLL_INTERVAL).await;
    }
    ctx.directory
        .handle_for_ip(ip)
        .unwrap_or_else(|| ip.to_string())
}

async fn read_header(reader: &mut BufReader<TcpStream>) -> Result<String, NodeError> {
    let mut line = Vec::new();
    reader
        .take(MAX_HEADER_LEN as u64)
        .read_until(b'\n', &mut line)
        .await?;
    if line.last() != Some(&b'\n') {
        return Err(NodeError::MalformedMessage(
            slcp_core::ProtocolError::Malformed(String::from_utf8_lossy(&line).into_owned()),
        ));
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}

const MAX_NAME_ATTEMPTS: u32 = 1000;

/// Write `payload` under `dir`, creating it; never overwrites an existing file.
async fn persist(dir: &Path, name: &str, payload: &[u8]) -> Result<PathBuf, NodeError> {
    fs::create_dir_all(dir).await?;
    let (stem, ext) = name.rsplit_once('.').unwrap_or((name, "bin"));
    for attempt in 0..MAX_NAME_ATTEMPTS {
        let candidate = if attempt == 0 {
            dir.join(name)
        } else {
            dir.join(format!("{stem}-{attempt}.{ext}"))
        };
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
            .await
        {
            Ok(mut file) => {
                file.write_all(payload).await?;
                file.flush().await?;
                return Ok(candidate);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::AlreadyExists,
        format!("no free file name for {name} in {}", dir.display()),
    )
    .into())
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
