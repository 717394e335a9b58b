//! The running node: one UDP socket for the control plane, one TCP listener
//! for images, both on the same port. Drives [`Discovery`] and reports to a
//! [`ChatObserver`].

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use slcp_core::{
    decode_datagram, encode_line, Action, ChatObserver, Discovery, DiscoveryState, ImageNotices,
    Message, Peer, PeerDirectory,
};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::error::NodeError;
use crate::transfer::{self, ReceiveContext, Timeouts};

/// Largest datagram we accept.
const MAX_DATAGRAM: usize = 65536;
/// Minimum gap between two auto-replies to the same sender.
const AUTOREPLY_COOLDOWN: Duration = Duration::from_secs(30);
/// Pause after a failed recv or accept before trying again.
const RECV_RETRY_DELAY: Duration = Duration::from_millis(100);

pub struct Messenger {
    inner: Arc<Inner>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

struct Inner {
    config: Config,
    local_port: u16,
    socket: UdpSocket,
    directory: Arc<PeerDirectory>,
    discovery: Mutex<Discovery>,
    observer: Arc<dyn ChatObserver>,
    autoreplied: StdMutex<HashMap<SocketAddr, Instant>>,
    notices: ImageNotices,
}

impl Messenger {
    /// Bind UDP and TCP on the configured port and start receiving. Does not announce.
    pub async fn bind(config: Config, observer: Arc<dyn ChatObserver>) -> Result<Self, NodeError> {
        config.validate()?;

        let std_udp = std::net::UdpSocket::bind((config.bind_addr, config.port))
            .map_err(|e| bind_error(config.port, e))?;
        std_udp.set_broadcast(true)?;
        std_udp.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(std_udp)?;
        let local_port = socket.local_addr()?.port();

        let std_tcp = std::net::TcpListener::bind((config.bind_addr, local_port))
            .map_err(|e| bind_error(local_port, e))?;
        std_tcp.set_nonblocking(true)?;
        let listener = TcpListener::from_std(std_tcp)?;

        let advertised = SocketAddr::new(advertise_ip(&config), local_port);
        let directory = Arc::new(PeerDirectory::new(config.handle.clone()));
        let discovery = Discovery::new(directory.clone(), advertised, config.discovery_mode);
        tracing::info!(
            handle = %config.handle,
            %advertised,
            mode = ?discovery.mode(),
            "node bound"
        );

        let inner = Arc::new(Inner {
            config,
            local_port,
            socket,
            directory,
            discovery: Mutex::new(discovery),
            observer,
            autoreplied: StdMutex::new(HashMap::new()),
            notices: ImageNotices::new(),
        });

        let recv_task = tokio::spawn(recv_loop(inner.clone()));
        let accept_task = tokio::spawn(accept_loop(inner.clone(), listener));
        Ok(Self {
            inner,
            tasks: StdMutex::new(vec![recv_task, accept_task]),
        })
    }

    /// [`bind`](Self::bind), then [`join`](Self::join).
    pub async fn start(config: Config, observer: Arc<dyn ChatObserver>) -> Result<Self, NodeError> {
        let messenger = Self::bind(config, observer).await?;
        messenger.join().await?;
        Ok(messenger)
    }

    pub async fn join(&self) -> Result<(), NodeError> {
        let actions = self.inner.discovery.lock().await.start();
        self.inner.perform(actions).await
    }

    pub async fn leave(&self) -> Result<(), NodeError> {
        let actions = self.inner.discovery.lock().await.stop();
        self.inner.perform(actions).await
    }

    /// Ask every node for its peer list; answers arrive as `on_known_users`.
    pub async fn who(&self) -> Result<(), NodeError> {
        let actions = self.inner.discovery.lock().await.who();
        self.inner.perform(actions).await
    }

    pub async fn whois(&self, handle: &str) -> Result<(), NodeError> {
        let actions = self.inner.discovery.lock().await.whois(handle);
        self.inner.perform(actions).await
    }

    pub async fn send_message(&self, handle: &str, text: &str) -> Result<(), NodeError> {
        let addr = self.resolve(handle)?;
        let msg = Message::Msg {
            to: handle.to_string(),
            text: text.to_string(),
        };
        self.inner.send(addr, &msg).await?;
        tracing::debug!(%handle, %addr, "message sent");
        Ok(())
    }

    /// Announce the image over UDP, then stream it over TCP. Returns bytes sent.
    pub async fn send_image(&self, handle: &str, path: &Path) -> Result<u64, NodeError> {
        let addr = self.resolve(handle)?;
        let image = transfer::open_image(path).await?;
        let notice = Message::Img {
            to: handle.to_string(),
            size: image.size,
        };
        self.inner.send(addr, &notice).await?;
        transfer::send_image(
            addr,
            handle,
            image,
            self.inner.observer.as_ref(),
            self.inner.timeouts(),
        )
        .await
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.inner.directory.snapshot()
    }

    pub fn directory(&self) -> &Arc<PeerDirectory> {
        &self.inner.directory
    }

    /// Actual UDP/TCP port (useful when configured with port 0).
    pub fn local_port(&self) -> u16 {
        self.inner.local_port
    }

    pub fn local_handle(&self) -> &str {
        &self.inner.config.handle
    }

    pub async fn state(&self) -> DiscoveryState {
        self.inner.discovery.lock().await.state()
    }

    /// Send LEAVE and stop the background tasks.
    pub async fn shutdown(&self) {
        if let Err(e) = self.leave().await {
            tracing::warn!(error = %e, "LEAVE failed");
        }
        self.abort_tasks();
    }

    fn resolve(&self, handle: &str) -> Result<SocketAddr, NodeError> {
        self.inner
            .directory
            .lookup(handle)
            .ok_or_else(|| NodeError::UnknownPeer(handle.to_string()))
    }

    fn abort_tasks(&self) {
        let mut tasks = match self.tasks.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for Messenger {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

impl Inner {
    fn timeouts(&self) -> Timeouts {
        Timeouts {
            connect: self.config.connect_timeout(),
            header: self.config.header_timeout(),
            chunk: self.config.chunk_timeout(),
        }
    }

    fn broadcast_target(&self) -> SocketAddr {
        SocketAddr::new(self.config.broadcast_addr, self.config.discovery_port())
    }

    async fn send(&self, addr: SocketAddr, msg: &Message) -> Result<(), NodeError> {
        let line = encode_line(msg);
        self.socket.send_to(line.as_bytes(), addr).await?;
        Ok(())
    }

    async fn perform(&self, actions: Vec<Action>) -> Result<(), NodeError> {
        for action in actions {
            match action {
                Action::Broadcast(msg) => self.send(self.broadcast_target(), &msg).await?,
                Action::SendTo(addr, msg) => self.send(addr, &msg).await?,
                Action::KnownUsers(peers) => self.observer.on_known_users(&peers),
            }
        }
        Ok(())
    }

    async fn dispatch(&self, msg: Message, from: SocketAddr) {
        match msg {
            Message::Unknown { raw } => {
                tracing::debug!(%from, %raw, "malformed datagram line");
            }
            Message::Msg { to, text } => self.on_chat(&to, &text, from).await,
            Message::Img { to, size } => self.on_image_notice(&to, size, from),
            msg => {
                let actions = self.discovery.lock().await.on_message(&msg, from);
                if let Err(e) = self.perform(actions).await {
                    tracing::warn!(%from, command = msg.command(), error = %e, "reply failed");
                }
            }
        }
    }

    /// Remember who announced an image so the TCP stream can be attributed
    /// even when several peers share the source IP.
    fn on_image_notice(&self, to: &str, size: u64, from: SocketAddr) {
        if to != self.config.handle {
            tracing::debug!(%from, %to, "image notice for another handle");
            return;
        }
        let Some(handle) = self.directory.handle_for_addr(from) else {
            tracing::debug!(%from, size, "image notice from unknown address");
            return;
        };
        tracing::info!(%from, %handle, size, "image announced");
        self.notices.record(from.ip(), size, handle, Instant::now());
    }

    async fn on_chat(&self, to: &str, text: &str, from: SocketAddr) {
        if to != self.config.handle {
            tracing::debug!(%from, %to, "message for another handle");
            return;
        }
        let sender = self.directory.handle_for_addr(from);
        let display = match &sender {
            Some(handle) => handle.clone(),
            None => match self.directory.handle_for_ip(from.ip()) {
                Some(handle) => format!("{handle} (port {})", from.port()),
                None => from.to_string(),
            },
        };
        self.observer.on_message(&display, text);

        let (Some(reply), Some(handle)) = (&self.config.autoreply, sender) else {
            return;
        };
        if !self.autoreply_due(from) {
            return;
        }
        let msg = Message::Msg {
            to: handle,
            text: reply.clone(),
        };
        if let Err(e) = self.send(from, &msg).await {
            tracing::warn!(%from, error = %e, "auto-reply failed");
        }
    }

    fn autoreply_due(&self, to: SocketAddr) -> bool {
        let mut sent = match self.autoreplied.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        cooldown_elapsed(&mut sent, to, Instant::now())
    }
}

/// True, and `to` is stamped with `now`, when `to` has had no auto-reply
/// within [`AUTOREPLY_COOLDOWN`]. Expired stamps are dropped.
fn cooldown_elapsed(sent: &mut HashMap<SocketAddr, Instant>, to: SocketAddr, now: Instant) -> bool {
    sent.retain(|_, last| now.saturating_duration_since(*last) < AUTOREPLY_COOLDOWN);
    if sent.contains_key(&to) {
        return false;
    }
    sent.insert(to, now);
    true
}

async fn recv_loop(inner: Arc<Inner>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        match inner.socket.recv_from(&mut buf).await {
            Ok((n, from)) => {
                let messages = decode_datagram(&buf[..n]);
                let inner = inner.clone();
                tokio::spawn(async move {
                    for msg in messages {
                        inner.dispatch(msg, from).await;
                    }
                });
            }
            // ICMP port-unreachable surfaces here on some platforms.
            Err(e) => {
                tracing::debug!(error = %e, "recv_from failed");
                tokio::time::sleep(RECV_RETRY_DELAY).await;
            }
        }
    }
}

async fn accept_loop(inner: Arc<Inner>, listener: TcpListener) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(x) => x,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                tokio::time::sleep(RECV_RETRY_DELAY).await;
                continue;
            }
        };
        let inner = inner.clone();
        tokio::spawn(async move {
            let ctx = ReceiveContext {
                local_handle: &inner.config.handle,
                image_dir: &inner.config.image_dir,
                directory: &inner.directory,
                notices: &inner.notices,
                observer: inner.observer.as_ref(),
                timeouts: inner.timeouts(),
                max_image_bytes: inner.config.max_image_bytes,
            };
            match transfer::receive_image(stream, peer, &ctx).await {
                Ok(image) => inner.observer.on_image(&image.sender, &image.path),
                Err(e) => tracing::warn!(%peer, error = %e, "image transfer dropped"),
            }
        });
    }
}

fn bind_error(port: u16, e: std::io::Error) -> NodeError {
    if e.kind() == std::io::ErrorKind::AddrInUse {
        NodeError::BindConflict { port, source: e }
    } else {
        NodeError::Io(e)
    }
}

/// The IP peers should reach us on: configured, else the bound interface, else
/// the one the OS would route outbound traffic through.
fn advertise_ip(config: &Config) -> IpAddr {
    if let Some(ip) = config.advertise_ip {
        return ip;
    }
    if !config.bind_addr.is_unspecified() {
        return config.bind_addr;
    }
    detect_local_ip().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

/// No packet is sent: connecting a UDP socket only selects a route.
fn detect_local_ip() -> Option<IpAddr> {
    let route = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    route.connect((Ipv4Addr::new(8, 8, 8, 8), 80)).ok()?;
    let ip = route.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}
