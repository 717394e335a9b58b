//! Two nodes on loopback. Each node's "broadcast" goes to 127.0.0.1 on the
//! other node's port, which stands in for a LAN broadcast domain.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use slcp_core::{encode_line, ChatEvent, DiscoveryMode, DiscoveryState, Message, Peer};
use slcp_node::{ChannelObserver, Config, Messenger, NodeError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc::Receiver;
use tokio::time::{sleep, timeout};

const LOCAL: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
const WAIT: Duration = Duration::from_secs(5);

/// A port free for both UDP and TCP on loopback.
fn free_port() -> u16 {
    loop {
        let udp = std::net::UdpSocket::bind((LOCAL, 0)).unwrap();
        let port = udp.local_addr().unwrap().port();
        if std::net::TcpListener::bind((LOCAL, port)).is_ok() {
            return port;
        }
    }
}

fn two_ports() -> (u16, u16) {
    loop {
        let (a, b) = (free_port(), free_port());
        if a != b {
            return (a, b);
        }
    }
}

fn config(handle: &str, port: u16, peer_port: u16, image_dir: &Path) -> Config {
    let mut c = Config::for_handle(handle);
    c.port = port;
    c.bind_addr = LOCAL;
    c.broadcast_addr = LOCAL;
    c.discovery_port = Some(peer_port);
    c.advertise_ip = Some(LOCAL);
    c.image_dir = image_dir.to_path_buf();
    c.header_timeout_secs = 1;
    c
}

struct Node {
    messenger: Messenger,
    events: Receiver<ChatEvent>,
    port: u16,
}

async fn bind(c: Config) -> Node {
    let (observer, events) = ChannelObserver::new(1024);
    let messenger = Messenger::bind(c, Arc::new(observer)).await.unwrap();
    let port = messenger.local_port();
    Node {
        messenger,
        events,
        port,
    }
}

/// alice and bob, joined and aware of each other.
async fn pair(dir: &Path, bob_autoreply: Option<&str>) -> (Node, Node) {
    let (pa, pb) = two_ports();
    let alice = bind(config("alice", pa, pb, &dir.join("alice"))).await;
    let mut bob_config = config("bob", pb, pa, &dir.join("bob"));
    bob_config.autoreply = bob_autoreply.map(str::to_string);
    let bob = bind(bob_config).await;

    alice.messenger.join().await.unwrap();
    bob.messenger.join().await.unwrap();
    eventually(|| alice.messenger.directory().lookup("bob").is_some()).await;
    eventually(|| bob.messenger.directory().lookup("alice").is_some()).await;
    (alice, bob)
}

async fn eventually(mut check: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !check() {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

/// Next event accepted by `pick`, skipping the rest.
async fn next_event<T>(
    events: &mut Receiver<ChatEvent>,
    mut pick: impl FnMut(ChatEvent) -> Option<T>,
) -> T {
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("observer closed");
            if let Some(t) = pick(event) {
                return t;
            }
        }
    })
    .await
    .expect("no matching event in time")
}

fn message(event: ChatEvent) -> Option<(String, String)> {
    match event {
        ChatEvent::Message { sender, text } => Some((sender, text)),
        _ => None,
    }
}

#[tokio::test]
async fn join_registers_source_ip_and_advertised_port() {
    let dir = tempfile::tempdir().unwrap();
    let (alice, bob) = pair(dir.path(), None).await;

    assert_eq!(
        bob.messenger.directory().lookup("alice"),
        Some(SocketAddr::new(LOCAL, alice.port))
    );
    assert_eq!(bob.messenger.peers(), vec![Peer::new("alice", LOCAL, alice.port)]);
    assert_eq!(alice.messenger.state().await, DiscoveryState::Online);
}

#[tokio::test]
async fn leave_removes_the_peer() {
    let dir = tempfile::tempdir().unwrap();
    let (alice, bob) = pair(dir.path(), None).await;

    alice.messenger.leave().await.unwrap();
    eventually(|| bob.messenger.directory().lookup("alice").is_none()).await;
    assert_eq!(alice.messenger.state().await, DiscoveryState::Offline);
}

#[tokio::test]
async fn who_is_answered_with_known_users() {
    let dir = tempfile::tempdir().unwrap();
    let (alice, mut bob) = pair(dir.path(), None).await;

    bob.messenger.who().await.unwrap();
    let peers = next_event(&mut bob.events, |e| match e {
        ChatEvent::KnownUsers(peers) => Some(peers),
        _ => None,
    })
    .await;
    // bob's own entry is filtered out.
    assert_eq!(peers, vec![Peer::new("alice", LOCAL, alice.port)]);
    assert_eq!(bob.messenger.directory().len(), 1);
}

#[tokio::test]
async fn message_reaches_the_addressed_peer() {
    let dir = tempfile::tempdir().unwrap();
    let (alice, mut bob) = pair(dir.path(), None).await;

    alice.messenger.send_message("bob", "hello").await.unwrap();
    let got = next_event(&mut bob.events, message).await;
    assert_eq!(got, ("alice".to_string(), "hello".to_string()));
}

#[tokio::test]
async fn unknown_handle_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (alice, _bob) = pair(dir.path(), None).await;

    let err = alice.messenger.send_message("carol", "hi").await.unwrap_err();
    assert!(matches!(err, NodeError::UnknownPeer(h) if h == "carol"));
    let err = alice
        .messenger
        .send_image("carol", &dir.path().join("x.jpg"))
        .await
        .unwrap_err();
    assert!(matches!(err, NodeError::UnknownPeer(_)));
}

#[tokio::test]
async fn image_arrives_intact_in_image_dir() {
    let dir = tempfile::tempdir().unwrap();
    let (mut alice, mut bob) = pair(dir.path(), None).await;

    let mut payload = vec![0xff, 0xd8, 0xff, 0xe0];
    payload.extend((0..20000 - 4).map(|i| (i % 251) as u8));
    let src = dir.path().join("photo.jpg");
    std::fs::write(&src, &payload).unwrap();

    let sent = alice.messenger.send_image("bob", &src).await.unwrap();
    assert_eq!(sent, 20000);

    let mut received = Vec::new();
    let (sender, path) = next_event(&mut bob.events, |e| match e {
        ChatEvent::Image { sender, path } => Some((sender, path)),
        ChatEvent::Progress(p) => {
            received.push(p);
            None
        }
        _ => None,
    })
    .await;
    assert_eq!(sender, "alice");
    assert!(path.starts_with(dir.path().join("bob")));
    let name = path.file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("127.0.0.1_"), "{name}");
    assert!(name.ends_with("_alice.jpg"), "{name}");
    assert_eq!(std::fs::read(&path).unwrap(), payload);

    assert!(received.len() >= 3, "expected several chunks, got {}", received.len());
    let last = received.last().unwrap();
    assert_eq!((last.bytes, last.total), (20000, 20000));
    assert_eq!(last.percent(), 100.0);
    assert!(received.windows(2).all(|w| w[0].bytes < w[1].bytes));

    let sent_progress = next_event(&mut alice.events, |e| match e {
        ChatEvent::Progress(p) if p.bytes == p.total => Some(p),
        _ => None,
    })
    .await;
    assert_eq!(sent_progress.peer, "bob");
}

#[tokio::test]
async fn image_names_the_sender_when_peers_share_an_ip() {
    let dir = tempfile::tempdir().unwrap();
    let (alice, mut bob) = pair(dir.path(), None).await;
    let carol = bind(config("carol", free_port(), bob.port, &dir.path().join("carol"))).await;
    carol.messenger.directory().upsert("bob", LOCAL, bob.port);
    bob.messenger.directory().upsert("carol", LOCAL, carol.port);
    assert_eq!(
        bob.messenger.directory().lookup("alice"),
        Some(SocketAddr::new(LOCAL, alice.port))
    );

    let src = dir.path().join("carol.jpg");
    std::fs::write(&src, [0xff, 0xd8, 0xff, 0xe0, 1, 2, 3, 4]).unwrap();
    carol.messenger.send_image("bob", &src).await.unwrap();

    let (sender, path) = next_event(&mut bob.events, |e| match e {
        ChatEvent::Image { sender, path } => Some((sender, path)),
        _ => None,
    })
    .await;
    assert_eq!(sender, "carol");
    let name = path.file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.ends_with("_carol.jpg"), "{name}");
}

#[tokio::test]
async fn unregistered_sender_is_shown_by_address_and_not_auto_replied() {
    let dir = tempfile::tempdir().unwrap();
    let (pb, other) = two_ports();
    let mut bob_config = config("bob", pb, other, &dir.path().join("bob"));
    bob_config.autoreply = Some("away".to_string());
    let mut bob = bind(bob_config).await;

    let raw = UdpSocket::bind((LOCAL, 0)).await.unwrap();
    let raw_port = raw.local_addr().unwrap().port();
    let line = encode_line(&Message::Msg {
        to: "bob".to_string(),
        text: "x".to_string(),
    });
    let mut buf = [0u8; 512];

    raw.send_to(line.as_bytes(), (LOCAL, bob.port)).await.unwrap();
    let got = next_event(&mut bob.events, message).await;
    assert_eq!(got, (format!("127.0.0.1:{raw_port}"), "x".to_string()));
    let reply = timeout(Duration::from_millis(300), raw.recv_from(&mut buf)).await;
    assert!(reply.is_err(), "auto-reply sent to an unknown address");

    // Same IP as a known peer, different port.
    bob.messenger.directory().upsert("alice", LOCAL, other);
    raw.send_to(line.as_bytes(), (LOCAL, bob.port)).await.unwrap();
    let got = next_event(&mut bob.events, message).await;
    assert_eq!(got, (format!("alice (port {raw_port})"), "x".to_string()));
    let reply = timeout(Duration::from_millis(300), raw.recv_from(&mut buf)).await;
    assert!(reply.is_err(), "auto-reply sent to an inexact match");
}

#[tokio::test]
async fn non_image_file_is_refused_before_connecting() {
    let dir = tempfile::tempdir().unwrap();
    let (alice, _bob) = pair(dir.path(), None).await;

    let notes = dir.path().join("notes.txt");
    std::fs::write(&notes, b"not a picture").unwrap();
    let err = alice.messenger.send_image("bob", &notes).await.unwrap_err();
    assert!(matches!(err, NodeError::InvalidFile { .. }));

    let missing = dir.path().join("missing.png");
    let err = alice.messenger.send_image("bob", &missing).await.unwrap_err();
    assert!(matches!(err, NodeError::InvalidFile { .. }));
}

#[tokio::test]
async fn malformed_tcp_header_is_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let (alice, mut bob) = pair(dir.path(), None).await;

    let mut stream = TcpStream::connect((LOCAL, bob.port)).await.unwrap();
    stream.write_all(b"HELLO there\n").await.unwrap();
    let mut rest = Vec::new();
    // The receiver closes without answering.
    let n = timeout(WAIT, stream.read_to_end(&mut rest)).await.unwrap().unwrap_or(0);
    assert_eq!(n, 0);

    // The node keeps working.
    alice.messenger.send_message("bob", "still there?").await.unwrap();
    let got = next_event(&mut bob.events, |e| match e {
        ChatEvent::Image { .. } => panic!("malformed header produced an image"),
        e => message(e),
    })
    .await;
    assert_eq!(got.1, "still there?");
    assert!(!dir.path().join("bob").exists());
}

#[tokio::test]
async fn autoreply_answers_once_per_cooldown() {
    let dir = tempfile::tempdir().unwrap();
    let (mut alice, _bob) = pair(dir.path(), Some("away")).await;

    alice.messenger.send_message("bob", "ping").await.unwrap();
    let got = next_event(&mut alice.events, message).await;
    assert_eq!(got, ("bob".to_string(), "away".to_string()));

    alice.messenger.send_message("bob", "ping again").await.unwrap();
    let second = timeout(
        Duration::from_millis(300),
        next_event(&mut alice.events, message),
    )
    .await;
    assert!(second.is_err(), "second auto-reply inside cooldown");
}

#[tokio::test]
async fn whois_is_answered_with_iam() {
    let dir = tempfile::tempdir().unwrap();
    // bob's broadcasts go to a socket nobody reads, so alice only learns of
    // bob through IAM.
    let sink = std::net::UdpSocket::bind((LOCAL, 0)).unwrap();
    let sink_port = sink.local_addr().unwrap().port();
    let (pa, pb) = two_ports();

    let mut bob_config = config("bob", pb, sink_port, &dir.path().join("bob"));
    bob_config.discovery_mode = DiscoveryMode::Whois;
    let (observer, _bob_events) = ChannelObserver::new(64);
    let bob = Messenger::start(bob_config, Arc::new(observer)).await.unwrap();
    let bob_port = bob.local_port();
    assert_eq!(bob.state().await, DiscoveryState::Online);

    let mut alice = bind(config("alice", pa, bob_port, &dir.path().join("alice"))).await;
    assert!(alice.messenger.directory().is_empty());

    alice.messenger.whois("bob").await.unwrap();
    let peers = next_event(&mut alice.events, |e| match e {
        ChatEvent::KnownUsers(peers) => Some(peers),
        _ => None,
    })
    .await;
    assert_eq!(peers, vec![Peer::new("bob", LOCAL, bob_port)]);
    assert_eq!(
        alice.messenger.directory().lookup("bob"),
        Some(SocketAddr::new(LOCAL, bob_port))
    );
}

#[tokio::test]
async fn second_node_on_same_port_is_a_bind_conflict() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    let first = bind(config("alice", port, port, dir.path())).await;

    let (observer, _events) = ChannelObserver::new(8);
    let err = Messenger::bind(config("bob", first.port, port, dir.path()), Arc::new(observer))
        .await
        .err()
        .expect("second bind succeeded");
    assert!(matches!(err, NodeError::BindConflict { port: p, .. } if p == port));
}

#[tokio::test]
async fn invalid_handle_is_refused_at_bind() {
    let (observer, _events) = ChannelObserver::new(8);
    let err = Messenger::bind(Config::for_handle("two words"), Arc::new(observer))
        .await
        .err()
        .expect("bind accepted a bad handle");
    assert!(matches!(err, NodeError::Config(_)));
}
