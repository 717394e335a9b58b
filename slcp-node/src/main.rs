// SLCP node: UDP discovery and chat, TCP image transfer, interactive prompt.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use slcp_core::{ChatEvent, Direction};
use slcp_node::cli::{Command, HELP};
use slcp_node::{config, ChannelObserver, Config, Messenger};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

const EVENT_QUEUE: usize = 256;

#[derive(Parser, Debug)]
#[command(name = "slcp-node", version, about = "Serverless LAN chat node")]
struct Args {
    /// Config file (default: first of ./slcp_config.toml, ~/.config/slcp/config.toml, /etc/slcp/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Handle to announce; overrides config and SLCP_HANDLE.
    #[arg(long)]
    handle: Option<String>,
    /// UDP/TCP port; overrides config and SLCP_PORT.
    #[arg(long)]
    port: Option<u16>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut cfg = config::load(args.config.as_deref()).context("loading config")?;
    if let Some(handle) = args.handle {
        cfg.handle = handle;
    }
    if let Some(port) = args.port {
        cfg.port = port;
    }
    cfg.validate().context("invalid config")?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg))
}

async fn run(cfg: Config) -> anyhow::Result<()> {
    let (observer, events) = ChannelObserver::new(EVENT_QUEUE);
    let port = cfg.port;
    let messenger = Arc::new(
        Messenger::bind(cfg, Arc::new(observer))
            .await
            .with_context(|| format!("binding port {port}"))?,
    );
    let printer = tokio::spawn(print_events(events));

    if let Err(e) = messenger.join().await {
        tracing::warn!(error = %e, "JOIN failed");
    }
    println!("online as {} on port {}", messenger.local_handle(), messenger.local_port());
    println!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => {
                    if !handle_line(&messenger, &line).await {
                        break;
                    }
                }
                None => break,
            },
            r = &mut shutdown => {
                r?;
                break;
            }
        }
    }

    messenger.shutdown().await;
    printer.abort();
    Ok(())
}

/// Run one prompt line. Returns false when the user asked to quit.
async fn handle_line(messenger: &Arc<Messenger>, line: &str) -> bool {
    let cmd = match Command::parse(line) {
        Ok(Some(cmd)) => cmd,
        Ok(None) => return true,
        Err(e) => {
            eprintln!("{e}");
            return true;
        }
    };
    let result = match cmd {
        Command::Join => messenger.join().await,
        Command::Leave => messenger.leave().await,
        Command::Who => messenger.who().await,
        Command::Whois(handle) => messenger.whois(&handle).await,
        Command::Msg { to, text } => messenger.send_message(&to, &text).await,
        Command::Img { to, path } => {
            // Images can take a while; keep the prompt responsive.
            let messenger = messenger.clone();
            tokio::spawn(async move {
                if let Err(e) = messenger.send_image(&to, &path).await {
                    eprintln!("image to {to} failed: {e}");
                }
            });
            Ok(())
        }
        Command::Peers => {
            let peers = messenger.peers();
            if peers.is_empty() {
                println!("no known peers");
            }
            for p in peers {
                println!("  {:<16} {}", p.handle, p.addr);
            }
            Ok(())
        }
        Command::Help => {
            println!("{HELP}");
            Ok(())
        }
        Command::Quit => return false,
    };
    if let Err(e) = result {
        eprintln!("{e}");
    }
    true
}

async fn print_events(mut events: mpsc::Receiver<ChatEvent>) {
    // Last printed tenth per transfer, so progress prints at most ten lines.
    let mut shown: HashMap<(Direction, String), u64> = HashMap::new();
    while let Some(event) = events.recv().await {
        match event {
            ChatEvent::Message { sender, text } => println!("<{sender}> {text}"),
            ChatEvent::Image { sender, path } => {
                println!("* {sender} sent an image: {}", path.display())
            }
            ChatEvent::KnownUsers(peers) => {
                println!("* online:");
                for p in peers {
                    println!("  {:<16} {}", p.handle, p.addr);
                }
            }
            ChatEvent::Progress(p) => {
                let tenth = if p.total == 0 { 10 } else { p.bytes * 10 / p.total };
                let key = (p.direction, p.peer.clone());
                if shown.get(&key).is_some_and(|last| *last >= tenth) {
                    continue;
                }
                println!("* {} {}: {:.0}%", p.direction, p.peer, p.percent());
                if p.bytes >= p.total {
                    shown.remove(&key);
                } else {
                    shown.insert(key, tenth);
                }
            }
        }
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    tracing::info!("shutdown requested");
    Ok(())
}
