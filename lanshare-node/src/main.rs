// LanShare daemon: discovery, chunk transport and gap repair; `send` and `say` for one-shot use.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use lanshare_core::NodeEvent;
use lanshare_node::{config, Node, SendReport};
use tokio::sync::mpsc;
use tracing::{info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// One-shot commands wait this long for peers to answer the first advertisement.
const DISCOVERY_WAIT: Duration = Duration::from_secs(3);

enum Command {
    Daemon,
    Send(PathBuf),
    Say(String),
}

fn parse_args() -> anyhow::Result<Option<Command>> {
    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        None => Ok(Some(Command::Daemon)),
        Some("--version") | Some("-V") => {
            println!("lanshare {}", VERSION);
            Ok(None)
        }
        Some("send") => {
            let path = args.next().context("usage: lanshare send <path>")?;
            Ok(Some(Command::Send(PathBuf::from(path))))
        }
        Some("say") => {
            let text = args.collect::<Vec<_>>().join(" ");
            anyhow::ensure!(!text.is_empty(), "usage: lanshare say <text>");
            Ok(Some(Command::Say(text)))
        }
        Some(other) => anyhow::bail!("unknown argument {other:?}; try send, say or --version"),
    }
}

fn main() -> anyhow::Result<()> {
    let Some(command) = parse_args()? else {
        return Ok(());
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("lanshare_node=info".parse()?)
                .add_directive("lanshare_core=info".parse()?),
        )
        .init();

    let cfg = config::load();
    info!("lanshare v{} (chunk size {} bytes)", VERSION, cfg.chunk_size);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let (node, events) = Node::start(cfg).await;
        let result = match command {
            Command::Daemon => {
                let logger = tokio::spawn(log_events(events));
                let res = shutdown_signal().await;
                logger.abort();
                res
            }
            Command::Send(path) => {
                tokio::time::sleep(DISCOVERY_WAIT).await;
                send(&node, &path).await
            }
            Command::Say(text) => {
                tokio::time::sleep(DISCOVERY_WAIT).await;
                match node.send_text(&text).await {
                    Ok(report) => {
                        print_report(&report);
                        Ok(())
                    }
                    Err(e) => Err(e.into()),
                }
            }
        };
        node.shutdown();
        result
    })
}

async fn send(node: &Node, path: &std::path::Path) -> anyhow::Result<()> {
    let report = node
        .send_file(path)
        .await
        .with_context(|| format!("sending {}", path.display()))?;
    print_report(&report);
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    for peer in &report.delivered {
        match node.await_ack(&file_name, *peer).await {
            Some(ack) => println!("{}: {:?}", peer, ack.status),
            None => println!("{}: no ack", peer),
        }
    }
    Ok(())
}

fn print_report(report: &SendReport) {
    for peer in &report.delivered {
        println!("delivered to {}", peer);
    }
    for (peer, e) in &report.failed {
        println!("failed for {}: {}", peer, e);
    }
}

async fn log_events(mut events: mpsc::UnboundedReceiver<NodeEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            NodeEvent::PeerDiscovered { addr } => info!("peer {}", addr.ip()),
            NodeEvent::ChunkReceived { info, from } => info!(
                "chunk {}/{} of {} ({} bytes) from {}",
                info.index + 1,
                info.total_chunks,
                info.file_name,
                info.size,
                from
            ),
            NodeEvent::MessageReceived { text, from } => info!("{}: {}", from, text),
            NodeEvent::FileAck { ack, from } => {
                info!("{} acked {} ({:?})", from, ack.file_name, ack.status)
            }
            NodeEvent::FileAssembled(file) => {
                if let Err(e) = save(&file).await {
                    warn!("could not save {}: {}", file.file_name, e);
                }
            }
        }
    }
}

/// Completed files land in the working directory under their base name.
async fn save(file: &lanshare_core::AssembledFile) -> anyhow::Result<()> {
    let name = std::path::Path::new(&file.file_name)
        .file_name()
        .context("file name has no final component")?;
    tokio::fs::write(name, &file.bytes).await?;
    info!("saved {} ({} bytes) from {}", file.file_name, file.bytes.len(), file.source.ip);
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
