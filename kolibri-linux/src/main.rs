// Kolibri Linux: console peer for the Kolibri control and file channels.

use std::net::IpAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use kolibri_core::{MemoryChatStore, MemoryFileStore};
use kolibri_linux::{config, ChannelSink, Controller, DiskFile, Event};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

struct Args {
    name: Option<String>,
    connect: Option<IpAddr>,
}

fn parse_args() -> Result<Option<Args>> {
    let mut args = Args {
        name: None,
        connect: None,
    };
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("kolibri-linux {}", VERSION);
                return Ok(None);
            }
            "--name" => args.name = Some(it.next().context("--name needs a value")?),
            "--connect" => {
                let ip = it.next().context("--connect needs an address")?;
                args.connect = Some(ip.parse().with_context(|| format!("bad address {ip}"))?);
            }
            other => bail!("unknown argument {other}"),
        }
    }
    Ok(Some(args))
}

fn main() -> Result<()> {
    let Some(args) = parse_args()? else {
        return Ok(());
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .init();

    let mut cfg = config::load();
    if let Some(name) = args.name {
        cfg.device_name = name;
    }
    info!(
        "Kolibri Linux v{} as {:?}, control port {}, files into {}",
        VERSION,
        cfg.device_name,
        cfg.control_port,
        cfg.receive_dir.display()
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let (sink, mut events) = ChannelSink::new();
        let chats = Arc::new(MemoryChatStore::new());
        let files = Arc::new(MemoryFileStore::new());
        let controller = Controller::new(&cfg, chats, files, Arc::new(sink));

        controller.start_listening().await;
        if let Some(ip) = args.connect {
            controller.connect(ip).await;
        }

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                res = &mut shutdown => {
                    res?;
                    break;
                }
                Some(event) = events.recv() => print_event(&event),
                line = lines.next_line() => match line? {
                    Some(line) => {
                        if !handle_line(&controller, line.trim_end()).await {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        controller.shutdown().await;
        Ok::<_, anyhow::Error>(())
    })?;
    Ok(())
}

/// Run one console line. False on `/quit`.
async fn handle_line(controller: &Controller, line: &str) -> bool {
    let (cmd, rest) = line.split_once(' ').unwrap_or((line, ""));
    match cmd {
        "/quit" => return false,
        "/connect" => match rest.trim().parse::<IpAddr>() {
            Ok(ip) => controller.connect(ip).await,
            Err(e) => warn!(input = rest, error = %e, "bad address"),
        },
        "/disconnect" => controller.disconnect().await,
        "/vibrate" => controller.send_vibrate(),
        "/send" => match DiskFile::open(rest.trim()) {
            Ok(file) => {
                if !controller.send_file(Box::new(file)) {
                    warn!("not connected, file not sent");
                }
            }
            Err(e) => warn!(path = rest, error = %e, "cannot open file"),
        },
        "" => {}
        _ => controller.send_chat(line),
    }
    true
}

fn print_event(event: &Event) {
    match event {
        Event::StateChanged(state) => println!("* {state}"),
        Event::Chat(c) if c.from_self => println!("> {}", c.content),
        Event::Chat(c) => println!("{}: {}", c.peer_name, c.content),
        Event::Vibrate => println!("* buzz"),
        Event::NewTask(f) if f.from_self => println!("* sending {} ({} bytes)", f.name, f.size),
        Event::NewTask(f) => println!("* receiving {} ({} bytes) from {}", f.name, f.size, f.peer_name),
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> Result<()> {
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
