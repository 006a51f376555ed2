//! ModNet CLI - host, join, and discover ModNet sessions from the terminal
//!
//! The `join` command wires stdin to a demo "chat" module so two terminals
//! (one `modnet host`, one `modnet join`) exercise the whole stack.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use modnet_core::{ModuleId, Reliability, DEFAULT_DISCOVERY_PORT, DEFAULT_PORT};
use modnet_discovery::{AnnounceTarget, Browser, DiscoveryConfig, DiscoveryEvent};
use modnet_session::{Client, Host, SessionConfig, SessionEvent};

/// ModNet - module-oriented messaging over raw UDP
#[derive(Parser)]
#[command(name = "modnet")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open a host and relay between peers
    Host {
        /// Advertised host name
        #[arg(short, long, default_value = "modnet-host")]
        name: String,

        /// Application port
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Peer capacity (2-253)
        #[arg(short, long, default_value_t = 16)]
        capacity: u8,

        /// Announce on a multicast group instead of LAN broadcast
        #[arg(long)]
        multicast: Option<Ipv4Addr>,
    },

    /// Join a host and chat over the demo module
    Join {
        /// Host address (ip:port)
        addr: SocketAddr,

        /// Display name
        #[arg(short, long, default_value = "player")]
        username: String,
    },

    /// Browse for open hosts on the LAN
    Discover {
        /// How long to listen
        #[arg(short, long, default_value_t = 10)]
        seconds: u64,

        /// Discovery port
        #[arg(short, long, default_value_t = DEFAULT_DISCOVERY_PORT)]
        port: u16,

        /// Listen on a multicast group instead of LAN broadcast
        #[arg(long)]
        multicast: Option<Ipv4Addr>,
    },
}

fn chat_module() -> ModuleId {
    ModuleId::from_name("chat")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Host {
            name,
            port,
            capacity,
            multicast,
        } => run_host(name, port, capacity, multicast).await,
        Commands::Join { addr, username } => run_join(addr, username).await,
        Commands::Discover {
            seconds,
            port,
            multicast,
        } => run_discover(seconds, port, multicast).await,
    }
}

async fn run_host(
    name: String,
    port: u16,
    capacity: u8,
    multicast: Option<Ipv4Addr>,
) -> Result<()> {
    let config = SessionConfig {
        port,
        max_peers: capacity,
        multicast_group: multicast,
        ..SessionConfig::default()
    };
    let (host, mut events) = Host::open(&name, config).await.context("opening host")?;
    println!(
        "hosting '{}' on {} (capacity {}) - ctrl-c to stop",
        name,
        host.local_addr(),
        capacity
    );

    let _chat = host
        .register_module(chat_module(), |sender, payload| {
            println!("<{}> {}", sender, String::from_utf8_lossy(&payload));
        })
        .context("registering chat module")?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(SessionEvent::PeerJoined(id)) => println!("* peer {} joined", id),
                Some(SessionEvent::PeerLeft(id)) => println!("* peer {} left", id),
                Some(event) => info!(?event, "session event"),
                None => break,
            },
        }
    }

    host.shutdown().await;
    Ok(())
}

async fn run_join(addr: SocketAddr, username: String) -> Result<()> {
    let config = SessionConfig {
        username,
        ..SessionConfig::default()
    };
    let (client, mut events) = Client::connect(addr, config)
        .await
        .context("connecting to host")?;
    println!(
        "connected to '{}' as peer {} - type to chat, ctrl-c to leave",
        client.host_name(),
        client.local_id()
    );

    let _chat = client
        .register_module(chat_module(), |sender, payload| {
            println!("<{}> {}", sender, String::from_utf8_lossy(&payload));
        })
        .context("registering chat module")?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line? {
                Some(line) if !line.is_empty() => {
                    let delivery = client
                        .send(
                            Reliability::ReliableOrdered,
                            chat_module(),
                            Bytes::from(line.into_bytes()),
                            None,
                        )
                        .await;
                    tokio::spawn(async move {
                        if !delivery.wait().await {
                            warn!("message was not sent");
                        }
                    });
                }
                Some(_) => {}
                None => break,
            },
            event = events.recv() => match event {
                Some(SessionEvent::PeerJoined(id)) => println!("* peer {} joined", id),
                Some(SessionEvent::PeerLeft(id)) => println!("* peer {} left", id),
                Some(SessionEvent::Disconnected(reason)) => {
                    println!("* disconnected: {:?}", reason);
                    return Ok(());
                }
                Some(event) => info!(?event, "session event"),
                None => break,
            },
        }
    }

    client.disconnect().await;
    Ok(())
}

async fn run_discover(seconds: u64, port: u16, multicast: Option<Ipv4Addr>) -> Result<()> {
    let config = DiscoveryConfig {
        port,
        target: match multicast {
            Some(group) => AnnounceTarget::Multicast(group),
            None => AnnounceTarget::Broadcast,
        },
        ..DiscoveryConfig::default()
    };
    let (browser, mut events) = Browser::start(&config).context("starting browser")?;
    println!("browsing for hosts on port {} ...", port);

    let deadline = tokio::time::sleep(Duration::from_secs(seconds));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(DiscoveryEvent::Found(host)) => {
                    println!("+ {} at {} ({}/{})", host.name, host.addr, host.occupancy, host.capacity);
                }
                Some(DiscoveryEvent::Lost(addr)) => println!("- host at {} gone", addr),
                Some(DiscoveryEvent::Updated(_)) => {}
                None => break,
            },
        }
    }

    let hosts = browser.hosts();
    if hosts.is_empty() {
        println!("no hosts found");
    } else {
        println!("\n{} host(s):", hosts.len());
        for host in hosts {
            println!(
                "  {} at {} - {}/{} peers{}",
                host.name,
                host.addr,
                host.occupancy,
                host.capacity,
                if host.is_full() { " (full)" } else { "" }
            );
        }
    }
    Ok(())
}
