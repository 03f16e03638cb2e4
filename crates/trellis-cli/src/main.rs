//! Trellis CLI
//!
//! One binary, two modes: `agent` joins the overlay and executes commands;
//! `admin` dials an entry node and issues one verb per command tag.

mod config;
mod progress;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use config::Config;
use progress::{TransferProgress, format_bytes};
use trellis_core::services::{admit, file, forward, shell, socks, ssh};
use trellis_core::{NodeId, NodeLabel, OverlayContext, Role};
use trellis_crypto::LinkSecret;

/// Large-download confirmation threshold
const LARGE_FILE_BYTES: u64 = 100 * 1024 * 1024;

/// Trellis - multi-hop overlay transport
#[derive(Parser)]
#[command(name = "trellis")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Shared overlay secret (overrides the config file)
    #[arg(long)]
    secret: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an agent node
    Agent {
        /// Listen for incoming nodes on this address
        #[arg(short, long)]
        listen: Option<SocketAddr>,

        /// Dial an existing node on startup
        #[arg(short, long)]
        dial: Option<SocketAddr>,
    },

    /// Issue a command through an entry node
    Admin {
        /// Entry node address
        #[arg(short, long)]
        dial: SocketAddr,

        /// Target node identity (hex); defaults to the entry node
        #[arg(short, long)]
        target: Option<NodeId>,

        #[command(subcommand)]
        action: AdminAction,
    },
}

#[derive(Subcommand)]
enum AdminAction {
    /// Run one topology synchronization round
    Sync,

    /// Synchronize and print the overlay topology
    Peers,

    /// Open a node listener on the target
    Listen {
        /// Port to bind on the target
        port: u16,
    },

    /// Make the target dial and admit another node
    Connect {
        /// Address to dial from the target
        addr: SocketAddr,
    },

    /// Interactive shell on the target
    Shell,

    /// Push a local file to the target
    Upload {
        /// Local source path
        local: PathBuf,
        /// Remote destination path
        remote: String,
    },

    /// Pull a file from the target
    Download {
        /// Remote source path
        remote: String,
        /// Local destination path
        local: PathBuf,
        /// Skip the large-file confirmation
        #[arg(long)]
        yes: bool,
    },

    /// SOCKS5 proxy egressing at the target
    Socks {
        /// Local bind address
        #[arg(short, long, default_value = "127.0.0.1:1080")]
        bind: SocketAddr,
    },

    /// Forward a local service to a listener on the target
    Lforward {
        /// Local service to expose, as host:port
        #[arg(long)]
        local: SocketAddr,
        /// Port the target listens on
        #[arg(long)]
        remote_port: u16,
    },

    /// Forward a service near the target to a local listener
    Rforward {
        /// Remote service the target dials, as host:port
        #[arg(long)]
        remote: SocketAddr,
        /// Local bind address
        #[arg(short, long, default_value = "127.0.0.1:0")]
        bind: SocketAddr,
    },

    /// Make the target join a node through a provisioned tunnel
    Sshconnect {
        /// Tunnel endpoint host
        #[arg(long)]
        host: Ipv4Addr,
        /// Tunnel endpoint port
        #[arg(long, default_value_t = 22)]
        port: u16,
        /// Node listener port behind the tunnel
        #[arg(long)]
        dport: u16,
        /// Username for the tunnel
        #[arg(long, default_value = "")]
        user: String,
        /// Authentication method (0 = pre-established tunnel)
        #[arg(long, default_value_t = ssh::AUTH_TUNNEL)]
        auth_method: u16,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(if cli.verbose { "debug" } else { "info" })
        .init();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };

    let secret = cli
        .secret
        .clone()
        .or_else(|| config.secret.clone())
        .context("no overlay secret: pass --secret or set it in the config file")?;
    let secret = LinkSecret::from_passphrase(&secret);

    let mut label = NodeLabel::local();
    if let Some(hostname) = &config.hostname {
        label.hostname = hostname.clone();
    }

    match cli.command {
        Commands::Agent { listen, dial } => run_agent(secret, label, listen, dial).await,
        Commands::Admin {
            dial,
            target,
            action,
        } => run_admin(secret, label, dial, target, action, &config).await,
    }
}

async fn run_agent(
    secret: LinkSecret,
    label: NodeLabel,
    listen: Option<SocketAddr>,
    dial: Option<SocketAddr>,
) -> anyhow::Result<()> {
    if listen.is_none() && dial.is_none() {
        bail!("agent needs --listen, --dial, or both");
    }

    let ctx = OverlayContext::new(Role::Agent, label, secret)?;
    println!("node identity: {}", ctx.local_id());

    if let Some(addr) = listen {
        let bound = ctx.listen(addr).await?;
        println!("listening on {bound}");
    }
    if let Some(addr) = dial {
        let peer = ctx.connect(addr).await?;
        println!("joined overlay via {peer}");
    }

    tokio::signal::ctrl_c().await?;
    Ok(())
}

async fn run_admin(
    secret: LinkSecret,
    label: NodeLabel,
    dial: SocketAddr,
    target: Option<NodeId>,
    action: AdminAction,
    config: &Config,
) -> anyhow::Result<()> {
    let deadline = Some(Duration::from_secs(config.deadline_secs));

    let ctx = OverlayContext::new(Role::Admin, label, secret)?;
    let entry = ctx.connect(dial).await?;
    ctx.sync().await?;

    let target = target.unwrap_or(entry);
    tracing::debug!(%target, "admin command targeting node");

    match action {
        AdminAction::Sync => {
            let nodes = ctx.topology_read(|t| t.nodes().len());
            println!("topology synchronized: {nodes} nodes");
        }

        AdminAction::Peers => {
            for (id, label, hop) in ctx.peers_snapshot() {
                let kind = if id == ctx.local_id() {
                    console::style("local".to_string()).dim()
                } else {
                    match hop {
                        None => console::style("direct".to_string()).green(),
                        Some(via) => console::style(format!("via {}", via.short())).yellow(),
                    }
                };
                println!("{id}  {:16} {:8} {kind}", label.hostname, label.os);
            }
        }

        AdminAction::Listen { port } => {
            admit::send_listen(&ctx, target, port, deadline).await?;
            println!("port {port} is listening on the remote node");
        }

        AdminAction::Connect { addr } => {
            let SocketAddr::V4(addr) = addr else {
                bail!("connect takes an IPv4 address");
            };
            admit::send_connect(&ctx, target, *addr.ip(), addr.port(), deadline).await?;
            println!("remote node connected to {addr}");
            ctx.sync().await?;
        }

        AdminAction::Shell => {
            println!("shell attached; EOF detaches");
            shell::run_shell(&ctx, target, tokio::io::stdin(), tokio::io::stdout(), deadline)
                .await?;
        }

        AdminAction::Upload { local, remote } => {
            let size = std::fs::metadata(&local)
                .with_context(|| format!("cannot stat {}", local.display()))?
                .len();
            let bar = TransferProgress::new(size, &local.display().to_string());
            let result = file::send_upload(&ctx, target, &local, &remote, deadline, |sent| {
                bar.update(sent);
            })
            .await;
            match result {
                Ok(()) => bar.finish_with_message(format!("uploaded {}", format_bytes(size))),
                Err(e) => {
                    bar.abandon();
                    return Err(e.into());
                }
            }
        }

        AdminAction::Download { remote, local, yes } => {
            let bar = std::cell::OnceCell::new();
            let completed = file::send_download(
                &ctx,
                target,
                &remote,
                &local,
                deadline,
                |size| {
                    if size > LARGE_FILE_BYTES && !yes {
                        eprintln!(
                            "file is {} (> {}); rerun with --yes to download",
                            format_bytes(size),
                            format_bytes(LARGE_FILE_BYTES)
                        );
                        return false;
                    }
                    let _ = bar.set(TransferProgress::new(size, &remote));
                    true
                },
                |received| {
                    if let Some(bar) = bar.get() {
                        bar.update(received);
                    }
                },
            )
            .await?;

            if completed {
                if let Some(bar) = bar.get() {
                    bar.finish_with_message("download complete".to_string());
                }
            } else {
                bail!("download aborted");
            }
        }

        AdminAction::Socks { bind } => {
            let bound = socks::serve_socks(&ctx, target, bind, deadline).await?;
            println!("socks5 proxy for {} on {bound}", target.short());
            tokio::signal::ctrl_c().await?;
        }

        AdminAction::Lforward { local, remote_port } => {
            let SocketAddr::V4(local) = local else {
                bail!("lforward takes an IPv4 local address");
            };
            forward::send_lforward(&ctx, target, *local.ip(), local.port(), remote_port).await?;
            println!("remote port {remote_port} forwards to {local}");
            tokio::signal::ctrl_c().await?;
        }

        AdminAction::Rforward { remote, bind } => {
            let SocketAddr::V4(remote) = remote else {
                bail!("rforward takes an IPv4 remote address");
            };
            let bound =
                forward::serve_rforward(&ctx, target, *remote.ip(), remote.port(), bind, deadline)
                    .await?;
            println!("{bound} forwards to {remote} via {}", target.short());
            tokio::signal::ctrl_c().await?;
        }

        AdminAction::Sshconnect {
            host,
            port,
            dport,
            user,
            auth_method,
        } => {
            let joined = ssh::send_ssh_connect(
                &ctx,
                target,
                host,
                port,
                dport,
                &user,
                auth_method,
                &[],
                deadline,
            )
            .await?;
            println!("joined node {joined} through {host}:{port}");
            ctx.sync().await?;
        }
    }

    Ok(())
}
