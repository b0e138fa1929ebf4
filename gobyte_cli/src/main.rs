//! Terminal front end: discovery-driven peer selection, confirmation
//! prompts for the core's policy callbacks, and plain-text progress output.

use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use gobyte_core::config::AppConfig;
use gobyte_core::discovery::{outbound_ip, Discovery, HELLO_INTERVAL};
use gobyte_core::tofu::{NewPeerCallback, Tofu};
use gobyte_core::transfer::{self, resolve_files, RequestCallback};
use gobyte_core::{local_identity, AppEvent};

#[derive(Parser)]
#[command(name = "gobyte")]
#[command(about = "LAN file transfer with trust-on-first-use peers", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Path to an alternate config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send files to one or more discovered peers
    Send {
        /// Files to send
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Peer name to send to, repeatable (defaults to the only peer
        /// found)
        #[arg(short, long)]
        to: Vec<String>,

        /// Trust new peers without prompting
        #[arg(short, long)]
        yes: bool,
    },

    /// Announce presence and accept incoming files
    Receive {
        /// Download directory (defaults to the configured one)
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// Accept transfers and new peers without prompting
        #[arg(short, long)]
        yes: bool,
    },

    /// List peers currently visible on the LAN
    Peers,

    /// Write the default configuration and create its directories
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let config = match &cli.config {
        Some(path) => AppConfig::load_from(path),
        None => AppConfig::load(),
    };
    let identity = local_identity();

    match cli.command {
        Commands::Send { files, to, yes } => send(&config, &identity, &files, to, yes).await,
        Commands::Receive { dir, yes } => receive(&config, &identity, dir, yes).await,
        Commands::Peers => peers(&config, &identity).await,
        Commands::Init => init(&config, &identity),
    }
}

/// Persist the configuration and create the directories it points at, so a
/// first `receive` starts with a stable identity in place.
fn init(config: &AppConfig, identity: &str) -> Result<()> {
    config.save()?;
    for dir in [&config.cert_dir, &config.trust_dir, &config.download_dir] {
        std::fs::create_dir_all(dir)?;
    }

    // Generating the certificate now pins this machine's identity.
    let _ = Tofu::new(
        identity,
        &config.cert_dir,
        &config.trust_dir,
        gobyte_core::tofu::reject_new_peers(),
    )?;

    println!("identity '{identity}'");
    println!("certificates in {}", config.cert_dir.display());
    println!("trusted peers in {}", config.trust_dir.display());
    println!("downloads in {}", config.download_dir.display());
    Ok(())
}

async fn send(
    config: &AppConfig,
    identity: &str,
    files: &[PathBuf],
    to: Vec<String>,
    yes: bool,
) -> Result<()> {
    let offers = resolve_files(files)?;
    let total: u64 = offers.iter().map(|offer| offer.size).sum();
    println!(
        "{} files, {}",
        offers.len(),
        transfer::utils::format_size(total)
    );

    let endpoint = local_endpoint(config)?;
    let discovery = Discovery::bind(config.broadcast_port, identity.to_string(), endpoint).await?;
    let cancel = CancellationToken::new();
    let event_tx = spawn_printer();
    discovery.start(event_tx.clone(), cancel.clone());

    let peers = wait_for_peers(&discovery, &to).await?;
    let tofu = Tofu::new(identity, &config.cert_dir, &config.trust_dir, trust_prompt(yes))?;

    // One session per peer; a failed session does not stop the rest.
    let mut failures = 0usize;
    for peer in &peers {
        let addr: SocketAddr = match peer.endpoint.parse() {
            Ok(addr) => addr,
            Err(_) => {
                eprintln!("peer '{}' advertised a bad endpoint, skipping", peer.name);
                failures += 1;
                continue;
            }
        };
        println!("sending to '{}' at {addr}", peer.name);

        match transfer::send_files(&tofu, addr, &offers, &event_tx, &cancel).await {
            Ok(summary) => println!(
                "sent {} files ({}) to '{}'",
                summary.files_sent,
                transfer::utils::format_size(summary.bytes_sent),
                peer.name
            ),
            Err(err) => {
                eprintln!("sending to '{}' failed: {err:#}", peer.name);
                failures += 1;
            }
        }
    }

    cancel.cancel();
    if failures > 0 {
        bail!("{failures} of {} transfers failed", peers.len());
    }
    Ok(())
}

async fn receive(
    config: &AppConfig,
    identity: &str,
    dir: Option<PathBuf>,
    yes: bool,
) -> Result<()> {
    let download_dir = dir.unwrap_or_else(|| config.download_dir.clone());
    tokio::fs::create_dir_all(&download_dir).await?;

    let tofu = Tofu::new(identity, &config.cert_dir, &config.trust_dir, trust_prompt(yes))?;
    let listener = tofu
        .listen(SocketAddr::from(([0, 0, 0, 0], config.transfer_port)))
        .await?;

    let endpoint = local_endpoint(config)?;
    let discovery =
        Discovery::bind(config.broadcast_port, identity.to_string(), endpoint.clone()).await?;

    let cancel = CancellationToken::new();
    let event_tx = spawn_printer();
    discovery.start(event_tx.clone(), cancel.clone());

    println!("listening on {endpoint} as '{identity}', files go to {}", download_dir.display());

    let server = tokio::spawn(transfer::run_server(
        listener,
        download_dir,
        request_prompt(yes),
        event_tx,
        cancel.clone(),
    ));

    tokio::signal::ctrl_c().await?;
    println!("shutting down");
    cancel.cancel();
    let _ = server.await;
    Ok(())
}

async fn peers(config: &AppConfig, identity: &str) -> Result<()> {
    let endpoint = local_endpoint(config)?;
    let discovery = Discovery::bind(config.broadcast_port, identity.to_string(), endpoint).await?;
    let cancel = CancellationToken::new();
    let (event_tx, mut event_rx) = mpsc::channel(64);
    tokio::spawn(async move { while event_rx.recv().await.is_some() {} });
    discovery.start(event_tx, cancel.clone());

    tokio::time::sleep(3 * HELLO_INTERVAL).await;
    cancel.cancel();

    let peers = discovery.snapshot();
    if peers.is_empty() {
        println!("no peers found");
        return Ok(());
    }
    for peer in peers.values() {
        println!("{}\t{}", peer.name, peer.endpoint);
    }
    Ok(())
}

fn local_endpoint(config: &AppConfig) -> Result<String> {
    let ip = outbound_ip().context("cannot determine local IP")?;
    Ok(format!("{ip}:{}", config.transfer_port))
}

/// Poll the peer table until every requested peer shows up. With no names
/// given, wait for exactly one peer on the LAN.
async fn wait_for_peers(
    discovery: &Discovery,
    names: &[String],
) -> Result<Vec<gobyte_core::discovery::Peer>> {
    for _ in 0..20 {
        let peers = discovery.snapshot();
        if names.is_empty() {
            if peers.len() == 1 {
                return Ok(peers.into_values().collect());
            }
            if peers.len() > 1 {
                let found: Vec<_> = peers.keys().cloned().collect();
                bail!(
                    "several peers found ({}), pick with --to",
                    found.join(", ")
                );
            }
        } else if names.iter().all(|name| peers.contains_key(name)) {
            return Ok(names
                .iter()
                .filter_map(|name| peers.get(name).cloned())
                .collect());
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    if names.is_empty() {
        bail!("no peers found");
    }
    bail!("peers not found: {}", names.join(", "));
}

/// New-peer policy: show the fingerprint and ask, or auto-accept with
/// `--yes`.
fn trust_prompt(yes: bool) -> NewPeerCallback {
    Arc::new(move |identity, fingerprint| {
        println!("peer '{identity}' is new, fingerprint:\n  {fingerprint}");
        if yes {
            println!("trusting (--yes)");
            return true;
        }
        confirm("trust this peer?")
    })
}

/// Transfer-request policy: summarize the request and ask, or auto-accept
/// with `--yes`.
fn request_prompt(yes: bool) -> RequestCallback {
    Arc::new(move |request| {
        println!(
            "incoming request: {} files, {}",
            request.file_count,
            transfer::utils::format_size(request.total_size)
        );
        if yes {
            println!("accepting (--yes)");
            return true;
        }
        confirm("accept?")
    })
}

fn confirm(question: &str) -> bool {
    print!("{question} [y/N] ");
    let _ = std::io::stdout().flush();
    let mut answer = String::new();
    if std::io::stdin().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

/// Print core events as plain lines; a frontend with a real progress bar
/// would subscribe here instead.
fn spawn_printer() -> mpsc::Sender<AppEvent> {
    let (event_tx, mut event_rx) = mpsc::channel(256);
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                AppEvent::Status(message) => println!("{message}"),
                AppEvent::PeerFound { name, endpoint } => {
                    println!("found peer '{name}' at {endpoint}");
                }
                AppEvent::TransferProgress {
                    file_name,
                    progress,
                    speed,
                    ..
                } => println!("{file_name}: {progress:.0}% @ {speed}"),
                AppEvent::TransferCompleted(file_name) => println!("sent {file_name}"),
                AppEvent::FileReceived { target, .. } => {
                    println!("saved {}", target.display());
                }
                AppEvent::Error(message) => eprintln!("error: {message}"),
            }
        }
    });
    event_tx
}
