//! UDP presence: periodic hello broadcasts, a liveness-tracked peer table,
//! and unicast replies for faster convergence.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::AppEvent;

/// Default UDP port for presence broadcasts.
pub const DISCOVERY_PORT: u16 = 42069;

/// Cadence of hello broadcasts and liveness sweeps.
pub const HELLO_INTERVAL: Duration = Duration::from_secs(2);

/// Extra slack before a silent peer is evicted.
const SWEEP_GRACE: Duration = Duration::from_secs(2);

/// Reply sent for datagrams that do not parse as a known frame.
const MALFORMED_REPLY: &str = "Malformed message";

/// One presence datagram, JSON-encoded:
/// `{"type":"hello"|"error","data":...,"name":...}`. For hellos `data`
/// carries the sender's transfer endpoint so peers can dial back.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BroadcastFrame {
    Hello { data: String, name: String },
    Error { data: String, name: String },
}

/// A live LAN participant, keyed by name in the peer table.
#[derive(Debug, Clone)]
pub struct Peer {
    pub name: String,
    /// Source address of the peer's last hello.
    pub addr: SocketAddr,
    /// Transfer endpoint the peer advertised (`"192.168.1.42:8080"`).
    pub endpoint: String,
    pub last_hello: Instant,
}

/// Presence service over a single broadcast-enabled UDP socket. The peer
/// table is owned here; consumers read it through [`Discovery::snapshot`].
pub struct Discovery {
    socket: Arc<UdpSocket>,
    peers: Arc<RwLock<HashMap<String, Peer>>>,
    identity: String,
    endpoint: String,
    port: u16,
    local_ip: IpAddr,
}

impl Discovery {
    /// Bind the presence socket on `0.0.0.0:<port>` with broadcast enabled.
    pub async fn bind(port: u16, identity: String, endpoint: String) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
        socket.set_broadcast(true)?;
        let port = socket.local_addr()?.port();

        let local_ip = outbound_ip().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));

        Ok(Self {
            socket: Arc::new(socket),
            peers: Arc::new(RwLock::new(HashMap::new())),
            identity,
            endpoint,
            port,
            local_ip,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Owned copy of the peer table. May lag the true state by up to one
    /// sweep interval.
    pub fn snapshot(&self) -> HashMap<String, Peer> {
        self.peers.read().unwrap().clone()
    }

    /// Spawn the three presence tasks: hello announcer, datagram dispatcher,
    /// and liveness sweeper. All of them stop when `cancel` fires.
    pub fn start(&self, event_tx: mpsc::Sender<AppEvent>, cancel: CancellationToken) {
        self.spawn_announcer(cancel.clone());
        self.spawn_receiver(event_tx, cancel.clone());
        self.spawn_sweeper(cancel);
    }

    fn hello_frame(&self) -> BroadcastFrame {
        BroadcastFrame::Hello {
            data: self.endpoint.clone(),
            name: self.identity.clone(),
        }
    }

    fn spawn_announcer(&self, cancel: CancellationToken) {
        let socket = self.socket.clone();
        let frame = self.hello_frame();
        let broadcast_addr = SocketAddr::from((Ipv4Addr::BROADCAST, self.port));

        tokio::spawn(async move {
            let payload = match serde_json::to_vec(&frame) {
                Ok(payload) => payload,
                Err(err) => {
                    tracing::error!("failed to encode hello frame: {err}");
                    return;
                }
            };

            let mut interval = tokio::time::interval(HELLO_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(err) = socket.send_to(&payload, broadcast_addr).await {
                            tracing::warn!("hello broadcast failed: {err}");
                        }
                    }
                }
            }
        });
    }

    fn spawn_receiver(&self, event_tx: mpsc::Sender<AppEvent>, cancel: CancellationToken) {
        let socket = self.socket.clone();
        let peers = self.peers.clone();
        let identity = self.identity.clone();
        let hello = self.hello_frame();
        let local_ip = self.local_ip;
        let port = self.port;

        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            loop {
                let (len, src) = tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = socket.recv_from(&mut buf) => match received {
                        Ok(received) => received,
                        Err(err) => {
                            tracing::warn!("presence receive failed: {err}");
                            continue;
                        }
                    }
                };

                // Our own broadcasts loop back; drop them.
                if src.ip() == local_ip && src.port() == port {
                    continue;
                }

                match parse_frame(&buf[..len]) {
                    // A hello carrying our own name is also an echo.
                    Some(BroadcastFrame::Hello { name, .. }) if name == identity => continue,
                    Some(BroadcastFrame::Hello { data, name }) => {
                        let inserted = upsert(&peers, &name, src, &data, Instant::now());
                        if inserted {
                            tracing::info!("discovered peer '{name}' at {src}");
                            let _ = event_tx
                                .send(AppEvent::PeerFound {
                                    name: name.clone(),
                                    endpoint: data,
                                })
                                .await;
                            // Answer a first hello right away so the other
                            // side learns about us before its next tick.
                            if let Ok(payload) = serde_json::to_vec(&hello) {
                                let _ = socket.send_to(&payload, src).await;
                            }
                        }
                    }
                    Some(BroadcastFrame::Error { data, name }) => {
                        tracing::warn!("presence error from '{name}' at {src}: {data}");
                    }
                    None => {
                        tracing::warn!("malformed broadcast from {src}");
                        let reply = BroadcastFrame::Error {
                            data: MALFORMED_REPLY.to_string(),
                            name: identity.clone(),
                        };
                        if let Ok(payload) = serde_json::to_vec(&reply) {
                            let _ = socket.send_to(&payload, src).await;
                        }
                    }
                }
            }
        });
    }

    fn spawn_sweeper(&self, cancel: CancellationToken) {
        let socket = self.socket.clone();
        let peers = self.peers.clone();
        let frame = self.hello_frame();

        tokio::spawn(async move {
            let payload = serde_json::to_vec(&frame).unwrap_or_default();
            let mut interval = tokio::time::interval(HELLO_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        sweep(&peers, Instant::now());
                        // Keep the survivors fresh with direct hellos, in
                        // case broadcasts are filtered on their segment.
                        let addrs: Vec<SocketAddr> =
                            peers.read().unwrap().values().map(|peer| peer.addr).collect();
                        for addr in addrs {
                            let _ = socket.send_to(&payload, addr).await;
                        }
                    }
                }
            }
        });
    }
}

/// Parse one datagram. A hello with an empty name is as useless as garbage
/// JSON, so both count as malformed.
fn parse_frame(datagram: &[u8]) -> Option<BroadcastFrame> {
    let frame: BroadcastFrame = serde_json::from_slice(datagram).ok()?;
    match &frame {
        BroadcastFrame::Hello { name, .. } | BroadcastFrame::Error { name, .. } => {
            if name.is_empty() {
                return None;
            }
        }
    }
    Some(frame)
}

/// Insert or refresh a peer record. Returns true when the peer was new.
/// Duplicate names resolve last-write-wins.
fn upsert(
    peers: &RwLock<HashMap<String, Peer>>,
    name: &str,
    addr: SocketAddr,
    endpoint: &str,
    now: Instant,
) -> bool {
    let mut peers = peers.write().unwrap();
    match peers.get_mut(name) {
        Some(peer) => {
            peer.addr = addr;
            peer.endpoint = endpoint.to_string();
            peer.last_hello = now;
            false
        }
        None => {
            peers.insert(
                name.to_string(),
                Peer {
                    name: name.to_string(),
                    addr,
                    endpoint: endpoint.to_string(),
                    last_hello: now,
                },
            );
            true
        }
    }
}

/// Evict peers that have been silent past the liveness window.
fn sweep(peers: &RwLock<HashMap<String, Peer>>, now: Instant) {
    peers.write().unwrap().retain(|name, peer| {
        let alive = now.duration_since(peer.last_hello) <= HELLO_INTERVAL + SWEEP_GRACE;
        if !alive {
            tracing::debug!("evicting silent peer '{name}'");
        }
        alive
    });
}

/// The IP this host uses for outbound traffic, learned from a connected UDP
/// socket without sending anything.
pub fn outbound_ip() -> std::io::Result<IpAddr> {
    let socket = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.connect(("8.8.8.8", 80))?;
    Ok(socket.local_addr()?.ip())
}
