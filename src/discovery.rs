//! Peer Discovery
//!
//! Presence is announced by UDP broadcast: every interval one datagram with
//! our display name goes to the broadcast address, and every datagram that
//! arrives on the discovery port is recorded in a peer table keyed by source
//! address. Nothing is acknowledged; a lost datagram is made up for by the
//! next one.
//!
//! Peers never say goodbye. Without a configured TTL an entry stays until the
//! process exits.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Largest announcement we bother to read
const MAX_DATAGRAM_SIZE: usize = 2048;

/// Pause after a failed receive so a persistent error does not spin
const RECV_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Clone, Debug)]
pub struct DiscoveryConfig {
    /// Local address to receive announcements on
    pub bind_addr: SocketAddr,
    /// Where announcements are sent
    pub broadcast_addr: SocketAddr,
    pub interval: Duration,
    /// Hide peers silent for longer than this
    pub peer_ttl: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub address: IpAddr,
    pub display_name: String,
    pub last_seen: Instant,
}

/// Presence datagram
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    pub username: String,
    /// Identifies the sending process so it can ignore its own echo
    #[serde(default)]
    pub instance: Option<Uuid>,
}

impl Announcement {
    pub fn parse(datagram: &[u8]) -> Option<Self> {
        let announcement: Announcement = serde_json::from_slice(datagram).ok()?;
        if announcement.username.trim().is_empty() {
            return None;
        }
        Some(announcement)
    }
}

type PeerTable = Arc<RwLock<HashMap<IpAddr, PeerRecord>>>;

/// Running discovery service
pub struct Discovery {
    local_addr: SocketAddr,
    username: Arc<RwLock<String>>,
    peers: PeerTable,
    peer_ttl: Option<Duration>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Discovery {
    /// Bind the discovery socket and start the announce and listen loops
    pub async fn start(config: DiscoveryConfig, username: impl Into<String>) -> Result<Self> {
        let socket = UdpSocket::bind(config.bind_addr)
            .await
            .with_context(|| format!("Failed to bind discovery socket on {}", config.bind_addr))?;
        socket
            .set_broadcast(true)
            .context("Failed to enable broadcast on discovery socket")?;
        let local_addr = socket.local_addr()?;
        let socket = Arc::new(socket);

        let instance = Uuid::new_v4();
        let username = Arc::new(RwLock::new(username.into()));
        let peers: PeerTable = Arc::new(RwLock::new(HashMap::new()));

        info!(
            "Discovery listening on {}, announcing to {} every {:?}",
            local_addr, config.broadcast_addr, config.interval
        );

        let announcer = tokio::spawn(announce(
            Arc::clone(&socket),
            config.broadcast_addr,
            config.interval,
            Arc::clone(&username),
            instance,
        ));
        let listener = tokio::spawn(listen(socket, Arc::clone(&peers), instance));

        Ok(Self {
            local_addr,
            username,
            peers,
            peer_ttl: config.peer_ttl,
            tasks: Mutex::new(vec![announcer, listener]),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Change the name used by subsequent announcements
    pub fn set_username(&self, username: impl Into<String>) {
        *self.username.write().unwrap_or_else(PoisonError::into_inner) = username.into();
    }

    /// Snapshot of the known peers, ordered by address
    pub fn peers(&self) -> Vec<PeerRecord> {
        let table = self.peers.read().unwrap_or_else(PoisonError::into_inner);
        let mut peers: Vec<PeerRecord> = table
            .values()
            .filter(|peer| match self.peer_ttl {
                Some(ttl) => peer.last_seen.elapsed() <= ttl,
                None => true,
            })
            .cloned()
            .collect();
        peers.sort_by_key(|peer| peer.address);
        peers
    }

    /// Record a peer learned some other way, e.g. a chat hello
    pub fn record(&self, address: IpAddr, display_name: &str) -> bool {
        record_peer(&self.peers, address, display_name)
    }

    pub fn is_running(&self) -> bool {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|task| !task.is_finished())
    }

    /// Stop both loops and wait for them to unwind; the socket is closed
    /// when this returns. Calling it again does nothing.
    pub async fn stop(&self) {
        let tasks = self.abort_tasks();
        if tasks.is_empty() {
            return;
        }
        info!("Stopping discovery on {}", self.local_addr);
        for task in tasks {
            // cancelled is the expected outcome
            let _ = task.await;
        }
    }

    fn abort_tasks(&self) -> Vec<JoinHandle<()>> {
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in &tasks {
            task.abort();
        }
        tasks
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

/// Upsert a peer; true if it was not known before
fn record_peer(peers: &PeerTable, address: IpAddr, display_name: &str) -> bool {
    let mut table = peers.write().unwrap_or_else(PoisonError::into_inner);
    let previous = table.insert(
        address,
        PeerRecord {
            address,
            display_name: display_name.to_string(),
            last_seen: Instant::now(),
        },
    );
    match previous {
        None => {
            info!("Discovered peer {} ({})", display_name, address);
            true
        }
        Some(old) => {
            if old.display_name != display_name {
                info!("Peer {} is now known as {}", address, display_name);
            }
            false
        }
    }
}

async fn announce(
    socket: Arc<UdpSocket>,
    target: SocketAddr,
    every: Duration,
    username: Arc<RwLock<String>>,
    instance: Uuid,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let announcement = Announcement {
            username: username
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            instance: Some(instance),
        };
        let payload = match serde_json::to_vec(&announcement) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to encode announcement: {}", e);
                continue;
            }
        };

        if let Err(e) = socket.send_to(&payload, target).await {
            warn!("Failed to send announcement to {}: {}", target, e);
        }
    }
}

async fn listen(socket: Arc<UdpSocket>, peers: PeerTable, instance: Uuid) {
    let mut buffer = [0u8; MAX_DATAGRAM_SIZE];

    loop {
        let (len, source) = match socket.recv_from(&mut buffer).await {
            Ok(received) => received,
            Err(e) => {
                // ICMP errors from earlier sends surface here on some platforms
                debug!("Discovery receive error: {}", e);
                tokio::time::sleep(RECV_BACKOFF).await;
                continue;
            }
        };

        let Some(announcement) = Announcement::parse(&buffer[..len]) else {
            debug!("Dropping malformed announcement from {}", source);
            continue;
        };

        if announcement.instance == Some(instance) {
            continue;
        }

        record_peer(&peers, source.ip(), &announcement.username);
    }
}
