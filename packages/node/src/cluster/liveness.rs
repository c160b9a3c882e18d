//! UDP multicast peer-liveness channel.
//!
//! Nodes announce themselves on `224.0.0.1:<port>` every 5 seconds and
//! consider a peer dead after 10 seconds of silence. The channel carries
//! nothing but `ALIVE` frames; all replication data travels over TCP.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use nanokv_core::PacketType;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 1);
const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(5);
const PEER_TIMEOUT: Duration = Duration::from_secs(10);
/// Read deadline, re-armed each iteration.
const READ_DEADLINE: Duration = Duration::from_secs(300);

/// Multicast liveness: announce presence, track which peers are alive.
pub(crate) struct Liveness {
    socket: Arc<UdpSocket>,
    group: SocketAddr,
    peers: Arc<DashMap<SocketAddr, Instant>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Liveness {
    /// Binds the shared multicast socket and starts the announce and read
    /// loops. Several nodes on one host share the group via `SO_REUSEADDR`.
    pub(crate) fn start(
        port: u16,
        close_rx: watch::Receiver<bool>,
    ) -> std::io::Result<Arc<Self>> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        socket.bind(&bind_addr.into())?;

        let socket = UdpSocket::from_std(socket.into())?;
        socket.join_multicast_v4(MULTICAST_GROUP, Ipv4Addr::UNSPECIFIED)?;

        let liveness = Arc::new(Self {
            socket: Arc::new(socket),
            group: SocketAddr::from((MULTICAST_GROUP, port)),
            peers: Arc::new(DashMap::new()),
            tasks: Mutex::new(Vec::new()),
        });

        let announce = tokio::spawn(announce_loop(
            Arc::clone(&liveness.socket),
            liveness.group,
            Arc::clone(&liveness.peers),
            close_rx.clone(),
        ));
        let read = tokio::spawn(read_loop(
            Arc::clone(&liveness.socket),
            Arc::clone(&liveness.peers),
            close_rx,
        ));
        liveness.tasks.lock().extend([announce, read]);

        info!(group = %liveness.group, "joined liveness multicast group");
        Ok(liveness)
    }

    /// Addresses heard from within the peer timeout.
    pub(crate) fn alive_peers(&self) -> Vec<SocketAddr> {
        self.peers
            .iter()
            .filter(|entry| entry.value().elapsed() <= PEER_TIMEOUT)
            .map(|entry| *entry.key())
            .collect()
    }

    /// Waits for the announce and read loops to exit. The close signal must
    /// already have been sent.
    pub(crate) async fn shutdown(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(error) = task.await {
                warn!(%error, "liveness task ended abnormally");
            }
        }
    }
}

async fn announce_loop(
    socket: Arc<UdpSocket>,
    group: SocketAddr,
    peers: Arc<DashMap<SocketAddr, Instant>>,
    mut close_rx: watch::Receiver<bool>,
) {
    let frame = [PacketType::Alive as u8];
    let mut ticker = tokio::time::interval(ANNOUNCE_INTERVAL);

    loop {
        tokio::select! {
            _ = close_rx.changed() => break,
            _ = ticker.tick() => {
                if let Err(error) = socket.send_to(&frame, group).await {
                    debug!(%error, "liveness announce failed");
                }
                peers.retain(|addr, seen| {
                    if seen.elapsed() > PEER_TIMEOUT {
                        debug!(peer = %addr, "peer liveness expired");
                        false
                    } else {
                        true
                    }
                });
            }
        }
    }
}

async fn read_loop(
    socket: Arc<UdpSocket>,
    peers: Arc<DashMap<SocketAddr, Instant>>,
    mut close_rx: watch::Receiver<bool>,
) {
    let mut buffer = [0_u8; 64];

    loop {
        tokio::select! {
            _ = close_rx.changed() => break,
            result = tokio::time::timeout(READ_DEADLINE, socket.recv_from(&mut buffer)) => {
                match result {
                    // Deadline elapsed; re-arm and keep listening.
                    Err(_) => {}
                    Ok(Ok((len, addr))) => {
                        if len >= 1 && buffer[0] == PacketType::Alive as u8 {
                            peers.insert(addr, Instant::now());
                        }
                    }
                    Ok(Err(error)) => {
                        debug!(%error, "liveness read failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }
}
