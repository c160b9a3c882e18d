//! The server role: TCP listener, peer registry, and the forwarding rule.
//!
//! Each connected peer gets a bounded outgoing queue plus one read and one
//! write task over the framed codec. Peers whose address appears in the
//! configured `hosts` list are remote (node-to-node mesh links); everything
//! else is a local client. When a replicated write from a remote peer is
//! applied, it is forwarded to local clients only -- inter-node packets are
//! not re-bounced across the mesh.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use nanokv_core::{Packet, PacketCodec};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::node::NodeInner;
use crate::replication;

/// Per-peer outgoing queue depth. Forwarded packets are dropped, not
/// awaited, when a peer's queue is full.
const PEER_QUEUE_CAPACITY: usize = 4096;
const SERVER_CLOSE_SEND_TIMEOUT: Duration = Duration::from_secs(1);

type PacketSink = SplitSink<Framed<TcpStream, PacketCodec>, Packet>;
type PacketStream = SplitStream<Framed<TcpStream, PacketCodec>>;

/// Handle to one connected peer.
pub(crate) struct PeerHandle {
    pub(crate) id: u64,
    pub(crate) addr: SocketAddr,
    /// Whether the peer address is in the configured `hosts` list.
    pub(crate) remote: bool,
    outgoing: mpsc::Sender<Packet>,
}

impl PeerHandle {
    /// Attempts to enqueue without blocking; `false` when the queue is full
    /// or the peer is gone.
    pub(crate) fn try_send(&self, packet: Packet) -> bool {
        self.outgoing.try_send(packet).is_ok()
    }

    /// Enqueues with backpressure; fails only when the peer is gone.
    pub(crate) async fn send(&self, packet: Packet) -> Result<(), ()> {
        self.outgoing.send(packet).await.map_err(|_| ())
    }

    async fn send_timeout(&self, packet: Packet, timeout: Duration) -> bool {
        matches!(
            tokio::time::timeout(timeout, self.outgoing.send(packet)).await,
            Ok(Ok(()))
        )
    }
}

/// Concurrent registry of all connected peers.
#[derive(Default)]
pub(crate) struct PeerRegistry {
    peers: DashMap<u64, Arc<PeerHandle>>,
    next_id: AtomicU64,
}

impl PeerRegistry {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn insert(&self, peer: Arc<PeerHandle>) {
        self.peers.insert(peer.id, peer);
    }

    fn remove(&self, id: u64) {
        self.peers.remove(&id);
    }

    pub(crate) fn len(&self) -> usize {
        self.peers.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<PeerHandle>> {
        self.peers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    fn clear(&self) {
        self.peers.clear();
    }
}

/// The node's server side: listener, peers, and outbound mesh links.
pub(crate) struct ServerRole {
    local_addr: SocketAddr,
    peers: Arc<PeerRegistry>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl ServerRole {
    pub(crate) async fn start(
        inner: Arc<NodeInner>,
        listener: TcpListener,
        close_rx: watch::Receiver<bool>,
    ) -> std::io::Result<Arc<Self>> {
        let local_addr = listener.local_addr()?;
        let peers = Arc::new(PeerRegistry::default());
        let remote_addrs = parse_hosts(&inner.config.hosts);

        let role = Arc::new(Self {
            local_addr,
            peers: Arc::clone(&peers),
            accept_task: Mutex::new(None),
        });

        // Outbound mesh links to the configured hosts.
        for addr in remote_addrs.clone() {
            let inner = Arc::clone(&inner);
            let peers = Arc::clone(&peers);
            let close_rx = close_rx.clone();
            tokio::spawn(async move {
                match TcpStream::connect(addr).await {
                    Ok(stream) => {
                        spawn_peer(inner, peers, stream, addr, true, close_rx);
                    }
                    Err(error) => {
                        warn!(host = %addr, %error, "cannot reach configured host");
                    }
                }
            });
        }

        let accept = {
            let inner = Arc::clone(&inner);
            let peers = Arc::clone(&peers);
            let mut close_rx = close_rx.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = close_rx.changed() => break,
                        accepted = listener.accept() => match accepted {
                            Ok((stream, addr)) => {
                                let remote = remote_addrs.iter().any(|host| host.ip() == addr.ip());
                                spawn_peer(
                                    Arc::clone(&inner),
                                    Arc::clone(&peers),
                                    stream,
                                    addr,
                                    remote,
                                    close_rx.clone(),
                                );
                            }
                            Err(error) => {
                                warn!(%error, "accept failed");
                            }
                        }
                    }
                }
                debug!("accept loop terminated");
            })
        };
        *role.accept_task.lock() = Some(accept);

        Ok(role)
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub(crate) fn has_peers(&self) -> bool {
        !self.peers.is_empty()
    }

    /// Sends a packet to every connected peer, dropping per-peer when the
    /// outgoing queue is full.
    pub(crate) fn broadcast(&self, packet: &Packet) {
        for peer in self.peers.snapshot() {
            if !peer.try_send(packet.clone()) {
                debug!(peer = %peer.addr, "peer queue full; dropping broadcast packet");
            }
        }
    }

    /// Queues `SERVER_CLOSE` to every peer. Must run before the close
    /// signal fires so the write loops still drain the announcement.
    pub(crate) async fn announce_close(&self) {
        for peer in self.peers.snapshot() {
            if !peer
                .send_timeout(Packet::ServerClose, SERVER_CLOSE_SEND_TIMEOUT)
                .await
            {
                debug!(peer = %peer.addr, "peer missed the close announcement");
            }
        }
    }

    /// Tears the listener and all peer connections down. The close signal
    /// must already have been sent.
    pub(crate) async fn shutdown(&self) {
        let accept = self.accept_task.lock().take();
        if let Some(task) = accept {
            let _ = task.await;
        }

        // Dropping the handles closes the outgoing queues, which ends the
        // write loops and with them the connections.
        self.peers.clear();
        info!("server role shut down");
    }
}

fn parse_hosts(hosts: &[String]) -> Vec<SocketAddr> {
    hosts
        .iter()
        .filter_map(|host| match host.parse::<SocketAddr>() {
            Ok(addr) => Some(addr),
            Err(error) => {
                warn!(host, %error, "ignoring unparseable host address");
                None
            }
        })
        .collect()
}

fn spawn_peer(
    inner: Arc<NodeInner>,
    peers: Arc<PeerRegistry>,
    stream: TcpStream,
    addr: SocketAddr,
    remote: bool,
    close_rx: watch::Receiver<bool>,
) {
    let (out_tx, out_rx) = mpsc::channel(PEER_QUEUE_CAPACITY);
    let peer = Arc::new(PeerHandle {
        id: peers.next_id(),
        addr,
        remote,
        outgoing: out_tx,
    });
    peers.insert(Arc::clone(&peer));
    info!(peer = %addr, remote, "peer connected");

    let (sink, packet_stream) = Framed::new(stream, PacketCodec::new()).split();
    tokio::spawn(peer_write_loop(sink, out_rx, close_rx.clone()));
    tokio::spawn(peer_read_loop(inner, peers, peer, packet_stream, close_rx));
}

async fn peer_write_loop(
    mut sink: PacketSink,
    mut out_rx: mpsc::Receiver<Packet>,
    mut close_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = close_rx.changed() => {
                // Drain what is already queued, the close announcement in
                // particular, before dropping the connection.
                while let Ok(packet) = out_rx.try_recv() {
                    if sink.send(packet).await.is_err() {
                        break;
                    }
                }
                break;
            }
            maybe = out_rx.recv() => match maybe {
                Some(packet) => {
                    if let Err(error) = sink.send(packet).await {
                        debug!(%error, "peer write failed");
                        break;
                    }
                }
                None => break,
            }
        }
    }
}

async fn peer_read_loop(
    inner: Arc<NodeInner>,
    peers: Arc<PeerRegistry>,
    peer: Arc<PeerHandle>,
    mut packet_stream: PacketStream,
    mut close_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = close_rx.changed() => break,
            item = packet_stream.next() => match item {
                Some(Ok(packet)) => handle_peer_packet(&inner, &peers, &peer, packet).await,
                Some(Err(error)) => {
                    debug!(peer = %peer.addr, %error, "peer read failed");
                    break;
                }
                None => break,
            }
        }
    }

    peers.remove(peer.id);
    info!(peer = %peer.addr, "peer disconnected");
}

async fn handle_peer_packet(
    inner: &Arc<NodeInner>,
    peers: &Arc<PeerRegistry>,
    sender: &Arc<PeerHandle>,
    packet: Packet,
) {
    match packet {
        Packet::Set(payload) => match replication::apply_set(inner, &payload).await {
            Ok(()) => forward(peers, sender, Packet::Set(payload)),
            Err(error) => debug!(key = %payload.key, %error, "dropping replicated set"),
        },
        Packet::Delete(payload) => match replication::apply_delete(inner, &payload).await {
            Ok(()) => forward(peers, sender, Packet::Delete(payload)),
            Err(error) => debug!(key = %payload.key, %error, "dropping replicated delete"),
        },
        Packet::CollectionRequest {
            namespace,
            collection,
        } => {
            match replication::collection_snapshot(inner, &namespace, &collection).await {
                Some(response) => {
                    if sender.send(response).await.is_err() {
                        debug!(peer = %sender.addr, "peer gone before snapshot response");
                    }
                }
                None => {
                    debug!(namespace, collection, "cannot serve unknown collection");
                }
            }
        }
        Packet::CollectionResponse { .. } | Packet::ServerClose | Packet::Alive => {}
    }
}

/// Forwards an applied packet to the other peers.
///
/// The sender never gets its own packet back, and packets from a remote
/// peer are not re-forwarded to other remote peers: every node notifies
/// its own local clients itself.
fn forward(peers: &PeerRegistry, sender: &PeerHandle, packet: Packet) {
    for peer in peers.snapshot() {
        if peer.id == sender.id {
            continue;
        }
        if sender.remote && peer.remote {
            continue;
        }
        if !peer.try_send(packet.clone()) {
            debug!(peer = %peer.addr, "peer queue full; dropping forwarded packet");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use super::*;

    fn test_peer(registry: &PeerRegistry, remote: bool) -> (Arc<PeerHandle>, mpsc::Receiver<Packet>) {
        let (out_tx, out_rx) = mpsc::channel(4);
        let peer = Arc::new(PeerHandle {
            id: registry.next_id(),
            addr: "127.0.0.1:9999".parse().expect("addr"),
            remote,
            outgoing: out_tx,
        });
        registry.insert(Arc::clone(&peer));
        (peer, out_rx)
    }

    #[tokio::test]
    async fn forward_skips_the_sender() {
        let registry = PeerRegistry::default();
        let (sender, mut sender_rx) = test_peer(&registry, false);
        let (_other, mut other_rx) = test_peer(&registry, false);

        forward(&registry, &sender, Packet::ServerClose);

        assert_eq!(other_rx.recv().await, Some(Packet::ServerClose));
        assert!(sender_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn forward_from_remote_skips_other_remotes() {
        let registry = PeerRegistry::default();
        let (sender, _sender_rx) = test_peer(&registry, true);
        let (_remote, mut remote_rx) = test_peer(&registry, true);
        let (_local, mut local_rx) = test_peer(&registry, false);

        forward(&registry, &sender, Packet::ServerClose);

        assert_eq!(local_rx.recv().await, Some(Packet::ServerClose));
        assert!(remote_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn forward_from_local_reaches_remotes() {
        let registry = PeerRegistry::default();
        let (sender, _sender_rx) = test_peer(&registry, false);
        let (_remote, mut remote_rx) = test_peer(&registry, true);

        forward(&registry, &sender, Packet::ServerClose);

        assert_eq!(remote_rx.recv().await, Some(Packet::ServerClose));
    }

    #[tokio::test]
    async fn forward_drops_on_full_queue() {
        let registry = PeerRegistry::default();
        let (sender, _sender_rx) = test_peer(&registry, false);
        let (_slow, mut slow_rx) = test_peer(&registry, false);

        // Fill the queue past capacity; extra packets are dropped silently.
        for _ in 0..10 {
            forward(&registry, &sender, Packet::ServerClose);
        }

        let mut received = 0;
        while slow_rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 4);
    }

    #[test]
    fn parse_hosts_skips_garbage() {
        let parsed = parse_hosts(&[
            "10.0.0.1:3000".to_string(),
            "not an address".to_string(),
            "10.0.0.2:3000".to_string(),
        ]);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].ip(), "10.0.0.1".parse::<IpAddr>().expect("ip"));
    }

    #[test]
    fn registry_ids_are_unique() {
        let registry = PeerRegistry::default();
        let (a, _rx_a) = test_peer(&registry, false);
        let (b, _rx_b) = test_peer(&registry, false);

        assert_ne!(a.id, b.id);
        assert_eq!(registry.len(), 2);

        registry.remove(a.id);
        assert_eq!(registry.len(), 1);
        assert!(!registry.is_empty());
    }
}
