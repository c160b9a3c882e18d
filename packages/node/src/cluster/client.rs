//! The client role: dialer, apply queue, worker pool, and reconnection.
//!
//! One reader task receives frames from the server. Whole-collection
//! snapshots are applied inline (they release first-load gates that queued
//! applies may be waiting on); `SET`/`DELETE` packets go through a bounded
//! apply queue drained by one worker per logical CPU. Ordering across keys
//! is not preserved across workers; LWW makes the final state per key
//! deterministic.
//!
//! On `SERVER_CLOSE` or any transport error, the client drops the socket
//! and re-dials in a loop until it succeeds, then re-requests every known
//! collection so state reconverges.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use nanokv_core::{Packet, PacketCodec};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::node::NodeInner;
use crate::replication;

/// Inbound replication packets waiting for an apply worker.
const APPLY_QUEUE_CAPACITY: usize = 8192;
const OUTGOING_QUEUE_CAPACITY: usize = 4096;
const INITIAL_DIAL_DEADLINE: Duration = Duration::from_secs(5);
const REDIAL_PAUSE: Duration = Duration::from_millis(100);
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

type PacketSink = SplitSink<Framed<TcpStream, PacketCodec>, Packet>;
type PacketStream = SplitStream<Framed<TcpStream, PacketCodec>>;

/// Sender half of the current server connection, hot-swapped on reconnect.
struct ConnectionHandle {
    outgoing: mpsc::Sender<Packet>,
}

/// The node's client side.
pub(crate) struct ClientRole {
    local_addr: SocketAddr,
    targets: Vec<String>,
    conn: ArcSwapOption<ConnectionHandle>,
    apply_tx: Mutex<Option<mpsc::Sender<Packet>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ClientRole {
    /// Dials the server (loopback first, then the configured hosts) and
    /// starts the connection loop and the apply workers.
    pub(crate) async fn start(
        inner: Arc<NodeInner>,
        close_rx: watch::Receiver<bool>,
    ) -> std::io::Result<Arc<Self>> {
        let mut targets = vec![format!("127.0.0.1:{}", inner.config.port)];
        targets.extend(inner.config.hosts.iter().cloned());

        let stream = initial_dial(&targets).await?;
        let local_addr = stream.local_addr()?;
        info!(server = ?stream.peer_addr().ok(), "connected to server");

        let (apply_tx, apply_rx) = mpsc::channel(APPLY_QUEUE_CAPACITY);
        let role = Arc::new(Self {
            local_addr,
            targets,
            conn: ArcSwapOption::empty(),
            apply_tx: Mutex::new(Some(apply_tx.clone())),
            tasks: Mutex::new(Vec::new()),
        });

        let mut tasks = Vec::new();

        // One apply worker per logical CPU, draining a shared queue.
        let workers = std::thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get);
        let shared_rx = Arc::new(tokio::sync::Mutex::new(apply_rx));
        for _ in 0..workers {
            tasks.push(tokio::spawn(apply_worker(
                Arc::clone(&inner),
                Arc::clone(&shared_rx),
            )));
        }

        tasks.push(tokio::spawn(run(
            Arc::clone(&role),
            inner,
            stream,
            apply_tx,
            close_rx,
        )));
        *role.tasks.lock() = tasks;

        Ok(role)
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Sends a local write to the server with backpressure.
    ///
    /// Writes issued while disconnected succeed locally but do not
    /// propagate; the divergence is logged and not buffered for replay.
    pub(crate) async fn send(&self, packet: Packet) {
        match self.conn.load_full() {
            Some(conn) => {
                if conn.outgoing.send(packet).await.is_err() {
                    debug!("connection dropped while sending");
                }
            }
            None => {
                warn!("write while disconnected from the server; change will not replicate");
            }
        }
    }

    /// Asks the server for a collection snapshot.
    ///
    /// Briefly waits out the window between connecting and publishing the
    /// connection handle; a request that still finds no connection is
    /// covered by the re-request pass on reconnect.
    pub(crate) async fn request_collection(&self, namespace: &str, collection: &str) {
        for _ in 0..80 {
            if let Some(conn) = self.conn.load_full() {
                let request = Packet::CollectionRequest {
                    namespace: namespace.to_string(),
                    collection: collection.to_string(),
                };
                if conn.outgoing.send(request).await.is_err() {
                    debug!(namespace, collection, "connection dropped while requesting snapshot");
                }
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        debug!(namespace, collection, "snapshot request deferred to reconnect");
    }

    /// Waits for the connection loop and the apply workers to exit. The
    /// close signal must already have been sent.
    ///
    /// A worker can be parked on the first-load gate of a collection whose
    /// snapshot will now never arrive; such stragglers are aborted after a
    /// drain timeout so close() always completes.
    pub(crate) async fn shutdown(&self) {
        // Dropping the queue sender lets the workers drain and exit.
        self.apply_tx.lock().take();
        self.conn.store(None);

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let straggler = task.abort_handle();
            match tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, task).await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => warn!(%error, "client task ended abnormally"),
                Err(_) => {
                    straggler.abort();
                    warn!("client task did not drain in time; aborted");
                }
            }
        }
        info!("client role shut down");
    }
}

async fn initial_dial(targets: &[String]) -> std::io::Result<TcpStream> {
    let deadline = tokio::time::Instant::now() + INITIAL_DIAL_DEADLINE;
    let mut last_error = std::io::Error::new(std::io::ErrorKind::NotConnected, "no dial targets");

    loop {
        for target in targets {
            match TcpStream::connect(target.as_str()).await {
                Ok(stream) => return Ok(stream),
                Err(error) => last_error = error,
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(last_error);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn run(
    role: Arc<ClientRole>,
    inner: Arc<NodeInner>,
    mut stream: TcpStream,
    apply_tx: mpsc::Sender<Packet>,
    mut close_rx: watch::Receiver<bool>,
) {
    loop {
        let (sink, packet_stream) = Framed::new(stream, PacketCodec::new()).split();
        let (out_tx, out_rx) = mpsc::channel(OUTGOING_QUEUE_CAPACITY);
        role.conn
            .store(Some(Arc::new(ConnectionHandle { outgoing: out_tx })));

        let write_task = tokio::spawn(write_loop(sink, out_rx));

        // Collections referenced before this (re)connection catch up here.
        rerequest_collections(&inner, &role).await;

        let shutting_down = read_loop(&inner, packet_stream, &apply_tx, &mut close_rx).await;

        role.conn.store(None);
        write_task.abort();
        let _ = write_task.await;

        if shutting_down || *close_rx.borrow() {
            break;
        }

        info!("connection to server lost; reconnecting");
        match redial(&role.targets, &mut close_rx).await {
            Some(next) => stream = next,
            None => break,
        }
    }
    debug!("client connection loop terminated");
}

async fn write_loop(mut sink: PacketSink, mut out_rx: mpsc::Receiver<Packet>) {
    while let Some(packet) = out_rx.recv().await {
        if let Err(error) = sink.send(packet).await {
            debug!(%error, "client write failed");
            break;
        }
    }
}

/// Returns `true` when the node is shutting down, `false` when the
/// connection should be re-established.
async fn read_loop(
    inner: &Arc<NodeInner>,
    mut packet_stream: PacketStream,
    apply_tx: &mpsc::Sender<Packet>,
    close_rx: &mut watch::Receiver<bool>,
) -> bool {
    loop {
        tokio::select! {
            _ = close_rx.changed() => return true,
            item = packet_stream.next() => match item {
                Some(Ok(Packet::ServerClose)) => {
                    info!("server announced shutdown");
                    return false;
                }
                Some(Ok(Packet::CollectionResponse { namespace, collection, records })) => {
                    replication::apply_collection_response(inner, &namespace, &collection, records)
                        .await;
                }
                Some(Ok(packet)) => {
                    if apply_tx.send(packet).await.is_err() {
                        return true;
                    }
                }
                Some(Err(error)) => {
                    debug!(%error, "transport error");
                    return false;
                }
                None => {
                    debug!("server closed the stream");
                    return false;
                }
            }
        }
    }
}

async fn apply_worker(
    inner: Arc<NodeInner>,
    shared_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Packet>>>,
) {
    loop {
        let packet = { shared_rx.lock().await.recv().await };
        let Some(packet) = packet else { break };
        replication::apply_replicated(&inner, packet).await;
    }
}

async fn rerequest_collections(inner: &Arc<NodeInner>, role: &Arc<ClientRole>) {
    for namespace in inner.namespaces_snapshot() {
        for collection in namespace.known_collections() {
            role.request_collection(namespace.name(), collection.name())
                .await;
        }
    }
}

async fn redial(targets: &[String], close_rx: &mut watch::Receiver<bool>) -> Option<TcpStream> {
    loop {
        if *close_rx.borrow() {
            return None;
        }
        for target in targets {
            match TcpStream::connect(target.as_str()).await {
                Ok(stream) => {
                    info!(server = %target, "reconnected");
                    return Some(stream);
                }
                Err(error) => debug!(server = %target, %error, "redial failed"),
            }
        }
        tokio::select! {
            _ = close_rx.changed() => return None,
            () = tokio::time::sleep(REDIAL_PAUSE) => {}
        }
    }
}
