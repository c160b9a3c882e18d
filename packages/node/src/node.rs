//! The public facade: a process-wide node owning namespaces and the
//! cluster role.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use nanokv_core::{Packet, WriteClock};
use tracing::info;

use crate::cluster::Cluster;
use crate::config::Configuration;
use crate::error::StoreError;
use crate::namespace::Namespace;
use crate::replication::Replicator;

/// Shared node state behind the [`Node`] facade.
pub(crate) struct NodeInner {
    pub(crate) config: Configuration,
    pub(crate) data_root: PathBuf,
    pub(crate) clock: Arc<WriteClock>,
    namespaces: DashMap<String, Arc<Namespace>>,
    pub(crate) cluster: OnceLock<Cluster>,
    closed: AtomicBool,
}

impl NodeInner {
    pub(crate) fn existing_namespace(&self, name: &str) -> Option<Arc<Namespace>> {
        self.namespaces
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub(crate) fn namespaces_snapshot(&self) -> Vec<Arc<Namespace>> {
        self.namespaces
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub(crate) fn is_server(&self) -> bool {
        self.cluster.get().is_some_and(Cluster::is_server)
    }
}

/// [`Replicator`] handed to collections; holds the node weakly so a dropped
/// node cannot be kept alive by its own collections.
struct ReplicatorHandle {
    inner: Weak<NodeInner>,
}

#[async_trait]
impl Replicator for ReplicatorHandle {
    fn broadcast_required(&self) -> bool {
        let Some(inner) = self.inner.upgrade() else {
            return false;
        };
        inner
            .cluster
            .get()
            .is_some_and(Cluster::broadcast_required)
    }

    async fn broadcast(&self, packet: Packet) {
        if let Some(inner) = self.inner.upgrade() {
            if let Some(cluster) = inner.cluster.get() {
                cluster.broadcast(packet).await;
            }
        }
    }

    async fn request_collection(&self, namespace: &str, collection: &str) {
        if let Some(inner) = self.inner.upgrade() {
            if let Some(cluster) = inner.cluster.get() {
                cluster.request_collection(namespace, collection).await;
            }
        }
    }
}

/// One process participating in the cluster, acting as server or client.
///
/// The first node to bind the configured port becomes the server and owns
/// durability; every other node on the port becomes a client of it. Data
/// written on any node propagates to all others with last-writer-wins
/// ordering.
///
/// # Examples
///
/// ```no_run
/// use nanokv::{Configuration, Node, RecordType};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// struct User {
///     id: i64,
/// }
///
/// impl RecordType for User {
///     const NAME: &'static str = "User";
/// }
///
/// # async fn example() -> Result<(), nanokv::StoreError> {
/// let node = Node::new(Configuration::default()).await?;
/// let db = node.namespace("app")?;
/// db.register_type::<User>();
///
/// db.set("1", User { id: 1 }).await;
/// let user = db.get::<User>("1").await?;
/// assert_eq!(user.id, 1);
///
/// node.close().await;
/// # Ok(())
/// # }
/// ```
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    /// Creates the node, electing the cluster role by attempting to bind
    /// the configured port.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] when the data root cannot be created or
    /// when neither binding nor dialing the cluster port succeeds.
    pub async fn new(config: Configuration) -> Result<Self, StoreError> {
        let data_root = config.data_root();
        std::fs::create_dir_all(&data_root)?;

        let inner = Arc::new(NodeInner {
            config,
            data_root,
            clock: Arc::new(WriteClock::system()),
            namespaces: DashMap::new(),
            cluster: OnceLock::new(),
            closed: AtomicBool::new(false),
        });

        let cluster = Cluster::start(&inner).await?;
        let role = if cluster.is_server() { "server" } else { "client" };
        inner
            .cluster
            .set(cluster)
            .map_err(|_| ())
            .expect("cluster initialized once");

        info!(port = inner.config.port, role, "node started");
        Ok(Self { inner })
    }

    /// Returns the namespace with the given name, creating its directory on
    /// first reference.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] when the namespace directory cannot be
    /// created.
    pub fn namespace(&self, name: &str) -> Result<Arc<Namespace>, StoreError> {
        if let Some(namespace) = self.inner.existing_namespace(name) {
            return Ok(namespace);
        }

        match self.inner.namespaces.entry(name.to_string()) {
            Entry::Occupied(entry) => Ok(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                let namespace = Namespace::new(
                    name,
                    self.inner.data_root.join(name),
                    Arc::new(ReplicatorHandle {
                        inner: Arc::downgrade(&self.inner),
                    }),
                    Arc::clone(&self.inner.clock),
                    self.inner.is_server(),
                    self.inner.config.flush_debounce,
                )?;
                entry.insert(Arc::clone(&namespace));
                Ok(namespace)
            }
        }
    }

    /// Whether this node won the bind and acts as the cluster server.
    #[must_use]
    pub fn is_server(&self) -> bool {
        self.inner.is_server()
    }

    /// Whether `close()` has completed or is in progress.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// The bound listener address (server) or the local connection address
    /// (client).
    #[must_use]
    pub fn address(&self) -> SocketAddr {
        self.inner
            .cluster
            .get()
            .expect("cluster is initialized in Node::new")
            .address()
    }

    /// Number of currently connected peers (always 0 on clients).
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.inner
            .cluster
            .get()
            .map_or(0, Cluster::peer_count)
    }

    /// Addresses currently heard on the multicast liveness channel.
    #[must_use]
    pub fn alive_peers(&self) -> Vec<SocketAddr> {
        self.inner
            .cluster
            .get()
            .map(Cluster::alive_peers)
            .unwrap_or_default()
    }

    /// Sends a packet to every currently-connected peer, best-effort.
    pub async fn broadcast(&self, packet: Packet) {
        if let Some(cluster) = self.inner.cluster.get() {
            cluster.broadcast(packet).await;
        }
    }

    /// Deletes all records in every namespace.
    pub async fn clear(&self) {
        for namespace in self.inner.namespaces_snapshot() {
            namespace.clear_all().await;
        }
    }

    /// Shuts the node down: announces `SERVER_CLOSE` to peers (server),
    /// tears down the transports, then closes every namespace, draining one
    /// final snapshot flush per collection. Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(cluster) = self.inner.cluster.get() {
            cluster.shutdown().await;
        }
        for namespace in self.inner.namespaces_snapshot() {
            namespace.close().await;
        }

        info!("node closed");
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("port", &self.inner.config.port)
            .field("server", &self.is_server())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
