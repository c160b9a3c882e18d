//! Cluster role selection and transports.
//!
//! Role election is bind-based: the first process to bind the configured
//! TCP port becomes the server, later joiners dial it as clients. Both
//! roles additionally join the UDP multicast liveness group, which carries
//! announcements only -- replication travels exclusively over TCP.

pub(crate) mod client;
pub(crate) mod liveness;
pub(crate) mod server;

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use nanokv_core::Packet;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::node::NodeInner;
use client::ClientRole;
use liveness::Liveness;
use server::ServerRole;

/// The node's current cluster role.
pub(crate) enum Role {
    Server(Arc<ServerRole>),
    Client(Arc<ClientRole>),
}

/// Owns the role, the liveness channel, and the shared close signal.
pub(crate) struct Cluster {
    role: Role,
    liveness: Option<Arc<Liveness>>,
    close_tx: watch::Sender<bool>,
}

/// Binds the cluster listener with `SO_REUSEADDR` so a restarted server can
/// rebind while old connections sit in TIME_WAIT. Reuse-address does not
/// allow two live listeners, so role election stays bind-based.
fn bind_listener(port: u16) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    TcpListener::from_std(socket.into())
}

impl Cluster {
    /// Elects the role by attempting to bind the cluster port, then starts
    /// the matching transport and the liveness channel.
    pub(crate) async fn start(inner: &Arc<NodeInner>) -> std::io::Result<Self> {
        let (close_tx, close_rx) = watch::channel(false);
        let port = inner.config.port;

        let role = match bind_listener(port) {
            Ok(listener) => {
                info!(port, "bound cluster port; acting as server");
                Role::Server(ServerRole::start(Arc::clone(inner), listener, close_rx.clone()).await?)
            }
            Err(error) => {
                debug!(port, %error, "cluster port taken; acting as client");
                Role::Client(ClientRole::start(Arc::clone(inner), close_rx.clone()).await?)
            }
        };

        // Liveness is advisory; a node without multicast still replicates.
        let liveness = match Liveness::start(port, close_rx) {
            Ok(liveness) => Some(liveness),
            Err(error) => {
                warn!(%error, "multicast liveness unavailable");
                None
            }
        };

        Ok(Self {
            role,
            liveness,
            close_tx,
        })
    }

    pub(crate) fn is_server(&self) -> bool {
        matches!(self.role, Role::Server(_))
    }

    pub(crate) fn address(&self) -> SocketAddr {
        match &self.role {
            Role::Server(server) => server.local_addr(),
            Role::Client(client) => client.local_addr(),
        }
    }

    /// Whether a local write currently needs to produce a packet: always on
    /// clients, on servers only while at least one peer is connected.
    pub(crate) fn broadcast_required(&self) -> bool {
        match &self.role {
            Role::Server(server) => server.has_peers(),
            Role::Client(_) => true,
        }
    }

    pub(crate) fn peer_count(&self) -> usize {
        match &self.role {
            Role::Server(server) => server.peer_count(),
            Role::Client(_) => 0,
        }
    }

    /// Sends a packet to every currently-connected peer, best-effort.
    pub(crate) async fn broadcast(&self, packet: Packet) {
        match &self.role {
            Role::Server(server) => server.broadcast(&packet),
            Role::Client(client) => client.send(packet).await,
        }
    }

    pub(crate) async fn request_collection(&self, namespace: &str, collection: &str) {
        if let Role::Client(client) = &self.role {
            client.request_collection(namespace, collection).await;
        }
    }

    /// Addresses currently heard on the liveness channel.
    pub(crate) fn alive_peers(&self) -> Vec<SocketAddr> {
        self.liveness
            .as_ref()
            .map(|liveness| liveness.alive_peers())
            .unwrap_or_default()
    }

    /// Announces shutdown (server), then tears down all transport tasks.
    pub(crate) async fn shutdown(&self) {
        if let Role::Server(server) = &self.role {
            server.announce_close().await;
        }
        let _ = self.close_tx.send(true);

        match &self.role {
            Role::Server(server) => server.shutdown().await,
            Role::Client(client) => client.shutdown().await,
        }

        if let Some(liveness) = &self.liveness {
            liveness.shutdown().await;
        }
    }
}
