//! The replication engine: applying remote operations with LWW and serving
//! whole-collection snapshots.
//!
//! Everything here is drop-at-the-boundary: a packet that cannot be applied
//! (unknown collection, stale timestamp, undecodable value) is logged at
//! debug level and discarded. Replication never propagates errors into the
//! facade.

use async_trait::async_trait;
use nanokv_core::{DeletePayload, Packet, SetPayload};
use tracing::debug;

use crate::error::ApplyError;
use crate::node::NodeInner;
use crate::store::Collection;

/// Seam between collections and the cluster transport.
///
/// Collections broadcast their writes through this trait; the node's cluster
/// role implements it, and [`NullReplicator`] stands in where no cluster
/// exists (standalone stores and unit tests).
#[async_trait]
pub(crate) trait Replicator: Send + Sync {
    /// Whether a local write currently needs to produce a packet:
    /// always on clients, on servers only while peers are connected.
    fn broadcast_required(&self) -> bool;

    /// Sends a packet to every connected peer, best-effort.
    async fn broadcast(&self, packet: Packet);

    /// Client-side: asks the server for a whole-collection snapshot.
    async fn request_collection(&self, namespace: &str, collection: &str);
}

/// Replicator for collections with no cluster behind them.
pub(crate) struct NullReplicator;

#[async_trait]
impl Replicator for NullReplicator {
    fn broadcast_required(&self) -> bool {
        false
    }

    async fn broadcast(&self, _packet: Packet) {}

    async fn request_collection(&self, _namespace: &str, _collection: &str) {}
}

/// Resolves the target collection of a replicated operation.
///
/// Namespaces are never created by remote traffic. Servers materialize a
/// registered collection on demand (loading its snapshot first); clients
/// only apply to collections they already reference.
async fn target_collection(
    inner: &NodeInner,
    namespace: &str,
    collection: &str,
) -> Result<std::sync::Arc<Collection>, ApplyError> {
    let unknown = || ApplyError::UnknownCollection(format!("{namespace}/{collection}"));

    let ns = inner.existing_namespace(namespace).ok_or_else(unknown)?;
    let coll = ns.collection_for_apply(collection).ok_or_else(unknown)?;
    coll.wait_loaded().await;
    Ok(coll)
}

/// Applies a replicated write.
///
/// # Errors
///
/// Returns the drop reason; callers log it and move on.
pub(crate) async fn apply_set(inner: &NodeInner, payload: &SetPayload) -> Result<(), ApplyError> {
    let collection = target_collection(inner, &payload.namespace, &payload.collection).await?;
    collection.apply_set(&payload.key, &payload.json, payload.ts)
}

/// Applies a replicated removal.
///
/// # Errors
///
/// Returns the drop reason; callers log it and move on.
pub(crate) async fn apply_delete(
    inner: &NodeInner,
    payload: &DeletePayload,
) -> Result<(), ApplyError> {
    let collection = target_collection(inner, &payload.namespace, &payload.collection).await?;
    collection.apply_delete(&payload.key, payload.ts)
}

/// Applies a whole-collection snapshot received from the server and promotes
/// the collection out of the loading table.
pub(crate) async fn apply_collection_response(
    inner: &NodeInner,
    namespace: &str,
    collection: &str,
    records: Vec<(String, String)>,
) {
    let Some(ns) = inner.existing_namespace(namespace) else {
        debug!(namespace, collection, "snapshot response for unknown namespace");
        return;
    };
    let Some(target) = ns.existing_collection(collection) else {
        debug!(namespace, collection, "snapshot response for unknown collection");
        return;
    };

    let count = records.len();
    target.apply_snapshot(records);
    ns.promote_loaded(collection);
    debug!(namespace, collection, count, "applied collection snapshot");
}

/// Builds the snapshot response for a `COLLECTION_REQUEST`, or `None` when
/// the collection cannot be served (unknown namespace or unregistered type).
pub(crate) async fn collection_snapshot(
    inner: &NodeInner,
    namespace: &str,
    collection: &str,
) -> Option<Packet> {
    let ns = inner.existing_namespace(namespace)?;
    let target = ns.collection_for_apply(collection)?;
    target.wait_loaded().await;

    Some(Packet::CollectionResponse {
        namespace: namespace.to_string(),
        collection: collection.to_string(),
        records: target.snapshot_records(),
    })
}

/// Applies one inbound packet on the client apply path.
///
/// `SERVER_CLOSE` and transport concerns are handled by the connection
/// tasks before packets reach this point.
pub(crate) async fn apply_replicated(inner: &NodeInner, packet: Packet) {
    match packet {
        Packet::Set(payload) => {
            if let Err(error) = apply_set(inner, &payload).await {
                debug!(key = %payload.key, %error, "dropping replicated set");
            }
        }
        Packet::Delete(payload) => {
            if let Err(error) = apply_delete(inner, &payload).await {
                debug!(key = %payload.key, %error, "dropping replicated delete");
            }
        }
        Packet::CollectionResponse {
            namespace,
            collection,
            records,
        } => {
            apply_collection_response(inner, &namespace, &collection, records).await;
        }
        Packet::CollectionRequest { .. } | Packet::ServerClose | Packet::Alive => {}
    }
}
