//! A typed key/value collection persisted to one snapshot file.
//!
//! A collection binds a registered [`TypeDescriptor`] to a
//! [`RecordStore`](super::record_store::RecordStore) and, on the server role,
//! a persistence loop. Callers of `get`/`set`/`delete` are gated on the
//! `loaded` signal: on servers it is released once the on-disk snapshot has
//! been read, on clients once the first remote snapshot has been applied, so
//! reads never observe an empty collection during catch-up.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use nanokv_core::{
    DeletePayload, Packet, RecordType, SetPayload, StoredRecord, TypeDescriptor, WriteClock,
};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{ApplyError, StoreError};
use crate::replication::Replicator;
use crate::store::persistence::{self, SnapshotPaths};
use crate::store::record_store::RecordStore;

/// A typed key/value map replicated across the cluster and persisted to one
/// `.dat` file on the server.
pub struct Collection {
    name: String,
    namespace_name: String,
    descriptor: TypeDescriptor,
    server: bool,
    pub(crate) store: RecordStore,
    pub(crate) paths: SnapshotPaths,
    pub(crate) flush_lock: Mutex<()>,
    pub(crate) debounce: Duration,
    pub(crate) close_rx: watch::Receiver<bool>,
    close_tx: watch::Sender<bool>,
    loaded_tx: watch::Sender<bool>,
    loaded_rx: watch::Receiver<bool>,
    pub(crate) flush_task: Mutex<Option<JoinHandle<()>>>,
    replicator: Arc<dyn Replicator>,
    clock: Arc<WriteClock>,
}

impl Collection {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: &str,
        namespace_name: &str,
        root: &Path,
        descriptor: TypeDescriptor,
        replicator: Arc<dyn Replicator>,
        clock: Arc<WriteClock>,
        server: bool,
        debounce: Duration,
    ) -> Arc<Self> {
        let (loaded_tx, loaded_rx) = watch::channel(false);
        let (close_tx, close_rx) = watch::channel(false);

        Arc::new(Self {
            name: name.to_string(),
            namespace_name: namespace_name.to_string(),
            descriptor,
            server,
            store: RecordStore::new(),
            paths: SnapshotPaths::new(root, name),
            flush_lock: Mutex::new(()),
            debounce,
            close_rx,
            close_tx,
            loaded_tx,
            loaded_rx,
            flush_task: Mutex::new(None),
            replicator,
            clock,
        })
    }

    /// Collection name (also the registered type name).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the owning namespace.
    #[must_use]
    pub fn namespace_name(&self) -> &str {
        &self.namespace_name
    }

    pub(crate) fn descriptor(&self) -> &TypeDescriptor {
        &self.descriptor
    }

    /// Kicks off first-load: disk load plus persistence loop on the server,
    /// a snapshot request to the server on clients.
    pub(crate) fn spawn_init(self: &Arc<Self>) {
        let collection = Arc::clone(self);

        if self.server {
            tokio::spawn(async move {
                let loader = Arc::clone(&collection);
                match tokio::task::spawn_blocking(move || persistence::load_from_disk(&loader))
                    .await
                {
                    Ok(Ok(count)) => {
                        debug!(collection = %collection.name, count, "loaded snapshot from disk");
                    }
                    Ok(Err(error)) => {
                        warn!(collection = %collection.name, %error, "snapshot load failed; starting empty");
                    }
                    Err(error) => {
                        warn!(collection = %collection.name, %error, "snapshot load task failed");
                    }
                }
                // The task handle must be in place before callers are
                // released, so a close() after the first write always has a
                // loop to drain.
                let task = persistence::spawn_flush_loop(Arc::clone(&collection));
                *collection.flush_task.lock() = Some(task);
                collection.mark_loaded();
            });
        } else {
            tokio::spawn(async move {
                collection
                    .replicator
                    .request_collection(&collection.namespace_name, &collection.name)
                    .await;
            });
        }
    }

    /// Releases callers blocked on the first snapshot.
    pub(crate) fn mark_loaded(&self) {
        let _ = self.loaded_tx.send(true);
    }

    pub(crate) fn is_loaded(&self) -> bool {
        *self.loaded_rx.borrow()
    }

    /// Blocks until the first snapshot (disk or remote) has been applied.
    pub(crate) async fn wait_loaded(&self) {
        let mut loaded = self.loaded_rx.clone();
        let _ = loaded.wait_for(|loaded| *loaded).await;
    }

    /// Returns the record stored under `key`.
    ///
    /// # Errors
    ///
    /// [`StoreError::KeyNotFound`] when the key is absent.
    pub async fn get(&self, key: &str) -> Result<StoredRecord, StoreError> {
        self.wait_loaded().await;
        self.store
            .get(key)
            .ok_or_else(|| StoreError::KeyNotFound(key.to_string()))
    }

    /// Returns the record stored under `key`, downcast to its registered type.
    ///
    /// # Errors
    ///
    /// [`StoreError::KeyNotFound`] when the key is absent and
    /// [`StoreError::WrongType`] when `T` is not the collection's type.
    pub async fn get_as<T: RecordType>(&self, key: &str) -> Result<Arc<T>, StoreError> {
        let record = self.get(key).await?;
        record.downcast::<T>().map_err(|_| StoreError::WrongType {
            collection: self.name.clone(),
        })
    }

    /// Looks up multiple keys at once; absent keys yield `None`.
    pub async fn get_many<T: RecordType>(&self, keys: &[&str]) -> Vec<Option<Arc<T>>> {
        self.wait_loaded().await;
        keys.iter()
            .map(|key| {
                self.store
                    .get(key)
                    .and_then(|record| record.downcast::<T>().ok())
            })
            .collect()
    }

    /// Publishes `value` under `key` and replicates the write to all peers.
    ///
    /// Best-effort by design: replication is asynchronous and this never
    /// returns an error.
    ///
    /// # Panics
    ///
    /// Panics when `T` is not the type this collection was registered with,
    /// or when the value cannot be JSON-encoded; both are caller bugs.
    pub async fn set<T: RecordType>(&self, key: &str, value: T) {
        assert_eq!(
            T::NAME,
            self.name,
            "collection {} cannot store {} records",
            self.name,
            T::NAME
        );
        self.wait_loaded().await;

        let record: StoredRecord = Arc::new(value);

        if self.replicator.broadcast_required() {
            let ts = self.clock.now_ns();
            // Clock entry first: a reflected packet must not overwrite this write.
            self.store.record_write_ns(key, ts);
            let json = self.descriptor.encode(&record).unwrap_or_else(|error| {
                panic!(
                    "record for collection {} cannot be encoded: {error}",
                    self.name
                )
            });
            self.replicator
                .broadcast(Packet::Set(SetPayload {
                    ts,
                    namespace: self.namespace_name.clone(),
                    collection: self.name.clone(),
                    key: key.to_string(),
                    json,
                }))
                .await;
        }

        self.store.set(key, record);
    }

    /// Removes `key`, replicating the removal; returns whether it existed.
    pub async fn delete(&self, key: &str) -> bool {
        self.wait_loaded().await;

        if self.replicator.broadcast_required() {
            let ts = self.clock.now_ns();
            self.store.record_write_ns(key, ts);
            self.replicator
                .broadcast(Packet::Delete(DeletePayload {
                    ts,
                    namespace: self.namespace_name.clone(),
                    collection: self.name.clone(),
                    key: key.to_string(),
                }))
                .await;
        }

        self.store.delete(key)
    }

    /// Whether `key` is present.
    pub async fn exists(&self, key: &str) -> bool {
        self.wait_loaded().await;
        self.store.exists(key)
    }

    /// Every record once, order unspecified.
    pub async fn all(&self) -> Vec<StoredRecord> {
        self.wait_loaded().await;
        self.store.values()
    }

    /// Every record once, downcast to the registered type.
    pub async fn all_as<T: RecordType>(&self) -> Vec<Arc<T>> {
        self.all()
            .await
            .into_iter()
            .filter_map(|record| record.downcast::<T>().ok())
            .collect()
    }

    /// Exact number of records currently in memory.
    #[must_use]
    pub fn len(&self) -> usize {
        self.store.len()
    }

    /// Whether the collection holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.store.len() == 0
    }

    /// Cached element-count estimate, set by the last flush or load.
    #[must_use]
    pub fn count(&self) -> i64 {
        self.store.count()
    }

    /// Removes every record. Local-only: clears are not replicated.
    pub async fn clear(&self) {
        self.wait_loaded().await;
        self.store.clear();
    }

    // --- Replication apply side ---

    /// Applies a replicated write after decoding the record payload.
    pub(crate) fn apply_set(&self, key: &str, json: &str, ts: i64) -> Result<(), ApplyError> {
        let record = self.descriptor.decode(json)?;
        self.store.apply_set(key, record, ts)
    }

    /// Applies a replicated removal.
    pub(crate) fn apply_delete(&self, key: &str, ts: i64) -> Result<(), ApplyError> {
        self.store.apply_delete(key, ts)
    }

    /// Applies a whole-collection snapshot received from the server and
    /// releases callers blocked on first load.
    pub(crate) fn apply_snapshot(&self, records: Vec<(String, String)>) {
        let mut applied = 0_i64;
        for (key, json) in records {
            match self.descriptor.decode(&json) {
                Ok(record) => {
                    self.store.insert_loaded(key, record);
                    applied += 1;
                }
                Err(error) => {
                    warn!(
                        collection = %self.name,
                        key,
                        %error,
                        "skipping undecodable snapshot record"
                    );
                }
            }
        }
        self.store.set_count(applied);
        self.mark_loaded();
    }

    /// Serializes all records for a snapshot response, unsorted.
    pub(crate) fn snapshot_records(&self) -> Vec<(String, String)> {
        self.store
            .snapshot()
            .into_iter()
            .filter_map(|(key, record)| match self.descriptor.encode(&record) {
                Ok(json) => Some((key, json)),
                Err(error) => {
                    warn!(collection = %self.name, key, %error, "skipping unencodable record");
                    None
                }
            })
            .collect()
    }

    /// Signals the persistence loop and waits for its final flush.
    pub(crate) async fn close(&self) {
        let _ = self.close_tx.send(true);
        let task = self.flush_task.lock().take();
        if let Some(task) = task {
            if let Err(error) = task.await {
                warn!(collection = %self.name, %error, "persistence loop ended abnormally");
            }
        }
        debug!(collection = %self.name, "collection closed");
    }
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.name)
            .field("namespace", &self.namespace_name)
            .field("server", &self.server)
            .field("len", &self.store.len())
            .finish_non_exhaustive()
    }
}
