//! A filesystem-rooted group of collections sharing a type registry.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::join_all;
use nanokv_core::{RecordType, StoredRecord, TypeDescriptor, TypeRegistry, WriteClock};
use tracing::debug;

use crate::error::StoreError;
use crate::replication::Replicator;
use crate::store::Collection;

/// Combines multiple collections under a single name and directory.
///
/// Every collection's name must be registered in the namespace's type
/// registry before the collection is first referenced.
pub struct Namespace {
    name: String,
    root: PathBuf,
    registry: TypeRegistry,
    collections: DashMap<String, Arc<Collection>>,
    /// Client-side: collections awaiting their first snapshot response.
    collections_loading: DashMap<String, Arc<Collection>>,
    replicator: Arc<dyn Replicator>,
    clock: Arc<WriteClock>,
    server: bool,
    debounce: Duration,
}

impl Namespace {
    pub(crate) fn new(
        name: &str,
        root: PathBuf,
        replicator: Arc<dyn Replicator>,
        clock: Arc<WriteClock>,
        server: bool,
        debounce: Duration,
    ) -> Result<Arc<Self>, StoreError> {
        std::fs::create_dir_all(&root)?;

        Ok(Arc::new(Self {
            name: name.to_string(),
            root,
            registry: TypeRegistry::new(),
            collections: DashMap::new(),
            collections_loading: DashMap::new(),
            replicator,
            clock,
            server,
            debounce,
        }))
    }

    /// Namespace name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Directory holding this namespace's snapshot files.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Registers a record type under its `NAME`, enabling the collection of
    /// the same name. Chainable.
    pub fn register_type<T: RecordType>(&self) -> &Self {
        self.registry.register::<T>();
        self
    }

    /// Registers a list of prebuilt descriptors. Chainable.
    pub fn register_types(&self, descriptors: &[TypeDescriptor]) -> &Self {
        for descriptor in descriptors {
            self.registry.register_descriptor(*descriptor);
        }
        self
    }

    /// Returns the collection with the given name, materializing it on first
    /// reference.
    ///
    /// Materialization is idempotent under concurrent callers: exactly one
    /// collection is created per name and losers receive the winner's handle.
    ///
    /// # Panics
    ///
    /// Panics when no type has been registered under `name`; a collection
    /// without a type cannot decode its records, which is fatal by design.
    #[must_use]
    pub fn collection(&self, name: &str) -> Arc<Collection> {
        if let Some(existing) = self.collections.get(name) {
            return Arc::clone(existing.value());
        }

        let Some(descriptor) = self.registry.get(name) else {
            panic!("{}", StoreError::TypeNotRegistered(name.to_string()));
        };

        let created = match self.collections.entry(name.to_string()) {
            Entry::Occupied(entry) => return Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                let collection = Collection::new(
                    name,
                    &self.name,
                    &self.root,
                    descriptor,
                    Arc::clone(&self.replicator),
                    Arc::clone(&self.clock),
                    self.server,
                    self.debounce,
                );
                entry.insert(Arc::clone(&collection));
                collection
            }
        };

        if !self.server {
            self.collections_loading
                .insert(name.to_string(), Arc::clone(&created));
        }
        created.spawn_init();
        debug!(namespace = %self.name, collection = name, "collection materialized");
        created
    }

    /// Collection lookup for the replication apply path.
    ///
    /// Servers materialize registered collections on demand; clients only
    /// apply to collections they already reference. Remote traffic never
    /// creates anything else.
    pub(crate) fn collection_for_apply(&self, name: &str) -> Option<Arc<Collection>> {
        if let Some(existing) = self.collections.get(name) {
            return Some(Arc::clone(existing.value()));
        }
        if self.server && self.registry.contains(name) {
            Some(self.collection(name))
        } else {
            None
        }
    }

    pub(crate) fn existing_collection(&self, name: &str) -> Option<Arc<Collection>> {
        self.collections
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Takes a collection out of the loading table once its first snapshot
    /// has been applied.
    pub(crate) fn promote_loaded(&self, name: &str) {
        self.collections_loading.remove(name);
    }

    pub(crate) fn known_collections(&self) -> Vec<Arc<Collection>> {
        self.collections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Returns the value for the given key.
    ///
    /// # Errors
    ///
    /// [`StoreError::KeyNotFound`] when the key is absent,
    /// [`StoreError::WrongType`] when the stored record is not a `T`.
    pub async fn get<T: RecordType>(&self, key: &str) -> Result<Arc<T>, StoreError> {
        self.collection(T::NAME).get_as::<T>(key).await
    }

    /// Looks up multiple keys at once; absent keys yield `None`.
    pub async fn get_many<T: RecordType>(&self, keys: &[&str]) -> Vec<Option<Arc<T>>> {
        self.collection(T::NAME).get_many::<T>(keys).await
    }

    /// Sets the value for the key in the collection named `T::NAME`.
    pub async fn set<T: RecordType>(&self, key: &str, value: T) {
        self.collection(T::NAME).set(key, value).await;
    }

    /// Deletes a key from the collection; returns whether it existed.
    pub async fn delete(&self, collection: &str, key: &str) -> bool {
        self.collection(collection).delete(key).await
    }

    /// Whether the key exists in the collection.
    pub async fn exists(&self, collection: &str, key: &str) -> bool {
        self.collection(collection).exists(key).await
    }

    /// Every record of the collection, order unspecified.
    pub async fn all(&self, collection: &str) -> Vec<StoredRecord> {
        self.collection(collection).all().await
    }

    /// Every record of the collection named `T::NAME`, downcast to `T`.
    pub async fn all_as<T: RecordType>(&self) -> Vec<Arc<T>> {
        self.collection(T::NAME).all_as::<T>().await
    }

    /// Deletes all records of one collection.
    pub async fn clear(&self, collection: &str) {
        self.collection(collection).clear().await;
    }

    /// Deletes all records of every materialized collection.
    pub async fn clear_all(&self) {
        for collection in self.known_collections() {
            collection.clear().await;
        }
    }

    /// Snapshot of the registered type names.
    #[must_use]
    pub fn types(&self) -> Vec<String> {
        self.registry.names()
    }

    /// Whether the given type name has been registered.
    #[must_use]
    pub fn has_type(&self, name: &str) -> bool {
        self.registry.contains(name)
    }

    /// Materializes every registered type's collection in parallel and waits
    /// for all of them to finish their first load.
    pub async fn prefetch(&self) {
        let collections: Vec<Arc<Collection>> = self
            .registry
            .names()
            .iter()
            .map(|name| self.collection(name))
            .collect();

        join_all(
            collections
                .iter()
                .map(|collection| collection.wait_loaded()),
        )
        .await;
    }

    /// Closes every collection, draining one final flush each.
    pub async fn close(&self) {
        for collection in self.known_collections() {
            collection.close().await;
        }
        debug!(namespace = %self.name, "namespace closed");
    }
}

impl std::fmt::Debug for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Namespace")
            .field("name", &self.name)
            .field("root", &self.root)
            .field("collections", &self.collections.len())
            .finish_non_exhaustive()
    }
}
