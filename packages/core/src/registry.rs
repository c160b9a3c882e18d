//! Typed record registration.
//!
//! Collections are named after the record type they store. Registration
//! captures a [`TypeDescriptor`] -- the type name plus monomorphized
//! encode/decode functions over an erased [`StoredRecord`] -- so the store
//! can materialize fresh instances from JSON without knowing the concrete
//! type at the call site. This is the explicit-factory replacement for the
//! reflective registration the wire protocol was designed around.

use std::any::Any;
use std::sync::Arc;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// An erased, shared record value as held by the store.
pub type StoredRecord = Arc<dyn Any + Send + Sync>;

/// A value type that can live in a collection.
///
/// The associated `NAME` doubles as the collection name and the on-wire
/// type-name string; it must be stable across all nodes of a cluster.
pub trait RecordType: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Collection/type name under which records of this type are stored.
    const NAME: &'static str;
}

/// Errors raised by the per-type record codecs.
#[derive(Debug, Error)]
pub enum RecordCodecError {
    /// JSON (de)serialization failed.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// A stored value does not have the type its collection was registered with.
    #[error("value stored under {type_name} does not have the registered type")]
    TypeMismatch {
        /// The registered type name of the collection.
        type_name: &'static str,
    },
}

/// Name plus encode/decode functions for one registered record type.
#[derive(Clone, Copy)]
pub struct TypeDescriptor {
    name: &'static str,
    decode: fn(&str) -> Result<StoredRecord, serde_json::Error>,
    encode: fn(&StoredRecord) -> Result<String, RecordCodecError>,
}

impl TypeDescriptor {
    /// Builds the descriptor for a record type.
    #[must_use]
    pub fn of<T: RecordType>() -> Self {
        Self {
            name: T::NAME,
            decode: decode_value::<T>,
            encode: encode_value::<T>,
        }
    }

    /// The registered type name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Parses a single-line JSON document into a fresh instance of the
    /// registered type.
    ///
    /// # Errors
    ///
    /// Returns the underlying JSON error when the document does not match
    /// the registered type.
    pub fn decode(&self, json: &str) -> Result<StoredRecord, serde_json::Error> {
        (self.decode)(json)
    }

    /// Encodes a stored value as a single-line JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`RecordCodecError::TypeMismatch`] when the value was not
    /// produced by this descriptor's type, and a JSON error when
    /// serialization fails.
    pub fn encode(&self, value: &StoredRecord) -> Result<String, RecordCodecError> {
        (self.encode)(value)
    }
}

impl std::fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

fn decode_value<T: RecordType>(json: &str) -> Result<StoredRecord, serde_json::Error> {
    let value: T = serde_json::from_str(json)?;
    Ok(Arc::new(value) as StoredRecord)
}

fn encode_value<T: RecordType>(value: &StoredRecord) -> Result<String, RecordCodecError> {
    let typed = value
        .downcast_ref::<T>()
        .ok_or(RecordCodecError::TypeMismatch { type_name: T::NAME })?;
    Ok(serde_json::to_string(typed)?)
}

/// Concurrent `type-name -> descriptor` registry shared by a namespace.
///
/// Populated before collections are materialized; lookups after that point
/// are lock-free reads.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    types: DashMap<String, TypeDescriptor>,
}

impl TypeRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a record type under its `NAME`.
    pub fn register<T: RecordType>(&self) {
        self.register_descriptor(TypeDescriptor::of::<T>());
    }

    /// Registers a prebuilt descriptor, replacing any previous registration
    /// under the same name.
    pub fn register_descriptor(&self, descriptor: TypeDescriptor) {
        self.types.insert(descriptor.name().to_string(), descriptor);
    }

    /// Looks up the descriptor registered under `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<TypeDescriptor> {
        self.types.get(name).map(|entry| *entry.value())
    }

    /// Returns whether `name` has been registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    /// Returns a snapshot of all registered type names.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.types.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Number of registered types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Whether no types have been registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct User {
        id: i64,
        name: String,
    }

    impl RecordType for User {
        const NAME: &'static str = "User";
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct Session {
        token: String,
    }

    impl RecordType for Session {
        const NAME: &'static str = "Session";
    }

    #[test]
    fn descriptor_encodes_and_decodes() {
        let descriptor = TypeDescriptor::of::<User>();
        assert_eq!(descriptor.name(), "User");

        let user = User {
            id: 1,
            name: "Test User".to_string(),
        };
        let stored: StoredRecord = Arc::new(user.clone());

        let json = descriptor.encode(&stored).expect("encode");
        assert!(!json.contains('\n'), "record JSON must be single-line");

        let decoded = descriptor.decode(&json).expect("decode");
        let decoded = decoded.downcast_ref::<User>().expect("downcast");
        assert_eq!(decoded, &user);
    }

    #[test]
    fn encode_rejects_foreign_values() {
        let descriptor = TypeDescriptor::of::<User>();
        let wrong: StoredRecord = Arc::new(Session {
            token: "abc".to_string(),
        });
        assert!(matches!(
            descriptor.encode(&wrong),
            Err(RecordCodecError::TypeMismatch { type_name: "User" })
        ));
    }

    #[test]
    fn decode_rejects_mismatched_json() {
        let descriptor = TypeDescriptor::of::<User>();
        assert!(descriptor.decode(r#"{"token":"abc"}"#).is_err());
        assert!(descriptor.decode("not json").is_err());
    }

    #[test]
    fn registry_round_trip() {
        let registry = TypeRegistry::new();
        assert!(registry.is_empty());

        registry.register::<User>();
        registry.register::<Session>();

        assert_eq!(registry.len(), 2);
        assert!(registry.contains("User"));
        assert!(registry.contains("Session"));
        assert!(!registry.contains("Unknown"));
        assert!(registry.get("User").is_some());
        assert!(registry.get("Unknown").is_none());

        let mut names = registry.names();
        names.sort();
        assert_eq!(names, vec!["Session".to_string(), "User".to_string()]);
    }

    #[test]
    fn reregistering_replaces_descriptor() {
        let registry = TypeRegistry::new();
        registry.register::<User>();
        registry.register::<User>();
        assert_eq!(registry.len(), 1);
    }
}
