//! Durable, synchronized key/value storage with namespaced collections.
//!
//! Keys inside a collection are namespaced as `collection[key]`; a bare key
//! reads a top-level entry. The backing store is eventually consistent
//! across the user's browser instances and offers no transaction across
//! keys, so callers must tolerate partially applied multi-key updates after
//! a crash.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use auto_impl::auto_impl;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

/// Collection holding saved route definitions.
pub const ROUTES_COLLECTION: &str = "routes";
/// Collection holding the per-window transaction ledgers.
pub const LEDGERS_COLLECTION: &str = "ledgers";
/// Bare key pointing at the most recently used route.
pub const LAST_USED_ROUTE_KEY: &str = "last-used-route";

/// Errors from encoding or decoding stored values.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A stored value did not decode as the requested type.
    #[error("stored value for '{key}' is malformed: {source}")]
    Malformed {
        /// The full namespaced key.
        key: String,
        /// The decode failure.
        source: serde_json::Error,
    },
    /// A value could not be encoded for storage.
    #[error("value for '{key}' could not be encoded: {source}")]
    Encode {
        /// The full namespaced key.
        key: String,
        /// The encode failure.
        source: serde_json::Error,
    },
}

/// Builds the namespaced storage key for a collection entry.
pub fn storage_key(key: &str, collection: Option<&str>) -> String {
    match collection {
        Some(collection) => format!("{collection}[{key}]"),
        None => key.to_owned(),
    }
}

/// Capability interface over the synchronized key/value store.
///
/// Injected into every component that persists state, so tests substitute
/// [`MemoryStore`] without touching the component.
#[auto_impl(&, Arc)]
pub trait Store: Send + Sync {
    /// Reads the raw value at a namespaced key.
    fn get_raw(&self, key: &str) -> Option<Value>;
    /// Writes the raw value at a namespaced key.
    fn set_raw(&self, key: &str, value: Value);
    /// Removes the entry at a namespaced key, if present.
    fn remove_raw(&self, key: &str);
}

/// Typed accessors over a [`Store`]. Blanket-implemented.
pub trait StoreExt: Store {
    /// Reads and decodes `key` within `collection` (or a bare key).
    fn get<T: DeserializeOwned>(
        &self,
        key: &str,
        collection: Option<&str>,
    ) -> Result<Option<T>, StoreError> {
        let full = storage_key(key, collection);
        match self.get_raw(&full) {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|source| StoreError::Malformed { key: full, source }),
            None => Ok(None),
        }
    }

    /// Encodes and writes `value` under `key` within `collection`.
    fn set<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        collection: Option<&str>,
    ) -> Result<(), StoreError> {
        let full = storage_key(key, collection);
        let encoded = serde_json::to_value(value)
            .map_err(|source| StoreError::Encode { key: full.clone(), source })?;
        self.set_raw(&full, encoded);
        Ok(())
    }

    /// Removes `key` within `collection`. Removing an absent key is a no-op.
    fn remove(&self, key: &str, collection: Option<&str>) {
        self.remove_raw(&storage_key(key, collection));
    }
}

impl<S: Store + ?Sized> StoreExt for S {}

/// In-process [`Store`] implementation.
///
/// Stands in for the browser's synchronized storage area; also the test
/// double, since the trait contract is identical.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, Value>>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, across all collections.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Store for MemoryStore {
    fn get_raw(&self, key: &str) -> Option<Value> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    fn set_raw(&self, key: &str, value: Value) {
        self.entries.lock().unwrap().insert(key.to_owned(), value);
    }

    fn remove_raw(&self, key: &str) {
        self.entries.lock().unwrap().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn collection_keys_are_namespaced() {
        assert_eq!(storage_key("abc-123", Some("routes")), "routes[abc-123]");
        assert_eq!(storage_key("last-used-route", None), "last-used-route");
    }

    #[test]
    fn route_round_trip_and_removal() {
        let store = MemoryStore::new();
        let data = json!({ "chain": 1, "avatar": "0x00000000000000000000000000000000000a11ce" });

        store.set("abc-123", &data, Some(ROUTES_COLLECTION)).unwrap();
        let loaded: Option<Value> = store.get("abc-123", Some(ROUTES_COLLECTION)).unwrap();
        assert_eq!(loaded, Some(data));

        store.remove("abc-123", Some(ROUTES_COLLECTION));
        let gone: Option<Value> = store.get("abc-123", Some(ROUTES_COLLECTION)).unwrap();
        assert_eq!(gone, None);
    }

    #[test]
    fn bare_key_does_not_collide_with_collection() {
        let store = MemoryStore::new();
        store.set("pointer", &json!("bare"), None).unwrap();
        store.set("pointer", &json!("namespaced"), Some("routes")).unwrap();

        let bare: Option<Value> = store.get("pointer", None).unwrap();
        let scoped: Option<Value> = store.get("pointer", Some("routes")).unwrap();
        assert_eq!(bare, Some(json!("bare")));
        assert_eq!(scoped, Some(json!("namespaced")));
    }

    #[test]
    fn malformed_value_surfaces_decode_error() {
        let store = MemoryStore::new();
        store.set_raw("routes[bad]", json!("not-a-number"));
        let err = store.get::<u64>("bad", Some(ROUTES_COLLECTION)).unwrap_err();
        assert!(matches!(err, StoreError::Malformed { .. }));
    }
}
