//! Visitor identity
//!
//! The visitor id is a v4 UUID generated on first use and persisted through
//! the [`KeyValueStore`]. All read-modify-write against storage happens under
//! one lock, so concurrent first calls agree on a single id.
//!
//! When storage is unavailable the store hands out an in-memory id that
//! stays fixed for the life of the store, and reports the storage error
//! next to it.

use crate::error::{Error, Result};
use crate::store::{KeyValueStore, IDENTITY_KEY, VISITOR_ID_KEY};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// Identity persisted under [`IDENTITY_KEY`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredIdentity {
    pub external_identity: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
}

/// Result of a visitor id lookup
#[derive(Debug)]
pub struct VisitorIdLookup {
    pub visitor_id: Uuid,
    /// Set when storage failed and `visitor_id` is process-local
    pub error: Option<Error>,
}

#[derive(Debug, Default)]
struct IdentityState {
    visitor_id: Option<Uuid>,
    /// The id in use could not be persisted yet
    unpersisted: bool,
    identity: Option<StoredIdentity>,
}

/// Owns the durable visitor id and merged identity properties
pub struct VisitorIdentityStore {
    storage: Arc<dyn KeyValueStore>,
    state: Mutex<IdentityState>,
}

impl VisitorIdentityStore {
    pub fn new(storage: Arc<dyn KeyValueStore>) -> Self {
        Self {
            storage,
            state: Mutex::new(IdentityState::default()),
        }
    }

    /// Return the visitor id, generating and persisting one on first call.
    pub fn visitor_id(&self) -> VisitorIdLookup {
        let mut state = self.state.lock();
        self.resolve_locked(&mut state)
    }

    /// Return the visitor id, surfacing a storage failure as an error
    pub fn try_visitor_id(&self) -> Result<Uuid> {
        let lookup = self.visitor_id();
        match lookup.error {
            Some(e) => Err(e),
            None => Ok(lookup.visitor_id),
        }
    }

    fn resolve_locked(&self, state: &mut IdentityState) -> VisitorIdLookup {
        if let Some(id) = state.visitor_id {
            if !state.unpersisted {
                return VisitorIdLookup {
                    visitor_id: id,
                    error: None,
                };
            }
            // Retry persisting the process-local id, but only into empty storage
            return match self.storage.get(VISITOR_ID_KEY) {
                Ok(None) => match self.storage.put(VISITOR_ID_KEY, &id.to_string()) {
                    Ok(()) => {
                        state.unpersisted = false;
                        tracing::info!(visitor_id = %id, "Persisted fallback visitor id");
                        VisitorIdLookup {
                            visitor_id: id,
                            error: None,
                        }
                    }
                    Err(e) => VisitorIdLookup {
                        visitor_id: id,
                        error: Some(e),
                    },
                },
                Ok(Some(stored)) => {
                    // Another writer got there first. Keep this session's id
                    // stable and stop retrying; the stored id wins next start.
                    state.unpersisted = false;
                    tracing::warn!(
                        visitor_id = %id,
                        stored = %stored,
                        "Storage holds a different visitor id, keeping in-memory id for this session"
                    );
                    VisitorIdLookup {
                        visitor_id: id,
                        error: None,
                    }
                }
                Err(e) => VisitorIdLookup {
                    visitor_id: id,
                    error: Some(e),
                },
            };
        }

        match self.load_or_create() {
            Ok(id) => {
                state.visitor_id = Some(id);
                VisitorIdLookup {
                    visitor_id: id,
                    error: None,
                }
            }
            Err(e) => {
                let id = Uuid::new_v4();
                tracing::warn!(
                    visitor_id = %id,
                    error = %e,
                    "Storage unavailable, using in-memory visitor id"
                );
                state.visitor_id = Some(id);
                state.unpersisted = true;
                VisitorIdLookup {
                    visitor_id: id,
                    error: Some(e),
                }
            }
        }
    }

    fn load_or_create(&self) -> Result<Uuid> {
        if let Some(raw) = self.storage.get(VISITOR_ID_KEY)? {
            match Uuid::parse_str(&raw) {
                Ok(id) => return Ok(id),
                Err(e) => {
                    tracing::warn!(error = %e, "Stored visitor id is malformed, replacing it");
                }
            }
        }

        let id = Uuid::new_v4();
        self.storage.put(VISITOR_ID_KEY, &id.to_string())?;
        tracing::debug!(visitor_id = %id, "Generated visitor id");
        Ok(id)
    }

    /// Attach an external identity and merge properties (per-key overwrite).
    ///
    /// The merged identity is kept in memory even if persisting it fails;
    /// the storage error is still returned.
    pub fn identify(
        &self,
        identity: &str,
        properties: impl IntoIterator<Item = (String, serde_json::Value)>,
    ) -> Result<Uuid> {
        if identity.trim().is_empty() {
            return Err(Error::Validation("identity must not be empty".to_string()));
        }

        let mut state = self.state.lock();
        let lookup = self.resolve_locked(&mut state);

        let mut merged = match state.identity.take() {
            Some(identity) => identity,
            None => self.load_identity().unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Could not load stored identity");
                StoredIdentity::default()
            }),
        };
        merged.external_identity = Some(identity.to_string());
        for (key, value) in properties {
            merged.properties.insert(key, value);
        }

        let persisted = serde_json::to_string(&merged)
            .map_err(Error::from)
            .and_then(|json| self.storage.put(IDENTITY_KEY, &json));
        state.identity = Some(merged);

        persisted?;
        match lookup.error {
            Some(e) => Err(e),
            None => Ok(lookup.visitor_id),
        }
    }

    /// Current external identity, if any
    pub fn external_identity(&self) -> Option<String> {
        self.identity().external_identity
    }

    /// Current merged identity properties
    pub fn properties(&self) -> BTreeMap<String, serde_json::Value> {
        self.identity().properties
    }

    fn identity(&self) -> StoredIdentity {
        let mut state = self.state.lock();
        if state.identity.is_none() {
            match self.load_identity() {
                Ok(identity) => state.identity = Some(identity),
                Err(e) => {
                    tracing::warn!(error = %e, "Could not load stored identity");
                    return StoredIdentity::default();
                }
            }
        }
        state.identity.clone().unwrap_or_default()
    }

    fn load_identity(&self) -> Result<StoredIdentity> {
        match self.storage.get(IDENTITY_KEY)? {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(StoredIdentity::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Store that fails every call while `down` is set
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        down: AtomicBool,
        gets: AtomicUsize,
    }

    impl FlakyStore {
        fn check(&self) -> Result<()> {
            if self.down.load(Ordering::SeqCst) {
                Err(Error::Storage("disk unavailable".to_string()))
            } else {
                Ok(())
            }
        }
    }

    impl KeyValueStore for FlakyStore {
        fn get(&self, key: &str) -> Result<Option<String>> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            self.check()?;
            self.inner.get(key)
        }
        fn put(&self, key: &str, value: &str) -> Result<()> {
            self.check()?;
            self.inner.put(key, value)
        }
        fn delete(&self, key: &str) -> Result<()> {
            self.check()?;
            self.inner.delete(key)
        }
    }

    fn props(pairs: &[(&str, serde_json::Value)]) -> Vec<(String, serde_json::Value)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_visitor_id_is_stable() {
        let store = VisitorIdentityStore::new(Arc::new(MemoryStore::new()));
        let first = store.try_visitor_id().unwrap();
        let second = store.try_visitor_id().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.get_version_num(), 4);
    }

    #[test]
    fn test_visitor_id_survives_new_store_instance() {
        let storage: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let first = VisitorIdentityStore::new(storage.clone())
            .try_visitor_id()
            .unwrap();
        let second = VisitorIdentityStore::new(storage).try_visitor_id().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_concurrent_first_calls_agree() {
        let store = Arc::new(VisitorIdentityStore::new(Arc::new(MemoryStore::new())));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || store.try_visitor_id().unwrap())
            })
            .collect();
        let ids: Vec<Uuid> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn test_identify_overwrites_properties() {
        let store = VisitorIdentityStore::new(Arc::new(MemoryStore::new()));
        let before = store.try_visitor_id().unwrap();

        store
            .identify("a@b.com", props(&[("plan", json!("pro")), ("seat", json!(3))]))
            .unwrap();
        store
            .identify("a@b.com", props(&[("plan", json!("free"))]))
            .unwrap();

        assert_eq!(store.try_visitor_id().unwrap(), before);
        assert_eq!(store.external_identity().as_deref(), Some("a@b.com"));
        let merged = store.properties();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged["plan"], json!("free"));
        assert_eq!(merged["seat"], json!(3));
    }

    #[test]
    fn test_identify_persists_merged_identity() {
        let storage: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        VisitorIdentityStore::new(storage.clone())
            .identify("+15550100", props(&[("tier", json!("gold"))]))
            .unwrap();

        let reopened = VisitorIdentityStore::new(storage);
        assert_eq!(reopened.external_identity().as_deref(), Some("+15550100"));
        assert_eq!(reopened.properties()["tier"], json!("gold"));
    }

    #[test]
    fn test_identify_rejects_empty_identity() {
        let store = VisitorIdentityStore::new(Arc::new(MemoryStore::new()));
        assert!(matches!(
            store.identify("", Vec::new()),
            Err(Error::Validation(_))
        ));
        assert!(store.external_identity().is_none());
    }

    #[test]
    fn test_storage_failure_falls_back_to_memory_id() {
        let storage = Arc::new(FlakyStore::default());
        storage.down.store(true, Ordering::SeqCst);
        let store = VisitorIdentityStore::new(storage.clone());

        let first = store.visitor_id();
        assert!(matches!(first.error, Some(Error::Storage(_))));
        let second = store.visitor_id();
        assert_eq!(first.visitor_id, second.visitor_id);

        // storage recovers: the fallback id is persisted, not replaced
        storage.down.store(false, Ordering::SeqCst);
        let recovered = store.visitor_id();
        assert!(recovered.error.is_none());
        assert_eq!(recovered.visitor_id, first.visitor_id);
        assert_eq!(
            storage.get(VISITOR_ID_KEY).unwrap(),
            Some(first.visitor_id.to_string())
        );
    }

    #[test]
    fn test_recovered_storage_with_other_id_stops_retrying() {
        let storage = Arc::new(FlakyStore::default());
        storage.down.store(true, Ordering::SeqCst);
        let store = VisitorIdentityStore::new(storage.clone());
        let fallback = store.visitor_id();
        assert!(fallback.error.is_some());

        // another process wrote its own id while this one was cut off
        let other = Uuid::new_v4().to_string();
        storage.inner.put(VISITOR_ID_KEY, &other).unwrap();
        storage.down.store(false, Ordering::SeqCst);

        let recovered = store.visitor_id();
        assert!(recovered.error.is_none());
        assert_eq!(recovered.visitor_id, fallback.visitor_id);

        let gets = storage.gets.load(Ordering::SeqCst);
        assert_eq!(store.visitor_id().visitor_id, fallback.visitor_id);
        assert_eq!(storage.gets.load(Ordering::SeqCst), gets);
        assert_eq!(storage.inner.get(VISITOR_ID_KEY).unwrap(), Some(other));
    }
}
