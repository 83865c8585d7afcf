//! Durable key-value storage
//!
//! The SDK persists the visitor id, the merged identity and (optionally) a
//! snapshot of unsent events through [`KeyValueStore`]. Two implementations
//! ship with the crate:
//! - [`SqliteStore`] - on-disk store used by default
//! - [`MemoryStore`] - process-local store for tests and ephemeral clients

mod sqlite;

pub use sqlite::SqliteStore;

use crate::error::Result;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Key holding the persisted visitor id
pub const VISITOR_ID_KEY: &str = "intempt.visitor_id";

/// Key holding the external identity and merged properties
pub const IDENTITY_KEY: &str = "intempt.identity";

/// Key holding the unsent-queue snapshot for a tracker
pub fn queue_snapshot_key(tracker_id: &str) -> String {
    format!("intempt.queue.{}", tracker_id)
}

/// Durable storage collaborator
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn put(&self, key: &str, value: &str) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
}

/// In-memory store. Contents vanish with the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        self.entries.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}
