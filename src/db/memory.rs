//! In-process key-value store
//!
//! Same contract as the SQLite store, minus durability across process
//! restarts. Used by tests and by hosts that keep their own persistence.

use std::collections::BTreeMap;
use std::sync::Mutex;

use super::{DbError, DbResult, KvStore};

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> DbResult<Option<String>> {
        let entries = self.entries.lock().map_err(|_| DbError::Poisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> DbResult<()> {
        let mut entries = self.entries.lock().map_err(|_| DbError::Poisoned)?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> DbResult<bool> {
        let mut entries = self.entries.lock().map_err(|_| DbError::Poisoned)?;
        Ok(entries.remove(key).is_some())
    }

    fn list_prefix(&self, prefix: &str) -> DbResult<Vec<(String, String)>> {
        let entries = self.entries.lock().map_err(|_| DbError::Poisoned)?;
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}
