//! In-memory destination used by tests and dry runs.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use super::{Destination, RemoteObject};
use crate::utils::errors::{EngineError, Result};

#[derive(Debug, Default)]
struct Store {
    objects: BTreeMap<String, Bytes>,
    failing_puts: BTreeSet<String>,
    failing_deletes: BTreeSet<String>,
}

/// Cloning shares the underlying store.
#[derive(Debug, Clone)]
pub struct MemoryDestination {
    id: String,
    store: Arc<Mutex<Store>>,
}

impl Default for MemoryDestination {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self {
            id: format!("memory://{}", Uuid::new_v4()),
            store: Arc::new(Mutex::new(Store::default())),
        }
    }

    fn store(&self) -> std::sync::MutexGuard<'_, Store> {
        // A poisoned lock only means another test thread panicked mid-call
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn names(&self) -> Vec<String> {
        self.store().objects.keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.store().objects.contains_key(name)
    }

    /// Replace an object's bytes without going through `put`.
    pub fn overwrite(&self, name: &str, data: impl Into<Bytes>) {
        self.store().objects.insert(name.to_string(), data.into());
    }

    /// Flip one byte of an existing object.
    pub fn corrupt(&self, name: &str) -> bool {
        let mut store = self.store();
        match store.objects.get(name) {
            Some(data) if !data.is_empty() => {
                let mut bytes = data.to_vec();
                bytes[0] ^= 0xff;
                store.objects.insert(name.to_string(), Bytes::from(bytes));
                true
            }
            _ => false,
        }
    }

    pub fn remove(&self, name: &str) -> bool {
        self.store().objects.remove(name).is_some()
    }

    /// Make subsequent puts of names containing `pattern` fail.
    pub fn fail_puts_matching(&self, pattern: &str) {
        self.store().failing_puts.insert(pattern.to_string());
    }

    pub fn fail_deletes_matching(&self, pattern: &str) {
        self.store().failing_deletes.insert(pattern.to_string());
    }
}

#[async_trait]
impl Destination for MemoryDestination {
    fn id(&self) -> String {
        self.id.clone()
    }

    async fn list(&self) -> Result<Vec<RemoteObject>> {
        Ok(self
            .store()
            .objects
            .iter()
            .map(|(name, data)| RemoteObject {
                name: name.clone(),
                size: data.len() as u64,
            })
            .collect())
    }

    async fn put(&self, name: &str, data: Bytes) -> Result<()> {
        let mut store = self.store();
        if store.failing_puts.iter().any(|p| name.contains(p.as_str())) {
            return Err(EngineError::destination("put", name, "injected failure"));
        }
        store.objects.insert(name.to_string(), data);
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Bytes> {
        self.store()
            .objects
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::destination("get", name, "object not found"))
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let mut store = self.store();
        if store.failing_deletes.iter().any(|p| name.contains(p.as_str())) {
            return Err(EngineError::destination("delete", name, "injected failure"));
        }
        store.objects.remove(name);
        Ok(())
    }
}
