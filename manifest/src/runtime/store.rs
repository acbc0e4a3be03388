//! Per-entity storage.
//!
//! The engine only reaches instances through [`Store`]. Not-found is
//! `Ok(None)` / `Ok(false)`, never an error. [`MemoryStore`] is the only
//! backend that ships with the runtime; anything durable comes in through a
//! [`StoreProvider`].

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use indexmap::IndexMap;

use super::error::RuntimeResult;
use super::evaluator::{random_ids, IdGenerator};

/// Instance data as stored: a JSON object with an `id` key.
pub type Instance = serde_json::Map<String, serde_json::Value>;

/// Resolves a store for an entity name. Returning `None` falls back to the
/// IR store declaration.
pub type StoreProvider = Arc<dyn Fn(&str) -> Option<Arc<dyn Store>> + Send + Sync>;

pub const MEMORY_TARGET: &str = "memory";

#[async_trait]
pub trait Store: Send + Sync {
    async fn get_all(&self) -> RuntimeResult<Vec<Instance>>;
    async fn get_by_id(&self, id: &str) -> RuntimeResult<Option<Instance>>;
    /// Stores `data`, assigning an `id` when it has none.
    async fn create(&self, data: Instance) -> RuntimeResult<Instance>;
    /// Shallow-merges `patch` into the stored instance.
    async fn update(&self, id: &str, patch: Instance) -> RuntimeResult<Option<Instance>>;
    async fn delete(&self, id: &str) -> RuntimeResult<bool>;
    async fn clear(&self) -> RuntimeResult<()>;
}

pub fn instance_id(instance: &Instance) -> Option<String> {
    match instance.get("id")? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Map-backed store; insertion order is preserved for `get_all`.
pub struct MemoryStore {
    items: Mutex<IndexMap<String, Instance>>,
    ids: IdGenerator,
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("items", &self.lock().len())
            .finish()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        MemoryStore::new(random_ids())
    }
}

impl MemoryStore {
    pub fn new(ids: IdGenerator) -> Self {
        MemoryStore {
            items: Mutex::new(IndexMap::new()),
            ids,
        }
    }

    fn lock(&self) -> MutexGuard<'_, IndexMap<String, Instance>> {
        self.items.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_all(&self) -> RuntimeResult<Vec<Instance>> {
        Ok(self.lock().values().cloned().collect())
    }

    async fn get_by_id(&self, id: &str) -> RuntimeResult<Option<Instance>> {
        Ok(self.lock().get(id).cloned())
    }

    async fn create(&self, mut data: Instance) -> RuntimeResult<Instance> {
        let id = match instance_id(&data) {
            Some(id) => id,
            None => {
                let id = (self.ids)();
                data.insert("id".to_string(), serde_json::Value::String(id.clone()));
                id
            }
        };
        self.lock().insert(id, data.clone());
        Ok(data)
    }

    async fn update(&self, id: &str, patch: Instance) -> RuntimeResult<Option<Instance>> {
        let mut items = self.lock();
        let Some(existing) = items.get_mut(id) else {
            return Ok(None);
        };
        for (key, value) in patch {
            if key != "id" {
                existing.insert(key, value);
            }
        }
        Ok(Some(existing.clone()))
    }

    async fn delete(&self, id: &str) -> RuntimeResult<bool> {
        Ok(self.lock().shift_remove(id).is_some())
    }

    async fn clear(&self) -> RuntimeResult<()> {
        self.lock().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: serde_json::Value) -> Instance {
        match value {
            serde_json::Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[tokio::test]
    async fn crud_round_trip() {
        let store = MemoryStore::new(Arc::new(|| "generated".to_string()));
        let created = store.create(object(json!({"name": "a"}))).await.unwrap();
        assert_eq!(created["id"], json!("generated"));

        let updated = store
            .update("generated", object(json!({"name": "b", "id": "ignored"})))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated["name"], json!("b"));
        assert_eq!(updated["id"], json!("generated"));

        assert!(store.update("missing", Instance::new()).await.unwrap().is_none());
        assert!(store.get_by_id("missing").await.unwrap().is_none());
        assert!(store.delete("generated").await.unwrap());
        assert!(!store.delete("generated").await.unwrap());
    }

    #[tokio::test]
    async fn keeps_caller_ids_and_order() {
        let store = MemoryStore::default();
        store.create(object(json!({"id": "b"}))).await.unwrap();
        store.create(object(json!({"id": "a"}))).await.unwrap();
        let ids: Vec<_> = store
            .get_all()
            .await
            .unwrap()
            .iter()
            .filter_map(instance_id)
            .collect();
        assert_eq!(ids, vec!["b".to_string(), "a".to_string()]);
        store.clear().await.unwrap();
        assert!(store.get_all().await.unwrap().is_empty());
    }
}
