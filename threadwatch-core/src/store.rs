//! Persistence interface.
//!
//! [`Store`] is implemented by the SQLite backend in the CLI and by
//! [`MemoryStore`] for tests and dry runs. Methods use `impl Future` in their
//! signatures so no `async-trait` shim is needed.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use threadwatch_fetch::CookieMap;

use crate::entity::{Entity, EntityId};
use crate::error::StoreError;

pub trait Store: Send + Sync + 'static {
    fn load_entities(&self) -> impl Future<Output = Result<Vec<Entity>, StoreError>> + Send;

    fn get_entity(
        &self,
        id: EntityId,
    ) -> impl Future<Output = Result<Option<Entity>, StoreError>> + Send;

    /// Insert or replace the whole record keyed by `entity.id`.
    fn upsert_entity(&self, entity: &Entity) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Returns `false` if there was nothing to delete.
    fn delete_entity(&self, id: EntityId) -> impl Future<Output = Result<bool, StoreError>> + Send;

    fn get_setting(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<Option<String>, StoreError>> + Send;

    fn set_setting(
        &self,
        key: &str,
        value: &str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn load_cookies(&self) -> impl Future<Output = Result<CookieMap, StoreError>> + Send;

    /// Replace the stored login cookies.
    fn save_cookies(&self, cookies: &CookieMap) -> impl Future<Output = Result<(), StoreError>> + Send;
}

#[derive(Debug, Default)]
struct MemoryState {
    entities: BTreeMap<EntityId, Entity>,
    settings: HashMap<String, String>,
    cookies: CookieMap,
}

/// In-process [`Store`]. Clones share the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    writes: Arc<AtomicUsize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entities(entities: impl IntoIterator<Item = Entity>) -> Self {
        let store = Self::default();
        store.lock().entities = entities.into_iter().map(|e| (e.id, e)).collect();
        store
    }

    /// Number of entity upserts performed so far.
    pub fn entity_writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Store for MemoryStore {
    async fn load_entities(&self) -> Result<Vec<Entity>, StoreError> {
        Ok(self.lock().entities.values().cloned().collect())
    }

    async fn get_entity(&self, id: EntityId) -> Result<Option<Entity>, StoreError> {
        Ok(self.lock().entities.get(&id).cloned())
    }

    async fn upsert_entity(&self, entity: &Entity) -> Result<(), StoreError> {
        self.lock().entities.insert(entity.id, entity.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete_entity(&self, id: EntityId) -> Result<bool, StoreError> {
        Ok(self.lock().entities.remove(&id).is_some())
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.lock().settings.get(key).cloned())
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.lock().settings.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    async fn load_cookies(&self) -> Result<CookieMap, StoreError> {
        Ok(self.lock().cookies.clone())
    }

    async fn save_cookies(&self, cookies: &CookieMap) -> Result<(), StoreError> {
        self.lock().cookies = cookies.clone();
        Ok(())
    }
}
