//! In-memory `LocalStore`, for tests and ephemeral sessions.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;

use crate::error::{Result, StorageError};
use crate::mutation::Mutation;
use crate::types::Entity;

use super::traits::{check_enqueue, check_entity, LocalStore};

#[derive(Default)]
struct Inner {
    entities: HashMap<String, Entity>,
    /// Keyed by mutation id, so iteration is enqueue order.
    mutations: BTreeMap<i64, Mutation>,
    next_mutation_id: i64,
}

impl Inner {
    fn enqueue(&mut self, mutation: &Mutation) -> Result<i64> {
        check_enqueue(mutation)?;
        self.next_mutation_id += 1;
        let id = self.next_mutation_id;
        let mut stored = mutation.clone();
        stored.id = id;
        self.mutations.insert(id, stored);
        Ok(id)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalStore for MemoryStore {
    fn get_by_id(&self, id: &str) -> Result<Option<Entity>> {
        Ok(self.inner.lock().entities.get(id).cloned())
    }

    fn get_by_parent(&self, parent_id: &str) -> Result<Vec<Entity>> {
        let inner = self.inner.lock();
        let mut out: Vec<Entity> = inner
            .entities
            .values()
            .filter(|e| e.parent_id == parent_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    fn upsert(&self, entity: &Entity) -> Result<()> {
        check_entity(entity)?;
        self.inner
            .lock()
            .entities
            .insert(entity.id.clone(), entity.clone());
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.inner.lock().entities.remove(id).is_some())
    }

    fn enqueue_mutation(&self, mutation: &Mutation) -> Result<i64> {
        self.inner.lock().enqueue(mutation)
    }

    fn dequeue_mutation(&self, mutation: &Mutation) -> Result<()> {
        match self.inner.lock().mutations.remove(&mutation.id) {
            Some(_) => Ok(()),
            None => Err(StorageError::MutationNotFound { id: mutation.id }.into()),
        }
    }

    fn update_mutation(&self, mutation: &Mutation) -> Result<()> {
        let mut inner = self.inner.lock();
        let stored = inner
            .mutations
            .get_mut(&mutation.id)
            .ok_or(StorageError::MutationNotFound { id: mutation.id })?;
        stored.status = mutation.status;
        stored.retry_count = mutation.retry_count;
        stored.last_error = mutation.last_error.clone();
        Ok(())
    }

    fn list_pending_mutations(&self, entity_id: &str) -> Result<Vec<Mutation>> {
        Ok(self
            .inner
            .lock()
            .mutations
            .values()
            .filter(|m| m.entity_id == entity_id)
            .cloned()
            .collect())
    }

    fn list_queued_entities(&self, parent_id: &str) -> Result<Vec<String>> {
        let inner = self.inner.lock();
        let mut out: Vec<String> = Vec::new();
        for m in inner.mutations.values() {
            if m.parent_id == parent_id && !out.contains(&m.entity_id) {
                out.push(m.entity_id.clone());
            }
        }
        Ok(out)
    }

    fn write_entity_and_enqueue(
        &self,
        entity: Option<&Entity>,
        mutation: &Mutation,
    ) -> Result<i64> {
        if let Some(entity) = entity {
            check_entity(entity)?;
        }
        let mut inner = self.inner.lock();
        // Enqueue first so a rejected mutation leaves the snapshot untouched.
        let id = inner.enqueue(mutation)?;
        if let Some(entity) = entity {
            inner.entities.insert(entity.id.clone(), entity.clone());
        }
        Ok(id)
    }
}
