//! The local persistence contract.
//!
//! The local store is the source of truth for the UI. It holds entity
//! snapshots and the per-entity mutation queue, and offers one atomic
//! combined write of both.

use crate::error::{Result, StorageError};
use crate::mutation::Mutation;
use crate::types::Entity;

/// Durable, queryable local persistence.
///
/// All methods are synchronous. Implementors must be `Send + Sync` so one
/// store can be shared between the repository and the sync engine.
pub trait LocalStore: Send + Sync {
    /// Fetch one entity snapshot.
    fn get_by_id(&self, id: &str) -> Result<Option<Entity>>;

    /// All entities owned by `parent_id`, ordered by id.
    fn get_by_parent(&self, parent_id: &str) -> Result<Vec<Entity>>;

    /// Insert or replace an entity snapshot.
    fn upsert(&self, entity: &Entity) -> Result<()>;

    /// Remove an entity snapshot. Returns whether a row existed.
    fn delete(&self, id: &str) -> Result<bool>;

    /// Append `mutation` to its entity's queue and return the assigned id.
    /// Ids increase monotonically, so id order is enqueue order.
    fn enqueue_mutation(&self, mutation: &Mutation) -> Result<i64>;

    /// Remove a queued mutation (addressed by `mutation.id`).
    fn dequeue_mutation(&self, mutation: &Mutation) -> Result<()>;

    /// Persist the status, retry count and last error of a queued mutation.
    fn update_mutation(&self, mutation: &Mutation) -> Result<()>;

    /// Every queued mutation for `entity_id`, in enqueue order.
    fn list_pending_mutations(&self, entity_id: &str) -> Result<Vec<Mutation>>;

    /// Ids of entities under `parent_id` that have queued mutations, ordered
    /// by their oldest queued mutation.
    fn list_queued_entities(&self, parent_id: &str) -> Result<Vec<String>>;

    /// Atomically write the optimistic snapshot (if any) and append the
    /// mutation. On error neither is persisted.
    fn write_entity_and_enqueue(&self, entity: Option<&Entity>, mutation: &Mutation)
        -> Result<i64>;
}

/// Queue-level constraint shared by every store.
pub(crate) fn check_enqueue(mutation: &Mutation) -> Result<()> {
    if mutation.entity_id.is_empty() {
        return Err(
            StorageError::Constraint("mutation entity id must not be empty".to_string()).into(),
        );
    }
    Ok(())
}

/// Snapshot-level constraint shared by every store: every field value must
/// read back as written.
pub(crate) fn check_entity(entity: &Entity) -> Result<()> {
    if let Some((field_id, _)) = entity.fields.iter().find(|(_, v)| !v.is_storable()) {
        return Err(StorageError::Constraint(format!(
            "entity {} field \"{field_id}\" is not storable",
            entity.id
        ))
        .into());
    }
    Ok(())
}

/// Shared handles are stores too, so `Arc<dyn LocalStore>` can be wrapped.
impl<S: LocalStore + ?Sized> LocalStore for std::sync::Arc<S> {
    fn get_by_id(&self, id: &str) -> Result<Option<Entity>> {
        (**self).get_by_id(id)
    }

    fn get_by_parent(&self, parent_id: &str) -> Result<Vec<Entity>> {
        (**self).get_by_parent(parent_id)
    }

    fn upsert(&self, entity: &Entity) -> Result<()> {
        (**self).upsert(entity)
    }

    fn delete(&self, id: &str) -> Result<bool> {
        (**self).delete(id)
    }

    fn enqueue_mutation(&self, mutation: &Mutation) -> Result<i64> {
        (**self).enqueue_mutation(mutation)
    }

    fn dequeue_mutation(&self, mutation: &Mutation) -> Result<()> {
        (**self).dequeue_mutation(mutation)
    }

    fn update_mutation(&self, mutation: &Mutation) -> Result<()> {
        (**self).update_mutation(mutation)
    }

    fn list_pending_mutations(&self, entity_id: &str) -> Result<Vec<Mutation>> {
        (**self).list_pending_mutations(entity_id)
    }

    fn list_queued_entities(&self, parent_id: &str) -> Result<Vec<String>> {
        (**self).list_queued_entities(parent_id)
    }

    fn write_entity_and_enqueue(&self, entity: Option<&Entity>, mutation: &Mutation)
        -> Result<i64> {
        (**self).write_entity_and_enqueue(entity, mutation)
    }
}
