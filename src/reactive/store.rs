//! ObservableStore<S>: a `LocalStore` wrapper that announces its writes.
//!
//! Single writes emit after the inner store call has returned, so listeners
//! never run while a storage lock is held and may read the store freely.
//! Listeners are routed by a per-subscription [`StoreEvent`] filter and
//! called outside the registry lock, so a listener may subscribe or
//! unsubscribe (itself included) while it runs. One removed mid-emit still
//! sees the current event; one added mid-emit first sees the next.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex};

use crate::error::Result;
use crate::mutation::Mutation;
use crate::storage::LocalStore;
use crate::types::Entity;

use super::event::StoreEvent;

/// An owned one-shot closure that removes a subscription when called.
pub type Unsubscribe = Box<dyn FnOnce() + Send + Sync>;

/// Decides which events a subscription receives.
pub type EventFilter = dyn Fn(&StoreEvent) -> bool + Send + Sync;

type Listener = dyn Fn(&StoreEvent) + Send + Sync;

struct Subscription {
    id: u64,
    filter: Option<Box<EventFilter>>,
    listener: Arc<Listener>,
}

#[derive(Default)]
struct Listeners {
    entries: Mutex<Vec<Subscription>>,
    next_id: AtomicU64,
}

impl Listeners {
    fn add(&self, filter: Option<Box<EventFilter>>, listener: Arc<Listener>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().push(Subscription {
            id,
            filter,
            listener,
        });
        id
    }

    fn remove(&self, id: u64) {
        self.entries.lock().retain(|s| s.id != id);
    }

    /// Listeners interested in `event`, in registration order.
    fn matching(&self, event: &StoreEvent) -> Vec<Arc<Listener>> {
        self.entries
            .lock()
            .iter()
            .filter(|s| s.filter.as_ref().map_or(true, |accept| accept(event)))
            .map(|s| Arc::clone(&s.listener))
            .collect()
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

pub struct ObservableStore<S> {
    inner: S,
    listeners: Arc<Listeners>,
    /// Held for every write, and across [`ObservableStore::exclusive`].
    writes: ReentrantMutex<()>,
}

impl<S: LocalStore> ObservableStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            listeners: Arc::new(Listeners::default()),
            writes: ReentrantMutex::new(()),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Register `listener` for every store event.
    pub fn subscribe(&self, listener: impl Fn(&StoreEvent) + Send + Sync + 'static) -> Unsubscribe {
        self.register(None, Arc::new(listener))
    }

    /// Register `listener` for the events `filter` accepts.
    pub fn subscribe_where(
        &self,
        filter: impl Fn(&StoreEvent) -> bool + Send + Sync + 'static,
        listener: impl Fn(&StoreEvent) + Send + Sync + 'static,
    ) -> Unsubscribe {
        self.register(Some(Box::new(filter)), Arc::new(listener))
    }

    fn register(&self, filter: Option<Box<EventFilter>>, listener: Arc<Listener>) -> Unsubscribe {
        let id = self.listeners.add(filter, listener);
        let listeners = Arc::clone(&self.listeners);
        Box::new(move || listeners.remove(id))
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Run `f` with every other writer held off, so a read-modify-write
    /// through `f`'s handle cannot interleave with another write. Writes made
    /// inside `f` are announced while the others are still held off.
    pub fn exclusive<T>(&self, f: impl FnOnce(&Self) -> Result<T>) -> Result<T> {
        let _writes = self.writes.lock();
        f(self)
    }

    fn write<T>(&self, f: impl FnOnce(&S) -> Result<T>) -> Result<T> {
        let _writes = self.writes.lock();
        f(&self.inner)
    }

    fn emit(&self, event: StoreEvent) {
        for listener in self.listeners.matching(&event) {
            listener(&event);
        }
    }

    fn entity_written(&self, entity: &Entity) {
        self.emit(StoreEvent::EntityWritten {
            parent_id: entity.parent_id.clone(),
            id: entity.id.clone(),
        });
    }

    fn queue_changed(&self, mutation: &Mutation) {
        self.emit(StoreEvent::QueueChanged {
            parent_id: mutation.parent_id.clone(),
            entity_id: mutation.entity_id.clone(),
        });
    }
}

impl<S: LocalStore> LocalStore for ObservableStore<S> {
    fn get_by_id(&self, id: &str) -> Result<Option<Entity>> {
        self.inner.get_by_id(id)
    }

    fn get_by_parent(&self, parent_id: &str) -> Result<Vec<Entity>> {
        self.inner.get_by_parent(parent_id)
    }

    fn upsert(&self, entity: &Entity) -> Result<()> {
        self.write(|inner| inner.upsert(entity))?;
        self.entity_written(entity);
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<bool> {
        let removed = self.write(|inner| {
            let parent_id = inner.get_by_id(id)?.map(|e| e.parent_id);
            Ok(inner.delete(id)?.then_some(parent_id).flatten())
        })?;
        match removed {
            Some(parent_id) => {
                self.emit(StoreEvent::EntityDeleted {
                    parent_id,
                    id: id.to_string(),
                });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn enqueue_mutation(&self, mutation: &Mutation) -> Result<i64> {
        let id = self.write(|inner| inner.enqueue_mutation(mutation))?;
        self.queue_changed(mutation);
        Ok(id)
    }

    fn dequeue_mutation(&self, mutation: &Mutation) -> Result<()> {
        self.write(|inner| inner.dequeue_mutation(mutation))?;
        self.queue_changed(mutation);
        Ok(())
    }

    fn update_mutation(&self, mutation: &Mutation) -> Result<()> {
        self.write(|inner| inner.update_mutation(mutation))?;
        self.queue_changed(mutation);
        Ok(())
    }

    fn list_pending_mutations(&self, entity_id: &str) -> Result<Vec<Mutation>> {
        self.inner.list_pending_mutations(entity_id)
    }

    fn list_queued_entities(&self, parent_id: &str) -> Result<Vec<String>> {
        self.inner.list_queued_entities(parent_id)
    }

    fn write_entity_and_enqueue(
        &self,
        entity: Option<&Entity>,
        mutation: &Mutation,
    ) -> Result<i64> {
        let id = self.write(|inner| inner.write_entity_and_enqueue(entity, mutation))?;
        if let Some(entity) = entity {
            self.entity_written(entity);
        }
        self.queue_changed(mutation);
        Ok(id)
    }
}
