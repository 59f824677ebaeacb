//! EntityRepository: the façade the UI talks to.
//!
//! Reads are live views over the local store. Writes go through
//! [`EntityRepository::apply_and_enqueue`], which commits the optimistic
//! snapshot and the queued mutation as one unit and then nudges the sync
//! engine of the active parent collection.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, info, warn};

use crate::error::{DocumentError, FieldSyncError, RemoteError, Result, SyncError};
use crate::mutation::{Mutation, MutationKind, SyncStatus};
use crate::reactive::{live_view, LiveView, ObservableStore, StoreEvent};
use crate::remote::{ChangeStream, RemoteReader, RemoteWriter};
use crate::schema::{decode_document, encode_document, FieldSchema};
use crate::storage::LocalStore;
use crate::sync::{
    ChangeEvent, DrainResult, EntitySyncStatus, EventKind, EventSource, SyncConfig, SyncEngine,
    SyncEngineOptions, SyncErrorCallback,
};
use crate::types::{AuditInfo, Entity, FieldMap};

/// The local store as seen by the repository and its engines.
pub type SharedStore = ObservableStore<Arc<dyn LocalStore>>;

/// Collaborators and settings for an [`EntityRepository`].
pub struct RepositoryOptions {
    pub store: Arc<dyn LocalStore>,
    pub writer: Arc<dyn RemoteWriter>,
    pub reader: Arc<dyn RemoteReader>,
    pub stream: Arc<dyn ChangeStream>,
    /// Declared field kinds per parent collection (default: none)
    pub schemas: HashMap<String, FieldSchema>,
    /// Engine tunables (default: `SyncConfig::default()`)
    pub config: Option<SyncConfig>,
    /// Passed through to every engine
    pub on_error: Option<Arc<SyncErrorCallback>>,
}

pub struct EntityRepository {
    store: Arc<SharedStore>,
    writer: Arc<dyn RemoteWriter>,
    reader: Arc<dyn RemoteReader>,
    stream: Arc<dyn ChangeStream>,
    schemas: HashMap<String, FieldSchema>,
    config: SyncConfig,
    on_error: Option<Arc<SyncErrorCallback>>,
    engine: Mutex<Option<Arc<SyncEngine>>>,
    /// Serializes activate / deactivate
    activation: TokioMutex<()>,
}

impl EntityRepository {
    pub fn new(options: RepositoryOptions) -> Self {
        Self {
            store: Arc::new(ObservableStore::new(options.store)),
            writer: options.writer,
            reader: options.reader,
            stream: options.stream,
            schemas: options.schemas,
            config: options.config.unwrap_or_default(),
            on_error: options.on_error,
            engine: Mutex::new(None),
            activation: TokioMutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<SharedStore> {
        &self.store
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    fn schema_for(&self, parent_id: &str) -> FieldSchema {
        self.schemas.get(parent_id).cloned().unwrap_or_default()
    }

    // -----------------------------------------------------------------------
    // Parent activation
    // -----------------------------------------------------------------------

    /// Make `parent_id` the active collection: stop the previous engine,
    /// start one for `parent_id` and drain its queue. Activating the parent
    /// that is already active does nothing.
    pub async fn activate(&self, parent_id: &str) -> Result<Vec<DrainResult>> {
        let _guard = self.activation.lock().await;

        if let Some(current) = self.engine.lock().as_ref() {
            if current.parent_id() == parent_id && !current.is_stopped() {
                return Ok(Vec::new());
            }
        }
        if let Some(previous) = self.engine.lock().take() {
            previous.stop();
        }

        let store: Arc<dyn LocalStore> = self.store.clone();
        let engine = Arc::new(SyncEngine::new(SyncEngineOptions {
            parent_id: parent_id.to_string(),
            store,
            writer: Arc::clone(&self.writer),
            stream: Arc::clone(&self.stream),
            schema: Some(self.schema_for(parent_id)),
            config: Some(self.config.clone()),
            on_error: self.on_error.clone(),
        }));
        *self.engine.lock() = Some(Arc::clone(&engine));

        info!(parent_id, "Activating parent collection");
        let results = engine.start().await?;
        Ok(results)
    }

    /// Stop the active engine, if any.
    pub async fn deactivate(&self) {
        let _guard = self.activation.lock().await;
        if let Some(engine) = self.engine.lock().take() {
            engine.stop();
        }
    }

    pub fn active_parent(&self) -> Option<String> {
        self.engine.lock().as_ref().map(|e| e.parent_id().to_string())
    }

    pub fn engine(&self) -> Option<Arc<SyncEngine>> {
        self.engine.lock().clone()
    }

    fn active_engine(&self) -> Result<Arc<SyncEngine>> {
        self.engine
            .lock()
            .clone()
            .ok_or(FieldSyncError::Sync(SyncError::NoActiveParent))
    }

    // -----------------------------------------------------------------------
    // Write path
    // -----------------------------------------------------------------------

    /// Commit the optimistic snapshot and queue `mutation` atomically, then
    /// ask the active engine to drain the entity. Returns the mutation as
    /// queued (with its assigned id).
    ///
    /// Local failures are returned; nothing is queued when the local commit
    /// fails.
    pub fn apply_and_enqueue(&self, mut mutation: Mutation) -> Result<Mutation> {
        mutation.validate()?;
        mutation.status = SyncStatus::Pending;
        mutation.retry_count = 0;
        mutation.last_error = None;

        // Read, apply and write with no other writer interleaved.
        let id = self.store.exclusive(|store| {
            let base = store.get_by_id(&mutation.entity_id)?;
            if let Some(existing) = &base {
                if existing.parent_id != mutation.parent_id {
                    return Err(FieldSyncError::InvalidMutation(format!(
                        "entity {} belongs to \"{}\", not \"{}\"",
                        mutation.entity_id, existing.parent_id, mutation.parent_id
                    )));
                }
            }
            let snapshot = mutation.apply_to(base.as_ref())?;
            store.write_entity_and_enqueue(snapshot.as_ref(), &mutation)
        })?;

        let mut queued = mutation;
        queued.id = id;
        debug!(
            entity_id = %queued.entity_id,
            mutation_id = id,
            kind = queued.kind.as_str(),
            "Mutation queued"
        );

        if let Some(engine) = self.engine() {
            if engine.parent_id() == queued.parent_id {
                engine.request_drain(&queued.entity_id);
            }
        }
        Ok(queued)
    }

    /// Create a document with a server-assigned id and store the resulting
    /// snapshot locally. Requires connectivity; nothing is queued.
    pub async fn create_remote(
        &self,
        parent_id: &str,
        fields: FieldMap,
        author: &str,
    ) -> Result<Entity> {
        let audit = AuditInfo::new(author, Utc::now());
        let mut entity = Entity {
            id: String::new(),
            parent_id: parent_id.to_string(),
            fields,
            created: audit.clone(),
            last_modified: audit,
        };

        let id = self
            .writer
            .create_document(parent_id, &encode_document(&entity))
            .await?;
        if id.is_empty() {
            return Err(DocumentError::MissingId.into());
        }

        entity.id = id;
        self.store.upsert(&entity)?;
        Ok(entity)
    }

    // -----------------------------------------------------------------------
    // Read path
    // -----------------------------------------------------------------------

    pub fn get_entity(&self, id: &str) -> Result<Option<Entity>> {
        self.store.get_by_id(id)
    }

    pub fn get_by_parent(&self, parent_id: &str) -> Result<Vec<Entity>> {
        self.store.get_by_parent(parent_id)
    }

    /// Live list of the entities under `parent_id`.
    pub fn observe_parent(&self, parent_id: &str) -> LiveView<Vec<Entity>> {
        let load_id = parent_id.to_string();
        let filter_id = parent_id.to_string();
        live_view(
            &self.store,
            move |store| store.get_by_parent(&load_id),
            move |event: &StoreEvent| event.touches_snapshot() && event.parent_id() == filter_id,
        )
    }

    /// Live snapshot of one entity (`None` while absent).
    pub fn observe_entity(&self, id: &str) -> LiveView<Option<Entity>> {
        let load_id = id.to_string();
        let filter_id = id.to_string();
        live_view(
            &self.store,
            move |store| store.get_by_id(&load_id),
            move |event: &StoreEvent| event.touches_snapshot() && event.entity_id() == filter_id,
        )
    }

    // -----------------------------------------------------------------------
    // Sync status
    // -----------------------------------------------------------------------

    pub fn get_sync_status(&self, entity_id: &str) -> Result<EntitySyncStatus> {
        let queue = self.store.list_pending_mutations(entity_id)?;
        Ok(EntitySyncStatus::from_queue(&queue, self.config.max_retries))
    }

    pub fn observe_sync_status(&self, entity_id: &str) -> LiveView<EntitySyncStatus> {
        let load_id = entity_id.to_string();
        let filter_id = entity_id.to_string();
        let max_retries = self.config.max_retries;
        live_view(
            &self.store,
            move |store| {
                let queue = store.list_pending_mutations(&load_id)?;
                Ok(EntitySyncStatus::from_queue(&queue, max_retries))
            },
            move |event: &StoreEvent| {
                matches!(event, StoreEvent::QueueChanged { .. }) && event.entity_id() == filter_id
            },
        )
    }

    /// Queued mutations not yet acknowledged, in enqueue order.
    pub fn pending_mutations(&self, entity_id: &str) -> Result<Vec<Mutation>> {
        Ok(self
            .store
            .list_pending_mutations(entity_id)?
            .into_iter()
            .filter(|m| m.status != SyncStatus::Completed)
            .collect())
    }

    // -----------------------------------------------------------------------
    // Recovery
    // -----------------------------------------------------------------------

    /// Retry a failed entity now, with a fresh retry budget.
    pub async fn retry(&self, entity_id: &str) -> Result<DrainResult> {
        let engine = self.active_engine()?;
        Ok(engine.retry(entity_id).await)
    }

    /// Drop failed mutations of `entity_id`. The optimistic snapshot is left
    /// as is until the next remote change for the entity.
    pub async fn discard_failed(&self, entity_id: &str) -> Result<usize> {
        let engine = self.active_engine()?;
        engine.discard_failed(entity_id).await
    }

    /// Re-read one document from the remote and merge it as a confirmed
    /// modification. `Ok(None)` when the remote has no such document or the
    /// document cannot be decoded; the local snapshot is left untouched.
    pub async fn refresh_entity(&self, parent_id: &str, entity_id: &str) -> Result<Option<Entity>> {
        let raw = match self.reader.fetch_document(parent_id, entity_id).await {
            Ok(raw) => raw,
            Err(RemoteError::DocumentNotFound { .. }) => {
                debug!(parent_id, entity_id, "Remote document not found");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let schema = self.schema_for(parent_id);
        let entity = match decode_document(parent_id, entity_id, &raw, &schema) {
            Ok(entity) => entity,
            Err(error) => {
                warn!(parent_id, entity_id, %error, "Ignoring undecodable remote document");
                return Ok(None);
            }
        };
        let event = ChangeEvent {
            entity_id: entity_id.to_string(),
            kind: EventKind::Modified,
            source: EventSource::RemoteConfirmed,
            payload: Some(entity.clone()),
        };

        match self.engine() {
            Some(engine) if engine.parent_id() == parent_id => {
                let merged = engine.apply_remote_events(&[event]);
                if let Some(err) = merged.errors.into_iter().next() {
                    return Err(FieldSyncError::Internal(err.error));
                }
            }
            _ => self.store.upsert(&entity)?,
        }
        Ok(Some(entity))
    }

    /// Queue an entity delete. Shorthand for a `Delete` mutation.
    pub fn delete_entity(
        &self,
        parent_id: &str,
        entity_id: &str,
        author: &str,
    ) -> Result<Mutation> {
        self.apply_and_enqueue(Mutation::delete(entity_id, parent_id, author))
    }

    /// Whether an entity delete is queued and not yet acknowledged.
    pub fn is_pending_delete(&self, entity_id: &str) -> Result<bool> {
        Ok(self
            .pending_mutations(entity_id)?
            .iter()
            .any(|m| m.kind == MutationKind::Delete))
    }
}

impl Drop for EntityRepository {
    fn drop(&mut self) {
        if let Some(engine) = self.engine.get_mut().take() {
            engine.stop();
        }
    }
}
