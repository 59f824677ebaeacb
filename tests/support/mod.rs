//! Shared mocks for the integration tests: an in-memory fake of the remote
//! document store and a local store that can be told to fail.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;
use parking_lot::Mutex;
use serde_json::Value;

use field_sync::error::{RemoteError, Result, StorageError};
use field_sync::mutation::Mutation;
use field_sync::remote::{ChangeStream, RawChangeBatch, RawChangeStream, RemoteReader, RemoteWriter};
use field_sync::repository::{EntityRepository, RepositoryOptions};
use field_sync::schema::RawFields;
use field_sync::storage::{LocalStore, MemoryStore};
use field_sync::sync::{SyncConfig, SyncEngine, SyncEngineOptions};
use field_sync::types::Entity;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Build a raw document body from a JSON object literal.
pub fn doc(value: Value) -> RawFields {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}

/// Poll `check` until it holds, sleeping between attempts.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

// ============================================================================
// FakeRemote
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum WriteCall {
    Merge {
        parent_id: String,
        entity_id: String,
        updates: RawFields,
    },
    Create {
        parent_id: String,
        fields: RawFields,
    },
    Delete {
        parent_id: String,
        entity_id: String,
    },
}

impl WriteCall {
    pub fn entity_id(&self) -> Option<&str> {
        match self {
            Self::Merge { entity_id, .. } | Self::Delete { entity_id, .. } => Some(entity_id),
            Self::Create { .. } => None,
        }
    }
}

#[derive(Default)]
struct FakeRemoteInner {
    documents: HashMap<(String, String), RawFields>,
    writes: Vec<WriteCall>,
    /// Upcoming writes to reject.
    fail_next: usize,
    fail_always: bool,
    next_id: u64,
    subscribers: Vec<mpsc::UnboundedSender<RawChangeBatch>>,
    subscribe_calls: Vec<String>,
}

/// Remote document store fake: records every call, keeps documents in a map,
/// and lets tests push change batches to active subscriptions.
#[derive(Default)]
pub struct FakeRemote {
    inner: Mutex<FakeRemoteInner>,
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next(&self, n: usize) {
        self.inner.lock().fail_next = n;
    }

    pub fn fail_always(&self, on: bool) {
        self.inner.lock().fail_always = on;
    }

    pub fn writes(&self) -> Vec<WriteCall> {
        self.inner.lock().writes.clone()
    }

    pub fn document(&self, parent_id: &str, entity_id: &str) -> Option<RawFields> {
        self.inner
            .lock()
            .documents
            .get(&(parent_id.to_string(), entity_id.to_string()))
            .cloned()
    }

    pub fn put_document(&self, parent_id: &str, entity_id: &str, fields: RawFields) {
        self.inner
            .lock()
            .documents
            .insert((parent_id.to_string(), entity_id.to_string()), fields);
    }

    pub fn subscribe_calls(&self) -> Vec<String> {
        self.inner.lock().subscribe_calls.clone()
    }

    pub fn active_subscribers(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.subscribers.retain(|tx| !tx.is_closed());
        inner.subscribers.len()
    }

    /// Deliver `batch` to every live subscription.
    pub fn push_batch(&self, batch: RawChangeBatch) {
        let mut inner = self.inner.lock();
        inner
            .subscribers
            .retain(|tx| tx.unbounded_send(batch.clone()).is_ok());
    }

    /// End every live subscription stream.
    pub fn end_streams(&self) {
        self.inner.lock().subscribers.clear();
    }

    fn check_failure(inner: &mut FakeRemoteInner) -> std::result::Result<(), RemoteError> {
        if inner.fail_always {
            return Err(RemoteError::network("remote unavailable"));
        }
        if inner.fail_next > 0 {
            inner.fail_next -= 1;
            return Err(RemoteError::network("remote unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteWriter for FakeRemote {
    async fn merge_write(
        &self,
        parent_id: &str,
        entity_id: &str,
        updates: &RawFields,
    ) -> std::result::Result<(), RemoteError> {
        let mut inner = self.inner.lock();
        inner.writes.push(WriteCall::Merge {
            parent_id: parent_id.to_string(),
            entity_id: entity_id.to_string(),
            updates: updates.clone(),
        });
        Self::check_failure(&mut inner)?;
        let doc = inner
            .documents
            .entry((parent_id.to_string(), entity_id.to_string()))
            .or_default();
        for (k, v) in updates {
            doc.insert(k.clone(), v.clone());
        }
        Ok(())
    }

    async fn create_document(
        &self,
        parent_id: &str,
        fields: &RawFields,
    ) -> std::result::Result<String, RemoteError> {
        let mut inner = self.inner.lock();
        inner.writes.push(WriteCall::Create {
            parent_id: parent_id.to_string(),
            fields: fields.clone(),
        });
        Self::check_failure(&mut inner)?;
        inner.next_id += 1;
        let id = format!("srv-{}", inner.next_id);
        inner
            .documents
            .insert((parent_id.to_string(), id.clone()), fields.clone());
        Ok(id)
    }

    async fn delete_document(
        &self,
        parent_id: &str,
        entity_id: &str,
    ) -> std::result::Result<(), RemoteError> {
        let mut inner = self.inner.lock();
        inner.writes.push(WriteCall::Delete {
            parent_id: parent_id.to_string(),
            entity_id: entity_id.to_string(),
        });
        Self::check_failure(&mut inner)?;
        inner
            .documents
            .remove(&(parent_id.to_string(), entity_id.to_string()));
        Ok(())
    }
}

#[async_trait]
impl RemoteReader for FakeRemote {
    async fn fetch_document(
        &self,
        parent_id: &str,
        entity_id: &str,
    ) -> std::result::Result<RawFields, RemoteError> {
        self.document(parent_id, entity_id)
            .ok_or_else(|| RemoteError::DocumentNotFound {
                parent_id: parent_id.to_string(),
                id: entity_id.to_string(),
            })
    }
}

impl ChangeStream for FakeRemote {
    fn subscribe(&self, parent_id: &str) -> RawChangeStream {
        let (tx, rx) = mpsc::unbounded();
        let mut inner = self.inner.lock();
        inner.subscribe_calls.push(parent_id.to_string());
        inner.subscribers.push(tx);
        Box::pin(rx)
    }
}

// ============================================================================
// FailingStore
// ============================================================================

/// `MemoryStore` wrapper whose writes or reads can be switched to fail.
#[derive(Default)]
pub struct FailingStore {
    inner: MemoryStore,
    fail_writes: Mutex<bool>,
    fail_reads: Mutex<bool>,
}

impl FailingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_writes(&self, on: bool) {
        *self.fail_writes.lock() = on;
    }

    pub fn fail_reads(&self, on: bool) {
        *self.fail_reads.lock() = on;
    }

    fn check_write(&self) -> Result<()> {
        if *self.fail_writes.lock() {
            return Err(StorageError::Constraint("disk full".to_string()).into());
        }
        Ok(())
    }

    fn check_read(&self) -> Result<()> {
        if *self.fail_reads.lock() {
            return Err(StorageError::Constraint("unreadable".to_string()).into());
        }
        Ok(())
    }
}

impl LocalStore for FailingStore {
    fn get_by_id(&self, id: &str) -> Result<Option<Entity>> {
        self.check_read()?;
        self.inner.get_by_id(id)
    }

    fn get_by_parent(&self, parent_id: &str) -> Result<Vec<Entity>> {
        self.check_read()?;
        self.inner.get_by_parent(parent_id)
    }

    fn upsert(&self, entity: &Entity) -> Result<()> {
        self.check_write()?;
        self.inner.upsert(entity)
    }

    fn delete(&self, id: &str) -> Result<bool> {
        self.check_write()?;
        self.inner.delete(id)
    }

    fn enqueue_mutation(&self, mutation: &Mutation) -> Result<i64> {
        self.check_write()?;
        self.inner.enqueue_mutation(mutation)
    }

    fn dequeue_mutation(&self, mutation: &Mutation) -> Result<()> {
        self.check_write()?;
        self.inner.dequeue_mutation(mutation)
    }

    fn update_mutation(&self, mutation: &Mutation) -> Result<()> {
        self.check_write()?;
        self.inner.update_mutation(mutation)
    }

    fn list_pending_mutations(&self, entity_id: &str) -> Result<Vec<Mutation>> {
        self.check_read()?;
        self.inner.list_pending_mutations(entity_id)
    }

    fn list_queued_entities(&self, parent_id: &str) -> Result<Vec<String>> {
        self.check_read()?;
        self.inner.list_queued_entities(parent_id)
    }

    fn write_entity_and_enqueue(
        &self,
        entity: Option<&Entity>,
        mutation: &Mutation,
    ) -> Result<i64> {
        self.check_write()?;
        self.inner.write_entity_and_enqueue(entity, mutation)
    }
}

// ============================================================================
// SlowStore
// ============================================================================

/// `MemoryStore` wrapper that can hold back the next few reads: each one
/// reads the inner store, then sleeps before returning what it saw.
pub struct SlowStore {
    inner: MemoryStore,
    delay: Duration,
    slow_reads: Mutex<usize>,
}

impl SlowStore {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryStore::new(),
            delay,
            slow_reads: Mutex::new(0),
        })
    }

    pub fn slow_next(&self, reads: usize) {
        *self.slow_reads.lock() = reads;
    }

    fn pause(&self) {
        let slow = {
            let mut left = self.slow_reads.lock();
            let slow = *left > 0;
            *left = left.saturating_sub(1);
            slow
        };
        if slow {
            std::thread::sleep(self.delay);
        }
    }
}

impl LocalStore for SlowStore {
    fn get_by_id(&self, id: &str) -> Result<Option<Entity>> {
        let found = self.inner.get_by_id(id);
        self.pause();
        found
    }

    fn get_by_parent(&self, parent_id: &str) -> Result<Vec<Entity>> {
        let found = self.inner.get_by_parent(parent_id);
        self.pause();
        found
    }

    fn upsert(&self, entity: &Entity) -> Result<()> {
        self.inner.upsert(entity)
    }

    fn delete(&self, id: &str) -> Result<bool> {
        self.inner.delete(id)
    }

    fn enqueue_mutation(&self, mutation: &Mutation) -> Result<i64> {
        self.inner.enqueue_mutation(mutation)
    }

    fn dequeue_mutation(&self, mutation: &Mutation) -> Result<()> {
        self.inner.dequeue_mutation(mutation)
    }

    fn update_mutation(&self, mutation: &Mutation) -> Result<()> {
        self.inner.update_mutation(mutation)
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
        self.inner.write_entity_and_enqueue(entity, mutation)
    }
}

// ============================================================================
// Builders
// ============================================================================

pub fn fast_config() -> SyncConfig {
    SyncConfig {
        max_retries: 3,
        retry_base_delay_ms: 100,
        retry_max_delay_ms: 1000,
        resubscribe_delay_ms: 50,
        event_channel_capacity: 8,
    }
}

pub fn engine(
    parent_id: &str,
    store: Arc<dyn LocalStore>,
    remote: &Arc<FakeRemote>,
    config: SyncConfig,
) -> Arc<SyncEngine> {
    Arc::new(SyncEngine::new(SyncEngineOptions {
        parent_id: parent_id.to_string(),
        store,
        writer: remote.clone(),
        stream: remote.clone(),
        schema: None,
        config: Some(config),
        on_error: None,
    }))
}

pub fn repository(store: Arc<dyn LocalStore>, remote: &Arc<FakeRemote>) -> EntityRepository {
    EntityRepository::new(RepositoryOptions {
        store,
        writer: remote.clone(),
        reader: remote.clone(),
        stream: remote.clone(),
        schemas: HashMap::new(),
        config: Some(fast_config()),
        on_error: None,
    })
}
