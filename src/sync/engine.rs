//! SyncEngine: queue drain and remote-change merge for one parent collection.
//!
//! Public drain and merge methods never return `Err`. Failures are recorded
//! on the mutation itself and collected in [`DrainResult`] / [`MergeResult`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::join_all;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{FieldSyncError, RemoteError, Result, SyncError};
use crate::mutation::{Mutation, MutationKind, SyncStatus};
use crate::remote::{ChangeStream, RemoteWriter};
use crate::storage::LocalStore;

use super::classifier::ChangeClassifier;
use super::retry::RetryScheduler;
use super::types::*;

/// How to treat a `Failed` head mutation before draining.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Revive {
    /// Leave it; the drain stops there.
    No,
    /// Timer-driven retry: back to `Pending` if retries remain.
    Scheduled,
    /// Caller-requested retry: back to `Pending` with a fresh budget.
    Manual,
}

// ============================================================================
// SyncEngine
// ============================================================================

pub struct SyncEngine {
    parent_id: String,
    store: Arc<dyn LocalStore>,
    writer: Arc<dyn RemoteWriter>,
    stream: Arc<dyn ChangeStream>,
    classifier: ChangeClassifier,
    config: SyncConfig,
    on_error: Option<Arc<SyncErrorCallback>>,
    /// Per-entity async locks serializing drains
    entity_locks: Mutex<HashMap<String, Arc<TokioMutex<()>>>>,
    /// Ingest, merge and retry-worker tasks
    tasks: Mutex<Vec<JoinHandle<()>>>,
    runtime: Mutex<Option<Handle>>,
    retries: RetryScheduler,
    retry_tx: mpsc::UnboundedSender<String>,
    retry_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    running: AtomicBool,
    stopped: AtomicBool,
}

impl SyncEngine {
    pub fn new(options: SyncEngineOptions) -> Self {
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        let schema = options.schema.unwrap_or_default();
        Self {
            classifier: ChangeClassifier::new(options.parent_id.clone(), schema),
            parent_id: options.parent_id,
            store: options.store,
            writer: options.writer,
            stream: options.stream,
            config: options.config.unwrap_or_default(),
            on_error: options.on_error,
            entity_locks: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            runtime: Mutex::new(None),
            retries: RetryScheduler::new(),
            retry_tx,
            retry_rx: Mutex::new(Some(retry_rx)),
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn parent_id(&self) -> &str {
        &self.parent_id
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn classifier(&self) -> &ChangeClassifier {
        &self.classifier
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Entities with a backoff timer pending.
    pub fn pending_retries(&self) -> usize {
        self.retries.pending()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Subscribe to the remote collection, start the merge and retry
    /// workers, then drain every queued entity of the parent.
    ///
    /// Mutations left `InProgress` by an interrupted session are returned to
    /// `Pending` first, and `Failed` heads with retries left are resumed, so
    /// a `Retrying` entity is retried on activation. An engine can be
    /// started once.
    pub async fn start(self: &Arc<Self>) -> std::result::Result<Vec<DrainResult>, SyncError> {
        if self.is_stopped() {
            return Err(SyncError::Stopped(self.parent_id.clone()));
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SyncError::AlreadyRunning(self.parent_id.clone()));
        }

        let runtime = Handle::current();
        *self.runtime.lock() = Some(runtime.clone());

        self.recover_stale();

        let (tx, rx) = mpsc::channel(self.config.event_channel_capacity.max(1));
        let ingest = runtime.spawn(run_ingest(
            Arc::clone(&self.stream),
            self.classifier.clone(),
            tx,
            self.config.resubscribe_delay(),
        ));
        let merge = runtime.spawn(run_merge(Arc::downgrade(self), rx));

        let mut tasks = vec![ingest, merge];
        if let Some(mut retry_rx) = self.retry_rx.lock().take() {
            let weak = Arc::downgrade(self);
            tasks.push(runtime.spawn(async move {
                while let Some(entity_id) = retry_rx.recv().await {
                    let Some(engine) = weak.upgrade() else { break };
                    tokio::spawn(async move {
                        engine.drain_with(&entity_id, Revive::Scheduled).await;
                    });
                }
            }));
        }
        self.tasks.lock().extend(tasks);

        info!(parent_id = %self.parent_id, "Sync engine started");
        Ok(self.drain_all_with(Revive::Scheduled).await)
    }

    /// Cancel the subscription and every pending retry. In-flight remote
    /// writes run to completion; nothing new is sent afterwards.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.running.store(false, Ordering::SeqCst);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.retries.dispose();
        self.entity_locks.lock().clear();
        info!(parent_id = %self.parent_id, "Sync engine stopped");
    }

    fn recover_stale(&self) {
        let entity_ids = match self.store.list_queued_entities(&self.parent_id) {
            Ok(ids) => ids,
            Err(e) => {
                self.make_error(SyncPhase::Recover, None, &e.to_string());
                return;
            }
        };
        for entity_id in entity_ids {
            let queue = match self.store.list_pending_mutations(&entity_id) {
                Ok(q) => q,
                Err(e) => {
                    self.make_error(SyncPhase::Recover, Some(&entity_id), &e.to_string());
                    continue;
                }
            };
            for mut mutation in queue {
                if mutation.status != SyncStatus::InProgress {
                    continue;
                }
                mutation.status = SyncStatus::Pending;
                match self.store.update_mutation(&mutation) {
                    Ok(()) => debug!(
                        entity_id = %entity_id,
                        mutation_id = mutation.id,
                        "Reset interrupted mutation to pending"
                    ),
                    Err(e) => {
                        self.make_error(SyncPhase::Recover, Some(&entity_id), &e.to_string());
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Drain (local → remote)
    // -----------------------------------------------------------------------

    /// Send `entity_id`'s queued mutations in order until the queue is empty
    /// or a write fails.
    pub async fn drain_entity(self: &Arc<Self>, entity_id: &str) -> DrainResult {
        self.drain_with(entity_id, Revive::No).await
    }

    /// Drain every entity of the parent that has queued mutations,
    /// concurrently across entities.
    pub async fn drain_all(self: &Arc<Self>) -> Vec<DrainResult> {
        self.drain_all_with(Revive::No).await
    }

    async fn drain_all_with(self: &Arc<Self>, revive: Revive) -> Vec<DrainResult> {
        let entity_ids = match self.store.list_queued_entities(&self.parent_id) {
            Ok(ids) => ids,
            Err(e) => {
                let mut result = DrainResult::new("");
                result
                    .errors
                    .push(self.make_error(SyncPhase::Drain, None, &e.to_string()));
                return vec![result];
            }
        };
        join_all(entity_ids.iter().map(|id| self.drain_with(id, revive))).await
    }

    /// Fire-and-forget drain, used after local writes. Returns whether a
    /// drain was started.
    pub fn request_drain(self: &Arc<Self>, entity_id: &str) -> bool {
        if !self.is_running() {
            return false;
        }
        let Some(runtime) = self.runtime_handle() else {
            return false;
        };
        let engine = Arc::clone(self);
        let entity_id = entity_id.to_string();
        runtime.spawn(async move {
            engine.drain_entity(&entity_id).await;
        });
        true
    }

    /// Return a `Failed` head mutation to `Pending` with a fresh retry
    /// budget and drain.
    pub async fn retry(self: &Arc<Self>, entity_id: &str) -> DrainResult {
        self.retries.cancel(entity_id);
        self.drain_with(entity_id, Revive::Manual).await
    }

    /// Drop every `Failed` mutation of `entity_id` from the queue and drain
    /// whatever was queued behind them. Returns how many were dropped.
    pub async fn discard_failed(self: &Arc<Self>, entity_id: &str) -> Result<usize> {
        let removed = self
            .with_lock(entity_id, async {
                let queue = self.store.list_pending_mutations(entity_id)?;
                let mut removed = 0;
                for mutation in queue.iter().filter(|m| m.status == SyncStatus::Failed) {
                    self.store.dequeue_mutation(mutation)?;
                    removed += 1;
                }
                Ok::<usize, FieldSyncError>(removed)
            })
            .await?;

        if removed > 0 {
            self.retries.cancel(entity_id);
            warn!(entity_id, removed, "Discarded failed mutations");
            self.request_drain(entity_id);
        }
        Ok(removed)
    }

    pub fn sync_status(&self, entity_id: &str) -> Result<EntitySyncStatus> {
        let queue = self.store.list_pending_mutations(entity_id)?;
        Ok(EntitySyncStatus::from_queue(&queue, self.config.max_retries))
    }

    async fn drain_with(self: &Arc<Self>, entity_id: &str, revive: Revive) -> DrainResult {
        let mut result = DrainResult::new(entity_id);
        if self.is_stopped() {
            let message = SyncError::Stopped(self.parent_id.clone()).to_string();
            result
                .errors
                .push(self.make_error(SyncPhase::Drain, Some(entity_id), &message));
            return result;
        }

        self.with_lock(entity_id, async {
            if revive != Revive::No {
                self.revive_head(entity_id, revive, &mut result);
            }
            self.drain_locked(entity_id, &mut result).await;
        })
        .await;

        result
    }

    fn revive_head(&self, entity_id: &str, revive: Revive, result: &mut DrainResult) {
        let queue = match self.store.list_pending_mutations(entity_id) {
            Ok(q) => q,
            Err(e) => {
                result
                    .errors
                    .push(self.make_error(SyncPhase::Drain, Some(entity_id), &e.to_string()));
                return;
            }
        };
        let Some(mut head) = queue
            .into_iter()
            .find(|m| m.status != SyncStatus::Completed)
        else {
            return;
        };
        if head.status != SyncStatus::Failed {
            return;
        }
        match revive {
            Revive::Manual => head.retry_count = 0,
            Revive::Scheduled if head.retry_count >= self.config.max_retries => return,
            _ => {}
        }
        head.status = SyncStatus::Pending;
        match self.store.update_mutation(&head) {
            Ok(()) => debug!(
                entity_id,
                mutation_id = head.id,
                retry_count = head.retry_count,
                "Failed mutation returned to pending"
            ),
            Err(e) => result
                .errors
                .push(self.make_error(SyncPhase::Drain, Some(entity_id), &e.to_string())),
        }
    }

    /// The drain loop. Caller holds the entity lock.
    async fn drain_locked(self: &Arc<Self>, entity_id: &str, result: &mut DrainResult) {
        loop {
            if self.is_stopped() {
                break;
            }

            let queue = match self.store.list_pending_mutations(entity_id) {
                Ok(q) => q,
                Err(e) => {
                    result
                        .errors
                        .push(self.make_error(SyncPhase::Drain, Some(entity_id), &e.to_string()));
                    break;
                }
            };
            let Some(mut head) = queue.into_iter().next() else {
                break;
            };

            if head.parent_id != self.parent_id {
                let message = SyncError::ParentMismatch {
                    mutation: head.parent_id.clone(),
                    engine: self.parent_id.clone(),
                }
                .to_string();
                result
                    .errors
                    .push(self.make_error(SyncPhase::Drain, Some(entity_id), &message));
                break;
            }

            match head.status {
                SyncStatus::Failed => {
                    result.blocked = true;
                    break;
                }
                SyncStatus::Completed => {
                    // Acknowledged but never removed; finish the job.
                    if let Err(e) = self.store.dequeue_mutation(&head) {
                        result.errors.push(self.make_error(
                            SyncPhase::Drain,
                            Some(entity_id),
                            &e.to_string(),
                        ));
                        break;
                    }
                    continue;
                }
                SyncStatus::Pending | SyncStatus::InProgress => {}
            }

            head.status = SyncStatus::InProgress;
            if let Err(e) = self.store.update_mutation(&head) {
                result
                    .errors
                    .push(self.make_error(SyncPhase::Drain, Some(entity_id), &e.to_string()));
                break;
            }

            match self.send(&head).await {
                Ok(()) => {
                    if let Err(e) = self.complete(&head) {
                        result.errors.push(self.make_error(
                            SyncPhase::Drain,
                            Some(entity_id),
                            &e.to_string(),
                        ));
                        break;
                    }
                    debug!(
                        entity_id,
                        mutation_id = head.id,
                        kind = head.kind.as_str(),
                        "Mutation acknowledged"
                    );
                    result.completed.push(head.id);
                }
                Err(remote_err) => {
                    self.fail(&mut head, &remote_err, result);
                    break;
                }
            }
        }
    }

    async fn send(&self, mutation: &Mutation) -> std::result::Result<(), RemoteError> {
        match mutation.kind {
            MutationKind::Delete => {
                self.writer
                    .delete_document(&mutation.parent_id, &mutation.entity_id)
                    .await
            }
            MutationKind::Create | MutationKind::Update => {
                self.writer
                    .merge_write(
                        &mutation.parent_id,
                        &mutation.entity_id,
                        &mutation.to_wire_updates(),
                    )
                    .await
            }
        }
    }

    fn complete(&self, mutation: &Mutation) -> Result<()> {
        let mut done = mutation.clone();
        done.status = SyncStatus::Completed;
        done.last_error = None;
        self.store.update_mutation(&done)?;
        self.store.dequeue_mutation(&done)?;
        if done.kind == MutationKind::Delete {
            self.store.delete(&done.entity_id)?;
        }
        Ok(())
    }

    fn fail(self: &Arc<Self>, head: &mut Mutation, error: &RemoteError, result: &mut DrainResult) {
        let entity_id = head.entity_id.clone();
        head.status = SyncStatus::Failed;
        head.retry_count += 1;
        head.last_error = Some(error.to_string());
        result.failed = Some(head.id);

        if let Err(e) = self.store.update_mutation(head) {
            result
                .errors
                .push(self.make_error(SyncPhase::Drain, Some(&entity_id), &e.to_string()));
        }
        result
            .errors
            .push(self.make_error(SyncPhase::Drain, Some(&entity_id), &error.to_string()));

        if head.retry_count < self.config.max_retries {
            let delay = self.config.backoff(head.retry_count);
            warn!(
                entity_id = %entity_id,
                mutation_id = head.id,
                retry_count = head.retry_count,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Remote write failed; retry scheduled"
            );
            self.schedule_retry(&entity_id, delay);
        } else {
            result.exhausted = true;
            warn!(
                entity_id = %entity_id,
                mutation_id = head.id,
                retry_count = head.retry_count,
                error = %error,
                "Remote write failed; retries exhausted"
            );
        }
    }

    fn schedule_retry(&self, entity_id: &str, delay: Duration) {
        let Some(runtime) = self.runtime_handle() else {
            return;
        };
        let tx = self.retry_tx.clone();
        let key = entity_id.to_string();
        self.retries.schedule(&runtime, entity_id, delay, move || {
            Box::pin(async move {
                let _ = tx.send(key);
            })
        });
    }

    // -----------------------------------------------------------------------
    // Merge (remote → local)
    // -----------------------------------------------------------------------

    /// Apply classified events to the local store: `Removed` deletes the
    /// snapshot, `Added` / `Modified` overwrite it unconditionally.
    ///
    /// Queued mutations are left alone; they are still sent and their echo
    /// arrives as a later event.
    pub fn apply_remote_events(&self, events: &[ChangeEvent]) -> MergeResult {
        let mut result = MergeResult::default();
        for event in events {
            let entity_id = event.entity_id.as_str();
            match event.kind {
                EventKind::Invalid => {
                    warn!(entity_id, "Skipping invalid change event");
                    result.skipped += 1;
                }
                EventKind::Removed => match self.store.delete(entity_id) {
                    Ok(true) => result.removed += 1,
                    Ok(false) => {}
                    Err(e) => result
                        .errors
                        .push(self.make_error(SyncPhase::Merge, Some(entity_id), &e.to_string())),
                },
                EventKind::Added | EventKind::Modified => {
                    let Some(entity) = &event.payload else {
                        result.errors.push(self.make_error(
                            SyncPhase::Merge,
                            Some(entity_id),
                            "change event carries no payload",
                        ));
                        continue;
                    };
                    if entity.parent_id != self.parent_id {
                        let message = SyncError::ParentMismatch {
                            mutation: entity.parent_id.clone(),
                            engine: self.parent_id.clone(),
                        }
                        .to_string();
                        result
                            .errors
                            .push(self.make_error(SyncPhase::Merge, Some(entity_id), &message));
                        continue;
                    }
                    match self.store.upsert(entity) {
                        Ok(()) => result.written += 1,
                        Err(e) => result.errors.push(self.make_error(
                            SyncPhase::Merge,
                            Some(entity_id),
                            &e.to_string(),
                        )),
                    }
                }
            }
        }
        if result.written + result.removed > 0 {
            debug!(
                parent_id = %self.parent_id,
                written = result.written,
                removed = result.removed,
                "Merged remote changes"
            );
        }
        result
    }

    // -----------------------------------------------------------------------
    // Internal
    // -----------------------------------------------------------------------

    fn runtime_handle(&self) -> Option<Handle> {
        self.runtime
            .lock()
            .clone()
            .or_else(|| Handle::try_current().ok())
    }

    async fn with_lock<F: std::future::Future>(&self, entity_id: &str, f: F) -> F::Output {
        let lock = {
            let mut locks = self.entity_locks.lock();
            locks
                .entry(entity_id.to_string())
                .or_insert_with(|| Arc::new(TokioMutex::new(())))
                .clone()
        };
        let _guard = lock.lock().await;
        f.await
    }

    fn make_error(&self, phase: SyncPhase, entity_id: Option<&str>, error: &str) -> SyncErrorEvent {
        let event = SyncErrorEvent {
            phase,
            parent_id: self.parent_id.clone(),
            entity_id: entity_id.map(|s| s.to_string()),
            error: error.to_string(),
        };
        if let Some(ref on_error) = self.on_error {
            let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                on_error(&event);
            }));
        }
        event
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
        self.retries.dispose();
    }
}

// ============================================================================
// Pipeline tasks
// ============================================================================

/// Subscribe, classify, forward. Re-subscribes after `resubscribe_delay`
/// whenever the remote stream ends; exits once the merge side is gone.
async fn run_ingest(
    stream: Arc<dyn ChangeStream>,
    classifier: ChangeClassifier,
    tx: mpsc::Sender<Vec<ChangeEvent>>,
    resubscribe_delay: Duration,
) {
    loop {
        let mut changes = stream.subscribe(classifier.parent_id());
        while let Some(batch) = changes.next().await {
            let events = classifier.accept(&batch);
            if events.is_empty() {
                continue;
            }
            if tx.send(events).await.is_err() {
                return;
            }
        }
        if tx.is_closed() {
            return;
        }
        warn!(
            parent_id = %classifier.parent_id(),
            delay_ms = resubscribe_delay.as_millis() as u64,
            "Change stream ended; resubscribing"
        );
        tokio::time::sleep(resubscribe_delay).await;
    }
}

async fn run_merge(engine: Weak<SyncEngine>, mut rx: mpsc::Receiver<Vec<ChangeEvent>>) {
    while let Some(events) = rx.recv().await {
        let Some(engine) = engine.upgrade() else {
            break;
        };
        engine.apply_remote_events(&events);
    }
}
