//! Sync-specific types: change events, engine configuration and the
//! result structs returned by drains and merges.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::mutation::{Mutation, SyncStatus};
use crate::remote::{ChangeStream, RemoteWriter};
use crate::schema::FieldSchema;
use crate::storage::LocalStore;
use crate::types::Entity;

// ============================================================================
// Change events
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Added,
    Modified,
    Removed,
    /// The notification could not be turned into an entity. Never merged.
    Invalid,
}

/// Where the state carried by an event currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventSource {
    /// The remote snapshot still includes unacknowledged local writes.
    LocalPending,
    RemoteConfirmed,
}

/// A classified remote notification, ready for merge.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub entity_id: String,
    pub kind: EventKind,
    pub source: EventSource,
    /// Present for `Added` and `Modified` only.
    pub payload: Option<Entity>,
}

impl ChangeEvent {
    pub fn is_invalid(&self) -> bool {
        self.kind == EventKind::Invalid
    }
}

// ============================================================================
// Per-entity sync status
// ============================================================================

/// What the UI shows for one entity's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntitySyncStatus {
    /// Nothing queued.
    Synced,
    Pending,
    InProgress,
    /// The head mutation failed and has retries left: a running engine
    /// retries it after backoff, otherwise the next activation of its
    /// parent does.
    Retrying,
    /// The head mutation failed and has used up its retries.
    Exhausted,
}

impl EntitySyncStatus {
    /// Derive the status from an entity's queue (enqueue order).
    pub fn from_queue(queue: &[Mutation], max_retries: u32) -> Self {
        let mut open = queue.iter().filter(|m| m.status != SyncStatus::Completed);
        let Some(head) = open.next() else {
            return Self::Synced;
        };
        if head.status == SyncStatus::Failed {
            return if head.retry_count >= max_retries {
                Self::Exhausted
            } else {
                Self::Retrying
            };
        }
        if head.status == SyncStatus::InProgress
            || open.any(|m| m.status == SyncStatus::InProgress)
        {
            Self::InProgress
        } else {
            Self::Pending
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Tunables for the sync engine. Every field has a default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Failed attempts after which a mutation stops being retried automatically.
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Pause before re-subscribing when the change stream ends.
    pub resubscribe_delay_ms: u64,
    /// Buffered classified batches between ingestion and merge.
    pub event_channel_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_base_delay_ms: 1000,
            retry_max_delay_ms: 60_000,
            resubscribe_delay_ms: 2000,
            event_channel_capacity: 64,
        }
    }
}

impl SyncConfig {
    /// Delay before retry number `retry_count` (1-based):
    /// `base * 2^(retry_count - 1)`, capped at the maximum.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let exp = retry_count.saturating_sub(1).min(32);
        let ms = self
            .retry_base_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.retry_max_delay_ms);
        Duration::from_millis(ms)
    }

    pub fn resubscribe_delay(&self) -> Duration {
        Duration::from_millis(self.resubscribe_delay_ms)
    }
}

// ============================================================================
// Results
// ============================================================================

/// Which stage of the engine an error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Drain,
    Merge,
    Recover,
}

/// An engine error: collected in results, never thrown.
#[derive(Debug, Clone)]
pub struct SyncErrorEvent {
    pub phase: SyncPhase,
    pub parent_id: String,
    pub entity_id: Option<String>,
    pub error: String,
}

/// Outcome of draining one entity's queue.
#[derive(Debug, Clone, Default)]
pub struct DrainResult {
    pub entity_id: String,
    /// Ids of mutations acknowledged and removed, in order.
    pub completed: Vec<i64>,
    /// Id of the mutation whose remote write failed on this pass.
    pub failed: Option<i64>,
    /// The failed mutation has no automatic retries left.
    pub exhausted: bool,
    /// The drain stopped at a mutation already in `Failed` state.
    pub blocked: bool,
    pub errors: Vec<SyncErrorEvent>,
}

impl DrainResult {
    pub fn new(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            ..Self::default()
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_none() && !self.blocked && self.errors.is_empty()
    }
}

/// Outcome of merging a batch of change events into the local store.
#[derive(Debug, Clone, Default)]
pub struct MergeResult {
    /// Snapshots written by `Added` / `Modified` events.
    pub written: usize,
    /// Snapshots removed by `Removed` events.
    pub removed: usize,
    /// `Invalid` events that reached the merge and were dropped.
    pub skipped: usize,
    pub errors: Vec<SyncErrorEvent>,
}

// ============================================================================
// SyncEngine options
// ============================================================================

/// Callback type for engine error events.
pub type SyncErrorCallback = dyn Fn(&SyncErrorEvent) + Send + Sync;

/// Collaborators and settings for a [`super::SyncEngine`].
pub struct SyncEngineOptions {
    /// The parent collection this engine serves.
    pub parent_id: String,
    pub store: Arc<dyn LocalStore>,
    pub writer: Arc<dyn RemoteWriter>,
    pub stream: Arc<dyn ChangeStream>,
    /// Declared field kinds (default: empty, decode by wire shape).
    pub schema: Option<FieldSchema>,
    /// Engine tunables (default: `SyncConfig::default()`).
    pub config: Option<SyncConfig>,
    /// Called for each collected error
    pub on_error: Option<Arc<SyncErrorCallback>>,
}
