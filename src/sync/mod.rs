//! Sync layer: change classification, queue drain, remote merge and retry.
//!
//! - [`classifier`]: [`ChangeClassifier`], raw notifications → [`ChangeEvent`]s.
//! - [`engine`]: [`SyncEngine`], one per active parent collection.
//! - [`retry`]: [`RetryScheduler`], per-entity backoff timers.
//! - [`types`]: events, config, results and engine options.

pub mod classifier;
pub mod engine;
pub mod retry;
pub mod types;

pub use classifier::ChangeClassifier;
pub use engine::SyncEngine;
pub use retry::RetryScheduler;
pub use types::{
    ChangeEvent, DrainResult, EntitySyncStatus, EventKind, EventSource, MergeResult, SyncConfig,
    SyncEngineOptions, SyncErrorCallback, SyncErrorEvent, SyncPhase,
};
