//! Loadable read models backed by `tokio::sync::watch`.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::{FieldSyncError, Result};
use crate::storage::LocalStore;

use super::event::StoreEvent;
use super::store::{ObservableStore, Unsubscribe};

// ============================================================================
// Loadable
// ============================================================================

/// Loading lifecycle of a read model.
#[derive(Debug, Clone)]
pub enum Loadable<T> {
    NotLoaded,
    Loading,
    Loaded(T),
    Failed(Arc<FieldSyncError>),
}

impl<T> Loadable<T> {
    pub fn from_result(result: Result<T>) -> Self {
        match result {
            Ok(value) => Self::Loaded(value),
            Err(e) => Self::Failed(Arc::new(e)),
        }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self, Self::Loaded(_))
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Loaded(value) => Some(value),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&FieldSyncError> {
        match self {
            Self::Failed(e) => Some(e),
            _ => None,
        }
    }
}

// ============================================================================
// LiveView
// ============================================================================

/// A continuously updated view of the local store.
///
/// Dropping the view removes its store listener.
pub struct LiveView<T> {
    rx: watch::Receiver<Loadable<T>>,
    unsubscribe: Option<Unsubscribe>,
}

impl<T: Clone> LiveView<T> {
    pub fn current(&self) -> Loadable<T> {
        self.rx.borrow().clone()
    }

    /// Wait for the next update. `None` once the view can no longer change.
    pub async fn changed(&mut self) -> Option<Loadable<T>> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    /// Wait until the current state satisfies `pred`, checking it first.
    pub async fn wait_for(
        &mut self,
        mut pred: impl FnMut(&Loadable<T>) -> bool,
    ) -> Option<Loadable<T>> {
        loop {
            {
                let current = self.rx.borrow_and_update();
                if pred(&current) {
                    return Some(current.clone());
                }
            }
            self.rx.changed().await.ok()?;
        }
    }

    /// A detached receiver. It stops updating once this view is dropped.
    pub fn receiver(&self) -> watch::Receiver<Loadable<T>> {
        self.rx.clone()
    }
}

impl<T> Drop for LiveView<T> {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

/// Build a view that runs `load` now and again after every event `relevant`
/// accepts. The listener holds the store weakly.
///
/// Reload and publish happen under one per-view lock, so concurrent writers
/// cannot publish out of order: the last value sent reflects the last write.
pub fn live_view<S, T, L, R>(store: &Arc<ObservableStore<S>>, load: L, relevant: R) -> LiveView<T>
where
    S: LocalStore + 'static,
    T: Send + Sync + 'static,
    L: Fn(&ObservableStore<S>) -> Result<T> + Send + Sync + 'static,
    R: Fn(&StoreEvent) -> bool + Send + Sync + 'static,
{
    let (tx, rx) = watch::channel(Loadable::Loading);
    tx.send_replace(Loadable::from_result(load(&**store)));

    let weak = Arc::downgrade(store);
    let publisher = Mutex::new(tx);
    let unsubscribe = store.subscribe_where(relevant, move |_| {
        if let Some(store) = weak.upgrade() {
            let tx = publisher.lock();
            tx.send_replace(Loadable::from_result(load(&*store)));
        }
    });

    LiveView {
        rx,
        unsubscribe: Some(unsubscribe),
    }
}
