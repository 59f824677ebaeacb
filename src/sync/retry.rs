//! RetryScheduler: per-entity backoff timers.
//!
//! At most one timer is pending per key; scheduling again while one is
//! pending keeps the earlier timer. `dispose` aborts every timer and rejects
//! later schedules.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// A pending timer, tagged so a finishing timer only clears its own slot.
struct Slot {
    token: u64,
    handle: JoinHandle<()>,
}

pub struct RetryScheduler {
    slots: Arc<Mutex<HashMap<String, Slot>>>,
    next_token: AtomicU64,
    disposed: Arc<AtomicBool>,
}

impl RetryScheduler {
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            next_token: AtomicU64::new(0),
            disposed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Run `job` on `runtime` after `delay`, unless a timer for `key` is
    /// already pending. Returns whether a new timer was started.
    pub fn schedule<F>(&self, runtime: &Handle, key: &str, delay: Duration, job: F) -> bool
    where
        F: FnOnce() -> BoxFuture<'static, ()> + Send + 'static,
    {
        if self.disposed.load(Ordering::SeqCst) {
            return false;
        }

        // Held across the spawn so the timer cannot clear its slot before
        // the slot exists.
        let mut slots = self.slots.lock();
        if slots.get(key).is_some_and(|s| !s.handle.is_finished()) {
            return false;
        }

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);

        let slots_ref = Arc::clone(&self.slots);
        let disposed = Arc::clone(&self.disposed);
        let owned_key = key.to_string();
        let handle = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut slots = slots_ref.lock();
                if slots.get(&owned_key).is_some_and(|s| s.token == token) {
                    slots.remove(&owned_key);
                }
            }
            if disposed.load(Ordering::SeqCst) {
                return;
            }
            job().await;
        });
        slots.insert(key.to_string(), Slot { token, handle });
        true
    }

    /// Abort the pending timer for `key`, if any.
    pub fn cancel(&self, key: &str) -> bool {
        match self.slots.lock().remove(key) {
            Some(slot) => {
                slot.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_scheduled(&self, key: &str) -> bool {
        self.slots
            .lock()
            .get(key)
            .is_some_and(|s| !s.handle.is_finished())
    }

    pub fn pending(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|s| !s.handle.is_finished())
            .count()
    }

    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        for (_, slot) in self.slots.lock().drain() {
            slot.handle.abort();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

impl Default for RetryScheduler {
    fn default() -> Self {
        Self::new()
    }
}
