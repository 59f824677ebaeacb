//! LiveView: initial load, reload on relevant events, teardown on drop.

use std::sync::Arc;
use std::time::Duration;

use field_sync::reactive::{live_view, Loadable, ObservableStore, StoreEvent};
use field_sync::storage::{LocalStore, MemoryStore};
use field_sync::types::{AuditInfo, Entity, FieldValue};

use crate::support::{FailingStore, SlowStore};

fn entity(id: &str, parent: &str, notes: &str) -> Entity {
    Entity::with_id(id, parent, AuditInfo::new("u1", chrono::Utc::now()))
        .with_field("notes", FieldValue::text(notes))
}

fn parent_view(
    store: &Arc<ObservableStore<MemoryStore>>,
    parent: &str,
) -> field_sync::reactive::LiveView<Vec<Entity>> {
    let load_id = parent.to_string();
    let filter_id = parent.to_string();
    live_view(
        store,
        move |s| s.get_by_parent(&load_id),
        move |e: &StoreEvent| e.touches_snapshot() && e.parent_id() == filter_id,
    )
}

#[tokio::test]
async fn initial_state_is_loaded() {
    let store = Arc::new(ObservableStore::new(MemoryStore::new()));
    store.upsert(&entity("e1", "p1", "a")).unwrap();

    let view = parent_view(&store, "p1");
    let current = view.current();
    assert!(current.is_loaded());
    assert_eq!(current.value().map(Vec::len), Some(1));
}

#[tokio::test]
async fn relevant_writes_reload_the_view() {
    let store = Arc::new(ObservableStore::new(MemoryStore::new()));
    let mut view = parent_view(&store, "p1");

    store.upsert(&entity("e1", "p1", "a")).unwrap();

    let state = tokio::time::timeout(
        Duration::from_secs(1),
        view.wait_for(|s| s.value().is_some_and(|v| v.len() == 1)),
    )
    .await
    .expect("view updated")
    .expect("view open");
    assert_eq!(state.value().unwrap()[0].id, "e1");
}

#[tokio::test]
async fn unrelated_writes_are_ignored() {
    let store = Arc::new(ObservableStore::new(MemoryStore::new()));
    let view = parent_view(&store, "p1");
    let mut rx = view.receiver();
    rx.borrow_and_update();

    store.upsert(&entity("e9", "p2", "other")).unwrap();
    assert!(!rx.has_changed().unwrap());

    store.upsert(&entity("e1", "p1", "mine")).unwrap();
    assert!(rx.has_changed().unwrap());
}

#[tokio::test]
async fn load_failure_is_reported_as_failed() {
    let inner = FailingStore::new();
    inner.fail_reads(true);
    let store = Arc::new(ObservableStore::new(inner));

    let view = live_view(&store, |s| s.get_by_parent("p1"), |_| true);

    assert!(matches!(view.current(), Loadable::Failed(_)));
    assert!(view.current().error().is_some());
}

#[tokio::test]
async fn dropping_the_view_unsubscribes() {
    let store = Arc::new(ObservableStore::new(MemoryStore::new()));
    let view = parent_view(&store, "p1");
    assert_eq!(store.listener_count(), 1);

    drop(view);

    assert_eq!(store.listener_count(), 0);
    store.upsert(&entity("e1", "p1", "a")).unwrap();
}

#[test]
fn concurrent_writers_leave_the_latest_state() {
    let slow = SlowStore::new(Duration::from_millis(100));
    let store = Arc::new(ObservableStore::new(Arc::clone(&slow)));
    let view = live_view(
        &store,
        |s| s.get_by_parent("p1"),
        |e: &StoreEvent| e.touches_snapshot(),
    );
    // The first reload reads one entity, then stalls past the second write.
    slow.slow_next(1);

    std::thread::scope(|scope| {
        let first = Arc::clone(&store);
        scope.spawn(move || first.upsert(&entity("e1", "p1", "a")).unwrap());
        std::thread::sleep(Duration::from_millis(20));
        store.upsert(&entity("e2", "p1", "b")).unwrap();
    });

    assert_eq!(view.current().value().map(Vec::len), Some(2));
}
