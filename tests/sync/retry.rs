use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;

use field_sync::sync::{RetryScheduler, SyncConfig};

fn counting_job(
    count: &Arc<AtomicUsize>,
) -> impl FnOnce() -> futures::future::BoxFuture<'static, ()> {
    let count = Arc::clone(count);
    move || {
        Box::pin(async move {
            count.fetch_add(1, Ordering::SeqCst);
        })
    }
}

#[test]
fn backoff_doubles_and_caps() {
    let config = SyncConfig {
        retry_base_delay_ms: 100,
        retry_max_delay_ms: 500,
        ..SyncConfig::default()
    };
    assert_eq!(config.backoff(1), Duration::from_millis(100));
    assert_eq!(config.backoff(2), Duration::from_millis(200));
    assert_eq!(config.backoff(3), Duration::from_millis(400));
    assert_eq!(config.backoff(4), Duration::from_millis(500));
    assert_eq!(config.backoff(200), Duration::from_millis(500));
}

#[test]
fn config_fills_missing_fields_with_defaults() {
    let config: SyncConfig = serde_json::from_str(r#"{ "max_retries": 2 }"#).unwrap();
    assert_eq!(config.max_retries, 2);
    assert_eq!(config.retry_base_delay_ms, SyncConfig::default().retry_base_delay_ms);
}

#[tokio::test(start_paused = true)]
async fn job_runs_after_the_delay() {
    let scheduler = RetryScheduler::new();
    let count = Arc::new(AtomicUsize::new(0));

    assert!(scheduler.schedule(
        &Handle::current(),
        "e1",
        Duration::from_secs(5),
        counting_job(&count)
    ));
    assert!(scheduler.is_scheduled("e1"));

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(count.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert!(!scheduler.is_scheduled("e1"));
}

#[tokio::test(start_paused = true)]
async fn second_schedule_for_the_same_key_is_ignored() {
    let scheduler = RetryScheduler::new();
    let count = Arc::new(AtomicUsize::new(0));
    let handle = Handle::current();

    assert!(scheduler.schedule(&handle, "e1", Duration::from_secs(1), counting_job(&count)));
    assert!(!scheduler.schedule(&handle, "e1", Duration::from_millis(10), counting_job(&count)));
    assert!(scheduler.schedule(&handle, "e2", Duration::from_secs(1), counting_job(&count)));
    assert_eq!(scheduler.pending(), 2);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(count.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn cancel_prevents_the_job() {
    let scheduler = RetryScheduler::new();
    let count = Arc::new(AtomicUsize::new(0));

    scheduler.schedule(&Handle::current(), "e1", Duration::from_secs(1), counting_job(&count));
    assert!(scheduler.cancel("e1"));
    assert!(!scheduler.cancel("e1"));

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn dispose_cancels_everything_and_rejects_new_work() {
    let scheduler = RetryScheduler::new();
    let count = Arc::new(AtomicUsize::new(0));
    let handle = Handle::current();

    scheduler.schedule(&handle, "e1", Duration::from_secs(1), counting_job(&count));
    scheduler.dispose();
    assert!(scheduler.is_disposed());
    assert!(!scheduler.schedule(&handle, "e2", Duration::from_secs(1), counting_job(&count)));

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(count.load(Ordering::SeqCst), 0);
    assert_eq!(scheduler.pending(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timer_rescheduled_after_cancel_stays_tracked() {
    let scheduler = RetryScheduler::new();
    let count = Arc::new(AtomicUsize::new(0));
    let handle = Handle::current();

    // Cancel each short timer around the moment it fires, then replace it.
    for _ in 0..100 {
        scheduler.schedule(&handle, "e1", Duration::from_millis(1), counting_job(&count));
        tokio::time::sleep(Duration::from_millis(1)).await;
        scheduler.cancel("e1");
        assert!(scheduler.schedule(&handle, "e1", Duration::from_secs(3600), counting_job(&count)));

        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(scheduler.is_scheduled("e1"));
        assert!(scheduler.cancel("e1"));
    }
}
