//! Scenario Tests for Expiry-Driven Refresh
//!
//! Runs the scheduler on paused tokio time: the runtime auto-advances to the
//! next pending timer whenever every task is idle, and `PausedClock` follows.

use std::sync::Arc;

use deckhand_cache::CacheStore;
use deckhand_core::ExpiryConfig;
use deckhand_sync::{ExpiryScheduler, ScheduledRefresh, SyncLayer};
use deckhand_test_utils::fixtures::{expiry_row, test_config, NOW_MS, NOW_SECS};
use deckhand_test_utils::{calls, MockGateway, MockReply, PausedClock, ProviderHealth};
use tokio::sync::watch;

const PARTITION: &str = "claude";

fn scheduler(gateway: &Arc<MockGateway>, partitions: &[&str]) -> (CacheStore, ExpiryScheduler) {
    let store = CacheStore::new();
    let scheduler = ExpiryScheduler::new(
        store.clone(),
        gateway.client(),
        PausedClock::starting_at(NOW_MS),
        ExpiryConfig {
            epsilon_ms: 1_000,
            fallback_secs: 30,
        },
        partitions.iter().map(|p| p.to_string()).collect(),
    );
    (store, scheduler)
}

async fn next_scheduled<F>(
    rx: &mut watch::Receiver<Option<ScheduledRefresh>>,
    mut pred: F,
) -> ScheduledRefresh
where
    F: FnMut(&ScheduledRefresh) -> bool,
{
    let refresh = *rx
        .wait_for(|s| s.as_ref().is_some_and(&mut pred))
        .await
        .expect("scheduler dropped its watch");
    refresh.expect("predicate only matches Some")
}

#[tokio::test(start_paused = true)]
async fn test_fires_once_at_nearest_deadline_then_replans() {
    let gateway = MockGateway::new();
    gateway
        .on(
            calls::FETCH_EXPIRING_ROWS,
            MockReply::json(&vec![expiry_row("anthropic", Some(NOW_SECS + 10), None)]),
        )
        .enqueue(
            calls::FETCH_EXPIRING_ROWS,
            MockReply::json(&vec![
                expiry_row("bedrock", Some(NOW_SECS + 5), None),
                expiry_row("anthropic", Some(NOW_SECS + 10), None),
            ]),
        );
    let (_store, scheduler) = scheduler(&gateway, &[PARTITION]);
    let mut scheduled = scheduler.scheduled();
    let handle = scheduler.spawn();

    let first = next_scheduled(&mut scheduled, |_| true).await;
    assert_eq!(first.plan.deadline_secs, Some(NOW_SECS + 5));
    assert_eq!(first.scheduled_at_ms, NOW_MS);
    assert_eq!(first.fire_at_ms, NOW_MS + 6_000);

    let second = next_scheduled(&mut scheduled, |s| {
        s.plan.deadline_secs == Some(NOW_SECS + 10)
    })
    .await;
    assert!(second.scheduled_at_ms >= NOW_MS + 6_000);
    assert_eq!(second.fire_at_ms, NOW_MS + 11_000);

    let metrics = handle.metrics().snapshot();
    assert_eq!(metrics.fires, 1);
    assert_eq!(metrics.superseded, 0);
    assert_eq!(gateway.call_count(calls::FETCH_EXPIRING_ROWS), 2);

    handle.shutdown().await.unwrap();
    assert_eq!(*scheduled.borrow(), None);
}

#[tokio::test(start_paused = true)]
async fn test_no_future_deadline_uses_fallback() {
    let gateway = MockGateway::new();
    gateway.on(
        calls::FETCH_EXPIRING_ROWS,
        MockReply::json(&vec![expiry_row("anthropic", Some(NOW_SECS - 60), None)]),
    );
    let (_store, scheduler) = scheduler(&gateway, &[PARTITION]);
    let mut scheduled = scheduler.scheduled();
    let handle = scheduler.spawn();

    let first = next_scheduled(&mut scheduled, |_| true).await;
    assert!(first.plan.is_fallback());
    assert_eq!(first.fire_at_ms, NOW_MS + 30_000);

    // The fallback timer still refreshes, so rows cleared upstream show up.
    tokio::time::sleep(std::time::Duration::from_secs(31)).await;
    assert_eq!(gateway.call_count(calls::FETCH_EXPIRING_ROWS), 2);
    assert_eq!(handle.metrics().snapshot().fires, 1);

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_write_with_nearer_deadline_replaces_timer() {
    let gateway = MockGateway::new();
    gateway.on(
        calls::FETCH_EXPIRING_ROWS,
        MockReply::json(&vec![expiry_row("anthropic", Some(NOW_SECS + 20), None)]),
    );
    let (store, scheduler) = scheduler(&gateway, &[PARTITION]);
    let mut scheduled = scheduler.scheduled();
    let handle = scheduler.spawn();

    let first = next_scheduled(&mut scheduled, |_| true).await;
    assert_eq!(first.plan.deadline_secs, Some(NOW_SECS + 20));

    store
        .set(
            &ExpiryScheduler::partition_key(PARTITION),
            vec![expiry_row("anthropic", None, Some(NOW_SECS + 3))],
        )
        .unwrap();

    let replaced = next_scheduled(&mut scheduled, |s| {
        s.plan.deadline_secs == Some(NOW_SECS + 3)
    })
    .await;
    assert_eq!(replaced.fire_at_ms, NOW_MS + 4_000);
    assert_eq!(handle.metrics().snapshot().superseded, 1);
    assert_eq!(handle.metrics().snapshot().fires, 0);

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_nearest_deadline_across_partitions() {
    let gateway = MockGateway::new();
    gateway
        .enqueue(
            calls::FETCH_EXPIRING_ROWS,
            MockReply::json(&vec![expiry_row("anthropic", Some(NOW_SECS + 9), None)]),
        )
        .enqueue(
            calls::FETCH_EXPIRING_ROWS,
            MockReply::json(&vec![expiry_row("openai", None, Some(NOW_SECS + 4))]),
        );
    let (_store, scheduler) = scheduler(&gateway, &["claude", "codex"]);
    let mut scheduled = scheduler.scheduled();
    let handle = scheduler.spawn();

    let first = next_scheduled(&mut scheduled, |s| {
        s.plan.deadline_secs == Some(NOW_SECS + 4)
    })
    .await;
    assert_eq!(first.fire_at_ms, NOW_MS + 5_000);

    let subjects: Vec<String> = gateway
        .calls_to(calls::FETCH_EXPIRING_ROWS)
        .iter()
        .filter_map(|args| args["subject_key"].as_str().map(str::to_string))
        .collect();
    assert_eq!(subjects, vec!["claude".to_string(), "codex".to_string()]);

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_failed_refresh_is_counted_and_retried() {
    let gateway = MockGateway::new();
    gateway
        .on(
            calls::FETCH_EXPIRING_ROWS,
            MockReply::json(&vec![expiry_row("anthropic", Some(NOW_SECS + 60), None)]),
        )
        .enqueue(
            calls::FETCH_EXPIRING_ROWS,
            MockReply::json(&vec![expiry_row("anthropic", Some(NOW_SECS + 2), None)]),
        )
        .enqueue(
            calls::FETCH_EXPIRING_ROWS,
            MockReply::transport_error(calls::FETCH_EXPIRING_ROWS),
        );
    let (_store, scheduler) = scheduler(&gateway, &[PARTITION]);
    let mut scheduled = scheduler.scheduled();
    let handle = scheduler.spawn();

    // Initial load plans for +2s; that refresh fails, so the fallback period
    // applies and the retry at +33s succeeds.
    let recovered = next_scheduled(&mut scheduled, |s| {
        s.plan.deadline_secs == Some(NOW_SECS + 60)
    })
    .await;
    assert!(recovered.scheduled_at_ms >= NOW_MS + 33_000);

    let metrics = handle.metrics().snapshot();
    assert_eq!(metrics.refresh_failures, 1);
    assert_eq!(metrics.fires, 2);

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_scheduler_from_sync_layer() {
    let gateway = MockGateway::new();
    gateway.on(
        calls::FETCH_EXPIRING_ROWS,
        MockReply::json(&vec![expiry_row("anthropic", Some(NOW_SECS + 5), None)]),
    );
    let layer = SyncLayer::new(gateway.clone(), test_config()).unwrap();
    let scheduler =
        layer.expiry_scheduler(PausedClock::starting_at(NOW_MS), vec![PARTITION.to_string()]);
    let mut scheduled = scheduler.scheduled();
    let handle = scheduler.spawn();

    let first = next_scheduled(&mut scheduled, |_| true).await;
    assert_eq!(
        first.fire_at_ms,
        NOW_MS + 5_000 + layer.config.expiry.epsilon_ms as i64
    );
    assert!(layer
        .store
        .get::<Vec<ProviderHealth>>(&ExpiryScheduler::partition_key(PARTITION))
        .unwrap()
        .is_ready());

    handle.shutdown().await.unwrap();
}
