//! Event watcher registry behavior against a scripted subscription stream

use crate::fakes::*;
use credsync::config::schema::WatcherConfig;
use credsync::error::CredsyncError;
use credsync::events::{resync_channel, ResyncReason, ResyncReceiver};
use credsync::horizon::HorizonCalculator;
use credsync::source::{ClientProvider, CredentialSource};
use credsync::task::TaskKey;
use credsync::watcher::{EventWatcherRegistry, WatcherState};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

struct Rig {
    registry: EventWatcherRegistry,
    resync: ResyncReceiver,
    source: Arc<FakeSource>,
    provider: Arc<FakeProvider>,
}

fn rig(config: WatcherConfig) -> Rig {
    let source = FakeSource::new();
    let provider = FakeProvider::new(Arc::clone(&source));
    let (tx, resync) = resync_channel(
        config.max_resync_delay,
        Arc::new(HorizonCalculator::seeded(7)),
    );
    let registry = EventWatcherRegistry::new(
        config,
        Arc::clone(&provider) as Arc<dyn ClientProvider>,
        tx,
        CancellationToken::new(),
    );
    Rig {
        registry,
        resync,
        source,
        provider,
    }
}

impl Rig {
    fn client(&self) -> Arc<dyn CredentialSource> {
        Arc::clone(&self.source) as Arc<dyn CredentialSource>
    }

    async fn wait_for(&self, key: &TaskKey, wanted: WatcherState) {
        for _ in 0..1000 {
            if self.registry.state(key).await == Some(wanted) {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "watcher for {key} never reached {wanted}, last state {:?}",
            self.registry.state(key).await
        );
    }
}

fn event(namespace: &str, path: &str, modified: bool) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "data": {
            "namespace": namespace,
            "event": {"metadata": {"path": path, "modified": modified.to_string()}}
        }
    }))
    .unwrap()
}

#[tokio::test(start_paused = true)]
async fn matching_event_requests_one_resync() {
    let mut rig = rig(WatcherConfig::default());
    let events = rig.source.open_stream();
    let task = kv_task("web", None);

    assert!(rig.registry.ensure(&task, rig.client()).await.unwrap());
    rig.wait_for(&task.key, WatcherState::Running).await;

    events.send(Ok(event("", "/kv/web/config", true))).unwrap();
    events.send(Ok(event("", "kv/web/config", true))).unwrap();

    let resync = rig.resync.recv().await.unwrap();
    assert_eq!(resync.key, task.key);
    assert_eq!(resync.reason, ResyncReason::SourceModified);
    assert!(timeout(Duration::from_secs(5), rig.resync.recv()).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn unrelated_events_are_ignored() {
    let mut rig = rig(WatcherConfig::default());
    let events = rig.source.open_stream();
    let task = kv_task("web", None);

    rig.registry.ensure(&task, rig.client()).await.unwrap();
    rig.wait_for(&task.key, WatcherState::Running).await;

    events.send(Ok(event("", "kv/other/config", true))).unwrap();
    events.send(Ok(event("", "kv/web/config", false))).unwrap();
    events.send(Ok(event("team-b", "kv/web/config", true))).unwrap();

    assert!(timeout(Duration::from_secs(5), rig.resync.recv()).await.is_err());
    assert_eq!(
        rig.registry.state(&task.key).await,
        Some(WatcherState::Running)
    );
}

#[tokio::test(start_paused = true)]
async fn malformed_message_reconnects() {
    let rig = rig(WatcherConfig::default());
    let events = rig.source.open_stream();
    let task = kv_task("web", None);

    rig.registry.ensure(&task, rig.client()).await.unwrap();
    rig.wait_for(&task.key, WatcherState::Running).await;

    events.send(Ok(b"not json".to_vec())).unwrap();
    rig.wait_for(&task.key, WatcherState::ErrorBackoff { errors: 1 })
        .await;
    rig.wait_for(&task.key, WatcherState::Running).await;
    assert_eq!(rig.source.subscriptions(), 2);
}

#[tokio::test(start_paused = true)]
async fn exceeding_error_threshold_forces_resync() {
    let config = WatcherConfig {
        error_threshold: 2,
        ..WatcherConfig::default()
    };
    let mut rig = rig(config);
    rig.source.fail_subscriptions();
    let task = kv_task("web", None);

    rig.registry.ensure(&task, rig.client()).await.unwrap();

    let resync = rig.resync.recv().await.unwrap();
    assert_eq!(resync.reason, ResyncReason::WatcherFailed);
    rig.wait_for(&task.key, WatcherState::Stopped).await;
    assert_eq!(rig.source.subscriptions(), 3);
    assert!(!rig.registry.is_running(&task.key).await);

    // A dead watcher is replaced on the next ensure
    assert!(rig.registry.ensure(&task, rig.client()).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn delivered_messages_reset_error_count() {
    let config = WatcherConfig {
        error_threshold: 1,
        ..WatcherConfig::default()
    };
    let mut rig = rig(config);
    for _ in 0..2 {
        let events = rig.source.open_stream();
        events.send(Ok(event("", "kv/other", true))).unwrap();
        events
            .send(Err(CredsyncError::EventStream("reset".to_string())))
            .unwrap();
    }
    rig.source.fail_subscriptions();
    let task = kv_task("web", None);

    rig.registry.ensure(&task, rig.client()).await.unwrap();

    let resync = rig.resync.recv().await.unwrap();
    assert_eq!(resync.reason, ResyncReason::WatcherFailed);
    // Without the reset the second stream's error would already trip it
    assert_eq!(rig.source.subscriptions(), 3);
}

#[tokio::test(start_paused = true)]
async fn ensure_is_idempotent_until_generation_changes() {
    let rig = rig(WatcherConfig::default());
    let mut task = kv_task("web", None);

    assert!(rig.registry.ensure(&task, rig.client()).await.unwrap());
    rig.wait_for(&task.key, WatcherState::Running).await;
    assert!(!rig.registry.ensure(&task, rig.client()).await.unwrap());
    assert_eq!(rig.source.subscriptions(), 1);

    task.generation = 2;
    assert!(rig.registry.ensure(&task, rig.client()).await.unwrap());
    rig.wait_for(&task.key, WatcherState::Running).await;
    assert_eq!(rig.registry.len().await, 1);
    assert_eq!(rig.source.subscriptions(), 2);
}

#[tokio::test(start_paused = true)]
async fn replacement_subscribes_after_old_watcher_stops() {
    let rig = rig(WatcherConfig::default());
    let mut task = kv_task("web", None);

    rig.registry.ensure(&task, rig.client()).await.unwrap();
    rig.wait_for(&task.key, WatcherState::Running).await;
    assert_eq!(rig.source.live_streams(), 1);

    task.generation = 2;
    assert!(rig.registry.ensure(&task, rig.client()).await.unwrap());
    rig.wait_for(&task.key, WatcherState::Running).await;

    // The old stream was dropped before the new subscription opened
    assert_eq!(rig.source.live_at_subscribe(), vec![0, 0]);
    assert_eq!(rig.source.live_streams(), 1);
}

#[tokio::test(start_paused = true)]
async fn timed_out_replacement_keeps_one_watcher() {
    let config = WatcherConfig {
        replace_timeout: Duration::ZERO,
        ..WatcherConfig::default()
    };
    let rig = rig(config);
    let mut task = kv_task("web", None);

    rig.registry.ensure(&task, rig.client()).await.unwrap();
    rig.wait_for(&task.key, WatcherState::Running).await;

    task.generation = 2;
    let err = rig.registry.ensure(&task, rig.client()).await.unwrap_err();
    assert!(matches!(err, CredsyncError::WatcherStopTimeout { .. }));
    assert_eq!(rig.registry.len().await, 1);
    assert_eq!(rig.source.subscriptions(), 1);

    // The cancelled watcher stays registered until it has stopped
    rig.wait_for(&task.key, WatcherState::Stopped).await;
    assert!(rig.registry.ensure(&task, rig.client()).await.unwrap());
    rig.wait_for(&task.key, WatcherState::Running).await;
    assert_eq!(rig.registry.len().await, 1);
    assert_eq!(rig.source.live_at_subscribe(), vec![0, 0]);
}

#[tokio::test(start_paused = true)]
async fn cancelled_watcher_is_never_current() {
    let config = WatcherConfig {
        replace_timeout: Duration::ZERO,
        ..WatcherConfig::default()
    };
    let rig = rig(config);
    let task = kv_task("web", None);

    rig.registry.ensure(&task, rig.client()).await.unwrap();
    rig.wait_for(&task.key, WatcherState::Running).await;
    assert!(rig.registry.stop(&task.key).await.is_err());
    assert_eq!(rig.registry.len().await, 1);

    let again = rig.registry.ensure(&task, rig.client()).await;
    assert!(!matches!(again, Ok(false)));
}

#[tokio::test(start_paused = true)]
async fn stop_interrupts_blocked_client_rederive() {
    let rig = rig(WatcherConfig::default());
    rig.source.push_failed_subscription(true);
    rig.provider.hold_clients();
    let task = kv_task("web", None);

    rig.registry.ensure(&task, rig.client()).await.unwrap();
    rig.wait_for(&task.key, WatcherState::ErrorBackoff { errors: 1 })
        .await;
    while rig.provider.calls.load(Ordering::SeqCst) == 0 {
        sleep(Duration::from_millis(10)).await;
    }

    assert!(rig.registry.stop(&task.key).await.unwrap());
    assert!(rig.registry.is_empty().await);
    assert_eq!(rig.source.subscriptions(), 1);
}

#[tokio::test(start_paused = true)]
async fn stop_removes_watcher() {
    let rig = rig(WatcherConfig::default());
    let task = kv_task("web", None);

    rig.registry.ensure(&task, rig.client()).await.unwrap();
    assert!(rig.registry.stop(&task.key).await.unwrap());
    assert_eq!(rig.registry.state(&task.key).await, None);
    assert!(!rig.registry.stop(&task.key).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn forbidden_subscription_rederives_client() {
    let rig = rig(WatcherConfig::default());
    rig.source.push_failed_subscription(true);
    let task = kv_task("web", None);

    rig.registry.ensure(&task, rig.client()).await.unwrap();
    rig.wait_for(&task.key, WatcherState::ErrorBackoff { errors: 1 })
        .await;
    rig.wait_for(&task.key, WatcherState::Running).await;

    assert_eq!(rig.provider.taints(), 1);
    assert_eq!(rig.provider.calls.load(Ordering::SeqCst), 1);
    assert_eq!(rig.registry.client_key(&task.key).await, Some(client_key()));
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_every_watcher() {
    let rig = rig(WatcherConfig::default());
    for name in ["a", "b"] {
        rig.registry
            .ensure(&kv_task(name, None), rig.client())
            .await
            .unwrap();
    }
    assert_eq!(rig.registry.len().await, 2);

    rig.registry.shutdown().await;
    assert!(rig.registry.is_empty().await);
}
