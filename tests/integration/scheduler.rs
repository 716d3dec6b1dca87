//! End-to-end reconcile scenarios against in-memory collaborators

use crate::fakes::*;
use chrono::Utc;
use credsync::config::Config;
use credsync::events::ResyncReason;
use credsync::refcache::RefKind;
use credsync::task::{Dependency, ObjectKey, TaskKind, FINALIZER};
use std::sync::atomic::Ordering;
use std::time::Duration;
use uuid::Uuid;

fn reason(task: &credsync::task::SyncTask) -> String {
    task.status.condition.as_ref().unwrap().reason.clone()
}

#[tokio::test]
async fn kv_sync_is_idempotent() {
    let h = harness();
    let mut task = kv_task("web", Some("1m"));

    let horizon = h.engine.reconcile(&mut task).await.unwrap();
    assert!(horizon <= Duration::from_secs(60));
    assert!(horizon >= Duration::from_secs(54));
    assert!(task.has_finalizer());
    assert_eq!(task.status.last_generation, 1);
    assert_eq!(reason(&task), "SecretSynced");

    h.engine.reconcile(&mut task).await.unwrap();
    assert_eq!(h.source.reads(), 2);
    assert_eq!(h.sink.write_count(), 1);
    assert_eq!(h.store.finalizers_added.load(Ordering::SeqCst), 1);
    assert_eq!(h.store.status_updates.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn kv_without_refresh_requeues_never() {
    let h = harness();
    let mut task = kv_task("web", None);
    assert_eq!(h.engine.reconcile(&mut task).await.unwrap(), Duration::ZERO);
}

#[tokio::test]
async fn changed_data_is_written() {
    let h = harness();
    let mut task = kv_task("web", None);
    h.engine.reconcile(&mut task).await.unwrap();

    let mut rotated = lease_response("", 0);
    rotated.data = object(serde_json::json!({"username": "app", "password": "rotated"}));
    h.source.push_read(Read::Ok(rotated));
    h.engine.reconcile(&mut task).await.unwrap();

    assert_eq!(h.sink.write_count(), 2);
    let writes = h.sink.writes.lock().unwrap();
    assert_eq!(writes[1]["password"], "rotated");
}

#[tokio::test]
async fn missing_destination_is_rewritten() {
    let h = harness();
    let mut task = kv_task("web", None);
    h.engine.reconcile(&mut task).await.unwrap();

    h.sink.delete("apps", "web-secret");
    h.engine.reconcile(&mut task).await.unwrap();
    assert_eq!(h.sink.write_count(), 2);
}

#[tokio::test]
async fn generation_change_forces_write() {
    let h = harness();
    let mut task = dynamic_task("db");
    h.engine.reconcile(&mut task).await.unwrap();

    task.generation = 2;
    h.engine.reconcile(&mut task).await.unwrap();
    assert_eq!(h.source.reads(), 2);
    assert_eq!(h.sink.write_count(), 2);
    assert_eq!(task.status.last_generation, 2);
}

#[tokio::test]
async fn failures_back_off_per_task() {
    let h = harness();
    let mut other = dynamic_task("other");
    let mut task = dynamic_task("db");

    h.source.push_read(Read::Fail);
    h.source.push_read(Read::Fail);
    h.source.push_read(Read::Fail);

    let first_other = h.engine.reconcile(&mut other).await.unwrap_err();
    assert_eq!(first_other.retry_after, Duration::from_secs(5));

    let first = h.engine.reconcile(&mut task).await.unwrap_err();
    assert_eq!(first.retry_after, Duration::from_secs(5));
    assert_eq!(first.error.reason(), "SecretSyncError");
    assert_eq!(reason(&task), "SecretSyncError");
    assert!(!task.status.condition.as_ref().unwrap().ready);

    let second = h.engine.reconcile(&mut task).await.unwrap_err();
    assert_eq!(second.retry_after, Duration::from_millis(7500));

    let horizon = h.engine.reconcile(&mut task).await.unwrap();
    assert!(horizon >= Duration::from_secs(67));
    assert!(horizon <= Duration::from_secs(77));
    assert!(!h.engine.backoff().contains(&task.key));

    // The other task's backoff is untouched by this one's recovery
    assert!(h.engine.backoff().contains(&other.key));
    assert_eq!(
        h.engine.backoff().get(&other.key).next_backoff(),
        Duration::from_millis(7500)
    );
}

#[tokio::test]
async fn recovery_resets_backoff_to_initial_interval() {
    let h = harness();
    let mut task = dynamic_task("db");

    h.source.push_read(Read::Fail);
    h.engine.reconcile(&mut task).await.unwrap_err();
    h.source.push_read(Read::Fail);
    h.engine.reconcile(&mut task).await.unwrap_err();
    h.engine.reconcile(&mut task).await.unwrap();

    task.generation = 2;
    h.source.push_read(Read::Fail);
    let failure = h.engine.reconcile(&mut task).await.unwrap_err();
    assert_eq!(failure.retry_after, Duration::from_secs(5));
}

#[tokio::test]
async fn lease_not_due_is_requeued_without_fetch() {
    let h = harness();
    let mut task = dynamic_task("db");
    h.engine.reconcile(&mut task).await.unwrap();

    let horizon = h.engine.reconcile(&mut task).await.unwrap();
    assert_eq!(h.source.reads(), 1);
    assert_eq!(h.source.renewals(), 0);
    assert!(horizon <= Duration::from_secs(77));
    assert!(horizon > Duration::from_secs(60));
}

#[tokio::test]
async fn renewal_window_renews_lease() {
    let h = harness();
    let mut task = dynamic_task("db");
    h.engine.reconcile(&mut task).await.unwrap();

    dynamic_status_mut(&mut task).last_renewal_time =
        Some(Utc::now() - chrono::Duration::seconds(70));
    let horizon = h.engine.reconcile(&mut task).await.unwrap();

    assert_eq!(h.source.renewals(), 1);
    assert_eq!(h.source.reads(), 1);
    assert_eq!(h.sink.write_count(), 1);
    assert_eq!(reason(&task), "LeaseRenewed");
    assert!(horizon >= Duration::from_secs(67));
    let status = dynamic_status(&task);
    assert_eq!(status.lease.unwrap().id, "lease-1");
    assert!(status.last_renewal_time.unwrap() > Utc::now() - chrono::Duration::seconds(5));
}

#[tokio::test]
async fn truncated_renewal_reissues_credentials() {
    let h = harness();
    let mut task = dynamic_task("db");
    h.engine.reconcile(&mut task).await.unwrap();

    h.source.set_renewal(Some(30));
    h.source.set_default(lease_response("lease-2", 100));
    dynamic_status_mut(&mut task).last_renewal_time =
        Some(Utc::now() - chrono::Duration::seconds(70));
    h.engine.reconcile(&mut task).await.unwrap();

    assert_eq!(h.source.renewals(), 1);
    assert_eq!(h.source.reads(), 2);
    assert_eq!(dynamic_status(&task).lease.unwrap().id, "lease-2");
    assert_eq!(reason(&task), "SecretSynced");
    // Superseded lease is revoked because the task declares revoke
    assert_eq!(*h.source.revoked.lock().unwrap(), vec!["lease-1".to_string()]);
}

#[tokio::test]
async fn failed_renewal_falls_back_to_fetch() {
    let h = harness();
    let mut task = dynamic_task("db");
    h.engine.reconcile(&mut task).await.unwrap();

    h.source.set_renewal(None);
    dynamic_status_mut(&mut task).last_renewal_time =
        Some(Utc::now() - chrono::Duration::seconds(90));
    h.engine.reconcile(&mut task).await.unwrap();
    assert_eq!(h.source.reads(), 2);
}

#[tokio::test]
async fn post_method_writes_params() {
    let h = harness();
    let mut task = dynamic_task("db");
    if let TaskKind::Dynamic { spec, .. } = &mut task.kind {
        spec.request_method = "post".to_string();
    }
    h.engine.reconcile(&mut task).await.unwrap();
    assert_eq!(h.source.write_count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unsupported_method_uses_error_horizon() {
    let h = harness();
    let mut task = dynamic_task("db");
    if let TaskKind::Dynamic { spec, .. } = &mut task.kind {
        spec.request_method = "PATCH".to_string();
    }
    let failure = h.engine.reconcile(&mut task).await.unwrap_err();
    assert_eq!(failure.error.reason(), "FieldValidationError");
    assert!(failure.retry_after <= Duration::from_secs(5));
    assert!(failure.retry_after >= Duration::from_millis(4500));
    assert_eq!(h.source.reads(), 0);
    assert!(!h.engine.backoff().contains(&task.key));
}

#[tokio::test]
async fn invalid_refresh_after_is_a_config_error() {
    let h = harness();
    let mut task = kv_task("web", Some("every day"));
    let failure = h.engine.reconcile(&mut task).await.unwrap_err();
    assert_eq!(failure.error.reason(), "FieldValidationError");
    assert!(failure.retry_after <= Duration::from_secs(5));
    assert_eq!(h.source.reads(), 0);
    assert_eq!(h.store.status_updates.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn zero_lease_with_refresh_after_uses_fixed_interval() {
    let h = harness();
    h.source.set_default(lease_response("", 0));
    let mut task = dynamic_task("db");
    if let TaskKind::Dynamic { spec, .. } = &mut task.kind {
        spec.refresh_after = Some("10m".to_string());
    }

    let horizon = h.engine.reconcile(&mut task).await.unwrap();
    assert!(horizon <= Duration::from_secs(600));
    assert!(horizon >= Duration::from_secs(540));

    let requeue = h.engine.reconcile(&mut task).await.unwrap();
    assert_eq!(h.source.reads(), 1);
    assert!(requeue <= Duration::from_secs(600));
}

#[tokio::test]
async fn static_credentials_requeue_after_rotation() {
    let h = harness();
    h.source.set_default(static_response(1_700_000_000, 1200));
    let mut task = dynamic_task("db");
    if let TaskKind::Dynamic { spec, .. } = &mut task.kind {
        spec.allow_static_creds = true;
    }

    let horizon = h.engine.reconcile(&mut task).await.unwrap();
    assert!(horizon >= Duration::from_secs(1201));
    assert!(horizon <= Duration::from_secs(1261));
    assert_eq!(reason(&task), "SecretRotated");

    let status = dynamic_status(&task);
    assert!(status.lease.is_none());
    assert_eq!(status.static_creds.unwrap().ttl, 1200);
}

#[tokio::test]
async fn forbidden_taints_client() {
    let h = harness();
    let mut task = dynamic_task("db");
    h.source.push_read(Read::Forbidden);

    let failure = h.engine.reconcile(&mut task).await.unwrap_err();
    assert!(failure.error.is_forbidden());
    assert_eq!(h.provider.taints(), 1);
    assert_eq!(h.provider.tainted.lock().unwrap()[0], client_key());
    assert!(h.engine.is_forced(&task.key));
}

#[tokio::test]
async fn failover_adopts_task_without_fetch() {
    let h = harness();
    let mut task = dynamic_task("db");
    h.engine.reconcile(&mut task).await.unwrap();

    task.status.last_runtime_id = Some(Uuid::new_v4());
    h.engine.reconcile(&mut task).await.unwrap();
    assert_eq!(h.source.reads(), 1);
    assert_eq!(task.status.last_runtime_id, Some(h.engine.runtime_id()));
}

#[tokio::test]
async fn failover_sync_when_enabled() {
    let mut config = Config::default();
    config.scheduler.sync_on_failover = true;
    let h = harness_with(config);
    let mut task = dynamic_task("db");
    h.engine.reconcile(&mut task).await.unwrap();

    task.status.last_runtime_id = Some(Uuid::new_v4());
    h.engine.reconcile(&mut task).await.unwrap();
    assert_eq!(h.source.reads(), 2);
}

#[tokio::test]
async fn mac_key_file_survives_restart() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut config = Config::default();
    config.scheduler.mac_key_file = Some(dir.path().join("mac.key"));
    let h = harness();
    let mut task = kv_task("web", Some("1m"));

    let first = engine_over(&h, config.clone()).await;
    first.reconcile(&mut task).await.unwrap();
    let restarted = engine_over(&h, config).await;
    restarted.reconcile(&mut task).await.unwrap();

    assert_eq!(h.source.reads(), 2);
    assert_eq!(h.sink.write_count(), 1);
}

#[tokio::test]
async fn ephemeral_mac_key_rewrites_after_restart() {
    let h = harness();
    let mut task = kv_task("web", Some("1m"));

    engine_over(&h, Config::default())
        .await
        .reconcile(&mut task)
        .await
        .unwrap();
    engine_over(&h, Config::default())
        .await
        .reconcile(&mut task)
        .await
        .unwrap();

    assert_eq!(h.sink.write_count(), 2);
}

#[tokio::test]
async fn deletion_revokes_and_releases_finalizer() {
    let h = harness();
    let auth = ObjectKey::new("apps", "db-auth");
    let mut task = dynamic_task("db");
    task.dependencies.push(Dependency {
        kind: RefKind::AuthConfig,
        referent: auth.clone(),
    });
    task.instant_updates = true;
    h.engine.reconcile(&mut task).await.unwrap();
    assert!(h.engine.watchers().is_running(&task.key).await);

    task.deletion_requested = true;
    let horizon = h.engine.reconcile(&mut task).await.unwrap();

    assert_eq!(horizon, Duration::ZERO);
    assert!(!task.finalizers.iter().any(|f| f == FINALIZER));
    assert_eq!(h.store.finalizers_removed.load(Ordering::SeqCst), 1);
    assert_eq!(*h.source.revoked.lock().unwrap(), vec!["lease-1".to_string()]);
    assert!(h.engine.references().get(RefKind::AuthConfig, &auth).is_none());
    assert!(h.engine.watchers().is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn referent_change_fans_out_to_dependents() {
    let mut h = harness();
    let auth = ObjectKey::new("apps", "db-auth");
    let dependency = Dependency {
        kind: RefKind::AuthConfig,
        referent: auth.clone(),
    };
    let mut a = dynamic_task("a");
    a.dependencies.push(dependency.clone());
    let mut b = kv_task("b", None);
    b.dependencies.push(dependency);
    let mut c = kv_task("c", None);
    for task in [&mut a, &mut b, &mut c] {
        h.engine.reconcile(task).await.unwrap();
    }

    assert_eq!(h.engine.referent_changed(RefKind::AuthConfig, &auth), 2);
    assert!(h.engine.is_forced(&a.key));
    assert!(h.engine.is_forced(&b.key));
    assert!(!h.engine.is_forced(&c.key));

    let mut keys = Vec::new();
    for _ in 0..2 {
        let event = h.resync.recv().await.unwrap();
        assert_eq!(event.reason, ResyncReason::Referent(RefKind::AuthConfig));
        h.engine.handle_resync(&event);
        keys.push(event.key);
    }
    keys.sort();
    assert_eq!(keys, vec![a.key.clone(), b.key.clone()]);

    // A forced dynamic task fetches even though its lease isn't due
    let reads = h.source.reads();
    h.engine.reconcile(&mut a).await.unwrap();
    assert_eq!(h.source.reads(), reads + 1);
    assert!(!h.engine.is_forced(&a.key));
}

#[tokio::test(start_paused = true)]
async fn referent_deletion_drops_associations() {
    let mut h = harness();
    let template = ObjectKey::new("apps", "template");
    let mut task = kv_task("web", None);
    task.dependencies.push(Dependency {
        kind: RefKind::Transformation,
        referent: template.clone(),
    });
    h.engine.reconcile(&mut task).await.unwrap();

    assert_eq!(h.engine.referent_deleted(RefKind::Transformation, &template), 1);
    assert!(h.engine.references().get(RefKind::Transformation, &template).is_none());
    assert_eq!(h.resync.recv().await.unwrap().key, task.key);
    assert_eq!(h.engine.referent_changed(RefKind::Transformation, &template), 0);
}

#[tokio::test]
async fn dropped_dependency_stops_fan_out() {
    let h = harness();
    let auth = ObjectKey::new("apps", "db-auth");
    let mut task = kv_task("web", None);
    task.dependencies.push(Dependency {
        kind: RefKind::AuthConfig,
        referent: auth.clone(),
    });
    h.engine.reconcile(&mut task).await.unwrap();

    task.dependencies.clear();
    task.generation = 2;
    h.engine.reconcile(&mut task).await.unwrap();
    assert_eq!(h.engine.referent_changed(RefKind::AuthConfig, &auth), 0);
}

#[tokio::test(start_paused = true)]
async fn client_family_eviction_forces_sync() {
    let mut h = harness();
    let mut a = dynamic_task("a");
    let mut b = kv_task("b", None);
    h.engine.reconcile(&mut a).await.unwrap();
    h.engine.reconcile(&mut b).await.unwrap();

    let evicted = client_key().with_namespace("team-b");
    let affected = h.engine.client_family_evicted(&evicted);
    assert_eq!(affected, vec![a.key.clone(), b.key.clone()]);
    assert!(h.engine.is_forced(&a.key));

    let event = h.resync.recv().await.unwrap();
    assert_eq!(event.reason, ResyncReason::ClientEvicted);

    let unrelated = credsync::source::ClientCacheKey::compute(
        "approle",
        &serde_json::json!({"role_id": "x"}),
        None,
    )
    .unwrap();
    assert!(h.engine.client_family_evicted(&unrelated).is_empty());
}

#[tokio::test]
async fn instant_updates_toggle_watcher() {
    let h = harness();
    let mut task = kv_task("web", None);
    task.instant_updates = true;
    h.engine.reconcile(&mut task).await.unwrap();
    assert!(h.engine.watchers().is_running(&task.key).await);

    h.engine.reconcile(&mut task).await.unwrap();
    assert_eq!(h.engine.watchers().len().await, 1);

    task.instant_updates = false;
    task.generation = 2;
    h.engine.reconcile(&mut task).await.unwrap();
    assert!(!h.engine.watchers().is_running(&task.key).await);
    assert!(h.engine.watchers().is_empty().await);

    h.engine.shutdown().await;
}
