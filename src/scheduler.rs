//! Sync scheduler
//!
//! [`SyncEngine::reconcile`] is the single entry point the external driver
//! calls per task. It decides between a cheap lease renewal and a full fetch,
//! publishes changed data, keeps the task's watcher in line with its
//! declaration, and returns the horizon after which the driver should call
//! again. A zero horizon means no periodic reconciliation is needed.

use crate::backoff::BackoffRegistry;
use crate::config::schema::Config;
use crate::error::{CredsyncError, CredsyncResult, SyncFailure};
use crate::events::{resync_channel, ResyncEvent, ResyncReason, ResyncReceiver, ResyncSender};
use crate::horizon::{
    clamp_renewal_percent, max_jitter, HorizonCalculator, HorizonMode, JITTER_FRACTION,
};
use crate::mac::MacKey;
use crate::refcache::{RefKind, ReferenceCache};
use crate::rotation::await_rotation;
use crate::source::{ClientCacheKey, ClientProvider, CredentialSource, SecretResponse};
use crate::store::{SecretSink, TaskStore};
use crate::task::{
    DynamicSpec, DynamicStatus, KvStatus, LeaseStatus, ObjectKey, RequestMethod, StaticCredsMeta,
    SyncTask, TaskKey, TaskKind, FINALIZER,
};
use crate::watcher::EventWatcherRegistry;
use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const REASON_SYNCED: &str = "SecretSynced";
const REASON_ROTATED: &str = "SecretRotated";
const REASON_RENEWED: &str = "LeaseRenewed";

/// Result of a successful invocation
struct Synced {
    horizon: Duration,
    /// Condition to record; `None` leaves the previous one in place
    condition: Option<(&'static str, String)>,
    /// New data MAC when data was fetched
    secret_mac: Option<String>,
    /// Whether the credential source was actually contacted for data
    fetched: bool,
}

impl Synced {
    fn requeue(horizon: Duration) -> Self {
        Self {
            horizon,
            condition: None,
            secret_mac: None,
            fetched: false,
        }
    }
}

/// What a dynamic task's recorded status says about this invocation
enum Schedule {
    /// Nothing to do before `horizon`
    NotDue(Duration),
    /// Inside the renewal window of a renewable lease
    Renew(LeaseStatus),
    /// A full fetch is needed
    Due,
}

/// Builds a [`SyncEngine`] and the receiving half of its resync channel
pub struct SyncEngineBuilder {
    config: Config,
    provider: Arc<dyn ClientProvider>,
    sink: Arc<dyn SecretSink>,
    store: Arc<dyn TaskStore>,
    seed: Option<u64>,
    mac_key: Option<MacKey>,
    runtime_id: Option<Uuid>,
    cancel: Option<CancellationToken>,
}

impl SyncEngineBuilder {
    /// Seed the jitter source for reproducible horizons
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Use a persisted MAC key so drift detection survives restarts
    pub fn mac_key(mut self, key: MacKey) -> Self {
        self.mac_key = Some(key);
        self
    }

    /// Load the MAC key from `scheduler.mac_key_file`, creating the file on
    /// first use. Does nothing if the setting is absent or a key was given.
    pub async fn mac_key_from_config(mut self) -> CredsyncResult<Self> {
        if self.mac_key.is_none() {
            if let Some(path) = &self.config.scheduler.mac_key_file {
                self.mac_key = Some(MacKey::load_or_create(path).await?);
            }
        }
        Ok(self)
    }

    pub fn runtime_id(mut self, id: Uuid) -> Self {
        self.runtime_id = Some(id);
        self
    }

    /// Parent token for every event watcher
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn build(self) -> (SyncEngine, ResyncReceiver) {
        let horizon = Arc::new(match self.seed {
            Some(seed) => HorizonCalculator::seeded(seed),
            None => HorizonCalculator::new(),
        });
        let (resync, receiver) =
            resync_channel(self.config.watcher.max_resync_delay, Arc::clone(&horizon));
        let watchers = EventWatcherRegistry::new(
            self.config.watcher.clone(),
            Arc::clone(&self.provider),
            resync.clone(),
            self.cancel.unwrap_or_default(),
        );

        let engine = SyncEngine {
            backoff: BackoffRegistry::new(self.config.backoff.clone()),
            refs: ReferenceCache::new(),
            watchers,
            horizon,
            provider: self.provider,
            sink: self.sink,
            store: self.store,
            mac: self.mac_key.unwrap_or_else(|| {
                warn!("No MAC key configured; unchanged data is rewritten after a restart");
                MacKey::generate()
            }),
            runtime_id: self.runtime_id.unwrap_or_else(Uuid::new_v4),
            resync,
            force_sync: Mutex::new(HashSet::new()),
            client_index: Mutex::new(HashMap::new()),
            config: self.config,
        };
        (engine, receiver)
    }
}

/// The credential lifecycle scheduling engine
pub struct SyncEngine {
    config: Config,
    horizon: Arc<HorizonCalculator>,
    backoff: BackoffRegistry,
    refs: ReferenceCache,
    watchers: EventWatcherRegistry,
    provider: Arc<dyn ClientProvider>,
    sink: Arc<dyn SecretSink>,
    store: Arc<dyn TaskStore>,
    mac: MacKey,
    runtime_id: Uuid,
    resync: ResyncSender,
    force_sync: Mutex<HashSet<TaskKey>>,
    /// Client identity each task last used
    client_index: Mutex<HashMap<TaskKey, ClientCacheKey>>,
}

impl SyncEngine {
    pub fn builder(
        config: Config,
        provider: Arc<dyn ClientProvider>,
        sink: Arc<dyn SecretSink>,
        store: Arc<dyn TaskStore>,
    ) -> SyncEngineBuilder {
        SyncEngineBuilder {
            config,
            provider,
            sink,
            store,
            seed: None,
            mac_key: None,
            runtime_id: None,
            cancel: None,
        }
    }

    pub fn runtime_id(&self) -> Uuid {
        self.runtime_id
    }

    pub fn backoff(&self) -> &BackoffRegistry {
        &self.backoff
    }

    pub fn references(&self) -> &ReferenceCache {
        &self.refs
    }

    pub fn watchers(&self) -> &EventWatcherRegistry {
        &self.watchers
    }

    /// Make the task's next invocation a full sync
    pub fn force_sync(&self, key: &TaskKey) {
        self.forced().insert(key.clone());
    }

    pub fn is_forced(&self, key: &TaskKey) -> bool {
        self.forced().contains(key)
    }

    /// Accept a resync event from the channel before reconciling its task
    pub fn handle_resync(&self, event: &ResyncEvent) {
        debug!(task = %event.key, reason = %event.reason, "Resync requested");
        self.force_sync(&event.key);
    }

    /// Run one invocation for `task`, updating its status in place.
    ///
    /// Returns the horizon until the next invocation, or a failure carrying
    /// both the error and a retry horizon.
    pub async fn reconcile(&self, task: &mut SyncTask) -> Result<Duration, SyncFailure> {
        if task.deletion_requested {
            return self
                .teardown(task)
                .await
                .map(|()| Duration::ZERO)
                .map_err(|error| self.error_horizon_failure(error));
        }

        for kind in RefKind::all() {
            self.refs.set(*kind, &task.key, &task.referents(*kind));
        }

        if !task.has_finalizer() {
            self.store
                .add_finalizer(task)
                .await
                .map_err(|e| self.error_horizon_failure(store_error(task, e)))?;
            task.finalizers.push(FINALIZER.to_string());
        }

        let result = match self.sync(task).await {
            Ok(synced) => {
                self.backoff.delete(&task.key);
                self.record_success(task, &synced);
                info!(
                    task = %task.key,
                    fetched = synced.fetched,
                    horizon_ms = synced.horizon.as_millis() as u64,
                    "Reconciled task"
                );
                Ok(synced.horizon)
            }
            Err(error) => {
                let failure = self.fail(task, error);
                task.status
                    .set_condition(false, failure.error.reason(), failure.error.to_string());
                warn!(
                    task = %task.key,
                    error = %failure.error,
                    reason = failure.error.reason(),
                    retry_ms = failure.retry_after.as_millis() as u64,
                    "Sync failed"
                );
                Err(failure)
            }
        };
        task.status.last_runtime_id = Some(self.runtime_id);

        let persisted = self.store.update_status(task).await;
        self.reconcile_watcher(task).await;

        match (result, persisted) {
            (Ok(_), Err(e)) => Err(self.error_horizon_failure(store_error(task, e))),
            (Err(failure), Err(e)) => {
                warn!(task = %task.key, error = %e, "Failed to persist failed status");
                Err(failure)
            }
            (result, Ok(())) => result,
        }
    }

    /// Queue a resync for every task depending on `referent`.
    ///
    /// Returns the number of tasks notified.
    pub fn referent_changed(&self, kind: RefKind, referent: &ObjectKey) -> usize {
        let referrers = self.refs.get(kind, referent).unwrap_or_default();
        debug!(%kind, referent = %referent, referrers = referrers.len(), "Referent changed");
        self.fan_out(referrers, ResyncReason::Referent(kind))
    }

    /// Drop `referent` and queue a resync for its former dependents
    pub fn referent_deleted(&self, kind: RefKind, referent: &ObjectKey) -> usize {
        let referrers = self.refs.get(kind, referent).unwrap_or_default();
        self.refs.remove(kind, referent);
        info!(%kind, referent = %referent, referrers = referrers.len(), "Referent deleted");
        self.fan_out(referrers, ResyncReason::Referent(kind))
    }

    /// Force a sync of every task whose client shares `evicted`'s parent identity
    pub fn client_family_evicted(&self, evicted: &ClientCacheKey) -> Vec<TaskKey> {
        let mut affected: Vec<TaskKey> = self
            .clients()
            .iter()
            .filter(|(_, key)| key.same_parent(evicted))
            .map(|(task, _)| task.clone())
            .collect();
        affected.sort();
        info!(cache_key = %evicted, tasks = affected.len(), "Client family evicted");
        self.fan_out(affected.clone(), ResyncReason::ClientEvicted);
        affected
    }

    /// Stop every event watcher
    pub async fn shutdown(&self) {
        self.watchers.shutdown().await;
    }

    fn fan_out(&self, tasks: Vec<TaskKey>, reason: ResyncReason) -> usize {
        let count = tasks.len();
        for key in tasks {
            self.force_sync(&key);
            self.resync.send(key, reason.clone());
        }
        count
    }

    async fn teardown(&self, task: &mut SyncTask) -> CredsyncResult<()> {
        info!(task = %task.key, "Tearing down task");

        if let Some(lease) = held_lease(task) {
            match self.provider.client(task).await {
                Ok(client) => match client.revoke(&lease.id).await {
                    Ok(()) => info!(task = %task.key, lease_id = %lease.id, "Revoked lease"),
                    Err(e) => warn!(
                        task = %task.key,
                        lease_id = %lease.id,
                        error = %e,
                        "Failed to revoke lease"
                    ),
                },
                Err(e) => warn!(task = %task.key, error = %e, "No client to revoke lease with"),
            }
        }

        for kind in RefKind::all() {
            self.refs.prune(*kind, &task.key);
        }
        self.backoff.delete(&task.key);
        self.forced().remove(&task.key);
        self.clients().remove(&task.key);
        if let Err(e) = self.watchers.stop(&task.key).await {
            warn!(task = %task.key, error = %e, "Event watcher did not stop cleanly");
        }

        if task.has_finalizer() {
            self.store
                .remove_finalizer(task)
                .await
                .map_err(|e| store_error(task, e))?;
            task.finalizers.retain(|f| f != FINALIZER);
        }
        Ok(())
    }

    async fn sync(&self, task: &mut SyncTask) -> CredsyncResult<Synced> {
        let refresh_after = task.refresh_after()?;
        if let TaskKind::Dynamic { spec, .. } = &task.kind {
            RequestMethod::parse(&spec.request_method)?;
        }

        let client = self.provider.client(task).await.map_err(|e| match e {
            e @ CredsyncError::ClientAcquisition(_) => e,
            other => CredsyncError::ClientAcquisition(other.to_string()),
        })?;
        let client_key = client.cache_key().clone();
        self.clients().insert(task.key.clone(), client_key.clone());

        let client_changed = task
            .status
            .client_cache_key
            .as_deref()
            .is_some_and(|recorded| recorded != client_key.to_string());
        let forced = self.forced().remove(&task.key);
        let destination_missing = task.destination.create && !self.destination_exists(task).await?;

        let do_sync = task.is_first_sync()
            || forced
            || task.generation_changed()
            || destination_missing
            || client_changed;
        debug!(
            task = %task.key,
            do_sync,
            forced,
            destination_missing,
            client_changed,
            "Evaluated sync"
        );

        let synced = match &task.kind {
            TaskKind::Dynamic { spec, status } => {
                let spec = spec.clone();
                let previous = status.clone();
                let (status, synced) = self
                    .sync_dynamic(
                        task,
                        &spec,
                        &previous,
                        client.as_ref(),
                        do_sync,
                        refresh_after,
                        destination_missing,
                    )
                    .await?;
                if let TaskKind::Dynamic { status: slot, .. } = &mut task.kind {
                    *slot = status;
                }
                synced
            }
            TaskKind::Kv { .. } => {
                let synced = self
                    .sync_kv(task, client.as_ref(), refresh_after, destination_missing)
                    .await?;
                if let TaskKind::Kv { status, .. } = &mut task.kind {
                    *status = KvStatus {
                        last_read_time: Some(Utc::now()),
                    };
                }
                synced
            }
        };

        task.status.client_cache_key = Some(client_key.to_string());
        Ok(synced)
    }

    #[allow(clippy::too_many_arguments)]
    async fn sync_dynamic(
        &self,
        task: &SyncTask,
        spec: &DynamicSpec,
        previous: &DynamicStatus,
        client: &dyn CredentialSource,
        do_sync: bool,
        refresh_after: Option<Duration>,
        destination_missing: bool,
    ) -> CredsyncResult<(DynamicStatus, Synced)> {
        let percent = clamp_renewal_percent(
            spec.renewal_percent
                .unwrap_or(i32::from(self.config.scheduler.default_renewal_percent)),
        );

        if !do_sync {
            let failover = self.is_failover(task);
            match self.schedule(previous, percent, refresh_after) {
                Schedule::NotDue(_) if failover && self.config.scheduler.sync_on_failover => {
                    info!(task = %task.key, "Task last synced by another runtime, forcing sync");
                }
                Schedule::NotDue(horizon) => {
                    if failover {
                        info!(
                            task = %task.key,
                            horizon_ms = horizon.as_millis() as u64,
                            "Adopting task from another runtime"
                        );
                    }
                    return Ok((previous.clone(), Synced::requeue(horizon)));
                }
                Schedule::Renew(lease) => match self.renew(client, &lease).await {
                    Ok(resp) => return Ok(self.renewed(task, lease, &resp, percent)),
                    Err(e @ CredsyncError::LeaseTruncated { .. }) => {
                        info!(task = %task.key, reason = %e, "Lease truncated, re-issuing");
                    }
                    Err(e) => {
                        warn!(task = %task.key, error = %e, "Lease renewal failed, re-issuing");
                    }
                },
                Schedule::Due => {}
            }
        }

        let path = task.source_path();
        let resp = match RequestMethod::parse(&spec.request_method)? {
            RequestMethod::Get => client.read(&path).await?,
            RequestMethod::Put | RequestMethod::Post => client.write(&path, &spec.params).await?,
        };

        let (resp, static_creds) = match StaticCredsMeta::from_data(&resp.data) {
            Some(_) if spec.allow_static_creds => {
                let (meta, resp) = await_rotation(
                    client,
                    &path,
                    previous.static_creds.as_ref(),
                    &resp,
                    &self.config.rotation,
                )
                .await?;
                (resp, Some(meta))
            }
            _ => (resp, None),
        };

        let secret_mac = self.publish(task, &resp.data, destination_missing).await?;

        if spec.revoke && static_creds.is_none() {
            if let Some(old) = previous.lease.as_ref().filter(|l| !l.id.is_empty()) {
                if old.id != resp.lease_id {
                    if let Err(e) = client.revoke(&old.id).await {
                        warn!(
                            task = %task.key,
                            lease_id = %old.id,
                            error = %e,
                            "Failed to revoke superseded lease"
                        );
                    }
                }
            }
        }

        let (horizon, reason) = match &static_creds {
            Some(meta) => (self.horizon.static_horizon(meta.ttl()), REASON_ROTATED),
            None => match refresh_after {
                Some(interval) if resp.lease_duration == 0 => {
                    (self.horizon.horizon(interval), REASON_SYNCED)
                }
                _ => (
                    self.horizon
                        .dynamic_horizon(self.lease_duration(resp.lease_duration), percent),
                    REASON_SYNCED,
                ),
            },
        };

        let status = DynamicStatus {
            lease: static_creds.is_none().then(|| resp.lease_status()),
            static_creds,
            last_renewal_time: Some(Utc::now()),
        };
        let synced = Synced {
            horizon,
            condition: Some((reason, format!("Synced {}", path))),
            secret_mac: Some(secret_mac),
            fetched: true,
        };
        Ok((status, synced))
    }

    async fn sync_kv(
        &self,
        task: &SyncTask,
        client: &dyn CredentialSource,
        refresh_after: Option<Duration>,
        destination_missing: bool,
    ) -> CredsyncResult<Synced> {
        let path = task.source_path();
        let resp = client.read(&path).await?;
        let secret_mac = self.publish(task, &resp.data, destination_missing).await?;

        Ok(Synced {
            horizon: refresh_after.map_or(Duration::ZERO, |r| self.horizon.horizon(r)),
            condition: Some((REASON_SYNCED, format!("Synced {}", path))),
            secret_mac: Some(secret_mac),
            fetched: true,
        })
    }

    fn schedule(
        &self,
        previous: &DynamicStatus,
        percent: i32,
        refresh_after: Option<Duration>,
    ) -> Schedule {
        let Some(last) = previous.last_renewal_time else {
            return Schedule::Due;
        };

        if let Some(meta) = &previous.static_creds {
            let (horizon, in_window) =
                self.horizon
                    .relative_horizon(last, meta.ttl(), HorizonMode::Rotation);
            return if in_window {
                Schedule::Due
            } else {
                Schedule::NotDue(horizon)
            };
        }

        let Some(lease) = &previous.lease else {
            return Schedule::Due;
        };

        if let (0, Some(interval)) = (lease.duration, refresh_after) {
            let due_at = interval.saturating_sub(max_jitter(interval, JITTER_FRACTION));
            let elapsed = (Utc::now() - last).to_std().unwrap_or(Duration::ZERO);
            return if elapsed >= due_at {
                Schedule::Due
            } else {
                Schedule::NotDue(interval.saturating_sub(elapsed))
            };
        }

        let (horizon, in_window) = self.horizon.relative_horizon(
            last,
            self.lease_duration(lease.duration),
            HorizonMode::Renewal { percent },
        );
        if !in_window {
            Schedule::NotDue(horizon)
        } else if lease.renewable && !lease.id.is_empty() {
            Schedule::Renew(lease.clone())
        } else {
            Schedule::Due
        }
    }

    async fn renew(
        &self,
        client: &dyn CredentialSource,
        lease: &LeaseStatus,
    ) -> CredsyncResult<SecretResponse> {
        let resp = client
            .renew(&lease.id, Duration::from_secs(lease.duration))
            .await?;
        if resp.lease_duration < lease.duration {
            return Err(CredsyncError::LeaseTruncated {
                lease_id: lease.id.clone(),
                requested: lease.duration,
                granted: resp.lease_duration,
            });
        }
        Ok(resp)
    }

    fn renewed(
        &self,
        task: &SyncTask,
        mut lease: LeaseStatus,
        resp: &SecretResponse,
        percent: i32,
    ) -> (DynamicStatus, Synced) {
        lease.duration = resp.lease_duration;
        lease.renewable = resp.renewable;
        if !resp.request_id.is_empty() {
            lease.request_id = resp.request_id.clone();
        }
        debug!(task = %task.key, lease_id = %lease.id, duration = lease.duration, "Renewed lease");

        let horizon = self
            .horizon
            .dynamic_horizon(self.lease_duration(lease.duration), percent);
        let message = format!("Renewed lease {}", lease.id);
        let status = DynamicStatus {
            lease: Some(lease),
            static_creds: None,
            last_renewal_time: Some(Utc::now()),
        };
        let synced = Synced {
            horizon,
            condition: Some((REASON_RENEWED, message)),
            secret_mac: None,
            fetched: false,
        };
        (status, synced)
    }

    /// Write `data` to the destination unless its MAC shows nothing changed.
    ///
    /// Returns the MAC of the rendered data.
    async fn publish(
        &self,
        task: &SyncTask,
        data: &Map<String, Value>,
        force_write: bool,
    ) -> CredsyncResult<String> {
        let rendered = self.sink.render(task, data).map_err(|e| match e {
            e @ CredsyncError::Transformation { .. } => e,
            other => CredsyncError::Transformation {
                task: task.key.to_string(),
                reason: other.to_string(),
            },
        })?;
        let mac = self.mac.compute(&rendered)?;

        let unchanged = !force_write
            && !task.generation_changed()
            && task
                .status
                .secret_mac
                .as_deref()
                .map(|stored| self.mac.matches(stored, &rendered))
                .transpose()?
                .unwrap_or(false);
        if unchanged {
            debug!(
                task = %task.key,
                destination = %task.destination.name,
                "Data unchanged, skipping write"
            );
            return Ok(mac);
        }

        self.sink
            .write(task, &rendered)
            .await
            .map_err(|e| destination_error(task, e))?;
        info!(task = %task.key, destination = %task.destination.name, "Wrote destination");
        Ok(mac)
    }

    async fn destination_exists(&self, task: &SyncTask) -> CredsyncResult<bool> {
        self.sink
            .exists(&task.key.namespace, &task.destination.name)
            .await
            .map_err(|e| destination_error(task, e))
    }

    async fn reconcile_watcher(&self, task: &SyncTask) {
        if !task.instant_updates {
            if let Err(e) = self.watchers.stop(&task.key).await {
                warn!(task = %task.key, error = %e, "Event watcher did not stop cleanly");
            }
            return;
        }

        let ensured = match self.provider.client(task).await {
            Ok(client) => self.watchers.ensure(task, client).await,
            Err(e) => Err(e),
        };
        if let Err(e) = ensured {
            warn!(task = %task.key, error = %e, "Failed to start event watcher");
        }
    }

    fn record_success(&self, task: &mut SyncTask, synced: &Synced) {
        if let Some(mac) = &synced.secret_mac {
            task.status.secret_mac = Some(mac.clone());
        }
        if synced.fetched {
            task.status.last_generation = task.generation;
            task.status.last_sync_time = Some(Utc::now());
        }
        if let Some((reason, message)) = &synced.condition {
            task.status.set_condition(true, reason, message.clone());
        }
    }

    fn fail(&self, task: &SyncTask, error: CredsyncError) -> SyncFailure {
        if error.is_forbidden() {
            if let Some(key) = self.clients().get(&task.key).cloned() {
                self.provider.taint(&key);
            }
        }
        self.force_sync(&task.key);

        // Source failures back off per task; everything else waits out the
        // fixed error horizon.
        let retry_after = match &error {
            CredsyncError::ClientAcquisition(_) => {
                self.horizon.horizon(self.config.scheduler.error_horizon)
            }
            e if e.is_retryable() => self.backoff.get(&task.key).next_backoff(),
            _ => self.horizon.horizon(self.config.scheduler.error_horizon),
        };
        SyncFailure { retry_after, error }
    }

    fn error_horizon_failure(&self, error: CredsyncError) -> SyncFailure {
        SyncFailure {
            retry_after: self.horizon.horizon(self.config.scheduler.error_horizon),
            error,
        }
    }

    fn is_failover(&self, task: &SyncTask) -> bool {
        task.status
            .last_runtime_id
            .is_some_and(|id| id != self.runtime_id)
    }

    /// Zero-length leases get the configured minimum so jitter stays useful
    fn lease_duration(&self, secs: u64) -> Duration {
        if secs == 0 {
            self.config.scheduler.min_lease_horizon
        } else {
            Duration::from_secs(secs)
        }
    }

    fn forced(&self) -> MutexGuard<'_, HashSet<TaskKey>> {
        self.force_sync.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn clients(&self) -> MutexGuard<'_, HashMap<TaskKey, ClientCacheKey>> {
        self.client_index
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// The lease a dynamic task currently holds, if any
fn held_lease(task: &SyncTask) -> Option<&LeaseStatus> {
    match &task.kind {
        TaskKind::Dynamic { status, .. } if status.static_creds.is_none() => {
            status.lease.as_ref().filter(|l| !l.id.is_empty())
        }
        _ => None,
    }
}

fn store_error(task: &SyncTask, e: CredsyncError) -> CredsyncError {
    match e {
        e @ CredsyncError::Store { .. } => e,
        other => CredsyncError::Store {
            task: task.key.to_string(),
            reason: other.to_string(),
        },
    }
}

fn destination_error(task: &SyncTask, e: CredsyncError) -> CredsyncError {
    match e {
        e @ CredsyncError::DestinationWrite { .. } => e,
        other => CredsyncError::DestinationWrite {
            destination: format!("{}/{}", task.key.namespace, task.destination.name),
            reason: other.to_string(),
        },
    }
}
