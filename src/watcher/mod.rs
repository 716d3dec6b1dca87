//! Event watcher registry
//!
//! Owns at most one running watcher per task. A watcher whose generation or
//! client identity has gone stale is cancelled and waited on before its
//! replacement starts.

pub mod message;
mod supervisor;

pub use message::{decode, EventMessage, WatchTarget};

use crate::config::schema::WatcherConfig;
use crate::error::{CredsyncError, CredsyncResult};
use crate::events::ResyncSender;
use crate::source::{ClientCacheKey, ClientProvider, CredentialSource};
use crate::task::{SyncTask, TaskKey};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use supervisor::Watcher;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle of one watcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    /// Opening the subscription stream
    Starting,
    Running,
    /// Waiting to reconnect after `errors` consecutive stream errors
    ErrorBackoff { errors: u32 },
    Stopping,
    Stopped,
}

impl WatcherState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped)
    }
}

impl fmt::Display for WatcherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::ErrorBackoff { errors } => write!(f, "error-backoff ({errors} errors)"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

struct WatcherMeta {
    cancel: CancellationToken,
    state: watch::Receiver<WatcherState>,
    generation: i64,
    client_key: Arc<Mutex<ClientCacheKey>>,
}

impl WatcherMeta {
    fn is_alive(&self) -> bool {
        self.state.has_changed().is_ok() && !self.state.borrow().is_terminal()
    }

    fn client_key(&self) -> ClientCacheKey {
        self.client_key
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// A cancelled watcher is on its way out and never current
    fn is_current(&self, generation: i64, client_key: &ClientCacheKey) -> bool {
        !self.cancel.is_cancelled()
            && self.generation == generation
            && self.client_key() == *client_key
    }

    /// Cancel the watcher, returning a receiver to wait on its completion
    fn begin_stop(&self) -> watch::Receiver<WatcherState> {
        self.cancel.cancel();
        self.state.clone()
    }
}

/// Supervises the event watchers of every task with instant updates enabled
pub struct EventWatcherRegistry {
    config: WatcherConfig,
    provider: Arc<dyn ClientProvider>,
    resync: ResyncSender,
    parent: CancellationToken,
    watchers: AsyncMutex<HashMap<TaskKey, WatcherMeta>>,
}

impl EventWatcherRegistry {
    /// Watchers run on child tokens of `parent`; cancelling it stops them all
    pub fn new(
        config: WatcherConfig,
        provider: Arc<dyn ClientProvider>,
        resync: ResyncSender,
        parent: CancellationToken,
    ) -> Self {
        Self {
            config,
            provider,
            resync,
            parent,
            watchers: AsyncMutex::new(HashMap::new()),
        }
    }

    /// Make sure a current watcher is running for `task`.
    ///
    /// A no-op when a live watcher was started for the same generation and
    /// client identity. Returns whether a new watcher was started.
    pub async fn ensure(
        &self,
        task: &SyncTask,
        client: Arc<dyn CredentialSource>,
    ) -> CredsyncResult<bool> {
        let key = task.key.clone();
        let client_key = client.cache_key().clone();

        // The stale entry stays registered until its watcher has stopped, so
        // a timed out replacement is retried on the next call
        let stale = {
            let watchers = self.watchers.lock().await;
            match watchers.get(&key) {
                Some(meta) if meta.is_alive() && meta.is_current(task.generation, &client_key) => {
                    debug!(task = %key, "Event watcher already current");
                    return Ok(false);
                }
                Some(meta) => Some((meta.generation, meta.begin_stop())),
                None => None,
            }
        };

        if let Some((old_generation, state)) = stale {
            info!(
                task = %key,
                old_generation,
                generation = task.generation,
                "Replacing stale event watcher"
            );
            self.wait_stopped(&key, state).await?;
        }

        let meta = self.spawn(task, client);
        if let Some(previous) = self.watchers.lock().await.insert(key, meta) {
            previous.cancel.cancel();
        }
        Ok(true)
    }

    /// Cancel the task's watcher and wait for it to stop.
    ///
    /// Returns false if the task had no watcher. On timeout the watcher stays
    /// registered in its cancelled state.
    pub async fn stop(&self, key: &TaskKey) -> CredsyncResult<bool> {
        let state = self.watchers.lock().await.get(key).map(WatcherMeta::begin_stop);
        let Some(state) = state else {
            return Ok(false);
        };
        self.wait_stopped(key, state).await?;
        if let Some(meta) = self.watchers.lock().await.remove(key) {
            meta.cancel.cancel();
        }
        info!(task = %key, "Removed event watcher");
        Ok(true)
    }

    /// Current state of the task's watcher, if one is registered
    pub async fn state(&self, key: &TaskKey) -> Option<WatcherState> {
        self.watchers
            .lock()
            .await
            .get(key)
            .map(|meta| *meta.state.borrow())
    }

    /// Whether a live watcher is registered for the task
    pub async fn is_running(&self, key: &TaskKey) -> bool {
        self.watchers
            .lock()
            .await
            .get(key)
            .is_some_and(WatcherMeta::is_alive)
    }

    /// Client identity the task's watcher is currently using
    pub async fn client_key(&self, key: &TaskKey) -> Option<ClientCacheKey> {
        self.watchers
            .lock()
            .await
            .get(key)
            .map(WatcherMeta::client_key)
    }

    pub async fn len(&self) -> usize {
        self.watchers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Stop every watcher
    pub async fn shutdown(&self) {
        self.parent.cancel();
        let drained: Vec<_> = self.watchers.lock().await.drain().collect();
        for (key, meta) in drained {
            if let Err(err) = self.wait_stopped(&key, meta.begin_stop()).await {
                warn!(task = %key, error = %err, "Event watcher did not stop");
            }
        }
    }

    fn spawn(&self, task: &SyncTask, client: Arc<dyn CredentialSource>) -> WatcherMeta {
        let cancel = self.parent.child_token();
        let (state_tx, state_rx) = watch::channel(WatcherState::Starting);
        let client_key = Arc::new(Mutex::new(client.cache_key().clone()));

        let watcher = Watcher {
            task: task.clone(),
            target: WatchTarget::for_task(task),
            client,
            client_key: Arc::clone(&client_key),
            provider: Arc::clone(&self.provider),
            resync: self.resync.clone(),
            cancel: cancel.clone(),
            state: state_tx,
            config: self.config.clone(),
        };
        tokio::spawn(watcher.run());

        WatcherMeta {
            cancel,
            state: state_rx,
            generation: task.generation,
            client_key,
        }
    }

    async fn wait_stopped(
        &self,
        key: &TaskKey,
        mut state: watch::Receiver<WatcherState>,
    ) -> CredsyncResult<()> {
        let timeout = self.config.replace_timeout;
        let stopped = tokio::time::timeout(timeout, async {
            // A dropped sender means the watcher task is gone too
            let _ = state.wait_for(WatcherState::is_terminal).await;
        })
        .await
        .is_ok();

        if stopped {
            Ok(())
        } else {
            warn!(
                task = %key,
                timeout_ms = timeout.as_millis() as u64,
                "Event watcher still stopping"
            );
            Err(CredsyncError::WatcherStopTimeout {
                task: key.to_string(),
                timeout,
            })
        }
    }
}
