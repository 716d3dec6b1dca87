//! The per-task watcher loop
//!
//! Keeps one subscription stream open, turns matching events into resync
//! signals, and reconnects with exponential backoff after stream errors.

use super::message::{decode, WatchTarget};
use super::WatcherState;
use crate::backoff::ExponentialBackoff;
use crate::config::schema::{BackoffConfig, WatcherConfig};
use crate::error::{CredsyncError, CredsyncResult};
use crate::events::{ResyncReason, ResyncSender};
use crate::source::{ClientCacheKey, ClientProvider, CredentialSource};
use crate::task::{SyncTask, TaskKey};
use futures_util::StreamExt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Repeats of the same error logged at WARN before dropping to DEBUG
pub(crate) const MAX_CONSECUTIVE_SAME_ERROR: u32 = 3;

const RECONNECT_MULTIPLIER: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ErrorKey {
    ClientDerive,
    StreamRead,
    Decode,
}

impl ErrorKey {
    fn of(err: &CredsyncError) -> Self {
        match err {
            CredsyncError::EventDecode(_) => Self::Decode,
            CredsyncError::ClientAcquisition(_) => Self::ClientDerive,
            _ => Self::StreamRead,
        }
    }
}

/// Tracks repeated errors so a flapping stream doesn't flood the log
pub(crate) struct ErrorTracker {
    last_error_kind: Option<ErrorKey>,
    consecutive_same_error: u32,
    max_consecutive: u32,
}

impl ErrorTracker {
    pub(crate) fn new(max_consecutive: u32) -> Self {
        Self {
            last_error_kind: None,
            consecutive_same_error: 0,
            max_consecutive,
        }
    }

    /// Record an error; returns whether it should be logged at WARN
    pub(crate) fn record_error(&mut self, kind: ErrorKey) -> bool {
        let should_warn = self.last_error_kind != Some(kind)
            || self.consecutive_same_error < self.max_consecutive;

        if self.last_error_kind == Some(kind) {
            self.consecutive_same_error += 1;
        } else {
            self.consecutive_same_error = 1;
            self.last_error_kind = Some(kind);
        }
        should_warn
    }

    pub(crate) fn reset(&mut self) {
        self.consecutive_same_error = 0;
        self.last_error_kind = None;
    }
}

/// Sleep for `dur`; returns true if cancelled first
pub(crate) async fn sleep_or_cancel(token: &CancellationToken, dur: Duration) -> bool {
    tokio::select! {
        () = token.cancelled() => true,
        () = sleep(dur) => false,
    }
}

enum StreamEnd {
    Cancelled,
    Closed,
    Failed(CredsyncError),
}

struct StreamResult {
    end: StreamEnd,
    /// At least one message decoded cleanly
    delivered: bool,
}

pub(crate) struct Watcher {
    pub(crate) task: SyncTask,
    pub(crate) target: WatchTarget,
    pub(crate) client: Arc<dyn CredentialSource>,
    pub(crate) client_key: Arc<Mutex<ClientCacheKey>>,
    pub(crate) provider: Arc<dyn ClientProvider>,
    pub(crate) resync: ResyncSender,
    pub(crate) cancel: CancellationToken,
    pub(crate) state: watch::Sender<WatcherState>,
    pub(crate) config: WatcherConfig,
}

impl Watcher {
    fn key(&self) -> &TaskKey {
        &self.task.key
    }

    pub(crate) async fn run(mut self) {
        info!(task = %self.key(), path = %self.target.path, "Starting event watcher");

        let mut backoff = ExponentialBackoff::new(&BackoffConfig {
            initial_interval: self.config.min_backoff,
            multiplier: RECONNECT_MULTIPLIER,
            max_interval: self.config.max_backoff,
            max_elapsed: None,
        });
        let mut tracker = ErrorTracker::new(MAX_CONSECUTIVE_SAME_ERROR);
        let mut errors = 0u32;
        let mut rederive = false;

        loop {
            if self.cancel.is_cancelled() {
                debug!(task = %self.key(), "Watcher cancelled");
                break;
            }

            let result = if rederive {
                match self.rederive_client().await {
                    Ok(true) => self.watch_once().await,
                    Ok(false) => ended(StreamEnd::Cancelled, false),
                    Err(err) => ended(StreamEnd::Failed(err), false),
                }
            } else {
                self.watch_once().await
            };

            if result.delivered {
                errors = 0;
                tracker.reset();
                backoff.reset();
            }

            let err = match result.end {
                StreamEnd::Cancelled => {
                    debug!(task = %self.key(), "Watcher cancelled");
                    break;
                }
                StreamEnd::Closed => {
                    info!(task = %self.key(), "Event stream closed");
                    break;
                }
                StreamEnd::Failed(err) => err,
            };

            errors += 1;
            if errors > self.config.error_threshold {
                warn!(
                    task = %self.key(),
                    errors,
                    threshold = self.config.error_threshold,
                    error = %err,
                    "Event watcher exceeded error threshold, forcing resync"
                );
                self.resync.send(self.key().clone(), ResyncReason::WatcherFailed);
                break;
            }

            rederive = err.is_forbidden();
            let delay = backoff
                .next_backoff()
                .unwrap_or_else(|| backoff.max_interval());
            self.state.send_replace(WatcherState::ErrorBackoff { errors });

            if tracker.record_error(ErrorKey::of(&err)) {
                warn!(
                    task = %self.key(),
                    error = %err,
                    errors,
                    backoff_ms = delay.as_millis() as u64,
                    "Event stream failed; reconnecting"
                );
            } else {
                debug!(
                    task = %self.key(),
                    error = %err,
                    errors,
                    backoff_ms = delay.as_millis() as u64,
                    "Event stream failed (repeated); reconnecting"
                );
            }

            if sleep_or_cancel(&self.cancel, delay).await {
                debug!(task = %self.key(), "Watcher cancelled during backoff");
                break;
            }
        }

        self.state.send_replace(WatcherState::Stopping);
        info!(task = %self.key(), "Event watcher stopped");
        self.state.send_replace(WatcherState::Stopped);
    }

    /// Replace a client the source refused with a freshly derived one.
    ///
    /// Returns false if cancelled before the provider answered.
    async fn rederive_client(&mut self) -> CredsyncResult<bool> {
        self.provider.taint(self.client.cache_key());
        let derived = tokio::select! {
            () = self.cancel.cancelled() => return Ok(false),
            derived = self.provider.client(&self.task) => derived,
        };
        let client = derived.map_err(|e| CredsyncError::ClientAcquisition(e.to_string()))?;
        let key = client.cache_key().clone();
        info!(task = %self.key(), cache_key = %key, "Watcher re-derived client");
        *self
            .client_key
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = key;
        self.client = client;
        Ok(true)
    }

    async fn watch_once(&self) -> StreamResult {
        self.state.send_replace(WatcherState::Starting);

        let opened = tokio::select! {
            () = self.cancel.cancelled() => None,
            opened = self.client.subscribe(&self.target.event_types) => Some(opened),
        };
        let mut stream = match opened {
            None => return ended(StreamEnd::Cancelled, false),
            Some(Err(err)) => return ended(StreamEnd::Failed(err), false),
            Some(Ok(stream)) => stream,
        };

        self.state.send_replace(WatcherState::Running);
        info!(
            task = %self.key(),
            event_types = %self.target.event_types,
            "Connected to event stream"
        );

        let mut delivered = false;
        loop {
            let next = tokio::select! {
                () = self.cancel.cancelled() => return ended(StreamEnd::Cancelled, delivered),
                next = stream.next() => next,
            };
            let raw = match next {
                None => return ended(StreamEnd::Closed, delivered),
                Some(Err(err)) => return ended(StreamEnd::Failed(err), delivered),
                Some(Ok(raw)) => raw,
            };
            let message = match decode(&raw) {
                Ok(message) => message,
                Err(err) => return ended(StreamEnd::Failed(err), delivered),
            };
            delivered = true;

            if self.target.matches(&message) {
                debug!(task = %self.key(), path = %message.path, "Matching modification event");
                self.resync
                    .send(self.key().clone(), ResyncReason::SourceModified);
            } else {
                trace!(
                    task = %self.key(),
                    namespace = %message.namespace,
                    path = %message.path,
                    modified = message.modified,
                    "Ignoring event"
                );
            }
        }
    }
}

fn ended(end: StreamEnd, delivered: bool) -> StreamResult {
    StreamResult { end, delivered }
}
