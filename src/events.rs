//! Resync event channel
//!
//! Out-of-band "please reconcile this task" signals travel through here: from
//! event watchers, referent changes and client evictions. Signals are
//! identified by task alone, so a task already waiting in the queue is not
//! queued twice. Each signal is delayed by a small random amount so a burst of
//! matching events doesn't turn into a burst of syncs.

use crate::horizon::HorizonCalculator;
use crate::refcache::RefKind;
use crate::task::TaskKey;
use futures_util::StreamExt;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::time::DelayQueue;
use tracing::debug;

/// Why a resync was requested
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResyncReason {
    /// The source reported a modification at the task's path
    SourceModified,
    /// The task's event watcher gave up after repeated errors
    WatcherFailed,
    /// A shared object the task depends on changed or went away
    Referent(RefKind),
    /// The task's cached client was evicted
    ClientEvicted,
}

impl fmt::Display for ResyncReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SourceModified => write!(f, "source-modified"),
            Self::WatcherFailed => write!(f, "watcher-failed"),
            Self::Referent(kind) => write!(f, "{}-changed", kind),
            Self::ClientEvicted => write!(f, "client-evicted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResyncEvent {
    pub key: TaskKey,
    pub reason: ResyncReason,
}

type Pending = Arc<Mutex<HashSet<TaskKey>>>;

fn lock(pending: &Pending) -> MutexGuard<'_, HashSet<TaskKey>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Create a connected sender/receiver pair
pub fn resync_channel(
    max_delay: Duration,
    jitter: Arc<HorizonCalculator>,
) -> (ResyncSender, ResyncReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let pending: Pending = Arc::default();
    (
        ResyncSender {
            tx,
            pending: Arc::clone(&pending),
            max_delay,
            jitter,
        },
        ResyncReceiver {
            rx,
            pending,
            queue: DelayQueue::new(),
            closed: false,
        },
    )
}

/// Sending half; cheap to clone
#[derive(Clone)]
pub struct ResyncSender {
    tx: mpsc::UnboundedSender<(ResyncEvent, Duration)>,
    pending: Pending,
    max_delay: Duration,
    jitter: Arc<HorizonCalculator>,
}

impl ResyncSender {
    /// Queue a resync for `key`.
    ///
    /// Returns false if one is already pending or the receiver is gone.
    pub fn send(&self, key: TaskKey, reason: ResyncReason) -> bool {
        if !lock(&self.pending).insert(key.clone()) {
            debug!(task = %key, %reason, "Resync already pending");
            return false;
        }

        let delay = self.jitter.jitter(self.max_delay);
        let event = ResyncEvent {
            key: key.clone(),
            reason,
        };
        if self.tx.send((event, delay)).is_err() {
            lock(&self.pending).remove(&key);
            return false;
        }
        debug!(task = %key, delay_ms = delay.as_millis() as u64, "Queued resync");
        true
    }

    pub fn is_pending(&self, key: &TaskKey) -> bool {
        lock(&self.pending).contains(key)
    }
}

/// Receiving half, owned by the driver
pub struct ResyncReceiver {
    rx: mpsc::UnboundedReceiver<(ResyncEvent, Duration)>,
    pending: Pending,
    queue: DelayQueue<ResyncEvent>,
    closed: bool,
}

impl ResyncReceiver {
    /// Next event whose delay has elapsed.
    ///
    /// Returns `None` once every sender is dropped and the queue is drained.
    pub async fn recv(&mut self) -> Option<ResyncEvent> {
        loop {
            tokio::select! {
                incoming = self.rx.recv(), if !self.closed => match incoming {
                    Some((event, delay)) => {
                        self.queue.insert(event, delay);
                    }
                    None => self.closed = true,
                },
                Some(expired) = self.queue.next(), if !self.queue.is_empty() => {
                    let event = expired.into_inner();
                    lock(&self.pending).remove(&event.key);
                    return Some(event);
                }
                else => return None,
            }
        }
    }
}
