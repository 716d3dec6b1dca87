//! credsync - credential lifecycle scheduling and caching engine
//!
//! Decides when each declared sync task must next contact the credential
//! source, how it backs off after failures, how invalidation fans out across
//! dependent tasks, and runs per-task event watchers that can trigger an
//! early refresh.

pub mod backoff;
pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod horizon;
pub mod mac;
pub mod refcache;
pub mod rotation;
pub mod scheduler;
pub mod source;
pub mod store;
pub mod task;
pub mod watcher;

pub use error::{CredsyncError, CredsyncResult, SyncFailure};
pub use scheduler::{SyncEngine, SyncEngineBuilder};
