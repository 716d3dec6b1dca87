//! Sync task declarations and their persisted status
//!
//! A task mirrors one credential from the credential source into a
//! destination. Each kind carries its own typed spec and status.

use crate::error::{CredsyncError, CredsyncResult};
use crate::refcache::RefKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Finalizer guarding a task until its teardown has run
pub const FINALIZER: &str = "credsync.io/finalizer";

/// Stable (namespace, name) identity of a declared object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

/// Identity of a sync task
pub type TaskKey = ObjectKey;

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A shared configuration object this task depends on
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dependency {
    pub kind: RefKind,
    pub referent: ObjectKey,
}

/// Where resolved data is written
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    /// Name of the destination secret
    pub name: String,

    /// Create the destination if it doesn't exist
    #[serde(default)]
    pub create: bool,
}

/// How the credential is requested from the source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMethod {
    Get,
    Put,
    Post,
}

impl RequestMethod {
    /// Parse a declared method; empty means GET
    pub fn parse(method: &str) -> CredsyncResult<Self> {
        match method.to_ascii_uppercase().as_str() {
            "" | "GET" => Ok(Self::Get),
            "PUT" => Ok(Self::Put),
            "POST" => Ok(Self::Post),
            other => Err(CredsyncError::UnsupportedMethod(other.to_string())),
        }
    }
}

/// Lease metadata recorded after every fetch or renewal
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseStatus {
    pub id: String,
    /// Lease duration in seconds
    pub duration: u64,
    pub renewable: bool,
    pub request_id: String,
}

/// Rotation metadata for credentials rotated by the source itself
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticCredsMeta {
    /// Unix timestamp of the last rotation
    pub last_rotation: i64,
    /// Rotation period in seconds
    pub rotation_period: u64,
    /// Cron-style rotation schedule
    pub rotation_schedule: String,
    /// Remaining TTL in seconds as of the last read
    pub ttl: u64,
}

impl StaticCredsMeta {
    /// Extract rotation metadata from a response body.
    ///
    /// Returns `None` unless the body carries a rotation timestamp and either a
    /// period or a schedule.
    pub fn from_data(data: &Map<String, Value>) -> Option<Self> {
        let last_rotation = match data.get("last_vault_rotation")? {
            Value::String(s) => DateTime::parse_from_rfc3339(s).ok()?.timestamp(),
            Value::Number(n) => n.as_i64()?,
            _ => return None,
        };
        let meta = Self {
            last_rotation,
            rotation_period: data.get("rotation_period").and_then(as_u64).unwrap_or(0),
            rotation_schedule: data
                .get("rotation_schedule")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            ttl: data.get("ttl").and_then(as_u64).unwrap_or(0),
        };
        meta.is_static().then_some(meta)
    }

    pub fn is_static(&self) -> bool {
        self.last_rotation > 0 && (self.rotation_period > 0 || !self.rotation_schedule.is_empty())
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl)
    }
}

fn as_u64(v: &Value) -> Option<u64> {
    match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Dynamic credential spec: a lease issued per request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DynamicSpec {
    pub mount: String,
    pub path: String,

    /// GET, PUT or POST
    #[serde(default)]
    pub request_method: String,

    /// Parameters sent with PUT/POST requests
    #[serde(default)]
    pub params: Map<String, Value>,

    /// Percentage of the lease duration after which renewal starts
    #[serde(default)]
    pub renewal_percent: Option<i32>,

    /// Fixed refresh interval for non-leased responses, e.g. "30m"
    #[serde(default)]
    pub refresh_after: Option<String>,

    /// Accept credentials rotated by the source itself
    #[serde(default)]
    pub allow_static_creds: bool,

    /// Revoke the superseded lease when credentials are re-issued.
    ///
    /// Teardown revokes a held lease whether or not this is set.
    #[serde(default)]
    pub revoke: bool,
}

/// Dynamic credential status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicStatus {
    pub lease: Option<LeaseStatus>,
    pub static_creds: Option<StaticCredsMeta>,
    pub last_renewal_time: Option<DateTime<Utc>>,
}

/// Plain key/value secret spec, refreshed on a fixed interval
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvSpec {
    pub mount: String,
    pub path: String,
    #[serde(default)]
    pub refresh_after: Option<String>,
}

/// Plain key/value secret status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvStatus {
    pub last_read_time: Option<DateTime<Utc>>,
}

/// The closed set of task kinds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TaskKind {
    Dynamic {
        spec: DynamicSpec,
        #[serde(default)]
        status: DynamicStatus,
    },
    Kv {
        spec: KvSpec,
        #[serde(default)]
        status: KvStatus,
    },
}

impl TaskKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Dynamic { .. } => "dynamic",
            Self::Kv { .. } => "kv",
        }
    }

    /// Mount and path on the credential source
    pub fn location(&self) -> (&str, &str) {
        match self {
            Self::Dynamic { spec, .. } => (&spec.mount, &spec.path),
            Self::Kv { spec, .. } => (&spec.mount, &spec.path),
        }
    }

    fn refresh_after_raw(&self) -> Option<&str> {
        match self {
            Self::Dynamic { spec, .. } => spec.refresh_after.as_deref(),
            Self::Kv { spec, .. } => spec.refresh_after.as_deref(),
        }
    }
}

/// Outcome of the last invocation, surfaced to observability tooling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCondition {
    pub ready: bool,
    pub reason: String,
    pub message: String,
    pub last_transition: DateTime<Utc>,
}

/// Status fields shared by every task kind
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    /// Generation of the declaration last synced successfully
    pub last_generation: i64,

    /// Keyed MAC of the last synced data
    pub secret_mac: Option<String>,

    /// Cache key of the client used for the last sync
    pub client_cache_key: Option<String>,

    /// Runtime that wrote this status
    pub last_runtime_id: Option<Uuid>,

    pub last_sync_time: Option<DateTime<Utc>>,

    pub condition: Option<SyncCondition>,
}

impl SyncStatus {
    /// Record the invocation outcome.
    ///
    /// The transition time only moves when readiness or reason changes.
    pub fn set_condition(&mut self, ready: bool, reason: &str, message: impl Into<String>) {
        let message = message.into();
        let last_transition = match &self.condition {
            Some(c) if c.ready == ready && c.reason == reason => c.last_transition,
            _ => Utc::now(),
        };
        self.condition = Some(SyncCondition {
            ready,
            reason: reason.to_string(),
            message,
            last_transition,
        });
    }
}

/// One declared sync unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncTask {
    pub key: TaskKey,

    /// Increments whenever the declaration changes
    pub generation: i64,

    #[serde(default)]
    pub deletion_requested: bool,

    #[serde(default)]
    pub finalizers: Vec<String>,

    /// Logical namespace on the credential source
    #[serde(default)]
    pub source_namespace: Option<String>,

    pub destination: Destination,

    #[serde(default)]
    pub dependencies: Vec<Dependency>,

    /// Keep a push-invalidation watcher running for this task
    #[serde(default)]
    pub instant_updates: bool,

    pub kind: TaskKind,

    #[serde(default)]
    pub status: SyncStatus,
}

impl SyncTask {
    /// Full source path, `mount/path`
    pub fn source_path(&self) -> String {
        let (mount, path) = self.kind.location();
        format!(
            "{}/{}",
            mount.trim_matches('/'),
            path.trim_start_matches('/')
        )
    }

    pub fn is_first_sync(&self) -> bool {
        self.status.last_generation == 0 && self.status.last_sync_time.is_none()
    }

    pub fn generation_changed(&self) -> bool {
        self.status.last_generation != self.generation
    }

    pub fn has_finalizer(&self) -> bool {
        self.finalizers.iter().any(|f| f == FINALIZER)
    }

    /// Parsed fixed refresh interval, if one is declared
    pub fn refresh_after(&self) -> CredsyncResult<Option<Duration>> {
        match self.kind.refresh_after_raw() {
            None | Some("") => Ok(None),
            Some(raw) => humantime::parse_duration(raw)
                .map(Some)
                .map_err(|e| CredsyncError::field("refreshAfter", format!("{raw:?}: {e}"))),
        }
    }

    /// Dependencies of one kind
    pub fn referents(&self, kind: RefKind) -> Vec<ObjectKey> {
        self.dependencies
            .iter()
            .filter(|d| d.kind == kind)
            .map(|d| d.referent.clone())
            .collect()
    }
}
