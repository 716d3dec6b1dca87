//! Event envelope decoding and filtering

use crate::error::{CredsyncError, CredsyncResult};
use crate::task::SyncTask;
use serde::{Deserialize, Deserializer};

#[derive(Debug, Deserialize)]
struct Envelope {
    data: EnvelopeData,
}

#[derive(Debug, Deserialize)]
struct EnvelopeData {
    #[serde(default)]
    namespace: String,
    event: EnvelopeEvent,
}

#[derive(Debug, Deserialize)]
struct EnvelopeEvent {
    metadata: EventMetadata,
}

#[derive(Debug, Deserialize)]
struct EventMetadata {
    #[serde(default)]
    path: String,
    #[serde(default, deserialize_with = "bool_or_string")]
    modified: bool,
}

/// The fields of an event the watcher cares about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventMessage {
    pub namespace: String,
    pub path: String,
    pub modified: bool,
}

/// Decode one raw message from the subscription stream
pub fn decode(raw: &[u8]) -> CredsyncResult<EventMessage> {
    let envelope: Envelope =
        serde_json::from_slice(raw).map_err(|e| CredsyncError::EventDecode(e.to_string()))?;
    Ok(EventMessage {
        namespace: envelope.data.namespace,
        path: envelope.data.event.metadata.path,
        modified: envelope.data.event.metadata.modified,
    })
}

/// Namespace and path a watcher filters events against
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchTarget {
    pub namespace: String,
    pub path: String,
    /// Event types requested from the subscription endpoint
    pub event_types: String,
}

impl WatchTarget {
    pub fn for_task(task: &SyncTask) -> Self {
        Self {
            namespace: normalize(task.source_namespace.as_deref().unwrap_or_default()).to_string(),
            path: task.source_path(),
            event_types: format!("{}*", task.kind.name()),
        }
    }

    /// Only modifications at exactly this namespace and path match
    pub fn matches(&self, message: &EventMessage) -> bool {
        message.modified
            && normalize(&message.namespace) == self.namespace
            && normalize(&message.path) == normalize(&self.path)
    }
}

fn normalize(s: &str) -> &str {
    s.trim_matches('/')
}

fn bool_or_string<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Str(String),
    }

    match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => Ok(b),
        Flag::Str(s) => s
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid boolean {s:?}"))),
    }
}
