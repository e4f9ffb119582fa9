//! Aggregate identities and the events appended to their logs.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TributaryError};
use crate::transport::SUBJECT_SEPARATOR;

/// Characters that would turn a subject into a pattern.
const WILDCARD_CHARS: [char; 2] = ['*', '>'];

// =============================================================================
// Aggregate
// =============================================================================

/// Identity of an event-sourced entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Aggregate {
    /// Groups aggregates for bulk subscription, e.g. `invocation`
    #[serde(rename = "type")]
    pub typ: String,
    /// Unique within the type
    pub id: String,
}

impl Aggregate {
    pub fn new(typ: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            typ: typ.into(),
            id: id.into(),
        }
    }

    /// Check that this identity can address a subject.
    ///
    /// Both parts must be non-empty and free of wildcards. The type must not
    /// contain the subject separator; the id may, because subjects are parsed
    /// by splitting on the first separator only.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(TributaryError::invalid_aggregate(format!(
                "aggregate '{}' has an empty id",
                self
            )));
        }
        validate_type(&self.typ)?;
        if has_wildcard(&self.id) {
            return Err(TributaryError::invalid_aggregate(format!(
                "aggregate '{}' contains a wildcard character",
                self
            )));
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }
}

/// Check that an aggregate type can name a subject prefix: non-empty, without
/// the separator or wildcards.
pub fn validate_type(typ: &str) -> Result<()> {
    if typ.is_empty() {
        return Err(TributaryError::invalid_aggregate("aggregate type is empty"));
    }
    if typ.contains(SUBJECT_SEPARATOR) {
        return Err(TributaryError::invalid_aggregate(format!(
            "aggregate type '{}' contains '{}'",
            typ, SUBJECT_SEPARATOR
        )));
    }
    if has_wildcard(typ) {
        return Err(TributaryError::invalid_aggregate(format!(
            "aggregate type '{}' contains a wildcard character",
            typ
        )));
    }
    Ok(())
}

fn has_wildcard(s: &str) -> bool {
    s.chars().any(|c| WILDCARD_CHARS.contains(&c))
}

impl fmt::Display for Aggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.typ, self.id)
    }
}

// =============================================================================
// Event
// =============================================================================

/// An immutable fact appended to an aggregate's log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event id; assigned from the transport sequence on read when empty
    #[serde(default)]
    pub id: String,

    /// Event type, e.g. `InvocationCompleted`
    #[serde(rename = "type")]
    pub event_type: String,

    /// Entity the event is about
    pub aggregate: Aggregate,

    /// When set, the event is stored in the parent's log instead
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Aggregate>,

    /// Opaque payload
    #[serde(default)]
    pub data: serde_json::Value,

    /// When the event was created
    pub timestamp: DateTime<Utc>,

    /// Free-form string annotations
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,

    /// Position in the stream that holds the event; only set on read
    #[serde(skip)]
    pub sequence: Option<u64>,
}

impl Event {
    /// Create an event with no id; the store assigns one on read.
    pub fn new(event_type: impl Into<String>, aggregate: Aggregate, data: serde_json::Value) -> Self {
        Self {
            id: String::new(),
            event_type: event_type.into(),
            aggregate,
            parent: None,
            data,
            timestamp: Utc::now(),
            metadata: HashMap::new(),
            sequence: None,
        }
    }

    /// Fold this event into the parent's log.
    pub fn with_parent(mut self, parent: Aggregate) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// The aggregate whose log physically holds this event.
    pub fn stream_aggregate(&self) -> &Aggregate {
        self.parent.as_ref().unwrap_or(&self.aggregate)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a committed payload, recording its stream position.
    pub fn decode(data: &[u8], sequence: u64) -> Result<Self> {
        let mut event: Event = serde_json::from_slice(data)?;
        if event.id.is_empty() {
            event.id = sequence.to_string();
        }
        event.sequence = Some(sequence);
        Ok(event)
    }
}
