//! Transport Adapter.
//!
//! A thin seam over a durable, subject-addressable streaming log:
//!
//! - **`memory`**: in-process streaming log, used by tests and single-node runs.
//! - **`redis_streams`**: Redis Streams, one stream per subject.
//! - **`matcher`**: subject patterns shared by both backends.
//!
//! Every subject holds an ordered log; the first message of a subject has
//! sequence [`FIRST_SEQUENCE`] and each publish adds one. Subscriptions deliver
//! messages of one subject in sequence order. Nothing is guaranteed about the
//! relative order of different subjects.

pub mod matcher;
pub mod memory;
pub mod redis_streams;

pub use matcher::{SubjectMatcher, SUBJECT_SEPARATOR};
pub use memory::MemoryTransport;
pub use redis_streams::{RedisTransport, RedisTransportConfig};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// First sequence number of every subject.
pub const FIRST_SEQUENCE: u64 = 1;

/// Upper bound meaning "the most recent message".
pub const LATEST_SEQUENCE: u64 = u64::MAX;

/// A message as committed to a subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Subject the message was published to
    pub subject: String,
    /// Position within the subject, starting at [`FIRST_SEQUENCE`]
    pub sequence: u64,
    /// Opaque payload
    pub data: Vec<u8>,
    /// Commit time
    pub timestamp: DateTime<Utc>,
}

/// Where a new subscription starts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StartPosition {
    /// Replay every retained message, then follow new ones
    #[default]
    DeliverAll,
    /// Only messages published after the subscription is made
    NewOnly,
}

/// Subscription options.
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// Start position
    pub start: StartPosition,
    /// Messages buffered between the transport and the consumer
    pub buffer: usize,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            start: StartPosition::DeliverAll,
            buffer: 1024,
        }
    }
}

impl SubscribeOptions {
    /// Full-history redelivery from the earliest retained message.
    pub fn deliver_all() -> Self {
        Self::default()
    }

    /// Only messages published from now on.
    pub fn new_only() -> Self {
        Self {
            start: StartPosition::NewOnly,
            ..Default::default()
        }
    }

    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }
}

/// A live subscription. Messages arrive asynchronously from a delivery task
/// owned by the transport.
///
/// Dropping the subscription closes it.
#[derive(Debug)]
pub struct Subscription {
    pattern: String,
    receiver: mpsc::Receiver<Message>,
    cancel: CancellationToken,
}

impl Subscription {
    pub fn new(
        pattern: impl Into<String>,
        receiver: mpsc::Receiver<Message>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            pattern: pattern.into(),
            receiver,
            cancel,
        }
    }

    /// Receive the next message; `None` once the subscription is closed.
    pub async fn next(&mut self) -> Option<Message> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            msg = self.receiver.recv() => msg,
        }
    }

    /// Stop delivery. Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Token that closes this subscription when cancelled.
    pub fn closer(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Subject pattern this subscription was made for.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Durable publish/subscribe over subjects.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Append a payload to a subject. Returns the assigned sequence.
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<u64>;

    /// Subscribe to every subject matching a wildcard pattern.
    async fn subscribe(&self, pattern: &str, options: SubscribeOptions) -> Result<Subscription>;

    /// Read the committed messages of a subject with `from <= sequence <= to`.
    ///
    /// `to` is clamped to the most recent message. Unknown subjects yield an
    /// empty list.
    async fn sequence_range(&self, subject: &str, from: u64, to: u64) -> Result<Vec<Message>>;

    /// List the subjects selected by a matcher.
    async fn list_subjects(&self, matcher: &SubjectMatcher) -> Result<Vec<String>>;

    /// Release the connection. Later calls fail with `TransportClosed`.
    async fn close(&self) -> Result<()>;

    /// Backend name, for logs.
    fn name(&self) -> &'static str;
}
