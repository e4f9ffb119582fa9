//! In-process streaming log.
//!
//! Keeps every message for the lifetime of the transport. Each subscription is
//! served by its own delivery task that walks the global arrival log from a
//! cursor, so a slow consumer only ever delays itself.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::matcher::{validate_pattern, SubjectMatcher};
use super::{Message, StartPosition, SubscribeOptions, Subscription, Transport, FIRST_SEQUENCE};
use crate::error::{Result, TributaryError};

#[derive(Default)]
struct LogState {
    /// Every message in arrival order
    log: Vec<Message>,
    /// Per-subject positions into `log`
    subjects: HashMap<String, Vec<usize>>,
}

struct Inner {
    state: RwLock<LogState>,
    /// Length of `log`, bumped after every publish
    appended: watch::Sender<usize>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

/// In-memory [`Transport`].
///
/// Cloning shares the same log.
#[derive(Clone)]
pub struct MemoryTransport {
    inner: Arc<Inner>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        let (appended, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(LogState::default()),
                appended,
                closed: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Total messages committed across all subjects.
    pub fn message_count(&self) -> usize {
        self.inner.state.read().log.len()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(TributaryError::transport_closed());
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<u64> {
        self.ensure_open()?;
        if subject.is_empty() {
            return Err(TributaryError::transport("cannot publish to an empty subject"));
        }

        let (sequence, len) = {
            let mut state = self.inner.state.write();
            let position = state.log.len();
            let positions = state.subjects.entry(subject.to_string()).or_default();
            let sequence = positions.len() as u64 + FIRST_SEQUENCE;
            positions.push(position);
            state.log.push(Message {
                subject: subject.to_string(),
                sequence,
                data: payload,
                timestamp: Utc::now(),
            });
            (sequence, state.log.len())
        };

        self.inner.appended.send_replace(len);
        Ok(sequence)
    }

    async fn subscribe(&self, pattern: &str, options: SubscribeOptions) -> Result<Subscription> {
        self.ensure_open()?;
        validate_pattern(pattern)?;

        let matcher = SubjectMatcher::Pattern(pattern.to_string());
        let mut changes = self.inner.appended.subscribe();
        let mut cursor = match options.start {
            StartPosition::DeliverAll => 0,
            StartPosition::NewOnly => self.inner.state.read().log.len(),
        };

        let (tx, rx) = mpsc::channel(options.buffer.max(1));
        let cancel = self.inner.shutdown.child_token();
        let task_cancel = cancel.clone();
        let inner = Arc::clone(&self.inner);
        let task_pattern = pattern.to_string();

        tokio::spawn(async move {
            loop {
                let batch: Vec<Message> = {
                    let state = inner.state.read();
                    let batch = state.log[cursor..]
                        .iter()
                        .filter(|m| matcher.matches(&m.subject))
                        .cloned()
                        .collect();
                    cursor = state.log.len();
                    batch
                };

                for message in batch {
                    tokio::select! {
                        _ = task_cancel.cancelled() => return,
                        sent = tx.send(message) => {
                            if sent.is_err() {
                                return;
                            }
                        }
                    }
                }

                tokio::select! {
                    _ = task_cancel.cancelled() => return,
                    changed = changes.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        debug!(pattern = %task_pattern, start = ?options.start, "memory subscription opened");
        Ok(Subscription::new(pattern, rx, cancel))
    }

    async fn sequence_range(&self, subject: &str, from: u64, to: u64) -> Result<Vec<Message>> {
        self.ensure_open()?;

        let state = self.inner.state.read();
        let Some(positions) = state.subjects.get(subject) else {
            return Ok(Vec::new());
        };

        let from = from.max(FIRST_SEQUENCE);
        let to = to.min(positions.len() as u64);
        if from > to {
            return Ok(Vec::new());
        }

        let start = (from - FIRST_SEQUENCE) as usize;
        let end = (to - FIRST_SEQUENCE) as usize;
        Ok(positions[start..=end]
            .iter()
            .map(|&p| state.log[p].clone())
            .collect())
    }

    async fn list_subjects(&self, matcher: &SubjectMatcher) -> Result<Vec<String>> {
        self.ensure_open()?;

        let state = self.inner.state.read();
        let mut subjects: Vec<String> = state
            .subjects
            .keys()
            .filter(|s| matcher.matches(s))
            .cloned()
            .collect();
        subjects.sort();
        Ok(subjects)
    }

    async fn close(&self) -> Result<()> {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            self.inner.shutdown.cancel();
            debug!("memory transport closed");
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::transport::LATEST_SEQUENCE;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_sequences_are_per_subject() {
        let transport = MemoryTransport::new();
        assert_eq!(transport.publish("a.1", b"x".to_vec()).await.unwrap(), 1);
        assert_eq!(transport.publish("a.2", b"y".to_vec()).await.unwrap(), 1);
        assert_eq!(transport.publish("a.1", b"z".to_vec()).await.unwrap(), 2);
        assert_eq!(transport.message_count(), 3);
    }

    #[tokio::test]
    async fn test_sequence_range_clamps_and_orders() {
        let transport = MemoryTransport::new();
        for i in 0..5u8 {
            transport.publish("a.1", vec![i]).await.unwrap();
        }

        let all = transport
            .sequence_range("a.1", FIRST_SEQUENCE, LATEST_SEQUENCE)
            .await
            .unwrap();
        let payloads: Vec<u8> = all.iter().map(|m| m.data[0]).collect();
        assert_eq!(payloads, vec![0, 1, 2, 3, 4]);

        let middle = transport.sequence_range("a.1", 2, 3).await.unwrap();
        assert_eq!(middle.iter().map(|m| m.sequence).collect::<Vec<_>>(), vec![2, 3]);

        assert!(transport.sequence_range("a.1", 9, 12).await.unwrap().is_empty());
        assert!(transport.sequence_range("missing.1", 1, 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deliver_all_replays_history_then_follows() {
        let transport = MemoryTransport::new();
        transport.publish("invocation.1", b"old".to_vec()).await.unwrap();
        transport.publish("workflow.1", b"other".to_vec()).await.unwrap();

        let mut sub = transport
            .subscribe("invocation.>", SubscribeOptions::deliver_all())
            .await
            .unwrap();

        let first = timeout(Duration::from_secs(1), sub.next()).await.unwrap().unwrap();
        assert_eq!(first.data, b"old");

        transport.publish("invocation.2", b"new".to_vec()).await.unwrap();
        let second = timeout(Duration::from_secs(1), sub.next()).await.unwrap().unwrap();
        assert_eq!(second.subject, "invocation.2");
        assert_eq!(second.data, b"new");
    }

    #[tokio::test]
    async fn test_new_only_skips_history() {
        let transport = MemoryTransport::new();
        transport.publish("invocation.1", b"old".to_vec()).await.unwrap();

        let mut sub = transport
            .subscribe("invocation.>", SubscribeOptions::new_only())
            .await
            .unwrap();
        transport.publish("invocation.1", b"new".to_vec()).await.unwrap();

        let msg = timeout(Duration::from_secs(1), sub.next()).await.unwrap().unwrap();
        assert_eq!(msg.data, b"new");
        assert_eq!(msg.sequence, 2);
    }

    #[tokio::test]
    async fn test_close_ends_subscriptions_and_rejects_calls() {
        let transport = MemoryTransport::new();
        let mut sub = transport
            .subscribe("a.>", SubscribeOptions::default())
            .await
            .unwrap();

        transport.close().await.unwrap();
        transport.close().await.unwrap();

        assert!(timeout(Duration::from_secs(1), sub.next()).await.unwrap().is_none());
        let err = transport.publish("a.1", vec![]).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::TransportClosed);
    }

    #[tokio::test]
    async fn test_list_subjects_filters() {
        let transport = MemoryTransport::new();
        transport.publish("invocation.wf-1", vec![]).await.unwrap();
        transport.publish("invocation.wf-2", vec![]).await.unwrap();
        transport.publish("workflow.wf-1", vec![]).await.unwrap();

        let subjects = transport
            .list_subjects(&SubjectMatcher::Pattern("invocation.>".into()))
            .await
            .unwrap();
        assert_eq!(subjects, vec!["invocation.wf-1", "invocation.wf-2"]);
    }
}
