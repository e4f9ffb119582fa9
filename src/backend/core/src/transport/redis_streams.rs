//! Redis Streams transport.
//!
//! Each subject is one stream stored under `<key_prefix><subject>`. Streams
//! are never trimmed, so a message's position in its stream is its sequence.
//! Subscriptions poll: every `poll_interval` they rescan the matching keys and
//! read past the last entry they delivered.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::aio::ConnectionManager;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::matcher::{validate_pattern, SubjectMatcher};
use super::{Message, StartPosition, SubscribeOptions, Subscription, Transport, FIRST_SEQUENCE};
use crate::config::TransportConfig;
use crate::error::{Result, TributaryError};

/// Field holding the payload inside a stream entry.
const DATA_FIELD: &str = "data";

/// Entries fetched per XRANGE call.
const READ_BATCH: usize = 512;

/// Keys fetched per SCAN call.
const SCAN_COUNT: usize = 100;

/// Configuration for the Redis Streams transport.
#[derive(Debug, Clone)]
pub struct RedisTransportConfig {
    /// Redis connection URL
    pub url: String,
    /// Cluster the client joins (informational)
    pub cluster: String,
    /// Client name
    pub client: String,
    /// Prefix for every stream key
    pub key_prefix: String,
    /// Subscription polling interval
    pub poll_interval: Duration,
}

impl Default for RedisTransportConfig {
    fn default() -> Self {
        Self::from(&TransportConfig::default())
    }
}

impl From<&TransportConfig> for RedisTransportConfig {
    fn from(config: &TransportConfig) -> Self {
        Self {
            url: config.url.clone(),
            cluster: config.cluster.clone(),
            client: config.client.clone(),
            key_prefix: config.key_prefix.clone(),
            poll_interval: config.poll_interval,
        }
    }
}

/// Redis Streams [`Transport`].
pub struct RedisTransport {
    conn: ConnectionManager,
    config: RedisTransportConfig,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

type StreamEntries = Vec<(String, HashMap<String, Vec<u8>>)>;

impl RedisTransport {
    /// Connect and verify the server answers.
    pub async fn connect(config: RedisTransportConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str()).map_err(|e| {
            TributaryError::transport("failed to create Redis client").with_source(e)
        })?;

        let mut conn = ConnectionManager::new(client).await.map_err(|e| {
            TributaryError::transport("failed to connect to Redis").with_source(e)
        })?;

        let _: String = redis::cmd("PING").query_async(&mut conn).await?;

        info!(
            cluster = %config.cluster,
            client = %config.client,
            url = "!redacted!",
            "connected to Redis streams"
        );

        Ok(Self {
            conn,
            config,
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TributaryError::transport_closed());
        }
        Ok(())
    }

    fn key(&self, subject: &str) -> String {
        stream_key(&self.config.key_prefix, subject)
    }
}

fn stream_key(prefix: &str, subject: &str) -> String {
    format!("{}{}", prefix, subject)
}

fn subject_from_key<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
    key.strip_prefix(prefix).filter(|s| !s.is_empty())
}

/// Stream ids are `<millis>-<counter>`.
fn timestamp_from_id(id: &str) -> DateTime<Utc> {
    id.split('-')
        .next()
        .and_then(|ms| ms.parse::<i64>().ok())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now)
}

fn to_message(subject: &str, sequence: u64, id: &str, mut fields: HashMap<String, Vec<u8>>) -> Message {
    Message {
        subject: subject.to_string(),
        sequence,
        data: fields.remove(DATA_FIELD).unwrap_or_default(),
        timestamp: timestamp_from_id(id),
    }
}

async fn scan_keys(conn: &mut ConnectionManager, glob: &str) -> Result<Vec<String>> {
    let mut cursor: u64 = 0;
    let mut keys = Vec::new();

    loop {
        let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(glob)
            .arg("COUNT")
            .arg(SCAN_COUNT)
            .query_async(conn)
            .await?;

        keys.extend(batch);
        cursor = next;
        if cursor == 0 {
            break;
        }
    }

    keys.sort();
    keys.dedup();
    Ok(keys)
}

async fn matching_subjects(
    conn: &mut ConnectionManager,
    prefix: &str,
    matcher: &SubjectMatcher,
) -> Result<Vec<String>> {
    let glob = format!("{}{}", prefix, matcher.to_glob());
    let keys = scan_keys(conn, &glob).await?;

    Ok(keys
        .iter()
        .filter_map(|k| subject_from_key(prefix, k))
        .filter(|s| matcher.matches(s))
        .map(str::to_string)
        .collect())
}

/// Delivery cursor of one stream: last entry id and its sequence.
#[derive(Debug, Clone)]
struct StreamCursor {
    last_id: String,
    sequence: u64,
}

async fn tail_cursor(conn: &mut ConnectionManager, key: &str) -> Result<Option<StreamCursor>> {
    let len: u64 = redis::cmd("XLEN").arg(key).query_async(conn).await?;
    if len == 0 {
        return Ok(None);
    }
    let last: StreamEntries = redis::cmd("XREVRANGE")
        .arg(key)
        .arg("+")
        .arg("-")
        .arg("COUNT")
        .arg(1)
        .query_async(conn)
        .await?;

    Ok(last.into_iter().next().map(|(id, _)| StreamCursor {
        last_id: id,
        sequence: len,
    }))
}

struct Poller {
    conn: ConnectionManager,
    prefix: String,
    matcher: SubjectMatcher,
    cursors: HashMap<String, StreamCursor>,
    tx: mpsc::Sender<Message>,
}

impl Poller {
    /// Deliver everything new. Returns false once the consumer is gone.
    async fn poll_once(&mut self) -> Result<bool> {
        let subjects = matching_subjects(&mut self.conn, &self.prefix, &self.matcher).await?;

        for subject in subjects {
            let key = stream_key(&self.prefix, &subject);
            loop {
                let start = match self.cursors.get(&key) {
                    Some(c) => format!("({}", c.last_id),
                    None => "-".to_string(),
                };
                let entries: StreamEntries = redis::cmd("XRANGE")
                    .arg(&key)
                    .arg(&start)
                    .arg("+")
                    .arg("COUNT")
                    .arg(READ_BATCH)
                    .query_async(&mut self.conn)
                    .await?;

                let fetched = entries.len();
                for (id, fields) in entries {
                    let sequence = self.cursors.get(&key).map_or(FIRST_SEQUENCE, |c| c.sequence + 1);
                    let message = to_message(&subject, sequence, &id, fields);
                    if self.tx.send(message).await.is_err() {
                        return Ok(false);
                    }
                    self.cursors.insert(key.clone(), StreamCursor { last_id: id, sequence });
                }

                if fetched < READ_BATCH {
                    break;
                }
            }
        }

        Ok(true)
    }
}

#[async_trait]
impl Transport for RedisTransport {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<u64> {
        self.ensure_open()?;
        let key = self.key(subject);
        let mut conn = self.conn.clone();

        let (_id, len): (String, u64) = redis::pipe()
            .atomic()
            .cmd("XADD")
            .arg(&key)
            .arg("*")
            .arg(DATA_FIELD)
            .arg(payload)
            .cmd("XLEN")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                TributaryError::transport("publish failed")
                    .with_subject(subject)
                    .with_source(e)
            })?;

        Ok(len)
    }

    async fn subscribe(&self, pattern: &str, options: SubscribeOptions) -> Result<Subscription> {
        self.ensure_open()?;
        validate_pattern(pattern)?;

        let matcher = SubjectMatcher::Pattern(pattern.to_string());
        let mut conn = self.conn.clone();
        let prefix = self.config.key_prefix.clone();

        let mut cursors = HashMap::new();
        if options.start == StartPosition::NewOnly {
            for subject in matching_subjects(&mut conn, &prefix, &matcher).await? {
                let key = stream_key(&prefix, &subject);
                if let Some(cursor) = tail_cursor(&mut conn, &key).await? {
                    cursors.insert(key, cursor);
                }
            }
        }

        let (tx, rx) = mpsc::channel(options.buffer.max(1));
        let cancel = self.shutdown.child_token();
        let task_cancel = cancel.clone();
        let poll_interval = self.config.poll_interval;
        let task_pattern = pattern.to_string();

        let mut poller = Poller {
            conn,
            prefix,
            matcher,
            cursors,
            tx,
        };

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    polled = poller.poll_once() => match polled {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(e) => warn!(pattern = %task_pattern, error = %e, "redis subscription poll failed"),
                    },
                }

                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
            debug!(pattern = %task_pattern, "redis subscription stopped");
        });

        Ok(Subscription::new(pattern, rx, cancel))
    }

    async fn sequence_range(&self, subject: &str, from: u64, to: u64) -> Result<Vec<Message>> {
        self.ensure_open()?;
        let key = self.key(subject);
        let mut conn = self.conn.clone();

        let from = from.max(FIRST_SEQUENCE);
        if from > to {
            return Ok(Vec::new());
        }

        let entries: StreamEntries = redis::cmd("XRANGE")
            .arg(&key)
            .arg("-")
            .arg("+")
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                TributaryError::transport("range read failed")
                    .with_subject(subject)
                    .with_source(e)
            })?;

        Ok(entries
            .into_iter()
            .enumerate()
            .map(|(i, entry)| (i as u64 + FIRST_SEQUENCE, entry))
            .skip_while(|(seq, _)| *seq < from)
            .take_while(|(seq, _)| *seq <= to)
            .map(|(seq, (id, fields))| to_message(subject, seq, &id, fields))
            .collect())
    }

    async fn list_subjects(&self, matcher: &SubjectMatcher) -> Result<Vec<String>> {
        self.ensure_open()?;
        let mut conn = self.conn.clone();
        matching_subjects(&mut conn, &self.config.key_prefix, matcher).await
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.shutdown.cancel();
            info!(client = %self.config.client, "Redis streams transport closed");
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_key_round_trip() {
        let key = stream_key("fes:", "invocation.wf-1");
        assert_eq!(key, "fes:invocation.wf-1");
        assert_eq!(subject_from_key("fes:", &key), Some("invocation.wf-1"));
        assert_eq!(subject_from_key("fes:", "fes:"), None);
        assert_eq!(subject_from_key("fes:", "other:invocation.wf-1"), None);
    }

    #[test]
    fn test_timestamp_from_stream_id() {
        let ts = timestamp_from_id("1700000000123-4");
        assert_eq!(ts.timestamp_millis(), 1_700_000_000_123);
    }

    #[test]
    fn test_to_message_takes_data_field() {
        let mut fields = HashMap::new();
        fields.insert(DATA_FIELD.to_string(), b"payload".to_vec());
        let msg = to_message("invocation.wf-1", 3, "1700000000000-0", fields);
        assert_eq!(msg.sequence, 3);
        assert_eq!(msg.data, b"payload");
    }

    #[test]
    fn test_config_from_transport_section() {
        let config = RedisTransportConfig::default();
        assert_eq!(config.client, "fes");
        assert_eq!(config.key_prefix, "fes:");
    }

    #[tokio::test]
    #[ignore = "requires a Redis server at TRIBUTARY_TEST_REDIS_URL"]
    async fn test_live_publish_and_range() {
        let url = std::env::var("TRIBUTARY_TEST_REDIS_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let transport = RedisTransport::connect(RedisTransportConfig {
            url,
            key_prefix: format!("fes-test-{}:", uuid::Uuid::new_v4()),
            ..Default::default()
        })
        .await
        .unwrap();

        assert_eq!(transport.publish("invocation.wf-1", b"a".to_vec()).await.unwrap(), 1);
        assert_eq!(transport.publish("invocation.wf-1", b"b".to_vec()).await.unwrap(), 2);

        let msgs = transport
            .sequence_range("invocation.wf-1", FIRST_SEQUENCE, super::super::LATEST_SEQUENCE)
            .await
            .unwrap();
        assert_eq!(msgs.iter().map(|m| m.data.clone()).collect::<Vec<_>>(), vec![b"a".to_vec(), b"b".to_vec()]);
    }
}
