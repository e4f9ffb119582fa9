//! In-process fan-out of decoded events.
//!
//! Each subscriber owns a bounded channel. Publishing waits for room in every
//! selected subscriber's buffer, so a slow subscriber applies backpressure
//! instead of losing events. Subscribers whose receiver was dropped are pruned
//! on the next publish.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::types::Event;
use crate::error::{Result, TributaryError};

/// Messages a subscriber can filter on.
pub trait Topic {
    fn topic(&self) -> &str;
}

impl Topic for Event {
    /// Type of the aggregate whose log holds the event.
    fn topic(&self) -> &str {
        &self.stream_aggregate().typ
    }
}

/// Subscription options.
#[derive(Debug, Clone)]
pub struct SubscriptionOptions {
    /// Messages buffered for this subscriber
    pub buffer: usize,
    /// Topics to receive; `None` receives everything
    pub selector: Option<HashSet<String>>,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            buffer: 1024,
            selector: None,
        }
    }
}

impl SubscriptionOptions {
    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }

    /// Only receive messages with one of these topics.
    pub fn select<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.selector = Some(topics.into_iter().map(Into::into).collect());
        self
    }

    fn accepts(&self, topic: &str) -> bool {
        self.selector.as_ref().map_or(true, |s| s.contains(topic))
    }
}

struct Subscriber<T> {
    id: u64,
    options: SubscriptionOptions,
    sender: mpsc::Sender<T>,
}

/// Fan-out publisher.
pub struct Publisher<T> {
    subscribers: Mutex<Vec<Subscriber<T>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl<T> Default for Publisher<T>
where
    T: Topic + Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Publisher<T>
where
    T: Topic + Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Register a subscriber. The receiver ends when the publisher closes.
    pub fn subscribe(&self, options: SubscriptionOptions) -> mpsc::Receiver<T> {
        let (sender, receiver) = mpsc::channel(options.buffer.max(1));
        if self.closed.load(Ordering::Acquire) {
            return receiver;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().push(Subscriber {
            id,
            options,
            sender,
        });
        receiver
    }

    /// Deliver a message to every selected subscriber. Returns how many
    /// received it.
    pub async fn publish(&self, msg: T) -> Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TributaryError::internal("publisher is closed"));
        }

        let targets: Vec<(u64, mpsc::Sender<T>)> = self
            .subscribers
            .lock()
            .iter()
            .filter(|s| s.options.accepts(msg.topic()))
            .map(|s| (s.id, s.sender.clone()))
            .collect();

        let mut delivered = 0;
        let mut gone = Vec::new();
        for (id, sender) in targets {
            match sender.send(msg.clone()).await {
                Ok(()) => delivered += 1,
                Err(_) => gone.push(id),
            }
        }

        if !gone.is_empty() {
            self.subscribers.lock().retain(|s| !gone.contains(&s.id));
        }
        Ok(delivered)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Drop every subscriber, ending their receivers.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.subscribers.lock().clear();
    }
}
