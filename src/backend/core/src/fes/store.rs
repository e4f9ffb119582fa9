//! Event Store over a streaming [`Transport`].
//!
//! Every aggregate owns one subject. Appends publish the serialized event to
//! the subject of its stream aggregate (the parent when set). Reads replay the
//! full subject range. Watches follow all subjects of an aggregate type and
//! republish decoded events on the store's own fan-out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use super::pubsub::{Publisher, SubscriptionOptions};
use super::subject::{make_subject, parse_subject, type_wildcard};
use super::types::{validate_type, Aggregate, Event};
use crate::config::EventStoreConfig;
use crate::error::{Result, TributaryError};
use crate::telemetry::Telemetry;
use crate::transport::{
    Message, SubjectMatcher, SubscribeOptions, Transport, FIRST_SEQUENCE, LATEST_SEQUENCE,
};

/// The Event Store.
pub struct EventStore {
    transport: Arc<dyn Transport>,
    publisher: Arc<Publisher<Event>>,
    /// Active watches by aggregate type
    watches: Mutex<HashMap<String, CancellationToken>>,
    config: EventStoreConfig,
    telemetry: Telemetry,
    closed: AtomicBool,
}

impl EventStore {
    pub fn new(transport: Arc<dyn Transport>, config: EventStoreConfig, telemetry: Telemetry) -> Self {
        Self {
            transport,
            publisher: Arc::new(Publisher::new()),
            watches: Mutex::new(HashMap::new()),
            config,
            telemetry,
            closed: AtomicBool::new(false),
        }
    }

    /// Append an event to its stream aggregate's log. Returns the assigned
    /// sequence.
    pub async fn append(&self, event: &Event) -> Result<u64> {
        event.aggregate.validate()?;
        let target = event.stream_aggregate();
        target.validate()?;

        let subject = make_subject(target);
        let data = event.encode()?;

        self.telemetry.span().in_scope(|| {
            info!(
                "event.id" = %event.id,
                "event.type" = %event.event_type,
                "aggregate.type" = %event.aggregate.typ,
                "aggregate.id" = %event.aggregate.id,
                subject = %subject,
                "appending event"
            )
        });

        let sequence = self
            .transport
            .publish(&subject, data)
            .await
            .map_err(|e| e.with_subject(subject.clone()))?;

        self.telemetry.counter("fes_events_appended_total").increment(1);
        Ok(sequence)
    }

    /// All events of an aggregate in commit order.
    pub async fn get(&self, aggregate: &Aggregate) -> Result<Vec<Event>> {
        aggregate.validate()?;
        let subject = make_subject(aggregate);
        let started = Instant::now();

        let messages = self
            .transport
            .sequence_range(&subject, FIRST_SEQUENCE, LATEST_SEQUENCE)
            .await?;

        let events = messages
            .iter()
            .map(|msg| to_event(msg).map_err(|e| e.with_subject(subject.clone())))
            .collect::<Result<Vec<_>>>()?;

        self.telemetry
            .histogram("fes_get_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        Ok(events)
    }

    /// Aggregates whose subjects match. Subjects that do not parse are skipped.
    pub async fn list(&self, matcher: &SubjectMatcher) -> Result<Vec<Aggregate>> {
        let subjects = self.transport.list_subjects(matcher).await?;

        Ok(subjects
            .iter()
            .filter_map(|subject| {
                let aggregate = parse_subject(subject);
                if aggregate.is_none() {
                    debug!(subject = %subject, "skipping subject that is not an aggregate");
                }
                aggregate
            })
            .collect())
    }

    /// Follow every aggregate of a type from the beginning of its history and
    /// republish the events on the fan-out.
    ///
    /// Watching a type again replaces the previous watch.
    pub async fn watch(&self, aggregate_type: &str) -> Result<()> {
        validate_type(aggregate_type)?;
        if self.closed.load(Ordering::Acquire) {
            return Err(TributaryError::transport_closed());
        }

        let pattern = type_wildcard(aggregate_type);
        let mut subscription = self
            .transport
            .subscribe(
                &pattern,
                SubscribeOptions::deliver_all().with_buffer(self.config.subscription_buffer),
            )
            .await?;

        let closer = subscription.closer();
        if let Some(previous) = self.watches.lock().insert(aggregate_type.to_string(), closer) {
            previous.cancel();
        }

        let publisher = Arc::clone(&self.publisher);
        let telemetry = self.telemetry.clone();
        let task_pattern = pattern.clone();

        tokio::spawn(
            async move {
                while let Some(msg) = subscription.next().await {
                    let event = match to_event(&msg) {
                        Ok(event) => event,
                        Err(e) => {
                            telemetry.counter("fes_events_decode_failures_total").increment(1);
                            warn!(
                                subject = %msg.subject,
                                sequence = msg.sequence,
                                error = %e,
                                "dropping undecodable event"
                            );
                            continue;
                        }
                    };

                    debug!(
                        "aggregate.type" = %event.aggregate.typ,
                        "aggregate.id" = %event.aggregate.id,
                        "event.type" = %event.event_type,
                        "event.id" = %event.id,
                        subject = %msg.subject,
                        "publishing aggregate event to subscribers"
                    );

                    match publisher.publish(event).await {
                        Ok(n) => telemetry
                            .counter("fes_events_fanned_out_total")
                            .increment(n as u64),
                        Err(e) => error!(subject = %msg.subject, error = %e, "fan-out failed"),
                    }
                }
                debug!(pattern = %task_pattern, "watch ended");
            }
            .instrument(self.telemetry.span().clone()),
        );

        info!(pattern = %pattern, transport = self.transport.name(), "watching aggregate type");
        Ok(())
    }

    /// Receive every event delivered by the active watches.
    pub fn subscribe(&self, options: SubscriptionOptions) -> mpsc::Receiver<Event> {
        self.publisher.subscribe(options)
    }

    /// Fan-out subscription to every watched type with the configured buffer.
    pub fn subscribe_all(&self) -> mpsc::Receiver<Event> {
        self.subscribe(SubscriptionOptions::default().with_buffer(self.config.fanout_buffer))
    }

    /// Fan-out subscription with the configured buffer.
    pub fn subscribe_types<I, S>(&self, aggregate_types: I) -> mpsc::Receiver<Event>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subscribe(
            SubscriptionOptions::default()
                .with_buffer(self.config.fanout_buffer)
                .select(aggregate_types),
        )
    }

    /// Aggregate types currently watched.
    pub fn watched_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.watches.lock().keys().cloned().collect();
        types.sort();
        types
    }

    /// Stop every watch, end the fan-out and release the transport.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        for (_, closer) in self.watches.lock().drain() {
            closer.cancel();
        }
        self.publisher.close();
        self.transport.close().await
    }
}

fn to_event(msg: &Message) -> Result<Event> {
    Event::decode(&msg.data, msg.sequence)
}
