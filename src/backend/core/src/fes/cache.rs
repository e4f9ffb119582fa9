//! Projection cache.
//!
//! Projections are read models rebuilt from an aggregate's event log. A
//! projection starts from `Default` and folds each event with
//! [`Projection::apply`]; given the same events, the result is always the same.
//! The cache loads projections lazily and drops them when told the aggregate
//! changed. The controller only ever sees the [`CacheWriter`] side.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, Instrument};

use super::store::EventStore;
use super::types::{Aggregate, Event};
use crate::error::Result;
use crate::telemetry::Telemetry;

/// Invalidation side of a read cache.
pub trait CacheWriter: Send + Sync {
    /// Forget whatever is cached for an aggregate. Unknown aggregates are a
    /// no-op.
    fn invalidate(&self, aggregate: &Aggregate);
}

/// Read model folded from an event log.
pub trait Projection: Default + Clone + Send + Sync + 'static {
    /// Fold one event. Must not fail or perform I/O.
    fn apply(&mut self, event: &Event);

    fn from_events<'a, I>(events: I) -> Self
    where
        I: IntoIterator<Item = &'a Event>,
    {
        let mut projection = Self::default();
        for event in events {
            projection.apply(event);
        }
        projection
    }
}

// =============================================================================
// Event Log Projection
// =============================================================================

/// Generic summary of an aggregate's log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventLog {
    pub event_count: u64,
    pub last_event_type: Option<String>,
    pub last_sequence: Option<u64>,
    pub first_event_at: Option<DateTime<Utc>>,
    pub last_event_at: Option<DateTime<Utc>>,
}

impl Projection for EventLog {
    fn apply(&mut self, event: &Event) {
        self.event_count += 1;
        self.last_event_type = Some(event.event_type.clone());
        if event.sequence.is_some() {
            self.last_sequence = event.sequence;
        }
        if self.first_event_at.is_none() {
            self.first_event_at = Some(event.timestamp);
        }
        self.last_event_at = Some(event.timestamp);
    }
}

// =============================================================================
// Projection Cache
// =============================================================================

enum CacheEntry<P> {
    /// A load started with this ticket; removed by invalidation
    Loading(u64),
    Ready(P),
}

impl<P> CacheEntry<P> {
    fn is_loading(&self, ticket: u64) -> bool {
        matches!(self, CacheEntry::Loading(t) if *t == ticket)
    }
}

/// Lazily populated, invalidation-driven cache of projections.
pub struct ProjectionCache<P: Projection> {
    store: Arc<EventStore>,
    entries: DashMap<Aggregate, CacheEntry<P>>,
    tickets: AtomicU64,
    telemetry: Telemetry,
}

impl<P: Projection> ProjectionCache<P> {
    pub fn new(store: Arc<EventStore>, telemetry: Telemetry) -> Self {
        Self {
            store,
            entries: DashMap::new(),
            tickets: AtomicU64::new(0),
            telemetry,
        }
    }

    /// Projection of an aggregate, loading it from the store on a miss.
    ///
    /// A load that is invalidated before it completes is returned to the
    /// caller but not cached.
    pub async fn get(&self, aggregate: &Aggregate) -> Result<P> {
        if let Some(projection) = self.peek(aggregate) {
            return Ok(projection);
        }

        let ticket = self.start_load(aggregate);
        let events = match self.store.get(aggregate).await {
            Ok(events) => events,
            Err(e) => {
                self.entries.remove_if(aggregate, |_, entry| entry.is_loading(ticket));
                return Err(e);
            }
        };

        let projection = P::from_events(&events);
        if !self.finish_load(aggregate, ticket, &projection) {
            debug!("aggregate.type" = %aggregate.typ, "aggregate.id" = %aggregate.id, "discarding superseded projection load");
        }
        Ok(projection)
    }

    fn start_load(&self, aggregate: &Aggregate) -> u64 {
        let ticket = self.tickets.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(aggregate.clone(), CacheEntry::Loading(ticket));
        ticket
    }

    /// Cache a loaded projection if its load is still the current one.
    fn finish_load(&self, aggregate: &Aggregate, ticket: u64, projection: &P) -> bool {
        match self.entries.entry(aggregate.clone()) {
            Entry::Occupied(mut entry) if entry.get().is_loading(ticket) => {
                entry.insert(CacheEntry::Ready(projection.clone()));
                true
            }
            _ => false,
        }
    }

    /// Cached projection without loading.
    pub fn peek(&self, aggregate: &Aggregate) -> Option<P> {
        match self.entries.get(aggregate).as_deref() {
            Some(CacheEntry::Ready(projection)) => Some(projection.clone()),
            _ => None,
        }
    }

    pub fn contains(&self, aggregate: &Aggregate) -> bool {
        matches!(self.entries.get(aggregate).as_deref(), Some(CacheEntry::Ready(_)))
    }

    /// Number of cached projections.
    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e.value(), CacheEntry::Ready(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invalidate the stream aggregate of every event the store fans out until
    /// `shutdown` fires.
    pub fn follow(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let mut events = self.store.subscribe_all();
        let span = self.telemetry.span().clone();

        tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        event = events.recv() => match event {
                            Some(event) => self.invalidate(event.stream_aggregate()),
                            None => break,
                        },
                    }
                }
                debug!("projection cache stopped following the store");
            }
            .instrument(span),
        )
    }
}

impl<P: Projection> CacheWriter for ProjectionCache<P> {
    fn invalidate(&self, aggregate: &Aggregate) {
        if let Some((_, CacheEntry::Ready(_))) = self.entries.remove(aggregate) {
            self.telemetry
                .counter("projection_cache_invalidations_total")
                .increment(1);
            debug!("aggregate.type" = %aggregate.typ, "aggregate.id" = %aggregate.id, "projection invalidated");
        }
    }
}
