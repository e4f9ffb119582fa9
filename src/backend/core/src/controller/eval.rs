//! Evaluation state and the evaluation cache.
//!
//! The cache holds one [`EvalSlot`] per aggregate. A slot's state sits
//! behind an async mutex: whoever holds it is the single active evaluation for
//! that id. Triggers that find the slot busy leave themselves as the slot's
//! pending trigger and return; the active evaluation picks the pending trigger
//! up before releasing the slot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::MutexGuard;
use tokio_util::sync::CancellationToken;

use crate::fes::{Aggregate, Event};
use crate::telemetry::Telemetry;

// =============================================================================
// Evaluation State
// =============================================================================

/// Per-aggregate bookkeeping of the reconciliation loop.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalState {
    /// Eval cache key
    pub aggregate: Aggregate,
    pub created_at: DateTime<Utc>,
    /// Evaluations run against this state
    pub evaluations: u64,
    /// Set by `Wait`; the aggregate is backing off until then
    pub waiting_until: Option<DateTime<Utc>>,
    /// `Wait` actions applied so far
    pub waits: u32,
    /// Kind of the last applied action
    pub last_action: Option<&'static str>,
}

impl EvalState {
    pub fn new(aggregate: Aggregate) -> Self {
        Self {
            aggregate,
            created_at: Utc::now(),
            evaluations: 0,
            waiting_until: None,
            waits: 0,
            last_action: None,
        }
    }

    pub fn is_waiting(&self, now: DateTime<Utc>) -> bool {
        self.waiting_until.map_or(false, |until| until > now)
    }
}

/// What started an evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    /// A new event in the aggregate's log
    Event(Event),
    /// A `Wait` timer fired
    Wake,
    /// Explicit request
    Manual,
}

// =============================================================================
// Evaluation Slot
// =============================================================================

/// One aggregate's entry in the [`EvalCache`].
#[derive(Debug)]
pub struct EvalSlot {
    state: tokio::sync::Mutex<EvalState>,
    pending: Mutex<Option<Trigger>>,
    timer: Mutex<Option<CancellationToken>>,
    evicted: AtomicBool,
}

impl EvalSlot {
    fn new(aggregate: Aggregate) -> Self {
        Self {
            state: tokio::sync::Mutex::new(EvalState::new(aggregate)),
            pending: Mutex::new(None),
            timer: Mutex::new(None),
            evicted: AtomicBool::new(false),
        }
    }

    /// Record a trigger for the next evaluation. An event trigger is never
    /// displaced by a timer or manual one.
    pub fn offer(&self, trigger: Trigger) {
        let mut pending = self.pending.lock();
        let keep = matches!(
            (&*pending, &trigger),
            (Some(Trigger::Event(_)), Trigger::Wake | Trigger::Manual)
        );
        if !keep {
            *pending = Some(trigger);
        }
    }

    pub fn take_pending(&self) -> Option<Trigger> {
        self.pending.lock().take()
    }

    pub fn has_pending(&self) -> bool {
        self.pending.lock().is_some()
    }

    /// Become the active evaluation, unless one already is.
    pub fn try_acquire(&self) -> Option<MutexGuard<'_, EvalState>> {
        self.state.try_lock().ok()
    }

    pub fn is_busy(&self) -> bool {
        self.state.try_lock().is_err()
    }

    /// Copy of the state, if no evaluation holds it.
    pub fn snapshot(&self) -> Option<EvalState> {
        self.state.try_lock().ok().map(|s| s.clone())
    }

    /// Install a new wait timer, cancelling the previous one.
    pub fn replace_timer(&self, token: CancellationToken) {
        if let Some(previous) = self.timer.lock().replace(token) {
            previous.cancel();
        }
    }

    pub fn cancel_timer(&self) {
        if let Some(token) = self.timer.lock().take() {
            token.cancel();
        }
    }

    pub fn has_timer(&self) -> bool {
        self.timer.lock().as_ref().map_or(false, |t| !t.is_cancelled())
    }

    pub fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::Acquire)
    }

    fn evict(&self) {
        self.evicted.store(true, Ordering::Release);
        self.cancel_timer();
    }
}

// =============================================================================
// Evaluation Cache
// =============================================================================

/// Evaluation states by aggregate.
pub struct EvalCache {
    slots: DashMap<Aggregate, Arc<EvalSlot>>,
    telemetry: Telemetry,
}

impl EvalCache {
    pub fn new(telemetry: Telemetry) -> Self {
        Self {
            slots: DashMap::new(),
            telemetry,
        }
    }

    /// The aggregate's slot, created on first use. The flag tells whether it
    /// already existed.
    pub fn get_or_create(&self, aggregate: &Aggregate) -> (Arc<EvalSlot>, bool) {
        let result = match self.slots.entry(aggregate.clone()) {
            Entry::Occupied(entry) => (Arc::clone(entry.get()), true),
            Entry::Vacant(entry) => {
                let slot = Arc::new(EvalSlot::new(aggregate.clone()));
                entry.insert(Arc::clone(&slot));
                (slot, false)
            }
        };
        if !result.1 {
            self.record_size();
        }
        result
    }

    pub fn get(&self, aggregate: &Aggregate) -> Option<Arc<EvalSlot>> {
        self.slots.get(aggregate).map(|s| Arc::clone(s.value()))
    }

    /// Evict an aggregate. Evicting an unknown aggregate is a no-op. Returns
    /// whether anything was evicted.
    pub fn del(&self, aggregate: &Aggregate) -> bool {
        match self.slots.remove(aggregate) {
            Some((_, slot)) => {
                slot.evict();
                self.record_size();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, aggregate: &Aggregate) -> bool {
        self.slots.contains_key(aggregate)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn record_size(&self) {
        self.telemetry
            .gauge("controller_eval_cache_size")
            .set(self.slots.len() as f64);
    }
}

// =============================================================================
// Evaluation Context
// =============================================================================

/// Everything a rule or action sees during one evaluation.
#[derive(Debug, Clone)]
pub struct EvalContext {
    /// Snapshot of the aggregate's evaluation state
    pub state: EvalState,
    pub trigger: Trigger,
    /// The aggregate's log, in commit order
    pub events: Vec<Event>,
    pub now: DateTime<Utc>,
}

impl EvalContext {
    pub fn new(state: EvalState, trigger: Trigger, events: Vec<Event>) -> Self {
        Self {
            state,
            trigger,
            events,
            now: Utc::now(),
        }
    }

    /// Context with no log and no triggering event.
    pub fn detached(state: EvalState) -> Self {
        Self::new(state, Trigger::Manual, Vec::new())
    }

    pub fn aggregate(&self) -> &Aggregate {
        &self.state.aggregate
    }

    /// The triggering event, if an event started this evaluation.
    pub fn event(&self) -> Option<&Event> {
        match &self.trigger {
            Trigger::Event(event) => Some(event),
            _ => None,
        }
    }

    pub fn last_event(&self) -> Option<&Event> {
        self.events.last()
    }

    pub fn count_events<F>(&self, mut predicate: F) -> usize
    where
        F: FnMut(&Event) -> bool,
    {
        self.events.iter().filter(|e| predicate(e)).count()
    }
}
