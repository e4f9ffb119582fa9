//! Reactive controller: Rule → Action engine.
//!
//! For every event the store fans out, the controller evaluates the event's
//! stream aggregate:
//!
//! 1. **Admission**: the aggregate's [`EvalSlot`] admits one evaluation at a
//!    time. Concurrent triggers are coalesced into the active one.
//! 2. **Evaluation**: the [`Rule`] maps an [`EvalContext`] to a candidate
//!    [`Action`].
//! 3. **Convergence**: the action is refined with [`Action::eval`] until it
//!    stops changing, bounded by `max_convergence_iterations`.
//! 4. **Application**: the converged action's side effect runs once.

pub mod action;
pub mod eval;
pub mod rule;
pub mod scheduler;

pub use action::{Action, ActionFailure, ApplyContext};
pub use eval::{EvalCache, EvalContext, EvalSlot, EvalState, Trigger};
pub use rule::{
    invocation_rules, workflow_rules, BackoffRule, CompletionRule, ErrorCountRule, FirstMatch,
    Rule, SkipRule, TimeoutRule,
};
pub use scheduler::WaitScheduler;

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, Instrument};

use crate::config::ControllerConfig;
use crate::error::{Result, TributaryError};
use crate::fes::{Aggregate, CacheWriter, Event, EventStore};
use crate::telemetry::Telemetry;

/// Refine an action until it is a fixed point of [`Action::eval`].
///
/// Returns the converged action and the number of `eval` calls made.
pub fn converge(action: Action, ctx: &EvalContext, max_iterations: usize) -> Result<(Action, usize)> {
    let mut current = action;
    for iteration in 1..=max_iterations {
        let next = current.eval(ctx);
        if next == current {
            return Ok((current, iteration));
        }
        debug_assert!(next.weight() < current.weight());
        current = next;
    }
    Err(TributaryError::convergence(max_iterations))
}

/// Result of one trigger.
#[derive(Debug, Clone, PartialEq)]
pub enum EvaluationOutcome {
    /// This trigger ran the evaluation; the last converged action was applied
    Applied { action: Action },
    /// Another evaluation of the same aggregate was active and took over
    Coalesced,
}

/// A controller over one or more aggregate types.
pub struct Controller {
    name: String,
    aggregate_types: Vec<String>,
    store: Arc<EventStore>,
    cache: Arc<dyn CacheWriter>,
    rule: Arc<dyn Rule>,
    eval_cache: EvalCache,
    scheduler: WaitScheduler,
    wakeups: Mutex<Option<mpsc::UnboundedReceiver<Aggregate>>>,
    permits: Semaphore,
    config: ControllerConfig,
    telemetry: Telemetry,
}

impl Controller {
    pub fn new(
        name: impl Into<String>,
        aggregate_types: Vec<String>,
        store: Arc<EventStore>,
        cache: Arc<dyn CacheWriter>,
        rule: Arc<dyn Rule>,
        config: ControllerConfig,
        telemetry: Telemetry,
    ) -> Self {
        let (scheduler, wakeups) = WaitScheduler::new(telemetry.clone());
        Self {
            name: name.into(),
            aggregate_types,
            store,
            cache,
            rule,
            eval_cache: EvalCache::new(telemetry.clone()),
            scheduler,
            wakeups: Mutex::new(Some(wakeups)),
            permits: Semaphore::new(config.max_concurrent_evaluations.max(1)),
            config,
            telemetry,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn aggregate_types(&self) -> &[String] {
        &self.aggregate_types
    }

    pub fn eval_cache(&self) -> &EvalCache {
        &self.eval_cache
    }

    /// Subscribe to the store's fan-out and process triggers on a background
    /// task until `shutdown`.
    ///
    /// The subscription exists when this returns, so events watched afterwards
    /// are not missed. A controller can be started once.
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) -> Result<JoinHandle<()>> {
        let taken = self.wakeups.lock().take();
        let Some(wakeups) = taken else {
            return Err(TributaryError::internal(format!(
                "controller '{}' is already running",
                self.name
            )));
        };
        let events = self.store.subscribe_types(self.aggregate_types.iter().cloned());

        info!(controller = %self.name, types = ?self.aggregate_types, rule = self.rule.name(), "controller started");

        let this = Arc::clone(self);
        Ok(tokio::spawn(
            async move { this.run_loop(events, wakeups, shutdown).await }
                .instrument(self.telemetry.span().clone()),
        ))
    }

    /// [`Controller::start`] and wait until the controller stops.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        self.start(shutdown)?
            .await
            .map_err(|e| TributaryError::internal("controller task failed").with_source(e))
    }

    async fn run_loop(
        self: Arc<Self>,
        mut events: mpsc::Receiver<Event>,
        mut wakeups: mpsc::UnboundedReceiver<Aggregate>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.spawn_trigger(event.stream_aggregate().clone(), Trigger::Event(event)),
                    None => {
                        debug!(controller = %self.name, "event fan-out closed");
                        break;
                    }
                },
                Some(aggregate) = wakeups.recv() => self.spawn_trigger(aggregate, Trigger::Wake),
            }
        }

        info!(controller = %self.name, "controller stopped");
    }

    fn spawn_trigger(self: &Arc<Self>, aggregate: Aggregate, trigger: Trigger) {
        let this = Arc::clone(self);
        tokio::spawn(
            async move {
                // process() logs and counts its own failures.
                let _ = this.process(aggregate, trigger).await;
            }
            .instrument(self.telemetry.span().clone()),
        );
    }

    /// Evaluate the stream aggregate of an event.
    pub async fn handle(&self, event: Event) -> Result<EvaluationOutcome> {
        let aggregate = event.stream_aggregate().clone();
        self.process(aggregate, Trigger::Event(event)).await
    }

    /// Evaluate an aggregate without a triggering event.
    pub async fn evaluate(&self, aggregate: &Aggregate) -> Result<EvaluationOutcome> {
        self.process(aggregate.clone(), Trigger::Manual).await
    }

    async fn process(&self, aggregate: Aggregate, trigger: Trigger) -> Result<EvaluationOutcome> {
        if let Err(e) = aggregate.validate() {
            self.record_failure(&aggregate, &e);
            return Err(e);
        }
        let (slot, _existed) = self.eval_cache.get_or_create(&aggregate);
        slot.offer(trigger);

        let mut outcome = EvaluationOutcome::Coalesced;
        // A failed evaluation does not release the slot: triggers coalesced
        // into it still run, and the first error is returned afterwards.
        let mut failure: Option<TributaryError> = None;

        'admission: loop {
            let Some(mut state) = slot.try_acquire() else {
                if outcome == EvaluationOutcome::Coalesced && failure.is_none() {
                    self.telemetry
                        .counter("controller_evaluations_coalesced_total")
                        .increment(1);
                    debug!("aggregate.type" = %aggregate.typ, "aggregate.id" = %aggregate.id, "evaluation coalesced");
                }
                break;
            };

            while let Some(trigger) = slot.take_pending() {
                if slot.is_evicted() {
                    debug!("aggregate.type" = %aggregate.typ, "aggregate.id" = %aggregate.id, "dropping trigger for evicted state");
                    break 'admission;
                }
                match self.evaluate_locked(&slot, &mut state, trigger).await {
                    Ok(action) => outcome = EvaluationOutcome::Applied { action },
                    Err(e) => {
                        self.record_failure(&aggregate, &e);
                        failure.get_or_insert(e);
                    }
                }
            }

            drop(state);
            // A trigger may have arrived between the last take and the unlock.
            if !slot.has_pending() || slot.is_evicted() {
                break;
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(outcome),
        }
    }

    fn record_failure(&self, aggregate: &Aggregate, e: &TributaryError) {
        self.telemetry
            .counter("controller_evaluation_errors_total")
            .increment(1);
        error!(
            controller = %self.name,
            "aggregate.type" = %aggregate.typ,
            "aggregate.id" = %aggregate.id,
            code = %e.code(),
            error = %e,
            "evaluation failed"
        );
    }

    async fn evaluate_locked(
        &self,
        slot: &EvalSlot,
        state: &mut EvalState,
        trigger: Trigger,
    ) -> Result<Action> {
        let _permit = self.permits.acquire().await?;

        let events = self.store.get(&state.aggregate).await?;
        state.evaluations += 1;
        self.telemetry.counter("controller_evaluations_total").increment(1);

        let ctx = EvalContext::new(state.clone(), trigger, events);
        let candidate = self.rule.eval(&ctx);

        let (action, iterations) =
            match converge(candidate, &ctx, self.config.max_convergence_iterations) {
                Ok(converged) => converged,
                Err(e) => {
                    self.telemetry.counter("controller_action_errors_total").increment(1);
                    return Err(e);
                }
            };
        self.telemetry
            .histogram("controller_convergence_iterations")
            .record(iterations as f64);

        debug!(
            "aggregate.type" = %state.aggregate.typ,
            "aggregate.id" = %state.aggregate.id,
            action = action.kind(),
            iterations,
            "applying action"
        );

        let kind = action.kind();
        let mut apply_ctx = ApplyContext {
            state,
            slot,
            eval_cache: &self.eval_cache,
            cache: self.cache.as_ref(),
            scheduler: &self.scheduler,
        };
        let applied = action.apply(&mut apply_ctx);
        apply_ctx.state.last_action = Some(kind);

        match applied {
            Ok(()) => {
                self.telemetry
                    .counter_with("controller_actions_applied_total", "action", kind)
                    .increment(1);
                Ok(action)
            }
            Err(e) => {
                self.telemetry.counter("controller_action_errors_total").increment(1);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn test_converge_reaches_fixed_point() {
        let ctx = EvalContext::detached(EvalState::new(Aggregate::new("invocation", "wf-1")));
        let (action, iterations) = converge(
            Action::Finalize {
                aggregate: Aggregate::new("invocation", "wf-1"),
            },
            &ctx,
            16,
        )
        .unwrap();
        assert!(matches!(action, Action::All(ref c) if c.len() == 2));
        assert_eq!(iterations, 2);

        let (action, iterations) = converge(Action::Skip, &ctx, 16).unwrap();
        assert_eq!(action, Action::Skip);
        assert_eq!(iterations, 1);
    }

    #[test]
    fn test_converge_cap_fails() {
        let ctx = EvalContext::detached(EvalState::new(Aggregate::new("invocation", "wf-1")));
        let finalize = Action::Finalize {
            aggregate: Aggregate::new("invocation", "wf-1"),
        };
        let err = converge(finalize, &ctx, 1).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConvergenceError);
    }
}
