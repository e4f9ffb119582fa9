//! Integration tests for the reactive controller.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tributary_core::bundle::Bundle;
use tributary_core::config::{Config, ControllerConfig, EventStoreConfig};
use tributary_core::controller::{
    invocation_rules, Action, CompletionRule, Controller, EvalContext, EvaluationOutcome, Rule,
    SkipRule,
};
use tributary_core::error::ErrorCode;
use tributary_core::fes::{Aggregate, CacheWriter, Event, EventLog, EventStore, ProjectionCache};
use tributary_core::telemetry::Telemetry;
use tributary_core::transport::MemoryTransport;

// ============================================================================
// Test Utilities
// ============================================================================

/// Records every invalidation.
#[derive(Default)]
struct RecordingCache {
    invalidated: Mutex<Vec<Aggregate>>,
}

impl RecordingCache {
    fn invalidated(&self) -> Vec<Aggregate> {
        self.invalidated.lock().clone()
    }
}

impl CacheWriter for RecordingCache {
    fn invalidate(&self, aggregate: &Aggregate) {
        self.invalidated.lock().push(aggregate.clone());
    }
}

/// Counts evaluations and the most evaluations ever running at once.
#[derive(Default)]
struct CountingRule {
    evaluations: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl Rule for CountingRule {
    fn name(&self) -> &str {
        "counting"
    }

    fn eval(&self, _ctx: &EvalContext) -> Action {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(5));
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.evaluations.fetch_add(1, Ordering::SeqCst);
        Action::Skip
    }
}

/// Waits once, then skips.
#[derive(Default)]
struct WaitOnceRule {
    evaluations: AtomicUsize,
}

impl Rule for WaitOnceRule {
    fn name(&self) -> &str {
        "wait_once"
    }

    fn eval(&self, ctx: &EvalContext) -> Action {
        self.evaluations.fetch_add(1, Ordering::SeqCst);
        if ctx.state.waits == 0 {
            Action::Wait(Duration::from_millis(20))
        } else {
            Action::Skip
        }
    }
}

/// Blocks on its first evaluation and fails it; later evaluations skip.
#[derive(Default)]
struct FailFirstRule {
    evaluations: AtomicUsize,
}

impl Rule for FailFirstRule {
    fn name(&self) -> &str {
        "fail_first"
    }

    fn eval(&self, _ctx: &EvalContext) -> Action {
        if self.evaluations.fetch_add(1, Ordering::SeqCst) == 0 {
            std::thread::sleep(Duration::from_millis(200));
            Action::error("first attempt fails")
        } else {
            Action::Skip
        }
    }
}

/// Waits longer than any clock can represent.
struct WaitForeverRule;

impl Rule for WaitForeverRule {
    fn name(&self) -> &str {
        "wait_forever"
    }

    fn eval(&self, _ctx: &EvalContext) -> Action {
        Action::Wait(Duration::from_secs(10_000_000_000_000))
    }
}

/// Records the aggregate of every evaluation.
#[derive(Default)]
struct SeenRule {
    seen: Mutex<Vec<Aggregate>>,
}

impl Rule for SeenRule {
    fn name(&self) -> &str {
        "seen"
    }

    fn eval(&self, ctx: &EvalContext) -> Action {
        self.seen.lock().push(ctx.aggregate().clone());
        Action::Skip
    }
}

struct Fixture {
    transport: Arc<MemoryTransport>,
    store: Arc<EventStore>,
    cache: Arc<RecordingCache>,
}

fn fixture() -> Fixture {
    let transport = Arc::new(MemoryTransport::new());
    let store = Arc::new(EventStore::new(
        transport.clone(),
        EventStoreConfig::default(),
        Telemetry::disabled("fes"),
    ));
    Fixture {
        transport,
        store,
        cache: Arc::new(RecordingCache::default()),
    }
}

fn controller(f: &Fixture, rule: Arc<dyn Rule>, config: ControllerConfig) -> Arc<Controller> {
    controller_for(f, &["invocation"], rule, config)
}

fn controller_for(f: &Fixture, types: &[&str], rule: Arc<dyn Rule>, config: ControllerConfig) -> Arc<Controller> {
    Arc::new(Controller::new(
        "test",
        types.iter().map(|t| t.to_string()).collect(),
        f.store.clone(),
        f.cache.clone(),
        rule,
        config,
        Telemetry::disabled("controller"),
    ))
}

fn wf() -> Aggregate {
    Aggregate::new("invocation", "wf-1")
}

async fn eventually<F: Fn() -> bool>(check: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_terminal_event_finalizes() {
    let f = fixture();
    let c = controller(&f, Arc::new(CompletionRule::new(["InvocationCompleted"])), ControllerConfig::default());

    let created = Event::new("InvocationCreated", wf(), json!({}));
    f.store.append(&created).await.unwrap();
    let outcome = c.handle(created).await.unwrap();
    assert_eq!(outcome, EvaluationOutcome::Applied { action: Action::Skip });
    assert!(c.eval_cache().contains(&wf()));
    assert!(f.cache.invalidated().is_empty());

    let completed = Event::new("InvocationCompleted", wf(), json!({}));
    f.store.append(&completed).await.unwrap();
    let outcome = c.handle(completed).await.unwrap();

    assert_eq!(
        outcome,
        EvaluationOutcome::Applied {
            action: Action::All(vec![
                Action::RemoveFromProjectionCache { aggregate: wf() },
                Action::RemoveFromEvalCache { aggregate: wf() },
            ])
        }
    );
    assert!(!c.eval_cache().contains(&wf()));
    assert_eq!(f.cache.invalidated(), vec![wf()]);
}

#[tokio::test]
async fn test_skip_has_no_side_effects() {
    let f = fixture();
    let c = controller(&f, Arc::new(SkipRule), ControllerConfig::default());

    let event = Event::new("InvocationCreated", wf(), json!({}));
    f.store.append(&event).await.unwrap();
    let before = f.transport.message_count();

    for _ in 0..3 {
        c.handle(event.clone()).await.unwrap();
    }

    assert!(f.cache.invalidated().is_empty());
    assert_eq!(f.transport.message_count(), before);
    assert_eq!(c.eval_cache().len(), 1);
}

#[tokio::test]
async fn test_removing_unknown_state_is_idempotent() {
    let f = fixture();
    let c = controller(&f, Arc::new(CompletionRule::new(["InvocationCompleted"])), ControllerConfig::default());

    let completed = Event::new("InvocationCompleted", wf(), json!({}));
    f.store.append(&completed).await.unwrap();
    c.handle(completed.clone()).await.unwrap();
    assert!(c.eval_cache().is_empty());

    // Evaluating again recreates the state and finalizes it again.
    c.handle(completed).await.unwrap();
    assert!(c.eval_cache().is_empty());
    assert_eq!(f.cache.invalidated().len(), 2);
}

#[tokio::test]
async fn test_convergence_cap_is_an_error() {
    let f = fixture();
    let config = ControllerConfig {
        max_convergence_iterations: 1,
        ..ControllerConfig::default()
    };
    let c = controller(&f, Arc::new(CompletionRule::new(["InvocationCompleted"])), config);

    let completed = Event::new("InvocationCompleted", wf(), json!({}));
    f.store.append(&completed).await.unwrap();
    let err = c.handle(completed).await.unwrap_err();

    assert_eq!(err.code(), ErrorCode::ConvergenceError);
    assert!(f.cache.invalidated().is_empty());
    assert!(c.eval_cache().contains(&wf()));
}

#[tokio::test]
async fn test_error_action_fails_the_evaluation() {
    let f = fixture();
    let c = controller(&f, Arc::new(invocation_rules(&ControllerConfig::default())), ControllerConfig::default());

    for _ in 0..4 {
        f.store.append(&Event::new("TaskFailed", wf(), json!({}))).await.unwrap();
    }
    let err = c.evaluate(&wf()).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ActionApplicationError);

    // The state survives a failed evaluation.
    let slot = c.eval_cache().get(&wf()).unwrap();
    assert_eq!(slot.snapshot().unwrap().last_action, Some("error"));
}

#[tokio::test]
async fn test_invalid_aggregate_is_rejected() {
    let f = fixture();
    let c = controller(&f, Arc::new(SkipRule), ControllerConfig::default());
    let err = c.evaluate(&Aggregate::new("", "wf-1")).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidAggregate);
    assert!(c.eval_cache().is_empty());
}

#[tokio::test]
async fn test_store_failure_is_returned() {
    let f = fixture();
    let c = controller(&f, Arc::new(SkipRule), ControllerConfig::default());
    f.store.close().await.unwrap();

    let err = c.evaluate(&wf()).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::TransportClosed);

    let slot = c.eval_cache().get(&wf()).unwrap();
    assert!(!slot.is_busy());
    assert!(!slot.has_pending());
    assert_eq!(slot.snapshot().unwrap().evaluations, 0);
}

#[tokio::test]
async fn test_huge_wait_saturates_deadline() {
    let f = fixture();
    let c = controller(&f, Arc::new(WaitForeverRule), ControllerConfig::default());

    let outcome = c.evaluate(&wf()).await.unwrap();
    assert!(matches!(outcome, EvaluationOutcome::Applied { action: Action::Wait(_) }));

    let slot = c.eval_cache().get(&wf()).unwrap();
    assert!(slot.has_timer());
    let state = slot.snapshot().unwrap();
    assert_eq!(state.waiting_until, Some(DateTime::<Utc>::MAX_UTC));
    assert_eq!(state.waits, 1);
}

#[tokio::test]
async fn test_same_id_of_different_types_is_tracked_separately() {
    let f = fixture();
    let rule = Arc::new(SeenRule::default());
    let c = controller_for(&f, &["invocation", "workflow"], rule.clone(), ControllerConfig::default());

    let invocation = Aggregate::new("invocation", "x");
    let workflow = Aggregate::new("workflow", "x");
    c.evaluate(&invocation).await.unwrap();
    c.evaluate(&workflow).await.unwrap();

    assert_eq!(*rule.seen.lock(), vec![invocation.clone(), workflow.clone()]);
    assert_eq!(c.eval_cache().len(), 2);
    assert_eq!(c.eval_cache().get(&workflow).unwrap().snapshot().unwrap().aggregate, workflow);
}

// ============================================================================
// Coalescing
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_trigger_coalesced_into_failing_evaluation_still_runs() {
    let f = fixture();
    let rule = Arc::new(FailFirstRule::default());
    let c = controller(&f, rule.clone(), ControllerConfig::default());

    let first = {
        let c = c.clone();
        tokio::spawn(async move { c.evaluate(&wf()).await })
    };
    eventually(|| rule.evaluations.load(Ordering::SeqCst) == 1).await;

    // The first evaluation is still inside the rule.
    assert_eq!(c.evaluate(&wf()).await.unwrap(), EvaluationOutcome::Coalesced);

    let err = first.await.unwrap().unwrap_err();
    assert_eq!(err.code(), ErrorCode::ActionApplicationError);

    assert_eq!(rule.evaluations.load(Ordering::SeqCst), 2);
    let slot = c.eval_cache().get(&wf()).unwrap();
    assert!(!slot.has_pending());
    let state = slot.snapshot().unwrap();
    assert_eq!(state.evaluations, 2);
    assert_eq!(state.last_action, Some("skip"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_triggers_coalesce() {
    const TRIGGERS: usize = 16;

    let f = fixture();
    let rule = Arc::new(CountingRule::default());
    let c = controller(&f, rule.clone(), ControllerConfig::default());

    let event = Event::new("InvocationCreated", wf(), json!({}));
    f.store.append(&event).await.unwrap();

    let handles: Vec<_> = (0..TRIGGERS)
        .map(|_| {
            let c = c.clone();
            let event = event.clone();
            tokio::spawn(async move { c.handle(event).await })
        })
        .collect();

    let mut applied = 0;
    for handle in handles {
        if let EvaluationOutcome::Applied { .. } = handle.await.unwrap().unwrap() {
            applied += 1;
        }
    }

    let evaluations = rule.evaluations.load(Ordering::SeqCst);
    assert!(applied >= 1);
    assert!(evaluations >= 1 && evaluations <= TRIGGERS);
    assert_eq!(rule.max_active.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_distinct_aggregates_evaluate_independently() {
    let f = fixture();
    let rule = Arc::new(CountingRule::default());
    let c = controller(&f, rule.clone(), ControllerConfig::default());

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let c = c.clone();
            tokio::spawn(async move { c.evaluate(&Aggregate::new("invocation", format!("wf-{}", i))).await })
        })
        .collect();
    for handle in handles {
        assert!(matches!(
            handle.await.unwrap().unwrap(),
            EvaluationOutcome::Applied { .. }
        ));
    }

    assert_eq!(rule.evaluations.load(Ordering::SeqCst), 8);
    assert_eq!(c.eval_cache().len(), 8);
}

// ============================================================================
// Running Controller
// ============================================================================

#[tokio::test]
async fn test_running_controller_reacts_to_watched_events() {
    let f = fixture();
    let c = controller(&f, Arc::new(CompletionRule::new(["InvocationCompleted"])), ControllerConfig::default());
    let shutdown = CancellationToken::new();
    let task = c.start(shutdown.clone()).unwrap();
    f.store.watch("invocation").await.unwrap();

    f.store.append(&Event::new("InvocationCreated", wf(), json!({}))).await.unwrap();
    eventually(|| c.eval_cache().contains(&wf())).await;

    f.store.append(&Event::new("InvocationCompleted", wf(), json!({}))).await.unwrap();
    eventually(|| !c.eval_cache().contains(&wf())).await;
    eventually(|| f.cache.invalidated() == vec![wf()]).await;

    shutdown.cancel();
    task.await.unwrap();
    assert!(c.start(CancellationToken::new()).is_err());
}

#[tokio::test]
async fn test_wait_schedules_reevaluation() {
    let f = fixture();
    let rule = Arc::new(WaitOnceRule::default());
    let c = controller(&f, rule.clone(), ControllerConfig::default());
    let shutdown = CancellationToken::new();
    let task = c.start(shutdown.clone()).unwrap();
    f.store.watch("invocation").await.unwrap();

    f.store.append(&Event::new("TaskFailed", wf(), json!({}))).await.unwrap();
    eventually(|| rule.evaluations.load(Ordering::SeqCst) >= 2).await;

    let state = c.eval_cache().get(&wf()).unwrap();
    eventually(|| state.snapshot().map_or(false, |s| s.waits == 1 && s.last_action == Some("skip"))).await;

    shutdown.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn test_finalize_cancels_pending_wait() {
    let f = fixture();
    let c = controller(
        &f,
        Arc::new(invocation_rules(&ControllerConfig {
            backoff_base: Duration::from_secs(60),
            ..ControllerConfig::default()
        })),
        ControllerConfig::default(),
    );

    let failed = Event::new("TaskFailed", wf(), json!({}));
    f.store.append(&failed).await.unwrap();
    let outcome = c.handle(failed).await.unwrap();
    assert!(matches!(outcome, EvaluationOutcome::Applied { action: Action::Wait(_) }));

    let slot = c.eval_cache().get(&wf()).unwrap();
    assert!(slot.has_timer());

    let completed = Event::new("InvocationCompleted", wf(), json!({}));
    f.store.append(&completed).await.unwrap();
    c.handle(completed).await.unwrap();

    assert!(slot.is_evicted());
    assert!(!slot.has_timer());
}

// ============================================================================
// Bundle
// ============================================================================

#[tokio::test]
async fn test_bundle_end_to_end() {
    let transport = Arc::new(MemoryTransport::new());
    let bundle = Bundle::with_transport(&Config::default(), transport, Telemetry::disabled("bundle"))
        .await
        .unwrap();
    let store = bundle.store().clone();
    let invocations = bundle.controller("invocation").unwrap().clone();
    let projections: Arc<ProjectionCache<EventLog>> = bundle.projections().clone();

    store.append(&Event::new("InvocationCreated", wf(), json!({}))).await.unwrap();
    eventually(|| invocations.eval_cache().contains(&wf())).await;

    assert_eq!(projections.get(&wf()).await.unwrap().event_count, 1);

    store.append(&Event::new("InvocationCompleted", wf(), json!({}))).await.unwrap();
    eventually(|| !invocations.eval_cache().contains(&wf())).await;
    eventually(|| !projections.contains(&wf())).await;

    let log = projections.get(&wf()).await.unwrap();
    assert_eq!(log.event_count, 2);
    assert_eq!(log.last_event_type.as_deref(), Some("InvocationCompleted"));

    bundle.shutdown().await.unwrap();
}
