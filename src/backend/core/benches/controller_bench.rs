//! Benchmarks for the controller's hot paths.
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use std::sync::Arc;
use tributary_core::config::{ControllerConfig, EventStoreConfig};
use tributary_core::controller::{converge, invocation_rules, Action, EvalCache, EvalContext, EvalState, Rule, Trigger};
use tributary_core::fes::{Aggregate, Event, EventStore};
use tributary_core::telemetry::Telemetry;
use tributary_core::transport::MemoryTransport;

fn finalize(i: usize) -> Action {
    let aggregate = Aggregate::new("invocation", format!("wf-{}", i));
    Action::Finalize { aggregate }
}

fn bench_converge(c: &mut Criterion) {
    let mut group = c.benchmark_group("converge");
    let ctx = EvalContext::detached(EvalState::new(Aggregate::new("invocation", "wf-0")));
    group.bench_function("leaf", |b| { b.iter(|| black_box(converge(Action::Skip, &ctx, 16))); });
    group.bench_function("finalize", |b| { b.iter(|| black_box(converge(finalize(0), &ctx, 16))); });
    for width in [2, 8, 32] {
        let action = Action::All((0..width).map(finalize).chain(std::iter::once(Action::Skip)).collect());
        group.bench_with_input(BenchmarkId::new("all", width), &action, |b, a| { b.iter(|| black_box(converge(a.clone(), &ctx, 16))); });
    }
    group.finish();
}

fn bench_rules(c: &mut Criterion) {
    let mut group = c.benchmark_group("invocation_rules");
    let rules = invocation_rules(&ControllerConfig::default());
    let wf = Aggregate::new("invocation", "wf-0");
    for len in [1, 16, 256] {
        let events = (0..len).map(|i| Event::new(if i % 4 == 3 { "TaskFailed" } else { "TaskSucceeded" }, wf.clone(), json!({}))).collect();
        let ctx = EvalContext::new(EvalState::new(wf.clone()), Trigger::Manual, events);
        group.bench_with_input(BenchmarkId::new("eval", len), &ctx, |b, ctx| { b.iter(|| black_box(rules.eval(ctx))); });
    }
    group.finish();
}

fn bench_eval_cache(c: &mut Criterion) {
    let mut group = c.benchmark_group("eval_cache");
    let cache = EvalCache::new(Telemetry::disabled("bench"));
    let aggregates: Vec<Aggregate> = (0..1_000).map(|i| Aggregate::new("invocation", format!("wf-{}", i))).collect();
    for aggregate in &aggregates { cache.get_or_create(aggregate); }
    group.bench_function("get_or_create_hit", |b| { let mut i = 0; b.iter(|| { i = (i + 1) % aggregates.len(); black_box(cache.get_or_create(&aggregates[i])) }); });
    group.bench_function("create_then_del", |b| {
        let wf = Aggregate::new("invocation", "transient");
        b.iter(|| { cache.get_or_create(&wf); black_box(cache.del(&wf)) });
    });
    group.finish();
}

fn bench_store_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("event_store_get");
    let rt = tokio::runtime::Runtime::new().unwrap();
    for len in [10, 100, 1_000] {
        let store = EventStore::new(Arc::new(MemoryTransport::new()), EventStoreConfig::default(), Telemetry::disabled("bench"));
        let wf = Aggregate::new("invocation", "wf-0");
        rt.block_on(async { for i in 0..len { store.append(&Event::new("TaskSucceeded", wf.clone(), json!({ "n": i }))).await.unwrap(); } });
        group.bench_with_input(BenchmarkId::new("memory", len), &wf, |b, wf| { b.to_async(&rt).iter(|| async { black_box(store.get(wf).await.unwrap()) }); });
    }
    group.finish();
}

criterion_group!(benches, bench_converge, bench_rules, bench_eval_cache, bench_store_get);
criterion_main!(benches);
