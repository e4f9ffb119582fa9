//! Rules: turn an evaluation context into a candidate action.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use super::action::{Action, ActionFailure};
use super::eval::EvalContext;
use crate::config::ControllerConfig;

/// Decides what to do for one evaluation.
pub trait Rule: Send + Sync {
    fn name(&self) -> &str;

    fn eval(&self, ctx: &EvalContext) -> Action;
}

fn type_set<I, S>(types: I) -> HashSet<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    types.into_iter().map(Into::into).collect()
}

// =============================================================================
// Skip
// =============================================================================

/// Never does anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct SkipRule;

impl Rule for SkipRule {
    fn name(&self) -> &str {
        "skip"
    }

    fn eval(&self, _ctx: &EvalContext) -> Action {
        Action::Skip
    }
}

// =============================================================================
// First Match
// =============================================================================

/// Runs rules in order and returns the first action that is not `Skip`.
#[derive(Clone, Default)]
pub struct FirstMatch {
    rules: Vec<Arc<dyn Rule>>,
}

impl FirstMatch {
    pub fn new(rules: Vec<Arc<dyn Rule>>) -> Self {
        Self { rules }
    }

    pub fn with(mut self, rule: impl Rule + 'static) -> Self {
        self.rules.push(Arc::new(rule));
        self
    }
}

impl Rule for FirstMatch {
    fn name(&self) -> &str {
        "first_match"
    }

    fn eval(&self, ctx: &EvalContext) -> Action {
        self.rules
            .iter()
            .map(|rule| rule.eval(ctx))
            .find(|action| !action.is_skip())
            .unwrap_or(Action::Skip)
    }
}

// =============================================================================
// Completion
// =============================================================================

/// Finalizes aggregates whose last event is terminal.
#[derive(Debug, Clone)]
pub struct CompletionRule {
    terminal_types: HashSet<String>,
}

impl CompletionRule {
    pub fn new<I, S>(terminal_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            terminal_types: type_set(terminal_types),
        }
    }
}

impl Rule for CompletionRule {
    fn name(&self) -> &str {
        "completion"
    }

    fn eval(&self, ctx: &EvalContext) -> Action {
        match ctx.last_event() {
            Some(event) if self.terminal_types.contains(&event.event_type) => Action::Finalize {
                aggregate: ctx.aggregate().clone(),
            },
            _ => Action::Skip,
        }
    }
}

// =============================================================================
// Timeout
// =============================================================================

/// Fails aggregates older than a deadline, measured from their first event.
#[derive(Debug, Clone)]
pub struct TimeoutRule {
    timeout: Duration,
}

impl TimeoutRule {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Rule for TimeoutRule {
    fn name(&self) -> &str {
        "timeout"
    }

    fn eval(&self, ctx: &EvalContext) -> Action {
        let Some(first) = ctx.events.first() else {
            return Action::Skip;
        };
        let age = (ctx.now - first.timestamp).to_std().unwrap_or_default();
        if age > self.timeout {
            Action::Error(ActionFailure::for_aggregate(
                format!("aggregate exceeded its deadline of {:?}", self.timeout),
                ctx.aggregate().clone(),
            ))
        } else {
            Action::Skip
        }
    }
}

// =============================================================================
// Error Count
// =============================================================================

/// Fails aggregates that recorded more than `max_errors` failure events.
#[derive(Debug, Clone)]
pub struct ErrorCountRule {
    failure_types: HashSet<String>,
    max_errors: usize,
}

impl ErrorCountRule {
    pub fn new<I, S>(failure_types: I, max_errors: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            failure_types: type_set(failure_types),
            max_errors,
        }
    }
}

impl Rule for ErrorCountRule {
    fn name(&self) -> &str {
        "error_count"
    }

    fn eval(&self, ctx: &EvalContext) -> Action {
        let failures = ctx.count_events(|e| self.failure_types.contains(&e.event_type));
        if failures > self.max_errors {
            Action::Error(ActionFailure::for_aggregate(
                format!("{} failures exceed the limit of {}", failures, self.max_errors),
                ctx.aggregate().clone(),
            ))
        } else {
            Action::Skip
        }
    }
}

// =============================================================================
// Backoff
// =============================================================================

/// Backs off after each failure event, doubling the delay per failure.
///
/// Waits at most once per failure: an aggregate that already waited as many
/// times as it failed, or is still waiting, is skipped.
#[derive(Debug, Clone)]
pub struct BackoffRule {
    failure_types: HashSet<String>,
    max_errors: usize,
    base: Duration,
    max: Duration,
}

impl BackoffRule {
    pub fn new<I, S>(failure_types: I, max_errors: usize, base: Duration, max: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            failure_types: type_set(failure_types),
            max_errors,
            base,
            max,
        }
    }

    /// Delay before the retry following the `attempt`-th failure (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base.saturating_mul(factor).min(self.max)
    }
}

impl Rule for BackoffRule {
    fn name(&self) -> &str {
        "backoff"
    }

    fn eval(&self, ctx: &EvalContext) -> Action {
        let last_failed = ctx
            .last_event()
            .map_or(false, |e| self.failure_types.contains(&e.event_type));
        if !last_failed || ctx.state.is_waiting(ctx.now) {
            return Action::Skip;
        }

        let failures = ctx.count_events(|e| self.failure_types.contains(&e.event_type));
        if failures > self.max_errors || ctx.state.waits as usize >= failures {
            return Action::Skip;
        }
        Action::Wait(self.delay(failures as u32))
    }
}

// =============================================================================
// Rule Sets
// =============================================================================

pub const INVOCATION_TERMINAL_EVENTS: [&str; 3] =
    ["InvocationCompleted", "InvocationFailed", "InvocationCanceled"];
pub const INVOCATION_FAILURE_EVENTS: [&str; 2] = ["TaskFailed", "InvocationTaskFailed"];

pub const WORKFLOW_TERMINAL_EVENTS: [&str; 1] = ["WorkflowDeleted"];
pub const WORKFLOW_FAILURE_EVENTS: [&str; 1] = ["WorkflowParsingFailed"];

/// Rules of the invocation controller.
pub fn invocation_rules(config: &ControllerConfig) -> FirstMatch {
    FirstMatch::default()
        .with(CompletionRule::new(INVOCATION_TERMINAL_EVENTS))
        .with(ErrorCountRule::new(INVOCATION_FAILURE_EVENTS, config.max_errors))
        .with(TimeoutRule::new(config.evaluation_timeout))
        .with(BackoffRule::new(
            INVOCATION_FAILURE_EVENTS,
            config.max_errors,
            config.backoff_base,
            config.backoff_max,
        ))
}

/// Rules of the workflow controller.
pub fn workflow_rules(config: &ControllerConfig) -> FirstMatch {
    FirstMatch::default()
        .with(CompletionRule::new(WORKFLOW_TERMINAL_EVENTS))
        .with(ErrorCountRule::new(WORKFLOW_FAILURE_EVENTS, config.max_errors))
        .with(BackoffRule::new(
            WORKFLOW_FAILURE_EVENTS,
            config.max_errors,
            config.backoff_base,
            config.backoff_max,
        ))
}
