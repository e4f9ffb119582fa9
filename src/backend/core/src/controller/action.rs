//! Actions: what the controller decided to do.
//!
//! An [`Action`] is a value. [`Action::eval`] refines it against the
//! evaluation context and [`Action::apply`] performs its side effect. Leaf
//! variants are fixed points of `eval`. The refining variants (`Finalize`,
//! `All`) rewrite into leaves, and every rewrite strictly lowers
//! [`Action::weight`], so refinement always reaches a fixed point.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::info;

use super::eval::{EvalCache, EvalContext, EvalSlot, EvalState};
use super::scheduler::WaitScheduler;
use crate::error::{Result, TributaryError};
use crate::fes::{Aggregate, CacheWriter};

/// Failure carried by [`Action::Error`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionFailure {
    pub reason: String,
    pub aggregate: Option<Aggregate>,
}

impl ActionFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            aggregate: None,
        }
    }

    pub fn for_aggregate(reason: impl Into<String>, aggregate: Aggregate) -> Self {
        Self {
            reason: reason.into(),
            aggregate: Some(aggregate),
        }
    }

    pub fn to_error(&self) -> TributaryError {
        let err = TributaryError::action(self.reason.clone());
        match &self.aggregate {
            Some(aggregate) => err.with_context("aggregate", aggregate),
            None => err,
        }
    }
}

/// Controller decision.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Re-evaluate the aggregate after a delay
    Wait(Duration),
    /// Nothing to do this cycle
    Skip,
    /// Evict an evaluation state
    RemoveFromEvalCache { aggregate: Aggregate },
    /// Invalidate a projection
    RemoveFromProjectionCache { aggregate: Aggregate },
    /// Surface a failure to the caller
    Error(ActionFailure),
    /// The aggregate reached a terminal state; drop everything held for it
    Finalize { aggregate: Aggregate },
    /// Apply several actions in order
    All(Vec<Action>),
}

/// What [`Action::apply`] may touch.
pub struct ApplyContext<'a> {
    /// State of the aggregate under evaluation, locked by the caller
    pub state: &'a mut EvalState,
    pub slot: &'a EvalSlot,
    pub eval_cache: &'a EvalCache,
    pub cache: &'a dyn CacheWriter,
    pub scheduler: &'a WaitScheduler,
}

impl Action {
    pub fn error(reason: impl Into<String>) -> Self {
        Self::Error(ActionFailure::new(reason))
    }

    /// Short name used in logs and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Wait(_) => "wait",
            Self::Skip => "skip",
            Self::RemoveFromEvalCache { .. } => "remove_from_eval_cache",
            Self::RemoveFromProjectionCache { .. } => "remove_from_projection_cache",
            Self::Error(_) => "error",
            Self::Finalize { .. } => "finalize",
            Self::All(_) => "all",
        }
    }

    pub fn is_leaf(&self) -> bool {
        !matches!(self, Self::Finalize { .. } | Self::All(_))
    }

    pub fn is_skip(&self) -> bool {
        matches!(self, Self::Skip)
    }

    /// Termination measure for refinement.
    pub fn weight(&self) -> usize {
        match self {
            Self::Finalize { .. } => 5,
            Self::All(children) => 2 + children.iter().map(Action::weight).sum::<usize>(),
            _ => 1,
        }
    }

    /// Refine one step. Returns an equal value at a fixed point.
    pub fn eval(&self, ctx: &EvalContext) -> Action {
        match self {
            Self::Finalize { aggregate } => Self::All(vec![
                Self::RemoveFromProjectionCache {
                    aggregate: aggregate.clone(),
                },
                Self::RemoveFromEvalCache {
                    aggregate: aggregate.clone(),
                },
            ]),
            Self::All(children) => {
                let mut flat = Vec::with_capacity(children.len());
                for child in children {
                    match child.eval(ctx) {
                        Self::Skip => {}
                        Self::All(nested) => flat.extend(nested),
                        refined => flat.push(refined),
                    }
                }
                match flat.len() {
                    0 => Self::Skip,
                    1 => flat.remove(0),
                    _ => Self::All(flat),
                }
            }
            leaf => leaf.clone(),
        }
    }

    /// Perform the side effect.
    pub fn apply(&self, ctx: &mut ApplyContext<'_>) -> Result<()> {
        match self {
            Self::Wait(duration) => {
                ctx.state.waiting_until = Some(wait_deadline(Utc::now(), *duration));
                ctx.state.waits += 1;
                ctx.scheduler
                    .schedule(ctx.slot, ctx.state.aggregate.clone(), *duration);
                Ok(())
            }
            Self::Skip => Ok(()),
            Self::RemoveFromEvalCache { aggregate } => {
                info!("aggregate.type" = %aggregate.typ, "aggregate.id" = %aggregate.id, "removing from eval cache");
                ctx.eval_cache.del(aggregate);
                Ok(())
            }
            Self::RemoveFromProjectionCache { aggregate } => {
                ctx.cache.invalidate(aggregate);
                Ok(())
            }
            Self::Error(failure) => Err(failure.to_error()),
            Self::Finalize { .. } => {
                let refined = self.eval(&EvalContext::detached(ctx.state.clone()));
                refined.apply(ctx)
            }
            Self::All(children) => {
                for child in children {
                    child.apply(ctx)?;
                }
                Ok(())
            }
        }
    }
}

/// End of a wait starting at `now`. Saturates at the latest representable
/// time, matching a timer that never fires.
pub fn wait_deadline(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
