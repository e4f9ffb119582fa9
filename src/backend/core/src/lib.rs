#![allow(clippy::result_large_err)]
//! # Tributary Core
//!
//! Event-sourced state layer and reconciliation controller for workflow
//! orchestration.
//!
//! ## Architecture
//!
//! - **Transport**: durable, subject-addressed streaming log (in-memory or Redis Streams)
//! - **Event Store**: per-aggregate append-only logs with point reads, listing, and live watches
//! - **Projection Cache**: read models folded from event logs, invalidated as logs grow
//! - **Controller**: per-aggregate single-flight evaluation of rules into converged actions
//! - **Functions**: pure request/response builtins such as the string switch
//! - **Bundle**: switches that decide which of the above a process runs
//! - **Telemetry**: structured logging and metrics through an explicit handle

pub mod bundle;
pub mod config;
pub mod controller;
pub mod error;
pub mod fes;
pub mod functions;
pub mod telemetry;
pub mod transport;

pub use error::{ErrorCode, ErrorDetails, ErrorSeverity, Result, TributaryError};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::bundle::{Bundle, BundleOptions};
    pub use crate::config::Config;
    pub use crate::controller::{
        converge, Action, ActionFailure, Controller, EvalCache, EvalContext, EvalState,
        EvaluationOutcome, Rule, Trigger,
    };
    pub use crate::error::{ErrorCode, ErrorDetails, ErrorSeverity, Result, TributaryError};
    pub use crate::fes::{
        make_subject, parse_subject, Aggregate, CacheWriter, Event, EventLog, EventStore,
        Projection, ProjectionCache,
    };
    pub use crate::functions::{Function, FunctionRegistry, Inputs, SwitchFunction};
    pub use crate::telemetry::Telemetry;
    pub use crate::transport::{
        MemoryTransport, Message, RedisTransport, SubjectMatcher, SubscribeOptions, Transport,
    };
}
