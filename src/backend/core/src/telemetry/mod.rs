//! Telemetry: structured logging, metrics, and the per-component handle.
//!
//! Binaries call [`init_logging`] and [`init_metrics`] once at startup. Library
//! components never touch global observability state directly: each one is
//! constructed with a [`Telemetry`] handle naming the component and carrying
//! the span its logs are attached to.
//!
//! # Example
//!
//! ```rust,no_run
//! use tributary_core::telemetry::{init_logging, LogFormat, Telemetry};
//!
//! init_logging("info", &LogFormat::Pretty).expect("Failed to initialize logging");
//! let telemetry = Telemetry::new("fes");
//! let controller_telemetry = telemetry.child("controller.invocation");
//! ```

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogFormat};
pub use metrics::{init_metrics, register_metric_descriptions};

use tracing::Span;

/// Observability handle threaded through component constructors.
///
/// Cloning is cheap; clones share the same span.
#[derive(Debug, Clone)]
pub struct Telemetry {
    component: String,
    span: Span,
}

impl Telemetry {
    /// Create a root handle for a component.
    pub fn new(component: impl Into<String>) -> Self {
        let component = component.into();
        let span = tracing::info_span!("component", name = %component);
        Self { component, span }
    }

    /// Create a handle for a sub-component whose span nests under this one.
    pub fn child(&self, component: impl Into<String>) -> Self {
        let component = component.into();
        let span = tracing::info_span!(parent: &self.span, "component", name = %component);
        Self { component, span }
    }

    /// A handle that attaches logs to no span. Used by tests and tools.
    pub fn disabled(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            span: Span::none(),
        }
    }

    /// Component name, used as the `component` metric label.
    pub fn component(&self) -> &str {
        &self.component
    }

    /// Span that component logs and spawned tasks are attached to.
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Counter labelled with this component.
    pub fn counter(&self, name: &'static str) -> ::metrics::Counter {
        ::metrics::counter!(name, "component" => self.component.clone())
    }

    /// Counter labelled with this component and one extra label.
    pub fn counter_with(
        &self,
        name: &'static str,
        label: &'static str,
        value: impl Into<String>,
    ) -> ::metrics::Counter {
        let value: String = value.into();
        ::metrics::counter!(name, "component" => self.component.clone(), label => value)
    }

    /// Histogram labelled with this component.
    pub fn histogram(&self, name: &'static str) -> ::metrics::Histogram {
        ::metrics::histogram!(name, "component" => self.component.clone())
    }

    /// Gauge labelled with this component.
    pub fn gauge(&self, name: &'static str) -> ::metrics::Gauge {
        ::metrics::gauge!(name, "component" => self.component.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_keeps_own_component_name() {
        let root = Telemetry::new("bundle");
        let child = root.child("controller.invocation");
        assert_eq!(root.component(), "bundle");
        assert_eq!(child.component(), "controller.invocation");
    }

    #[test]
    fn test_disabled_handle_has_no_span() {
        let telemetry = Telemetry::disabled("test");
        assert!(telemetry.span().is_none());
        // Metric handles are usable without an installed recorder.
        telemetry.counter("fes_events_appended_total").increment(1);
    }
}
