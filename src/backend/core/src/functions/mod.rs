//! Function invocation boundary.
//!
//! Functions are pure request/response transforms: a map of named JSON inputs
//! in, an optional JSON value out. They never touch the event store.

pub mod switch;

pub use switch::SwitchFunction;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{Result, TributaryError};

/// Named inputs of an invocation.
pub type Inputs = HashMap<String, Value>;

/// An invocable function.
pub trait Function: Send + Sync {
    fn name(&self) -> &str;

    fn invoke(&self, inputs: &Inputs) -> Result<Option<Value>>;
}

/// Required input, or a `FunctionInputError` naming it.
pub fn require_input<'a>(inputs: &'a Inputs, key: &str) -> Result<&'a Value> {
    inputs
        .get(key)
        .ok_or_else(|| TributaryError::function_input(format!("missing required input '{}'", key)))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Function Registry
// ═══════════════════════════════════════════════════════════════════════════════

/// Functions by name.
#[derive(Default)]
pub struct FunctionRegistry {
    functions: RwLock<HashMap<String, Arc<dyn Function>>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every builtin function.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register(SwitchFunction);
        registry
    }

    /// Register a function, replacing any function with the same name.
    pub fn register(&self, function: impl Function + 'static) {
        let name = function.name().to_string();
        if self.functions.write().insert(name.clone(), Arc::new(function)).is_some() {
            info!(function = %name, "replaced registered function");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Function>> {
        self.functions.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn invoke(&self, name: &str, inputs: &Inputs) -> Result<Option<Value>> {
        let function = self
            .get(name)
            .ok_or_else(|| TributaryError::function_not_found(name))?;
        debug!(function = %name, inputs = inputs.len(), "invoking function");
        function.invoke(inputs)
    }
}
