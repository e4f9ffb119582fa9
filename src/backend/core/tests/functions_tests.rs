//! Integration tests for the function registry.

use serde_json::{json, Value};
use tokio_test::{assert_err, assert_ok};
use tributary_core::error::{ErrorCode, Result};
use tributary_core::functions::{require_input, Function, FunctionRegistry, Inputs};

struct Echo;

impl Function for Echo {
    fn name(&self) -> &str {
        "echo"
    }

    fn invoke(&self, inputs: &Inputs) -> Result<Option<Value>> {
        Ok(Some(require_input(inputs, "value")?.clone()))
    }
}

fn inputs(pairs: &[(&str, Value)]) -> Inputs {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

#[test]
fn test_builtin_switch_through_registry() {
    let registry = FunctionRegistry::with_builtins();
    let out = registry
        .invoke(
            "switch",
            &inputs(&[
                ("switch", json!("b")),
                ("cases", json!([{"case": "a", "action": 1}, {"case": "b", "action": 2}])),
            ]),
        )
        .unwrap();
    assert_eq!(out, Some(json!(2)));
}

#[test]
fn test_registered_function_is_invocable() {
    let registry = FunctionRegistry::new();
    registry.register(Echo);
    assert_eq!(registry.names(), vec!["echo"]);

    let out = assert_ok!(registry.invoke("echo", &inputs(&[("value", json!({"x": 1}))])));
    assert_eq!(out, Some(json!({"x": 1})));

    let err = assert_err!(registry.invoke("echo", &Inputs::new()));
    assert_eq!(err.code(), ErrorCode::FunctionInputError);
}

#[test]
fn test_unknown_function() {
    let registry = FunctionRegistry::with_builtins();
    let err = registry.invoke("missing", &Inputs::new()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::FunctionNotFound);
    assert!(registry.get("missing").is_none());
}
