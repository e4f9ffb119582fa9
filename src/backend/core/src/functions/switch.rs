//! String switch.
//!
//! | input     | required | type   | meaning                                   |
//! |-----------|----------|--------|-------------------------------------------|
//! | `switch`  | yes      | scalar | value matched against the case keys       |
//! | `cases`   | no       | list   | `{case: <string>, action: <any>}` entries |
//! | `default` | no       | any    | output when no case matches               |
//!
//! Output: the matching case's `action`, else `default`, else nothing.

use std::collections::HashMap;

use serde_json::Value;
use tracing::debug;

use super::{require_input, Function, Inputs};
use crate::error::{Result, TributaryError};

pub const SWITCH: &str = "switch";
pub const INPUT_CONDITION: &str = "switch";
pub const INPUT_CASES: &str = "cases";
pub const INPUT_DEFAULT: &str = "default";
pub const CASE_KEY: &str = "case";
pub const CASE_VALUE: &str = "action";

#[derive(Debug, Clone, Copy, Default)]
pub struct SwitchFunction;

impl SwitchFunction {
    fn condition(inputs: &Inputs) -> Result<String> {
        format_string(require_input(inputs, INPUT_CONDITION)?)
    }

    fn cases(inputs: &Inputs) -> Result<HashMap<String, Value>> {
        let Some(raw) = inputs.get(INPUT_CASES) else {
            return Ok(HashMap::new());
        };
        let list = raw.as_array().ok_or_else(|| {
            TributaryError::function_input(format!("input '{}' must be a list", INPUT_CASES))
        })?;

        let mut cases = HashMap::with_capacity(list.len());
        for case in list {
            let map = case
                .as_object()
                .ok_or_else(|| TributaryError::function_input("invalid case provided"))?;
            let key = map
                .get(CASE_KEY)
                .ok_or_else(|| TributaryError::function_input("case in switch does not have a key"))?
                .as_str()
                .ok_or_else(|| TributaryError::function_input("case key should be a string"))?;
            let value = map.get(CASE_VALUE).cloned().unwrap_or(Value::Null);
            cases.insert(key.to_string(), value);
        }
        Ok(cases)
    }
}

/// Render a scalar input as the string it stands for.
fn format_string(value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(TributaryError::function_input(format!(
            "cannot format {} as a string",
            other
        ))),
    }
}

impl Function for SwitchFunction {
    fn name(&self) -> &str {
        SWITCH
    }

    fn invoke(&self, inputs: &Inputs) -> Result<Option<Value>> {
        let condition = Self::condition(inputs)?;
        let mut cases = Self::cases(inputs)?;

        debug!(condition = %condition, cases = cases.len(), "switch looking for case");
        if let Some(value) = cases.remove(&condition) {
            return Ok(Some(value));
        }
        Ok(inputs.get(INPUT_DEFAULT).cloned())
    }
}
