//! Expression and script evaluation.
//!
//! Conditions, computed variable values and `js` steps all run through one
//! rhai engine. Store entries are pushed into the scope as string variables
//! before each evaluation, so a bare key name evaluates to that entry's
//! current value and richer expressions can combine several of them.

use crate::error::RunError;
use crate::store::VarStore;
use rhai::{Dynamic, Engine, Map, Scope};

/// Operation cap so a runaway script aborts the task instead of hanging the
/// session.
const MAX_SCRIPT_OPERATIONS: u64 = 1_000_000;

pub struct Evaluator {
    engine: Engine,
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl Evaluator {
    pub fn new() -> Self {
        let mut engine = Engine::new();
        engine.set_max_operations(MAX_SCRIPT_OPERATIONS);
        Self { engine }
    }

    /// Evaluate `expr` with every store entry bound as a string variable.
    pub fn eval(&self, expr: &str, store: &VarStore) -> Result<Dynamic, RunError> {
        if expr.trim().is_empty() {
            return Ok(Dynamic::UNIT);
        }
        let mut scope = Scope::new();
        for (k, v) in store.entries() {
            scope.push(k.clone(), v.clone());
        }
        self.engine
            .eval_with_scope::<Dynamic>(&mut scope, expr)
            .map_err(|e| RunError::Eval(e.to_string()))
    }

    /// Evaluate `expr` against an explicit set of bindings. Used where the
    /// store is not the source of scope, e.g. the per-request `_url` binding
    /// of a network filter predicate.
    pub fn eval_bound(&self, expr: &str, bindings: &[(&str, String)]) -> Result<Dynamic, RunError> {
        if expr.trim().is_empty() {
            return Ok(Dynamic::UNIT);
        }
        let mut scope = Scope::new();
        for (name, value) in bindings {
            scope.push(name.to_string(), value.clone());
        }
        self.engine
            .eval_with_scope::<Dynamic>(&mut scope, expr)
            .map_err(|e| RunError::Eval(e.to_string()))
    }

    /// Condition semantics: booleans as-is, numbers compare against zero,
    /// strings are truthy unless empty, `"false"` or `"0"`, unit is false.
    pub fn truthy(value: &Dynamic) -> bool {
        if value.is_unit() {
            return false;
        }
        if let Ok(b) = value.as_bool() {
            return b;
        }
        if let Ok(i) = value.as_int() {
            return i != 0;
        }
        if let Ok(f) = value.as_float() {
            return f != 0.0;
        }
        if value.is_string() {
            let s = value.to_string();
            return !(s.is_empty() || s == "false" || s == "0");
        }
        true
    }

    /// String form for storing into the variable store. Unit becomes the
    /// empty string; everything else uses its display form.
    pub fn stringify(value: &Dynamic) -> String {
        if value.is_unit() {
            String::new()
        } else {
            value.to_string()
        }
    }

    /// Interpret an evaluation result as an object map, if it is one.
    pub fn as_map(value: Dynamic) -> Option<Map> {
        value.try_cast::<Map>()
    }
}
