//! JQ-style expression evaluation over a layered, read-only scope.
//!
//! Workflows never hold a live interpreter between steps, so the scope is
//! rebuilt fresh from [`NodeState`](crate::workflow::state::NodeState) on
//! every resumption rather than carried across the suspension boundary.

use jaq_core::{load, Compiler, Ctx, Native, RcIter};
use jaq_json::Val;
use serde_json::Value;

use crate::workflow::error::WorkflowError;

/// A single named binding visible to an expression (`$item`, `$error`, ...).
#[derive(Debug, Clone)]
pub struct Binding {
    pub name: String,
    pub value: Value,
}

impl Binding {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Binding {
            name: name.into(),
            value,
        }
    }
}

/// The layered scope an expression is evaluated against: workflow, task,
/// node and loop layers, innermost-first. Each layer only ever *adds*
/// bindings; a name defined in an inner layer shadows an outer one with the
/// same name.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    bindings: Vec<Binding>,
    /// The value `.` resolves to.
    input: Value,
}

impl Scope {
    pub fn new(input: Value) -> Self {
        Scope {
            bindings: Vec::new(),
            input,
        }
    }

    /// Returns a child scope with one more binding layered on top.
    pub fn with(&self, name: impl Into<String>, value: Value) -> Self {
        let mut bindings = self.bindings.clone();
        bindings.push(Binding::new(name, value));
        Scope {
            bindings,
            input: self.input.clone(),
        }
    }

    /// Returns a child scope with `.` rebound to `input`.
    pub fn with_input(&self, input: Value) -> Self {
        Scope {
            bindings: self.bindings.clone(),
            input,
        }
    }

    fn names(&self) -> Vec<String> {
        self.bindings.iter().map(|b| b.name.clone()).collect()
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("expression error")]
pub struct ExprError {
    pub expression: String,
    pub available: Vec<String>,
    pub message: String,
}

impl From<ExprError> for WorkflowError {
    fn from(err: ExprError) -> Self {
        WorkflowError::expression(format!(
            "failed to evaluate `{}`: {} (available: {})",
            err.expression,
            err.message,
            err.available.join(", ")
        ))
    }
}

/// Evaluate `expr` (a JQ filter) against `scope`, returning the single
/// resulting value. A filter producing zero or more than one output is an
/// error: the DSL's expression positions are all single-value contexts.
pub fn eval(expr: &str, scope: &Scope) -> Result<Value, ExprError> {
    let mut outputs = eval_all(expr, scope)?;
    match outputs.len() {
        1 => Ok(outputs.remove(0)),
        0 => Err(err(expr, scope, "expression produced no output")),
        _ => Err(err(expr, scope, "expression produced more than one output")),
    }
}

/// Evaluate `expr` and return every output it produces, in order.
pub fn eval_all(expr: &str, scope: &Scope) -> Result<Vec<Value>, ExprError> {
    let program = load::File {
        path: (),
        code: expr,
    };

    let arena = load::Arena::default();
    let loader = load::Loader::new(jaq_std::defs().chain(jaq_json::defs()));
    let modules = loader
        .load(&arena, program)
        .map_err(|_| err(expr, scope, "parse error"))?;

    let var_names: Vec<String> = scope.bindings.iter().map(|b| b.name.clone()).collect();

    let compiler = Compiler::<_, Native<Val>>::default()
        .with_funs(jaq_std::funs().chain(jaq_json::funs()))
        .with_global_vars(var_names.iter().map(|s| s.as_str()));
    let filter = compiler
        .compile(modules)
        .map_err(|_| err(expr, scope, "compile error"))?;

    let var_values: Vec<Val> = scope
        .bindings
        .iter()
        .map(|b| Val::from(b.value.clone()))
        .collect();

    let inputs = RcIter::new(core::iter::empty());
    let ctx = Ctx::new(var_values, &inputs);
    let input = Val::from(scope.input.clone());

    let mut out = Vec::new();
    for result in filter.run((ctx, input)) {
        let val = result.map_err(|e| err(expr, scope, &e.to_string()))?;
        out.push(Value::from(val));
    }
    Ok(out)
}

/// Evaluate `expr` as a boolean predicate; a non-boolean or missing result
/// is treated as `false` rather than an error (`when`/`exceptWhen` clauses
/// degrade gracefully per the engine's tolerant-predicate convention).
pub fn eval_predicate(expr: &str, scope: &Scope) -> bool {
    match eval(expr, scope) {
        Ok(Value::Bool(b)) => b,
        _ => false,
    }
}

fn err(expr: &str, scope: &Scope, message: &str) -> ExprError {
    ExprError {
        expression: expr.to_string(),
        available: scope.names(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn evaluates_dot_against_input() {
        let scope = Scope::new(json!({"value": 1}));
        let result = eval(".value", &scope).unwrap();
        assert_eq!(result, json!(1));
    }

    #[test]
    fn concatenates_strings() {
        let scope = Scope::new(json!({"value": "1"}));
        let result = eval(".value + \"2\"", &scope).unwrap();
        assert_eq!(result, json!("12"));
    }

    #[test]
    fn resolves_named_bindings() {
        let scope = Scope::new(json!({"counter": 0})).with("item", json!(5));
        let result = eval(".counter + $item", &scope).unwrap();
        assert_eq!(result, json!(5));
    }

    #[test]
    fn inner_binding_shadows_outer() {
        let scope = Scope::new(Value::Null)
            .with("x", json!(1))
            .with("x", json!(2));
        let result = eval("$x", &scope).unwrap();
        assert_eq!(result, json!(2));
    }

    #[test]
    fn object_construction_and_conditionals() {
        let scope = Scope::new(json!({"n": 4}));
        let result = eval(
            "{even: (if .n % 2 == 0 then true else false end)}",
            &scope,
        )
        .unwrap();
        assert_eq!(result, json!({"even": true}));
    }

    #[test]
    fn parse_failure_surfaces_as_expr_error() {
        let scope = Scope::new(Value::Null);
        let err = eval("this is not jq {{{", &scope).unwrap_err();
        assert_eq!(err.expression, "this is not jq {{{");
    }

    #[test]
    fn predicate_defaults_to_false_on_error() {
        let scope = Scope::new(Value::Null);
        assert!(!eval_predicate("$undefined_var", &scope));
    }
}
