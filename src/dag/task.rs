// src/dag/task.rs

//! Task graph data model: keys, values and task expressions.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::TaskError;
use crate::functions::FunctionRegistry;

/// Every intermediate and final result is a JSON value so it can cross the
/// wire unchanged.
pub type Value = serde_json::Value;

/// Name of a node in the task graph.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Key(String);

impl Key {
    pub fn new(name: impl Into<String>) -> Self {
        Key(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key(s)
    }
}

impl std::borrow::Borrow<str> for Key {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// A computation producing the value of one key.
///
/// Serialized externally tagged, e.g.
/// `{"apply": {"func": "add", "args": [{"key": "x"}, {"literal": 10}]}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskExpr {
    /// A constant.
    Literal(Value),
    /// The value of another key.
    Key(Key),
    /// Call a named function on evaluated arguments.
    Apply { func: String, args: Vec<TaskExpr> },
    /// Evaluates every element and produces a JSON array.
    List(Vec<TaskExpr>),
}

impl TaskExpr {
    pub fn literal(value: impl Into<Value>) -> Self {
        TaskExpr::Literal(value.into())
    }

    pub fn key(key: impl Into<Key>) -> Self {
        TaskExpr::Key(key.into())
    }

    pub fn apply(func: impl Into<String>, args: Vec<TaskExpr>) -> Self {
        TaskExpr::Apply {
            func: func.into(),
            args,
        }
    }

    /// Keys referenced anywhere inside this expression.
    pub fn references(&self) -> BTreeSet<Key> {
        let mut out = BTreeSet::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references(&self, out: &mut BTreeSet<Key>) {
        match self {
            TaskExpr::Literal(_) => {}
            TaskExpr::Key(k) => {
                out.insert(k.clone());
            }
            TaskExpr::Apply { args, .. } => {
                for arg in args {
                    arg.collect_references(out);
                }
            }
            TaskExpr::List(items) => {
                for item in items {
                    item.collect_references(out);
                }
            }
        }
    }

    /// Substitute key references with concrete `inputs` and evaluate.
    ///
    /// A referenced key missing from `inputs` is reported as a `KeyError`;
    /// callers are expected to have fetched every reference beforehand.
    pub fn evaluate(
        &self,
        inputs: &BTreeMap<Key, Value>,
        functions: &FunctionRegistry,
    ) -> Result<Value, TaskError> {
        match self {
            TaskExpr::Literal(v) => Ok(v.clone()),
            TaskExpr::Key(k) => inputs
                .get(k)
                .cloned()
                .ok_or_else(|| TaskError::new("KeyError", format!("input '{k}' not available"))),
            TaskExpr::Apply { func, args } => {
                let values = args
                    .iter()
                    .map(|arg| arg.evaluate(inputs, functions))
                    .collect::<Result<Vec<_>, _>>()?;
                functions.call(func, values)
            }
            TaskExpr::List(items) => {
                let values = items
                    .iter()
                    .map(|item| item.evaluate(inputs, functions))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Value::Array(values))
            }
        }
    }
}

/// Immutable mapping from key to the expression that defines it.
pub type TaskGraph = BTreeMap<Key, TaskExpr>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn references_walk_nested_expressions() {
        let expr = TaskExpr::apply(
            "add",
            vec![
                TaskExpr::apply("inc", vec![TaskExpr::key("y")]),
                TaskExpr::List(vec![TaskExpr::key("a"), TaskExpr::literal(1)]),
            ],
        );
        let refs: Vec<_> = expr.references().into_iter().map(|k| k.to_string()).collect();
        assert_eq!(refs, vec!["a", "y"]);
    }

    #[test]
    fn evaluate_substitutes_inputs() {
        let functions = FunctionRegistry::with_builtins();
        let expr = TaskExpr::apply(
            "add",
            vec![
                TaskExpr::apply("inc", vec![TaskExpr::key("y")]),
                TaskExpr::literal(20),
            ],
        );
        let mut inputs = BTreeMap::new();
        inputs.insert(Key::from("y"), json!(11));
        assert_eq!(expr.evaluate(&inputs, &functions).unwrap(), json!(32));
    }

    #[test]
    fn missing_input_is_key_error() {
        let functions = FunctionRegistry::with_builtins();
        let err = TaskExpr::key("nope")
            .evaluate(&BTreeMap::new(), &functions)
            .unwrap_err();
        assert_eq!(err.category, "KeyError");
    }

    #[test]
    fn deserializes_tagged_json() {
        let expr: TaskExpr = serde_json::from_value(json!({
            "apply": {"func": "sum", "args": [{"list": [{"key": "a"}, {"literal": 2}]}]}
        }))
        .unwrap();
        assert_eq!(
            expr,
            TaskExpr::apply(
                "sum",
                vec![TaskExpr::List(vec![TaskExpr::key("a"), TaskExpr::literal(2)])]
            )
        );
    }
}
