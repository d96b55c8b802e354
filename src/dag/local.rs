// src/dag/local.rs

//! Single-process evaluator.
//!
//! Evaluates the keys a request needs in topological order on the calling
//! thread. The distributed scheduler must agree with it for every graph.

use std::collections::BTreeMap;

use crate::dag::graph::{cull, DependencyIndex};
use crate::dag::keys::{KeySpec, Nested};
use crate::dag::task::{Key, TaskGraph, Value};
use crate::errors::Result;
use crate::functions::FunctionRegistry;

/// Compute `request` from `graph` without any cluster.
pub fn get_sync(
    graph: &TaskGraph,
    request: &KeySpec,
    functions: &FunctionRegistry,
) -> Result<Nested<Value>> {
    let culled = cull(graph, &request.key_set())?;
    let index = DependencyIndex::from_graph(&culled)?;

    let mut values: BTreeMap<Key, Value> = BTreeMap::new();
    for key in index.order() {
        let Some(expr) = culled.get(key) else {
            continue;
        };
        let value = expr
            .evaluate(&values, functions)
            .map_err(|e| e.into_dist_error(key.clone()))?;
        values.insert(key.clone(), value);
    }

    request.try_map(&mut |key| {
        values
            .get(key)
            .cloned()
            .ok_or_else(|| crate::errors::DistError::KeyNotFound(key.clone()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::task::TaskExpr;
    use crate::errors::DistError;
    use serde_json::json;

    fn scheduler_graph() -> TaskGraph {
        let mut g = TaskGraph::new();
        g.insert("x".into(), TaskExpr::literal(1));
        g.insert(
            "y".into(),
            TaskExpr::apply("add", vec![TaskExpr::key("x"), TaskExpr::literal(10)]),
        );
        g.insert(
            "z".into(),
            TaskExpr::apply(
                "add",
                vec![
                    TaskExpr::apply("inc", vec![TaskExpr::key("y")]),
                    TaskExpr::literal(20),
                ],
            ),
        );
        g.insert("a".into(), TaskExpr::literal(1));
        g.insert(
            "b".into(),
            TaskExpr::apply("mul", vec![TaskExpr::key("a"), TaskExpr::literal(10)]),
        );
        g.insert(
            "c".into(),
            TaskExpr::apply("mul", vec![TaskExpr::key("b"), TaskExpr::literal(20)]),
        );
        g.insert(
            "total".into(),
            TaskExpr::apply("add", vec![TaskExpr::key("c"), TaskExpr::key("z")]),
        );
        g
    }

    #[test]
    fn evaluates_nested_request() {
        let request: KeySpec = serde_json::from_value(json!(["total", "c", ["z"]])).unwrap();
        let out = get_sync(&scheduler_graph(), &request, &FunctionRegistry::with_builtins()).unwrap();
        assert_eq!(serde_json::to_value(&out).unwrap(), json!([232, 200, [32]]));
    }

    #[test]
    fn task_errors_keep_their_category() {
        let mut g = TaskGraph::new();
        g.insert("x".into(), TaskExpr::literal(1));
        g.insert(
            "y".into(),
            TaskExpr::apply("div", vec![TaskExpr::key("x"), TaskExpr::literal(0)]),
        );
        let err = get_sync(&g, &Nested::key("y"), &FunctionRegistry::with_builtins()).unwrap_err();
        match err {
            DistError::TaskExecution { key, category, .. } => {
                assert_eq!(key.as_str(), "y");
                assert_eq!(category, "ZeroDivisionError");
            }
            other => panic!("expected TaskExecution, got {other:?}"),
        }
    }
}
