#![allow(dead_code)]

use distdag::dag::{Key, KeySpec, Nested, TaskExpr, TaskGraph, Value};
use serde_json::json;

/// Builder for `TaskGraph` to simplify test setup.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    graph: TaskGraph,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// `key` is a constant.
    pub fn literal(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.graph.insert(Key::from(key), TaskExpr::literal(value));
        self
    }

    /// `key = func(args...)` where every argument is another key.
    pub fn call(mut self, key: &str, func: &str, args: &[&str]) -> Self {
        let args = args.iter().map(|a| TaskExpr::key(*a)).collect();
        self.graph.insert(Key::from(key), TaskExpr::apply(func, args));
        self
    }

    /// `key` defined by an arbitrary expression.
    pub fn task(mut self, key: &str, expr: TaskExpr) -> Self {
        self.graph.insert(Key::from(key), expr);
        self
    }

    pub fn build(self) -> TaskGraph {
        self.graph
    }
}

/// `x = 1, y = x + 10, z = inc(y) + 20, a = 1, b = a * 10, c = b * 20,
/// total = c + z`.
pub fn scheduler_graph() -> TaskGraph {
    GraphBuilder::new()
        .literal("x", 1)
        .task(
            "y",
            TaskExpr::apply("add", vec![TaskExpr::key("x"), TaskExpr::literal(10)]),
        )
        .task(
            "z",
            TaskExpr::apply(
                "add",
                vec![
                    TaskExpr::apply("inc", vec![TaskExpr::key("y")]),
                    TaskExpr::literal(20),
                ],
            ),
        )
        .literal("a", 1)
        .task(
            "b",
            TaskExpr::apply("mul", vec![TaskExpr::key("a"), TaskExpr::literal(10)]),
        )
        .task(
            "c",
            TaskExpr::apply("mul", vec![TaskExpr::key("b"), TaskExpr::literal(20)]),
        )
        .call("total", "add", &["c", "z"])
        .build()
}

/// `["total", "c", ["z"]]`, which evaluates to `[232, 200, [32]]`.
pub fn scheduler_request() -> KeySpec {
    Nested::list(vec![
        Nested::key("total"),
        Nested::key("c"),
        Nested::list(vec![Nested::key("z")]),
    ])
}

/// Four chains of `slowinc` of length `n`, starting at 0, 10, 20 and 30,
/// summed into `z`.
pub fn slow_chains(n: usize) -> TaskGraph {
    let mut builder = GraphBuilder::new();
    for i in 0..4 {
        builder = builder.literal(&chain_key(i, 0), json!(i * 10));
        for j in 1..n {
            builder = builder.call(&chain_key(i, j), "slowinc", &[&chain_key(i, j - 1)]);
        }
    }
    let tails = (0..4)
        .map(|i| TaskExpr::key(chain_key(i, n - 1)))
        .collect();
    builder
        .task("z", TaskExpr::apply("sum", vec![TaskExpr::List(tails)]))
        .build()
}

fn chain_key(i: usize, j: usize) -> String {
    format!("x-{i}-{j}")
}

/// `a -> b -> c` and `x -> y -> z`, all `inc`.
pub fn two_chains() -> TaskGraph {
    GraphBuilder::new()
        .literal("a", 1)
        .call("b", "inc", &["a"])
        .call("c", "inc", &["b"])
        .literal("x", 1)
        .call("y", "inc", &["x"])
        .call("z", "inc", &["y"])
        .build()
}
