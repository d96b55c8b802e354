// src/functions.rs

//! Named functions that `TaskExpr::Apply` nodes call.
//!
//! Workers execute task payloads through a [`FunctionRegistry`]. What the
//! functions do is up to the embedding application; the registry ships a
//! handful of arithmetic builtins that the CLI and the tests rely on.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Number;

use crate::dag::task::Value;
use crate::errors::TaskError;

/// A task function: evaluated arguments in, value or structured error out.
pub type TaskFn = Arc<dyn Fn(Vec<Value>) -> Result<Value, TaskError> + Send + Sync>;

#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: BTreeMap<String, TaskFn>,
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the arithmetic builtins.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("add", |args| {
            binary(args, "add", |a, b| Ok(arith(a, b, i64::checked_add, |x, y| x + y)))
        });
        registry.register("sub", |args| {
            binary(args, "sub", |a, b| Ok(arith(a, b, i64::checked_sub, |x, y| x - y)))
        });
        registry.register("mul", |args| {
            binary(args, "mul", |a, b| Ok(arith(a, b, i64::checked_mul, |x, y| x * y)))
        });
        registry.register("div", |args| binary(args, "div", divide));
        registry.register("inc", |args| unary(args, "inc", increment));
        registry.register("neg", |args| {
            unary(args, "neg", |a| match a {
                Num::Int(i) => i.checked_neg().map_or(Num::Float(-(i as f64)), Num::Int),
                Num::Float(x) => Num::Float(-x),
            })
        });
        registry.register("identity", |mut args| {
            expect_arity(&args, "identity", 1)?;
            Ok(args.remove(0))
        });
        registry.register("sum", |args| {
            expect_arity(&args, "sum", 1)?;
            let items = args[0]
                .as_array()
                .ok_or_else(|| TaskError::type_error("sum expects a list"))?;
            let mut total = Num::Int(0);
            for item in items {
                total = arith(total, Num::of(item, "sum")?, i64::checked_add, |x, y| x + y);
            }
            Ok(total.into_value())
        });
        registry.register("slowinc", |args| {
            std::thread::sleep(Duration::from_millis(20));
            unary(args, "slowinc", increment)
        });
        registry.register("fail", |args| {
            let message = args
                .first()
                .and_then(|v| v.as_str())
                .unwrap_or("task failed")
                .to_string();
            Err(TaskError::new("Exception", message))
        });
        registry
    }

    pub fn register<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(Vec<Value>) -> Result<Value, TaskError> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(f));
    }

    pub fn call(&self, name: &str, args: Vec<Value>) -> Result<Value, TaskError> {
        match self.functions.get(name) {
            Some(f) => f(args),
            None => Err(TaskError::new(
                "NameError",
                format!("function '{name}' is not registered"),
            )),
        }
    }
}

fn expect_arity(args: &[Value], name: &str, n: usize) -> Result<(), TaskError> {
    if args.len() != n {
        return Err(TaskError::type_error(format!(
            "{name} takes {n} argument(s) but {} were given",
            args.len()
        )));
    }
    Ok(())
}

/// A numeric argument. Integers stay exact as long as the arithmetic on
/// them does not overflow.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn of(v: &Value, name: &str) -> Result<Self, TaskError> {
        if let Some(i) = v.as_i64() {
            return Ok(Num::Int(i));
        }
        v.as_f64()
            .map(Num::Float)
            .ok_or_else(|| TaskError::type_error(format!("{name}: expected a number, got {v}")))
    }

    fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(x) => x,
        }
    }

    fn is_zero(self) -> bool {
        match self {
            Num::Int(i) => i == 0,
            Num::Float(x) => x == 0.0,
        }
    }

    fn into_value(self) -> Value {
        match self {
            Num::Int(i) => Value::from(i),
            Num::Float(x) => number(x),
        }
    }
}

/// `int` on two integers unless it overflows, `float` otherwise.
fn arith(
    a: Num,
    b: Num,
    int: fn(i64, i64) -> Option<i64>,
    float: fn(f64, f64) -> f64,
) -> Num {
    if let (Num::Int(x), Num::Int(y)) = (a, b) {
        if let Some(r) = int(x, y) {
            return Num::Int(r);
        }
    }
    Num::Float(float(a.as_f64(), b.as_f64()))
}

fn increment(a: Num) -> Num {
    arith(a, Num::Int(1), i64::checked_add, |x, y| x + y)
}

/// True division; exact integer quotients stay integers.
fn divide(a: Num, b: Num) -> Result<Num, TaskError> {
    if b.is_zero() {
        return Err(TaskError::new("ZeroDivisionError", "division by zero"));
    }
    if let (Num::Int(x), Num::Int(y)) = (a, b) {
        if x.checked_rem(y) == Some(0) {
            if let Some(q) = x.checked_div(y) {
                return Ok(Num::Int(q));
            }
        }
    }
    Ok(Num::Float(a.as_f64() / b.as_f64()))
}

/// Integral float results are written as integers so `1.5 + 1.5` is `3`.
fn number(x: f64) -> Value {
    if x.fract() == 0.0 && x.abs() < (i64::MAX as f64) {
        Value::Number(Number::from(x as i64))
    } else {
        Number::from_f64(x).map(Value::Number).unwrap_or(Value::Null)
    }
}

fn unary(args: Vec<Value>, name: &str, f: impl Fn(Num) -> Num) -> Result<Value, TaskError> {
    expect_arity(&args, name, 1)?;
    Ok(f(Num::of(&args[0], name)?).into_value())
}

fn binary(
    args: Vec<Value>,
    name: &str,
    f: impl Fn(Num, Num) -> Result<Num, TaskError>,
) -> Result<Value, TaskError> {
    expect_arity(&args, name, 2)?;
    let a = Num::of(&args[0], name)?;
    let b = Num::of(&args[1], name)?;
    Ok(f(a, b)?.into_value())
}
