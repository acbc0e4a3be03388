//! Pure expression evaluator.
//!
//! Evaluation never touches a store. Built-in functions reach the
//! evaluator through the [`Builtins`] capability, so clocks and id
//! generation are swapped out for deterministic tests instead of living
//! in global state.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;

use super::environment::Environment;
use super::error::{RuntimeError, RuntimeResult};
use super::values::{Closure, Value};
use crate::ir::IrExpression;

/// Milliseconds since the Unix epoch.
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;
pub type IdGenerator = Arc<dyn Fn() -> String + Send + Sync>;

pub const BUILTIN_NAMES: &[&str] = &["now", "uuid", "at"];

#[derive(Clone)]
pub struct Builtins {
    clock: Clock,
    ids: IdGenerator,
}

impl fmt::Debug for Builtins {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builtins").finish_non_exhaustive()
    }
}

impl Default for Builtins {
    fn default() -> Self {
        Builtins::new(system_clock(), random_ids())
    }
}

pub fn system_clock() -> Clock {
    Arc::new(|| chrono::Utc::now().timestamp_millis())
}

pub fn random_ids() -> IdGenerator {
    Arc::new(|| uuid::Uuid::new_v4().to_string())
}

impl Builtins {
    pub fn new(clock: Clock, ids: IdGenerator) -> Self {
        Builtins { clock, ids }
    }

    pub fn now(&self) -> i64 {
        (self.clock)()
    }

    pub fn uuid(&self) -> String {
        (self.ids)()
    }

    pub fn is_builtin(name: &str) -> bool {
        BUILTIN_NAMES.contains(&name)
    }

    fn call(&self, name: &str, args: &[Value]) -> RuntimeResult<Value> {
        match name {
            "now" => Ok(Value::Number(self.now() as f64)),
            "uuid" => Ok(Value::String(self.uuid())),
            "at" => match args {
                [target, key] => Ok(index_value(target, key)),
                _ => Err(RuntimeError::TypeError {
                    expected: "2 arguments".to_string(),
                    actual: format!("{} arguments", args.len()),
                    operation: "at".to_string(),
                }),
            },
            _ => Err(RuntimeError::NotCallable(name.to_string())),
        }
    }
}

/// `target[key]` for dynamic keys, with the same own-key rule as member access.
fn index_value(target: &Value, key: &Value) -> Value {
    match key {
        Value::Number(n) if n.fract() == 0.0 && *n >= 0.0 => {
            target.get_member(&format!("{}", *n as u64))
        }
        Value::String(s) => target.get_member(s),
        _ => Value::Undefined,
    }
}

pub struct Evaluator<'a> {
    builtins: &'a Builtins,
}

impl<'a> Evaluator<'a> {
    pub fn new(builtins: &'a Builtins) -> Self {
        Evaluator { builtins }
    }

    pub fn evaluate(&self, expr: &IrExpression, env: &Environment) -> RuntimeResult<Value> {
        match expr {
            IrExpression::Literal { value } => Ok(Value::from(value)),
            IrExpression::Identifier { name } => Ok(resolve_identifier(name, env)),
            IrExpression::Member { object, property } => {
                Ok(self.evaluate(object, env)?.get_member(property))
            }
            IrExpression::Binary {
                operator,
                left,
                right,
            } => self.evaluate_binary(operator, left, right, env),
            IrExpression::Unary { operator, operand } => {
                let value = self.evaluate(operand, env)?;
                match operator.as_str() {
                    "!" | "not" => Ok(Value::Bool(!value.is_truthy())),
                    "-" => Ok(Value::Number(-value.to_number())),
                    other => Err(RuntimeError::TypeError {
                        expected: "unary operator".to_string(),
                        actual: other.to_string(),
                        operation: "unary".to_string(),
                    }),
                }
            }
            IrExpression::Call { callee, args } => self.evaluate_call(callee, args, env),
            IrExpression::Conditional {
                condition,
                consequent,
                alternate,
            } => {
                if self.evaluate(condition, env)?.is_truthy() {
                    self.evaluate(consequent, env)
                } else {
                    self.evaluate(alternate, env)
                }
            }
            IrExpression::Array { elements } => Ok(Value::Array(
                elements
                    .iter()
                    .map(|e| self.evaluate(e, env))
                    .collect::<RuntimeResult<_>>()?,
            )),
            IrExpression::Object { properties } => {
                let mut map = IndexMap::new();
                for entry in properties {
                    map.insert(entry.key.clone(), self.evaluate(&entry.value, env)?);
                }
                Ok(Value::Object(map))
            }
            IrExpression::Lambda { params, body } => Ok(Value::Lambda(Arc::new(Closure {
                params: params.clone(),
                body: (**body).clone(),
                scope: env.clone(),
            }))),
        }
    }

    fn evaluate_binary(
        &self,
        operator: &str,
        left: &IrExpression,
        right: &IrExpression,
        env: &Environment,
    ) -> RuntimeResult<Value> {
        let lhs = self.evaluate(left, env)?;
        match operator {
            "&&" | "and" => {
                return if lhs.is_truthy() {
                    self.evaluate(right, env)
                } else {
                    Ok(lhs)
                }
            }
            "||" | "or" => {
                return if lhs.is_truthy() {
                    Ok(lhs)
                } else {
                    self.evaluate(right, env)
                }
            }
            "??" => {
                return if lhs.is_nullish() {
                    self.evaluate(right, env)
                } else {
                    Ok(lhs)
                }
            }
            _ => {}
        }

        let rhs = self.evaluate(right, env)?;
        let value = match operator {
            "+" => match (&lhs, &rhs) {
                (Value::Number(a), Value::Number(b)) => Value::Number(a + b),
                (Value::String(_), _) | (_, Value::String(_)) => {
                    Value::String(format!("{}{}", lhs, rhs))
                }
                _ => Value::Number(lhs.to_number() + rhs.to_number()),
            },
            "-" => Value::Number(lhs.to_number() - rhs.to_number()),
            "*" => Value::Number(lhs.to_number() * rhs.to_number()),
            "/" => Value::Number(lhs.to_number() / rhs.to_number()),
            "%" => Value::Number(lhs.to_number() % rhs.to_number()),
            "==" | "is" => Value::Bool(lhs.loose_eq(&rhs)),
            "!=" => Value::Bool(!lhs.loose_eq(&rhs)),
            "<" | ">" | "<=" | ">=" => Value::Bool(compare(operator, &lhs, &rhs)),
            "in" => Value::Bool(contains(&rhs, &lhs)),
            "contains" => Value::Bool(contains(&lhs, &rhs)),
            other => {
                return Err(RuntimeError::TypeError {
                    expected: "binary operator".to_string(),
                    actual: other.to_string(),
                    operation: "binary".to_string(),
                })
            }
        };
        Ok(value)
    }

    fn evaluate_call(
        &self,
        callee: &IrExpression,
        args: &[IrExpression],
        env: &Environment,
    ) -> RuntimeResult<Value> {
        let args = args
            .iter()
            .map(|a| self.evaluate(a, env))
            .collect::<RuntimeResult<Vec<_>>>()?;

        let (name, function) = match callee {
            IrExpression::Identifier { name } if Builtins::is_builtin(name) => {
                return self.builtins.call(name, &args);
            }
            IrExpression::Identifier { name } => (name.clone(), resolve_identifier(name, env)),
            other => ("<expression>".to_string(), self.evaluate(other, env)?),
        };
        match function {
            Value::Lambda(closure) => self.apply(&closure, args),
            _ => Err(RuntimeError::NotCallable(name)),
        }
    }

    /// Bind parameters positionally over the captured scope. Missing
    /// arguments are `undefined`.
    pub fn apply(&self, closure: &Closure, args: Vec<Value>) -> RuntimeResult<Value> {
        let mut scope = Environment::with_parent(Arc::new(closure.scope.clone()));
        let mut args = args.into_iter();
        for param in &closure.params {
            scope.define(param.clone(), args.next().unwrap_or(Value::Undefined));
        }
        self.evaluate(&closure.body, &scope)
    }
}

fn resolve_identifier(name: &str, env: &Environment) -> Value {
    if let Some(value) = env.lookup(name) {
        return value.clone();
    }
    match name {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        "null" => Value::Null,
        _ => Value::Undefined,
    }
}

fn compare(operator: &str, lhs: &Value, rhs: &Value) -> bool {
    if let (Value::String(a), Value::String(b)) = (lhs, rhs) {
        return match operator {
            "<" => a < b,
            ">" => a > b,
            "<=" => a <= b,
            _ => a >= b,
        };
    }
    let (a, b) = (lhs.to_number(), rhs.to_number());
    match operator {
        "<" => a < b,
        ">" => a > b,
        "<=" => a <= b,
        _ => a >= b,
    }
}

/// Membership for `in` and `contains`: array elements, own object keys,
/// or substrings.
fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::Array(items) => items.iter().any(|item| item.loose_eq(needle)),
        Value::Object(map) => match needle {
            Value::String(key) => map.contains_key(key),
            _ => false,
        },
        Value::String(s) => s.contains(&needle.to_string()),
        _ => false,
    }
}
