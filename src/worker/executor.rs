use std::collections::HashMap;

use serde_json::{Map, Number, Value};

use errors::{ErrorKind, Result};

pub type TaskFn = Box<Fn(&[Value], &Map<String, Value>) -> Result<Value>>;

/// The task implementations a worker dispatches on. The scheduler ships
/// an opaque function payload; the worker decodes it as a name in this
/// table. Embedders extend the table with their own entries.
pub struct Registry {
    table: HashMap<String, TaskFn>,
}

fn numeric(value: &Value) -> Result<f64> {
    value
        .as_f64()
        .ok_or_else(|| ErrorKind::Protocol(format!("expected a number, got {}", value)).into())
}

fn from_f64(value: f64) -> Value {
    Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Sum that stays integral while every operand is integral.
fn add_all<'a, I: Iterator<Item = &'a Value>>(values: I) -> Result<Value> {
    let mut int_sum: i64 = 0;
    let mut float_sum: f64 = 0.0;
    let mut integral = true;
    for value in values {
        match value.as_i64() {
            Some(i) if integral => int_sum += i,
            _ => {
                if integral {
                    integral = false;
                    float_sum = int_sum as f64;
                }
                float_sum += numeric(value)?;
            }
        }
    }
    if integral {
        Ok(Value::from(int_sum))
    } else {
        Ok(from_f64(float_sum))
    }
}

fn single<'a>(args: &'a [Value], name: &str) -> Result<&'a Value> {
    if args.len() != 1 {
        bail!(ErrorKind::Protocol(format!(
            "'{}' takes one argument, got {}",
            name,
            args.len()
        )));
    }
    Ok(&args[0])
}

fn shift(args: &[Value], name: &str, delta: i64) -> Result<Value> {
    let value = single(args, name)?;
    match value.as_i64() {
        Some(i) => Ok(Value::from(i + delta)),
        None => Ok(from_f64(numeric(value)? + delta as f64)),
    }
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            table: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, name: &str, function: F)
    where
        F: Fn(&[Value], &Map<String, Value>) -> Result<Value> + 'static,
    {
        self.table.insert(name.to_string(), Box::new(function));
    }

    /// The default arithmetic table used by the stock worker binary.
    pub fn with_builtins() -> Self {
        let mut registry = Registry::new();
        registry.register("identity", |args, _| {
            single(args, "identity").map(|v| v.clone())
        });
        registry.register("inc", |args, _| shift(args, "inc", 1));
        registry.register("dec", |args, _| shift(args, "dec", -1));
        // keyword arguments contribute like positional ones
        registry.register("add", |args, kwargs| {
            add_all(args.iter().chain(kwargs.values()))
        });
        registry.register("sum", |args, kwargs| {
            add_all(args.iter().chain(kwargs.values()))
        });
        registry.register("mul", |args, _| {
            let mut product = 1.0;
            let mut integral = true;
            for value in args {
                integral = integral && value.as_i64().is_some();
                product *= numeric(value)?;
            }
            if integral {
                Ok(Value::from(product as i64))
            } else {
                Ok(from_f64(product))
            }
        });
        registry.register("div", |args, _| {
            if args.len() != 2 {
                bail!(ErrorKind::Protocol(format!(
                    "'div' takes two arguments, got {}",
                    args.len()
                )));
            }
            let denominator = numeric(&args[1])?;
            if denominator == 0.0 {
                bail!(ErrorKind::Protocol("division by zero".to_string()));
            }
            Ok(from_f64(numeric(&args[0])? / denominator))
        });
        registry
    }

    pub fn call(&self, name: &str, args: &[Value], kwargs: &Map<String, Value>) -> Result<Value> {
        match self.table.get(name) {
            Some(function) => function(args, kwargs),
            None => bail!(ErrorKind::Protocol(format!(
                "unknown task function '{}'",
                name
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, args: &[Value]) -> Result<Value> {
        Registry::with_builtins().call(name, args, &Map::new())
    }

    #[test]
    fn builtins_compute() {
        assert_eq!(call("inc", &[Value::from(1)]).unwrap(), Value::from(2));
        assert_eq!(call("dec", &[Value::from(5)]).unwrap(), Value::from(4));
        assert_eq!(
            call("add", &[Value::from(10), Value::from(32)]).unwrap(),
            Value::from(42)
        );
        assert_eq!(
            call("identity", &[Value::String("x".to_string())]).unwrap(),
            Value::String("x".to_string())
        );
        assert_eq!(
            call("div", &[Value::from(6), Value::from(2)]).unwrap(),
            Value::from(3.0)
        );
    }

    #[test]
    fn keyword_arguments_reach_the_function() {
        let registry = Registry::with_builtins();
        let mut kwargs = Map::new();
        kwargs.insert("y".to_string(), Value::from(10));
        assert_eq!(
            registry.call("add", &[Value::from(1)], &kwargs).unwrap(),
            Value::from(11)
        );
    }

    #[test]
    fn division_by_zero_fails() {
        assert!(call("div", &[Value::from(1), Value::from(0)]).is_err());
    }

    #[test]
    fn unknown_function_fails() {
        assert!(call("no-such-function", &[]).is_err());
    }
}
