//! Compiled expression fragments
//!
//! A fragment is the executable form of an expression. Literal values are
//! not embedded; they are read from the program's positional arguments.

use crate::error::{Error, Result};
use crate::sql::BinaryOperator;
use crate::storage::memory::wildcard_match;
use crate::storage::{Record, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum Fragment {
    Const(Value),
    /// Positional program argument
    Arg(usize),
    /// Field of the current record
    Field(String),
    /// Accumulated aggregate stored on a grouped row under its canonical text
    Aggregate(String),
    Binary {
        op: BinaryOperator,
        left: Box<Fragment>,
        right: Box<Fragment>,
    },
    Not(Box<Fragment>),
    Call { name: String, args: Vec<Fragment> },
}

impl Fragment {
    /// Evaluate against one record
    pub fn eval(&self, record: &Record, args: &[Value]) -> Result<Value> {
        match self {
            Fragment::Const(value) => Ok(value.clone()),
            Fragment::Arg(position) => args
                .get(*position)
                .cloned()
                .ok_or_else(|| Error::Internal(format!("missing argument {}", position))),
            Fragment::Field(name) => Ok(record.value_of(name)),
            Fragment::Aggregate(text) => Ok(record.value_of(text).coerce_number()),
            Fragment::Not(inner) => Ok(Value::Boolean(!inner.eval(record, args)?.is_true())),
            Fragment::Binary { op, left, right } => match op {
                // Short-circuit
                BinaryOperator::And => Ok(Value::Boolean(
                    left.eval(record, args)?.is_true() && right.eval(record, args)?.is_true(),
                )),
                BinaryOperator::Or => Ok(Value::Boolean(
                    left.eval(record, args)?.is_true() || right.eval(record, args)?.is_true(),
                )),
                _ => {
                    let left = left.eval(record, args)?;
                    let right = right.eval(record, args)?;
                    apply_binary(*op, &left, &right)
                }
            },
            Fragment::Call { name, args: call_args } => {
                let values = call_args
                    .iter()
                    .map(|arg| arg.eval(record, args))
                    .collect::<Result<Vec<_>>>()?;
                call_function(name, values)
            }
        }
    }

    /// Evaluate as a predicate: only `true` passes
    pub fn matches(&self, record: &Record, args: &[Value]) -> Result<bool> {
        Ok(self.eval(record, args)?.is_true())
    }
}

fn apply_binary(op: BinaryOperator, left: &Value, right: &Value) -> Result<Value> {
    use std::cmp::Ordering::*;

    let null_operand = left.is_null() || right.is_null();
    let result = match op {
        BinaryOperator::Add => return left.add(right),
        BinaryOperator::Sub => return left.sub(right),
        BinaryOperator::Mul => return left.mul(right),
        BinaryOperator::Div => return left.div(right),
        BinaryOperator::Mod => return left.rem(right),
        BinaryOperator::Pow => return left.pow(right),
        BinaryOperator::Concat => return Ok(left.concat(right)),

        _ if null_operand && op.is_null_rejecting() => false,
        BinaryOperator::Eq => left.sql_eq(right),
        BinaryOperator::Neq => !left.sql_eq(right),
        BinaryOperator::Gt => left.compare(right) == Some(Greater),
        BinaryOperator::Gte => matches!(left.compare(right), Some(Greater | Equal)),
        BinaryOperator::Lt => left.compare(right) == Some(Less),
        BinaryOperator::Lte => matches!(left.compare(right), Some(Less | Equal)),

        BinaryOperator::Like => like(left, right, false)?,
        BinaryOperator::NotLike => !like(left, right, false)?,
        BinaryOperator::Ilike => like(left, right, true)?,
        BinaryOperator::NotIlike => !like(left, right, true)?,

        BinaryOperator::Is => left.sql_eq(right),
        BinaryOperator::IsNot => !left.sql_eq(right),

        BinaryOperator::In | BinaryOperator::NotIn => {
            let Value::List(items) = right else {
                return Err(Error::TypeMismatch(format!(
                    "IN expects a list, got {}",
                    right.type_name()
                )));
            };
            if left.is_null() {
                false
            } else {
                let found = items.iter().any(|item| left.sql_eq(item));
                found == (op == BinaryOperator::In)
            }
        }

        BinaryOperator::Between | BinaryOperator::NotBetween => {
            let bounds = match right {
                Value::List(bounds) if bounds.len() == 2 => bounds,
                _ => {
                    return Err(Error::TypeMismatch(
                        "BETWEEN expects a lower and an upper bound".to_string(),
                    ))
                }
            };
            if left.is_null() {
                false
            } else {
                let inside = matches!(left.compare(&bounds[0]), Some(Greater | Equal))
                    && matches!(left.compare(&bounds[1]), Some(Less | Equal));
                inside == (op == BinaryOperator::Between)
            }
        }

        BinaryOperator::And | BinaryOperator::Or => left.is_true() && right.is_true(),
    };
    Ok(Value::Boolean(result))
}

fn like(value: &Value, pattern: &Value, case_insensitive: bool) -> Result<bool> {
    let Some(pattern) = pattern.as_str() else {
        return Err(Error::TypeMismatch(format!(
            "LIKE pattern must be a string, got {}",
            pattern.type_name()
        )));
    };
    let text = value.to_plain_string();
    let (text, pattern) = if case_insensitive {
        (text.to_lowercase(), pattern.to_lowercase())
    } else {
        (text, pattern.to_string())
    };
    let text: Vec<char> = text.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();
    Ok(wildcard_match(&pattern, &text, '%', '_'))
}

fn call_function(name: &str, mut values: Vec<Value>) -> Result<Value> {
    if name == "coalesce" {
        return Ok(values
            .into_iter()
            .find(|v| !v.is_null())
            .unwrap_or(Value::Null));
    }
    let value = if values.is_empty() {
        Value::Null
    } else {
        values.swap_remove(0)
    };
    if value.is_null() && name != "typeof" {
        return Ok(Value::Null);
    }

    let numeric = |f: fn(f64) -> f64| -> Result<Value> {
        match &value {
            Value::Integer(i) => Ok(Value::Integer(*i)),
            Value::Float(x) => Ok(Value::Float(f(*x))),
            other => Err(Error::TypeMismatch(format!(
                "{}() expects a number, got {}",
                name,
                other.type_name()
            ))),
        }
    };

    match name {
        "abs" => match &value {
            Value::Integer(i) => i
                .checked_abs()
                .map(Value::Integer)
                .ok_or_else(|| Error::TypeMismatch("abs() overflow".to_string())),
            _ => numeric(f64::abs),
        },
        "ceil" => numeric(f64::ceil),
        "floor" => numeric(f64::floor),
        "round" => numeric(f64::round),
        "length" => match &value {
            Value::String(s) => Ok(Value::Integer(s.chars().count() as i64)),
            Value::List(items) => Ok(Value::Integer(items.len() as i64)),
            Value::Map(map) => Ok(Value::Integer(map.len() as i64)),
            other => Err(Error::TypeMismatch(format!(
                "length() expects a string or container, got {}",
                other.type_name()
            ))),
        },
        "lower" => Ok(Value::String(value.to_plain_string().to_lowercase())),
        "upper" => Ok(Value::String(value.to_plain_string().to_uppercase())),
        "typeof" => Ok(Value::from(value.type_name())),
        other => Err(Error::UnknownFunction(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;

    fn row(pairs: &[(&str, Value)]) -> Record {
        let fields: IndexMap<String, Value> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        Record::new(fields)
    }

    fn bin(op: BinaryOperator, left: Fragment, right: Fragment) -> Fragment {
        Fragment::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    fn field(name: &str) -> Fragment {
        Fragment::Field(name.to_string())
    }

    #[test]
    fn test_comparisons_with_null_are_false() {
        let r = row(&[("a", Value::Null)]);
        for op in [BinaryOperator::Eq, BinaryOperator::Neq, BinaryOperator::Lt] {
            let f = bin(op, field("a"), Fragment::Arg(0));
            assert!(!f.matches(&r, &[Value::Null]).unwrap());
        }
        let f = bin(BinaryOperator::Is, field("a"), Fragment::Const(Value::Null));
        assert!(f.matches(&r, &[]).unwrap());
        let f = bin(BinaryOperator::Is, field("missing"), Fragment::Const(Value::Null));
        assert!(f.matches(&r, &[]).unwrap());
    }

    #[test]
    fn test_mixed_numeric_comparison() {
        let r = row(&[("a", Value::Integer(124))]);
        let f = bin(BinaryOperator::Gte, field("a"), Fragment::Arg(0));
        assert!(f.matches(&r, &[Value::Float(123.5)]).unwrap());
        let f = bin(BinaryOperator::Eq, field("a"), Fragment::Arg(0));
        assert!(!f.matches(&r, &[Value::from("124")]).unwrap());
    }

    #[test]
    fn test_like_and_ilike() {
        let r = row(&[("name", Value::from("Hello"))]);
        let like = bin(BinaryOperator::Like, field("name"), Fragment::Arg(0));
        assert!(like.matches(&r, &[Value::from("H%o")]).unwrap());
        assert!(!like.matches(&r, &[Value::from("h%")]).unwrap());
        let ilike = bin(BinaryOperator::Ilike, field("name"), Fragment::Arg(0));
        assert!(ilike.matches(&r, &[Value::from("h_llo")]).unwrap());
        assert!(matches!(
            like.matches(&r, &[Value::Integer(1)]),
            Err(Error::TypeMismatch(_))
        ));
    }

    #[test]
    fn test_like_with_wildcards_in_text() {
        let like = bin(BinaryOperator::Like, field("v"), Fragment::Arg(0));
        let pattern = [Value::from("%a")];
        assert!(like.matches(&row(&[("v", Value::from("%ba"))]), &pattern).unwrap());
        assert!(like.matches(&row(&[("v", Value::from("xba"))]), &pattern).unwrap());
        assert!(like.matches(&row(&[("v", Value::from("_a"))]), &pattern).unwrap());
        assert!(!like.matches(&row(&[("v", Value::from("%ab"))]), &pattern).unwrap());
    }

    #[test]
    fn test_in_and_between() {
        let r = row(&[("a", Value::Integer(3))]);
        let list = Value::List(vec![1i64.into(), 3i64.into()]);
        let f = bin(BinaryOperator::In, field("a"), Fragment::Arg(0));
        assert!(f.matches(&r, &[list.clone()]).unwrap());
        let f = bin(BinaryOperator::NotIn, field("a"), Fragment::Arg(0));
        assert!(!f.matches(&r, &[list]).unwrap());

        let bounds = Value::List(vec![3i64.into(), 5i64.into()]);
        let f = bin(BinaryOperator::Between, field("a"), Fragment::Arg(0));
        assert!(f.matches(&r, &[bounds]).unwrap());
    }

    #[test]
    fn test_division_by_zero_is_an_error() {
        let r = row(&[("a", Value::Integer(3))]);
        let f = bin(BinaryOperator::Div, field("a"), Fragment::Arg(0));
        assert!(matches!(f.eval(&r, &[Value::Integer(0)]), Err(Error::DivisionByZero)));
    }

    #[test]
    fn test_aggregate_reads_are_numeric() {
        let r = row(&[("sum(a)", Value::from("12")), ("max(b)", Value::from("zz"))]);
        assert_eq!(
            Fragment::Aggregate("sum(a)".to_string()).eval(&r, &[]).unwrap(),
            Value::Integer(12)
        );
        assert_eq!(
            Fragment::Aggregate("max(b)".to_string()).eval(&r, &[]).unwrap(),
            Value::Null
        );
    }

    #[test]
    fn test_functions() {
        let r = row(&[("s", Value::from("AbC")), ("n", Value::Float(-1.5))]);
        let call = |name: &str, arg: Fragment| Fragment::Call {
            name: name.to_string(),
            args: vec![arg],
        };
        assert_eq!(call("lower", field("s")).eval(&r, &[]).unwrap(), Value::from("abc"));
        assert_eq!(call("length", field("s")).eval(&r, &[]).unwrap(), Value::Integer(3));
        assert_eq!(call("abs", field("n")).eval(&r, &[]).unwrap(), Value::Float(1.5));
        assert_eq!(call("typeof", field("missing")).eval(&r, &[]).unwrap(), Value::from("null"));
        let coalesce = Fragment::Call {
            name: "coalesce".to_string(),
            args: vec![field("missing"), field("s")],
        };
        assert_eq!(coalesce.eval(&r, &[]).unwrap(), Value::from("AbC"));
    }
}
