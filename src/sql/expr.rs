//! Expression nodes
//!
//! Every node renders canonical text, reports whether it contains an
//! aggregate, computes its signature, and compiles into a pipeline
//! fragment plus positional arguments.

use crate::error::{Error, Result};
use crate::pipeline::Fragment;
use crate::storage::Value;
use std::fmt;

/// Aggregate function names
pub const AGGREGATES: [&str; 5] = ["avg", "count", "max", "min", "sum"];

/// Non-aggregate functions and their arity (`None` = variadic)
const SCALAR_FUNCTIONS: [(&str, Option<usize>); 9] = [
    ("abs", Some(1)),
    ("ceil", Some(1)),
    ("floor", Some(1)),
    ("round", Some(1)),
    ("length", Some(1)),
    ("lower", Some(1)),
    ("upper", Some(1)),
    ("typeof", Some(1)),
    ("coalesce", None),
];

/// Signature of a node whose shape cannot be matched
pub const UNKNOWN_SIGNATURE: &str = "?";

/// Binary operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOperator {
    // Comparison
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    // Logical
    And,
    Or,
    // Arithmetic
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    // String
    Concat,
    Like,
    NotLike,
    Ilike,
    NotIlike,
    // Special right-hand operands
    Is,
    IsNot,
    In,
    NotIn,
    Between,
    NotBetween,
}

impl BinaryOperator {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOperator::Eq => "=",
            BinaryOperator::Neq => "<>",
            BinaryOperator::Gt => ">",
            BinaryOperator::Gte => ">=",
            BinaryOperator::Lt => "<",
            BinaryOperator::Lte => "<=",
            BinaryOperator::And => "AND",
            BinaryOperator::Or => "OR",
            BinaryOperator::Add => "+",
            BinaryOperator::Sub => "-",
            BinaryOperator::Mul => "*",
            BinaryOperator::Div => "/",
            BinaryOperator::Mod => "%",
            BinaryOperator::Pow => "^",
            BinaryOperator::Concat => "||",
            BinaryOperator::Like => "LIKE",
            BinaryOperator::NotLike => "NOT LIKE",
            BinaryOperator::Ilike => "ILIKE",
            BinaryOperator::NotIlike => "NOT ILIKE",
            BinaryOperator::Is => "IS",
            BinaryOperator::IsNot => "IS NOT",
            BinaryOperator::In => "IN",
            BinaryOperator::NotIn => "NOT IN",
            BinaryOperator::Between => "BETWEEN",
            BinaryOperator::NotBetween => "NOT BETWEEN",
        }
    }

    /// Operators that can never be true when one side is null
    pub fn is_null_rejecting(&self) -> bool {
        matches!(
            self,
            BinaryOperator::Eq
                | BinaryOperator::Neq
                | BinaryOperator::Gt
                | BinaryOperator::Gte
                | BinaryOperator::Lt
                | BinaryOperator::Lte
                | BinaryOperator::Like
                | BinaryOperator::NotLike
                | BinaryOperator::Ilike
                | BinaryOperator::NotIlike
        )
    }
}

impl fmt::Display for BinaryOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// SQL Expression
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// `*`
    Asterisk,
    /// Literal value
    Value(Value),
    /// Column reference; dots address nested map fields
    Identifier(String),
    /// Binary operation
    Binary {
        left: Box<Expr>,
        op: BinaryOperator,
        right: Box<Expr>,
    },
    /// NOT
    Not(Box<Expr>),
    /// Function call; the name is stored lowercase
    Function { name: String, args: Vec<Expr> },
    /// Parenthesized expression
    Group(Box<Expr>),
    /// `expr AS name`
    Alias { expr: Box<Expr>, name: String },
}

/// Result of compiling one node
#[derive(Debug, Clone, PartialEq)]
pub struct Compiled {
    pub fragment: Fragment,
    /// Next free argument position
    pub offset: usize,
    /// Arguments this node introduced, in position order
    pub args: Vec<Value>,
}

impl Expr {
    pub fn binary(left: Expr, op: BinaryOperator, right: Expr) -> Expr {
        Expr::Binary {
            left: Box::new(left),
            op,
            right: Box::new(right),
        }
    }

    pub fn identifier(name: impl Into<String>) -> Expr {
        Expr::Identifier(name.into())
    }

    pub fn value(value: impl Into<Value>) -> Expr {
        Expr::Value(value.into())
    }

    /// True iff this node or a descendant calls an aggregate function
    pub fn is_aggregate(&self) -> bool {
        match self {
            Expr::Function { name, args } => {
                is_aggregate_name(name) || args.iter().any(Expr::is_aggregate)
            }
            Expr::Binary { left, right, .. } => left.is_aggregate() || right.is_aggregate(),
            Expr::Not(inner) | Expr::Group(inner) => inner.is_aggregate(),
            Expr::Alias { expr, .. } => expr.is_aggregate(),
            Expr::Asterisk | Expr::Value(_) | Expr::Identifier(_) => false,
        }
    }

    /// Every aggregate call in this tree, outermost first
    pub fn aggregates(&self) -> Vec<&Expr> {
        let mut found = Vec::new();
        self.collect_aggregates(&mut found);
        found
    }

    fn collect_aggregates<'a>(&'a self, found: &mut Vec<&'a Expr>) {
        match self {
            Expr::Function { name, args } => {
                if is_aggregate_name(name) {
                    found.push(self);
                } else {
                    args.iter().for_each(|arg| arg.collect_aggregates(found));
                }
            }
            Expr::Binary { left, right, .. } => {
                left.collect_aggregates(found);
                right.collect_aggregates(found);
            }
            Expr::Not(inner) | Expr::Group(inner) => inner.collect_aggregates(found),
            Expr::Alias { expr, .. } => expr.collect_aggregates(found),
            Expr::Asterisk | Expr::Value(_) | Expr::Identifier(_) => {}
        }
    }

    /// Structural fingerprint used to match planner rules
    pub fn signature(&self) -> String {
        let signature = match self {
            Expr::Asterisk | Expr::Alias { .. } => return UNKNOWN_SIGNATURE.to_string(),
            Expr::Value(value) => format!("@V{}", value.type_char()),
            Expr::Identifier(_) => "@I".to_string(),
            Expr::Binary { left, op, right } => {
                format!("{} {} {}", left.signature(), op.symbol(), right.signature())
            }
            Expr::Not(inner) => format!("NOT {}", inner.signature()),
            Expr::Group(inner) => format!("({})", inner.signature()),
            Expr::Function { name, args } => {
                let args: Vec<String> = args.iter().map(Expr::signature).collect();
                format!("{}({})", name, args.join(","))
            }
        };
        if signature.contains(UNKNOWN_SIGNATURE) {
            UNKNOWN_SIGNATURE.to_string()
        } else {
            signature
        }
    }

    /// Output column name in a projection
    pub fn column_name(&self) -> String {
        match self {
            Expr::Identifier(name) => name.clone(),
            Expr::Alias { name, .. } => name.clone(),
            other => other.to_string(),
        }
    }

    /// Compile into a fragment. Literal values become positional arguments
    /// starting at `offset`; binary operands compile left then right so
    /// argument order follows the text.
    pub fn compile(&self, offset: usize) -> Result<Compiled> {
        match self {
            Expr::Asterisk => Ok(Compiled::constant(Value::Boolean(true), offset)),
            Expr::Value(value) => Ok(Compiled {
                fragment: Fragment::Arg(offset),
                offset: offset + 1,
                args: vec![value.clone()],
            }),
            Expr::Identifier(name) => Ok(Compiled {
                fragment: Fragment::Field(name.clone()),
                offset,
                args: Vec::new(),
            }),
            Expr::Binary { left, op, right } => {
                let left = left.compile(offset)?;
                let right = right.compile(left.offset)?;
                let mut args = left.args;
                args.extend(right.args);
                Ok(Compiled {
                    fragment: Fragment::Binary {
                        op: *op,
                        left: Box::new(left.fragment),
                        right: Box::new(right.fragment),
                    },
                    offset: right.offset,
                    args,
                })
            }
            Expr::Not(inner) => {
                let inner = inner.compile(offset)?;
                Ok(Compiled {
                    fragment: Fragment::Not(Box::new(inner.fragment)),
                    ..inner
                })
            }
            Expr::Group(inner) => inner.compile(offset),
            Expr::Alias { .. } => Ok(Compiled::constant(Value::Boolean(true), offset)),
            Expr::Function { name, args } => {
                if is_aggregate_name(name) {
                    if args.iter().any(Expr::is_aggregate) {
                        return Err(Error::Plan(format!(
                            "aggregate calls cannot be nested: {}",
                            self
                        )));
                    }
                    return Ok(Compiled {
                        fragment: Fragment::Aggregate(self.to_string()),
                        offset,
                        args: Vec::new(),
                    });
                }
                check_scalar_call(name, args.len())?;

                let mut compiled_args = Vec::with_capacity(args.len());
                let mut extra = Vec::new();
                let mut offset = offset;
                for arg in args {
                    let compiled = arg.compile(offset)?;
                    offset = compiled.offset;
                    extra.extend(compiled.args);
                    compiled_args.push(compiled.fragment);
                }
                Ok(Compiled {
                    fragment: Fragment::Call {
                        name: name.clone(),
                        args: compiled_args,
                    },
                    offset,
                    args: extra,
                })
            }
        }
    }
}

impl Compiled {
    fn constant(value: Value, offset: usize) -> Self {
        Self {
            fragment: Fragment::Const(value),
            offset,
            args: Vec::new(),
        }
    }
}

pub fn is_aggregate_name(name: &str) -> bool {
    AGGREGATES.contains(&name)
}

fn check_scalar_call(name: &str, arity: usize) -> Result<()> {
    match SCALAR_FUNCTIONS.iter().find(|(known, _)| *known == name) {
        None => Err(Error::UnknownFunction(name.to_string())),
        Some((_, Some(expected))) if *expected != arity => Err(Error::Plan(format!(
            "function '{}' takes {} argument(s), got {}",
            name, expected, arity
        ))),
        Some(_) => Ok(()),
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, items: &[Value]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", item)?;
    }
    Ok(())
}

/// Canonical text. The right operand of IS, IN and BETWEEN is written in
/// its keyword form rather than as a plain value.
impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Asterisk => write!(f, "*"),
            Expr::Value(value) => write!(f, "{}", value),
            Expr::Identifier(name) => write!(f, "{}", name),
            Expr::Binary { left, op, right } => {
                write!(f, "{} {} ", left, op)?;
                match (op, right.as_ref()) {
                    (BinaryOperator::Is | BinaryOperator::IsNot, Expr::Value(v))
                        if matches!(v, Value::Null | Value::Boolean(_)) =>
                    {
                        write!(f, "{}", v.to_string().to_uppercase())
                    }
                    (BinaryOperator::In | BinaryOperator::NotIn, Expr::Value(Value::List(items))) => {
                        write!(f, "(")?;
                        write_list(f, items)?;
                        write!(f, ")")
                    }
                    (
                        BinaryOperator::Between | BinaryOperator::NotBetween,
                        Expr::Value(Value::List(bounds)),
                    ) if bounds.len() == 2 => write!(f, "{} AND {}", bounds[0], bounds[1]),
                    _ => write!(f, "{}", right),
                }
            }
            Expr::Not(inner) => write!(f, "NOT {}", inner),
            Expr::Function { name, args } => {
                write!(f, "{}(", name)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ")")
            }
            Expr::Group(inner) => write!(f, "({})", inner),
            Expr::Alias { expr, name } => write!(f, "{} AS {}", expr, name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, args: Vec<Expr>) -> Expr {
        Expr::Function {
            name: name.to_string(),
            args,
        }
    }

    #[test]
    fn test_signature() {
        let e = Expr::binary(Expr::identifier("foo"), BinaryOperator::Eq, Expr::value(1i64));
        assert_eq!(e.signature(), "@I = @Vi");

        let e = Expr::binary(Expr::Value(Value::Null), BinaryOperator::Lt, Expr::identifier("a"));
        assert_eq!(e.signature(), "@Vn < @I");

        let e = Expr::Not(Box::new(Expr::Group(Box::new(Expr::binary(
            Expr::identifier("a"),
            BinaryOperator::Is,
            Expr::value(true),
        )))));
        assert_eq!(e.signature(), "NOT (@I IS @V1)");

        let e = call("sum", vec![Expr::identifier("a"), Expr::value("x")]);
        assert_eq!(e.signature(), "sum(@I,@Vs)");
    }

    #[test]
    fn test_unknown_signature_propagates() {
        let e = call("count", vec![Expr::Asterisk]);
        assert_eq!(e.signature(), UNKNOWN_SIGNATURE);

        let alias = Expr::Alias {
            expr: Box::new(Expr::identifier("a")),
            name: "b".to_string(),
        };
        let e = Expr::binary(alias, BinaryOperator::Eq, Expr::value(1i64));
        assert_eq!(e.signature(), UNKNOWN_SIGNATURE);
    }

    #[test]
    fn test_is_aggregate() {
        assert!(call("sum", vec![Expr::identifier("a")]).is_aggregate());
        assert!(Expr::binary(
            call("count", vec![Expr::Asterisk]),
            BinaryOperator::Add,
            Expr::value(1i64)
        )
        .is_aggregate());
        assert!(!call("lower", vec![Expr::identifier("a")]).is_aggregate());
        assert!(call("abs", vec![call("max", vec![Expr::identifier("a")])]).is_aggregate());
    }

    #[test]
    fn test_render() {
        let e = Expr::binary(
            Expr::identifier("a"),
            BinaryOperator::In,
            Expr::Value(Value::List(vec![1i64.into(), "x".into()])),
        );
        assert_eq!(e.to_string(), "a IN (1, 'x')");

        let e = Expr::binary(
            Expr::identifier("a"),
            BinaryOperator::NotBetween,
            Expr::Value(Value::List(vec![1i64.into(), 5i64.into()])),
        );
        assert_eq!(e.to_string(), "a NOT BETWEEN 1 AND 5");

        let e = Expr::binary(Expr::identifier("a"), BinaryOperator::IsNot, Expr::Value(Value::Null));
        assert_eq!(e.to_string(), "a IS NOT NULL");

        let e = call("sum", vec![Expr::binary(Expr::identifier("a"), BinaryOperator::Add, Expr::value(2i64))]);
        assert_eq!(e.to_string(), "sum(a + 2)");
    }

    #[test]
    fn test_compile_threads_offsets_left_to_right() {
        let e = Expr::binary(
            Expr::binary(Expr::identifier("a"), BinaryOperator::Gt, Expr::value(1i64)),
            BinaryOperator::And,
            Expr::binary(Expr::value("x"), BinaryOperator::Eq, Expr::identifier("b")),
        );
        let compiled = e.compile(3).unwrap();
        assert_eq!(compiled.offset, 5);
        assert_eq!(compiled.args, vec![Value::Integer(1), Value::from("x")]);
        match compiled.fragment {
            Fragment::Binary { left, right, .. } => {
                assert_eq!(
                    *left,
                    Fragment::Binary {
                        op: BinaryOperator::Gt,
                        left: Box::new(Fragment::Field("a".to_string())),
                        right: Box::new(Fragment::Arg(3)),
                    }
                );
                assert_eq!(
                    *right,
                    Fragment::Binary {
                        op: BinaryOperator::Eq,
                        left: Box::new(Fragment::Arg(4)),
                        right: Box::new(Fragment::Field("b".to_string())),
                    }
                );
            }
            other => panic!("Expected binary fragment, got {:?}", other),
        }
    }

    #[test]
    fn test_compile_special_nodes() {
        let alias = Expr::Alias {
            expr: Box::new(Expr::value(1i64)),
            name: "x".to_string(),
        };
        let compiled = alias.compile(0).unwrap();
        assert_eq!(compiled.fragment, Fragment::Const(Value::Boolean(true)));
        assert_eq!(compiled.offset, 0);

        let agg = call("sum", vec![Expr::identifier("a")]);
        assert_eq!(
            agg.compile(0).unwrap().fragment,
            Fragment::Aggregate("sum(a)".to_string())
        );

        assert!(matches!(
            call("nope", vec![]).compile(0),
            Err(Error::UnknownFunction(_))
        ));
        assert!(call("sum", vec![call("count", vec![Expr::Asterisk])]).compile(0).is_err());
    }
}
