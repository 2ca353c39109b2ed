use crate::catalog::{Index, IndexManager};
use crate::error::Result;
use crate::sql::{BinaryOperator, Expr};
use crate::storage::{Storage, Value};
use tracing::debug;

/// Predicate shapes that can be answered by an exact index lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexRule {
    /// `field = value`
    IdentifierEqualsValue,
    /// `value = field`
    ValueEqualsIdentifier,
    /// `field IS value`
    IdentifierIsValue,
}

impl IndexRule {
    /// Rules in the order they are tried
    pub const ALL: [IndexRule; 3] = [
        IndexRule::IdentifierEqualsValue,
        IndexRule::ValueEqualsIdentifier,
        IndexRule::IdentifierIsValue,
    ];

    /// Signature shape, with `@V` standing for any scalar value
    pub fn pattern(&self) -> &'static str {
        match self {
            IndexRule::IdentifierEqualsValue => "@I = @V",
            IndexRule::ValueEqualsIdentifier => "@V = @I",
            IndexRule::IdentifierIsValue => "@I IS @V",
        }
    }

    /// Field and lookup value when `predicate` has this rule's shape
    pub fn matches<'a>(&self, predicate: &'a Expr) -> Option<(&'a str, &'a Value)> {
        let Expr::Binary { left, op, right } = predicate else {
            return None;
        };
        let (field, value) = match (self, op, left.as_ref(), right.as_ref()) {
            (IndexRule::IdentifierEqualsValue, BinaryOperator::Eq, Expr::Identifier(f), Expr::Value(v))
            | (IndexRule::ValueEqualsIdentifier, BinaryOperator::Eq, Expr::Value(v), Expr::Identifier(f))
            | (IndexRule::IdentifierIsValue, BinaryOperator::Is, Expr::Identifier(f), Expr::Value(v)) => {
                (f.as_str(), v)
            }
            _ => return None,
        };
        (!value.is_container()).then_some((field, value))
    }
}

/// An index chosen for a predicate
#[derive(Debug, Clone, PartialEq)]
pub struct IndexChoice {
    pub index: Index,
    pub value: Value,
    pub rule: IndexRule,
}

/// True when the predicate compares a field to a null literal with an
/// operator that is never true against null
pub fn is_impossible(predicate: &Expr) -> bool {
    let Expr::Binary { left, op, right } = predicate else {
        return false;
    };
    if !op.is_null_rejecting() {
        return false;
    }
    matches!(
        (left.as_ref(), right.as_ref()),
        (Expr::Identifier(_), Expr::Value(Value::Null)) | (Expr::Value(Value::Null), Expr::Identifier(_))
    )
}

/// First rule matching the predicate whose field has an index on `table`
pub fn select_index(s: &dyn Storage, table: &str, predicate: &Expr) -> Result<Option<IndexChoice>> {
    debug!(table, signature = %predicate.signature(), "selecting index");
    for rule in IndexRule::ALL {
        let Some((field, value)) = rule.matches(predicate) else {
            continue;
        };
        // The first matching shape decides; no fallback to later rules
        return Ok(IndexManager::find_index(s, table, field)?.map(|index| {
            debug!(table, index = %index.name, rule = rule.pattern(), "using index");
            IndexChoice {
                index,
                value: value.clone(),
                rule,
            }
        }));
    }
    Ok(None)
}
