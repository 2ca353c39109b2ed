//! Statement nodes. Expressions live in `expr`.

use super::expr::Expr;
use crate::storage::Value;
use indexmap::IndexMap;

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Select(SelectStatement),
    Insert(InsertStatement),
    Update(UpdateStatement),
    Delete(DeleteStatement),
    CreateIndex(CreateIndexStatement),
    DropIndex(DropIndexStatement),
    CreateNotification(CreateNotificationStatement),
    DropNotification(DropNotificationStatement),
    DropTable(DropTableStatement),
    /// `START TRANSACTION` or `BEGIN`
    StartTransaction,
    Commit,
    Rollback,
    /// Only SELECT, UPDATE and DELETE have a plan to show
    Explain(Box<Statement>),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SelectStatement {
    /// A lone `Expr::Asterisk` selects whole records
    pub columns: Vec<Expr>,
    /// `None` evaluates the select list once against an empty record
    pub from: Option<TableRef>,
    pub where_clause: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub order_by: Vec<OrderByItem>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl SelectStatement {
    /// True when the projection is exactly `*`
    pub fn selects_all(&self) -> bool {
        matches!(self.columns.as_slice(), [Expr::Asterisk])
    }

    pub fn has_aggregates(&self) -> bool {
        self.columns.iter().any(Expr::is_aggregate)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TableRef {
    Table(String),
    /// `(SELECT ...) AS alias`
    Subquery {
        query: Box<SelectStatement>,
        alias: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderByItem {
    pub expr: Expr,
    pub ascending: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertStatement {
    pub table_name: String,
    /// One field map per row, in statement order
    pub rows: Vec<IndexMap<String, Value>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateStatement {
    pub table_name: String,
    pub assignments: Vec<Assignment>,
    pub where_clause: Option<Expr>,
}

/// `field = expr` in a SET list
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub column: String,
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteStatement {
    pub table_name: String,
    pub where_clause: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DropTableStatement {
    pub table_name: String,
    pub if_exists: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateIndexStatement {
    pub index_name: String,
    pub table_name: String,
    pub field: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DropIndexStatement {
    pub index_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateNotificationStatement {
    pub name: String,
    pub table_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DropNotificationStatement {
    pub name: String,
}
