//! Pipeline stages
//!
//! A stage consumes one input table and an argument offset, and compiles
//! into an operation writing a fresh transient output. Stages carry the
//! expressions they were planned from so `explain` can describe them
//! without running anything.

use std::fmt;

use super::manager::TransientArena;
use super::program::{
    Action, AggregateFunction, AggregateOp, Column, Op, SortKey,
};
use super::Fragment;
use crate::catalog::Index;
use crate::error::{Error, Result};
use crate::sql::{Assignment, Expr, OrderByItem};
use crate::storage::{Storage, Table, Value};

/// Result of compiling one stage
#[derive(Debug)]
pub struct Compilation {
    /// Table the next stage reads; `None` after a write action
    pub output: Option<Table>,
    pub op: Option<Op>,
    /// Next free argument position
    pub offset: usize,
    /// Arguments introduced by this stage, in position order
    pub args: Vec<Value>,
}

pub trait Stage: fmt::Debug + Send {
    fn name(&self) -> &'static str;

    /// Human-readable description
    fn explain(&self) -> String;

    fn compile(
        &self,
        s: &mut dyn Storage,
        arena: &mut TransientArena,
        input: Option<&Table>,
        offset: usize,
    ) -> Result<Compilation>;
}

/// What a source stage does with matching records
#[derive(Debug, Clone, PartialEq)]
pub enum StageAction {
    Copy,
    Update(Vec<Assignment>),
    Delete,
}

impl StageAction {
    fn compile(
        &self,
        s: &mut dyn Storage,
        arena: &mut TransientArena,
        offset: usize,
    ) -> Result<(Action, Option<Table>, usize, Vec<Value>)> {
        match self {
            StageAction::Copy => {
                let output = arena.allocate(s)?;
                Ok((Action::Copy(output.clone()), Some(output), offset, Vec::new()))
            }
            StageAction::Delete => Ok((Action::Delete, None, offset, Vec::new())),
            StageAction::Update(assignments) => {
                let mut compiled = Vec::with_capacity(assignments.len());
                let mut args = Vec::new();
                let mut offset = offset;
                for assignment in assignments {
                    let value = assignment.value.compile(offset)?;
                    offset = value.offset;
                    args.extend(value.args);
                    compiled.push((assignment.column.clone(), value.fragment));
                }
                Ok((Action::Update(compiled), None, offset, args))
            }
        }
    }

    fn describe(&self) -> String {
        match self {
            StageAction::Copy => "copy matches".to_string(),
            StageAction::Delete => "expire matches".to_string(),
            StageAction::Update(assignments) => {
                let sets: Vec<String> = assignments
                    .iter()
                    .map(|a| format!("{} = {}", a.column, a.value))
                    .collect();
                format!("replace matches setting {}", sets.join(", "))
            }
        }
    }
}

fn require_input<'a>(stage: &dyn Stage, input: Option<&'a Table>) -> Result<&'a Table> {
    input.ok_or_else(|| Error::Internal(format!("{} stage has no input table", stage.name())))
}

fn compile_list(exprs: &[Expr], offset: usize) -> Result<(Vec<Fragment>, usize, Vec<Value>)> {
    let mut fragments = Vec::with_capacity(exprs.len());
    let mut args = Vec::new();
    let mut offset = offset;
    for expr in exprs {
        let compiled = expr.compile(offset)?;
        offset = compiled.offset;
        args.extend(compiled.args);
        fragments.push(compiled.fragment);
    }
    Ok((fragments, offset, args))
}

fn join_exprs(exprs: &[Expr]) -> String {
    exprs.iter().map(Expr::to_string).collect::<Vec<_>>().join(", ")
}

/// Full scan filtered by a predicate
#[derive(Debug)]
pub struct WhereStage {
    source: String,
    predicate: Option<Expr>,
    action: StageAction,
}

impl WhereStage {
    pub fn new(source: impl Into<String>, predicate: Option<Expr>, action: StageAction) -> Self {
        Self {
            source: source.into(),
            predicate,
            action,
        }
    }
}

impl Stage for WhereStage {
    fn name(&self) -> &'static str {
        "where"
    }

    fn explain(&self) -> String {
        match &self.predicate {
            Some(predicate) => format!(
                "scan {} where {}, {}",
                self.source,
                predicate,
                self.action.describe()
            ),
            None => format!("scan {}, {}", self.source, self.action.describe()),
        }
    }

    fn compile(
        &self,
        s: &mut dyn Storage,
        arena: &mut TransientArena,
        input: Option<&Table>,
        offset: usize,
    ) -> Result<Compilation> {
        let input = require_input(self, input)?;
        let (predicate, offset, mut args) = match &self.predicate {
            Some(predicate) => {
                let compiled = predicate.compile(offset)?;
                (compiled.fragment, compiled.offset, compiled.args)
            }
            None => (Fragment::Const(Value::Boolean(true)), offset, Vec::new()),
        };
        let (action, output, offset, action_args) = self.action.compile(s, arena, offset)?;
        args.extend(action_args);

        Ok(Compilation {
            output,
            op: Some(Op::Scan {
                input: input.clone(),
                predicate,
                action,
            }),
            offset,
            args,
        })
    }
}

/// Exact lookup through a secondary index instead of a scan
#[derive(Debug)]
pub struct IndexStage {
    index: Index,
    value: Value,
    predicate: Expr,
    action: StageAction,
}

impl IndexStage {
    pub fn new(index: Index, value: Value, predicate: Expr, action: StageAction) -> Self {
        Self {
            index,
            value,
            predicate,
            action,
        }
    }
}

impl Stage for IndexStage {
    fn name(&self) -> &'static str {
        "index"
    }

    fn explain(&self) -> String {
        format!(
            "look up {} = {} through index {}, {}",
            self.index.target(),
            self.value,
            self.index.name,
            self.action.describe()
        )
    }

    fn compile(
        &self,
        s: &mut dyn Storage,
        arena: &mut TransientArena,
        input: Option<&Table>,
        offset: usize,
    ) -> Result<Compilation> {
        let input = require_input(self, input)?;
        // The looked-up value takes the first position
        let value = Fragment::Arg(offset);
        let mut args = vec![self.value.clone()];
        let predicate = self.predicate.compile(offset + 1)?;
        args.extend(predicate.args);
        let (action, output, offset, action_args) =
            self.action.compile(s, arena, predicate.offset)?;
        args.extend(action_args);

        Ok(Compilation {
            output,
            op: Some(Op::Lookup {
                input: input.clone(),
                index: self.index.clone(),
                value,
                predicate: predicate.fragment,
                action,
            }),
            offset,
            args,
        })
    }
}

/// Stands in for a scan when the predicate can never be true
#[derive(Debug)]
pub struct ImpossibleWhereStage {
    predicate: Expr,
    action: StageAction,
}

impl ImpossibleWhereStage {
    pub fn new(predicate: Expr, action: StageAction) -> Self {
        Self { predicate, action }
    }
}

impl Stage for ImpossibleWhereStage {
    fn name(&self) -> &'static str {
        "impossible-where"
    }

    fn explain(&self) -> String {
        format!("skip scan, {} is never true", self.predicate)
    }

    fn compile(
        &self,
        s: &mut dyn Storage,
        arena: &mut TransientArena,
        _input: Option<&Table>,
        offset: usize,
    ) -> Result<Compilation> {
        let output = match self.action {
            StageAction::Copy => Some(arena.allocate(s)?),
            _ => None,
        };
        Ok(Compilation {
            output,
            op: None,
            offset,
            args: Vec::new(),
        })
    }
}

/// Input for a statement without FROM: one record with no fields
#[derive(Debug, Default)]
pub struct NoTableStage;

impl Stage for NoTableStage {
    fn name(&self) -> &'static str {
        "no-table"
    }

    fn explain(&self) -> String {
        "produce a single empty record".to_string()
    }

    fn compile(
        &self,
        s: &mut dyn Storage,
        arena: &mut TransientArena,
        _input: Option<&Table>,
        offset: usize,
    ) -> Result<Compilation> {
        let output = arena.allocate(s)?;
        Ok(Compilation {
            output: Some(output.clone()),
            op: Some(Op::Single { output }),
            offset,
            args: Vec::new(),
        })
    }
}

/// Grouping and aggregation
#[derive(Debug)]
pub struct GroupStage {
    keys: Vec<Expr>,
    /// Distinct aggregate calls, by canonical text
    aggregates: Vec<Expr>,
}

impl GroupStage {
    /// Collect the distinct aggregate calls found in `sources`
    pub fn new<'a>(keys: Vec<Expr>, sources: impl IntoIterator<Item = &'a Expr>) -> Self {
        let mut aggregates: Vec<Expr> = Vec::new();
        for source in sources {
            for aggregate in source.aggregates() {
                let text = aggregate.to_string();
                if !aggregates.iter().any(|known| known.to_string() == text) {
                    aggregates.push(aggregate.clone());
                }
            }
        }
        Self { keys, aggregates }
    }

    pub fn aggregates(&self) -> &[Expr] {
        &self.aggregates
    }

    fn compile_aggregate(aggregate: &Expr, offset: usize) -> Result<(AggregateOp, usize, Vec<Value>)> {
        let Expr::Function { name, args } = aggregate else {
            return Err(Error::Internal(format!("not an aggregate call: {}", aggregate)));
        };
        let function = AggregateFunction::from_name(name)
            .ok_or_else(|| Error::UnknownFunction(name.clone()))?;
        let [arg] = args.as_slice() else {
            return Err(Error::Plan(format!(
                "aggregate '{}' takes exactly one argument",
                name
            )));
        };
        if arg.is_aggregate() {
            return Err(Error::Plan(format!(
                "aggregate calls cannot be nested: {}",
                aggregate
            )));
        }
        let compiled = arg.compile(offset)?;
        Ok((
            AggregateOp {
                text: aggregate.to_string(),
                function,
                arg: compiled.fragment,
            },
            compiled.offset,
            compiled.args,
        ))
    }
}

impl Stage for GroupStage {
    fn name(&self) -> &'static str {
        "group"
    }

    fn explain(&self) -> String {
        let computing = if self.aggregates.is_empty() {
            String::new()
        } else {
            format!(" computing {}", join_exprs(&self.aggregates))
        };
        if self.keys.is_empty() {
            format!("aggregate all rows{}", computing)
        } else {
            format!("group by {}{}", join_exprs(&self.keys), computing)
        }
    }

    fn compile(
        &self,
        s: &mut dyn Storage,
        arena: &mut TransientArena,
        input: Option<&Table>,
        offset: usize,
    ) -> Result<Compilation> {
        let input = require_input(self, input)?;
        let (keys, mut offset, mut args) = compile_list(&self.keys, offset)?;

        let mut aggregates = Vec::with_capacity(self.aggregates.len());
        for aggregate in &self.aggregates {
            let (op, next, extra) = Self::compile_aggregate(aggregate, offset)?;
            offset = next;
            args.extend(extra);
            aggregates.push(op);
        }

        let output = arena.allocate(s)?;
        Ok(Compilation {
            output: Some(output.clone()),
            op: Some(Op::Group {
                input: input.clone(),
                output,
                keys,
                aggregates,
            }),
            offset,
            args,
        })
    }
}

/// ORDER BY
#[derive(Debug)]
pub struct OrderStage {
    items: Vec<OrderByItem>,
}

impl OrderStage {
    pub fn new(items: Vec<OrderByItem>) -> Self {
        Self { items }
    }
}

impl Stage for OrderStage {
    fn name(&self) -> &'static str {
        "order"
    }

    fn explain(&self) -> String {
        let keys: Vec<String> = self
            .items
            .iter()
            .map(|item| {
                format!(
                    "{} {}",
                    item.expr,
                    if item.ascending { "ASC" } else { "DESC" }
                )
            })
            .collect();
        format!("order by {}", keys.join(", "))
    }

    fn compile(
        &self,
        s: &mut dyn Storage,
        arena: &mut TransientArena,
        input: Option<&Table>,
        offset: usize,
    ) -> Result<Compilation> {
        let input = require_input(self, input)?;
        let mut keys = Vec::with_capacity(self.items.len());
        let mut args = Vec::new();
        let mut offset = offset;
        for item in &self.items {
            let compiled = item.expr.compile(offset)?;
            offset = compiled.offset;
            args.extend(compiled.args);
            keys.push(SortKey {
                fragment: compiled.fragment,
                ascending: item.ascending,
            });
        }

        let output = arena.allocate(s)?;
        Ok(Compilation {
            output: Some(output.clone()),
            op: Some(Op::Order {
                input: input.clone(),
                output,
                keys,
            }),
            offset,
            args,
        })
    }
}

/// Projection and renaming
#[derive(Debug)]
pub struct ExpressionStage {
    columns: Vec<Expr>,
}

impl ExpressionStage {
    pub fn new(columns: Vec<Expr>) -> Self {
        Self { columns }
    }
}

impl Stage for ExpressionStage {
    fn name(&self) -> &'static str {
        "expression"
    }

    fn explain(&self) -> String {
        format!("project {}", join_exprs(&self.columns))
    }

    fn compile(
        &self,
        s: &mut dyn Storage,
        arena: &mut TransientArena,
        input: Option<&Table>,
        offset: usize,
    ) -> Result<Compilation> {
        let input = require_input(self, input)?;
        let mut columns = Vec::with_capacity(self.columns.len());
        let mut args = Vec::new();
        let mut offset = offset;
        for column in &self.columns {
            // An alias names its inner expression
            let expr = match column {
                Expr::Asterisk => {
                    columns.push(Column::All);
                    continue;
                }
                Expr::Alias { expr, .. } => expr.as_ref(),
                other => other,
            };
            let compiled = expr.compile(offset)?;
            offset = compiled.offset;
            args.extend(compiled.args);
            columns.push(Column::Named {
                name: column.column_name(),
                fragment: compiled.fragment,
            });
        }

        let output = arena.allocate(s)?;
        Ok(Compilation {
            output: Some(output.clone()),
            op: Some(Op::Project {
                input: input.clone(),
                output,
                columns,
            }),
            offset,
            args,
        })
    }
}

/// LIMIT / OFFSET
#[derive(Debug)]
pub struct LimitStage {
    limit: Option<u64>,
    offset: u64,
}

impl LimitStage {
    pub fn new(limit: Option<u64>, offset: Option<u64>) -> Self {
        Self {
            limit,
            offset: offset.unwrap_or(0),
        }
    }
}

impl Stage for LimitStage {
    fn name(&self) -> &'static str {
        "limit"
    }

    fn explain(&self) -> String {
        match self.limit {
            Some(limit) => format!(
                "keep rows {} to {}",
                self.offset,
                self.offset.saturating_add(limit)
            ),
            None => format!("skip {} rows", self.offset),
        }
    }

    fn compile(
        &self,
        s: &mut dyn Storage,
        arena: &mut TransientArena,
        input: Option<&Table>,
        offset: usize,
    ) -> Result<Compilation> {
        let input = require_input(self, input)?;
        let output = arena.allocate(s)?;
        Ok(Compilation {
            output: Some(output.clone()),
            op: Some(Op::Limit {
                input: input.clone(),
                output,
                offset: usize::try_from(self.offset).unwrap_or(usize::MAX),
                limit: self.limit.map(|l| usize::try_from(l).unwrap_or(usize::MAX)),
            }),
            offset,
            args: Vec::new(),
        })
    }
}

/// DELETE without a predicate when nothing else is in flight
#[derive(Debug)]
pub struct TruncateStage {
    table: String,
}

impl TruncateStage {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
        }
    }
}

impl Stage for TruncateStage {
    fn name(&self) -> &'static str {
        "truncate"
    }

    fn explain(&self) -> String {
        format!("remove every record of {} and clear its indexes", self.table)
    }

    fn compile(
        &self,
        _s: &mut dyn Storage,
        _arena: &mut TransientArena,
        _input: Option<&Table>,
        offset: usize,
    ) -> Result<Compilation> {
        Ok(Compilation {
            output: None,
            op: Some(Op::Truncate {
                table: Table::new(self.table.as_str()),
            }),
            offset,
            args: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::BinaryOperator;
    use crate::storage::Store;

    fn call(name: &str, args: Vec<Expr>) -> Expr {
        Expr::Function {
            name: name.to_string(),
            args,
        }
    }

    #[test]
    fn test_group_deduplicates_aggregates() {
        let sum_a = call("sum", vec![Expr::identifier("a")]);
        let sum_a_plus = call(
            "sum",
            vec![Expr::binary(Expr::identifier("a"), BinaryOperator::Add, Expr::value(2i64))],
        );
        let columns = vec![
            sum_a.clone(),
            sum_a_plus.clone(),
            Expr::binary(sum_a.clone(), BinaryOperator::Mul, Expr::value(2i64)),
        ];
        let stage = GroupStage::new(vec![], columns.iter());
        assert_eq!(stage.aggregates(), &[sum_a, sum_a_plus]);
        assert_eq!(stage.explain(), "aggregate all rows computing sum(a), sum(a + 2)");
    }

    #[test]
    fn test_where_threads_arguments() {
        let store = Store::memory();
        let mut arena = TransientArena::new(store.clone(), 7);
        let compilation = store
            .atomic(|s| {
                let stage = WhereStage::new(
                    "t",
                    Some(Expr::binary(Expr::identifier("a"), BinaryOperator::Eq, Expr::value(1i64))),
                    StageAction::Update(vec![Assignment {
                        column: "b".to_string(),
                        value: Expr::value("x"),
                    }]),
                );
                stage.compile(s, &mut arena, Some(&Table::new("t")), 4)
            })
            .unwrap();
        assert_eq!(compilation.offset, 6);
        assert_eq!(compilation.args, vec![Value::Integer(1), Value::from("x")]);
        assert!(compilation.output.is_none());
        assert_eq!(arena.len(), 0);
    }

    #[test]
    fn test_index_stage_reads_its_value_argument() {
        let store = Store::memory();
        let mut arena = TransientArena::new(store.clone(), 7);
        let predicate = Expr::binary(Expr::identifier("foo"), BinaryOperator::Eq, Expr::value(124i64));
        let compilation = store
            .atomic(|s| {
                IndexStage::new(
                    Index::new("idx", "t", "foo"),
                    Value::Integer(124),
                    predicate.clone(),
                    StageAction::Copy,
                )
                .compile(s, &mut arena, Some(&Table::new("t")), 2)
            })
            .unwrap();
        assert_eq!(compilation.offset, 4);
        assert_eq!(compilation.args, vec![Value::Integer(124), Value::Integer(124)]);
        match compilation.op {
            Some(Op::Lookup { value, .. }) => assert_eq!(value, Fragment::Arg(2)),
            other => panic!("Expected lookup, got {:?}", other),
        }
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn test_projection_names() {
        let store = Store::memory();
        let mut arena = TransientArena::new(store.clone(), 7);
        let columns = vec![
            Expr::identifier("a"),
            Expr::Alias {
                expr: Box::new(Expr::value(1i64)),
                name: "one".to_string(),
            },
            call("count", vec![Expr::Asterisk]),
        ];
        let compilation = store
            .atomic(|s| {
                ExpressionStage::new(columns.clone()).compile(s, &mut arena, Some(&Table::new("~7~0")), 0)
            })
            .unwrap();
        match compilation.op {
            Some(Op::Project { columns, .. }) => {
                let names: Vec<String> = columns
                    .iter()
                    .map(|c| match c {
                        Column::Named { name, .. } => name.clone(),
                        Column::All => "*".to_string(),
                    })
                    .collect();
                assert_eq!(names, vec!["a", "one", "count(*)"]);
                assert_eq!(
                    columns[1],
                    Column::Named {
                        name: "one".to_string(),
                        fragment: Fragment::Arg(0)
                    }
                );
            }
            other => panic!("Expected projection, got {:?}", other),
        }
    }
}
