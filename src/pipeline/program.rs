//! Compiled programs and their interpreter
//!
//! A program is the flat list of operations produced from every stage of
//! every job, plus the positional arguments its fragments read. It runs in
//! one pass inside a single `Store::atomic` section.

use std::cmp::Ordering;

use indexmap::IndexMap;
use tracing::{debug, warn};

use super::fragment::Fragment;
use crate::catalog::{Index, IndexManager};
use crate::error::{Error, Result};
use crate::storage::table::DEFAULT_BATCH_SIZE;
use crate::storage::{Record, Storage, Table, Value};
use crate::transaction::{replay, Snapshot, UndoAction};

/// What a source operation does with each matching record
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Copy into a transient table, preserving ids
    Copy(Table),
    /// Expire the version and insert a rewritten one
    Update(Vec<(String, Fragment)>),
    /// Expire the version
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunction {
    Avg,
    Count,
    Max,
    Min,
    Sum,
}

impl AggregateFunction {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "avg" => Some(Self::Avg),
            "count" => Some(Self::Count),
            "max" => Some(Self::Max),
            "min" => Some(Self::Min),
            "sum" => Some(Self::Sum),
            _ => None,
        }
    }
}

/// One distinct aggregate, stored on grouped rows under `text`
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateOp {
    pub text: String,
    pub function: AggregateFunction,
    pub arg: Fragment,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortKey {
    pub fragment: Fragment,
    pub ascending: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    /// Every field of the input record
    All,
    Named { name: String, fragment: Fragment },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// Full scan with a predicate
    Scan {
        input: Table,
        predicate: Fragment,
        action: Action,
    },
    /// Exact index lookup, re-checked against the predicate
    Lookup {
        input: Table,
        index: Index,
        value: Fragment,
        predicate: Fragment,
        action: Action,
    },
    /// One record with no fields
    Single { output: Table },
    Group {
        input: Table,
        output: Table,
        keys: Vec<Fragment>,
        aggregates: Vec<AggregateOp>,
    },
    Order {
        input: Table,
        output: Table,
        keys: Vec<SortKey>,
    },
    Project {
        input: Table,
        output: Table,
        columns: Vec<Column>,
    },
    Limit {
        input: Table,
        output: Table,
        offset: usize,
        limit: Option<usize>,
    },
    /// Remove every record and index entry of a table
    Truncate { table: Table },
}

/// An operation tagged with the stage that emitted it
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub stage: String,
    pub op: Op,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub steps: Vec<Step>,
    pub args: Vec<Value>,
    /// Table holding the rows to return, if the program returns any
    pub result: Option<Table>,
    pub batch_size: usize,
}

/// Effects of a successful run
#[derive(Debug, Default)]
pub struct Outcome {
    pub rows: Vec<Record>,
    pub affected: usize,
    /// Undo actions for every write, oldest first
    pub undo: Vec<UndoAction>,
}

impl Program {
    pub fn new(steps: Vec<Step>, args: Vec<Value>, result: Option<Table>) -> Self {
        Self {
            steps,
            args,
            result,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Run every step in order. On failure the writes made so far are
    /// undone before the error is returned, so a statement either applies
    /// completely or not at all.
    pub fn run(&self, s: &mut dyn Storage, snapshot: &Snapshot) -> Result<Outcome> {
        let mut machine = Machine {
            snapshot,
            args: &self.args,
            batch_size: self.batch_size,
            undo: Vec::new(),
            affected: 0,
        };

        for (position, step) in self.steps.iter().enumerate() {
            if let Err(e) = machine.execute(s, &step.op) {
                if let Err(undo_error) = replay(s, &machine.undo) {
                    warn!(error = %undo_error, "failed to undo partial statement");
                }
                debug!(op = position, stage = %step.stage, error = %e, "program failed");
                return Err(Error::Runtime {
                    op: position,
                    stage: step.stage.clone(),
                    message: e.user_message(),
                });
            }
        }

        let rows = match &self.result {
            Some(table) => table.iterate_with(&*s, self.batch_size).collect::<Result<_>>()?,
            None => Vec::new(),
        };
        Ok(Outcome {
            rows,
            affected: machine.affected,
            undo: machine.undo,
        })
    }
}

struct Machine<'a> {
    snapshot: &'a Snapshot,
    args: &'a [Value],
    batch_size: usize,
    undo: Vec<UndoAction>,
    affected: usize,
}

impl Machine<'_> {
    fn execute(&mut self, s: &mut dyn Storage, op: &Op) -> Result<()> {
        match op {
            Op::Scan {
                input,
                predicate,
                action,
            } => {
                let mut matched = Vec::new();
                for record in self.read(s, input)? {
                    if predicate.matches(&record, self.args)? {
                        matched.push(record);
                    }
                }
                self.apply(s, input, matched, action)
            }
            Op::Lookup {
                input,
                index,
                value,
                predicate,
                action,
            } => {
                let key = value.eval(&Record::default(), self.args)?;
                let mut matched = Vec::new();
                for id in index.lookup_exact(s, &key)? {
                    let Some(record) = input.get_record(s, id)? else {
                        continue;
                    };
                    if self.readable(input, &record) && predicate.matches(&record, self.args)? {
                        matched.push(record);
                    }
                }
                self.apply(s, input, matched, action)
            }
            Op::Single { output } => output.store_record(
                s,
                &Record {
                    id: 1,
                    ..Record::default()
                },
            ),
            Op::Group {
                input,
                output,
                keys,
                aggregates,
            } => {
                let records = self.read(s, input)?;
                for (position, record) in self.group(records, keys, aggregates)?.into_iter().enumerate() {
                    output.store_record(
                        s,
                        &Record {
                            id: position as i64 + 1,
                            ..record
                        },
                    )?;
                }
                Ok(())
            }
            Op::Order {
                input,
                output,
                keys,
            } => {
                let mut records = self.read(s, input)?;
                // Stable passes from the last key to the first
                for key in keys.iter().rev() {
                    records = self.sort(records, key)?;
                }
                for (position, record) in records.into_iter().enumerate() {
                    output.store_record(
                        s,
                        &Record {
                            id: position as i64 + 1,
                            ..record
                        },
                    )?;
                }
                Ok(())
            }
            Op::Project {
                input,
                output,
                columns,
            } => {
                for record in self.read(s, input)? {
                    let mut fields = IndexMap::with_capacity(columns.len());
                    for column in columns {
                        match column {
                            Column::All => fields.extend(record.fields.clone()),
                            Column::Named { name, fragment } => {
                                fields.insert(name.clone(), fragment.eval(&record, self.args)?);
                            }
                        }
                    }
                    output.store_record(
                        s,
                        &Record {
                            fields,
                            ..record
                        },
                    )?;
                }
                Ok(())
            }
            Op::Limit {
                input,
                output,
                offset,
                limit,
            } => {
                let records = self.read(s, input)?;
                let keep = limit.unwrap_or(usize::MAX);
                for record in records.into_iter().skip(*offset).take(keep) {
                    output.store_record(s, &record)?;
                }
                Ok(())
            }
            Op::Truncate { table } => {
                let visible = self.read(s, table)?.len();
                table.truncate(s)?;
                for index in IndexManager::get_indexes_for_table(s, table.name())? {
                    index.clear(s)?;
                }
                self.affected += visible;
                Ok(())
            }
        }
    }

    /// Transient tables belong to this run and are read as-is; permanent
    /// tables go through the visibility rule.
    fn readable(&self, table: &Table, record: &Record) -> bool {
        table.is_transient() || self.snapshot.is_visible(record)
    }

    fn read(&self, s: &dyn Storage, table: &Table) -> Result<Vec<Record>> {
        let mut records = Vec::new();
        for record in table.iterate_with(s, self.batch_size) {
            let record = record?;
            if self.readable(table, &record) {
                records.push(record);
            }
        }
        Ok(records)
    }

    fn apply(
        &mut self,
        s: &mut dyn Storage,
        input: &Table,
        matched: Vec<Record>,
        action: &Action,
    ) -> Result<()> {
        let xid = self.snapshot.xid;
        match action {
            Action::Copy(output) => {
                for record in &matched {
                    output.store_record(s, record)?;
                }
            }
            Action::Delete => {
                for record in matched {
                    self.snapshot.check_writable(input, &record)?;
                    input.expire(s, record.id, xid)?;
                    self.undo.push(UndoAction::Unexpire {
                        table: input.name().to_string(),
                        id: record.id,
                    });
                    self.affected += 1;
                }
            }
            Action::Update(assignments) => {
                // Every new version is computed before anything is written
                let mut rewritten = Vec::with_capacity(matched.len());
                for record in &matched {
                    let mut fields = record.fields.clone();
                    for (column, fragment) in assignments {
                        fields.insert(column.clone(), fragment.eval(record, self.args)?);
                    }
                    rewritten.push(fields);
                }

                for (record, fields) in matched.iter().zip(rewritten) {
                    self.snapshot.check_writable(input, record)?;
                    input.expire(s, record.id, xid)?;
                    self.undo.push(UndoAction::Unexpire {
                        table: input.name().to_string(),
                        id: record.id,
                    });
                    let id = input.add_record(s, Record::new(fields), xid)?;
                    self.undo.push(UndoAction::Purge {
                        table: input.name().to_string(),
                        id,
                    });
                    self.affected += 1;
                }
            }
        }
        Ok(())
    }

    /// One output record per distinct key, in first-seen order: the first
    /// record of the group plus each aggregate under its canonical text.
    /// Without keys an empty input still yields one row of defaults.
    fn group(
        &self,
        records: Vec<Record>,
        keys: &[Fragment],
        aggregates: &[AggregateOp],
    ) -> Result<Vec<Record>> {
        let mut groups: IndexMap<String, (Record, Vec<Accumulator>)> = IndexMap::new();

        for record in records {
            let key = if keys.is_empty() {
                String::new()
            } else {
                let values = keys
                    .iter()
                    .map(|key| key.eval(&record, self.args))
                    .collect::<Result<Vec<_>>>()?;
                Value::List(values).json_key()
            };

            let mut inputs = Vec::with_capacity(aggregates.len());
            for aggregate in aggregates {
                inputs.push(aggregate.arg.eval(&record, self.args)?);
            }

            let (_, accumulators) = groups.entry(key).or_insert_with(|| {
                let accumulators = aggregates.iter().map(|a| Accumulator::new(a.function)).collect();
                (record, accumulators)
            });
            for ((accumulator, aggregate), value) in accumulators.iter_mut().zip(aggregates).zip(inputs) {
                accumulator.update(&aggregate.text, value)?;
            }
        }

        if groups.is_empty() && keys.is_empty() {
            let accumulators = aggregates.iter().map(|a| Accumulator::new(a.function)).collect();
            groups.insert(String::new(), (Record::default(), accumulators));
        }

        Ok(groups
            .into_values()
            .map(|(mut representative, accumulators)| {
                for (aggregate, accumulator) in aggregates.iter().zip(accumulators) {
                    representative
                        .fields
                        .insert(aggregate.text.clone(), accumulator.finish());
                }
                representative
            })
            .collect())
    }

    fn sort(&self, records: Vec<Record>, key: &SortKey) -> Result<Vec<Record>> {
        let mut keyed = Vec::with_capacity(records.len());
        for record in records {
            let value = key.fragment.eval(&record, self.args)?;
            keyed.push((SortValue::from_value(value)?, record));
        }
        keyed.sort_by(|(a, _), (b, _)| a.order(b, key.ascending));
        Ok(keyed.into_iter().map(|(_, record)| record).collect())
    }
}

/// A sort key sorted within its kind's partition
#[derive(Debug, Clone, PartialEq)]
enum SortValue {
    Boolean(bool),
    Number(f64),
    Text(String),
    Null,
}

impl SortValue {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Boolean(b) => Ok(SortValue::Boolean(b)),
            Value::Integer(i) => Ok(SortValue::Number(i as f64)),
            Value::Float(f) => Ok(SortValue::Number(f)),
            Value::String(s) => Ok(SortValue::Text(s)),
            Value::Null => Ok(SortValue::Null),
            container => Err(Error::UnorderableValue(container.type_name())),
        }
    }

    fn partition(&self) -> u8 {
        match self {
            SortValue::Boolean(_) => 0,
            SortValue::Number(_) => 1,
            SortValue::Text(_) => 2,
            SortValue::Null => 3,
        }
    }

    /// Descending reverses partitions and their contents; nulls stay last.
    fn order(&self, other: &SortValue, ascending: bool) -> Ordering {
        let ordering = match (self, other) {
            (SortValue::Null, SortValue::Null) => return Ordering::Equal,
            (SortValue::Null, _) => return Ordering::Greater,
            (_, SortValue::Null) => return Ordering::Less,
            (SortValue::Boolean(a), SortValue::Boolean(b)) => a.cmp(b),
            (SortValue::Number(a), SortValue::Number(b)) => a.total_cmp(b),
            (SortValue::Text(a), SortValue::Text(b)) => a.cmp(b),
            (a, b) => a.partition().cmp(&b.partition()),
        };
        if ascending {
            ordering
        } else {
            ordering.reverse()
        }
    }
}

#[derive(Debug, Clone)]
enum Accumulator {
    Count(i64),
    Sum(Option<Value>),
    Avg { total: f64, count: i64 },
    Min(Option<Value>),
    Max(Option<Value>),
}

impl Accumulator {
    fn new(function: AggregateFunction) -> Self {
        match function {
            AggregateFunction::Count => Accumulator::Count(0),
            AggregateFunction::Sum => Accumulator::Sum(None),
            AggregateFunction::Avg => Accumulator::Avg { total: 0.0, count: 0 },
            AggregateFunction::Min => Accumulator::Min(None),
            AggregateFunction::Max => Accumulator::Max(None),
        }
    }

    /// Nulls are skipped by every aggregate
    fn update(&mut self, text: &str, value: Value) -> Result<()> {
        if value.is_null() {
            return Ok(());
        }
        let preferred = match self {
            Accumulator::Min(_) => Ordering::Less,
            _ => Ordering::Greater,
        };
        match self {
            Accumulator::Count(n) => *n += 1,
            Accumulator::Sum(total) => {
                let current = total.take().unwrap_or(Value::Integer(0));
                *total = Some(current.add(&value)?);
            }
            Accumulator::Avg { total, count } => {
                let n = value.as_f64().ok_or_else(|| {
                    Error::TypeMismatch(format!("{} expects numbers, got {}", text, value.type_name()))
                })?;
                *total += n;
                *count += 1;
            }
            Accumulator::Min(best) | Accumulator::Max(best) => {
                let keep_new = match best {
                    None => true,
                    Some(current) => {
                        let ordering = value.compare(current).ok_or_else(|| {
                            Error::TypeMismatch(format!(
                                "{} cannot compare {} with {}",
                                text,
                                value.type_name(),
                                current.type_name()
                            ))
                        })?;
                        ordering == preferred
                    }
                };
                if keep_new {
                    *best = Some(value);
                }
            }
        }
        Ok(())
    }

    fn finish(self) -> Value {
        match self {
            Accumulator::Count(n) => Value::Integer(n),
            Accumulator::Sum(total) => total.unwrap_or(Value::Integer(0)),
            Accumulator::Avg { count: 0, .. } => Value::Integer(0),
            Accumulator::Avg { total, count } => Value::Float(total / count as f64),
            Accumulator::Min(best) | Accumulator::Max(best) => best.unwrap_or(Value::Null),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::BinaryOperator;
    use crate::storage::Store;

    fn row(pairs: &[(&str, Value)]) -> Record {
        Record::new(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        )
    }

    fn load(s: &mut dyn Storage, table: &Table, rows: Vec<Record>) -> Result<()> {
        for record in rows {
            table.add_record(s, record, 1)?;
        }
        Ok(())
    }

    fn snapshot() -> Snapshot {
        Snapshot::new(100, Default::default())
    }

    fn field(name: &str) -> Fragment {
        Fragment::Field(name.to_string())
    }

    #[test]
    fn test_scan_copy_and_limit() {
        let store = Store::memory();
        store
            .atomic(|s| {
                let input = Table::new("t");
                load(s, &input, (1..=5).map(|i| row(&[("a", Value::Integer(i))])).collect())?;

                let filtered = Table::new("~100~1");
                let limited = Table::new("~100~2");
                let program = Program::new(
                    vec![
                        Step {
                            stage: "where".to_string(),
                            op: Op::Scan {
                                input: input.clone(),
                                predicate: Fragment::Binary {
                                    op: BinaryOperator::Gt,
                                    left: Box::new(field("a")),
                                    right: Box::new(Fragment::Arg(0)),
                                },
                                action: Action::Copy(filtered.clone()),
                            },
                        },
                        Step {
                            stage: "limit".to_string(),
                            op: Op::Limit {
                                input: filtered,
                                output: limited.clone(),
                                offset: 1,
                                limit: Some(2),
                            },
                        },
                    ],
                    vec![Value::Integer(1)],
                    Some(limited),
                );
                let outcome = program.run(s, &snapshot())?;
                let values: Vec<Value> = outcome.rows.iter().map(|r| r.value_of("a")).collect();
                assert_eq!(values, vec![Value::Integer(3), Value::Integer(4)]);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_order_partitions() {
        let store = Store::memory();
        store
            .atomic(|s| {
                let input = Table::new("~1~1");
                let values = vec![
                    Value::Boolean(true),
                    Value::Integer(3),
                    Value::from("b"),
                    Value::Null,
                    Value::Integer(1),
                    Value::from("a"),
                ];
                for (i, v) in values.into_iter().enumerate() {
                    input.store_record(
                        s,
                        &Record {
                            id: i as i64 + 1,
                            ..row(&[("v", v)])
                        },
                    )?;
                }

                let run = |s: &mut dyn Storage, ascending: bool, output: &str| {
                    let output = Table::new(output);
                    let program = Program::new(
                        vec![Step {
                            stage: "order".to_string(),
                            op: Op::Order {
                                input: input.clone(),
                                output: output.clone(),
                                keys: vec![SortKey {
                                    fragment: field("v"),
                                    ascending,
                                }],
                            },
                        }],
                        vec![],
                        Some(output),
                    );
                    program
                        .run(s, &snapshot())
                        .map(|o| o.rows.iter().map(|r| r.value_of("v").to_string()).collect::<Vec<_>>())
                };

                assert_eq!(run(&mut *s, true, "~1~2")?, vec!["true", "1", "3", "'a'", "'b'", "null"]);
                assert_eq!(run(&mut *s, false, "~1~3")?, vec!["'b'", "'a'", "3", "1", "true", "null"]);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_order_rejects_containers() {
        let store = Store::memory();
        let err = store
            .atomic(|s| {
                let input = Table::new("~1~1");
                input.store_record(
                    s,
                    &Record {
                        id: 1,
                        ..row(&[("v", Value::List(vec![]))])
                    },
                )?;
                let output = Table::new("~1~2");
                Program::new(
                    vec![Step {
                        stage: "order".to_string(),
                        op: Op::Order {
                            input,
                            output: output.clone(),
                            keys: vec![SortKey {
                                fragment: field("v"),
                                ascending: true,
                            }],
                        },
                    }],
                    vec![],
                    Some(output),
                )
                .run(s, &snapshot())
            })
            .unwrap_err();
        assert!(matches!(err, Error::Runtime { op: 0, .. }));
        assert!(err.user_message().contains("list"));
    }

    #[test]
    fn test_group_defaults_on_empty_input() {
        let store = Store::memory();
        store
            .atomic(|s| {
                let output = Table::new("~1~1");
                let aggregates = [
                    ("count(*)", AggregateFunction::Count),
                    ("sum(a)", AggregateFunction::Sum),
                    ("avg(a)", AggregateFunction::Avg),
                    ("min(a)", AggregateFunction::Min),
                    ("max(a)", AggregateFunction::Max),
                ]
                .into_iter()
                .map(|(text, function)| AggregateOp {
                    text: text.to_string(),
                    function,
                    arg: field("a"),
                })
                .collect();
                let program = Program::new(
                    vec![Step {
                        stage: "group".to_string(),
                        op: Op::Group {
                            input: Table::new("~1~0"),
                            output: output.clone(),
                            keys: vec![],
                            aggregates,
                        },
                    }],
                    vec![],
                    Some(output),
                );
                let rows = program.run(s, &snapshot())?.rows;
                assert_eq!(rows.len(), 1);
                assert_eq!(rows[0].value_of("count(*)"), Value::Integer(0));
                assert_eq!(rows[0].value_of("sum(a)"), Value::Integer(0));
                assert_eq!(rows[0].value_of("avg(a)"), Value::Integer(0));
                assert_eq!(rows[0].value_of("min(a)"), Value::Null);
                assert_eq!(rows[0].value_of("max(a)"), Value::Null);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_failed_update_is_undone() {
        let store = Store::memory();
        store
            .atomic(|s| {
                let input = Table::new("t");
                load(
                    s,
                    &input,
                    vec![row(&[("a", Value::Integer(1))]), row(&[("a", Value::Integer(0))])],
                )?;

                // SET a = 1 / a fails on the second record
                let program = Program::new(
                    vec![Step {
                        stage: "where".to_string(),
                        op: Op::Scan {
                            input: input.clone(),
                            predicate: Fragment::Const(Value::Boolean(true)),
                            action: Action::Update(vec![(
                                "a".to_string(),
                                Fragment::Binary {
                                    op: BinaryOperator::Div,
                                    left: Box::new(Fragment::Arg(0)),
                                    right: Box::new(field("a")),
                                },
                            )]),
                        },
                    }],
                    vec![Value::Integer(1)],
                    None,
                );
                assert!(program.run(s, &snapshot()).is_err());

                let records = input.records(s)?;
                assert_eq!(records.len(), 2);
                assert!(records.iter().all(|r| r.xex == 0));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_delete_expires_visible_versions() {
        let store = Store::memory();
        store
            .atomic(|s| {
                let input = Table::new("t");
                load(s, &input, vec![row(&[("a", Value::Integer(1))])])?;
                let program = Program::new(
                    vec![Step {
                        stage: "where".to_string(),
                        op: Op::Scan {
                            input: input.clone(),
                            predicate: Fragment::Const(Value::Boolean(true)),
                            action: Action::Delete,
                        },
                    }],
                    vec![],
                    None,
                );
                let outcome = program.run(s, &snapshot())?;
                assert_eq!(outcome.affected, 1);
                assert_eq!(
                    outcome.undo,
                    vec![UndoAction::Unexpire {
                        table: "t".to_string(),
                        id: 1
                    }]
                );
                assert_eq!(input.get_record(s, 1)?.map(|r| r.xex), Some(100));

                // Already expired: nothing left to delete
                assert_eq!(program.run(s, &snapshot())?.affected, 0);
                Ok(())
            })
            .unwrap();
    }
}
