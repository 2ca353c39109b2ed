//! Query Planner
//!
//! Turns SELECT, UPDATE and DELETE statements into jobs of pipeline stages.
//! The planner only reads the catalog; it never touches table data.

use tracing::debug;

use super::optimizer::{is_impossible, select_index};
use crate::error::{Error, Result};
use crate::pipeline::{
    ExpressionStage, GroupStage, ImpossibleWhereStage, IndexStage, Job, JobInput, LimitStage,
    NoTableStage, OrderStage, StageAction, StageManager, TruncateStage, WhereStage, MAIN_JOB,
};
use crate::sql::{
    DeleteStatement, Expr, OrderByItem, SelectStatement, Statement, TableRef, UpdateStatement,
};
use crate::storage::Storage;
use crate::transaction::Snapshot;

/// Query planner
pub struct Planner<'a> {
    storage: &'a dyn Storage,
    snapshot: &'a Snapshot,
}

impl<'a> Planner<'a> {
    /// Create a new planner
    pub fn new(storage: &'a dyn Storage, snapshot: &'a Snapshot) -> Self {
        Self { storage, snapshot }
    }

    /// Plan a statement
    pub fn plan(&self, stmt: &Statement) -> Result<StageManager> {
        let manager = match stmt {
            Statement::Select(select) => self.plan_select(select)?,
            Statement::Update(update) => self.plan_update(update)?,
            Statement::Delete(delete) => self.plan_delete(delete)?,
            Statement::Explain(inner) => self.plan(inner)?,
            other => {
                return Err(Error::Plan(format!(
                    "statement has no query plan: {:?}",
                    other
                )))
            }
        };
        debug!(plan = ?manager.explain(), "planned statement");
        Ok(manager)
    }

    pub fn plan_select(&self, select: &SelectStatement) -> Result<StageManager> {
        let mut manager = StageManager::new();
        self.plan_query(&mut manager, MAIN_JOB, select)?;
        Ok(manager)
    }

    pub fn plan_update(&self, update: &UpdateStatement) -> Result<StageManager> {
        let mut job = Job::new(MAIN_JOB, JobInput::Table(update.table_name.clone()));
        self.plan_source(
            &mut job,
            &update.table_name,
            true,
            update.where_clause.as_ref(),
            StageAction::Update(update.assignments.clone()),
        )?;
        let mut manager = StageManager::new();
        manager.add_job(job);
        Ok(manager)
    }

    pub fn plan_delete(&self, delete: &DeleteStatement) -> Result<StageManager> {
        let mut job = Job::new(MAIN_JOB, JobInput::Table(delete.table_name.clone()));
        if delete.where_clause.is_none() && !self.snapshot.has_active() {
            job.push(TruncateStage::new(delete.table_name.as_str()));
        } else {
            self.plan_source(
                &mut job,
                &delete.table_name,
                true,
                delete.where_clause.as_ref(),
                StageAction::Delete,
            )?;
        }
        let mut manager = StageManager::new();
        manager.add_job(job);
        Ok(manager)
    }

    /// Add the jobs of `select` to `manager`, subqueries first, with the
    /// final job named `name`
    fn plan_query(&self, manager: &mut StageManager, name: &str, select: &SelectStatement) -> Result<()> {
        let mut job = match &select.from {
            None => {
                let mut job = Job::new(name, JobInput::Nothing);
                job.push(NoTableStage);
                if let Some(predicate) = &select.where_clause {
                    job.push(WhereStage::new("row", Some(predicate.clone()), StageAction::Copy));
                }
                job
            }
            Some(TableRef::Table(table)) => {
                let mut job = Job::new(name, JobInput::Table(table.clone()));
                if !self.plan_source(&mut job, table, true, select.where_clause.as_ref(), StageAction::Copy)? {
                    manager.add_job(job);
                    return Ok(());
                }
                job
            }
            Some(TableRef::Subquery { query, alias }) => {
                self.plan_query(manager, alias, query)?;
                let mut job = Job::new(name, JobInput::Job(alias.clone()));
                if !self.plan_source(&mut job, alias, false, select.where_clause.as_ref(), StageAction::Copy)? {
                    manager.add_job(job);
                    return Ok(());
                }
                job
            }
        };

        let order_by = self.resolve_order_aliases(select);

        let grouped = !select.group_by.is_empty()
            || select.has_aggregates()
            || order_by.iter().any(|item| item.expr.is_aggregate());
        if grouped {
            let sources = select
                .columns
                .iter()
                .chain(order_by.iter().map(|item| &item.expr));
            job.push(GroupStage::new(select.group_by.clone(), sources));
        }

        if !order_by.is_empty() {
            job.push(OrderStage::new(order_by));
        }

        if !select.selects_all() {
            job.push(ExpressionStage::new(select.columns.clone()));
        }

        if select.limit.is_some() || select.offset.is_some() {
            job.push(LimitStage::new(select.limit, select.offset));
        }

        manager.add_job(job);
        Ok(())
    }

    /// Add the stage reading the job input. Returns false when the predicate
    /// can never hold and nothing else should run.
    fn plan_source(
        &self,
        job: &mut Job,
        source: &str,
        permanent: bool,
        predicate: Option<&Expr>,
        action: StageAction,
    ) -> Result<bool> {
        let Some(predicate) = predicate else {
            job.push(WhereStage::new(source, None, action));
            return Ok(true);
        };

        if is_impossible(predicate) {
            debug!(source, predicate = %predicate, "predicate is never true");
            job.push(ImpossibleWhereStage::new(predicate.clone(), action));
            return Ok(false);
        }

        if permanent {
            if let Some(choice) = select_index(self.storage, source, predicate)? {
                job.push(IndexStage::new(choice.index, choice.value, predicate.clone(), action));
                return Ok(true);
            }
        }

        job.push(WhereStage::new(source, Some(predicate.clone()), action));
        Ok(true)
    }

    /// ORDER BY keys naming a select-list alias sort by the aliased
    /// expression, since sorting runs before projection
    fn resolve_order_aliases(&self, select: &SelectStatement) -> Vec<OrderByItem> {
        select
            .order_by
            .iter()
            .map(|item| {
                let expr = match &item.expr {
                    Expr::Identifier(name) => select
                        .columns
                        .iter()
                        .find_map(|column| match column {
                            Expr::Alias { expr, name: alias } if alias == name => Some(expr.as_ref().clone()),
                            _ => None,
                        })
                        .unwrap_or_else(|| item.expr.clone()),
                    other => other.clone(),
                };
                OrderByItem {
                    expr,
                    ascending: item.ascending,
                }
            })
            .collect()
    }
}
