//! Stage manager
//!
//! A statement plans into one or more named jobs. Each job is an input plus
//! an ordered list of stages; the output of one stage is the input of the
//! next. A job can read another job's output, which is how subqueries in
//! FROM are run. The job named `main` goes last and holds the result.

use std::collections::HashMap;

use tracing::debug;

use super::program::{Program, Step};
use super::stage::Stage;
use crate::error::{Error, Result};
use crate::storage::{Storage, Store, Table, TransientTable};

/// Name of the job whose output is the statement result
pub const MAIN_JOB: &str = "main";

/// Owns every transient table allocated while compiling one statement.
///
/// Tables are released together once the statement is over. Anything left
/// unreleased is dropped on a best-effort basis and otherwise collected by
/// the vacuum.
#[derive(Debug)]
pub struct TransientArena {
    store: Store,
    xid: i64,
    tables: Vec<TransientTable>,
}

impl TransientArena {
    pub fn new(store: Store, xid: i64) -> Self {
        Self {
            store,
            xid,
            tables: Vec::new(),
        }
    }

    /// Allocate a table from inside an atomic section
    pub fn allocate(&mut self, s: &mut dyn Storage) -> Result<Table> {
        let transient = TransientTable::create(s, &self.store, self.xid)?;
        let table = transient.table().clone();
        self.tables.push(transient);
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Delete every table. Must be called outside any atomic section.
    pub fn release(self) -> Result<()> {
        let mut first_error = None;
        for table in self.tables {
            if let Err(e) = table.release() {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Where a job reads from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobInput {
    /// A permanent table
    Table(String),
    /// The output of an earlier job
    Job(String),
    /// No input; the first stage produces one
    Nothing,
}

#[derive(Debug)]
pub struct Job {
    pub name: String,
    pub input: JobInput,
    pub stages: Vec<Box<dyn Stage>>,
}

impl Job {
    pub fn new(name: impl Into<String>, input: JobInput) -> Self {
        Self {
            name: name.into(),
            input,
            stages: Vec::new(),
        }
    }

    pub fn push(&mut self, stage: impl Stage + 'static) {
        self.stages.push(Box::new(stage));
    }
}

/// Ordered collection of jobs for one statement
#[derive(Debug, Default)]
pub struct StageManager {
    jobs: Vec<Job>,
}

impl StageManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_job(&mut self, job: Job) {
        self.jobs.push(job);
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    /// One line per stage, in execution order
    pub fn explain(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for job in &self.jobs {
            for stage in &job.stages {
                if job.name == MAIN_JOB {
                    lines.push(stage.explain());
                } else {
                    lines.push(format!("{}: {}", job.name, stage.explain()));
                }
            }
        }
        lines
    }

    /// Compile every job into one program. Argument positions are threaded
    /// through all stages of all jobs so they share one argument list.
    pub fn compile(&self, s: &mut dyn Storage, arena: &mut TransientArena) -> Result<Program> {
        let mut outputs: HashMap<&str, Option<Table>> = HashMap::new();
        let mut steps = Vec::new();
        let mut args = Vec::new();
        let mut offset = 0;
        let mut result = None;

        for job in &self.jobs {
            let mut current = match &job.input {
                JobInput::Table(name) => Some(Table::new(name.as_str())),
                JobInput::Job(name) => outputs
                    .get(name.as_str())
                    .cloned()
                    .ok_or_else(|| Error::Internal(format!("job '{}' runs before its input '{}'", job.name, name)))?,
                JobInput::Nothing => None,
            };

            for stage in &job.stages {
                let compilation = stage.compile(s, arena, current.as_ref(), offset)?;
                offset = compilation.offset;
                args.extend(compilation.args);
                if let Some(op) = compilation.op {
                    steps.push(Step {
                        stage: format!("{}/{}", job.name, stage.name()),
                        op,
                    });
                }
                current = compilation.output;
            }

            outputs.insert(job.name.as_str(), current.clone());
            result = current;
        }

        debug!(steps = steps.len(), args = args.len(), "compiled program");
        Ok(Program::new(steps, args, result))
    }
}
