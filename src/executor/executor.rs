//! Statement execution
//!
//! A `Database` owns the store and the shared services around it; each
//! client connection gets a `Session` that runs SQL text and produces a
//! serializable `Response`. Query statements plan, compile and run inside a
//! single atomic section of the store.

use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::planner::Planner;
use crate::catalog::{ChangeKind, IndexManager, Notification, NotificationRegistry};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::pipeline::{Outcome, TransientArena};
use crate::sql::{parse_statement, InsertStatement, SelectStatement, Statement, TableRef};
use crate::storage::{Record, Storage, Store, Table, Value};
use crate::transaction::{replay, ConnectionId, TransactionManager, UndoAction};
use crate::vacuum::Vacuum;

/// Capacity of the notification channel per subscriber
const NOTIFICATION_CAPACITY: usize = 256;

/// Result of one statement, as sent to clients
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,
    /// Result rows, user fields only
    pub data: Vec<IndexMap<String, Value>>,
    pub error: Option<String>,
    pub warnings: Vec<String>,
    /// Rows written by INSERT, UPDATE or DELETE
    pub affected_rows: usize,
}

impl Response {
    /// Create a successful response carrying rows
    pub fn rows(data: Vec<IndexMap<String, Value>>) -> Self {
        Self {
            success: true,
            data,
            ..Self::default()
        }
    }

    /// Create a successful response with affected rows count
    pub fn affected(count: usize) -> Self {
        Self {
            success: true,
            affected_rows: count,
            ..Self::default()
        }
    }

    pub fn ok() -> Self {
        Self::affected(0)
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }
}

/// Shared engine state
pub struct Database {
    store: Store,
    transactions: Arc<TransactionManager>,
    vacuum: Arc<Vacuum>,
    notifications: broadcast::Sender<Notification>,
    config: EngineConfig,
}

impl Database {
    pub fn new(store: Store, config: EngineConfig) -> Arc<Self> {
        let transactions = Arc::new(TransactionManager::new(store.clone()));
        let vacuum = Arc::new(
            Vacuum::new(store.clone(), Arc::clone(&transactions))
                .with_batch_size(config.scan_batch_size),
        );
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Arc::new(Self {
            store,
            transactions,
            vacuum,
            notifications,
            config,
        })
    }

    /// A database over a fresh in-memory store with default settings
    pub fn in_memory() -> Arc<Self> {
        Self::new(Store::memory(), EngineConfig::default())
    }

    /// Open a session for one client connection
    pub fn session(self: &Arc<Self>) -> Session {
        let conn = self.transactions.connect();
        debug!(conn, "session opened");
        Session {
            db: Arc::clone(self),
            conn,
            pending: Vec::new(),
        }
    }

    /// Receive change notifications from every session
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn transactions(&self) -> &Arc<TransactionManager> {
        &self.transactions
    }

    pub fn vacuum(&self) -> &Arc<Vacuum> {
        &self.vacuum
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start the background vacuum on the current tokio runtime
    pub fn start_vacuum(&self) -> JoinHandle<()> {
        self.vacuum.spawn(self.config.vacuum_interval())
    }

    /// Plan, compile and run a query statement. Runs inside `Store::atomic`
    /// so the snapshot and the program see the same store.
    fn run_atomic(
        &self,
        s: &mut dyn Storage,
        xid: i64,
        stmt: &Statement,
        arena: &mut TransientArena,
    ) -> Result<Outcome> {
        let snapshot = self.transactions.snapshot(xid);
        let manager = Planner::new(s, &snapshot).plan(stmt)?;
        let program = manager
            .compile(s, arena)?
            .with_batch_size(self.config.scan_batch_size);
        program.run(s, &snapshot)
    }

    fn publish(&self, events: Vec<Notification>) {
        for event in events {
            debug!(name = %event.name, table = %event.table, rows = event.rows, "notify");
            // No receivers is not an error
            let _ = self.notifications.send(event);
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// One client's view of the database
pub struct Session {
    db: Arc<Database>,
    conn: ConnectionId,
    /// Notifications held back until the open transaction commits
    pending: Vec<Notification>,
}

impl Session {
    pub fn connection_id(&self) -> ConnectionId {
        self.conn
    }

    pub fn in_transaction(&self) -> bool {
        self.db.transactions.in_transaction(self.conn)
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Execute one SQL statement. Never fails: errors are reported in the
    /// response.
    pub fn execute(&mut self, sql: &str) -> Response {
        debug!(conn = self.conn, sql, "executing statement");
        let (stmt, parse_warnings) = match parse_statement(sql) {
            Ok(parsed) => parsed,
            Err(e) => return Response::failure(e.user_message()),
        };

        match self.execute_statement(&stmt) {
            Ok(mut response) => {
                response.warnings.splice(0..0, parse_warnings);
                response
            }
            Err(e) => {
                let mut response = Response::failure(e.user_message());
                response.warnings = parse_warnings;
                if aborts_transaction(&e) && self.in_transaction() {
                    match self.rollback() {
                        Ok(_) => response.warnings.push("transaction rolled back".to_string()),
                        Err(rollback_error) => {
                            warn!(conn = self.conn, error = %rollback_error, "rollback after failure failed")
                        }
                    }
                }
                debug!(conn = self.conn, error = %e, "statement failed");
                response
            }
        }
    }

    /// Execute a parsed statement
    pub fn execute_statement(&mut self, stmt: &Statement) -> Result<Response> {
        match stmt {
            Statement::Select(select) => self.execute_select(stmt, select),
            Statement::Insert(insert) => self.execute_insert(insert),
            Statement::Update(update) => {
                check_table_name(&update.table_name)?;
                self.execute_write(stmt, &update.table_name, ChangeKind::Update)
            }
            Statement::Delete(delete) => {
                check_table_name(&delete.table_name)?;
                self.execute_write(stmt, &delete.table_name, ChangeKind::Delete)
            }
            Statement::CreateIndex(create) => {
                check_table_name(&create.table_name)?;
                let index = self.db.store.atomic(|s| {
                    IndexManager::create_index(s, &create.index_name, &create.table_name, &create.field)
                })?;
                debug!(index = %index.name, target = %index.target(), "created index");
                Ok(Response::ok())
            }
            Statement::DropIndex(drop) => {
                if !self.db.store.atomic(|s| IndexManager::drop_index(s, &drop.index_name))? {
                    return Err(Error::IndexNotFound(drop.index_name.clone()));
                }
                Ok(Response::ok())
            }
            Statement::CreateNotification(create) => {
                check_table_name(&create.table_name)?;
                self.db
                    .store
                    .atomic(|s| NotificationRegistry::create(s, &create.name, &create.table_name))?;
                Ok(Response::ok())
            }
            Statement::DropNotification(drop) => {
                if !self.db.store.atomic(|s| NotificationRegistry::drop(s, &drop.name))? {
                    return Err(Error::NotificationNotFound(drop.name.clone()));
                }
                Ok(Response::ok())
            }
            Statement::DropTable(drop) => {
                check_table_name(&drop.table_name)?;
                let table = Table::new(drop.table_name.as_str());
                self.db.store.atomic(|s| {
                    if !drop.if_exists && !table.exists(s)? {
                        return Err(Error::TableNotFound(drop.table_name.clone()));
                    }
                    table.drop(s)
                })?;
                self.db.vacuum.request();
                Ok(Response::ok())
            }
            Statement::StartTransaction => {
                let warning = self.db.transactions.start_transaction(self.conn)?;
                Ok(match warning {
                    Some(warning) => Response::ok().with_warning(warning),
                    None => Response::ok(),
                })
            }
            Statement::Commit => match self.db.transactions.commit(self.conn) {
                Some(_) => {
                    let pending = std::mem::take(&mut self.pending);
                    self.db.publish(pending);
                    self.db.vacuum.request();
                    Ok(Response::ok())
                }
                None => Ok(Response::ok().with_warning("no transaction in progress")),
            },
            Statement::Rollback => match self.rollback()? {
                Some(_) => Ok(Response::ok()),
                None => Ok(Response::ok().with_warning("no transaction in progress")),
            },
            Statement::Explain(inner) => self.explain(inner),
        }
    }

    fn execute_select(&mut self, stmt: &Statement, select: &SelectStatement) -> Result<Response> {
        check_sources(select)?;
        let outcome = self.run_pipeline(stmt)?;
        Ok(Response::rows(
            outcome.rows.into_iter().map(|record| record.fields).collect(),
        ))
    }

    /// UPDATE or DELETE through the pipeline
    fn execute_write(&mut self, stmt: &Statement, table: &str, kind: ChangeKind) -> Result<Response> {
        let outcome = self.run_pipeline(stmt)?;
        let affected = outcome.affected;
        self.finish_write(table, kind, affected, outcome.undo)?;
        Ok(Response::affected(affected))
    }

    fn execute_insert(&mut self, insert: &InsertStatement) -> Result<Response> {
        check_table_name(&insert.table_name)?;
        let xid = self.statement_xid()?;
        let table = Table::new(insert.table_name.as_str());

        let undo = self.db.store.atomic(|s| {
            let mut undo = Vec::with_capacity(insert.rows.len());
            for fields in &insert.rows {
                match table.add_record(s, Record::new(fields.clone()), xid) {
                    Ok(id) => undo.push(UndoAction::Purge {
                        table: insert.table_name.clone(),
                        id,
                    }),
                    Err(e) => {
                        if let Err(undo_error) = replay(s, &undo) {
                            warn!(error = %undo_error, "failed to undo partial insert");
                        }
                        return Err(e);
                    }
                }
            }
            Ok(undo)
        })?;

        let affected = undo.len();
        self.finish_write(&insert.table_name, ChangeKind::Insert, affected, undo)?;
        Ok(Response::affected(affected))
    }

    fn explain(&mut self, inner: &Statement) -> Result<Response> {
        let xid = self.statement_xid()?;
        let transactions = &self.db.transactions;
        let lines = self.db.store.atomic(|s| {
            let snapshot = transactions.snapshot(xid);
            Ok(Planner::new(s, &snapshot).plan(inner)?.explain())
        })?;
        Ok(Response::rows(
            lines
                .into_iter()
                .map(|line| {
                    let mut row = IndexMap::new();
                    row.insert("description".to_string(), Value::String(line));
                    row
                })
                .collect(),
        ))
    }

    /// Plan, compile and run a query statement in one atomic section
    fn run_pipeline(&mut self, stmt: &Statement) -> Result<Outcome> {
        let xid = self.statement_xid()?;
        let mut arena = TransientArena::new(self.db.store.clone(), xid);
        let result = self
            .db
            .store
            .atomic(|s| self.db.run_atomic(s, xid, stmt, &mut arena));

        if let Err(e) = arena.release() {
            warn!(conn = self.conn, error = %e, "failed to release transient tables");
        }
        result
    }

    /// Record undo, queue or send notifications, and wake the vacuum
    fn finish_write(
        &mut self,
        table: &str,
        kind: ChangeKind,
        affected: usize,
        undo: Vec<UndoAction>,
    ) -> Result<()> {
        let in_transaction = self.db.transactions.record(self.conn, undo);
        self.db.vacuum.request();
        if affected == 0 {
            return Ok(());
        }

        let names = self
            .db
            .store
            .atomic(|s| NotificationRegistry::for_table(s, table))?;
        let events: Vec<Notification> = names
            .into_iter()
            .map(|name| Notification {
                name,
                table: table.to_string(),
                action: kind,
                rows: affected,
            })
            .collect();
        if in_transaction {
            self.pending.extend(events);
        } else {
            self.db.publish(events);
        }
        Ok(())
    }

    /// Id the next statement runs under: the open transaction's, or a
    /// fresh one that is never marked active
    fn statement_xid(&self) -> Result<i64> {
        match self.db.transactions.current(self.conn) {
            Some(xid) => Ok(xid),
            None => self.db.transactions.next_id(),
        }
    }

    fn rollback(&mut self) -> Result<Option<i64>> {
        self.pending.clear();
        let rolled_back = self.db.transactions.rollback(self.conn)?;
        if rolled_back.is_some() {
            self.db.vacuum.request();
        }
        Ok(rolled_back)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.in_transaction() {
            match self.rollback() {
                Ok(xid) => debug!(conn = self.conn, ?xid, "rolled back open transaction on close"),
                Err(e) => warn!(conn = self.conn, error = %e, "rollback on close failed"),
            }
        }
        debug!(conn = self.conn, "session closed");
    }
}

/// Failures that leave the open transaction unusable
fn aborts_transaction(e: &Error) -> bool {
    matches!(
        e,
        Error::Runtime { .. }
            | Error::Storage { .. }
            | Error::CorruptRecord { .. }
            | Error::WriteConflict { .. }
    )
}

/// Reject names reserved for transient tables or ambiguous with field paths
fn check_table_name(name: &str) -> Result<()> {
    if name.is_empty() || name.starts_with('~') || name.contains('.') {
        return Err(Error::Plan(format!("invalid table name '{}'", name)));
    }
    Ok(())
}

fn check_sources(select: &SelectStatement) -> Result<()> {
    match &select.from {
        Some(TableRef::Table(name)) => check_table_name(name),
        Some(TableRef::Subquery { query, .. }) => check_sources(query),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(session: &mut Session, sql: &str) -> Response {
        let response = session.execute(sql);
        assert!(response.success, "{} failed: {:?}", sql, response.error);
        response
    }

    #[test]
    fn test_insert_and_select() {
        let db = Database::in_memory();
        let mut session = db.session();
        let response = run(&mut session, "INSERT INTO t {\"a\": 1, \"b\": \"x\"}, {\"a\": 2}");
        assert_eq!(response.affected_rows, 2);

        let response = run(&mut session, "SELECT * FROM t ORDER BY a DESC");
        assert_eq!(response.data.len(), 2);
        assert_eq!(response.data[0].get("a"), Some(&Value::Integer(2)));
        assert!(response.data[0].keys().all(|k| !k.starts_with(':')));
    }

    #[test]
    fn test_parse_warnings_are_reported() {
        let db = Database::in_memory();
        let mut session = db.session();
        let response = run(&mut session, "INSERT INTO t {\"a\": 1, \"a\": 2}");
        assert_eq!(response.warnings, vec!["duplicate key 'a': last value wins".to_string()]);
        let response = run(&mut session, "SELECT a FROM t");
        assert_eq!(response.data[0].get("a"), Some(&Value::Integer(2)));
    }

    #[test]
    fn test_reserved_table_names() {
        let db = Database::in_memory();
        let mut session = db.session();
        assert!(!session.execute("INSERT INTO \"~1~1\" {\"a\": 1}").success);
        assert!(!session.execute("SELECT * FROM \"a.b\"").success);
    }

    #[test]
    fn test_explain() {
        let db = Database::in_memory();
        let mut session = db.session();
        let response = run(&mut session, "EXPLAIN SELECT a FROM t WHERE a > 1 LIMIT 2");
        let lines: Vec<&Value> = response
            .data
            .iter()
            .map(|row| row.get("description").unwrap())
            .collect();
        assert_eq!(
            lines,
            vec![
                &Value::from("scan t where a > 1, copy matches"),
                &Value::from("project a"),
                &Value::from("keep rows 0 to 2"),
            ]
        );
    }

    #[test]
    fn test_runtime_error_rolls_back_transaction() {
        let db = Database::in_memory();
        let mut session = db.session();
        run(&mut session, "INSERT INTO t {\"a\": 1}");
        run(&mut session, "BEGIN");
        run(&mut session, "INSERT INTO t {\"a\": 0}");

        let response = session.execute("SELECT 10 / a FROM t");
        assert!(!response.success);
        assert_eq!(response.warnings, vec!["transaction rolled back".to_string()]);
        assert!(!session.in_transaction());

        let response = run(&mut session, "SELECT * FROM t");
        assert_eq!(response.data.len(), 1);
    }

    #[test]
    fn test_snapshot_sees_transaction_started_after_xid() {
        let db = Database::in_memory();
        let mut other = db.session();

        // The statement id is allocated, then another transaction begins
        // and writes before the statement reaches the store
        let xid = db.transactions.next_id().unwrap();
        run(&mut other, "BEGIN");
        run(&mut other, "INSERT INTO t {\"keep\": 1}");

        let (stmt, _) = parse_statement("DELETE FROM t").unwrap();
        let mut arena = TransientArena::new(db.store.clone(), xid);
        let outcome = db
            .store
            .atomic(|s| db.run_atomic(s, xid, &stmt, &mut arena))
            .unwrap();
        arena.release().unwrap();
        assert_eq!(outcome.affected, 0);

        run(&mut other, "COMMIT");
        let response = run(&mut other, "SELECT keep FROM t");
        assert_eq!(response.data.len(), 1);

        let mut session = db.session();
        run(&mut other, "BEGIN");
        run(&mut other, "INSERT INTO t {\"keep\": 2}");
        let plan = run(&mut session, "EXPLAIN DELETE FROM t");
        assert_eq!(
            plan.data[0].get("description"),
            Some(&Value::from("scan t, expire matches"))
        );
    }

    #[test]
    fn test_drop_missing_objects() {
        let db = Database::in_memory();
        let mut session = db.session();
        assert!(!session.execute("DROP INDEX nope").success);
        assert!(!session.execute("DROP NOTIFICATION nope").success);
        assert!(!session.execute("DROP TABLE nope").success);
        run(&mut session, "DROP TABLE IF EXISTS nope");
    }
}
