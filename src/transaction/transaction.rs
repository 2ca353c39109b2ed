//! Transaction Manager
//!
//! Hands out transaction ids, tracks which connection is inside a
//! transaction, and keeps each transaction's undo log.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::mvcc::{replay, Snapshot, UndoAction};
use crate::error::Result;
use crate::storage::Store;

/// Counter behind transaction ids. Living in the store keeps ids unique
/// across restarts of the process.
pub const XID_SEQUENCE: &str = "seq::xid";

/// Identifies one client connection
pub type ConnectionId = u64;

/// Transaction Context
#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: i64,
    /// Undo actions, oldest first
    pub undo_log: Vec<UndoAction>,
}

#[derive(Debug, Default)]
struct State {
    next_connection: ConnectionId,
    /// Open transaction per connection
    transactions: HashMap<ConnectionId, Transaction>,
    /// Ids whose rollback is still being replayed; they stay active
    rolling_back: HashSet<i64>,
}

/// Transaction Manager
///
/// One instance per store, shared by every connection. The store is never
/// locked while the mutex is held; statements take their snapshot with the
/// store already locked.
#[derive(Debug)]
pub struct TransactionManager {
    store: Store,
    state: Mutex<State>,
}

impl TransactionManager {
    /// Create a new transaction manager
    pub fn new(store: Store) -> Self {
        Self {
            store,
            state: Mutex::new(State::default()),
        }
    }

    /// Register a connection
    pub fn connect(&self) -> ConnectionId {
        let mut state = self.state.lock();
        state.next_connection += 1;
        state.next_connection
    }

    /// Allocate a fresh transaction id. Ids are never reused.
    pub fn next_id(&self) -> Result<i64> {
        self.store.atomic(|s| s.increment(XID_SEQUENCE))
    }

    /// Begin a transaction on `conn`. Returns a warning instead when one is
    /// already open.
    pub fn start_transaction(&self, conn: ConnectionId) -> Result<Option<String>> {
        if let Some(xid) = self.current(conn) {
            return Ok(Some(format!("transaction {} already in progress", xid)));
        }
        let xid = self.next_id()?;
        self.state.lock().transactions.insert(
            conn,
            Transaction {
                id: xid,
                undo_log: Vec::new(),
            },
        );
        debug!(conn, xid, "started transaction");
        Ok(None)
    }

    /// Id of the transaction open on `conn`
    pub fn current(&self, conn: ConnectionId) -> Option<i64> {
        self.state.lock().transactions.get(&conn).map(|t| t.id)
    }

    pub fn in_transaction(&self, conn: ConnectionId) -> bool {
        self.state.lock().transactions.contains_key(&conn)
    }

    /// Append undo actions to the open transaction. Returns false when the
    /// connection is not in a transaction.
    pub fn record(&self, conn: ConnectionId, actions: Vec<UndoAction>) -> bool {
        match self.state.lock().transactions.get_mut(&conn) {
            Some(transaction) => {
                transaction.undo_log.extend(actions);
                true
            }
            None => false,
        }
    }

    /// Commit the open transaction, discarding its undo log. Returns the
    /// committed id, or `None` when there was nothing to commit.
    pub fn commit(&self, conn: ConnectionId) -> Option<i64> {
        let transaction = self.state.lock().transactions.remove(&conn)?;
        debug!(conn, xid = transaction.id, "committed transaction");
        Some(transaction.id)
    }

    /// Roll back the open transaction: the connection becomes idle at once,
    /// the undo log is replayed oldest first, and only then does the id
    /// leave the active set. Returns the rolled back id.
    pub fn rollback(&self, conn: ConnectionId) -> Result<Option<i64>> {
        let transaction = {
            let mut state = self.state.lock();
            let Some(transaction) = state.transactions.remove(&conn) else {
                return Ok(None);
            };
            state.rolling_back.insert(transaction.id);
            transaction
        };

        let result = self
            .store
            .atomic(|s| replay(s, &transaction.undo_log));

        self.state.lock().rolling_back.remove(&transaction.id);

        match result {
            Ok(()) => {
                debug!(
                    conn,
                    xid = transaction.id,
                    undone = transaction.undo_log.len(),
                    "rolled back transaction"
                );
                Ok(Some(transaction.id))
            }
            Err(e) => {
                warn!(conn, xid = transaction.id, error = %e, "rollback replay failed");
                Err(e)
            }
        }
    }

    /// Ids that are open or still rolling back
    pub fn active_transaction_ids(&self) -> HashSet<i64> {
        let state = self.state.lock();
        state
            .transactions
            .values()
            .map(|t| t.id)
            .chain(state.rolling_back.iter().copied())
            .collect()
    }

    /// Check if transaction is active
    pub fn is_active(&self, xid: i64) -> bool {
        let state = self.state.lock();
        state.rolling_back.contains(&xid) || state.transactions.values().any(|t| t.id == xid)
    }

    /// Visibility snapshot for a statement running under `xid`
    pub fn snapshot(&self, xid: i64) -> Snapshot {
        Snapshot::new(xid, self.active_transaction_ids())
    }
}
