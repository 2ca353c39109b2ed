//! Version visibility and undo actions

use crate::error::{Error, Result};
use crate::storage::{Record, Storage, Table};
use std::collections::HashSet;

/// What a statement sees: its own transaction id plus the ids that were
/// active when it started.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub xid: i64,
    active: HashSet<i64>,
}

impl Snapshot {
    pub fn new(xid: i64, active: HashSet<i64>) -> Self {
        Self { xid, active }
    }

    pub fn is_active(&self, xid: i64) -> bool {
        self.active.contains(&xid)
    }

    /// Whether any transaction was in flight when the snapshot was taken
    pub fn has_active(&self) -> bool {
        !self.active.is_empty()
    }

    /// A version is visible when its creator is us or finished, and it is
    /// either live or expired by some other transaction still in flight.
    pub fn is_visible(&self, record: &Record) -> bool {
        let created = record.xid == self.xid || !self.is_active(record.xid);
        let live = !record.is_expired() || (record.xex != self.xid && self.is_active(record.xex));
        created && live
    }

    /// Fail if another in-flight transaction already expired this version
    pub fn check_writable(&self, table: &Table, record: &Record) -> Result<()> {
        if record.is_expired() && record.xex != self.xid && self.is_active(record.xex) {
            return Err(Error::WriteConflict {
                table: table.name().to_string(),
                id: record.id,
                xid: record.xex,
            });
        }
        Ok(())
    }
}

/// Reverses one forward write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UndoAction {
    /// Remove a version this transaction inserted
    Purge { table: String, id: i64 },
    /// Revive a version this transaction expired
    Unexpire { table: String, id: i64 },
}

impl UndoAction {
    pub fn apply(&self, s: &mut dyn Storage) -> Result<()> {
        match self {
            UndoAction::Purge { table, id } => Table::new(table.as_str()).purge(s, *id).map(|_| ()),
            UndoAction::Unexpire { table, id } => {
                Table::new(table.as_str()).unexpire(s, *id).map(|_| ())
            }
        }
    }
}

/// Replay undo actions oldest first. Every action is attempted; the first
/// failure is returned.
pub fn replay(s: &mut dyn Storage, actions: &[UndoAction]) -> Result<()> {
    let mut first_error = None;
    for action in actions {
        if let Err(e) = action.apply(s) {
            first_error.get_or_insert(e);
        }
    }
    first_error.map_or(Ok(()), Err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Store, Value};
    use indexmap::IndexMap;

    fn version(xid: i64, xex: i64) -> Record {
        Record {
            id: 1,
            xid,
            xex,
            fields: IndexMap::new(),
        }
    }

    #[test]
    fn test_visibility() {
        let snapshot = Snapshot::new(10, [7, 10].into_iter().collect());

        // Committed creator, live
        assert!(snapshot.is_visible(&version(3, 0)));
        // Our own insert
        assert!(snapshot.is_visible(&version(10, 0)));
        // Someone else's uncommitted insert
        assert!(!snapshot.is_visible(&version(7, 0)));
        // Expired by a finished transaction
        assert!(!snapshot.is_visible(&version(3, 5)));
        // Expired by ourselves
        assert!(!snapshot.is_visible(&version(3, 10)));
        // Expired by someone still in flight
        assert!(snapshot.is_visible(&version(3, 7)));
    }

    #[test]
    fn test_write_conflict() {
        let snapshot = Snapshot::new(10, [7, 10].into_iter().collect());
        let table = Table::new("t");
        assert!(snapshot.check_writable(&table, &version(3, 0)).is_ok());
        assert!(matches!(
            snapshot.check_writable(&table, &version(3, 7)),
            Err(Error::WriteConflict { xid: 7, .. })
        ));
    }

    #[test]
    fn test_undo_reverses_writes() {
        let store = Store::memory();
        store
            .atomic(|s| {
                let table = Table::new("t");
                let mut fields = IndexMap::new();
                fields.insert("a".to_string(), Value::Integer(1));
                let kept = table.add_record(s, Record::new(fields.clone()), 1)?;
                let inserted = table.add_record(s, Record::new(fields), 2)?;
                table.expire(s, kept, 2)?;

                replay(
                    s,
                    &[
                        UndoAction::Purge {
                            table: "t".to_string(),
                            id: inserted,
                        },
                        UndoAction::Unexpire {
                            table: "t".to_string(),
                            id: kept,
                        },
                    ],
                )?;

                let records = table.records(s)?;
                assert_eq!(records.len(), 1);
                assert_eq!(records[0].id, kept);
                assert_eq!(records[0].xex, 0);
                Ok(())
            })
            .unwrap();
    }
}
