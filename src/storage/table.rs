//! Table storage for KVSQL
//!
//! A table is a sorted collection under `table:<name>` whose members are
//! JSON records scored by record id, plus a record-id counter under
//! `seq:<name>`. Transient tables are named `~<xid>~<n>` and belong to the
//! single pipeline run that created them.

use super::record::Record;
use super::{Storage, Store, SEQUENCE_PREFIX, TABLE_PREFIX};
use crate::catalog::{IndexManager, NotificationRegistry};
use crate::error::Result;
use std::collections::VecDeque;
use tracing::{debug, warn};

/// Records fetched per store round trip when iterating
pub const DEFAULT_BATCH_SIZE: usize = 128;

/// Counter behind transient table names
pub const TRANSIENT_SEQUENCE: &str = "seq::transient";

const TRANSIENT_MARKER: char = '~';

/// A logical table, permanent or transient
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    name: String,
}

impl Table {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Get table name
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data_key(&self) -> String {
        format!("{}{}", TABLE_PREFIX, self.name)
    }

    pub fn sequence_key(&self) -> String {
        format!("{}{}", SEQUENCE_PREFIX, self.name)
    }

    pub fn is_transient(&self) -> bool {
        self.name.starts_with(TRANSIENT_MARKER)
    }

    /// Allocate the next record id
    pub fn next_record_id(&self, s: &mut dyn Storage) -> Result<i64> {
        s.increment(&self.sequence_key())
    }

    /// Stamp a new record version with a fresh id and the creating
    /// transaction, store it, and add it to every index on the table.
    pub fn add_record(&self, s: &mut dyn Storage, mut record: Record, xid: i64) -> Result<i64> {
        let id = self.next_record_id(s)?;
        record.id = id;
        record.xid = xid;
        record.xex = 0;
        self.store_record(s, &record)?;

        if !self.is_transient() {
            for index in IndexManager::get_indexes_for_table(s, &self.name)? {
                index.add_record(s, &record.value_of(&index.field), id)?;
            }
        }
        Ok(id)
    }

    /// Store a record exactly as given, id and system fields included
    pub fn store_record(&self, s: &mut dyn Storage, record: &Record) -> Result<()> {
        s.add(&self.data_key(), record.id as f64, &record.to_member())?;
        Ok(())
    }

    pub fn get_record(&self, s: &dyn Storage, id: i64) -> Result<Option<Record>> {
        let key = self.data_key();
        match s.range_by_score(&key, id as f64, id as f64, Some(1))?.first() {
            Some(member) => Ok(Some(Record::from_member(&key, member)?)),
            None => Ok(None),
        }
    }

    /// Remove the element whose score is `id`
    pub fn delete_record(&self, s: &mut dyn Storage, id: i64) -> Result<bool> {
        Ok(s.remove_by_score(&self.data_key(), id as f64, id as f64)? > 0)
    }

    /// Rewrite a stored record in place
    pub fn replace_record(&self, s: &mut dyn Storage, record: &Record) -> Result<()> {
        self.delete_record(s, record.id)?;
        self.store_record(s, record)
    }

    /// Mark a version as expired by `xid`. Returns the record as it was
    /// before, or `None` if it no longer exists.
    pub fn expire(&self, s: &mut dyn Storage, id: i64, xid: i64) -> Result<Option<Record>> {
        let Some(record) = self.get_record(s, id)? else {
            return Ok(None);
        };
        let expired = Record {
            xex: xid,
            ..record.clone()
        };
        self.replace_record(s, &expired)?;
        Ok(Some(record))
    }

    /// Clear the expiration marker of a version
    pub fn unexpire(&self, s: &mut dyn Storage, id: i64) -> Result<bool> {
        match self.get_record(s, id)? {
            Some(record) => {
                self.replace_record(s, &Record { xex: 0, ..record })?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Physically remove a version and its index entries
    pub fn purge(&self, s: &mut dyn Storage, id: i64) -> Result<bool> {
        let Some(record) = self.get_record(s, id)? else {
            return Ok(false);
        };
        for index in IndexManager::get_indexes_for_table(s, &self.name)? {
            index.remove_record(s, &record.value_of(&index.field), id)?;
        }
        self.delete_record(s, id)
    }

    /// Lazy iteration over records in id order
    pub fn iterate<'a>(&self, s: &'a dyn Storage) -> RecordCursor<'a> {
        self.iterate_with(s, DEFAULT_BATCH_SIZE)
    }

    /// Like `iterate`, reading `batch_size` records per store round trip
    pub fn iterate_with<'a>(&self, s: &'a dyn Storage, batch_size: usize) -> RecordCursor<'a> {
        RecordCursor::new(s, self.data_key(), batch_size)
    }

    /// Every stored record, in id order
    pub fn records(&self, s: &dyn Storage) -> Result<Vec<Record>> {
        self.iterate(s).collect()
    }

    /// Up to `limit` records with an id greater than `after`
    pub fn read_batch(&self, s: &dyn Storage, after: i64, limit: usize) -> Result<Vec<Record>> {
        let key = self.data_key();
        s.range_by_score(&key, (after + 1) as f64, f64::INFINITY, Some(limit))?
            .iter()
            .map(|member| Record::from_member(&key, member))
            .collect()
    }

    pub fn exists(&self, s: &dyn Storage) -> Result<bool> {
        Ok(!s
            .range_by_score(&self.data_key(), f64::NEG_INFINITY, f64::INFINITY, Some(1))?
            .is_empty())
    }

    /// Remove all records, keeping the id counter
    pub fn truncate(&self, s: &mut dyn Storage) -> Result<usize> {
        s.remove_by_score(&self.data_key(), f64::NEG_INFINITY, f64::INFINITY)
    }

    /// Remove the data and the id counter only
    pub fn drop_storage(&self, s: &mut dyn Storage) -> Result<bool> {
        let existed = s.delete(&self.data_key())?;
        s.delete(&self.sequence_key())?;
        Ok(existed)
    }

    /// Drop the table: data, id counter, and every index and notification
    /// registered against it. Returns whether any data existed.
    pub fn drop(&self, s: &mut dyn Storage) -> Result<bool> {
        let existed = self.drop_storage(s)?;
        if !self.is_transient() {
            for index in IndexManager::get_indexes_for_table(s, &self.name)? {
                IndexManager::drop_index(s, &index.name)?;
            }
            NotificationRegistry::drop_for_table(s, &self.name)?;
        }
        debug!(table = %self.name, existed, "dropped table");
        Ok(existed)
    }
}

/// Transaction id embedded in a transient table name
pub fn transient_owner(name: &str) -> Option<i64> {
    let rest = name.strip_prefix(TRANSIENT_MARKER)?;
    let (xid, seq) = rest.split_once(TRANSIENT_MARKER)?;
    seq.parse::<u64>().ok()?;
    xid.parse().ok()
}

/// Batched cursor over a table's records in id order. Each refill reads
/// from the store starting after the last id seen.
pub struct RecordCursor<'a> {
    storage: &'a dyn Storage,
    key: String,
    after: i64,
    batch_size: usize,
    buffer: VecDeque<Record>,
    exhausted: bool,
}

impl<'a> RecordCursor<'a> {
    fn new(storage: &'a dyn Storage, key: String, batch_size: usize) -> Self {
        Self {
            storage,
            key,
            after: i64::MIN,
            batch_size: batch_size.max(1),
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    fn refill(&mut self) -> Result<()> {
        let min = if self.after == i64::MIN {
            f64::NEG_INFINITY
        } else {
            (self.after + 1) as f64
        };
        let members =
            self.storage
                .range_by_score(&self.key, min, f64::INFINITY, Some(self.batch_size))?;
        if members.len() < self.batch_size {
            self.exhausted = true;
        }
        for member in members {
            let record = Record::from_member(&self.key, &member)?;
            self.after = record.id;
            self.buffer.push_back(record);
        }
        Ok(())
    }
}

impl Iterator for RecordCursor<'_> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.refill() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

/// A pipeline-scoped table that is deleted exactly once when its owner lets
/// go of it, whether through `release` or by being dropped.
#[derive(Debug)]
pub struct TransientTable {
    table: Table,
    store: Store,
    released: bool,
}

impl TransientTable {
    /// Allocate a fresh transient table owned by transaction `xid`
    pub fn create(s: &mut dyn Storage, store: &Store, xid: i64) -> Result<Self> {
        let seq = s.increment(TRANSIENT_SEQUENCE)?;
        let table = Table::new(format!("{m}{}{m}{}", xid, seq, m = TRANSIENT_MARKER));
        debug!(table = %table.name(), "allocated transient table");
        Ok(Self {
            table,
            store: store.clone(),
            released: false,
        })
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    /// Delete the table. Must not be called from inside an atomic section
    /// on the same store.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        let table = self.table.clone();
        self.store.atomic(|s| table.drop_storage(s)).map(|_| ())
    }
}

impl Drop for TransientTable {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let table = &self.table;
        match self.store.try_atomic(|s| table.drop_storage(s)) {
            Some(Ok(_)) => {}
            Some(Err(e)) => warn!(table = %table.name(), error = %e, "failed to release transient table"),
            // Store busy: the name carries its owner's xid, so the vacuum
            // collects it once that transaction is over.
            None => debug!(table = %table.name(), "transient table left for vacuum"),
        }
    }
}
