//! Index directory and lifecycle
//!
//! Registrations live in the store as members `<name>\t<table>.<field>` of
//! the sorted collection `catalog:indexes`, so they are shared by every
//! connection and survive as long as the store does.

use super::index::Index;
use crate::error::{Error, Result};
use crate::storage::{Storage, Table};
use tracing::{debug, info};

pub const INDEX_DIRECTORY: &str = "catalog:indexes";

const SEPARATOR: char = '\t';

/// Creates, finds and drops secondary indexes
pub struct IndexManager;

impl IndexManager {
    /// Create an index and backfill it from every stored version of the
    /// table. The directory entry is written last, so a half-built index is
    /// never visible to the planner.
    pub fn create_index(s: &mut dyn Storage, name: &str, table: &str, field: &str) -> Result<Index> {
        if Self::get_index(s, name)?.is_some() {
            return Err(Error::IndexAlreadyExists(name.to_string()));
        }

        let index = Index::new(name, table, field);
        // Leftovers from an interrupted build
        index.clear(s)?;

        let records = Table::new(table).records(s)?;
        for record in &records {
            index.add_record(s, &record.value_of(field), record.id)?;
        }

        s.add(INDEX_DIRECTORY, 0.0, &Self::entry(&index))?;
        info!(index = name, target = %index.target(), backfilled = records.len(), "created index");
        Ok(index)
    }

    /// Remove an index's structures and directory entry. Returns whether it
    /// was registered.
    pub fn drop_index(s: &mut dyn Storage, name: &str) -> Result<bool> {
        let Some(index) = Self::get_index(s, name)? else {
            return Ok(false);
        };
        index.clear(s)?;
        s.remove_member(INDEX_DIRECTORY, &Self::entry(&index))?;
        debug!(index = name, "dropped index");
        Ok(true)
    }

    /// Get an index by name
    pub fn get_index(s: &dyn Storage, name: &str) -> Result<Option<Index>> {
        let prefix = format!("{}{}", name, SEPARATOR);
        Ok(s
            .range_by_prefix(INDEX_DIRECTORY, &prefix)?
            .iter()
            .find_map(|entry| Self::parse(entry)))
    }

    /// Every index whose target is prefixed `table.`
    pub fn get_indexes_for_table(s: &dyn Storage, table: &str) -> Result<Vec<Index>> {
        Ok(Self::list_indexes(s)?
            .into_iter()
            .filter(|index| index.table == table)
            .collect())
    }

    /// The index registered on exactly `table.field`, if any
    pub fn find_index(s: &dyn Storage, table: &str, field: &str) -> Result<Option<Index>> {
        Ok(Self::get_indexes_for_table(s, table)?
            .into_iter()
            .find(|index| index.field == field))
    }

    /// List all registered indexes
    pub fn list_indexes(s: &dyn Storage) -> Result<Vec<Index>> {
        Ok(s
            .range_by_score(INDEX_DIRECTORY, f64::NEG_INFINITY, f64::INFINITY, None)?
            .iter()
            .filter_map(|entry| Self::parse(entry))
            .collect())
    }

    fn entry(index: &Index) -> String {
        format!("{}{}{}", index.name, SEPARATOR, index.target())
    }

    fn parse(entry: &str) -> Option<Index> {
        let (name, target) = entry.split_once(SEPARATOR)?;
        let (table, field) = target.split_once('.')?;
        Some(Index::new(name, table, field))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Record, Store, Value};
    use indexmap::IndexMap;

    fn insert(s: &mut dyn Storage, table: &str, field: &str, value: Value) -> Result<i64> {
        let mut fields = IndexMap::new();
        fields.insert(field.to_string(), value);
        Table::new(table).add_record(s, Record::new(fields), 1)
    }

    #[test]
    fn test_create_backfills() {
        let store = Store::memory();
        store
            .atomic(|s| {
                insert(s, "t", "foo", Value::Integer(1))?;
                insert(s, "t", "bar", Value::Integer(2))?;
                let index = IndexManager::create_index(s, "idx", "t", "foo")?;

                assert_eq!(index.lookup_exact(s, &Value::Integer(1))?, vec![1]);
                // A record without the field is indexed as null
                assert_eq!(index.lookup_exact(s, &Value::Null)?, vec![2]);

                // Later inserts are maintained by the table
                insert(s, "t", "foo", Value::Integer(1))?;
                assert_eq!(index.lookup_exact(s, &Value::Integer(1))?, vec![1, 3]);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_name_conflict() {
        let store = Store::memory();
        store
            .atomic(|s| {
                IndexManager::create_index(s, "idx", "t", "foo")?;
                let err = IndexManager::create_index(s, "idx", "u", "bar").unwrap_err();
                assert!(matches!(err, Error::IndexAlreadyExists(_)));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_directory_lookups() {
        let store = Store::memory();
        store
            .atomic(|s| {
                IndexManager::create_index(s, "a", "t", "foo")?;
                IndexManager::create_index(s, "b", "t", "x.y")?;
                IndexManager::create_index(s, "c", "tt", "foo")?;

                let names: Vec<String> = IndexManager::get_indexes_for_table(s, "t")?
                    .into_iter()
                    .map(|i| i.name)
                    .collect();
                assert_eq!(names, vec!["a", "b"]);
                assert_eq!(IndexManager::find_index(s, "t", "x.y")?.map(|i| i.name), Some("b".to_string()));
                assert!(IndexManager::find_index(s, "t", "bar")?.is_none());

                assert!(IndexManager::drop_index(s, "a")?);
                assert!(!IndexManager::drop_index(s, "a")?);
                assert!(IndexManager::find_index(s, "t", "foo")?.is_none());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_drop_table_drops_indexes() {
        let store = Store::memory();
        store
            .atomic(|s| {
                insert(s, "t", "foo", Value::Integer(1))?;
                IndexManager::create_index(s, "idx", "t", "foo")?;
                Table::new("t").drop(s)?;
                assert!(IndexManager::list_indexes(s)?.is_empty());
                Ok(())
            })
            .unwrap();
    }
}
