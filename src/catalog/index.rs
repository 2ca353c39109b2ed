//! Secondary index structures
//!
//! Each index owns two sorted collections:
//! - `index:<name>:num` holds numeric values: score = value, member = id.
//! - `index:<name>:str` holds everything else: score = id, member =
//!   `<tag><value>:<id>` with tag N (null), T (true), F (false), S (string).
//!
//! Lists and maps are not indexed; they never equal a scalar lookup value.

use crate::error::Result;
use crate::storage::{Storage, Value};

/// Where a value lives in an index
#[derive(Debug, Clone, PartialEq)]
pub enum IndexKey {
    /// Numeric structure, by score
    Numeric(f64),
    /// Non-numeric structure, by member prefix (tag plus value plus ':')
    Tagged(String),
    /// Not indexable
    Unindexed,
}

impl IndexKey {
    pub fn encode(value: &Value) -> IndexKey {
        match value {
            Value::Integer(_) | Value::Float(_) => match value.as_f64() {
                Some(n) if !n.is_nan() => IndexKey::Numeric(n),
                _ => IndexKey::Unindexed,
            },
            Value::Null => IndexKey::Tagged("N:".to_string()),
            Value::Boolean(true) => IndexKey::Tagged("T:".to_string()),
            Value::Boolean(false) => IndexKey::Tagged("F:".to_string()),
            Value::String(s) => IndexKey::Tagged(format!("S{}:", s)),
            Value::List(_) | Value::Map(_) => IndexKey::Unindexed,
        }
    }
}

/// A secondary index on one field of one table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Index {
    pub name: String,
    pub table: String,
    pub field: String,
}

impl Index {
    pub fn new(name: impl Into<String>, table: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            field: field.into(),
        }
    }

    pub fn numeric_key(&self) -> String {
        format!("index:{}:num", self.name)
    }

    pub fn text_key(&self) -> String {
        format!("index:{}:str", self.name)
    }

    /// `table.field`, as registered in the directory
    pub fn target(&self) -> String {
        format!("{}.{}", self.table, self.field)
    }

    pub fn add_record(&self, s: &mut dyn Storage, value: &Value, id: i64) -> Result<()> {
        match IndexKey::encode(value) {
            IndexKey::Numeric(score) => {
                s.add(&self.numeric_key(), score, &id.to_string())?;
            }
            IndexKey::Tagged(prefix) => {
                s.add(&self.text_key(), id as f64, &format!("{}{}", prefix, id))?;
            }
            IndexKey::Unindexed => {}
        }
        Ok(())
    }

    pub fn remove_record(&self, s: &mut dyn Storage, value: &Value, id: i64) -> Result<()> {
        match IndexKey::encode(value) {
            IndexKey::Numeric(_) => {
                s.remove_member(&self.numeric_key(), &id.to_string())?;
            }
            IndexKey::Tagged(prefix) => {
                s.remove_member(&self.text_key(), &format!("{}{}", prefix, id))?;
            }
            IndexKey::Unindexed => {}
        }
        Ok(())
    }

    /// Ids of every indexed version whose field equals `value`
    pub fn lookup_exact(&self, s: &dyn Storage, value: &Value) -> Result<Vec<i64>> {
        let mut ids: Vec<i64> = match IndexKey::encode(value) {
            IndexKey::Numeric(score) => s
                .range_by_score(&self.numeric_key(), score, score, None)?
                .iter()
                .filter_map(|member| member.parse().ok())
                .collect(),
            IndexKey::Tagged(prefix) => s
                .range_by_prefix(&self.text_key(), &prefix)?
                .iter()
                .filter_map(|member| {
                    let rest = &member[prefix.len()..];
                    if !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()) {
                        rest.parse().ok()
                    } else {
                        None
                    }
                })
                .collect(),
            IndexKey::Unindexed => Vec::new(),
        };
        ids.sort_unstable();
        Ok(ids)
    }

    /// Remove both physical structures
    pub fn clear(&self, s: &mut dyn Storage) -> Result<()> {
        s.delete(&self.numeric_key())?;
        s.delete(&self.text_key())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Store;

    #[test]
    fn test_encoding_routes_by_kind() {
        assert_eq!(IndexKey::encode(&Value::Integer(3)), IndexKey::Numeric(3.0));
        assert_eq!(IndexKey::encode(&Value::Float(1.5)), IndexKey::Numeric(1.5));
        assert_eq!(
            IndexKey::encode(&Value::Boolean(true)),
            IndexKey::Tagged("T:".to_string())
        );
        assert_eq!(IndexKey::encode(&Value::Null), IndexKey::Tagged("N:".to_string()));
        assert_eq!(
            IndexKey::encode(&Value::from("ab")),
            IndexKey::Tagged("Sab:".to_string())
        );
        assert_eq!(IndexKey::encode(&Value::List(vec![])), IndexKey::Unindexed);
    }

    #[test]
    fn test_lookup_exact() {
        let store = Store::memory();
        store
            .atomic(|s| {
                let index = Index::new("idx", "t", "foo");
                index.add_record(s, &Value::Integer(124), 1)?;
                index.add_record(s, &Value::Float(124.0), 2)?;
                index.add_record(s, &Value::Boolean(true), 3)?;
                index.add_record(s, &Value::Integer(1), 4)?;
                index.add_record(s, &Value::from("a"), 5)?;
                index.add_record(s, &Value::from("a:6"), 7)?;
                index.add_record(s, &Value::from("a"), 8)?;

                assert_eq!(index.lookup_exact(s, &Value::Integer(124))?, vec![1, 2]);
                assert_eq!(index.lookup_exact(s, &Value::Boolean(true))?, vec![3]);
                assert_eq!(index.lookup_exact(s, &Value::Integer(1))?, vec![4]);
                assert_eq!(index.lookup_exact(s, &Value::from("a"))?, vec![5, 8]);
                assert_eq!(index.lookup_exact(s, &Value::from("a:6"))?, vec![7]);
                assert!(index.lookup_exact(s, &Value::Boolean(false))?.is_empty());

                index.remove_record(s, &Value::from("a"), 5)?;
                assert_eq!(index.lookup_exact(s, &Value::from("a"))?, vec![8]);
                Ok(())
            })
            .unwrap();
    }
}
