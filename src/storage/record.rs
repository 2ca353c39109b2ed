//! Record representation
//!
//! A record is one version of a row: the user's fields plus the system
//! fields `:id`, `:xid` and `:xex`. Both halves are serialized into a single
//! JSON object, which is the member string stored in a table collection.

use super::value::Value;
use crate::error::{Error, Result};
use indexmap::IndexMap;

pub const ID_FIELD: &str = ":id";
pub const XID_FIELD: &str = ":xid";
pub const XEX_FIELD: &str = ":xex";

/// One stored row version
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record {
    /// Record id, unique within the table
    pub id: i64,
    /// Transaction that created this version
    pub xid: i64,
    /// Transaction that expired this version, 0 while live
    pub xex: i64,
    /// User fields
    pub fields: IndexMap<String, Value>,
}

impl Record {
    pub fn new(fields: IndexMap<String, Value>) -> Self {
        Self {
            fields,
            ..Self::default()
        }
    }

    /// Look up a field. A dotted name that is not itself a field walks into
    /// nested maps.
    pub fn get(&self, name: &str) -> Option<&Value> {
        if let Some(value) = self.fields.get(name) {
            return Some(value);
        }
        let mut parts = name.split('.');
        let mut current = self.fields.get(parts.next()?)?;
        for part in parts {
            match current {
                Value::Map(map) => current = map.get(part)?,
                _ => return None,
            }
        }
        Some(current)
    }

    /// Field value, or null when absent
    pub fn value_of(&self, name: &str) -> Value {
        self.get(name).cloned().unwrap_or(Value::Null)
    }

    /// Some transaction has deleted or replaced this version
    pub fn is_expired(&self) -> bool {
        self.xex != 0
    }

    /// Serialize into the stored member form
    pub fn to_member(&self) -> String {
        let mut object = serde_json::Map::with_capacity(self.fields.len() + 3);
        object.insert(ID_FIELD.to_string(), self.id.into());
        object.insert(XID_FIELD.to_string(), self.xid.into());
        object.insert(XEX_FIELD.to_string(), self.xex.into());
        for (name, value) in &self.fields {
            object.insert(name.clone(), value.to_json());
        }
        serde_json::Value::Object(object).to_string()
    }

    /// Parse a stored member. `key` only labels the error.
    pub fn from_member(key: &str, member: &str) -> Result<Record> {
        let parsed: serde_json::Value =
            serde_json::from_str(member).map_err(|source| Error::CorruptRecord {
                key: key.to_string(),
                source,
            })?;
        let serde_json::Value::Object(object) = parsed else {
            return Err(Error::storage(key, "stored record is not an object"));
        };

        let mut record = Record::default();
        for (name, value) in object {
            match name.as_str() {
                ID_FIELD => record.id = system_field(key, &name, &value)?,
                XID_FIELD => record.xid = system_field(key, &name, &value)?,
                XEX_FIELD => record.xex = system_field(key, &name, &value)?,
                _ => {
                    record.fields.insert(name, Value::from_json(value));
                }
            }
        }
        Ok(record)
    }
}

fn system_field(key: &str, name: &str, value: &serde_json::Value) -> Result<i64> {
    value
        .as_i64()
        .ok_or_else(|| Error::storage(key, format!("system field '{}' is not an integer", name)))
}

/// Reject user field names that collide with system fields.
pub fn validate_field_name(name: &str) -> Result<()> {
    if name.starts_with(':') {
        return Err(Error::ReservedField(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Record {
        let mut fields = IndexMap::new();
        fields.insert("foo".to_string(), Value::Integer(1));
        let mut inner = IndexMap::new();
        inner.insert("b".to_string(), Value::from("x"));
        fields.insert("a".to_string(), Value::Map(inner));
        Record {
            id: 7,
            xid: 3,
            xex: 0,
            fields,
        }
    }

    #[test]
    fn test_member_form_keeps_system_fields() {
        let record = sample();
        let member = record.to_member();
        assert!(member.starts_with(r#"{":id":7,":xid":3,":xex":0,"foo":1"#));

        let decoded = Record::from_member("table:t", &member).unwrap();
        assert_eq!(decoded, record);
        assert!(!decoded.fields.contains_key(ID_FIELD));
        assert!(!decoded.is_expired());

        let expired = Record { xex: 4, ..record };
        assert!(expired.is_expired());
    }

    #[test]
    fn test_nested_lookup() {
        let record = sample();
        assert_eq!(record.get("a.b"), Some(&Value::from("x")));
        assert_eq!(record.get("a.c"), None);
        assert_eq!(record.value_of("missing"), Value::Null);
    }

    #[test]
    fn test_reserved_names() {
        assert!(validate_field_name("foo").is_ok());
        assert!(matches!(
            validate_field_name(":id"),
            Err(Error::ReservedField(_))
        ));
    }

    #[test]
    fn test_corrupt_member() {
        assert!(Record::from_member("table:t", "not json").is_err());
        assert!(Record::from_member("table:t", "[1]").is_err());
    }
}
