//! Change notifications
//!
//! A notification is a named subscription on a table. Registrations are
//! kept in the store (`catalog:notifications`, members `<name>\t<table>`);
//! delivery happens in process through a broadcast channel owned by the
//! database.

use crate::error::{Error, Result};
use crate::storage::Storage;
use serde::Serialize;

pub const NOTIFICATION_DIRECTORY: &str = "catalog:notifications";

const SEPARATOR: char = '\t';

/// Kind of write that triggered an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Event delivered to subscribers after a write becomes visible
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub name: String,
    pub table: String,
    pub action: ChangeKind,
    pub rows: usize,
}

/// Registry of notification names
pub struct NotificationRegistry;

impl NotificationRegistry {
    pub fn create(s: &mut dyn Storage, name: &str, table: &str) -> Result<()> {
        if Self::get(s, name)?.is_some() {
            return Err(Error::NotificationAlreadyExists(name.to_string()));
        }
        s.add(NOTIFICATION_DIRECTORY, 0.0, &format!("{}{}{}", name, SEPARATOR, table))?;
        Ok(())
    }

    /// Returns whether the notification existed
    pub fn drop(s: &mut dyn Storage, name: &str) -> Result<bool> {
        match Self::get(s, name)? {
            Some(table) => {
                s.remove_member(NOTIFICATION_DIRECTORY, &format!("{}{}{}", name, SEPARATOR, table))?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Table a notification watches
    pub fn get(s: &dyn Storage, name: &str) -> Result<Option<String>> {
        let prefix = format!("{}{}", name, SEPARATOR);
        Ok(s.range_by_prefix(NOTIFICATION_DIRECTORY, &prefix)?
            .first()
            .map(|entry| entry[prefix.len()..].to_string()))
    }

    /// Names of the notifications on `table`
    pub fn for_table(s: &dyn Storage, table: &str) -> Result<Vec<String>> {
        Ok(Self::entries(s)?
            .into_iter()
            .filter(|(_, t)| t == table)
            .map(|(name, _)| name)
            .collect())
    }

    pub fn drop_for_table(s: &mut dyn Storage, table: &str) -> Result<usize> {
        let names = Self::for_table(s, table)?;
        for name in &names {
            Self::drop(s, name)?;
        }
        Ok(names.len())
    }

    fn entries(s: &dyn Storage) -> Result<Vec<(String, String)>> {
        Ok(s
            .range_by_score(NOTIFICATION_DIRECTORY, f64::NEG_INFINITY, f64::INFINITY, None)?
            .iter()
            .filter_map(|entry| {
                entry
                    .split_once(SEPARATOR)
                    .map(|(name, table)| (name.to_string(), table.to_string()))
            })
            .collect())
    }
}
