//! Catalog module
//!
//! This module contains the store-resident catalog: secondary indexes, the
//! index directory, and change notification registrations.

pub mod index;
pub mod manager;
pub mod notification;

pub use index::{Index, IndexKey};
pub use manager::IndexManager;
pub use notification::{ChangeKind, Notification, NotificationRegistry};
