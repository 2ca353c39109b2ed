//! Transaction management
//!
//! Multi-version bookkeeping: transaction ids, the active set, undo logs,
//! and the visibility rule statements read through.

pub mod mvcc;
pub mod transaction;

pub use mvcc::{replay, Snapshot, UndoAction};
pub use transaction::{ConnectionId, Transaction, TransactionManager, XID_SEQUENCE};
