//! Query execution module
//!
//! This module contains the query planner, its index rules, and the
//! session layer that executes statements.

pub mod executor;
pub mod planner;

pub mod optimizer;

pub use executor::{Database, Response, Session};
pub use optimizer::{is_impossible, select_index, IndexChoice, IndexRule};
pub use planner::Planner;
