//! KVSQL - a relational query engine over an ordered key-value store
//!
//! This library provides:
//! - SQL parsing (lexer, parser, AST, expressions)
//! - Tables, records and secondary indexes kept in sorted collections
//! - A stage pipeline that compiles each statement into one atomic program
//! - Multi-version transactions with undo logs
//! - A background vacuum
//! - A line-oriented TCP server

pub mod catalog;
pub mod config;
pub mod error;
pub mod executor;
pub mod pipeline;
pub mod server;
pub mod sql;
pub mod storage;
pub mod transaction;
pub mod vacuum;

pub use config::EngineConfig;
pub use error::{Error, Result};
pub use executor::{Database, Response, Session};
