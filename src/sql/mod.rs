//! SQL front end
//!
//! Lexing, parsing and the expression model shared with the planner.

pub mod ast;
pub mod expr;
pub mod lexer;
pub mod parser;
pub mod token;

pub use ast::*;
pub use expr::{is_aggregate_name, BinaryOperator, Compiled, Expr, AGGREGATES, UNKNOWN_SIGNATURE};
pub use lexer::{tokenize, Lexer};
pub use parser::{parse_statement, Parser};
pub use token::Token;
