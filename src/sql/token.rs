//! SQL tokens
//!
//! Keywords and punctuation are unit variants; their spelling lives in one
//! table each so lookup and display cannot drift apart.

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Statements and objects
    Create,
    Drop,
    Table,
    Index,
    Notification,
    If,
    Exists,
    Select,
    Insert,
    Update,
    Delete,
    Into,
    Values,
    Set,
    From,
    Where,
    Explain,

    // Clauses
    And,
    Or,
    Not,
    As,
    On,
    Order,
    By,
    Asc,
    Desc,
    Group,
    Limit,
    Offset,

    // Constants
    Null,
    True,
    False,

    // Predicates
    In,
    Between,
    Like,
    Ilike,
    Is,

    // Transactions
    Start,
    Begin,
    Commit,
    Rollback,
    Transaction,

    IntegerLiteral(i64),
    FloatLiteral(f64),
    /// Single-quoted text
    StringLiteral(String),
    Identifier(String),
    /// Double-quoted text: an identifier in expressions, a string inside
    /// list and object literals
    QuotedIdentifier(String),

    // Operators
    Eq,
    /// `<>` or `!=`
    Neq,
    Lt,
    Gt,
    Lte,
    Gte,
    Plus,
    Minus,
    Asterisk,
    Slash,
    Percent,
    Caret,
    Concat,

    // Punctuation
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Semicolon,
    Dot,
    Colon,

    Eof,
}

static KEYWORDS: &[(&str, Token)] = &[
    ("CREATE", Token::Create),
    ("DROP", Token::Drop),
    ("TABLE", Token::Table),
    ("INDEX", Token::Index),
    ("NOTIFICATION", Token::Notification),
    ("IF", Token::If),
    ("EXISTS", Token::Exists),
    ("SELECT", Token::Select),
    ("INSERT", Token::Insert),
    ("UPDATE", Token::Update),
    ("DELETE", Token::Delete),
    ("INTO", Token::Into),
    ("VALUES", Token::Values),
    ("SET", Token::Set),
    ("FROM", Token::From),
    ("WHERE", Token::Where),
    ("EXPLAIN", Token::Explain),
    ("AND", Token::And),
    ("OR", Token::Or),
    ("NOT", Token::Not),
    ("AS", Token::As),
    ("ON", Token::On),
    ("ORDER", Token::Order),
    ("BY", Token::By),
    ("ASC", Token::Asc),
    ("DESC", Token::Desc),
    ("GROUP", Token::Group),
    ("LIMIT", Token::Limit),
    ("OFFSET", Token::Offset),
    ("NULL", Token::Null),
    ("TRUE", Token::True),
    ("FALSE", Token::False),
    ("IN", Token::In),
    ("BETWEEN", Token::Between),
    ("LIKE", Token::Like),
    ("ILIKE", Token::Ilike),
    ("IS", Token::Is),
    ("START", Token::Start),
    ("BEGIN", Token::Begin),
    ("COMMIT", Token::Commit),
    ("ROLLBACK", Token::Rollback),
    ("TRANSACTION", Token::Transaction),
];

static SYMBOLS: &[(&str, Token)] = &[
    ("=", Token::Eq),
    ("<>", Token::Neq),
    ("<", Token::Lt),
    (">", Token::Gt),
    ("<=", Token::Lte),
    (">=", Token::Gte),
    ("+", Token::Plus),
    ("-", Token::Minus),
    ("*", Token::Asterisk),
    ("/", Token::Slash),
    ("%", Token::Percent),
    ("^", Token::Caret),
    ("||", Token::Concat),
    ("(", Token::LParen),
    (")", Token::RParen),
    ("[", Token::LBracket),
    ("]", Token::RBracket),
    ("{", Token::LBrace),
    ("}", Token::RBrace),
    (",", Token::Comma),
    (";", Token::Semicolon),
    (".", Token::Dot),
    (":", Token::Colon),
];

fn spelling(table: &'static [(&'static str, Token)], token: &Token) -> Option<&'static str> {
    table
        .iter()
        .find(|(_, candidate)| candidate == token)
        .map(|(text, _)| *text)
}

impl Token {
    pub fn is_keyword(&self) -> bool {
        spelling(KEYWORDS, self).is_some()
    }

    /// Keyword for a word in any letter case
    pub fn from_keyword(word: &str) -> Option<Token> {
        KEYWORDS
            .iter()
            .find(|(text, _)| text.eq_ignore_ascii_case(word))
            .map(|(_, token)| token.clone())
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::IntegerLiteral(n) => write!(f, "{}", n),
            Token::FloatLiteral(n) => write!(f, "{}", n),
            Token::StringLiteral(s) => write!(f, "'{}'", s),
            Token::Identifier(s) => f.write_str(s),
            Token::QuotedIdentifier(s) => write!(f, "\"{}\"", s),
            Token::Eof => f.write_str("end of input"),
            other => {
                let text = spelling(KEYWORDS, other)
                    .or_else(|| spelling(SYMBOLS, other))
                    .unwrap_or("?");
                f.write_str(text)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyword_lookup_ignores_case() {
        assert_eq!(Token::from_keyword("SELECT"), Some(Token::Select));
        assert_eq!(Token::from_keyword("ilike"), Some(Token::Ilike));
        assert_eq!(Token::from_keyword("Notification"), Some(Token::Notification));
        assert_eq!(Token::from_keyword("count"), None);
    }

    #[test]
    fn test_is_keyword() {
        assert!(Token::Explain.is_keyword());
        assert!(Token::Start.is_keyword());
        assert!(!Token::Caret.is_keyword());
        assert!(!Token::QuotedIdentifier("x".to_string()).is_keyword());
    }

    #[test]
    fn test_display() {
        assert_eq!(Token::Between.to_string(), "BETWEEN");
        assert_eq!(Token::Lte.to_string(), "<=");
        assert_eq!(Token::LBrace.to_string(), "{");
        assert_eq!(Token::StringLiteral("a".to_string()).to_string(), "'a'");
        assert_eq!(Token::Eof.to_string(), "end of input");
    }
}
