//! SQL lexer
//!
//! Positions in errors are byte offsets into the statement text.

use std::iter::Peekable;
use std::str::CharIndices;

use super::token::Token;
use crate::error::{Error, Result};

pub struct Lexer<'a> {
    input: &'a str,
    chars: Peekable<CharIndices<'a>>,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            input,
            chars: input.char_indices().peekable(),
        }
    }

    /// Every token of the input, ending with `Eof`
    pub fn tokenize(&mut self) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token()?;
            if token == Token::Eof {
                tokens.push(token);
                return Ok(tokens);
            }
            tokens.push(token);
        }
    }

    pub fn next_token(&mut self) -> Result<Token> {
        self.skip_trivia();
        let Some((start, ch)) = self.chars.next() else {
            return Ok(Token::Eof);
        };

        let token = match ch {
            '(' => Token::LParen,
            ')' => Token::RParen,
            '[' => Token::LBracket,
            ']' => Token::RBracket,
            '{' => Token::LBrace,
            '}' => Token::RBrace,
            ',' => Token::Comma,
            ';' => Token::Semicolon,
            '.' => Token::Dot,
            ':' => Token::Colon,
            '+' => Token::Plus,
            // Negative literals are folded by the parser
            '-' => Token::Minus,
            '*' => Token::Asterisk,
            '/' => Token::Slash,
            '%' => Token::Percent,
            '^' => Token::Caret,
            '=' => Token::Eq,
            '<' if self.eat('=') => Token::Lte,
            '<' if self.eat('>') => Token::Neq,
            '<' => Token::Lt,
            '>' if self.eat('=') => Token::Gte,
            '>' => Token::Gt,
            '!' if self.eat('=') => Token::Neq,
            '|' if self.eat('|') => Token::Concat,
            '\'' => Token::StringLiteral(self.quoted('\'', start)?),
            '"' => Token::QuotedIdentifier(self.quoted('"', start)?),
            c if c.is_ascii_digit() => self.number(start)?,
            c if c.is_alphabetic() || c == '_' => self.word(start),
            c => return Err(Error::UnexpectedCharacter(c, start)),
        };
        Ok(token)
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().map(|(_, c)| *c)
    }

    /// Byte offset of the next unread character
    fn offset(&mut self) -> usize {
        self.chars.peek().map_or(self.input.len(), |(i, _)| *i)
    }

    /// Consume the next character if it is `expected`
    fn eat(&mut self, expected: char) -> bool {
        self.chars.next_if(|(_, c)| *c == expected).is_some()
    }

    /// Character after the next one
    fn peek_second(&self) -> Option<char> {
        let mut ahead = self.chars.clone();
        ahead.next();
        ahead.next().map(|(_, c)| c)
    }

    /// Whitespace, `-- line` and `/* block */` comments
    fn skip_trivia(&mut self) {
        loop {
            while self.chars.next_if(|(_, c)| c.is_whitespace()).is_some() {}
            match (self.peek(), self.peek_second()) {
                (Some('-'), Some('-')) => {
                    while self.chars.next_if(|(_, c)| *c != '\n').is_some() {}
                }
                (Some('/'), Some('*')) => {
                    self.chars.next();
                    self.chars.next();
                    let mut previous = '\0';
                    for (_, c) in self.chars.by_ref() {
                        if previous == '*' && c == '/' {
                            break;
                        }
                        previous = c;
                    }
                }
                _ => return,
            }
        }
    }

    /// Text up to the closing `quote`; a doubled quote stands for itself
    fn quoted(&mut self, quote: char, start: usize) -> Result<String> {
        let mut text = String::new();
        while let Some((_, c)) = self.chars.next() {
            if c != quote {
                text.push(c);
            } else if self.eat(quote) {
                text.push(quote);
            } else {
                return Ok(text);
            }
        }
        Err(Error::UnterminatedString(start))
    }

    /// Integer, decimal or exponent literal. A dot not followed by a digit
    /// ends the number.
    fn number(&mut self, start: usize) -> Result<Token> {
        let mut float = false;
        while self.chars.next_if(|(_, c)| c.is_ascii_digit()).is_some() {}

        if self.peek() == Some('.') && self.peek_second().map_or(false, |c| c.is_ascii_digit()) {
            float = true;
            self.chars.next();
            while self.chars.next_if(|(_, c)| c.is_ascii_digit()).is_some() {}
        }
        if matches!(self.peek(), Some('e' | 'E')) {
            float = true;
            self.chars.next();
            self.chars.next_if(|(_, c)| matches!(c, '+' | '-'));
            while self.chars.next_if(|(_, c)| c.is_ascii_digit()).is_some() {}
        }

        let end = self.offset();
        let text = &self.input[start..end];
        if float {
            text.parse().map(Token::FloatLiteral).map_err(|_| Error::InvalidNumber(start))
        } else {
            text.parse().map(Token::IntegerLiteral).map_err(|_| Error::InvalidNumber(start))
        }
    }

    /// Keyword or bare identifier
    fn word(&mut self, start: usize) -> Token {
        while self
            .chars
            .next_if(|(_, c)| c.is_alphanumeric() || *c == '_')
            .is_some()
        {}
        let end = self.offset();
        let text = &self.input[start..end];
        Token::from_keyword(text).unwrap_or_else(|| Token::Identifier(text.to_string()))
    }
}

/// Tokenize a complete statement
pub fn tokenize(sql: &str) -> Result<Vec<Token>> {
    Lexer::new(sql).tokenize()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ident(name: &str) -> Token {
        Token::Identifier(name.to_string())
    }

    #[test]
    fn test_select_with_where() {
        assert_eq!(
            tokenize("SELECT foo FROM t WHERE foo >= 124").unwrap(),
            vec![
                Token::Select,
                ident("foo"),
                Token::From,
                ident("t"),
                Token::Where,
                ident("foo"),
                Token::Gte,
                Token::IntegerLiteral(124),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_object_literal() {
        let tokens = tokenize(r#"INSERT INTO t {"foo": [1, 2.5]}"#).unwrap();
        assert_eq!(
            tokens[3..12],
            [
                Token::LBrace,
                Token::QuotedIdentifier("foo".to_string()),
                Token::Colon,
                Token::LBracket,
                Token::IntegerLiteral(1),
                Token::Comma,
                Token::FloatLiteral(2.5),
                Token::RBracket,
                Token::RBrace,
            ]
        );
    }

    #[test]
    fn test_escaped_quotes() {
        let tokens = tokenize(r#"SELECT 'it''s', "a""b""#).unwrap();
        assert_eq!(tokens[1], Token::StringLiteral("it's".to_string()));
        assert_eq!(tokens[3], Token::QuotedIdentifier("a\"b".to_string()));
    }

    #[test]
    fn test_errors_carry_offsets() {
        assert!(matches!(tokenize("SELECT 'abc"), Err(Error::UnterminatedString(7))));
        assert!(matches!(tokenize("a | b"), Err(Error::UnexpectedCharacter('|', 2))));
        assert!(matches!(tokenize("a ! b"), Err(Error::UnexpectedCharacter('!', 2))));
        assert!(matches!(
            tokenize("99999999999999999999"),
            Err(Error::InvalidNumber(0))
        ));
    }

    #[test]
    fn test_two_character_operators() {
        let tokens = tokenize("a < b <= c > d >= e <> f != g || h").unwrap();
        let operators: Vec<&Token> = tokens.iter().skip(1).step_by(2).collect();
        assert_eq!(
            operators,
            vec![
                &Token::Lt,
                &Token::Lte,
                &Token::Gt,
                &Token::Gte,
                &Token::Neq,
                &Token::Neq,
                &Token::Concat,
                &Token::Eof,
            ]
        );
    }

    #[test]
    fn test_minus_is_always_an_operator() {
        assert_eq!(
            tokenize("a-1").unwrap(),
            vec![ident("a"), Token::Minus, Token::IntegerLiteral(1), Token::Eof]
        );
    }

    #[test]
    fn test_numbers() {
        let tokens = tokenize("3.25, 2.5e10, 1e-3, t.5").unwrap();
        assert_eq!(tokens[0], Token::FloatLiteral(3.25));
        assert_eq!(tokens[2], Token::FloatLiteral(2.5e10));
        assert_eq!(tokens[4], Token::FloatLiteral(1e-3));
        assert_eq!(tokens[6..9], [ident("t"), Token::Dot, Token::IntegerLiteral(5)]);
    }

    #[test]
    fn test_comments() {
        assert_eq!(
            tokenize("SELECT -- note\n* /* more */ FROM users /* open").unwrap(),
            vec![Token::Select, Token::Asterisk, Token::From, ident("users"), Token::Eof]
        );
    }
}
