//! Recursive-descent SQL parser
//!
//! Precedence, loosest first: OR, AND, NOT, comparison and predicates,
//! `+ - ||`, `* / %`, `^` (right associative), unary sign.

use super::ast::*;
use super::expr::{BinaryOperator, Expr};
use super::lexer::Lexer;
use super::token::Token;
use crate::error::{Error, Result};
use crate::storage::record::validate_field_name;
use crate::storage::Value;
use indexmap::IndexMap;

type Row = IndexMap<String, Value>;

pub struct Parser {
    tokens: Vec<Token>,
    position: usize,
    /// Recoverable anomalies seen while parsing, such as duplicate keys
    warnings: Vec<String>,
}

impl Parser {
    pub fn new(sql: &str) -> Result<Self> {
        Ok(Self {
            tokens: Lexer::new(sql).tokenize()?,
            position: 0,
            warnings: Vec::new(),
        })
    }

    /// One statement with an optional trailing `;`
    pub fn parse(&mut self) -> Result<Statement> {
        let stmt = self.statement()?;
        self.eat(&Token::Semicolon);
        if !self.at_end() {
            return Err(self.unexpected("end of statement"));
        }
        Ok(stmt)
    }

    /// Statements separated by `;`
    pub fn parse_all(&mut self) -> Result<Vec<Statement>> {
        let mut statements = Vec::new();
        while !self.at_end() {
            statements.push(self.statement()?);
            if !self.eat(&Token::Semicolon) && !self.at_end() {
                return Err(self.unexpected(";"));
            }
        }
        Ok(statements)
    }

    pub fn take_warnings(&mut self) -> Vec<String> {
        std::mem::take(&mut self.warnings)
    }

    fn statement(&mut self) -> Result<Statement> {
        match self.current() {
            Token::Select => self.select().map(Statement::Select),
            Token::Insert => self.insert().map(Statement::Insert),
            Token::Update => self.update().map(Statement::Update),
            Token::Delete => self.delete().map(Statement::Delete),
            Token::Create => self.create(),
            Token::Drop => self.drop_object(),
            Token::Explain => self.explain(),
            Token::Start => {
                self.advance();
                self.expect(&Token::Transaction)?;
                Ok(Statement::StartTransaction)
            }
            Token::Begin => {
                self.advance();
                self.eat(&Token::Transaction);
                Ok(Statement::StartTransaction)
            }
            Token::Commit => {
                self.advance();
                self.eat(&Token::Transaction);
                Ok(Statement::Commit)
            }
            Token::Rollback => {
                self.advance();
                self.eat(&Token::Transaction);
                Ok(Statement::Rollback)
            }
            _ => Err(self.unexpected(
                "SELECT, INSERT, UPDATE, DELETE, CREATE, DROP, START, COMMIT, ROLLBACK, or EXPLAIN",
            )),
        }
    }

    fn explain(&mut self) -> Result<Statement> {
        self.expect(&Token::Explain)?;
        match self.statement()? {
            stmt @ (Statement::Select(_) | Statement::Update(_) | Statement::Delete(_)) => {
                Ok(Statement::Explain(Box::new(stmt)))
            }
            _ => Err(Error::ParseError(
                "EXPLAIN supports SELECT, UPDATE and DELETE".to_string(),
            )),
        }
    }

    fn select(&mut self) -> Result<SelectStatement> {
        self.expect(&Token::Select)?;
        let mut stmt = SelectStatement {
            columns: self.comma_separated(Self::select_item)?,
            ..SelectStatement::default()
        };

        if self.eat(&Token::From) {
            stmt.from = Some(self.table_ref()?);
        }
        stmt.where_clause = self.optional_where()?;
        if self.eat(&Token::Group) {
            self.expect(&Token::By)?;
            stmt.group_by = self.comma_separated(Self::expr)?;
        }
        if self.eat(&Token::Order) {
            self.expect(&Token::By)?;
            stmt.order_by = self.comma_separated(Self::order_item)?;
        }
        if self.eat(&Token::Limit) {
            stmt.limit = Some(self.count("LIMIT")?);
        }
        if self.eat(&Token::Offset) {
            stmt.offset = Some(self.count("OFFSET")?);
        }
        Ok(stmt)
    }

    /// `*`, `expr`, `expr AS name` or `expr name`
    fn select_item(&mut self) -> Result<Expr> {
        if self.eat(&Token::Asterisk) {
            return Ok(Expr::Asterisk);
        }
        let expr = self.expr()?;
        let aliased = self.eat(&Token::As)
            || matches!(self.current(), Token::Identifier(_) | Token::QuotedIdentifier(_));
        if !aliased {
            return Ok(expr);
        }
        let name = self.identifier()?;
        validate_field_name(&name)?;
        Ok(Expr::Alias {
            expr: Box::new(expr),
            name,
        })
    }

    fn table_ref(&mut self) -> Result<TableRef> {
        if !self.eat(&Token::LParen) {
            return Ok(TableRef::Table(self.identifier()?));
        }
        let query = self.select()?;
        self.expect(&Token::RParen)?;
        self.eat(&Token::As);
        let alias = self.identifier()?;
        validate_field_name(&alias)?;
        Ok(TableRef::Subquery {
            query: Box::new(query),
            alias,
        })
    }

    fn order_item(&mut self) -> Result<OrderByItem> {
        let expr = self.expr()?;
        let ascending = !self.eat(&Token::Desc);
        if ascending {
            self.eat(&Token::Asc);
        }
        Ok(OrderByItem { expr, ascending })
    }

    fn insert(&mut self) -> Result<InsertStatement> {
        self.expect(&Token::Insert)?;
        self.expect(&Token::Into)?;
        let table_name = self.identifier()?;

        // `VALUES` before object rows is optional
        let rows = if self.eat(&Token::Values) || self.check(&Token::LBrace) {
            self.comma_separated(Self::object_row)?
        } else {
            self.column_rows()?
        };

        for field in rows.iter().flat_map(|row| row.keys()) {
            validate_field_name(field)?;
        }
        Ok(InsertStatement { table_name, rows })
    }

    fn object_row(&mut self) -> Result<Row> {
        match self.literal()? {
            Value::Map(map) => Ok(map),
            other => Err(Error::ParseError(format!(
                "INSERT expects objects, got {}",
                other.type_name()
            ))),
        }
    }

    /// `(col, ...) VALUES (v, ...), ...`
    fn column_rows(&mut self) -> Result<Vec<Row>> {
        self.expect(&Token::LParen)?;
        let columns = self.comma_separated(Self::identifier)?;
        self.expect(&Token::RParen)?;
        self.expect(&Token::Values)?;

        let tuples = self.comma_separated(|p| {
            p.expect(&Token::LParen)?;
            let values = p.comma_separated(Self::literal)?;
            p.expect(&Token::RParen)?;
            Ok(values)
        })?;

        let mut rows = Vec::with_capacity(tuples.len());
        for values in tuples {
            if values.len() != columns.len() {
                return Err(Error::ParseError(format!(
                    "expected {} values, got {}",
                    columns.len(),
                    values.len()
                )));
            }
            let mut row = Row::with_capacity(columns.len());
            for (column, value) in columns.iter().zip(values) {
                if row.insert(column.clone(), value).is_some() {
                    self.warn_duplicate(column);
                }
            }
            rows.push(row);
        }
        Ok(rows)
    }

    fn update(&mut self) -> Result<UpdateStatement> {
        self.expect(&Token::Update)?;
        let table_name = self.identifier()?;
        self.expect(&Token::Set)?;
        let assignments = self.comma_separated(|p| {
            let column = p.identifier()?;
            validate_field_name(&column)?;
            p.expect(&Token::Eq)?;
            Ok(Assignment {
                column,
                value: p.expr()?,
            })
        })?;
        Ok(UpdateStatement {
            table_name,
            assignments,
            where_clause: self.optional_where()?,
        })
    }

    fn delete(&mut self) -> Result<DeleteStatement> {
        self.expect(&Token::Delete)?;
        self.expect(&Token::From)?;
        Ok(DeleteStatement {
            table_name: self.identifier()?,
            where_clause: self.optional_where()?,
        })
    }

    fn optional_where(&mut self) -> Result<Option<Expr>> {
        if self.eat(&Token::Where) {
            self.expr().map(Some)
        } else {
            Ok(None)
        }
    }

    fn create(&mut self) -> Result<Statement> {
        self.expect(&Token::Create)?;
        if self.eat(&Token::Index) {
            let index_name = self.identifier()?;
            self.expect(&Token::On)?;
            let table_name = self.identifier()?;
            self.expect(&Token::LParen)?;
            let field = self.field_path()?;
            self.expect(&Token::RParen)?;
            return Ok(Statement::CreateIndex(CreateIndexStatement {
                index_name,
                table_name,
                field,
            }));
        }
        if self.eat(&Token::Notification) {
            let name = self.identifier()?;
            self.expect(&Token::On)?;
            return Ok(Statement::CreateNotification(CreateNotificationStatement {
                name,
                table_name: self.identifier()?,
            }));
        }
        Err(self.unexpected("INDEX or NOTIFICATION"))
    }

    fn drop_object(&mut self) -> Result<Statement> {
        self.expect(&Token::Drop)?;
        if self.eat(&Token::Index) {
            return Ok(Statement::DropIndex(DropIndexStatement {
                index_name: self.identifier()?,
            }));
        }
        if self.eat(&Token::Notification) {
            return Ok(Statement::DropNotification(DropNotificationStatement {
                name: self.identifier()?,
            }));
        }
        if self.eat(&Token::Table) {
            let if_exists = self.eat(&Token::If);
            if if_exists {
                self.expect(&Token::Exists)?;
            }
            return Ok(Statement::DropTable(DropTableStatement {
                table_name: self.identifier()?,
                if_exists,
            }));
        }
        Err(self.unexpected("INDEX, NOTIFICATION or TABLE"))
    }

    // ---------- expressions ----------

    fn expr(&mut self) -> Result<Expr> {
        self.disjunction()
    }

    fn disjunction(&mut self) -> Result<Expr> {
        let mut left = self.conjunction()?;
        while self.eat(&Token::Or) {
            left = Expr::binary(left, BinaryOperator::Or, self.conjunction()?);
        }
        Ok(left)
    }

    fn conjunction(&mut self) -> Result<Expr> {
        let mut left = self.negation()?;
        while self.eat(&Token::And) {
            left = Expr::binary(left, BinaryOperator::And, self.negation()?);
        }
        Ok(left)
    }

    fn negation(&mut self) -> Result<Expr> {
        if self.eat(&Token::Not) {
            return Ok(Expr::Not(Box::new(self.negation()?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr> {
        let left = self.sum()?;

        // IS [NOT] takes a literal
        if self.eat(&Token::Is) {
            let op = if self.eat(&Token::Not) {
                BinaryOperator::IsNot
            } else {
                BinaryOperator::Is
            };
            return Ok(Expr::binary(left, op, Expr::Value(self.literal()?)));
        }

        let negated = self.check(&Token::Not)
            && matches!(
                self.peek(),
                Some(Token::Between | Token::In | Token::Like | Token::Ilike)
            );
        if negated {
            self.advance();
        }
        let pick = |plain, inverse| if negated { inverse } else { plain };

        if self.eat(&Token::Between) {
            let low = self.literal()?;
            self.expect(&Token::And)?;
            let high = self.literal()?;
            let op = pick(BinaryOperator::Between, BinaryOperator::NotBetween);
            return Ok(Expr::binary(left, op, Expr::Value(Value::List(vec![low, high]))));
        }
        if self.eat(&Token::In) {
            self.expect(&Token::LParen)?;
            let items = self.comma_separated(Self::literal)?;
            self.expect(&Token::RParen)?;
            let op = pick(BinaryOperator::In, BinaryOperator::NotIn);
            return Ok(Expr::binary(left, op, Expr::Value(Value::List(items))));
        }
        if self.eat(&Token::Like) {
            let op = pick(BinaryOperator::Like, BinaryOperator::NotLike);
            return Ok(Expr::binary(left, op, self.sum()?));
        }
        if self.eat(&Token::Ilike) {
            let op = pick(BinaryOperator::Ilike, BinaryOperator::NotIlike);
            return Ok(Expr::binary(left, op, self.sum()?));
        }

        let op = match self.current() {
            Token::Eq => BinaryOperator::Eq,
            Token::Neq => BinaryOperator::Neq,
            Token::Lt => BinaryOperator::Lt,
            Token::Gt => BinaryOperator::Gt,
            Token::Lte => BinaryOperator::Lte,
            Token::Gte => BinaryOperator::Gte,
            _ => return Ok(left),
        };
        self.advance();
        Ok(Expr::binary(left, op, self.sum()?))
    }

    fn sum(&mut self) -> Result<Expr> {
        let mut left = self.product()?;
        loop {
            let op = match self.current() {
                Token::Plus => BinaryOperator::Add,
                Token::Minus => BinaryOperator::Sub,
                Token::Concat => BinaryOperator::Concat,
                _ => return Ok(left),
            };
            self.advance();
            left = Expr::binary(left, op, self.product()?);
        }
    }

    fn product(&mut self) -> Result<Expr> {
        let mut left = self.power()?;
        loop {
            let op = match self.current() {
                Token::Asterisk => BinaryOperator::Mul,
                Token::Slash => BinaryOperator::Div,
                Token::Percent => BinaryOperator::Mod,
                _ => return Ok(left),
            };
            self.advance();
            left = Expr::binary(left, op, self.power()?);
        }
    }

    fn power(&mut self) -> Result<Expr> {
        let base = self.unary()?;
        if self.eat(&Token::Caret) {
            return Ok(Expr::binary(base, BinaryOperator::Pow, self.power()?));
        }
        Ok(base)
    }

    /// A sign directly before a number folds into the literal
    fn unary(&mut self) -> Result<Expr> {
        if self.eat(&Token::Plus) {
            return self.unary();
        }
        if !self.eat(&Token::Minus) {
            return self.primary();
        }
        if let Some(value) = self.negated_number() {
            return Ok(Expr::Value(value));
        }
        Ok(Expr::binary(Expr::value(0i64), BinaryOperator::Sub, self.unary()?))
    }

    fn primary(&mut self) -> Result<Expr> {
        match self.current() {
            Token::IntegerLiteral(_)
            | Token::FloatLiteral(_)
            | Token::StringLiteral(_)
            | Token::True
            | Token::False
            | Token::Null
            | Token::LBracket
            | Token::LBrace => self.literal().map(Expr::Value),
            Token::LParen => {
                self.advance();
                let inner = self.expr()?;
                self.expect(&Token::RParen)?;
                Ok(Expr::Group(Box::new(inner)))
            }
            Token::Identifier(name) if self.peek() == Some(&Token::LParen) => {
                let name = name.to_lowercase();
                self.advance();
                self.function(name)
            }
            Token::Identifier(_) | Token::QuotedIdentifier(_) => self.field_path().map(Expr::Identifier),
            _ => Err(self.unexpected("expression")),
        }
    }

    /// `name(*)`, `name()` or `name(a, b)`; `name` is already lowercase
    fn function(&mut self, name: String) -> Result<Expr> {
        self.expect(&Token::LParen)?;
        let args = if self.eat(&Token::Asterisk) {
            vec![Expr::Asterisk]
        } else if self.check(&Token::RParen) {
            Vec::new()
        } else {
            self.comma_separated(Self::expr)?
        };
        self.expect(&Token::RParen)?;
        Ok(Expr::Function { name, args })
    }

    /// `a` or `a.b.c`
    fn field_path(&mut self) -> Result<String> {
        let mut path = self.identifier()?;
        while self.eat(&Token::Dot) {
            path.push('.');
            path.push_str(&self.identifier()?);
        }
        Ok(path)
    }

    // ---------- literals ----------

    /// Scalar, `[...]` list or `{...}` object
    fn literal(&mut self) -> Result<Value> {
        let value = match self.current() {
            Token::IntegerLiteral(n) => Value::Integer(*n),
            Token::FloatLiteral(n) => Value::Float(*n),
            Token::StringLiteral(s) => Value::String(s.clone()),
            Token::True => Value::Boolean(true),
            Token::False => Value::Boolean(false),
            Token::Null => Value::Null,
            Token::Minus => {
                self.advance();
                return self.negated_number().ok_or_else(|| self.unexpected("number"));
            }
            Token::LBracket => return self.list(),
            Token::LBrace => return self.object(),
            _ => return Err(self.unexpected("literal value")),
        };
        self.advance();
        Ok(value)
    }

    /// Consume a number following a consumed `-`
    fn negated_number(&mut self) -> Option<Value> {
        let value = match self.current() {
            Token::IntegerLiteral(n) => Value::Integer(-n),
            Token::FloatLiteral(n) => Value::Float(-n),
            _ => return None,
        };
        self.advance();
        Some(value)
    }

    /// Inside containers, double-quoted text is a string
    fn element(&mut self) -> Result<Value> {
        if let Token::QuotedIdentifier(s) = self.current() {
            let value = Value::String(s.clone());
            self.advance();
            return Ok(value);
        }
        self.literal()
    }

    fn list(&mut self) -> Result<Value> {
        self.expect(&Token::LBracket)?;
        let items = if self.check(&Token::RBracket) {
            Vec::new()
        } else {
            self.comma_separated(Self::element)?
        };
        self.expect(&Token::RBracket)?;
        Ok(Value::List(items))
    }

    fn object(&mut self) -> Result<Value> {
        self.expect(&Token::LBrace)?;
        let entries = if self.check(&Token::RBrace) {
            Vec::new()
        } else {
            self.comma_separated(|p| {
                let key = match p.current() {
                    Token::QuotedIdentifier(k) | Token::StringLiteral(k) | Token::Identifier(k) => {
                        k.clone()
                    }
                    _ => return Err(p.unexpected("object key")),
                };
                p.advance();
                p.expect(&Token::Colon)?;
                Ok((key, p.element()?))
            })?
        };
        self.expect(&Token::RBrace)?;

        let mut map = Row::with_capacity(entries.len());
        for (key, value) in entries {
            // Last value wins
            if map.insert(key.clone(), value).is_some() {
                self.warn_duplicate(&key);
            }
        }
        Ok(Value::Map(map))
    }

    fn warn_duplicate(&mut self, key: &str) {
        self.warnings
            .push(format!("duplicate key '{}': last value wins", key));
    }

    // ---------- token cursor ----------

    /// `item (, item)*`
    fn comma_separated<T>(&mut self, mut item: impl FnMut(&mut Self) -> Result<T>) -> Result<Vec<T>> {
        let mut items = vec![item(self)?];
        while self.eat(&Token::Comma) {
            items.push(item(self)?);
        }
        Ok(items)
    }

    fn current(&self) -> &Token {
        self.tokens.get(self.position).unwrap_or(&Token::Eof)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position + 1)
    }

    fn advance(&mut self) {
        if self.position < self.tokens.len() {
            self.position += 1;
        }
    }

    fn at_end(&self) -> bool {
        matches!(self.current(), Token::Eof)
    }

    /// Same kind of token, ignoring any payload
    fn check(&self, token: &Token) -> bool {
        std::mem::discriminant(self.current()) == std::mem::discriminant(token)
    }

    /// Consume the token if it matches
    fn eat(&mut self, token: &Token) -> bool {
        let matched = self.check(token);
        if matched {
            self.advance();
        }
        matched
    }

    fn expect(&mut self, token: &Token) -> Result<()> {
        if self.eat(token) {
            Ok(())
        } else if self.at_end() {
            Err(Error::UnexpectedEof(token.to_string()))
        } else {
            Err(self.unexpected(token.to_string()))
        }
    }

    fn unexpected(&self, expected: impl Into<String>) -> Error {
        Error::UnexpectedToken {
            expected: expected.into(),
            found: self.current().to_string(),
        }
    }

    fn identifier(&mut self) -> Result<String> {
        match self.current() {
            Token::Identifier(name) | Token::QuotedIdentifier(name) => {
                let name = name.clone();
                self.advance();
                Ok(name)
            }
            _ => Err(self.unexpected("identifier")),
        }
    }

    fn count(&mut self, clause: &str) -> Result<u64> {
        match self.current() {
            Token::IntegerLiteral(n) if *n >= 0 => {
                let n = *n as u64;
                self.advance();
                Ok(n)
            }
            _ => Err(self.unexpected(format!("non-negative integer after {}", clause))),
        }
    }
}

/// Parse one statement, returning it with any parser warnings
pub fn parse_statement(sql: &str) -> Result<(Statement, Vec<String>)> {
    let mut parser = Parser::new(sql)?;
    let statement = parser.parse()?;
    Ok((statement, parser.take_warnings()))
}
