//! Parameterized statement construction.
//!
//! Identifiers are validated and quoted, values are bound as `$n`
//! placeholders. Only fragments the pipeline author wrote (transform
//! SELECTs, predicates, DDL) are ever pushed as raw SQL.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    Int(i64),
    Text(String),
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Int(v)
    }
}

impl From<u32> for SqlValue {
    fn from(v: u32) -> Self {
        SqlValue::Int(i64::from(v))
    }
}

/// A statement ready to hand to a [`crate::Warehouse`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl Statement {
    /// A statement with no bound values.
    pub fn raw(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    /// Substitutes every placeholder with an escaped literal, for clients
    /// whose protocol cannot bind parameters.
    pub fn render_inline(&self) -> String {
        let mut out = String::with_capacity(self.sql.len());
        let mut chars = self.sql.chars().peekable();
        let mut in_quote = false;

        while let Some(c) = chars.next() {
            if c == '\'' {
                in_quote = !in_quote;
                out.push(c);
                continue;
            }
            if c == '$' && !in_quote && chars.peek().is_some_and(|d| d.is_ascii_digit()) {
                let mut digits = String::new();
                while let Some(d) = chars.peek().copied().filter(char::is_ascii_digit) {
                    digits.push(d);
                    chars.next();
                }
                let bound = digits
                    .parse::<usize>()
                    .ok()
                    .and_then(|n| n.checked_sub(1))
                    .and_then(|i| self.params.get(i));
                match bound {
                    Some(SqlValue::Int(v)) => out.push_str(&v.to_string()),
                    Some(SqlValue::Text(v)) => out.push_str(&quote_literal(v)),
                    None => {
                        out.push('$');
                        out.push_str(&digits);
                    }
                }
                continue;
            }
            out.push(c);
        }
        out
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid identifier {0:?}")]
pub struct InvalidIdentifier(pub String);

#[derive(Debug, Default)]
pub struct StatementBuilder {
    sql: String,
    params: Vec<SqlValue>,
}

impl StatementBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_sql(mut self, fragment: &str) -> Self {
        self.sql.push_str(fragment);
        self
    }

    pub fn push_ident(mut self, name: &str) -> Result<Self, InvalidIdentifier> {
        self.sql.push_str(&quote_ident(name)?);
        Ok(self)
    }

    pub fn push_bind(mut self, value: impl Into<SqlValue>) -> Self {
        self.params.push(value.into());
        self.sql.push('$');
        self.sql.push_str(&self.params.len().to_string());
        self
    }

    pub fn build(self) -> Statement {
        Statement {
            sql: self.sql,
            params: self.params,
        }
    }
}

/// Quotes a possibly schema-qualified identifier, part by part.
pub fn quote_ident(name: &str) -> Result<String, InvalidIdentifier> {
    let invalid = || InvalidIdentifier(name.to_string());
    if name.is_empty() {
        return Err(invalid());
    }

    let mut quoted = Vec::new();
    for part in name.split('.') {
        if part.is_empty() || part.chars().any(char::is_control) {
            return Err(invalid());
        }
        quoted.push(format!("\"{}\"", part.replace('"', "\"\"")));
    }
    Ok(quoted.join("."))
}

pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
