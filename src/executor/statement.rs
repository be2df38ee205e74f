//! Parameterised statements
//!
//! Replication statements such as `CHANGE MASTER TO` cannot go through the
//! prepared statement protocol (MySQL rejects them, and MariaDB mishandles
//! them, see MDEV-7640). Arguments are therefore interpolated client side
//! into a text-protocol query, with string literals escaped.

use std::fmt;

use crate::error::{Error, Result};

/// A bound statement argument
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlArg {
    Str(String),
    Int(i64),
    UInt(u64),
    Bool(bool),
}

impl SqlArg {
    fn literal(&self) -> String {
        match self {
            SqlArg::Str(s) => quote(s),
            SqlArg::Int(i) => i.to_string(),
            SqlArg::UInt(u) => u.to_string(),
            SqlArg::Bool(b) => if *b { "1".into() } else { "0".into() },
        }
    }
}

impl From<&str> for SqlArg {
    fn from(s: &str) -> Self {
        SqlArg::Str(s.to_string())
    }
}

impl From<String> for SqlArg {
    fn from(s: String) -> Self {
        SqlArg::Str(s)
    }
}

impl From<&String> for SqlArg {
    fn from(s: &String) -> Self {
        SqlArg::Str(s.clone())
    }
}

impl From<i64> for SqlArg {
    fn from(i: i64) -> Self {
        SqlArg::Int(i)
    }
}

impl From<u64> for SqlArg {
    fn from(u: u64) -> Self {
        SqlArg::UInt(u)
    }
}

impl From<u16> for SqlArg {
    fn from(u: u16) -> Self {
        SqlArg::UInt(u as u64)
    }
}

impl From<u32> for SqlArg {
    fn from(u: u32) -> Self {
        SqlArg::UInt(u as u64)
    }
}

impl From<bool> for SqlArg {
    fn from(b: bool) -> Self {
        SqlArg::Bool(b)
    }
}

/// Quote and escape a string literal the way the MySQL client library does.
///
/// Quotes are doubled, which every SQL mode accepts. Backslash escapes
/// require `NO_BACKSLASH_ESCAPES` to be off; [`NO_BACKSLASH_ESCAPES_OFF`]
/// ensures that for every connection this crate opens.
pub fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\0' => out.push_str("\\0"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\x1a' => out.push_str("\\Z"),
            '\'' => out.push_str("''"),
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

/// Session setup that turns off `NO_BACKSLASH_ESCAPES`, keeping any other mode
pub const NO_BACKSLASH_ESCAPES_OFF: &str = "set session sql_mode = trim(both ',' from \
     replace(concat(',', @@session.sql_mode, ','), ',NO_BACKSLASH_ESCAPES,', ','))";

/// SQL text with `?` placeholders and the arguments to bind to them
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub sql: String,
    pub args: Vec<SqlArg>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            args: Vec::new(),
        }
    }

    /// Bind the next placeholder
    pub fn bind(mut self, arg: impl Into<SqlArg>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Interpolate the arguments, producing plain SQL text.
    ///
    /// String arguments are escaped by [`quote`], so the text is only safe on
    /// a session with `NO_BACKSLASH_ESCAPES` off.
    pub fn render(&self) -> Result<String> {
        let mut out = String::with_capacity(self.sql.len() + 16 * self.args.len());
        let mut args = self.args.iter();
        let mut quote_char: Option<char> = None;

        for c in self.sql.chars() {
            match quote_char {
                Some(q) => {
                    if c == q {
                        quote_char = None;
                    }
                    out.push(c);
                }
                None => match c {
                    '\'' | '"' | '`' => {
                        quote_char = Some(c);
                        out.push(c);
                    }
                    '?' => {
                        let arg = args.next().ok_or_else(|| {
                            Error::InvalidArgument(format!("missing argument for statement: {}", self.sql))
                        })?;
                        out.push_str(&arg.literal());
                    }
                    c => out.push(c),
                },
            }
        }

        if args.next().is_some() {
            return Err(Error::InvalidArgument(format!(
                "too many arguments for statement: {}",
                self.sql
            )));
        }
        Ok(out)
    }
}

impl From<&str> for Statement {
    fn from(sql: &str) -> Self {
        Statement::new(sql)
    }
}

impl From<String> for Statement {
    fn from(sql: String) -> Self {
        Statement::new(sql)
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.sql)
    }
}

/// A result row with every column decoded as text
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SqlRow {
    pub columns: Vec<String>,
    pub values: Vec<Option<String>>,
}

impl SqlRow {
    pub fn new(columns: Vec<String>, values: Vec<Option<String>>) -> Self {
        Self { columns, values }
    }

    /// Value at a column index, empty string for NULL or missing
    pub fn get(&self, index: usize) -> String {
        self.values.get(index).cloned().flatten().unwrap_or_default()
    }

    /// Value of the named column (case-insensitive)
    pub fn get_named(&self, name: &str) -> Option<String> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .and_then(|i| self.values.get(i).cloned().flatten())
    }

    /// Value of the first matching column among several spellings
    pub fn get_any(&self, names: &[&str]) -> Option<String> {
        names.iter().find_map(|n| self.get_named(n))
    }

    pub fn get_u64(&self, names: &[&str]) -> u64 {
        self.get_any(names)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(0)
    }
}
