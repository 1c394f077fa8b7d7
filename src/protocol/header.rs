//! Start-of-header (`&`) line parsing.
//!
//! A query reply opens with a compact metadata line such as `&1 4 7 0 2`: the
//! marker, a single query type character and a number of space separated
//! fields. How many fields follow is fixed by the query type.
use std::{fmt, str::Split};

use thiserror::Error;

use super::line::SOHEADER_MARKER;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HeaderError {
    #[error("not a start of header line: '{0}'")]
    MissingMarker(String),

    #[error("unknown query type '{kind}' in '{line}'")]
    UnknownType { kind: String, line: String },

    #[error("no more fields after {arity} in '{line}'")]
    Exhausted { arity: usize, line: String },

    #[error("missing field {position} in '{line}'")]
    MissingField { position: usize, line: String },

    #[error("expected a number at field {position}, found '{token}' in '{line}'")]
    NotANumber {
        token: String,
        position: usize,
        line: String,
    },
}

/// Kind of result announced by a start of header line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryType {
    ParseOnly,
    Table,
    Update,
    Schema,
    Transaction,
    Prepare,
    Block,
}

/// Whether the fields of a query type are read as numbers or as text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Int,
    Str,
}

impl QueryType {
    pub fn from_code(code: char) -> Option<Self> {
        Some(match code {
            '0' => QueryType::ParseOnly,
            '1' => QueryType::Table,
            '2' => QueryType::Update,
            '3' => QueryType::Schema,
            '4' => QueryType::Transaction,
            '5' => QueryType::Prepare,
            '6' => QueryType::Block,
            _ => return None,
        })
    }

    pub fn code(self) -> char {
        match self {
            QueryType::ParseOnly => '0',
            QueryType::Table => '1',
            QueryType::Update => '2',
            QueryType::Schema => '3',
            QueryType::Transaction => '4',
            QueryType::Prepare => '5',
            QueryType::Block => '6',
        }
    }

    /// Number of fields following the type character.
    pub fn arity(self) -> usize {
        match self {
            QueryType::ParseOnly | QueryType::Schema => 0,
            QueryType::Update | QueryType::Transaction => 1,
            QueryType::Block => 3,
            QueryType::Table | QueryType::Prepare => 4,
        }
    }

    /// Kind of every field of this query type. Only the transaction field
    /// (`t` or `f`, the new auto-commit mode) is text.
    pub fn field_kind(self) -> FieldKind {
        match self {
            QueryType::Transaction => FieldKind::Str,
            _ => FieldKind::Int,
        }
    }
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueryType::ParseOnly => "parse",
            QueryType::Table => "table",
            QueryType::Update => "update",
            QueryType::Schema => "schema",
            QueryType::Transaction => "transaction",
            QueryType::Prepare => "prepare",
            QueryType::Block => "block",
        };
        write!(f, "{name}")
    }
}

/// Cursor over the fields of one start of header line.
#[derive(Debug, Clone)]
pub struct StartOfHeaderParser<'a> {
    line: &'a str,
    query_type: QueryType,
    fields: Split<'a, char>,
    consumed: usize,
}

impl<'a> StartOfHeaderParser<'a> {
    pub fn parse(line: &'a str) -> Result<Self, HeaderError> {
        let body = line
            .strip_prefix(SOHEADER_MARKER)
            .ok_or_else(|| HeaderError::MissingMarker(line.to_string()))?;

        let mut chars = body.chars();
        let code = chars
            .next()
            .ok_or_else(|| HeaderError::MissingMarker(line.to_string()))?;
        let query_type = QueryType::from_code(code).ok_or_else(|| HeaderError::UnknownType {
            kind: code.to_string(),
            line: line.to_string(),
        })?;

        // Skip the separator following the type character.
        let rest = chars.as_str();
        let rest = rest.strip_prefix(' ').unwrap_or(rest);

        Ok(Self {
            line,
            query_type,
            fields: rest.split(' '),
            consumed: 0,
        })
    }

    pub fn query_type(&self) -> QueryType {
        self.query_type
    }

    pub fn has_next(&self) -> bool {
        self.consumed < self.query_type.arity()
    }

    pub fn next_str(&mut self) -> Result<&'a str, HeaderError> {
        if !self.has_next() {
            return Err(HeaderError::Exhausted {
                arity: self.query_type.arity(),
                line: self.line.to_string(),
            });
        }

        let position = self.consumed + 1;
        let token = self
            .fields
            .next()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| HeaderError::MissingField {
                position,
                line: self.line.to_string(),
            })?;
        self.consumed = position;
        Ok(token)
    }

    pub fn next_int(&mut self) -> Result<i64, HeaderError> {
        let position = self.consumed + 1;
        let token = self.next_str()?;

        let digits = token.strip_prefix('-').unwrap_or(token);
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(HeaderError::NotANumber {
                token: token.to_string(),
                position,
                line: self.line.to_string(),
            });
        }
        token.parse().map_err(|_| HeaderError::NotANumber {
            token: token.to_string(),
            position,
            line: self.line.to_string(),
        })
    }
}

/// One value of a start of header line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderField {
    Int(i64),
    Str(String),
}

impl HeaderField {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            HeaderField::Int(value) => Some(*value),
            HeaderField::Str(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderField::Str(value) => Some(value),
            HeaderField::Int(_) => None,
        }
    }
}

/// Fully decoded start of header line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderRecord {
    pub query_type: QueryType,
    pub fields: Vec<HeaderField>,
}

impl HeaderRecord {
    pub fn parse(line: &str) -> Result<Self, HeaderError> {
        let mut parser = StartOfHeaderParser::parse(line)?;
        let kind = parser.query_type().field_kind();
        let mut fields = Vec::with_capacity(parser.query_type().arity());
        while parser.has_next() {
            fields.push(match kind {
                FieldKind::Int => HeaderField::Int(parser.next_int()?),
                FieldKind::Str => HeaderField::Str(parser.next_str()?.to_string()),
            });
        }

        Ok(Self {
            query_type: parser.query_type(),
            fields,
        })
    }

    /// Integer values, for query types whose fields are all numbers.
    pub fn ints(&self) -> Vec<i64> {
        self.fields.iter().filter_map(HeaderField::as_int).collect()
    }
}
