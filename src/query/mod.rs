//! Dotted field paths and the queries built from them
//!
//! A field path such as `order_id.customer_id.name` starts at the base table
//! and follows one foreign key per segment except the last, which names the
//! selected column.

pub mod compiler;

use std::fmt;

use crate::error::SyncResult;
use crate::validation::validate_identifier;

pub use compiler::{JoinAliases, compile, compile_query, join_clause};

/// Non-empty sequence of identifiers
///
/// Ordering is lexicographic by segment, which fixes the order joins are
/// emitted in.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Path(Vec<String>);

impl Path {
    /// Parse `a.b.c`, trimming whitespace around each segment
    pub fn parse(expr: &str) -> SyncResult<Self> {
        let segments = expr
            .split('.')
            .map(|s| {
                let s = s.trim();
                validate_identifier(s).map(|_| s.to_string())
            })
            .collect::<SyncResult<Vec<_>>>()?;
        Ok(Path(segments))
    }

    /// Build a path from already validated segments
    pub fn from_segments<I, S>(segments: I) -> SyncResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.is_empty() {
            return Err(crate::error::SyncError::InvalidIdentifier {
                identifier: String::new(),
                reason: "path must have at least one segment".to_string(),
            });
        }
        for s in &segments {
            validate_identifier(s)?;
        }
        Ok(Path(segments))
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn last(&self) -> &str {
        self.0.last().map(String::as_str).unwrap_or_default()
    }

    /// First `n` segments
    pub fn prefix(&self, n: usize) -> Path {
        Path(self.0[..n.min(self.0.len())].to_vec())
    }

    /// Every segment but the last, `None` for a plain column
    pub fn join_prefix(&self) -> Option<Path> {
        (self.0.len() > 1).then(|| self.prefix(self.0.len() - 1))
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

/// Base table plus the ordered column expressions to select
///
/// Duplicated expressions are kept and selected twice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub base_table: String,
    pub column_expressions: Vec<Path>,
}

impl Query {
    /// Parse a comma separated list of dotted paths against `table`
    pub fn parse(table: &str, fields: &str) -> SyncResult<Self> {
        let base_table = table.trim();
        validate_identifier(base_table)?;
        let column_expressions = fields
            .split(',')
            .map(Path::parse)
            .collect::<SyncResult<Vec<_>>>()?;
        Ok(Query {
            base_table: base_table.to_string(),
            column_expressions,
        })
    }
}
