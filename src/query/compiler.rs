//! Compiles a [`Query`] into one `SELECT` with `LEFT OUTER JOIN`s
//!
//! Every distinct join prefix gets exactly one join and one alias. Aliases
//! are `<last segment>_<registration index>`, with registration following the
//! caller's column order and shorter prefixes before longer ones. Joins are
//! emitted in path order so the output does not depend on hash ordering.

use std::collections::BTreeMap;

use tracing::debug;

use crate::error::{SyncError, SyncResult};
use crate::schema::SchemaModel;

use super::{Path, Query};

/// Join prefix to alias mapping, built fresh for each query
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JoinAliases {
    aliases: BTreeMap<Path, String>,
}

impl JoinAliases {
    /// Register every join prefix of every expression
    pub fn build(expressions: &[Path]) -> Self {
        let mut aliases = JoinAliases::default();
        for expr in expressions {
            if let Some(join_prefix) = expr.join_prefix() {
                for n in 1..=join_prefix.len() {
                    aliases.register(join_prefix.prefix(n));
                }
            }
        }
        aliases
    }

    fn register(&mut self, prefix: Path) {
        if !self.aliases.contains_key(&prefix) {
            let alias = format!("{}_{}", prefix.last(), self.aliases.len());
            self.aliases.insert(prefix, alias);
        }
    }

    pub fn get(&self, prefix: &Path) -> Option<&str> {
        self.aliases.get(prefix).map(String::as_str)
    }

    fn require(&self, prefix: &Path) -> SyncResult<&str> {
        self.get(prefix).ok_or_else(|| SyncError::InvalidIdentifier {
            identifier: prefix.to_string(),
            reason: "join path was not registered".to_string(),
        })
    }

    /// Registered prefixes in path order
    pub fn prefixes(&self) -> impl Iterator<Item = &Path> {
        self.aliases.keys()
    }

    pub fn len(&self) -> usize {
        self.aliases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }
}

/// Join clause for one registered prefix
///
/// The table chain is resolved from `base_table`; the last segment's
/// referenced table is joined on its primary key against the parent, which
/// is the base table for a one-segment prefix and the prefix's parent alias
/// otherwise.
pub fn join_clause(
    base_table: &str,
    schema: &SchemaModel,
    prefix: &Path,
    aliases: &JoinAliases,
) -> SyncResult<String> {
    let segments = prefix.segments();
    let (last, parents) = segments.split_last().ok_or_else(|| SyncError::InvalidIdentifier {
        identifier: String::new(),
        reason: "empty join path".to_string(),
    })?;

    let mut owner = base_table;
    for segment in parents {
        owner = schema.get_referenced_table(owner, segment)?;
    }
    let referenced_table = schema.get_referenced_table(owner, last)?;
    let referenced_pk = schema.get_primary_key(referenced_table)?;

    let alias = aliases.require(prefix)?;
    let parent = if parents.is_empty() {
        base_table
    } else {
        aliases.require(&prefix.prefix(parents.len()))?
    };

    Ok(format!(
        "LEFT OUTER JOIN {referenced_table} {alias} ON {alias}.{referenced_pk} = {parent}.{last}"
    ))
}

/// Compile a query into SQL
pub fn compile(query: &Query, schema: &SchemaModel) -> SyncResult<String> {
    if !schema.contains_table(&query.base_table) {
        return Err(SyncError::UnknownTable(query.base_table.clone()));
    }

    let aliases = JoinAliases::build(&query.column_expressions);

    let columns = query
        .column_expressions
        .iter()
        .map(|expr| match expr.join_prefix() {
            None => Ok(format!("{}.{}", query.base_table, expr.last())),
            Some(prefix) => Ok(format!("{}.{}", aliases.require(&prefix)?, expr.last())),
        })
        .collect::<SyncResult<Vec<_>>>()?;

    let joins = aliases
        .prefixes()
        .map(|prefix| join_clause(&query.base_table, schema, prefix, &aliases))
        .collect::<SyncResult<Vec<_>>>()?;

    let mut sql = format!("SELECT {} FROM {}", columns.join(", "), query.base_table);
    if !joins.is_empty() {
        sql.push(' ');
        sql.push_str(&joins.join(" "));
    }

    debug!(table = %query.base_table, joins = joins.len(), sql = %sql, "Compiled query");
    Ok(sql)
}

/// Parse `fields` against `table` and compile the result
pub fn compile_query(table: &str, fields: &str, schema: &SchemaModel) -> SyncResult<String> {
    let query = Query::parse(table, fields)?;
    compile(&query, schema)
}
