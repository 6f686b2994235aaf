//! Read-only commands: `tables`, `get` and `query`

use crate::error::CliError;
use crate::output::{OutputFormat, format_rows};

use super::{Context, GlobalArgs};

/// Arguments for the `get` command
pub struct GetArgs {
    pub table: String,
    pub format: OutputFormat,
}

/// Arguments for the `query` command
pub struct QueryArgs {
    /// Base table
    pub table: String,
    /// Comma separated dotted field paths
    pub fields: String,
    /// Print the compiled SQL instead of running it
    pub sql_only: bool,
    pub format: OutputFormat,
}

/// Handle the `tables` command
pub async fn handle_tables(global: &GlobalArgs) -> Result<(), CliError> {
    let ctx = Context::open(global).await?;
    let schema = ctx.executor.schema();
    for table in schema.tables() {
        match table.primary_key.as_slice() {
            [] => println!("{}", table.name),
            keys => println!("{} (primary key: {})", table.name, keys.join(", ")),
        }
    }
    Ok(())
}

/// Handle the `get` command
pub async fn handle_get(global: &GlobalArgs, args: &GetArgs) -> Result<(), CliError> {
    let ctx = Context::open(global).await?;
    let rows = ctx.executor.get_table(&args.table).await?;
    print!("{}", format_rows(&rows, args.format)?);
    Ok(())
}

/// Handle the `query` command
pub async fn handle_query(global: &GlobalArgs, args: &QueryArgs) -> Result<(), CliError> {
    let ctx = Context::open(global).await?;
    if args.sql_only {
        println!("{}", ctx.executor.compile_query(&args.table, &args.fields)?);
        return Ok(());
    }
    let rows = ctx.executor.query(&args.table, &args.fields).await?;
    print!("{}", format_rows(&rows, args.format)?);
    Ok(())
}
