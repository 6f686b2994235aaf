//! table-sync CLI
//!
//! Command-line access to the sync engine.
//!
//! # Commands
//!
//! - `tables` - List tables and views with their primary keys
//! - `get` - Print the current rows of a table
//! - `query` - Run or print a query over dotted foreign-key paths
//! - `sync` / `insert` / `update` - Write rows from a JSON file
//! - `schema` - Dump the introspected schema
//! - `init-audit` - Create the audit table

mod commands;
mod error;
mod output;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use table_sync::DatabaseConfig;
use tracing_subscriber::EnvFilter;

use commands::read::{GetArgs, QueryArgs};
use commands::schema::SchemaFormat;
use commands::write::{WriteArgs, WriteMode};
use commands::GlobalArgs;
use output::OutputFormat;

/// Schema-aware table synchronization.
#[derive(Parser)]
#[command(name = "table-sync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (defaults to ./table-sync.toml when present)
    #[arg(global = true, short, long)]
    config: Option<PathBuf>,

    /// DuckDB file, :memory: or a postgres:// URL
    #[arg(global = true, short, long, visible_alias = "url")]
    database: Option<DatabaseConfig>,

    /// Skip re-reading the table after a write
    #[arg(global = true, long)]
    no_sanity_check: bool,

    /// Increase log output (-v info, -vv debug)
    #[arg(global = true, short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List tables and views with their primary keys
    Tables,

    /// Print the current rows of a table
    Get {
        table: String,

        /// Output format
        #[arg(short, long, value_enum, default_value = "table")]
        format: OutputFormat,
    },

    /// Select dotted field paths from a base table
    Query {
        table: String,

        /// Comma separated paths, e.g. "order_id.date, quantity"
        fields: String,

        /// Print the compiled SQL without running it
        #[arg(long)]
        sql_only: bool,

        /// Output format
        #[arg(short, long, value_enum, default_value = "table")]
        format: OutputFormat,
    },

    /// Bring a table to the rows in a JSON file
    Sync {
        table: String,

        /// JSON file with the target rows, '-' for stdin
        input: String,

        /// Delete rows that are not in the input
        #[arg(long)]
        delete_missing: bool,

        #[command(flatten)]
        audit: AuditArgs,
    },

    /// Insert rows; fails if any key already exists
    Insert {
        table: String,

        /// JSON file with the rows, '-' for stdin
        input: String,

        #[command(flatten)]
        audit: AuditArgs,
    },

    /// Update rows by primary key
    Update {
        table: String,

        /// JSON file with the rows, '-' for stdin
        input: String,

        #[command(flatten)]
        audit: AuditArgs,
    },

    /// Dump the introspected schema
    Schema {
        #[arg(short, long, value_enum, default_value = "yaml")]
        format: SchemaFormat,
    },

    /// Create the audit table if it does not exist
    InitAudit,
}

#[derive(clap::Args)]
struct AuditArgs {
    /// Person the change is recorded for (defaults to $USER)
    #[arg(short, long, env = "TABLE_SYNC_USER")]
    username: Option<String>,

    /// Reason stored with the audit record
    #[arg(short, long)]
    reason: Option<String>,
}

fn write_args(table: String, input: String, mode: WriteMode, audit: AuditArgs) -> WriteArgs {
    WriteArgs {
        table,
        input,
        mode,
        username: audit.username,
        reason: audit.reason,
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        _ => EnvFilter::new("debug"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let global = GlobalArgs {
        config: cli.config,
        database: cli.database,
        no_sanity_check: cli.no_sanity_check,
        verbose: cli.verbose,
    };

    let result = match cli.command {
        Commands::Tables => commands::read::handle_tables(&global).await,
        Commands::Get { table, format } => {
            commands::read::handle_get(&global, &GetArgs { table, format }).await
        }
        Commands::Query {
            table,
            fields,
            sql_only,
            format,
        } => {
            let args = QueryArgs {
                table,
                fields,
                sql_only,
                format,
            };
            commands::read::handle_query(&global, &args).await
        }
        Commands::Sync {
            table,
            input,
            delete_missing,
            audit,
        } => {
            let mode = WriteMode::Sync {
                delete_missing_rows: delete_missing,
            };
            commands::write::handle_write(&global, &write_args(table, input, mode, audit)).await
        }
        Commands::Insert {
            table,
            input,
            audit,
        } => {
            let args = write_args(table, input, WriteMode::Insert, audit);
            commands::write::handle_write(&global, &args).await
        }
        Commands::Update {
            table,
            input,
            audit,
        } => {
            let args = write_args(table, input, WriteMode::Update, audit);
            commands::write::handle_write(&global, &args).await
        }
        Commands::Schema { format } => commands::schema::handle_schema(&global, format).await,
        Commands::InitAudit => commands::write::handle_init_audit(&global).await,
    };

    match result {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(e) => {
            eprintln!("Error: {}", e.user_message());
            Ok(ExitCode::from(e.exit_code() as u8))
        }
    }
}
