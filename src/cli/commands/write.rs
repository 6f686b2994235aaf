//! Mutating commands: `sync`, `insert`, `update` and `init-audit`

use crate::error::CliError;
use crate::output::{format_counts, format_report};

use super::{Context, GlobalArgs, load_rows, resolve_username};

/// Write policy selected by the subcommand
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Sync { delete_missing_rows: bool },
    Insert,
    Update,
}

/// Arguments for the `sync`, `insert` and `update` commands
pub struct WriteArgs {
    pub table: String,
    /// JSON file with the rows, `-` for stdin
    pub input: String,
    pub mode: WriteMode,
    pub username: Option<String>,
    /// Free text stored with the audit record
    pub reason: Option<String>,
}

/// Handle the `sync`, `insert` and `update` commands
pub async fn handle_write(global: &GlobalArgs, args: &WriteArgs) -> Result<(), CliError> {
    let username = resolve_username(args.username.as_deref())?;
    let rows = load_rows(&args.input)?;
    let ctx = Context::open(global).await?;
    let executor = &ctx.executor;
    let reason = args.reason.as_deref();

    match args.mode {
        WriteMode::Sync {
            delete_missing_rows,
        } => {
            let report = executor
                .sync_table(&args.table, &rows, delete_missing_rows, &username, reason)
                .await?;
            print!("{}", format_report(&report, global.verbose > 0));
        }
        WriteMode::Insert => {
            let counts = executor
                .insert_only(&args.table, &rows, &username, reason)
                .await?;
            print!("{}", format_counts(&args.table, &counts));
        }
        WriteMode::Update => {
            let counts = executor
                .update_only(&args.table, &rows, &username, reason)
                .await?;
            print!("{}", format_counts(&args.table, &counts));
        }
    }
    Ok(())
}

/// Handle the `init-audit` command
pub async fn handle_init_audit(global: &GlobalArgs) -> Result<(), CliError> {
    let ctx = Context::open(global).await?;
    ctx.executor.init_audit_table().await?;
    println!("Audit table ready: {}", ctx.config.sync.audit_table);
    Ok(())
}
