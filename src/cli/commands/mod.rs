//! Command implementations
//!
//! Every command builds a [`Context`] from the global options, then talks to
//! the store through a [`SyncExecutor`].

pub mod read;
pub mod schema;
pub mod write;

use std::io::Read;
use std::path::{Path, PathBuf};

use table_sync::config::DEFAULT_CONFIG_FILE;
use table_sync::{DatabaseConfig, RowSet, Store, SyncConfig, SyncExecutor, open_store};
use tracing::{debug, info};

use crate::error::CliError;

/// Options shared by all subcommands
pub struct GlobalArgs {
    /// Explicit configuration file
    pub config: Option<PathBuf>,
    /// Database location overriding the configuration
    pub database: Option<DatabaseConfig>,
    /// Skip the post-commit re-read
    pub no_sanity_check: bool,
    pub verbose: u8,
}

/// Resolved configuration plus an executor over the opened store
pub struct Context {
    pub config: SyncConfig,
    pub executor: SyncExecutor<Box<dyn Store>>,
}

impl Context {
    pub async fn open(args: &GlobalArgs) -> Result<Self, CliError> {
        let config = resolve_config(args)?;
        info!(database = %config.database.display(), "Connecting");
        let store = open_store(&config.database, &config.connect.retry_policy()).await?;
        let executor = SyncExecutor::connect(store, config.sync.clone()).await?;
        Ok(Self { config, executor })
    }
}

/// Merge config file, environment and flags, in increasing precedence
pub fn resolve_config(args: &GlobalArgs) -> Result<SyncConfig, CliError> {
    let mut config = match &args.config {
        Some(path) => SyncConfig::load(path)?,
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
            debug!(file = DEFAULT_CONFIG_FILE, "Using default configuration file");
            SyncConfig::load(Path::new(DEFAULT_CONFIG_FILE))?
        }
        None => SyncConfig::default(),
    }
    .apply_env();

    if let Some(database) = &args.database {
        config.database = database.clone();
    }
    if args.no_sanity_check {
        config.sync.sanity_check = false;
    }
    Ok(config)
}

/// Load rows from a JSON file, or stdin for `-`
pub fn load_rows(input: &str) -> Result<RowSet, CliError> {
    let content = if input == "-" {
        let mut content = String::new();
        std::io::stdin()
            .read_to_string(&mut content)
            .map_err(|e| CliError::InvalidArgument(format!("Failed to read stdin: {}", e)))?;
        content
    } else {
        let path = PathBuf::from(input);
        std::fs::read_to_string(&path).map_err(|e| CliError::FileReadError(path, e.to_string()))?
    };
    parse_rows(&content)
}

fn parse_rows(content: &str) -> Result<RowSet, CliError> {
    let value: serde_json::Value =
        serde_json::from_str(content).map_err(|e| CliError::ParseError(e.to_string()))?;
    Ok(RowSet::from_json(&value)?)
}

/// Name recorded in the audit log
///
/// Falls back to the login name from the environment.
pub fn resolve_username(explicit: Option<&str>) -> Result<String, CliError> {
    explicit
        .map(str::to_string)
        .or_else(|| std::env::var("USER").ok())
        .or_else(|| std::env::var("USERNAME").ok())
        .ok_or_else(|| {
            CliError::InvalidArgument(
                "No username given. Pass --username or set USER.".to_string(),
            )
        })
}
