//! `schema` command: print the introspected schema

use clap::ValueEnum;

use crate::error::CliError;

use super::{Context, GlobalArgs};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SchemaFormat {
    Yaml,
    Json,
}

/// Handle the `schema` command
pub async fn handle_schema(global: &GlobalArgs, format: SchemaFormat) -> Result<(), CliError> {
    let ctx = Context::open(global).await?;
    let schema = ctx.executor.schema();
    let text = match format {
        SchemaFormat::Yaml => schema.to_yaml()?,
        SchemaFormat::Json => schema.to_json()?,
    };
    println!("{}", text.trim_end());
    Ok(())
}
