//! Output formatting for CLI

use clap::ValueEnum;
use table_sync::{RowSet, SyncCounts, SyncReport, Value};

use crate::error::CliError;

/// How row sets are printed
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Array of JSON records
    Json,
    /// Comma separated, header first
    Csv,
    /// Aligned text columns
    Table,
}

/// Render a row set in the requested format
pub fn format_rows(rows: &RowSet, format: OutputFormat) -> Result<String, CliError> {
    match format {
        OutputFormat::Json => serde_json::to_string_pretty(&rows.to_records())
            .map_err(|e| CliError::ParseError(e.to_string())),
        OutputFormat::Csv => Ok(format_csv(rows)),
        OutputFormat::Table => Ok(format_table(rows)),
    }
}

fn csv_field(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        other => {
            let text = other.to_string();
            if text.contains([',', '"', '\n', '\r']) {
                format!("\"{}\"", text.replace('"', "\"\""))
            } else {
                text
            }
        }
    }
}

fn format_csv(rows: &RowSet) -> String {
    let mut output = rows.columns.join(",");
    output.push('\n');
    for row in &rows.rows {
        let fields: Vec<String> = row.iter().map(csv_field).collect();
        output.push_str(&fields.join(","));
        output.push('\n');
    }
    output
}

fn format_table(rows: &RowSet) -> String {
    let cells: Vec<Vec<String>> = rows
        .rows
        .iter()
        .map(|row| row.iter().map(|v| v.to_string()).collect())
        .collect();
    let widths: Vec<usize> = rows
        .columns
        .iter()
        .enumerate()
        .map(|(i, name)| {
            cells
                .iter()
                .map(|row| row[i].chars().count())
                .chain(std::iter::once(name.chars().count()))
                .max()
                .unwrap_or(0)
        })
        .collect();

    let line = |values: &[String]| -> String {
        values
            .iter()
            .zip(&widths)
            .map(|(v, &w)| format!("{v:<w$}"))
            .collect::<Vec<_>>()
            .join(" | ")
            .trim_end()
            .to_string()
    };

    let mut output = line(&rows.columns);
    output.push('\n');
    output.push_str(
        &widths
            .iter()
            .map(|w| "-".repeat(*w))
            .collect::<Vec<_>>()
            .join("-+-"),
    );
    output.push('\n');
    for row in &cells {
        output.push_str(&line(row));
        output.push('\n');
    }
    output.push_str(&format!("({} row{})\n", rows.len(), plural(rows.len())));
    output
}

fn plural(n: usize) -> &'static str {
    if n == 1 { "" } else { "s" }
}

/// Summary of a write
pub fn format_counts(table: &str, counts: &SyncCounts) -> String {
    format!(
        "✅ {table}: {} inserted, {} updated, {} deleted\n",
        counts.inserted, counts.updated, counts.deleted
    )
}

/// Summary of a full sync, with stages when verbose
pub fn format_report(report: &SyncReport, verbose: bool) -> String {
    let mut output = format_counts(&report.table, &report.counts);
    if verbose {
        output.push_str(&format!("  Run: {}\n", report.run_id));
        output.push_str(&format!(
            "  Stages: {}\n",
            report
                .stages
                .iter()
                .map(|s| s.name())
                .collect::<Vec<_>>()
                .join(" → ")
        ));
        output.push_str(&format!("  Duration: {} ms\n", report.duration_ms));
    }
    output
}
