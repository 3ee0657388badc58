//! Per-request log lines with configurable verbosity levels.
//!
//! Supports three verbosity levels:
//! - Minimal: One-liner nginx-style
//! - Compact: Two-line request/response
//! - Verbose: Full block with identity, route and volume

use crate::config::LogVerbosity;
use crate::language::LanguagePair;

/// What happened to one API request.
#[derive(Debug, Clone, Default)]
pub struct RequestRecord {
    pub method: String,
    pub path: String,
    pub status: u16,
    pub elapsed_ms: u64,
    /// Masked quota identity, e.g. `key:1b4e28ba…` or `addr:10.0.0.1`.
    pub identity: Option<String>,
    pub route: Vec<LanguagePair>,
    pub characters: Option<u64>,
    pub error_type: Option<&'static str>,
}

/// Format duration in human-readable form.
fn format_duration(ms: u64) -> String {
    if ms >= 1000 {
        format!("{:.1}s", ms as f64 / 1000.0)
    } else {
        format!("{}ms", ms)
    }
}

/// `es->en->fr` for a pivot path, `-` when no model was used.
fn format_route(route: &[LanguagePair]) -> String {
    let Some(first) = route.first() else {
        return "-".to_string();
    };
    let mut out = first.source.to_string();
    for hop in route {
        out.push_str("->");
        out.push_str(hop.target.as_str());
    }
    out
}

fn status_text(record: &RequestRecord) -> &'static str {
    if (200..300).contains(&record.status) {
        "OK"
    } else {
        record.error_type.unwrap_or("ERROR")
    }
}

/// Format a request record for terminal output.
pub fn format_record(record: &RequestRecord, verbosity: &LogVerbosity) -> String {
    match verbosity {
        LogVerbosity::Minimal => format_minimal(record),
        LogVerbosity::Compact => format_compact(record),
        LogVerbosity::Verbose => format_verbose(record),
    }
}

fn format_minimal(record: &RequestRecord) -> String {
    let chars = record
        .characters
        .map(|c| format!(" [{} chars]", c))
        .unwrap_or_default();
    format!(
        "{} {} {} {} {}{}",
        record.method,
        record.path,
        record.status,
        format_duration(record.elapsed_ms),
        format_route(&record.route),
        chars
    )
}

fn format_compact(record: &RequestRecord) -> String {
    let who = record.identity.as_deref().unwrap_or("-");
    let request_line = format!("→ {} {} [{}]", record.method, record.path, who);
    let chars = record
        .characters
        .map(|c| format!(", {} chars", c))
        .unwrap_or_default();
    let response_line = format!(
        "← {} {} ({}, {}{})",
        record.status,
        status_text(record),
        format_duration(record.elapsed_ms),
        format_route(&record.route),
        chars
    );
    format!("{}\n{}", request_line, response_line)
}

fn format_verbose(record: &RequestRecord) -> String {
    let separator = "────────────────────────────────────────";
    let characters = record
        .characters
        .map(|c| c.to_string())
        .unwrap_or_else(|| "-".to_string());

    format!(
        "{separator}\n\
         {method} {path}\n\
         Identity: {identity}\n\
         Status: {status} {status_text}\n\
         Route: {route}\n\
         Timing: {duration}\n\
         Characters: {characters}\n\
         {separator}",
        separator = separator,
        method = record.method,
        path = record.path,
        identity = record.identity.as_deref().unwrap_or("-"),
        status = record.status,
        status_text = status_text(record),
        route = format_route(&record.route),
        duration = format_duration(record.elapsed_ms),
        characters = characters,
    )
}

/// Emit a record through `tracing`.
pub fn log_record(record: &RequestRecord, verbosity: &LogVerbosity) {
    let line = format_record(record, verbosity);
    if record.status >= 500 {
        tracing::warn!(target: "linguagate::requests", "{}", line);
    } else {
        tracing::info!(target: "linguagate::requests", "{}", line);
    }
}
