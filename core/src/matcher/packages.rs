//! Package-aware tie-breaking and reuse rules.
//!
//! The structural score treats all packages alike; these rules encode what
//! "the same call" means for the common dependency families. They only
//! reorder candidates the structural score could not separate, except for
//! cache lookups where key equality decides outright.

use std::sync::OnceLock;

use drift_protocol::Span;
use regex::Regex;
use serde_json::Value;

/// Outcome of a package-specific comparison between a recorded span and a
/// live request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Affinity {
    /// The package semantics settle the question entirely (cache keys).
    Decisive(bool),
    /// Prefer higher values among equally-scored candidates.
    Ranked(u32),
    Neutral,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PackageClass {
    Http,
    Sql,
    Cache,
    Other,
}

fn classify(package_name: &str) -> PackageClass {
    match package_name.to_ascii_lowercase().as_str() {
        "http" | "https" | "fetch" | "axios" | "undici" | "got" => PackageClass::Http,
        "pg" | "postgres" | "postgresql" | "mysql" | "mysql2" | "mariadb" | "sqlite"
        | "sqlite3" | "mssql" | "sql" => PackageClass::Sql,
        "redis" | "ioredis" | "memcached" | "cache" => PackageClass::Cache,
        _ => PackageClass::Other,
    }
}

pub(crate) fn affinity(span: &Span, live_input: &Value) -> Affinity {
    match classify(&span.package_name) {
        PackageClass::Http => http_affinity(&span.input_value, live_input),
        PackageClass::Sql => sql_affinity(&span.input_value, live_input),
        PackageClass::Cache => cache_affinity(&span.input_value, live_input),
        PackageClass::Other => Affinity::Neutral,
    }
}

/// Whether a consumed span may satisfy further requests. Pure reads are
/// safe to replay any number of times; everything else is consumed once.
pub fn is_reusable(span: &Span) -> bool {
    if span
        .metadata
        .get("replayable")
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        return true;
    }
    match classify(&span.package_name) {
        PackageClass::Http => matches!(
            method_of(&span.input_value).map(|m| m.to_ascii_uppercase()),
            Some(ref m) if m == "GET" || m == "HEAD"
        ),
        PackageClass::Sql => statement_of(&span.input_value)
            .map(|stmt| normalize_statement(&stmt).starts_with("select"))
            .unwrap_or(false),
        PackageClass::Cache => command_of(&span.input_value)
            .map(|command| {
                matches!(
                    command.to_ascii_lowercase().as_str(),
                    "get" | "mget" | "exists" | "ttl" | "hget" | "hgetall" | "smembers"
                        | "zrange" | "scan" | "keys"
                )
            })
            .unwrap_or(false),
        PackageClass::Other => false,
    }
}

fn method_of(input: &Value) -> Option<&str> {
    input.get("method").and_then(Value::as_str)
}

fn path_of(input: &Value) -> Option<&str> {
    input.get("path").and_then(Value::as_str)
}

fn statement_of(input: &Value) -> Option<String> {
    for key in ["query", "statement", "sql"] {
        if let Some(stmt) = input.get(key).and_then(Value::as_str) {
            return Some(stmt.to_string());
        }
    }
    None
}

fn command_of(input: &Value) -> Option<String> {
    input
        .get("command")
        .and_then(Value::as_str)
        .map(|command| command.to_string())
}

fn key_of(input: &Value) -> Option<String> {
    if let Some(key) = input.get("key").and_then(Value::as_str) {
        return Some(key.to_string());
    }
    input
        .get("args")
        .and_then(Value::as_array)
        .and_then(|args| args.first())
        .and_then(Value::as_str)
        .map(|key| key.to_string())
}

fn http_affinity(recorded: &Value, live: &Value) -> Affinity {
    let method_match = match (method_of(recorded), method_of(live)) {
        (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
        _ => false,
    };
    let prefix = match (path_of(recorded), path_of(live)) {
        (Some(a), Some(b)) => common_template_prefix(a, b),
        _ => 0,
    };
    let rank = u32::from(method_match) * 1_000 + (prefix.min(50) as u32) * 10;
    Affinity::Ranked(rank)
}

/// Number of leading path segments shared between a recorded path template
/// and a live path. A `:name`-style segment in the template matches any
/// live segment.
fn common_template_prefix(template: &str, live: &str) -> usize {
    template
        .split('/')
        .zip(live.split('/'))
        .take_while(|(pattern, segment)| {
            pattern == segment || (pattern.starts_with(':') && !segment.is_empty())
        })
        .count()
}

fn sql_affinity(recorded: &Value, live: &Value) -> Affinity {
    match (statement_of(recorded), statement_of(live)) {
        (Some(a), Some(b)) => {
            if normalize_statement(&a) == normalize_statement(&b) {
                Affinity::Ranked(1_000)
            } else {
                Affinity::Ranked(0)
            }
        }
        _ => Affinity::Neutral,
    }
}

/// Collapses whitespace and unifies positional parameter placeholders so
/// that `SELECT * FROM t WHERE id = $1` and `select * from t where id = ?`
/// compare equal.
pub(crate) fn normalize_statement(statement: &str) -> String {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    static WHITESPACE: OnceLock<Regex> = OnceLock::new();
    let placeholder = PLACEHOLDER.get_or_init(|| {
        #[allow(clippy::unwrap_used)]
        Regex::new(r"\$\d+").unwrap()
    });
    let whitespace = WHITESPACE.get_or_init(|| {
        #[allow(clippy::unwrap_used)]
        Regex::new(r"\s+").unwrap()
    });
    let lowered = statement.to_lowercase();
    let unified = placeholder.replace_all(&lowered, "?");
    whitespace.replace_all(unified.trim(), " ").to_string()
}

fn cache_affinity(recorded: &Value, live: &Value) -> Affinity {
    match (key_of(recorded), key_of(live)) {
        (Some(a), Some(b)) => Affinity::Decisive(a == b),
        _ => Affinity::Neutral,
    }
}
