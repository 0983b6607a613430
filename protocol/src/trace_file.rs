//! Reading and writing newline-delimited trace files.

use std::fs::File;
use std::io::BufRead;
use std::io::BufReader;
use std::io::BufWriter;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use thiserror::Error;

use crate::span::Span;

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}:{line}: malformed span: {source}")]
    Malformed {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("trace {trace_id} has no root span")]
    MissingRoot { trace_id: String },
}

/// Parses a trace file: one JSON-encoded span per line, blank lines
/// skipped. A malformed line aborts with its 1-based line number.
pub fn read_spans(path: &Path) -> Result<Vec<Span>, TraceError> {
    let file = File::open(path).map_err(|source| TraceError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let reader = BufReader::new(file);

    let mut spans = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line.map_err(|source| TraceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if line.trim().is_empty() {
            continue;
        }
        let mut span: Span =
            serde_json::from_str(&line).map_err(|source| TraceError::Malformed {
                path: path.to_path_buf(),
                line: index + 1,
                source,
            })?;
        span.reconcile_kind();
        spans.push(span);
    }
    Ok(spans)
}

/// Writes spans back out in the same newline-delimited schema. Re-emitting
/// a parsed file yields equivalent lines modulo field ordering.
pub fn write_spans(path: &Path, spans: &[Span]) -> Result<(), TraceError> {
    let file = File::create(path).map_err(|source| TraceError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut writer = BufWriter::new(file);
    for span in spans {
        let line = serde_json::to_string(span).map_err(|source| TraceError::Malformed {
            path: path.to_path_buf(),
            line: 0,
            source,
        })?;
        writeln!(writer, "{line}").map_err(|source| TraceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    }
    writer.flush().map_err(|source| TraceError::Io {
        path: path.to_path_buf(),
        source,
    })
}
