//! Result persistence: one JSON line per test in input order, then a
//! summary record. This file is the only state a run leaves behind.

use std::fs::File;
use std::io::BufWriter;
use std::io::Write;
use std::path::Path;

use serde::Serialize;

use super::RunSummary;
use super::TestResult;

#[derive(Serialize)]
struct SummaryRecord<'a> {
    summary: &'a RunSummary,
}

pub fn write_results(
    path: &Path,
    results: &[TestResult],
    summary: &RunSummary,
) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    for result in results {
        let line = serde_json::to_string(result)?;
        writeln!(writer, "{line}")?;
    }
    let footer = serde_json::to_string(&SummaryRecord { summary })?;
    writeln!(writer, "{footer}")?;
    writer.flush()
}
