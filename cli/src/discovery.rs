//! Trace-file discovery: walk a directory for newline-delimited trace
//! files and turn them into test cases, keeping a stable order.

use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use drift_protocol::TestCase;
use drift_protocol::build_test_cases;
use drift_protocol::read_spans;
use tracing::debug;
use walkdir::WalkDir;

const TRACE_EXTENSIONS: [&str; 2] = ["jsonl", "ndjson"];

fn is_trace_file(path: &Path) -> bool {
    path.extension()
        .and_then(|extension| extension.to_str())
        .map(|extension| TRACE_EXTENSIONS.contains(&extension))
        .unwrap_or(false)
}

/// Finds every trace file under `root`, sorted by path so that runs are
/// deterministic regardless of directory iteration order.
pub fn discover_trace_files(root: &Path) -> anyhow::Result<Vec<PathBuf>> {
    if !root.exists() {
        anyhow::bail!("trace directory {} does not exist", root.display());
    }
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| is_trace_file(path))
        .collect();
    files.sort();
    Ok(files)
}

/// Parses every discovered trace file into test cases, in file order.
pub fn load_tests(root: &Path) -> anyhow::Result<Vec<TestCase>> {
    let mut tests = Vec::new();
    for path in discover_trace_files(root)? {
        let spans = read_spans(&path)
            .with_context(|| format!("failed to parse trace file {}", path.display()))?;
        let cases = build_test_cases(spans)
            .with_context(|| format!("failed to plan tests from {}", path.display()))?;
        debug!(path = %path.display(), tests = cases.len(), "loaded trace file");
        tests.extend(cases);
    }
    Ok(tests)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    fn write_trace(dir: &Path, name: &str, trace_id: &str) {
        let mut file = std::fs::File::create(dir.join(name)).unwrap();
        writeln!(
            file,
            r#"{{"trace_id":"{trace_id}","span_id":"{trace_id}-root","kind":"SERVER","is_root":true,"input_value":{{"method":"GET","path":"/"}},"output_value":{{"status":200}}}}"#
        )
        .unwrap();
    }

    #[test]
    fn discovers_only_trace_extensions_sorted() {
        let dir = tempfile::tempdir().unwrap();
        write_trace(dir.path(), "b.jsonl", "t2");
        write_trace(dir.path(), "a.ndjson", "t1");
        std::fs::write(dir.path().join("notes.txt"), "not a trace").unwrap();

        let files = discover_trace_files(dir.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|path| path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.ndjson", "b.jsonl"]);
    }

    #[test]
    fn loads_tests_in_file_order() {
        let dir = tempfile::tempdir().unwrap();
        write_trace(dir.path(), "01-first.jsonl", "t1");
        write_trace(dir.path(), "02-second.jsonl", "t2");

        let tests = load_tests(dir.path()).unwrap();
        let ids: Vec<&str> = tests.iter().map(|test| test.trace_id.as_str()).collect();
        assert_eq!(ids, vec!["t1", "t2"]);
    }

    #[test]
    fn missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(load_tests(&missing).is_err());
    }

    #[test]
    fn malformed_files_carry_their_path_in_the_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.jsonl"), "{broken\n").unwrap();
        let err = load_tests(dir.path()).unwrap_err();
        assert!(format!("{err:#}").contains("bad.jsonl"));
    }
}
