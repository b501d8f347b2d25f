//! Filesystem primitives shared by the stores under `.ralph/`.
//!
//! Every file another process may read (the dashboard polls several of them)
//! is replaced atomically: write a sibling temp file, then rename over.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

/// Atomically replace `path` with `contents` (temp file + rename).
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = parent_dir(path)?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp = tmp_path(path);
    fs::write(&tmp, contents).with_context(|| format!("write temp file {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

/// Serialize `value` as pretty JSON with a trailing newline and replace `path` atomically.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value).context("serialize json")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Like [`write_atomic`], but fsyncs the file and its directory before returning.
///
/// Used for snapshots that must survive a crash during a following call.
pub fn write_durable(path: &Path, contents: &str) -> Result<()> {
    let parent = parent_dir(path)?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp = tmp_path(path);
    {
        let mut file =
            File::create(&tmp).with_context(|| format!("create temp file {}", tmp.display()))?;
        file.write_all(contents.as_bytes())
            .with_context(|| format!("write temp file {}", tmp.display()))?;
        file.sync_all()
            .with_context(|| format!("sync temp file {}", tmp.display()))?;
    }
    fs::rename(&tmp, path).with_context(|| format!("replace {}", path.display()))?;
    // Directory fsync is best-effort: not every platform allows opening a directory.
    if let Ok(dir) = File::open(parent) {
        let _ = dir.sync_all();
    }
    Ok(())
}

/// Append one compact JSON object as a line to `path`, creating it if needed.
pub fn append_jsonl<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = parent_dir(path)?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut line = serde_json::to_string(value).context("serialize jsonl record")?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("append {}", path.display()))
}

/// Read file contents, returning `None` for missing files.
pub fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("read {}", path.display())),
    }
}

fn parent_dir(path: &Path) -> Result<&Path> {
    path.parent()
        .with_context(|| format!("path missing parent {}", path.display()))
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_leaves_no_temp_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested").join("state.json");
        write_json_atomic(&path, &serde_json::json!({"a": 1})).expect("write");
        assert_eq!(
            fs::read_to_string(&path).expect("read"),
            "{\n  \"a\": 1\n}\n"
        );
        assert!(!temp.path().join("nested").join("state.json.tmp").exists());
    }

    #[test]
    fn append_jsonl_writes_one_line_per_record() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("events.jsonl");
        append_jsonl(&path, &serde_json::json!({"n": 1})).expect("append");
        append_jsonl(&path, &serde_json::json!({"n": 2})).expect("append");
        let contents = fs::read_to_string(&path).expect("read");
        assert_eq!(contents, "{\"n\":1}\n{\"n\":2}\n");
    }

    #[test]
    fn read_optional_maps_missing_to_none() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert_eq!(
            read_optional(&temp.path().join("nope")).expect("read"),
            None
        );
    }
}
