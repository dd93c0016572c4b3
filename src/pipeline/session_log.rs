//! Append-only session transcript log.
//!
//! One JSON line per finalized utterance. Audio is never persisted. The
//! file path is templated by the pipeline start time; an unset path
//! disables the log entirely.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// One finalized utterance, as written to the log and carried on the
/// health channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEntry {
    pub sequence: u64,
    /// Milliseconds between pipeline start and the utterance origin.
    pub origin_offset_ms: u64,
    pub original_text: String,
    pub translated_text: String,
    pub stt_latency_ms: u64,
    pub translate_latency_ms: u64,
    pub synth_latency_ms: u64,
}

/// Append-only writer for session entries.
pub struct SessionLog {
    writer: BufWriter<File>,
    path: PathBuf,
}

impl SessionLog {
    /// Opens the log at a path built from the template, replacing `{start}`
    /// with the formatted start time.
    pub fn create(template: &str, start: chrono::DateTime<chrono::Local>) -> Result<Self> {
        let resolved = template.replace("{start}", &start.format("%Y%m%d-%H%M%S").to_string());
        Self::open(Path::new(&resolved))
    }

    /// Opens (appending) the log at an exact path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
        })
    }

    /// Appends one entry and flushes, so a crash loses at most the entry
    /// being written.
    pub fn append(&mut self, entry: &SessionEntry) -> Result<()> {
        let line = serde_json::to_string(entry).map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
        })?;
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }

    /// The resolved log path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(sequence: u64) -> SessionEntry {
        SessionEntry {
            sequence,
            origin_offset_ms: 1200,
            original_text: "hola cómo estás".to_string(),
            translated_text: "hello, how are you?".to_string(),
            stt_latency_ms: 250,
            translate_latency_ms: 150,
            synth_latency_ms: 300,
        }
    }

    #[test]
    fn test_append_writes_json_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("session.jsonl");

        let mut log = SessionLog::open(&path).unwrap();
        log.append(&entry(0)).unwrap();
        log.append(&entry(1)).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: SessionEntry = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first, entry(0));
        let second: SessionEntry = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second.sequence, 1);
    }

    #[test]
    fn test_append_only_across_reopens() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("session.jsonl");

        {
            let mut log = SessionLog::open(&path).unwrap();
            log.append(&entry(0)).unwrap();
        }
        {
            let mut log = SessionLog::open(&path).unwrap();
            log.append(&entry(1)).unwrap();
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[test]
    fn test_template_replaces_start_time() {
        let dir = TempDir::new().unwrap();
        let template = dir
            .path()
            .join("session-{start}.jsonl")
            .to_string_lossy()
            .to_string();

        let start = chrono::Local::now();
        let log = SessionLog::create(&template, start).unwrap();

        let name = log.path().file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("session-"));
        assert!(!name.contains("{start}"));
        assert!(log.path().exists());
    }

    #[test]
    fn test_creates_missing_parent_directories() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/deeper/session.jsonl");

        let mut log = SessionLog::open(&path).unwrap();
        log.append(&entry(0)).unwrap();
        assert!(path.exists());
    }
}
