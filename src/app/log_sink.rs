use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Local;
use tracing::warn;

use crate::app::error::AppError;
use crate::app::models::LogChunk;

/// Append-only diagnostics file shared by install runs and recovered errors.
///
/// Writes go straight to the file descriptor (no userspace buffering), so a
/// run that is torn down mid-line still leaves every byte it received on disk.
/// Readers may tail the file concurrently through [`LogSink::read_since`].
pub struct LogSink {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl LogSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        if let Err(err) = self.try_append(bytes) {
            warn!(path = %self.path.display(), error = %err, "failed to append to log sink");
        }
    }

    /// Timestamped diagnostic line, same shape as the rest of the file.
    pub fn note(&self, message: &str) {
        let line = format!("{} INFO {}\n", Local::now().format("%Y-%m-%d %H:%M:%S"), message);
        self.append(line.as_bytes());
    }

    fn try_append(&self, bytes: &[u8]) -> Result<(), AppError> {
        let mut guard = self
            .file
            .lock()
            .map_err(|_| AppError::system("Log sink lock poisoned", ""))?;
        if guard.is_none() {
            if let Some(parent) = self.path.parent() {
                let _ = fs::create_dir_all(parent);
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .map_err(|err| AppError::system(format!("Failed to open log: {err}"), ""))?;
            *guard = Some(file);
        }
        let Some(file) = guard.as_mut() else {
            return Err(AppError::system("Log sink unavailable", ""));
        };
        file.write_all(bytes)
            .map_err(|err| AppError::system(format!("Failed to write log: {err}"), ""))?;
        Ok(())
    }

    /// Current end-of-file offset; capture it before an operation to read
    /// only what that operation appended.
    pub fn offset(&self) -> u64 {
        fs::metadata(&self.path).map(|meta| meta.len()).unwrap_or(0)
    }

    pub fn read_since(&self, offset: u64) -> Result<LogChunk, AppError> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(LogChunk {
                    text: String::new(),
                    next_offset: 0,
                });
            }
            Err(err) => {
                return Err(AppError::system(format!("Failed to open log: {err}"), ""));
            }
        };
        let len = file
            .metadata()
            .map_err(|err| AppError::system(format!("Failed to stat log: {err}"), ""))?
            .len();
        // Truncated or rotated underneath us: start over.
        let start = if offset > len { 0 } else { offset };
        file.seek(SeekFrom::Start(start))
            .map_err(|err| AppError::system(format!("Failed to seek log: {err}"), ""))?;
        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer)
            .map_err(|err| AppError::system(format!("Failed to read log: {err}"), ""))?;
        Ok(LogChunk {
            text: String::from_utf8_lossy(&buffer).to_string(),
            next_offset: start + buffer.len() as u64,
        })
    }

    pub fn tail(&self, max_bytes: u64) -> Result<LogChunk, AppError> {
        let len = self.offset();
        self.read_since(len.saturating_sub(max_bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn read_since_returns_only_new_bytes() {
        let tmp = TempDir::new().expect("tmp");
        let sink = LogSink::new(tmp.path().join("althea.log"));
        sink.append(b"first line\n");
        let mark = sink.offset();
        sink.append(b"second line\n");

        let chunk = sink.read_since(mark).expect("read");
        assert_eq!(chunk.text, "second line\n");
        assert_eq!(chunk.next_offset, sink.offset());
    }

    #[test]
    fn partial_lines_are_persisted() {
        let tmp = TempDir::new().expect("tmp");
        let sink = LogSink::new(tmp.path().join("althea.log"));
        sink.append(b"Signing Progress: 0.4");
        let raw = fs::read_to_string(sink.path()).expect("read");
        assert_eq!(raw, "Signing Progress: 0.4");
    }

    #[test]
    fn missing_file_reads_empty() {
        let tmp = TempDir::new().expect("tmp");
        let sink = LogSink::new(tmp.path().join("nope.log"));
        let chunk = sink.read_since(0).expect("read");
        assert!(chunk.text.is_empty());
        assert_eq!(chunk.next_offset, 0);
    }

    #[test]
    fn stale_offset_restarts_from_beginning() {
        let tmp = TempDir::new().expect("tmp");
        let sink = LogSink::new(tmp.path().join("althea.log"));
        sink.append(b"abc");
        let chunk = sink.read_since(999).expect("read");
        assert_eq!(chunk.text, "abc");
    }

    #[test]
    fn tail_limits_bytes() {
        let tmp = TempDir::new().expect("tmp");
        let sink = LogSink::new(tmp.path().join("althea.log"));
        sink.append(b"0123456789");
        let chunk = sink.tail(4).expect("tail");
        assert_eq!(chunk.text, "6789");
    }

    #[test]
    fn note_is_timestamped() {
        let tmp = TempDir::new().expect("tmp");
        let sink = LogSink::new(tmp.path().join("althea.log"));
        sink.note("paircheck: timed out");
        let raw = fs::read_to_string(sink.path()).expect("read");
        assert!(raw.ends_with(" INFO paircheck: timed out\n"));
    }
}
