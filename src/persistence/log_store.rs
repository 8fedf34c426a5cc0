//! Append-only message journal
//!
//! Every produced message is written here before it becomes visible in a
//! topic queue, and erased only when it is acknowledged. On startup the
//! broker replays the file to rebuild its queues.
//!
//! Format: one encoded message per line (see `Message::encode`).
//!
//! Removal rewrites the whole file into `<path>.tmp` without the target
//! record and renames it over the original, so each ACK costs O(log size).
//! That is the known scalability ceiling of this store.
//!
//! The log does no locking of its own; the broker serializes all calls.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::broker::message::{Message, record_id};
use crate::utils::error::PersistenceError;

#[derive(Debug, Clone)]
pub struct MessageLog {
    path: PathBuf,
}

impl MessageLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(".tmp");
        PathBuf::from(name)
    }

    /// Durably append one record. Returns once the bytes are synced.
    pub fn append(&self, message: &Message) -> Result<(), PersistenceError> {
        let write = || -> io::Result<()> {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            let mut writer = BufWriter::new(file);
            writeln!(writer, "{}", message.encode())?;
            writer.flush()?;
            writer.get_ref().sync_data()
        };
        write().map_err(|e| PersistenceError::io(&self.path, "append", e))
    }

    /// Rewrite the log without the record for `message_id`.
    ///
    /// Returns `Ok(false)` when no such record exists, in which case the file
    /// is left untouched.
    pub fn remove_by_id(&self, message_id: &str) -> Result<bool, PersistenceError> {
        let source = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(PersistenceError::io(&self.path, "open for rewrite", e)),
        };

        let temp_path = self.temp_path();
        let rewrite = || -> io::Result<bool> {
            let mut writer = BufWriter::new(File::create(&temp_path)?);
            let mut removed = false;
            for line in BufReader::new(source).lines() {
                let line = line?;
                if record_id(&line) == Some(message_id) {
                    removed = true;
                    continue;
                }
                writeln!(writer, "{line}")?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
            Ok(removed)
        };

        let removed = match rewrite() {
            Ok(removed) => removed,
            Err(e) => {
                let _ = fs::remove_file(&temp_path);
                return Err(PersistenceError::io(&self.path, "rewrite", e));
            }
        };

        if !removed {
            let _ = fs::remove_file(&temp_path);
            debug!("No log record for message [{message_id}]; log left unchanged");
            return Ok(false);
        }

        fs::rename(&temp_path, &self.path)
            .map_err(|e| PersistenceError::io(&self.path, "replace", e))?;
        Ok(true)
    }

    /// Read back every decodable record in file order.
    ///
    /// A missing file is an empty log. Undecodable lines are skipped with a
    /// warning rather than failing the whole replay.
    pub fn replay(&self) -> Result<Vec<Message>, PersistenceError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(
                    "Log file {} not found. Starting with a clean state.",
                    self.path.display()
                );
                return Ok(Vec::new());
            }
            Err(e) => return Err(PersistenceError::io(&self.path, "open for replay", e)),
        };

        let mut messages = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| PersistenceError::io(&self.path, "replay", e))?;
            if line.trim().is_empty() {
                continue;
            }
            match Message::decode(&line) {
                Ok(message) => messages.push(message),
                Err(e) => warn!("Skipping log line {}: {e}", index + 1),
            }
        }
        Ok(messages)
    }
}
