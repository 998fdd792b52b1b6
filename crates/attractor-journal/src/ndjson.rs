use crate::store::{JournalError, JournalResult};
use crate::types::Turn;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

pub const JOURNAL_FILE_NAME: &str = "journal.ndjson";

/// Append-only on-disk journal, one JSON-encoded turn per line.
///
/// Every append is flushed and fsynced before returning; the caller must not
/// advance its in-memory head until the append has succeeded.
#[derive(Debug)]
pub struct NdjsonJournal {
    path: PathBuf,
    file: File,
}

impl NdjsonJournal {
    pub fn open_under(logs_root: &Path) -> JournalResult<Self> {
        fs::create_dir_all(logs_root).map_err(|error| {
            JournalError::Backend(format!(
                "failed to create logs root '{}': {}",
                logs_root.display(),
                error
            ))
        })?;
        Self::open(logs_root.join(JOURNAL_FILE_NAME))
    }

    pub fn open(path: PathBuf) -> JournalResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|error| {
                JournalError::Backend(format!(
                    "failed to open journal '{}': {}",
                    path.display(),
                    error
                ))
            })?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, turn: &Turn) -> JournalResult<()> {
        let mut line = serde_json::to_vec(turn)
            .map_err(|error| JournalError::Serialization(error.to_string()))?;
        line.push(b'\n');
        self.file.write_all(&line).map_err(|error| {
            JournalError::Backend(format!(
                "failed to append to journal '{}': {}",
                self.path.display(),
                error
            ))
        })?;
        self.file.sync_all().map_err(|error| {
            JournalError::Backend(format!(
                "failed to sync journal '{}': {}",
                self.path.display(),
                error
            ))
        })
    }

    /// Reads the full journal back, oldest first. A trailing partial line
    /// (torn write from a crash) is ignored.
    pub fn read_all(path: &Path) -> JournalResult<Vec<Turn>> {
        let file = File::open(path).map_err(|error| {
            JournalError::Backend(format!(
                "failed to read journal '{}': {}",
                path.display(),
                error
            ))
        })?;

        let mut turns = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|error| {
                JournalError::Backend(format!(
                    "failed to read journal line from '{}': {}",
                    path.display(),
                    error
                ))
            })?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Turn>(&line) {
                Ok(turn) => turns.push(turn),
                Err(_) => break,
            }
        }
        Ok(turns)
    }
}
