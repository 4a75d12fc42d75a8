//! File-backed queue table inspired by Yaque.
//!
//! Entries are kept in memory and mirrored to a JSON-lines file so queued
//! deployment requests survive a scheduler restart.

use std::fs::{create_dir_all, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::QueueState;
use crate::core::model::QueueEntry;
use crate::core::{QueueStore, SchedulerError};
use crate::util::serde::BackendKind;

/// File-backed queue using JSON lines for durability.
pub struct YaqueQueue {
    path: PathBuf,
    stream: String,
    state: Mutex<QueueState>,
}

impl YaqueQueue {
    /// Open (or create) the queue stored at `path/<stream>.jsonl`.
    pub fn new(path: impl AsRef<Path>, stream: impl Into<String>) -> Result<Self, SchedulerError> {
        let path = path.as_ref().to_path_buf();
        create_dir_all(&path)?;
        let queue = Self {
            path,
            stream: stream.into(),
            state: Mutex::new(QueueState::default()),
        };
        queue.load_from_disk()?;
        Ok(queue)
    }

    fn file_path(&self) -> PathBuf {
        self.path.join(format!("{}.jsonl", self.stream))
    }

    fn load_from_disk(&self) -> Result<(), SchedulerError> {
        let file_path = self.file_path();
        if !file_path.exists() {
            return Ok(());
        }
        let file = OpenOptions::new().read(true).open(&file_path)?;
        let mut state = self.state.lock();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: QueueEntry = serde_json::from_str(&line)?;
            if let Err(e) = state.restore(entry) {
                tracing::warn!(error = %e, "skipping duplicate queue entry on load");
            }
        }
        tracing::debug!(entries = state.len(), file = %file_path.display(), "loaded queue from disk");
        Ok(())
    }

    fn append_to_disk(&self, entry: &QueueEntry) -> Result<(), SchedulerError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.file_path())?;
        writeln!(file, "{}", serde_json::to_string(entry)?)?;
        Ok(())
    }

    fn rewrite_disk(&self, state: &QueueState) -> Result<(), SchedulerError> {
        let tmp = self.path.join(format!("{}.jsonl.tmp", self.stream));
        {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            for entry in state.entries() {
                writeln!(file, "{}", serde_json::to_string(entry)?)?;
            }
            file.sync_all()?;
        }
        std::fs::rename(&tmp, self.file_path())?;
        Ok(())
    }
}

#[async_trait]
impl QueueStore for YaqueQueue {
    async fn push(&self, entry: QueueEntry) -> Result<QueueEntry, SchedulerError> {
        let mut state = self.state.lock();
        let entry = state.push(entry)?;
        if let Err(e) = self.append_to_disk(&entry) {
            state.remove(&entry.bot_id);
            return Err(e);
        }
        Ok(entry)
    }

    async fn remove(&self, bot_id: &str) -> Result<Option<QueueEntry>, SchedulerError> {
        let mut state = self.state.lock();
        let removed = state.remove(bot_id);
        if removed.is_some() {
            self.rewrite_disk(&state)?;
        }
        Ok(removed)
    }

    async fn list(&self, backend: Option<BackendKind>) -> Result<Vec<QueueEntry>, SchedulerError> {
        Ok(self.state.lock().list(backend))
    }

    async fn contains(&self, bot_id: &str) -> Result<bool, SchedulerError> {
        Ok(self.state.lock().contains(bot_id))
    }

    async fn len(&self) -> Result<usize, SchedulerError> {
        Ok(self.state.lock().len())
    }
}
