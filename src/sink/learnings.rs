// src/sink/learnings.rs
//! Date-named, append-only findings log with a per-file entry cap.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{read_json_opt, write_json_atomic, Envelope, PersistError};
use crate::crawl::types::{is_valid_source_name, Payload};

pub const DEFAULT_MAX_ENTRIES: usize = 500;

pub struct LearningsLog {
    dir: PathBuf,
    max_entries: usize,
    // serializes read-modify-write of the day file across sources
    write_lock: Mutex<()>,
}

impl LearningsLog {
    pub fn new(dir: impl Into<PathBuf>, max_entries: usize) -> Self {
        Self {
            dir: dir.into(),
            max_entries: max_entries.max(1),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for_day(&self, day: &str) -> PathBuf {
        self.dir.join(format!("{day}.json"))
    }

    pub fn append(&self, source_name: &str, finding: Payload) -> Result<usize, PersistError> {
        self.append_at(source_name, finding, Utc::now())
    }

    /// Append one record to today's file, dropping the oldest entries beyond
    /// the cap. Returns the number of entries in the file afterwards.
    pub fn append_at(
        &self,
        source_name: &str,
        finding: Payload,
        now: DateTime<Utc>,
    ) -> Result<usize, PersistError> {
        if !is_valid_source_name(source_name) {
            return Err(PersistError::InvalidName(source_name.to_string()));
        }
        let path = self.path_for_day(&now.format("%Y-%m-%d").to_string());

        let _guard = self.write_lock.lock();
        let mut entries: Vec<Envelope> = read_json_opt(&path)?.unwrap_or_default();
        entries.push(Envelope {
            source_name: source_name.to_string(),
            timestamp: now,
            data: finding,
        });
        if entries.len() > self.max_entries {
            let excess = entries.len() - self.max_entries;
            entries.drain(0..excess);
        }
        write_json_atomic(&path, &entries)?;
        Ok(entries.len())
    }

    pub fn read_day(&self, day: &str) -> Result<Vec<Envelope>, PersistError> {
        Ok(read_json_opt(&self.path_for_day(day))?.unwrap_or_default())
    }
}
