//! Append-only log of escape-triggered unlocks, one JSON object per line.

use crate::escape::ObservationPoint;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub at: DateTime<Local>,
    pub event: String,
    pub point: String,
}

pub struct Journal {
    path: PathBuf,
}

impl Journal {
    pub fn default_path() -> PathBuf {
        let mut path = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push("inputlock");
        path.push("unlock_log.jsonl");
        path
    }

    pub fn default_location() -> Self {
        Self::at(Self::default_path())
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record_escape_unlock(&self, point: ObservationPoint) -> io::Result<()> {
        let entry = JournalEntry {
            at: Local::now(),
            event: "escape-unlock".into(),
            point: point.name().into(),
        };
        log::warn!("Pointer lock released by escape key at {}", entry.point);
        self.append(&entry)
    }

    fn append(&self, entry: &JournalEntry) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())
    }

    /// Reads back every well-formed entry; malformed lines are skipped.
    pub fn entries(&self) -> io::Result<Vec<JournalEntry>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        Ok(contents
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}
