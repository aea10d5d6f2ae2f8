//! Per-agent trigger queues: flat append-only JSONL files so that the hub
//! (writer) and the wrapper (reader) coordinate without opening a socket.
//!
//! The reader tracks a monotonic byte offset and only ever consumes whole
//! lines, so a partially flushed write is picked up on the next poll. The
//! offset is committed by the caller after the wake-up was actually
//! injected; a failed injection leaves the entries pending.

use std::{
    fs::OpenOptions,
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use crate::{
    error::Result,
    types::{now_epoch, TriggerEntry},
};

pub fn queue_path(data_dir: &Path, agent: &str) -> PathBuf {
    data_dir.join(format!("{agent}_queue"))
}

/// Hub side: append one wake-up entry.
#[derive(Debug, Clone)]
pub struct TriggerQueueWriter {
    path: PathBuf,
}

impl TriggerQueueWriter {
    pub fn new(data_dir: &Path, agent: &str) -> Self {
        Self {
            path: queue_path(data_dir, agent),
        }
    }

    pub fn push(&self, channel: &str, message_id: Option<u64>) -> Result<TriggerEntry> {
        let entry = TriggerEntry {
            channel: channel.to_string(),
            message_id,
            ts: now_epoch(),
        };
        let mut line = serde_json::to_string(&entry).expect("trigger entry serializes");
        line.push('\n');
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.flush()?;
        Ok(entry)
    }
}

/// Pending entries plus the offset to commit once they are handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTriggers {
    pub entries: Vec<TriggerEntry>,
    pub next_offset: u64,
}

/// Wrapper side: sole reader of one agent's queue.
#[derive(Debug)]
pub struct TriggerQueueReader {
    path: PathBuf,
    offset: u64,
}

impl TriggerQueueReader {
    pub fn new(data_dir: &Path, agent: &str) -> Self {
        Self {
            path: queue_path(data_dir, agent),
            offset: 0,
        }
    }

    /// Drop stale entries from a crashed prior session. Called once at
    /// wrapper startup.
    pub fn truncate(&mut self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, b"")?;
        self.offset = 0;
        Ok(())
    }

    /// Read complete lines past the committed offset without consuming
    /// them. Malformed lines are skipped but still advance the offset.
    pub fn poll(&mut self) -> Result<PendingTriggers> {
        let mut file = match std::fs::File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(PendingTriggers {
                    entries: Vec::new(),
                    next_offset: self.offset,
                })
            }
            Err(e) => return Err(e.into()),
        };

        let len = file.metadata()?.len();
        if len < self.offset {
            // File shrank underneath us (external truncation): start over.
            tracing::warn!(
                target = "chattr::queue",
                path = %self.path.display(),
                "queue file truncated externally, resetting offset"
            );
            self.offset = 0;
        }

        file.seek(SeekFrom::Start(self.offset))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;

        // Only consume up to the last complete line.
        let complete = match buf.iter().rposition(|b| *b == b'\n') {
            Some(pos) => pos + 1,
            None => {
                return Ok(PendingTriggers {
                    entries: Vec::new(),
                    next_offset: self.offset,
                })
            }
        };

        let mut entries = Vec::new();
        for line in String::from_utf8_lossy(&buf[..complete]).lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<TriggerEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(_) => {
                    tracing::warn!(
                        target = "chattr::queue",
                        path = %self.path.display(),
                        line,
                        "skipping malformed queue entry"
                    );
                }
            }
        }

        Ok(PendingTriggers {
            entries,
            next_offset: self.offset + complete as u64,
        })
    }

    /// Record that everything up to `offset` was injected successfully.
    pub fn commit(&mut self, offset: u64) {
        self.offset = offset;
    }

    /// True when entries were read but not yet committed, i.e. the wake-up
    /// has not demonstrably reached the agent.
    pub fn has_uncommitted(&mut self) -> Result<bool> {
        let pending = self.poll()?;
        Ok(!pending.entries.is_empty())
    }
}
