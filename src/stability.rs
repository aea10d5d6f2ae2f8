//! Tagged stability log, one per wrapped agent.
//!
//! Flat text so any supervisor can grep it: each line is
//! `2026-08-02T10:11:12Z [health] message`.

use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StabilityTag {
    Health,
    Inject,
    Session,
    Kill,
}

impl StabilityTag {
    pub fn as_str(self) -> &'static str {
        match self {
            StabilityTag::Health => "health",
            StabilityTag::Inject => "inject",
            StabilityTag::Session => "session",
            StabilityTag::Kill => "kill",
        }
    }
}

#[derive(Debug, Clone)]
pub struct StabilityLog {
    path: PathBuf,
}

impl StabilityLog {
    pub fn new(data_dir: &Path, agent: &str) -> Self {
        Self {
            path: data_dir.join(format!("{agent}_stability.log")),
        }
    }

    pub fn record(&self, tag: StabilityTag, message: &str) {
        let line = format!(
            "{} [{}] {}\n",
            chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
            tag.as_str(),
            message
        );
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| file.write_all(line.as_bytes()));
        if let Err(error) = result {
            tracing::warn!(
                target = "chattr::stability",
                path = %self.path.display(),
                error = %error,
                "failed to append stability event"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_are_tagged_and_appended() {
        let dir = tempfile::tempdir().unwrap();
        let log = StabilityLog::new(dir.path(), "claude");
        log.record(StabilityTag::Inject, "wake-up delivered");
        log.record(StabilityTag::Kill, "sse threshold reached");

        let raw = std::fs::read_to_string(dir.path().join("claude_stability.log")).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("[inject] wake-up delivered"));
        assert!(lines[1].contains("[kill] sse threshold reached"));
    }
}
