use crate::error::Result;
use crate::services::ledger::SequenceFiles;
use crate::services::outcome::{FileEvent, FileOutcome, OutcomeSink};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const JOURNAL_FILE: &str = ".upload_history.jsonl";

/// One terminal transfer outcome, or a sequence's finalize marker, one
/// JSON line.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct UploadRecord {
    pub timestamp: String,
    pub sequence_id: String,
    pub path: PathBuf,
    pub outcome: FileOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Append-only log of per-file upload outcomes. These are the success
/// markers a resumed run reconciles the ledger against.
pub struct UploadJournal {
    path: PathBuf,
    lock: Mutex<()>,
}

impl UploadJournal {
    pub fn in_dir(root: &Path) -> Self {
        Self::at(root.join(JOURNAL_FILE))
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &UploadRecord) -> io::Result<()> {
        let line = serde_json::to_string(record)?;
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut out = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(out, "{}", line)
    }

    /// Latest outcome per path. A missing journal is an empty one; malformed
    /// lines are skipped.
    pub fn load(&self) -> Result<JournalState> {
        let mut state = JournalState::default();
        if !self.path.exists() {
            return Ok(state);
        }

        let reader = BufReader::new(File::open(&self.path)?);
        for (i, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<UploadRecord>(&line) {
                Ok(rec) => state.apply(rec),
                Err(err) => log::warn!("Skipping malformed journal entry {}: {}", i, err),
            }
        }
        Ok(state)
    }
}

impl OutcomeSink for UploadJournal {
    fn record(&self, event: &FileEvent<'_>) {
        if !matches!(event.outcome, FileOutcome::Uploaded | FileOutcome::Failed) {
            return;
        }
        let record = UploadRecord {
            timestamp: Utc::now().to_rfc3339(),
            sequence_id: event.sequence_id.unwrap_or_default().to_string(),
            path: event.path.to_path_buf(),
            outcome: event.outcome,
            error: event.error.map(String::from),
        };
        if let Err(e) = self.append(&record) {
            log::warn!("Failed to record outcome for {}: {}", event.path.display(), e);
        }
    }

    fn sequence_finalized(&self, sequence_id: &str) {
        let record = UploadRecord {
            timestamp: Utc::now().to_rfc3339(),
            sequence_id: sequence_id.to_string(),
            path: PathBuf::new(),
            outcome: FileOutcome::Finalized,
            error: None,
        };
        if let Err(e) = self.append(&record) {
            log::warn!("Failed to record finalize of sequence {}: {}", sequence_id, e);
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct JournalState {
    latest: BTreeMap<PathBuf, UploadRecord>,
    /// Sequences with no upload journaled after their finalize marker.
    finalized: BTreeSet<String>,
}

impl JournalState {
    fn apply(&mut self, rec: UploadRecord) {
        match rec.outcome {
            FileOutcome::Finalized => {
                self.finalized.insert(rec.sequence_id);
            }
            outcome => {
                // A later upload reopens the sequence.
                if outcome == FileOutcome::Uploaded {
                    self.finalized.remove(&rec.sequence_id);
                }
                self.latest.insert(rec.path.clone(), rec);
            }
        }
    }

    pub fn is_uploaded(&self, path: &Path) -> bool {
        self.latest
            .get(path)
            .is_some_and(|r| r.outcome == FileOutcome::Uploaded)
    }

    pub fn uploaded_count(&self) -> usize {
        self.count(FileOutcome::Uploaded)
    }

    pub fn failed_count(&self) -> usize {
        self.count(FileOutcome::Failed)
    }

    /// Files of `sequence_id` already uploaded, including ones moved away
    /// since.
    pub fn uploaded_in(&self, sequence_id: &str) -> usize {
        self.latest
            .values()
            .filter(|r| r.sequence_id == sequence_id && r.outcome == FileOutcome::Uploaded)
            .count()
    }

    pub fn is_finalized(&self, sequence_id: &str) -> bool {
        self.finalized.contains(sequence_id)
    }

    /// Uploaded files of `sequence_id` still waiting for a finalize.
    pub fn unfinalized_in(&self, sequence_id: &str) -> usize {
        if self.is_finalized(sequence_id) {
            0
        } else {
            self.uploaded_in(sequence_id)
        }
    }

    /// Sequences with uploaded files that were never finalized, or got more
    /// uploads after their last finalize.
    pub fn unfinalized_sequences(&self) -> BTreeSet<String> {
        self.latest
            .values()
            .filter(|r| r.outcome == FileOutcome::Uploaded && !self.is_finalized(&r.sequence_id))
            .map(|r| r.sequence_id.clone())
            .collect()
    }

    /// Every path journaled under `sequence_id`, whatever its outcome.
    pub fn paths_in(&self, sequence_id: &str) -> Vec<PathBuf> {
        self.latest
            .values()
            .filter(|r| r.sequence_id == sequence_id)
            .map(|r| r.path.clone())
            .collect()
    }

    /// Files whose latest outcome is a failure, grouped by the sequence they
    /// were uploaded under.
    pub fn failed_by_sequence(&self) -> SequenceFiles {
        let mut failed = SequenceFiles::new();
        for rec in self.latest.values() {
            if rec.outcome == FileOutcome::Failed {
                failed
                    .entry(rec.sequence_id.clone())
                    .or_default()
                    .push(rec.path.clone());
            }
        }
        failed
    }

    fn count(&self, outcome: FileOutcome) -> usize {
        self.latest.values().filter(|r| r.outcome == outcome).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_latest_outcome_wins() {
        let temp_dir = TempDir::new().unwrap();
        let journal = UploadJournal::in_dir(temp_dir.path());
        let a = Path::new("/photos/a.jpg");
        let b = Path::new("/photos/b.jpg");

        journal.record(&FileEvent::new(a, FileOutcome::Failed).in_sequence("s1").with_error("503"));
        journal.record(&FileEvent::new(b, FileOutcome::Failed).in_sequence("s1"));
        journal.record(&FileEvent::new(a, FileOutcome::Uploaded).in_sequence("s1"));

        let state = journal.load().unwrap();
        assert!(state.is_uploaded(a));
        assert!(!state.is_uploaded(b));
        assert_eq!(state.uploaded_count(), 1);
        assert_eq!(state.failed_count(), 1);
        assert_eq!(state.failed_by_sequence()["s1"], vec![b.to_path_buf()]);
    }

    #[test]
    fn test_finalize_marker_until_next_upload() {
        let temp_dir = TempDir::new().unwrap();
        let journal = UploadJournal::in_dir(temp_dir.path());
        let a = Path::new("/photos/a.jpg");
        let b = Path::new("/photos/b.jpg");

        journal.record(&FileEvent::new(a, FileOutcome::Uploaded).in_sequence("s1"));
        journal.record(&FileEvent::new(b, FileOutcome::Uploaded).in_sequence("s2"));
        let state = journal.load().unwrap();
        assert_eq!(state.unfinalized_in("s1"), 1);
        assert_eq!(state.unfinalized_sequences().len(), 2);

        journal.sequence_finalized("s1");
        let state = journal.load().unwrap();
        assert!(state.is_finalized("s1"));
        assert_eq!(state.unfinalized_in("s1"), 0);
        assert_eq!(state.uploaded_in("s1"), 1);
        assert_eq!(state.uploaded_count(), 2);
        assert_eq!(state.unfinalized_sequences().into_iter().collect::<Vec<_>>(), vec!["s2"]);

        // A retry adding to a closed sequence reopens it.
        let c = Path::new("/photos/c.jpg");
        journal.record(&FileEvent::new(c, FileOutcome::Uploaded).in_sequence("s1"));
        let state = journal.load().unwrap();
        assert!(!state.is_finalized("s1"));
        assert_eq!(state.unfinalized_in("s1"), 2);
        assert_eq!(state.paths_in("s1"), vec![a.to_path_buf(), c.to_path_buf()]);
    }

    #[test]
    fn test_non_transfer_outcomes_are_not_journaled() {
        let temp_dir = TempDir::new().unwrap();
        let journal = UploadJournal::in_dir(temp_dir.path());
        journal.record(&FileEvent::new(Path::new("/photos/a.jpg"), FileOutcome::Duplicate));
        journal.record(&FileEvent::new(Path::new("/photos/b.jpg"), FileOutcome::TagFailed));
        assert!(!journal.path().exists());
    }

    #[test]
    fn test_missing_journal_is_empty_and_bad_lines_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let journal = UploadJournal::in_dir(temp_dir.path());
        assert_eq!(journal.load().unwrap().failed_count(), 0);

        fs::write(
            journal.path(),
            "garbage\n{\"timestamp\":\"t\",\"sequence_id\":\"s\",\"path\":\"/x.jpg\",\"outcome\":\"failed\"}\n",
        )
        .unwrap();
        let state = journal.load().unwrap();
        assert_eq!(state.failed_count(), 1);
    }
}
