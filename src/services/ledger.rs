use crate::error::{PipelineError, Result};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

pub const LEDGER_FILE: &str = "PROCESSING_LOG.json";

/// Sequence id -> ordered file list.
pub type SequenceFiles = BTreeMap<String, Vec<PathBuf>>;

/// Finished segmentation and tagging work. Its presence means "do not
/// resegment": a rerun reads it back instead.
#[derive(Debug, Clone)]
pub struct ProcessingLedger {
    path: PathBuf,
}

impl ProcessingLedger {
    pub fn in_dir(root: &Path) -> Self {
        Self::at(root.join(LEDGER_FILE))
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Replace the ledger atomically: the new content goes to a temp file in
    /// the same directory and is renamed over the old one, so readers see
    /// either the old or the new ledger.
    pub fn write(&self, sequences: &SequenceFiles) -> Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        let mut tmp = NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, sequences)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| PipelineError::Io(e.error))?;

        log::info!(
            "Wrote processing ledger {} ({} sequence(s))",
            self.path.display(),
            sequences.len()
        );
        Ok(())
    }

    /// Read the ledger back. Paths that vanished since it was written are
    /// dropped; anything that is not a map of id -> path list is corrupt.
    pub fn read(&self) -> Result<SequenceFiles> {
        let content = fs::read_to_string(&self.path)?;
        let stored: SequenceFiles =
            serde_json::from_str(&content).map_err(|e| PipelineError::LedgerCorrupt {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;

        if let Some(id) = stored.keys().find(|id| id.trim().is_empty()) {
            return Err(PipelineError::LedgerCorrupt {
                path: self.path.clone(),
                reason: format!("empty sequence identifier {:?}", id),
            });
        }

        Ok(stored
            .into_iter()
            .map(|(id, files)| {
                let before = files.len();
                let existing: Vec<PathBuf> = files.into_iter().filter(|f| f.exists()).collect();
                if existing.len() < before {
                    log::info!(
                        "Sequence {}: {} file(s) no longer on disk",
                        id,
                        before - existing.len()
                    );
                }
                (id, existing)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_then_read() {
        let temp_dir = TempDir::new().unwrap();
        let a = temp_dir.path().join("a.jpg");
        let b = temp_dir.path().join("b.jpg");
        fs::write(&a, b"a").unwrap();
        fs::write(&b, b"b").unwrap();

        let mut sequences = SequenceFiles::new();
        sequences.insert("seq-1".to_string(), vec![b.clone(), a.clone()]);

        let ledger = ProcessingLedger::in_dir(temp_dir.path());
        assert!(!ledger.exists());
        ledger.write(&sequences).unwrap();
        assert!(ledger.exists());

        let read = ledger.read().unwrap();
        assert_eq!(read["seq-1"], vec![b, a]);
    }

    #[test]
    fn test_ledger_is_indented_json() {
        let temp_dir = TempDir::new().unwrap();
        let ledger = ProcessingLedger::in_dir(temp_dir.path());
        let mut sequences = SequenceFiles::new();
        sequences.insert("seq-1".to_string(), vec![PathBuf::from("/x/a.jpg")]);
        ledger.write(&sequences).unwrap();

        let raw = fs::read_to_string(ledger.path()).unwrap();
        assert!(raw.contains("\n  \"seq-1\": ["));
    }

    #[test]
    fn test_vanished_paths_are_dropped() {
        let temp_dir = TempDir::new().unwrap();
        let kept = temp_dir.path().join("kept.jpg");
        fs::write(&kept, b"x").unwrap();

        let mut sequences = SequenceFiles::new();
        sequences.insert(
            "seq-1".to_string(),
            vec![kept.clone(), temp_dir.path().join("gone.jpg")],
        );
        let ledger = ProcessingLedger::in_dir(temp_dir.path());
        ledger.write(&sequences).unwrap();

        assert_eq!(ledger.read().unwrap()["seq-1"], vec![kept]);
    }

    #[test]
    fn test_malformed_ledger_is_corrupt() {
        let temp_dir = TempDir::new().unwrap();
        let ledger = ProcessingLedger::in_dir(temp_dir.path());

        for body in [
            "not json",
            "[\"a\", \"b\"]",
            "{\"seq-1\": \"/x/a.jpg\"}",
            "{\"seq-1\": [1, 2]}",
            "{\"\": []}",
        ] {
            fs::write(ledger.path(), body).unwrap();
            assert!(
                matches!(ledger.read(), Err(PipelineError::LedgerCorrupt { .. })),
                "accepted {}",
                body
            );
        }
    }

    #[test]
    fn test_rewrite_replaces_whole_file() {
        let temp_dir = TempDir::new().unwrap();
        let ledger = ProcessingLedger::in_dir(temp_dir.path());

        let mut first = SequenceFiles::new();
        first.insert("old".to_string(), vec![]);
        ledger.write(&first).unwrap();

        let mut second = SequenceFiles::new();
        second.insert("new".to_string(), vec![]);
        ledger.write(&second).unwrap();

        let read = ledger.read().unwrap();
        assert_eq!(read.keys().collect::<Vec<_>>(), vec!["new"]);
    }
}
