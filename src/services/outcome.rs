// Post-stage callbacks. The pipeline only classifies files; moving them
// around or recording outcomes is done by whoever listens here.

use crate::core::scanner::{DUPLICATES_FOLDER, SUCCESS_FOLDER};
use crate::services::tagging::SidecarTagger;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileOutcome {
    Duplicate,
    MissingMetadata,
    /// The upload description could not be written; the file is left out
    /// of every sequence.
    TagFailed,
    Uploaded,
    Failed,
    /// Sequence-level: the sequence's destination was closed. Carries no
    /// path.
    Finalized,
}

#[derive(Debug, Clone, Copy)]
pub struct FileEvent<'a> {
    pub path: &'a Path,
    pub sequence_id: Option<&'a str>,
    pub outcome: FileOutcome,
    pub error: Option<&'a str>,
}

impl<'a> FileEvent<'a> {
    pub fn new(path: &'a Path, outcome: FileOutcome) -> Self {
        Self {
            path,
            sequence_id: None,
            outcome,
            error: None,
        }
    }

    pub fn in_sequence(mut self, sequence_id: &'a str) -> Self {
        self.sequence_id = Some(sequence_id);
        self
    }

    pub fn with_error(mut self, error: &'a str) -> Self {
        self.error = Some(error);
        self
    }
}

/// Receives every terminal per-file outcome. Called from worker threads;
/// implementations report their own failures instead of returning them.
pub trait OutcomeSink: Sync {
    fn record(&self, event: &FileEvent<'_>);

    /// Called once a sequence has been finalized.
    fn sequence_finalized(&self, _sequence_id: &str) {}
}

pub struct NoopSink;

impl OutcomeSink for NoopSink {
    fn record(&self, _event: &FileEvent<'_>) {}
}

/// Forwards each event to every inner sink, in order.
pub struct FanOut<'a>(pub Vec<&'a dyn OutcomeSink>);

impl OutcomeSink for FanOut<'_> {
    fn record(&self, event: &FileEvent<'_>) {
        for sink in &self.0 {
            sink.record(event);
        }
    }

    fn sequence_finalized(&self, sequence_id: &str) {
        for sink in &self.0 {
            sink.sequence_finalized(sequence_id);
        }
    }
}

/// Moves uploaded files to `<parent>/success/` and duplicates to
/// `<parent>/duplicates/`, together with their sidecar description if there
/// is one. Failed files stay where they are so a retry can find them.
pub struct FolderMover {
    pub dry_run: bool,
}

impl FolderMover {
    pub fn new() -> Self {
        Self { dry_run: false }
    }

    fn destination(path: &Path, folder: &str) -> Option<PathBuf> {
        let parent = path.parent()?;
        let file_name = path.file_name()?;
        Some(parent.join(folder).join(file_name))
    }

    fn move_into(&self, path: &Path, folder: &str) {
        self.move_file(path, folder);
        let sidecar = SidecarTagger::sidecar_path(path);
        if sidecar.exists() {
            self.move_file(&sidecar, folder);
        }
    }

    fn move_file(&self, path: &Path, folder: &str) {
        let Some(dest) = Self::destination(path, folder) else {
            log::warn!("Cannot determine destination for {}", path.display());
            return;
        };
        if self.dry_run {
            log::info!("[dry-run] MOVE {} → {}", path.display(), dest.display());
            return;
        }

        let result = dest
            .parent()
            .map_or(Ok(()), fs::create_dir_all)
            .and_then(|_| fs::rename(path, &dest));
        match result {
            Ok(()) => log::debug!("Moved {} → {}", path.display(), dest.display()),
            Err(e) => log::warn!("Failed to move {} → {}: {}", path.display(), dest.display(), e),
        }
    }
}

impl Default for FolderMover {
    fn default() -> Self {
        Self::new()
    }
}

impl OutcomeSink for FolderMover {
    fn record(&self, event: &FileEvent<'_>) {
        match event.outcome {
            FileOutcome::Uploaded => self.move_into(event.path, SUCCESS_FOLDER),
            FileOutcome::Duplicate => self.move_into(event.path, DUPLICATES_FOLDER),
            FileOutcome::Failed
            | FileOutcome::MissingMetadata
            | FileOutcome::TagFailed
            | FileOutcome::Finalized => {}
        }
    }
}
