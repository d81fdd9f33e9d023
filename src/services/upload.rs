//! Drives per-sequence upload and the gated finalize step.
//!
//! Files of one sequence are transferred independently on a bounded pool; a
//! failing file is retried, then marked failed, and never stops its
//! siblings. Finalize runs once for the whole run, after every transfer has
//! finished, and only when confirmed.

use crate::error::{PipelineError, Result, TransportError};
use crate::services::config::UploadConfig;
use crate::services::journal::JournalState;
use crate::services::ledger::SequenceFiles;
use crate::services::outcome::{FileEvent, FileOutcome, OutcomeSink};
use crate::services::prompt::{confirm, Decision, DecisionProvider, MAX_PROMPT_ATTEMPTS};
use crate::services::transport::{
    file_name, remote_names, SessionState, UploadTarget, UploadTransport,
};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct UploadOptions {
    pub threads: usize,
    pub max_attempts: usize,
    pub retry_delay: Duration,
}

impl UploadOptions {
    pub fn from_config(config: &UploadConfig) -> Self {
        Self {
            threads: config.threads(),
            max_attempts: config.max_attempts,
            retry_delay: config.retry_delay,
        }
    }
}

/// Files to transfer for one sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct SequencePlan {
    pub sequence_id: String,
    pub files: Vec<PathBuf>,
    /// Files of this sequence a previous run uploaded and nobody finalized
    /// since. They still count toward finalizing it.
    pub previously_uploaded: usize,
    /// Remote name of each file, unique within the sequence.
    pub names: BTreeMap<PathBuf, String>,
}

impl SequencePlan {
    pub fn new(sequence_id: impl Into<String>, files: Vec<PathBuf>) -> Self {
        let names = remote_names(&files);
        Self {
            sequence_id: sequence_id.into(),
            files,
            previously_uploaded: 0,
            names,
        }
    }

    /// Name files against every file the sequence has, not only the ones
    /// this run transfers, so a retry keeps the names of the first attempt.
    pub fn with_siblings(mut self, siblings: &[PathBuf]) -> Self {
        let mut names = remote_names(self.files.iter().chain(siblings));
        names.retain(|path, _| self.files.contains(path));
        self.names = names;
        self
    }

    pub fn previously_uploaded(mut self, count: usize) -> Self {
        self.previously_uploaded = count;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadMode {
    /// Every file of every ledger sequence.
    All,
    /// Ledger files without an upload success marker.
    Outstanding,
    /// Exactly the files whose latest journaled outcome is a failure, plus
    /// any sequence left unfinalized.
    RetryFailed,
    /// No transfers; only sequences with uploads nobody finalized.
    Unfinalized,
}

/// Decide which files each sequence still has to transfer.
pub fn plan(ledger: &SequenceFiles, journal: &JournalState, mode: UploadMode) -> Vec<SequencePlan> {
    let siblings = |id: &str| -> Vec<PathBuf> {
        let mut paths = journal.paths_in(id);
        paths.extend(ledger.get(id).into_iter().flatten().cloned());
        paths
    };

    match mode {
        UploadMode::All => ledger
            .iter()
            .map(|(id, files)| SequencePlan::new(id.clone(), files.clone()))
            .collect(),
        UploadMode::Outstanding => ledger
            .iter()
            .map(|(id, files)| {
                let outstanding = files
                    .iter()
                    .filter(|f| !journal.is_uploaded(f))
                    .cloned()
                    .collect();
                SequencePlan::new(id.clone(), outstanding)
                    .with_siblings(&siblings(id))
                    .previously_uploaded(journal.unfinalized_in(id))
            })
            // Fully uploaded and finalized: nothing left to do.
            .filter(|p| !(p.files.is_empty() && journal.is_finalized(&p.sequence_id)))
            .collect(),
        UploadMode::RetryFailed => {
            let mut failed = journal.failed_by_sequence();
            for id in journal.unfinalized_sequences() {
                failed.entry(id).or_default();
            }
            failed
                .into_iter()
                .map(|(id, files)| {
                    let previous = journal.unfinalized_in(&id);
                    let known = siblings(&id);
                    SequencePlan::new(id, files)
                        .with_siblings(&known)
                        .previously_uploaded(previous)
                })
                .collect()
        }
        UploadMode::Unfinalized => journal
            .unfinalized_sequences()
            .into_iter()
            .map(|id| {
                let previous = journal.unfinalized_in(&id);
                SequencePlan::new(id, Vec::new()).previously_uploaded(previous)
            })
            .collect(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencePhase {
    Pending,
    /// Every file attempted; waiting for finalize.
    Uploading,
    /// Finalized with every file uploaded.
    Committed,
    /// Finalized, but some files failed.
    PartiallyFailed,
}

#[derive(Debug, Clone)]
pub struct SequenceUpload {
    pub target: UploadTarget,
    pub phase: SequencePhase,
    pub uploaded: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
    pub previously_uploaded: usize,
}

impl SequenceUpload {
    /// At least one file of the sequence is on the remote side and the
    /// sequence has not been closed yet.
    pub fn is_finalizable(&self) -> bool {
        self.target.state != SessionState::Closed
            && self.uploaded.len() + self.previously_uploaded > 0
    }
}

#[derive(Debug, Clone)]
pub enum SequenceOutcome {
    /// No file of the sequence exists any more.
    SkippedEmpty { sequence_id: String },
    /// The destination could not be opened; every file counts as failed.
    OpenFailed {
        sequence_id: String,
        error: String,
        failed: Vec<PathBuf>,
    },
    Transferred(SequenceUpload),
}

impl SequenceOutcome {
    pub fn sequence_id(&self) -> &str {
        match self {
            Self::SkippedEmpty { sequence_id } | Self::OpenFailed { sequence_id, .. } => sequence_id,
            Self::Transferred(upload) => &upload.target.sequence_id,
        }
    }

    pub fn phase(&self) -> SequencePhase {
        match self {
            Self::SkippedEmpty { .. } | Self::OpenFailed { .. } => SequencePhase::Pending,
            Self::Transferred(upload) => upload.phase,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct UploadReport {
    pub sequences: Vec<SequenceOutcome>,
}

impl UploadReport {
    pub fn uploaded(&self) -> usize {
        self.transferred().map(|s| s.uploaded.len()).sum()
    }

    pub fn failed(&self) -> usize {
        self.sequences
            .iter()
            .map(|s| match s {
                SequenceOutcome::Transferred(upload) => upload.failed.len(),
                SequenceOutcome::OpenFailed { failed, .. } => failed.len(),
                SequenceOutcome::SkippedEmpty { .. } => 0,
            })
            .sum()
    }

    pub fn empty(&self) -> usize {
        self.sequences
            .iter()
            .filter(|s| matches!(s, SequenceOutcome::SkippedEmpty { .. }))
            .count()
    }

    pub fn finalizable(&self) -> usize {
        self.transferred().filter(|s| s.is_finalizable()).count()
    }

    fn transferred(&self) -> impl Iterator<Item = &SequenceUpload> {
        self.sequences.iter().filter_map(|s| match s {
            SequenceOutcome::Transferred(upload) => Some(upload),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// No sequence had anything to finalize.
    Nothing,
    Finalized { closed: usize, failed: usize },
    Declined,
    /// No clear answer; nothing was finalized.
    Abstained,
}

impl FinalizeOutcome {
    pub fn closed(&self) -> usize {
        match self {
            Self::Finalized { closed, .. } => *closed,
            _ => 0,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Nothing => "nothing to finalize",
            Self::Finalized { failed: 0, .. } => "finalized",
            Self::Finalized { .. } => "finalized with errors",
            Self::Declined => "declined",
            Self::Abstained => "abstained",
        }
    }
}

pub struct UploadOrchestrator<'a> {
    transport: &'a dyn UploadTransport,
    sink: &'a dyn OutcomeSink,
    options: UploadOptions,
}

impl<'a> UploadOrchestrator<'a> {
    pub fn new(
        transport: &'a dyn UploadTransport,
        sink: &'a dyn OutcomeSink,
        options: UploadOptions,
    ) -> Self {
        Self {
            transport,
            sink,
            options,
        }
    }

    /// Transfer every planned file. Sequences run in parallel; a sequence's
    /// destination is opened before any of its files is scheduled.
    pub fn upload(&self, plans: Vec<SequencePlan>) -> Result<UploadReport> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.options.threads.max(1))
            .build()
            .map_err(|e| PipelineError::Config(format!("cannot start upload workers: {}", e)))?;

        let total: usize = plans.iter().map(|p| p.files.len()).sum();
        let progress = ProgressBar::new(total as u64);
        progress.set_style(
            ProgressStyle::with_template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        progress.set_message("Uploading…");

        let sequences = pool.install(|| {
            plans
                .into_par_iter()
                .map(|plan| self.upload_sequence(plan, &progress))
                .collect()
        });
        progress.finish_with_message("Upload complete");

        Ok(UploadReport { sequences })
    }

    fn upload_sequence(&self, plan: SequencePlan, progress: &ProgressBar) -> SequenceOutcome {
        let SequencePlan {
            sequence_id,
            files,
            previously_uploaded,
            names,
        } = plan;

        let (files, vanished): (Vec<PathBuf>, Vec<PathBuf>) =
            files.into_iter().partition(|f| f.exists());
        for path in &vanished {
            log::info!("{} no longer exists, not uploading it", path.display());
            progress.inc(1);
        }
        if files.is_empty() && previously_uploaded == 0 {
            log::info!("Sequence {} has no files left, skipping", sequence_id);
            return SequenceOutcome::SkippedEmpty { sequence_id };
        }

        let mut target = match self.transport.open(&sequence_id) {
            Ok(target) => target,
            Err(e) => {
                let error = e.to_string();
                log::warn!("Could not open upload for sequence {}: {}", sequence_id, error);
                for path in &files {
                    self.sink.record(
                        &FileEvent::new(path, FileOutcome::Failed)
                            .in_sequence(&sequence_id)
                            .with_error(&error),
                    );
                    progress.inc(1);
                }
                return SequenceOutcome::OpenFailed {
                    sequence_id,
                    error,
                    failed: files,
                };
            }
        };
        target.state = SessionState::Uploading;

        let results: Vec<(PathBuf, std::result::Result<(), String>)> = files
            .par_iter()
            .map(|path| {
                let result = names
                    .get(path)
                    .cloned()
                    .map_or_else(|| file_name(path), Ok)
                    .and_then(|name| self.transfer_with_retry(&target, path, &name));
                let event = FileEvent::new(path, FileOutcome::Uploaded).in_sequence(&sequence_id);
                let result = match result {
                    Ok(()) => {
                        self.sink.record(&event);
                        Ok(())
                    }
                    Err(e) => {
                        let error = e.to_string();
                        log::warn!("Upload failed for {}: {}", path.display(), error);
                        self.sink.record(&FileEvent {
                            outcome: FileOutcome::Failed,
                            error: Some(&error),
                            ..event
                        });
                        Err(error)
                    }
                };
                progress.inc(1);
                (path.clone(), result)
            })
            .collect();

        let mut upload = SequenceUpload {
            target,
            phase: SequencePhase::Uploading,
            uploaded: Vec::new(),
            failed: Vec::new(),
            previously_uploaded,
        };
        for (path, result) in results {
            match result {
                Ok(()) => upload.uploaded.push(path),
                Err(error) => upload.failed.push((path, error)),
            }
        }
        log::info!(
            "Sequence {}: {} uploaded, {} failed",
            sequence_id,
            upload.uploaded.len(),
            upload.failed.len()
        );
        SequenceOutcome::Transferred(upload)
    }

    fn transfer_with_retry(
        &self,
        target: &UploadTarget,
        path: &Path,
        name: &str,
    ) -> std::result::Result<(), TransportError> {
        let mut attempt = 1;
        loop {
            match self.transport.transfer(target, path, name) {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.options.max_attempts => {
                    log::warn!(
                        "Attempt {}/{} failed for {}: {}",
                        attempt,
                        self.options.max_attempts,
                        path.display(),
                        e
                    );
                    thread::sleep(self.options.retry_delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Close every finalizable sequence exactly once and report each close
    /// to the sink. A sequence whose files all failed stays open so a retry
    /// can still add to it.
    pub fn finalize(&self, report: &mut UploadReport) -> FinalizeOutcome {
        let mut closed = 0;
        let mut failed = 0;

        for outcome in &mut report.sequences {
            let SequenceOutcome::Transferred(upload) = outcome else {
                continue;
            };
            if !upload.is_finalizable() {
                continue;
            }
            match self.transport.close(&upload.target) {
                Ok(()) => {
                    upload.target.state = SessionState::Closed;
                    upload.phase = if upload.failed.is_empty() {
                        SequencePhase::Committed
                    } else {
                        SequencePhase::PartiallyFailed
                    };
                    self.sink.sequence_finalized(&upload.target.sequence_id);
                    closed += 1;
                }
                Err(e) => {
                    log::warn!("Finalize failed for sequence {}: {}", upload.target.sequence_id, e);
                    failed += 1;
                }
            }
        }

        FinalizeOutcome::Finalized { closed, failed }
    }

    /// Finalize after confirmation, or straight away with `auto`. Unclear
    /// answers abstain; already transferred files are never touched.
    pub fn finalize_gated(
        &self,
        report: &mut UploadReport,
        auto: bool,
        decisions: &dyn DecisionProvider,
    ) -> FinalizeOutcome {
        let pending = report.finalizable();
        if pending == 0 {
            return FinalizeOutcome::Nothing;
        }
        if auto {
            return self.finalize(report);
        }

        let question = format!("Finalize upload of {} sequence(s)?", pending);
        match confirm(decisions, &question, MAX_PROMPT_ATTEMPTS) {
            Decision::Yes => self.finalize(report),
            Decision::No => FinalizeOutcome::Declined,
            Decision::Abstain => {
                log::warn!("No clear answer, leaving {} sequence(s) unfinalized", pending);
                FinalizeOutcome::Abstained
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    /// In-memory transport. Files named in `fail` always fail; files in
    /// `flaky` fail the given number of times first.
    #[derive(Default)]
    pub struct FakeTransport {
        pub fail: HashSet<String>,
        pub flaky: Mutex<HashMap<String, usize>>,
        pub fail_open: bool,
        pub opened: Mutex<Vec<String>>,
        pub transferred: Mutex<Vec<PathBuf>>,
        pub names: Mutex<Vec<String>>,
        pub closed: Mutex<Vec<String>>,
    }

    impl FakeTransport {
        pub fn failing(names: &[&str]) -> Self {
            Self {
                fail: names.iter().map(|n| n.to_string()).collect(),
                ..Default::default()
            }
        }

        pub fn closed(&self) -> Vec<String> {
            self.closed.lock().unwrap().clone()
        }

        pub fn opened(&self) -> Vec<String> {
            self.opened.lock().unwrap().clone()
        }
    }

    fn name(path: &Path) -> String {
        path.file_name().unwrap().to_string_lossy().into_owned()
    }

    impl UploadTransport for FakeTransport {
        fn open(&self, sequence_id: &str) -> std::result::Result<UploadTarget, TransportError> {
            if self.fail_open {
                return Err(TransportError::Status {
                    status: 503,
                    body: "unavailable".into(),
                });
            }
            self.opened.lock().unwrap().push(sequence_id.to_string());
            Ok(UploadTarget::new(sequence_id, format!("fake/{}/", sequence_id)))
        }

        fn transfer(
            &self,
            target: &UploadTarget,
            file: &Path,
            remote: &str,
        ) -> std::result::Result<(), TransportError> {
            assert_eq!(target.state, SessionState::Uploading);
            let name = name(file);
            if self.fail.contains(&name) {
                return Err(TransportError::Status {
                    status: 500,
                    body: format!("rejected {}", name),
                });
            }
            if let Some(left) = self.flaky.lock().unwrap().get_mut(&name) {
                if *left > 0 {
                    *left -= 1;
                    return Err(TransportError::Status {
                        status: 502,
                        body: "try again".into(),
                    });
                }
            }
            self.transferred.lock().unwrap().push(file.to_path_buf());
            self.names.lock().unwrap().push(remote.to_string());
            Ok(())
        }

        fn close(&self, target: &UploadTarget) -> std::result::Result<(), TransportError> {
            self.closed.lock().unwrap().push(target.sequence_id.clone());
            Ok(())
        }
    }

    pub fn options() -> UploadOptions {
        UploadOptions {
            threads: 2,
            max_attempts: 3,
            retry_delay: Duration::ZERO,
        }
    }
}
