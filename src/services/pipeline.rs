//! End-to-end run: index, dedupe, segment, tag, persist, upload, finalize.
//!
//! What a run does depends on what earlier runs left in the input folder:
//! the processing ledger, the upload journal and the run log.

use crate::core::{
    group_by_folder, BearingInterpolator, DuplicateDetector, ImageIndexer, ImageRecord, ImageStatus,
    MetadataProvider, ScanOptions, SegmentOptions, SequenceGroup, SequenceSegmenter,
};
use crate::error::Result;
use crate::services::journal::UploadJournal;
use crate::services::ledger::{ProcessingLedger, SequenceFiles};
use crate::services::outcome::{FanOut, FileEvent, FileOutcome, NoopSink, OutcomeSink};
use crate::services::prompt::{confirm, Decision, DecisionProvider, MAX_PROMPT_ATTEMPTS};
use crate::services::runlog::{RunLog, RunSummary};
use crate::services::tagging::{TagRequest, Tagger};
use crate::services::transport::UploadTransport;
use crate::services::upload::{
    plan, FinalizeOutcome, SequenceOutcome, UploadMode, UploadOptions, UploadOrchestrator,
    UploadReport,
};
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub segment: SegmentOptions,
    pub remove_duplicates: bool,
    /// Meters.
    pub duplicate_distance: f64,
    /// Degrees.
    pub duplicate_angle: f64,
    pub interpolate_directions: bool,
    pub bearing_offset: f64,
    pub orientation: u8,
    /// One sequence per folder instead of gap segmentation.
    pub per_folder: bool,
    /// Ignore earlier runs and start over, completed folders included.
    pub rerun: bool,
    /// Retry failed uploads without asking.
    pub retry_failed: bool,
    pub skip_upload: bool,
    pub auto_finalize: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            segment: SegmentOptions::default(),
            remove_duplicates: false,
            duplicate_distance: 0.1,
            duplicate_angle: 5.0,
            interpolate_directions: false,
            bearing_offset: 0.0,
            orientation: 1,
            per_folder: false,
            rerun: false,
            retry_failed: false,
            skip_upload: false,
            auto_finalize: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunPlan {
    /// Index and segment from scratch.
    Fresh,
    /// Reuse the ledger and upload whatever is still outstanding.
    Resume,
    /// Re-attempt exactly the failed uploads.
    RetryFailed,
    /// Every file is uploaded, but some sequences were never finalized.
    Finalize,
    /// Nothing to do, with the reason.
    Nothing(String),
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub plan: RunPlan,
    /// Every indexed image with its final status. Empty unless the run
    /// indexed the folder.
    pub records: Vec<ImageRecord>,
    pub sequences: SequenceFiles,
    pub upload: Option<UploadReport>,
    pub finalize: Option<FinalizeOutcome>,
    pub summary: RunSummary,
}

impl RunReport {
    fn new(plan: RunPlan) -> Self {
        Self {
            plan,
            records: Vec::new(),
            sequences: SequenceFiles::new(),
            upload: None,
            finalize: None,
            summary: RunSummary::default(),
        }
    }
}

pub struct Pipeline<'a> {
    root: PathBuf,
    options: PipelineOptions,
    upload: UploadOptions,
    metadata: &'a dyn MetadataProvider,
    transport: &'a dyn UploadTransport,
    tagger: Option<&'a dyn Tagger>,
    sink: &'a dyn OutcomeSink,
    decisions: &'a dyn DecisionProvider,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        root: impl Into<PathBuf>,
        options: PipelineOptions,
        upload: UploadOptions,
        metadata: &'a dyn MetadataProvider,
        transport: &'a dyn UploadTransport,
        decisions: &'a dyn DecisionProvider,
    ) -> Self {
        Self {
            root: root.into(),
            options,
            upload,
            metadata,
            transport,
            tagger: None,
            sink: &NoopSink,
            decisions,
        }
    }

    /// Without a tagger, images are uploaded as they are.
    pub fn with_tagger(mut self, tagger: &'a dyn Tagger) -> Self {
        self.tagger = Some(tagger);
        self
    }

    /// Extra receiver of per-file outcomes, next to the upload journal.
    pub fn with_sink(mut self, sink: &'a dyn OutcomeSink) -> Self {
        self.sink = sink;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Decide what this invocation does from the state earlier runs left.
    pub fn plan_run(&self) -> Result<RunPlan> {
        if self.options.rerun {
            return Ok(RunPlan::Fresh);
        }

        let previous = RunLog::in_dir(&self.root).read()?;
        if let Some(text) = &previous {
            log::info!("Previous run found:\n{}", text.trim_end());
        }

        if previous.is_some() || self.options.retry_failed {
            let journal = UploadJournal::in_dir(&self.root).load()?;
            let failed = journal.failed_count();
            let unfinalized = journal.unfinalized_sequences().len();
            if failed == 0 {
                if unfinalized > 0 {
                    log::info!("{} uploaded sequence(s) were never finalized", unfinalized);
                    return Ok(RunPlan::Finalize);
                }
                let reason = if previous.is_some() {
                    "all uploads were successful"
                } else {
                    "no failed uploads to retry"
                };
                return Ok(RunPlan::Nothing(reason.into()));
            }
            if self.options.retry_failed {
                return Ok(RunPlan::RetryFailed);
            }

            let question = format!(
                "{} image(s) failed to upload. Retry uploading failed images?",
                failed
            );
            return Ok(match confirm(self.decisions, &question, MAX_PROMPT_ATTEMPTS) {
                Decision::Yes => RunPlan::RetryFailed,
                Decision::No if unfinalized > 0 => RunPlan::Finalize,
                Decision::No => RunPlan::Nothing("retry declined".into()),
                Decision::Abstain => RunPlan::Nothing("no clear answer, nothing retried".into()),
            });
        }

        if ProcessingLedger::in_dir(&self.root).exists() {
            Ok(RunPlan::Resume)
        } else {
            Ok(RunPlan::Fresh)
        }
    }

    pub fn run(&self) -> Result<RunReport> {
        let run_plan = self.plan_run()?;
        let mut report = RunReport::new(run_plan.clone());

        let mode = match run_plan {
            RunPlan::Nothing(reason) => {
                log::info!("Nothing to do: {}", reason);
                return Ok(report);
            }
            RunPlan::Fresh => {
                self.process(&mut report)?;
                UploadMode::All
            }
            RunPlan::Resume => {
                log::info!("Folder already processed, resuming unfinished uploads");
                report.sequences = ProcessingLedger::in_dir(&self.root).read()?;
                report.summary.sequences = report.sequences.len();
                UploadMode::Outstanding
            }
            RunPlan::RetryFailed => UploadMode::RetryFailed,
            RunPlan::Finalize => UploadMode::Unfinalized,
        };

        if self.options.skip_upload {
            log::info!("Skipping upload");
            return Ok(report);
        }

        let journal = UploadJournal::in_dir(&self.root);
        let plans = plan(&report.sequences, &journal.load()?, mode);
        let sink = FanOut(vec![&journal as &dyn OutcomeSink, self.sink]);
        let orchestrator = UploadOrchestrator::new(self.transport, &sink, self.upload);

        let mut upload = orchestrator.upload(plans)?;
        let finalize =
            orchestrator.finalize_gated(&mut upload, self.options.auto_finalize, self.decisions);

        apply_upload_status(&mut report.records, &upload);
        report.summary.uploaded = upload.uploaded();
        report.summary.failed = upload.failed();
        report.summary.empty_sequences = upload.empty();
        report.summary.finalized = finalize.closed();
        report.summary.finalize = finalize.label().to_string();

        RunLog::in_dir(&self.root).write(&report.summary)?;
        report.upload = Some(upload);
        report.finalize = Some(finalize);
        Ok(report)
    }

    /// Index, dedupe, segment and tag, then write the ledger.
    fn process(&self, report: &mut RunReport) -> Result<()> {
        let scan = if self.options.rerun {
            ScanOptions::default().full_rerun()
        } else {
            ScanOptions::default()
        };
        let mut records = ImageIndexer::new(self.metadata, scan).index(&self.root)?;

        for record in records.iter().filter(|r| r.status == ImageStatus::MissingMetadata) {
            self.sink
                .record(&FileEvent::new(&record.path, FileOutcome::MissingMetadata));
        }
        report.summary.missing_metadata = records
            .iter()
            .filter(|r| r.status == ImageStatus::MissingMetadata)
            .count();

        if self.options.remove_duplicates {
            let detector =
                DuplicateDetector::new(self.options.duplicate_distance, self.options.duplicate_angle);
            let duplicates = detector.detect(&mut records);
            for path in duplicates.groups.iter().flat_map(|g| &g.duplicates) {
                self.sink.record(&FileEvent::new(path, FileOutcome::Duplicate));
            }
            report.summary.duplicates = duplicates.total();
        }

        let next_id = || Uuid::new_v4().to_string();
        let groups = if self.options.per_folder {
            group_by_folder(&mut records, next_id)
        } else {
            SequenceSegmenter::new(self.options.segment).segment_with(&mut records, next_id)
        };

        let mut untagged: HashSet<PathBuf> = HashSet::new();
        if let Some(tagger) = self.tagger {
            for group in &groups {
                untagged.extend(self.tag_group(tagger, group));
            }
            // Untagged images leave their sequence and are not uploaded.
            for record in records.iter_mut().filter(|r| r.sequence_id.is_some()) {
                if untagged.contains(&record.path) {
                    record.status = ImageStatus::Failed;
                    record.sequence_id = None;
                    self.sink.record(&FileEvent::new(&record.path, FileOutcome::TagFailed));
                } else {
                    record.status = ImageStatus::Tagged;
                }
            }
        }
        report.summary.tag_failed = untagged.len();

        report.sequences = groups
            .iter()
            .map(|g| {
                let files: Vec<PathBuf> = g
                    .paths()
                    .into_iter()
                    .filter(|p| !untagged.contains(p))
                    .collect();
                (g.id.clone(), files)
            })
            .filter(|(_, files)| !files.is_empty())
            .collect();
        report.summary.sequences = report.sequences.len();
        ProcessingLedger::in_dir(&self.root).write(&report.sequences)?;

        report.records = records;
        Ok(())
    }

    /// Tag every image of the group; returns the ones that failed.
    fn tag_group(&self, tagger: &dyn Tagger, group: &SequenceGroup) -> Vec<PathBuf> {
        let bearings: HashMap<PathBuf, f64> = if self.options.interpolate_directions && group.len() > 1 {
            BearingInterpolator::with_offset(self.options.bearing_offset).interpolate(group)
        } else {
            HashMap::new()
        };

        let orientation = self.options.orientation;
        group
            .records
            .par_iter()
            .filter_map(|record| {
                let tag = record.tag.as_ref()?;
                let request = TagRequest {
                    path: &record.path,
                    sequence_id: &group.id,
                    tag,
                    bearing: bearings.get(&record.path).copied().or(tag.bearing),
                    orientation,
                };
                match tagger.tag(&request) {
                    Ok(()) => None,
                    Err(e) => {
                        log::warn!("Failed to tag {}, leaving it out: {}", record.path.display(), e);
                        Some(record.path.clone())
                    }
                }
            })
            .collect()
    }
}

fn apply_upload_status(records: &mut [ImageRecord], upload: &UploadReport) {
    if records.is_empty() {
        return;
    }
    let mut status: HashMap<&Path, ImageStatus> = HashMap::new();
    for outcome in &upload.sequences {
        match outcome {
            SequenceOutcome::Transferred(sequence) => {
                for path in &sequence.uploaded {
                    status.insert(path, ImageStatus::Uploaded);
                }
                for (path, _) in &sequence.failed {
                    status.insert(path, ImageStatus::Failed);
                }
            }
            SequenceOutcome::OpenFailed { failed, .. } => {
                for path in failed {
                    status.insert(path, ImageStatus::Failed);
                }
            }
            SequenceOutcome::SkippedEmpty { .. } => {}
        }
    }
    for record in records.iter_mut() {
        if let Some(s) = status.get(record.path.as_path()) {
            record.status = *s;
        }
    }
}
