// Stateful side of the pipeline: persisted run state, remote transports,
// upload orchestration and the run driver.

pub mod config;
pub mod journal;
pub mod ledger;
pub mod outcome;
pub mod pipeline;
pub mod prompt;
pub mod runlog;
pub mod session;
pub mod tagging;
pub mod transport;
pub mod upload;

pub use config::{Credentials, FileConfig, TransportKind, UploadConfig};
pub use journal::{JournalState, UploadJournal, UploadRecord};
pub use ledger::{ProcessingLedger, SequenceFiles};
pub use outcome::{FanOut, FileEvent, FileOutcome, FolderMover, NoopSink, OutcomeSink};
pub use pipeline::{Pipeline, PipelineOptions, RunPlan, RunReport};
pub use prompt::{confirm, Decision, DecisionProvider, ScriptedAnswers, TerminalPrompt};
pub use runlog::{RunLog, RunSummary};
pub use session::{SessionDescriptor, SessionTransport, SESSION_DIR};
pub use tagging::{SidecarTagger, TagRequest, Tagger};
pub use transport::{BulkTransport, DryRunTransport, SessionState, UploadTarget, UploadTransport};
pub use upload::{
    FinalizeOutcome, SequenceOutcome, SequencePhase, SequencePlan, UploadMode, UploadOptions,
    UploadOrchestrator, UploadReport,
};
