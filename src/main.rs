use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use geoseq::core::{ExifMetadataProvider, SegmentOptions};
use geoseq::services::journal::UploadJournal;
use geoseq::services::ledger::ProcessingLedger;
use geoseq::services::runlog::RunLog;
use geoseq::services::{
    confirm, BulkTransport, Decision, DryRunTransport, FileConfig, FolderMover, NoopSink,
    OutcomeSink, Pipeline, PipelineOptions, RunPlan, RunReport, SessionTransport,
    SidecarTagger, TerminalPrompt, TransportKind, UploadConfig, UploadOptions,
    UploadTransport, SESSION_DIR,
};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "geoseq",
    version,
    about = "Split geotagged photos into trip sequences and upload them"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Index, dedupe, segment, tag and upload a folder of photos
    Process(ProcessArgs),

    /// Manage upload sessions on the remote service
    Sessions {
        #[command(subcommand)]
        command: SessionsCmd,
    },

    /// Show what earlier runs left in a folder
    Status {
        /// Folder of photos
        #[arg(value_name = "DIR")]
        path: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum SessionsCmd {
    /// Delete every open upload session of the account
    Purge {
        /// Do not ask for confirmation
        #[arg(long)]
        yes: bool,
        #[command(flatten)]
        remote: RemoteArgs,
    },
}

/// Credentials and endpoints. Each one can also come from the environment
/// or the config file.
#[derive(Args, Debug)]
struct RemoteArgs {
    #[arg(long, env = "GEOSEQ_USERNAME")]
    username: Option<String>,
    #[arg(long, env = "GEOSEQ_EMAIL")]
    email: Option<String>,
    #[arg(long, env = "GEOSEQ_PERMISSION_HASH", hide_env_values = true)]
    permission_hash: Option<String>,
    #[arg(long, env = "GEOSEQ_SIGNATURE_HASH", hide_env_values = true)]
    signature_hash: Option<String>,
    #[arg(long, env = "GEOSEQ_ACCESS_TOKEN", hide_env_values = true)]
    access_token: Option<String>,
    #[arg(long, env = "GEOSEQ_CLIENT_ID")]
    client_id: Option<String>,
    /// Bulk upload endpoint
    #[arg(long, value_name = "URL")]
    upload_url: Option<String>,
    /// Session API base URL
    #[arg(long, value_name = "URL")]
    api_url: Option<String>,
    /// Upload worker threads
    #[arg(long, env = "GEOSEQ_THREADS")]
    threads: Option<usize>,
    /// Settings file (default: <config dir>/geoseq/config.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
}

impl RemoteArgs {
    fn upload_config(&self) -> Result<UploadConfig> {
        let file = FileConfig::discover(self.config.as_deref())
            .context("Failed to load settings file")?;
        Ok(UploadConfig {
            username: self.username.clone(),
            email: self.email.clone(),
            permission_hash: self.permission_hash.clone(),
            signature_hash: self.signature_hash.clone(),
            access_token: self.access_token.clone(),
            client_id: self.client_id.clone(),
            upload_url: self.upload_url.clone(),
            api_url: self.api_url.clone(),
            threads: self.threads,
            ..Default::default()
        }
        .merged(file))
    }
}

#[derive(Args, Debug)]
struct ProcessArgs {
    /// Folder of photos
    #[arg(value_name = "DIR")]
    path: PathBuf,

    /// Largest distance between consecutive photos of one sequence, meters
    #[arg(long, default_value_t = 600.0)]
    cutoff_distance: f64,
    /// Largest time between consecutive photos of one sequence, seconds
    #[arg(long, default_value_t = 60.0)]
    cutoff_time: f64,

    /// Retire near-duplicate photos before segmenting
    #[arg(long)]
    remove_duplicates: bool,
    /// Photos closer than this to the last kept one may be duplicates, meters
    #[arg(long, default_value_t = 0.1)]
    duplicate_distance: f64,
    /// Photos turned less than this from the last kept one may be duplicates, degrees
    #[arg(long, default_value_t = 5.0)]
    duplicate_angle: f64,

    /// Compute missing compass directions from the direction of travel
    #[arg(long)]
    interpolate_directions: bool,
    /// Added to every computed direction, degrees
    #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
    bearing_offset: f64,
    /// EXIF orientation written with every photo
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u8).range(1..=8))]
    orientation: u8,

    /// One sequence per folder instead of splitting on gaps
    #[arg(long)]
    per_folder: bool,
    /// Start over, including folders of finished work
    #[arg(long)]
    rerun: bool,
    /// Retry failed uploads without asking
    #[arg(long)]
    retry_failed: bool,
    /// Stop after writing the processing log
    #[arg(long)]
    skip_upload: bool,
    /// Finalize uploaded sequences without asking
    #[arg(long)]
    auto_finalize: bool,
    /// Log every upload action instead of performing it
    #[arg(long)]
    dry_run: bool,

    #[arg(long, value_enum, default_value_t = TransportKind::Bulk)]
    transport: TransportKind,
    /// Move uploaded photos to `success/` and duplicates to `duplicates/`
    /// (default: on for bulk uploads)
    #[arg(long, value_name = "BOOL", action = clap::ArgAction::Set)]
    move_files: Option<bool>,
    /// Keep file names on the remote side instead of random ones
    #[arg(long)]
    keep_original_filename: bool,
    /// Write a JSON description next to every photo
    #[arg(long)]
    sidecar: bool,
    /// Attempts per file before it counts as failed
    #[arg(long, default_value_t = 3)]
    max_attempts: usize,

    #[command(flatten)]
    remote: RemoteArgs,
}

impl ProcessArgs {
    fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            segment: SegmentOptions {
                cutoff_distance: self.cutoff_distance,
                cutoff_time: self.cutoff_time,
            },
            remove_duplicates: self.remove_duplicates,
            duplicate_distance: self.duplicate_distance,
            duplicate_angle: self.duplicate_angle,
            interpolate_directions: self.interpolate_directions,
            bearing_offset: self.bearing_offset,
            orientation: self.orientation,
            per_folder: self.per_folder,
            rerun: self.rerun,
            retry_failed: self.retry_failed,
            skip_upload: self.skip_upload,
            auto_finalize: self.auto_finalize,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Process(args) => process(args),
        Commands::Sessions { command } => match command {
            SessionsCmd::Purge { yes, remote } => purge_sessions(yes, &remote),
        },
        Commands::Status { path } => status(&path),
    }
}

fn process(args: ProcessArgs) -> Result<()> {
    let root = &args.path;
    println!("▶ Processing photos in: {}", root.display());

    let mut config = args.remote.upload_config()?;
    config.max_attempts = args.max_attempts;
    config.keep_original_filename = args.keep_original_filename;

    // Credentials are checked up front, before anything touches the network.
    let transport: Box<dyn UploadTransport> = if args.dry_run || args.skip_upload {
        Box::new(DryRunTransport)
    } else {
        let credentials = config.validate(args.transport)?;
        match args.transport {
            TransportKind::Bulk => Box::new(BulkTransport::new(
                config.upload_url(),
                &credentials,
                config.keep_original_filename,
            )?),
            TransportKind::Session => Box::new(SessionTransport::new(
                config.api_url(),
                &credentials,
                root.join(SESSION_DIR),
            )?),
        }
    };

    let sidecar = SidecarTagger::new(config.username.clone().unwrap_or_default(), config.email.clone());

    let mover = FolderMover {
        dry_run: args.dry_run,
    };
    let move_files = args
        .move_files
        .unwrap_or(args.transport == TransportKind::Bulk);
    let sink: &dyn OutcomeSink = if move_files { &mover } else { &NoopSink };

    let metadata = ExifMetadataProvider::new();
    let prompt = TerminalPrompt;
    let mut pipeline = Pipeline::new(
        root,
        args.pipeline_options(),
        UploadOptions::from_config(&config),
        &metadata,
        transport.as_ref(),
        &prompt,
    )
    .with_sink(sink);
    if args.sidecar {
        pipeline = pipeline.with_tagger(&sidecar);
    }

    let report = pipeline
        .run()
        .with_context(|| format!("Failed to process {}", root.display()))?;
    print_report(&report, args.dry_run);
    Ok(())
}

fn print_report(report: &RunReport, dry_run: bool) {
    if let RunPlan::Nothing(reason) = &report.plan {
        println!("✅ Nothing to do: {}", reason);
        return;
    }

    let summary = &report.summary;
    println!("\n✨ {} sequence(s)", summary.sequences);
    if summary.duplicates > 0 {
        println!("   📦 {} duplicate(s) retired", summary.duplicates);
    }
    if summary.missing_metadata > 0 {
        println!("   ⚠️  {} photo(s) without GPS position or time", summary.missing_metadata);
    }
    if summary.tag_failed > 0 {
        println!("   ⚠️  {} photo(s) could not be tagged and were left out", summary.tag_failed);
    }

    if report.upload.is_none() {
        println!("\n✅ Processing log written; upload skipped.");
        return;
    }
    println!("   🏆 {} uploaded", summary.uploaded);
    if summary.failed > 0 {
        println!("   ❌ {} failed (run again to retry)", summary.failed);
    }
    if summary.empty_sequences > 0 {
        println!("   ⏭️  {} sequence(s) had no files left", summary.empty_sequences);
    }
    println!("   🔒 {} sequence(s) {}", summary.finalized, summary.finalize);

    if dry_run {
        println!("\n⚠️  Dry-run only; nothing was uploaded.");
    }
}

fn purge_sessions(yes: bool, remote: &RemoteArgs) -> Result<()> {
    let config = remote.upload_config()?;
    let credentials = config.validate(TransportKind::Session)?;
    let state_dir = std::env::current_dir()
        .context("Failed to read current directory")?
        .join(SESSION_DIR);
    let transport = SessionTransport::new(config.api_url(), &credentials, state_dir)?;

    if !yes {
        let decision = confirm(
            &TerminalPrompt,
            "Delete every open upload session?",
            geoseq::services::prompt::MAX_PROMPT_ATTEMPTS,
        );
        if decision != Decision::Yes {
            println!("Nothing deleted.");
            return Ok(());
        }
    }

    let deleted = transport.purge().context("Failed to purge upload sessions")?;
    if deleted.is_empty() {
        println!("No open sessions.");
    } else {
        for key in &deleted {
            println!("   🗑️  Deleted session {}", key);
        }
        println!("\n✅ Deleted {} session(s)", deleted.len());
    }
    Ok(())
}

fn status(path: &Path) -> Result<()> {
    println!("▶ Status of: {}", path.display());

    match RunLog::in_dir(path).read()? {
        Some(text) => println!("\nLast run:\n{}", text.trim_end()),
        None => println!("\nNo completed run yet."),
    }

    let ledger = ProcessingLedger::in_dir(path);
    if ledger.exists() {
        let sequences = ledger
            .read()
            .with_context(|| format!("Failed to read {}", ledger.path().display()))?;
        println!("\n✨ {} sequence(s) in {}:", sequences.len(), ledger.path().display());
        for (id, files) in &sequences {
            println!("   ▶ {} ({} file(s) still on disk)", id, files.len());
        }
    } else {
        println!("\nFolder not processed yet.");
    }

    let journal = UploadJournal::in_dir(path).load()?;
    println!(
        "\n🏆 {} uploaded, ❌ {} failed",
        journal.uploaded_count(),
        journal.failed_count()
    );
    let unfinalized = journal.unfinalized_sequences();
    if !unfinalized.is_empty() {
        println!("🔓 {} sequence(s) uploaded but not finalized", unfinalized.len());
    }
    Ok(())
}
