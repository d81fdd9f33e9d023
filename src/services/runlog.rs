use crate::error::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

pub const RUN_LOG_FILE: &str = "UPLOAD_LOG.txt";

/// End-of-run counts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub duplicates: usize,
    pub sequences: usize,
    pub missing_metadata: usize,
    /// Images left out of their sequence because tagging failed.
    pub tag_failed: usize,
    pub empty_sequences: usize,
    pub uploaded: usize,
    pub failed: usize,
    pub finalized: usize,
    pub finalize: String,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Run finished {}", Utc::now().to_rfc3339())?;
        writeln!(f, "  duplicates:       {}", self.duplicates)?;
        writeln!(f, "  sequences:        {}", self.sequences)?;
        writeln!(f, "  missing metadata: {}", self.missing_metadata)?;
        writeln!(f, "  tagging failed:   {}", self.tag_failed)?;
        writeln!(f, "  empty sequences:  {}", self.empty_sequences)?;
        writeln!(f, "  uploaded:         {}", self.uploaded)?;
        writeln!(f, "  failed:           {}", self.failed)?;
        writeln!(f, "  finalized:        {} ({})", self.finalized, self.finalize)
    }
}

/// Human-readable summary of the last completed run. Its presence tells the
/// next invocation that a previous run exists.
#[derive(Debug, Clone)]
pub struct RunLog {
    path: PathBuf,
}

impl RunLog {
    pub fn in_dir(root: &Path) -> Self {
        Self {
            path: root.join(RUN_LOG_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, summary: &RunSummary) -> Result<()> {
        fs::write(&self.path, summary.to_string())?;
        Ok(())
    }

    pub fn read(&self) -> Result<Option<String>> {
        if !self.path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read_to_string(&self.path)?))
    }
}
