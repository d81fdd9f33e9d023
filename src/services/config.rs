use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_UPLOAD_URL: &str =
    "https://s3-eu-west-1.amazonaws.com/mapillary.uploads.manual.images";
pub const DEFAULT_API_URL: &str = "https://a.mapillary.com/v3";
pub const DEFAULT_THREADS: usize = 2;
pub const DEFAULT_MAX_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Bulk file transfer under a per-sequence key prefix, then a marker
    /// object to finalize
    Bulk,
    /// Open an upload session per sequence, transfer, then close it
    Session,
}

/// Optional settings file (`config.toml`). Every key may also come from the
/// command line or environment, which take precedence.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub username: Option<String>,
    pub email: Option<String>,
    pub permission_hash: Option<String>,
    pub signature_hash: Option<String>,
    pub access_token: Option<String>,
    pub client_id: Option<String>,
    pub upload_url: Option<String>,
    pub api_url: Option<String>,
    pub threads: Option<usize>,
}

impl FileConfig {
    /// `<config dir>/geoseq/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("geoseq").join("config.toml"))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw)
            .map_err(|e| PipelineError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Load `path` if given, else the default location if it exists.
    pub fn discover(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => match Self::default_path() {
                Some(p) if p.is_file() => Self::load(&p),
                _ => Ok(Self::default()),
            },
        }
    }
}

/// Everything the orchestrator and transports need, passed in explicitly.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadConfig {
    pub username: Option<String>,
    pub email: Option<String>,
    pub permission_hash: Option<String>,
    pub signature_hash: Option<String>,
    pub access_token: Option<String>,
    pub client_id: Option<String>,
    pub upload_url: Option<String>,
    pub api_url: Option<String>,
    pub threads: Option<usize>,
    pub max_attempts: usize,
    pub retry_delay: Duration,
    pub keep_original_filename: bool,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            username: None,
            email: None,
            permission_hash: None,
            signature_hash: None,
            access_token: None,
            client_id: None,
            upload_url: None,
            api_url: None,
            threads: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay: Duration::from_secs(2),
            keep_original_filename: false,
        }
    }
}

/// Credentials proven present for one transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    Bulk {
        username: String,
        permission_hash: String,
        signature_hash: String,
    },
    Session {
        access_token: String,
        client_id: String,
    },
}

impl UploadConfig {
    /// Fill every unset value from the settings file.
    pub fn merged(mut self, file: FileConfig) -> Self {
        fn fill<T>(slot: &mut Option<T>, value: Option<T>) {
            if slot.is_none() {
                *slot = value;
            }
        }
        fill(&mut self.username, file.username);
        fill(&mut self.email, file.email);
        fill(&mut self.permission_hash, file.permission_hash);
        fill(&mut self.signature_hash, file.signature_hash);
        fill(&mut self.access_token, file.access_token);
        fill(&mut self.client_id, file.client_id);
        fill(&mut self.upload_url, file.upload_url);
        fill(&mut self.api_url, file.api_url);
        fill(&mut self.threads, file.threads);
        self
    }

    pub fn threads(&self) -> usize {
        self.threads.unwrap_or(DEFAULT_THREADS)
    }

    pub fn upload_url(&self) -> &str {
        self.upload_url.as_deref().unwrap_or(DEFAULT_UPLOAD_URL)
    }

    pub fn api_url(&self) -> &str {
        self.api_url.as_deref().unwrap_or(DEFAULT_API_URL)
    }

    /// Check everything `kind` needs, reporting all missing credentials at
    /// once. Run before any network call.
    pub fn validate(&self, kind: TransportKind) -> Result<Credentials> {
        if self.threads() == 0 {
            return Err(PipelineError::Config("threads must be at least 1".into()));
        }
        if self.max_attempts == 0 {
            return Err(PipelineError::Config("max attempts must be at least 1".into()));
        }

        let present = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        let required: Vec<(&'static str, &Option<String>)> = match kind {
            TransportKind::Bulk => vec![
                ("username (GEOSEQ_USERNAME)", &self.username),
                ("permission hash (GEOSEQ_PERMISSION_HASH)", &self.permission_hash),
                ("signature hash (GEOSEQ_SIGNATURE_HASH)", &self.signature_hash),
            ],
            TransportKind::Session => vec![
                ("access token (GEOSEQ_ACCESS_TOKEN)", &self.access_token),
                ("client id (GEOSEQ_CLIENT_ID)", &self.client_id),
            ],
        };

        let missing: Vec<&'static str> = required
            .iter()
            .filter(|(_, value)| !present(*value))
            .map(|(name, _)| *name)
            .collect();
        if !missing.is_empty() {
            return Err(PipelineError::AuthenticationMissing { missing });
        }

        let get = |v: &Option<String>| v.clone().unwrap_or_default();
        Ok(match kind {
            TransportKind::Bulk => Credentials::Bulk {
                username: get(&self.username),
                permission_hash: get(&self.permission_hash),
                signature_hash: get(&self.signature_hash),
            },
            TransportKind::Session => Credentials::Session {
                access_token: get(&self.access_token),
                client_id: get(&self.client_id),
            },
        })
    }
}
