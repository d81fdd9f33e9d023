//! Session-based upload protocol: open a session per sequence, transfer each
//! file with the session's form fields, then close the session so the
//! remote service starts processing.

use crate::error::{PipelineError, TransportError};
use crate::services::config::Credentials;
use crate::services::transport::{
    check_status, content_type, http_client, SessionState, UploadTarget, UploadTransport,
};
use reqwest::blocking::multipart::{Form, Part};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

/// Folder, inside the input root, holding descriptors of open sessions.
pub const SESSION_DIR: &str = ".upload_sessions";

/// The part of the remote session document the upload needs. Anything else
/// the service sends is carried along untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    pub key: String,
    pub url: String,
    #[serde(default)]
    pub key_prefix: String,
    #[serde(default)]
    pub fields: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

pub struct SessionTransport {
    client: Client,
    api_url: String,
    access_token: String,
    client_id: String,
    state_dir: PathBuf,
}

impl SessionTransport {
    /// `state_dir` holds one descriptor file per open session.
    pub fn new(
        api_url: impl Into<String>,
        credentials: &Credentials,
        state_dir: impl Into<PathBuf>,
    ) -> Result<Self, PipelineError> {
        let Credentials::Session {
            access_token,
            client_id,
        } = credentials
        else {
            return Err(PipelineError::Config(
                "session transport needs an access token and client id".into(),
            ));
        };

        Ok(Self {
            client: http_client()?,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            access_token: access_token.clone(),
            client_id: client_id.clone(),
            state_dir: state_dir.into(),
        })
    }

    fn descriptor_path(&self, sequence_id: &str) -> PathBuf {
        self.state_dir.join(format!("{}.json", sequence_id))
    }

    /// A session opened for `sequence_id` by an earlier, interrupted run.
    pub fn recover(&self, sequence_id: &str) -> Option<SessionDescriptor> {
        let raw = fs::read_to_string(self.descriptor_path(sequence_id)).ok()?;
        match serde_json::from_str(&raw) {
            Ok(descriptor) => Some(descriptor),
            Err(e) => {
                log::warn!("Ignoring unreadable session file for {}: {}", sequence_id, e);
                None
            }
        }
    }

    fn persist(&self, sequence_id: &str, descriptor: &SessionDescriptor) -> Result<(), TransportError> {
        fs::create_dir_all(&self.state_dir)?;
        let json = serde_json::to_string_pretty(descriptor).map_err(|e| {
            TransportError::MalformedSession {
                message: e.to_string(),
            }
        })?;
        fs::write(self.descriptor_path(sequence_id), json)?;
        Ok(())
    }

    fn request_session(&self) -> Result<SessionDescriptor, TransportError> {
        let response = self
            .client
            .post(format!("{}/me/uploads", self.api_url))
            .query(&[("client_id", &self.client_id)])
            .bearer_auth(&self.access_token)
            .json(&serde_json::json!({ "type": "images/sequence" }))
            .send()?;
        let body = check_status(response)?.text()?;

        serde_json::from_str(&body).map_err(|e| TransportError::MalformedSession {
            message: e.to_string(),
        })
    }

    /// Delete every upload session still open for this account. Returns the
    /// deleted session keys.
    pub fn purge(&self) -> Result<Vec<String>, TransportError> {
        let response = self
            .client
            .get(format!("{}/me/uploads", self.api_url))
            .query(&[("client_id", &self.client_id)])
            .bearer_auth(&self.access_token)
            .send()?;
        let sessions: Vec<Value> = serde_json::from_str(&check_status(response)?.text()?)
            .map_err(|e| TransportError::MalformedSession {
                message: e.to_string(),
            })?;

        let mut deleted = Vec::new();
        for key in sessions
            .iter()
            .filter_map(|s| s.get("key").and_then(Value::as_str))
        {
            log::info!("Deleting session {}", key);
            let response = self
                .client
                .delete(format!("{}/uploads/{}", self.api_url, key))
                .query(&[("client_id", &self.client_id)])
                .bearer_auth(&self.access_token)
                .send()?;
            check_status(response)?;
            deleted.push(key.to_string());
        }
        Ok(deleted)
    }
}

impl UploadTransport for SessionTransport {
    /// Reuses a persisted session for the sequence if one exists; otherwise
    /// requests a new one and persists it before returning.
    fn open(&self, sequence_id: &str) -> Result<UploadTarget, TransportError> {
        let descriptor = match self.recover(sequence_id) {
            Some(descriptor) => {
                log::info!("Resuming session {} for sequence {}", descriptor.key, sequence_id);
                descriptor
            }
            None => {
                let descriptor = self.request_session()?;
                self.persist(sequence_id, &descriptor)?;
                log::info!("Session open: {}", descriptor.key);
                descriptor
            }
        };

        let mut target = UploadTarget::new(sequence_id, descriptor.key_prefix.clone());
        target.session = Some(descriptor);
        Ok(target)
    }

    fn transfer(&self, target: &UploadTarget, file: &Path, name: &str) -> Result<(), TransportError> {
        let session = target
            .session
            .as_ref()
            .ok_or_else(|| TransportError::MalformedSession {
                message: format!("no session for sequence {}", target.sequence_id),
            })?;

        let mut form = Form::new();
        for (field, value) in &session.fields {
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            form = form.text(field.clone(), value);
        }
        form = form
            .text("key", format!("{}{}", session.key_prefix, name))
            .part(
                "file",
                Part::bytes(fs::read(file)?)
                    .file_name(name.to_string())
                    .mime_str(content_type(name))?,
            );

        let response = self.client.post(&session.url).multipart(form).send()?;
        check_status(response)?;
        Ok(())
    }

    fn close(&self, target: &UploadTarget) -> Result<(), TransportError> {
        let session = target
            .session
            .as_ref()
            .ok_or_else(|| TransportError::MalformedSession {
                message: format!("no session for sequence {}", target.sequence_id),
            })?;
        if target.state == SessionState::Closed {
            return Err(TransportError::SessionClosed {
                key: session.key.clone(),
            });
        }

        let response = self
            .client
            .put(format!("{}/me/uploads/{}/closed", self.api_url, session.key))
            .query(&[("client_id", &self.client_id)])
            .bearer_auth(&self.access_token)
            .send()?;
        check_status(response)?;
        log::info!("Session published: {}", session.key);

        if let Err(e) = fs::remove_file(self.descriptor_path(&target.sequence_id)) {
            log::debug!("No session file to remove for {}: {}", target.sequence_id, e);
        }
        Ok(())
    }
}
