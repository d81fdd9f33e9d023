use crate::error::{PipelineError, TransportError};
use crate::services::config::Credentials;
use crate::services::session::SessionDescriptor;
use reqwest::blocking::multipart::{Form, Part};
use reqwest::blocking::{Client, Response};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// Object uploaded under a sequence's key prefix to have it processed.
pub const DONE_MARKER: &str = "DONE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Uploading,
    Closed,
}

/// Where one sequence's files go. Created by [`UploadTransport::open`]
/// before any of its files is transferred.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadTarget {
    pub sequence_id: String,
    pub key_prefix: String,
    pub session: Option<SessionDescriptor>,
    pub state: SessionState,
}

impl UploadTarget {
    pub fn new(sequence_id: &str, key_prefix: String) -> Self {
        Self {
            sequence_id: sequence_id.to_string(),
            key_prefix,
            session: None,
            state: SessionState::Open,
        }
    }

    /// Session key if there is one, else the key prefix.
    pub fn label(&self) -> &str {
        self.session
            .as_ref()
            .map(|s| s.key.as_str())
            .unwrap_or(&self.key_prefix)
    }
}

/// Remote side of the upload. `transfer` may be called concurrently for
/// files of the same target; `close` is called at most once per target,
/// after every transfer for it has finished.
///
/// `name` is the file's name inside the sequence, unique within it (see
/// [`remote_names`]).
pub trait UploadTransport: Send + Sync {
    fn open(&self, sequence_id: &str) -> Result<UploadTarget, TransportError>;
    fn transfer(&self, target: &UploadTarget, file: &Path, name: &str) -> Result<(), TransportError>;
    fn close(&self, target: &UploadTarget) -> Result<(), TransportError>;
}

pub(crate) fn http_client() -> Result<Client, TransportError> {
    Ok(Client::builder().timeout(Duration::from_secs(300)).build()?)
}

pub(crate) fn check_status(response: Response) -> Result<Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(TransportError::Status {
            status: status.as_u16(),
            body: response.text().unwrap_or_default(),
        })
    }
}

pub(crate) fn file_name(file: &Path) -> Result<String, TransportError> {
    file.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} has no file name", file.display()),
            ))
        })
}

/// Name each file keeps inside its sequence. Names that clash, compared
/// case-insensitively, get a short tag derived from their folder, so
/// `trip1/IMG_1.jpg` and `trip2/IMG_1.jpg` stay apart. The result only
/// depends on the set of paths given.
pub fn remote_names<P: AsRef<Path>>(files: impl IntoIterator<Item = P>) -> BTreeMap<PathBuf, String> {
    let files: BTreeSet<PathBuf> = files.into_iter().map(|f| f.as_ref().to_path_buf()).collect();
    let mut counts: HashMap<String, usize> = HashMap::new();
    for name in files.iter().filter_map(|f| f.file_name()) {
        *counts.entry(name.to_string_lossy().to_lowercase()).or_default() += 1;
    }

    files
        .into_iter()
        .filter_map(|file| {
            let name = file.file_name()?.to_string_lossy().into_owned();
            if counts.get(&name.to_lowercase()).copied().unwrap_or(0) < 2 {
                return Some((file, name));
            }
            let folder = file.parent().unwrap_or(Path::new(""));
            let tag = Uuid::new_v5(&Uuid::NAMESPACE_URL, folder.as_os_str().as_encoded_bytes())
                .simple()
                .to_string();
            let stem = file.file_stem()?.to_string_lossy();
            let tagged = match file.extension() {
                Some(ext) => format!("{}_{}.{}", stem, &tag[..8], ext.to_string_lossy()),
                None => format!("{}_{}", stem, &tag[..8]),
            };
            Some((file, tagged))
        })
        .collect()
}

pub(crate) fn content_type(name: &str) -> &'static str {
    let ext = Path::new(name)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "tif" | "tiff" => "image/tiff",
        _ => "application/octet-stream",
    }
}

/// Bulk transfer into a `{username}/{sequence_id}/` key prefix with signed
/// form credentials; finalize uploads an empty marker object.
pub struct BulkTransport {
    client: Client,
    url: String,
    username: String,
    permission_hash: String,
    signature_hash: String,
    keep_original_filename: bool,
}

impl BulkTransport {
    pub fn new(
        url: impl Into<String>,
        credentials: &Credentials,
        keep_original_filename: bool,
    ) -> Result<Self, PipelineError> {
        let Credentials::Bulk {
            username,
            permission_hash,
            signature_hash,
        } = credentials
        else {
            return Err(PipelineError::Config(
                "bulk transport needs bulk credentials".into(),
            ));
        };

        Ok(Self {
            client: http_client()?,
            url: url.into(),
            username: username.clone(),
            permission_hash: permission_hash.clone(),
            signature_hash: signature_hash.clone(),
            keep_original_filename,
        })
    }

    pub fn key_prefix(&self, sequence_id: &str) -> String {
        format!("{}/{}/", self.username, sequence_id)
    }

    /// Remote object name. Without original names it is a UUID derived from
    /// the absolute path, so every retry of a file reuses one key.
    fn remote_name(&self, file: &Path, name: &str) -> String {
        if self.keep_original_filename {
            return name.to_string();
        }
        let absolute = std::path::absolute(file).unwrap_or_else(|_| file.to_path_buf());
        let id = Uuid::new_v5(&Uuid::NAMESPACE_URL, absolute.as_os_str().as_encoded_bytes());
        let ext = Path::new(name)
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
            .unwrap_or_default();
        format!("{}{}", id, ext)
    }

    fn post_object(&self, key: String, name: String, bytes: Vec<u8>) -> Result<(), TransportError> {
        let form = Form::new()
            .text("key", key)
            .text("acl", "private")
            .text("policy", self.permission_hash.clone())
            .text("signature", self.signature_hash.clone())
            .text("Content-Type", content_type(&name))
            .part("file", Part::bytes(bytes).file_name(name));

        let response = self.client.post(&self.url).multipart(form).send()?;
        check_status(response)?;
        Ok(())
    }
}

impl UploadTransport for BulkTransport {
    fn open(&self, sequence_id: &str) -> Result<UploadTarget, TransportError> {
        Ok(UploadTarget::new(sequence_id, self.key_prefix(sequence_id)))
    }

    fn transfer(&self, target: &UploadTarget, file: &Path, name: &str) -> Result<(), TransportError> {
        let name = self.remote_name(file, name);
        let bytes = fs::read(file)?;
        self.post_object(format!("{}{}", target.key_prefix, name), name, bytes)
    }

    fn close(&self, target: &UploadTarget) -> Result<(), TransportError> {
        self.post_object(
            format!("{}{}", target.key_prefix, DONE_MARKER),
            DONE_MARKER.to_string(),
            Vec::new(),
        )
    }
}

/// Logs every call and never touches the network.
pub struct DryRunTransport;

impl UploadTransport for DryRunTransport {
    fn open(&self, sequence_id: &str) -> Result<UploadTarget, TransportError> {
        log::info!("[dry-run] open sequence {}", sequence_id);
        Ok(UploadTarget::new(sequence_id, format!("dry-run/{}/", sequence_id)))
    }

    fn transfer(&self, target: &UploadTarget, file: &Path, name: &str) -> Result<(), TransportError> {
        fs::metadata(file)?;
        log::info!("[dry-run] upload {} → {}{}", file.display(), target.key_prefix, name);
        Ok(())
    }

    fn close(&self, target: &UploadTarget) -> Result<(), TransportError> {
        log::info!("[dry-run] finalize {}", target.label());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use tempfile::TempDir;

    fn credentials() -> Credentials {
        Credentials::Bulk {
            username: "alice".into(),
            permission_hash: "perm".into(),
            signature_hash: "sig".into(),
        }
    }

    #[test]
    fn test_key_prefix_layout() {
        let transport = BulkTransport::new("http://localhost", &credentials(), true).unwrap();
        let target = transport.open("seq-1").unwrap();
        assert_eq!(target.key_prefix, "alice/seq-1/");
        assert_eq!(target.state, SessionState::Open);
    }

    #[test]
    fn test_rejects_session_credentials() {
        let creds = Credentials::Session {
            access_token: "t".into(),
            client_id: "c".into(),
        };
        assert!(BulkTransport::new("http://localhost", &creds, true).is_err());
    }

    #[test]
    fn test_generated_names_are_stable_per_path() {
        let transport = BulkTransport::new("http://localhost", &credentials(), false).unwrap();
        let a = transport.remote_name(Path::new("/x/IMG_1.JPG"), "IMG_1.JPG");
        let again = transport.remote_name(Path::new("/x/IMG_1.JPG"), "IMG_1.JPG");
        let other = transport.remote_name(Path::new("/y/IMG_1.JPG"), "IMG_1.JPG");
        assert_eq!(a, again);
        assert_ne!(a, other);
        assert!(a.ends_with(".jpg"));

        let kept = BulkTransport::new("http://localhost", &credentials(), true).unwrap();
        assert_eq!(kept.remote_name(Path::new("/x/IMG_1.JPG"), "IMG_1_ab12.JPG"), "IMG_1_ab12.JPG");
    }

    #[test]
    fn test_clashing_names_are_told_apart_by_folder() {
        let trip1 = Path::new("/photos/trip1/IMG_0001.jpg");
        let trip2 = Path::new("/photos/trip2/IMG_0001.jpg");
        let lone = Path::new("/photos/trip1/IMG_0002.jpg");
        let names = remote_names([trip1, trip2, lone]);

        assert_eq!(names[lone], "IMG_0002.jpg");
        assert_ne!(names[trip1], names[trip2]);
        assert!(names[trip1].starts_with("IMG_0001_"));
        assert!(names[trip1].ends_with(".jpg"));
        // Same paths, same names.
        assert_eq!(remote_names([trip2, lone, trip1]), names);
        // Case-only differences clash too.
        let upper = Path::new("/photos/trip2/img_0002.JPG");
        let names = remote_names([lone, upper]);
        assert_ne!(names[lone].to_lowercase(), names[upper].to_lowercase());
    }

    #[test]
    fn test_content_type_follows_extension() {
        assert_eq!(content_type("a.JPG"), "image/jpeg");
        assert_eq!(content_type("a.jpeg"), "image/jpeg");
        assert_eq!(content_type("b.png"), "image/png");
        assert_eq!(content_type("c.tif"), "image/tiff");
        assert_eq!(content_type(DONE_MARKER), "application/octet-stream");
    }

    #[test]
    fn test_transfer_and_close_post_signed_forms() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("a.jpg");
        fs::write(&file, b"jpeg bytes").unwrap();

        let mut server = mockito::Server::new();
        let upload = server
            .mock("POST", "/")
            .match_body(Matcher::AllOf(vec![
                Matcher::Regex("alice/seq-1/a.jpg".into()),
                Matcher::Regex("perm".into()),
                Matcher::Regex("jpeg bytes".into()),
            ]))
            .with_status(204)
            .create();
        let done = server
            .mock("POST", "/")
            .match_body(Matcher::Regex("alice/seq-1/DONE".into()))
            .with_status(204)
            .create();

        let transport = BulkTransport::new(server.url(), &credentials(), true).unwrap();
        let target = transport.open("seq-1").unwrap();
        transport.transfer(&target, &file, "a.jpg").unwrap();
        transport.close(&target).unwrap();

        upload.assert();
        done.assert();
    }

    #[test]
    fn test_png_is_posted_with_its_own_content_type() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("a.png");
        fs::write(&file, b"png bytes").unwrap();

        let mut server = mockito::Server::new();
        let upload = server
            .mock("POST", "/")
            .match_body(Matcher::AllOf(vec![
                Matcher::Regex("alice/seq-1/a.png".into()),
                Matcher::Regex("image/png".into()),
            ]))
            .with_status(204)
            .create();

        let transport = BulkTransport::new(server.url(), &credentials(), true).unwrap();
        let target = transport.open("seq-1").unwrap();
        transport.transfer(&target, &file, "a.png").unwrap();
        upload.assert();
    }

    #[test]
    fn test_error_status_is_transport_failure() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("a.jpg");
        fs::write(&file, b"x").unwrap();

        let mut server = mockito::Server::new();
        server
            .mock("POST", "/")
            .with_status(403)
            .with_body("denied")
            .create();

        let transport = BulkTransport::new(server.url(), &credentials(), true).unwrap();
        let target = transport.open("seq-1").unwrap();
        match transport.transfer(&target, &file, "a.jpg") {
            Err(TransportError::Status { status, body }) => {
                assert_eq!(status, 403);
                assert_eq!(body, "denied");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_dry_run_requires_file_on_disk() {
        let target = DryRunTransport.open("seq").unwrap();
        assert!(DryRunTransport.transfer(&target, Path::new("/non/existent.jpg"), "existent.jpg").is_err());
        assert!(DryRunTransport.close(&target).is_ok());
    }
}
