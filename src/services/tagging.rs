use crate::core::record::GeoTag;
use crate::error::Result;
use serde::Serialize;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Everything written onto one image before upload.
#[derive(Debug, Clone, Copy)]
pub struct TagRequest<'a> {
    pub path: &'a Path,
    pub sequence_id: &'a str,
    pub tag: &'a GeoTag,
    /// Recorded or interpolated heading; `None` leaves the image without one.
    pub bearing: Option<f64>,
    pub orientation: u8,
}

/// Writes the upload description for an image. Called from worker threads.
pub trait Tagger: Sync {
    fn tag(&self, request: &TagRequest<'_>) -> Result<()>;
}

#[derive(Debug, Serialize, PartialEq)]
struct Heading {
    #[serde(rename = "TrueHeading")]
    true_heading: f64,
    #[serde(rename = "MagneticHeading")]
    magnetic_heading: f64,
}

#[derive(Debug, Serialize)]
struct Description<'a> {
    #[serde(rename = "MAPLatitude")]
    latitude: f64,
    #[serde(rename = "MAPLongitude")]
    longitude: f64,
    #[serde(rename = "MAPCaptureTime")]
    capture_time: String,
    #[serde(rename = "MAPSettingsUsername")]
    username: &'a str,
    #[serde(rename = "MAPSettingsEmail", skip_serializing_if = "Option::is_none")]
    email: Option<&'a str>,
    #[serde(rename = "MAPSequenceUUID")]
    sequence_id: &'a str,
    #[serde(rename = "MAPPhotoUUID")]
    photo_id: String,
    #[serde(rename = "MAPOrientation")]
    orientation: u8,
    #[serde(rename = "MAPCompassHeading", skip_serializing_if = "Option::is_none")]
    heading: Option<Heading>,
}

/// Writes the description as JSON next to the image (`IMG_1.jpg.json`).
pub struct SidecarTagger {
    username: String,
    email: Option<String>,
}

impl SidecarTagger {
    pub fn new(username: impl Into<String>, email: Option<String>) -> Self {
        Self {
            username: username.into(),
            email,
        }
    }

    pub fn sidecar_path(image: &Path) -> PathBuf {
        let mut name = image.as_os_str().to_owned();
        name.push(OsString::from(".json"));
        PathBuf::from(name)
    }
}

impl Tagger for SidecarTagger {
    fn tag(&self, request: &TagRequest<'_>) -> Result<()> {
        let description = Description {
            latitude: request.tag.position.lat,
            longitude: request.tag.position.lon,
            capture_time: request
                .tag
                .captured_at
                .format("%Y_%m_%d_%H_%M_%S_%3f")
                .to_string(),
            username: &self.username,
            email: self.email.as_deref(),
            sequence_id: request.sequence_id,
            photo_id: Uuid::new_v4().to_string(),
            orientation: request.orientation,
            heading: request.bearing.map(|b| Heading {
                true_heading: b,
                magnetic_heading: b,
            }),
        };

        let json = serde_json::to_string_pretty(&description)?;
        fs::write(Self::sidecar_path(request.path), json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::record::GeoPoint;
    use chrono::{TimeZone, Utc};
    use serde_json::Value;
    use tempfile::TempDir;

    fn geotag() -> GeoTag {
        GeoTag {
            position: GeoPoint::new(55.6, 12.5),
            captured_at: Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 5).unwrap(),
            bearing: None,
        }
    }

    #[test]
    fn test_sidecar_contents() {
        let temp_dir = TempDir::new().unwrap();
        let image = temp_dir.path().join("IMG_1.jpg");
        fs::write(&image, b"jpeg").unwrap();
        let tag = geotag();

        SidecarTagger::new("alice", Some("alice@example.com".into()))
            .tag(&TagRequest {
                path: &image,
                sequence_id: "seq-1",
                tag: &tag,
                bearing: Some(92.5),
                orientation: 1,
            })
            .unwrap();

        let sidecar = temp_dir.path().join("IMG_1.jpg.json");
        let json: Value = serde_json::from_str(&fs::read_to_string(sidecar).unwrap()).unwrap();
        assert_eq!(json["MAPSequenceUUID"], "seq-1");
        assert_eq!(json["MAPSettingsUsername"], "alice");
        assert_eq!(json["MAPCaptureTime"], "2024_05_01_08_00_05_000");
        assert_eq!(json["MAPCompassHeading"]["TrueHeading"], 92.5);
        assert_eq!(json["MAPOrientation"], 1);
    }

    #[test]
    fn test_no_heading_without_bearing() {
        let temp_dir = TempDir::new().unwrap();
        let image = temp_dir.path().join("a.jpg");
        let tag = geotag();

        SidecarTagger::new("alice", None)
            .tag(&TagRequest {
                path: &image,
                sequence_id: "seq-1",
                tag: &tag,
                bearing: None,
                orientation: 3,
            })
            .unwrap();

        let raw = fs::read_to_string(SidecarTagger::sidecar_path(&image)).unwrap();
        let json: Value = serde_json::from_str(&raw).unwrap();
        assert!(json.get("MAPCompassHeading").is_none());
        assert!(json.get("MAPSettingsEmail").is_none());
    }
}
