use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

/// The metadata every eligible image must carry. Bearing is the only
/// optional field; it can be synthesized later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoTag {
    pub position: GeoPoint,
    pub captured_at: DateTime<Utc>,
    pub bearing: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImageStatus {
    Pending,
    Duplicate,
    MissingMetadata,
    Tagged,
    Uploaded,
    Failed,
}

/// One photograph. Records are never removed from a run, only re-statused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub path: PathBuf,
    pub tag: Option<GeoTag>,
    pub sequence_id: Option<String>,
    pub status: ImageStatus,
}

impl ImageRecord {
    pub fn tagged(path: impl Into<PathBuf>, tag: GeoTag) -> Self {
        Self {
            path: path.into(),
            tag: Some(tag),
            sequence_id: None,
            status: ImageStatus::Pending,
        }
    }

    pub fn missing_metadata(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            tag: None,
            sequence_id: None,
            status: ImageStatus::MissingMetadata,
        }
    }

    /// Whether the record may enter segmentation, tagging and upload.
    pub fn is_eligible(&self) -> bool {
        self.tag.is_some()
            && !matches!(
                self.status,
                ImageStatus::Duplicate | ImageStatus::MissingMetadata
            )
    }

    pub fn position(&self) -> Option<GeoPoint> {
        self.tag.as_ref().map(|t| t.position)
    }

    pub fn captured_at(&self) -> Option<DateTime<Utc>> {
        self.tag.as_ref().map(|t| t.captured_at)
    }

    pub fn bearing(&self) -> Option<f64> {
        self.tag.as_ref().and_then(|t| t.bearing)
    }
}

/// A time-ordered run of records sharing one freshly generated identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceGroup {
    pub id: String,
    pub records: Vec<ImageRecord>,
}

impl SequenceGroup {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.records.iter().map(|r| r.path.clone()).collect()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.records.iter().any(|r| r.path == path)
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::record;
    use super::*;

    #[test]
    fn test_eligibility_follows_status() {
        let mut rec = record("a.jpg", 52.0, 13.0, 0, None);
        assert!(rec.is_eligible());

        rec.status = ImageStatus::Duplicate;
        assert!(!rec.is_eligible());

        rec.status = ImageStatus::Failed;
        assert!(rec.is_eligible());

        let missing = ImageRecord::missing_metadata("/photos/b.jpg");
        assert!(!missing.is_eligible());
        assert!(missing.position().is_none());
    }

    #[test]
    fn test_status_serializes_kebab_case() {
        let json = serde_json::to_string(&ImageStatus::MissingMetadata).unwrap();
        assert_eq!(json, "\"missing-metadata\"");
    }
}
