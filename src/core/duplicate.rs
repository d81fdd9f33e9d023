// Consecutive near-duplicate detection (e.g. waiting at red lights or in
// traffic). Each image is compared against the last *retained* image, so a
// slow creep is collapsed until it has moved far enough from the last kept
// frame.
//
// Known tuning risk: a panorama shot by rotating on the spot in steps below
// the angle threshold is retired as duplicates.

use crate::core::geo;
use crate::core::record::{GeoTag, ImageRecord, ImageStatus};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A retained image and the run of images retired in its favour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub retained: PathBuf,
    pub duplicates: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DuplicateReport {
    pub groups: Vec<DuplicateGroup>,
}

impl DuplicateReport {
    pub fn total(&self) -> usize {
        self.groups.iter().map(|g| g.duplicates.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

pub struct DuplicateDetector {
    /// Meters.
    pub distance_threshold: f64,
    /// Degrees.
    pub angle_threshold: f64,
}

impl DuplicateDetector {
    pub fn new(distance_threshold: f64, angle_threshold: f64) -> Self {
        Self {
            distance_threshold,
            angle_threshold,
        }
    }

    /// Both comparisons are strict: a value equal to its threshold is not a
    /// duplicate. Without two compass readings only distance decides.
    pub fn is_duplicate(&self, retained: &GeoTag, candidate: &GeoTag) -> bool {
        let distance = geo::distance_m(retained.position, candidate.position);
        let angle = match (retained.bearing, candidate.bearing) {
            (Some(a), Some(b)) => geo::bearing_delta(a, b),
            _ => 0.0,
        };
        distance < self.distance_threshold && angle < self.angle_threshold
    }

    /// Mark duplicates in a time-ordered record list. Ineligible records are
    /// skipped and never become the comparison anchor.
    pub fn detect(&self, records: &mut [ImageRecord]) -> DuplicateReport {
        let mut report = DuplicateReport::default();
        let mut anchor: Option<(GeoTag, PathBuf)> = None;
        let mut current: Option<DuplicateGroup> = None;

        for record in records.iter_mut().filter(|r| r.is_eligible()) {
            let Some(tag) = record.tag.clone() else {
                continue;
            };

            let duplicate = anchor
                .as_ref()
                .is_some_and(|(kept, _)| self.is_duplicate(kept, &tag));

            if duplicate {
                record.status = ImageStatus::Duplicate;
                let retained = anchor.as_ref().map(|(_, p)| p.clone()).unwrap_or_default();
                current
                    .get_or_insert_with(|| DuplicateGroup {
                        retained,
                        duplicates: Vec::new(),
                    })
                    .duplicates
                    .push(record.path.clone());
            } else {
                report.groups.extend(current.take());
                anchor = Some((tag, record.path.clone()));
            }
        }
        report.groups.extend(current.take());

        if !report.is_empty() {
            log::info!(
                "Retired {} duplicate(s) in {} group(s)",
                report.total(),
                report.groups.len()
            );
        }
        report
    }
}
