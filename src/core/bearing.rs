use crate::core::geo;
use crate::core::record::{GeoPoint, SequenceGroup};
use std::collections::HashMap;
use std::path::PathBuf;

/// Neighbours closer than this are treated as the same spot and skipped.
const SAME_SPOT_M: f64 = 0.01;

/// Fills in compass bearings for images that lack one, from the direction
/// of travel through their neighbours.
pub struct BearingInterpolator {
    /// Added to every computed bearing, e.g. for a sideways-mounted camera.
    offset: f64,
}

impl BearingInterpolator {
    pub fn new() -> Self {
        Self { offset: 0.0 }
    }

    pub fn with_offset(offset: f64) -> Self {
        Self { offset }
    }

    /// Bearings for every record of `group` that has none. Interior images
    /// take the bearing from the previous to the next fix; the ends use the
    /// single neighbour they have. A lone image gets nothing.
    pub fn interpolate(&self, group: &SequenceGroup) -> HashMap<PathBuf, f64> {
        let positions: Vec<Option<GeoPoint>> = group.records.iter().map(|r| r.position()).collect();
        let mut bearings = HashMap::new();

        for (i, record) in group.records.iter().enumerate() {
            if record.bearing().is_some() {
                continue;
            }
            let Some(here) = positions[i] else {
                continue;
            };

            let prev = positions[..i]
                .iter()
                .rev()
                .flatten()
                .find(|p| geo::distance_m(**p, here) > SAME_SPOT_M);
            let next = positions[i + 1..]
                .iter()
                .flatten()
                .find(|p| geo::distance_m(**p, here) > SAME_SPOT_M);

            let bearing = match (prev, next) {
                (Some(p), Some(n)) => geo::initial_bearing(*p, *n),
                (Some(p), None) => geo::initial_bearing(*p, here),
                (None, Some(n)) => geo::initial_bearing(here, *n),
                (None, None) => continue,
            };
            bearings.insert(record.path.clone(), geo::normalize_bearing(bearing + self.offset));
        }

        bearings
    }
}

impl Default for BearingInterpolator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::record::ImageRecord;
    use crate::core::record::fixtures::record;

    fn group(records: Vec<ImageRecord>) -> SequenceGroup {
        SequenceGroup {
            id: "seq".to_string(),
            records,
        }
    }

    fn along_latitude(step: f64) -> SequenceGroup {
        group(
            (0..4)
                .map(|i| record(&format!("{}.jpg", i), 45.0, 10.0 + i as f64 * step, i, None))
                .collect(),
        )
    }

    #[test]
    fn test_due_east_is_90_degrees() {
        let bearings = BearingInterpolator::new().interpolate(&along_latitude(0.001));
        assert_eq!(bearings.len(), 4);
        for b in bearings.values() {
            assert!((b - 90.0).abs() < 1.0, "got {}", b);
        }
    }

    #[test]
    fn test_due_west_is_270_degrees() {
        let bearings = BearingInterpolator::new().interpolate(&along_latitude(-0.001));
        for b in bearings.values() {
            assert!((b - 270.0).abs() < 1.0, "got {}", b);
        }
    }

    #[test]
    fn test_single_image_has_no_bearing() {
        let single = group(vec![record("a.jpg", 45.0, 10.0, 0, None)]);
        assert!(BearingInterpolator::new().interpolate(&single).is_empty());
    }

    #[test]
    fn test_existing_bearings_are_kept() {
        let g = group(vec![
            record("a.jpg", 45.0, 10.0, 0, Some(12.0)),
            record("b.jpg", 45.0, 10.001, 1, None),
            record("c.jpg", 45.001, 10.001, 2, None),
        ]);
        let bearings = BearingInterpolator::new().interpolate(&g);

        assert!(!bearings.contains_key(&g.records[0].path));
        // b: from a to c, north-east
        let b = bearings[&g.records[1].path];
        assert!(b > 0.0 && b < 90.0, "got {}", b);
        // c: last image, from b to c, due north
        let c = bearings[&g.records[2].path];
        assert!(c < 1.0 || c > 359.0, "got {}", c);
    }

    #[test]
    fn test_coincident_neighbours_are_skipped() {
        let g = group(vec![
            record("a.jpg", 45.0, 10.0, 0, None),
            record("b.jpg", 45.0, 10.0, 1, None),
            record("c.jpg", 45.0, 10.001, 2, None),
        ]);
        let bearings = BearingInterpolator::new().interpolate(&g);
        assert!((bearings[&g.records[0].path] - 90.0).abs() < 1.0);
        assert!((bearings[&g.records[1].path] - 90.0).abs() < 1.0);
    }

    #[test]
    fn test_stationary_group_has_no_direction() {
        let g = group(vec![
            record("a.jpg", 45.0, 10.0, 0, None),
            record("b.jpg", 45.0, 10.0, 1, None),
        ]);
        assert!(BearingInterpolator::new().interpolate(&g).is_empty());
    }

    #[test]
    fn test_offset_is_applied_and_wrapped() {
        let bearings = BearingInterpolator::with_offset(300.0).interpolate(&along_latitude(0.001));
        for b in bearings.values() {
            assert!((b - 30.0).abs() < 1.0, "got {}", b);
        }
    }
}
