use crate::core::geo;
use crate::core::record::{ImageRecord, SequenceGroup};
use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
pub struct SegmentOptions {
    /// Largest allowed gap between consecutive images, meters.
    pub cutoff_distance: f64,
    /// Largest allowed gap between consecutive images, seconds.
    pub cutoff_time: f64,
}

impl Default for SegmentOptions {
    fn default() -> Self {
        Self {
            cutoff_distance: 600.0,
            cutoff_time: 60.0,
        }
    }
}

/// Cuts a time-sorted record list into trip sequences.
///
/// Input must already be sorted by capture time; the indexer guarantees
/// this. Ineligible records (duplicates, missing metadata) are skipped and
/// keep `sequence_id == None`.
pub struct SequenceSegmenter {
    options: SegmentOptions,
}

impl SequenceSegmenter {
    pub fn new(options: SegmentOptions) -> Self {
        Self { options }
    }

    pub fn segment(&self, records: &mut [ImageRecord]) -> Vec<SequenceGroup> {
        self.segment_with(records, || Uuid::new_v4().to_string())
    }

    /// Same as [`segment`](Self::segment) with a caller-supplied id source.
    pub fn segment_with<F>(&self, records: &mut [ImageRecord], mut next_id: F) -> Vec<SequenceGroup>
    where
        F: FnMut() -> String,
    {
        let mut groups: Vec<SequenceGroup> = Vec::new();
        let mut previous: Option<&ImageRecord> = None;

        for record in records.iter().filter(|r| r.is_eligible()) {
            let split = match previous {
                None => true,
                Some(prev) => self.exceeds_cutoff(prev, record),
            };
            if split {
                groups.push(SequenceGroup {
                    id: next_id(),
                    records: Vec::new(),
                });
            }
            if let Some(group) = groups.last_mut() {
                group.records.push(record.clone());
            }
            previous = Some(record);
        }

        assign_ids(records, &mut groups);
        log::info!("Split {} image(s) into {} sequence(s)", count(&groups), groups.len());
        groups
    }

    fn exceeds_cutoff(&self, prev: &ImageRecord, next: &ImageRecord) -> bool {
        let (Some(a), Some(b)) = (prev.tag.as_ref(), next.tag.as_ref()) else {
            return true;
        };
        let distance = geo::distance_m(a.position, b.position);
        let seconds = (b.captured_at - a.captured_at).num_milliseconds().abs() as f64 / 1000.0;
        distance > self.options.cutoff_distance || seconds > self.options.cutoff_time
    }
}

/// One sequence per directory, for trips already organised into folders.
/// Groups are ordered by their earliest image.
pub fn group_by_folder<F>(records: &mut [ImageRecord], mut next_id: F) -> Vec<SequenceGroup>
where
    F: FnMut() -> String,
{
    let mut folders: BTreeMap<PathBuf, Vec<ImageRecord>> = BTreeMap::new();
    for record in records.iter().filter(|r| r.is_eligible()) {
        let folder = record.path.parent().map(PathBuf::from).unwrap_or_default();
        folders.entry(folder).or_default().push(record.clone());
    }

    let mut groups: Vec<SequenceGroup> = folders
        .into_values()
        .map(|records| SequenceGroup {
            id: next_id(),
            records,
        })
        .collect();
    groups.sort_by_key(|g| g.records.first().and_then(|r| r.captured_at()));

    assign_ids(records, &mut groups);
    groups
}

fn assign_ids(records: &mut [ImageRecord], groups: &mut [SequenceGroup]) {
    let ids: BTreeMap<PathBuf, String> = groups
        .iter()
        .flat_map(|g| g.records.iter().map(|r| (r.path.clone(), g.id.clone())))
        .collect();

    for group in groups.iter_mut() {
        for record in group.records.iter_mut() {
            record.sequence_id = Some(group.id.clone());
        }
    }
    for record in records.iter_mut() {
        if let Some(id) = ids.get(&record.path) {
            record.sequence_id = Some(id.clone());
        }
    }
}

fn count(groups: &[SequenceGroup]) -> usize {
    groups.iter().map(SequenceGroup::len).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::record::ImageStatus;
    use crate::core::record::fixtures::record;

    const DEG_PER_M: f64 = 1.0 / 111_194.926_644_558_7;

    fn counter() -> impl FnMut() -> String {
        let mut n = 0;
        move || {
            n += 1;
            format!("seq-{}", n)
        }
    }

    fn at_meters(name: &str, north_m: f64, secs: i64) -> ImageRecord {
        record(name, 10.0 + north_m * DEG_PER_M, 20.0, secs, None)
    }

    #[test]
    fn test_distance_cutoff_boundaries() {
        let segmenter = SequenceSegmenter::new(SegmentOptions::default());

        let mut far = vec![at_meters("a.jpg", 0.0, 0), at_meters("b.jpg", 601.0, 5)];
        assert_eq!(segmenter.segment_with(&mut far, counter()).len(), 2);

        let mut near = vec![at_meters("a.jpg", 0.0, 0), at_meters("b.jpg", 599.0, 5)];
        assert_eq!(segmenter.segment_with(&mut near, counter()).len(), 1);
    }

    #[test]
    fn test_time_cutoff_splits() {
        let segmenter = SequenceSegmenter::new(SegmentOptions::default());
        let mut records = vec![
            at_meters("a.jpg", 0.0, 0),
            at_meters("b.jpg", 1.0, 60),
            at_meters("c.jpg", 2.0, 121),
        ];
        let groups = segmenter.segment_with(&mut records, counter());
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].len(), 2);
        assert_eq!(groups[1].len(), 1);
    }

    #[test]
    fn test_gap_measured_from_previous_image() {
        // 5 km total, but every hop stays under the cutoff.
        let segmenter = SequenceSegmenter::new(SegmentOptions::default());
        let mut records: Vec<ImageRecord> = (0..11)
            .map(|i| at_meters(&format!("{}.jpg", i), i as f64 * 500.0, i * 10))
            .collect();
        assert_eq!(segmenter.segment_with(&mut records, counter()).len(), 1);
    }

    #[test]
    fn test_concatenated_groups_equal_input() {
        let segmenter = SequenceSegmenter::new(SegmentOptions {
            cutoff_distance: 100.0,
            cutoff_time: 30.0,
        });
        let mut records: Vec<ImageRecord> = (0..30)
            .map(|i| {
                let hop = if i % 7 == 0 { 250.0 } else { 20.0 };
                at_meters(&format!("{:02}.jpg", i), i as f64 * hop, i * 5 + (i / 10) * 100)
            })
            .collect();

        let groups = segmenter.segment_with(&mut records, counter());
        let flattened: Vec<PathBuf> = groups.iter().flat_map(|g| g.paths()).collect();
        let input: Vec<PathBuf> = records.iter().map(|r| r.path.clone()).collect();
        assert_eq!(flattened, input);
        assert!(groups.len() > 1);
    }

    #[test]
    fn test_ids_are_assigned_to_records() {
        let segmenter = SequenceSegmenter::new(SegmentOptions::default());
        let mut records = vec![
            at_meters("a.jpg", 0.0, 0),
            at_meters("b.jpg", 5000.0, 1),
        ];
        let groups = segmenter.segment(&mut records);

        assert_eq!(records[0].sequence_id.as_deref(), Some(groups[0].id.as_str()));
        assert_eq!(records[1].sequence_id.as_deref(), Some(groups[1].id.as_str()));
        assert_ne!(groups[0].id, groups[1].id);
        assert_eq!(groups[1].records[0].sequence_id, records[1].sequence_id);
    }

    #[test]
    fn test_single_image_is_a_sequence_and_duplicates_are_skipped() {
        let segmenter = SequenceSegmenter::new(SegmentOptions::default());
        let mut records = vec![at_meters("a.jpg", 0.0, 0), at_meters("b.jpg", 1.0, 1)];
        records[1].status = ImageStatus::Duplicate;

        let groups = segmenter.segment_with(&mut records, counter());
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 1);
        assert!(records[1].sequence_id.is_none());
    }

    #[test]
    fn test_empty_input_produces_no_groups() {
        let segmenter = SequenceSegmenter::new(SegmentOptions::default());
        assert!(segmenter.segment_with(&mut [], counter()).is_empty());
    }

    #[test]
    fn test_group_by_folder() {
        let mut records = vec![
            record("trip-b/1.jpg", 1.0, 1.0, 0, None),
            record("trip-a/1.jpg", 1.0, 1.0, 10, None),
            record("trip-b/2.jpg", 50.0, 50.0, 20, None),
        ];
        let groups = group_by_folder(&mut records, counter());

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].len(), 2);
        assert!(groups[0].records.iter().all(|r| r.path.starts_with("/photos/trip-b")));
        assert_eq!(records[1].sequence_id.as_deref(), Some(groups[1].id.as_str()));
    }
}
