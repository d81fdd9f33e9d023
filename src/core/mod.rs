// Pure pipeline stages: indexing, duplicate suppression, segmentation and
// bearing interpolation. Nothing in here talks to the network.

pub mod bearing;
pub mod duplicate;
pub mod exif;
pub mod geo;
pub mod record;
pub mod scanner;
pub mod segment;

pub use self::bearing::BearingInterpolator;
pub use self::duplicate::{DuplicateDetector, DuplicateGroup, DuplicateReport};
pub use self::exif::{ExifMetadataProvider, MetadataProvider};
pub use self::record::{GeoPoint, GeoTag, ImageRecord, ImageStatus, SequenceGroup};
pub use self::scanner::{ImageIndexer, ScanOptions};
pub use self::segment::{group_by_folder, SegmentOptions, SequenceSegmenter};
