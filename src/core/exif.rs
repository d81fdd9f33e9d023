use crate::core::record::{GeoPoint, GeoTag};
use crate::error::MetadataError;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use exif::{Exif, In, Reader, Tag, Value};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Source of the per-image geotag. Anything that can produce a position and
/// a capture time for a file can drive the indexer.
pub trait MetadataProvider: Sync {
    fn read_geotag(&self, path: &Path) -> Result<GeoTag, MetadataError>;
}

/// Reads GPS position, capture time and compass direction from EXIF.
pub struct ExifMetadataProvider;

impl ExifMetadataProvider {
    pub fn new() -> Self {
        Self
    }

    fn extract(&self, path: &Path, exif: &Exif) -> Result<GeoTag, MetadataError> {
        let missing = || MetadataError::MissingGeotagOrTimestamp {
            path: path.to_path_buf(),
        };

        let lat = self.coordinate(exif, Tag::GPSLatitude, Tag::GPSLatitudeRef, 'S');
        let lon = self.coordinate(exif, Tag::GPSLongitude, Tag::GPSLongitudeRef, 'W');
        let captured_at = self.capture_time(exif);

        match (lat, lon, captured_at) {
            (Some(lat), Some(lon), Some(captured_at)) => Ok(GeoTag {
                position: GeoPoint::new(lat, lon),
                captured_at,
                bearing: exif
                    .get_field(Tag::GPSImgDirection, In::PRIMARY)
                    .and_then(|f| first_rational(&f.value)),
            }),
            _ => Err(missing()),
        }
    }

    /// Degrees/minutes/seconds plus hemisphere reference.
    fn coordinate(&self, exif: &Exif, tag: Tag, ref_tag: Tag, negative: char) -> Option<f64> {
        let field = exif.get_field(tag, In::PRIMARY)?;
        let degrees = dms_to_degrees(&field.value)?;
        let hemisphere = exif
            .get_field(ref_tag, In::PRIMARY)
            .and_then(|f| field_to_string(&f.value));

        match hemisphere {
            Some(h) if h.trim().eq_ignore_ascii_case(&negative.to_string()) => Some(-degrees),
            _ => Some(degrees),
        }
    }

    /// GPS date/time first, then the camera clock fields.
    fn capture_time(&self, exif: &Exif) -> Option<DateTime<Utc>> {
        let gps_date = exif
            .get_field(Tag::GPSDateStamp, In::PRIMARY)
            .and_then(|f| field_to_string(&f.value));
        let gps_time = exif.get_field(Tag::GPSTimeStamp, In::PRIMARY);

        if let (Some(date), Some(time)) = (gps_date, gps_time) {
            if let Some(dt) = parse_gps_datetime(&date, &time.value) {
                return Some(dt);
            }
        }

        [Tag::DateTimeOriginal, Tag::DateTimeDigitized, Tag::DateTime]
            .into_iter()
            .filter_map(|tag| exif.get_field(tag, In::PRIMARY))
            .filter_map(|f| field_to_string(&f.value))
            .find_map(|s| parse_exif_datetime(&s))
    }
}

impl MetadataProvider for ExifMetadataProvider {
    fn read_geotag(&self, path: &Path) -> Result<GeoTag, MetadataError> {
        let file = File::open(path)?;
        let mut buf_reader = BufReader::new(file);
        let exif = Reader::new().read_from_container(&mut buf_reader)?;
        self.extract(path, &exif)
    }
}

impl Default for ExifMetadataProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn field_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Ascii(vec) => vec.first().map(|ascii_val| {
            String::from_utf8_lossy(ascii_val)
                .trim_end_matches('\0')
                .to_string()
        }),
        _ => None,
    }
}

fn first_rational(value: &Value) -> Option<f64> {
    match value {
        Value::Rational(vec) => vec
            .first()
            .filter(|r| r.denom != 0)
            .map(|r| r.num as f64 / r.denom as f64),
        _ => None,
    }
}

fn rationals(value: &Value) -> Option<Vec<f64>> {
    match value {
        Value::Rational(vec) if vec.len() >= 3 => vec
            .iter()
            .take(3)
            .map(|r| (r.denom != 0).then(|| r.num as f64 / r.denom as f64))
            .collect(),
        _ => None,
    }
}

fn dms_to_degrees(value: &Value) -> Option<f64> {
    let parts = rationals(value)?;
    Some(parts[0] + parts[1] / 60.0 + parts[2] / 3600.0)
}

/// GPSDateStamp is "YYYY:MM:DD", GPSTimeStamp is three rationals (h, m, s).
fn parse_gps_datetime(date: &str, time: &Value) -> Option<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(date.trim(), "%Y:%m:%d").ok()?;
    let hms = rationals(time)?;
    let whole_secs = hms[2].trunc();
    let nanos = ((hms[2] - whole_secs) * 1e9).round() as u32;
    let naive = date.and_hms_nano_opt(hms[0] as u32, hms[1] as u32, whole_secs as u32, nanos)?;
    Some(naive.and_utc())
}

/// EXIF datetime format: "YYYY:MM:DD HH:MM:SS"
fn parse_exif_datetime(datetime_str: &str) -> Option<DateTime<Utc>> {
    match NaiveDateTime::parse_from_str(datetime_str.trim(), "%Y:%m:%d %H:%M:%S") {
        Ok(dt) => Some(dt.and_utc()),
        Err(_) => {
            log::warn!("Failed to parse EXIF datetime: {}", datetime_str);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use exif::Rational;
    use std::fs;
    use tempfile::TempDir;

    fn rational(num: u32, denom: u32) -> Rational {
        Rational { num, denom }
    }

    #[test]
    fn test_read_geotag_no_file() {
        let provider = ExifMetadataProvider::new();
        let result = provider.read_geotag(Path::new("/non/existent/file.jpg"));
        assert!(matches!(result, Err(MetadataError::Io(_))));
    }

    #[test]
    fn test_read_geotag_no_exif_data() {
        let temp_dir = TempDir::new().unwrap();
        let file_path = temp_dir.path().join("no_exif.jpg");
        fs::write(&file_path, b"This is not an image file").unwrap();

        let provider = ExifMetadataProvider::new();
        assert!(provider.read_geotag(&file_path).is_err());
    }

    #[test]
    fn test_dms_to_degrees() {
        let value = Value::Rational(vec![rational(52, 1), rational(30, 1), rational(3600, 100)]);
        let degrees = dms_to_degrees(&value).unwrap();
        assert!((degrees - 52.51).abs() < 1e-9);
    }

    #[test]
    fn test_dms_rejects_zero_denominator() {
        let value = Value::Rational(vec![rational(52, 0), rational(30, 1), rational(0, 1)]);
        assert!(dms_to_degrees(&value).is_none());
    }

    #[test]
    fn test_parse_gps_datetime_with_fraction() {
        use chrono::Timelike;

        let time = Value::Rational(vec![rational(14, 1), rational(30, 1), rational(4550, 100)]);
        let dt = parse_gps_datetime("2023:12:25", &time).unwrap();
        assert_eq!(dt.hour(), 14);
        assert_eq!(dt.minute(), 30);
        assert_eq!(dt.second(), 45);
        assert_eq!(dt.nanosecond(), 500_000_000);
    }

    #[test]
    fn test_parse_exif_datetime() {
        use chrono::{Datelike, Timelike};

        let parsed = parse_exif_datetime("2023:12:25 14:30:45").unwrap();
        assert_eq!(parsed.year(), 2023);
        assert_eq!(parsed.month(), 12);
        assert_eq!(parsed.day(), 25);
        assert_eq!(parsed.hour(), 14);
        assert_eq!(parsed.second(), 45);

        assert!(parse_exif_datetime("not a date").is_none());
    }
}
