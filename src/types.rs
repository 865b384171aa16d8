use std::fmt;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// Census geocoder benchmark identifiers
///
/// The benchmark selects which reference dataset the geocoding service
/// resolves against. The wire values are opaque strings; `get_benchmarks`
/// lists everything the service currently offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Benchmark {
    #[default]
    PublicArCurrent,
    PublicArAcs2024,
    PublicArCensus2020,
}

impl Benchmark {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PublicArCurrent => "4",
            Self::PublicArAcs2024 => "8",
            Self::PublicArCensus2020 => "2020",
        }
    }
}

impl fmt::Display for Benchmark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Column names of a tabular record type, in serialization order.
///
/// Lets the output writers emit a header row even when a filter matched
/// nothing and the table is empty.
pub trait Columns {
    fn columns() -> &'static [&'static str];
}

/// A resolved latitude/longitude pair
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

/// One row of the USPS ZIP locale table.
///
/// A record's identity is its ordinal index within the table it was fetched
/// with; batch results are joined back on that index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LocaleRecord {
    pub street: String,
    pub city: String,
    pub state: String,
    pub zip_code: String,
}

impl Columns for LocaleRecord {
    fn columns() -> &'static [&'static str] {
        &["Street", "City", "State", "ZipCode"]
    }
}

/// A locale record augmented with geocoded coordinates.
///
/// Both coordinate fields are `None` exactly when resolution failed or was
/// never attempted for the row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GeocodedRecord {
    pub street: String,
    pub city: String,
    pub state: String,
    pub zip_code: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl GeocodedRecord {
    pub fn new(locale: LocaleRecord, coordinate: Option<Coordinate>) -> Self {
        Self {
            street: locale.street,
            city: locale.city,
            state: locale.state,
            zip_code: locale.zip_code,
            latitude: coordinate.map(|c| c.latitude),
            longitude: coordinate.map(|c| c.longitude),
        }
    }
}

impl Columns for GeocodedRecord {
    fn columns() -> &'static [&'static str] {
        &["Street", "City", "State", "ZipCode", "Latitude", "Longitude"]
    }
}

/// A geocoded record augmented with an IANA time zone.
///
/// `time_zone` is `None` when the coordinate was absent, lay outside every
/// known boundary, or no fallback peer supplied a value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TimezonedRecord {
    pub street: String,
    pub city: String,
    pub state: String,
    pub zip_code: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    #[serde(rename = "TZ")]
    pub time_zone: Option<Tz>,
}

impl TimezonedRecord {
    pub fn new(geocoded: GeocodedRecord, time_zone: Option<Tz>) -> Self {
        Self {
            street: geocoded.street,
            city: geocoded.city,
            state: geocoded.state,
            zip_code: geocoded.zip_code,
            latitude: geocoded.latitude,
            longitude: geocoded.longitude,
            time_zone,
        }
    }

    /// Output shape for timezone-only runs where coordinates were an
    /// intermediate, not a requested column.
    pub fn without_coordinates(self) -> LocaleZoneRecord {
        LocaleZoneRecord {
            street: self.street,
            city: self.city,
            state: self.state,
            zip_code: self.zip_code,
            time_zone: self.time_zone,
        }
    }
}

impl Columns for TimezonedRecord {
    fn columns() -> &'static [&'static str] {
        &[
            "Street",
            "City",
            "State",
            "ZipCode",
            "Latitude",
            "Longitude",
            "TZ",
        ]
    }
}

/// A locale record with its time zone but no coordinate columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LocaleZoneRecord {
    pub street: String,
    pub city: String,
    pub state: String,
    pub zip_code: String,
    #[serde(rename = "TZ")]
    pub time_zone: Option<Tz>,
}

impl Columns for LocaleZoneRecord {
    fn columns() -> &'static [&'static str] {
        &["Street", "City", "State", "ZipCode", "TZ"]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_benchmark_wire_values() {
        assert_eq!(Benchmark::default().as_str(), "4");
        assert_eq!(Benchmark::PublicArAcs2024.to_string(), "8");
        assert_eq!(Benchmark::PublicArCensus2020.to_string(), "2020");
    }

    #[test]
    fn test_columns_match_serialized_headers() {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer
            .serialize(LocaleRecord {
                street: "1 Main St".to_string(),
                city: "Springfield".to_string(),
                state: "IL".to_string(),
                zip_code: "62701".to_string(),
            })
            .unwrap();
        let text = String::from_utf8(writer.into_inner().unwrap()).unwrap();
        assert_eq!(
            text.lines().next().unwrap(),
            LocaleRecord::columns().join(",")
        );
    }

    #[test]
    fn test_record_promotion_keeps_fields() {
        let locale = LocaleRecord {
            street: "1600 Pennsylvania Ave NW".to_string(),
            city: "Washington".to_string(),
            state: "DC".to_string(),
            zip_code: "20500".to_string(),
        };
        let geocoded = GeocodedRecord::new(
            locale,
            Some(Coordinate {
                latitude: 38.8977,
                longitude: -77.0365,
            }),
        );
        assert_eq!(geocoded.latitude, Some(38.8977));

        let zoned = TimezonedRecord::new(geocoded, Some(chrono_tz::America::New_York));
        let stripped = zoned.without_coordinates();
        assert_eq!(stripped.zip_code, "20500");
        assert_eq!(stripped.time_zone, Some(chrono_tz::America::New_York));
    }
}
