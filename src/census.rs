//! Client for the Census Bureau geocoding service.
//!
//! The batch path splits a locale table into bounded-size chunks, uploads
//! each as a headerless CSV, and joins the matched coordinates back onto the
//! table by row index. One failed batch degrades its rows to unresolved
//! coordinates instead of aborting the run.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::http;
use crate::types::{Benchmark, Coordinate, GeocodedRecord, LocaleRecord};

/// Default rows per upload, kept under the service ceiling.
pub const DEFAULT_BATCH_SIZE: usize = 9500;
/// Hard per-upload record ceiling enforced by the service.
pub const MAX_BATCH_RECORDS: usize = 10_000;
/// Hard per-upload payload ceiling enforced by the service (5MB).
pub const MAX_BATCH_BUFFER_SIZE: usize = 5_000_000;

pub const DEFAULT_VINTAGE: &str = "Current_Current";

const CENSUS_URL: &str = "https://geocoding.geo.census.gov/geocoder/locations/address";
const CENSUS_BATCH_URL: &str =
    "https://geocoding.geo.census.gov/geocoder/geographies/addressbatch";
const BENCHMARKS_URL: &str = "https://geocoding.geo.census.gov/geocoder/benchmarks";
const VINTAGES_URL: &str = "https://geocoding.geo.census.gov/geocoder/vintages";

// Batch response columns: id, input address, match status, match type,
// matched address, "lon,lat", then six census-geography fields we ignore.
const MATCH_STATUS_FIELD: usize = 2;
const COORDINATES_FIELD: usize = 5;

/// Options for a batched coordinate-resolution run.
#[derive(Debug, Clone)]
pub struct GeocodeOptions {
    pub benchmark: Benchmark,
    pub vintage: String,
    pub batch_size: usize,
}

impl Default for GeocodeOptions {
    fn default() -> Self {
        Self {
            benchmark: Benchmark::default(),
            vintage: DEFAULT_VINTAGE.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// A contiguous, index-aligned slice of the source table.
///
/// `start` is the global index of the slice's first row, so row `i` of the
/// slice carries identifier `start + i` on the wire.
#[derive(Debug, Clone, Copy)]
pub struct Batch<'a> {
    pub start: usize,
    pub records: &'a [LocaleRecord],
}

/// Split a locale table into upload-sized batches in original row order.
///
/// The requested size is clamped to `MAX_BATCH_RECORDS`; the slices partition
/// the index space exactly.
pub fn split_batches(
    records: &[LocaleRecord],
    batch_size: usize,
) -> impl Iterator<Item = Batch<'_>> {
    let effective = batch_size.clamp(1, MAX_BATCH_RECORDS);
    records
        .chunks(effective)
        .enumerate()
        .map(move |(i, chunk)| Batch {
            start: i * effective,
            records: chunk,
        })
}

/// Serialize a batch to the upload format: headerless CSV rows of
/// `index,street,city,state,zip`.
///
/// The service ceilings are preconditions of a correctly sized batch, not
/// recoverable conditions, so they are asserted.
fn serialize_batch(batch: &Batch<'_>) -> Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    for (offset, record) in batch.records.iter().enumerate() {
        let id = (batch.start + offset).to_string();
        writer.write_record([
            id.as_str(),
            record.street.as_str(),
            record.city.as_str(),
            record.state.as_str(),
            record.zip_code.as_str(),
        ])?;
    }
    let payload = writer
        .into_inner()
        .context("failed to finish batch payload")?;

    assert!(
        batch.records.len() <= MAX_BATCH_RECORDS,
        "{} > {MAX_BATCH_RECORDS} records in one batch",
        batch.records.len()
    );
    assert!(
        payload.len() < MAX_BATCH_BUFFER_SIZE,
        "{} >= {MAX_BATCH_BUFFER_SIZE} bytes in one batch payload",
        payload.len()
    );
    Ok(payload)
}

/// Parse a downloaded batch result file into `(row index, coordinate)` pairs.
///
/// Only rows whose match status is exactly `Match` are kept; their
/// coordinate field is a `"lon,lat"` string. Rows with other statuses carry
/// fewer fields, hence the flexible reader.
fn parse_batch_file(path: &Path) -> Result<Vec<(usize, Coordinate)>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("failed to open batch result {}", path.display()))?;

    let mut matched = Vec::new();
    for row in reader.records() {
        let row = row.context("malformed batch result row")?;
        if row.get(MATCH_STATUS_FIELD).map(str::trim) != Some("Match") {
            continue;
        }
        let id: usize = row
            .get(0)
            .context("batch result row missing identifier")?
            .trim()
            .parse()
            .context("batch result identifier is not an index")?;
        let coordinates = row
            .get(COORDINATES_FIELD)
            .context("matched row missing coordinates")?;
        let (lon, lat) = coordinates
            .split_once(',')
            .with_context(|| format!("unsplittable coordinate pair {coordinates:?}"))?;
        matched.push((
            id,
            Coordinate {
                latitude: lat.trim().parse().context("bad latitude")?,
                longitude: lon.trim().parse().context("bad longitude")?,
            },
        ));
    }
    Ok(matched)
}

/// Resolve one batch against the batch-geocoding endpoint.
///
/// `Ok(None)` means the retried call itself exhausted its budget: the batch
/// is treated as fully unmatched and the pipeline moves on. Parse errors in a
/// successfully downloaded file propagate as `Err`.
async fn geocode_batch(
    client: &Client,
    batch: &Batch<'_>,
    options: &GeocodeOptions,
) -> Result<Option<Vec<(usize, Coordinate)>>> {
    let payload = serialize_batch(batch)?;
    let params = [
        ("benchmark", options.benchmark.as_str()),
        ("vintage", options.vintage.as_str()),
    ];
    let file_name = format!("upload-{}.csv", batch.start);

    let downloaded = match http::post_and_download_file(
        client,
        CENSUS_BATCH_URL,
        &params,
        "addressFile",
        &file_name,
        &payload,
    )
    .await
    {
        Ok(file) => file,
        Err(err) => {
            warn!(
                "Batch of {} rows starting at {} failed, leaving it unmatched: {err:#}",
                batch.records.len(),
                batch.start
            );
            return Ok(None);
        }
    };

    let matched = parse_batch_file(downloaded.path())?;
    debug!(
        "Retrieved coordinates for {} out of {} rows",
        matched.len(),
        batch.records.len()
    );
    Ok(Some(matched))
}

/// Left-join resolved coordinates onto the source table by row index.
///
/// Never drops or invents rows: the output has one entry per input row, with
/// `None` coordinates wherever no batch supplied a match.
fn join_coordinates(
    records: &[LocaleRecord],
    resolved: &HashMap<usize, Coordinate>,
) -> Vec<GeocodedRecord> {
    records
        .iter()
        .enumerate()
        .map(|(index, record)| GeocodedRecord::new(record.clone(), resolved.get(&index).copied()))
        .collect()
}

/// Resolve coordinates for a whole locale table via batched geocoding.
///
/// Batches run sequentially within one shared session; results are joined by
/// row index, so completion order never matters. When every batch fails the
/// result is the input table with fully absent coordinates, not an error.
pub async fn get_coordinates(
    records: &[LocaleRecord],
    options: &GeocodeOptions,
) -> Result<Vec<GeocodedRecord>> {
    if records.is_empty() {
        debug!("Empty locale table, skipping geocoding");
        return Ok(Vec::new());
    }

    let batch_size = options.batch_size.clamp(1, MAX_BATCH_RECORDS);
    debug!(
        "Chunking {} rows into {} batch request(s) with up to {batch_size} rows each",
        records.len(),
        records.len().div_ceil(batch_size)
    );

    let client = Client::new();
    let mut resolved: HashMap<usize, Coordinate> = HashMap::new();
    let mut failed_batches = 0usize;
    for batch in split_batches(records, batch_size) {
        match geocode_batch(&client, &batch, options).await? {
            Some(pairs) => resolved.extend(pairs),
            None => failed_batches += 1,
        }
    }

    if failed_batches > 0 {
        warn!("{failed_batches} batch(es) returned no results; their rows have no coordinates");
    }
    Ok(join_coordinates(records, &resolved))
}

/// One benchmark or vintage as reported by the service metadata endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceMetadata {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Description")]
    pub description: String,
    #[serde(rename = "Default")]
    pub default: bool,
}

#[derive(Debug, Deserialize)]
struct BenchmarksResponse {
    #[serde(default)]
    benchmarks: Vec<RawBenchmark>,
}

#[derive(Debug, Deserialize)]
struct RawBenchmark {
    #[serde(rename = "benchmarkName")]
    name: String,
    #[serde(rename = "benchmarkDescription")]
    description: String,
    #[serde(rename = "isDefault", default)]
    is_default: bool,
}

#[derive(Debug, Deserialize)]
struct VintagesResponse {
    #[serde(default)]
    vintages: Vec<RawVintage>,
}

#[derive(Debug, Deserialize)]
struct RawVintage {
    #[serde(rename = "vintageName")]
    name: String,
    #[serde(rename = "vintageDescription")]
    description: String,
    #[serde(rename = "isDefault", default)]
    is_default: bool,
}

/// List the benchmarks the geocoding service currently offers.
pub async fn get_benchmarks() -> Result<Vec<ServiceMetadata>> {
    let client = Client::new();
    let response: BenchmarksResponse = http::get_json(&client, BENCHMARKS_URL, &[]).await?;
    Ok(response
        .benchmarks
        .into_iter()
        .map(|b| ServiceMetadata {
            name: b.name,
            description: b.description,
            default: b.is_default,
        })
        .collect())
}

/// List the vintages available for `benchmark`.
pub async fn get_vintages(benchmark: Benchmark) -> Result<Vec<ServiceMetadata>> {
    let client = Client::new();
    let params = [("benchmark", benchmark.as_str())];
    let response: VintagesResponse = http::get_json(&client, VINTAGES_URL, &params).await?;
    Ok(response
        .vintages
        .into_iter()
        .map(|v| ServiceMetadata {
            name: v.name,
            description: v.description,
            default: v.is_default,
        })
        .collect())
}

#[derive(Debug, Deserialize)]
struct SingleAddressResponse {
    result: SingleAddressResult,
}

#[derive(Debug, Deserialize)]
struct SingleAddressResult {
    #[serde(rename = "addressMatches", default)]
    address_matches: Vec<AddressMatch>,
}

#[derive(Debug, Deserialize)]
struct AddressMatch {
    coordinates: Option<MatchCoordinates>,
}

#[derive(Debug, Deserialize)]
struct MatchCoordinates {
    x: f64,
    y: f64,
}

/// Resolve a single address; first match wins, `None` when nothing matched.
pub async fn get_address_coordinates(
    street: &str,
    city: &str,
    state: &str,
    zip_code: &str,
    benchmark: Benchmark,
) -> Result<Option<Coordinate>> {
    let client = Client::new();
    let params = [
        ("format", "json"),
        ("benchmark", benchmark.as_str()),
        ("street", street),
        ("city", city),
        ("state", state),
        ("zip", zip_code),
    ];
    let response: SingleAddressResponse = http::get_json(&client, CENSUS_URL, &params).await?;
    Ok(response
        .result
        .address_matches
        .into_iter()
        .find_map(|m| m.coordinates)
        .map(|c| Coordinate {
            latitude: c.y,
            longitude: c.x,
        }))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn locale(street: &str, city: &str, state: &str, zip: &str) -> LocaleRecord {
        LocaleRecord {
            street: street.to_string(),
            city: city.to_string(),
            state: state.to_string(),
            zip_code: zip.to_string(),
        }
    }

    fn table(n: usize) -> Vec<LocaleRecord> {
        (0..n)
            .map(|i| locale(&format!("{i} Main St"), "Springfield", "IL", "62701"))
            .collect()
    }

    #[test]
    fn test_split_batches_partitions_exactly() {
        let records = table(7);
        let batches: Vec<_> = split_batches(&records, 3).collect();
        assert_eq!(batches.len(), 3);
        assert_eq!(
            batches.iter().map(|b| b.records.len()).sum::<usize>(),
            records.len()
        );
        // Contiguous and index-aligned, no gaps or overlap.
        let mut next = 0;
        for batch in &batches {
            assert_eq!(batch.start, next);
            next += batch.records.len();
        }
        assert_eq!(next, records.len());
    }

    #[test]
    fn test_split_batches_single_batch_for_small_input() {
        let records = table(2);
        let batches: Vec<_> = split_batches(&records, 500).collect();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].start, 0);
        assert_eq!(batches[0].records.len(), 2);
    }

    #[test]
    fn test_split_batches_clamps_to_service_ceiling() {
        let records = table(MAX_BATCH_RECORDS + 1);
        let batches: Vec<_> = split_batches(&records, MAX_BATCH_RECORDS * 10).collect();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].records.len(), MAX_BATCH_RECORDS);
        assert_eq!(batches[1].start, MAX_BATCH_RECORDS);
        assert_eq!(batches[1].records.len(), 1);

        // A zero batch size must not panic the chunker either.
        let tiny: Vec<_> = split_batches(&records[..3], 0).collect();
        assert_eq!(tiny.len(), 3);
    }

    #[test]
    fn test_serialize_batch_is_headerless_and_index_prefixed() {
        let records = table(2);
        let batch = Batch {
            start: 5,
            records: &records,
        };
        let payload = serialize_batch(&batch).unwrap();
        let text = String::from_utf8(payload).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("5,0 Main St,Springfield,IL,62701"));
        assert!(lines[1].starts_with("6,1 Main St,Springfield,IL,62701"));
    }

    #[test]
    fn test_parse_batch_file_keeps_only_matches() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#""0","100 MAIN ST, SPRINGFIELD, IL, 62701","Match","Exact","100 MAIN ST, SPRINGFIELD, IL, 62701","-89.650148,39.781721","606","17","167","0011","1","L""#
        )
        .unwrap();
        writeln!(file, r#""1","200 ELM ST, NOWHERE, ZZ, 00000","No_Match""#).unwrap();
        writeln!(file, r#""2","300 OAK ST, SPRINGFIELD, IL, 62701","Tie""#).unwrap();
        file.flush().unwrap();

        let matched = parse_batch_file(file.path()).unwrap();
        assert_eq!(matched.len(), 1);
        let (id, coordinate) = matched[0];
        assert_eq!(id, 0);
        assert!((coordinate.longitude - -89.650148).abs() < 1e-9);
        assert!((coordinate.latitude - 39.781721).abs() < 1e-9);
    }

    #[test]
    fn test_parse_batch_file_propagates_bad_coordinates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#""0","100 MAIN ST","Match","Exact","100 MAIN ST","not-a-pair","606""#
        )
        .unwrap();
        file.flush().unwrap();
        assert!(parse_batch_file(file.path()).is_err());
    }

    #[test]
    fn test_join_preserves_row_count_and_order() {
        let records = table(3);
        // Batch 1 (rows 0-1) matched, batch 2 (row 2) failed entirely.
        let mut resolved = HashMap::new();
        resolved.insert(
            0,
            Coordinate {
                latitude: 39.78,
                longitude: -89.65,
            },
        );
        resolved.insert(
            1,
            Coordinate {
                latitude: 39.79,
                longitude: -89.66,
            },
        );

        let joined = join_coordinates(&records, &resolved);
        assert_eq!(joined.len(), 3);
        assert_eq!(joined[0].street, "0 Main St");
        assert_eq!(joined[0].latitude, Some(39.78));
        assert_eq!(joined[1].longitude, Some(-89.66));
        assert_eq!(joined[2].latitude, None);
        assert_eq!(joined[2].longitude, None);
    }

    #[test]
    fn test_join_with_no_results_keeps_all_rows_absent() {
        let records = table(4);
        let joined = join_coordinates(&records, &HashMap::new());
        assert_eq!(joined.len(), 4);
        assert!(joined.iter().all(|r| r.latitude.is_none() && r.longitude.is_none()));
    }

    #[tokio::test]
    async fn test_get_coordinates_empty_input_skips_network() {
        let result = get_coordinates(&[], &GeocodeOptions::default())
            .await
            .unwrap();
        assert!(result.is_empty());
    }
}
