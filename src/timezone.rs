//! Coordinate-to-timezone resolution and the tiered fallback fill.
//!
//! The point-in-polygon finder is expensive to build, so one instance lives
//! behind a process-wide `OnceLock` and is shared read-only by every lookup.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::OnceLock;

use chrono_tz::Tz;
use tracing::{debug, info, warn};
use tzf_rs::r#gen::Timezones;
use tzf_rs::{DefaultFinder, Finder};

use crate::types::{GeocodedRecord, TimezonedRecord};

/// Path to a tzf protobuf dataset overriding the embedded one.
pub const TZ_BOUNDARY_DATA_ENV: &str = "TZ_BOUNDARY_DATA";
/// Truthy ("1"/"true"): build the finder at startup instead of first lookup.
pub const TZ_BOUNDARY_EAGER_ENV: &str = "TZ_BOUNDARY_EAGER";

enum BoundaryFinder {
    Embedded(DefaultFinder),
    File(Finder),
}

impl BoundaryFinder {
    fn tz_name(&self, longitude: f64, latitude: f64) -> &str {
        match self {
            Self::Embedded(finder) => finder.get_tz_name(longitude, latitude),
            Self::File(finder) => finder.get_tz_name(longitude, latitude),
        }
    }
}

static FINDER: OnceLock<BoundaryFinder> = OnceLock::new();

fn boundary_finder() -> &'static BoundaryFinder {
    FINDER.get_or_init(|| {
        if let Ok(path) = std::env::var(TZ_BOUNDARY_DATA_ENV) {
            match std::fs::read(&path) {
                Ok(bytes) => match Timezones::try_from(bytes) {
                    Ok(timezones) => {
                        debug!("Loaded timezone boundaries from {path}");
                        return BoundaryFinder::File(Finder::from_pb(timezones));
                    }
                    Err(err) => {
                        warn!("Ignoring {path}: not a timezone dataset ({err:?})");
                    }
                },
                Err(err) => warn!("Ignoring unreadable {path}: {err}"),
            }
        }
        BoundaryFinder::Embedded(DefaultFinder::new())
    })
}

fn env_truthy(name: &str) -> bool {
    matches!(
        std::env::var(name).unwrap_or_default().to_lowercase().as_str(),
        "true" | "1"
    )
}

/// Build the shared boundary finder now if `TZ_BOUNDARY_EAGER` asks for it.
pub fn maybe_preload() {
    if env_truthy(TZ_BOUNDARY_EAGER_ENV) {
        boundary_finder();
    }
}

/// Resolve one coordinate pair to a time zone.
///
/// Absent or non-finite coordinates skip the lookup. The embedded dataset
/// covers the oceans with `Etc/GMT±N` offset zones, so open water resolves
/// to one of those rather than `None`; only a custom dataset without ocean
/// polygons produces the empty-name miss. An empty or unrecognized zone name
/// collapses to `None`.
pub fn resolve_coordinate(latitude: Option<f64>, longitude: Option<f64>) -> Option<Tz> {
    let (latitude, longitude) = (latitude?, longitude?);
    if !latitude.is_finite() || !longitude.is_finite() {
        return None;
    }
    let zone = boundary_finder().tz_name(longitude, latitude);
    if zone.is_empty() {
        return None;
    }
    zone.parse().ok()
}

/// Fill one fallback tier: rows still missing a zone borrow any peer's value
/// within the same group. Direct resolutions are never overwritten.
fn fill_tier<K, F>(rows: &mut [TimezonedRecord], key: F) -> usize
where
    K: Eq + Hash,
    F: Fn(&TimezonedRecord) -> K,
{
    let mut donors: HashMap<K, Tz> = HashMap::new();
    for row in rows.iter() {
        if let Some(tz) = row.time_zone {
            donors.entry(key(row)).or_insert(tz);
        }
    }

    let mut healed = 0;
    for row in rows.iter_mut() {
        if row.time_zone.is_none()
            && let Some(tz) = donors.get(&key(row))
        {
            row.time_zone = Some(*tz);
            healed += 1;
        }
    }
    healed
}

/// Backfill missing zones from progressively coarser peer groups:
/// zip+city+state, then city+state, then state. Each tier only touches rows
/// still absent after the previous one.
fn fill_missing_zones(rows: &mut [TimezonedRecord]) {
    let missing_before = rows.iter().filter(|r| r.time_zone.is_none()).count();
    if missing_before == 0 {
        return;
    }

    fill_tier(rows, |r| {
        (r.zip_code.clone(), r.city.clone(), r.state.clone())
    });
    fill_tier(rows, |r| (r.city.clone(), r.state.clone()));
    fill_tier(rows, |r| r.state.clone());

    let missing_after = rows.iter().filter(|r| r.time_zone.is_none()).count();
    info!(
        "Backfilled {} row(s) from their closest locale; {missing_after} remain without a timezone",
        missing_before - missing_after
    );
}

/// Resolve a time zone for every row of a geocoded table.
///
/// With `fill_missing` (the default for callers that don't care), rows whose
/// own coordinate resolved nothing borrow a value from the closest peer
/// group. Rows whose groups hold no value at any tier stay absent; that is
/// expected for unmatched territories, not an error.
pub fn fill_timezones(records: Vec<GeocodedRecord>, fill_missing: bool) -> Vec<TimezonedRecord> {
    debug!("Filling in timezones for {} row(s)", records.len());
    let mut rows: Vec<TimezonedRecord> = records
        .into_iter()
        .map(|record| {
            let zone = resolve_coordinate(record.latitude, record.longitude);
            TimezonedRecord::new(record, zone)
        })
        .collect();

    if fill_missing {
        fill_missing_zones(&mut rows);
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(zip: &str, city: &str, state: &str, tz: Option<Tz>) -> TimezonedRecord {
        TimezonedRecord {
            street: "1 Test St".to_string(),
            city: city.to_string(),
            state: state.to_string(),
            zip_code: zip.to_string(),
            latitude: None,
            longitude: None,
            time_zone: tz,
        }
    }

    #[test]
    fn test_resolve_absent_coordinates() {
        assert_eq!(resolve_coordinate(None, None), None);
        assert_eq!(resolve_coordinate(Some(40.0), None), None);
        assert_eq!(resolve_coordinate(Some(f64::NAN), Some(-74.0)), None);
    }

    #[test]
    fn test_resolve_known_zone() {
        // Midtown Manhattan.
        let zone = resolve_coordinate(Some(40.7128), Some(-74.0060));
        assert_eq!(zone, Some(chrono_tz::America::New_York));
    }

    #[test]
    fn test_resolve_open_ocean_uses_offset_zone() {
        // The embedded dataset covers open water with Etc/GMT offset zones.
        let zone = resolve_coordinate(Some(30.0), Some(-150.0));
        assert_eq!(zone, Some(chrono_tz::Etc::GMTPlus10));
    }

    #[test]
    fn test_fill_tiers_use_closest_group_first() {
        let ny: Tz = chrono_tz::America::New_York;
        let chi: Tz = chrono_tz::America::Chicago;
        let mut rows = vec![
            row("1", "X", "NY", None),
            row("1", "X", "NY", Some(ny)),
            row("2", "X", "NY", None),
            row("3", "Y", "NY", Some(chi)),
        ];
        fill_missing_zones(&mut rows);

        // Tier 1: zip+city+state peer.
        assert_eq!(rows[0].time_zone, Some(ny));
        // Tier 2: no zip peer, city+state peer wins before the state tier.
        assert_eq!(rows[2].time_zone, Some(ny));
        // Directly resolved rows are untouched.
        assert_eq!(rows[3].time_zone, Some(chi));
    }

    #[test]
    fn test_fill_leaves_groupless_rows_absent() {
        let mut rows = vec![
            row("1", "X", "NY", None),
            row("2", "Y", "CA", Some(chrono_tz::America::Los_Angeles)),
        ];
        fill_missing_zones(&mut rows);
        assert_eq!(rows[0].time_zone, None);
    }

    #[test]
    fn test_fill_is_idempotent_on_resolved_table() {
        let ny: Tz = chrono_tz::America::New_York;
        let mut rows = vec![row("1", "X", "NY", Some(ny)), row("2", "X", "NY", Some(ny))];
        let before = rows.clone();
        fill_missing_zones(&mut rows);
        assert_eq!(rows, before);
        fill_missing_zones(&mut rows);
        assert_eq!(rows, before);
    }

    #[test]
    fn test_fill_timezones_maps_absent_coordinates_to_absent_zone() {
        let records = vec![GeocodedRecord {
            street: "1 Test St".to_string(),
            city: "Nowhere".to_string(),
            state: "ZZ".to_string(),
            zip_code: "00000".to_string(),
            latitude: None,
            longitude: None,
        }];
        let rows = fill_timezones(records, true);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].time_zone, None);
    }
}
