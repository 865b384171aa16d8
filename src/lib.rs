pub mod census;
pub mod http;
pub mod postal;
pub mod timezone;
pub mod types;
pub mod utils;

pub use census::{
    GeocodeOptions, ServiceMetadata, get_address_coordinates, get_benchmarks, get_coordinates,
    get_vintages, split_batches,
};
pub use postal::get_locales;
pub use timezone::{fill_timezones, resolve_coordinate};
pub use types::{
    Benchmark, Columns, Coordinate, GeocodedRecord, LocaleRecord, LocaleZoneRecord,
    TimezonedRecord,
};
pub use utils::save_records;
