use std::env;
use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result, bail};
use chrono::NaiveDate;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ziptz_rs::{GeocodeOptions, census, postal, timezone, types, utils};

const DATE_FORMAT: &str = "%Y-%m-%d";

struct Options {
    output: PathBuf,
    date: Option<NaiveDate>,
    cities: Vec<String>,
    states: Vec<String>,
    zip_codes: Vec<String>,
    coordinates: bool,
    timezones: bool,
    fill: bool,
    batch_size: usize,
}

fn print_usage(program: &str) {
    eprintln!("Usage: {program} <output-file> [options]");
    eprintln!("  output-file: where to save the table (.csv, .json or .xlsx)");
    eprintln!("  --date YYYY-MM-DD   locale directory date (default: today, Eastern time)");
    eprintln!("  --city NAME         filter on city or town (repeatable, case-insensitive)");
    eprintln!("  --state ST          filter on state (repeatable)");
    eprintln!("  --zip ZIPCODE       filter on zip code (repeatable)");
    eprintln!("  --coordinates       include geocoded coordinates");
    eprintln!("  --timezones         include timezones (implies fetching coordinates)");
    eprintln!("  --no-fill           do not backfill missing timezones from nearby locales");
    eprintln!(
        "  --batch-size N      rows per geocoding upload (default {})",
        census::DEFAULT_BATCH_SIZE
    );
}

fn parse_options(args: &[String]) -> Result<Options> {
    let mut options = Options {
        output: PathBuf::new(),
        date: None,
        cities: Vec::new(),
        states: Vec::new(),
        zip_codes: Vec::new(),
        coordinates: false,
        timezones: false,
        fill: true,
        batch_size: census::DEFAULT_BATCH_SIZE,
    };

    let mut positional = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let mut value_of = |flag: &str| {
            iter.next()
                .with_context(|| format!("{flag} requires a value"))
        };
        match arg.as_str() {
            "--date" => {
                let raw = value_of("--date")?;
                options.date = Some(
                    NaiveDate::parse_from_str(raw, DATE_FORMAT)
                        .with_context(|| format!("invalid --date {raw:?}, expected YYYY-MM-DD"))?,
                );
            }
            "--city" => options.cities.push(value_of("--city")?.to_lowercase()),
            "--state" => options.states.push(value_of("--state")?.to_uppercase()),
            "--zip" => options.zip_codes.push(value_of("--zip")?.clone()),
            "--coordinates" => options.coordinates = true,
            "--timezones" => options.timezones = true,
            "--no-fill" => options.fill = false,
            "--batch-size" => {
                let raw = value_of("--batch-size")?;
                options.batch_size = raw
                    .parse()
                    .with_context(|| format!("invalid --batch-size {raw:?}"))?;
            }
            other if other.starts_with("--") => bail!("unknown option {other}"),
            other => positional.push(other.to_string()),
        }
    }

    match positional.as_slice() {
        [output] => options.output = PathBuf::from(output),
        [] => bail!("missing output file"),
        _ => bail!("expected exactly one output file"),
    }
    Ok(options)
}

fn apply_filters(mut locales: Vec<types::LocaleRecord>, options: &Options) -> Vec<types::LocaleRecord> {
    if !options.cities.is_empty() {
        locales.retain(|r| options.cities.contains(&r.city.to_lowercase()));
        info!("City filter reduced the table to {} row(s)", locales.len());
    }
    if !options.states.is_empty() {
        locales.retain(|r| options.states.contains(&r.state));
        info!("State filter reduced the table to {} row(s)", locales.len());
    }
    if !options.zip_codes.is_empty() {
        locales.retain(|r| options.zip_codes.contains(&r.zip_code));
        info!("ZipCode filter reduced the table to {} row(s)", locales.len());
    }
    locales
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ziptz_rs=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage(&args[0]);
        process::exit(1);
    }
    let options = match parse_options(&args[1..]) {
        Ok(options) => options,
        Err(err) => {
            eprintln!("Error: {err:#}");
            print_usage(&args[0]);
            process::exit(1);
        }
    };

    timezone::maybe_preload();

    let locales = postal::get_locales(options.date).await?;
    info!("Query for locales returned {} row(s)", locales.len());
    let locales = apply_filters(locales, &options);

    if !options.coordinates && !options.timezones {
        return utils::save_records(&locales, &options.output);
    }

    // Timezones need coordinates even when only timezones were requested.
    let geocode_options = GeocodeOptions {
        batch_size: options.batch_size,
        ..GeocodeOptions::default()
    };
    let geocoded = census::get_coordinates(&locales, &geocode_options).await?;

    if !options.timezones {
        return utils::save_records(&geocoded, &options.output);
    }

    let zoned = timezone::fill_timezones(geocoded, options.fill);
    let missing = zoned.iter().filter(|r| r.time_zone.is_none()).count();
    if missing > 0 {
        warn!("There are {missing} row(s) with missing timezones");
    }

    if options.coordinates {
        utils::save_records(&zoned, &options.output)
    } else {
        let stripped: Vec<types::LocaleZoneRecord> = zoned
            .into_iter()
            .map(types::TimezonedRecord::without_coordinates)
            .collect();
        utils::save_records(&stripped, &options.output)
    }
}
