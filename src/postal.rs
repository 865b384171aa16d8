//! USPS ZIP locale source: download the monthly ZIP_Locale_Detail spreadsheet
//! and map it into locale records.

use std::path::Path;

use anyhow::{Context, Result};
use calamine::{Data, Reader, open_workbook_auto};
use chrono::{Datelike, NaiveDate, Utc};
use reqwest::Client;
use tracing::debug;

use crate::http;
use crate::types::LocaleRecord;

const SHEET_NAME: &str = "ZIP_DETAIL";
const STREET_COLUMN: &str = "PHYSICAL DELV ADDR";
const CITY_COLUMN: &str = "PHYSICAL CITY";
const STATE_COLUMN: &str = "PHYSICAL STATE";
const ZIP_COLUMN: &str = "DELIVERY ZIPCODE";

/// Publication date used when the caller doesn't pass one. The file is
/// published on an Eastern-time schedule.
pub fn today_in_new_york() -> NaiveDate {
    Utc::now()
        .with_timezone(&chrono_tz::America::New_York)
        .date_naive()
}

fn locale_url(date: NaiveDate) -> String {
    // Month is unpadded in the published path.
    format!(
        "https://postalpro.usps.com/mnt/glusterfs/{}-{}/ZIP_Locale_Detail.xls",
        date.year(),
        date.month()
    )
}

/// Fetch the ZIP locale table for `date` (defaults to today, Eastern time).
pub async fn get_locales(date: Option<NaiveDate>) -> Result<Vec<LocaleRecord>> {
    let date = date.unwrap_or_else(today_in_new_york);
    let url = locale_url(date);
    let client = Client::new();
    let downloaded = http::get_and_download_file(&client, &url).await?;
    let records = parse_locale_sheet(downloaded.path())?;
    debug!("Parsed {} locale row(s) from {url}", records.len());
    Ok(records)
}

fn parse_locale_sheet(path: &Path) -> Result<Vec<LocaleRecord>> {
    let mut workbook = open_workbook_auto(path)
        .with_context(|| format!("failed to open locale spreadsheet {}", path.display()))?;
    let range = workbook
        .worksheet_range(SHEET_NAME)
        .with_context(|| format!("locale spreadsheet has no {SHEET_NAME} sheet"))?;

    let mut rows = range.rows();
    let header = rows.next().context("locale sheet is empty")?;
    let street_col = find_column(header, STREET_COLUMN)?;
    let city_col = find_column(header, CITY_COLUMN)?;
    let state_col = find_column(header, STATE_COLUMN)?;
    let zip_col = find_column(header, ZIP_COLUMN)?;

    Ok(rows
        .map(|row| LocaleRecord {
            street: cell_text(row, street_col),
            city: cell_text(row, city_col),
            state: cell_text(row, state_col),
            zip_code: zip_text(row, zip_col),
        })
        .collect())
}

fn find_column(header: &[Data], name: &str) -> Result<usize> {
    header
        .iter()
        .position(|cell| cell.to_string().trim() == name)
        .with_context(|| format!("locale sheet is missing the {name:?} column"))
}

fn cell_text(row: &[Data], index: usize) -> String {
    row.get(index)
        .map(|cell| cell.to_string().trim().to_string())
        .unwrap_or_default()
}

/// Zip cells sometimes come through as numbers; keep the leading zeros.
fn zip_text(row: &[Data], index: usize) -> String {
    match row.get(index) {
        Some(Data::Float(value)) => format!("{:05}", *value as i64),
        Some(Data::Int(value)) => format!("{value:05}"),
        Some(other) => other.to_string().trim().to_string(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locale_url_month_is_unpadded() {
        let date = NaiveDate::from_ymd_opt(2026, 3, 14).unwrap();
        assert_eq!(
            locale_url(date),
            "https://postalpro.usps.com/mnt/glusterfs/2026-3/ZIP_Locale_Detail.xls"
        );
    }

    #[test]
    fn test_zip_text_pads_numeric_cells() {
        let row = vec![Data::Float(501.0)];
        assert_eq!(zip_text(&row, 0), "00501");
        let row = vec![Data::String("06390".to_string())];
        assert_eq!(zip_text(&row, 0), "06390");
        assert_eq!(zip_text(&row, 7), "");
    }

    #[test]
    fn test_find_column() {
        let header = vec![
            Data::String("AREA NAME".to_string()),
            Data::String(STREET_COLUMN.to_string()),
        ];
        assert_eq!(find_column(&header, STREET_COLUMN).unwrap(), 1);
        assert!(find_column(&header, ZIP_COLUMN).is_err());
    }
}
