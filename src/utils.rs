//! Output serialization, keyed by the destination file extension.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use anyhow::{Context, Result, bail};
use rust_xlsxwriter::Workbook;
use serde::Serialize;
use tracing::info;

use crate::types::Columns;

const SUPPORTED_FORMATS: &str = ".csv, .json, .xlsx";

/// Save a record table to `path`, picking the writer from the extension.
///
/// The header row is always written, even for an empty table, so the output
/// columns survive a filter that matched nothing. Unsupported extensions are
/// a configuration error and abort the run.
pub fn save_records<T: Serialize + Columns>(records: &[T], path: &Path) -> Result<()> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    info!("Saving {} row(s) to {}", records.len(), path.display());
    match extension.as_str() {
        "csv" => save_csv(records, path),
        "json" => save_json(records, path),
        "xlsx" => save_xlsx(records, path),
        _ => bail!(
            "{} is not a supported format, please select one of {SUPPORTED_FORMATS}",
            path.display()
        ),
    }
}

fn save_csv<T: Serialize + Columns>(records: &[T], path: &Path) -> Result<()> {
    // Write the header row ourselves so it survives an empty table.
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    writer.write_record(T::columns())?;
    for record in records {
        writer.serialize(record)?;
    }
    writer.flush()?;
    Ok(())
}

fn save_json<T: Serialize>(records: &[T], path: &Path) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    serde_json::to_writer(BufWriter::new(file), records)?;
    Ok(())
}

fn save_xlsx<T: Serialize + Columns>(records: &[T], path: &Path) -> Result<()> {
    let mut workbook = Workbook::new();
    let worksheet = workbook.add_worksheet();
    if let Some(first) = records.first() {
        worksheet.serialize_headers(0, 0, first)?;
        for record in records {
            worksheet.serialize(record)?;
        }
    } else {
        for (column, name) in T::columns().iter().enumerate() {
            worksheet.write(0, column as u16, *name)?;
        }
    }
    workbook
        .save(path)
        .with_context(|| format!("failed to save {}", path.display()))?;
    Ok(())
}
