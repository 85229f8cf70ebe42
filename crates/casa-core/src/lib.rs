//! Core domain model for CASA: sheet dates, auction rows and batches,
//! and the CSV parse/serialize pair used by every storage backend.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc, Weekday};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "casa-core";

/// Filename prefix used by the upstream feed and kept for stored sheets.
pub const SHEET_FILENAME_PREFIX: &str = "auction_data_";

#[derive(Debug, Error)]
pub enum DateError {
    #[error("invalid yymmdd date: {0:?}")]
    InvalidYymmdd(String),
}

/// Calendar date in the feed's compact YYMMDD form (years 2000-2099).
///
/// Used both for the claimed date embedded in a source filename and for the
/// resolved storage date a batch is filed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SheetDate(NaiveDate);

impl SheetDate {
    pub fn parse_yymmdd(value: &str) -> Result<Self, DateError> {
        if value.len() != 6 || !value.bytes().all(|b| b.is_ascii_digit()) {
            return Err(DateError::InvalidYymmdd(value.to_string()));
        }
        let yy: i32 = value[..2].parse().map_err(|_| DateError::InvalidYymmdd(value.to_string()))?;
        let mm: u32 = value[2..4].parse().map_err(|_| DateError::InvalidYymmdd(value.to_string()))?;
        let dd: u32 = value[4..6].parse().map_err(|_| DateError::InvalidYymmdd(value.to_string()))?;
        NaiveDate::from_ymd_opt(2000 + yy, mm, dd)
            .map(Self)
            .ok_or_else(|| DateError::InvalidYymmdd(value.to_string()))
    }

    pub fn from_naive(date: NaiveDate) -> Self {
        Self(date)
    }

    pub fn as_naive(&self) -> NaiveDate {
        self.0
    }

    /// Compact YYMMDD form, e.g. `250905`.
    pub fn yymmdd(&self) -> String {
        self.0.format("%y%m%d").to_string()
    }

    /// ISO form, e.g. `2025-09-05`.
    pub fn iso(&self) -> String {
        self.0.format("%Y-%m-%d").to_string()
    }

    /// Filename the sheet for this date is stored under.
    pub fn sheet_filename(&self) -> String {
        format!("{SHEET_FILENAME_PREFIX}{}.csv", self.yymmdd())
    }

    /// Map a claimed source date to the business date its data is filed
    /// under: Mon-Thu roll to the next day, Fri/Sat/Sun collapse onto the
    /// following Monday. Pure calendar arithmetic, crosses month and year
    /// boundaries.
    pub fn next_business_day(&self) -> SheetDate {
        let days = match self.0.weekday() {
            Weekday::Mon | Weekday::Tue | Weekday::Wed | Weekday::Thu => 1,
            Weekday::Fri => 3,
            Weekday::Sat => 2,
            Weekday::Sun => 1,
        };
        SheetDate(self.0 + Duration::days(days))
    }

    /// Inverse of [`next_business_day`]: plausible source dates for a stored
    /// business date, in preference order. Tue-Fri map back to the previous
    /// day; a Monday may carry data published Sunday, Saturday or Friday.
    ///
    /// [`next_business_day`]: SheetDate::next_business_day
    pub fn previous_source_candidates(&self) -> Vec<SheetDate> {
        match self.0.weekday() {
            Weekday::Tue | Weekday::Wed | Weekday::Thu | Weekday::Fri => {
                vec![SheetDate(self.0 - Duration::days(1))]
            }
            _ => vec![
                SheetDate(self.0 - Duration::days(1)),
                SheetDate(self.0 - Duration::days(2)),
                SheetDate(self.0 - Duration::days(3)),
            ],
        }
    }
}

impl fmt::Display for SheetDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.yymmdd())
    }
}

impl FromStr for SheetDate {
    type Err = DateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_yymmdd(s)
    }
}

/// Column headers of the upstream sheet, in canonical serialization order.
pub const SHEET_COLUMNS: [&str; 14] = [
    "sell_number",
    "auction_name",
    "car_number",
    "vin",
    "Post Title",
    "title",
    "year",
    "km",
    "price",
    "color",
    "fuel",
    "trans",
    "score",
    "image",
];

/// One parsed record of a sheet. Field values are carried verbatim from the
/// source CSV so a stored batch re-serializes to the ingested content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuctionRow {
    /// 0-based position among the data rows of the source sheet.
    pub row_index: u32,
    pub sell_number: String,
    pub auction_house: String,
    pub car_number: String,
    pub vin: String,
    pub post_title: String,
    pub title: String,
    pub year: String,
    pub km: String,
    pub price: String,
    pub color: String,
    pub fuel: String,
    pub transmission: String,
    pub score: String,
    pub image_url: String,
}

impl AuctionRow {
    fn column_values(&self) -> [&str; 14] {
        [
            &self.sell_number,
            &self.auction_house,
            &self.car_number,
            &self.vin,
            &self.post_title,
            &self.title,
            &self.year,
            &self.km,
            &self.price,
            &self.color,
            &self.fuel,
            &self.transmission,
            &self.score,
            &self.image_url,
        ]
    }
}

/// Descriptive metadata of a stored batch, readable without touching the
/// row payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchMeta {
    pub date: SheetDate,
    pub source_filename: String,
    pub row_count: u32,
    pub fingerprint: String,
    pub updated_at: DateTime<Utc>,
}

/// Stored payload of a batch: filesystem storage keeps the raw sheet bytes,
/// row-oriented storage keeps the decomposed rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchPayload {
    RawCsv(Vec<u8>),
    Rows(Vec<AuctionRow>),
}

/// The current snapshot stored for a date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuctionBatch {
    pub meta: BatchMeta,
    pub payload: BatchPayload,
}

/// Write handoff from the ingestion pipeline into a storage backend. Carries
/// both the exact raw bytes and the parsed rows so each backend persists the
/// representation it owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchDraft {
    pub date: SheetDate,
    pub source_filename: String,
    pub fingerprint: String,
    pub raw_csv: Vec<u8>,
    pub rows: Vec<AuctionRow>,
}

/// Ephemeral fetched sheet, alive only for the duration of one ingestion.
#[derive(Debug, Clone)]
pub struct SourceDocument {
    pub claimed_date: SheetDate,
    pub filename: String,
    pub body: Vec<u8>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

#[derive(Debug, Error)]
pub enum SheetParseError {
    #[error("unreadable csv structure: {0}")]
    Malformed(#[from] csv::Error),
    #[error("no recognized sheet columns in header row")]
    UnrecognizedHeader,
}

/// Non-fatal defect in a single data row; the row is excluded from the batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseWarning {
    /// 1-based line number in the source sheet.
    pub line: u64,
    pub reason: String,
}

/// Result of parsing one sheet: the valid rows in source order plus a
/// warning per excluded row. Parsed once and reused by fingerprinting and
/// storage; never re-reads the source.
#[derive(Debug, Clone, Default)]
pub struct ParsedSheet {
    pub rows: Vec<AuctionRow>,
    pub warnings: Vec<ParseWarning>,
}

impl ParsedSheet {
    pub fn row_count(&self) -> u32 {
        self.rows.len() as u32
    }
}

/// Decode sheet bytes leniently: strip a UTF-8 BOM and replace invalid
/// sequences instead of failing on stray bytes (the feed is not always
/// clean UTF-8).
pub fn decode_sheet_bytes(raw: &[u8]) -> String {
    let raw = raw.strip_prefix(b"\xef\xbb\xbf").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

/// Parse raw sheet bytes into ordered rows plus warnings.
///
/// Columns are mapped by header name so the parse survives upstream column
/// reordering; a column missing from the header yields empty values. A data
/// row with a mismatched column count or without a car number is recorded
/// as a warning and excluded, never aborting the whole parse.
pub fn parse_sheet(raw: &[u8]) -> Result<ParsedSheet, SheetParseError> {
    let text = decode_sheet_bytes(raw);
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(text.as_bytes());

    let headers = reader.headers()?.clone();
    let positions: Vec<Option<usize>> = SHEET_COLUMNS
        .iter()
        .map(|name| headers.iter().position(|h| h.trim() == *name))
        .collect();
    if positions.iter().all(Option::is_none) {
        return Err(SheetParseError::UnrecognizedHeader);
    }

    let header_len = headers.len();
    let mut sheet = ParsedSheet::default();
    for (index, result) in reader.records().enumerate() {
        let line = (index + 2) as u64;
        let record = match result {
            Ok(record) => record,
            Err(err) => {
                sheet.warnings.push(ParseWarning {
                    line,
                    reason: format!("unreadable row: {err}"),
                });
                continue;
            }
        };

        if record.len() != header_len {
            sheet.warnings.push(ParseWarning {
                line,
                reason: format!("expected {header_len} columns, found {}", record.len()),
            });
            continue;
        }

        let field = |column: usize| -> String {
            positions[column]
                .and_then(|pos| record.get(pos))
                .unwrap_or_default()
                .to_string()
        };

        let row = AuctionRow {
            row_index: index as u32,
            sell_number: field(0),
            auction_house: field(1),
            car_number: field(2),
            vin: field(3),
            post_title: field(4),
            title: field(5),
            year: field(6),
            km: field(7),
            price: field(8),
            color: field(9),
            fuel: field(10),
            transmission: field(11),
            score: field(12),
            image_url: field(13),
        };

        if row.car_number.trim().is_empty() {
            sheet.warnings.push(ParseWarning {
                line,
                reason: "missing car number".to_string(),
            });
            continue;
        }

        sheet.rows.push(row);
    }

    Ok(sheet)
}

/// Serialize rows back to CSV text under the canonical header, preserving
/// row order and field values exactly as ingested.
pub fn rows_to_csv(rows: &[AuctionRow]) -> Result<String, csv::Error> {
    let mut buffer = Vec::new();
    {
        let mut writer = csv::Writer::from_writer(&mut buffer);
        writer.write_record(SHEET_COLUMNS)?;
        for row in rows {
            writer.write_record(row.column_values())?;
        }
        writer.flush()?;
    }
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}
