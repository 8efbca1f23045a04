//! # Recipient Import
//!
//! Turns a CSV file (or pasted free text) into a deduplicated list of canonical
//! recipients.
//!
//! The delimiter is sniffed from the first non-empty line (`;` when it has more
//! semicolons than commas). The first record is treated as a header only when its first
//! column contains no digit at all. A header locates the phone column (`numero`,
//! `número`, `telefone`, `phone`, `number`) and the name column (`nome`, `name`) by name,
//! in any order. Without a header, or when no phone column is named, column 1 is the
//! phone number and column 2 the optional name.

use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::errors::ImportError;

/// Fewer digits than this and the number is rejected.
pub const MIN_DIGITS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub name: String,
    /// Canonical digits-only number, country prefix included.
    pub phone_number: String,
    /// 1-based record number in the source, 0 when not from a file.
    pub source_row: usize,
}

/// A row that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowError {
    pub row: usize,
    pub reason: String,
}

#[derive(Debug, Default, Clone)]
pub struct ImportReport {
    pub recipients: Vec<Recipient>,
    pub invalid_rows: usize,
    pub duplicates: usize,
    pub errors: Vec<RowError>,
    pub header_skipped: bool,
}

/// Canonical form of a raw number: digits only, with `country_prefix` prepended unless
/// the number already carries it.
pub fn canonicalize(raw: &str, country_prefix: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < MIN_DIGITS {
        return None;
    }
    if country_prefix.is_empty()
        || (digits.starts_with(country_prefix) && digits.len() >= country_prefix.len() + MIN_DIGITS)
    {
        Some(digits)
    } else {
        Some(format!("{country_prefix}{digits}"))
    }
}

/// Number as handed to the device layer.
pub fn dial_number(canonical: &str, country_prefix: &str) -> String {
    if country_prefix.is_empty() {
        canonical.to_string()
    } else {
        format!("+{canonical}")
    }
}

/// First-seen wins. Returns the survivors and how many were dropped.
pub fn dedup(recipients: Vec<Recipient>) -> (Vec<Recipient>, usize) {
    let mut seen = HashSet::new();
    let before = recipients.len();
    let kept: Vec<Recipient> = recipients
        .into_iter()
        .filter(|r| seen.insert(r.phone_number.clone()))
        .collect();
    let dropped = before - kept.len();
    (kept, dropped)
}

fn sniff_delimiter(data: &[u8]) -> u8 {
    let first = data
        .split(|b| *b == b'\n')
        .find(|line| line.iter().any(|b| !b.is_ascii_whitespace()))
        .unwrap_or(&[]);
    let semis = first.iter().filter(|b| **b == b';').count();
    let commas = first.iter().filter(|b| **b == b',').count();
    if semis > commas {
        b';'
    } else {
        b','
    }
}

fn looks_like_header(first_column: &str) -> bool {
    !first_column.chars().any(|c| c.is_ascii_digit())
}

const PHONE_HEADERS: &[&str] = &["numero", "número", "telefone", "phone", "number"];
const NAME_HEADERS: &[&str] = &["nome", "name"];

/// Field positions of the phone number and the name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Columns {
    phone: usize,
    name: Option<usize>,
}

impl Default for Columns {
    fn default() -> Self {
        Self {
            phone: 0,
            name: Some(1),
        }
    }
}

impl Columns {
    fn from_header(header: &csv::StringRecord) -> Self {
        let find = |names: &[&str]| {
            header
                .iter()
                .position(|h| names.contains(&h.to_lowercase().as_str()))
        };
        match find(PHONE_HEADERS) {
            Some(phone) => Self {
                phone,
                name: find(NAME_HEADERS),
            },
            None => Self::default(),
        }
    }
}

/// Parse CSV content already in memory.
pub fn parse_csv_bytes(data: &[u8], country_prefix: &str) -> ImportReport {
    let data = data.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(data);
    let delimiter = sniff_delimiter(data);

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(data);

    let mut report = ImportReport::default();
    let mut candidates = Vec::new();
    let mut columns = Columns::default();
    let mut first = true;

    for (idx, result) in reader.byte_records().enumerate() {
        let row = idx + 1;
        let record = match result {
            Ok(r) => r,
            Err(e) => {
                report.errors.push(RowError {
                    row,
                    reason: e.to_string(),
                });
                first = false;
                continue;
            }
        };
        let record = match csv::StringRecord::from_byte_record(record) {
            Ok(r) => r,
            Err(e) => {
                report.errors.push(RowError {
                    row,
                    reason: format!("not valid UTF-8: {e}"),
                });
                first = false;
                continue;
            }
        };
        if record.iter().all(|f| f.is_empty()) {
            continue;
        }

        if first {
            first = false;
            if looks_like_header(record.get(0).unwrap_or("")) {
                columns = Columns::from_header(&record);
                debug!("Skipping CSV header row, columns {:?}", columns);
                report.header_skipped = true;
                continue;
            }
        }

        let phone = record.get(columns.phone).unwrap_or("");
        match canonicalize(phone, country_prefix) {
            Some(phone_number) => candidates.push(Recipient {
                name: columns
                    .name
                    .and_then(|i| record.get(i))
                    .unwrap_or("")
                    .to_string(),
                phone_number,
                source_row: row,
            }),
            None => report.invalid_rows += 1,
        }
    }

    let (recipients, duplicates) = dedup(candidates);
    report.recipients = recipients;
    report.duplicates = duplicates;
    report
}

/// Read and parse a recipient CSV file.
pub fn parse_csv(path: &Path, country_prefix: &str) -> Result<ImportReport, ImportError> {
    let data = std::fs::read(path).map_err(|e| ImportError::Malformed {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let report = parse_csv_bytes(&data, country_prefix);
    info!(
        "Imported {} recipient(s) from {} ({} invalid, {} duplicate, {} undecodable)",
        report.recipients.len(),
        path.display(),
        report.invalid_rows,
        report.duplicates,
        report.errors.len()
    );
    Ok(report)
}

/// Numbers typed or pasted as free text. Any run of non-digits separates numbers;
/// names are left empty.
pub fn parse_pasted(text: &str, country_prefix: &str) -> Vec<Recipient> {
    let candidates = text
        .split(|c: char| !c.is_ascii_digit())
        .filter(|token| token.len() >= MIN_DIGITS)
        .filter_map(|token| canonicalize(token, country_prefix))
        .map(|phone_number| Recipient {
            name: String::new(),
            phone_number,
            source_row: 0,
        })
        .collect();
    dedup(candidates).0
}
