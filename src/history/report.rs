//! CSV export and per-modem aggregation over history records.

use anyhow::Result;
use serde::Serialize;
use std::collections::BTreeMap;

use super::{HistoryRecord, Status};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ModemTally {
    pub sent: usize,
    pub failed: usize,
}

impl ModemTally {
    pub fn total(&self) -> usize {
        self.sent + self.failed
    }
}

/// `;`-separated UTF-8 CSV with a header row.
pub fn export_csv(records: &[HistoryRecord]) -> Result<String> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b';')
        .from_writer(Vec::new());
    if records.is_empty() {
        writer.write_record([
            "timestamp",
            "name",
            "phoneNumber",
            "message",
            "flash",
            "status",
            "modem",
        ])?;
    }
    for record in records {
        writer.serialize(record)?;
    }
    let bytes = writer.into_inner().map_err(|e| e.into_error())?;
    Ok(String::from_utf8(bytes)?)
}

pub fn report_by_modem(records: &[HistoryRecord]) -> BTreeMap<String, ModemTally> {
    let mut tallies: BTreeMap<String, ModemTally> = BTreeMap::new();
    for record in records {
        let tally = tallies.entry(record.modem.clone()).or_default();
        match record.status {
            Status::Sent => tally.sent += 1,
            Status::Failed => tally.failed += 1,
        }
    }
    tallies
}
