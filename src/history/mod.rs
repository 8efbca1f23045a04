//! # History Store
//!
//! Append-only JSON-lines log of send outcomes with a rolling retention window
//! (7 days by default).
//!
//! - Records older than the window are never returned, whether or not they have been
//!   physically purged yet. Expiry is lazy: `append` and `query` purge when the oldest
//!   record in the file has aged out.
//! - `query` returns records oldest first; `limit` keeps the most recent N.
//! - A sibling `<file>.lock` is locked shared by readers and exclusive by appenders and
//!   purges, so a reader never sees a half-rewritten file.
//! - Lines that fail to parse are skipped on read and left in place by purges.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, NaiveDateTime, Utc};
use fs2::FileExt;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::config::StorageConfig;

pub mod report;

pub use report::{export_csv, report_by_modem, ModemTally};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Sent,
    Failed,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Sent => f.write_str("SENT"),
            Status::Failed => f.write_str("FAILED"),
        }
    }
}

/// One send attempt. Field names on the wire are fixed: `timestamp`, `name`,
/// `phoneNumber`, `message`, `flash`, `status`, `modem`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub timestamp: DateTime<Utc>,
    pub name: String,
    pub phone_number: String,
    /// Rendered text handed to the device.
    pub message: String,
    pub flash: bool,
    pub status: Status,
    /// Device path of the modem that handled the send.
    pub modem: String,
}

#[derive(Debug, Clone)]
pub struct HistoryStore {
    path: PathBuf,
    lock_path: PathBuf,
    retention: ChronoDuration,
}

impl HistoryStore {
    pub fn new(path: impl Into<PathBuf>, retention_days: u32) -> Self {
        let path = path.into();
        let mut lock_name = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "history.jsonl".into());
        lock_name.push(".lock");
        let lock_path = path.with_file_name(lock_name);
        Self {
            path,
            lock_path,
            retention: ChronoDuration::days(i64::from(retention_days.max(1))),
        }
    }

    pub fn from_config(storage: &StorageConfig) -> Self {
        Self::new(storage.history_path(), storage.retention_days)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.retention
    }

    fn open_lock(&self) -> Result<File> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .map_err(|e| anyhow!("Failed to create history dir {}: {}", dir.display(), e))?;
        }
        OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&self.lock_path)
            .map_err(|e| anyhow!("Failed to open {}: {}", self.lock_path.display(), e))
    }

    /// Append one record. Existing lines are never rewritten here, apart from an
    /// expiry purge when the oldest record has aged out.
    pub async fn append(&self, record: &HistoryRecord) -> Result<()> {
        let store = self.clone();
        let line = serde_json::to_string(record)? + "\n";
        tokio::task::spawn_blocking(move || {
            store.purge_if_due(Utc::now())?;
            store.append_line(&line)
        })
        .await?
    }

    fn append_line(&self, line: &str) -> Result<()> {
        let lock = self.open_lock()?;
        lock.lock_exclusive()?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| anyhow!("Failed to open {}: {}", self.path.display(), e))?;
        file.write_all(line.as_bytes())?;
        file.flush()?;
        drop(lock);
        Ok(())
    }

    /// Records inside the retention window, filtered by `since`, oldest first, reduced
    /// to the most recent `limit`.
    pub async fn query(
        &self,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<HistoryRecord>> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || {
            let now = Utc::now();
            store.purge_if_due(now)?;
            store.query_at(now, since, limit)
        })
        .await?
    }

    /// [`HistoryStore::query`] against an explicit clock, without purging.
    pub fn query_at(
        &self,
        now: DateTime<Utc>,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<HistoryRecord>> {
        let cutoff = self.cutoff(now);
        let mut records: Vec<HistoryRecord> = self
            .read_records()?
            .into_iter()
            .filter(|r| r.timestamp >= cutoff)
            .filter(|r| since.map_or(true, |s| r.timestamp >= s))
            .collect();
        records.sort_by_key(|r| r.timestamp);
        if let Some(limit) = limit {
            if records.len() > limit {
                records.drain(..records.len() - limit);
            }
        }
        Ok(records)
    }

    fn read_records(&self) -> Result<Vec<HistoryRecord>> {
        let lock = self.open_lock()?;
        lock.lock_shared()?;
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(anyhow!("Failed to read {}: {}", self.path.display(), e)),
        };
        let mut records = Vec::new();
        for (n, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<HistoryRecord>(&line) {
                Ok(r) => records.push(r),
                Err(e) => debug!("Skipping malformed history line {}: {}", n + 1, e),
            }
        }
        drop(lock);
        Ok(records)
    }

    /// Purge only when the first parseable record is already expired. Records are
    /// appended in time order, so this is a cheap check.
    fn purge_if_due(&self, now: DateTime<Utc>) -> Result<()> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(_) => return Ok(()),
        };
        let oldest = BufReader::new(file)
            .lines()
            .map_while(|l| l.ok())
            .find_map(|l| serde_json::from_str::<HistoryRecord>(&l).ok());
        match oldest {
            Some(r) if r.timestamp < self.cutoff(now) => {
                self.purge_expired_at(now)?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Physically remove expired records. Returns how many were removed.
    pub async fn purge_expired(&self) -> Result<usize> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.purge_expired_at(Utc::now())).await?
    }

    pub fn purge_expired_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let lock = self.open_lock()?;
        lock.lock_exclusive()?;
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(anyhow!("Failed to read {}: {}", self.path.display(), e)),
        };

        let cutoff = self.cutoff(now);
        let mut kept = String::with_capacity(content.len());
        let mut removed = 0usize;
        for line in content.lines() {
            let expired = serde_json::from_str::<HistoryRecord>(line)
                .map(|r| r.timestamp < cutoff)
                .unwrap_or(false);
            if expired {
                removed += 1;
            } else if !line.trim().is_empty() {
                kept.push_str(line);
                kept.push('\n');
            }
        }
        if removed == 0 {
            return Ok(0);
        }

        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let base = self
            .path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("history.jsonl");
        let mut counter = 0u32;
        let tmp_path = loop {
            let candidate = dir.join(format!(".{}.tmp-{}-{}", base, std::process::id(), counter));
            match OpenOptions::new().write(true).create_new(true).open(&candidate) {
                Ok(mut tmp) => {
                    tmp.write_all(kept.as_bytes())?;
                    tmp.flush()?;
                    let _ = tmp.sync_all();
                    break candidate;
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    counter = counter.saturating_add(1);
                }
                Err(e) => return Err(anyhow!("Failed to create temp file for purge: {}", e)),
            }
        };
        if let Err(e) = fs::rename(&tmp_path, &self.path) {
            warn!("History purge rename failed: {}", e);
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }
        if let Ok(dir_file) = File::open(dir) {
            let _ = dir_file.sync_all();
        }
        drop(lock);
        info!("Purged {} expired history record(s)", removed);
        Ok(removed)
    }
}

/// Lenient timestamp parsing for `since` filters. Naive values are taken as UTC.
pub fn parse_since(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(ts: DateTime<Utc>, number: &str, status: Status) -> HistoryRecord {
        HistoryRecord {
            timestamp: ts,
            name: "Ana".into(),
            phone_number: number.into(),
            message: "Oi Ana".into(),
            flash: false,
            status,
            modem: "/dev/ttyUSB0".into(),
        }
    }

    #[test]
    fn wire_field_names() {
        let ts = DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let json = serde_json::to_value(record(ts, "5511999990000", Status::Sent)).unwrap();
        let mut keys: Vec<_> = json.as_object().unwrap().keys().cloned().collect();
        keys.sort();
        assert_eq!(
            keys,
            vec!["flash", "message", "modem", "name", "phoneNumber", "status", "timestamp"]
        );
        assert_eq!(json["status"], "SENT");
    }

    #[tokio::test]
    async fn query_orders_filters_and_limits() {
        let tmp = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(tmp.path().join("history.jsonl"), 7);
        let now = Utc::now();
        for i in (1..=5).rev() {
            store
                .append(&record(now - ChronoDuration::minutes(i), &format!("55119999900{i:02}"), Status::Sent))
                .await
                .unwrap();
        }
        let all = store.query(None, None).await.unwrap();
        assert_eq!(all.len(), 5);
        assert!(all.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

        let last_two = store.query(None, Some(2)).await.unwrap();
        assert_eq!(last_two, all[3..].to_vec());

        let since = store
            .query(Some(now - ChronoDuration::seconds(150)), None)
            .await
            .unwrap();
        assert_eq!(since.len(), 2);
    }

    #[tokio::test]
    async fn expired_records_are_invisible_and_purged() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("history.jsonl");
        let store = HistoryStore::new(&path, 7);
        let now = Utc::now();
        let old = record(now - ChronoDuration::days(8), "5511000000001", Status::Sent);
        let fresh = record(now - ChronoDuration::hours(1), "5511000000002", Status::Failed);
        let lines = format!(
            "{}\nnot json\n{}\n",
            serde_json::to_string(&old).unwrap(),
            serde_json::to_string(&fresh).unwrap()
        );
        std::fs::write(&path, lines).unwrap();

        let visible = store.query_at(now, None, None).unwrap();
        assert_eq!(visible, vec![fresh.clone()]);

        assert_eq!(store.purge_expired_at(now).unwrap(), 1);
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("not json"));
        assert!(!content.contains("5511000000001"));
        assert_eq!(store.purge_expired_at(now).unwrap(), 0);
    }

    #[test]
    fn since_formats() {
        let want = DateTime::parse_from_rfc3339("2024-05-01T10:30:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(parse_since("2024-05-01T10:30:00Z"), Some(want));
        assert_eq!(parse_since("2024-05-01T07:30:00-03:00"), Some(want));
        assert_eq!(parse_since("2024-05-01T10:30:00"), Some(want));
        assert_eq!(parse_since("2024-05-01 10:30:00"), Some(want));
        assert!(parse_since("2024-05-01").is_some());
        assert_eq!(parse_since("yesterday"), None);
        assert_eq!(parse_since(""), None);
    }
}
