//! # Dispatch Scheduler
//!
//! Plans round-robin send tasks over the selected modems and executes them one at a
//! time, recording every outcome in the history store.
//!
//! - Recipient `i` of a batch goes to modem `i % M`. Fairness is per batch only.
//! - `<NAME>` in the template is substituted at send time.
//! - A failed send is recorded and the run continues.
//! - The pause between sends (base delay plus jitter) is skipped after the last task.
//! - A modem can belong to one active run at a time.
//! - Cancellation is observed between tasks and while pausing; records already written
//!   stay written.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::config::Config;
use crate::errors::DispatchError;
use crate::history::{HistoryRecord, HistoryStore, Status};
use crate::import::{dial_number, Recipient};
use crate::logutil::{escape_log, mask_number, EVENTS_TARGET};
use crate::pool::{Health, ModemPool};

pub mod pacing;

pub use pacing::{CancelToken, Pacing};

/// One planned send. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendTask {
    pub recipient: Recipient,
    pub assigned_modem: String,
    /// Template, may still contain `<NAME>`.
    pub message: String,
    pub flash: bool,
}

/// Assign recipients to modems round-robin. Pure: same input, same plan.
pub fn plan(
    recipients: &[Recipient],
    modems: &[String],
    template: &str,
    flash: bool,
) -> Vec<SendTask> {
    assign(
        recipients
            .iter()
            .map(|r| (r.clone(), template.to_string(), flash)),
        modems,
    )
}

fn assign(
    items: impl IntoIterator<Item = (Recipient, String, bool)>,
    modems: &[String],
) -> Vec<SendTask> {
    if modems.is_empty() {
        return Vec::new();
    }
    items
        .into_iter()
        .enumerate()
        .map(|(i, (recipient, message, flash))| SendTask {
            recipient,
            assigned_modem: modems[i % modems.len()].clone(),
            message,
            flash,
        })
        .collect()
}

/// Replace every `<NAME>` (any letter case) with `name`.
pub fn render_message(template: &str, name: &str) -> String {
    const PLACEHOLDER: &str = "<name>";
    let mut out = String::with_capacity(template.len() + name.len());
    let mut rest = template;
    while let Some(pos) = find_ascii_ci(rest, PLACEHOLDER) {
        out.push_str(&rest[..pos]);
        out.push_str(name);
        rest = &rest[pos + PLACEHOLDER.len()..];
    }
    out.push_str(rest);
    out
}

fn find_ascii_ci(haystack: &str, needle: &str) -> Option<usize> {
    let h = haystack.as_bytes();
    let n = needle.as_bytes();
    if n.len() > h.len() {
        return None;
    }
    (0..=h.len() - n.len()).find(|&i| h[i..i + n.len()].eq_ignore_ascii_case(n))
}

/// Everything one run produced.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    /// One record per attempted task, in planned order.
    pub records: Vec<HistoryRecord>,
    /// Failure reason keyed by index into `records`.
    pub reasons: BTreeMap<usize, String>,
    pub cancelled: bool,
    pub sent: usize,
    pub failed: usize,
}

impl RunReport {
    fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            records: Vec::new(),
            reasons: BTreeMap::new(),
            cancelled: false,
            sent: 0,
            failed: 0,
        }
    }

    pub fn failed_records(&self) -> Vec<HistoryRecord> {
        self.records
            .iter()
            .filter(|r| r.status == Status::Failed)
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub pacing: Pacing,
    pub country_prefix: String,
}

impl DispatchSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            pacing: Pacing::from_config(&config.dispatch),
            country_prefix: config.sms.country_prefix.clone(),
        }
    }
}

/// Releases the modems of a run when dropped.
struct RunClaim {
    active: Arc<Mutex<HashSet<String>>>,
    modems: Vec<String>,
}

impl Drop for RunClaim {
    fn drop(&mut self) {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        for m in &self.modems {
            active.remove(m);
        }
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    pool: ModemPool,
    history: HistoryStore,
    settings: DispatchSettings,
    /// Numbers that reached SENT during this session.
    sent_numbers: Arc<Mutex<HashSet<String>>>,
    active_modems: Arc<Mutex<HashSet<String>>>,
}

impl Dispatcher {
    pub fn new(pool: ModemPool, history: HistoryStore, settings: DispatchSettings) -> Self {
        Self {
            pool,
            history,
            settings,
            sent_numbers: Arc::new(Mutex::new(HashSet::new())),
            active_modems: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    pub fn sent_numbers(&self) -> HashSet<String> {
        self.sent_numbers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Forget which numbers were sent (new session).
    pub fn reset_session(&self) {
        self.sent_numbers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    fn claim(&self, tasks: &[SendTask]) -> Result<RunClaim, DispatchError> {
        let modems: Vec<String> = tasks
            .iter()
            .map(|t| t.assigned_modem.clone())
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();
        let mut active = self.active_modems.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(busy) = modems.iter().find(|m| active.contains(*m)) {
            return Err(DispatchError::ModemBusy(busy.clone()));
        }
        active.extend(modems.iter().cloned());
        Ok(RunClaim {
            active: self.active_modems.clone(),
            modems,
        })
    }

    /// The selection narrowed to dispatchable modems; `NoModems` when nothing is left.
    pub fn usable_modems(&self, selected: &[String]) -> Result<Vec<String>, DispatchError> {
        let modems = self.pool.dispatchable(selected);
        if modems.is_empty() {
            Err(DispatchError::NoModems)
        } else {
            Ok(modems)
        }
    }

    /// Plan a fresh batch over the usable part of `selected` and run it.
    pub async fn send_batch(
        &self,
        recipients: &[Recipient],
        selected: &[String],
        template: &str,
        flash: bool,
        cancel: &CancelToken,
    ) -> Result<RunReport, DispatchError> {
        let modems = self.usable_modems(selected)?;
        let tasks = plan(recipients, &modems, template, flash);
        self.run(tasks, cancel).await
    }

    /// Execute tasks strictly in order.
    pub async fn run(
        &self,
        tasks: Vec<SendTask>,
        cancel: &CancelToken,
    ) -> Result<RunReport, DispatchError> {
        let _claim = self.claim(&tasks)?;
        let mut report = RunReport::new();
        let gateway = self.pool.gateway();
        let total = tasks.len();
        info!("Run {} started: {} message(s)", report.run_id, total);

        for (i, task) in tasks.iter().enumerate() {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let text = render_message(&task.message, &task.recipient.name);
            let modem = &task.assigned_modem;
            let outcome = if self.pool.health_of(modem) == Some(Health::Fail) {
                Err("modem marked FAIL".to_string())
            } else {
                let dial = dial_number(&task.recipient.phone_number, &self.settings.country_prefix);
                let _guard = self.pool.locks().acquire(modem).await;
                debug!(
                    "Sending to {} via {}: {}",
                    mask_number(&dial),
                    modem,
                    escape_log(&text)
                );
                gateway
                    .send_text(modem, &dial, &text, task.flash)
                    .await
                    .map_err(|e| e.to_string())
            };

            let status = match &outcome {
                Ok(()) => Status::Sent,
                Err(_) => Status::Failed,
            };
            let record = HistoryRecord {
                timestamp: Utc::now(),
                name: task.recipient.name.clone(),
                phone_number: task.recipient.phone_number.clone(),
                message: text,
                flash: task.flash,
                status,
                modem: modem.clone(),
            };
            if let Err(e) = self.history.append(&record).await {
                warn!("Failed to append history record: {}", e);
            }

            match outcome {
                Ok(()) => {
                    info!(target: EVENTS_TARGET, "OK {} via {}", record.phone_number, modem);
                    self.sent_numbers
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(record.phone_number.clone());
                    report.sent += 1;
                }
                Err(reason) => {
                    warn!(
                        target: EVENTS_TARGET,
                        "FAIL {} via {} | {}",
                        record.phone_number,
                        modem,
                        escape_log(&reason)
                    );
                    report.reasons.insert(report.records.len(), reason);
                    report.failed += 1;
                }
            }
            report.records.push(record);

            if i + 1 < total {
                let delay = self.settings.pacing.next_delay();
                if !delay.is_zero() {
                    debug!("Waiting {:.1}s before next send", delay.as_secs_f64());
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            report.cancelled = true;
                            break;
                        }
                    }
                }
            }
        }

        info!(
            "Run {} finished: {} sent, {} failed{}",
            report.run_id,
            report.sent,
            report.failed,
            if report.cancelled { " (cancelled)" } else { "" }
        );
        Ok(report)
    }

    /// Resend recipients whose latest record in `previous` is FAILED and who have not
    /// been SENT during this session. Each keeps its recorded message and flash flag.
    pub async fn resend_failed(
        &self,
        previous: &[HistoryRecord],
        selected: &[String],
        cancel: &CancelToken,
    ) -> Result<RunReport, DispatchError> {
        let items = failed_for_resend(previous, &self.sent_numbers());
        if items.is_empty() {
            return Ok(RunReport::new());
        }
        let modems = self.usable_modems(selected)?;
        info!("Resending {} failed message(s)", items.len());
        self.run(assign(items, &modems), cancel).await
    }

    /// Treat the records' recipients as a fresh batch (first-seen wins), each with its
    /// recorded message. The records themselves are not modified.
    pub async fn resend_from_history(
        &self,
        records: &[HistoryRecord],
        selected: &[String],
        cancel: &CancelToken,
    ) -> Result<RunReport, DispatchError> {
        let mut seen = HashSet::new();
        let items: Vec<_> = records
            .iter()
            .filter(|r| seen.insert(r.phone_number.clone()))
            .map(record_item)
            .collect();
        if items.is_empty() {
            return Ok(RunReport::new());
        }
        let modems = self.usable_modems(selected)?;
        self.run(assign(items, &modems), cancel).await
    }
}

fn record_item(r: &HistoryRecord) -> (Recipient, String, bool) {
    (
        Recipient {
            name: r.name.clone(),
            phone_number: r.phone_number.clone(),
            source_row: 0,
        },
        r.message.clone(),
        r.flash,
    )
}

/// Latest record per number decides; numbers already sent this session are skipped.
fn failed_for_resend(
    previous: &[HistoryRecord],
    sent_this_session: &HashSet<String>,
) -> Vec<(Recipient, String, bool)> {
    let mut order: Vec<&str> = Vec::new();
    let mut latest: HashMap<&str, &HistoryRecord> = HashMap::new();
    for r in previous {
        if latest.insert(r.phone_number.as_str(), r).is_none() {
            order.push(r.phone_number.as_str());
        }
    }
    order
        .into_iter()
        .filter_map(|number| latest.get(number).copied())
        .filter(|r| r.status == Status::Failed && !sent_this_session.contains(&r.phone_number))
        .map(record_item)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recipient(name: &str, number: &str) -> Recipient {
        Recipient {
            name: name.into(),
            phone_number: number.into(),
            source_row: 0,
        }
    }

    #[test]
    fn placeholder_is_case_insensitive() {
        assert_eq!(render_message("Oi <NAME>, tchau <name>!", "Ana"), "Oi Ana, tchau Ana!");
        assert_eq!(render_message("<Name><NAME>", "B"), "BB");
        assert_eq!(render_message("sem nome", "Ana"), "sem nome");
        assert_eq!(render_message("Olá <NAME> é", ""), "Olá  é");
    }

    #[test]
    fn plan_cycles_modems_in_order() {
        let recipients: Vec<_> = (0..5)
            .map(|i| recipient("x", &format!("551199999000{i}")))
            .collect();
        let modems = vec!["/dev/a".to_string(), "/dev/b".to_string()];
        let tasks = plan(&recipients, &modems, "hi <NAME>", true);
        let assigned: Vec<_> = tasks.iter().map(|t| t.assigned_modem.as_str()).collect();
        assert_eq!(assigned, vec!["/dev/a", "/dev/b", "/dev/a", "/dev/b", "/dev/a"]);
        assert!(tasks.iter().all(|t| t.message == "hi <NAME>" && t.flash));
        assert!(plan(&recipients, &[], "hi", false).is_empty());
    }

    #[test]
    fn resend_picks_latest_failures_only() {
        let ts = Utc::now();
        let rec = |n: &str, status| HistoryRecord {
            timestamp: ts,
            name: "n".into(),
            phone_number: n.into(),
            message: format!("msg {n}"),
            flash: false,
            status,
            modem: "/dev/a".into(),
        };
        let previous = vec![
            rec("1", Status::Failed),
            rec("2", Status::Failed),
            rec("2", Status::Sent),
            rec("3", Status::Failed),
            rec("4", Status::Failed),
        ];
        let sent: HashSet<String> = ["4".to_string()].into_iter().collect();
        let items = failed_for_resend(&previous, &sent);
        let numbers: Vec<_> = items.iter().map(|(r, _, _)| r.phone_number.as_str()).collect();
        assert_eq!(numbers, vec!["1", "3"]);
        assert_eq!(items[1].1, "msg 3");
    }
}
