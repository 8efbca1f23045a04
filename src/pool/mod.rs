//! # Modem Pool Manager
//!
//! Keeps the authoritative view of which modems exist and which of them are usable.
//!
//! Per-modem state machine:
//!
//! ```text
//! Unknown --identify ok--> OK --identify/keepalive fails--> FAIL --identify ok--> OK
//! ```
//!
//! Health is re-evaluated on every scan or keepalive tick, never derived from cached
//! results. Devices that vanish from the scan are dropped from the pool.
//!
//! [`ModemPool`] is a cheap clonable handle; the dispatch loop, the rescan ticker and the
//! keepalive ticker all share the same state and the same per-device locks.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, RwLock};

use crate::config::Config;
use crate::errors::GatewayError;
use crate::gateway::{DeviceGateway, DeviceLocks, Identity};

pub mod monitor;

pub use monitor::{spawn_monitors, MonitorHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Health {
    /// Not checked (validation disabled).
    Unknown,
    Ok,
    Fail,
}

impl std::fmt::Display for Health {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Health::Unknown => "?",
            Health::Ok => "OK",
            Health::Fail => "FAIL",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Modem {
    pub device_path: String,
    pub chip_number: Option<String>,
    pub health: Health,
    pub last_checked: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<Identity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Modem {
    fn unchecked(device_path: &str) -> Self {
        Self {
            device_path: device_path.to_string(),
            chip_number: None,
            health: Health::Unknown,
            last_checked: Utc::now(),
            identity: None,
            last_error: None,
        }
    }

    fn failed(device_path: &str, error: &GatewayError) -> Self {
        Self {
            health: Health::Fail,
            last_error: Some(error.to_string()),
            ..Self::unchecked(device_path)
        }
    }

    pub fn is_ok(&self) -> bool {
        self.health == Health::Ok
    }
}

/// The slice of [`Config`] the pool needs.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub device_globs: Vec<String>,
    pub validate: bool,
    pub release_busy_ports: bool,
    pub at_commands: Vec<String>,
    pub at_baud_rate: u32,
    pub keepalive_command: String,
}

impl PoolSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            device_globs: config.modems.device_globs.clone(),
            validate: config.modems.validate,
            release_busy_ports: config.modems.release_busy_ports,
            at_commands: config.activation.at_commands.clone(),
            at_baud_rate: config.activation.at_baud_rate,
            keepalive_command: config.keepalive.command.clone(),
        }
    }
}

/// Outcome of one keepalive pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct KeepaliveSummary {
    pub answered: Vec<String>,
    pub demoted: Vec<String>,
    /// Skipped because a send or activation held the device.
    pub skipped_busy: Vec<String>,
}

#[derive(Clone)]
pub struct ModemPool {
    gateway: Arc<dyn DeviceGateway>,
    locks: DeviceLocks,
    settings: PoolSettings,
    modems: Arc<RwLock<BTreeMap<String, Modem>>>,
}

impl ModemPool {
    pub fn new(gateway: Arc<dyn DeviceGateway>, settings: PoolSettings) -> Self {
        Self {
            gateway,
            locks: DeviceLocks::new(),
            settings,
            modems: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    pub fn gateway(&self) -> Arc<dyn DeviceGateway> {
        self.gateway.clone()
    }

    pub fn locks(&self) -> &DeviceLocks {
        &self.locks
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Candidate device paths, sorted and unique.
    pub fn scan(&self) -> Vec<String> {
        scan_globs(&self.settings.device_globs)
    }

    /// Identity check for one device. Never fails: problems end up in `health`.
    pub async fn validate(&self, device_path: &str) -> Modem {
        let _guard = self.locks.acquire(device_path).await;
        let mut result = self.gateway.identify(device_path).await;

        let busy = matches!(result, Err(GatewayError::PortBusy(_)));
        if busy && self.settings.release_busy_ports {
            match self
                .gateway
                .release_port(&[device_path.to_string()])
                .await
            {
                Ok(n) => {
                    info!("Released {} ({} process(es)), retrying identify", device_path, n);
                    result = self.gateway.identify(device_path).await;
                }
                Err(e) => {
                    warn!("Could not free busy port {}: {}", device_path, e);
                    result = Err(e);
                }
            }
        }

        match result {
            Ok(identity) => Modem {
                device_path: device_path.to_string(),
                chip_number: identity.chip_number.clone(),
                health: Health::Ok,
                last_checked: Utc::now(),
                identity: Some(identity),
                last_error: None,
            },
            Err(e) => {
                debug!("Identify {} failed: {}", device_path, e);
                Modem::failed(device_path, &e)
            }
        }
    }

    /// Re-run scan + validate for every candidate and replace the pool state.
    pub async fn rescan(&self) -> Vec<Modem> {
        let candidates = self.scan();
        let mut fresh = BTreeMap::new();
        for path in &candidates {
            let modem = if self.settings.validate {
                self.validate(path).await
            } else {
                Modem::unchecked(path)
            };
            fresh.insert(path.clone(), modem);
        }

        let mut modems = self.modems.write().unwrap_or_else(|e| e.into_inner());
        for (path, modem) in &fresh {
            match modems.get(path) {
                Some(prev) if prev.health != modem.health => {
                    info!("Modem {} {} -> {}", path, prev.health, modem.health)
                }
                None => info!("Modem {} detected ({})", path, modem.health),
                _ => {}
            }
        }
        for path in modems.keys().filter(|p| !fresh.contains_key(*p)) {
            info!("Modem {} no longer detected", path);
        }
        *modems = fresh;
        modems.values().cloned().collect()
    }

    /// Send the activation command sequence to each device. One failure never blocks the
    /// remaining devices.
    pub async fn activate_selected(
        &self,
        device_paths: &[String],
    ) -> Vec<(String, Result<(), GatewayError>)> {
        let mut results = Vec::with_capacity(device_paths.len());
        for path in device_paths {
            let result = {
                let _guard = self.locks.acquire(path).await;
                self.gateway
                    .activate(path, &self.settings.at_commands, self.settings.at_baud_rate)
                    .await
            };
            match &result {
                Ok(()) => info!("Activated {}", path),
                Err(e) => warn!("Activation of {} failed: {}", path, e),
            }
            results.push((path.clone(), result));
        }
        results
    }

    /// One keepalive pass over every OK modem. Non-answering modems are demoted to FAIL.
    pub async fn keepalive_tick(&self) -> KeepaliveSummary {
        let mut summary = KeepaliveSummary::default();
        let command = vec![self.settings.keepalive_command.clone()];
        for path in self.healthy() {
            let Some(_guard) = self.locks.try_acquire(&path) else {
                debug!("Keepalive skipped for busy {}", path);
                summary.skipped_busy.push(path);
                continue;
            };
            match self
                .gateway
                .activate(&path, &command, self.settings.at_baud_rate)
                .await
            {
                Ok(()) => summary.answered.push(path),
                Err(e) => {
                    warn!("Keepalive failed on {}: {}", path, e);
                    self.mark_failed(&path, &e.to_string());
                    summary.demoted.push(path);
                }
            }
        }
        summary
    }

    /// Terminate processes holding the given ports.
    pub async fn release_conflicts(&self, device_paths: &[String]) -> Result<usize, GatewayError> {
        let n = self.gateway.release_port(device_paths).await?;
        info!("Released {} process(es) holding {:?}", n, device_paths);
        Ok(n)
    }

    pub fn mark_failed(&self, device_path: &str, reason: &str) {
        let mut modems = self.modems.write().unwrap_or_else(|e| e.into_inner());
        if let Some(modem) = modems.get_mut(device_path) {
            if modem.health != Health::Fail {
                info!("Modem {} {} -> FAIL", device_path, modem.health);
            }
            modem.health = Health::Fail;
            modem.last_error = Some(reason.to_string());
            modem.last_checked = Utc::now();
        }
    }

    pub fn snapshot(&self) -> Vec<Modem> {
        let modems = self.modems.read().unwrap_or_else(|e| e.into_inner());
        modems.values().cloned().collect()
    }

    pub fn health_of(&self, device_path: &str) -> Option<Health> {
        let modems = self.modems.read().unwrap_or_else(|e| e.into_inner());
        modems.get(device_path).map(|m| m.health)
    }

    /// Paths of OK modems in scan order.
    pub fn healthy(&self) -> Vec<String> {
        let modems = self.modems.read().unwrap_or_else(|e| e.into_inner());
        modems
            .values()
            .filter(|m| m.is_ok())
            .map(|m| m.device_path.clone())
            .collect()
    }

    /// The user's selection narrowed to OK modems, keeping the selection order.
    /// With validation disabled, `Unknown` modems also qualify.
    pub fn dispatchable(&self, selected: &[String]) -> Vec<String> {
        let modems = self.modems.read().unwrap_or_else(|e| e.into_inner());
        let mut seen = BTreeSet::new();
        selected
            .iter()
            .filter(|path| seen.insert(path.as_str()))
            .filter(|path| match modems.get(path.as_str()).map(|m| m.health) {
                Some(Health::Ok) => true,
                Some(Health::Unknown) => !self.settings.validate,
                _ => false,
            })
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.modems
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

/// Expand globs of the form `/dir/prefix*` (or plain paths) into existing paths.
pub fn scan_globs(globs: &[String]) -> Vec<String> {
    let mut found = BTreeSet::new();
    for glob in globs {
        let Some(prefix_path) = glob.strip_suffix('*') else {
            if Path::new(glob).exists() {
                found.insert(glob.clone());
            }
            continue;
        };
        let (dir, name_prefix) = match prefix_path.rfind('/') {
            Some(idx) => (&prefix_path[..=idx], &prefix_path[idx + 1..]),
            None => ("./", prefix_path),
        };
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("Cannot list {}: {}", dir, e);
                continue;
            }
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with(name_prefix) {
                found.insert(format!("{dir}{name}"));
            }
        }
    }
    found.into_iter().collect()
}
