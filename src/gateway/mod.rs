//! # Device Gateway
//!
//! The only place that talks to hardware. Everything above this module sees four
//! fallible, time-bounded operations:
//!
//! - [`DeviceGateway::identify`] - identity check, also reads the SIM's own number
//! - [`DeviceGateway::activate`] - raw control commands (AT activation / keepalive)
//! - [`DeviceGateway::send_text`] - submit one SMS
//! - [`DeviceGateway::release_port`] - terminate processes holding serial ports
//!
//! [`GammuGateway`] drives the external `gammu` and `fuser` tools and writes AT commands
//! straight to the serial line. [`MockGateway`] scripts the same contract for tests and
//! dry runs.
//!
//! A timeout always surfaces as [`GatewayError::Timeout`]; callers never hang on a
//! wedged modem.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;

use crate::errors::GatewayError;

pub mod at;
pub mod gammu;
pub mod mock;

pub use gammu::GammuGateway;
pub use mock::{GatewayCall, MockGateway};

/// What an identity check learned about a device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// The SIM's own number, when the phonebook exposes it.
    pub chip_number: Option<String>,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub imei: Option<String>,
}

#[async_trait]
pub trait DeviceGateway: Send + Sync {
    async fn identify(&self, device_path: &str) -> Result<Identity, GatewayError>;

    async fn activate(
        &self,
        device_path: &str,
        commands: &[String],
        baud_rate: u32,
    ) -> Result<(), GatewayError>;

    async fn send_text(
        &self,
        device_path: &str,
        phone_number: &str,
        message: &str,
        flash: bool,
    ) -> Result<(), GatewayError>;

    /// Returns the number of processes terminated.
    async fn release_port(&self, device_paths: &[String]) -> Result<usize, GatewayError>;
}

/// Per-device-path mutual exclusion.
///
/// Sends, activations, identity checks and keepalives on the same path are serialized;
/// different paths proceed independently.
#[derive(Clone, Default)]
pub struct DeviceLocks {
    inner: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl DeviceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, device_path: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(device_path.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Wait until the device is free and hold it until the guard drops.
    pub async fn acquire(&self, device_path: &str) -> OwnedMutexGuard<()> {
        self.slot(device_path).lock_owned().await
    }

    /// Take the device only if nobody else holds it.
    pub fn try_acquire(&self, device_path: &str) -> Option<OwnedMutexGuard<()>> {
        self.slot(device_path).try_lock_owned().ok()
    }
}

/// Gammu rc section/file name for a device path: basename with every run of characters
/// outside `[A-Za-z0-9_]` collapsed to `_`.
pub fn section_name_for_device(device_path: &str) -> String {
    let base = std::path::Path::new(device_path)
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("");
    let mut name = String::with_capacity(base.len());
    let mut in_run = false;
    for c in base.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            name.push(c);
            in_run = false;
        } else if !in_run {
            name.push('_');
            in_run = true;
        }
    }
    if name.is_empty() {
        "device".to_string()
    } else {
        name
    }
}
