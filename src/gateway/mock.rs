//! Scripted in-memory gateway for tests and `--dry-run` style usage.
//!
//! Every modem registered with [`MockGateway::with_modem`] answers identity checks; numbers
//! or devices can be told to fail, ports can be marked busy until released, and every call
//! is recorded in order.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use super::{DeviceGateway, Identity};
use crate::errors::GatewayError;

/// One recorded gateway call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    Identify(String),
    Activate {
        device: String,
        commands: Vec<String>,
    },
    Send {
        device: String,
        number: String,
        message: String,
        flash: bool,
    },
    Release(Vec<String>),
}

#[derive(Default)]
struct MockState {
    identities: HashMap<String, Identity>,
    busy: HashSet<String>,
    failing_numbers: HashSet<String>,
    failing_devices: HashSet<String>,
    activation_failures: HashSet<String>,
    send_latency: Duration,
    calls: Vec<GatewayCall>,
}

#[derive(Default)]
pub struct MockGateway {
    state: Mutex<MockState>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a reachable modem, optionally with a known SIM number.
    pub fn with_modem(self, device_path: &str, chip_number: Option<&str>) -> Self {
        self.add_modem(device_path, chip_number);
        self
    }

    pub fn add_modem(&self, device_path: &str, chip_number: Option<&str>) {
        self.state().identities.insert(
            device_path.to_string(),
            Identity {
                chip_number: chip_number.map(str::to_string),
                manufacturer: Some("MockModem".to_string()),
                model: Some("M1".to_string()),
                imei: None,
            },
        );
    }

    /// Make the device stop answering identity checks and commands.
    pub fn unplug(&self, device_path: &str) {
        self.state().identities.remove(device_path);
    }

    pub fn set_busy(&self, device_path: &str) {
        self.state().busy.insert(device_path.to_string());
    }

    pub fn fail_number(&self, number: &str) {
        self.state().failing_numbers.insert(number.to_string());
    }

    pub fn heal_number(&self, number: &str) {
        self.state().failing_numbers.remove(number);
    }

    pub fn fail_device(&self, device_path: &str) {
        self.state().failing_devices.insert(device_path.to_string());
    }

    pub fn heal_device(&self, device_path: &str) {
        self.state().failing_devices.remove(device_path);
    }

    pub fn fail_activation(&self, device_path: &str) {
        self.state()
            .activation_failures
            .insert(device_path.to_string());
    }

    /// Simulated time each send holds the device.
    pub fn set_send_latency(&self, latency: Duration) {
        self.state().send_latency = latency;
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.state().calls.clone()
    }

    /// `(device, number, message)` of every send attempt, in order.
    pub fn sends(&self) -> Vec<(String, String, String)> {
        self.state()
            .calls
            .iter()
            .filter_map(|c| match c {
                GatewayCall::Send {
                    device,
                    number,
                    message,
                    ..
                } => Some((device.clone(), number.clone(), message.clone())),
                _ => None,
            })
            .collect()
    }

    fn check_reachable(state: &MockState, device_path: &str) -> Result<(), GatewayError> {
        if state.busy.contains(device_path) {
            return Err(GatewayError::PortBusy(device_path.to_string()));
        }
        if !state.identities.contains_key(device_path) {
            return Err(GatewayError::Unreachable {
                path: device_path.to_string(),
                reason: "no answer".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceGateway for MockGateway {
    async fn identify(&self, device_path: &str) -> Result<Identity, GatewayError> {
        let mut state = self.state();
        state.calls.push(GatewayCall::Identify(device_path.to_string()));
        Self::check_reachable(&state, device_path)?;
        Ok(state.identities[device_path].clone())
    }

    async fn activate(
        &self,
        device_path: &str,
        commands: &[String],
        _baud_rate: u32,
    ) -> Result<(), GatewayError> {
        let mut state = self.state();
        state.calls.push(GatewayCall::Activate {
            device: device_path.to_string(),
            commands: commands.to_vec(),
        });
        Self::check_reachable(&state, device_path)?;
        if state.activation_failures.contains(device_path) {
            return Err(GatewayError::ActivationFailed {
                path: device_path.to_string(),
                reason: "ERROR".to_string(),
            });
        }
        Ok(())
    }

    async fn send_text(
        &self,
        device_path: &str,
        phone_number: &str,
        message: &str,
        flash: bool,
    ) -> Result<(), GatewayError> {
        let latency = {
            let mut state = self.state();
            state.calls.push(GatewayCall::Send {
                device: device_path.to_string(),
                number: phone_number.to_string(),
                message: message.to_string(),
                flash,
            });
            state.send_latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let state = self.state();
        if let Err(e) = Self::check_reachable(&state, device_path) {
            return Err(GatewayError::SendFailed(e.to_string()));
        }
        if state.failing_devices.contains(device_path) {
            return Err(GatewayError::SendFailed("modem rejected message".to_string()));
        }
        let digits: String = phone_number.chars().filter(|c| c.is_ascii_digit()).collect();
        if state.failing_numbers.contains(phone_number) || state.failing_numbers.contains(&digits)
        {
            return Err(GatewayError::SendFailed("network rejected number".to_string()));
        }
        Ok(())
    }

    async fn release_port(&self, device_paths: &[String]) -> Result<usize, GatewayError> {
        let mut state = self.state();
        state.calls.push(GatewayCall::Release(device_paths.to_vec()));
        let mut released = 0;
        for path in device_paths {
            if state.busy.remove(path) {
                released += 1;
            }
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_behaviour() {
        let gw = MockGateway::new().with_modem("/dev/ttyUSB0", Some("+5511900000000"));
        let id = gw.identify("/dev/ttyUSB0").await.unwrap();
        assert_eq!(id.chip_number.as_deref(), Some("+5511900000000"));
        assert!(gw.identify("/dev/ttyUSB1").await.is_err());

        gw.set_busy("/dev/ttyUSB0");
        assert!(gw.identify("/dev/ttyUSB0").await.unwrap_err().is_port_busy());
        assert_eq!(gw.release_port(&["/dev/ttyUSB0".into()]).await.unwrap(), 1);
        assert!(gw.identify("/dev/ttyUSB0").await.is_ok());

        gw.fail_number("5511999990000");
        let err = gw
            .send_text("/dev/ttyUSB0", "+5511999990000", "hi", false)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::SendFailed(_)));
        assert_eq!(gw.sends().len(), 1);
    }
}
