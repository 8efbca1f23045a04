//! Test utilities & fixtures.
//! A "fleet" is a temp dir holding fake `ttyUSB*` device nodes, a mock gateway that
//! answers for every one of them, and a config pointing at both.

use std::sync::Arc;

use smsfleet::config::Config;
use smsfleet::gateway::MockGateway;
use smsfleet::history::{HistoryRecord, Status};
use smsfleet::session::Session;

pub struct Fleet {
    pub tmp: tempfile::TempDir,
    pub gateway: Arc<MockGateway>,
    pub config: Config,
    pub devices: Vec<String>,
}

impl Fleet {
    /// Session over the mock gateway with the fleet config.
    pub fn session(&self) -> Session {
        Session::new(Arc::new(self.config.clone()), self.gateway.clone())
    }
}

/// `n` reachable modems, no pacing, country prefix `55`.
pub fn fleet(n: usize) -> Fleet {
    let tmp = tempfile::tempdir().expect("tempdir");
    let dev_dir = tmp.path().join("dev");
    std::fs::create_dir_all(&dev_dir).unwrap();

    let gateway = MockGateway::new();
    let mut devices = Vec::new();
    for i in 0..n {
        let path = dev_dir.join(format!("ttyUSB{i}"));
        std::fs::write(&path, "").unwrap();
        let path = path.display().to_string();
        gateway.add_modem(&path, Some(&format!("+55119000000{i:02}")));
        devices.push(path);
    }

    let mut config = Config::default();
    config.modems.device_globs = vec![format!("{}/ttyUSB*", dev_dir.display())];
    config.modems.rescan_before_dispatch = false;
    config.storage.data_dir = tmp.path().join("data").display().to_string();
    config.dispatch.send_delay_seconds = 0.0;
    config.dispatch.jitter.enabled = false;
    config.sms.country_prefix = "55".into();
    config.logging.file = None;
    config.logging.events_file = None;

    Fleet {
        tmp,
        gateway: Arc::new(gateway),
        config,
        devices,
    }
}

#[allow(dead_code)]
pub fn record(number: &str, status: Status, modem: &str) -> HistoryRecord {
    HistoryRecord {
        timestamp: chrono::Utc::now(),
        name: format!("n{number}"),
        phone_number: number.to_string(),
        message: format!("hello {number}"),
        flash: false,
        status,
        modem: modem.to_string(),
    }
}
