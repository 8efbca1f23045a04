//! Session lifecycle: one explicit object owns the configuration, the gateway, the modem
//! pool, the history store, the dispatcher and the background tickers.
//!
//! `start` → (dispatch, resend, query ...) → `reset` or `shutdown`.

use log::info;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::dispatch::{DispatchSettings, Dispatcher};
use crate::gateway::{DeviceGateway, GammuGateway};
use crate::history::HistoryStore;
use crate::pool::{spawn_monitors, Modem, ModemPool, MonitorHandle, PoolSettings};

pub struct Session {
    config: Arc<Config>,
    pool: ModemPool,
    history: HistoryStore,
    dispatcher: Dispatcher,
    monitors: Option<MonitorHandle>,
}

impl Session {
    pub fn new(config: Arc<Config>, gateway: Arc<dyn DeviceGateway>) -> Self {
        let pool = ModemPool::new(gateway, PoolSettings::from_config(&config));
        let history = HistoryStore::from_config(&config.storage);
        let dispatcher = Dispatcher::new(
            pool.clone(),
            history.clone(),
            DispatchSettings::from_config(&config),
        );
        Self {
            config,
            pool,
            history,
            dispatcher,
            monitors: None,
        }
    }

    /// Session backed by the real Gammu/AT gateway.
    pub fn with_gammu(config: Arc<Config>) -> Self {
        let gateway = Arc::new(GammuGateway::new(config.gateway.clone()));
        Self::new(config, gateway)
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn pool(&self) -> &ModemPool {
        &self.pool
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Initial scan, optional auto-activation, and (when `monitor` is set) the rescan
    /// and keepalive tickers.
    pub async fn start(&mut self, monitor: bool) -> Vec<Modem> {
        let modems = self.pool.rescan().await;
        info!(
            "Session started: {} modem(s), {} OK",
            modems.len(),
            modems.iter().filter(|m| m.is_ok()).count()
        );

        if self.config.activation.auto_activate_on_start {
            let targets = self.pool.dispatchable(&self.selected_modems());
            if !targets.is_empty() {
                self.pool.activate_selected(&targets).await;
            }
        }

        if monitor {
            self.start_monitors();
        }
        modems
    }

    fn start_monitors(&mut self) {
        if self.monitors.is_some() {
            return;
        }
        let rescan = Some(Duration::from_secs(self.config.modems.rescan_interval_seconds));
        let keepalive = self
            .config
            .keepalive
            .enabled
            .then(|| Duration::from_secs(self.config.keepalive.interval_seconds));
        self.monitors = Some(spawn_monitors(self.pool.clone(), rescan, keepalive));
    }

    /// The persisted selection, or every currently healthy modem when nothing was
    /// selected.
    pub fn selected_modems(&self) -> Vec<String> {
        if self.config.state.selected.is_empty() {
            self.pool.healthy()
        } else {
            self.config.state.selected.clone()
        }
    }

    /// Fresh health data before a run, when configured.
    pub async fn prepare_dispatch(&self) {
        if self.config.modems.rescan_before_dispatch {
            self.pool.rescan().await;
        }
    }

    /// Stop tickers and forget pool and session state, keeping the history.
    pub async fn reset(&mut self) {
        if let Some(handle) = self.monitors.take() {
            handle.shutdown().await;
        }
        self.pool.clear();
        self.dispatcher.reset_session();
        info!("Session reset");
    }

    pub async fn shutdown(mut self) {
        if let Some(handle) = self.monitors.take() {
            handle.shutdown().await;
        }
        info!("Session closed");
    }
}
