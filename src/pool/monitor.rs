//! Background rescan and keepalive tickers.
//!
//! Both tickers are plain tokio tasks over a shared [`ModemPool`]. They stop when the
//! [`MonitorHandle`] is shut down or dropped.

use log::{debug, info};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::{Health, ModemPool};

pub struct MonitorHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl MonitorHandle {
    pub fn is_running(&self) -> bool {
        self.tasks.iter().any(|t| !t.is_finished())
    }

    /// Signal every ticker and wait for it to finish its current tick.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// Start the tickers. `None` disables the corresponding ticker. The first tick fires one
/// full period after start.
pub fn spawn_monitors(
    pool: ModemPool,
    rescan_every: Option<Duration>,
    keepalive_every: Option<Duration>,
) -> MonitorHandle {
    let (shutdown, rx) = watch::channel(false);
    let mut tasks = Vec::new();

    if let Some(period) = rescan_every.filter(|p| !p.is_zero()) {
        let pool = pool.clone();
        tasks.push(tokio::spawn(run_ticker(period, rx.clone(), move || {
            let pool = pool.clone();
            async move {
                let modems = pool.rescan().await;
                let ok = modems.iter().filter(|m| m.health == Health::Ok).count();
                debug!("Rescan: {} modem(s), {} OK", modems.len(), ok);
            }
        })));
        info!("Rescan ticker started ({}s)", period.as_secs());
    }

    if let Some(period) = keepalive_every.filter(|p| !p.is_zero()) {
        let pool = pool.clone();
        tasks.push(tokio::spawn(run_ticker(period, rx.clone(), move || {
            let pool = pool.clone();
            async move {
                let summary = pool.keepalive_tick().await;
                debug!(
                    "Keepalive: {} answered, {} demoted, {} skipped",
                    summary.answered.len(),
                    summary.demoted.len(),
                    summary.skipped_busy.len()
                );
            }
        })));
        info!("Keepalive ticker started ({}s)", period.as_secs());
    }

    MonitorHandle { shutdown, tasks }
}

async fn run_ticker<F, Fut>(period: Duration, mut shutdown: watch::Receiver<bool>, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let mut timer = interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = timer.tick() => tick().await,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MockGateway;
    use crate::pool::PoolSettings;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn keepalive_ticker_demotes_and_stops() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("ttyUSB0"), "").unwrap();
        let dev = format!("{}/ttyUSB0", tmp.path().display());

        let gw = Arc::new(MockGateway::new().with_modem(&dev, None));
        let pool = ModemPool::new(
            gw.clone(),
            PoolSettings {
                device_globs: vec![format!("{}/ttyUSB*", tmp.path().display())],
                validate: true,
                release_busy_ports: false,
                at_commands: vec![],
                at_baud_rate: 115200,
                keepalive_command: "AT".into(),
            },
        );
        pool.rescan().await;
        assert_eq!(pool.health_of(&dev), Some(Health::Ok));

        let handle = spawn_monitors(pool.clone(), None, Some(Duration::from_secs(60)));
        gw.fail_activation(&dev);
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(pool.health_of(&dev), Some(Health::Fail));

        assert!(handle.is_running());
        handle.shutdown().await;
    }
}
