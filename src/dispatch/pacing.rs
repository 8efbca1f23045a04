//! Inter-send pacing and cooperative cancellation.

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::config::DispatchConfig;

/// Pause between two consecutive sends: a fixed base plus an optional uniform jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    pub base: Duration,
    pub jitter: Option<(Duration, Duration)>,
}

impl Pacing {
    pub fn none() -> Self {
        Self {
            base: Duration::ZERO,
            jitter: None,
        }
    }

    pub fn from_config(cfg: &DispatchConfig) -> Self {
        Self {
            base: cfg.base_delay(),
            jitter: cfg.jitter_range(),
        }
    }

    pub fn next_delay_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        let extra = match self.jitter {
            Some((lo, hi)) => {
                let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
                if lo == hi {
                    lo
                } else {
                    Duration::from_millis(rng.gen_range(lo.as_millis() as u64..=hi.as_millis() as u64))
                }
            }
            None => Duration::ZERO,
        };
        self.base + extra
    }

    pub fn next_delay(&self) -> Duration {
        self.next_delay_with(&mut rand::thread_rng())
    }
}

/// Cancellation flag shared between the caller (Ctrl-C handler, UI) and a running
/// dispatch. Checked at task boundaries and while pacing.
#[derive(Clone, Debug)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`CancelToken::cancel`] has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn jittered_delay_stays_in_range() {
        let pacing = Pacing {
            base: Duration::from_secs(1),
            jitter: Some((Duration::from_secs(10), Duration::from_secs(30))),
        };
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let d = pacing.next_delay_with(&mut rng);
            assert!(d >= Duration::from_secs(11) && d <= Duration::from_secs(31), "{d:?}");
        }
        assert_eq!(Pacing::none().next_delay(), Duration::ZERO);
    }

    #[test]
    fn cancelled_stays_pending_until_cancel() {
        use tokio_test::{assert_pending, assert_ready, task};

        let token = CancelToken::new();
        let mut waiter = task::spawn(token.cancelled());
        assert_pending!(waiter.poll());
        assert_pending!(waiter.poll());
        assert!(!waiter.is_woken());

        token.cancel();
        assert!(waiter.is_woken());
        assert_ready!(waiter.poll());
    }

    #[tokio::test]
    async fn cancel_wakes_waiters() {
        let token = CancelToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };
        assert!(!token.is_cancelled());
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(token.is_cancelled());
        // already cancelled resolves immediately
        token.cancelled().await;
    }
}
