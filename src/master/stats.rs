//! Shared stats poll timer

use log::debug;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Posts a tick into the session every `interval` until cancelled or dropped
pub(crate) struct StatsTimer {
    handle: JoinHandle<()>,
}

impl StatsTimer {
    pub(crate) fn spawn(interval: Duration, ticks: mpsc::UnboundedSender<()>) -> Self {
        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately
            timer.tick().await;
            loop {
                timer.tick().await;
                if ticks.send(()).is_err() {
                    break;
                }
            }
        });
        debug!("Stats poll timer started ({:?})", interval);
        Self { handle }
    }

    pub(crate) fn cancel(self) {
        self.handle.abort();
        debug!("Stats poll timer cleared");
    }
}

impl Drop for StatsTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_ticks_after_each_interval() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let timer = StatsTimer::spawn(Duration::from_secs(10), tx);

        tokio::time::sleep(Duration::from_millis(9_500)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());

        timer.cancel();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(rx.try_recv().is_err());
    }
}
