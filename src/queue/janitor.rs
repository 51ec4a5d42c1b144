//! Periodic removal of finished tasks.

use super::Registry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error};

/// Running janitor; stop it with [`JanitorHandle::stop`].
pub struct JanitorHandle {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl JanitorHandle {
    pub async fn stop(self) {
        if self.shutdown.send(true).is_err() {
            debug!("Janitor already exited");
        }
        if let Err(err) = self.handle.await {
            error!(error = %err, "Janitor join failed");
        }
    }
}

pub(super) fn spawn(registry: Arc<Registry>, every: Duration, max_age: Duration) -> JanitorHandle {
    let (shutdown, rx) = watch::channel(false);
    let handle = tokio::spawn(cleanup_loop(registry, every, max_age, rx));
    JanitorHandle { shutdown, handle }
}

async fn cleanup_loop(
    registry: Arc<Registry>,
    every: Duration,
    max_age: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(every.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // interval() fires immediately; skip that tick.
    ticker.tick().await;

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let removed = registry.cleanup(max_age);
                debug!("Janitor pass removed {removed} tasks");
            }
        }
    }
}
