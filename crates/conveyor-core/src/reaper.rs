//! Reaper loop: visibility-timeout recovery for crashed workers.
//!
//! A worker that dies mid-task cannot tell the coordinator anything; the
//! only signal is its lease running out. This loop sweeps on a fixed
//! interval, independent of any single task, and is the system's sole
//! crash-recovery mechanism.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::coordinator::Coordinator;

pub struct ReaperLoop;

impl ReaperLoop {
    /// Spawn the sweep loop.
    pub fn spawn(coordinator: Arc<Coordinator>, interval: Duration) -> ReaperHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let join = tokio::spawn(async move {
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                match coordinator.reap().await {
                    Ok(0) => {}
                    Ok(n) => info!(reclaimed = n, "reap sweep reclaimed expired leases"),
                    Err(e) => warn!(error = %e, "reap sweep failed"),
                }
                tokio::select! {
                    _ = shutdown_rx.changed() => {}
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        });

        ReaperHandle { shutdown_tx, join }
    }
}

pub struct ReaperHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ReaperHandle {
    pub async fn shutdown_and_join(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.join.await;
    }
}
