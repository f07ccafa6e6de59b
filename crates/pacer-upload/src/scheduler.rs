//! Background upload scheduler

use crate::manager::UploadManager;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info};

/// Floor on the sleep between cycles while a due task is being held elsewhere
const MIN_WAIT: Duration = Duration::from_millis(10);

/// Handle to the running scheduler
pub struct SchedulerTask {
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl SchedulerTask {
    /// Stop the scheduler; an attempt in progress finishes first
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        let _ = self.handle.await;
    }
}

/// Spawn the scheduler loop
///
/// Due tasks are attempted whenever `connectivity` reads `true`. The loop
/// sleeps until the next retry is due (bounded by the poll interval) and wakes
/// early on enqueue, on dead-letter retry, and when connectivity returns.
pub fn spawn_scheduler(
    manager: Arc<UploadManager>,
    mut connectivity: watch::Receiver<bool>,
) -> SchedulerTask {
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
    let poll_interval = Duration::from_millis(manager.config().poll_interval_ms.max(1));

    let handle = tokio::spawn(async move {
        info!(
            poll_interval_ms = poll_interval.as_millis() as u64,
            "Starting upload scheduler"
        );
        let mut connectivity_closed = false;

        loop {
            let online = *connectivity.borrow_and_update();
            if online {
                let attempted = manager.run_due().await;
                if attempted > 0 {
                    debug!(attempted, "Upload cycle finished");
                }
            }

            let wait = if online {
                manager
                    .next_due_at()
                    .map(|at| (at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
                    .map_or(poll_interval, |until| until.max(MIN_WAIT).min(poll_interval))
            } else {
                poll_interval
            };

            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Upload scheduler shutting down");
                    break;
                }
                _ = manager.notified() => {}
                changed = connectivity.changed(), if !connectivity_closed => {
                    match changed {
                        Ok(()) => {
                            if *connectivity.borrow() {
                                let woken = manager.make_all_due();
                                info!(woken, "Connectivity restored, uploads due");
                            } else {
                                info!("Connectivity lost, uploads paused");
                            }
                        }
                        Err(_) => {
                            // Keep the last reported value
                            connectivity_closed = true;
                        }
                    }
                }
                _ = sleep(wait) => {}
            }
        }
    });

    SchedulerTask {
        shutdown_tx,
        handle,
    }
}
