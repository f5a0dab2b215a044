use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info};

use crate::orchestrator::Orchestrator;

/// Background reclamation task. Every tick runs the expiry sweep and
/// then the stale safety-net sweep; errors are logged and never escape
/// the loop. Owns no policy of its own beyond the schedule.
pub struct Reaper {
    orchestrator: Arc<Orchestrator>,
    interval: Duration,
}

/// Handle to a running reaper; dropping it does not stop the task,
/// `shutdown` does.
pub struct ReaperHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ReaperHandle {
    /// Signal the loop and wait for the in-flight tick to finish.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            error!("Reaper task panicked: {}", e);
        }
        info!("Reaper stopped");
    }
}

impl Reaper {
    pub fn new(orchestrator: Arc<Orchestrator>, sweep_interval: Duration) -> Self {
        Self {
            orchestrator,
            interval: sweep_interval,
        }
    }

    pub fn start(self) -> ReaperHandle {
        let (stop, mut stopped) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = interval(self.interval);
            // The first tick of tokio's interval fires immediately;
            // consume it so the first sweep honors the schedule.
            ticker.tick().await;

            info!(
                "Reaper started, sweeping every {}s",
                self.interval.as_secs()
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.tick().await;
                    }
                    _ = stopped.changed() => {
                        if *stopped.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        ReaperHandle { stop, task }
    }

    async fn tick(&self) {
        match self.orchestrator.sweep_expired().await {
            Ok(report) if report.cleaned_count > 0 => {
                info!("Expiry sweep: cleaned {}", report.cleaned_count);
            }
            Ok(_) => debug!("Expiry sweep: nothing to clean"),
            Err(e) => {
                // Unreachable runtime just means nothing to reap yet.
                debug!("Expiry sweep skipped: {}", e);
                return;
            }
        }

        match self.orchestrator.sweep_stale().await {
            Ok(report) if report.cleaned_count > 0 => {
                info!("Stale sweep: reclaimed {}", report.cleaned_count);
            }
            Ok(_) => debug!("Stale sweep: nothing to reclaim"),
            Err(e) => debug!("Stale sweep skipped: {}", e),
        }
    }
}
