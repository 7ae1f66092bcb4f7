//! Runtime watchdog.
//!
//! Containers can die without the scheduler hearing about it (OOM kill,
//! crash, operator intervention). The watchdog polls the runtime for every
//! Running deployment and transitions the dead ones to Terminated so their
//! resources return to the budget.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use peercompute_core::message::DeploymentStatus;
use peercompute_runtime::RuntimePort;

use crate::Scheduler;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(15);

/// One poll pass over all running deployments.
pub(crate) async fn sweep(scheduler: &Scheduler, runtime: Arc<dyn RuntimePort>) {
    for deployment in scheduler.list() {
        if deployment.status != DeploymentStatus::Running {
            continue;
        }
        let Some(container_id) = deployment.container_id.as_deref() else {
            continue;
        };
        match runtime.is_running(container_id).await {
            Ok(true) => {}
            Ok(false) => scheduler.mark_terminated(&deployment.id),
            Err(e) => {
                warn!(deployment = %deployment.id, error = %e, "Watchdog poll failed");
            }
        }
    }
}

/// Spawn the watchdog loop. Runs until the cancellation token fires.
pub fn spawn(
    scheduler: Arc<Scheduler>,
    runtime: Arc<dyn RuntimePort>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Watchdog shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    sweep(&scheduler, runtime.clone()).await;
                }
            }
        }
    })
}
