mod executor;

pub use executor::Executor;

use tokio::time::{sleep, timeout};
use tracing::{error, info};

use crate::logbus::POLL_INTERVAL;
use crate::queue::JOB_TIMEOUT;

/// Runs `count` concurrent job consumers until the process dies. Multiple
/// worker processes may run this against the same queue; jobs for distinct
/// deployments proceed in parallel with no coordination beyond the queue pop.
pub async fn worker_pool(count: usize, executor: Executor) {
    info!(count, "starting worker pool");

    let handles: Vec<_> = (0..count)
        .map(|index| {
            let executor = executor.clone();
            tokio::spawn(worker_task(index, executor))
        })
        .collect();

    for handle in handles {
        let _ = handle.await;
    }
}

async fn worker_task(index: usize, executor: Executor) {
    info!(worker = index, "worker started, listening for jobs");

    loop {
        match executor.queue.dequeue().await {
            Ok(Some(job)) => {
                let deployment_id = job.deployment_id.clone();
                if timeout(JOB_TIMEOUT, executor.execute(job)).await.is_err() {
                    executor.job_timed_out(&deployment_id).await;
                }
            }
            Ok(None) => sleep(POLL_INTERVAL).await,
            Err(err) => {
                error!(worker = index, error = %err, "failed to poll the job queue");
                sleep(POLL_INTERVAL * 4).await;
            }
        }
    }
}
