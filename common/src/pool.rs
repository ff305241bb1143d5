use tracing::{Instrument, instrument};

use crate::remote_fs::RemoteFileDescriptor;
use crate::transfer::TransferOutcome;

/// Default number of concurrent transfers.
pub const DEFAULT_WORKERS: usize = 5;

/// Runs `transfer` for every job on at most `workers` concurrent tasks.
///
/// All jobs are queued and the queue is closed before any worker starts, so each worker simply
/// drains it and exits once it is empty. Every worker pushes exactly one outcome per job it
/// took; outcomes come back in completion order, not in job order.
#[instrument(skip(jobs, transfer), fields(jobs = jobs.len()))]
pub async fn run<F, Fut>(
    jobs: Vec<RemoteFileDescriptor>,
    workers: usize,
    transfer: F,
) -> Vec<TransferOutcome>
where
    F: Fn(usize, RemoteFileDescriptor) -> Fut + Clone + Send + Sync + 'static,
    Fut: std::future::Future<Output = TransferOutcome> + Send + 'static,
{
    assert!(workers > 0, "worker pool needs at least one worker");
    let dispatched = jobs.len();
    let (job_tx, job_rx) = async_channel::unbounded();
    for job in jobs {
        if let Err(error) = job_tx.try_send(job) {
            tracing::error!(
                "failed queueing {:?}, it will not be downloaded",
                error.into_inner().name
            );
        }
    }
    job_tx.close();
    let (result_tx, mut result_rx) = tokio::sync::mpsc::unbounded_channel();
    let mut join_set = tokio::task::JoinSet::new();
    for worker_id in 1..=workers {
        let job_rx = job_rx.clone();
        let result_tx = result_tx.clone();
        let transfer = transfer.clone();
        let worker = async move {
            let mut processed = 0usize;
            while let Ok(job) = job_rx.recv().await {
                tracing::info!("starting download of {:?}", &job.name);
                let outcome = transfer(worker_id, job).await;
                processed += 1;
                if result_tx.send(outcome).is_err() {
                    tracing::error!("result channel closed, outcome dropped");
                }
            }
            tracing::debug!("queue drained after {} jobs", processed);
        };
        join_set.spawn(worker.instrument(tracing::info_span!("worker", id = worker_id)));
    }
    drop(job_rx);
    drop(result_tx);
    let mut outcomes = Vec::with_capacity(dispatched);
    while let Some(outcome) = result_rx.recv().await {
        outcomes.push(outcome);
    }
    while let Some(res) = join_set.join_next().await {
        if let Err(error) = res {
            tracing::error!("worker task failed: {}", error);
        }
    }
    outcomes
}
