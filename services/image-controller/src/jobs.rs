//! Background job queue.
//!
//! Request handlers hand lifecycle work to the [`JobWorker`] through a
//! [`JobQueue`] and return immediately. The worker runs each job on its own
//! task, so a dropped HTTP connection never cancels accepted work. There is
//! no channel back to the submitter.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::lifecycle::LifecycleController;

/// A unit of lifecycle work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    /// Pull an image by (normalized) reference.
    Pull { image: String },
    /// Prune images older than `days`.
    Prune { days: u32 },
}

impl Job {
    fn kind(&self) -> &'static str {
        match self {
            Job::Pull { .. } => "pull",
            Job::Prune { .. } => "prune",
        }
    }
}

/// Errors from submitting a job.
#[derive(Debug, Error)]
pub enum JobQueueError {
    /// The worker has shut down.
    #[error("job queue is closed")]
    Closed,
}

/// Sending half of the job queue.
#[derive(Debug, Clone)]
pub struct JobQueue {
    tx: mpsc::UnboundedSender<Job>,
}

impl JobQueue {
    /// Create a queue and the receiving end to hand to a [`JobWorker`].
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Job>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Enqueue a job for background execution.
    pub fn submit(&self, job: Job) -> Result<(), JobQueueError> {
        self.tx.send(job).map_err(|_| JobQueueError::Closed)
    }

    /// Whether the worker has stopped accepting jobs.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Runs queued jobs against the lifecycle controller.
pub struct JobWorker {
    rx: mpsc::UnboundedReceiver<Job>,
    controller: Arc<LifecycleController>,
}

impl JobWorker {
    /// Create a new worker.
    pub fn new(rx: mpsc::UnboundedReceiver<Job>, controller: Arc<LifecycleController>) -> Self {
        Self { rx, controller }
    }

    /// Run until shutdown is signalled or every sender is dropped.
    ///
    /// Jobs already started are awaited before returning. Jobs still queued
    /// at shutdown are discarded.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Starting job worker");

        let mut running = JoinSet::new();

        loop {
            tokio::select! {
                job = self.rx.recv() => {
                    let Some(job) = job else {
                        break;
                    };
                    info!(job = job.kind(), "Starting background job");
                    let controller = Arc::clone(&self.controller);
                    running.spawn(run_job(controller, job));
                }
                Some(result) = running.join_next(), if !running.is_empty() => {
                    if let Err(e) = result {
                        warn!(error = %e, "Background job panicked");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Job worker shutting down");
                        break;
                    }
                }
            }
        }

        self.rx.close();
        while let Ok(job) = self.rx.try_recv() {
            warn!(job = ?job, "Discarding queued job at shutdown");
        }

        if !running.is_empty() {
            info!(in_flight = running.len(), "Waiting for background jobs");
        }
        while let Some(result) = running.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "Background job panicked");
            }
        }

        info!("Job worker stopped");
    }
}

async fn run_job(controller: Arc<LifecycleController>, job: Job) {
    match job {
        Job::Pull { image } => {
            controller.pull(&image).await;
        }
        Job::Prune { days } => {
            controller.prune(days).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::{FixedProbe, GIB};
    use crate::lifecycle::LifecycleSettings;
    use crate::runtime::MockGateway;
    use std::time::Duration;

    fn worker_with(
        gateway: Arc<MockGateway>,
    ) -> (JobQueue, JobWorker, watch::Sender<bool>, watch::Receiver<bool>) {
        let controller = Arc::new(LifecycleController::new(
            gateway,
            Arc::new(FixedProbe(100 * GIB)),
            LifecycleSettings::default(),
        ));
        let (queue, rx) = JobQueue::channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        (queue, JobWorker::new(rx, controller), shutdown_tx, shutdown_rx)
    }

    #[tokio::test]
    async fn test_submitted_job_runs() {
        let gateway = Arc::new(MockGateway::new());
        let (queue, worker, shutdown_tx, shutdown_rx) = worker_with(gateway.clone());
        let handle = tokio::spawn(worker.run(shutdown_rx));

        queue
            .submit(Job::Pull {
                image: "docker.io/library/nginx".to_string(),
            })
            .unwrap();

        for _ in 0..100 {
            if !gateway.calls_to("pull").is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(gateway.calls_to("pull").len(), 1);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_running_job() {
        let gateway = Arc::new(MockGateway::new().with_delay(Duration::from_millis(200)));
        let (queue, worker, shutdown_tx, shutdown_rx) = worker_with(gateway.clone());
        let handle = tokio::spawn(worker.run(shutdown_rx));

        queue.submit(Job::Prune { days: 14 }).unwrap();

        // Let the worker pick the job up before shutting down.
        for _ in 0..100 {
            if !gateway.calls().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        // The prune pass ran to completion: containers listed, then images.
        let calls = gateway.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1], vec!["images".to_string(), "-q".to_string()]);
    }

    #[tokio::test]
    async fn test_submit_after_worker_exit_fails() {
        let gateway = Arc::new(MockGateway::new());
        let (queue, worker, shutdown_tx, shutdown_rx) = worker_with(gateway);
        let handle = tokio::spawn(worker.run(shutdown_rx));
        assert!(!queue.is_closed());

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(queue.is_closed());
        assert!(matches!(
            queue.submit(Job::Prune { days: 1 }),
            Err(JobQueueError::Closed)
        ));
    }
}
