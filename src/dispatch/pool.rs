//! Bounded worker pool
//!
//! `concurrency` workers share one queue. The dispatcher enqueues every job,
//! drops the sender, and waits for the workers to drain the queue. A job's
//! failure is recorded on that job only.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info_span, warn, Instrument};

use super::job::Job;
use super::render::Renderer;
use crate::ssh::SshError;

/// Queue depth between the dispatcher and the workers
pub const QUEUE_CAPACITY: usize = 64;

/// Runs the command on one host
#[async_trait]
pub trait HostRunner: Send + Sync + 'static {
    async fn run(&self, job: Arc<Job>) -> Result<(), SshError>;
}

/// Run every job exactly once with at most `concurrency` in flight.
///
/// With a renderer, its last frame is drawn before this returns.
pub async fn dispatch<R>(
    jobs: &[Arc<Job>],
    concurrency: usize,
    runner: Arc<R>,
    renderer: Option<Renderer>,
) where
    R: HostRunner + ?Sized,
{
    let render_task = renderer.map(|renderer| {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(renderer.run(jobs.to_vec(), shutdown_rx));
        (shutdown_tx, handle)
    });

    let (tx, rx) = mpsc::channel::<Arc<Job>>(QUEUE_CAPACITY);
    let rx = Arc::new(Mutex::new(rx));
    let workers = concurrency.max(1).min(jobs.len().max(1));

    let mut set = JoinSet::new();
    for id in 0..workers {
        let rx = rx.clone();
        let runner = runner.clone();
        set.spawn(async move {
            loop {
                let next = rx.lock().await.recv().await;
                let Some(job) = next else { break };
                run_job(runner.as_ref(), job).await;
            }
            debug!("Worker {} finished", id);
        });
    }

    for job in jobs {
        if tx.send(job.clone()).await.is_err() {
            warn!("All workers exited before the queue was filled");
            break;
        }
    }
    drop(tx);

    while let Some(result) = set.join_next().await {
        if let Err(e) = result {
            warn!("Worker task failed: {}", e);
        }
    }

    if let Some((shutdown_tx, handle)) = render_task {
        let _ = shutdown_tx.send(());
        match handle.await {
            Ok(Err(e)) => warn!("Rendering failed: {}", e),
            Err(e) => warn!("Renderer task failed: {}", e),
            Ok(Ok(())) => {}
        }
    }
}

async fn run_job<R>(runner: &R, job: Arc<Job>)
where
    R: HostRunner + ?Sized,
{
    // Failed during option resolution
    if job.options().is_none() {
        return;
    }

    let span = info_span!("host", host = %job.target());
    async {
        let result = runner.run(job.clone()).await;
        // Shown under the host header; stderr belongs to the live view
        match &result {
            Err(e) if e.is_remote_exit() => debug!("Command failed: {}", e),
            Err(e) => debug!("Job failed: {}", e),
            Ok(()) => {}
        }
        job.finish(result);
    }
    .instrument(span)
    .await
}
