use std::sync::Arc;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::errors::PipelineError;
use crate::render::pipeline::{RenderPipeline, RenderTask};

async fn run_task(pipeline: &RenderPipeline, task: RenderTask) {
    match pipeline.process(&task).await {
        Ok(status) => info!(job_id = %task.job_id, status = %status, "job processed"),
        Err(e) => error!(job_id = %task.job_id, error = %e, "job processing failed"),
    }
}

/// Hands submitted jobs to whatever runs them.
#[derive(Clone)]
pub enum Dispatcher {
    /// One spawned task per job.
    Background(Arc<RenderPipeline>),
    /// Bounded in-process queue consumed by a `WorkerPool`.
    Queue(mpsc::Sender<RenderTask>),
}

impl Dispatcher {
    pub async fn dispatch(&self, task: RenderTask) -> Result<(), PipelineError> {
        match self {
            Self::Background(pipeline) => {
                let pipeline = pipeline.clone();
                tokio::spawn(async move { run_task(&pipeline, task).await });
                Ok(())
            }
            Self::Queue(sender) => sender.send(task).await.map_err(|_| PipelineError::QueueClosed),
        }
    }

    pub fn mode(&self) -> &'static str {
        match self {
            Self::Background(_) => "background",
            Self::Queue(_) => "queue",
        }
    }
}

/// Fixed set of workers sharing one queue. Each worker runs one job at a
/// time to completion.
pub struct WorkerPool {
    sender: mpsc::Sender<RenderTask>,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(pipeline: Arc<RenderPipeline>, workers: usize, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handles = (0..workers.max(1))
            .map(|worker_id| {
                tokio::spawn(worker_loop(
                    worker_id,
                    pipeline.clone(),
                    receiver.clone(),
                    shutdown_rx.clone(),
                ))
            })
            .collect();
        info!(workers = workers.max(1), capacity, "render workers started");

        Self {
            sender,
            shutdown_tx,
            handles,
        }
    }

    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::Queue(self.sender.clone())
    }

    /// Stop accepting jobs, let workers finish what is already queued, and
    /// wait for them to exit.
    pub async fn shutdown(self) {
        info!("Shutting down render workers");
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "render worker panicked");
            }
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    pipeline: Arc<RenderPipeline>,
    receiver: Arc<Mutex<mpsc::Receiver<RenderTask>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let next = {
            let mut rx = receiver.lock().await;
            if *shutdown.borrow() {
                // A closed receiver still yields buffered tasks, then `None`.
                rx.close();
                rx.recv().await
            } else {
                tokio::select! {
                    task = rx.recv() => task,
                    _ = shutdown.changed() => {
                        rx.close();
                        rx.recv().await
                    }
                }
            }
        };

        let Some(task) = next else {
            break;
        };
        info!(worker_id, job_id = %task.job_id, "worker picked up job");
        run_task(&pipeline, task).await;
    }
    info!(worker_id, "render worker stopped");
}
