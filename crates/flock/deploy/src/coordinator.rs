use std::{fmt, sync::Arc};

use anyhow::{anyhow, bail, Result};
use flock_api::{manifest::ResolvedManifest, result::DeploymentResult, spec::ServiceSpec};
use futures::{future::BoxFuture, FutureExt};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, info, instrument, Level};

use crate::{pipeline::ServicePipeline, reaper::OrphanReaper, reporter::Reporter};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    Deploy,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deploy => "deploy".fmt(f),
            Self::Delete => "delete".fmt(f),
        }
    }
}

struct Job {
    operation: Operation,
    spec: ServiceSpec,
}

/// A fixed number of workers sharing one job queue.
///
/// Every batch drains exactly as many results as it submitted, so the
/// same workers serve any number of batches.
pub struct WorkerPool {
    jobs: mpsc::Sender<Job>,
    results: Mutex<mpsc::Receiver<DeploymentResult>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(pipeline: ServicePipeline, workers: usize, capacity: usize) -> Self {
        let workers = workers.max(1);
        let capacity = capacity.max(workers);
        let (jobs, queue) = mpsc::channel::<Job>(capacity);
        let (sink, results) = mpsc::channel(capacity);
        let queue = Arc::new(Mutex::new(queue));

        let workers = (0..workers)
            .map(|id| {
                let pipeline = pipeline.clone();
                let queue = queue.clone();
                let sink = sink.clone();
                ::tokio::spawn(async move {
                    loop {
                        // release the queue before working on the job
                        let job = queue.lock().await.recv().await;
                        let Some(Job { operation, spec }) = job else {
                            break;
                        };

                        debug!("worker {id} picked {name}", name = &spec.name);
                        let result = match operation {
                            Operation::Deploy => pipeline.deploy(spec).await,
                            Operation::Delete => pipeline.delete(spec).await,
                        };
                        if sink.send(result).await.is_err() {
                            break;
                        }
                    }
                })
            })
            .collect();

        Self {
            jobs,
            results: Mutex::new(results),
            workers,
        }
    }

    /// Feeds the batch to the workers and hands over each result in
    /// completion order.
    pub async fn run(
        &self,
        operation: Operation,
        specs: Vec<ServiceSpec>,
        mut on_result: impl FnMut(DeploymentResult),
    ) -> Result<()> {
        let total = specs.len();

        // hold the results for the whole batch
        let mut results = self.results.lock().await;

        let jobs = self.jobs.clone();
        let feeder = ::tokio::spawn(async move {
            for spec in specs {
                if jobs.send(Job { operation, spec }).await.is_err() {
                    break;
                }
            }
        });

        let mut drained = 0;
        while drained < total {
            match results.recv().await {
                Some(result) => {
                    drained += 1;
                    on_result(result);
                }
                None => break,
            }
        }
        feeder.await.ok();

        if drained == total {
            Ok(())
        } else {
            bail!("workers stopped after {drained} of {total} functions")
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.abort();
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CoordinatorOptions {
    pub workers: usize,
    pub dry_run: bool,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            workers: 3,
            dry_run: false,
        }
    }
}

/// Where to look for services the batch no longer describes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrphanScope {
    pub namespace: String,
    pub parent: String,
}

pub struct DeploymentCoordinator {
    pipeline: ServicePipeline,
    reaper: OrphanReaper,
    reporter: Arc<dyn Reporter>,
    options: CoordinatorOptions,
}

impl DeploymentCoordinator {
    pub fn new(
        pipeline: ServicePipeline,
        reaper: OrphanReaper,
        reporter: Arc<dyn Reporter>,
        options: CoordinatorOptions,
    ) -> Self {
        Self {
            pipeline,
            reaper,
            reporter,
            options,
        }
    }

    /// Runs every function to completion and fails afterwards if any of
    /// them did.
    #[instrument(level = Level::INFO, skip(self, specs), fields(functions = specs.len()), err(Display))]
    pub async fn run_batch(
        &self,
        operation: Operation,
        specs: Vec<ServiceSpec>,
        orphans: Option<OrphanScope>,
    ) -> Result<()> {
        let total = specs.len();
        let workers = self.options.workers.max(1);
        let pool = WorkerPool::spawn(self.pipeline.clone(), workers, total + workers);

        let mut succeeded = Vec::with_capacity(total);
        let mut failed = Vec::default();
        let drained = pool
            .run(operation, specs, |result| {
                self.reporter.report(&result);
                if result.is_ok() {
                    succeeded.push(result.name);
                } else {
                    failed.push(result.name);
                }
            })
            .await;
        drop(pool);
        drained?;

        if operation == Operation::Deploy && !self.options.dry_run {
            if let Some(OrphanScope { namespace, parent }) = orphans {
                match self.reaper.reap(&namespace, &parent, &succeeded).await {
                    Ok(outcomes) => {
                        for result in outcomes {
                            self.reporter.report(&result);
                            if !result.is_ok() {
                                failed.push(result.name);
                            }
                        }
                    }
                    Err(error) => {
                        error!("{error}");
                        let result = DeploymentResult::err(&parent, error);
                        self.reporter.report(&result);
                        failed.push(result.name);
                    }
                }
            }
        }

        if failed.is_empty() {
            info!("{operation} of {total} functions finished");
            Ok(())
        } else {
            bail!(
                "failed to {operation} {count} of {total} functions: {names}",
                count = failed.len(),
                names = failed.join(", "),
            )
        }
    }

    /// Runs one batch per manifest level, each with its own pool.
    ///
    /// Includes run alongside their parent, so the number of functions in
    /// flight may exceed the configured worker count.
    pub fn run_tree(
        self: Arc<Self>,
        operation: Operation,
        tree: ResolvedManifest,
        remove_orphans: bool,
    ) -> BoxFuture<'static, Result<()>> {
        async move {
            let ResolvedManifest {
                parent,
                namespace,
                description: _,
                specs,
                includes,
            } = tree;

            let includes: Vec<_> = includes
                .into_iter()
                .map(|include| {
                    ::tokio::spawn(self.clone().run_tree(operation, include, remove_orphans))
                })
                .collect();

            let scope = remove_orphans.then(|| OrphanScope { namespace, parent });
            let mut errors = Vec::default();
            if let Err(error) = self.run_batch(operation, specs, scope).await {
                errors.push(error);
            }
            for include in includes {
                match include.await {
                    Ok(Ok(())) => continue,
                    Ok(Err(error)) => errors.push(error),
                    Err(error) => errors.push(anyhow!("an included batch panicked: {error}")),
                }
            }

            match errors.len() {
                0 => Ok(()),
                1 => Err(errors.remove(0)),
                _ => bail!(
                    "{}",
                    errors
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join("; "),
                ),
            }
        }
        .boxed()
    }
}
