pub mod builder;
mod coordinator;
pub mod inject;
mod pipeline;
mod reaper;
mod reporter;
mod watch;

pub use self::{
    coordinator::{CoordinatorOptions, DeploymentCoordinator, Operation, OrphanScope, WorkerPool},
    pipeline::{PipelineOptions, ServicePipeline},
    reaper::OrphanReaper,
    reporter::{Reporter, StdoutReporter},
    watch::ReadinessWatcher,
};
