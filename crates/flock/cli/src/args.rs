use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use clap::{value_parser, ArgAction, Parser};
use duration_string::DurationString;
use flock_api::consts;
use flock_core_k8s::store::KubeStore;
use flock_deploy::{
    builder::KubeBuilderProvider,
    inject::{KubeExecutor, SourceInjector},
    CoordinatorOptions, DeploymentCoordinator, OrphanReaper, PipelineOptions, ReadinessWatcher,
    ServicePipeline, StdoutReporter,
};
use flock_manifest::ResolverOptions;
use kube::Client;
use tracing::debug;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub(crate) struct Args {
    #[command(flatten)]
    common: ArgsCommon,

    #[command(subcommand)]
    command: crate::commands::Command,
}

impl Args {
    pub(crate) async fn run(self) -> Result<()> {
        let session = self.common.run().await?;
        self.command.run(session).await
    }
}

#[derive(Parser)]
pub(crate) struct ArgsCommon {
    /// Turn debugging information on
    #[arg(short, long, global = true, env = "FLOCK_DEBUG", action = ArgAction::Count)]
    #[arg(value_parser = value_parser!(u8).range(..=3))]
    debug: u8,

    /// Path to the manifest describing the functions
    #[arg(
        short = 'f',
        long,
        global = true,
        env = "FLOCK_MANIFEST",
        default_value = "serverless.yaml"
    )]
    manifest: PathBuf,

    /// Namespace to deploy into, overriding the manifests
    #[arg(short, long, global = true, env = "FLOCK_NAMESPACE")]
    namespace: Option<String>,

    /// Render the resources instead of touching the cluster
    #[arg(long, global = true, env = "FLOCK_DRY_RUN")]
    dry_run: bool,

    /// Registry to push built images to, overriding the manifests
    #[arg(long, global = true, env = "FLOCK_REGISTRY")]
    registry: Option<String>,

    /// Secret to pull images from the registry with
    #[arg(long, global = true, env = "FLOCK_REGISTRY_SECRET")]
    registry_secret: Option<String>,
}

impl ArgsCommon {
    async fn run(self) -> Result<Session> {
        ::flock_core::tracer::init_once_with_level_int(self.debug);

        let kube = Client::try_default()
            .await
            .map_err(|error| anyhow!("failed to connect to the cluster: {error}"))?;
        let settle_delay = ::flock_core::env::infer_opt::<_, DurationString>(
            "FLOCK_WATCH_SETTLE_DELAY",
        )?
        .map(Into::into)
        .unwrap_or(ReadinessWatcher::DEFAULT_SETTLE_DELAY);

        let resolver = ResolverOptions {
            default_namespace: kube.default_namespace().into(),
            namespace: self.namespace,
            registry: self.registry,
            registry_secret: self.registry_secret,
        };
        debug!("default namespace: {}", &resolver.default_namespace);

        Ok(Session {
            kube,
            manifest: self.manifest,
            resolver,
            dry_run: self.dry_run,
            settle_delay,
        })
    }
}

/// What every command needs to reach the cluster.
pub(crate) struct Session {
    kube: Client,
    pub(crate) manifest: PathBuf,
    pub(crate) resolver: ResolverOptions,
    pub(crate) dry_run: bool,
    settle_delay: Duration,
}

impl Session {
    pub(crate) fn coordinator(&self, workers: usize, wait: bool) -> Arc<DeploymentCoordinator> {
        let store = Arc::new(KubeStore::new(self.kube.clone(), consts::FIELD_MANAGER));

        let executor = Arc::new(KubeExecutor::new(self.kube.clone()));
        let injector = SourceInjector::new(store.clone(), executor);
        let builders = Arc::new(KubeBuilderProvider::new(
            self.kube.clone(),
            injector,
            self.dry_run,
        ));
        let watcher = ReadinessWatcher::new(store.clone()).with_settle_delay(self.settle_delay);

        let pipeline = ServicePipeline::new(
            store.clone(),
            store.clone(),
            builders,
            watcher,
            PipelineOptions {
                wait,
                dry_run: self.dry_run,
            },
        );
        Arc::new(DeploymentCoordinator::new(
            pipeline,
            OrphanReaper::new(store),
            Arc::new(StdoutReporter),
            CoordinatorOptions {
                workers,
                dry_run: self.dry_run,
            },
        ))
    }
}
