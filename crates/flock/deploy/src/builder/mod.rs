mod legacy;
mod prebuilt;
mod runtime;
mod source;
mod taskrun;

use std::{fmt, future::Future, sync::Arc, time::Duration};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use flock_api::{
    build::{BuildJob, BuildTemplateCrd},
    consts,
    spec::{ServiceSpec, SourceRef},
    tekton::TaskCrd,
};
use flock_core_k8s::store::{is_not_found, KubeStore};
use k8s_openapi::{apimachinery::pkg::apis::meta::v1::OwnerReference, NamespaceResourceScope};
use kube::{
    api::{DeleteParams, Patch, PatchParams, PostParams},
    runtime::wait::await_condition,
    Api, Client, Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::json;
use tokio::time::Instant;
use tracing::{info, instrument, warn, Level};

pub use self::{prebuilt::PrebuiltBuilder, runtime::RuntimeCatalog};
use self::{legacy::LegacyBuilder, source::BuildSource, taskrun::TaskRunBuilder};
use crate::inject::SourceInjector;

/// What a function's runtime turned out to be.
#[derive(Clone, Debug, PartialEq)]
pub enum RuntimeKind {
    /// A Tekton task; `object` is set when it still has to be applied.
    Task {
        name: String,
        object: Option<Box<TaskCrd>>,
    },
    /// A Knative build template; `object` is set when it still has to be applied.
    BuildTemplate {
        name: String,
        object: Option<Box<BuildTemplateCrd>>,
    },
    /// Not registered (yet); assumed to name a Tekton task.
    Unknown(String),
    None,
}

#[derive(Clone, Debug, PartialEq)]
pub enum BuildStrategy {
    PreBuiltImage,
    LegacyBuildTemplate {
        template: String,
        object: Option<Box<BuildTemplateCrd>>,
    },
    TaskRun {
        task: String,
        object: Option<Box<TaskCrd>>,
    },
}

impl BuildStrategy {
    pub fn select(source: &SourceRef, runtime: RuntimeKind) -> Result<Self> {
        if !source.needs_build() {
            return Ok(Self::PreBuiltImage);
        }

        match runtime {
            RuntimeKind::Task { name, object } => Ok(Self::TaskRun { task: name, object }),
            RuntimeKind::BuildTemplate { name, object } => Ok(Self::LegacyBuildTemplate {
                template: name,
                object,
            }),
            RuntimeKind::Unknown(name) => Ok(Self::TaskRun {
                task: name,
                object: None,
            }),
            RuntimeKind::None => bail!("no runtime to build the source with"),
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Self::PreBuiltImage => "pre-built image",
            Self::LegacyBuildTemplate { .. } => "build template",
            Self::TaskRun { .. } => "task run",
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BuildJobKind {
    Build,
    TaskRun,
}

/// A build resource left on the cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuildJobRef {
    pub kind: BuildJobKind,
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for BuildJobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self {
            kind,
            namespace,
            name,
        } = self;
        write!(f, "{kind:?} {namespace}/{name}")
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuildOutput {
    pub image: String,
    pub job: Option<BuildJobRef>,
}

#[async_trait]
pub trait Builder: Send + Sync {
    fn strategy(&self) -> &'static str;

    /// Produces the image the service should run.
    async fn deploy(&self, spec: &ServiceSpec) -> Result<BuildOutput>;

    async fn set_owner(&self, job: &BuildJobRef, owner: OwnerReference) -> Result<()>;

    async fn delete(&self, job: &BuildJobRef) -> Result<()>;
}

#[async_trait]
pub trait BuilderProvider: Send + Sync {
    async fn resolve(&self, spec: &ServiceSpec) -> Result<Arc<dyn Builder>>;
}

pub struct KubeBuilderProvider {
    kube: Client,
    http: ::reqwest::Client,
    dry_run: bool,
    injector: SourceInjector,
    runtimes: RuntimeCatalog,
}

impl KubeBuilderProvider {
    pub fn new(kube: Client, injector: SourceInjector, dry_run: bool) -> Self {
        let http = ::reqwest::Client::new();
        Self {
            runtimes: RuntimeCatalog::new(kube.clone(), http.clone()),
            kube,
            http,
            dry_run,
            injector,
        }
    }
}

#[async_trait]
impl BuilderProvider for KubeBuilderProvider {
    #[instrument(level = Level::INFO, skip_all, fields(name = %spec.name), err(Display))]
    async fn resolve(&self, spec: &ServiceSpec) -> Result<Arc<dyn Builder>> {
        if self.dry_run {
            return Ok(Arc::new(PrebuiltBuilder));
        }

        let runtime = if spec.source.needs_build() {
            self.runtimes
                .inspect(&spec.namespace, spec.runtime.as_deref())
                .await?
        } else {
            RuntimeKind::None
        };

        let strategy = BuildStrategy::select(&spec.source, runtime)?;
        info!("building {name} with {strategy}", name = &spec.name, strategy = strategy.name());

        Ok(match strategy {
            BuildStrategy::PreBuiltImage => Arc::new(PrebuiltBuilder),
            BuildStrategy::LegacyBuildTemplate { template, object } => {
                warn!(
                    "build templates are deprecated; consider migrating {template:?} to a Tekton task"
                );
                Arc::new(LegacyBuilder::new(
                    self.kube.clone(),
                    self.http.clone(),
                    self.injector.clone(),
                    template,
                    object.map(|object| *object),
                ))
            }
            BuildStrategy::TaskRun { task, object } => Arc::new(TaskRunBuilder::new(
                self.kube.clone(),
                self.http.clone(),
                self.injector.clone(),
                task,
                object.map(|object| *object),
            )),
        })
    }
}

/// Bounds shared by every remote build resource.
trait JobResource:
    'static
    + Send
    + Sync
    + Clone
    + fmt::Debug
    + Serialize
    + DeserializeOwned
    + BuildJob
    + Resource<Scope = NamespaceResourceScope, DynamicType = ()>
{
}

impl<K> JobResource for K where
    K: 'static
        + Send
        + Sync
        + Clone
        + fmt::Debug
        + Serialize
        + DeserializeOwned
        + BuildJob
        + Resource<Scope = NamespaceResourceScope, DynamicType = ()>
{
}

async fn create_job<K>(kube: &Client, namespace: &str, object: &K) -> Result<K>
where
    K: JobResource,
{
    let api = Api::<K>::namespaced(kube.clone(), namespace);
    let pp = PostParams {
        dry_run: false,
        field_manager: Some(consts::FIELD_MANAGER.into()),
    };
    api.create(&pp, object)
        .await
        .map_err(|error| anyhow!("failed to create a build job: {error}"))
}

/// Waits for the job to finish; a failed or vanished job is an error.
async fn await_job<K>(kube: &Client, job: &BuildJobRef, timeout: Duration) -> Result<K>
where
    K: JobResource,
{
    let api = Api::<K>::namespaced(kube.clone(), &job.namespace);
    let is_finished = |object: Option<&K>| object.map_or(true, |object| !object.is_in_progress());

    match ::tokio::time::timeout(timeout, await_condition(api, &job.name, is_finished)).await {
        Ok(Ok(Some(object))) => match object.succeeded() {
            Some(condition) if condition.is_true() => Ok(object),
            Some(condition) => bail!("build job {job} failed: {}", condition.message()),
            None => bail!("build job {job} finished without a result"),
        },
        Ok(Ok(None)) => bail!("build job {job} has been deleted"),
        Ok(Err(error)) => bail!("failed to watch build job {job}: {error}"),
        Err(_) => bail!("timed out waiting for build job {job}"),
    }
}

/// Uploads local sources, waits for the job and cleans up after a failure.
async fn run_job<K>(
    kube: &Client,
    injector: &SourceInjector,
    spec: &ServiceSpec,
    source: &BuildSource,
    job: &BuildJobRef,
) -> Result<K>
where
    K: JobResource,
{
    let timeout = spec.build_timeout();
    let upload = async {
        if let Some(path) = source.local_path() {
            let jobs = KubeStore::new(kube.clone(), consts::FIELD_MANAGER);
            injector
                .inject::<K>(&jobs, &spec.namespace, &spec.name, path, timeout)
                .await?;
        }
        Ok::<_, ::anyhow::Error>(())
    };
    let result = within_deadline(timeout, upload, |remaining| {
        await_job::<K>(kube, job, remaining)
    })
    .await;

    if result.is_err() {
        if let Err(error) = delete_job::<K>(kube, job).await {
            warn!("{error}");
        }
    }
    result
}

/// Runs the upload and then the wait, both under one `timeout`.
async fn within_deadline<U, W, F, T>(timeout: Duration, upload: U, wait: W) -> Result<T>
where
    U: Future<Output = Result<()>>,
    W: FnOnce(Duration) -> F,
    F: Future<Output = Result<T>>,
{
    let deadline = Instant::now() + timeout;
    upload.await?;
    wait(deadline.saturating_duration_since(Instant::now())).await
}

async fn delete_job<K>(kube: &Client, job: &BuildJobRef) -> Result<()>
where
    K: JobResource,
{
    let api = Api::<K>::namespaced(kube.clone(), &job.namespace);
    match api.delete(&job.name, &DeleteParams::background()).await {
        Ok(_) => {
            info!("deleted build job {job}");
            Ok(())
        }
        Err(error) if is_not_found(&error) => Ok(()),
        Err(error) => bail!("failed to delete build job {job}: {error}"),
    }
}

async fn set_job_owner<K>(
    kube: &Client,
    job: &BuildJobRef,
    owner: OwnerReference,
) -> Result<()>
where
    K: JobResource,
{
    let api = Api::<K>::namespaced(kube.clone(), &job.namespace);
    let mut owners = match api.get_opt(&job.name).await? {
        Some(object) => object.owner_references().to_vec(),
        None => bail!("build job {job} is gone"),
    };
    if owners.iter().any(|current| current.uid == owner.uid) {
        return Ok(());
    }
    owners.push(owner);

    let patch = Patch::Merge(json!({
        "metadata": {
            "ownerReferences": owners,
        },
    }));
    let pp = PatchParams::default();
    api.patch(&job.name, &pp, &patch).await?;
    Ok(())
}
