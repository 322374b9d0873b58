use std::{collections::BTreeSet, sync::Arc};

use anyhow::anyhow;
use flock_api::{
    consts,
    error::{DeployError, InjectionError},
    knative::{KnativeServiceCrd, PingSourceCrd},
    result::DeploymentResult,
    spec::ServiceSpec,
};
use flock_core_k8s::store::{create_or_update, is_not_found, ResourceStore};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use tracing::{info, instrument, warn, Level};

use crate::{
    builder::{BuildOutput, BuilderProvider},
    watch::ReadinessWatcher,
};

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PipelineOptions {
    /// Block until each service reports ready.
    pub wait: bool,
    /// Render the resources instead of touching the cluster.
    pub dry_run: bool,
}

/// Everything one worker does for one function.
#[derive(Clone)]
pub struct ServicePipeline {
    services: Arc<dyn ResourceStore<KnativeServiceCrd>>,
    schedules: Arc<dyn ResourceStore<PingSourceCrd>>,
    builders: Arc<dyn BuilderProvider>,
    watcher: ReadinessWatcher,
    options: PipelineOptions,
}

impl ServicePipeline {
    pub fn new(
        services: Arc<dyn ResourceStore<KnativeServiceCrd>>,
        schedules: Arc<dyn ResourceStore<PingSourceCrd>>,
        builders: Arc<dyn BuilderProvider>,
        watcher: ReadinessWatcher,
        options: PipelineOptions,
    ) -> Self {
        Self {
            services,
            schedules,
            builders,
            watcher,
            options,
        }
    }

    pub const fn options(&self) -> PipelineOptions {
        self.options
    }

    pub async fn deploy(&self, spec: ServiceSpec) -> DeploymentResult {
        let outcome = self.try_deploy(&spec).await;
        DeploymentResult {
            name: spec.name,
            outcome,
        }
    }

    pub async fn delete(&self, spec: ServiceSpec) -> DeploymentResult {
        let outcome = self.try_delete(&spec).await;
        DeploymentResult {
            name: spec.name,
            outcome,
        }
    }

    #[instrument(level = Level::INFO, skip_all, fields(name = %spec.name, namespace = %spec.namespace), err(Display))]
    async fn try_deploy(&self, spec: &ServiceSpec) -> Result<String, DeployError> {
        let builder = self.builders.resolve(spec).await.map_err(build_error)?;
        let BuildOutput { image, job } = builder.deploy(spec).await.map_err(build_error)?;

        if self.options.dry_run {
            return render_dry_run(spec, &image);
        }

        let mut service = spec.to_service(&image);
        service.annotations_mut().insert(
            consts::ANNOTATION_BUILD.into(),
            job.as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| builder.strategy().into()),
        );

        let applied = match create_or_update(self.services.as_ref(), &spec.namespace, service).await
        {
            Ok(applied) => applied,
            Err(source) => {
                if let Some(job) = &job {
                    if let Err(error) = builder.delete(job).await {
                        warn!("{error}");
                    }
                }
                return Err(DeployError::Apply {
                    kind: "Service",
                    name: spec.name.clone(),
                    source,
                });
            }
        };
        let verb = applied.verb();
        let service = applied.into_inner();
        info!("{verb} service {namespace}/{name}", namespace = &spec.namespace, name = &spec.name);

        let owner = service.controller_owner_ref(&());
        if let (Some(job), Some(owner)) = (&job, owner.clone()) {
            if let Err(error) = builder.set_owner(job, owner).await {
                warn!("failed to hand {job} over to {name}: {error}", name = &spec.name);
            }
        }

        self.apply_schedules(spec, owner.as_ref()).await?;

        if self.options.wait {
            let url = self
                .watcher
                .wait(&spec.namespace, &spec.name, spec.build_timeout())
                .await?;
            Ok(format!("Service {name} ready at {url}", name = &spec.name))
        } else {
            Ok(format!("Deployment started ({verb})"))
        }
    }

    /// Applies the function's schedules and drops the ones it no longer has.
    async fn apply_schedules(
        &self,
        spec: &ServiceSpec,
        owner: Option<&OwnerReference>,
    ) -> Result<(), DeployError> {
        let desired = spec.to_schedules(owner);
        let names: BTreeSet<_> = desired.iter().map(|source| source.name_any()).collect();

        for source in desired {
            let name = source.name_any();
            create_or_update(self.schedules.as_ref(), &spec.namespace, source)
                .await
                .map_err(|source| DeployError::Apply {
                    kind: "PingSource",
                    name: name.clone(),
                    source,
                })?;
            info!("applied schedule {namespace}/{name}", namespace = &spec.namespace);
        }

        let selector = format!(
            "{parent_key}={parent},{function_key}={function}",
            parent_key = consts::LABEL_PARENT,
            parent = &spec.parent,
            function_key = consts::LABEL_FUNCTION,
            function = &spec.function,
        );
        let existing = self
            .schedules
            .list(&spec.namespace, &selector)
            .await
            .map_err(|source| DeployError::Apply {
                kind: "PingSource",
                name: spec.name.clone(),
                source,
            })?;
        for stale in existing
            .iter()
            .map(|source| source.name_any())
            .filter(|name| !names.contains(name))
        {
            match self.schedules.delete(&spec.namespace, &stale).await {
                Ok(()) => info!("removed schedule {namespace}/{stale}", namespace = &spec.namespace),
                Err(error) if is_not_found(&error) => {}
                Err(error) => warn!("failed to remove schedule {stale}: {error}"),
            }
        }
        Ok(())
    }

    #[instrument(level = Level::INFO, skip_all, fields(name = %spec.name, namespace = %spec.namespace), err(Display))]
    async fn try_delete(&self, spec: &ServiceSpec) -> Result<String, DeployError> {
        if self.options.dry_run {
            return Ok(format!(
                "Service {namespace}/{name} would be removed",
                namespace = &spec.namespace,
                name = &spec.name,
            ));
        }

        match self.services.delete(&spec.namespace, &spec.name).await {
            Ok(()) => Ok("Service removed".into()),
            Err(error) if is_not_found(&error) => Ok("Service not found".into()),
            Err(source) => Err(DeployError::Apply {
                kind: "Service",
                name: spec.name.clone(),
                source,
            }),
        }
    }
}

/// Keeps upload failures apart from the rest of the build.
fn build_error(error: ::anyhow::Error) -> DeployError {
    match error.downcast::<InjectionError>() {
        Ok(error) => DeployError::Injection(error),
        Err(error) => DeployError::Build(error),
    }
}

fn render_dry_run(spec: &ServiceSpec, image: &str) -> Result<String, DeployError> {
    let render = |value: Result<String, ::serde_yaml::Error>| {
        value.map_err(|error| DeployError::Build(anyhow!("failed to render {}: {error}", &spec.name)))
    };

    let mut documents = vec![render(::serde_yaml::to_string(&spec.to_service(image)))?];
    for schedule in spec.to_schedules(None) {
        documents.push(render(::serde_yaml::to_string(&schedule))?);
    }
    Ok(documents.join("---\n"))
}
