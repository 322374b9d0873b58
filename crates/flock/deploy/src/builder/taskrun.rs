use std::collections::BTreeMap;

use anyhow::{bail, Result};
use async_trait::async_trait;
use flock_api::{
    consts,
    spec::ServiceSpec,
    tekton::{Param, TaskCrd, TaskRunCrd, TaskRunSpec, TaskSpec},
};
use flock_core_k8s::store::{create_or_update, KubeStore};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Api, Client, ResourceExt};
use tracing::{info, instrument, warn, Level};

use super::{
    create_job, delete_job, run_job, set_job_owner,
    source::{self, BuildSource},
    BuildJobKind, BuildJobRef, BuildOutput, Builder,
};
use crate::inject::SourceInjector;

pub(super) const PARAM_IMAGE: &str = "IMAGE";

pub(super) struct TaskRunBuilder {
    kube: Client,
    http: ::reqwest::Client,
    injector: SourceInjector,
    task: String,
    /// A downloaded task to register before running it.
    object: Option<TaskCrd>,
}

impl TaskRunBuilder {
    pub(super) fn new(
        kube: Client,
        http: ::reqwest::Client,
        injector: SourceInjector,
        task: String,
        object: Option<TaskCrd>,
    ) -> Self {
        Self {
            kube,
            http,
            injector,
            task,
            object,
        }
    }

    async fn task_spec(&self, namespace: &str) -> Result<TaskSpec> {
        match self.object.clone() {
            Some(mut object) => {
                object.metadata.namespace = Some(namespace.into());
                object.metadata.resource_version = None;

                let store = KubeStore::new(self.kube.clone(), consts::FIELD_MANAGER);
                let applied = create_or_update(&store, namespace, object).await?;
                info!(
                    "{verb} task {namespace}/{name}",
                    verb = applied.verb(),
                    name = &self.task,
                );
                Ok(applied.into_inner().spec)
            }
            None => {
                let api = Api::<TaskCrd>::namespaced(self.kube.clone(), namespace);
                match api.get_opt(&self.task).await? {
                    Some(task) => Ok(task.spec),
                    None => bail!(
                        "task {task:?} is not registered in {namespace:?}",
                        task = &self.task,
                    ),
                }
            }
        }
    }
}

#[async_trait]
impl Builder for TaskRunBuilder {
    fn strategy(&self) -> &'static str {
        "task run"
    }

    #[instrument(level = Level::INFO, skip_all, fields(name = %spec.name, task = %self.task), err(Display))]
    async fn deploy(&self, spec: &ServiceSpec) -> Result<BuildOutput> {
        let source = BuildSource::prepare(&self.http, spec).await?;
        let task = self.task_spec(&spec.namespace).await?;
        let image = spec.image_name();

        let object = render_task_run(spec, &image, task, &source);
        let created = create_job(&self.kube, &spec.namespace, &object).await?;
        let job = BuildJobRef {
            kind: BuildJobKind::TaskRun,
            namespace: spec.namespace.clone(),
            name: created.name_any(),
        };
        info!("created build job {job}");

        let finished: TaskRunCrd = run_job(&self.kube, &self.injector, spec, &source, &job).await?;
        let image = match finished.result(TaskRunCrd::RESULT_IMAGE_DIGEST) {
            Some(digest) if !digest.trim().is_empty() => {
                let repository = image.split_once('@').map_or(image.as_str(), |(repo, _)| repo);
                format!("{repository}@{digest}", digest = digest.trim())
            }
            _ => image,
        };

        Ok(BuildOutput {
            image,
            job: Some(job),
        })
    }

    async fn set_owner(&self, job: &BuildJobRef, owner: OwnerReference) -> Result<()> {
        set_job_owner::<TaskRunCrd>(&self.kube, job, owner).await
    }

    async fn delete(&self, job: &BuildJobRef) -> Result<()> {
        delete_job::<TaskRunCrd>(&self.kube, job).await
    }
}

fn render_task_run(
    spec: &ServiceSpec,
    image: &str,
    mut task: TaskSpec,
    source: &BuildSource,
) -> TaskRunCrd {
    task.steps.insert(0, source::task_source_step(source));

    let mut params = Vec::default();
    if task.has_param(PARAM_IMAGE) {
        params.push(Param {
            name: PARAM_IMAGE.into(),
            value: image.into(),
        });
    }
    for (name, value) in spec.build_params() {
        if task.has_param(&name) {
            params.push(Param { name, value });
        } else {
            warn!(
                "skipping build argument of {service}: the task has no parameter {name:?}",
                service = &spec.name,
            );
        }
    }

    let labels = BTreeMap::from([
        (consts::LABEL_SERVICE.to_string(), spec.name.clone()),
        (consts::LABEL_PARENT.to_string(), spec.parent.clone()),
    ]);

    TaskRunCrd {
        metadata: ObjectMeta {
            generate_name: Some(format!("{name}-", name = &spec.name)),
            namespace: Some(spec.namespace.clone()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: TaskRunSpec {
            task_ref: None,
            task_spec: Some(task),
            params,
            service_account_name: None,
            timeout: Some(format!("{}s", spec.build_timeout().as_secs())),
        },
        status: None,
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use flock_api::{
        spec::SourceRef,
        tekton::{ParamSpec, Step},
    };

    use super::*;

    #[test]
    fn task_runs_are_self_contained() {
        let spec = ServiceSpec {
            name: "hello-bar".into(),
            namespace: "default".into(),
            parent: "hello".into(),
            function: "bar".into(),
            source: SourceRef::Local(PathBuf::from("main.go")),
            registry: consts::DEFAULT_REGISTRY.into(),
            build_args: vec!["GO_VERSION=1.22".into(), "UNKNOWN=1".into()],
            build_timeout: Some("90s".into()),
            ..Default::default()
        };
        let task = TaskSpec {
            params: vec![
                ParamSpec {
                    name: PARAM_IMAGE.into(),
                    ..Default::default()
                },
                ParamSpec {
                    name: "GO_VERSION".into(),
                    ..Default::default()
                },
            ],
            steps: vec![Step {
                name: "build".into(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let source = BuildSource::Local {
            path: PathBuf::from("main.go"),
            _scratch: None,
        };

        let run = render_task_run(&spec, &spec.image_name(), task, &source);
        assert_eq!(run.metadata.generate_name.as_deref(), Some("hello-bar-"));
        assert_eq!(run.metadata.name, None);
        assert_eq!(
            run.labels().get(consts::LABEL_SERVICE).map(String::as_str),
            Some("hello-bar"),
        );
        assert_eq!(run.spec.timeout.as_deref(), Some("90s"));

        let steps: Vec<_> = run
            .spec
            .task_spec
            .as_ref()
            .map(|task| task.steps.iter().map(|step| step.name.as_str()).collect())
            .unwrap_or_default();
        assert_eq!(steps, [consts::CUSTOM_SOURCE_STEP, "build"]);

        let params: Vec<_> = run
            .spec
            .params
            .iter()
            .map(|param| (param.name.as_str(), param.value.as_str()))
            .collect();
        assert_eq!(
            params,
            [
                (PARAM_IMAGE, "knative.registry.svc.cluster.local/default/hello-bar:latest"),
                ("GO_VERSION", "1.22"),
            ],
        );
    }
}
