use std::collections::BTreeMap;

use anyhow::{bail, Result};
use async_trait::async_trait;
use flock_api::{
    build::{
        ArgumentSpec, BuildCrd, BuildSpec, BuildTemplateCrd, BuildTemplateSpec, GitSourceSpec,
        SourceSpec, TemplateInstantiationSpec,
    },
    consts,
    spec::ServiceSpec,
};
use flock_core_k8s::store::{create_or_update, KubeStore};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Api, Client, ResourceExt};
use tracing::{info, instrument, warn, Level};

use super::{
    create_job, delete_job, run_job, set_job_owner,
    source::{self, BuildSource},
    taskrun::PARAM_IMAGE,
    BuildJobKind, BuildJobRef, BuildOutput, Builder,
};
use crate::inject::SourceInjector;

const DEFAULT_GIT_REVISION: &str = "master";

/// Builds with the deprecated Knative Build API.
pub(super) struct LegacyBuilder {
    kube: Client,
    http: ::reqwest::Client,
    injector: SourceInjector,
    template: String,
    object: Option<BuildTemplateCrd>,
}

impl LegacyBuilder {
    pub(super) fn new(
        kube: Client,
        http: ::reqwest::Client,
        injector: SourceInjector,
        template: String,
        object: Option<BuildTemplateCrd>,
    ) -> Self {
        Self {
            kube,
            http,
            injector,
            template,
            object,
        }
    }

    async fn template_spec(&self, namespace: &str) -> Result<BuildTemplateSpec> {
        match self.object.clone() {
            Some(mut object) => {
                object.metadata.namespace = Some(namespace.into());
                object.metadata.resource_version = None;

                let store = KubeStore::new(self.kube.clone(), consts::FIELD_MANAGER);
                let applied = create_or_update(&store, namespace, object).await?;
                info!(
                    "{verb} build template {namespace}/{name}",
                    verb = applied.verb(),
                    name = &self.template,
                );
                Ok(applied.into_inner().spec)
            }
            None => {
                let api = Api::<BuildTemplateCrd>::namespaced(self.kube.clone(), namespace);
                match api.get_opt(&self.template).await? {
                    Some(template) => Ok(template.spec),
                    None => bail!(
                        "build template {template:?} is not registered in {namespace:?}",
                        template = &self.template,
                    ),
                }
            }
        }
    }
}

#[async_trait]
impl Builder for LegacyBuilder {
    fn strategy(&self) -> &'static str {
        "build template"
    }

    #[instrument(level = Level::INFO, skip_all, fields(name = %spec.name, template = %self.template), err(Display))]
    async fn deploy(&self, spec: &ServiceSpec) -> Result<BuildOutput> {
        let source = BuildSource::prepare(&self.http, spec).await?;
        let template = self.template_spec(&spec.namespace).await?;
        let image = spec.image_name();

        let object = render_build(spec, &image, &self.template, &template, &source);
        let created = create_job(&self.kube, &spec.namespace, &object).await?;
        let job = BuildJobRef {
            kind: BuildJobKind::Build,
            namespace: spec.namespace.clone(),
            name: created.name_any(),
        };
        info!("created build job {job}");

        run_job::<BuildCrd>(&self.kube, &self.injector, spec, &source, &job).await?;
        Ok(BuildOutput {
            image,
            job: Some(job),
        })
    }

    async fn set_owner(&self, job: &BuildJobRef, owner: OwnerReference) -> Result<()> {
        set_job_owner::<BuildCrd>(&self.kube, job, owner).await
    }

    async fn delete(&self, job: &BuildJobRef) -> Result<()> {
        delete_job::<BuildCrd>(&self.kube, job).await
    }
}

fn render_build(
    spec: &ServiceSpec,
    image: &str,
    template_name: &str,
    template: &BuildTemplateSpec,
    source: &BuildSource,
) -> BuildCrd {
    let mut arguments = Vec::default();
    if template.has_parameter(PARAM_IMAGE) {
        arguments.push(ArgumentSpec {
            name: PARAM_IMAGE.into(),
            value: image.into(),
        });
    }
    for (name, value) in spec.build_params() {
        if template.has_parameter(&name) {
            arguments.push(ArgumentSpec { name, value });
        } else {
            warn!(
                "skipping build argument of {service}: the template has no parameter {name:?}",
                service = &spec.name,
            );
        }
    }

    let source = match source {
        BuildSource::Git { url, revision } => SourceSpec {
            git: Some(GitSourceSpec {
                url: url.clone(),
                revision: revision
                    .clone()
                    .unwrap_or_else(|| DEFAULT_GIT_REVISION.into()),
            }),
            custom: None,
        },
        BuildSource::Local { .. } => SourceSpec {
            git: None,
            custom: source::build_custom_source(source),
        },
    };

    let labels = BTreeMap::from([
        (consts::LABEL_SERVICE.to_string(), spec.name.clone()),
        (consts::LABEL_PARENT.to_string(), spec.parent.clone()),
    ]);

    BuildCrd {
        metadata: ObjectMeta {
            generate_name: Some(format!("{name}-", name = &spec.name)),
            namespace: Some(spec.namespace.clone()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: BuildSpec {
            source: Some(source),
            template: Some(TemplateInstantiationSpec {
                name: template_name.into(),
                kind: Some("BuildTemplate".into()),
                arguments,
            }),
            service_account_name: None,
            timeout: Some(format!("{}s", spec.build_timeout().as_secs())),
        },
        status: None,
    }
}
