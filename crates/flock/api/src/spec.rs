use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use duration_string::DurationString;
use flock_core_k8s::data::ImagePullPolicy;
use k8s_openapi::{
    api::core::v1::{
        Container, EnvFromSource, EnvVar, LocalObjectReference, PodSpec, SecretEnvSource,
    },
    apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference},
};
use kube::ResourceExt;
use tracing::warn;
use url::Url;

use crate::{
    consts,
    knative::{
        Destination, KReference, KnativeServiceCrd, KnativeServiceSpec, PingSourceCrd,
        PingSourceSpec, RevisionSpec, RevisionTemplateSpec,
    },
};

/// Where the code of a function comes from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceRef {
    /// A file or a directory on this machine; uploaded into the build pod.
    Local(PathBuf),
    /// A repository the build clones by itself.
    Git { url: String },
    /// A downloadable archive or file.
    Url(Url),
    /// A pre-built container image.
    Image(String),
}

impl Default for SourceRef {
    fn default() -> Self {
        Self::Image(String::default())
    }
}

impl SourceRef {
    const GIT_FORGES: &'static [&'static str] = &["bitbucket.org", "github.com", "gitlab.com"];

    pub fn classify(source: &str, base_dir: &Path) -> Self {
        let source = source.trim();

        if source.starts_with("git@") || source.starts_with("git://") {
            return Self::Git { url: source.into() };
        }

        if let Ok(url) = Url::parse(source) {
            match url.scheme() {
                "ssh" => return Self::Git { url: source.into() },
                "http" | "https" => {
                    return if Self::is_git_url(&url) {
                        Self::Git { url: source.into() }
                    } else {
                        Self::Url(url)
                    }
                }
                "file" => {
                    if let Ok(path) = url.to_file_path() {
                        if path.exists() {
                            return Self::Local(path);
                        }
                    }
                }
                _ => (),
            }
        }

        let path = base_dir.join(source);
        if !source.is_empty() && path.exists() {
            Self::Local(path)
        } else {
            Self::Image(source.into())
        }
    }

    fn is_git_url(url: &Url) -> bool {
        if url.path().ends_with(".git") {
            return true;
        }

        let is_forge = url
            .host_str()
            .map(|host| Self::GIT_FORGES.contains(&host))
            .unwrap_or_default();
        let depth = url
            .path_segments()
            .map(|segments| segments.filter(|segment| !segment.is_empty()).count())
            .unwrap_or_default();
        is_forge && depth == 2
    }

    /// Whether the source lives outside of this machine.
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Git { .. } | Self::Url(_))
    }

    pub fn needs_build(&self) -> bool {
        !matches!(self, Self::Image(_))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Schedule {
    pub cron: String,
    pub json_data: Option<String>,
}

/// A resolved, ready-to-deploy function.
///
/// Workers receive their own copy; nothing in here is shared.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ServiceSpec {
    pub name: String,
    pub namespace: String,
    /// Name of the manifest this function was declared in.
    pub parent: String,
    /// Name of the function within its manifest.
    pub function: String,
    pub source: SourceRef,
    pub revision: Option<String>,
    pub runtime: Option<String>,
    pub registry: String,
    pub registry_secret: Option<String>,
    pub env: BTreeMap<String, String>,
    pub env_secrets: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub build_args: Vec<String>,
    pub build_timeout: Option<String>,
    pub concurrency: i64,
    pub pull_policy: Option<ImagePullPolicy>,
    pub schedule: Vec<Schedule>,
}

impl ServiceSpec {
    pub const CONTAINER_NAME: &'static str = "user-container";
    pub const DEFAULT_BUILD_TIMEOUT: Duration = Duration::from_secs(10 * 60);

    pub fn build_timeout(&self) -> Duration {
        match self.build_timeout.as_deref() {
            Some(timeout) => match DurationString::from_str(timeout) {
                Ok(timeout) => timeout.into(),
                Err(error) => {
                    warn!(
                        "invalid build timeout of {name} ({timeout:?}); using the default: {error}",
                        name = &self.name,
                    );
                    Self::DEFAULT_BUILD_TIMEOUT
                }
            },
            None => Self::DEFAULT_BUILD_TIMEOUT,
        }
    }

    /// The image a build pushes, or the image itself when nothing is built.
    pub fn image_name(&self) -> String {
        match &self.source {
            SourceRef::Image(image) => image.clone(),
            _ => format!(
                "{registry}/{namespace}/{name}:{tag}",
                registry = self.registry.trim_end_matches('/'),
                namespace = &self.namespace,
                name = &self.name,
                tag = self.revision.as_deref().unwrap_or("latest"),
            ),
        }
    }

    pub fn labels_all(&self) -> BTreeMap<String, String> {
        let mut labels = self.labels.clone();
        labels.insert(consts::LABEL_PARENT.into(), self.parent.clone());
        labels.insert(consts::LABEL_FUNCTION.into(), self.function.clone());
        labels
    }

    /// Parses `KEY=VALUE` (or `KEY:VALUE`) build arguments.
    pub fn build_params(&self) -> Vec<(String, String)> {
        self.build_args
            .iter()
            .filter_map(|arg| match arg.split_once(['=', ':']) {
                Some((key, value)) if !key.trim().is_empty() => {
                    Some((key.trim().into(), value.trim().into()))
                }
                _ => {
                    warn!("skipping malformed build argument of {}: {arg:?}", &self.name);
                    None
                }
            })
            .collect()
    }

    pub fn to_service(&self, image: &str) -> KnativeServiceCrd {
        let env = self
            .env
            .iter()
            .map(|(name, value)| EnvVar {
                name: name.clone(),
                value: Some(value.clone()),
                value_from: None,
            })
            .collect::<Vec<_>>();

        let env_from = self
            .env_secrets
            .iter()
            .map(|secret| EnvFromSource {
                secret_ref: Some(SecretEnvSource {
                    name: Some(secret.clone()),
                    optional: None,
                }),
                ..Default::default()
            })
            .collect::<Vec<_>>();

        let container = Container {
            name: Self::CONTAINER_NAME.into(),
            image: Some(image.into()),
            image_pull_policy: self.pull_policy.map(|policy| policy.to_string()),
            env: if env.is_empty() { None } else { Some(env) },
            env_from: if env_from.is_empty() {
                None
            } else {
                Some(env_from)
            },
            ..Default::default()
        };

        KnativeServiceCrd {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(self.labels_all()),
                ..Default::default()
            },
            spec: KnativeServiceSpec {
                template: RevisionTemplateSpec {
                    metadata: if self.annotations.is_empty() {
                        None
                    } else {
                        Some(ObjectMeta {
                            annotations: Some(self.annotations.clone()),
                            ..Default::default()
                        })
                    },
                    spec: RevisionSpec {
                        pod: PodSpec {
                            containers: vec![container],
                            image_pull_secrets: self.registry_secret.as_ref().map(|secret| {
                                vec![LocalObjectReference {
                                    name: Some(secret.clone()),
                                }]
                            }),
                            ..Default::default()
                        },
                        container_concurrency: if self.concurrency > 0 {
                            Some(self.concurrency)
                        } else {
                            None
                        },
                        timeout_seconds: None,
                    },
                },
            },
            status: None,
        }
    }

    pub fn schedule_name(&self, index: usize) -> String {
        format!("{name}-schedule-{index}", name = &self.name)
    }

    /// Renders one ping source per schedule, each delivering to the service.
    pub fn to_schedules(&self, owner: Option<&OwnerReference>) -> Vec<PingSourceCrd> {
        self.schedule
            .iter()
            .enumerate()
            .map(|(index, schedule)| {
                let mut source = PingSourceCrd::new(
                    &self.schedule_name(index),
                    PingSourceSpec {
                        schedule: schedule.cron.clone(),
                        content_type: schedule
                            .json_data
                            .as_ref()
                            .map(|_| "application/json".into()),
                        data: schedule.json_data.clone(),
                        sink: Destination {
                            reference: Some(KReference {
                                api_version: "serving.knative.dev/v1".into(),
                                kind: "Service".into(),
                                name: self.name.clone(),
                                namespace: Some(self.namespace.clone()),
                            }),
                            uri: None,
                        },
                    },
                );
                source.metadata.namespace = Some(self.namespace.clone());
                source.metadata.labels = Some(self.labels_all());
                if let Some(owner) = owner {
                    source.owner_references_mut().push(owner.clone());
                }
                source
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn spec() -> ServiceSpec {
        ServiceSpec {
            name: "hello-bar".into(),
            namespace: "default".into(),
            parent: "hello".into(),
            function: "bar".into(),
            registry: consts::DEFAULT_REGISTRY.into(),
            ..Default::default()
        }
    }

    #[test]
    fn classify_sources() {
        let dir = ::tempfile::tempdir().expect("failed to create a tempdir");
        fs::write(dir.path().join("handler.go"), "package main").expect("failed to write");

        assert_eq!(
            SourceRef::classify("handler.go", dir.path()),
            SourceRef::Local(dir.path().join("handler.go")),
        );
        assert_eq!(
            SourceRef::classify("https://github.com/foo/bar", dir.path()),
            SourceRef::Git {
                url: "https://github.com/foo/bar".into(),
            },
        );
        assert_eq!(
            SourceRef::classify("git@example.com:foo/bar.git", dir.path()),
            SourceRef::Git {
                url: "git@example.com:foo/bar.git".into(),
            },
        );
        assert!(matches!(
            SourceRef::classify("https://example.com/handler.go", dir.path()),
            SourceRef::Url(_),
        ));
        assert_eq!(
            SourceRef::classify("docker.io/library/nginx:latest", dir.path()),
            SourceRef::Image("docker.io/library/nginx:latest".into()),
        );
    }

    #[test]
    fn image_name_uses_revision_as_tag() {
        let mut spec = spec();
        spec.source = SourceRef::Git {
            url: "https://github.com/foo/bar".into(),
        };
        assert_eq!(
            spec.image_name(),
            "knative.registry.svc.cluster.local/default/hello-bar:latest",
        );

        spec.revision = Some("v1".into());
        assert_eq!(
            spec.image_name(),
            "knative.registry.svc.cluster.local/default/hello-bar:v1",
        );

        spec.source = SourceRef::Image("nginx".into());
        assert_eq!(spec.image_name(), "nginx");
    }

    #[test]
    fn invalid_build_timeout_falls_back() {
        let mut spec = spec();
        assert_eq!(spec.build_timeout(), ServiceSpec::DEFAULT_BUILD_TIMEOUT);

        spec.build_timeout = Some("90s".into());
        assert_eq!(spec.build_timeout(), Duration::from_secs(90));

        spec.build_timeout = Some("soon".into());
        assert_eq!(spec.build_timeout(), ServiceSpec::DEFAULT_BUILD_TIMEOUT);
    }

    #[test]
    fn build_params_skip_malformed() {
        let mut spec = spec();
        spec.build_args = vec!["A=1".into(), "B:2".into(), "broken".into()];

        assert_eq!(
            spec.build_params(),
            vec![("A".into(), "1".into()), ("B".into(), "2".into())],
        );
    }

    #[test]
    fn render_service() {
        let mut spec = spec();
        spec.env.insert("FOO".into(), "bar".into());
        spec.env_secrets.push("creds".into());
        spec.registry_secret = Some("pull".into());
        spec.concurrency = 4;
        spec.annotations
            .insert("autoscaling.knative.dev/minScale".into(), "1".into());

        let service = spec.to_service("nginx");
        let labels = service.metadata.labels.clone().unwrap_or_default();
        assert_eq!(labels.get(consts::LABEL_PARENT).map(|s| s.as_str()), Some("hello"));
        assert_eq!(labels.get(consts::LABEL_FUNCTION).map(|s| s.as_str()), Some("bar"));

        let template = &service.spec.template;
        assert_eq!(template.spec.container_concurrency, Some(4));
        assert!(template.metadata.is_some());

        let pod = &template.spec.pod;
        assert_eq!(pod.containers[0].image.as_deref(), Some("nginx"));
        assert_eq!(
            pod.containers[0].env.as_ref().map(|env| env.len()),
            Some(1),
        );
        assert_eq!(
            pod.image_pull_secrets.as_ref().and_then(|s| s[0].name.as_deref()),
            Some("pull"),
        );
    }

    #[test]
    fn render_schedules() {
        let mut spec = spec();
        spec.schedule = vec![
            Schedule {
                cron: "*/1 * * * *".into(),
                json_data: Some(r#"{"a":1}"#.into()),
            },
            Schedule {
                cron: "0 0 * * *".into(),
                json_data: None,
            },
        ];

        let sources = spec.to_schedules(None);
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].name_any(), "hello-bar-schedule-0");
        assert_eq!(
            sources[0].spec.content_type.as_deref(),
            Some("application/json"),
        );
        assert_eq!(
            sources[1]
                .spec
                .sink
                .reference
                .as_ref()
                .map(|r| r.name.as_str()),
            Some("hello-bar"),
        );
    }
}
