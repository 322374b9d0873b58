use std::{collections::BTreeMap, path::Path};

use async_recursion::async_recursion;
use flock_api::{
    consts,
    manifest::ResolvedManifest,
    spec::{ServiceSpec, SourceRef},
};
use flock_core_k8s::data::{ImagePullPolicy, Name};
use tempfile::TempDir;
use tokio::{fs, sync::Mutex};
use tracing::{debug, info, instrument, warn, Level};

use crate::{
    error::ManifestError,
    fetch::{self, Fetched},
    schema::{Function, Manifest, Provider},
};

#[derive(Clone, Debug, Default)]
pub struct ResolverOptions {
    /// Overrides the namespace of every manifest.
    pub namespace: Option<String>,
    /// Used when neither the command line nor any manifest names a namespace.
    pub default_namespace: String,
    /// Overrides the registry of every manifest.
    pub registry: Option<String>,
    pub registry_secret: Option<String>,
}

/// Turns a manifest and everything it includes into functions.
///
/// Remote includes are fetched into scratch directories owned by the
/// resolver; keep it alive until the functions are deployed.
pub struct ManifestResolver {
    client: ::reqwest::Client,
    options: ResolverOptions,
    scratch: Mutex<Vec<TempDir>>,
}

impl ManifestResolver {
    pub fn new(options: ResolverOptions) -> Self {
        Self {
            client: ::reqwest::Client::new(),
            options,
            scratch: Mutex::default(),
        }
    }

    pub async fn resolve(
        &self,
        path: &Path,
        selected: &[String],
    ) -> Result<Vec<ServiceSpec>, ManifestError> {
        self.resolve_tree(path, selected)
            .await
            .map(ResolvedManifest::flatten)
    }

    #[instrument(level = Level::INFO, skip(self), err(Display))]
    pub async fn resolve_tree(
        &self,
        path: &Path,
        selected: &[String],
    ) -> Result<ResolvedManifest, ManifestError> {
        let mut chain = Vec::default();
        let key = local_key(path).await;
        let tree = self
            .resolve_level(path, key, selected, &Inherited::default(), &mut chain)
            .await?;

        for name in selected {
            if !tree_has_function(&tree, name) {
                warn!("no function named {name:?} in {path:?}");
            }
        }
        info!(
            "resolved {count} function(s) from {path:?}",
            count = tree.len(),
        );
        Ok(tree)
    }

    #[async_recursion]
    async fn resolve_level(
        &self,
        path: &Path,
        key: String,
        selected: &[String],
        inherited: &Inherited,
        chain: &mut Vec<String>,
    ) -> Result<ResolvedManifest, ManifestError> {
        check_cycle(chain, &key)?;
        chain.push(key);

        let manifest = load(path).await?;
        let base_dir = path.parent().unwrap_or(Path::new(".")).to_path_buf();

        let service = match manifest.service.as_deref().map(str::trim) {
            Some(service) if !service.is_empty() => service,
            _ => {
                return Err(ManifestError::MissingService {
                    path: path.to_path_buf(),
                })
            }
        };
        let parent = match &inherited.parent {
            Some(outer) => format!("{outer}-{service}"),
            None => service.to_string(),
        };
        validate_name(&parent)?;

        let level = inherited.overlay(&self.options, &parent, &manifest.provider);
        let namespace = level.namespace.clone().unwrap_or_else(|| {
            self.options.default_namespace.clone()
        });

        let mut specs = Vec::with_capacity(manifest.functions.len());
        for (function_name, function) in &manifest.functions {
            if !selected.is_empty() && !selected.contains(function_name) {
                debug!("skipping unselected function: {parent}/{function_name}");
                continue;
            }
            specs.push(level.to_spec(
                &namespace,
                &base_dir,
                service,
                function_name,
                function,
            )?);
        }

        let mut includes = Vec::with_capacity(manifest.include.len());
        for reference in &manifest.include {
            // remote includes land in a fresh directory each time
            let remote = fetch::remote_key(reference, &base_dir);
            if let Some(key) = &remote {
                check_cycle(chain, key)?;
            }

            let Fetched { path, scratch } =
                fetch::fetch_include(&self.client, reference, &base_dir).await?;
            if let Some(scratch) = scratch {
                self.scratch.lock().await.push(scratch);
            }

            let key = match remote {
                Some(key) => key,
                None => local_key(&path).await,
            };
            let include = self
                .resolve_level(&path, key, selected, &level, chain)
                .await?;
            includes.push(include);
        }

        chain.pop();
        Ok(ResolvedManifest {
            parent,
            namespace,
            description: manifest.description,
            specs,
            includes,
        })
    }
}

async fn local_key(path: &Path) -> String {
    fs::canonicalize(path)
        .await
        .unwrap_or_else(|_| path.to_path_buf())
        .display()
        .to_string()
}

fn check_cycle(chain: &[String], key: &str) -> Result<(), ManifestError> {
    if chain.iter().any(|current| current == key) {
        let mut chain = chain.to_vec();
        chain.push(key.into());
        Err(ManifestError::IncludeCycle { chain })
    } else {
        Ok(())
    }
}

async fn load(path: &Path) -> Result<Manifest, ManifestError> {
    let text = fs::read_to_string(path)
        .await
        .map_err(|source| ManifestError::Read {
            path: path.to_path_buf(),
            source,
        })?;

    ::serde_yaml::from_str(&text).map_err(|source| ManifestError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn validate_name(name: &str) -> Result<(), ManifestError> {
    name.parse::<Name>()
        .map(|_| ())
        .map_err(|error| ManifestError::InvalidName {
            name: name.into(),
            reason: error.to_string(),
        })
}

fn tree_has_function(tree: &ResolvedManifest, function: &str) -> bool {
    tree.specs.iter().any(|spec| spec.function == function)
        || tree
            .includes
            .iter()
            .any(|include| tree_has_function(include, function))
}

/// Values a manifest passes on to its functions and includes.
#[derive(Clone, Debug, Default)]
struct Inherited {
    parent: Option<String>,
    namespace: Option<String>,
    registry: Option<String>,
    registry_secret: Option<String>,
    runtime: Option<String>,
    pull_policy: Option<ImagePullPolicy>,
    build_timeout: Option<String>,
    env: BTreeMap<String, String>,
    env_secrets: Vec<String>,
    annotations: BTreeMap<String, String>,
}

impl Inherited {
    fn overlay(&self, options: &ResolverOptions, parent: &str, provider: &Provider) -> Self {
        let mut env = self.env.clone();
        env.extend(provider.environment.clone());

        let mut annotations = self.annotations.clone();
        annotations.extend(provider.annotations.clone());

        Self {
            parent: Some(parent.into()),
            namespace: options
                .namespace
                .clone()
                .or_else(|| provider.namespace.clone())
                .or_else(|| self.namespace.clone()),
            registry: options
                .registry
                .clone()
                .or_else(|| provider.registry.clone())
                .or_else(|| self.registry.clone()),
            registry_secret: options
                .registry_secret
                .clone()
                .or_else(|| provider.registry_secret.clone())
                .or_else(|| self.registry_secret.clone()),
            runtime: provider.runtime.clone().or_else(|| self.runtime.clone()),
            pull_policy: provider.pull_policy.or(self.pull_policy),
            build_timeout: provider
                .buildtimeout
                .clone()
                .or_else(|| self.build_timeout.clone()),
            env,
            env_secrets: self
                .env_secrets
                .iter()
                .chain(&provider.env_secrets)
                .cloned()
                .collect(),
            annotations,
        }
    }

    fn to_spec(
        &self,
        namespace: &str,
        base_dir: &Path,
        service: &str,
        function_name: &str,
        function: &Function,
    ) -> Result<ServiceSpec, ManifestError> {
        let parent = self.parent.as_deref().unwrap_or(service);
        let name = format!("{parent}-{function_name}");
        validate_name(&name)?;

        let source = match function.source.as_deref().map(str::trim) {
            Some(source) if !source.is_empty() => SourceRef::classify(source, base_dir),
            _ => {
                return Err(ManifestError::MissingSource {
                    service: service.into(),
                    function: function_name.into(),
                })
            }
        };

        let mut env = self.env.clone();
        env.extend(function.environment.clone());

        let mut annotations = self.annotations.clone();
        annotations.extend(function.annotations.clone());

        Ok(ServiceSpec {
            name,
            namespace: namespace.into(),
            parent: parent.into(),
            function: function_name.into(),
            source,
            revision: function.revision.clone(),
            runtime: function.runtime.clone().or_else(|| self.runtime.clone()),
            registry: self
                .registry
                .clone()
                .unwrap_or_else(|| consts::DEFAULT_REGISTRY.into()),
            registry_secret: self.registry_secret.clone(),
            env,
            env_secrets: self
                .env_secrets
                .iter()
                .chain(&function.env_secrets)
                .cloned()
                .collect(),
            labels: function.labels(),
            annotations,
            build_args: function.buildargs.clone(),
            build_timeout: function
                .buildtimeout
                .clone()
                .or_else(|| self.build_timeout.clone()),
            concurrency: function.concurrency.unwrap_or_default(),
            pull_policy: function.pull_policy.or(self.pull_policy),
            schedule: function.schedules(consts::SCHEDULE_EVENT),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn function_values_win() {
        let inherited = Inherited {
            runtime: Some("outer-runtime".into()),
            env: BTreeMap::from([
                ("A".to_string(), "outer".to_string()),
                ("B".to_string(), "outer".to_string()),
            ]),
            env_secrets: vec!["outer".into()],
            ..Default::default()
        };
        let provider = Provider {
            runtime: Some("provider-runtime".into()),
            environment: BTreeMap::from([("B".to_string(), "provider".to_string())]),
            env_secrets: vec!["provider".into()],
            ..Default::default()
        };
        let level = inherited.overlay(&ResolverOptions::default(), "hello", &provider);
        assert_eq!(level.runtime.as_deref(), Some("provider-runtime"));

        let function = Function {
            source: Some("docker.io/library/nginx".into()),
            environment: BTreeMap::from([("A".to_string(), "function".to_string())]),
            env_secrets: vec!["provider".into()],
            ..Default::default()
        };
        let spec = level
            .to_spec("default", Path::new("."), "hello", "bar", &function)
            .expect("failed to resolve function");

        assert_eq!(spec.name, "hello-bar");
        assert_eq!(spec.env["A"], "function");
        assert_eq!(spec.env["B"], "provider");
        assert_eq!(spec.env_secrets, ["outer", "provider", "provider"]);
        assert_eq!(spec.runtime.as_deref(), Some("provider-runtime"));
        assert_eq!(spec.registry, consts::DEFAULT_REGISTRY);
    }

    #[test]
    fn command_line_overrides_provider() {
        let options = ResolverOptions {
            namespace: Some("cli".into()),
            registry: Some("registry.local".into()),
            ..Default::default()
        };
        let provider = Provider {
            namespace: Some("manifest".into()),
            registry: Some("docker.io".into()),
            ..Default::default()
        };

        let level = Inherited::default().overlay(&options, "hello", &provider);
        assert_eq!(level.namespace.as_deref(), Some("cli"));
        assert_eq!(level.registry.as_deref(), Some("registry.local"));
    }
}
