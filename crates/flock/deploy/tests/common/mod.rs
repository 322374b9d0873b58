#![allow(dead_code)]

use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::{bail, Result};
use async_trait::async_trait;
use flock_api::{
    knative::{KnativeServiceCrd, PingSourceCrd},
    result::DeploymentResult,
    spec::{ServiceSpec, SourceRef},
};
use flock_core_k8s::store::{memory::MemoryStore, ResourceStore, WatchStream};
use flock_deploy::{
    builder::{BuildJobRef, BuildOutput, Builder, BuilderProvider},
    CoordinatorOptions, DeploymentCoordinator, OrphanReaper, PipelineOptions, ReadinessWatcher,
    Reporter, ServicePipeline,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{core::ErrorResponse, Error};

/// Builds nothing, but remembers how many builds overlapped.
#[derive(Default)]
pub struct FakeBuilder {
    pub failing: BTreeSet<String>,
    pub delay: Duration,
    pub calls: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl FakeBuilder {
    pub fn failing(names: &[&str]) -> Self {
        Self {
            failing: names.iter().map(|name| name.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl Builder for FakeBuilder {
    fn strategy(&self) -> &'static str {
        "fake"
    }

    async fn deploy(&self, spec: &ServiceSpec) -> Result<BuildOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        if !self.delay.is_zero() {
            ::tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing.contains(&spec.name) {
            bail!("build of {} exploded", &spec.name)
        }
        Ok(BuildOutput {
            image: spec.image_name(),
            job: None,
        })
    }

    async fn set_owner(&self, _job: &BuildJobRef, _owner: OwnerReference) -> Result<()> {
        Ok(())
    }

    async fn delete(&self, _job: &BuildJobRef) -> Result<()> {
        Ok(())
    }
}

pub struct FakeBuilderProvider(pub Arc<FakeBuilder>);

#[async_trait]
impl BuilderProvider for FakeBuilderProvider {
    async fn resolve(&self, _spec: &ServiceSpec) -> Result<Arc<dyn Builder>> {
        Ok(self.0.clone())
    }
}

#[derive(Default)]
pub struct CollectingReporter {
    results: Mutex<Vec<(String, Result<String, String>)>>,
}

impl CollectingReporter {
    pub fn results(&self) -> Vec<(String, Result<String, String>)> {
        self.results
            .lock()
            .map(|results| results.clone())
            .unwrap_or_default()
    }

    pub fn find(&self, name: &str) -> Option<Result<String, String>> {
        self.results()
            .into_iter()
            .find(|(current, _)| current == name)
            .map(|(_, outcome)| outcome)
    }
}

impl Reporter for CollectingReporter {
    fn report(&self, result: &DeploymentResult) {
        let outcome = match &result.outcome {
            Ok(message) => Ok(message.clone()),
            Err(error) => Err(error.to_string()),
        };
        if let Ok(mut results) = self.results.lock() {
            results.push((result.name.clone(), outcome));
        }
    }
}

pub struct Harness {
    pub services: Arc<MemoryStore<KnativeServiceCrd>>,
    pub schedules: Arc<MemoryStore<PingSourceCrd>>,
    pub builder: Arc<FakeBuilder>,
    pub reporter: Arc<CollectingReporter>,
    pub coordinator: Arc<DeploymentCoordinator>,
}

impl Harness {
    pub fn new(builder: FakeBuilder, workers: usize, wait: bool) -> Self {
        let services = Arc::new(MemoryStore::<KnativeServiceCrd>::default());
        Self::with_reaper_store(builder, workers, wait, services.clone(), services)
    }

    /// Lets the reaper go through `reaped` instead of the service store.
    pub fn with_reaper_store(
        builder: FakeBuilder,
        workers: usize,
        wait: bool,
        services: Arc<MemoryStore<KnativeServiceCrd>>,
        reaped: Arc<dyn ResourceStore<KnativeServiceCrd>>,
    ) -> Self {
        let schedules = Arc::new(MemoryStore::<PingSourceCrd>::default());
        let builder = Arc::new(builder);
        let reporter = Arc::new(CollectingReporter::default());

        let watcher =
            ReadinessWatcher::new(services.clone()).with_settle_delay(Duration::from_millis(10));
        let pipeline = ServicePipeline::new(
            services.clone(),
            schedules.clone(),
            Arc::new(FakeBuilderProvider(builder.clone())),
            watcher,
            PipelineOptions {
                wait,
                dry_run: false,
            },
        );
        let coordinator = DeploymentCoordinator::new(
            pipeline,
            OrphanReaper::new(reaped),
            reporter.clone(),
            CoordinatorOptions {
                workers,
                dry_run: false,
            },
        );

        Self {
            services,
            schedules,
            builder,
            reporter,
            coordinator: Arc::new(coordinator),
        }
    }
}

/// Forwards to the inner store, but refuses to delete one object.
pub struct FailingDeletes<K> {
    pub inner: Arc<MemoryStore<K>>,
    pub name: String,
}

#[async_trait]
impl<K> ResourceStore<K> for FailingDeletes<K>
where
    K: 'static + Send + Sync + Clone + ::kube::Resource<DynamicType = ()>,
{
    async fn get_opt(&self, namespace: &str, name: &str) -> Result<Option<K>, Error> {
        self.inner.get_opt(namespace, name).await
    }

    async fn create(&self, namespace: &str, object: &K) -> Result<K, Error> {
        self.inner.create(namespace, object).await
    }

    async fn replace(&self, namespace: &str, name: &str, object: &K) -> Result<K, Error> {
        self.inner.replace(namespace, name, object).await
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), Error> {
        if name == self.name {
            return Err(Error::Api(ErrorResponse {
                status: "Failure".into(),
                message: format!("{name:?} is protected"),
                reason: "Forbidden".into(),
                code: 403,
            }));
        }
        self.inner.delete(namespace, name).await
    }

    async fn list(&self, namespace: &str, label_selector: &str) -> Result<Vec<K>, Error> {
        self.inner.list(namespace, label_selector).await
    }

    async fn watch(&self, namespace: &str, name: &str) -> Result<WatchStream<K>, Error> {
        self.inner.watch(namespace, name).await
    }
}

pub fn spec(parent: &str, function: &str) -> ServiceSpec {
    ServiceSpec {
        name: format!("{parent}-{function}"),
        namespace: "default".into(),
        parent: parent.into(),
        function: function.into(),
        source: SourceRef::Image(format!("registry.example.com/{function}:v1")),
        registry: "registry.example.com".into(),
        ..Default::default()
    }
}

/// A service as the serving controller would report it.
pub fn service_with_status(name: &str, parent: &str, status: &str) -> KnativeServiceCrd {
    ::serde_json::from_str(&format!(
        r#"{{
            "apiVersion": "serving.knative.dev/v1",
            "kind": "Service",
            "metadata": {{
                "name": "{name}",
                "namespace": "default",
                "labels": {{ "flock.ulagbulag.io/parent": "{parent}" }}
            }},
            "spec": {{ "template": {{ "spec": {{ "containers": [] }} }} }},
            "status": {status}
        }}"#
    ))
    .expect("failed to parse service")
}

pub fn ready(name: &str, parent: &str) -> KnativeServiceCrd {
    service_with_status(
        name,
        parent,
        &format!(
            r#"{{
                "url": "http://{name}.default.example.com",
                "conditions": [{{ "type": "Ready", "status": "True" }}]
            }}"#
        ),
    )
}

pub fn pending(name: &str, parent: &str) -> KnativeServiceCrd {
    service_with_status(
        name,
        parent,
        r#"{ "conditions": [{ "type": "Ready", "status": "Unknown" }] }"#,
    )
}

pub fn failed(name: &str, parent: &str, message: &str) -> KnativeServiceCrd {
    service_with_status(
        name,
        parent,
        &format!(
            r#"{{
                "conditions": [{{ "type": "Ready", "status": "False", "message": "{message}" }}]
            }}"#
        ),
    )
}
