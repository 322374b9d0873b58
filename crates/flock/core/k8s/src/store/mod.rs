#[cfg(feature = "memory")]
pub mod memory;

use std::fmt;

use async_stream::stream;
use async_trait::async_trait;
use futures::{pin_mut, stream::BoxStream, StreamExt};
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::{DeleteParams, ListParams, PostParams, WatchEvent, WatchParams},
    Api, Client, Error, Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, instrument, Level};

/// Snapshots of one named object; the end of the stream means the
/// subscription is gone and has to be opened again.
pub type WatchStream<K> = BoxStream<'static, Result<K, Error>>;

/// The verbs this workspace needs from the cluster, keyed by name and namespace.
#[async_trait]
pub trait ResourceStore<K>
where
    Self: Send + Sync,
    K: 'static + Send + Sync,
{
    async fn get_opt(&self, namespace: &str, name: &str) -> Result<Option<K>, Error>;

    async fn create(&self, namespace: &str, object: &K) -> Result<K, Error>;

    async fn replace(&self, namespace: &str, name: &str, object: &K) -> Result<K, Error>;

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), Error>;

    async fn list(&self, namespace: &str, label_selector: &str) -> Result<Vec<K>, Error>;

    async fn watch(&self, namespace: &str, name: &str) -> Result<WatchStream<K>, Error>;
}

#[derive(Clone)]
pub struct KubeStore {
    kube: Client,
    field_manager: String,
}

impl KubeStore {
    pub fn new(kube: Client, field_manager: impl Into<String>) -> Self {
        Self {
            kube,
            field_manager: field_manager.into(),
        }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.kube.clone(), namespace)
    }

    fn post_params(&self) -> PostParams {
        PostParams {
            dry_run: false,
            field_manager: Some(self.field_manager.clone()),
        }
    }
}

#[async_trait]
impl<K> ResourceStore<K> for KubeStore
where
    K: 'static
        + Send
        + Sync
        + Clone
        + fmt::Debug
        + Serialize
        + DeserializeOwned
        + Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
{
    async fn get_opt(&self, namespace: &str, name: &str) -> Result<Option<K>, Error> {
        self.api::<K>(namespace).get_opt(name).await
    }

    async fn create(&self, namespace: &str, object: &K) -> Result<K, Error> {
        self.api::<K>(namespace)
            .create(&self.post_params(), object)
            .await
    }

    async fn replace(&self, namespace: &str, name: &str, object: &K) -> Result<K, Error> {
        self.api::<K>(namespace)
            .replace(name, &self.post_params(), object)
            .await
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), Error> {
        self.api::<K>(namespace)
            .delete(name, &DeleteParams::background())
            .await
            .map(|_| ())
    }

    async fn list(&self, namespace: &str, label_selector: &str) -> Result<Vec<K>, Error> {
        let lp = ListParams::default().labels(label_selector);
        self.api::<K>(namespace)
            .list(&lp)
            .await
            .map(|list| list.items)
    }

    async fn watch(&self, namespace: &str, name: &str) -> Result<WatchStream<K>, Error> {
        let api = self.api::<K>(namespace);
        let wp = WatchParams::default().fields(&format!("metadata.name={name}"));

        let events = stream! {
            match api.watch(&wp, "0").await {
                Ok(events) => {
                    pin_mut!(events);
                    while let Some(event) = events.next().await {
                        match event {
                            Ok(WatchEvent::Added(object) | WatchEvent::Modified(object)) => {
                                yield Ok(object)
                            }
                            Ok(WatchEvent::Deleted(_) | WatchEvent::Bookmark(_)) => continue,
                            Ok(WatchEvent::Error(error)) => {
                                yield Err(Error::Api(error));
                                break;
                            }
                            Err(error) => {
                                yield Err(error);
                                break;
                            }
                        }
                    }
                }
                Err(error) => yield Err(error),
            }
        };
        Ok(events.boxed())
    }
}

#[derive(Clone, Debug)]
pub enum Applied<K> {
    Created(K),
    Updated(K),
}

impl<K> Applied<K> {
    pub fn into_inner(self) -> K {
        match self {
            Self::Created(object) | Self::Updated(object) => object,
        }
    }

    pub const fn verb(&self) -> &'static str {
        match self {
            Self::Created(_) => "created",
            Self::Updated(_) => "updated",
        }
    }
}

/// Creates the object, or replaces the existing one carrying over its
/// `resourceVersion` when the name is already taken.
#[instrument(level = Level::DEBUG, skip(store, object), err(Display))]
pub async fn create_or_update<K, S>(
    store: &S,
    namespace: &str,
    mut object: K,
) -> Result<Applied<K>, Error>
where
    K: 'static + Send + Sync + Resource,
    S: ?Sized + ResourceStore<K>,
{
    let name = object.name_any();
    match store.create(namespace, &object).await {
        Ok(created) => Ok(Applied::Created(created)),
        Err(error) if is_conflict(&error) => {
            debug!("{namespace}/{name} already exists; updating");
            match store.get_opt(namespace, &name).await? {
                Some(current) => {
                    object.meta_mut().resource_version = current.resource_version();
                    store
                        .replace(namespace, &name, &object)
                        .await
                        .map(Applied::Updated)
                }
                // deleted in between
                None => store
                    .create(namespace, &object)
                    .await
                    .map(Applied::Created),
            }
        }
        Err(error) => Err(error),
    }
}

pub fn is_conflict(error: &Error) -> bool {
    matches!(error, Error::Api(response) if response.code == 409)
}

pub fn is_not_found(error: &Error) -> bool {
    matches!(error, Error::Api(response) if response.code == 404)
}
