use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
};

use async_trait::async_trait;
use futures::{future, stream, StreamExt};
use kube::{core::ErrorResponse, Error, Resource, ResourceExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use super::{ResourceStore, WatchStream};

/// An in-process stand-in for the API server.
///
/// It keeps one object per `(namespace, name)`, bumps `resourceVersion` on
/// every write, rejects duplicate creates and stale replaces with `409`, and
/// fans every write out to the watchers of that name.
pub struct MemoryStore<K> {
    objects: Mutex<BTreeMap<(String, String), K>>,
    events: broadcast::Sender<K>,
    revision: AtomicU64,
}

impl<K> Default for MemoryStore<K>
where
    K: Clone,
{
    fn default() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            objects: Default::default(),
            events,
            revision: AtomicU64::new(1),
        }
    }
}

impl<K> MemoryStore<K>
where
    K: Clone + Resource<DynamicType = ()>,
{
    /// Writes the object unconditionally, as a controller updating status would.
    pub fn insert(&self, namespace: &str, mut object: K) -> K {
        let name = object.name_any();
        let mut objects = self.lock();
        let uid = objects
            .get(&(namespace.to_string(), name.clone()))
            .and_then(|current| current.uid());
        self.stamp(namespace, &mut object, uid);
        objects.insert((namespace.to_string(), name), object.clone());
        drop(objects);

        self.events.send(object.clone()).ok();
        object
    }

    pub fn names(&self, namespace: &str) -> Vec<String> {
        self.lock()
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> ::std::sync::MutexGuard<'_, BTreeMap<(String, String), K>> {
        // a poisoned map is still a consistent map
        self.objects
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn stamp(&self, namespace: &str, object: &mut K, uid: Option<String>) {
        let revision = self.revision.fetch_add(1, Ordering::SeqCst);
        let meta = object.meta_mut();
        if meta.name.is_none() {
            let prefix = meta.generate_name.clone().unwrap_or_default();
            meta.name = Some(format!("{prefix}{revision:05x}"));
        }
        meta.namespace = Some(namespace.into());
        meta.resource_version = Some(revision.to_string());
        meta.uid = Some(uid.unwrap_or_else(|| format!("uid-{revision}")));
    }
}

fn error(code: u16, reason: &str, message: String) -> Error {
    Error::Api(ErrorResponse {
        status: "Failure".into(),
        message,
        reason: reason.into(),
        code,
    })
}

fn matches_labels<K>(object: &K, label_selector: &str) -> bool
where
    K: Resource,
{
    let labels = object.labels();
    label_selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => labels.get(key.trim()).map(String::as_str) == Some(value.trim()),
            None => labels.contains_key(term),
        })
}

#[async_trait]
impl<K> ResourceStore<K> for MemoryStore<K>
where
    K: 'static + Send + Sync + Clone + Resource<DynamicType = ()>,
{
    async fn get_opt(&self, namespace: &str, name: &str) -> Result<Option<K>, Error> {
        Ok(self
            .lock()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn create(&self, namespace: &str, object: &K) -> Result<K, Error> {
        let mut object = object.clone();
        let mut objects = self.lock();
        if let Some(name) = object.meta().name.clone() {
            if objects.contains_key(&(namespace.to_string(), name.clone())) {
                let kind = K::kind(&());
                return Err(error(
                    409,
                    "AlreadyExists",
                    format!("{kind} {name:?} already exists"),
                ));
            }
        }

        self.stamp(namespace, &mut object, None);
        objects.insert((namespace.to_string(), object.name_any()), object.clone());
        drop(objects);

        self.events.send(object.clone()).ok();
        Ok(object)
    }

    async fn replace(&self, namespace: &str, name: &str, object: &K) -> Result<K, Error> {
        let mut object = object.clone();
        let mut objects = self.lock();
        let key = (namespace.to_string(), name.to_string());
        let uid = match objects.get(&key) {
            Some(current) if current.resource_version() == object.resource_version() => {
                current.uid()
            }
            Some(_) => {
                return Err(error(
                    409,
                    "Conflict",
                    format!("the object {name:?} has been modified"),
                ))
            }
            None => return Err(error(404, "NotFound", format!("{name:?} not found"))),
        };

        self.stamp(namespace, &mut object, uid);
        objects.insert(key, object.clone());
        drop(objects);

        self.events.send(object.clone()).ok();
        Ok(object)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), Error> {
        match self
            .lock()
            .remove(&(namespace.to_string(), name.to_string()))
        {
            Some(_) => Ok(()),
            None => Err(error(404, "NotFound", format!("{name:?} not found"))),
        }
    }

    async fn list(&self, namespace: &str, label_selector: &str) -> Result<Vec<K>, Error> {
        Ok(self
            .lock()
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, object)| object)
            .filter(|object| matches_labels(*object, label_selector))
            .cloned()
            .collect())
    }

    async fn watch(&self, namespace: &str, name: &str) -> Result<WatchStream<K>, Error> {
        // subscribe before taking the snapshot so no write falls in between
        let updates = BroadcastStream::new(self.events.subscribe());
        let current = self.get_opt(namespace, name).await?;

        let namespace = namespace.to_string();
        let name = name.to_string();
        let updates = updates.filter_map(move |update| {
            future::ready(match update {
                Ok(object)
                    if object.namespace().as_deref() == Some(namespace.as_str())
                        && object.name_any() == name =>
                {
                    Some(Ok(object))
                }
                // lagged receivers just miss intermediate snapshots
                _ => None,
            })
        });

        Ok(stream::iter(current.map(Ok)).chain(updates).boxed())
    }
}
