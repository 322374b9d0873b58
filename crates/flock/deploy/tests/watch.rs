mod common;

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use flock_api::{error::ReadinessError, knative::KnativeServiceCrd};
use flock_core_k8s::store::{ResourceStore, WatchStream};
use flock_deploy::ReadinessWatcher;
use futures::{stream, StreamExt};
use kube::{core::ErrorResponse, Error};

use self::common::{failed, pending, ready};

/// Replays one scripted subscription per `watch` call, then hangs.
#[derive(Default)]
struct ScriptedStore {
    scripts: Mutex<VecDeque<Vec<KnativeServiceCrd>>>,
    opened: AtomicUsize,
}

impl ScriptedStore {
    fn new(scripts: Vec<Vec<KnativeServiceCrd>>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            opened: AtomicUsize::default(),
        })
    }

    fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

fn unsupported() -> Error {
    Error::Api(ErrorResponse {
        status: "Failure".into(),
        message: "not scripted".into(),
        reason: "MethodNotAllowed".into(),
        code: 405,
    })
}

#[async_trait]
impl ResourceStore<KnativeServiceCrd> for ScriptedStore {
    async fn get_opt(&self, _: &str, _: &str) -> Result<Option<KnativeServiceCrd>, Error> {
        Err(unsupported())
    }

    async fn create(&self, _: &str, _: &KnativeServiceCrd) -> Result<KnativeServiceCrd, Error> {
        Err(unsupported())
    }

    async fn replace(
        &self,
        _: &str,
        _: &str,
        _: &KnativeServiceCrd,
    ) -> Result<KnativeServiceCrd, Error> {
        Err(unsupported())
    }

    async fn delete(&self, _: &str, _: &str) -> Result<(), Error> {
        Err(unsupported())
    }

    async fn list(&self, _: &str, _: &str) -> Result<Vec<KnativeServiceCrd>, Error> {
        Err(unsupported())
    }

    async fn watch(&self, _: &str, _: &str) -> Result<WatchStream<KnativeServiceCrd>, Error> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let script = self.scripts.lock().ok().and_then(|mut scripts| scripts.pop_front());
        Ok(match script {
            Some(events) => stream::iter(events.into_iter().map(Ok)).boxed(),
            None => stream::pending().boxed(),
        })
    }
}

#[tokio::test(start_paused = true)]
async fn closed_streams_are_reopened() {
    let store = ScriptedStore::new(vec![
        vec![pending("hello-bar", "hello")],
        vec![],
        vec![pending("hello-bar", "hello"), ready("hello-bar", "hello")],
    ]);
    let watcher = ReadinessWatcher::new(store.clone());

    let url = watcher
        .wait("default", "hello-bar", Duration::from_secs(60))
        .await
        .expect("the service should become ready");
    assert_eq!(url, "http://hello-bar.default.example.com");
    assert_eq!(store.opened(), 3);
}

#[tokio::test(start_paused = true)]
async fn first_failure_is_tolerated() {
    let store = ScriptedStore::new(vec![
        vec![failed("hello-bar", "hello", "revision missing")],
        vec![ready("hello-bar", "hello")],
    ]);
    let watcher = ReadinessWatcher::new(store.clone());

    let url = watcher
        .wait("default", "hello-bar", Duration::from_secs(60))
        .await
        .expect("a single failure should be retried");
    assert_eq!(url, "http://hello-bar.default.example.com");
    assert_eq!(store.opened(), 2);
}

#[tokio::test(start_paused = true)]
async fn second_failure_carries_the_remote_message() {
    let store = ScriptedStore::new(vec![
        vec![failed("hello-bar", "hello", "revision missing")],
        vec![failed("hello-bar", "hello", "image pull failed")],
    ]);
    let watcher = ReadinessWatcher::new(store);

    let error = watcher
        .wait("default", "hello-bar", Duration::from_secs(60))
        .await
        .expect_err("the second failure is fatal");
    assert!(matches!(&error, ReadinessError::Failed { name, .. } if name == "hello-bar"));
    assert_eq!(error.to_string(), "image pull failed");
}

#[tokio::test(start_paused = true)]
async fn silence_times_out() {
    let store = ScriptedStore::new(vec![vec![pending("hello-bar", "hello")]]);
    let watcher = ReadinessWatcher::new(store);

    let started = ::tokio::time::Instant::now();
    let error = watcher
        .wait("default", "hello-bar", Duration::from_secs(1))
        .await
        .expect_err("nothing ever becomes ready");

    assert!(matches!(&error, ReadinessError::TimedOut { name } if name == "hello-bar"));
    assert!(error.to_string().contains("hello-bar"));
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_millis(1100));
}
