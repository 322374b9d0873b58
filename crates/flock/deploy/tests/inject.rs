use std::{
    fs,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use flock_api::{consts, error::InjectionError, tekton::TaskRunCrd};
use flock_core_k8s::store::memory::MemoryStore;
use flock_deploy::inject::{PodExecutor, SourceInjector};
use k8s_openapi::api::core::v1::Pod;

#[derive(Clone, Debug, PartialEq, Eq)]
struct Call {
    pod: String,
    container: String,
    command: Vec<String>,
    stdin: bool,
}

#[derive(Default)]
struct RecordingExecutor {
    calls: Mutex<Vec<Call>>,
    /// Commands starting with this program exit with an error.
    failing: Option<&'static str>,
}

impl RecordingExecutor {
    fn failing(program: &'static str) -> Self {
        Self {
            failing: Some(program),
            ..Default::default()
        }
    }

    fn calls(&self) -> Vec<Call> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl PodExecutor for RecordingExecutor {
    async fn exec(
        &self,
        _namespace: &str,
        pod: &str,
        container: &str,
        command: Vec<String>,
        stdin: Option<PathBuf>,
    ) -> Result<(), InjectionError> {
        if let Some(path) = &stdin {
            let archive = fs::metadata(path).expect("the archive should exist while uploading");
            assert!(archive.len() > 0);
        }
        let failed = self.failing.is_some_and(|program| command[0] == program);
        let call = Call {
            pod: pod.into(),
            container: container.into(),
            command,
            stdin: stdin.is_some(),
        };
        let result = if failed {
            Err(InjectionError::Exec {
                pod: call.pod.clone(),
                command: call.command.join(" "),
                message: "tar: short read".into(),
            })
        } else {
            Ok(())
        };
        self.calls.lock().expect("poisoned").push(call);
        result
    }
}

fn task_run(name: &str, pod: &str, created: &str) -> TaskRunCrd {
    task_run_of("hello-bar", name, pod, created)
}

fn task_run_of(service: &str, name: &str, pod: &str, created: &str) -> TaskRunCrd {
    ::serde_json::from_value(::serde_json::json!({
        "apiVersion": "tekton.dev/v1",
        "kind": "TaskRun",
        "metadata": {
            "name": name,
            "namespace": "default",
            "creationTimestamp": created,
            "labels": { "flock.ulagbulag.io/service": service },
        },
        "spec": {},
        "status": { "podName": pod },
    }))
    .expect("failed to parse task run")
}

fn build_pod(name: &str, state: &str) -> Pod {
    let running = state == "running";
    let state = if running {
        ::serde_json::json!({ "running": {} })
    } else {
        ::serde_json::json!({ "terminated": { "exitCode": 0 } })
    };

    ::serde_json::from_value(::serde_json::json!({
        "metadata": { "name": name, "namespace": "default" },
        "status": {
            "phase": "Running",
            "containerStatuses": [{
                "name": "step-custom-source",
                "image": "busybox",
                "imageID": "",
                "ready": running,
                "restartCount": 0,
                "state": state,
            }],
        },
    }))
    .expect("failed to parse pod")
}

struct Fixture {
    pods: Arc<MemoryStore<Pod>>,
    jobs: MemoryStore<TaskRunCrd>,
    executor: Arc<RecordingExecutor>,
    injector: SourceInjector,
    source: ::tempfile::TempDir,
}

fn fixture() -> Fixture {
    fixture_with(RecordingExecutor::default())
}

fn fixture_with(executor: RecordingExecutor) -> Fixture {
    let pods = Arc::new(MemoryStore::<Pod>::default());
    let executor = Arc::new(executor);
    let injector = SourceInjector::new(pods.clone(), executor.clone())
        .with_poll_interval(Duration::from_millis(10));

    let source = ::tempfile::tempdir().expect("failed to create a source dir");
    fs::write(source.path().join("main.go"), "package main\n").expect("failed to write");

    Fixture {
        pods,
        jobs: MemoryStore::default(),
        executor,
        injector,
        source,
    }
}

#[tokio::test]
async fn uploads_then_signals_the_build() {
    let fixture = fixture();
    fixture
        .jobs
        .insert("default", task_run("hello-bar-abc", "pod-1", "2024-05-01T00:00:00Z"));
    fixture.pods.insert("default", build_pod("pod-1", "running"));

    fixture
        .injector
        .inject::<TaskRunCrd>(
            &fixture.jobs,
            "default",
            "hello-bar",
            fixture.source.path(),
            Duration::from_secs(5),
        )
        .await
        .expect("failed to inject");

    let calls = fixture.executor.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].pod, "pod-1");
    assert_eq!(calls[0].container, "step-custom-source");
    assert_eq!(calls[0].command, ["tar", "-xf", "-", "-C", consts::SOURCE_DIR]);
    assert!(calls[0].stdin);
    assert_eq!(calls[1].command, ["touch", consts::SOURCE_SENTINEL]);
    assert!(!calls[1].stdin);
}

#[tokio::test]
async fn superseded_pods_are_skipped() {
    let fixture = fixture();
    fixture
        .jobs
        .insert("default", task_run("hello-bar-abc", "pod-1", "2024-05-01T00:00:00Z"));
    fixture.pods.insert("default", build_pod("pod-1", "terminated"));

    let Fixture {
        pods,
        jobs,
        executor,
        injector,
        source,
    } = fixture;
    let jobs = Arc::new(jobs);

    // a newer build shows up a little later
    let rebuild = {
        let jobs = jobs.clone();
        let pods = pods.clone();
        ::tokio::spawn(async move {
            ::tokio::time::sleep(Duration::from_millis(30)).await;
            jobs.insert("default", task_run("hello-bar-def", "pod-2", "2024-05-01T00:05:00Z"));
            pods.insert("default", build_pod("pod-2", "running"));
        })
    };

    injector
        .inject::<TaskRunCrd>(
            jobs.as_ref(),
            "default",
            "hello-bar",
            source.path(),
            Duration::from_secs(5),
        )
        .await
        .expect("failed to inject");
    rebuild.await.expect("rebuild panicked");

    let pods: Vec<_> = executor.calls().into_iter().map(|call| call.pod).collect();
    assert_eq!(pods, ["pod-2", "pod-2"]);
}

#[tokio::test]
async fn missing_pods_give_up() {
    let fixture = fixture();

    let error = fixture
        .injector
        .inject::<TaskRunCrd>(
            &fixture.jobs,
            "default",
            "hello-bar",
            fixture.source.path(),
            Duration::from_millis(50),
        )
        .await
        .expect_err("there is no build pod");

    assert!(matches!(
        error,
        InjectionError::PodNotFound { ref service, attempts: 5 } if service == "hello-bar",
    ));
    assert!(fixture.executor.calls().is_empty());
}

#[tokio::test]
async fn long_service_names_find_their_truncated_jobs() {
    let fixture = fixture();
    let service = format!("hello-{}", "x".repeat(54));
    assert_eq!(service.len(), 60);

    // the API server cuts generated name prefixes down to 58 characters
    let generated = format!("{service}-");
    let job = format!("{}abcde", &generated[..58]);
    assert!(!job.starts_with(&generated));

    fixture
        .jobs
        .insert("default", task_run_of(&service, &job, "pod-1", "2024-05-01T00:00:00Z"));
    fixture
        .jobs
        .insert("default", task_run("hello-bar-abc", "pod-other", "2024-05-01T00:05:00Z"));
    fixture.pods.insert("default", build_pod("pod-1", "running"));

    fixture
        .injector
        .inject::<TaskRunCrd>(
            &fixture.jobs,
            "default",
            &service,
            fixture.source.path(),
            Duration::from_secs(5),
        )
        .await
        .expect("failed to inject");

    let pods: Vec<_> = fixture
        .executor
        .calls()
        .into_iter()
        .map(|call| call.pod)
        .collect();
    assert_eq!(pods, ["pod-1", "pod-1"]);
}

#[tokio::test]
async fn failed_uploads_do_not_signal_the_build() {
    let fixture = fixture_with(RecordingExecutor::failing("tar"));
    fixture
        .jobs
        .insert("default", task_run("hello-bar-abc", "pod-1", "2024-05-01T00:00:00Z"));
    fixture.pods.insert("default", build_pod("pod-1", "running"));

    let error = fixture
        .injector
        .inject::<TaskRunCrd>(
            &fixture.jobs,
            "default",
            "hello-bar",
            fixture.source.path(),
            Duration::from_secs(5),
        )
        .await
        .expect_err("the upload should fail");

    assert!(matches!(
        error,
        InjectionError::Exec { ref pod, ref message, .. }
            if pod == "pod-1" && message == "tar: short read",
    ));
    let calls = fixture.executor.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].command[0], "tar");
    assert!(calls.iter().all(|call| call.command[0] != "touch"));
}
