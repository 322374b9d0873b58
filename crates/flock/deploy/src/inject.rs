use std::{
    collections::BTreeSet,
    fs::File,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use flock_api::{build::BuildJob, consts, error::InjectionError};
use flock_core_k8s::store::ResourceStore;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{ContainerStatus, Pod};
use kube::{api::AttachParams, Api, Client, Resource, ResourceExt};
use tempfile::NamedTempFile;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    task::spawn_blocking,
    time::sleep,
};
use tracing::{debug, info, instrument, Level};

/// Runs commands inside a container of a running pod.
#[async_trait]
pub trait PodExecutor: Send + Sync {
    /// Streams the file at `stdin` (if any) into the command and waits for it to exit.
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: Vec<String>,
        stdin: Option<PathBuf>,
    ) -> Result<(), InjectionError>;
}

#[derive(Clone)]
pub struct KubeExecutor {
    kube: Client,
}

impl KubeExecutor {
    pub fn new(kube: Client) -> Self {
        Self { kube }
    }
}

#[async_trait]
impl PodExecutor for KubeExecutor {
    #[instrument(level = Level::DEBUG, skip(self, stdin), err(Display))]
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: Vec<String>,
        stdin: Option<PathBuf>,
    ) -> Result<(), InjectionError> {
        let exec_error = |message: String| InjectionError::Exec {
            pod: pod.into(),
            command: command.join(" "),
            message,
        };

        let api = Api::<Pod>::namespaced(self.kube.clone(), namespace);
        let ap = AttachParams::default()
            .container(container)
            .stdin(stdin.is_some())
            .stdout(true)
            .stderr(true);
        let mut process = api
            .exec(pod, command.clone(), &ap)
            .await
            .map_err(|error| exec_error(error.to_string()))?;

        let writer = process.stdin();
        let stdout = process.stdout();
        let stderr = process.stderr();
        let status = process.take_status();

        let upload = async move {
            if let (Some(path), Some(mut writer)) = (stdin, writer) {
                let mut file = ::tokio::fs::File::open(path).await?;
                ::tokio::io::copy(&mut file, &mut writer).await?;
                writer.shutdown().await?;
            }
            Ok::<_, io::Error>(())
        };
        let (upload, stdout, stderr) = ::tokio::join!(upload, read_all(stdout), read_all(stderr));
        upload.map_err(|error| exec_error(format!("failed to stream the archive: {error}")))?;

        let status = match status {
            Some(status) => status.await,
            None => None,
        };
        process
            .join()
            .await
            .map_err(|error| exec_error(error.to_string()))?;

        if !stdout.is_empty() {
            debug!("{}", String::from_utf8_lossy(&stdout).trim());
        }
        match status {
            Some(status) if status.status.as_deref() != Some("Success") => {
                let message = status
                    .message
                    .filter(|message| !message.is_empty())
                    .unwrap_or_else(|| String::from_utf8_lossy(&stderr).trim().into());
                Err(exec_error(message))
            }
            _ => Ok(()),
        }
    }
}

async fn read_all(reader: Option<impl AsyncRead + Unpin>) -> Vec<u8> {
    let mut buf = Vec::default();
    if let Some(mut reader) = reader {
        // a broken output channel only loses diagnostics
        reader.read_to_end(&mut buf).await.ok();
    }
    buf
}

/// What the source step of a build pod is doing.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SourceStepState {
    Pending,
    /// Waiting for the upload.
    Running,
    /// Gone; the pod belongs to a superseded build.
    Terminated,
}

impl SourceStepState {
    pub fn of(pod: &Pod, container: &str) -> Self {
        let status = match pod.status.as_ref() {
            Some(status) => status,
            None => return Self::Pending,
        };

        let found = status
            .init_container_statuses
            .iter()
            .chain(status.container_statuses.iter())
            .flatten()
            .find(|status| status.name == container);

        match found.and_then(|status: &ContainerStatus| status.state.as_ref()) {
            Some(state) if state.running.is_some() => Self::Running,
            Some(state) if state.terminated.is_some() => Self::Terminated,
            Some(_) => Self::Pending,
            None => match status.phase.as_deref() {
                Some("Succeeded" | "Failed") => Self::Terminated,
                _ => Self::Pending,
            },
        }
    }
}

/// Uploads local sources into the build pod of a service.
#[derive(Clone)]
pub struct SourceInjector {
    pods: Arc<dyn ResourceStore<Pod>>,
    executor: Arc<dyn PodExecutor>,
    poll_interval: Duration,
}

impl SourceInjector {
    pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

    pub fn new(pods: Arc<dyn ResourceStore<Pod>>, executor: Arc<dyn PodExecutor>) -> Self {
        Self {
            pods,
            executor,
            poll_interval: Self::POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    #[instrument(level = Level::INFO, skip(self, jobs, timeout), err(Display))]
    pub async fn inject<K>(
        &self,
        jobs: &dyn ResourceStore<K>,
        namespace: &str,
        service: &str,
        path: &Path,
        timeout: Duration,
    ) -> Result<(), InjectionError>
    where
        K: 'static + Send + Sync + BuildJob + Resource,
    {
        let archive = archive(path).await?;
        let container = K::container_name(consts::CUSTOM_SOURCE_STEP);

        let max_attempts = max_attempts(timeout, self.poll_interval);
        let pod = ::tokio::time::timeout(
            timeout,
            self.discover_pod(jobs, namespace, service, &container, max_attempts),
        )
        .await
        .unwrap_or_else(|_| {
            Err(InjectionError::PodNotFound {
                service: service.into(),
                attempts: max_attempts,
            })
        })?;

        info!("uploading {path:?} into {namespace}/{pod}");
        self.executor
            .exec(
                namespace,
                &pod,
                &container,
                vec![
                    "tar".into(),
                    "-xf".into(),
                    "-".into(),
                    "-C".into(),
                    consts::SOURCE_DIR.into(),
                ],
                Some(archive.path().to_path_buf()),
            )
            .await?;

        self.executor
            .exec(
                namespace,
                &pod,
                &container,
                vec!["touch".into(), consts::SOURCE_SENTINEL.into()],
                None,
            )
            .await
    }

    /// Follows build pods until one of them waits for the upload.
    async fn discover_pod<K>(
        &self,
        jobs: &dyn ResourceStore<K>,
        namespace: &str,
        service: &str,
        container: &str,
        max_attempts: u64,
    ) -> Result<String, InjectionError>
    where
        K: 'static + Send + Sync + BuildJob + Resource,
    {
        let mut remaining = max_attempts;
        let mut stale = BTreeSet::default();

        'discover: loop {
            let pod = self
                .find_build_pod(jobs, namespace, service, &stale, &mut remaining)
                .await?
                .ok_or_else(|| InjectionError::PodNotFound {
                    service: service.into(),
                    attempts: max_attempts,
                })?;

            let watch_error = |source| InjectionError::Watch {
                pod: pod.clone(),
                source,
            };
            let mut events = self.pods.watch(namespace, &pod).await.map_err(watch_error)?;
            while let Some(event) = events.next().await {
                let object = event.map_err(watch_error)?;
                match SourceStepState::of(&object, container) {
                    SourceStepState::Running => return Ok(pod),
                    SourceStepState::Terminated => {
                        info!("build pod {pod} has been superseded; looking for a newer one");
                        stale.insert(pod.clone());
                        continue 'discover;
                    }
                    SourceStepState::Pending => continue,
                }
            }
            debug!("watch on {pod} closed; looking for the build pod again");
        }
    }

    /// Polls for the newest in-progress build of the service that has a pod.
    async fn find_build_pod<K>(
        &self,
        jobs: &dyn ResourceStore<K>,
        namespace: &str,
        service: &str,
        stale: &BTreeSet<String>,
        remaining: &mut u64,
    ) -> Result<Option<String>, InjectionError>
    where
        K: 'static + Send + Sync + BuildJob + Resource,
    {
        // generated job names may truncate the service name
        let label_selector = format!("{key}={service}", key = consts::LABEL_SERVICE);

        while *remaining > 0 {
            *remaining -= 1;

            let candidates = jobs
                .list(namespace, &label_selector)
                .await
                .map_err(InjectionError::Api)?;
            if let Some(pod) = pick_build_pod(&candidates, stale) {
                return Ok(Some(pod));
            }

            if *remaining > 0 {
                sleep(self.poll_interval).await;
            }
        }
        Ok(None)
    }
}

fn max_attempts(timeout: Duration, interval: Duration) -> u64 {
    let interval = interval.as_millis().max(1);
    let attempts = timeout.as_millis().div_ceil(interval);
    u64::try_from(attempts).unwrap_or(u64::MAX).max(1)
}

fn pick_build_pod<K>(jobs: &[K], stale: &BTreeSet<String>) -> Option<String>
where
    K: BuildJob + Resource,
{
    jobs.iter()
        .filter(|job| job.is_in_progress())
        .filter_map(|job| {
            let pod = job.pod_name()?;
            if stale.contains(pod) {
                None
            } else {
                Some((job.creation_timestamp().map(|time| time.0), pod))
            }
        })
        .max_by_key(|(created, _)| *created)
        .map(|(_, pod)| pod.to_string())
}

/// Packs the file or directory into a tarball at a scratch location.
pub async fn archive(path: &Path) -> Result<NamedTempFile, InjectionError> {
    let source = path.to_path_buf();
    spawn_blocking(move || archive_sync(&source))
        .await
        .map_err(io::Error::other)
        .and_then(|result| result)
        .map_err(|source| InjectionError::Archive {
            path: path.to_path_buf(),
            source,
        })
}

fn archive_sync(src: &Path) -> io::Result<NamedTempFile> {
    let file = ::tempfile::Builder::new()
        .prefix("flock-source-")
        .suffix(".tar")
        .tempfile()?;

    let mut builder = ::tar::Builder::new(file);
    if src.is_dir() {
        append_dir(&mut builder, src, src)?;
    } else {
        let name = src.file_name().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "the source has no file name")
        })?;
        builder.append_path_with_name(src, name)?;
    }

    let mut file = builder.into_inner()?;
    file.flush()?;
    Ok(file)
}

fn append_dir<W>(builder: &mut ::tar::Builder<W>, root: &Path, dir: &Path) -> io::Result<()>
where
    W: Write,
{
    let mut entries = ::std::fs::read_dir(dir)?.collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let path = entry.path();
        let relative = path
            .strip_prefix(root)
            .map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error.to_string()))?;

        if path.is_dir() {
            builder.append_dir(relative, &path)?;
            append_dir(builder, root, &path)?;
        } else if path.is_file() {
            let mut file = File::open(&path)?;
            builder.append_file(relative, &mut file)?;
        }
    }
    Ok(())
}
