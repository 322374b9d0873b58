use std::path::PathBuf;

use anyhow::{anyhow, Result};
use flock_api::{
    consts,
    spec::{ServiceSpec, SourceRef},
    tekton::Step,
};
use k8s_openapi::api::core::v1::Container;
use tempfile::TempDir;
use tokio::fs;
use tracing::{debug, instrument, Level};
use url::Url;

const SOURCE_IMAGE: &str = "docker.io/library/busybox:stable";
const GIT_IMAGE: &str = "docker.io/alpine/git:latest";

/// The source of a build, made available on this machine if it was not already.
pub(super) enum BuildSource {
    Local {
        path: PathBuf,
        /// Keeps downloaded sources alive until they are uploaded.
        _scratch: Option<TempDir>,
    },
    Git {
        url: String,
        revision: Option<String>,
    },
}

impl BuildSource {
    pub(super) async fn prepare(http: &::reqwest::Client, spec: &ServiceSpec) -> Result<Self> {
        match &spec.source {
            SourceRef::Local(path) => Ok(Self::Local {
                path: path.clone(),
                _scratch: None,
            }),
            SourceRef::Git { url } => Ok(Self::Git {
                url: url.clone(),
                revision: spec.revision.clone(),
            }),
            SourceRef::Url(url) => download(http, url).await,
            SourceRef::Image(image) => Err(anyhow!("nothing to build from image {image:?}")),
        }
    }

    pub(super) fn local_path(&self) -> Option<&PathBuf> {
        match self {
            Self::Local { path, .. } => Some(path),
            Self::Git { .. } => None,
        }
    }
}

#[instrument(level = Level::INFO, skip(http), fields(url = %url), err(Display))]
async fn download(http: &::reqwest::Client, url: &Url) -> Result<BuildSource> {
    let body = http
        .get(url.clone())
        .send()
        .await
        .and_then(|response| response.error_for_status())
        .map_err(|error| anyhow!("failed to download the source: {error}"))?
        .bytes()
        .await
        .map_err(|error| anyhow!("failed to download the source: {error}"))?;

    let file_name = url
        .path_segments()
        .and_then(|segments| segments.filter(|segment| !segment.is_empty()).last())
        .unwrap_or("source")
        .to_string();

    let scratch = ::tempfile::Builder::new()
        .prefix("flock-source-")
        .tempdir()?;
    let path = scratch.path().join(file_name);
    fs::write(&path, &body).await?;
    debug!("downloaded {len} bytes into {path:?}", len = body.len());

    Ok(BuildSource::Local {
        path,
        _scratch: Some(scratch),
    })
}

/// Blocks the build until the uploader drops the sentinel.
fn wait_for_upload_script() -> String {
    format!(
        "set -e\nmkdir -p {dir}\nwhile [ ! -f {sentinel} ]; do sleep 1; done\n",
        dir = consts::SOURCE_DIR,
        sentinel = consts::SOURCE_SENTINEL,
    )
}

/// Quotes a single shell word so that `sh` takes it literally.
fn shell_quote(word: &str) -> String {
    format!("'{}'", word.replace('\'', r"'\''"))
}

fn git_clone_script(url: &str, revision: Option<&str>) -> String {
    let branch = revision
        .map(|revision| format!(" --branch {}", shell_quote(revision)))
        .unwrap_or_default();
    format!(
        "set -e\ngit clone --depth 1{branch} -- {url} {dir}\n",
        url = shell_quote(url),
        dir = consts::SOURCE_DIR,
    )
}

pub(super) fn task_source_step(source: &BuildSource) -> Step {
    match source {
        BuildSource::Local { .. } => Step {
            name: consts::CUSTOM_SOURCE_STEP.into(),
            image: Some(SOURCE_IMAGE.into()),
            script: Some(wait_for_upload_script()),
            working_dir: Some(consts::SOURCE_DIR.into()),
            ..Default::default()
        },
        BuildSource::Git { url, revision } => Step {
            name: consts::GIT_SOURCE_STEP.into(),
            image: Some(GIT_IMAGE.into()),
            script: Some(git_clone_script(url, revision.as_deref())),
            ..Default::default()
        },
    }
}

/// Only local sources need a custom step; builds clone git by themselves.
pub(super) fn build_custom_source(source: &BuildSource) -> Option<Container> {
    match source {
        BuildSource::Local { .. } => Some(Container {
            name: consts::CUSTOM_SOURCE_STEP.into(),
            image: Some(SOURCE_IMAGE.into()),
            command: Some(vec!["/bin/sh".into(), "-c".into()]),
            args: Some(vec![wait_for_upload_script()]),
            working_dir: Some(consts::SOURCE_DIR.into()),
            ..Default::default()
        }),
        BuildSource::Git { .. } => None,
    }
}
