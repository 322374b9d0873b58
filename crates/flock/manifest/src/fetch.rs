use std::{
    path::{Path, PathBuf},
    process::Stdio,
};

use flock_api::spec::SourceRef;
use tempfile::TempDir;
use tokio::{fs, process::Command};
use tracing::{debug, instrument, Level};
use url::Url;

use crate::error::ManifestError;

pub(crate) const MANIFEST_FILE: &str = "serverless.yaml";

/// Where an included manifest lives on this machine.
pub(crate) struct Fetched {
    pub(crate) path: PathBuf,
    /// Keeps a downloaded manifest (and its sources) alive.
    pub(crate) scratch: Option<TempDir>,
}

pub(crate) async fn fetch_include(
    client: &::reqwest::Client,
    reference: &str,
    base_dir: &Path,
) -> Result<Fetched, ManifestError> {
    match SourceRef::classify(reference, base_dir) {
        SourceRef::Local(path) => Ok(Fetched {
            path: if path.is_dir() {
                path.join(MANIFEST_FILE)
            } else {
                path
            },
            scratch: None,
        }),
        SourceRef::Git { url } => clone(reference, &url).await,
        SourceRef::Url(url) => download(client, reference, url).await,
        SourceRef::Image(_) => Err(ManifestError::Read {
            path: base_dir.join(reference),
            source: ::std::io::ErrorKind::NotFound.into(),
        }),
    }
}

/// Identifies a remote include before it is fetched; local includes are
/// identified by their canonical path instead.
pub(crate) fn remote_key(reference: &str, base_dir: &Path) -> Option<String> {
    match SourceRef::classify(reference, base_dir) {
        SourceRef::Git { url } => Some(url),
        SourceRef::Url(url) => Some(url.into()),
        SourceRef::Local(_) | SourceRef::Image(_) => None,
    }
}

fn scratch(reference: &str) -> Result<TempDir, ManifestError> {
    ::tempfile::Builder::new()
        .prefix("flock-include-")
        .tempdir()
        .map_err(|error| ManifestError::Fetch {
            reference: reference.into(),
            reason: format!("failed to create a scratch directory: {error}"),
        })
}

#[instrument(level = Level::INFO, skip(reference), err(Display))]
async fn clone(reference: &str, url: &str) -> Result<Fetched, ManifestError> {
    let dir = scratch(reference)?;

    let output = Command::new("git")
        .arg("clone")
        .arg("--depth")
        .arg("1")
        .arg(url)
        .arg(dir.path())
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|error| ManifestError::Fetch {
            reference: reference.into(),
            reason: format!("failed to run git: {error}"),
        })?;

    if !output.status.success() {
        return Err(ManifestError::Fetch {
            reference: reference.into(),
            reason: String::from_utf8_lossy(&output.stderr).trim().into(),
        });
    }

    debug!("cloned {url} into {:?}", dir.path());
    Ok(Fetched {
        path: dir.path().join(MANIFEST_FILE),
        scratch: Some(dir),
    })
}

#[instrument(level = Level::INFO, skip(client, reference, url), fields(url = %url), err(Display))]
async fn download(
    client: &::reqwest::Client,
    reference: &str,
    url: Url,
) -> Result<Fetched, ManifestError> {
    let fetch_error = |reason: String| ManifestError::Fetch {
        reference: reference.into(),
        reason,
    };

    let body = client
        .get(url)
        .send()
        .await
        .and_then(|response| response.error_for_status())
        .map_err(|error| fetch_error(error.to_string()))?
        .bytes()
        .await
        .map_err(|error| fetch_error(error.to_string()))?;

    let dir = scratch(reference)?;
    let path = dir.path().join(MANIFEST_FILE);
    fs::write(&path, &body)
        .await
        .map_err(|error| fetch_error(format!("failed to store the manifest: {error}")))?;

    Ok(Fetched {
        path,
        scratch: Some(dir),
    })
}
