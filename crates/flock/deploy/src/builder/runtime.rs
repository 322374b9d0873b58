use std::collections::BTreeMap;

use anyhow::{anyhow, bail, Result};
use flock_api::{build::BuildTemplateCrd, tekton::TaskCrd};
use kube::{Api, Client, ResourceExt};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, instrument, Level};
use url::Url;

use super::RuntimeKind;

/// Finds out what a runtime names, downloading remote ones only once.
pub struct RuntimeCatalog {
    kube: Client,
    http: ::reqwest::Client,
    downloaded: Mutex<BTreeMap<String, RuntimeKind>>,
}

impl RuntimeCatalog {
    pub fn new(kube: Client, http: ::reqwest::Client) -> Self {
        Self {
            kube,
            http,
            downloaded: Mutex::default(),
        }
    }

    #[instrument(level = Level::DEBUG, skip(self), err(Display))]
    pub async fn inspect(&self, namespace: &str, runtime: Option<&str>) -> Result<RuntimeKind> {
        let runtime = match runtime.map(str::trim) {
            Some(runtime) if !runtime.is_empty() => runtime,
            _ => return Ok(RuntimeKind::None),
        };

        if let Ok(url) = Url::parse(runtime) {
            if matches!(url.scheme(), "http" | "https") {
                return self.download(url).await;
            }
        }

        let tasks = Api::<TaskCrd>::namespaced(self.kube.clone(), namespace);
        if tasks.get_opt(runtime).await?.is_some() {
            return Ok(RuntimeKind::Task {
                name: runtime.into(),
                object: None,
            });
        }

        let templates = Api::<BuildTemplateCrd>::namespaced(self.kube.clone(), namespace);
        if templates.get_opt(runtime).await?.is_some() {
            return Ok(RuntimeKind::BuildTemplate {
                name: runtime.into(),
                object: None,
            });
        }

        debug!("runtime {runtime:?} is not registered in {namespace:?}");
        Ok(RuntimeKind::Unknown(runtime.into()))
    }

    async fn download(&self, url: Url) -> Result<RuntimeKind> {
        // held across the download so that concurrent builds fetch it once
        let mut downloaded = self.downloaded.lock().await;
        if let Some(kind) = downloaded.get(url.as_str()) {
            return Ok(kind.clone());
        }

        let text = self
            .http
            .get(url.clone())
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|error| anyhow!("failed to download runtime {url}: {error}"))?
            .text()
            .await
            .map_err(|error| anyhow!("failed to download runtime {url}: {error}"))?;

        let kind = parse_runtime(&text).map_err(|error| anyhow!("invalid runtime {url}: {error}"))?;
        downloaded.insert(url.into(), kind.clone());
        Ok(kind)
    }
}

fn parse_runtime(text: &str) -> Result<RuntimeKind> {
    let value: Value = ::serde_yaml::from_str(text)?;
    match value.get("kind").and_then(Value::as_str) {
        Some("Task") => {
            let object: TaskCrd = ::serde_json::from_value(value)?;
            Ok(RuntimeKind::Task {
                name: object.name_any(),
                object: Some(Box::new(object)),
            })
        }
        Some("BuildTemplate") => {
            let object: BuildTemplateCrd = ::serde_json::from_value(value)?;
            Ok(RuntimeKind::BuildTemplate {
                name: object.name_any(),
                object: Some(Box::new(object)),
            })
        }
        Some(kind) => bail!("unsupported kind: {kind:?}"),
        None => bail!("missing kind"),
    }
}
