use std::{collections::BTreeSet, sync::Arc};

use flock_api::{consts, error::DeployError, knative::KnativeServiceCrd, result::DeploymentResult};
use flock_core_k8s::store::{is_not_found, ResourceStore};
use kube::ResourceExt;
use tracing::{info, instrument, warn, Level};

/// Removes services a manifest no longer describes.
#[derive(Clone)]
pub struct OrphanReaper {
    services: Arc<dyn ResourceStore<KnativeServiceCrd>>,
}

impl OrphanReaper {
    pub fn new(services: Arc<dyn ResourceStore<KnativeServiceCrd>>) -> Self {
        Self { services }
    }

    /// Deletes every service labelled with `parent` that is not in `keep`,
    /// with one outcome per orphan.
    ///
    /// A failed deletion only fails that orphan; the remaining ones are
    /// still deleted. Only failing to list the services is an error.
    #[instrument(level = Level::INFO, skip(self, keep), err(Display))]
    pub async fn reap(
        &self,
        namespace: &str,
        parent: &str,
        keep: &[String],
    ) -> Result<Vec<DeploymentResult>, DeployError> {
        let selector = format!("{}={parent}", consts::LABEL_PARENT);
        let existing = self
            .services
            .list(namespace, &selector)
            .await
            .map_err(|error| DeployError::Reaper(vec![format!("{parent}: {error}")]))?;

        let keep: BTreeSet<_> = keep.iter().map(String::as_str).collect();
        let orphans: Vec<_> = existing
            .iter()
            .map(|service| service.name_any())
            .filter(|name| !keep.contains(name.as_str()))
            .collect();

        let mut outcomes = Vec::with_capacity(orphans.len());
        for name in orphans {
            match self.services.delete(namespace, &name).await {
                Ok(()) => {
                    info!("removed orphaned service {namespace}/{name}");
                    outcomes.push(DeploymentResult::ok(name, "Orphaned service removed"));
                }
                Err(error) if is_not_found(&error) => continue,
                Err(error) => {
                    warn!("failed to remove orphaned service {namespace}/{name}: {error}");
                    let reason = format!("{name}: {error}");
                    outcomes.push(DeploymentResult::err(name, DeployError::Reaper(vec![reason])));
                }
            }
        }
        Ok(outcomes)
    }
}
