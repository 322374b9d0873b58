use anyhow::Result;
use async_trait::async_trait;
use flock_api::spec::ServiceSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

use super::{BuildJobRef, BuildOutput, Builder};

/// Runs the source as an image; also stands in for every build in dry runs.
#[derive(Copy, Clone, Debug, Default)]
pub struct PrebuiltBuilder;

#[async_trait]
impl Builder for PrebuiltBuilder {
    fn strategy(&self) -> &'static str {
        "pre-built image"
    }

    async fn deploy(&self, spec: &ServiceSpec) -> Result<BuildOutput> {
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
