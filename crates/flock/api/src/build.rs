//! Knative Build, the deprecated predecessor of Tekton.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Container;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::condition::{self, Condition, ConditionStatus};

/// A remote resource that turns sources into an image inside one pod.
pub trait BuildJob {
    /// How the pod names the container that runs a build step.
    const CONTAINER_PREFIX: &'static str;

    fn conditions(&self) -> &[Condition];

    fn pod_name(&self) -> Option<&str>;

    fn succeeded(&self) -> Option<&Condition> {
        condition::find(self.conditions(), Condition::TYPE_SUCCEEDED)
    }

    fn is_in_progress(&self) -> bool {
        self.succeeded()
            .map(|condition| condition.status == ConditionStatus::Unknown)
            .unwrap_or(true)
    }

    fn container_name(step: &str) -> String {
        format!("{prefix}{step}", prefix = Self::CONTAINER_PREFIX)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema, CustomResource)]
#[kube(
    group = "build.knative.dev",
    version = "v1alpha1",
    kind = "Build",
    root = "BuildCrd",
    status = "BuildStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct BuildSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<TemplateInstantiationSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SourceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitSourceSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<Container>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GitSourceSpec {
    pub url: String,
    pub revision: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TemplateInstantiationSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<ArgumentSpec>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ArgumentSpec {
    pub name: String,
    pub value: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BuildStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<ClusterSpec>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_name: Option<String>,
}

impl BuildJob for BuildCrd {
    const CONTAINER_PREFIX: &'static str = "build-step-";

    fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|status| status.conditions.as_slice())
            .unwrap_or_default()
    }

    fn pod_name(&self) -> Option<&str> {
        self.status.as_ref()?.cluster.as_ref()?.pod_name.as_deref()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema, CustomResource)]
#[kube(
    group = "build.knative.dev",
    version = "v1alpha1",
    kind = "BuildTemplate",
    derive = "PartialEq",
    root = "BuildTemplateCrd",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct BuildTemplateSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<ParameterSpec>,
    #[serde(default)]
    pub steps: Vec<Container>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl BuildTemplateSpec {
    pub fn has_parameter(&self, name: &str) -> bool {
        self.parameters.iter().any(|param| param.name == name)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ParameterSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_without_status_is_in_progress() {
        let build = BuildCrd::new("foo-abcde", BuildSpec::default());
        assert!(build.is_in_progress());
        assert_eq!(build.pod_name(), None);
        assert_eq!(BuildCrd::container_name("custom-source"), "build-step-custom-source");
    }

    #[test]
    fn finished_build_is_not_in_progress() {
        let mut build = BuildCrd::new("foo-abcde", BuildSpec::default());
        build.status = Some(BuildStatus {
            conditions: vec![Condition {
                type_: Condition::TYPE_SUCCEEDED.into(),
                status: ConditionStatus::True,
                ..Default::default()
            }],
            cluster: Some(ClusterSpec {
                namespace: None,
                pod_name: Some("foo-abcde-pod".into()),
            }),
        });

        assert!(!build.is_in_progress());
        assert_eq!(build.pod_name(), Some("foo-abcde-pod"));
    }
}
