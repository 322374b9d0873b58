//! The manifest file as written by users.

use std::collections::BTreeMap;

use flock_api::spec::Schedule;
use flock_core_k8s::data::ImagePullPolicy;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use tracing::warn;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Manifest {
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub provider: Provider,
    #[serde(default)]
    pub functions: BTreeMap<String, Function>,
    #[serde(default)]
    pub include: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Provider {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub registry: Option<String>,
    #[serde(default)]
    pub registry_secret: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub runtime: Option<String>,
    #[serde(default)]
    pub pull_policy: Option<ImagePullPolicy>,
    #[serde(default)]
    pub buildtimeout: Option<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub env_secrets: Vec<String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Function {
    #[serde(default, alias = "handler")]
    pub source: Option<String>,
    #[serde(default)]
    pub runtime: Option<String>,
    #[serde(default)]
    pub revision: Option<String>,
    #[serde(default)]
    pub buildargs: Vec<String>,
    #[serde(default)]
    pub buildtimeout: Option<String>,
    #[serde(default)]
    pub pull_policy: Option<ImagePullPolicy>,
    /// `key:value` pairs.
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub env_secrets: Vec<String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub concurrency: Option<i64>,
    #[serde(default)]
    pub events: Vec<BTreeMap<String, Value>>,
}

impl Function {
    pub fn labels(&self) -> BTreeMap<String, String> {
        self.labels
            .iter()
            .filter_map(|label| match label.split_once(':') {
                Some((key, value)) if !key.trim().is_empty() => {
                    Some((key.trim().into(), value.trim().into()))
                }
                _ => {
                    warn!("skipping malformed label: {label:?}");
                    None
                }
            })
            .collect()
    }

    /// Schedules declared among the events; malformed ones are skipped.
    pub fn schedules(&self, trigger: &str) -> Vec<Schedule> {
        self.events
            .iter()
            .filter_map(|event| event.get(trigger))
            .filter_map(
                |body| match ::serde_yaml::from_value::<ScheduleEvent>(body.clone()) {
                    Ok(ScheduleEvent { cron, json_data }) if !cron.trim().is_empty() => {
                        Some(Schedule {
                            cron: cron.trim().into(),
                            json_data,
                        })
                    }
                    Ok(_) => {
                        warn!("skipping schedule without cron");
                        None
                    }
                    Err(error) => {
                        warn!("skipping malformed schedule: {error}");
                        None
                    }
                },
            )
            .collect()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
struct ScheduleEvent {
    #[serde(default)]
    cron: String,
    #[serde(default, rename = "jsonData", alias = "json-data")]
    json_data: Option<String>,
}
