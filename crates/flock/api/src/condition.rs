use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default)]
    pub status: ConditionStatus,
    #[serde(default)]
    pub severity: ConditionSeverity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

impl Condition {
    pub const TYPE_READY: &'static str = "Ready";
    pub const TYPE_SUCCEEDED: &'static str = "Succeeded";

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }

    /// Whether this condition reports a failure the resource cannot
    /// recover from by itself.
    pub fn is_fatal(&self) -> bool {
        self.severity == ConditionSeverity::Error && self.status == ConditionStatus::False
    }

    pub fn message(&self) -> &str {
        self.message
            .as_deref()
            .or(self.reason.as_deref())
            .unwrap_or("unknown error")
    }
}

#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    Display,
    EnumString,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

/// Knative leaves the severity empty for errors.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    Display,
    EnumString,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
)]
pub enum ConditionSeverity {
    #[default]
    #[serde(rename = "", alias = "Error")]
    #[strum(serialize = "Error")]
    Error,
    Warning,
    Info,
}

pub fn find<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions
        .iter()
        .find(|condition| condition.type_ == type_)
}
