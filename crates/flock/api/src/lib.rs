pub mod build;
pub mod condition;
pub mod error;
pub mod knative;
pub mod manifest;
pub mod result;
pub mod spec;
pub mod tekton;

pub mod consts {
    pub const FIELD_MANAGER: &str = "flock";

    pub const LABEL_FUNCTION: &str = "flock.ulagbulag.io/function";
    pub const LABEL_PARENT: &str = "flock.ulagbulag.io/parent";
    pub const LABEL_SERVICE: &str = "flock.ulagbulag.io/service";

    pub const ANNOTATION_BUILD: &str = "flock.ulagbulag.io/build";

    pub const DEFAULT_REGISTRY: &str = "knative.registry.svc.cluster.local";

    /// The build step that waits for uploaded sources.
    pub const CUSTOM_SOURCE_STEP: &str = "custom-source";
    pub const GIT_SOURCE_STEP: &str = "git-source";
    pub const SOURCE_DIR: &str = "/workspace/source";
    pub const SOURCE_SENTINEL: &str = "/workspace/.source-uploaded";

    pub const SCHEDULE_EVENT: &str = "schedule";
}
