use std::path::PathBuf;

use thiserror::Error;

/// Why one function could not be deployed.
///
/// Each variant is scoped to a single function; siblings keep going.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("failed to build: {0}")]
    Build(#[source] ::anyhow::Error),

    #[error(transparent)]
    Injection(#[from] InjectionError),

    #[error(transparent)]
    Readiness(#[from] ReadinessError),

    #[error("failed to apply {kind} {name:?}: {source}")]
    Apply {
        kind: &'static str,
        name: String,
        #[source]
        source: ::kube::Error,
    },

    #[error("failed to remove orphaned services: {}", .0.join(", "))]
    Reaper(Vec<String>),
}

#[derive(Debug, Error)]
pub enum InjectionError {
    #[error("failed to archive {path:?}: {source}")]
    Archive {
        path: PathBuf,
        #[source]
        source: ::std::io::Error,
    },

    #[error("no build pod of {service:?} showed up after {attempts} attempts")]
    PodNotFound { service: String, attempts: u64 },

    #[error("failed to watch the build pod {pod:?}: {source}")]
    Watch {
        pod: String,
        #[source]
        source: ::kube::Error,
    },

    #[error("failed to execute {command:?} on the build pod {pod:?}: {message}")]
    Exec {
        pod: String,
        command: String,
        message: String,
    },

    #[error("failed to look up build jobs: {0}")]
    Api(#[source] ::kube::Error),
}

#[derive(Debug, Error)]
pub enum ReadinessError {
    #[error("timed out waiting for {name:?} to become ready")]
    TimedOut { name: String },

    /// Carries the remote condition message verbatim.
    #[error("{message}")]
    Failed { name: String, message: String },
}
