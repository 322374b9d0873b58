use std::path::PathBuf;

use thiserror::Error;

/// A manifest that cannot be turned into functions; nothing is deployed.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest {path:?} does not name its service")]
    MissingService { path: PathBuf },

    #[error("function {function:?} of {service:?} has no source")]
    MissingSource { service: String, function: String },

    #[error("invalid service name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },

    #[error("failed to read manifest {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: ::std::io::Error,
    },

    #[error("failed to parse manifest {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: ::serde_yaml::Error,
    },

    #[error("failed to fetch include {reference:?}: {reason}")]
    Fetch { reference: String, reason: String },

    #[error("include cycle: {}", .chain.join(" -> "))]
    IncludeCycle { chain: Vec<String> },
}
