mod delete;
mod deploy;

use anyhow::Result;
use clap::Subcommand;
use flock_api::manifest::ResolvedManifest;
use flock_manifest::ManifestResolver;
use tracing::info;

use crate::args::Session;

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Build and deploy the functions of a manifest
    Deploy(self::deploy::Args),
    /// Remove the functions of a manifest
    Delete(self::delete::Args),
}

impl Command {
    pub(crate) async fn run(self, session: Session) -> Result<()> {
        match self {
            Self::Deploy(command) => command.run(session).await,
            Self::Delete(command) => command.run(session).await,
        }
    }
}

/// Resolves the manifest tree; the resolver owns fetched includes and
/// has to outlive the batch.
async fn resolve(
    session: &Session,
    functions: &[String],
) -> Result<(ManifestResolver, ResolvedManifest)> {
    let resolver = ManifestResolver::new(session.resolver.clone());
    let tree = resolver.resolve_tree(&session.manifest, functions).await?;
    info!(
        "resolved {count} function(s) from {manifest:?}",
        count = tree.len(),
        manifest = &session.manifest,
    );
    Ok((resolver, tree))
}
