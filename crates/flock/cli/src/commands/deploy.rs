use anyhow::Result;
use clap::Parser;
use flock_api::manifest::ResolvedManifest;
use flock_deploy::Operation;

use crate::args::Session;

#[derive(Parser)]
pub(crate) struct Args {
    /// Deploy only these functions
    #[arg(env = "FLOCK_FUNCTIONS", value_delimiter = ',')]
    functions: Vec<String>,

    /// How many functions to deploy at once
    #[arg(long, env = "FLOCK_CONCURRENCY", default_value_t = 3)]
    concurrency: usize,

    /// Wait for every service to become ready
    #[arg(long, env = "FLOCK_WAIT")]
    wait: bool,

    /// Build timeout of functions that do not set one
    #[arg(long, env = "FLOCK_BUILD_TIMEOUT", default_value = "10m")]
    build_timeout: String,
}

impl Args {
    pub(crate) async fn run(self, session: Session) -> Result<()> {
        let (_resolver, mut tree) = super::resolve(&session, &self.functions).await?;
        fill_build_timeout(&mut tree, &self.build_timeout);

        // a partial selection says nothing about the other functions
        let remove_orphans = self.functions.is_empty();

        session
            .coordinator(self.concurrency, self.wait)
            .run_tree(Operation::Deploy, tree, remove_orphans)
            .await
    }
}

fn fill_build_timeout(tree: &mut ResolvedManifest, build_timeout: &str) {
    for spec in &mut tree.specs {
        spec.build_timeout
            .get_or_insert_with(|| build_timeout.into());
    }
    for include in &mut tree.includes {
        fill_build_timeout(include, build_timeout);
    }
}

#[cfg(test)]
mod tests {
    use flock_api::spec::ServiceSpec;

    use super::*;

    #[test]
    fn functions_keep_their_own_timeout() {
        let mut tree = ResolvedManifest {
            specs: vec![ServiceSpec {
                name: "outer-a".into(),
                build_timeout: Some("90s".into()),
                ..Default::default()
            }],
            includes: vec![ResolvedManifest {
                specs: vec![ServiceSpec {
                    name: "outer-inner-b".into(),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        };

        fill_build_timeout(&mut tree, "10m");
        let timeouts: Vec<_> = tree
            .flatten()
            .into_iter()
            .map(|spec| spec.build_timeout)
            .collect();
        assert_eq!(timeouts, [Some("90s".to_string()), Some("10m".to_string())]);
    }
}
