use anyhow::Result;
use clap::Parser;
use flock_deploy::Operation;

use crate::args::Session;

#[derive(Parser)]
pub(crate) struct Args {
    /// Remove only these functions
    #[arg(env = "FLOCK_FUNCTIONS", value_delimiter = ',')]
    functions: Vec<String>,

    /// How many functions to remove at once
    #[arg(long, env = "FLOCK_CONCURRENCY", default_value_t = 3)]
    concurrency: usize,
}

impl Args {
    pub(crate) async fn run(self, session: Session) -> Result<()> {
        let (_resolver, tree) = super::resolve(&session, &self.functions).await?;

        session
            .coordinator(self.concurrency, false)
            .run_tree(Operation::Delete, tree, false)
            .await
    }
}
