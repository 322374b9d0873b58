mod args;
mod commands;

use anyhow::Result;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let result = self::args::Args::parse().run().await;
    ::flock_core::tracer::shutdown();
    result
}
