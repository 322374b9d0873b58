use std::io::{self, Write};

use flock_api::result::DeploymentResult;

/// Receives every outcome of a batch as soon as it is drained.
pub trait Reporter: Send + Sync {
    fn report(&self, result: &DeploymentResult);
}

/// Prints `<name>: <message>` per outcome.
#[derive(Copy, Clone, Debug, Default)]
pub struct StdoutReporter;

impl Reporter for StdoutReporter {
    fn report(&self, result: &DeploymentResult) {
        // a closed pipe is not worth failing the batch over
        write_result(&mut io::stdout().lock(), result).ok();
    }
}

fn write_result(out: &mut impl Write, result: &DeploymentResult) -> io::Result<()> {
    match &result.outcome {
        Ok(message) => writeln!(out, "{name}: {message}", name = &result.name),
        Err(error) => writeln!(out, "{name}: error: {error}", name = &result.name),
    }
}
