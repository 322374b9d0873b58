use crate::error::DeployError;

/// The outcome of deploying (or deleting) one function.
#[derive(Debug)]
pub struct DeploymentResult {
    pub name: String,
    pub outcome: Result<String, DeployError>,
}

impl DeploymentResult {
    pub fn ok(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            outcome: Ok(message.into()),
        }
    }

    pub fn err(name: impl Into<String>, error: impl Into<DeployError>) -> Self {
        Self {
            name: name.into(),
            outcome: Err(error.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }
}
