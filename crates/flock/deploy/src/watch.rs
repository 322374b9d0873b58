use std::{sync::Arc, time::Duration};

use flock_api::{error::ReadinessError, knative::KnativeServiceCrd};
use flock_core_k8s::store::ResourceStore;
use futures::StreamExt;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, instrument, warn, Level};

#[derive(Clone, Debug, PartialEq, Eq)]
enum WatchState {
    Watching,
    Reconnecting,
    Ready(String),
    Failed(String),
}

/// Blocks until a service is ready, fails for good, or runs out of time.
#[derive(Clone)]
pub struct ReadinessWatcher {
    services: Arc<dyn ResourceStore<KnativeServiceCrd>>,
    settle_delay: Duration,
}

impl ReadinessWatcher {
    pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(1);

    pub fn new(services: Arc<dyn ResourceStore<KnativeServiceCrd>>) -> Self {
        Self {
            services,
            settle_delay: Self::DEFAULT_SETTLE_DELAY,
        }
    }

    pub fn with_settle_delay(mut self, settle_delay: Duration) -> Self {
        self.settle_delay = settle_delay;
        self
    }

    /// Returns the address the service is reachable at.
    #[instrument(level = Level::INFO, skip(self, deadline), err(Display))]
    pub async fn wait(
        &self,
        namespace: &str,
        name: &str,
        deadline: Duration,
    ) -> Result<String, ReadinessError> {
        timeout(deadline, self.watch(namespace, name))
            .await
            .unwrap_or_else(|_| Err(ReadinessError::TimedOut { name: name.into() }))
    }

    async fn watch(&self, namespace: &str, name: &str) -> Result<String, ReadinessError> {
        let mut errors = 0usize;
        let mut state = WatchState::Watching;

        loop {
            state = match state {
                WatchState::Watching => self.next_state(namespace, name, &mut errors).await,
                WatchState::Reconnecting => {
                    debug!("reopening the watch on {namespace}/{name}");
                    WatchState::Watching
                }
                WatchState::Ready(url) => {
                    info!("{namespace}/{name} is ready at {url}");
                    return Ok(url);
                }
                WatchState::Failed(message) => {
                    return Err(ReadinessError::Failed {
                        name: name.into(),
                        message,
                    })
                }
            };
        }
    }

    /// Consumes one subscription until it yields a verdict or goes away.
    async fn next_state(&self, namespace: &str, name: &str, errors: &mut usize) -> WatchState {
        let mut events = match self.services.watch(namespace, name).await {
            Ok(events) => events,
            Err(error) => {
                warn!("failed to watch {namespace}/{name}: {error}");
                sleep(self.settle_delay).await;
                return WatchState::Reconnecting;
            }
        };

        while let Some(event) = events.next().await {
            let service = match event {
                Ok(service) => service,
                Err(error) => {
                    debug!("watch on {namespace}/{name} broke: {error}");
                    sleep(self.settle_delay).await;
                    return WatchState::Reconnecting;
                }
            };

            if service.is_ready() {
                return WatchState::Ready(service.url().unwrap_or_default().into());
            }

            if let Some(condition) = service.fatal_condition() {
                *errors += 1;
                if *errors > 1 {
                    return WatchState::Failed(condition.message().into());
                }

                // the revision may be recreated right after the first failure
                warn!(
                    "{namespace}/{name} reported {type_}: {message}; checking again",
                    type_ = &condition.type_,
                    message = condition.message(),
                );
                sleep(self.settle_delay).await;
                return WatchState::Reconnecting;
            }
        }

        // the stream closed without a verdict
        WatchState::Reconnecting
    }
}
