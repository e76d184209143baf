//! Dependent restart trigger.
//!
//! Restarts are serialized per service: a second restart for the same
//! Deployment waits for the first one (including its retries) to finish, so
//! rapid dataset switches queue up instead of racing.

use crate::config::RestartConfig;
use crate::error::{Error, Result};
use crate::platform::{bounded, Platform};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

pub struct RestartTrigger {
    platform: Arc<dyn Platform>,
    policy: RestartConfig,
    call_timeout: Duration,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RestartTrigger {
    pub fn new(platform: Arc<dyn Platform>, policy: RestartConfig, call_timeout: Duration) -> Self {
        Self {
            platform,
            policy,
            call_timeout,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Delay before retry number `attempt` (1-based): doubles from the initial backoff up to the cap.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let millis = self
            .policy
            .initial_backoff_millis
            .saturating_mul(1_u64 << exponent)
            .min(self.policy.max_backoff_millis);
        Duration::from_millis(millis)
    }

    async fn service_lock(&self, service: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(service.to_string()).or_default())
    }

    /// Roll `service`, retrying with exponential backoff. Returns the attempts used.
    #[instrument(skip(self), fields(max_attempts = self.policy.max_attempts))]
    pub async fn restart(&self, service: &str, task: &str) -> Result<u32> {
        let lock = self.service_lock(service).await;
        let _guard = lock.lock().await;

        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            let call = self.platform.trigger_restart(service, task);
            match bounded("trigger restart", self.call_timeout, call).await {
                Ok(()) => {
                    info!(%service, %task, attempt, "Dependent service restart triggered");
                    return Ok(attempt);
                }
                Err(e) => {
                    last_error = e.to_string();
                    if attempt < max_attempts {
                        let delay = self.backoff(attempt);
                        warn!(
                            %service, %task, attempt, ?delay, error = %e,
                            "Restart attempt failed, backing off"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(Error::RestartTrigger {
            service: service.to_string(),
            attempts: max_attempts,
            message: last_error,
        })
    }
}
