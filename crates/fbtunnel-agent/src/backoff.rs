//! Reconnection backoff
//!
//! Delay starts at one second, doubles per consecutive failure, and caps at
//! thirty seconds. A clean close resets it.

use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

/// Reconnection backoff configuration
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

/// Backoff state for the agent's reconnect loop
pub struct ReconnectBackoff {
    config: ReconnectConfig,
    current_delay: Duration,
    attempt: usize,
}

impl ReconnectBackoff {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            current_delay: config.initial_backoff,
            config,
            attempt: 0,
        }
    }

    /// Sleep the current delay, then advance it
    pub async fn wait(&mut self) {
        self.attempt += 1;

        debug!(
            "Waiting {:?} before reconnection attempt {}",
            self.current_delay, self.attempt
        );

        sleep(self.current_delay).await;

        let next_delay =
            Duration::from_secs_f64(self.current_delay.as_secs_f64() * self.config.multiplier);
        self.current_delay = next_delay.min(self.config.max_backoff);
    }

    /// Reset backoff (call after a clean close)
    pub fn reset(&mut self) {
        debug!("Resetting reconnection backoff");
        self.current_delay = self.config.initial_backoff;
        self.attempt = 0;
    }

    /// Get the current delay
    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }

    /// Get the current attempt number
    pub fn attempt(&self) -> usize {
        self.attempt
    }
}
