//! Process-wide login rate limiting.
//!
//! Two gates sit in front of every log-on:
//!
//! - the **spacing** gate admits one attempt start at a time and is handed
//!   back only after the configured delay, whether or not the attempt has
//!   finished;
//! - the **cooldown** gate is normally free. A controller that was told to
//!   back off holds it for the whole cooldown, which stalls every other
//!   controller's next attempt as well.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time::{sleep, timeout};
use tracing::{debug, trace};

/// How long a controller backs off after the service reports rate limiting.
pub const LOGIN_COOLDOWN: Duration = Duration::from_secs(25 * 60);

/// Login gates shared by every controller in the process.
#[derive(Debug)]
pub struct LoginLimiter {
    delay: Duration,
    spacing: Arc<Semaphore>,
    cooldown: Arc<Semaphore>,
}

impl LoginLimiter {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            spacing: Arc::new(Semaphore::new(1)),
            cooldown: Arc::new(Semaphore::new(1)),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Waits until a new login attempt may start.
    pub async fn limit_login(&self) {
        if self.delay.is_zero() {
            self.wait_for_cooldown().await;
            return;
        }

        // Neither semaphore is ever closed.
        let Ok(spacing) = self.spacing.clone().acquire_owned().await else {
            return;
        };
        self.wait_for_cooldown().await;

        let delay = self.delay;
        tokio::spawn(async move {
            sleep(delay).await;
            drop(spacing);
        });

        trace!(delay_secs = delay.as_secs(), "Login attempt admitted");
    }

    async fn wait_for_cooldown(&self) {
        let _cooldown = self.cooldown.acquire().await;
    }

    /// Holds the cooldown gate for `duration`, blocking every login start.
    ///
    /// Gives up without holding anything when the gate cannot be taken within
    /// `wait`, which means another controller is already cooling down.
    pub async fn hold_cooldown(&self, duration: Duration, wait: Duration) -> bool {
        let Ok(Ok(permit)) = timeout(wait, self.cooldown.acquire()).await else {
            debug!("Login cooldown already in progress");
            return false;
        };

        debug!(secs = duration.as_secs(), "Holding login cooldown");
        sleep(duration).await;
        drop(permit);
        true
    }
}
