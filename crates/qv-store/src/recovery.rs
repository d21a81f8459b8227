//! Crash recovery for stuck outbox entries.
//!
//! A background task that periodically returns entries stuck in
//! `Processing` longer than the visibility timeout to `Pending`, making
//! them re-eligible for claiming. This covers both process crashes and
//! workers that died mid-dispatch.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::storage::OutboxStorage;

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// How often to scan for stuck entries.
    pub check_interval: Duration,
    /// How long an entry may stay in `Processing` before it is considered
    /// stuck.
    pub stuck_timeout: Duration,
    pub enabled: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(60),
            stuck_timeout: Duration::from_secs(300),
            enabled: true,
        }
    }
}

pub struct OutboxRecoveryTask {
    storage: Arc<dyn OutboxStorage>,
    config: RecoveryConfig,
}

impl OutboxRecoveryTask {
    pub fn new(storage: Arc<dyn OutboxStorage>, config: RecoveryConfig) -> Self {
        Self { storage, config }
    }

    /// Run until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        if !self.config.enabled {
            info!("outbox recovery task is disabled");
            return;
        }

        info!(
            check_interval_secs = self.config.check_interval.as_secs(),
            stuck_timeout_secs = self.config.stuck_timeout.as_secs(),
            "outbox recovery task starting"
        );

        let mut ticker = interval(self.config.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.cancelled() => break,
            }
            self.recover_once().await;
        }
    }

    /// Single recovery sweep.
    pub async fn recover_once(&self) {
        debug!("scanning for stuck outbox entries");
        match self
            .storage
            .release_expired_claims(self.config.stuck_timeout)
            .await
        {
            Ok(released) => {
                if released > 0 {
                    info!(released, "recovered stuck outbox entries");
                }
            }
            Err(recover_error) => {
                error!(%recover_error, "outbox recovery sweep failed");
            }
        }
    }
}
