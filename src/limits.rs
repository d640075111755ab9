use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::MeterError;
use crate::store::MeterStore;

/// One named rate-limit bucket: `limit` admissions per `window_secs` fixed
/// window, per subject.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActionLimitConfig {
    pub action: String,
    pub limit: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

fn default_window_secs() -> u64 {
    60
}

#[derive(Clone, Copy, Debug)]
pub struct RateDecision {
    pub count: u32,
    pub limit: u32,
}

impl RateDecision {
    pub fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.count)
    }
}

pub(crate) fn window_bucket(now_epoch_seconds: u64, window_secs: u64) -> u64 {
    now_epoch_seconds / window_secs.max(1)
}

pub(crate) fn retry_after_secs(now_epoch_seconds: u64, window_secs: u64) -> u64 {
    let window = window_secs.max(1);
    window - (now_epoch_seconds % window)
}

/// Fixed-window counter per (subject, action). A burst straddling two
/// windows can admit up to `2 * limit` requests; acceptable for abuse
/// prevention, not for exact shaping.
pub struct RateLimiter {
    store: Arc<dyn MeterStore>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn MeterStore>) -> Self {
        Self { store }
    }

    pub async fn allow(
        &self,
        subject: &str,
        config: &ActionLimitConfig,
        now_epoch_seconds: u64,
    ) -> Result<RateDecision, MeterError> {
        let slot = self
            .store
            .try_increment_window(
                subject,
                &config.action,
                config.limit,
                config.window_secs,
                now_epoch_seconds,
            )
            .await?;

        if !slot.admitted {
            return Err(MeterError::RateLimited {
                retry_after_secs: retry_after_secs(now_epoch_seconds, config.window_secs),
            });
        }

        Ok(RateDecision {
            count: slot.count,
            limit: config.limit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buckets_are_window_aligned() {
        assert_eq!(window_bucket(0, 60), 0);
        assert_eq!(window_bucket(59, 60), 0);
        assert_eq!(window_bucket(60, 60), 1);
        assert_eq!(window_bucket(1_000, 0), 1_000);
    }

    #[test]
    fn retry_after_reaches_window_end() {
        assert_eq!(retry_after_secs(0, 60), 60);
        assert_eq!(retry_after_secs(59, 60), 1);
        assert_eq!(retry_after_secs(61, 60), 59);
    }
}
