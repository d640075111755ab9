use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::MeterError;
use crate::store::MeterStore;

pub(crate) const SECONDS_PER_DAY: u64 = 86_400;

/// One named budget bucket. `daily_limit: None` means unbudgeted. Monetary
/// features also gate on the credit balance at admission, with
/// `min_balance_micros` as the advisory pre-flight floor.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FeatureConfig {
    pub feature: String,
    #[serde(default)]
    pub daily_limit: Option<u64>,
    #[serde(default)]
    pub monetary: bool,
    #[serde(default = "default_min_balance_micros")]
    pub min_balance_micros: u64,
}

fn default_min_balance_micros() -> u64 {
    1
}

#[derive(Clone, Copy, Debug)]
pub struct BudgetDecision {
    pub consumed: u64,
    pub remaining: Option<u64>,
}

/// UTC epoch day. Keying quotas by day makes the daily reset implicit; no
/// reset job exists to not run.
pub(crate) fn day_key(now_epoch_seconds: u64) -> u64 {
    now_epoch_seconds / SECONDS_PER_DAY
}

/// Per-(subject, feature, day) quota tracker. Admission is optimistic:
/// a call is admitted while at least one unit of quota is left, because the
/// exact quantity (token counts) is only known after the upstream call
/// returns. Consumption is reconciled post-hoc through the usage recorder.
pub struct BudgetTracker {
    store: Arc<dyn MeterStore>,
}

impl BudgetTracker {
    pub fn new(store: Arc<dyn MeterStore>) -> Self {
        Self { store }
    }

    pub async fn check_and_reserve(
        &self,
        subject: &str,
        config: &FeatureConfig,
        now_epoch_seconds: u64,
    ) -> Result<BudgetDecision, MeterError> {
        let Some(limit) = config.daily_limit else {
            return Ok(BudgetDecision {
                consumed: 0,
                remaining: None,
            });
        };

        let consumed = self
            .store
            .quota_consumed(subject, &config.feature, day_key(now_epoch_seconds))
            .await?;

        if consumed >= limit {
            return Err(MeterError::BudgetExceeded { limit, consumed });
        }

        Ok(BudgetDecision {
            consumed,
            remaining: Some(limit - consumed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn day_key_rolls_at_utc_midnight() {
        assert_eq!(day_key(0), 0);
        assert_eq!(day_key(SECONDS_PER_DAY - 1), 0);
        assert_eq!(day_key(SECONDS_PER_DAY), 1);
    }
}
