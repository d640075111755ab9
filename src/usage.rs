use std::sync::Arc;

use crate::error::MeterError;
use crate::store::{MeterStore, NewUsage, UsageRow};

/// Append-only usage audit trail. Appending a row also bumps the matching
/// (subject, feature, day) quota, so budget consumption is the running
/// aggregate of recorded usage.
pub struct UsageRecorder {
    store: Arc<dyn MeterStore>,
}

impl UsageRecorder {
    pub fn new(store: Arc<dyn MeterStore>) -> Self {
        Self { store }
    }

    /// Durable before returning. Consumers tolerate rare duplicates;
    /// callers wanting dedupe should carry an idempotency key in `metadata`.
    pub async fn record(
        &self,
        subject: &str,
        feature: &str,
        quantity: u64,
        cost_micros: u64,
        metadata: serde_json::Value,
        now_epoch_millis: u64,
    ) -> Result<UsageRow, MeterError> {
        Ok(self
            .store
            .append_usage(NewUsage {
                subject,
                feature,
                quantity,
                cost_micros,
                metadata,
                created_at_ms: now_epoch_millis,
            })
            .await?)
    }

    pub async fn usage(&self, subject: &str) -> Result<Vec<UsageRow>, MeterError> {
        Ok(self.store.usage(subject).await?)
    }
}
