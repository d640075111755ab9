use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::budget::BudgetTracker;
use crate::clock::{Clock, SystemClock};
use crate::config::MeterConfig;
use crate::error::MeterError;
use crate::ledger::{CreditLedger, Receipt};
use crate::limits::RateLimiter;
use crate::observability::{Observability, ObservabilitySnapshot};
use crate::pricing::PricingTable;
use crate::store::{MeterStore, TransactionRecord, UsageRow};
use crate::usage::UsageRecorder;

/// A successful admission. `remaining_quota` is present when the feature
/// carries a daily limit; `balance_micros` when the feature is monetary.
#[derive(Clone, Copy, Debug, Default)]
pub struct Admission {
    pub remaining_quota: Option<u64>,
    pub balance_micros: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChargeRequest {
    pub subject: String,
    pub feature: String,
    pub amount_micros: u64,
    pub quantity: u64,
    pub reason: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ChargeReceipt {
    pub receipt_id: i64,
    pub write_off: bool,
    pub balance_micros: u64,
}

/// The only surface request handlers call. `admit` runs strictly before the
/// gated upstream call, `charge` strictly after it succeeds; a failed or
/// cancelled upstream call means `charge` is never invoked and nothing is
/// debited. Retries of the upstream call are the caller's concern; each
/// attempt is a fresh admission.
pub struct Meter {
    config: MeterConfig,
    limiter: RateLimiter,
    budget: BudgetTracker,
    ledger: CreditLedger,
    recorder: UsageRecorder,
    pricing: Option<PricingTable>,
    clock: Box<dyn Clock>,
    observability: Observability,
}

impl Meter {
    pub fn new(config: MeterConfig, store: Arc<dyn MeterStore>) -> Self {
        Self::with_clock(config, store, Box::new(SystemClock))
    }

    pub fn with_clock(
        config: MeterConfig,
        store: Arc<dyn MeterStore>,
        clock: Box<dyn Clock>,
    ) -> Self {
        Self {
            config,
            limiter: RateLimiter::new(Arc::clone(&store)),
            budget: BudgetTracker::new(Arc::clone(&store)),
            ledger: CreditLedger::new(Arc::clone(&store)),
            recorder: UsageRecorder::new(store),
            pricing: None,
            clock,
            observability: Observability::default(),
        }
    }

    pub fn with_pricing_table(mut self, pricing: PricingTable) -> Self {
        self.pricing = Some(pricing);
        self
    }

    pub fn observability(&self) -> ObservabilitySnapshot {
        self.observability.snapshot()
    }

    /// Admission control: rate limit, then daily budget, then (monetary
    /// features only) an advisory balance check. Short-circuits on the
    /// first rejection. Store failures fail closed: a refused request is
    /// cheaper than unmetered spend.
    pub async fn admit(
        &self,
        subject: &str,
        action: &str,
        feature: &str,
    ) -> Result<Admission, MeterError> {
        self.observability.record_admit_call();
        let now = self.clock.now_epoch_seconds();

        if let Some(limit) = self.config.action(action) {
            if let Err(err) = self.limiter.allow(subject, limit, now).await {
                return Err(self.reject(subject, action, err));
            }
        } else {
            tracing::debug!(action, "no rate limit configured for action");
        }

        let mut admission = Admission::default();
        if let Some(feature_config) = self.config.feature(feature) {
            match self
                .budget
                .check_and_reserve(subject, feature_config, now)
                .await
            {
                Ok(decision) => admission.remaining_quota = decision.remaining,
                Err(err) => return Err(self.reject(subject, feature, err)),
            }

            if feature_config.monetary {
                let required = feature_config.min_balance_micros.max(1);
                let balance = match self.ledger.balance(subject).await {
                    Ok(balance) => balance,
                    Err(err) => return Err(self.reject(subject, feature, err)),
                };
                if balance < required {
                    let err = MeterError::InsufficientFunds {
                        balance_micros: balance,
                        required_micros: required,
                    };
                    return Err(self.reject(subject, feature, err));
                }
                admission.balance_micros = Some(balance);
            }
        } else {
            tracing::debug!(feature, "no budget configured for feature");
        }

        self.observability.record_admitted();
        Ok(admission)
    }

    /// Settle a delivered call. The debit is the authority: it can fail
    /// with insufficient funds even though the advisory pre-check passed,
    /// in which case the charge becomes a write-off: service was
    /// delivered, so the caller never sees that as a request failure.
    /// Only an unreachable store (after bounded retries) is an error; the
    /// caller then decides whether to re-attempt the charge asynchronously.
    pub async fn charge(&self, request: ChargeRequest) -> Result<ChargeReceipt, MeterError> {
        let now_ms = self.clock.now_epoch_millis();

        let mut attempt = 0u32;
        let debit = loop {
            match self
                .ledger
                .debit(
                    &request.subject,
                    request.amount_micros,
                    &request.reason,
                    request.metadata.clone(),
                    now_ms,
                )
                .await
            {
                Ok(receipt) => break Some(receipt),
                Err(MeterError::InsufficientFunds { .. }) => break None,
                Err(MeterError::StoreUnavailable { message })
                    if attempt < self.config.charge_retries =>
                {
                    attempt += 1;
                    tracing::warn!(
                        subject = %request.subject,
                        attempt,
                        message,
                        "debit hit transient store failure, retrying"
                    );
                }
                Err(err) => {
                    self.observability.record_store_failure();
                    return Err(err);
                }
            }
        };

        let (receipt_id, write_off, balance_micros) = match debit {
            Some(receipt) => {
                self.observability.record_charge();
                (receipt.transaction_id, false, receipt.balance_micros)
            }
            None => {
                let receipt = self
                    .ledger
                    .write_off(
                        &request.subject,
                        request.amount_micros,
                        &request.reason,
                        request.metadata.clone(),
                        now_ms,
                    )
                    .await?;
                self.observability.record_write_off();
                tracing::warn!(
                    subject = %request.subject,
                    feature = %request.feature,
                    amount_micros = request.amount_micros,
                    "charge written off: service delivered, balance not collectible"
                );
                (receipt.transaction_id, true, receipt.balance_micros)
            }
        };

        self.record_usage(&request, write_off, now_ms).await;

        Ok(ChargeReceipt {
            receipt_id,
            write_off,
            balance_micros,
        })
    }

    /// `charge` with the amount computed from the configured pricing table.
    pub async fn charge_priced(
        &self,
        subject: &str,
        feature: &str,
        quantity: u64,
        reason: &str,
        metadata: serde_json::Value,
    ) -> Result<ChargeReceipt, MeterError> {
        let amount_micros = self
            .pricing
            .as_ref()
            .and_then(|table| table.estimate_charge_usd_micros(feature, quantity))
            .ok_or_else(|| MeterError::UnpricedFeature {
                feature: feature.to_string(),
            })?;

        self.charge(ChargeRequest {
            subject: subject.to_string(),
            feature: feature.to_string(),
            amount_micros,
            quantity,
            reason: reason.to_string(),
            metadata,
        })
        .await
    }

    pub async fn top_up(
        &self,
        subject: &str,
        amount_micros: u64,
        reason: &str,
        metadata: serde_json::Value,
    ) -> Result<Receipt, MeterError> {
        let now_ms = self.clock.now_epoch_millis();
        let receipt = self
            .ledger
            .credit(subject, amount_micros, reason, metadata, now_ms)
            .await?;
        self.observability.record_top_up();
        Ok(receipt)
    }

    pub async fn balance(&self, subject: &str) -> Result<u64, MeterError> {
        self.ledger.balance(subject).await
    }

    pub async fn transactions(&self, subject: &str) -> Result<Vec<TransactionRecord>, MeterError> {
        self.ledger.transactions(subject).await
    }

    pub async fn usage(&self, subject: &str) -> Result<Vec<UsageRow>, MeterError> {
        self.recorder.usage(subject).await
    }

    fn reject(&self, subject: &str, key: &str, err: MeterError) -> MeterError {
        match &err {
            MeterError::RateLimited { retry_after_secs } => {
                self.observability.record_rate_limited();
                tracing::debug!(subject, key, retry_after_secs, "admission rate limited");
            }
            MeterError::BudgetExceeded { limit, consumed } => {
                self.observability.record_budget_exceeded();
                tracing::debug!(subject, key, limit, consumed, "admission over daily budget");
            }
            MeterError::InsufficientFunds {
                balance_micros,
                required_micros,
            } => {
                self.observability.record_insufficient_balance();
                tracing::debug!(
                    subject,
                    key,
                    balance_micros,
                    required_micros,
                    "admission refused on balance"
                );
            }
            MeterError::StoreUnavailable { message } => {
                self.observability.record_store_failure();
                tracing::warn!(subject, key, message, "store unavailable, failing closed");
            }
            MeterError::UnpricedFeature { .. } => {}
        }
        err
    }

    /// Best-effort after the charge outcome is decided: the usage row is
    /// the reporting trail, not the authority, so a slow or failing store
    /// must not turn a settled charge into a request failure.
    async fn record_usage(&self, request: &ChargeRequest, write_off: bool, now_ms: u64) {
        let mut metadata = serde_json::json!({
            "reason": request.reason,
            "write_off": write_off,
        });
        if !request.metadata.is_null() {
            metadata["request"] = request.metadata.clone();
        }

        let outcome = tokio::time::timeout(
            Duration::from_millis(self.config.usage_timeout_ms),
            self.recorder.record(
                &request.subject,
                &request.feature,
                request.quantity,
                request.amount_micros,
                metadata,
                now_ms,
            ),
        )
        .await;

        match outcome {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => {
                self.observability.record_store_failure();
                tracing::warn!(
                    subject = %request.subject,
                    feature = %request.feature,
                    error = %err,
                    "usage record failed after charge"
                );
            }
            Err(_) => {
                self.observability.record_store_failure();
                tracing::warn!(
                    subject = %request.subject,
                    feature = %request.feature,
                    timeout_ms = self.config.usage_timeout_ms,
                    "usage record timed out after charge"
                );
            }
        }
    }
}
