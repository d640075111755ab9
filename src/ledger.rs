use std::sync::Arc;

use crate::error::MeterError;
use crate::store::{MeterStore, NewTransaction, TransactionKind, TransactionRecord};

#[derive(Clone, Copy, Debug)]
pub struct Receipt {
    pub transaction_id: i64,
    pub balance_micros: u64,
}

impl From<&TransactionRecord> for Receipt {
    fn from(record: &TransactionRecord) -> Self {
        Self {
            transaction_id: record.id,
            balance_micros: record.balance_after_micros,
        }
    }
}

/// Per-subject monetary balance with an append-only transaction trail.
///
/// The pre-flight check (`has_at_least`) is advisory only: no hold is
/// placed, and a concurrent request can spend the balance between the check
/// and the debit. `debit` is the authority: it re-evaluates the guard
/// inside the store's per-subject critical section, so two concurrent
/// debits can never both succeed when only one is covered.
pub struct CreditLedger {
    store: Arc<dyn MeterStore>,
}

impl CreditLedger {
    pub fn new(store: Arc<dyn MeterStore>) -> Self {
        Self { store }
    }

    /// Current balance; creates the account lazily on first touch.
    pub async fn balance(&self, subject: &str) -> Result<u64, MeterError> {
        Ok(self.store.balance_micros(subject).await?)
    }

    /// Advisory pre-flight check. Not a reservation.
    pub async fn has_at_least(&self, subject: &str, amount_micros: u64) -> Result<bool, MeterError> {
        Ok(self.store.balance_micros(subject).await? >= amount_micros)
    }

    /// Atomic guarded debit. Fails with `InsufficientFunds` when the balance
    /// does not cover `amount_micros`; never partially applied.
    pub async fn debit(
        &self,
        subject: &str,
        amount_micros: u64,
        reason: &str,
        metadata: serde_json::Value,
        now_epoch_millis: u64,
    ) -> Result<Receipt, MeterError> {
        let record = self
            .store
            .apply_transaction(NewTransaction {
                subject,
                kind: TransactionKind::Debit,
                amount_micros,
                reason,
                metadata,
                created_at_ms: now_epoch_millis,
            })
            .await?;
        Ok(Receipt::from(&record))
    }

    /// Unconditional top-up.
    pub async fn credit(
        &self,
        subject: &str,
        amount_micros: u64,
        reason: &str,
        metadata: serde_json::Value,
        now_epoch_millis: u64,
    ) -> Result<Receipt, MeterError> {
        let record = self
            .store
            .apply_transaction(NewTransaction {
                subject,
                kind: TransactionKind::Credit,
                amount_micros,
                reason,
                metadata,
                created_at_ms: now_epoch_millis,
            })
            .await?;
        Ok(Receipt::from(&record))
    }

    /// Record a charge that could not be collected: service was delivered,
    /// the balance stays untouched, and the uncollectible amount lands in
    /// the trail as a zero-delta transaction so reconciliation still holds.
    pub async fn write_off(
        &self,
        subject: &str,
        amount_micros: u64,
        reason: &str,
        metadata: serde_json::Value,
        now_epoch_millis: u64,
    ) -> Result<Receipt, MeterError> {
        let record = self
            .store
            .apply_transaction(NewTransaction {
                subject,
                kind: TransactionKind::WriteOff,
                amount_micros,
                reason,
                metadata,
                created_at_ms: now_epoch_millis,
            })
            .await?;
        Ok(Receipt::from(&record))
    }

    pub async fn transactions(&self, subject: &str) -> Result<Vec<TransactionRecord>, MeterError> {
        Ok(self.store.transactions(subject).await?)
    }
}
