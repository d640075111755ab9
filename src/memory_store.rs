use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use async_trait::async_trait;

use crate::budget::SECONDS_PER_DAY;
use crate::limits::window_bucket;
use crate::store::{
    MeterStore, NewTransaction, NewUsage, StoreError, TransactionKind, TransactionRecord, UsageRow,
    WindowSlot,
};

#[derive(Debug)]
struct WindowState {
    bucket: u64,
    count: u32,
}

#[derive(Debug)]
struct SubjectState {
    windows: HashMap<String, WindowState>,
    quotas: HashMap<(String, u64), u64>,
    balance_micros: u64,
    transactions: Vec<TransactionRecord>,
    usage: Vec<UsageRow>,
}

impl SubjectState {
    fn new(starting_balance_micros: u64) -> Self {
        Self {
            windows: HashMap::new(),
            quotas: HashMap::new(),
            balance_micros: starting_balance_micros,
            transactions: Vec::new(),
            usage: Vec::new(),
        }
    }
}

/// In-process store. Each subject owns its own mutex, so same-subject
/// operations serialize while unrelated subjects never contend on a write
/// lock; the outer map lock is only held to look up or insert the entry.
pub struct MemoryStore {
    starting_balance_micros: u64,
    subjects: RwLock<HashMap<String, Arc<Mutex<SubjectState>>>>,
    next_id: AtomicI64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_starting_balance(0)
    }

    pub fn with_starting_balance(starting_balance_micros: u64) -> Self {
        Self {
            starting_balance_micros,
            subjects: RwLock::new(HashMap::new()),
            next_id: AtomicI64::new(0),
        }
    }

    fn subject(&self, subject: &str) -> Arc<Mutex<SubjectState>> {
        if let Some(state) = read_map(&self.subjects).get(subject) {
            return Arc::clone(state);
        }
        let mut map = write_map(&self.subjects);
        Arc::clone(
            map.entry(subject.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(SubjectState::new(self.starting_balance_micros)))),
        )
    }

    fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

// Poisoned locks keep the state written before the panic; the counters and
// balances remain usable.
fn lock_state(state: &Mutex<SubjectState>) -> MutexGuard<'_, SubjectState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read_map(
    map: &RwLock<HashMap<String, Arc<Mutex<SubjectState>>>>,
) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<Mutex<SubjectState>>>> {
    map.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_map(
    map: &RwLock<HashMap<String, Arc<Mutex<SubjectState>>>>,
) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<Mutex<SubjectState>>>> {
    map.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn micros_to_i64(micros: u64) -> i64 {
    i64::try_from(micros).unwrap_or(i64::MAX)
}

#[async_trait]
impl MeterStore for MemoryStore {
    async fn try_increment_window(
        &self,
        subject: &str,
        action: &str,
        limit: u32,
        window_secs: u64,
        now_epoch_seconds: u64,
    ) -> Result<WindowSlot, StoreError> {
        let state = self.subject(subject);
        let mut state = lock_state(&state);
        let bucket = window_bucket(now_epoch_seconds, window_secs);

        let slot = state
            .windows
            .entry(action.to_string())
            .or_insert(WindowState { bucket, count: 0 });
        if slot.bucket != bucket {
            slot.bucket = bucket;
            slot.count = 0;
        }

        if slot.count >= limit {
            return Ok(WindowSlot {
                admitted: false,
                count: slot.count,
            });
        }

        slot.count += 1;
        Ok(WindowSlot {
            admitted: true,
            count: slot.count,
        })
    }

    async fn quota_consumed(
        &self,
        subject: &str,
        feature: &str,
        day: u64,
    ) -> Result<u64, StoreError> {
        let state = self.subject(subject);
        let state = lock_state(&state);
        Ok(state
            .quotas
            .get(&(feature.to_string(), day))
            .copied()
            .unwrap_or(0))
    }

    async fn balance_micros(&self, subject: &str) -> Result<u64, StoreError> {
        let state = self.subject(subject);
        let state = lock_state(&state);
        Ok(state.balance_micros)
    }

    async fn apply_transaction(
        &self,
        new: NewTransaction<'_>,
    ) -> Result<TransactionRecord, StoreError> {
        let state = self.subject(new.subject);
        let mut state = lock_state(&state);

        let (applied, balance_after) = match new.kind {
            TransactionKind::Credit => (
                micros_to_i64(new.amount_micros),
                state.balance_micros.saturating_add(new.amount_micros),
            ),
            TransactionKind::Debit => {
                if state.balance_micros < new.amount_micros {
                    return Err(StoreError::InsufficientFunds {
                        balance_micros: state.balance_micros,
                        attempted_micros: new.amount_micros,
                    });
                }
                (
                    -micros_to_i64(new.amount_micros),
                    state.balance_micros - new.amount_micros,
                )
            }
            TransactionKind::WriteOff => (0, state.balance_micros),
        };

        state.balance_micros = balance_after;
        let record = TransactionRecord {
            id: self.next_id(),
            subject: new.subject.to_string(),
            kind: new.kind,
            amount_micros: applied,
            requested_micros: new.amount_micros,
            reason: new.reason.to_string(),
            metadata: new.metadata,
            created_at_ms: new.created_at_ms,
            balance_after_micros: balance_after,
        };
        state.transactions.push(record.clone());
        Ok(record)
    }

    async fn transactions(&self, subject: &str) -> Result<Vec<TransactionRecord>, StoreError> {
        let state = self.subject(subject);
        let state = lock_state(&state);
        Ok(state.transactions.clone())
    }

    async fn append_usage(&self, new: NewUsage<'_>) -> Result<UsageRow, StoreError> {
        let state = self.subject(new.subject);
        let mut state = lock_state(&state);

        let day = new.created_at_ms / (SECONDS_PER_DAY * 1000);
        let consumed = state
            .quotas
            .entry((new.feature.to_string(), day))
            .or_insert(0);
        *consumed = consumed.saturating_add(new.quantity);

        let row = UsageRow {
            id: self.next_id(),
            subject: new.subject.to_string(),
            feature: new.feature.to_string(),
            quantity: new.quantity,
            cost_micros: new.cost_micros,
            metadata: new.metadata,
            created_at_ms: new.created_at_ms,
        };
        state.usage.push(row.clone());
        Ok(row)
    }

    async fn usage(&self, subject: &str) -> Result<Vec<UsageRow>, StoreError> {
        let state = self.subject(subject);
        let state = lock_state(&state);
        Ok(state.usage.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn window_admits_up_to_limit_then_replaces_stale_bucket() {
        let store = MemoryStore::new();

        for expected in 1..=3u32 {
            let slot = store
                .try_increment_window("u1", "chat", 3, 60, 100)
                .await
                .expect("slot");
            assert!(slot.admitted);
            assert_eq!(slot.count, expected);
        }
        let denied = store
            .try_increment_window("u1", "chat", 3, 60, 110)
            .await
            .expect("slot");
        assert!(!denied.admitted);

        // Next window starts fresh.
        let slot = store
            .try_increment_window("u1", "chat", 3, 60, 160)
            .await
            .expect("slot");
        assert!(slot.admitted);
        assert_eq!(slot.count, 1);
    }

    #[tokio::test]
    async fn zero_limit_always_denies() {
        let store = MemoryStore::new();
        let slot = store
            .try_increment_window("u1", "chat", 0, 60, 0)
            .await
            .expect("slot");
        assert!(!slot.admitted);
    }

    #[tokio::test]
    async fn debit_is_guarded_and_never_partial() {
        let store = MemoryStore::with_starting_balance(100);

        let record = store
            .apply_transaction(NewTransaction {
                subject: "u1",
                kind: TransactionKind::Debit,
                amount_micros: 60,
                reason: "chat",
                metadata: serde_json::Value::Null,
                created_at_ms: 0,
            })
            .await
            .expect("debit");
        assert_eq!(record.amount_micros, -60);
        assert_eq!(record.balance_after_micros, 40);

        let err = store
            .apply_transaction(NewTransaction {
                subject: "u1",
                kind: TransactionKind::Debit,
                amount_micros: 60,
                reason: "chat",
                metadata: serde_json::Value::Null,
                created_at_ms: 0,
            })
            .await;
        assert!(matches!(
            err,
            Err(StoreError::InsufficientFunds {
                balance_micros: 40,
                attempted_micros: 60
            })
        ));
        assert_eq!(store.balance_micros("u1").await.expect("balance"), 40);
    }

    #[tokio::test]
    async fn write_off_leaves_balance_untouched() {
        let store = MemoryStore::with_starting_balance(10);
        let record = store
            .apply_transaction(NewTransaction {
                subject: "u1",
                kind: TransactionKind::WriteOff,
                amount_micros: 50,
                reason: "uncollectible",
                metadata: serde_json::Value::Null,
                created_at_ms: 0,
            })
            .await
            .expect("write off");
        assert_eq!(record.amount_micros, 0);
        assert_eq!(record.requested_micros, 50);
        assert_eq!(store.balance_micros("u1").await.expect("balance"), 10);
    }

    #[tokio::test]
    async fn usage_append_bumps_day_quota() {
        let store = MemoryStore::new();
        let day_ms = SECONDS_PER_DAY * 1000;

        store
            .append_usage(NewUsage {
                subject: "u1",
                feature: "chat",
                quantity: 4,
                cost_micros: 0,
                metadata: serde_json::Value::Null,
                created_at_ms: day_ms + 1,
            })
            .await
            .expect("usage");
        store
            .append_usage(NewUsage {
                subject: "u1",
                feature: "chat",
                quantity: 6,
                cost_micros: 0,
                metadata: serde_json::Value::Null,
                created_at_ms: day_ms + 2,
            })
            .await
            .expect("usage");

        assert_eq!(store.quota_consumed("u1", "chat", 1).await.expect("q"), 10);
        assert_eq!(store.quota_consumed("u1", "chat", 2).await.expect("q"), 0);
        assert_eq!(store.quota_consumed("u2", "chat", 1).await.expect("q"), 0);
    }

    #[tokio::test]
    async fn transactions_reconcile_with_balance() {
        let store = MemoryStore::with_starting_balance(1_000);

        for (kind, amount) in [
            (TransactionKind::Credit, 500),
            (TransactionKind::Debit, 300),
            (TransactionKind::WriteOff, 900),
            (TransactionKind::Debit, 200),
        ] {
            store
                .apply_transaction(NewTransaction {
                    subject: "u1",
                    kind,
                    amount_micros: amount,
                    reason: "test",
                    metadata: serde_json::Value::Null,
                    created_at_ms: 0,
                })
                .await
                .expect("transaction");
        }

        let balance = store.balance_micros("u1").await.expect("balance");
        let applied: i64 = store
            .transactions("u1")
            .await
            .expect("transactions")
            .iter()
            .map(|record| record.amount_micros)
            .sum();
        assert_eq!(balance as i64, 1_000 + applied);
        assert_eq!(balance, 1_000);
    }
}
