use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ObservabilitySnapshot {
    pub admit_calls: u64,
    pub admitted: u64,
    pub rate_limited: u64,
    pub budget_exceeded: u64,
    pub insufficient_balance: u64,
    pub store_failures: u64,
    pub charges: u64,
    pub write_offs: u64,
    pub top_ups: u64,
}

#[derive(Debug, Default)]
pub struct Observability {
    admit_calls: AtomicU64,
    admitted: AtomicU64,
    rate_limited: AtomicU64,
    budget_exceeded: AtomicU64,
    insufficient_balance: AtomicU64,
    store_failures: AtomicU64,
    charges: AtomicU64,
    write_offs: AtomicU64,
    top_ups: AtomicU64,
}

impl Observability {
    pub fn record_admit_call(&self) {
        self.admit_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_admitted(&self) {
        self.admitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_budget_exceeded(&self) {
        self.budget_exceeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_insufficient_balance(&self) {
        self.insufficient_balance.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_failure(&self) {
        self.store_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_charge(&self) {
        self.charges.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write_off(&self) {
        self.write_offs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_top_up(&self) {
        self.top_ups.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ObservabilitySnapshot {
        ObservabilitySnapshot {
            admit_calls: self.admit_calls.load(Ordering::Relaxed),
            admitted: self.admitted.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            budget_exceeded: self.budget_exceeded.load(Ordering::Relaxed),
            insufficient_balance: self.insufficient_balance.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
            charges: self.charges.load(Ordering::Relaxed),
            write_offs: self.write_offs.load(Ordering::Relaxed),
            top_ups: self.top_ups.load(Ordering::Relaxed),
        }
    }
}
