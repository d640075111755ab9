//! Usage metering and credit ledger for gating paid AI calls.
//!
//! A request handler calls [`Meter::admit`] before invoking a costly
//! upstream operation and [`Meter::charge`] only after that operation
//! succeeds. Storage is pluggable through [`MeterStore`]; the in-process
//! [`MemoryStore`] is the default, a SQLite backend sits behind the
//! `store-sqlite` feature.

pub mod budget;
pub mod clock;
pub mod config;
mod error;
pub mod ledger;
pub mod limits;
pub mod memory_store;
pub mod meter;
pub mod observability;
pub mod pricing;
#[cfg(feature = "store-sqlite")]
pub mod sqlite_store;
pub mod store;
pub mod usage;

pub use budget::{BudgetDecision, BudgetTracker, FeatureConfig};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{MeterConfig, MeterConfigError};
pub use error::{MeterError, Result};
pub use ledger::{CreditLedger, Receipt};
pub use limits::{ActionLimitConfig, RateDecision, RateLimiter};
pub use memory_store::MemoryStore;
pub use meter::{Admission, ChargeReceipt, ChargeRequest, Meter};
pub use observability::{Observability, ObservabilitySnapshot};
pub use pricing::{FeaturePricing, PricingTable, PricingTableError};
#[cfg(feature = "store-sqlite")]
pub use sqlite_store::{SqliteStore, SqliteStoreError};
pub use store::{
    MeterStore, NewTransaction, NewUsage, StoreError, TransactionKind, TransactionRecord, UsageRow,
    WindowSlot,
};
pub use usage::UsageRecorder;
