use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::MeterError;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("insufficient funds: balance_micros={balance_micros} attempted_micros={attempted_micros}")]
    InsufficientFunds {
        balance_micros: u64,
        attempted_micros: u64,
    },
    #[error("store unavailable: {message}")]
    Unavailable { message: String },
    #[error("corrupt record: {message}")]
    Corrupt { message: String },
}

impl From<StoreError> for MeterError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InsufficientFunds {
                balance_micros,
                attempted_micros,
            } => MeterError::InsufficientFunds {
                balance_micros,
                required_micros: attempted_micros,
            },
            StoreError::Unavailable { message } | StoreError::Corrupt { message } => {
                MeterError::StoreUnavailable { message }
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Credit,
    Debit,
    WriteOff,
}

impl TransactionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Credit => "credit",
            Self::Debit => "debit",
            Self::WriteOff => "write_off",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "credit" => Some(Self::Credit),
            "debit" => Some(Self::Debit),
            "write_off" => Some(Self::WriteOff),
            _ => None,
        }
    }
}

/// Outcome of one fixed-window increment attempt. `count` is the window's
/// admitted count after the call (unchanged when denied).
#[derive(Clone, Copy, Debug)]
pub struct WindowSlot {
    pub admitted: bool,
    pub count: u32,
}

#[derive(Clone, Debug)]
pub struct NewTransaction<'a> {
    pub subject: &'a str,
    pub kind: TransactionKind,
    pub amount_micros: u64,
    pub reason: &'a str,
    pub metadata: serde_json::Value,
    pub created_at_ms: u64,
}

/// Committed ledger entry. `amount_micros` is the signed delta actually
/// applied to the balance; a write-off applies zero and keeps the
/// uncollectible amount in `requested_micros`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: i64,
    pub subject: String,
    pub kind: TransactionKind,
    pub amount_micros: i64,
    pub requested_micros: u64,
    pub reason: String,
    pub metadata: serde_json::Value,
    pub created_at_ms: u64,
    pub balance_after_micros: u64,
}

#[derive(Clone, Debug)]
pub struct NewUsage<'a> {
    pub subject: &'a str,
    pub feature: &'a str,
    pub quantity: u64,
    pub cost_micros: u64,
    pub metadata: serde_json::Value,
    pub created_at_ms: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UsageRow {
    pub id: i64,
    pub subject: String,
    pub feature: String,
    pub quantity: u64,
    pub cost_micros: u64,
    pub metadata: serde_json::Value,
    pub created_at_ms: u64,
}

/// Keyed-record storage behind the metering components. Every method is
/// atomic for its (subject, key) pair; same-subject mutations serialize,
/// different subjects must not block one another.
#[async_trait]
pub trait MeterStore: Send + Sync {
    /// Load or create the current window for (subject, action) and increment
    /// it when `count < limit`. Expired buckets are replaced, not
    /// accumulated.
    async fn try_increment_window(
        &self,
        subject: &str,
        action: &str,
        limit: u32,
        window_secs: u64,
        now_epoch_seconds: u64,
    ) -> Result<WindowSlot, StoreError>;

    /// Consumed quantity for (subject, feature, day). Missing rows read as 0.
    async fn quota_consumed(&self, subject: &str, feature: &str, day: u64)
    -> Result<u64, StoreError>;

    /// Current balance, creating the account at the provisioned starting
    /// balance on first touch.
    async fn balance_micros(&self, subject: &str) -> Result<u64, StoreError>;

    /// Append a transaction and update the balance in one atomic step. A
    /// debit that is not covered fails with `InsufficientFunds` and leaves
    /// no partial state.
    async fn apply_transaction(
        &self,
        new: NewTransaction<'_>,
    ) -> Result<TransactionRecord, StoreError>;

    async fn transactions(&self, subject: &str) -> Result<Vec<TransactionRecord>, StoreError>;

    /// Append a usage row and bump the matching day quota atomically.
    async fn append_usage(&self, new: NewUsage<'_>) -> Result<UsageRow, StoreError>;

    async fn usage(&self, subject: &str) -> Result<Vec<UsageRow>, StoreError>;
}
