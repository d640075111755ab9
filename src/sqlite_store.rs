use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::OptionalExtension;
use thiserror::Error;

use crate::budget::SECONDS_PER_DAY;
use crate::limits::window_bucket;
use crate::store::{
    MeterStore, NewTransaction, NewUsage, StoreError, TransactionKind, TransactionRecord, UsageRow,
    WindowSlot,
};

#[derive(Clone, Debug)]
pub struct SqliteStore {
    path: PathBuf,
    starting_balance_micros: u64,
}

#[derive(Debug, Error)]
pub enum SqliteStoreError {
    #[error("sqlite join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("insufficient funds: balance_micros={balance_micros} attempted_micros={attempted_micros}")]
    InsufficientFunds {
        balance_micros: u64,
        attempted_micros: u64,
    },
    #[error("corrupt record: {message}")]
    Corrupt { message: String },
}

impl From<SqliteStoreError> for StoreError {
    fn from(err: SqliteStoreError) -> Self {
        match err {
            SqliteStoreError::InsufficientFunds {
                balance_micros,
                attempted_micros,
            } => StoreError::InsufficientFunds {
                balance_micros,
                attempted_micros,
            },
            SqliteStoreError::Corrupt { message } => StoreError::Corrupt { message },
            other => StoreError::Unavailable {
                message: other.to_string(),
            },
        }
    }
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            starting_balance_micros: 0,
        }
    }

    pub fn with_starting_balance(mut self, starting_balance_micros: u64) -> Self {
        self.starting_balance_micros = starting_balance_micros;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn init(&self) -> Result<(), SqliteStoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            Ok(())
        })
        .await?
    }
}

#[async_trait]
impl MeterStore for SqliteStore {
    async fn try_increment_window(
        &self,
        subject: &str,
        action: &str,
        limit: u32,
        window_secs: u64,
        now_epoch_seconds: u64,
    ) -> Result<WindowSlot, StoreError> {
        let path = self.path.clone();
        let subject = subject.to_string();
        let action = action.to_string();
        let bucket = window_bucket(now_epoch_seconds, window_secs);

        tokio::task::spawn_blocking(move || -> Result<WindowSlot, SqliteStoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction()?;

            tx.execute(
                "INSERT OR IGNORE INTO rate_windows (subject, action, bucket, count)
                 VALUES (?1, ?2, ?3, 0)",
                rusqlite::params![subject, action, bucket as i64],
            )?;

            let (stored_bucket, count): (i64, i64) = tx.query_row(
                "SELECT bucket, count FROM rate_windows WHERE subject=?1 AND action=?2",
                rusqlite::params![subject, action],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;

            let mut count = i64_to_u64(count);
            if stored_bucket != bucket as i64 {
                tx.execute(
                    "UPDATE rate_windows SET bucket=?3, count=0 WHERE subject=?1 AND action=?2",
                    rusqlite::params![subject, action, bucket as i64],
                )?;
                count = 0;
            }

            if count >= u64::from(limit) {
                tx.commit()?;
                return Ok(WindowSlot {
                    admitted: false,
                    count: count.min(u64::from(u32::MAX)) as u32,
                });
            }

            tx.execute(
                "UPDATE rate_windows SET count = count + 1 WHERE subject=?1 AND action=?2",
                rusqlite::params![subject, action],
            )?;
            tx.commit()?;
            Ok(WindowSlot {
                admitted: true,
                count: (count + 1).min(u64::from(u32::MAX)) as u32,
            })
        })
        .await
        .map_err(SqliteStoreError::from)?
        .map_err(StoreError::from)
    }

    async fn quota_consumed(
        &self,
        subject: &str,
        feature: &str,
        day: u64,
    ) -> Result<u64, StoreError> {
        let path = self.path.clone();
        let subject = subject.to_string();
        let feature = feature.to_string();

        tokio::task::spawn_blocking(move || -> Result<u64, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let consumed: Option<i64> = conn
                .query_row(
                    "SELECT consumed FROM budget_quotas WHERE subject=?1 AND feature=?2 AND day=?3",
                    rusqlite::params![subject, feature, day as i64],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(i64_to_u64(consumed.unwrap_or(0)))
        })
        .await
        .map_err(SqliteStoreError::from)?
        .map_err(StoreError::from)
    }

    async fn balance_micros(&self, subject: &str) -> Result<u64, StoreError> {
        let path = self.path.clone();
        let subject = subject.to_string();
        let starting = micros_to_i64(self.starting_balance_micros);
        let ts_ms = 0i64;

        tokio::task::spawn_blocking(move || -> Result<u64, SqliteStoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT OR IGNORE INTO ledger_accounts (subject, balance_micros, created_at_ms)
                 VALUES (?1, ?2, ?3)",
                rusqlite::params![subject, starting, ts_ms],
            )?;
            let balance: i64 = tx.query_row(
                "SELECT balance_micros FROM ledger_accounts WHERE subject=?1",
                rusqlite::params![subject],
                |row| row.get(0),
            )?;
            tx.commit()?;
            Ok(i64_to_u64(balance))
        })
        .await
        .map_err(SqliteStoreError::from)?
        .map_err(StoreError::from)
    }

    async fn apply_transaction(
        &self,
        new: NewTransaction<'_>,
    ) -> Result<TransactionRecord, StoreError> {
        let path = self.path.clone();
        let subject = new.subject.to_string();
        let kind = new.kind;
        let amount = new.amount_micros;
        let reason = new.reason.to_string();
        let metadata = new.metadata;
        let metadata_json = serde_json::to_string(&metadata).map_err(SqliteStoreError::from)?;
        let created_at_ms = new.created_at_ms;
        let starting = micros_to_i64(self.starting_balance_micros);

        tokio::task::spawn_blocking(move || -> Result<TransactionRecord, SqliteStoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction()?;

            tx.execute(
                "INSERT OR IGNORE INTO ledger_accounts (subject, balance_micros, created_at_ms)
                 VALUES (?1, ?2, ?3)",
                rusqlite::params![subject, starting, created_at_ms as i64],
            )?;

            let balance: i64 = tx.query_row(
                "SELECT balance_micros FROM ledger_accounts WHERE subject=?1",
                rusqlite::params![subject],
                |row| row.get(0),
            )?;
            let balance = i64_to_u64(balance);

            let (applied, balance_after) = match kind {
                TransactionKind::Credit => {
                    (micros_to_i64(amount), balance.saturating_add(amount))
                }
                TransactionKind::Debit => {
                    if balance < amount {
                        return Err(SqliteStoreError::InsufficientFunds {
                            balance_micros: balance,
                            attempted_micros: amount,
                        });
                    }
                    (-micros_to_i64(amount), balance - amount)
                }
                TransactionKind::WriteOff => (0, balance),
            };

            tx.execute(
                "UPDATE ledger_accounts SET balance_micros=?2 WHERE subject=?1",
                rusqlite::params![subject, micros_to_i64(balance_after)],
            )?;

            tx.execute(
                "INSERT INTO ledger_transactions
                     (subject, kind, amount_micros, requested_micros, reason, metadata_json,
                      created_at_ms, balance_after_micros)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    subject,
                    kind.as_str(),
                    applied,
                    micros_to_i64(amount),
                    reason,
                    metadata_json,
                    created_at_ms as i64,
                    micros_to_i64(balance_after),
                ],
            )?;
            let id = tx.last_insert_rowid();
            tx.commit()?;

            Ok(TransactionRecord {
                id,
                subject,
                kind,
                amount_micros: applied,
                requested_micros: amount,
                reason,
                metadata,
                created_at_ms,
                balance_after_micros: balance_after,
            })
        })
        .await
        .map_err(SqliteStoreError::from)?
        .map_err(StoreError::from)
    }

    async fn transactions(&self, subject: &str) -> Result<Vec<TransactionRecord>, StoreError> {
        let path = self.path.clone();
        let subject = subject.to_string();

        tokio::task::spawn_blocking(move || -> Result<Vec<TransactionRecord>, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;

            let mut stmt = conn.prepare(
                "SELECT id, kind, amount_micros, requested_micros, reason, metadata_json,
                        created_at_ms, balance_after_micros
                 FROM ledger_transactions
                 WHERE subject=?1
                 ORDER BY id",
            )?;
            let rows = stmt.query_map(rusqlite::params![subject], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, i64>(7)?,
                ))
            })?;

            let mut out = Vec::new();
            for row in rows {
                let (id, kind, applied, requested, reason, metadata_json, ts_ms, balance_after) =
                    row?;
                let kind = TransactionKind::parse(&kind).ok_or_else(|| {
                    SqliteStoreError::Corrupt {
                        message: format!("unknown transaction kind: {kind}"),
                    }
                })?;
                out.push(TransactionRecord {
                    id,
                    subject: subject.clone(),
                    kind,
                    amount_micros: applied,
                    requested_micros: i64_to_u64(requested),
                    reason,
                    metadata: serde_json::from_str(&metadata_json)?,
                    created_at_ms: i64_to_u64(ts_ms),
                    balance_after_micros: i64_to_u64(balance_after),
                });
            }
            Ok(out)
        })
        .await
        .map_err(SqliteStoreError::from)?
        .map_err(StoreError::from)
    }

    async fn append_usage(&self, new: NewUsage<'_>) -> Result<UsageRow, StoreError> {
        let path = self.path.clone();
        let subject = new.subject.to_string();
        let feature = new.feature.to_string();
        let quantity = new.quantity;
        let cost_micros = new.cost_micros;
        let metadata = new.metadata;
        let metadata_json = serde_json::to_string(&metadata).map_err(SqliteStoreError::from)?;
        let created_at_ms = new.created_at_ms;
        let day = created_at_ms / (SECONDS_PER_DAY * 1000);

        tokio::task::spawn_blocking(move || -> Result<UsageRow, SqliteStoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction()?;

            tx.execute(
                "INSERT INTO usage_records
                     (subject, feature, quantity, cost_micros, metadata_json, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    subject,
                    feature,
                    micros_to_i64(quantity),
                    micros_to_i64(cost_micros),
                    metadata_json,
                    created_at_ms as i64,
                ],
            )?;
            let id = tx.last_insert_rowid();

            tx.execute(
                "INSERT OR IGNORE INTO budget_quotas (subject, feature, day, consumed, updated_at_ms)
                 VALUES (?1, ?2, ?3, 0, ?4)",
                rusqlite::params![subject, feature, day as i64, created_at_ms as i64],
            )?;
            tx.execute(
                "UPDATE budget_quotas
                 SET consumed = consumed + ?4, updated_at_ms = ?5
                 WHERE subject=?1 AND feature=?2 AND day=?3",
                rusqlite::params![
                    subject,
                    feature,
                    day as i64,
                    micros_to_i64(quantity),
                    created_at_ms as i64,
                ],
            )?;

            tx.commit()?;
            Ok(UsageRow {
                id,
                subject,
                feature,
                quantity,
                cost_micros,
                metadata,
                created_at_ms,
            })
        })
        .await
        .map_err(SqliteStoreError::from)?
        .map_err(StoreError::from)
    }

    async fn usage(&self, subject: &str) -> Result<Vec<UsageRow>, StoreError> {
        let path = self.path.clone();
        let subject = subject.to_string();

        tokio::task::spawn_blocking(move || -> Result<Vec<UsageRow>, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;

            let mut stmt = conn.prepare(
                "SELECT id, feature, quantity, cost_micros, metadata_json, created_at_ms
                 FROM usage_records
                 WHERE subject=?1
                 ORDER BY id",
            )?;
            let rows = stmt.query_map(rusqlite::params![subject], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            })?;

            let mut out = Vec::new();
            for row in rows {
                let (id, feature, quantity, cost_micros, metadata_json, ts_ms) = row?;
                out.push(UsageRow {
                    id,
                    subject: subject.clone(),
                    feature,
                    quantity: i64_to_u64(quantity),
                    cost_micros: i64_to_u64(cost_micros),
                    metadata: serde_json::from_str(&metadata_json)?,
                    created_at_ms: i64_to_u64(ts_ms),
                });
            }
            Ok(out)
        })
        .await
        .map_err(SqliteStoreError::from)?
        .map_err(StoreError::from)
    }
}

fn init_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS ledger_accounts (
            subject TEXT PRIMARY KEY NOT NULL,
            balance_micros INTEGER NOT NULL DEFAULT 0,
            created_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS ledger_transactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            subject TEXT NOT NULL,
            kind TEXT NOT NULL,
            amount_micros INTEGER NOT NULL,
            requested_micros INTEGER NOT NULL,
            reason TEXT NOT NULL,
            metadata_json TEXT NOT NULL,
            created_at_ms INTEGER NOT NULL,
            balance_after_micros INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_ledger_transactions_subject
            ON ledger_transactions(subject, id);

        CREATE TABLE IF NOT EXISTS budget_quotas (
            subject TEXT NOT NULL,
            feature TEXT NOT NULL,
            day INTEGER NOT NULL,
            consumed INTEGER NOT NULL DEFAULT 0,
            updated_at_ms INTEGER NOT NULL,
            PRIMARY KEY (subject, feature, day)
        );

        CREATE TABLE IF NOT EXISTS rate_windows (
            subject TEXT NOT NULL,
            action TEXT NOT NULL,
            bucket INTEGER NOT NULL,
            count INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (subject, action)
        );

        CREATE TABLE IF NOT EXISTS usage_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            subject TEXT NOT NULL,
            feature TEXT NOT NULL,
            quantity INTEGER NOT NULL,
            cost_micros INTEGER NOT NULL,
            metadata_json TEXT NOT NULL,
            created_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_usage_records_subject
            ON usage_records(subject, id);",
    )?;
    Ok(())
}

fn open_connection(path: PathBuf) -> Result<rusqlite::Connection, rusqlite::Error> {
    let conn = rusqlite::Connection::open(path)?;
    let _ = conn.busy_timeout(Duration::from_secs(5));
    let _ = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
    Ok(conn)
}

fn micros_to_i64(value: u64) -> i64 {
    if value > i64::MAX as u64 {
        i64::MAX
    } else {
        value as i64
    }
}

fn i64_to_u64(value: i64) -> u64 {
    if value <= 0 { 0 } else { value as u64 }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &tempfile::TempDir) -> SqliteStore {
        SqliteStore::new(dir.path().join("meter.sqlite"))
    }

    #[tokio::test]
    async fn windows_admit_up_to_limit_and_roll_over() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir);
        store.init().await.expect("init");

        for _ in 0..3 {
            let slot = store
                .try_increment_window("u1", "chat", 3, 60, 100)
                .await
                .expect("slot");
            assert!(slot.admitted);
        }
        let denied = store
            .try_increment_window("u1", "chat", 3, 60, 119)
            .await
            .expect("slot");
        assert!(!denied.admitted);

        let slot = store
            .try_increment_window("u1", "chat", 3, 60, 120)
            .await
            .expect("slot");
        assert!(slot.admitted);
        assert_eq!(slot.count, 1);
    }

    #[tokio::test]
    async fn debit_guard_holds_across_reopened_connections() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir).with_starting_balance(100);
        store.init().await.expect("init");

        store
            .apply_transaction(NewTransaction {
                subject: "u1",
                kind: TransactionKind::Debit,
                amount_micros: 80,
                reason: "chat",
                metadata: serde_json::json!({"model": "small"}),
                created_at_ms: 1,
            })
            .await
            .expect("debit");

        let err = store
            .apply_transaction(NewTransaction {
                subject: "u1",
                kind: TransactionKind::Debit,
                amount_micros: 30,
                reason: "chat",
                metadata: serde_json::Value::Null,
                created_at_ms: 2,
            })
            .await;
        assert!(matches!(err, Err(StoreError::InsufficientFunds { .. })));
        assert_eq!(store.balance_micros("u1").await.expect("balance"), 20);

        let trail = store.transactions("u1").await.expect("transactions");
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].amount_micros, -80);
        assert_eq!(trail[0].balance_after_micros, 20);
        assert_eq!(trail[0].metadata["model"], "small");
    }

    #[tokio::test]
    async fn write_off_is_appended_without_balance_change() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir);
        store.init().await.expect("init");

        let record = store
            .apply_transaction(NewTransaction {
                subject: "u1",
                kind: TransactionKind::WriteOff,
                amount_micros: 50_000,
                reason: "uncollectible chat charge",
                metadata: serde_json::Value::Null,
                created_at_ms: 5,
            })
            .await
            .expect("write off");
        assert_eq!(record.amount_micros, 0);
        assert_eq!(record.requested_micros, 50_000);
        assert_eq!(record.balance_after_micros, 0);

        let trail = store.transactions("u1").await.expect("transactions");
        assert_eq!(trail[0].kind, TransactionKind::WriteOff);
    }

    #[tokio::test]
    async fn usage_rows_aggregate_into_day_quota() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir);
        store.init().await.expect("init");

        let day_ms = SECONDS_PER_DAY * 1000;
        for quantity in [3u64, 7] {
            store
                .append_usage(NewUsage {
                    subject: "u1",
                    feature: "chat",
                    quantity,
                    cost_micros: quantity * 10,
                    metadata: serde_json::Value::Null,
                    created_at_ms: 2 * day_ms + quantity,
                })
                .await
                .expect("usage");
        }

        assert_eq!(store.quota_consumed("u1", "chat", 2).await.expect("q"), 10);
        assert_eq!(store.quota_consumed("u1", "chat", 3).await.expect("q"), 0);

        let rows = store.usage("u1").await.expect("usage rows");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].quantity, 3);
        assert_eq!(rows[1].cost_micros, 70);
    }

    #[tokio::test]
    async fn starting_balance_is_provisioned_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir).with_starting_balance(1_000);
        store.init().await.expect("init");

        assert_eq!(store.balance_micros("u1").await.expect("balance"), 1_000);
        store
            .apply_transaction(NewTransaction {
                subject: "u1",
                kind: TransactionKind::Debit,
                amount_micros: 400,
                reason: "chat",
                metadata: serde_json::Value::Null,
                created_at_ms: 1,
            })
            .await
            .expect("debit");

        // A later read must not re-provision.
        assert_eq!(store.balance_micros("u1").await.expect("balance"), 600);
    }
}
