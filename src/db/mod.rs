//! Database persistence for replication state.
//!
//! Stores everything needed to resume after restart:
//! - Replication records with the last observed source position
//! - Per-destination entries, version-guarded so stale writes are dropped
//! - Archived records for later inspection

use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::models::{DestinationEntry, EntryStatus, ReplicationRecord, SourcePosition};
use crate::store::{RecordRepository, StoreError, StoredRecord};

/// Database connection pool.
pub struct Database {
    pool: SqlitePool,
}

/// Stored replication record row.
#[derive(Debug, Clone, sqlx::FromRow)]
struct RecordRow {
    source_position_id: String,
    source_json: String,
    created_at: DateTime<Utc>,
    archived_at: Option<DateTime<Utc>>,
}

/// Stored destination entry row.
#[derive(Debug, Clone, sqlx::FromRow)]
struct EntryRow {
    source_position_id: String,
    destination_account_id: String,
    status: String,
    order_id: Option<String>,
    attempt_count: i64,
    last_attempt_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    applied_stop_loss: Option<String>,
    applied_take_profit: Option<String>,
    updated_at: DateTime<Utc>,
    version: i64,
}

impl EntryRow {
    fn into_entry(self) -> Result<DestinationEntry, StoreError> {
        let status = EntryStatus::from_str(&self.status).map_err(StoreError::Persistence)?;

        Ok(DestinationEntry {
            account_id: self.destination_account_id,
            status,
            order_id: self.order_id,
            attempt_count: u32::try_from(self.attempt_count).unwrap_or(u32::MAX),
            last_attempt_at: self.last_attempt_at,
            last_error: self.last_error,
            applied_stop_loss: parse_decimal(self.applied_stop_loss)?,
            applied_take_profit: parse_decimal(self.applied_take_profit)?,
            updated_at: self.updated_at,
            version: self.version,
            in_flight: false,
            held: false,
            stale_warned: false,
        })
    }
}

fn parse_decimal(value: Option<String>) -> Result<Option<Decimal>, StoreError> {
    value
        .map(|v| Decimal::from_str(&v).map_err(|e| StoreError::Persistence(e.to_string())))
        .transpose()
}

fn persistence(e: sqlx::Error) -> StoreError {
    StoreError::Persistence(e.to_string())
}

const UPSERT_ENTRY: &str = r#"
    INSERT INTO replication_entries (
        source_position_id, destination_account_id, status, order_id,
        attempt_count, last_attempt_at, last_error,
        applied_stop_loss, applied_take_profit, updated_at, version
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT(source_position_id, destination_account_id) DO UPDATE SET
        status = excluded.status,
        order_id = excluded.order_id,
        attempt_count = excluded.attempt_count,
        last_attempt_at = excluded.last_attempt_at,
        last_error = excluded.last_error,
        applied_stop_loss = excluded.applied_stop_loss,
        applied_take_profit = excluded.applied_take_profit,
        updated_at = excluded.updated_at,
        version = excluded.version
    WHERE excluded.version > replication_entries.version
"#;

impl Database {
    /// Create a new database connection.
    pub async fn new(database_url: &str) -> Result<Self> {
        // Every in-memory connection is its own database
        let in_memory = database_url.contains(":memory:");
        let mut options = SqlitePoolOptions::new().max_connections(if in_memory { 1 } else { 5 });
        if in_memory {
            options = options.idle_timeout(None).max_lifetime(None);
        }

        let pool = options
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run all database migrations.
    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS replication_records (
                source_position_id TEXT PRIMARY KEY,
                source_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                archived_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS replication_entries (
                source_position_id TEXT NOT NULL,
                destination_account_id TEXT NOT NULL,
                status TEXT NOT NULL,
                order_id TEXT,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                last_attempt_at TEXT,
                last_error TEXT,
                applied_stop_loss TEXT,
                applied_take_profit TEXT,
                updated_at TEXT NOT NULL,
                version INTEGER NOT NULL,
                PRIMARY KEY (source_position_id, destination_account_id),
                FOREIGN KEY (source_position_id) REFERENCES replication_records(source_position_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_records_archived ON replication_records(archived_at)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_entries_status ON replication_entries(status)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

async fn upsert_entry<'e, E>(
    executor: E,
    source_position_id: &str,
    entry: &DestinationEntry,
) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query(UPSERT_ENTRY)
        .bind(source_position_id)
        .bind(&entry.account_id)
        .bind(entry.status.as_str())
        .bind(entry.order_id.as_deref())
        .bind(i64::from(entry.attempt_count))
        .bind(entry.last_attempt_at)
        .bind(entry.last_error.as_deref())
        .bind(entry.applied_stop_loss.map(|d| d.to_string()))
        .bind(entry.applied_take_profit.map(|d| d.to_string()))
        .bind(entry.updated_at)
        .bind(entry.version)
        .execute(executor)
        .await?;
    Ok(())
}

#[async_trait]
impl RecordRepository for Database {
    async fn save_record(&self, record: &ReplicationRecord) -> Result<(), StoreError> {
        let source_json = serde_json::to_string(&record.source)
            .map_err(|e| StoreError::Persistence(e.to_string()))?;

        let mut tx = self.pool.begin().await.map_err(persistence)?;

        sqlx::query(
            r#"
            INSERT INTO replication_records (source_position_id, source_json, created_at, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(source_position_id) DO UPDATE SET
                source_json = excluded.source_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&record.source_position_id)
        .bind(source_json)
        .bind(record.created_at)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .map_err(persistence)?;

        for entry in record.entries.values() {
            upsert_entry(&mut *tx, &record.source_position_id, entry)
                .await
                .map_err(persistence)?;
        }

        tx.commit().await.map_err(persistence)
    }

    async fn save_entry(
        &self,
        source_position_id: &str,
        entry: &DestinationEntry,
    ) -> Result<(), StoreError> {
        upsert_entry(&self.pool, source_position_id, entry)
            .await
            .map_err(persistence)
    }

    async fn load(&self, include_archived: bool) -> Result<Vec<StoredRecord>, StoreError> {
        let sql = if include_archived {
            "SELECT source_position_id, source_json, created_at, archived_at \
             FROM replication_records ORDER BY created_at"
        } else {
            "SELECT source_position_id, source_json, created_at, archived_at \
             FROM replication_records WHERE archived_at IS NULL ORDER BY created_at"
        };
        let records = sqlx::query_as::<_, RecordRow>(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(persistence)?;

        let entries = sqlx::query_as::<_, EntryRow>(
            r#"
            SELECT source_position_id, destination_account_id, status, order_id,
                   attempt_count, last_attempt_at, last_error,
                   applied_stop_loss, applied_take_profit, updated_at, version
            FROM replication_entries
            ORDER BY source_position_id, destination_account_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(persistence)?;

        let mut out = Vec::with_capacity(records.len());
        for row in records {
            let source: SourcePosition = serde_json::from_str(&row.source_json).map_err(|e| {
                StoreError::Persistence(format!("record {}: {}", row.source_position_id, e))
            })?;

            let mut record = ReplicationRecord {
                source_position_id: row.source_position_id.clone(),
                source,
                entries: Default::default(),
                created_at: row.created_at,
            };
            for entry in entries
                .iter()
                .filter(|e| e.source_position_id == row.source_position_id)
            {
                let entry = entry.clone().into_entry()?;
                record.entries.insert(entry.account_id.clone(), entry);
            }

            out.push(StoredRecord {
                record,
                archived_at: row.archived_at,
            });
        }

        Ok(out)
    }

    async fn archive(&self, source_position_id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE replication_records SET archived_at = ?, updated_at = ? WHERE source_position_id = ?",
        )
        .bind(at)
        .bind(at)
        .bind(source_position_id)
        .execute(&self.pool)
        .await
        .map_err(persistence)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Outcome;
    use crate::testkit::position;
    use rust_decimal_macros::dec;

    async fn database() -> Database {
        Database::new("sqlite::memory:").await.unwrap()
    }

    fn record() -> ReplicationRecord {
        let mut source = position("P1", "EURUSD.z", dec!(1.0));
        source.stop_loss = Some(dec!(1.0750));
        ReplicationRecord::new(
            source,
            &["e8-1".to_string(), "ftmo-1".to_string()],
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_record_survives_reload() {
        let db = database().await;
        let mut record = record();
        {
            let entry = record.entries.get_mut("e8-1").unwrap();
            entry.note_attempts(3, Utc::now());
            entry
                .apply(&Outcome::Opened { order_id: "MT-77".into() }, Utc::now())
                .unwrap();
            entry.applied_stop_loss = Some(dec!(1.0750));
        }
        tokio_test::assert_ok!(db.save_record(&record).await);

        let loaded = db.load(false).await.unwrap();
        assert_eq!(loaded.len(), 1);
        let loaded = &loaded[0].record;
        assert_eq!(loaded.source, record.source);

        let entry = &loaded.entries["e8-1"];
        assert_eq!(entry.status, EntryStatus::Open);
        assert_eq!(entry.order_id.as_deref(), Some("MT-77"));
        assert_eq!(entry.attempt_count, 3);
        assert_eq!(entry.applied_stop_loss, Some(dec!(1.0750)));
        assert_eq!(loaded.entries["ftmo-1"].status, EntryStatus::Pending);
    }

    #[tokio::test]
    async fn test_older_version_never_overwrites_newer() {
        let db = database().await;
        let record = record();
        db.save_record(&record).await.unwrap();

        let stale = record.entries["e8-1"].clone();
        let mut fresh = stale.clone();
        fresh
            .apply(&Outcome::Opened { order_id: "MT-1".into() }, Utc::now())
            .unwrap();

        tokio_test::assert_ok!(db.save_entry("P1", &fresh).await);
        db.save_entry("P1", &stale).await.unwrap();

        let loaded = db.load(false).await.unwrap();
        assert_eq!(loaded[0].record.entries["e8-1"].status, EntryStatus::Open);
    }

    #[tokio::test]
    async fn test_archived_records_hidden_from_live_load() {
        let db = database().await;
        db.save_record(&record()).await.unwrap();
        db.archive("P1", Utc::now()).await.unwrap();

        assert!(db.load(false).await.unwrap().is_empty());
        let all = db.load(true).await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].archived_at.is_some());
    }
}
