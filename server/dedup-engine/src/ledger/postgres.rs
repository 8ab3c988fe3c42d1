//! PostgreSQL ledger shared by every evaluator instance.
//!
//! `observe` runs in one transaction that holds the fingerprint's row lock
//! (`SELECT ... FOR UPDATE`) while the transition is computed and written, so
//! concurrent writers on one fingerprint queue on that lock and each sees the
//! row its predecessor committed. A brand-new fingerprint is created with
//! `INSERT ... ON CONFLICT DO NOTHING`; the loser of a creation race waits for
//! the winner's commit and then takes the row lock like any other writer.
//! `mark_escalated` is a single conditional `UPDATE`, which takes the same lock.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx_core::query::query;
use sqlx_core::row::Row;
use sqlx_postgres::{PgConnection, PgPool, PgPoolOptions, PgRow};

use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::ledger::Ledger;
use crate::state::{self, BurstPolicy};
use crate::types::{ErrorRecord, Event, Fingerprint, Observation};

const CREATE_TABLE: &str = r#"
  CREATE TABLE IF NOT EXISTS error_records (
    fingerprint        TEXT PRIMARY KEY,
    source_service     TEXT NOT NULL,
    error_type         TEXT NOT NULL,
    error_message      TEXT NOT NULL,
    first_seen_at      TIMESTAMPTZ NOT NULL,
    last_seen_at       TIMESTAMPTZ NOT NULL,
    occurrence_count   BIGINT NOT NULL CHECK (occurrence_count >= 1),
    muted_until        TIMESTAMPTZ,
    escalation_sent    BOOLEAN NOT NULL DEFAULT FALSE,
    escalation_sent_at TIMESTAMPTZ,
    burst_started_at   TIMESTAMPTZ NOT NULL,
    burst_count        BIGINT NOT NULL CHECK (burst_count >= 1)
  )
"#;

const CREATE_DUE_INDEX: &str = r#"
  CREATE INDEX IF NOT EXISTS error_records_escalation_due_idx
    ON error_records (muted_until)
    WHERE muted_until IS NOT NULL AND NOT escalation_sent
"#;

const COLUMNS: &str = "fingerprint, source_service, error_type, error_message, first_seen_at, \
  last_seen_at, occurrence_count, muted_until, escalation_sent, escalation_sent_at, \
  burst_started_at, burst_count";

pub struct PgLedger {
  pool: PgPool,
  policy: BurstPolicy,
}

impl PgLedger {
  pub fn new(pool: PgPool, policy: BurstPolicy) -> Self {
    Self { pool, policy }
  }

  /// Connect a small pool whose acquire timeout matches the store timeout.
  pub async fn connect(database_url: &str, config: &Config) -> Result<Self> {
    let pool = PgPoolOptions::new()
      .max_connections(16)
      .acquire_timeout(config.store_timeout.max(Duration::from_millis(100)))
      .connect(database_url)
      .await?;
    Ok(Self::new(pool, BurstPolicy::from_config(config)))
  }

  /// Create the table and the partial index serving the sweep scan.
  pub async fn migrate(&self) -> Result<()> {
    query(CREATE_TABLE).execute(&self.pool).await?;
    query(CREATE_DUE_INDEX).execute(&self.pool).await?;
    Ok(())
  }

  pub fn pool(&self) -> &PgPool {
    &self.pool
  }

  async fn fetch(&self, fingerprint: &Fingerprint) -> Result<Option<ErrorRecord>> {
    let sql = format!("SELECT {} FROM error_records WHERE fingerprint = $1", COLUMNS);
    let row = query(&sql)
      .bind(fingerprint.as_str())
      .fetch_optional(&self.pool)
      .await?;
    row.as_ref().map(record_from_row).transpose()
  }
}

/// Read the row and hold its lock until the surrounding transaction ends.
async fn lock_row(conn: &mut PgConnection, fingerprint: &Fingerprint) -> Result<Option<ErrorRecord>> {
  let sql = format!("SELECT {} FROM error_records WHERE fingerprint = $1 FOR UPDATE", COLUMNS);
  let row = query(&sql)
    .bind(fingerprint.as_str())
    .fetch_optional(&mut *conn)
    .await?;
  row.as_ref().map(record_from_row).transpose()
}

/// Insert a brand-new record. `false` means another writer created it first.
async fn try_insert(conn: &mut PgConnection, record: &ErrorRecord) -> Result<bool> {
  let result = query(
    r#"
    INSERT INTO error_records (fingerprint, source_service, error_type, error_message,
      first_seen_at, last_seen_at, occurrence_count, muted_until, escalation_sent,
      escalation_sent_at, burst_started_at, burst_count)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
    ON CONFLICT (fingerprint) DO NOTHING
    "#,
  )
  .bind(record.fingerprint.as_str())
  .bind(&record.source_service)
  .bind(&record.error_type)
  .bind(&record.error_message)
  .bind(record.first_seen_at)
  .bind(record.last_seen_at)
  .bind(to_db_count(record.occurrence_count)?)
  .bind(record.muted_until)
  .bind(record.escalation_sent)
  .bind(record.escalation_sent_at)
  .bind(record.burst_started_at)
  .bind(to_db_count(record.burst_count)?)
  .execute(&mut *conn)
  .await?;
  Ok(result.rows_affected() == 1)
}

/// Write the mutable columns of a row the caller holds the lock on.
async fn write_locked(conn: &mut PgConnection, next: &ErrorRecord) -> Result<()> {
  query(
    r#"
    UPDATE error_records SET
      last_seen_at = $2,
      occurrence_count = $3,
      muted_until = $4,
      escalation_sent = $5,
      escalation_sent_at = $6,
      burst_started_at = $7,
      burst_count = $8
    WHERE fingerprint = $1
    "#,
  )
  .bind(next.fingerprint.as_str())
  .bind(next.last_seen_at)
  .bind(to_db_count(next.occurrence_count)?)
  .bind(next.muted_until)
  .bind(next.escalation_sent)
  .bind(next.escalation_sent_at)
  .bind(next.burst_started_at)
  .bind(to_db_count(next.burst_count)?)
  .execute(&mut *conn)
  .await?;
  Ok(())
}

#[async_trait]
impl Ledger for PgLedger {
  async fn observe(&self, fingerprint: &Fingerprint, event: &Event) -> Result<Observation> {
    // Dropping `tx` on any error path rolls it back and releases the lock.
    let mut tx = self.pool.begin().await?;

    let prev = match lock_row(&mut tx, fingerprint).await? {
      Some(prev) => prev,
      None => {
        let created = state::apply(None, fingerprint, event, &self.policy);
        if try_insert(&mut tx, &created.record).await? {
          tx.commit().await?;
          return Ok(created);
        }
        // Another writer created the row; its commit is visible to this statement.
        tracing::debug!(fingerprint = %fingerprint, "lost creation race, applying to existing row");
        lock_row(&mut tx, fingerprint)
          .await?
          .ok_or_else(|| EngineError::store(format!("observe {}: row missing after conflict", fingerprint)))?
      }
    };

    let obs = state::apply(Some(&prev), fingerprint, event, &self.policy);
    write_locked(&mut tx, &obs.record).await?;
    tx.commit().await?;
    Ok(obs)
  }

  async fn find_by_fingerprint(&self, fingerprint: &Fingerprint) -> Result<Option<ErrorRecord>> {
    self.fetch(fingerprint).await
  }

  async fn due_for_escalation(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ErrorRecord>> {
    let sql = format!(
      "SELECT {} FROM error_records \
       WHERE muted_until IS NOT NULL AND muted_until <= $1 AND NOT escalation_sent \
       ORDER BY muted_until, fingerprint LIMIT $2",
      COLUMNS
    );
    let rows = query(&sql)
      .bind(now)
      .bind(i64::try_from(limit).unwrap_or(i64::MAX))
      .fetch_all(&self.pool)
      .await?;
    rows.iter().map(record_from_row).collect()
  }

  async fn mark_escalated(&self, fingerprint: &Fingerprint, now: DateTime<Utc>) -> Result<Option<ErrorRecord>> {
    // Same predicate as state::escalation_due, evaluated and flipped in one statement.
    let sql = format!(
      "UPDATE error_records SET escalation_sent = TRUE, escalation_sent_at = $2 \
       WHERE fingerprint = $1 AND muted_until IS NOT NULL AND muted_until <= $2 \
         AND NOT escalation_sent \
       RETURNING {}",
      COLUMNS
    );
    let row = query(&sql)
      .bind(fingerprint.as_str())
      .bind(now)
      .fetch_optional(&self.pool)
      .await?;
    row.as_ref().map(record_from_row).transpose()
  }

  fn name(&self) -> &str {
    "postgres"
  }
}

fn record_from_row(row: &PgRow) -> Result<ErrorRecord> {
  Ok(ErrorRecord {
    fingerprint: Fingerprint(row.try_get("fingerprint")?),
    source_service: row.try_get("source_service")?,
    error_type: row.try_get("error_type")?,
    error_message: row.try_get("error_message")?,
    first_seen_at: row.try_get("first_seen_at")?,
    last_seen_at: row.try_get("last_seen_at")?,
    occurrence_count: from_db_count(row.try_get("occurrence_count")?)?,
    muted_until: row.try_get("muted_until")?,
    escalation_sent: row.try_get("escalation_sent")?,
    escalation_sent_at: row.try_get("escalation_sent_at")?,
    burst_started_at: row.try_get("burst_started_at")?,
    burst_count: from_db_count(row.try_get("burst_count")?)?,
  })
}

fn to_db_count(n: u64) -> Result<i64> {
  i64::try_from(n).map_err(|_| EngineError::store(format!("count {} exceeds BIGINT", n)))
}

fn from_db_count(n: i64) -> Result<u64> {
  u64::try_from(n).map_err(|_| EngineError::store(format!("negative count {} in ledger", n)))
}
