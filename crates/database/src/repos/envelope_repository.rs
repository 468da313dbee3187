//! Envelopes waiting for a recipient who was offline when they were sent.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use parley_protocol::{decode, encode, Envelope, UserId};
use parley_relay::{CollaboratorError, OfflineStore};
use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};

use crate::error::{DatabaseError, DatabaseResult};

/// A persisted envelope together with its bookkeeping columns.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEnvelope {
    pub id: i64,
    pub envelope: Envelope,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct EnvelopeRepository {
    pool: SqlitePool,
}

impl EnvelopeRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Persist an envelope and return its row id.
    pub async fn store(&self, envelope: &Envelope) -> DatabaseResult<i64> {
        let now = column_timestamp(Utc::now());

        let result = sqlx::query(
            "INSERT INTO pending_envelopes (recipient, room_id, sender, payload, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(envelope.target.recipient().map(|user| user.as_str()))
        .bind(envelope.target.room().map(|room| room.as_str()))
        .bind(envelope.sender.as_ref().map(|user| user.as_str()))
        .bind(encode(envelope))
        .bind(&now)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        debug!(id, destination = %envelope.target, "envelope stored");
        Ok(id)
    }

    /// Undelivered envelopes for `user`, oldest first, without marking them.
    pub async fn list_pending(
        &self,
        user: &UserId,
        limit: u32,
    ) -> DatabaseResult<Vec<StoredEnvelope>> {
        let rows = sqlx::query(
            "SELECT id, payload, created_at FROM pending_envelopes
             WHERE recipient = ? AND delivered_at IS NULL
             ORDER BY id ASC LIMIT ?",
        )
        .bind(user.as_str())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let id: i64 = row.try_get("id")?;
                let payload: String = row.try_get("payload")?;
                let created_at: String = row.try_get("created_at")?;
                stored_envelope(id, &payload, &created_at)
            })
            .collect()
    }

    /// The next `limit` undelivered envelopes for `user`, oldest first, as
    /// `(row id, envelope)` pairs. Nothing is marked; pass the ids of the envelopes
    /// actually handed on to [`Self::mark_delivered`].
    ///
    /// Rows that no longer decode are marked delivered and skipped so they cannot
    /// stall a replay.
    pub async fn next_pending(
        &self,
        user: &UserId,
        limit: u32,
    ) -> DatabaseResult<Vec<(i64, Envelope)>> {
        let rows = sqlx::query(
            "SELECT id, payload FROM pending_envelopes
             WHERE recipient = ? AND delivered_at IS NULL
             ORDER BY id ASC LIMIT ?",
        )
        .bind(user.as_str())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        let mut envelopes = Vec::with_capacity(rows.len());
        let mut corrupt = Vec::new();
        for row in rows {
            let id: i64 = row.try_get("id")?;
            let payload: String = row.try_get("payload")?;
            match decode(&payload) {
                Ok(envelope) => envelopes.push((id, envelope)),
                Err(err) => {
                    warn!(id, error = %err, "skipping undecodable stored envelope");
                    corrupt.push(id);
                }
            }
        }

        self.mark_delivered(&corrupt).await?;
        Ok(envelopes)
    }

    /// Mark the given rows delivered in one transaction. Returns how many were
    /// still pending.
    pub async fn mark_delivered(&self, ids: &[i64]) -> DatabaseResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let now = column_timestamp(Utc::now());
        let mut tx = self.pool.begin().await?;
        let mut marked = 0;
        for id in ids {
            let result = sqlx::query(
                "UPDATE pending_envelopes SET delivered_at = ?
                 WHERE id = ? AND delivered_at IS NULL",
            )
            .bind(&now)
            .bind(id)
            .execute(&mut *tx)
            .await?;
            marked += result.rows_affected();
        }
        tx.commit().await?;

        debug!(marked, "pending envelopes marked delivered");
        Ok(marked)
    }

    pub async fn pending_count(&self, user: &UserId) -> DatabaseResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM pending_envelopes WHERE recipient = ? AND delivered_at IS NULL",
        )
        .bind(user.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Delete delivered rows older than `before`. Returns the number removed.
    pub async fn purge_delivered(&self, before: DateTime<Utc>) -> DatabaseResult<u64> {
        let result = sqlx::query(
            "DELETE FROM pending_envelopes WHERE delivered_at IS NOT NULL AND delivered_at < ?",
        )
        .bind(column_timestamp(before))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

/// Fixed-width UTC timestamps so the text columns order chronologically.
fn column_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn stored_envelope(id: i64, payload: &str, created_at: &str) -> DatabaseResult<StoredEnvelope> {
    let envelope = decode(payload).map_err(|err| DatabaseError::CorruptEnvelope {
        id,
        reason: err.to_string(),
    })?;
    let created_at = DateTime::parse_from_rfc3339(created_at)
        .map_err(|err| DatabaseError::CorruptEnvelope {
            id,
            reason: err.to_string(),
        })?
        .with_timezone(&Utc);

    Ok(StoredEnvelope {
        id,
        envelope,
        created_at,
    })
}

#[async_trait]
impl OfflineStore for EnvelopeRepository {
    async fn persist(&self, envelope: &Envelope) -> Result<(), CollaboratorError> {
        if envelope.target.recipient().is_none() {
            return Err(CollaboratorError::unavailable(
                "database",
                "only direct envelopes are held for offline recipients",
            ));
        }
        self.store(envelope).await?;
        Ok(())
    }
}
