//! Postgres unit of work.
//!
//! All stitching-path queries run against the caller's transaction; intake
//! inserts and diagnostic reads go straight to the pool. Queries are bound at
//! runtime — identifier column names come from a `match` over the closed
//! field set, never from string concatenation.

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use sqlx::postgres::{PgPool, PgPoolOptions, Postgres};
use sqlx::types::Json;
use sqlx::Transaction;

use crate::error::{StoreError, StoreResult};
use crate::store::StitchStore;
use crate::types::{EventRecord, IdentifierField, Identifiers, NewEvent, Profile};

/// Events are projected with the jsonb triple flattened into columns so rows
/// decode straight into [`EventRecord`].
const SELECT_EVENTS: &str = r#"
SELECT
    id,
    event_id,
    event_timestamp,
    identifiers->>'cookie' AS cookie,
    identifiers->>'message_id' AS message_id,
    identifiers->>'phone' AS phone
FROM events
"#;

pub type PgTx = Transaction<'static, Postgres>;

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect a fresh pool. `max_connections` must cover every concurrent
    /// worker: each stitching transaction holds one connection for its
    /// lifetime.
    pub async fn new(url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(url)
            .await
            .map_err(|error| StoreError::Connection { error })?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl StitchStore for PgStore {
    type Tx = PgTx;

    async fn begin(&self) -> StoreResult<Self::Tx> {
        self.pool
            .begin()
            .await
            .map_err(|error| StoreError::BeginTransaction { error })
    }

    async fn commit(&self, tx: Self::Tx) -> StoreResult<()> {
        tx.commit()
            .await
            .map_err(|error| StoreError::CommitTransaction { error })
    }

    async fn rollback(&self, tx: Self::Tx) -> StoreResult<()> {
        tx.rollback()
            .await
            .map_err(|error| StoreError::RollbackTransaction { error })
    }

    async fn insert_event(&self, event: &NewEvent) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO events (event_id, event_timestamp, identifiers) VALUES ($1, $2, $3)",
        )
        .bind(event.event_id)
        .bind(event.event_timestamp)
        .bind(Json(&event.identifiers))
        .execute(&self.pool)
        .await
        .map_err(|error| StoreError::Query {
            command: "insert event",
            error,
        })?;

        Ok(())
    }

    async fn fetch_unprocessed(
        &self,
        tx: &mut Self::Tx,
        limit: i64,
    ) -> StoreResult<Vec<EventRecord>> {
        // SKIP LOCKED partitions the backlog across workers: rows claimed by
        // another in-flight transaction are simply not returned here.
        let query = format!(
            r#"{SELECT_EVENTS}
WHERE processed = false
ORDER BY event_timestamp ASC
LIMIT $1
FOR UPDATE SKIP LOCKED
"#
        );

        sqlx::query_as::<_, EventRecord>(&query)
            .bind(limit)
            .fetch_all(&mut **tx)
            .await
            .map_err(|error| StoreError::Query {
                command: "fetch unprocessed events",
                error,
            })
    }

    async fn mark_processed(&self, tx: &mut Self::Tx, event: &EventRecord) -> StoreResult<()> {
        sqlx::query("UPDATE events SET processed = true WHERE id = $1")
            .bind(event.id)
            .execute(&mut **tx)
            .await
            .map_err(|error| StoreError::Query {
                command: "mark event processed",
                error,
            })?;

        Ok(())
    }

    async fn profiles_by_identifier(
        &self,
        tx: &mut Self::Tx,
        field: IdentifierField,
        value: &str,
    ) -> StoreResult<Vec<Profile>> {
        if value.is_empty() {
            return Ok(Vec::new());
        }

        let query = match field {
            IdentifierField::Cookie => {
                "SELECT id, cookie, message_id, phone FROM profiles WHERE cookie = $1 ORDER BY id"
            }
            IdentifierField::MessageId => {
                "SELECT id, cookie, message_id, phone FROM profiles WHERE message_id = $1 ORDER BY id"
            }
            IdentifierField::Phone => {
                "SELECT id, cookie, message_id, phone FROM profiles WHERE phone = $1 ORDER BY id"
            }
        };

        sqlx::query_as::<_, Profile>(query)
            .bind(value)
            .fetch_all(&mut **tx)
            .await
            .map_err(|error| StoreError::Query {
                command: "get profiles by identifier",
                error,
            })
    }

    async fn insert_profile(
        &self,
        tx: &mut Self::Tx,
        identifiers: &Identifiers,
    ) -> StoreResult<i32> {
        let id: i32 = sqlx::query_scalar(
            "INSERT INTO profiles (cookie, message_id, phone) VALUES ($1, $2, $3) RETURNING id",
        )
        .bind(&identifiers.cookie)
        .bind(&identifiers.message_id)
        .bind(&identifiers.phone)
        .fetch_one(&mut **tx)
        .await
        .map_err(|error| StoreError::Query {
            command: "insert profile",
            error,
        })?;

        Ok(id)
    }

    async fn update_profile(
        &self,
        tx: &mut Self::Tx,
        id: i32,
        identifiers: &Identifiers,
    ) -> StoreResult<()> {
        sqlx::query("UPDATE profiles SET cookie = $1, message_id = $2, phone = $3 WHERE id = $4")
            .bind(&identifiers.cookie)
            .bind(&identifiers.message_id)
            .bind(&identifiers.phone)
            .bind(id)
            .execute(&mut **tx)
            .await
            .map_err(|error| StoreError::Query {
                command: "update profile",
                error,
            })?;

        Ok(())
    }

    async fn enrich_profile(
        &self,
        tx: &mut Self::Tx,
        id: i32,
        identifiers: &Identifiers,
    ) -> StoreResult<()> {
        // One statement, fill-only: a column is written only while it is
        // still empty. Writing an empty value over an empty column is a
        // no-op, so no per-field emptiness checks are needed here.
        sqlx::query(
            r#"
UPDATE profiles
SET
    cookie = CASE WHEN cookie = '' THEN $1::text ELSE cookie END,
    message_id = CASE WHEN message_id = '' THEN $2::text ELSE message_id END,
    phone = CASE WHEN phone = '' THEN $3::text ELSE phone END
WHERE id = $4
"#,
        )
        .bind(&identifiers.cookie)
        .bind(&identifiers.message_id)
        .bind(&identifiers.phone)
        .bind(id)
        .execute(&mut **tx)
        .await
        .map_err(|error| StoreError::Query {
            command: "enrich profile",
            error,
        })?;

        Ok(())
    }

    async fn merge_profiles(&self, tx: &mut Self::Tx, ids: &[i32]) -> StoreResult<()> {
        let mut ordered = ids.to_vec();
        ordered.sort_unstable();
        ordered.dedup();
        if ordered.len() < 2 {
            return Ok(());
        }
        let winner = ordered[0];

        // Lock every row first, in ascending id order. Concurrent merges
        // touching overlapping sets then acquire locks in the same order and
        // cannot deadlock.
        sqlx::query("SELECT id FROM profiles WHERE id = ANY($1) ORDER BY id FOR UPDATE")
            .bind(&ordered)
            .execute(&mut **tx)
            .await
            .map_err(|error| StoreError::Query {
                command: "lock profiles for merge",
                error,
            })?;

        // The winner takes the lexicographically smallest non-empty value per
        // field (its own value stands where no row has one), the rest are
        // deleted. One statement, atomic within the caller's transaction.
        sqlx::query(
            r#"
WITH merged AS (
    SELECT
        MIN(NULLIF(cookie, '')) AS cookie,
        MIN(NULLIF(message_id, '')) AS message_id,
        MIN(NULLIF(phone, '')) AS phone
    FROM profiles
    WHERE id = ANY($1)
),
survivor AS (
    UPDATE profiles
    SET
        cookie = COALESCE(merged.cookie, profiles.cookie),
        message_id = COALESCE(merged.message_id, profiles.message_id),
        phone = COALESCE(merged.phone, profiles.phone)
    FROM merged
    WHERE profiles.id = $2
)
DELETE FROM profiles
WHERE id = ANY($1) AND id <> $2
"#,
        )
        .bind(&ordered)
        .bind(winner)
        .execute(&mut **tx)
        .await
        .map_err(|error| StoreError::Query {
            command: "merge profiles",
            error,
        })?;

        Ok(())
    }

    async fn count_events(&self) -> StoreResult<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM events")
            .fetch_one(&self.pool)
            .await
            .map_err(|error| StoreError::Query {
                command: "count events",
                error,
            })
    }

    async fn count_unprocessed_events(&self) -> StoreResult<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM events WHERE processed = false")
            .fetch_one(&self.pool)
            .await
            .map_err(|error| StoreError::Query {
                command: "count unprocessed events",
                error,
            })
    }

    async fn all_events(&self) -> StoreResult<Vec<EventRecord>> {
        let query = format!("{SELECT_EVENTS} ORDER BY event_timestamp ASC");

        sqlx::query_as::<_, EventRecord>(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| StoreError::Query {
                command: "get events",
                error,
            })
    }

    async fn events_in_range(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> StoreResult<Vec<EventRecord>> {
        let query = format!(
            "{SELECT_EVENTS} WHERE event_timestamp BETWEEN $1 AND $2 ORDER BY event_timestamp ASC"
        );

        sqlx::query_as::<_, EventRecord>(&query)
            .bind(start)
            .bind(end)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| StoreError::Query {
                command: "get events by time range",
                error,
            })
    }

    async fn all_profiles(&self) -> StoreResult<Vec<Profile>> {
        sqlx::query_as::<_, Profile>(
            "SELECT id, cookie, message_id, phone FROM profiles ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|error| StoreError::Query {
            command: "get profiles",
            error,
        })
    }
}
