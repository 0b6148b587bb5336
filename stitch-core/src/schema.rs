//! Schema bootstrap for the `profiles` and `events` tables.
//!
//! `ensure_schema` is safe to run on every startup; `reset_schema` is the
//! destructive variant used by fresh deployments, tests and load runs.

use sqlx::postgres::PgPool;

use crate::error::{StoreError, StoreResult};

const CREATE_PROFILES: &str = r#"
CREATE TABLE IF NOT EXISTS profiles (
    id serial PRIMARY KEY,
    cookie varchar(4096),
    message_id varchar(1024),
    phone varchar(14)
)
"#;

const CREATE_EVENTS: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    id serial PRIMARY KEY,
    event_id smallint,
    event_timestamp timestamp,
    identifiers jsonb,
    processed boolean DEFAULT false
)
"#;

/// Create both tables if they do not exist yet.
pub async fn ensure_schema(pool: &PgPool) -> StoreResult<()> {
    for statement in [CREATE_PROFILES, CREATE_EVENTS] {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|error| StoreError::Query {
                command: "create table",
                error,
            })?;
    }

    Ok(())
}

/// Drop and recreate both tables. Destroys all events and profiles.
pub async fn reset_schema(pool: &PgPool) -> StoreResult<()> {
    for statement in ["DROP TABLE IF EXISTS events", "DROP TABLE IF EXISTS profiles"] {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|error| StoreError::Query {
                command: "drop table",
                error,
            })?;
    }

    ensure_schema(pool).await
}
