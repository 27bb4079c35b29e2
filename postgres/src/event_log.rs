//! `PostgreSQL`-backed event log.

use crate::db_error;
use healwatch_core::aggregate::AggregateId;
use healwatch_core::environment::{Clock, SystemClock};
use healwatch_core::event::{DomainEvent, EventData, EventType};
use healwatch_core::event_log::{EventFilter, EventLog, EventLogError, LogFuture};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use std::sync::Arc;

const COLUMNS: &str =
    "id, aggregate_type, aggregate_id, event_type, event_data, event_version, created_at, user_id";

/// Event log stored in the `events` table.
///
/// # Schema
///
/// ```sql
/// CREATE TABLE events (
///     id BIGSERIAL PRIMARY KEY,
///     aggregate_type TEXT NOT NULL,
///     aggregate_id TEXT NOT NULL,
///     event_type TEXT NOT NULL,
///     event_data JSONB NOT NULL,
///     event_version INTEGER NOT NULL,
///     created_at TIMESTAMPTZ NOT NULL,
///     user_id TEXT
/// );
/// ```
///
/// Ids come from the sequence; `created_at` comes from the configured clock
/// unless the event already carries one.
#[derive(Clone)]
pub struct PostgresEventLog {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for PostgresEventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresEventLog").finish_non_exhaustive()
    }
}

impl PostgresEventLog {
    /// Create an event log on an existing pool, stamping with wall-clock time.
    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock used to stamp new events.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Get the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_event(row: &PgRow) -> Result<DomainEvent, EventLogError> {
        let data: serde_json::Value = row.try_get("event_data").map_err(db_error)?;
        let event_data: EventData = serde_json::from_value(data).map_err(|e| {
            EventLogError::Serialization(format!("Invalid event_data: {e}"))
        })?;
        let aggregate_id: String = row.try_get("aggregate_id").map_err(db_error)?;
        let event_type: String = row.try_get("event_type").map_err(db_error)?;

        Ok(DomainEvent {
            id: Some(row.try_get("id").map_err(db_error)?),
            aggregate_type: row.try_get("aggregate_type").map_err(db_error)?,
            aggregate_id: AggregateId::new(aggregate_id),
            event_type: EventType::from(event_type),
            event_data,
            event_version: row.try_get("event_version").map_err(db_error)?,
            created_at: Some(row.try_get("created_at").map_err(db_error)?),
            user_id: row.try_get("user_id").map_err(db_error)?,
        })
    }

    fn rows_to_events(rows: &[PgRow]) -> Result<Vec<DomainEvent>, EventLogError> {
        rows.iter().map(Self::row_to_event).collect()
    }
}

impl EventLog for PostgresEventLog {
    fn append(&self, event: DomainEvent) -> LogFuture<'_, DomainEvent> {
        Box::pin(async move {
            let created_at = event.created_at.unwrap_or_else(|| self.clock.now());
            let data = serde_json::to_value(&event.event_data)
                .map_err(|e| EventLogError::Serialization(e.to_string()))?;

            let row = sqlx::query(&format!(
                "INSERT INTO events \
                 (aggregate_type, aggregate_id, event_type, event_data, event_version, created_at, user_id) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7) \
                 RETURNING {COLUMNS}"
            ))
            .bind(&event.aggregate_type)
            .bind(event.aggregate_id.as_str())
            .bind(event.event_type.as_str())
            .bind(data)
            .bind(event.event_version)
            .bind(created_at)
            .bind(event.user_id.as_deref())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                metrics::counter!("event_log.append_failures").increment(1);
                db_error(e)
            })?;

            let stored = Self::row_to_event(&row)?;
            tracing::debug!(
                id = stored.id,
                aggregate_id = %stored.aggregate_id,
                event_type = %stored.event_type,
                "Event appended"
            );
            metrics::counter!("event_log.appended").increment(1);
            Ok(stored)
        })
    }

    fn query<'a>(&'a self, aggregate_id: &'a AggregateId) -> LogFuture<'a, Vec<DomainEvent>> {
        Box::pin(async move {
            let rows = sqlx::query(&format!(
                "SELECT {COLUMNS} FROM events WHERE aggregate_id = $1 ORDER BY created_at, id"
            ))
            .bind(aggregate_id.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;

            Self::rows_to_events(&rows)
        })
    }

    fn query_filtered(&self, filter: EventFilter) -> LogFuture<'_, Vec<DomainEvent>> {
        Box::pin(async move {
            let mut query: QueryBuilder<'_, Postgres> =
                QueryBuilder::new(format!("SELECT {COLUMNS} FROM events WHERE TRUE"));

            if let Some(aggregate_type) = &filter.aggregate_type {
                query.push(" AND aggregate_type = ").push_bind(aggregate_type.clone());
            }
            if !filter.event_types.is_empty() {
                let names: Vec<String> = filter
                    .event_types
                    .iter()
                    .map(|t| t.as_str().to_string())
                    .collect();
                query.push(" AND event_type = ANY(").push_bind(names).push(")");
            }
            if let Some(after) = filter.created_after {
                query.push(" AND created_at > ").push_bind(after);
            }
            query.push(" ORDER BY created_at, id");

            if let Some(limit) = filter.limit {
                query
                    .push(" LIMIT ")
                    .push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
            }
            if filter.offset > 0 {
                query
                    .push(" OFFSET ")
                    .push_bind(i64::try_from(filter.offset).unwrap_or(i64::MAX));
            }

            let rows = query
                .build()
                .fetch_all(&self.pool)
                .await
                .map_err(db_error)?;
            Self::rows_to_events(&rows)
        })
    }

    fn aggregate_ids<'a>(&'a self, aggregate_type: &'a str) -> LogFuture<'a, Vec<AggregateId>> {
        Box::pin(async move {
            let ids: Vec<(String,)> = sqlx::query_as(
                "SELECT aggregate_id FROM events WHERE aggregate_type = $1 \
                 GROUP BY aggregate_id ORDER BY MIN(id)",
            )
            .bind(aggregate_type)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;

            Ok(ids.into_iter().map(|(id,)| AggregateId::new(id)).collect())
        })
    }

    fn purge<'a>(&'a self, aggregate_id: &'a AggregateId) -> LogFuture<'a, u64> {
        Box::pin(async move {
            let removed = sqlx::query("DELETE FROM events WHERE aggregate_id = $1")
                .bind(aggregate_id.as_str())
                .execute(&self.pool)
                .await
                .map_err(db_error)?
                .rows_affected();

            if removed > 0 {
                tracing::info!(aggregate_id = %aggregate_id, removed, "Aggregate purged");
                metrics::counter!("event_log.purged").increment(removed);
            }
            Ok(removed)
        })
    }

    fn ping(&self) -> LogFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query("SELECT 1")
                .execute(&self.pool)
                .await
                .map_err(|e| EventLogError::Unavailable(e.to_string()))?;
            Ok(())
        })
    }
}
