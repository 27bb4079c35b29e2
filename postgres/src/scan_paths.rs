//! Scan path settings stored in `PostgreSQL`.

use healwatch_projections::policy::{PolicyFuture, ScanPathError};
use healwatch_projections::{ScanPathPolicy, ScanPathSource};
use sqlx::PgPool;

/// Remediation settings from the `scan_paths` table.
#[derive(Clone, Debug)]
pub struct PostgresScanPaths {
    pool: PgPool,
}

impl PostgresScanPaths {
    /// Create a settings store on an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create or update the settings for `path`, returning its id.
    ///
    /// # Errors
    ///
    /// Returns [`ScanPathError::Database`] if the write fails.
    pub async fn upsert(
        &self,
        path: &str,
        auto_remediate: bool,
        max_retries: u32,
    ) -> Result<i64, ScanPathError> {
        let max_retries = i32::try_from(max_retries).unwrap_or(i32::MAX);
        let (id,): (i64,) = sqlx::query_as(
            r"
            INSERT INTO scan_paths (path, auto_remediate, max_retries)
            VALUES ($1, $2, $3)
            ON CONFLICT (path) DO UPDATE
            SET auto_remediate = EXCLUDED.auto_remediate,
                max_retries = EXCLUDED.max_retries,
                updated_at = now()
            RETURNING id
            ",
        )
        .bind(path)
        .bind(auto_remediate)
        .bind(max_retries)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| ScanPathError::Database(e.to_string()))?;

        tracing::info!(path_id = id, path, auto_remediate, max_retries, "Scan path saved");
        Ok(id)
    }
}

impl ScanPathSource for PostgresScanPaths {
    fn policy(&self, path_id: i64) -> PolicyFuture<'_, Option<ScanPathPolicy>> {
        Box::pin(async move {
            let row: Option<(i64, bool, i32)> = sqlx::query_as(
                "SELECT id, auto_remediate, max_retries FROM scan_paths WHERE id = $1",
            )
            .bind(path_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| ScanPathError::Database(e.to_string()))?;

            Ok(row.map(|(id, auto_remediate, max_retries)| ScanPathPolicy {
                path_id: Some(id),
                auto_remediate,
                max_retries: u32::try_from(max_retries).unwrap_or(0),
            }))
        })
    }
}
