use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quarry_core::error::AppError;
use quarry_core::rate_limit::{CounterStore, ScopeKey, WindowLimits, WindowUsage};
use sqlx::{PgPool, Postgres, Transaction};

/// Rate-limit counters shared by every process pointed at the same database.
///
/// `try_acquire` runs in one transaction: each involved row is locked with
/// `SELECT ... FOR UPDATE` (in scope order, so concurrent acquirers cannot
/// deadlock), checked, and only then updated.
#[derive(Clone)]
pub struct PgCounterStore {
    pool: PgPool,
}

#[derive(Debug, sqlx::FromRow)]
struct CounterRow {
    short_start: DateTime<Utc>,
    short_count: i64,
    long_start: DateTime<Utc>,
    long_count: i64,
}

impl CounterRow {
    /// Counts as of `now`, with elapsed windows reset.
    fn rolled(&self, limits: &WindowLimits, now: DateTime<Utc>) -> CounterRow {
        let short_start = limits.short.window_start(now);
        let long_start = limits.long.window_start(now);
        CounterRow {
            short_start,
            short_count: if self.short_start == short_start {
                self.short_count
            } else {
                0
            },
            long_start,
            long_count: if self.long_start == long_start {
                self.long_count
            } else {
                0
            },
        }
    }

    fn has_capacity(&self, limits: &WindowLimits) -> bool {
        self.short_count < i64::from(limits.short.max_requests)
            && self.long_count < i64::from(limits.long.max_requests)
    }
}

fn db_err(e: sqlx::Error) -> AppError {
    AppError::DatabaseError(e.to_string())
}

impl PgCounterStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn lock_row(
        tx: &mut Transaction<'_, Postgres>,
        key: &ScopeKey,
        limits: &WindowLimits,
        now: DateTime<Utc>,
    ) -> Result<CounterRow, AppError> {
        sqlx::query(
            r#"
            INSERT INTO rate_limit_counters (scope, short_start, short_count, long_start, long_count)
            VALUES ($1, $2, 0, $3, 0)
            ON CONFLICT (scope) DO NOTHING
            "#,
        )
        .bind(key.as_str())
        .bind(limits.short.window_start(now))
        .bind(limits.long.window_start(now))
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;

        sqlx::query_as::<_, CounterRow>(
            r#"
            SELECT short_start, short_count, long_start, long_count
            FROM rate_limit_counters
            WHERE scope = $1
            FOR UPDATE
            "#,
        )
        .bind(key.as_str())
        .fetch_one(&mut **tx)
        .await
        .map_err(db_err)
    }
}

#[async_trait]
impl CounterStore for PgCounterStore {
    async fn usage(
        &self,
        key: &ScopeKey,
        limits: &WindowLimits,
        now: DateTime<Utc>,
    ) -> Result<WindowUsage, AppError> {
        let row = sqlx::query_as::<_, CounterRow>(
            r#"
            SELECT short_start, short_count, long_start, long_count
            FROM rate_limit_counters
            WHERE scope = $1
            "#,
        )
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row
            .map(|row| {
                let rolled = row.rolled(limits, now);
                WindowUsage {
                    short_count: u32::try_from(rolled.short_count).unwrap_or(u32::MAX),
                    long_count: u32::try_from(rolled.long_count).unwrap_or(u32::MAX),
                }
            })
            .unwrap_or_default())
    }

    async fn increment(
        &self,
        key: &ScopeKey,
        limits: &WindowLimits,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO rate_limit_counters (scope, short_start, short_count, long_start, long_count)
            VALUES ($1, $2, 1, $3, 1)
            ON CONFLICT (scope) DO UPDATE SET
                short_count = CASE
                    WHEN rate_limit_counters.short_start = EXCLUDED.short_start
                    THEN rate_limit_counters.short_count + 1 ELSE 1 END,
                short_start = EXCLUDED.short_start,
                long_count = CASE
                    WHEN rate_limit_counters.long_start = EXCLUDED.long_start
                    THEN rate_limit_counters.long_count + 1 ELSE 1 END,
                long_start = EXCLUDED.long_start,
                updated_at = NOW()
            "#,
        )
        .bind(key.as_str())
        .bind(limits.short.window_start(now))
        .bind(limits.long.window_start(now))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn try_acquire(
        &self,
        scopes: &[(ScopeKey, WindowLimits)],
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let mut ordered: Vec<&(ScopeKey, WindowLimits)> = scopes.iter().collect();
        ordered.sort_by(|a, b| a.0.as_str().cmp(b.0.as_str()));

        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let mut rolled = Vec::with_capacity(ordered.len());
        for (key, limits) in &ordered {
            let row = Self::lock_row(&mut tx, key, limits, now).await?.rolled(limits, now);
            if !row.has_capacity(limits) {
                tx.rollback().await.map_err(db_err)?;
                return Ok(false);
            }
            rolled.push((key, row));
        }

        for (key, row) in rolled {
            sqlx::query(
                r#"
                UPDATE rate_limit_counters
                SET short_start = $2, short_count = $3, long_start = $4, long_count = $5,
                    updated_at = NOW()
                WHERE scope = $1
                "#,
            )
            .bind(key.as_str())
            .bind(row.short_start)
            .bind(row.short_count + 1)
            .bind(row.long_start)
            .bind(row.long_count + 1)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(true)
    }

    async fn purge_stale(&self, before: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM rate_limit_counters WHERE updated_at < $1")
            .bind(before)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected())
    }
}
