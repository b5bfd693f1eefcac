// This file is part of wallet-analyzer.
// Copyright (C) 2025 Wallet Analyzer Contributors
// SPDX-License-Identifier: Apache-2.0
// Licensed under the Apache License, Version 2.0 (the "License");
// You may not use this file except in compliance with the License.
// You may obtain a copy of the License at
// http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

pub mod in_mem;

#[cfg(any(feature = "cloud", feature = "standalone"))]
pub use sql::*;

#[cfg(any(feature = "cloud", feature = "standalone"))]
mod sql {
    use crate::{
        domain::{Job, JobId, JobStore, NewJob, QueueName, ReapOutcome, unix_millis},
        infra::pool::Pool,
    };
    use fastrace::trace;
    use indoc::indoc;
    use sqlx::FromRow;
    use std::time::Duration;
    use uuid::Uuid;

    /// Unified sqlx-backed job store for PostgreSQL (cloud) and SQLite (standalone).
    #[derive(Debug, Clone)]
    pub struct SqlJobStore {
        pool: Pool,
    }

    impl SqlJobStore {
        pub fn new(pool: Pool) -> Self {
            Self { pool }
        }
    }

    const JOB_COLUMNS: &str = indoc! {"
        id, queue_name, kind, payload, state, attempts, max_attempts, progress, created_at,
        started_at, finished_at, run_at, visible_until, owner_token, parent_id, cancel_requested,
        result, error
    "};

    // Postgres needs FOR UPDATE SKIP LOCKED against concurrent claimers; SQLite serializes
    // writers anyway. Parameters appear in strictly increasing order so the query works with
    // both placeholder schemes.
    #[cfg(feature = "cloud")]
    const CLAIM_CANDIDATE: &str = indoc! {"
        SELECT id FROM jobs
        WHERE queue_name = $4 AND state = 'queued'
        ORDER BY created_at
        LIMIT 1
        FOR UPDATE SKIP LOCKED
    "};

    #[cfg(all(feature = "standalone", not(feature = "cloud")))]
    const CLAIM_CANDIDATE: &str = indoc! {"
        SELECT id FROM jobs
        WHERE queue_name = $4 AND state = 'queued'
        ORDER BY created_at
        LIMIT 1
    "};

    impl JobStore for SqlJobStore {
        type Error = sqlx::Error;

        #[trace]
        async fn submit(&self, new_job: NewJob) -> Result<Job, Self::Error> {
            let query = indoc! {"
                INSERT INTO jobs (
                    id, queue_name, kind, payload, state, attempts, max_attempts, progress,
                    created_at, parent_id, cancel_requested
                )
                VALUES ($1, $2, $3, $4, 'queued', 0, $5, 0, $6, $7, FALSE)
                ON CONFLICT (id) DO UPDATE SET
                    state = 'queued',
                    attempts = 0,
                    progress = 0,
                    payload = excluded.payload,
                    created_at = excluded.created_at,
                    started_at = NULL,
                    finished_at = NULL,
                    run_at = NULL,
                    visible_until = NULL,
                    owner_token = NULL,
                    cancel_requested = FALSE,
                    result = NULL,
                    error = NULL
                WHERE jobs.state = 'dead'
                RETURNING
                    id, queue_name, kind, payload, state, attempts, max_attempts, progress,
                    created_at, started_at, finished_at, run_at, visible_until, owner_token,
                    parent_id, cancel_requested, result, error
            "};

            let row = sqlx::query_as::<_, JobRow>(query)
                .bind(new_job.id.as_str())
                .bind(new_job.queue.as_str())
                .bind(new_job.kind.as_str())
                .bind(new_job.payload.to_string())
                .bind(new_job.max_attempts as i64)
                .bind(unix_millis())
                .bind(new_job.parent_id.as_ref().map(|id| id.as_str().to_owned()))
                .fetch_optional(&*self.pool)
                .await?;

            match row {
                Some(row) => row.try_into(),

                // The job exists and is not dead; return the existing record unchanged.
                None => {
                    let existing = self.get(&new_job.id).await?;
                    existing.ok_or(sqlx::Error::RowNotFound)
                }
            }
        }

        #[trace]
        async fn get(&self, id: &JobId) -> Result<Option<Job>, Self::Error> {
            let query =
                format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");

            sqlx::query_as::<_, JobRow>(&query)
                .bind(id.as_str())
                .fetch_optional(&*self.pool)
                .await?
                .map(Job::try_from)
                .transpose()
        }

        #[trace]
        async fn claim(
            &self,
            queue: QueueName,
            owner_token: Uuid,
            lease: Duration,
            now: i64,
        ) -> Result<Option<Job>, Self::Error> {
            let query = format!(
                indoc! {"
                    UPDATE jobs SET
                        state = 'active',
                        attempts = attempts + 1,
                        progress = 0,
                        started_at = $1,
                        visible_until = $2,
                        owner_token = $3,
                        error = NULL
                    WHERE id = ({CLAIM_CANDIDATE})
                    RETURNING {JOB_COLUMNS}
                "},
                CLAIM_CANDIDATE = CLAIM_CANDIDATE,
                JOB_COLUMNS = JOB_COLUMNS,
            );

            sqlx::query_as::<_, JobRow>(&query)
                .bind(now)
                .bind(now + lease.as_millis() as i64)
                .bind(owner_token.to_string())
                .bind(queue.as_str())
                .fetch_optional(&*self.pool)
                .await?
                .map(Job::try_from)
                .transpose()
        }

        #[trace]
        async fn extend_lease(
            &self,
            id: &JobId,
            owner_token: Uuid,
            lease: Duration,
            now: i64,
        ) -> Result<bool, Self::Error> {
            let query = indoc! {"
                UPDATE jobs SET visible_until = $1
                WHERE id = $2 AND owner_token = $3 AND state = 'active'
            "};

            let result = sqlx::query(query)
                .bind(now + lease.as_millis() as i64)
                .bind(id.as_str())
                .bind(owner_token.to_string())
                .execute(&*self.pool)
                .await?;

            Ok(result.rows_affected() > 0)
        }

        #[trace]
        async fn record_progress(
            &self,
            id: &JobId,
            owner_token: Uuid,
            value: u8,
        ) -> Result<bool, Self::Error> {
            let query = indoc! {"
                UPDATE jobs
                SET progress = CASE WHEN progress < $1 THEN $1 ELSE progress END
                WHERE id = $2 AND owner_token = $3 AND state = 'active'
            "};

            let result = sqlx::query(query)
                .bind(value.min(100) as i64)
                .bind(id.as_str())
                .bind(owner_token.to_string())
                .execute(&*self.pool)
                .await?;

            Ok(result.rows_affected() > 0)
        }

        #[trace]
        async fn complete(
            &self,
            id: &JobId,
            owner_token: Uuid,
            result: serde_json::Value,
            now: i64,
        ) -> Result<bool, Self::Error> {
            let query = indoc! {"
                UPDATE jobs SET
                    state = 'completed',
                    progress = 100,
                    result = $1,
                    finished_at = $2,
                    owner_token = NULL,
                    visible_until = NULL
                WHERE id = $3 AND owner_token = $4 AND state = 'active'
            "};

            let result = sqlx::query(query)
                .bind(result.to_string())
                .bind(now)
                .bind(id.as_str())
                .bind(owner_token.to_string())
                .execute(&*self.pool)
                .await?;

            Ok(result.rows_affected() > 0)
        }

        #[trace]
        async fn fail(
            &self,
            id: &JobId,
            owner_token: Uuid,
            error: &str,
            retry_at: Option<i64>,
            now: i64,
        ) -> Result<bool, Self::Error> {
            let query = indoc! {"
                UPDATE jobs SET
                    state = CASE WHEN $1 IS NULL THEN 'dead' ELSE 'delayed' END,
                    run_at = $1,
                    error = $2,
                    finished_at = CASE WHEN $1 IS NULL THEN $3 ELSE NULL END,
                    owner_token = NULL,
                    visible_until = NULL
                WHERE id = $4 AND owner_token = $5 AND state = 'active'
            "};

            let result = sqlx::query(query)
                .bind(retry_at)
                .bind(error)
                .bind(now)
                .bind(id.as_str())
                .bind(owner_token.to_string())
                .execute(&*self.pool)
                .await?;

            Ok(result.rows_affected() > 0)
        }

        #[trace]
        async fn request_cancel(&self, id: &JobId, now: i64) -> Result<Vec<JobId>, Self::Error> {
            let mut tx = self.pool.begin().await?;

            let flag_query = indoc! {"
                WITH RECURSIVE subtree(id) AS (
                    SELECT id FROM jobs WHERE id = $1
                    UNION ALL
                    SELECT j.id FROM jobs j JOIN subtree s ON j.parent_id = s.id
                )
                UPDATE jobs SET cancel_requested = TRUE
                WHERE id IN (SELECT id FROM subtree) AND state = 'active'
            "};
            sqlx::query(flag_query)
                .bind(id.as_str())
                .execute(&mut *tx)
                .await?;

            let dead_query = indoc! {"
                WITH RECURSIVE subtree(id) AS (
                    SELECT id FROM jobs WHERE id = $1
                    UNION ALL
                    SELECT j.id FROM jobs j JOIN subtree s ON j.parent_id = s.id
                )
                UPDATE jobs SET
                    state = 'dead',
                    error = 'cancelled',
                    finished_at = $2,
                    run_at = NULL,
                    cancel_requested = TRUE
                WHERE id IN (SELECT id FROM subtree) AND state IN ('queued', 'delayed')
                RETURNING id
            "};
            let cancelled = sqlx::query_as::<_, (String,)>(dead_query)
                .bind(id.as_str())
                .bind(now)
                .fetch_all(&mut *tx)
                .await?;

            tx.commit().await?;

            Ok(cancelled.into_iter().map(|(id,)| id.into()).collect())
        }

        #[trace]
        async fn children(&self, parent_id: &JobId) -> Result<Vec<Job>, Self::Error> {
            let query = format!(
                "SELECT {JOB_COLUMNS} FROM jobs WHERE parent_id = $1 ORDER BY created_at"
            );

            sqlx::query_as::<_, JobRow>(&query)
                .bind(parent_id.as_str())
                .fetch_all(&*self.pool)
                .await?
                .into_iter()
                .map(Job::try_from)
                .collect()
        }

        #[trace]
        async fn promote_delayed(&self, queue: QueueName, now: i64) -> Result<u64, Self::Error> {
            let query = indoc! {"
                UPDATE jobs SET state = 'queued', run_at = NULL
                WHERE queue_name = $1 AND state = 'delayed' AND run_at <= $2
            "};

            let result = sqlx::query(query)
                .bind(queue.as_str())
                .bind(now)
                .execute(&*self.pool)
                .await?;

            Ok(result.rows_affected())
        }

        #[trace]
        async fn reap_expired(
            &self,
            queue: QueueName,
            now: i64,
        ) -> Result<ReapOutcome, Self::Error> {
            let mut tx = self.pool.begin().await?;

            let dead_query = indoc! {"
                UPDATE jobs SET
                    state = 'dead',
                    error = CASE WHEN cancel_requested THEN 'cancelled' ELSE 'job lease expired' END,
                    finished_at = $1,
                    owner_token = NULL,
                    visible_until = NULL
                WHERE queue_name = $2 AND state = 'active' AND visible_until < $1
                    AND (attempts >= max_attempts OR cancel_requested)
                RETURNING id
            "};
            let dead = sqlx::query_as::<_, (String,)>(dead_query)
                .bind(now)
                .bind(queue.as_str())
                .fetch_all(&mut *tx)
                .await?;

            let requeue_query = indoc! {"
                UPDATE jobs SET
                    state = 'queued',
                    progress = 0,
                    started_at = NULL,
                    owner_token = NULL,
                    visible_until = NULL
                WHERE queue_name = $1 AND state = 'active' AND visible_until < $2
            "};
            let requeued = sqlx::query(requeue_query)
                .bind(queue.as_str())
                .bind(now)
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;

            Ok(ReapOutcome {
                requeued: requeued.rows_affected(),
                dead: dead.into_iter().map(|(id,)| id.into()).collect(),
            })
        }
    }

    #[derive(Debug, FromRow)]
    struct JobRow {
        id: String,
        queue_name: String,
        kind: String,
        payload: String,
        state: String,
        attempts: i64,
        max_attempts: i64,
        progress: i64,
        created_at: i64,
        started_at: Option<i64>,
        finished_at: Option<i64>,
        run_at: Option<i64>,
        visible_until: Option<i64>,
        owner_token: Option<String>,
        parent_id: Option<String>,
        cancel_requested: bool,
        result: Option<String>,
        error: Option<String>,
    }

    impl TryFrom<JobRow> for Job {
        type Error = sqlx::Error;

        fn try_from(row: JobRow) -> Result<Self, Self::Error> {
            let queue = row.queue_name.parse().map_err(decode_error)?;
            let kind = row.kind.parse().map_err(decode_error)?;
            let state = row.state.parse().map_err(decode_error)?;
            let payload = serde_json::from_str(&row.payload).map_err(decode_error)?;
            let result = row
                .result
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .map_err(decode_error)?;
            let owner_token = row
                .owner_token
                .as_deref()
                .map(Uuid::parse_str)
                .transpose()
                .map_err(decode_error)?;

            Ok(Job {
                id: row.id.into(),
                queue,
                kind,
                payload,
                state,
                attempts: row.attempts as u32,
                max_attempts: row.max_attempts as u32,
                progress: row.progress as u8,
                created_at: row.created_at,
                started_at: row.started_at,
                finished_at: row.finished_at,
                run_at: row.run_at,
                visible_until: row.visible_until,
                owner_token,
                parent_id: row.parent_id.map(Into::into),
                cancel_requested: row.cancel_requested,
                result,
                error: row.error,
            })
        }
    }

    fn decode_error<E>(error: E) -> sqlx::Error
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        sqlx::Error::Decode(error.into())
    }
}
