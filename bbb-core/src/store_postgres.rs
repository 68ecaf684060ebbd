use crate::errors::StoreError;
use crate::retry::{with_backoff, BackoffPolicy};
use crate::store::{EnqueueReport, JobStore};
use crate::types::*;
use async_trait::async_trait;
use sqlx::Row;
use uuid::Uuid;

fn epoch_ms_to_datetime(epoch_ms: Timestamp) -> chrono::DateTime<chrono::Utc> {
    use chrono::TimeZone;
    let secs = epoch_ms / 1000;
    let nanos = ((epoch_ms % 1000) * 1_000_000) as u32;
    chrono::Utc
        .timestamp_opt(secs, nanos)
        .single()
        .unwrap_or_else(chrono::Utc::now)
}

fn datetime_to_epoch_ms(dt: chrono::DateTime<chrono::Utc>) -> Timestamp {
    dt.timestamp_millis()
}

fn opt_datetime_to_epoch_ms(dt: Option<chrono::DateTime<chrono::Utc>>) -> Option<Timestamp> {
    dt.map(datetime_to_epoch_ms)
}

/// PostgreSQL-backed implementation of `JobStore`, the production
/// counterpart to `MemoryStore`. All multi-row mutations run inside a
/// single transaction with `FOR UPDATE SKIP LOCKED` claiming, matching
/// the job-queue pattern of the store this was adapted from.
pub struct PostgresJobStore {
    pool: sqlx::PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Data(format!("migration failed: {e}")))?;
        Ok(())
    }

    fn row_to_job(row: &sqlx::postgres::PgRow) -> Result<Job, StoreError> {
        let counters_json: serde_json::Value = row.get("counters");
        let options_json: serde_json::Value = row.get("options");
        let summary_json: Option<serde_json::Value> = row.get("summary");
        Ok(Job {
            id: row.get("id"),
            domain_id: row.get("domain_id"),
            organisation_id: row.get("organisation_id"),
            status: row.get("status"),
            concurrency: row.get::<i32, _>("concurrency") as u32,
            counters: serde_json::from_value(counters_json)?,
            options: serde_json::from_value(options_json)?,
            created_at: datetime_to_epoch_ms(row.get("created_at")),
            started_at: opt_datetime_to_epoch_ms(row.get("started_at")),
            completed_at: opt_datetime_to_epoch_ms(row.get("completed_at")),
            error_message: row.get("error_message"),
            failure_streak: row.get::<i32, _>("failure_streak") as u32,
            summary: summary_json.map(serde_json::from_value).transpose()?,
        })
    }

    fn row_to_task(row: &sqlx::postgres::PgRow) -> Result<Task, StoreError> {
        let outcome_json: serde_json::Value = row.get("outcome");
        Ok(Task {
            id: row.get("id"),
            job_id: row.get("job_id"),
            page_id: row.get("page_id"),
            path: row.get("path"),
            status: row.get("status"),
            priority_score: row.get("priority_score"),
            created_at: datetime_to_epoch_ms(row.get("created_at")),
            started_at: opt_datetime_to_epoch_ms(row.get("started_at")),
            completed_at: opt_datetime_to_epoch_ms(row.get("completed_at")),
            retry_count: row.get::<i32, _>("retry_count") as u32,
            source_type: row.get("source_type"),
            source_url: row.get("source_url"),
            eligible_at: opt_datetime_to_epoch_ms(row.get("eligible_at")),
            outcome: serde_json::from_value(outcome_json)?,
        })
    }

    async fn claim_next_task_once(&self, job_id: Uuid) -> Result<Option<Task>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::from)?;

        let job_row = sqlx::query(
            "SELECT status, concurrency, counters FROM jobs WHERE id = $1 FOR UPDATE",
        )
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(StoreError::from)?;
        let job_row = match job_row {
            Some(r) => r,
            None => return Ok(None),
        };
        let status: JobStatus = job_row.get("status");
        let concurrency: i32 = job_row.get("concurrency");
        let counters: JobCounters = serde_json::from_value(job_row.get("counters"))?;
        if status.is_terminal() || status == JobStatus::Paused {
            return Ok(None);
        }
        if concurrency != 0 && counters.running >= concurrency as u32 {
            return Ok(None);
        }

        let task_row = sqlx::query(
            r#"
            SELECT tasks.*, pages.path AS path FROM tasks
            JOIN pages ON pages.id = tasks.page_id
            WHERE tasks.job_id = $1 AND tasks.status = 'pending'
              AND (tasks.eligible_at IS NULL OR tasks.eligible_at <= now())
            ORDER BY tasks.priority_score DESC, tasks.created_at ASC, tasks.id ASC
            LIMIT 1
            FOR UPDATE OF tasks SKIP LOCKED
            "#,
        )
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(StoreError::from)?;
        let task_row = match task_row {
            Some(r) => r,
            None => {
                tx.commit().await.map_err(StoreError::from)?;
                return Ok(None);
            }
        };
        let task_id: Uuid = task_row.get("id");

        sqlx::query(
            "UPDATE tasks SET status = 'running', started_at = now() WHERE id = $1",
        )
        .bind(task_id)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::from)?;

        sqlx::query(
            r#"
            UPDATE jobs SET
                counters = jsonb_set(
                    jsonb_set(counters, '{pending}', to_jsonb((counters->>'pending')::int - 1)),
                    '{running}', to_jsonb((counters->>'running')::int + 1)
                ),
                status = CASE WHEN status = 'pending' THEN 'running' ELSE status END,
                started_at = COALESCE(started_at, now())
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::from)?;

        tx.commit().await.map_err(StoreError::from)?;
        Self::row_to_task(&task_row).map(Some)
    }

    /// Whole batch commits or aborts as one transaction, so a retry after
    /// a transient failure never double-applies a counter delta.
    async fn batch_update_task_statuses_once(&self, updates: &[TaskUpdate]) -> Result<(), StoreError> {
        if updates.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(StoreError::from)?;
        let mut touched_jobs = std::collections::HashSet::new();

        for update in updates {
            let old_row = sqlx::query("SELECT status FROM tasks WHERE id = $1 FOR UPDATE")
                .bind(update.task_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(StoreError::from)?;
            let old_status: TaskStatus = match old_row {
                Some(r) => r.get("status"),
                None => continue,
            };

            let outcome_json = serde_json::to_value(&update.outcome)?;
            let eligible_at = update.eligible_at.map(epoch_ms_to_datetime);
            sqlx::query(
                r#"
                UPDATE tasks SET
                    status = $2, outcome = $3, retry_count = $4, eligible_at = $5,
                    completed_at = CASE WHEN $2 IN ('completed','failed','skipped','blocked') THEN now() ELSE NULL END,
                    started_at = CASE WHEN $2 = 'pending' THEN NULL ELSE started_at END
                WHERE id = $1
                "#,
            )
            .bind(update.task_id)
            .bind(update.status)
            .bind(&outcome_json)
            .bind(update.retry_count as i32)
            .bind(eligible_at)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::from)?;

            let from_field = counter_json_field(old_status);
            let to_field = counter_json_field(update.status);
            sqlx::query(&format!(
                r#"
                UPDATE jobs SET counters = jsonb_set(
                    jsonb_set(counters, '{{{from_field}}}', to_jsonb(GREATEST((counters->>'{from_field}')::int - 1, 0))),
                    '{{{to_field}}}', to_jsonb((counters->>'{to_field}')::int + 1)
                ) WHERE id = $1
                "#
            ))
            .bind(update.job_id)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::from)?;

            if old_status == TaskStatus::Running && update.status != TaskStatus::Running {
                touched_jobs.insert(update.job_id);
            }
        }

        for job_id in touched_jobs {
            promote_waiting_for_job(&mut tx, job_id).await?;
        }

        tx.commit().await.map_err(StoreError::from)?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn save_job(&self, job: &Job) -> Result<(), StoreError> {
        let counters = serde_json::to_value(&job.counters)?;
        let options = serde_json::to_value(&job.options)?;
        let created_at = epoch_ms_to_datetime(job.created_at);

        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, domain_id, organisation_id, status, concurrency,
                counters, options, created_at, failure_streak
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                concurrency = EXCLUDED.concurrency,
                counters = EXCLUDED.counters,
                options = EXCLUDED.options,
                failure_streak = EXCLUDED.failure_streak
            "#,
        )
        .bind(job.id)
        .bind(job.domain_id)
        .bind(job.organisation_id)
        .bind(job.status)
        .bind(job.concurrency as i32)
        .bind(&counters)
        .bind(&options)
        .bind(created_at)
        .bind(job.failure_streak as i32)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(())
    }

    async fn load_job(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::from)?;
        row.as_ref().map(Self::row_to_job).transpose()
    }

    async fn update_job_status(
        &self,
        id: Uuid,
        status: JobStatus,
        error_message: Option<String>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE jobs SET
                status = $2,
                error_message = $3,
                started_at = CASE WHEN started_at IS NULL AND $2 = 'running' THEN now() ELSE started_at END,
                completed_at = CASE WHEN $2 IN ('completed', 'failed', 'cancelled') THEN now() ELSE completed_at END
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(error_message)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(())
    }

    async fn find_active_job(
        &self,
        domain_id: Uuid,
        organisation_id: Uuid,
    ) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM jobs
            WHERE domain_id = $1 AND organisation_id = $2
              AND status NOT IN ('completed', 'failed', 'cancelled')
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(domain_id)
        .bind(organisation_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::from)?;
        row.as_ref().map(Self::row_to_job).transpose()
    }

    async fn complete_job(&self, id: Uuid, summary: JobSummary) -> Result<(), StoreError> {
        let summary_json = serde_json::to_value(&summary)?;
        sqlx::query(
            r#"
            UPDATE jobs SET status = 'completed', completed_at = now(), summary = $2
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&summary_json)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(())
    }

    async fn increment_failure_streak(&self, id: Uuid) -> Result<u32, StoreError> {
        let row = sqlx::query(
            "UPDATE jobs SET failure_streak = failure_streak + 1 WHERE id = $1 RETURNING failure_streak",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(row.get::<i32, _>("failure_streak") as u32)
    }

    async fn reset_failure_streak(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("UPDATE jobs SET failure_streak = 0 WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(StoreError::from)?;
        Ok(())
    }

    async fn list_open_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM jobs
            WHERE status NOT IN ('completed', 'failed', 'cancelled')
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::from)?;
        rows.iter().map(Self::row_to_job).collect()
    }

    async fn ensure_page(&self, domain_id: Uuid, path: &str) -> Result<Uuid, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO pages (id, domain_id, path, latest_priority_score)
            VALUES ($1, $2, $3, 0.0)
            ON CONFLICT (domain_id, path) DO UPDATE SET path = EXCLUDED.path
            RETURNING id
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(domain_id)
        .bind(path)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(row.get("id"))
    }

    async fn page_has_open_task(&self, job_id: Uuid, page_id: Uuid) -> Result<bool, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM tasks
                WHERE job_id = $1 AND page_id = $2
                  AND status IN ('pending', 'waiting', 'running')
            ) AS present
            "#,
        )
        .bind(job_id)
        .bind(page_id)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(row.get("present"))
    }

    /// Retries on serialization failure / deadlock (§4.1's "transient
    /// errors are retried with exponential backoff"); skip-locked
    /// claiming means contention with other claimants never blocks, but
    /// the job-row lock taken here can still collide under heavy writers.
    async fn claim_next_task(&self, job_id: Uuid) -> Result<Option<Task>, StoreError> {
        with_backoff(BackoffPolicy::default(), StoreError::is_retryable, || {
            self.claim_next_task_once(job_id)
        })
        .await
    }

    async fn update_task_status(&self, update: &TaskUpdate) -> Result<(), StoreError> {
        self.batch_update_task_statuses(std::slice::from_ref(update)).await
    }

    async fn batch_update_task_statuses(&self, updates: &[TaskUpdate]) -> Result<(), StoreError> {
        with_backoff(BackoffPolicy::default(), StoreError::is_retryable, || {
            self.batch_update_task_statuses_once(updates)
        })
        .await
    }

    async fn enqueue_urls(
        &self,
        job_id: Uuid,
        refs: &[PageRef],
        robots: &RobotsRules,
        include: &[String],
        exclude: &[String],
        max_pages: Option<u32>,
        overflow_factor: u32,
    ) -> Result<EnqueueReport, StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::from)?;
        let job_row = sqlx::query("SELECT concurrency, counters FROM jobs WHERE id = $1 FOR UPDATE")
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(StoreError::from)?
            .ok_or_else(|| StoreError::Data(format!("job {job_id} not found")))?;
        let concurrency: i32 = job_row.get("concurrency");
        let mut counters: JobCounters = serde_json::from_value(job_row.get("counters"))?;

        let mut report = EnqueueReport::default();
        let pending_capacity = if concurrency == 0 {
            u32::MAX
        } else {
            (concurrency as u32).saturating_mul(overflow_factor.max(1))
        };
        let mut pending_used = counters.pending;
        let mut total_so_far = counters.total;

        let domain_row = sqlx::query("SELECT domain_id FROM jobs WHERE id = $1")
            .bind(job_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(StoreError::from)?;
        let domain_id: Uuid = domain_row.get("domain_id");

        for r in refs {
            if robots.is_disallowed(&r.path) {
                report.skipped_robots += 1;
                continue;
            }
            if !exclude.is_empty() && exclude.iter().any(|p| r.path.contains(p.as_str())) {
                report.skipped_pattern += 1;
                continue;
            }
            if !include.is_empty() && !include.iter().any(|p| r.path.contains(p.as_str())) {
                report.skipped_pattern += 1;
                continue;
            }
            if let Some(max) = max_pages {
                if total_so_far >= max {
                    report.skipped_max_pages += 1;
                    continue;
                }
            }

            let page_row = sqlx::query(
                r#"
                INSERT INTO pages (id, domain_id, path, latest_priority_score)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (domain_id, path) DO UPDATE SET path = EXCLUDED.path
                RETURNING id
                "#,
            )
            .bind(Uuid::now_v7())
            .bind(domain_id)
            .bind(&r.path)
            .bind(r.priority_score)
            .fetch_one(&mut *tx)
            .await
            .map_err(StoreError::from)?;
            let page_id: Uuid = page_row.get("id");

            let open_row = sqlx::query(
                r#"
                SELECT EXISTS(
                    SELECT 1 FROM tasks WHERE job_id = $1 AND page_id = $2
                      AND status IN ('pending', 'waiting', 'running')
                ) AS present
                "#,
            )
            .bind(job_id)
            .bind(page_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(StoreError::from)?;
            if open_row.get::<bool, _>("present") {
                report.skipped_duplicate += 1;
                continue;
            }

            let status = if pending_used < pending_capacity {
                pending_used += 1;
                report.pending += 1;
                TaskStatus::Pending
            } else {
                report.waiting += 1;
                TaskStatus::Waiting
            };

            sqlx::query(
                r#"
                INSERT INTO tasks (
                    id, job_id, page_id, status, priority_score, created_at,
                    retry_count, source_type, source_url, outcome
                ) VALUES ($1, $2, $3, $4, $5, now(), 0, $6, $7, $8)
                "#,
            )
            .bind(Uuid::now_v7())
            .bind(job_id)
            .bind(page_id)
            .bind(status)
            .bind(r.priority_score)
            .bind(r.source_type)
            .bind(&r.source_url)
            .bind(serde_json::to_value(TaskOutcome::default())?)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::from)?;

            total_so_far += 1;
        }

        counters.total += report.pending + report.waiting;
        counters.pending += report.pending;
        counters.waiting += report.waiting;
        sqlx::query("UPDATE jobs SET counters = $2 WHERE id = $1")
            .bind(job_id)
            .bind(serde_json::to_value(&counters)?)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::from)?;

        tx.commit().await.map_err(StoreError::from)?;
        Ok(report)
    }

    async fn recover_stale_tasks(&self, grace_ms: i64) -> Result<u32, StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::from)?;
        let rows = sqlx::query(
            r#"
            SELECT id, job_id FROM tasks
            WHERE status = 'running' AND started_at IS NOT NULL
              AND started_at <= now() - make_interval(secs => $1::double precision / 1000.0)
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(grace_ms as f64)
        .fetch_all(&mut *tx)
        .await
        .map_err(StoreError::from)?;

        let mut count = 0u32;
        for row in &rows {
            let task_id: Uuid = row.get("id");
            let job_id: Uuid = row.get("job_id");
            sqlx::query("UPDATE tasks SET status = 'pending', started_at = NULL WHERE id = $1")
                .bind(task_id)
                .execute(&mut *tx)
                .await
                .map_err(StoreError::from)?;
            sqlx::query(
                r#"
                UPDATE jobs SET counters = jsonb_set(
                    jsonb_set(counters, '{running}', to_jsonb(GREATEST((counters->>'running')::int - 1, 0))),
                    '{pending}', to_jsonb((counters->>'pending')::int + 1)
                ) WHERE id = $1
                "#,
            )
            .bind(job_id)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::from)?;
            count += 1;
        }
        tx.commit().await.map_err(StoreError::from)?;
        Ok(count)
    }

    async fn promote_waiting_tasks(&self) -> Result<u32, StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::from)?;
        let job_ids: Vec<Uuid> = sqlx::query(
            "SELECT id FROM jobs WHERE status NOT IN ('completed','failed','cancelled')",
        )
        .fetch_all(&mut *tx)
        .await
        .map_err(StoreError::from)?
        .into_iter()
        .map(|r| r.get("id"))
        .collect();

        let mut total = 0u32;
        for job_id in job_ids {
            total += promote_waiting_for_job(&mut tx, job_id).await?;
        }
        tx.commit().await.map_err(StoreError::from)?;
        Ok(total)
    }

    async fn reconcile_running_counters(&self) -> Result<u32, StoreError> {
        // LEFT JOIN so a job with zero actual running rows (COALESCE to 0)
        // is still a reconciliation candidate, not just jobs with >=1.
        let rows = sqlx::query(
            r#"
            UPDATE jobs j SET counters = jsonb_set(j.counters, '{running}', to_jsonb(actual.n))
            FROM (
                SELECT j2.id AS job_id, COALESCE(t.cnt, 0) AS n
                FROM jobs j2
                LEFT JOIN (
                    SELECT job_id, COUNT(*) AS cnt FROM tasks WHERE status = 'running' GROUP BY job_id
                ) t ON t.job_id = j2.id
                WHERE j2.status NOT IN ('completed', 'failed', 'cancelled')
            ) AS actual
            WHERE j.id = actual.job_id AND (j.counters->>'running')::int != actual.n
            RETURNING j.id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(rows.len() as u32)
    }

    async fn load_domain(&self, id: Uuid) -> Result<Option<Domain>, StoreError> {
        let row = sqlx::query("SELECT * FROM domains WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::from)?;
        Ok(row.map(|r| Domain {
            id: r.get("id"),
            name: r.get("name"),
            organisation_id: r.get("organisation_id"),
            crawl_delay_seconds: r.get("crawl_delay_seconds"),
            adaptive_delay_seconds: r.get("adaptive_delay_seconds"),
            adaptive_delay_floor_seconds: r.get("adaptive_delay_floor_seconds"),
        }))
    }

    async fn ensure_domain(&self, name: &str, organisation_id: Uuid) -> Result<Domain, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO domains (id, name, organisation_id, adaptive_delay_seconds, adaptive_delay_floor_seconds)
            VALUES ($1, $2, $3, 0.0, 0.0)
            ON CONFLICT (name, organisation_id) DO UPDATE SET name = EXCLUDED.name
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(name)
        .bind(organisation_id)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(Domain {
            id: row.get("id"),
            name: row.get("name"),
            organisation_id: row.get("organisation_id"),
            crawl_delay_seconds: row.get("crawl_delay_seconds"),
            adaptive_delay_seconds: row.get("adaptive_delay_seconds"),
            adaptive_delay_floor_seconds: row.get("adaptive_delay_floor_seconds"),
        })
    }

    async fn persist_domain_delay(
        &self,
        id: Uuid,
        adaptive_delay_seconds: f64,
        adaptive_delay_floor_seconds: f64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE domains SET adaptive_delay_seconds = $2, adaptive_delay_floor_seconds = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(adaptive_delay_seconds)
        .bind(adaptive_delay_floor_seconds)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(())
    }

    async fn save_scheduler(&self, scheduler: &Scheduler) -> Result<(), StoreError> {
        let template_options = serde_json::to_value(&scheduler.template_options)?;
        let next_run_at = epoch_ms_to_datetime(scheduler.next_run_at);
        sqlx::query(
            r#"
            INSERT INTO schedulers (
                id, domain_id, organisation_id, interval, next_run_at, enabled, template_options
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE SET
                interval = EXCLUDED.interval,
                next_run_at = EXCLUDED.next_run_at,
                enabled = EXCLUDED.enabled,
                template_options = EXCLUDED.template_options
            "#,
        )
        .bind(scheduler.id)
        .bind(scheduler.domain_id)
        .bind(scheduler.organisation_id)
        .bind(schedule_interval_to_sql(scheduler.interval))
        .bind(next_run_at)
        .bind(scheduler.enabled)
        .bind(&template_options)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(())
    }

    async fn due_schedulers(&self, now_ms: Timestamp) -> Result<Vec<Scheduler>, StoreError> {
        let now = epoch_ms_to_datetime(now_ms);
        let rows = sqlx::query(
            "SELECT * FROM schedulers WHERE enabled = true AND next_run_at <= $1",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::from)?;

        rows.iter()
            .map(|row| {
                let template_options: serde_json::Value = row.get("template_options");
                Ok(Scheduler {
                    id: row.get("id"),
                    domain_id: row.get("domain_id"),
                    organisation_id: row.get("organisation_id"),
                    interval: schedule_interval_from_sql(row.get("interval")),
                    next_run_at: datetime_to_epoch_ms(row.get("next_run_at")),
                    enabled: row.get("enabled"),
                    template_options: serde_json::from_value(template_options)?,
                })
            })
            .collect()
    }

    async fn advance_scheduler(&self, id: Uuid, next_run_at: Timestamp) -> Result<(), StoreError> {
        sqlx::query("UPDATE schedulers SET next_run_at = $2 WHERE id = $1")
            .bind(id)
            .bind(epoch_ms_to_datetime(next_run_at))
            .execute(&self.pool)
            .await
            .map_err(StoreError::from)?;
        Ok(())
    }
}

fn counter_json_field(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "pending",
        TaskStatus::Waiting => "waiting",
        TaskStatus::Running => "running",
        TaskStatus::Completed => "completed",
        TaskStatus::Failed | TaskStatus::Blocked => "failed",
        TaskStatus::Skipped => "skipped",
    }
}

fn schedule_interval_to_sql(interval: ScheduleInterval) -> &'static str {
    match interval {
        ScheduleInterval::Hours6 => "hours6",
        ScheduleInterval::Hours12 => "hours12",
        ScheduleInterval::Hours24 => "hours24",
        ScheduleInterval::Hours48 => "hours48",
    }
}

fn schedule_interval_from_sql(s: &str) -> ScheduleInterval {
    match s {
        "hours6" => ScheduleInterval::Hours6,
        "hours12" => ScheduleInterval::Hours12,
        "hours48" => ScheduleInterval::Hours48,
        _ => ScheduleInterval::Hours24,
    }
}

async fn promote_waiting_for_job(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    job_id: Uuid,
) -> Result<u32, StoreError> {
    let job_row = sqlx::query("SELECT concurrency, counters FROM jobs WHERE id = $1 FOR UPDATE")
        .bind(job_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(StoreError::from)?;
    let job_row = match job_row {
        Some(r) => r,
        None => return Ok(0),
    };
    let concurrency: i32 = job_row.get("concurrency");
    let counters: JobCounters = serde_json::from_value(job_row.get("counters"))?;
    let freed = if concurrency == 0 {
        u32::MAX
    } else {
        (concurrency as u32).saturating_sub(counters.running)
    };
    if freed == 0 {
        return Ok(0);
    }

    let rows = sqlx::query(
        r#"
        SELECT id FROM tasks
        WHERE job_id = $1 AND status = 'waiting'
        ORDER BY priority_score DESC, created_at ASC, id ASC
        LIMIT $2
        FOR UPDATE SKIP LOCKED
        "#,
    )
    .bind(job_id)
    .bind(freed.min(i32::MAX as u32) as i64)
    .fetch_all(&mut **tx)
    .await
    .map_err(StoreError::from)?;
    let promoted = rows.len() as u32;
    if promoted == 0 {
        return Ok(0);
    }
    let ids: Vec<Uuid> = rows.iter().map(|r| r.get("id")).collect();

    sqlx::query("UPDATE tasks SET status = 'pending' WHERE id = ANY($1)")
        .bind(&ids)
        .execute(&mut **tx)
        .await
        .map_err(StoreError::from)?;
    sqlx::query(
        r#"
        UPDATE jobs SET counters = jsonb_set(
            jsonb_set(counters, '{waiting}', to_jsonb(GREATEST((counters->>'waiting')::int - $2, 0))),
            '{pending}', to_jsonb((counters->>'pending')::int + $2)
        ) WHERE id = $1
        "#,
    )
    .bind(job_id)
    .bind(promoted as i32)
    .execute(&mut **tx)
    .await
    .map_err(StoreError::from)?;

    Ok(promoted)
}

#[cfg(all(test, feature = "postgres"))]
mod tests {
    use super::*;
    use sqlx::PgPool;

    async fn setup() -> PostgresJobStore {
        let url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgresql:///blue_banded_bee_test".to_string());
        let pool = PgPool::connect(&url).await.expect("connect to db");
        sqlx::migrate!("./migrations").run(&pool).await.expect("run migrations");
        sqlx::query("TRUNCATE jobs, tasks, pages, domains, schedulers CASCADE")
            .execute(&pool)
            .await
            .unwrap();
        PostgresJobStore::new(pool)
    }

    fn sample_job(concurrency: u32) -> Job {
        Job::new(Uuid::now_v7(), Uuid::now_v7(), concurrency, JobOptions::default())
    }

    /// T-PG-1: round-trip a job through save/load.
    #[tokio::test]
    #[ignore]
    async fn job_round_trip() {
        let store = setup().await;
        let job = sample_job(5);
        store.save_job(&job).await.unwrap();
        let loaded = store.load_job(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, job.id);
        assert_eq!(loaded.concurrency, 5);
    }

    /// T-PG-2: claim respects concurrency and SKIP LOCKED under contention.
    #[tokio::test]
    #[ignore]
    async fn claim_next_task_respects_concurrency() {
        let store = setup().await;
        let job = sample_job(1);
        store.save_job(&job).await.unwrap();
        let refs = vec![
            PageRef { path: "/a".into(), priority_score: 1.0, source_type: SourceType::Manual, source_url: None },
            PageRef { path: "/b".into(), priority_score: 1.0, source_type: SourceType::Manual, source_url: None },
        ];
        store
            .enqueue_urls(job.id, &refs, &RobotsRules::default(), &[], &[], None, 3)
            .await
            .unwrap();

        let t1 = store.claim_next_task(job.id).await.unwrap();
        let t2 = store.claim_next_task(job.id).await.unwrap();
        assert!(t1.is_some());
        assert!(t2.is_none());
    }

    /// T-PG-3: terminal update frees a slot and promotes a waiting task.
    #[tokio::test]
    #[ignore]
    async fn batch_update_promotes_waiting() {
        let store = setup().await;
        let job = sample_job(1);
        store.save_job(&job).await.unwrap();
        let refs: Vec<PageRef> = (0..2)
            .map(|i| PageRef {
                path: format!("/p{i}"),
                priority_score: 1.0,
                source_type: SourceType::Manual,
                source_url: None,
            })
            .collect();
        store
            .enqueue_urls(job.id, &refs, &RobotsRules::default(), &[], &[], None, 1)
            .await
            .unwrap();
        let running = store.claim_next_task(job.id).await.unwrap().unwrap();

        store
            .batch_update_task_statuses(&[TaskUpdate {
                task_id: running.id,
                job_id: job.id,
                status: TaskStatus::Completed,
                outcome: TaskOutcome::default(),
                retry_count: 0,
                eligible_at: None,
            }])
            .await
            .unwrap();

        let reloaded = store.load_job(job.id).await.unwrap().unwrap();
        assert_eq!(reloaded.counters.completed, 1);
        assert_eq!(reloaded.counters.pending, 1);
    }
}
