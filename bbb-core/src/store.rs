use crate::errors::StoreError;
use crate::types::*;
use async_trait::async_trait;
use uuid::Uuid;

/// Persistence trait for all core state (§4.1). The worker pool, job
/// manager, and monitors operate exclusively through this trait, enabling
/// pluggable backends (`MemoryStore` for tests, `PostgresJobStore` for
/// production) the same way `bpmn-lite`'s engine operates only through
/// `ProcessStore`.
#[async_trait]
pub trait JobStore: Send + Sync {
    // ── Jobs ──

    async fn save_job(&self, job: &Job) -> Result<(), StoreError>;
    async fn load_job(&self, id: Uuid) -> Result<Option<Job>, StoreError>;
    async fn update_job_status(
        &self,
        id: Uuid,
        status: JobStatus,
        error_message: Option<String>,
    ) -> Result<(), StoreError>;
    async fn find_active_job(
        &self,
        domain_id: Uuid,
        organisation_id: Uuid,
    ) -> Result<Option<Job>, StoreError>;
    async fn complete_job(&self, id: Uuid, summary: JobSummary) -> Result<(), StoreError>;
    async fn increment_failure_streak(&self, id: Uuid) -> Result<u32, StoreError>;
    async fn reset_failure_streak(&self, id: Uuid) -> Result<(), StoreError>;

    /// Every job not yet in a terminal status, for monitors that need to
    /// scan active jobs (closure detection, reconciliation callers outside
    /// the store itself).
    async fn list_open_jobs(&self) -> Result<Vec<Job>, StoreError>;

    // ── Pages ──

    /// Look up or create a page for (domain, path). Unique on (domain_id, path).
    async fn ensure_page(&self, domain_id: Uuid, path: &str) -> Result<Uuid, StoreError>;
    async fn page_has_open_task(&self, job_id: Uuid, page_id: Uuid) -> Result<bool, StoreError>;

    // ── Task queue (C1 core contract) ──

    /// In one transaction: lock the job row, check `running < concurrency`,
    /// select the highest `priority_score`, earliest `created_at` eligible
    /// pending task with `FOR UPDATE SKIP LOCKED`, set it running, bump the
    /// job's `running` counter. Returns `None` if no eligible task exists.
    async fn claim_next_task(&self, job_id: Uuid) -> Result<Option<Task>, StoreError>;

    /// Apply a single terminal/retry transition; decrements `running` if
    /// leaving that state and promotes up to the freed slot count from
    /// waiting to pending, atomically.
    async fn update_task_status(&self, update: &TaskUpdate) -> Result<(), StoreError>;

    /// Bulk-apply a batch of updates, grouped by target status, in one
    /// transaction per status bucket, decrementing `running` counters per
    /// job and promoting waiting tasks within the same transaction.
    async fn batch_update_task_statuses(&self, updates: &[TaskUpdate]) -> Result<(), StoreError>;

    /// Insert new tasks for `job_id`, splitting between `pending` and
    /// `waiting` so at most `concurrency * overflow_factor` are pending.
    /// Skips pages that already have a non-terminal task for this job, and
    /// anything disallowed by `robots` or excluded by path patterns.
    #[allow(clippy::too_many_arguments)]
    async fn enqueue_urls(
        &self,
        job_id: Uuid,
        refs: &[PageRef],
        robots: &RobotsRules,
        include: &[String],
        exclude: &[String],
        max_pages: Option<u32>,
        overflow_factor: u32,
    ) -> Result<EnqueueReport, StoreError>;

    /// Reset any task stuck in `running` with `started_at` older than
    /// `grace_ms` back to `pending`, decrementing the owning job's
    /// `running` counter. Uses skip-locked semantics.
    async fn recover_stale_tasks(&self, grace_ms: i64) -> Result<u32, StoreError>;

    /// For every job with `running < concurrency`, promote up to the freed
    /// slot count of `waiting` tasks to `pending`.
    async fn promote_waiting_tasks(&self) -> Result<u32, StoreError>;

    /// Recompute each active job's `running` counter from actual task rows.
    async fn reconcile_running_counters(&self) -> Result<u32, StoreError>;

    // ── Domain I/O ──

    async fn load_domain(&self, id: Uuid) -> Result<Option<Domain>, StoreError>;
    async fn ensure_domain(&self, name: &str, organisation_id: Uuid) -> Result<Domain, StoreError>;
    async fn persist_domain_delay(
        &self,
        id: Uuid,
        adaptive_delay_seconds: f64,
        adaptive_delay_floor_seconds: f64,
    ) -> Result<(), StoreError>;

    // ── Scheduler I/O ──

    async fn save_scheduler(&self, scheduler: &Scheduler) -> Result<(), StoreError>;
    async fn due_schedulers(&self, now_ms: Timestamp) -> Result<Vec<Scheduler>, StoreError>;
    async fn advance_scheduler(&self, id: Uuid, next_run_at: Timestamp) -> Result<(), StoreError>;
}

/// Outcome of `enqueue_urls`, for callers (job manager, link discovery) to
/// log and for S6-style scenario tests to assert counts against.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EnqueueReport {
    pub pending: u32,
    pub waiting: u32,
    pub skipped_robots: u32,
    pub skipped_pattern: u32,
    pub skipped_duplicate: u32,
    pub skipped_max_pages: u32,
}

impl EnqueueReport {
    pub fn enqueued(&self) -> u32 {
        self.pending + self.waiting
    }
}
