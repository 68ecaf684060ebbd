use crate::errors::CrawlError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ─── Scalar aliases ───────────────────────────────────────────

/// Epoch milliseconds (UTC).
pub type Timestamp = i64;

pub fn now_ms() -> Timestamp {
    chrono_now_ms()
}

#[cfg(feature = "postgres")]
fn chrono_now_ms() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(not(feature = "postgres"))]
fn chrono_now_ms() -> Timestamp {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// ─── Job ────────────────────────────────────────────────────

/// Top-level job status. `Blocked` is not a separate terminal state — per
/// the spec's open question, "blocked" is a sub-reason of `Failed` carried
/// in `Task::error`, not a distinct job or task status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "postgres", derive(sqlx::Type))]
#[cfg_attr(feature = "postgres", sqlx(type_name = "job_status", rename_all = "lowercase"))]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// Where a job's seed tasks came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "postgres", derive(sqlx::Type))]
#[cfg_attr(feature = "postgres", sqlx(type_name = "source_type", rename_all = "lowercase"))]
pub enum SourceType {
    Homepage,
    Sitemap,
    LinkDiscovery,
    Scheduler,
    Manual,
}

impl SourceType {
    /// Default priority inheritance per §9 open question: homepage = 1.0,
    /// sitemap = 0.5, link-discovered = 80% of the discovering task's score.
    pub fn base_priority(self) -> f64 {
        match self {
            SourceType::Homepage => 1.0,
            SourceType::Sitemap => 0.5,
            SourceType::LinkDiscovery => 0.4,
            SourceType::Scheduler => 0.5,
            SourceType::Manual => 0.5,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct JobOptions {
    pub find_links: bool,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub max_pages: Option<u32>,
    pub source_type: Option<SourceType>,
    pub source_detail: Option<String>,
    pub scheduler_id: Option<Uuid>,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobCounters {
    pub total: u32,
    pub pending: u32,
    pub waiting: u32,
    pub running: u32,
    pub completed: u32,
    pub failed: u32,
    pub skipped: u32,
}

impl JobCounters {
    /// Invariant 1: for non-terminal jobs `pending + running + waiting +
    /// completed + failed + skipped <= total`.
    pub fn is_consistent(&self, total_authoritative: u32) -> bool {
        let sum = self.pending + self.running + self.waiting + self.completed
            + self.failed
            + self.skipped;
        sum <= total_authoritative
    }

    /// Invariant 1: `total == completed + failed + skipped` iff terminal.
    pub fn is_closed(&self) -> bool {
        self.completed + self.failed + self.skipped >= self.total
    }
}

/// Precomputed summary attached to a job on completion (§4.6 supplement).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobSummary {
    pub duration_ms: i64,
    pub avg_response_time_ms: Option<f64>,
    pub success_ratio: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub domain_id: Uuid,
    pub organisation_id: Uuid,
    pub status: JobStatus,
    pub concurrency: u32,
    pub counters: JobCounters,
    pub options: JobOptions,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub error_message: Option<String>,
    pub failure_streak: u32,
    pub summary: Option<JobSummary>,
}

impl Job {
    pub fn new(domain_id: Uuid, organisation_id: Uuid, concurrency: u32, options: JobOptions) -> Self {
        Self {
            id: Uuid::now_v7(),
            domain_id,
            organisation_id,
            status: JobStatus::Pending,
            concurrency,
            counters: JobCounters::default(),
            options,
            created_at: now_ms(),
            started_at: None,
            completed_at: None,
            error_message: None,
            failure_streak: 0,
            summary: None,
        }
    }
}

// ─── Task ───────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "postgres", derive(sqlx::Type))]
#[cfg_attr(feature = "postgres", sqlx(type_name = "task_status", rename_all = "lowercase"))]
pub enum TaskStatus {
    Pending,
    Waiting,
    Running,
    Completed,
    Failed,
    Skipped,
    Blocked,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub status_code: Option<u16>,
    pub response_time_ms: Option<u32>,
    pub cache_status: Option<String>,
    pub second_response_time_ms: Option<u32>,
    pub second_cache_status: Option<String>,
    pub error: Option<String>,
    pub redirect_url: Option<String>,
    pub content_hash: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub job_id: Uuid,
    pub page_id: Uuid,
    pub path: String,
    pub status: TaskStatus,
    pub priority_score: f64,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub retry_count: u32,
    pub source_type: SourceType,
    pub source_url: Option<String>,
    pub eligible_at: Option<Timestamp>,
    pub outcome: TaskOutcome,
}

impl Task {
    pub fn new(job_id: Uuid, page_id: Uuid, path: String, priority_score: f64, source_type: SourceType) -> Self {
        Self {
            id: Uuid::now_v7(),
            job_id,
            page_id,
            path,
            status: TaskStatus::Pending,
            priority_score,
            created_at: now_ms(),
            started_at: None,
            completed_at: None,
            retry_count: 0,
            source_type,
            source_url: None,
            eligible_at: None,
            outcome: TaskOutcome::default(),
        }
    }
}

/// Terminal/retry snapshot handed to the batch pipeline (C2) or applied
/// directly by the worker for non-batched transitions.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub task_id: Uuid,
    pub job_id: Uuid,
    pub status: TaskStatus,
    pub outcome: TaskOutcome,
    pub retry_count: u32,
    pub eligible_at: Option<Timestamp>,
}

// ─── Page ───────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Page {
    pub id: Uuid,
    pub domain_id: Uuid,
    pub path: String,
    pub latest_priority_score: f64,
    pub latest_content_hash: Option<String>,
}

/// A URL reference passed to `EnqueueURLs`, pre-normalisation already
/// applied by the caller (leading slash, no fragment).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PageRef {
    pub path: String,
    pub priority_score: f64,
    pub source_type: SourceType,
    pub source_url: Option<String>,
}

// ─── Domain ─────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Domain {
    pub id: Uuid,
    pub name: String,
    pub organisation_id: Uuid,
    pub crawl_delay_seconds: Option<f64>,
    pub adaptive_delay_seconds: f64,
    pub adaptive_delay_floor_seconds: f64,
}

// ─── Scheduler ──────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleInterval {
    Hours6,
    Hours12,
    Hours24,
    Hours48,
}

impl ScheduleInterval {
    pub fn as_millis(self) -> i64 {
        let hours: i64 = match self {
            ScheduleInterval::Hours6 => 6,
            ScheduleInterval::Hours12 => 12,
            ScheduleInterval::Hours24 => 24,
            ScheduleInterval::Hours48 => 48,
        };
        hours * 3_600_000
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Scheduler {
    pub id: Uuid,
    pub domain_id: Uuid,
    pub organisation_id: Uuid,
    pub interval: ScheduleInterval,
    pub next_run_at: Timestamp,
    pub enabled: bool,
    pub template_options: JobOptions,
}

// ─── Robots rules (in-memory per job/domain) ───────────────

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RobotsRules {
    pub disallow: Vec<String>,
    pub crawl_delay_seconds: Option<f64>,
}

impl RobotsRules {
    pub fn is_disallowed(&self, path: &str) -> bool {
        self.disallow
            .iter()
            .any(|pattern| path.starts_with(pattern.as_str()))
    }
}

// ─── Error classification shared between store and crawler ─

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutcomeCategory {
    Success,
    Blocking,
    Retryable,
    Terminal,
    Skipped,
}

impl OutcomeCategory {
    pub fn of<T>(result: &Result<T, CrawlError>) -> Self {
        match result {
            Ok(_) => Self::Success,
            Err(CrawlError::Blocking { .. }) => Self::Blocking,
            Err(CrawlError::Retryable { .. }) => Self::Retryable,
            Err(CrawlError::Terminal { .. }) => Self::Terminal,
            Err(CrawlError::Skip { .. }) => Self::Skipped,
        }
    }
}
