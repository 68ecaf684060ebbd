use std::time::Duration;

/// The full configuration surface named in the spec (§6), collected into
/// one struct the way the teacher's engine takes a single `Arc<dyn
/// ProcessStore>` constructor argument — here `EngineConfig` is the single
/// value threaded through `WorkerPool::new`, `DomainLimiter::new`, and
/// `BatchUpdatePipeline::new`.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub worker_pool_size: usize,
    pub worker_concurrency: usize,
    pub task_processing_timeout: Duration,
    pub stale_task_grace: Duration,
    pub recovery_interval: Duration,
    pub max_job_concurrency: u32,

    pub batch_max_size: usize,
    pub batch_max_interval: Duration,
    pub batch_flush_timeout: Duration,

    pub db_concurrency_cap: usize,

    pub domain_default_base_delay: Duration,
    pub domain_max_adaptive_delay: Duration,
    pub domain_success_probe_threshold: u32,
    pub domain_growth_step: Duration,
    pub domain_probe_step: Duration,
    pub domain_concurrency_reduction_step: Duration,
    pub domain_idle_ttl: Duration,
    pub domain_persist_interval: Duration,

    pub max_blocking_retries: u32,
    pub max_retryable_retries: u32,
    pub job_failure_streak_threshold: u32,

    pub scheduler_tick_interval: Duration,
    pub overflow_factor: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 4,
            worker_concurrency: 5,
            task_processing_timeout: Duration::from_secs(120),
            stale_task_grace: Duration::from_secs(180),
            recovery_interval: Duration::from_secs(60),
            max_job_concurrency: 50,

            batch_max_size: 100,
            batch_max_interval: Duration::from_secs(5),
            batch_flush_timeout: Duration::from_secs(30),

            db_concurrency_cap: 20,

            domain_default_base_delay: Duration::from_millis(500),
            domain_max_adaptive_delay: Duration::from_secs(60),
            domain_success_probe_threshold: 20,
            domain_growth_step: Duration::from_millis(500),
            domain_probe_step: Duration::from_millis(500),
            domain_concurrency_reduction_step: Duration::from_secs(5),
            domain_idle_ttl: Duration::from_secs(3600),
            domain_persist_interval: Duration::from_secs(30),

            max_blocking_retries: 3,
            max_retryable_retries: 3,
            job_failure_streak_threshold: 20,

            scheduler_tick_interval: Duration::from_secs(30),
            overflow_factor: 3,
        }
    }
}

impl EngineConfig {
    /// Load overrides from `BBB_*` environment variables, falling back to
    /// `Default::default()` for anything unset or unparsable — mirrors the
    /// teacher's `parse_database_url`'s "look at the environment, fall back
    /// silently" style in `bpmn-lite-server/src/main.rs`.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(v) = env_usize("BBB_WORKER_POOL_SIZE") {
            cfg.worker_pool_size = v;
        }
        if let Some(v) = env_usize("BBB_WORKER_CONCURRENCY") {
            cfg.worker_concurrency = v;
        }
        if let Some(v) = env_u32("BBB_MAX_JOB_CONCURRENCY") {
            cfg.max_job_concurrency = v;
        }
        if let Some(v) = env_usize("BBB_BATCH_MAX_SIZE") {
            cfg.batch_max_size = v;
        }
        if let Some(v) = env_usize("BBB_DB_CONCURRENCY_CAP") {
            cfg.db_concurrency_cap = v;
        }
        if let Some(v) = env_u32("BBB_MAX_BLOCKING_RETRIES") {
            cfg.max_blocking_retries = v;
        }
        if let Some(v) = env_u32("BBB_MAX_RETRYABLE_RETRIES") {
            cfg.max_retryable_retries = v;
        }
        if let Some(v) = env_u32("BBB_JOB_FAILURE_STREAK_THRESHOLD") {
            cfg.job_failure_streak_threshold = v;
        }
        cfg
    }
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
