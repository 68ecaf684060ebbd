//! Worker Pool (C5): a fleet of worker tasks that claim, crawl, and
//! settle tasks while respecting per-job concurrency and per-domain
//! rate limits. `Semaphore` + `JoinSet` + `CancellationToken` drawn from
//! the pack's `worker_pool.rs`/`master_orchestrator.rs` shapes, since the
//! teacher's own engine is single-threaded request/response and has no
//! equivalent pool to generalise from directly.

use crate::batch::BatchUpdatePipeline;
use crate::config::EngineConfig;
use crate::crawler::{Crawler, WarmOptions};
use crate::errors::CrawlError;
use crate::limiter::DomainLimiter;
use crate::store::JobStore;
use crate::types::*;
use futures::FutureExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Minimal in-memory bookkeeping per active job. The store remains the
/// source of truth for counters; this cache only speeds up admission
/// decisions in the worker loop.
#[derive(Clone, Debug)]
struct ActiveJob {
    job_id: Uuid,
    domain_id: Uuid,
    domain_name: String,
    concurrency: u32,
    robots: RobotsRules,
    find_links: bool,
    include_patterns: Vec<String>,
    exclude_patterns: Vec<String>,
    max_pages: Option<u32>,
}

pub struct WorkerPool {
    store: Arc<dyn JobStore>,
    crawler: Arc<dyn Crawler>,
    limiter: Arc<DomainLimiter>,
    batch: Arc<BatchUpdatePipeline>,
    config: EngineConfig,
    active_jobs: RwLock<Vec<ActiveJob>>,
    cancel: CancellationToken,
    running: AtomicBool,
    worker_handles: tokio::sync::Mutex<JoinSet<()>>,
}

impl WorkerPool {
    pub fn new(
        store: Arc<dyn JobStore>,
        crawler: Arc<dyn Crawler>,
        limiter: Arc<DomainLimiter>,
        batch: Arc<BatchUpdatePipeline>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            crawler,
            limiter,
            batch,
            config,
            active_jobs: RwLock::new(Vec::new()),
            cancel: CancellationToken::new(),
            running: AtomicBool::new(false),
            worker_handles: tokio::sync::Mutex::new(JoinSet::new()),
        }
    }

    /// Register a job with the pool: seed the domain limiter (restoring its
    /// persisted learned baseline first, per P6) and the in-memory
    /// admission cache.
    pub async fn add_job(&self, job: &Job, domain_name: &str, robots: RobotsRules) {
        if let Ok(Some(domain)) = self.store.load_domain(job.domain_id).await {
            self.limiter.restore(
                job.domain_id,
                domain.adaptive_delay_seconds,
                domain.adaptive_delay_floor_seconds,
            );
        }
        self.limiter
            .seed(job.domain_id, robots.crawl_delay_seconds.map(Duration::from_secs_f64));
        let mut jobs = self.active_jobs.write().await;
        jobs.retain(|j| j.job_id != job.id);
        jobs.push(ActiveJob {
            job_id: job.id,
            domain_id: job.domain_id,
            domain_name: domain_name.to_string(),
            concurrency: job.concurrency,
            robots,
            find_links: job.options.find_links,
            include_patterns: job.options.include_patterns.clone(),
            exclude_patterns: job.options.exclude_patterns.clone(),
            max_pages: job.options.max_pages,
        });
    }

    /// Drop a job's admission cache entry. Does not cancel in-flight
    /// tasks for the job; those finish or hit their own timeout.
    pub async fn remove_job(&self, job_id: Uuid) {
        self.active_jobs.write().await.retain(|j| j.job_id != job_id);
    }

    /// Spawn `worker_pool_size` worker loops.
    pub async fn start(self: &Arc<Self>) {
        self.running.store(true, Ordering::SeqCst);
        let mut handles = self.worker_handles.lock().await;
        for worker_id in 0..self.config.worker_pool_size {
            let pool = self.clone();
            handles.spawn(async move { pool.worker_loop(worker_id).await });
        }
    }

    /// Cancel the root token, wait for in-flight workers and the batch
    /// pipeline to drain before returning.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.cancel.cancel();
        let mut handles = self.worker_handles.lock().await;
        while handles.join_next().await.is_some() {}
        self.batch.stop().await;
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        let semaphore = Arc::new(Semaphore::new(self.config.worker_concurrency));
        let mut in_flight = JoinSet::new();
        let mut backoff = Duration::from_millis(50);
        let mut next_index: usize = 0;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let jobs_snapshot = self.active_jobs.read().await.clone();
            if jobs_snapshot.is_empty() {
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = self.cancel.cancelled() => break,
                }
                backoff = (backoff * 2).min(Duration::from_secs(5));
                continue;
            }

            let claimed = self
                .claim_fairly(&jobs_snapshot, &mut next_index, worker_id)
                .await;

            let Some((job, task)) = claimed else {
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = self.cancel.cancelled() => break,
                }
                backoff = (backoff * 2).min(Duration::from_secs(5));
                continue;
            };
            backoff = Duration::from_millis(50);

            let permit = match semaphore.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };

            let pool = self.clone();
            in_flight.spawn(async move {
                let _permit = permit;
                pool.run_task(job, task).await;
            });

            while in_flight.try_join_next().is_some() {}
        }

        while in_flight.join_next().await.is_some() {}
    }

    /// Round-robin across active jobs, skipping those at effective
    /// capacity or whose domain is backed off, and claim the next task
    /// for the first eligible one.
    async fn claim_fairly(
        &self,
        jobs: &[ActiveJob],
        next_index: &mut usize,
        _worker_id: usize,
    ) -> Option<(ActiveJob, Task)> {
        let n = jobs.len();
        for offset in 0..n {
            let idx = (*next_index + offset) % n;
            let job = &jobs[idx];

            if self.limiter.is_backed_off(job.domain_id).await {
                continue;
            }
            let advice = self.limiter.concurrency_advice(job.domain_id).await;
            let effective_concurrency = if job.concurrency == 0 {
                job.concurrency
            } else {
                job.concurrency.saturating_sub(advice).max(1)
            };
            if effective_concurrency != 0 {
                if let Ok(Some(current)) = self.store.load_job(job.job_id).await {
                    if current.counters.running >= effective_concurrency {
                        continue;
                    }
                }
            }

            if let Ok(Some(task)) = self.store.claim_next_task(job.job_id).await {
                *next_index = (idx + 1) % n;
                return Some((job.clone(), task));
            }
        }
        None
    }

    async fn run_task(self: Arc<Self>, job: ActiveJob, task: Task) {
        let outcome = std::panic::AssertUnwindSafe(self.process_task(&job, &task))
            .catch_unwind()
            .await;

        match outcome {
            Ok(()) => {}
            Err(panic) => {
                let message = panic_message(&panic);
                tracing::error!(task_id = %task.id, job_id = %job.job_id, %message, "worker panicked processing task");
                let _ = self
                    .store
                    .update_task_status(&TaskUpdate {
                        task_id: task.id,
                        job_id: job.job_id,
                        status: TaskStatus::Pending,
                        outcome: TaskOutcome::default(),
                        retry_count: task.retry_count,
                        eligible_at: None,
                    })
                    .await;
            }
        }
    }

    async fn process_task(&self, job: &ActiveJob, task: &Task) {
        let (_release, cancelled) = self.limiter.acquire(job.domain_id, &self.cancel).await;
        if cancelled {
            let _ = self
                .store
                .update_task_status(&TaskUpdate {
                    task_id: task.id,
                    job_id: job.job_id,
                    status: TaskStatus::Pending,
                    outcome: TaskOutcome::default(),
                    retry_count: task.retry_count,
                    eligible_at: None,
                })
                .await;
            return;
        }

        let warm_opts = WarmOptions {
            verify_second_request: false,
            user_agent: None,
        };
        let page_url = format!("https://{}{}", job.domain_name, task.path);

        let result = self.crawler.warm_url(&page_url, &warm_opts).await;
        tracing::debug!(url = %page_url, category = ?OutcomeCategory::of(&result), "task outcome classified");

        match result {
            Ok(warmed) => {
                self.limiter.record_success(job.domain_id).await;
                if job.find_links {
                    self.discover_links(job, task, &warmed.body, &page_url).await;
                }
                let outcome = TaskOutcome {
                    status_code: Some(warmed.status_code),
                    response_time_ms: Some(warmed.response_time_ms),
                    cache_status: warmed.cache_status,
                    second_response_time_ms: warmed.second_response_time_ms,
                    second_cache_status: warmed.second_cache_status,
                    error: None,
                    redirect_url: warmed.redirect_url,
                    content_hash: warmed.content_hash,
                };
                let update = TaskUpdate {
                    task_id: task.id,
                    job_id: job.job_id,
                    status: TaskStatus::Completed,
                    outcome,
                    retry_count: task.retry_count,
                    eligible_at: None,
                };
                let _ = self.batch.queue_task_update(update).await;
                let _ = self.store.reset_failure_streak(job.job_id).await;
            }
            Err(CrawlError::Blocking { retry_after_ms, .. }) => {
                let retry_after = self.limiter.record_blocked(job.domain_id).await;
                let retry_after_ms = retry_after_ms.unwrap_or(retry_after.as_millis() as u64);
                self.handle_blocking(job, task, retry_after_ms).await;
            }
            Err(CrawlError::Retryable { message }) => {
                self.handle_retryable(job, task, &message).await;
            }
            Err(CrawlError::Terminal { message, .. }) => {
                self.fail_task(job, task, &truncate(&message)).await;
            }
            Err(CrawlError::Skip { .. }) => {
                let update = TaskUpdate {
                    task_id: task.id,
                    job_id: job.job_id,
                    status: TaskStatus::Skipped,
                    outcome: TaskOutcome::default(),
                    retry_count: task.retry_count,
                    eligible_at: None,
                };
                let _ = self.batch.queue_task_update(update).await;
            }
        }
    }

    async fn discover_links(&self, job: &ActiveJob, task: &Task, body: &str, base_url: &str) {
        let Ok(links) = self.crawler.extract_links(base_url, body).await else {
            return;
        };
        if links.is_empty() {
            return;
        }
        let refs: Vec<PageRef> = links
            .into_iter()
            .map(|link| PageRef {
                path: link.url,
                priority_score: task.priority_score * SourceType::LinkDiscovery.base_priority()
                    / SourceType::Homepage.base_priority(),
                source_type: SourceType::LinkDiscovery,
                source_url: Some(base_url.to_string()),
            })
            .collect();
        let _ = self
            .store
            .enqueue_urls(
                job.job_id,
                &refs,
                &job.robots,
                &job.include_patterns,
                &job.exclude_patterns,
                job.max_pages,
                self.config.overflow_factor,
            )
            .await;
    }

    async fn handle_blocking(&self, job: &ActiveJob, task: &Task, retry_after_ms: u64) {
        if task.retry_count < self.config.max_blocking_retries {
            let update = TaskUpdate {
                task_id: task.id,
                job_id: job.job_id,
                status: TaskStatus::Pending,
                outcome: TaskOutcome {
                    error: Some("blocked".to_string()),
                    ..Default::default()
                },
                retry_count: task.retry_count + 1,
                eligible_at: Some(now_ms() + retry_after_ms as i64),
            };
            let _ = self.store.update_task_status(&update).await;
        } else {
            self.fail_task(job, task, "blocked: too many blocking responses").await;
        }
        self.bump_failure_streak(job).await;
    }

    async fn handle_retryable(&self, job: &ActiveJob, task: &Task, message: &str) {
        if task.retry_count < self.config.max_retryable_retries {
            let update = TaskUpdate {
                task_id: task.id,
                job_id: job.job_id,
                status: TaskStatus::Pending,
                outcome: TaskOutcome {
                    error: Some(truncate(message)),
                    ..Default::default()
                },
                retry_count: task.retry_count + 1,
                eligible_at: None,
            };
            let _ = self.store.update_task_status(&update).await;
        } else {
            self.fail_task(job, task, &truncate(message)).await;
        }
    }

    async fn fail_task(&self, job: &ActiveJob, task: &Task, message: &str) {
        let update = TaskUpdate {
            task_id: task.id,
            job_id: job.job_id,
            status: TaskStatus::Failed,
            outcome: TaskOutcome {
                error: Some(message.to_string()),
                ..Default::default()
            },
            retry_count: task.retry_count,
            eligible_at: None,
        };
        let _ = self.batch.queue_task_update(update).await;
        self.bump_failure_streak(job).await;
    }

    async fn bump_failure_streak(&self, job: &ActiveJob) {
        if let Ok(streak) = self.store.increment_failure_streak(job.job_id).await {
            if streak >= self.config.job_failure_streak_threshold {
                let _ = self
                    .store
                    .update_job_status(
                        job.job_id,
                        JobStatus::Failed,
                        Some("too many consecutive failures".to_string()),
                    )
                    .await;
            }
        }
    }
}

fn truncate(message: &str) -> String {
    const MAX_LEN: usize = 500;
    if message.len() <= MAX_LEN {
        message.to_string()
    } else {
        format!("{}…", &message[..MAX_LEN])
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::NullCrawler;
    use crate::store_memory::MemoryStore;

    fn test_config() -> EngineConfig {
        let mut cfg = EngineConfig::default();
        cfg.worker_pool_size = 1;
        cfg.worker_concurrency = 2;
        cfg.domain_default_base_delay = Duration::from_millis(1);
        cfg
    }

    async fn make_pool(crawler: Arc<NullCrawler>) -> (Arc<WorkerPool>, Arc<dyn JobStore>, Job) {
        let store: Arc<dyn JobStore> = Arc::new(MemoryStore::new());
        let config = test_config();
        let limiter = Arc::new(DomainLimiter::new(config.clone()));
        let batch = Arc::new(BatchUpdatePipeline::start(
            store.clone(),
            64,
            100,
            Duration::from_millis(20),
            Duration::from_secs(5),
        ));
        let pool = Arc::new(WorkerPool::new(store.clone(), crawler, limiter, batch, config));

        let job = Job::new(Uuid::now_v7(), Uuid::now_v7(), 2, JobOptions::default());
        store.save_job(&job).await.unwrap();
        let refs: Vec<PageRef> = (0..5)
            .map(|i| PageRef {
                path: format!("/p{i}"),
                priority_score: 1.0,
                source_type: SourceType::Homepage,
                source_url: None,
            })
            .collect();
        store
            .enqueue_urls(job.id, &refs, &RobotsRules::default(), &[], &[], None, 3)
            .await
            .unwrap();
        pool.add_job(&job, "example.com", RobotsRules::default()).await;
        (pool, store, job)
    }

    #[tokio::test]
    async fn worker_pool_completes_all_seeded_tasks() {
        let crawler = Arc::new(NullCrawler::new());
        let (pool, store, job) = make_pool(crawler).await;
        pool.start().await;

        let mut remaining = 50;
        loop {
            let reloaded = store.load_job(job.id).await.unwrap().unwrap();
            let closed = reloaded.counters.completed + reloaded.counters.failed;
            if closed >= 5 || remaining == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            remaining -= 1;
        }
        pool.stop().await;

        let reloaded = store.load_job(job.id).await.unwrap().unwrap();
        assert_eq!(reloaded.counters.completed, 5, "all five seeded tasks should complete");
    }

    #[tokio::test]
    async fn blocking_response_reschedules_then_fails_after_max_retries() {
        let crawler = Arc::new(NullCrawler::new());
        for _ in 0..10 {
            crawler.push_response(Err(CrawlError::Blocking {
                status_code: Some(429),
                retry_after_ms: Some(1),
            }));
        }
        let (pool, store, job) = make_pool(crawler).await;
        pool.start().await;

        let mut remaining = 100;
        loop {
            let reloaded = store.load_job(job.id).await.unwrap().unwrap();
            if reloaded.counters.failed > 0 || remaining == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            remaining -= 1;
        }
        pool.stop().await;

        let reloaded = store.load_job(job.id).await.unwrap().unwrap();
        assert!(reloaded.counters.failed > 0, "expected at least one task to fail after exhausting blocking retries");
    }
}
