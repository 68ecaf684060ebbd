use crate::errors::StoreError;
use crate::store::{EnqueueReport, JobStore};
use crate::types::*;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

const OPEN_TASK_STATUSES: [TaskStatus; 3] =
    [TaskStatus::Pending, TaskStatus::Waiting, TaskStatus::Running];

fn is_open(status: TaskStatus) -> bool {
    OPEN_TASK_STATUSES.contains(&status)
}

fn is_terminal_task(status: TaskStatus) -> bool {
    matches!(
        status,
        TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped | TaskStatus::Blocked
    )
}

/// Move one unit of counter mass between buckets. `Blocked` is folded into
/// the `failed` bucket — the spec's §9 open question resolves "blocked vs
/// failed as distinct terminal states" in favour of treating blocked as a
/// sub-reason of failed (see DESIGN.md), and `JobCounters` has no separate
/// `blocked` field to track it in.
fn counter_field(counters: &mut JobCounters, status: TaskStatus) -> &mut u32 {
    match status {
        TaskStatus::Pending => &mut counters.pending,
        TaskStatus::Waiting => &mut counters.waiting,
        TaskStatus::Running => &mut counters.running,
        TaskStatus::Completed => &mut counters.completed,
        TaskStatus::Failed | TaskStatus::Blocked => &mut counters.failed,
        TaskStatus::Skipped => &mut counters.skipped,
    }
}

fn move_counter(counters: &mut JobCounters, from: TaskStatus, to: TaskStatus) {
    let f = counter_field(counters, from);
    *f = f.saturating_sub(1);
    let t = counter_field(counters, to);
    *t += 1;
}

struct Inner {
    jobs: HashMap<Uuid, Job>,
    tasks: HashMap<Uuid, Task>,
    pages: HashMap<Uuid, Page>,
    pages_by_domain_path: HashMap<(Uuid, String), Uuid>,
    domains: HashMap<Uuid, Domain>,
    domains_by_name: HashMap<String, Uuid>,
    schedulers: HashMap<Uuid, Scheduler>,
}

/// In-memory implementation of `JobStore`, used in unit tests and as a
/// `DATABASE_URL`-less fallback, mirroring the teacher's `MemoryStore`
/// (one `Inner` struct behind one `RwLock`).
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                jobs: HashMap::new(),
                tasks: HashMap::new(),
                pages: HashMap::new(),
                pages_by_domain_path: HashMap::new(),
                domains: HashMap::new(),
                domains_by_name: HashMap::new(),
                schedulers: HashMap::new(),
            }),
        }
    }

    /// Test/debug helper: snapshot a job's counters without going through
    /// the trait object.
    pub async fn counters_of(&self, job_id: Uuid) -> Option<JobCounters> {
        self.inner.read().await.jobs.get(&job_id).map(|j| j.counters)
    }

    /// Test/debug helper: snapshot every task belonging to a job.
    pub async fn tasks_for_job(&self, job_id: Uuid) -> Vec<Task> {
        self.inner
            .read()
            .await
            .tasks
            .values()
            .filter(|t| t.job_id == job_id)
            .cloned()
            .collect()
    }

    fn promote_waiting_for_job(inner: &mut Inner, job_id: Uuid) -> u32 {
        let job = match inner.jobs.get(&job_id) {
            Some(j) => j.clone(),
            None => return 0,
        };
        let freed = if job.concurrency == 0 {
            u32::MAX
        } else {
            job.concurrency.saturating_sub(job.counters.running)
        };
        if freed == 0 {
            return 0;
        }
        let mut waiting: Vec<Uuid> = inner
            .tasks
            .values()
            .filter(|t| t.job_id == job_id && t.status == TaskStatus::Waiting)
            .map(|t| t.id)
            .collect();
        waiting.sort_by(|a, b| {
            let ta = &inner.tasks[a];
            let tb = &inner.tasks[b];
            tb.priority_score
                .partial_cmp(&ta.priority_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(ta.created_at.cmp(&tb.created_at))
                .then(ta.id.cmp(&tb.id))
        });
        let take = waiting.len().min(freed as usize);
        let job_mut = inner.jobs.get_mut(&job_id).unwrap();
        for id in waiting.into_iter().take(take) {
            let t = inner.tasks.get_mut(&id).unwrap();
            move_counter(&mut job_mut.counters, TaskStatus::Waiting, TaskStatus::Pending);
            t.status = TaskStatus::Pending;
        }
        take as u32
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn save_job(&self, job: &Job) -> Result<(), StoreError> {
        self.inner.write().await.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn load_job(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.inner.read().await.jobs.get(&id).cloned())
    }

    async fn update_job_status(
        &self,
        id: Uuid,
        status: JobStatus,
        error_message: Option<String>,
    ) -> Result<(), StoreError> {
        let mut w = self.inner.write().await;
        if let Some(job) = w.jobs.get_mut(&id) {
            if status == JobStatus::Running && job.started_at.is_none() {
                job.started_at = Some(now_ms());
            }
            if status.is_terminal() {
                job.completed_at = Some(now_ms());
            }
            job.status = status;
            job.error_message = error_message;
        }
        Ok(())
    }

    async fn find_active_job(
        &self,
        domain_id: Uuid,
        organisation_id: Uuid,
    ) -> Result<Option<Job>, StoreError> {
        let w = self.inner.read().await;
        Ok(w.jobs
            .values()
            .find(|j| {
                j.domain_id == domain_id
                    && j.organisation_id == organisation_id
                    && !j.status.is_terminal()
            })
            .cloned())
    }

    async fn complete_job(&self, id: Uuid, summary: JobSummary) -> Result<(), StoreError> {
        let mut w = self.inner.write().await;
        if let Some(job) = w.jobs.get_mut(&id) {
            job.status = JobStatus::Completed;
            job.completed_at = Some(now_ms());
            job.summary = Some(summary);
        }
        Ok(())
    }

    async fn increment_failure_streak(&self, id: Uuid) -> Result<u32, StoreError> {
        let mut w = self.inner.write().await;
        let job = w
            .jobs
            .get_mut(&id)
            .ok_or_else(|| StoreError::Data(format!("job {id} not found")))?;
        job.failure_streak += 1;
        Ok(job.failure_streak)
    }

    async fn reset_failure_streak(&self, id: Uuid) -> Result<(), StoreError> {
        if let Some(job) = self.inner.write().await.jobs.get_mut(&id) {
            job.failure_streak = 0;
        }
        Ok(())
    }

    async fn list_open_jobs(&self) -> Result<Vec<Job>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .jobs
            .values()
            .filter(|j| !j.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn ensure_page(&self, domain_id: Uuid, path: &str) -> Result<Uuid, StoreError> {
        let mut w = self.inner.write().await;
        let key = (domain_id, path.to_string());
        if let Some(id) = w.pages_by_domain_path.get(&key) {
            return Ok(*id);
        }
        let id = Uuid::now_v7();
        w.pages.insert(
            id,
            Page {
                id,
                domain_id,
                path: path.to_string(),
                latest_priority_score: 0.0,
                latest_content_hash: None,
            },
        );
        w.pages_by_domain_path.insert(key, id);
        Ok(id)
    }

    async fn page_has_open_task(&self, job_id: Uuid, page_id: Uuid) -> Result<bool, StoreError> {
        let w = self.inner.read().await;
        Ok(w.tasks
            .values()
            .any(|t| t.job_id == job_id && t.page_id == page_id && is_open(t.status)))
    }

    async fn claim_next_task(&self, job_id: Uuid) -> Result<Option<Task>, StoreError> {
        let mut w = self.inner.write().await;
        let job = match w.jobs.get(&job_id) {
            Some(j) => j.clone(),
            None => return Ok(None),
        };
        if job.status.is_terminal() || job.status == JobStatus::Paused {
            return Ok(None);
        }
        if job.concurrency != 0 && job.counters.running >= job.concurrency {
            return Ok(None);
        }
        let now = now_ms();
        let mut candidates: Vec<Uuid> = w
            .tasks
            .values()
            .filter(|t| {
                t.job_id == job_id
                    && t.status == TaskStatus::Pending
                    && t.eligible_at.map(|e| e <= now).unwrap_or(true)
            })
            .map(|t| t.id)
            .collect();
        if candidates.is_empty() {
            return Ok(None);
        }
        candidates.sort_by(|a, b| {
            let ta = &w.tasks[a];
            let tb = &w.tasks[b];
            tb.priority_score
                .partial_cmp(&ta.priority_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(ta.created_at.cmp(&tb.created_at))
                .then(ta.id.cmp(&tb.id))
        });
        let chosen_id = candidates[0];
        let job_mut = w.jobs.get_mut(&job_id).unwrap();
        move_counter(&mut job_mut.counters, TaskStatus::Pending, TaskStatus::Running);
        if job_mut.status == JobStatus::Pending {
            job_mut.status = JobStatus::Running;
            job_mut.started_at = Some(now);
        }
        let task = w.tasks.get_mut(&chosen_id).unwrap();
        task.status = TaskStatus::Running;
        task.started_at = Some(now);
        Ok(Some(task.clone()))
    }

    async fn update_task_status(&self, update: &TaskUpdate) -> Result<(), StoreError> {
        let mut w = self.inner.write().await;
        let old_status = match w.tasks.get(&update.task_id) {
            Some(t) => t.status,
            None => return Err(StoreError::Data(format!("task {} not found", update.task_id))),
        };
        {
            let task = w.tasks.get_mut(&update.task_id).unwrap();
            task.status = update.status;
            task.outcome = update.outcome.clone();
            task.retry_count = update.retry_count;
            task.eligible_at = update.eligible_at;
            task.completed_at = if is_terminal_task(update.status) {
                Some(now_ms())
            } else {
                None
            };
            if update.status == TaskStatus::Pending {
                task.started_at = None;
            }
        }
        if let Some(job) = w.jobs.get_mut(&update.job_id) {
            move_counter(&mut job.counters, old_status, update.status);
        }
        if old_status == TaskStatus::Running && update.status != TaskStatus::Running {
            Self::promote_waiting_for_job(&mut w, update.job_id);
        }
        Ok(())
    }

    async fn batch_update_task_statuses(&self, updates: &[TaskUpdate]) -> Result<(), StoreError> {
        let mut w = self.inner.write().await;
        let mut touched_jobs = std::collections::HashSet::new();
        for update in updates {
            let old_status = match w.tasks.get(&update.task_id) {
                Some(t) => t.status,
                None => continue,
            };
            {
                let task = w.tasks.get_mut(&update.task_id).unwrap();
                task.status = update.status;
                task.outcome = update.outcome.clone();
                task.retry_count = update.retry_count;
                task.eligible_at = update.eligible_at;
                task.completed_at = if is_terminal_task(update.status) {
                    Some(now_ms())
                } else {
                    None
                };
                if update.status == TaskStatus::Pending {
                    task.started_at = None;
                }
            }
            if let Some(job) = w.jobs.get_mut(&update.job_id) {
                move_counter(&mut job.counters, old_status, update.status);
            }
            if old_status == TaskStatus::Running && update.status != TaskStatus::Running {
                touched_jobs.insert(update.job_id);
            }
        }
        for job_id in touched_jobs {
            Self::promote_waiting_for_job(&mut w, job_id);
        }
        Ok(())
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
        let mut w = self.inner.write().await;
        let job = match w.jobs.get(&job_id) {
            Some(j) => j.clone(),
            None => return Err(StoreError::Data(format!("job {job_id} not found"))),
        };
        let mut report = EnqueueReport::default();
        let pending_capacity = if job.concurrency == 0 {
            u32::MAX
        } else {
            job.concurrency.saturating_mul(overflow_factor.max(1))
        };
        let mut pending_used = job.counters.pending;
        let mut total_so_far = job.counters.total;

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
            let page_key = (job.domain_id, r.path.clone());
            let page_id = if let Some(id) = w.pages_by_domain_path.get(&page_key) {
                *id
            } else {
                let id = Uuid::now_v7();
                w.pages.insert(
                    id,
                    Page {
                        id,
                        domain_id: job.domain_id,
                        path: r.path.clone(),
                        latest_priority_score: r.priority_score,
                        latest_content_hash: None,
                    },
                );
                w.pages_by_domain_path.insert(page_key, id);
                id
            };
            let already_open = w
                .tasks
                .values()
                .any(|t| t.job_id == job_id && t.page_id == page_id && is_open(t.status));
            if already_open {
                report.skipped_duplicate += 1;
                continue;
            }

            let mut task = Task::new(job_id, page_id, r.path.clone(), r.priority_score, r.source_type);
            let status = if pending_used < pending_capacity {
                pending_used += 1;
                report.pending += 1;
                TaskStatus::Pending
            } else {
                report.waiting += 1;
                TaskStatus::Waiting
            };
            task.status = status;
            task.source_url = r.source_url.clone();
            w.tasks.insert(task.id, task);
            total_so_far += 1;
        }

        let job_mut = w.jobs.get_mut(&job_id).unwrap();
        job_mut.counters.total += report.pending + report.waiting;
        job_mut.counters.pending += report.pending;
        job_mut.counters.waiting += report.waiting;

        Ok(report)
    }

    async fn recover_stale_tasks(&self, grace_ms: i64) -> Result<u32, StoreError> {
        let mut w = self.inner.write().await;
        let now = now_ms();
        let stale: Vec<Uuid> = w
            .tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::Running
                    && t.started_at.map(|s| now - s >= grace_ms).unwrap_or(false)
            })
            .map(|t| t.id)
            .collect();
        let mut count = 0;
        for id in stale {
            let job_id = w.tasks[&id].job_id;
            {
                let t = w.tasks.get_mut(&id).unwrap();
                t.status = TaskStatus::Pending;
                t.started_at = None;
            }
            if let Some(job) = w.jobs.get_mut(&job_id) {
                move_counter(&mut job.counters, TaskStatus::Running, TaskStatus::Pending);
            }
            count += 1;
        }
        Ok(count)
    }

    async fn promote_waiting_tasks(&self) -> Result<u32, StoreError> {
        let mut w = self.inner.write().await;
        let job_ids: Vec<Uuid> = w.jobs.keys().copied().collect();
        let mut total = 0;
        for job_id in job_ids {
            total += Self::promote_waiting_for_job(&mut w, job_id);
        }
        Ok(total)
    }

    async fn reconcile_running_counters(&self) -> Result<u32, StoreError> {
        let mut w = self.inner.write().await;
        let job_ids: Vec<Uuid> = w.jobs.keys().copied().collect();
        let mut adjusted = 0;
        for job_id in job_ids {
            let actual = w
                .tasks
                .values()
                .filter(|t| t.job_id == job_id && t.status == TaskStatus::Running)
                .count() as u32;
            let job = w.jobs.get_mut(&job_id).unwrap();
            if job.counters.running != actual {
                job.counters.running = actual;
                adjusted += 1;
            }
        }
        Ok(adjusted)
    }

    async fn load_domain(&self, id: Uuid) -> Result<Option<Domain>, StoreError> {
        Ok(self.inner.read().await.domains.get(&id).cloned())
    }

    async fn ensure_domain(&self, name: &str, organisation_id: Uuid) -> Result<Domain, StoreError> {
        let mut w = self.inner.write().await;
        if let Some(id) = w.domains_by_name.get(name) {
            return Ok(w.domains[id].clone());
        }
        let id = Uuid::now_v7();
        let domain = Domain {
            id,
            name: name.to_string(),
            organisation_id,
            crawl_delay_seconds: None,
            adaptive_delay_seconds: 0.0,
            adaptive_delay_floor_seconds: 0.0,
        };
        w.domains.insert(id, domain.clone());
        w.domains_by_name.insert(name.to_string(), id);
        Ok(domain)
    }

    async fn persist_domain_delay(
        &self,
        id: Uuid,
        adaptive_delay_seconds: f64,
        adaptive_delay_floor_seconds: f64,
    ) -> Result<(), StoreError> {
        if let Some(domain) = self.inner.write().await.domains.get_mut(&id) {
            domain.adaptive_delay_seconds = adaptive_delay_seconds;
            domain.adaptive_delay_floor_seconds = adaptive_delay_floor_seconds;
        }
        Ok(())
    }

    async fn save_scheduler(&self, scheduler: &Scheduler) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .schedulers
            .insert(scheduler.id, scheduler.clone());
        Ok(())
    }

    async fn due_schedulers(&self, now_ms: Timestamp) -> Result<Vec<Scheduler>, StoreError> {
        let w = self.inner.read().await;
        Ok(w.schedulers
            .values()
            .filter(|s| s.enabled && s.next_run_at <= now_ms)
            .cloned()
            .collect())
    }

    async fn advance_scheduler(&self, id: Uuid, next_run_at: Timestamp) -> Result<(), StoreError> {
        if let Some(s) = self.inner.write().await.schedulers.get_mut(&id) {
            s.next_run_at = next_run_at;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn sample_job(concurrency: u32) -> Job {
        Job::new(Uuid::now_v7(), Uuid::now_v7(), concurrency, JobOptions::default())
    }

    #[tokio::test]
    async fn claim_respects_concurrency_cap() {
        let store = MemoryStore::new();
        let job = sample_job(2);
        store.save_job(&job).await.unwrap();
        let page = store.ensure_page(job.domain_id, "/a").await.unwrap();
        for _ in 0..5 {
            let mut t = Task::new(job.id, page, "/a".to_string(), 1.0, SourceType::Manual);
            t.status = TaskStatus::Pending;
            store.inner.write().await.tasks.insert(t.id, t);
        }
        {
            let mut w = store.inner.write().await;
            let j = w.jobs.get_mut(&job.id).unwrap();
            j.counters.pending = 5;
            j.counters.total = 5;
        }

        let c1 = store.claim_next_task(job.id).await.unwrap();
        let c2 = store.claim_next_task(job.id).await.unwrap();
        let c3 = store.claim_next_task(job.id).await.unwrap();
        assert!(c1.is_some());
        assert!(c2.is_some());
        assert!(c3.is_none(), "concurrency cap of 2 must block a third claim");

        let counters = store.counters_of(job.id).await.unwrap();
        assert_eq!(counters.running, 2);
        assert_eq!(counters.pending, 3);
    }

    #[tokio::test]
    async fn claim_orders_by_priority_then_age() {
        let store = MemoryStore::new();
        let job = sample_job(0);
        store.save_job(&job).await.unwrap();
        let page = store.ensure_page(job.domain_id, "/a").await.unwrap();
        let mut low = Task::new(job.id, page, "/a".to_string(), 0.1, SourceType::Manual);
        low.status = TaskStatus::Pending;
        let mut high = Task::new(job.id, page, "/a".to_string(), 0.9, SourceType::Manual);
        high.status = TaskStatus::Pending;
        let low_id = low.id;
        let high_id = high.id;
        {
            let mut w = store.inner.write().await;
            w.tasks.insert(low.id, low);
            w.tasks.insert(high.id, high);
            let j = w.jobs.get_mut(&job.id).unwrap();
            j.counters.pending = 2;
            j.counters.total = 2;
        }
        let claimed = store.claim_next_task(job.id).await.unwrap().unwrap();
        assert_eq!(claimed.id, high_id);
        let claimed2 = store.claim_next_task(job.id).await.unwrap().unwrap();
        assert_eq!(claimed2.id, low_id);
    }

    #[tokio::test]
    async fn update_task_status_promotes_waiting() {
        let store = MemoryStore::new();
        let job = sample_job(1);
        store.save_job(&job).await.unwrap();
        let page = store.ensure_page(job.domain_id, "/a").await.unwrap();
        let mut running = Task::new(job.id, page, "/a".to_string(), 1.0, SourceType::Manual);
        running.status = TaskStatus::Running;
        let mut waiting = Task::new(job.id, page, "/a".to_string(), 1.0, SourceType::Manual);
        waiting.status = TaskStatus::Waiting;
        let waiting_id = waiting.id;
        let running_id = running.id;
        {
            let mut w = store.inner.write().await;
            w.tasks.insert(running.id, running);
            w.tasks.insert(waiting.id, waiting);
            let j = w.jobs.get_mut(&job.id).unwrap();
            j.counters.running = 1;
            j.counters.waiting = 1;
            j.counters.total = 2;
        }

        store
            .update_task_status(&TaskUpdate {
                task_id: running_id,
                job_id: job.id,
                status: TaskStatus::Completed,
                outcome: TaskOutcome::default(),
                retry_count: 0,
                eligible_at: None,
            })
            .await
            .unwrap();

        let counters = store.counters_of(job.id).await.unwrap();
        assert_eq!(counters.completed, 1);
        assert_eq!(counters.pending, 1, "freed slot should promote the waiting task");
        assert_eq!(counters.waiting, 0);
        let promoted = store.inner.read().await.tasks[&waiting_id].status;
        assert_eq!(promoted, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn recover_stale_tasks_resets_and_decrements() {
        let store = MemoryStore::new();
        let job = sample_job(1);
        store.save_job(&job).await.unwrap();
        let page = store.ensure_page(job.domain_id, "/a").await.unwrap();
        let mut stale = Task::new(job.id, page, "/a".to_string(), 1.0, SourceType::Manual);
        stale.status = TaskStatus::Running;
        stale.started_at = Some(now_ms() - 10_000);
        let stale_id = stale.id;
        {
            let mut w = store.inner.write().await;
            w.tasks.insert(stale.id, stale);
            w.jobs.get_mut(&job.id).unwrap().counters.running = 1;
        }
        let recovered = store.recover_stale_tasks(5_000).await.unwrap();
        assert_eq!(recovered, 1);
        let counters = store.counters_of(job.id).await.unwrap();
        assert_eq!(counters.running, 0);
        assert_eq!(counters.pending, 1);
        assert_eq!(store.inner.read().await.tasks[&stale_id].started_at, None);
    }

    #[tokio::test]
    async fn enqueue_urls_splits_pending_and_waiting() {
        let store = MemoryStore::new();
        let job = sample_job(2);
        store.save_job(&job).await.unwrap();
        let refs: Vec<PageRef> = (0..5)
            .map(|i| PageRef {
                path: format!("/p{i}"),
                priority_score: 0.5,
                source_type: SourceType::Sitemap,
                source_url: None,
            })
            .collect();
        let report = store
            .enqueue_urls(job.id, &refs, &RobotsRules::default(), &[], &[], None, 1)
            .await
            .unwrap();
        // concurrency=2, overflow_factor=1 -> at most 2 pending, rest waiting.
        assert_eq!(report.pending, 2);
        assert_eq!(report.waiting, 3);
        assert_eq!(report.enqueued(), 5);
    }

    #[tokio::test]
    async fn enqueue_urls_skips_robots_disallowed_and_duplicate_pages() {
        let store = MemoryStore::new();
        let job = sample_job(10);
        store.save_job(&job).await.unwrap();
        let robots = RobotsRules {
            disallow: vec!["/admin".to_string()],
            crawl_delay_seconds: None,
        };
        let refs = vec![
            PageRef {
                path: "/admin/secret".to_string(),
                priority_score: 0.5,
                source_type: SourceType::Sitemap,
                source_url: None,
            },
            PageRef {
                path: "/ok".to_string(),
                priority_score: 0.5,
                source_type: SourceType::Sitemap,
                source_url: None,
            },
        ];
        let report = store
            .enqueue_urls(job.id, &refs, &robots, &[], &[], None, 3)
            .await
            .unwrap();
        assert_eq!(report.skipped_robots, 1);
        assert_eq!(report.pending, 1);

        // Re-enqueueing the same ref should be skipped as duplicate (open task exists).
        let report2 = store
            .enqueue_urls(job.id, &refs[1..], &robots, &[], &[], None, 3)
            .await
            .unwrap();
        assert_eq!(report2.skipped_duplicate, 1);
    }
}
