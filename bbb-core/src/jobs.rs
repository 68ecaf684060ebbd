//! Job Manager (C6): job creation/cancellation/completion and the
//! scheduler tick, the top-level facade callers (a CLI, a future API
//! layer) talk to — the same role `BpmnLiteEngine` plays for the teacher,
//! wired over `Arc<dyn JobStore>` instead of `Arc<dyn ProcessStore>`.

use crate::errors::EngineError;
use crate::store::JobStore;
use crate::types::*;
use std::sync::Arc;
use uuid::Uuid;

pub struct JobManager {
    store: Arc<dyn JobStore>,
}

/// Policy applied by `CreateJob` when an active job already exists for
/// the same (domain, organisation) pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExistingJobPolicy {
    Reject,
    Replace,
}

impl JobManager {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Validate the domain, enforce the existing-active-job policy, and
    /// insert the new job row pending. Seeding tasks from a sitemap is the
    /// caller's responsibility (it requires the `Crawler` capability,
    /// which the job manager does not depend on) — callers fetch the
    /// sitemap and pass the resulting `PageRef`s to `seed_tasks`.
    pub async fn create_job(
        &self,
        domain_name: &str,
        organisation_id: Uuid,
        concurrency: u32,
        options: JobOptions,
        policy: ExistingJobPolicy,
    ) -> Result<Job, EngineError> {
        let domain = self.store.ensure_domain(domain_name, organisation_id).await?;

        if let Some(existing) = self.store.find_active_job(domain.id, organisation_id).await? {
            match policy {
                ExistingJobPolicy::Reject => {
                    return Err(EngineError::Configuration(format!(
                        "an active job {} already exists for this domain/organisation",
                        existing.id
                    )));
                }
                ExistingJobPolicy::Replace => {
                    self.cancel_job(existing.id).await?;
                }
            }
        }

        let job = Job::new(domain.id, organisation_id, concurrency, options);
        self.store.save_job(&job).await?;
        Ok(job)
    }

    /// Enqueue a homepage task (the seed that kicks a job from pending to
    /// claimable), applying robots/pattern/max_pages filtering the same
    /// way sitemap-sourced URLs do.
    pub async fn seed_tasks(
        &self,
        job: &Job,
        refs: &[PageRef],
        robots: &RobotsRules,
        overflow_factor: u32,
    ) -> Result<crate::store::EnqueueReport, EngineError> {
        let report = self
            .store
            .enqueue_urls(
                job.id,
                refs,
                robots,
                &job.options.include_patterns,
                &job.options.exclude_patterns,
                job.options.max_pages,
                overflow_factor,
            )
            .await?;
        Ok(report)
    }

    /// Atomically cancel a job. Outstanding tasks are left for the
    /// worker pool's `RemoveJob` to skip or terminate per its own policy;
    /// the job manager only flips the job's own status.
    pub async fn cancel_job(&self, job_id: Uuid) -> Result<(), EngineError> {
        self.store
            .update_job_status(job_id, JobStatus::Cancelled, None)
            .await?;
        Ok(())
    }

    /// Mark a job completed and compute its summary from final counters.
    /// This is an in-process calculator rather than a store trigger.
    pub async fn complete_job(&self, job_id: Uuid) -> Result<JobSummary, EngineError> {
        let job = self
            .store
            .load_job(job_id)
            .await?
            .ok_or(EngineError::JobNotFound(job_id))?;

        let duration_ms = match job.started_at {
            Some(started) => now_ms() - started,
            None => 0,
        };
        let closed = job.counters.completed + job.counters.failed + job.counters.skipped;
        let success_ratio = if closed > 0 {
            job.counters.completed as f64 / closed as f64
        } else {
            0.0
        };
        let summary = JobSummary {
            duration_ms,
            avg_response_time_ms: None,
            success_ratio,
        };

        self.store.complete_job(job_id, summary.clone()).await?;
        Ok(summary)
    }

    /// Run one scheduler tick: materialise a job for every scheduler due
    /// to run, link it back to the scheduler, and advance `next_run_at`.
    pub async fn run_scheduler_tick(&self) -> Result<Vec<Job>, EngineError> {
        let due = self.store.due_schedulers(now_ms()).await?;
        let mut created = Vec::with_capacity(due.len());
        for scheduler in due {
            let mut options = scheduler.template_options.clone();
            options.source_type = Some(SourceType::Scheduler);
            options.scheduler_id = Some(scheduler.id);

            let job = Job::new(scheduler.domain_id, scheduler.organisation_id, 0, options);
            self.store.save_job(&job).await?;
            created.push(job);

            let next_run_at = scheduler.next_run_at + scheduler.interval.as_millis();
            self.store.advance_scheduler(scheduler.id, next_run_at).await?;
        }
        Ok(created)
    }
}
