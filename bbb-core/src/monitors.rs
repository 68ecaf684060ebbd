//! Monitors (C7): independent background loops for stale-task recovery,
//! waiting-task promotion, counter reconciliation, domain TTL eviction,
//! domain delay persistence, job-closure completion, and the scheduler
//! tick. Each runs as its own `tokio::time::interval` loop, the same
//! "several independent background loops" shape the pack's crawler
//! orchestrators use for upkeep tasks.

use crate::config::EngineConfig;
use crate::jobs::JobManager;
use crate::limiter::DomainLimiter;
use crate::store::JobStore;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub struct Monitors {
    store: Arc<dyn JobStore>,
    limiter: Arc<DomainLimiter>,
    jobs: Arc<JobManager>,
    config: EngineConfig,
    cancel: CancellationToken,
    handles: tokio::sync::Mutex<JoinSet<()>>,
}

impl Monitors {
    pub fn new(
        store: Arc<dyn JobStore>,
        limiter: Arc<DomainLimiter>,
        jobs: Arc<JobManager>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            limiter,
            jobs,
            config,
            cancel: CancellationToken::new(),
            handles: tokio::sync::Mutex::new(JoinSet::new()),
        }
    }

    /// Reconcile `running` counters against actual task rows once,
    /// synchronously — meant to be called at startup before the
    /// interval-driven loops begin.
    pub async fn reconcile_once(&self) {
        if let Err(err) = self.store.reconcile_running_counters().await {
            tracing::warn!(%err, "startup counter reconciliation failed");
        }
    }

    pub async fn start(&self) {
        let mut handles = self.handles.lock().await;

        handles.spawn(stale_task_loop(
            self.store.clone(),
            self.config.recovery_interval,
            self.config.stale_task_grace,
            self.cancel.clone(),
        ));
        handles.spawn(promote_waiting_loop(
            self.store.clone(),
            self.config.recovery_interval,
            self.cancel.clone(),
        ));
        handles.spawn(reconcile_loop(
            self.store.clone(),
            self.config.recovery_interval,
            self.cancel.clone(),
        ));
        handles.spawn(domain_evict_loop(
            self.limiter.clone(),
            self.config.domain_idle_ttl,
            self.cancel.clone(),
        ));
        handles.spawn(domain_persist_loop(
            self.store.clone(),
            self.limiter.clone(),
            self.config.domain_persist_interval,
            self.cancel.clone(),
        ));
        handles.spawn(job_closure_loop(
            self.store.clone(),
            self.jobs.clone(),
            self.config.recovery_interval,
            self.cancel.clone(),
        ));
        handles.spawn(scheduler_tick_loop(
            self.jobs.clone(),
            self.config.scheduler_tick_interval,
            self.cancel.clone(),
        ));
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        let mut handles = self.handles.lock().await;
        while handles.join_next().await.is_some() {}
    }
}

async fn stale_task_loop(
    store: Arc<dyn JobStore>,
    interval: std::time::Duration,
    grace: std::time::Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match store.recover_stale_tasks(grace.as_millis() as i64).await {
                    Ok(n) if n > 0 => tracing::info!(recovered = n, "recovered stale tasks"),
                    Ok(_) => {}
                    Err(err) => tracing::warn!(%err, "stale task recovery failed"),
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
}

async fn promote_waiting_loop(store: Arc<dyn JobStore>, interval: std::time::Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = store.promote_waiting_tasks().await {
                    tracing::warn!(%err, "waiting task promotion failed");
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
}

async fn reconcile_loop(store: Arc<dyn JobStore>, interval: std::time::Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = store.reconcile_running_counters().await {
                    tracing::warn!(%err, "counter reconciliation failed");
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
}

async fn domain_evict_loop(limiter: Arc<DomainLimiter>, idle_ttl: std::time::Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(600));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                limiter.evict_idle(idle_ttl).await;
            }
            _ = cancel.cancelled() => break,
        }
    }
}

/// Flush the limiter's learned adaptive_delay/delay_floor for domains
/// touched since the last tick (§4.3 Persist, P6).
async fn domain_persist_loop(
    store: Arc<dyn JobStore>,
    limiter: Arc<DomainLimiter>,
    interval: std::time::Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                limiter
                    .persist_dirty(|domain_id, adaptive, floor| {
                        let store = store.clone();
                        async move {
                            if let Err(err) = store.persist_domain_delay(domain_id, adaptive, floor).await {
                                tracing::warn!(%err, %domain_id, "failed to persist domain delay");
                            }
                        }
                    })
                    .await;
            }
            _ = cancel.cancelled() => break,
        }
    }
}

/// Complete any open job whose counters have closed (completed + failed +
/// skipped >= total), since nothing else in the engine watches for this.
/// Guards against `total == 0` so an unseeded job isn't completed before
/// its tasks are enqueued.
async fn job_closure_loop(
    store: Arc<dyn JobStore>,
    jobs: Arc<JobManager>,
    interval: std::time::Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let open = match store.list_open_jobs().await {
                    Ok(open) => open,
                    Err(err) => {
                        tracing::warn!(%err, "failed to list open jobs for closure check");
                        continue;
                    }
                };
                for job in open {
                    if job.counters.total > 0 && job.counters.is_closed() {
                        match jobs.complete_job(job.id).await {
                            Ok(_) => tracing::info!(job_id = %job.id, "completed job on counter closure"),
                            Err(err) => tracing::warn!(%err, job_id = %job.id, "failed to complete closed job"),
                        }
                    }
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
}

async fn scheduler_tick_loop(jobs: Arc<JobManager>, interval: std::time::Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match jobs.run_scheduler_tick().await {
                    Ok(created) if !created.is_empty() => {
                        tracing::info!(count = created.len(), "materialised jobs from due schedulers");
                    }
                    Ok(_) => {}
                    Err(err) => tracing::warn!(%err, "scheduler tick failed"),
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
}
