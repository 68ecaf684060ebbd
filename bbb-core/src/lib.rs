pub mod batch;
pub mod config;
pub mod crawler;
pub mod errors;
pub mod jobs;
pub mod limiter;
pub mod monitors;
pub mod pool;
pub mod retry;
pub mod store;
pub mod store_memory;
#[cfg(feature = "postgres")]
pub mod store_postgres;
pub mod types;

use std::sync::Arc;

use crate::batch::BatchUpdatePipeline;
use crate::config::EngineConfig;
use crate::crawler::Crawler;
use crate::jobs::JobManager;
use crate::limiter::DomainLimiter;
use crate::monitors::Monitors;
use crate::pool::WorkerPool;
use crate::store::JobStore;

/// Top-level facade wiring the store, limiter, batch pipeline, worker
/// pool, job manager and monitors together — the role `BpmnLiteEngine`
/// plays for the teacher, generalised from one `Arc<dyn ProcessStore>`
/// constructor argument to the full set of components this spec adds.
pub struct Engine {
    pub jobs: Arc<JobManager>,
    pub pool: Arc<WorkerPool>,
    pub monitors: Arc<Monitors>,
}

impl Engine {
    pub fn new(store: Arc<dyn JobStore>, crawler: Arc<dyn Crawler>, config: EngineConfig) -> Self {
        let limiter = Arc::new(DomainLimiter::new(config.clone()));
        let batch = Arc::new(BatchUpdatePipeline::start(
            store.clone(),
            config.batch_max_size * 4,
            config.batch_max_size,
            config.batch_max_interval,
            config.batch_flush_timeout,
        ));
        let pool = Arc::new(WorkerPool::new(
            store.clone(),
            crawler,
            limiter.clone(),
            batch,
            config.clone(),
        ));
        let jobs = Arc::new(JobManager::new(store.clone()));
        let monitors = Arc::new(Monitors::new(store, limiter, jobs.clone(), config));

        Self { jobs, pool, monitors }
    }

    /// Reconcile counters, then start the worker pool and all monitors.
    pub async fn start(&self) {
        self.monitors.reconcile_once().await;
        self.pool.start().await;
        self.monitors.start().await;
    }

    /// Stop monitors first (no point recovering tasks mid-shutdown),
    /// then the pool, which drains the batch pipeline before returning.
    pub async fn stop(&self) {
        self.monitors.stop().await;
        self.pool.stop().await;
    }
}
