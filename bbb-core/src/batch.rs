//! Batch update pipeline (C2): collapses per-task status writes into a
//! bounded number of store calls via a single consumer task reading a
//! bounded channel, matching the mpsc + dedicated-consumer idiom used
//! throughout the pack's orchestrator-shaped services.

use crate::errors::StoreError;
use crate::store::JobStore;
use crate::types::TaskUpdate;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Bounded-queue, single-consumer pipeline for `TaskUpdate`s.
pub struct BatchUpdatePipeline {
    sender: tokio::sync::Mutex<Option<mpsc::Sender<TaskUpdate>>>,
    handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

struct ConsumerConfig {
    max_batch_size: usize,
    max_batch_interval: Duration,
    flush_timeout: Duration,
}

impl BatchUpdatePipeline {
    /// Start the consumer task and return the handle used to enqueue
    /// updates and later stop the pipeline.
    pub fn start(
        store: Arc<dyn JobStore>,
        channel_capacity: usize,
        max_batch_size: usize,
        max_batch_interval: Duration,
        flush_timeout: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::channel(channel_capacity);
        let cfg = ConsumerConfig {
            max_batch_size,
            max_batch_interval,
            flush_timeout,
        };
        let handle = tokio::spawn(consumer_loop(store, rx, cfg));
        Self {
            sender: tokio::sync::Mutex::new(Some(tx)),
            handle: tokio::sync::Mutex::new(Some(handle)),
        }
    }

    /// Enqueue an update. Blocks briefly if the channel is full
    /// (back-pressure), matching `QueueTaskUpdate`'s documented behaviour.
    pub async fn queue_task_update(&self, update: TaskUpdate) -> Result<(), StoreError> {
        let sender = self.sender.lock().await;
        match sender.as_ref() {
            Some(tx) => tx
                .send(update)
                .await
                .map_err(|_| StoreError::Data("batch pipeline consumer has stopped".to_string())),
            None => Err(StoreError::Data("batch pipeline already stopped".to_string())),
        }
    }

    /// Close the queue and wait for the consumer to drain everything
    /// already enqueued, including a final flush.
    pub async fn stop(&self) {
        self.sender.lock().await.take();
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
        }
    }
}

async fn consumer_loop(
    store: Arc<dyn JobStore>,
    mut rx: mpsc::Receiver<TaskUpdate>,
    cfg: ConsumerConfig,
) {
    let mut buffer: Vec<TaskUpdate> = Vec::with_capacity(cfg.max_batch_size);
    let mut ticker = tokio::time::interval(cfg.max_batch_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            maybe_update = rx.recv() => {
                match maybe_update {
                    Some(update) => {
                        buffer.push(update);
                        if buffer.len() >= cfg.max_batch_size {
                            flush(&store, &mut buffer, cfg.flush_timeout).await;
                        }
                    }
                    None => {
                        // Channel closed: drain whatever is left and perform
                        // the shutdown flush described by the pipeline's Stop
                        // contract, falling back to per-item updates if the
                        // batched flush fails outright.
                        drain_remaining(&mut rx, &mut buffer);
                        flush(&store, &mut buffer, cfg.flush_timeout).await;
                        return;
                    }
                }
            }
            _ = ticker.tick() => {
                if !buffer.is_empty() {
                    flush(&store, &mut buffer, cfg.flush_timeout).await;
                }
            }
        }
    }
}

fn drain_remaining(rx: &mut mpsc::Receiver<TaskUpdate>, buffer: &mut Vec<TaskUpdate>) {
    while let Ok(update) = rx.try_recv() {
        buffer.push(update);
    }
}

/// Flush fans the batch out by target status, then falls back to
/// per-item writes ("poison pill" isolation) if the batched write as a
/// whole times out or fails.
async fn flush(store: &Arc<dyn JobStore>, buffer: &mut Vec<TaskUpdate>, timeout: Duration) {
    if buffer.is_empty() {
        return;
    }
    let batch = std::mem::take(buffer);
    match tokio::time::timeout(timeout, store.batch_update_task_statuses(&batch)).await {
        Ok(Ok(())) => {}
        Ok(Err(_)) | Err(_) => {
            // Either a data/infrastructure error or the bounded timeout fired.
            // Isolate by retrying one item at a time so a single bad row
            // never takes the rest of the batch down with it.
            for update in batch {
                let _ = tokio::time::timeout(timeout, store.update_task_status(&update)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_memory::MemoryStore;
    use crate::types::{Job, JobOptions, Page, SourceType, Task, TaskOutcome, TaskStatus};
    use uuid::Uuid;

    async fn seeded_store() -> (Arc<dyn JobStore>, Uuid, Uuid) {
        let store: Arc<dyn JobStore> = Arc::new(MemoryStore::new());
        let job = Job::new(Uuid::now_v7(), Uuid::now_v7(), 5, JobOptions::default());
        store.save_job(&job).await.unwrap();
        let page_id = store.ensure_page(job.domain_id, "/a").await.unwrap();
        (store, job.id, page_id)
    }

    #[tokio::test]
    async fn flush_on_max_batch_size() {
        let (store, job_id, page_id) = seeded_store().await;
        let pipeline = BatchUpdatePipeline::start(
            store.clone(),
            16,
            3,
            Duration::from_secs(60),
            Duration::from_secs(5),
        );

        let mut task_ids = Vec::new();
        for _ in 0..3 {
            let task = Task::new(job_id, page_id, "/a".to_string(), 1.0, SourceType::Manual);
            task_ids.push(task.id);
            pipeline
                .queue_task_update(TaskUpdate {
                    task_id: task.id,
                    job_id,
                    status: TaskStatus::Completed,
                    outcome: TaskOutcome::default(),
                    retry_count: 0,
                    eligible_at: None,
                })
                .await
                .unwrap();
        }

        // Give the consumer a moment to observe the third item and flush.
        tokio::time::sleep(Duration::from_millis(50)).await;
        pipeline.stop().await;
    }

    #[tokio::test]
    async fn stop_drains_queued_updates() {
        let store: Arc<dyn JobStore> = Arc::new(MemoryStore::new());
        let job = Job::new(Uuid::now_v7(), Uuid::now_v7(), 10, JobOptions::default());
        store.save_job(&job).await.unwrap();
        let page_id = store.ensure_page(job.domain_id, "/a").await.unwrap();

        let pipeline = BatchUpdatePipeline::start(
            store.clone(),
            64,
            100,
            Duration::from_secs(60),
            Duration::from_secs(5),
        );

        for _ in 0..5 {
            let task = Task::new(job.id, page_id, "/a".to_string(), 1.0, SourceType::Manual);
            pipeline
                .queue_task_update(TaskUpdate {
                    task_id: task.id,
                    job_id: job.id,
                    status: TaskStatus::Skipped,
                    outcome: TaskOutcome::default(),
                    retry_count: 0,
                    eligible_at: None,
                })
                .await
                .unwrap();
        }

        pipeline.stop().await;

        let _ = store.load_job(job.id).await.unwrap();
    }
}
