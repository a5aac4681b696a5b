//! Worker identity, liveness and capacity bookkeeping.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::info;

use crate::error::{CoreError, CoreResult};
use crate::models::{Worker, WorkerStatus};
use crate::store::WorkerStore;

fn generate_worker_id() -> String {
  let suffix: String = rand::thread_rng()
    .sample_iter(&Alphanumeric)
    .take(8)
    .map(char::from)
    .collect();
  format!("wrk_{}{}", Utc::now().format("%Y%m%d%H%M%S"), suffix)
}

#[derive(Clone)]
pub struct WorkerRegistry {
  workers: Arc<dyn WorkerStore>,
  /// Heartbeats older than this exclude a worker from assignment even when
  /// its status flag still says online.
  stale_after: Duration,
}

impl WorkerRegistry {
  pub fn new(workers: Arc<dyn WorkerStore>, stale_after: Duration) -> Self {
    Self { workers, stale_after }
  }

  /// Idempotent by hostname+ip: a known address is reactivated with its
  /// counters reset and keeps its worker id.
  pub async fn register(
    &self,
    hostname: &str,
    ip: &str,
    max_tasks: i32,
    tags: &str,
    version: &str,
  ) -> CoreResult<String> {
    let now = Utc::now();
    if let Some(existing) = self.workers.find_by_addr(hostname, ip).await? {
      self
        .workers
        .reactivate_worker(&existing.worker_id, max_tasks, tags, now)
        .await?;
      info!("Worker {} reactivated for {}@{}", existing.worker_id, hostname, ip);
      return Ok(existing.worker_id);
    }

    let worker = Worker {
      worker_id: generate_worker_id(),
      hostname: hostname.to_string(),
      ip: ip.to_string(),
      status: WorkerStatus::Online,
      last_heartbeat: now,
      max_tasks,
      current_tasks: 0,
      tags: tags.to_string(),
      version: version.to_string(),
      created_at: now,
    };
    self.workers.insert_worker(&worker).await?;
    info!("Worker {} registered for {}@{}", worker.worker_id, hostname, ip);
    Ok(worker.worker_id)
  }

  pub async fn heartbeat(&self, worker_id: &str) -> CoreResult<()> {
    if self.workers.heartbeat(worker_id, Utc::now()).await? {
      Ok(())
    } else {
      Err(CoreError::WorkerNotFound)
    }
  }

  fn freshness_floor(&self) -> chrono::DateTime<Utc> {
    Utc::now() - chrono::Duration::from_std(self.stale_after).unwrap_or(chrono::Duration::zero())
  }

  /// The single online, under-capacity, recently-heartbeated worker with the
  /// lowest load. `NoAvailableWorker` here is an expected outcome, not a
  /// fault: the caller defers the task to the next scheduling pass.
  pub async fn select_available(&self, tag: Option<&str>) -> CoreResult<Worker> {
    let candidates = self.workers.available_workers(tag, self.freshness_floor()).await?;
    candidates.into_iter().next().ok_or(CoreError::NoAvailableWorker)
  }

  /// Snapshot for a scheduling pass, ordered by ascending load.
  pub async fn available_workers(&self) -> CoreResult<Vec<Worker>> {
    self.workers.available_workers(None, self.freshness_floor()).await
  }

  pub async fn increment_load(&self, worker_id: &str) -> CoreResult<()> {
    self.workers.increment_load(worker_id).await
  }

  pub async fn decrement_load(&self, worker_id: &str) -> CoreResult<()> {
    self.workers.decrement_load(worker_id).await
  }

  pub async fn get_worker(&self, worker_id: &str) -> CoreResult<Worker> {
    self.workers.get_worker(worker_id).await?.ok_or(CoreError::WorkerNotFound)
  }

  pub async fn list_workers(&self, page: u32, page_size: u32) -> CoreResult<(Vec<Worker>, i64)> {
    self.workers.list_workers(page, page_size).await
  }

  /// Reaps workers whose heartbeat lapsed; called from the scheduling loop.
  pub async fn reap_stale(&self) -> CoreResult<u64> {
    let flipped = self.workers.mark_stale_offline(self.freshness_floor()).await?;
    if flipped > 0 {
      info!("Marked {} stale worker(s) offline", flipped);
    }
    Ok(flipped)
  }
}
