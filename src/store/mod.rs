//! Durable storage for tasks, assignments, records, workers and accounts.
//!
//! Trait-based so the scheduler and registry are constructed from injected
//! handles: [`PgStore`] is the production backend, [`MemoryStore`] backs tests
//! and local development with the same semantics.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub mod postgres;
pub mod memory;

pub use postgres::PgStore;
pub use memory::MemoryStore;

use crate::error::CoreResult;
use crate::models::{Account, AssignmentStatus, Task, TaskAssignment, TaskRecord, TaskStatus, Worker};

#[async_trait]
pub trait TaskStore: Send + Sync {
  async fn create_task(&self, task: &Task) -> CoreResult<()>;

  async fn get_task(&self, task_id: &str) -> CoreResult<Option<Task>>;

  /// Page of tasks ordered by creation time descending, plus the total count.
  async fn list_tasks(&self, page: u32, page_size: u32) -> CoreResult<(Vec<Task>, i64)>;

  /// All pending tasks, priority descending then creation time ascending.
  async fn pending_tasks(&self) -> CoreResult<Vec<Task>>;

  /// Conditional `pending -> assigned` transition. Returns false when the row
  /// is no longer pending, which means another path already claimed the task.
  async fn mark_assigned(&self, task_id: &str) -> CoreResult<bool>;

  /// Conditional `assigned -> processing` transition, stamping `started_at`.
  async fn mark_processing(&self, task_id: &str, started_at: DateTime<Utc>) -> CoreResult<bool>;

  /// Terminal status update. A no-op (returns false) when the task is already
  /// in a terminal state, so duplicate or belated results cannot reopen it.
  async fn finish_task(
    &self,
    task_id: &str,
    status: TaskStatus,
    error_message: &str,
    completed_at: DateTime<Utc>,
  ) -> CoreResult<bool>;

  /// Returns an `assigned`/`processing` task to `pending` (reclaim sweep).
  async fn requeue_task(&self, task_id: &str) -> CoreResult<bool>;

  async fn create_assignment(&self, assignment: &TaskAssignment) -> CoreResult<i64>;

  /// The single non-terminal assignment for a task, if one exists.
  async fn active_assignment(&self, task_id: &str) -> CoreResult<Option<TaskAssignment>>;

  /// Closes the active assignment for `task_id` on `worker_id`. Terminal
  /// assignments are left untouched (returns false).
  async fn finish_assignment(
    &self,
    task_id: &str,
    worker_id: &str,
    status: AssignmentStatus,
    reason: &str,
    completed_at: DateTime<Utc>,
  ) -> CoreResult<bool>;

  /// Appends an immutable execution record.
  async fn create_record(&self, record: &TaskRecord) -> CoreResult<()>;

  async fn tasks_for_worker(
    &self,
    worker_id: &str,
    page: u32,
    page_size: u32,
  ) -> CoreResult<(Vec<Task>, i64)>;

  /// Active assignments whose task timeout has elapsed with no result.
  async fn expired_assignments(&self, now: DateTime<Utc>) -> CoreResult<Vec<TaskAssignment>>;

  async fn find_account(&self, account_id: i64) -> CoreResult<Option<Account>>;

  async fn create_account(&self, account: &Account) -> CoreResult<()>;
}

#[async_trait]
pub trait WorkerStore: Send + Sync {
  async fn find_by_addr(&self, hostname: &str, ip: &str) -> CoreResult<Option<Worker>>;

  async fn insert_worker(&self, worker: &Worker) -> CoreResult<()>;

  /// Re-registration: back online, load reset, capacity and tags overwritten.
  async fn reactivate_worker(
    &self,
    worker_id: &str,
    max_tasks: i32,
    tags: &str,
    now: DateTime<Utc>,
  ) -> CoreResult<()>;

  /// Refreshes the heartbeat timestamp and flips status to online. Returns
  /// false when no row matched.
  async fn heartbeat(&self, worker_id: &str, now: DateTime<Utc>) -> CoreResult<bool>;

  /// Online workers under capacity with a heartbeat at or after `seen_since`,
  /// optionally filtered by tag, ordered by current load ascending.
  async fn available_workers(
    &self,
    tag: Option<&str>,
    seen_since: DateTime<Utc>,
  ) -> CoreResult<Vec<Worker>>;

  /// Atomic relative update, clamped to `max_tasks`. The counter is an
  /// optimization over the assignment table, so clamping beats erroring.
  async fn increment_load(&self, worker_id: &str) -> CoreResult<()>;

  /// Atomic relative update, clamped at zero.
  async fn decrement_load(&self, worker_id: &str) -> CoreResult<()>;

  async fn get_worker(&self, worker_id: &str) -> CoreResult<Option<Worker>>;

  async fn list_workers(&self, page: u32, page_size: u32) -> CoreResult<(Vec<Worker>, i64)>;

  /// Flips workers with a heartbeat older than `seen_before` to offline.
  async fn mark_stale_offline(&self, seen_before: DateTime<Utc>) -> CoreResult<u64>;
}

pub(crate) fn page_bounds(page: u32, page_size: u32) -> (i64, i64) {
  let size = page_size.max(1) as i64;
  let offset = (page.max(1) as i64 - 1) * size;
  (offset, size)
}
