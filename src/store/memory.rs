use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use super::{page_bounds, TaskStore, WorkerStore};
use crate::error::CoreResult;
use crate::models::{Account, AssignmentStatus, Task, TaskAssignment, TaskRecord, TaskStatus, Worker};

#[derive(Default)]
struct Inner {
  tasks: HashMap<String, Task>,
  assignments: Vec<TaskAssignment>,
  records: Vec<TaskRecord>,
  workers: HashMap<String, Worker>,
  accounts: HashMap<i64, Account>,
  next_assignment_id: i64,
}

/// In-memory store with the same conditional-update and clamping semantics as
/// [`super::PgStore`]. Single mutex, never held across an await.
#[derive(Default)]
pub struct MemoryStore {
  inner: Mutex<Inner>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Every record ever written for a task, for assertions in tests.
  pub fn records_for(&self, task_id: &str) -> Vec<TaskRecord> {
    let inner = self.inner.lock().unwrap();
    inner.records.iter().filter(|r| r.task_id == task_id).cloned().collect()
  }

  /// All assignments for a task, newest last.
  pub fn assignments_for(&self, task_id: &str) -> Vec<TaskAssignment> {
    let inner = self.inner.lock().unwrap();
    inner.assignments.iter().filter(|a| a.task_id == task_id).cloned().collect()
  }
}

#[async_trait]
impl TaskStore for MemoryStore {
  async fn create_task(&self, task: &Task) -> CoreResult<()> {
    let mut inner = self.inner.lock().unwrap();
    inner.tasks.insert(task.task_id.clone(), task.clone());
    Ok(())
  }

  async fn get_task(&self, task_id: &str) -> CoreResult<Option<Task>> {
    let inner = self.inner.lock().unwrap();
    Ok(inner.tasks.get(task_id).cloned())
  }

  async fn list_tasks(&self, page: u32, page_size: u32) -> CoreResult<(Vec<Task>, i64)> {
    let inner = self.inner.lock().unwrap();
    let mut tasks: Vec<Task> = inner.tasks.values().cloned().collect();
    tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    let total = tasks.len() as i64;
    let (offset, limit) = page_bounds(page, page_size);
    let tasks = tasks.into_iter().skip(offset as usize).take(limit as usize).collect();
    Ok((tasks, total))
  }

  async fn pending_tasks(&self) -> CoreResult<Vec<Task>> {
    let inner = self.inner.lock().unwrap();
    let mut tasks: Vec<Task> = inner
      .tasks
      .values()
      .filter(|t| t.status == TaskStatus::Pending)
      .cloned()
      .collect();
    tasks.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at)));
    Ok(tasks)
  }

  async fn mark_assigned(&self, task_id: &str) -> CoreResult<bool> {
    let mut inner = self.inner.lock().unwrap();
    match inner.tasks.get_mut(task_id) {
      Some(task) if task.status == TaskStatus::Pending => {
        task.status = TaskStatus::Assigned;
        task.updated_at = Utc::now();
        Ok(true)
      }
      _ => Ok(false),
    }
  }

  async fn mark_processing(&self, task_id: &str, started_at: DateTime<Utc>) -> CoreResult<bool> {
    let mut inner = self.inner.lock().unwrap();
    match inner.tasks.get_mut(task_id) {
      Some(task) if task.status == TaskStatus::Assigned => {
        task.status = TaskStatus::Processing;
        task.started_at = Some(started_at);
        task.updated_at = Utc::now();
        Ok(true)
      }
      _ => Ok(false),
    }
  }

  async fn finish_task(
    &self,
    task_id: &str,
    status: TaskStatus,
    error_message: &str,
    completed_at: DateTime<Utc>,
  ) -> CoreResult<bool> {
    let mut inner = self.inner.lock().unwrap();
    match inner.tasks.get_mut(task_id) {
      Some(task) if !task.status.is_terminal() => {
        task.status = status;
        task.error_message = error_message.to_string();
        task.completed_at = Some(completed_at);
        task.updated_at = Utc::now();
        Ok(true)
      }
      _ => Ok(false),
    }
  }

  async fn requeue_task(&self, task_id: &str) -> CoreResult<bool> {
    let mut inner = self.inner.lock().unwrap();
    match inner.tasks.get_mut(task_id) {
      Some(task) if matches!(task.status, TaskStatus::Assigned | TaskStatus::Processing) => {
        task.status = TaskStatus::Pending;
        task.started_at = None;
        task.updated_at = Utc::now();
        Ok(true)
      }
      _ => Ok(false),
    }
  }

  async fn create_assignment(&self, assignment: &TaskAssignment) -> CoreResult<i64> {
    let mut inner = self.inner.lock().unwrap();
    inner.next_assignment_id += 1;
    let id = inner.next_assignment_id;
    let mut assignment = assignment.clone();
    assignment.id = id;
    inner.assignments.push(assignment);
    Ok(id)
  }

  async fn active_assignment(&self, task_id: &str) -> CoreResult<Option<TaskAssignment>> {
    let inner = self.inner.lock().unwrap();
    Ok(
      inner
        .assignments
        .iter()
        .filter(|a| a.task_id == task_id && !a.status.is_terminal())
        .max_by_key(|a| a.assigned_at)
        .cloned(),
    )
  }

  async fn finish_assignment(
    &self,
    task_id: &str,
    worker_id: &str,
    status: AssignmentStatus,
    reason: &str,
    completed_at: DateTime<Utc>,
  ) -> CoreResult<bool> {
    let mut inner = self.inner.lock().unwrap();
    for a in inner.assignments.iter_mut() {
      if a.task_id == task_id && a.worker_id == worker_id && !a.status.is_terminal() {
        a.status = status;
        a.rejection_reason = reason.to_string();
        a.completed_at = Some(completed_at);
        return Ok(true);
      }
    }
    Ok(false)
  }

  async fn create_record(&self, record: &TaskRecord) -> CoreResult<()> {
    let mut inner = self.inner.lock().unwrap();
    inner.records.push(record.clone());
    Ok(())
  }

  async fn tasks_for_worker(
    &self,
    worker_id: &str,
    page: u32,
    page_size: u32,
  ) -> CoreResult<(Vec<Task>, i64)> {
    let inner = self.inner.lock().unwrap();
    let mut assigned: Vec<&TaskAssignment> =
      inner.assignments.iter().filter(|a| a.worker_id == worker_id).collect();
    assigned.sort_by(|a, b| b.assigned_at.cmp(&a.assigned_at));
    let tasks: Vec<Task> = assigned
      .iter()
      .filter_map(|a| inner.tasks.get(&a.task_id).cloned())
      .collect();
    let total = tasks.len() as i64;
    let (offset, limit) = page_bounds(page, page_size);
    let tasks = tasks.into_iter().skip(offset as usize).take(limit as usize).collect();
    Ok((tasks, total))
  }

  async fn expired_assignments(&self, now: DateTime<Utc>) -> CoreResult<Vec<TaskAssignment>> {
    let inner = self.inner.lock().unwrap();
    Ok(
      inner
        .assignments
        .iter()
        .filter(|a| {
          if a.status.is_terminal() {
            return false;
          }
          match inner.tasks.get(&a.task_id) {
            Some(task)
              if matches!(task.status, TaskStatus::Assigned | TaskStatus::Processing) =>
            {
              a.assigned_at + Duration::seconds(task.timeout_sec as i64) < now
            }
            _ => false,
          }
        })
        .cloned()
        .collect(),
    )
  }

  async fn find_account(&self, account_id: i64) -> CoreResult<Option<Account>> {
    let inner = self.inner.lock().unwrap();
    Ok(inner.accounts.get(&account_id).cloned())
  }

  async fn create_account(&self, account: &Account) -> CoreResult<()> {
    let mut inner = self.inner.lock().unwrap();
    inner.accounts.insert(account.id, account.clone());
    Ok(())
  }
}

#[async_trait]
impl WorkerStore for MemoryStore {
  async fn find_by_addr(&self, hostname: &str, ip: &str) -> CoreResult<Option<Worker>> {
    let inner = self.inner.lock().unwrap();
    Ok(
      inner
        .workers
        .values()
        .find(|w| w.hostname == hostname && w.ip == ip)
        .cloned(),
    )
  }

  async fn insert_worker(&self, worker: &Worker) -> CoreResult<()> {
    let mut inner = self.inner.lock().unwrap();
    inner.workers.insert(worker.worker_id.clone(), worker.clone());
    Ok(())
  }

  async fn reactivate_worker(
    &self,
    worker_id: &str,
    max_tasks: i32,
    tags: &str,
    now: DateTime<Utc>,
  ) -> CoreResult<()> {
    let mut inner = self.inner.lock().unwrap();
    if let Some(worker) = inner.workers.get_mut(worker_id) {
      worker.status = crate::models::WorkerStatus::Online;
      worker.last_heartbeat = now;
      worker.max_tasks = max_tasks;
      worker.current_tasks = 0;
      worker.tags = tags.to_string();
    }
    Ok(())
  }

  async fn heartbeat(&self, worker_id: &str, now: DateTime<Utc>) -> CoreResult<bool> {
    let mut inner = self.inner.lock().unwrap();
    match inner.workers.get_mut(worker_id) {
      Some(worker) => {
        worker.status = crate::models::WorkerStatus::Online;
        worker.last_heartbeat = now;
        Ok(true)
      }
      None => Ok(false),
    }
  }

  async fn available_workers(
    &self,
    tag: Option<&str>,
    seen_since: DateTime<Utc>,
  ) -> CoreResult<Vec<Worker>> {
    let inner = self.inner.lock().unwrap();
    let mut workers: Vec<Worker> = inner
      .workers
      .values()
      .filter(|w| {
        w.status == crate::models::WorkerStatus::Online
          && w.current_tasks < w.max_tasks
          && w.last_heartbeat >= seen_since
          && tag.map_or(true, |t| w.has_tag(t))
      })
      .cloned()
      .collect();
    workers.sort_by(|a, b| {
      a.current_tasks
        .cmp(&b.current_tasks)
        .then(a.worker_id.cmp(&b.worker_id))
    });
    Ok(workers)
  }

  async fn increment_load(&self, worker_id: &str) -> CoreResult<()> {
    let mut inner = self.inner.lock().unwrap();
    if let Some(worker) = inner.workers.get_mut(worker_id) {
      worker.current_tasks = (worker.current_tasks + 1).min(worker.max_tasks);
    }
    Ok(())
  }

  async fn decrement_load(&self, worker_id: &str) -> CoreResult<()> {
    let mut inner = self.inner.lock().unwrap();
    if let Some(worker) = inner.workers.get_mut(worker_id) {
      worker.current_tasks = (worker.current_tasks - 1).max(0);
    }
    Ok(())
  }

  async fn get_worker(&self, worker_id: &str) -> CoreResult<Option<Worker>> {
    let inner = self.inner.lock().unwrap();
    Ok(inner.workers.get(worker_id).cloned())
  }

  async fn list_workers(&self, page: u32, page_size: u32) -> CoreResult<(Vec<Worker>, i64)> {
    let inner = self.inner.lock().unwrap();
    let mut workers: Vec<Worker> = inner.workers.values().cloned().collect();
    workers.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    let total = workers.len() as i64;
    let (offset, limit) = page_bounds(page, page_size);
    let workers = workers.into_iter().skip(offset as usize).take(limit as usize).collect();
    Ok((workers, total))
  }

  async fn mark_stale_offline(&self, seen_before: DateTime<Utc>) -> CoreResult<u64> {
    let mut inner = self.inner.lock().unwrap();
    let mut flipped = 0;
    for worker in inner.workers.values_mut() {
      if worker.status == crate::models::WorkerStatus::Online && worker.last_heartbeat < seen_before {
        worker.status = crate::models::WorkerStatus::Offline;
        flipped += 1;
      }
    }
    Ok(flipped)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::models::WorkerStatus;

  fn task(id: &str, priority: i32) -> Task {
    Task {
      task_id: id.to_string(),
      task_type: "send_message".into(),
      account_id: 1,
      params: serde_json::json!({}),
      status: TaskStatus::Pending,
      priority,
      error_message: String::new(),
      timeout_sec: 300,
      started_at: None,
      completed_at: None,
      created_at: Utc::now(),
      updated_at: Utc::now(),
    }
  }

  fn worker(id: &str, load: i32, max: i32) -> Worker {
    Worker {
      worker_id: id.to_string(),
      hostname: id.to_string(),
      ip: "127.0.0.1".into(),
      status: WorkerStatus::Online,
      last_heartbeat: Utc::now(),
      max_tasks: max,
      current_tasks: load,
      tags: String::new(),
      version: "1.0.0".into(),
      created_at: Utc::now(),
    }
  }

  #[tokio::test]
  async fn mark_assigned_is_a_compare_and_swap() {
    let store = MemoryStore::new();
    store.create_task(&task("task_a", 0)).await.unwrap();
    assert!(store.mark_assigned("task_a").await.unwrap());
    assert!(!store.mark_assigned("task_a").await.unwrap());
  }

  #[tokio::test]
  async fn finish_task_is_idempotent_on_terminal_rows() {
    let store = MemoryStore::new();
    store.create_task(&task("task_a", 0)).await.unwrap();
    let now = Utc::now();
    assert!(store.finish_task("task_a", TaskStatus::Failed, "timeout", now).await.unwrap());
    assert!(!store.finish_task("task_a", TaskStatus::Completed, "", now).await.unwrap());
    let t = store.get_task("task_a").await.unwrap().unwrap();
    assert_eq!(t.status, TaskStatus::Failed);
    assert_eq!(t.error_message, "timeout");
  }

  #[tokio::test]
  async fn load_counters_clamp_at_both_ends() {
    let store = MemoryStore::new();
    store.insert_worker(&worker("wrk_a", 0, 2)).await.unwrap();
    for _ in 0..5 {
      store.increment_load("wrk_a").await.unwrap();
    }
    assert_eq!(store.get_worker("wrk_a").await.unwrap().unwrap().current_tasks, 2);
    for _ in 0..5 {
      store.decrement_load("wrk_a").await.unwrap();
    }
    assert_eq!(store.get_worker("wrk_a").await.unwrap().unwrap().current_tasks, 0);
  }

  #[tokio::test]
  async fn pending_tasks_order_by_priority_then_age() {
    let store = MemoryStore::new();
    let mut low = task("task_low", 1);
    low.created_at = Utc::now() - Duration::seconds(10);
    let mut old_high = task("task_old_high", 5);
    old_high.created_at = Utc::now() - Duration::seconds(30);
    let new_high = task("task_new_high", 5);
    store.create_task(&low).await.unwrap();
    store.create_task(&new_high).await.unwrap();
    store.create_task(&old_high).await.unwrap();
    let pending = store.pending_tasks().await.unwrap();
    let order: Vec<&str> = pending.iter().map(|t| t.task_id.as_str()).collect();
    assert_eq!(order, ["task_old_high", "task_new_high", "task_low"]);
  }

  #[tokio::test]
  async fn available_workers_sorted_by_load_and_filtered_by_tag() {
    let store = MemoryStore::new();
    let mut tagged = worker("wrk_tagged", 3, 5);
    tagged.tags = "telegram".into();
    store.insert_worker(&tagged).await.unwrap();
    store.insert_worker(&worker("wrk_idle", 0, 5)).await.unwrap();
    let mut full = worker("wrk_full", 5, 5);
    full.tags = "telegram".into();
    store.insert_worker(&full).await.unwrap();

    let since = Utc::now() - Duration::seconds(60);
    let all = store.available_workers(None, since).await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].worker_id, "wrk_idle");

    let tagged_only = store.available_workers(Some("telegram"), since).await.unwrap();
    assert_eq!(tagged_only.len(), 1);
    assert_eq!(tagged_only[0].worker_id, "wrk_tagged");
  }

  #[tokio::test]
  async fn expired_assignments_respect_task_timeout() {
    let store = MemoryStore::new();
    let mut t = task("task_a", 0);
    t.timeout_sec = 60;
    store.create_task(&t).await.unwrap();
    store.mark_assigned("task_a").await.unwrap();
    store
      .create_assignment(&TaskAssignment {
        id: 0,
        task_id: "task_a".into(),
        worker_id: "wrk_a".into(),
        status: AssignmentStatus::Pending,
        assigned_at: Utc::now() - Duration::seconds(120),
        accepted_at: None,
        completed_at: None,
        rejection_reason: String::new(),
        priority: 0,
      })
      .await
      .unwrap();
    let expired = store.expired_assignments(Utc::now()).await.unwrap();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].task_id, "task_a");
  }
}
