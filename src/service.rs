//! Task-facing facade consumed by the HTTP layer: create, query and cancel
//! tasks. Scheduling itself lives in [`crate::scheduler`].

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::models::{AssignmentStatus, Task, TaskStatus};
use crate::scheduler::TaskScheduler;
use crate::status_store::StatusStore;
use crate::store::TaskStore;

fn generate_task_id() -> String {
  format!("task_{}", Uuid::new_v4())
}

pub const DEFAULT_TIMEOUT_SEC: i32 = 300;

#[derive(Clone)]
pub struct TaskService {
  tasks: Arc<dyn TaskStore>,
  scheduler: Arc<TaskScheduler>,
  status: Arc<dyn StatusStore>,
}

impl TaskService {
  pub fn new(
    tasks: Arc<dyn TaskStore>,
    scheduler: Arc<TaskScheduler>,
    status: Arc<dyn StatusStore>,
  ) -> Self {
    Self { tasks, scheduler, status }
  }

  /// Persists a new pending task after confirming the account exists, then
  /// kicks an opportunistic assignment attempt off the request path.
  pub async fn create_task(
    &self,
    task_type: &str,
    account_id: i64,
    params: serde_json::Value,
    priority: i32,
  ) -> CoreResult<Task> {
    if self.tasks.find_account(account_id).await?.is_none() {
      return Err(CoreError::AccountNotFound);
    }

    let now = Utc::now();
    let task = Task {
      task_id: generate_task_id(),
      task_type: task_type.to_string(),
      account_id,
      params,
      status: TaskStatus::Pending,
      priority,
      error_message: String::new(),
      timeout_sec: DEFAULT_TIMEOUT_SEC,
      started_at: None,
      completed_at: None,
      created_at: now,
      updated_at: now,
    };
    self.tasks.create_task(&task).await?;
    if let Err(e) = self.status.save_status(&task.task_id, task.status.as_str()).await {
      error!("Status mirror write failed for task {}: {e}", task.task_id);
    }
    info!("Task {} created ({})", task.task_id, task.task_type);

    let scheduler = self.scheduler.clone();
    let created = task.clone();
    tokio::spawn(async move {
      if let Err(e) = scheduler.try_assign_now(&created).await {
        error!("Immediate assignment of task {} failed: {e}", created.task_id);
      }
    });

    Ok(task)
  }

  pub async fn get_task(&self, task_id: &str) -> CoreResult<Task> {
    self.tasks.get_task(task_id).await?.ok_or(CoreError::TaskNotFound)
  }

  pub async fn list_tasks(&self, page: u32, page_size: u32) -> CoreResult<(Vec<Task>, i64)> {
    self.tasks.list_tasks(page, page_size).await
  }

  /// Valid only from `pending`/`processing`. Cooperative: a worker already
  /// executing the task only learns through the best-effort cancel notice,
  /// and its belated result is discarded by the result consumer.
  pub async fn cancel_task(&self, task_id: &str) -> CoreResult<()> {
    let task = self.get_task(task_id).await?;
    if !matches!(task.status, TaskStatus::Pending | TaskStatus::Processing) {
      return Err(CoreError::InvalidTaskStatus);
    }

    let now = Utc::now();
    self
      .tasks
      .finish_task(task_id, TaskStatus::Canceled, "Task canceled by user", now)
      .await?;
    if let Err(e) = self.status.save_status(task_id, TaskStatus::Canceled.as_str()).await {
      error!("Status mirror write failed for task {task_id}: {e}");
    }

    // Release the worker's slot now; the result consumer is the backstop if
    // this update is lost.
    match self
      .scheduler
      .release_active_assignment(task_id, AssignmentStatus::Failed, "task canceled by user")
      .await
    {
      Ok(Some(worker_id)) => self.scheduler.publish_cancel(task_id, &worker_id).await,
      Ok(None) => {}
      Err(e) => error!("Failed to release assignment for canceled task {task_id}: {e}"),
    }
    info!("Task {task_id} canceled by user");
    Ok(())
  }

  pub async fn worker_tasks(
    &self,
    worker_id: &str,
    page: u32,
    page_size: u32,
  ) -> CoreResult<(Vec<Task>, i64)> {
    self.tasks.tasks_for_worker(worker_id, page, page_size).await
  }
}
