use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};

use super::{page_bounds, TaskStore, WorkerStore};
use crate::error::CoreResult;
use crate::models::{Account, AssignmentStatus, Task, TaskAssignment, TaskRecord, TaskStatus, Worker, WorkerStatus};

/// sqlx-backed store. All relative updates (load counters, status CAS) are
/// single SQL statements so concurrent scheduler and consumer writes never
/// read-modify-write in application memory.
#[derive(Clone)]
pub struct PgStore {
  pool: Pool<Postgres>,
}

impl PgStore {
  pub fn new(pool: Pool<Postgres>) -> Self {
    Self { pool }
  }
}

fn decode_err(msg: String) -> sqlx::Error {
  sqlx::Error::Decode(msg.into())
}

fn task_from_row(row: &PgRow) -> Result<Task, sqlx::Error> {
  let status: String = row.try_get("status")?;
  Ok(Task {
    task_id: row.try_get("task_id")?,
    task_type: row.try_get("task_type")?,
    account_id: row.try_get("account_id")?,
    params: row.try_get("params")?,
    status: TaskStatus::parse(&status)
      .ok_or_else(|| decode_err(format!("unknown task status: {status}")))?,
    priority: row.try_get("priority")?,
    error_message: row.try_get("error_message")?,
    timeout_sec: row.try_get("timeout_sec")?,
    started_at: row.try_get("started_at")?,
    completed_at: row.try_get("completed_at")?,
    created_at: row.try_get("created_at")?,
    updated_at: row.try_get("updated_at")?,
  })
}

fn worker_from_row(row: &PgRow) -> Result<Worker, sqlx::Error> {
  let status: String = row.try_get("status")?;
  Ok(Worker {
    worker_id: row.try_get("worker_id")?,
    hostname: row.try_get("hostname")?,
    ip: row.try_get("ip")?,
    status: WorkerStatus::parse(&status)
      .ok_or_else(|| decode_err(format!("unknown worker status: {status}")))?,
    last_heartbeat: row.try_get("last_heartbeat")?,
    max_tasks: row.try_get("max_tasks")?,
    current_tasks: row.try_get("current_tasks")?,
    tags: row.try_get("tags")?,
    version: row.try_get("version")?,
    created_at: row.try_get("created_at")?,
  })
}

fn assignment_from_row(row: &PgRow) -> Result<TaskAssignment, sqlx::Error> {
  let status: String = row.try_get("status")?;
  Ok(TaskAssignment {
    id: row.try_get("id")?,
    task_id: row.try_get("task_id")?,
    worker_id: row.try_get("worker_id")?,
    status: AssignmentStatus::parse(&status)
      .ok_or_else(|| decode_err(format!("unknown assignment status: {status}")))?,
    assigned_at: row.try_get("assigned_at")?,
    accepted_at: row.try_get("accepted_at")?,
    completed_at: row.try_get("completed_at")?,
    rejection_reason: row.try_get("rejection_reason")?,
    priority: row.try_get("priority")?,
  })
}

#[async_trait]
impl TaskStore for PgStore {
  async fn create_task(&self, task: &Task) -> CoreResult<()> {
    sqlx::query(
      "INSERT INTO tasks (task_id, task_type, account_id, params, status, priority, \
       error_message, timeout_sec, started_at, completed_at, created_at, updated_at) \
       VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $11)",
    )
    .bind(&task.task_id)
    .bind(&task.task_type)
    .bind(task.account_id)
    .bind(&task.params)
    .bind(task.status.as_str())
    .bind(task.priority)
    .bind(&task.error_message)
    .bind(task.timeout_sec)
    .bind(task.started_at)
    .bind(task.completed_at)
    .bind(task.created_at)
    .execute(&self.pool)
    .await?;
    Ok(())
  }

  async fn get_task(&self, task_id: &str) -> CoreResult<Option<Task>> {
    let row = sqlx::query("SELECT * FROM tasks WHERE task_id = $1")
      .bind(task_id)
      .fetch_optional(&self.pool)
      .await?;
    Ok(row.as_ref().map(task_from_row).transpose()?)
  }

  async fn list_tasks(&self, page: u32, page_size: u32) -> CoreResult<(Vec<Task>, i64)> {
    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tasks")
      .fetch_one(&self.pool)
      .await?;
    let (offset, limit) = page_bounds(page, page_size);
    let rows = sqlx::query("SELECT * FROM tasks ORDER BY created_at DESC OFFSET $1 LIMIT $2")
      .bind(offset)
      .bind(limit)
      .fetch_all(&self.pool)
      .await?;
    let tasks = rows.iter().map(task_from_row).collect::<Result<_, _>>()?;
    Ok((tasks, total))
  }

  async fn pending_tasks(&self) -> CoreResult<Vec<Task>> {
    let rows = sqlx::query(
      "SELECT * FROM tasks WHERE status = 'pending' ORDER BY priority DESC, created_at ASC",
    )
    .fetch_all(&self.pool)
    .await?;
    Ok(rows.iter().map(task_from_row).collect::<Result<_, _>>()?)
  }

  async fn mark_assigned(&self, task_id: &str) -> CoreResult<bool> {
    let result = sqlx::query(
      "UPDATE tasks SET status = 'assigned', updated_at = NOW() \
       WHERE task_id = $1 AND status = 'pending'",
    )
    .bind(task_id)
    .execute(&self.pool)
    .await?;
    Ok(result.rows_affected() > 0)
  }

  async fn mark_processing(&self, task_id: &str, started_at: DateTime<Utc>) -> CoreResult<bool> {
    let result = sqlx::query(
      "UPDATE tasks SET status = 'processing', started_at = $2, updated_at = NOW() \
       WHERE task_id = $1 AND status = 'assigned'",
    )
    .bind(task_id)
    .bind(started_at)
    .execute(&self.pool)
    .await?;
    Ok(result.rows_affected() > 0)
  }

  async fn finish_task(
    &self,
    task_id: &str,
    status: TaskStatus,
    error_message: &str,
    completed_at: DateTime<Utc>,
  ) -> CoreResult<bool> {
    let result = sqlx::query(
      "UPDATE tasks SET status = $2, error_message = $3, completed_at = $4, updated_at = NOW() \
       WHERE task_id = $1 AND status NOT IN ('completed', 'failed', 'canceled')",
    )
    .bind(task_id)
    .bind(status.as_str())
    .bind(error_message)
    .bind(completed_at)
    .execute(&self.pool)
    .await?;
    Ok(result.rows_affected() > 0)
  }

  async fn requeue_task(&self, task_id: &str) -> CoreResult<bool> {
    let result = sqlx::query(
      "UPDATE tasks SET status = 'pending', started_at = NULL, updated_at = NOW() \
       WHERE task_id = $1 AND status IN ('assigned', 'processing')",
    )
    .bind(task_id)
    .execute(&self.pool)
    .await?;
    Ok(result.rows_affected() > 0)
  }

  async fn create_assignment(&self, assignment: &TaskAssignment) -> CoreResult<i64> {
    let id: i64 = sqlx::query_scalar(
      "INSERT INTO task_assignments (task_id, worker_id, status, assigned_at, accepted_at, \
       completed_at, rejection_reason, priority) \
       VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING id",
    )
    .bind(&assignment.task_id)
    .bind(&assignment.worker_id)
    .bind(assignment.status.as_str())
    .bind(assignment.assigned_at)
    .bind(assignment.accepted_at)
    .bind(assignment.completed_at)
    .bind(&assignment.rejection_reason)
    .bind(assignment.priority)
    .fetch_one(&self.pool)
    .await?;
    Ok(id)
  }

  async fn active_assignment(&self, task_id: &str) -> CoreResult<Option<TaskAssignment>> {
    let row = sqlx::query(
      "SELECT * FROM task_assignments \
       WHERE task_id = $1 AND status IN ('pending', 'accepted') \
       ORDER BY assigned_at DESC LIMIT 1",
    )
    .bind(task_id)
    .fetch_optional(&self.pool)
    .await?;
    Ok(row.as_ref().map(assignment_from_row).transpose()?)
  }

  async fn finish_assignment(
    &self,
    task_id: &str,
    worker_id: &str,
    status: AssignmentStatus,
    reason: &str,
    completed_at: DateTime<Utc>,
  ) -> CoreResult<bool> {
    let result = sqlx::query(
      "UPDATE task_assignments SET status = $3, rejection_reason = $4, completed_at = $5 \
       WHERE task_id = $1 AND worker_id = $2 AND status IN ('pending', 'accepted')",
    )
    .bind(task_id)
    .bind(worker_id)
    .bind(status.as_str())
    .bind(reason)
    .bind(completed_at)
    .execute(&self.pool)
    .await?;
    Ok(result.rows_affected() > 0)
  }

  async fn create_record(&self, record: &TaskRecord) -> CoreResult<()> {
    sqlx::query(
      "INSERT INTO task_records (task_id, worker_id, status, result, error_message, \
       started_at, completed_at, execution_time_ms) \
       VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
    )
    .bind(&record.task_id)
    .bind(&record.worker_id)
    .bind(record.status.as_str())
    .bind(&record.result)
    .bind(&record.error_message)
    .bind(record.started_at)
    .bind(record.completed_at)
    .bind(record.execution_time_ms)
    .execute(&self.pool)
    .await?;
    Ok(())
  }

  async fn tasks_for_worker(
    &self,
    worker_id: &str,
    page: u32,
    page_size: u32,
  ) -> CoreResult<(Vec<Task>, i64)> {
    let total: i64 = sqlx::query_scalar(
      "SELECT COUNT(*) FROM tasks t \
       JOIN task_assignments a ON a.task_id = t.task_id WHERE a.worker_id = $1",
    )
    .bind(worker_id)
    .fetch_one(&self.pool)
    .await?;
    let (offset, limit) = page_bounds(page, page_size);
    let rows = sqlx::query(
      "SELECT t.* FROM tasks t \
       JOIN task_assignments a ON a.task_id = t.task_id \
       WHERE a.worker_id = $1 ORDER BY a.assigned_at DESC OFFSET $2 LIMIT $3",
    )
    .bind(worker_id)
    .bind(offset)
    .bind(limit)
    .fetch_all(&self.pool)
    .await?;
    let tasks = rows.iter().map(task_from_row).collect::<Result<_, _>>()?;
    Ok((tasks, total))
  }

  async fn expired_assignments(&self, now: DateTime<Utc>) -> CoreResult<Vec<TaskAssignment>> {
    let rows = sqlx::query(
      "SELECT a.* FROM task_assignments a \
       JOIN tasks t ON t.task_id = a.task_id \
       WHERE a.status IN ('pending', 'accepted') \
         AND t.status IN ('assigned', 'processing') \
         AND a.assigned_at + make_interval(secs => t.timeout_sec) < $1",
    )
    .bind(now)
    .fetch_all(&self.pool)
    .await?;
    Ok(rows.iter().map(assignment_from_row).collect::<Result<_, _>>()?)
  }

  async fn find_account(&self, account_id: i64) -> CoreResult<Option<Account>> {
    let row = sqlx::query("SELECT id, phone, username, status FROM accounts WHERE id = $1")
      .bind(account_id)
      .fetch_optional(&self.pool)
      .await?;
    Ok(match row {
      Some(row) => Some(Account {
        id: row.try_get("id")?,
        phone: row.try_get("phone")?,
        username: row.try_get("username")?,
        status: row.try_get("status")?,
      }),
      None => None,
    })
  }

  async fn create_account(&self, account: &Account) -> CoreResult<()> {
    sqlx::query("INSERT INTO accounts (id, phone, username, status) VALUES ($1, $2, $3, $4)")
      .bind(account.id)
      .bind(&account.phone)
      .bind(&account.username)
      .bind(&account.status)
      .execute(&self.pool)
      .await?;
    Ok(())
  }
}

#[async_trait]
impl WorkerStore for PgStore {
  async fn find_by_addr(&self, hostname: &str, ip: &str) -> CoreResult<Option<Worker>> {
    let row = sqlx::query("SELECT * FROM workers WHERE hostname = $1 AND ip = $2")
      .bind(hostname)
      .bind(ip)
      .fetch_optional(&self.pool)
      .await?;
    Ok(row.as_ref().map(worker_from_row).transpose()?)
  }

  async fn insert_worker(&self, worker: &Worker) -> CoreResult<()> {
    sqlx::query(
      "INSERT INTO workers (worker_id, hostname, ip, status, last_heartbeat, max_tasks, \
       current_tasks, tags, version, created_at) \
       VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
    )
    .bind(&worker.worker_id)
    .bind(&worker.hostname)
    .bind(&worker.ip)
    .bind(worker.status.as_str())
    .bind(worker.last_heartbeat)
    .bind(worker.max_tasks)
    .bind(worker.current_tasks)
    .bind(&worker.tags)
    .bind(&worker.version)
    .bind(worker.created_at)
    .execute(&self.pool)
    .await?;
    Ok(())
  }

  async fn reactivate_worker(
    &self,
    worker_id: &str,
    max_tasks: i32,
    tags: &str,
    now: DateTime<Utc>,
  ) -> CoreResult<()> {
    sqlx::query(
      "UPDATE workers SET status = 'online', last_heartbeat = $2, max_tasks = $3, \
       current_tasks = 0, tags = $4 WHERE worker_id = $1",
    )
    .bind(worker_id)
    .bind(now)
    .bind(max_tasks)
    .bind(tags)
    .execute(&self.pool)
    .await?;
    Ok(())
  }

  async fn heartbeat(&self, worker_id: &str, now: DateTime<Utc>) -> CoreResult<bool> {
    let result = sqlx::query(
      "UPDATE workers SET status = 'online', last_heartbeat = $2 WHERE worker_id = $1",
    )
    .bind(worker_id)
    .bind(now)
    .execute(&self.pool)
    .await?;
    Ok(result.rows_affected() > 0)
  }

  async fn available_workers(
    &self,
    tag: Option<&str>,
    seen_since: DateTime<Utc>,
  ) -> CoreResult<Vec<Worker>> {
    let rows = match tag {
      Some(tag) => {
        sqlx::query(
          "SELECT * FROM workers \
           WHERE status = 'online' AND current_tasks < max_tasks AND last_heartbeat >= $1 \
             AND $2 = ANY(string_to_array(replace(tags, ' ', ''), ',')) \
           ORDER BY current_tasks ASC, worker_id ASC",
        )
        .bind(seen_since)
        .bind(tag)
        .fetch_all(&self.pool)
        .await?
      }
      None => {
        sqlx::query(
          "SELECT * FROM workers \
           WHERE status = 'online' AND current_tasks < max_tasks AND last_heartbeat >= $1 \
           ORDER BY current_tasks ASC, worker_id ASC",
        )
        .bind(seen_since)
        .fetch_all(&self.pool)
        .await?
      }
    };
    Ok(rows.iter().map(worker_from_row).collect::<Result<_, _>>()?)
  }

  async fn increment_load(&self, worker_id: &str) -> CoreResult<()> {
    sqlx::query(
      "UPDATE workers SET current_tasks = LEAST(current_tasks + 1, max_tasks) \
       WHERE worker_id = $1",
    )
    .bind(worker_id)
    .execute(&self.pool)
    .await?;
    Ok(())
  }

  async fn decrement_load(&self, worker_id: &str) -> CoreResult<()> {
    sqlx::query(
      "UPDATE workers SET current_tasks = GREATEST(current_tasks - 1, 0) \
       WHERE worker_id = $1",
    )
    .bind(worker_id)
    .execute(&self.pool)
    .await?;
    Ok(())
  }

  async fn get_worker(&self, worker_id: &str) -> CoreResult<Option<Worker>> {
    let row = sqlx::query("SELECT * FROM workers WHERE worker_id = $1")
      .bind(worker_id)
      .fetch_optional(&self.pool)
      .await?;
    Ok(row.as_ref().map(worker_from_row).transpose()?)
  }

  async fn list_workers(&self, page: u32, page_size: u32) -> CoreResult<(Vec<Worker>, i64)> {
    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM workers")
      .fetch_one(&self.pool)
      .await?;
    let (offset, limit) = page_bounds(page, page_size);
    let rows = sqlx::query("SELECT * FROM workers ORDER BY created_at ASC OFFSET $1 LIMIT $2")
      .bind(offset)
      .bind(limit)
      .fetch_all(&self.pool)
      .await?;
    let workers = rows.iter().map(worker_from_row).collect::<Result<_, _>>()?;
    Ok((workers, total))
  }

  async fn mark_stale_offline(&self, seen_before: DateTime<Utc>) -> CoreResult<u64> {
    let result = sqlx::query(
      "UPDATE workers SET status = 'offline' \
       WHERE status = 'online' AND last_heartbeat < $1",
    )
    .bind(seen_before)
    .execute(&self.pool)
    .await?;
    Ok(result.rows_affected())
  }
}
