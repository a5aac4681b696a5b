//! The orchestration core: a periodic loop binding pending tasks to available
//! workers, and a result consumer reconciling worker outcomes back into
//! durable task state.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::broker::{
  publish_json, task_routing_key, Broker, ConsumerGuard, Handler, CANCEL_ROUTING_KEY,
  RESULT_ROUTING_KEY,
};
use crate::error::{CoreError, CoreResult};
use crate::models::{
  AssignmentStatus, CancelMessage, Task, TaskAssignment, TaskMessage, TaskRecord,
  TaskResultMessage, TaskStatus,
};
use crate::registry::WorkerRegistry;
use crate::status_store::StatusStore;
use crate::store::TaskStore;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
  pub tick_interval: Duration,
  pub tasks_exchange: String,
  pub results_exchange: String,
  pub results_queue: String,
}

impl Default for SchedulerConfig {
  fn default() -> Self {
    Self {
      tick_interval: Duration::from_secs(15),
      tasks_exchange: "taskmesh.tasks".into(),
      results_exchange: "taskmesh.results".into(),
      results_queue: "taskmesh.task_results".into(),
    }
  }
}

pub struct TaskScheduler {
  tasks: Arc<dyn TaskStore>,
  registry: WorkerRegistry,
  broker: Arc<dyn Broker>,
  status: Arc<dyn StatusStore>,
  config: SchedulerConfig,
  stop: Mutex<Option<watch::Sender<bool>>>,
  consumer: Mutex<Option<ConsumerGuard>>,
}

impl TaskScheduler {
  pub fn new(
    tasks: Arc<dyn TaskStore>,
    registry: WorkerRegistry,
    broker: Arc<dyn Broker>,
    status: Arc<dyn StatusStore>,
    config: SchedulerConfig,
  ) -> Arc<Self> {
    Arc::new(Self {
      tasks,
      registry,
      broker,
      status,
      config,
      stop: Mutex::new(None),
      consumer: Mutex::new(None),
    })
  }

  /// Spawns the periodic scheduling loop and registers the result consumer.
  pub async fn start(self: &Arc<Self>) -> CoreResult<()> {
    let mut stop = self.stop.lock().unwrap();
    if stop.is_some() {
      return Err(CoreError::AlreadyRunning);
    }
    let (tx, mut rx) = watch::channel(false);
    *stop = Some(tx);
    drop(stop);

    let this = self.clone();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(this.config.tick_interval);
      // The immediate first tick duplicates the opportunistic create-time
      // attempt; skip it.
      ticker.tick().await;
      loop {
        tokio::select! {
          _ = ticker.tick() => this.run_pass().await,
          _ = rx.changed() => {
            if *rx.borrow() {
              info!("Task scheduler loop stopped");
              break;
            }
          }
        }
      }
    });

    let this = self.clone();
    let handler: Handler = Arc::new(move |data: Vec<u8>| {
      let this = this.clone();
      async move { this.handle_result(&data).await }.boxed()
    });
    let guard = self
      .broker
      .consume(&self.config.results_exchange, &self.config.results_queue, RESULT_ROUTING_KEY, handler)
      .await?;
    *self.consumer.lock().unwrap() = Some(guard);

    info!("Task scheduler started");
    Ok(())
  }

  /// Stops the result consumer, then the periodic loop. In-flight handlers
  /// finish on their own; the manual-ack contract keeps any undelivered
  /// message requeueable.
  pub fn shutdown(&self) {
    if let Some(guard) = self.consumer.lock().unwrap().take() {
      guard.cancel();
    }
    let mut stop = self.stop.lock().unwrap();
    if let Some(tx) = stop.take() {
      let _ = tx.send(true);
      info!("Task scheduler shutting down");
    }
  }

  /// One scheduling tick: reap stale workers, reclaim timed-out assignments,
  /// then match pending tasks against available capacity.
  pub async fn run_pass(&self) {
    if let Err(e) = self.registry.reap_stale().await {
      error!("Stale-worker reap failed: {e}");
    }
    if let Err(e) = self.reclaim_expired().await {
      error!("Reclaim sweep failed: {e}");
    }
    if let Err(e) = self.schedule_pending().await {
      error!("Scheduling pass failed: {e}");
    }
  }

  /// Round-robin assignment of pending tasks over the available-worker
  /// snapshot. A worker leaves the rotation once its projected load reaches
  /// capacity; tasks left over when the rotation empties stay pending for the
  /// next tick. Returns the number of tasks dispatched.
  pub async fn schedule_pending(&self) -> CoreResult<usize> {
    let pending = self.tasks.pending_tasks().await?;
    if pending.is_empty() {
      return Ok(0);
    }

    let workers = self.registry.available_workers().await?;
    if workers.is_empty() {
      warn!("No available workers for {} pending task(s)", pending.len());
      return Ok(0);
    }

    // (worker, projected load) — projected so one pass never over-commits a
    // worker beyond capacity even before the persisted counters catch up.
    let mut rotation: Vec<(crate::models::Worker, i32)> =
      workers.into_iter().map(|w| { let load = w.current_tasks; (w, load) }).collect();
    let mut idx = 0;
    let mut dispatched = 0;

    for task in pending {
      if rotation.is_empty() {
        break;
      }
      let worker_id = rotation[idx].0.worker_id.clone();
      match self.assign_task(&task, &worker_id).await {
        Ok(true) => {
          rotation[idx].1 += 1;
          dispatched += 1;
        }
        Ok(false) => debug!("Task {} already claimed elsewhere", task.task_id),
        Err(e) => error!("Failed to assign task {} to worker {}: {e}", task.task_id, worker_id),
      }

      if rotation[idx].1 >= rotation[idx].0.max_tasks {
        rotation.remove(idx);
        if rotation.is_empty() {
          break;
        }
        idx %= rotation.len();
      } else {
        idx = (idx + 1) % rotation.len();
      }
    }
    Ok(dispatched)
  }

  /// Opportunistic single assignment right after task creation. Races with
  /// the periodic pass by design; the store-level compare-and-swap picks the
  /// winner. No capacity is a normal deferral, not an error.
  pub async fn try_assign_now(&self, task: &Task) -> CoreResult<()> {
    match self.registry.select_available(None).await {
      Ok(worker) => {
        self.assign_task(task, &worker.worker_id).await?;
        Ok(())
      }
      Err(CoreError::NoAvailableWorker) => {
        debug!("No available worker for task {}, left pending", task.task_id);
        Ok(())
      }
      Err(e) => Err(e),
    }
  }

  /// Binds one task to one worker. The `pending -> assigned` CAS runs first:
  /// losing it means another path already owns the task and nothing else may
  /// happen. A dispatch-publish failure terminates the task as failed so it
  /// is never left assigned with no outbound message.
  pub async fn assign_task(&self, task: &Task, worker_id: &str) -> CoreResult<bool> {
    if !self.tasks.mark_assigned(&task.task_id).await? {
      return Ok(false);
    }

    let now = Utc::now();
    let assignment = TaskAssignment {
      id: 0,
      task_id: task.task_id.clone(),
      worker_id: worker_id.to_string(),
      status: AssignmentStatus::Pending,
      assigned_at: now,
      accepted_at: None,
      completed_at: None,
      rejection_reason: String::new(),
      priority: task.priority,
    };
    self.tasks.create_assignment(&assignment).await?;
    self.registry.increment_load(worker_id).await?;
    self.save_status(&task.task_id, TaskStatus::Assigned).await;

    let message = TaskMessage {
      task_id: task.task_id.clone(),
      task_type: task.task_type.clone(),
      account_id: task.account_id,
      params: task.params.clone(),
      worker_id: worker_id.to_string(),
      timeout: task.timeout_sec,
      created_at: task.created_at,
    };
    let routing_key = task_routing_key(&task.task_type);
    if let Err(e) =
      publish_json(self.broker.as_ref(), &self.config.tasks_exchange, &routing_key, &message).await
    {
      error!("Failed to publish task {}: {e}", task.task_id);
      let reason = format!("failed to publish task message: {e}");
      let now = Utc::now();
      if let Err(e) = self
        .tasks
        .finish_assignment(&task.task_id, worker_id, AssignmentStatus::Rejected, &reason, now)
        .await
      {
        error!("Failed to reject assignment for task {}: {e}", task.task_id);
      }
      if let Err(e) = self.registry.decrement_load(worker_id).await {
        error!("Failed to release load on worker {worker_id}: {e}");
      }
      if let Err(e) = self.tasks.finish_task(&task.task_id, TaskStatus::Failed, &reason, now).await
      {
        error!("Failed to mark task {} failed: {e}", task.task_id);
      }
      self.save_status(&task.task_id, TaskStatus::Failed).await;
      return Err(e);
    }

    info!("Task {} assigned to worker {}", task.task_id, worker_id);
    Ok(true)
  }

  /// Result-message ingestion. Malformed or incomplete messages are dropped
  /// and acknowledged: they cannot be usefully retried. An `Err` here means a
  /// transient fault and the delivery is requeued.
  pub async fn handle_result(&self, data: &[u8]) -> anyhow::Result<()> {
    let msg: TaskResultMessage = match serde_json::from_slice(data) {
      Ok(msg) => msg,
      Err(e) => {
        error!("Malformed result message dropped: {e}");
        return Ok(());
      }
    };
    if msg.task_id.is_empty() || msg.status.is_empty() {
      error!("Result message missing task_id or status, dropped");
      return Ok(());
    }

    let task = match self.tasks.get_task(&msg.task_id).await? {
      Some(task) => task,
      None => {
        error!("Result for unknown task {} dropped", msg.task_id);
        return Ok(());
      }
    };
    if task.status.is_terminal() {
      // Duplicate delivery or a belated result for a canceled task. The
      // assignment may still be live if the task was closed out of band, so
      // release the worker's slot before discarding.
      self
        .release_active_assignment(&task.task_id, AssignmentStatus::Failed, "task closed before result")
        .await?;
      info!("Task {} already {}, result discarded", task.task_id, task.status.as_str());
      return Ok(());
    }

    let status =
      if msg.status == "completed" { TaskStatus::Completed } else { TaskStatus::Failed };
    let completed_at = msg.completed_at.unwrap_or_else(Utc::now);

    // Steps below are independently best-effort: one failed update must not
    // block the rest, or the worker's slot never frees.
    let assignment = match self.tasks.active_assignment(&msg.task_id).await {
      Ok(assignment) => assignment,
      Err(e) => {
        error!("Assignment lookup failed for task {}: {e}", msg.task_id);
        None
      }
    };

    if let Err(e) = self.tasks.finish_task(&msg.task_id, status, &msg.error, completed_at).await {
      error!("Failed to update task {} status: {e}", msg.task_id);
    }
    self.save_status(&msg.task_id, status).await;

    let worker_id = assignment
      .as_ref()
      .map(|a| a.worker_id.clone())
      .filter(|id| !id.is_empty())
      .unwrap_or_else(|| msg.worker_id.clone());
    if worker_id.is_empty() {
      warn!("Result for task {} names no worker, skipping load release", msg.task_id);
      return Ok(());
    }

    let assignment_status = if status == TaskStatus::Completed {
      AssignmentStatus::Completed
    } else {
      AssignmentStatus::Failed
    };
    if let Err(e) = self
      .tasks
      .finish_assignment(&msg.task_id, &worker_id, assignment_status, "", completed_at)
      .await
    {
      error!("Failed to close assignment for task {}: {e}", msg.task_id);
    }
    if let Err(e) = self.registry.decrement_load(&worker_id).await {
      error!("Failed to release load on worker {worker_id}: {e}");
    }
    if let Some(assignment) = assignment {
      let record = TaskRecord {
        task_id: msg.task_id.clone(),
        worker_id: worker_id.clone(),
        status,
        result: msg.result,
        error_message: msg.error.clone(),
        started_at: assignment.assigned_at,
        completed_at,
        execution_time_ms: (completed_at - assignment.assigned_at).num_milliseconds(),
      };
      if let Err(e) = self.tasks.create_record(&record).await {
        error!("Failed to write record for task {}: {e}", msg.task_id);
      }
    }

    info!("Task {} finished with status {}", msg.task_id, status.as_str());
    Ok(())
  }

  /// Closes the live assignment for a task, if any, and frees the worker's
  /// slot. The close is keyed to the non-terminal assignment row, so repeated
  /// calls release the slot exactly once. Returns the worker that held the
  /// assignment.
  pub async fn release_active_assignment(
    &self,
    task_id: &str,
    status: AssignmentStatus,
    reason: &str,
  ) -> CoreResult<Option<String>> {
    let assignment = match self.tasks.active_assignment(task_id).await? {
      Some(assignment) => assignment,
      None => return Ok(None),
    };
    let closed = self
      .tasks
      .finish_assignment(task_id, &assignment.worker_id, status, reason, Utc::now())
      .await?;
    if closed {
      self.registry.decrement_load(&assignment.worker_id).await?;
    }
    Ok(Some(assignment.worker_id))
  }

  /// Fire-and-forget cancellation notice toward the worker holding the task.
  pub async fn publish_cancel(&self, task_id: &str, worker_id: &str) {
    let message = CancelMessage { task_id: task_id.to_string(), worker_id: worker_id.to_string() };
    if let Err(e) =
      publish_json(self.broker.as_ref(), &self.config.tasks_exchange, CANCEL_ROUTING_KEY, &message)
        .await
    {
      warn!("Cancel notice for task {task_id} not delivered: {e}");
    }
  }

  /// Returns tasks whose active assignment outlived `timeout_sec` with no
  /// result to `pending`, failing the assignment and releasing the worker.
  pub async fn reclaim_expired(&self) -> CoreResult<usize> {
    let expired = self.tasks.expired_assignments(Utc::now()).await?;
    for assignment in &expired {
      warn!(
        "Reclaiming task {} from worker {}: no result within timeout",
        assignment.task_id, assignment.worker_id
      );
      let now = Utc::now();
      if let Err(e) = self
        .tasks
        .finish_assignment(
          &assignment.task_id,
          &assignment.worker_id,
          AssignmentStatus::Failed,
          "no result within task timeout",
          now,
        )
        .await
      {
        error!("Failed to fail expired assignment for task {}: {e}", assignment.task_id);
      }
      if let Err(e) = self.registry.decrement_load(&assignment.worker_id).await {
        error!("Failed to release load on worker {}: {e}", assignment.worker_id);
      }
      if let Err(e) = self.tasks.requeue_task(&assignment.task_id).await {
        error!("Failed to requeue task {}: {e}", assignment.task_id);
      }
      self.save_status(&assignment.task_id, TaskStatus::Pending).await;
    }
    Ok(expired.len())
  }

  async fn save_status(&self, task_id: &str, status: TaskStatus) {
    if let Err(e) = self.status.save_status(task_id, status.as_str()).await {
      warn!("Status mirror write failed for task {task_id}: {e}");
    }
  }
}
