use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use taskmesh::broker::{
  task_routing_key, Broker, MemoryBroker, CANCEL_ROUTING_KEY, RESULT_ROUTING_KEY,
};
use taskmesh::error::CoreError;
use taskmesh::models::{
  Account, AssignmentStatus, Task, TaskResultMessage, TaskStatus,
};
use taskmesh::registry::WorkerRegistry;
use taskmesh::scheduler::{SchedulerConfig, TaskScheduler};
use taskmesh::service::TaskService;
use taskmesh::status_store::{MemoryStatusStore, StatusStore};
use taskmesh::store::{MemoryStore, TaskStore, WorkerStore};

struct Env {
  store: Arc<MemoryStore>,
  broker: Arc<MemoryBroker>,
  registry: WorkerRegistry,
  scheduler: Arc<TaskScheduler>,
  service: TaskService,
  status: Arc<MemoryStatusStore>,
}

fn env() -> Env {
  let store = Arc::new(MemoryStore::new());
  let broker = Arc::new(MemoryBroker::new());
  let status = MemoryStatusStore::new(Duration::from_secs(60));
  let registry = WorkerRegistry::new(store.clone(), Duration::from_secs(60));
  let scheduler = TaskScheduler::new(
    store.clone(),
    registry.clone(),
    broker.clone(),
    status.clone(),
    SchedulerConfig::default(),
  );
  let service = TaskService::new(store.clone(), scheduler.clone(), status.clone());
  Env { store, broker, registry, scheduler, service, status }
}

impl Env {
  async fn seed_account(&self, id: i64) {
    self
      .store
      .create_account(&Account {
        id,
        phone: "100000".into(),
        username: "user".into(),
        status: "ACTIVE".into(),
      })
      .await
      .unwrap();
  }

  async fn seed_task(&self, task_id: &str, priority: i32) -> Task {
    let now = Utc::now();
    let task = Task {
      task_id: task_id.to_string(),
      task_type: "send_message".into(),
      account_id: 1,
      params: json!({ "target": "@someone" }),
      status: TaskStatus::Pending,
      priority,
      error_message: String::new(),
      timeout_sec: 300,
      started_at: None,
      completed_at: None,
      created_at: now,
      updated_at: now,
    };
    self.store.create_task(&task).await.unwrap();
    task
  }

  async fn seed_worker(&self, hostname: &str, max_tasks: i32) -> String {
    self
      .registry
      .register(hostname, "10.0.0.1", max_tasks, "", "1.0.0")
      .await
      .unwrap()
  }

  async fn worker_load(&self, worker_id: &str) -> i32 {
    self.store.get_worker(worker_id).await.unwrap().unwrap().current_tasks
  }

  fn result_message(&self, task_id: &str, worker_id: &str, status: &str, error: &str) -> Vec<u8> {
    serde_json::to_vec(&TaskResultMessage {
      task_id: task_id.to_string(),
      account_id: 1,
      worker_id: worker_id.to_string(),
      status: status.to_string(),
      result: json!({ "ok": status == "completed" }),
      error: error.to_string(),
      completed_at: Some(Utc::now()),
    })
    .unwrap()
  }
}

#[tokio::test]
async fn round_robin_spreads_tasks_over_the_snapshot() {
  let env = env();
  env.seed_account(1).await;
  for i in 0..3 {
    env.seed_task(&format!("task_{i}"), 0).await;
  }
  let w1 = env.seed_worker("host-a", 2).await;
  let w2 = env.seed_worker("host-b", 2).await;

  let dispatched = env.scheduler.schedule_pending().await.unwrap();
  assert_eq!(dispatched, 3);

  let load1 = env.worker_load(&w1).await;
  let load2 = env.worker_load(&w2).await;
  assert!(load1 >= 1 && load2 >= 1, "each worker gets at least one task");
  assert_eq!(load1 + load2, 3);
  assert_eq!(env.broker.published_to(&task_routing_key("send_message")).len(), 3);
}

#[tokio::test]
async fn rotation_stops_when_capacity_is_exhausted() {
  let env = env();
  env.seed_account(1).await;
  for i in 0..5 {
    env.seed_task(&format!("task_{i}"), 0).await;
  }
  env.seed_worker("host-a", 1).await;
  env.seed_worker("host-b", 2).await;

  let dispatched = env.scheduler.schedule_pending().await.unwrap();
  assert_eq!(dispatched, 3);

  let pending = env.store.pending_tasks().await.unwrap();
  assert_eq!(pending.len(), 2, "overflow stays pending for the next tick");
}

#[tokio::test]
async fn no_double_dispatch_under_concurrent_triggers() {
  let env = env();
  env.seed_account(1).await;
  let task = env.seed_task("task_raced", 0).await;
  env.seed_worker("host-a", 4).await;

  let (immediate, pass) = tokio::join!(
    env.scheduler.try_assign_now(&task),
    env.scheduler.schedule_pending(),
  );
  immediate.unwrap();
  pass.unwrap();

  assert_eq!(env.broker.published_to(&task_routing_key("send_message")).len(), 1);
  assert_eq!(env.store.assignments_for("task_raced").len(), 1);
}

#[tokio::test]
async fn at_most_one_active_assignment_across_reschedules() {
  let env = env();
  env.seed_account(1).await;
  let task = env.seed_task("task_retry", 0).await;
  let w1 = env.seed_worker("host-a", 4).await;

  env.scheduler.try_assign_now(&task).await.unwrap();
  let data = env.result_message("task_retry", &w1, "failed", "flood wait");
  env.scheduler.handle_result(&data).await.unwrap();

  let active: Vec<_> = env
    .store
    .assignments_for("task_retry")
    .into_iter()
    .filter(|a| !a.status.is_terminal())
    .collect();
  assert!(active.is_empty());
}

#[tokio::test]
async fn failed_result_updates_task_assignment_record_and_load() {
  let env = env();
  env.seed_account(1).await;
  let task = env.seed_task("task_a", 0).await;
  let worker_id = env.seed_worker("host-a", 4).await;
  env.scheduler.try_assign_now(&task).await.unwrap();
  assert_eq!(env.worker_load(&worker_id).await, 1);

  let data = env.result_message("task_a", &worker_id, "failed", "timeout");
  env.scheduler.handle_result(&data).await.unwrap();

  let task = env.store.get_task("task_a").await.unwrap().unwrap();
  assert_eq!(task.status, TaskStatus::Failed);
  assert_eq!(task.error_message, "timeout");
  assert!(task.completed_at.is_some());

  let assignments = env.store.assignments_for("task_a");
  assert_eq!(assignments.len(), 1);
  assert_eq!(assignments[0].status, AssignmentStatus::Failed);

  let records = env.store.records_for("task_a");
  assert_eq!(records.len(), 1);
  assert_eq!(records[0].error_message, "timeout");
  assert!(records[0].execution_time_ms >= 0);

  assert_eq!(env.worker_load(&worker_id).await, 0);
}

#[tokio::test]
async fn duplicate_result_delivery_is_a_noop() {
  let env = env();
  env.seed_account(1).await;
  let task = env.seed_task("task_a", 0).await;
  let worker_id = env.seed_worker("host-a", 4).await;
  env.scheduler.try_assign_now(&task).await.unwrap();
  // A second in-flight task keeps the load counter observable after the
  // first decrement.
  let other = env.seed_task("task_b", 0).await;
  env.scheduler.try_assign_now(&other).await.unwrap();
  assert_eq!(env.worker_load(&worker_id).await, 2);

  let data = env.result_message("task_a", &worker_id, "completed", "");
  env.scheduler.handle_result(&data).await.unwrap();
  env.scheduler.handle_result(&data).await.unwrap();

  assert_eq!(env.worker_load(&worker_id).await, 1, "load released exactly once");
  assert_eq!(env.store.records_for("task_a").len(), 1);
  let task = env.store.get_task("task_a").await.unwrap().unwrap();
  assert_eq!(task.status, TaskStatus::Completed);
}

#[tokio::test]
async fn create_task_rejects_unknown_account() {
  let env = env();
  let err = env
    .service
    .create_task("send_message", 42, json!({}), 0)
    .await
    .unwrap_err();
  assert!(matches!(err, CoreError::AccountNotFound));
  let (_, total) = env.store.list_tasks(1, 10).await.unwrap();
  assert_eq!(total, 0, "no task row is created");
}

#[tokio::test]
async fn task_waits_until_a_worker_registers() {
  let env = env();
  env.seed_account(1).await;
  let task = env
    .service
    .create_task("send_message", 1, json!({ "target": "@x" }), 0)
    .await
    .unwrap();
  // Let the opportunistic assignment attempt run; with no workers it defers.
  tokio::time::sleep(Duration::from_millis(20)).await;
  let current = env.store.get_task(&task.task_id).await.unwrap().unwrap();
  assert_eq!(current.status, TaskStatus::Pending);

  let worker_id = env.seed_worker("host-a", 4).await;
  env.registry.heartbeat(&worker_id).await.unwrap();
  env.scheduler.schedule_pending().await.unwrap();

  let current = env.store.get_task(&task.task_id).await.unwrap().unwrap();
  assert_eq!(current.status, TaskStatus::Assigned);
}

#[tokio::test]
async fn cancel_then_belated_result_is_discarded() {
  let env = env();
  env.seed_account(1).await;
  env.seed_task("task_a", 0).await;
  let worker_id = env.seed_worker("host-a", 4).await;

  env.service.cancel_task("task_a").await.unwrap();
  let task = env.store.get_task("task_a").await.unwrap().unwrap();
  assert_eq!(task.status, TaskStatus::Canceled);
  assert_eq!(task.error_message, "Task canceled by user");

  let data = env.result_message("task_a", &worker_id, "completed", "");
  env.scheduler.handle_result(&data).await.unwrap();

  let task = env.store.get_task("task_a").await.unwrap().unwrap();
  assert_eq!(task.status, TaskStatus::Canceled, "terminal state never reopens");
  assert!(env.store.records_for("task_a").is_empty());
}

#[tokio::test]
async fn cancel_of_in_flight_task_releases_the_worker_slot() {
  let env = env();
  env.seed_account(1).await;
  let task = env.seed_task("task_a", 0).await;
  let worker_id = env.seed_worker("host-a", 4).await;
  env.scheduler.try_assign_now(&task).await.unwrap();
  env.store.mark_processing("task_a", Utc::now()).await.unwrap();
  assert_eq!(env.worker_load(&worker_id).await, 1);

  env.service.cancel_task("task_a").await.unwrap();

  assert_eq!(env.worker_load(&worker_id).await, 0, "cancel frees the slot");
  let assignments = env.store.assignments_for("task_a");
  assert_eq!(assignments.len(), 1);
  assert!(assignments[0].status.is_terminal());
  let notices = env.broker.published_to(CANCEL_ROUTING_KEY);
  assert_eq!(notices.len(), 1);

  // The worker's belated result must not release the slot a second time.
  let other = env.seed_task("task_b", 0).await;
  env.scheduler.try_assign_now(&other).await.unwrap();
  assert_eq!(env.worker_load(&worker_id).await, 1);
  let data = env.result_message("task_a", &worker_id, "completed", "");
  env.scheduler.handle_result(&data).await.unwrap();
  assert_eq!(env.worker_load(&worker_id).await, 1);
  assert!(env.store.records_for("task_a").is_empty());
}

#[tokio::test]
async fn belated_result_releases_an_assignment_left_by_an_out_of_band_close() {
  let env = env();
  env.seed_account(1).await;
  let task = env.seed_task("task_a", 0).await;
  let worker_id = env.seed_worker("host-a", 4).await;
  env.scheduler.try_assign_now(&task).await.unwrap();
  // Close the task without touching the assignment or the load counter.
  env
    .store
    .finish_task("task_a", TaskStatus::Canceled, "Task canceled by user", Utc::now())
    .await
    .unwrap();
  assert_eq!(env.worker_load(&worker_id).await, 1);

  let data = env.result_message("task_a", &worker_id, "completed", "");
  env.scheduler.handle_result(&data).await.unwrap();

  assert_eq!(env.worker_load(&worker_id).await, 0, "result consumer frees the slot");
  assert!(env.store.assignments_for("task_a")[0].status.is_terminal());
  assert_eq!(env.scheduler.reclaim_expired().await.unwrap(), 0);
  let task = env.store.get_task("task_a").await.unwrap().unwrap();
  assert_eq!(task.status, TaskStatus::Canceled);
  assert!(env.store.records_for("task_a").is_empty());
}

#[tokio::test]
async fn cancel_is_limited_to_pending_and_processing() {
  let env = env();
  env.seed_account(1).await;
  let task = env.seed_task("task_a", 0).await;
  env.seed_worker("host-a", 4).await;
  env.scheduler.try_assign_now(&task).await.unwrap();

  let err = env.service.cancel_task("task_a").await.unwrap_err();
  assert!(matches!(err, CoreError::InvalidTaskStatus));
  let task = env.store.get_task("task_a").await.unwrap().unwrap();
  assert_eq!(task.status, TaskStatus::Assigned, "rejected cancel mutates nothing");
}

#[tokio::test]
async fn publish_failure_terminates_the_task() {
  let env = env();
  env.seed_account(1).await;
  let task = env.seed_task("task_a", 0).await;
  let worker_id = env.seed_worker("host-a", 4).await;

  env.broker.fail_next_publishes(true);
  let err = env.scheduler.assign_task(&task, &worker_id).await.unwrap_err();
  assert!(matches!(err, CoreError::QueuePublishFailed(_)));

  let task = env.store.get_task("task_a").await.unwrap().unwrap();
  assert_eq!(task.status, TaskStatus::Failed);
  assert!(task.error_message.contains("failed to publish"));
  let assignments = env.store.assignments_for("task_a");
  assert_eq!(assignments[0].status, AssignmentStatus::Rejected);
  assert_eq!(env.worker_load(&worker_id).await, 0, "slot released on failure");
}

#[tokio::test]
async fn reclaim_returns_timed_out_tasks_to_pending() {
  let env = env();
  env.seed_account(1).await;
  let mut task = env.seed_task("task_a", 0).await;
  task.timeout_sec = 1;
  env.store.create_task(&task).await.unwrap();
  let worker_id = env.seed_worker("host-a", 4).await;
  env.scheduler.try_assign_now(&task).await.unwrap();

  // Too early: the assignment has not outlived its timeout yet.
  assert_eq!(env.scheduler.reclaim_expired().await.unwrap(), 0);

  tokio::time::sleep(Duration::from_millis(1100)).await;
  assert_eq!(env.scheduler.reclaim_expired().await.unwrap(), 1);

  let task = env.store.get_task("task_a").await.unwrap().unwrap();
  assert_eq!(task.status, TaskStatus::Pending);
  let assignments = env.store.assignments_for("task_a");
  assert_eq!(assignments[0].status, AssignmentStatus::Failed);
  assert_eq!(env.worker_load(&worker_id).await, 0);
}

#[tokio::test]
async fn malformed_results_are_dropped_not_requeued() {
  let env = env();
  env.scheduler.start().await.unwrap();

  env
    .broker
    .publish("taskmesh.results", RESULT_ROUTING_KEY, b"not json at all")
    .await
    .unwrap();
  env
    .broker
    .publish("taskmesh.results", RESULT_ROUTING_KEY, br#"{"task_id":"task_x"}"#)
    .await
    .unwrap();

  assert_eq!(env.broker.nack_count(), 0, "unusable messages are acknowledged");
  env.scheduler.shutdown();
}

#[tokio::test]
async fn result_consumer_closes_the_loop_end_to_end() {
  let env = env();
  env.seed_account(1).await;
  let task = env.seed_task("task_a", 0).await;
  let worker_id = env.seed_worker("host-a", 4).await;
  env.scheduler.start().await.unwrap();
  assert!(matches!(
    env.scheduler.start().await.unwrap_err(),
    CoreError::AlreadyRunning
  ));

  env.scheduler.try_assign_now(&task).await.unwrap();
  let data = env.result_message("task_a", &worker_id, "completed", "");
  env.broker.publish("taskmesh.results", RESULT_ROUTING_KEY, &data).await.unwrap();
  tokio::time::sleep(Duration::from_millis(20)).await;

  let task = env.store.get_task("task_a").await.unwrap().unwrap();
  assert_eq!(task.status, TaskStatus::Completed);
  assert_eq!(env.status.get_status("task_a").await.unwrap(), "completed");
  env.scheduler.shutdown();
}

#[tokio::test]
async fn shutdown_stops_the_result_consumer() {
  let env = env();
  env.seed_account(1).await;
  let task = env.seed_task("task_a", 0).await;
  let worker_id = env.seed_worker("host-a", 4).await;
  env.scheduler.start().await.unwrap();
  env.scheduler.try_assign_now(&task).await.unwrap();

  env.scheduler.shutdown();
  let data = env.result_message("task_a", &worker_id, "completed", "");
  env.broker.publish("taskmesh.results", RESULT_ROUTING_KEY, &data).await.unwrap();
  tokio::time::sleep(Duration::from_millis(20)).await;

  let task = env.store.get_task("task_a").await.unwrap().unwrap();
  assert_eq!(task.status, TaskStatus::Assigned, "no deliveries applied after shutdown");
}

#[tokio::test]
async fn capacity_invariant_holds_under_concurrent_bursts() {
  let env = env();
  let worker_id = env.seed_worker("host-a", 5).await;

  let mut handles = Vec::new();
  for i in 0..40 {
    let store = env.store.clone();
    let id = worker_id.clone();
    handles.push(tokio::spawn(async move {
      if i % 2 == 0 {
        store.increment_load(&id).await.unwrap();
      } else {
        store.decrement_load(&id).await.unwrap();
      }
    }));
  }
  for handle in handles {
    handle.await.unwrap();
  }

  let worker = env.store.get_worker(&worker_id).await.unwrap().unwrap();
  assert!(worker.current_tasks >= 0 && worker.current_tasks <= worker.max_tasks);
}

#[tokio::test]
async fn priority_orders_the_scheduling_pass() {
  let env = env();
  env.seed_account(1).await;
  env.seed_task("task_low", 0).await;
  env.seed_task("task_high", 10).await;
  env.seed_worker("host-a", 1).await;

  env.scheduler.schedule_pending().await.unwrap();

  let high = env.store.get_task("task_high").await.unwrap().unwrap();
  let low = env.store.get_task("task_low").await.unwrap().unwrap();
  assert_eq!(high.status, TaskStatus::Assigned);
  assert_eq!(low.status, TaskStatus::Pending, "capacity of one goes to the higher priority");
}
