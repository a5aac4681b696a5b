use std::collections::HashSet;
use std::env;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use serde_json::json;
use tracing::{error, info, warn};

use taskmesh::broker::{Broker, Handler, LapinBroker, RESULT_ROUTING_KEY};
use taskmesh::database::setup_database;
use taskmesh::error::CoreError;
use taskmesh::models::{CancelMessage, TaskMessage, TaskResultMessage};
use taskmesh::registry::WorkerRegistry;
use taskmesh::store::{PgStore, TaskStore};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

struct WorkerContext {
  store: Arc<PgStore>,
  broker: Arc<LapinBroker>,
  results_exchange: String,
  canceled: Mutex<HashSet<String>>,
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt::init();
  let database_url = env::var("DATABASE_URL").expect("DATABASE_URL must be set");
  let rabbitmq_url = env::var("RABBITMQ_URL").expect("RABBITMQ_URL must be set");
  let hostname = env::var("WORKER_HOSTNAME").unwrap_or_else(|_| "localhost".into());
  let ip = env::var("WORKER_IP").unwrap_or_else(|_| "127.0.0.1".into());
  let max_tasks: i32 = env::var("WORKER_MAX_TASKS")
    .unwrap_or_else(|_| "10".into())
    .parse()
    .unwrap_or(10);
  let tags = env::var("WORKER_TAGS").unwrap_or_default();
  let tasks_exchange =
    env::var("TASKS_EXCHANGE").unwrap_or_else(|_| "taskmesh.tasks".into());
  let results_exchange =
    env::var("RESULTS_EXCHANGE").unwrap_or_else(|_| "taskmesh.results".into());

  let db_pool = setup_database(&database_url).await.expect("Failed to set up database");
  let store = Arc::new(PgStore::new(db_pool));
  let broker = Arc::new(
    LapinBroker::connect(&rabbitmq_url)
      .await
      .expect("Failed to create RabbitMQ channel"),
  );

  let registry = WorkerRegistry::new(store.clone(), Duration::from_secs(90));
  let worker_id = registry
    .register(&hostname, &ip, max_tasks, &tags, env!("CARGO_PKG_VERSION"))
    .await
    .expect("Worker registration failed");
  info!("Worker {} online ({}@{})", worker_id, hostname, ip);

  let heartbeat_registry = registry.clone();
  let heartbeat_id = worker_id.clone();
  let heartbeat_addr = (hostname.clone(), ip.clone(), tags.clone());
  tokio::spawn(async move {
    let (hostname, ip, tags) = heartbeat_addr;
    let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
    loop {
      ticker.tick().await;
      match heartbeat_registry.heartbeat(&heartbeat_id).await {
        Ok(()) => {}
        Err(CoreError::WorkerNotFound) => {
          // Registration row is gone; re-register under the same address.
          match heartbeat_registry
            .register(&hostname, &ip, max_tasks, &tags, env!("CARGO_PKG_VERSION"))
            .await
          {
            Ok(id) => info!("Worker re-registered as {id}"),
            Err(e) => error!("Re-registration failed: {e}"),
          }
        }
        Err(e) => error!("Heartbeat failed: {e}"),
      }
    }
  });

  let ctx = Arc::new(WorkerContext {
    store,
    broker: broker.clone(),
    results_exchange,
    canceled: Mutex::new(HashSet::new()),
  });

  let handler_ctx = ctx.clone();
  let handler: Handler = Arc::new(move |data: Vec<u8>| {
    let ctx = handler_ctx.clone();
    async move { handle_dispatch(&ctx, &data).await }.boxed()
  });
  let _dispatch = broker
    .consume(&tasks_exchange, "taskmesh.task_dispatch", "task.#", handler)
    .await
    .expect("Failed to start dispatch consumer");

  info!("Worker consuming task dispatches");
  futures::future::pending::<()>().await;
}

/// Both dispatches and cancel notices travel the tasks exchange; a cancel
/// notice carries no `task_type` and is routed by shape.
async fn handle_dispatch(ctx: &WorkerContext, data: &[u8]) -> anyhow::Result<()> {
  if let Ok(task) = serde_json::from_slice::<TaskMessage>(data) {
    if !task.task_type.is_empty() {
      return execute_task(ctx, task).await;
    }
  }
  if let Ok(cancel) = serde_json::from_slice::<CancelMessage>(data) {
    if !cancel.task_id.is_empty() {
      info!("Cancel notice for task {}", cancel.task_id);
      ctx.canceled.lock().unwrap().insert(cancel.task_id);
      return Ok(());
    }
  }
  warn!("Unrecognized dispatch message dropped");
  Ok(())
}

async fn execute_task(ctx: &WorkerContext, task: TaskMessage) -> anyhow::Result<()> {
  if ctx.canceled.lock().unwrap().remove(&task.task_id) {
    info!("Skipping canceled task {}", task.task_id);
    return Ok(());
  }
  // Skip tasks the scheduler or a user already closed.
  if let Some(current) = ctx.store.get_task(&task.task_id).await? {
    if current.status.is_terminal() {
      info!("Skipping task {} already {}", task.task_id, current.status.as_str());
      return Ok(());
    }
  }

  ctx.store.mark_processing(&task.task_id, Utc::now()).await?;
  info!("Processing task {} ({})", task.task_id, task.task_type);

  let outcome = run_task_type(&task).await;
  let (status, result, error) = match outcome {
    Ok(result) => ("completed", result, String::new()),
    Err(e) => ("failed", json!({}), e.to_string()),
  };

  let message = TaskResultMessage {
    task_id: task.task_id.clone(),
    account_id: task.account_id,
    worker_id: task.worker_id.clone(),
    status: status.to_string(),
    result,
    error,
    completed_at: Some(Utc::now()),
  };
  let payload = serde_json::to_vec(&message)?;
  ctx
    .broker
    .publish(&ctx.results_exchange, RESULT_ROUTING_KEY, &payload)
    .await?;
  info!("Task {} reported {}", task.task_id, status);
  Ok(())
}

/// Simulated task execution per type, standing in for the automation client.
async fn run_task_type(task: &TaskMessage) -> anyhow::Result<serde_json::Value> {
  match task.task_type.as_str() {
    "send_message" => {
      let target = task.params.get("target").and_then(|v| v.as_str()).unwrap_or("");
      if target.is_empty() {
        anyhow::bail!("missing target");
      }
      tokio::time::sleep(Duration::from_millis(200)).await;
      Ok(json!({ "delivered_to": target }))
    }
    "join_group" | "leave_group" => {
      let group = task.params.get("group").and_then(|v| v.as_str()).unwrap_or("");
      if group.is_empty() {
        anyhow::bail!("missing group");
      }
      tokio::time::sleep(Duration::from_millis(200)).await;
      Ok(json!({ "group": group }))
    }
    "check_account" => {
      tokio::time::sleep(Duration::from_millis(100)).await;
      Ok(json!({ "account_id": task.account_id, "alive": true }))
    }
    "import_account" => {
      tokio::time::sleep(Duration::from_millis(500)).await;
      Ok(json!({ "account_id": task.account_id, "imported": true }))
    }
    other => anyhow::bail!("unknown task type: {other}"),
  }
}
