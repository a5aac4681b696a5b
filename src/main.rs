use std::sync::Arc;
use std::time::Duration;

use taskmesh::broker::LapinBroker;
use taskmesh::config::Config;
use taskmesh::database::setup_database;
use taskmesh::registry::WorkerRegistry;
use taskmesh::routes::routes;
use taskmesh::scheduler::{SchedulerConfig, TaskScheduler};
use taskmesh::service::TaskService;
use taskmesh::status_store::MemoryStatusStore;
use taskmesh::store::PgStore;

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt::init();
  let config = Config::from_env();

  let db_pool = setup_database(&config.database_url)
    .await
    .expect("Failed to set up database");
  let broker = Arc::new(
    LapinBroker::connect(&config.rabbitmq_url)
      .await
      .expect("Failed to create RabbitMQ channel"),
  );

  let store = Arc::new(PgStore::new(db_pool));
  let registry =
    WorkerRegistry::new(store.clone(), Duration::from_secs(config.worker_stale_secs));
  let status = MemoryStatusStore::new(Duration::from_secs(config.status_ttl_secs));

  let scheduler = TaskScheduler::new(
    store.clone(),
    registry.clone(),
    broker,
    status.clone(),
    SchedulerConfig {
      tick_interval: Duration::from_secs(config.scheduler_tick_secs),
      tasks_exchange: config.tasks_exchange.clone(),
      results_exchange: config.results_exchange.clone(),
      results_queue: config.results_queue.clone(),
    },
  );
  scheduler.start().await.expect("Failed to start task scheduler");

  let service = TaskService::new(store, scheduler.clone(), status);
  let api = routes(service, registry);

  warp::serve(api).run(([0, 0, 0, 0], config.server_port)).await;

  scheduler.shutdown();
}
