use serde::{Deserialize, Serialize};
use warp::Filter;

use super::{reject, PageQuery};
use crate::models::{Task, Worker};
use crate::registry::WorkerRegistry;
use crate::service::TaskService;

#[derive(Deserialize)]
pub struct RegisterWorker {
  pub hostname: String,
  pub ip: String,
  pub max_tasks: Option<i32>,
  #[serde(default)]
  pub tags: String,
  #[serde(default)]
  pub version: String,
}

#[derive(Serialize)]
pub struct RegisterResponse {
  pub worker_id: String,
}

#[derive(Serialize)]
pub struct WorkerPage {
  pub items: Vec<Worker>,
  pub total: i64,
}

#[derive(Serialize)]
pub struct WorkerTaskPage {
  pub items: Vec<Task>,
  pub total: i64,
}

fn with_registry(
  registry: WorkerRegistry,
) -> impl Filter<Extract = (WorkerRegistry,), Error = std::convert::Infallible> + Clone {
  warp::any().map(move || registry.clone())
}

fn with_service(
  service: TaskService,
) -> impl Filter<Extract = (TaskService,), Error = std::convert::Infallible> + Clone {
  warp::any().map(move || service.clone())
}

pub fn worker_routes(
  registry: WorkerRegistry,
  service: TaskService,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  let register = warp::path!("api" / "v1" / "workers" / "register")
    .and(warp::post())
    .and(warp::body::json())
    .and(with_registry(registry.clone()))
    .and_then(handle_register);

  let heartbeat = warp::path!("api" / "v1" / "workers" / String / "heartbeat")
    .and(warp::post())
    .and(with_registry(registry.clone()))
    .and_then(handle_heartbeat);

  let list = warp::path!("api" / "v1" / "workers")
    .and(warp::get())
    .and(warp::query::<PageQuery>())
    .and(with_registry(registry))
    .and_then(handle_list_workers);

  let worker_tasks = warp::path!("api" / "v1" / "workers" / String / "tasks")
    .and(warp::get())
    .and(warp::query::<PageQuery>())
    .and(with_service(service))
    .and_then(handle_worker_tasks);

  register.or(heartbeat).or(list).or(worker_tasks)
}

async fn handle_register(
  body: RegisterWorker,
  registry: WorkerRegistry,
) -> Result<impl warp::Reply, warp::Rejection> {
  let worker_id = registry
    .register(&body.hostname, &body.ip, body.max_tasks.unwrap_or(10), &body.tags, &body.version)
    .await
    .map_err(reject)?;
  Ok(warp::reply::json(&RegisterResponse { worker_id }))
}

async fn handle_heartbeat(
  worker_id: String,
  registry: WorkerRegistry,
) -> Result<impl warp::Reply, warp::Rejection> {
  registry.heartbeat(&worker_id).await.map_err(reject)?;
  Ok(warp::reply::json(&serde_json::json!({ "worker_id": worker_id, "status": "online" })))
}

async fn handle_list_workers(
  query: PageQuery,
  registry: WorkerRegistry,
) -> Result<impl warp::Reply, warp::Rejection> {
  let (page, page_size) = query.bounds();
  let (items, total) = registry.list_workers(page, page_size).await.map_err(reject)?;
  Ok(warp::reply::json(&WorkerPage { items, total }))
}

async fn handle_worker_tasks(
  worker_id: String,
  query: PageQuery,
  service: TaskService,
) -> Result<impl warp::Reply, warp::Rejection> {
  let (page, page_size) = query.bounds();
  let (items, total) =
    service.worker_tasks(&worker_id, page, page_size).await.map_err(reject)?;
  Ok(warp::reply::json(&WorkerTaskPage { items, total }))
}
