use serde::{Deserialize, Serialize};
use warp::Filter;

use super::{reject, PageQuery};
use crate::models::Task;
use crate::service::TaskService;

#[derive(Deserialize)]
pub struct NewTask {
  pub task_type: String,
  pub account_id: i64,
  #[serde(default)]
  pub params: serde_json::Value,
  pub priority: Option<i32>,
}

#[derive(Serialize)]
pub struct TaskPage {
  pub items: Vec<Task>,
  pub total: i64,
}

fn with_service(
  service: TaskService,
) -> impl Filter<Extract = (TaskService,), Error = std::convert::Infallible> + Clone {
  warp::any().map(move || service.clone())
}

pub fn task_routes(
  service: TaskService,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  let create = warp::path!("api" / "v1" / "tasks")
    .and(warp::post())
    .and(warp::body::json())
    .and(with_service(service.clone()))
    .and_then(handle_create_task);

  let list = warp::path!("api" / "v1" / "tasks")
    .and(warp::get())
    .and(warp::query::<PageQuery>())
    .and(with_service(service.clone()))
    .and_then(handle_list_tasks);

  let get = warp::path!("api" / "v1" / "tasks" / String)
    .and(warp::get())
    .and(with_service(service.clone()))
    .and_then(handle_get_task);

  let cancel = warp::path!("api" / "v1" / "tasks" / String / "cancel")
    .and(warp::post())
    .and(with_service(service))
    .and_then(handle_cancel_task);

  create.or(list).or(get).or(cancel)
}

async fn handle_create_task(
  new_task: NewTask,
  service: TaskService,
) -> Result<impl warp::Reply, warp::Rejection> {
  let task = service
    .create_task(
      &new_task.task_type,
      new_task.account_id,
      new_task.params,
      new_task.priority.unwrap_or(0),
    )
    .await
    .map_err(reject)?;
  Ok(warp::reply::json(&task))
}

async fn handle_list_tasks(
  query: PageQuery,
  service: TaskService,
) -> Result<impl warp::Reply, warp::Rejection> {
  let (page, page_size) = query.bounds();
  let (items, total) = service.list_tasks(page, page_size).await.map_err(reject)?;
  Ok(warp::reply::json(&TaskPage { items, total }))
}

async fn handle_get_task(
  task_id: String,
  service: TaskService,
) -> Result<impl warp::Reply, warp::Rejection> {
  let task = service.get_task(&task_id).await.map_err(reject)?;
  Ok(warp::reply::json(&task))
}

async fn handle_cancel_task(
  task_id: String,
  service: TaskService,
) -> Result<impl warp::Reply, warp::Rejection> {
  service.cancel_task(&task_id).await.map_err(reject)?;
  Ok(warp::reply::json(&serde_json::json!({ "task_id": task_id, "status": "canceled" })))
}
