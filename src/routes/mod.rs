use serde::{Deserialize, Serialize};
use warp::http::StatusCode;
use warp::Filter;

pub mod tasks;
pub mod workers;

use crate::error::CoreError;
use crate::registry::WorkerRegistry;
use crate::service::TaskService;

pub fn routes(
  service: TaskService,
  registry: WorkerRegistry,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  tasks::task_routes(service.clone())
    .or(workers::worker_routes(registry, service))
    .recover(handle_rejection)
}

#[derive(Debug)]
pub struct ApiError {
  pub error: CoreError,
}

impl warp::reject::Reject for ApiError {}

pub fn reject(error: CoreError) -> warp::Rejection {
  warp::reject::custom(ApiError { error })
}

#[derive(Deserialize)]
pub struct PageQuery {
  pub page: Option<u32>,
  pub page_size: Option<u32>,
}

impl PageQuery {
  pub fn bounds(&self) -> (u32, u32) {
    (self.page.unwrap_or(1), self.page_size.unwrap_or(20))
  }
}

#[derive(Serialize)]
struct ErrorBody {
  error: String,
}

async fn handle_rejection(err: warp::Rejection) -> Result<impl warp::Reply, warp::Rejection> {
  if let Some(api_error) = err.find::<ApiError>() {
    let status = match api_error.error {
      CoreError::TaskNotFound | CoreError::WorkerNotFound | CoreError::AccountNotFound => {
        StatusCode::NOT_FOUND
      }
      CoreError::InvalidTaskStatus => StatusCode::CONFLICT,
      _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let body = warp::reply::json(&ErrorBody { error: api_error.error.to_string() });
    return Ok(warp::reply::with_status(body, status));
  }
  Err(err)
}
