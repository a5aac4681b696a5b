use thiserror::Error;

/// Domain error taxonomy for the scheduling core.
///
/// Not-found and state-conflict variants map to 4xx responses at the HTTP
/// layer; `NoAvailableWorker` is an expected outcome that defers the task to
/// the next scheduling tick and is never surfaced to submitters as a failure.
#[derive(Debug, Error)]
pub enum CoreError {
  #[error("task not found")]
  TaskNotFound,

  #[error("worker not found")]
  WorkerNotFound,

  #[error("account not found")]
  AccountNotFound,

  #[error("no available worker")]
  NoAvailableWorker,

  #[error("invalid task status")]
  InvalidTaskStatus,

  #[error("failed to publish message to queue: {0}")]
  QueuePublishFailed(String),

  #[error("storage error: {0}")]
  Storage(#[from] sqlx::Error),

  #[error("broker error: {0}")]
  Broker(#[from] lapin::Error),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("scheduler already running")]
  AlreadyRunning,
}

impl CoreError {
  /// True for errors a caller reports as a client fault rather than retries.
  pub fn is_client_error(&self) -> bool {
    matches!(
      self,
      CoreError::TaskNotFound
        | CoreError::WorkerNotFound
        | CoreError::AccountNotFound
        | CoreError::InvalidTaskStatus
    )
  }
}

pub type CoreResult<T> = Result<T, CoreError>;
