use serde::{Serialize, Deserialize};
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
  Pending,
  Assigned,
  Processing,
  Completed,
  Failed,
  Canceled,
}

impl TaskStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      TaskStatus::Pending => "pending",
      TaskStatus::Assigned => "assigned",
      TaskStatus::Processing => "processing",
      TaskStatus::Completed => "completed",
      TaskStatus::Failed => "failed",
      TaskStatus::Canceled => "canceled",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "pending" => Some(TaskStatus::Pending),
      "assigned" => Some(TaskStatus::Assigned),
      "processing" => Some(TaskStatus::Processing),
      "completed" => Some(TaskStatus::Completed),
      "failed" => Some(TaskStatus::Failed),
      "canceled" => Some(TaskStatus::Canceled),
      _ => None,
    }
  }

  pub fn is_terminal(&self) -> bool {
    matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Canceled)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
  Online,
  Offline,
  Busy,
}

impl WorkerStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      WorkerStatus::Online => "online",
      WorkerStatus::Offline => "offline",
      WorkerStatus::Busy => "busy",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "online" => Some(WorkerStatus::Online),
      "offline" => Some(WorkerStatus::Offline),
      "busy" => Some(WorkerStatus::Busy),
      _ => None,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
  Pending,
  Accepted,
  Rejected,
  Completed,
  Failed,
}

impl AssignmentStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      AssignmentStatus::Pending => "pending",
      AssignmentStatus::Accepted => "accepted",
      AssignmentStatus::Rejected => "rejected",
      AssignmentStatus::Completed => "completed",
      AssignmentStatus::Failed => "failed",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "pending" => Some(AssignmentStatus::Pending),
      "accepted" => Some(AssignmentStatus::Accepted),
      "rejected" => Some(AssignmentStatus::Rejected),
      "completed" => Some(AssignmentStatus::Completed),
      "failed" => Some(AssignmentStatus::Failed),
      _ => None,
    }
  }

  pub fn is_terminal(&self) -> bool {
    matches!(self, AssignmentStatus::Rejected | AssignmentStatus::Completed | AssignmentStatus::Failed)
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
  pub task_id: String,
  pub task_type: String,
  pub account_id: i64,
  pub params: serde_json::Value,
  pub status: TaskStatus,
  pub priority: i32,
  pub error_message: String,
  pub timeout_sec: i32,
  pub started_at: Option<DateTime<Utc>>,
  pub completed_at: Option<DateTime<Utc>>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
  pub worker_id: String,
  pub hostname: String,
  pub ip: String,
  pub status: WorkerStatus,
  pub last_heartbeat: DateTime<Utc>,
  pub max_tasks: i32,
  pub current_tasks: i32,
  pub tags: String,
  pub version: String,
  pub created_at: DateTime<Utc>,
}

impl Worker {
  /// Tag filter over the comma-separated tag list.
  pub fn has_tag(&self, tag: &str) -> bool {
    self.tags.split(',').any(|t| t.trim() == tag)
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAssignment {
  pub id: i64,
  pub task_id: String,
  pub worker_id: String,
  pub status: AssignmentStatus,
  pub assigned_at: DateTime<Utc>,
  pub accepted_at: Option<DateTime<Utc>>,
  pub completed_at: Option<DateTime<Utc>>,
  pub rejection_reason: String,
  pub priority: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
  pub task_id: String,
  pub worker_id: String,
  pub status: TaskStatus,
  pub result: serde_json::Value,
  pub error_message: String,
  pub started_at: DateTime<Utc>,
  pub completed_at: DateTime<Utc>,
  pub execution_time_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
  pub id: i64,
  pub phone: String,
  pub username: String,
  pub status: String,
}

/// Outbound dispatch message, routing key `task.<task_type>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMessage {
  pub task_id: String,
  pub task_type: String,
  pub account_id: i64,
  pub params: serde_json::Value,
  pub worker_id: String,
  pub timeout: i32,
  pub created_at: DateTime<Utc>,
}

/// Inbound result message, routing key `task.result`.
/// `task_id` and `status` are required; everything else is optional so a
/// sloppy worker payload decodes far enough to be rejected with a log line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResultMessage {
  #[serde(default)]
  pub task_id: String,
  #[serde(default)]
  pub account_id: i64,
  #[serde(default)]
  pub worker_id: String,
  #[serde(default)]
  pub status: String,
  #[serde(default)]
  pub result: serde_json::Value,
  #[serde(default)]
  pub error: String,
  #[serde(default)]
  pub completed_at: Option<DateTime<Utc>>,
}

/// Best-effort cancellation notice, routing key `task.cancel`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelMessage {
  pub task_id: String,
  pub worker_id: String,
}
