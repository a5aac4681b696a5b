use std::env;

#[derive(Debug, Clone)]
pub struct Config {
  pub database_url: String,
  pub rabbitmq_url: String,
  pub server_port: u16,
  pub scheduler_tick_secs: u64,
  pub worker_stale_secs: u64,
  pub status_ttl_secs: u64,
  pub tasks_exchange: String,
  pub results_exchange: String,
  pub results_queue: String,
}

fn env_u64(key: &str, default: u64) -> u64 {
  env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_or(key: &str, default: &str) -> String {
  env::var(key).unwrap_or_else(|_| default.into())
}

impl Config {
  pub fn from_env() -> Self {
    Self {
      database_url: env::var("DATABASE_URL").unwrap(),
      rabbitmq_url: env::var("RABBITMQ_URL").unwrap(),
      server_port: env::var("SERVER_PORT")
        .unwrap_or_else(|_| "8080".into())
        .parse()
        .unwrap_or(8080),
      scheduler_tick_secs: env_u64("SCHEDULER_TICK_SECS", 15),
      worker_stale_secs: env_u64("WORKER_STALE_SECS", 90),
      status_ttl_secs: env_u64("STATUS_TTL_SECS", 600),
      tasks_exchange: env_or("TASKS_EXCHANGE", "taskmesh.tasks"),
      results_exchange: env_or("RESULTS_EXCHANGE", "taskmesh.results"),
      results_queue: env_or("RESULTS_QUEUE", "taskmesh.task_results"),
    }
  }
}
