//! TTL-bounded mirror of task status for push-style consumers.
//!
//! The relational store stays authoritative; this cache exists so dashboards
//! and workers can watch for changes instead of polling. Every save re-grants
//! the lease, so an untouched key simply expires.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::CoreResult;

pub type StatusCallback = Box<dyn Fn(String) + Send + Sync>;

/// Tears the watch down when dropped.
pub struct WatchGuard {
  handle: JoinHandle<()>,
}

impl Drop for WatchGuard {
  fn drop(&mut self) {
    self.handle.abort();
  }
}

#[async_trait]
pub trait StatusStore: Send + Sync {
  /// Writes `status` under the task key and refreshes its lease TTL.
  async fn save_status(&self, task_id: &str, status: &str) -> CoreResult<()>;

  /// Point read. Empty when the key was never set or its lease expired; the
  /// two are indistinguishable by design.
  async fn get_status(&self, task_id: &str) -> CoreResult<String>;

  /// Subscribes `callback` to every subsequent change of the key. The
  /// callback runs on a dedicated notification task, never on the caller's
  /// stack.
  async fn watch(&self, task_id: &str, callback: StatusCallback) -> CoreResult<WatchGuard>;
}

struct Entry {
  status: String,
  expires_at: Instant,
}

/// In-process lease implementation. An etcd or redis backend slots in behind
/// the same trait without touching the scheduler.
pub struct MemoryStatusStore {
  prefix: String,
  ttl: Duration,
  entries: Mutex<HashMap<String, Entry>>,
  changes: broadcast::Sender<(String, String)>,
}

impl MemoryStatusStore {
  pub fn new(ttl: Duration) -> Arc<Self> {
    let (changes, _) = broadcast::channel(256);
    Arc::new(Self {
      prefix: "/taskmesh/tasks/".to_string(),
      ttl,
      entries: Mutex::new(HashMap::new()),
      changes,
    })
  }

  fn key(&self, task_id: &str) -> String {
    format!("{}{}", self.prefix, task_id)
  }

  #[cfg(test)]
  fn entry_count(&self) -> usize {
    self.entries.lock().unwrap().len()
  }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
  async fn save_status(&self, task_id: &str, status: &str) -> CoreResult<()> {
    let key = self.key(task_id);
    {
      let mut entries = self.entries.lock().unwrap();
      // Writes double as the eviction pass; keys nobody reads back would
      // otherwise outlive their lease in the map.
      let now = Instant::now();
      entries.retain(|_, entry| entry.expires_at > now);
      entries.insert(
        key.clone(),
        Entry { status: status.to_string(), expires_at: now + self.ttl },
      );
    }
    // No receivers is fine; nobody is watching.
    let _ = self.changes.send((key, status.to_string()));
    Ok(())
  }

  async fn get_status(&self, task_id: &str) -> CoreResult<String> {
    let key = self.key(task_id);
    let mut entries = self.entries.lock().unwrap();
    match entries.get(&key) {
      Some(entry) if entry.expires_at > Instant::now() => Ok(entry.status.clone()),
      Some(_) => {
        entries.remove(&key);
        Ok(String::new())
      }
      None => Ok(String::new()),
    }
  }

  async fn watch(&self, task_id: &str, callback: StatusCallback) -> CoreResult<WatchGuard> {
    let key = self.key(task_id);
    let mut rx = self.changes.subscribe();
    let handle = tokio::spawn(async move {
      loop {
        match rx.recv().await {
          Ok((changed_key, status)) if changed_key == key => callback(status),
          Ok(_) => {}
          Err(broadcast::error::RecvError::Lagged(_)) => {}
          Err(broadcast::error::RecvError::Closed) => break,
        }
      }
    });
    Ok(WatchGuard { handle })
  }
}
