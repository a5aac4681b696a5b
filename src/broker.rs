//! Topic-routed durable messaging between the scheduler and worker processes.
//!
//! [`LapinBroker`] is the RabbitMQ gateway; [`MemoryBroker`] routes in-process
//! with the same binding semantics and a publish log for tests.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::StreamExt;
use lapin::options::{
  BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
  ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use serde::Serialize;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::Retry;
use tracing::{error, info};

use crate::error::{CoreError, CoreResult};

static MAX_RETRIES: usize = 5;
static DELAY: u64 = 100;

/// Dispatch routing key for a task type.
pub fn task_routing_key(task_type: &str) -> String {
  format!("task.{task_type}")
}

pub const RESULT_ROUTING_KEY: &str = "task.result";
pub const CANCEL_ROUTING_KEY: &str = "task.cancel";

/// Message handler invoked per delivery. `Ok` acknowledges the message,
/// `Err` negatively acknowledges it back onto the queue.
pub type Handler = Arc<dyn Fn(Vec<u8>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Handle for a running consumer. Calling [`ConsumerGuard::cancel`] stops
/// delivery to the handler; undelivered messages stay on the queue.
pub struct ConsumerGuard {
  cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl ConsumerGuard {
  pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
    Self { cancel: Some(Box::new(cancel)) }
  }

  pub fn cancel(mut self) {
    if let Some(cancel) = self.cancel.take() {
      cancel();
    }
  }
}

#[async_trait]
pub trait Broker: Send + Sync {
  /// Declares the durable topic exchange and publishes a persistent message.
  async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> CoreResult<()>;

  /// Declares and binds `queue` to `exchange` under `binding_key`, then feeds
  /// every delivery through `handler` with manual acknowledgment. The
  /// returned guard stops the consumer.
  async fn consume(
    &self,
    exchange: &str,
    queue: &str,
    binding_key: &str,
    handler: Handler,
  ) -> CoreResult<ConsumerGuard>;
}

/// Serializes `body` as JSON before publishing. Byte payloads go straight
/// through [`Broker::publish`].
pub async fn publish_json<T: Serialize>(
  broker: &dyn Broker,
  exchange: &str,
  routing_key: &str,
  body: &T,
) -> CoreResult<()> {
  let payload = serde_json::to_vec(body)?;
  broker.publish(exchange, routing_key, &payload).await
}

pub async fn create_rabbit_channel(rabbitmq_url: &str) -> CoreResult<Channel> {
  let conn = Retry::spawn(ExponentialBackoff::from_millis(DELAY).take(MAX_RETRIES), || {
    Connection::connect(rabbitmq_url, ConnectionProperties::default())
  })
  .await?;
  let channel = conn.create_channel().await?;
  info!("RabbitMQ channel created");
  Ok(channel)
}

pub struct LapinBroker {
  channel: Channel,
}

impl LapinBroker {
  pub fn new(channel: Channel) -> Self {
    Self { channel }
  }

  pub async fn connect(rabbitmq_url: &str) -> CoreResult<Self> {
    Ok(Self::new(create_rabbit_channel(rabbitmq_url).await?))
  }

  async fn declare_exchange(&self, exchange: &str) -> CoreResult<()> {
    self
      .channel
      .exchange_declare(
        exchange,
        ExchangeKind::Topic,
        ExchangeDeclareOptions { durable: true, ..Default::default() },
        FieldTable::default(),
      )
      .await?;
    Ok(())
  }
}

#[async_trait]
impl Broker for LapinBroker {
  async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> CoreResult<()> {
    self.declare_exchange(exchange).await?;
    self
      .channel
      .basic_publish(
        exchange,
        routing_key,
        BasicPublishOptions::default(),
        payload,
        BasicProperties::default()
          .with_content_type("application/json".into())
          .with_delivery_mode(2),
      )
      .await
      .map_err(|e| CoreError::QueuePublishFailed(e.to_string()))?;
    Ok(())
  }

  async fn consume(
    &self,
    exchange: &str,
    queue: &str,
    binding_key: &str,
    handler: Handler,
  ) -> CoreResult<ConsumerGuard> {
    self.declare_exchange(exchange).await?;
    self
      .channel
      .queue_declare(
        queue,
        QueueDeclareOptions { durable: true, ..Default::default() },
        FieldTable::default(),
      )
      .await?;
    self
      .channel
      .queue_bind(queue, exchange, binding_key, QueueBindOptions::default(), FieldTable::default())
      .await?;

    let mut consumer = self
      .channel
      .basic_consume(queue, "", BasicConsumeOptions::default(), FieldTable::default())
      .await?;

    let queue_name = queue.to_string();
    let handle = tokio::spawn(async move {
      while let Some(delivery) = consumer.next().await {
        match delivery {
          Ok(delivery) => match handler(delivery.data.clone()).await {
            Ok(()) => {
              if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                error!("Failed to ack message on {}: {:?}", queue_name, e);
              }
            }
            Err(e) => {
              error!("Handler failed on {}, requeueing: {:?}", queue_name, e);
              let nack = BasicNackOptions { requeue: true, ..Default::default() };
              if let Err(e) = delivery.nack(nack).await {
                error!("Failed to nack message on {}: {:?}", queue_name, e);
              }
            }
          },
          Err(e) => error!("Consumer error on {}: {:?}", queue_name, e),
        }
      }
    });
    Ok(ConsumerGuard::new(move || handle.abort()))
  }
}

/// One topic wildcard segment match step: `*` matches exactly one word,
/// `#` matches zero or more.
fn topic_matches(pattern: &[&str], key: &[&str]) -> bool {
  match (pattern.first(), key.first()) {
    (None, None) => true,
    (Some(&"#"), _) => {
      topic_matches(&pattern[1..], key) || (!key.is_empty() && topic_matches(pattern, &key[1..]))
    }
    (Some(&"*"), Some(_)) => topic_matches(&pattern[1..], &key[1..]),
    (Some(p), Some(k)) if p == k => topic_matches(&pattern[1..], &key[1..]),
    _ => false,
  }
}

pub fn binding_matches(binding_key: &str, routing_key: &str) -> bool {
  let pattern: Vec<&str> = binding_key.split('.').collect();
  let key: Vec<&str> = routing_key.split('.').collect();
  topic_matches(&pattern, &key)
}

#[derive(Debug, Clone)]
pub struct PublishedMessage {
  pub exchange: String,
  pub routing_key: String,
  pub payload: Vec<u8>,
}

struct MemoryBinding {
  id: u64,
  exchange: String,
  binding_key: String,
  handler: Handler,
}

/// In-process broker for tests: deliveries are routed synchronously to every
/// matching binding, and every publish is recorded.
#[derive(Default)]
pub struct MemoryBroker {
  bindings: Arc<Mutex<Vec<MemoryBinding>>>,
  published: Mutex<Vec<PublishedMessage>>,
  nacked: AtomicUsize,
  fail_publish: AtomicBool,
  next_binding_id: AtomicU64,
}

impl MemoryBroker {
  pub fn new() -> Self {
    Self::default()
  }

  /// Makes every subsequent publish fail, to exercise the
  /// `QueuePublishFailed` path.
  pub fn fail_next_publishes(&self, fail: bool) {
    self.fail_publish.store(fail, Ordering::SeqCst);
  }

  pub fn published(&self) -> Vec<PublishedMessage> {
    self.published.lock().unwrap().clone()
  }

  pub fn published_to(&self, routing_key: &str) -> Vec<PublishedMessage> {
    self
      .published
      .lock()
      .unwrap()
      .iter()
      .filter(|m| m.routing_key == routing_key)
      .cloned()
      .collect()
  }

  pub fn nack_count(&self) -> usize {
    self.nacked.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl Broker for MemoryBroker {
  async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> CoreResult<()> {
    if self.fail_publish.load(Ordering::SeqCst) {
      return Err(CoreError::QueuePublishFailed("memory broker rejected publish".into()));
    }
    self.published.lock().unwrap().push(PublishedMessage {
      exchange: exchange.to_string(),
      routing_key: routing_key.to_string(),
      payload: payload.to_vec(),
    });

    let handlers: Vec<Handler> = {
      let bindings = self.bindings.lock().unwrap();
      bindings
        .iter()
        .filter(|b| b.exchange == exchange && binding_matches(&b.binding_key, routing_key))
        .map(|b| b.handler.clone())
        .collect()
    };
    for handler in handlers {
      if handler(payload.to_vec()).await.is_err() {
        self.nacked.fetch_add(1, Ordering::SeqCst);
      }
    }
    Ok(())
  }

  async fn consume(
    &self,
    exchange: &str,
    _queue: &str,
    binding_key: &str,
    handler: Handler,
  ) -> CoreResult<ConsumerGuard> {
    let id = self.next_binding_id.fetch_add(1, Ordering::SeqCst);
    self.bindings.lock().unwrap().push(MemoryBinding {
      id,
      exchange: exchange.to_string(),
      binding_key: binding_key.to_string(),
      handler,
    });
    let bindings = self.bindings.clone();
    Ok(ConsumerGuard::new(move || {
      bindings.lock().unwrap().retain(|b| b.id != id);
    }))
  }
}
