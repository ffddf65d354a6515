//! Topic-based publish/subscribe message bus.
//!
//! The bus is an external collaborator: this module defines the interface the
//! core protocol needs — publish/subscribe by topic plus request/reply with a
//! caller-specified timeout — and an in-process [`LocalBus`] reference
//! implementation used by the local deployment runtime and the test suite.
//!
//! Delivery threads must never be blocked for unbounded time; synchronous
//! exchanges go through [`MessageBus::request`] with a bounded timeout that
//! converts expiry into [`BusError::Timeout`].

use crate::message::Message;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Default buffer size for subscription channels.
const SUBSCRIPTION_BUFFER: usize = 64;

/// A bus topic. Service topics follow the `dpe/container/service` naming
/// convention; per-node control topics use the [`errors`](Topic::errors) and
/// [`credits`](Topic::credits) constructors.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Topic(String);

impl Topic {
  /// Creates a topic from its canonical string form.
  #[must_use]
  pub fn new(name: impl Into<String>) -> Self {
    Self(name.into())
  }

  /// Topic on which a node's containers publish error notifications.
  #[must_use]
  pub fn errors(node: &str) -> Self {
    Self(format!("{}/errors", node))
  }

  /// Topic on which a node's writer publishes replenish credits.
  #[must_use]
  pub fn credits(node: &str) -> Self {
    Self(format!("{}/credits", node))
  }

  /// Returns the canonical string form.
  #[must_use]
  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl Display for Topic {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Error type for bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
  /// A request/reply exchange did not complete within its timeout.
  #[error("request timed out after {0:?}")]
  Timeout(Duration),
  /// No responder is registered for the request topic.
  #[error("no responder registered for topic {0}")]
  NoResponder(String),
  /// The subscription or transport channel was closed.
  #[error("bus channel closed for topic {0}")]
  Closed(String),
}

/// Serves request/reply exchanges on one topic.
#[async_trait]
pub trait Responder: Send + Sync {
  /// Handles one request and produces the reply.
  async fn respond(&self, request: Message) -> Message;
}

/// The publish/subscribe interface the protocol core is written against.
#[async_trait]
pub trait MessageBus: Send + Sync {
  /// Publishes a message to every subscriber of the topic.
  async fn publish(&self, topic: &Topic, message: Message) -> Result<(), BusError>;

  /// Subscribes to a topic, returning the receiving end of a buffered channel.
  async fn subscribe(&self, topic: &Topic) -> Result<mpsc::Receiver<Message>, BusError>;

  /// Sends a request to the topic's responder and awaits the reply, bounded
  /// by `wait`. Expiry surfaces as [`BusError::Timeout`].
  async fn request(
    &self,
    topic: &Topic,
    message: Message,
    wait: Duration,
  ) -> Result<Message, BusError>;

  /// Registers the responder serving request/reply exchanges on a topic.
  /// A later registration for the same topic replaces the earlier one.
  fn register_responder(&self, topic: &Topic, responder: Arc<dyn Responder>);
}

/// In-process reference bus backed by tokio channels.
///
/// Publishing fans out to every live subscriber; subscribers that dropped
/// their receiver are pruned on the next publish to that topic.
pub struct LocalBus {
  subscribers: RwLock<HashMap<Topic, Vec<mpsc::Sender<Message>>>>,
  responders: RwLock<HashMap<Topic, Arc<dyn Responder>>>,
  capacity: usize,
}

impl LocalBus {
  /// Creates a bus with the default subscription buffer size.
  #[must_use]
  pub fn new() -> Self {
    Self::with_capacity(SUBSCRIPTION_BUFFER)
  }

  /// Creates a bus with the given per-subscription buffer size.
  #[must_use]
  pub fn with_capacity(capacity: usize) -> Self {
    Self {
      subscribers: RwLock::new(HashMap::new()),
      responders: RwLock::new(HashMap::new()),
      capacity,
    }
  }

  fn live_senders(&self, topic: &Topic) -> Vec<mpsc::Sender<Message>> {
    let mut map = self.subscribers.write().expect("subscriber map poisoned");
    if let Some(senders) = map.get_mut(topic) {
      senders.retain(|tx| !tx.is_closed());
      senders.clone()
    } else {
      Vec::new()
    }
  }
}

impl Default for LocalBus {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait]
impl MessageBus for LocalBus {
  async fn publish(&self, topic: &Topic, message: Message) -> Result<(), BusError> {
    let senders = self.live_senders(topic);
    for tx in senders {
      // A receiver dropped between the prune and the send is not an error;
      // it will be pruned on the next publish.
      let _ = tx.send(message.clone()).await;
    }
    Ok(())
  }

  async fn subscribe(&self, topic: &Topic) -> Result<mpsc::Receiver<Message>, BusError> {
    let (tx, rx) = mpsc::channel(self.capacity);
    let mut map = self.subscribers.write().expect("subscriber map poisoned");
    map.entry(topic.clone()).or_default().push(tx);
    Ok(rx)
  }

  async fn request(
    &self,
    topic: &Topic,
    message: Message,
    wait: Duration,
  ) -> Result<Message, BusError> {
    let responder = {
      let map = self.responders.read().expect("responder map poisoned");
      map
        .get(topic)
        .cloned()
        .ok_or_else(|| BusError::NoResponder(topic.to_string()))?
    };
    timeout(wait, responder.respond(message))
      .await
      .map_err(|_| BusError::Timeout(wait))
  }

  fn register_responder(&self, topic: &Topic, responder: Arc<dyn Responder>) {
    let mut map = self.responders.write().expect("responder map poisoned");
    map.insert(topic.clone(), responder);
  }
}
