//! Deployment and discovery collaborator.
//!
//! The orchestrator treats deployment as an external service: a directory of
//! worker hosts and the primitives to install a named pipeline on one, push
//! configuration to a service with a bounded timeout, and subscribe to a
//! container's error notifications. [`Deployer`] captures exactly that
//! interface; [`LocalDeployer`] is the in-process implementation that wires
//! a reader → stage → writer pipeline over [`LocalBus`](crate::bus::LocalBus)
//! topics, one forwarding task per stage.

use crate::bus::{BusError, MessageBus, Responder, Topic};
use crate::message::Message;
use crate::node::ApplicationDescriptor;
use crate::processor::EventProcessor;
use crate::reader::ReaderService;
use crate::sink::SinkFactory;
use crate::source::SourceFactory;
use crate::supervision::ErrorReport;
use crate::writer::WriterService;
use async_trait::async_trait;
use mime::Mime;
use std::collections::HashSet;
use std::fmt::{self, Display, Formatter};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

/// Identity of one deployed service: host (dpe), container and service name.
#[derive(Clone, Debug, Eq, Hash, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ServiceId {
  /// Worker host the service runs on.
  pub dpe: String,
  /// Container grouping services on that host.
  pub container: String,
  /// Service name within the container.
  pub name: String,
}

impl ServiceId {
  /// Creates a service identity.
  #[must_use]
  pub fn new(
    dpe: impl Into<String>,
    container: impl Into<String>,
    name: impl Into<String>,
  ) -> Self {
    Self {
      dpe: dpe.into(),
      container: container.into(),
      name: name.into(),
    }
  }

  /// The bus topic this service receives requests on.
  #[must_use]
  pub fn topic(&self) -> Topic {
    Topic::new(format!("{}/{}/{}", self.dpe, self.container, self.name))
  }
}

impl Display for ServiceId {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}/{}", self.dpe, self.container, self.name)
  }
}

/// Error type for deployment operations.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
  /// Transport failure talking to the deployment directory or a service.
  #[error(transparent)]
  Bus(#[from] BusError),
  /// The deployment itself failed.
  #[error("deployment failed: {0}")]
  Failed(String),
}

/// Directory of worker hosts and the pipeline installation primitives.
#[async_trait]
pub trait Deployer: Send + Sync {
  /// Returns true if every service identity of the application is present.
  async fn is_deployed(&self, app: &ApplicationDescriptor) -> Result<bool, DeployError>;

  /// Installs the application's pipeline on its node.
  async fn deploy(&self, app: &ApplicationDescriptor) -> Result<(), DeployError>;

  /// Sends a configuration request to one service and awaits its reply,
  /// bounded by `wait`. Timeout and transport errors surface as
  /// [`DeployError::Bus`]; the caller decides what a rejection reply means.
  async fn configure(
    &self,
    service: &ServiceId,
    request: Message,
    wait: Duration,
  ) -> Result<Message, DeployError>;

  /// Routes error notifications from the application's containers into the
  /// given channel, one [`ErrorReport`] per notification.
  async fn subscribe_errors(
    &self,
    app: &ApplicationDescriptor,
    reports: mpsc::Sender<ErrorReport>,
  ) -> Result<(), DeployError>;
}

/// Responder for the processing stage: acknowledges configuration pushes and
/// processes events on direct request.
struct StageService {
  processor: Arc<dyn EventProcessor>,
}

#[async_trait]
impl Responder for StageService {
  async fn respond(&self, request: Message) -> Message {
    if request.is_config() {
      return Message::text("").with_description("stage configured");
    }
    let id = request.communication_id();
    match self.processor.process(&request) {
      Ok(out) => out,
      Err(e) => Message::error(e.to_string(), 1).with_communication_id(id),
    }
  }
}

/// In-process deployer: "installing" a pipeline spawns one forwarding task
/// per stage, connected by bus topics.
///
/// - the reader task serves `next`/`next-rec` requests and routes event data
///   to the stage topic, errors and EOF tiers to the node's error topic;
/// - the stage task runs the processor and routes results to the writer
///   topic, failures to the error topic;
/// - the writer task persists events and routes replenish credits to the
///   node's credit topic.
pub struct LocalDeployer {
  bus: Arc<dyn MessageBus>,
  sources: Arc<dyn SourceFactory>,
  sinks: Arc<dyn SinkFactory>,
  processor: Arc<dyn EventProcessor>,
  data_type: Mime,
  deployed: Mutex<HashSet<ServiceId>>,
  tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LocalDeployer {
  /// Creates a deployer building pipelines from the given factories.
  #[must_use]
  pub fn new(
    bus: Arc<dyn MessageBus>,
    sources: Arc<dyn SourceFactory>,
    sinks: Arc<dyn SinkFactory>,
    processor: Arc<dyn EventProcessor>,
    data_type: Mime,
  ) -> Self {
    Self {
      bus,
      sources,
      sinks,
      processor,
      data_type,
      deployed: Mutex::new(HashSet::new()),
      tasks: Mutex::new(Vec::new()),
    }
  }

  /// Aborts every task spawned for deployed pipelines.
  pub fn shutdown(&self) {
    let mut tasks = self.tasks.lock().expect("deployer task list poisoned");
    for task in tasks.drain(..) {
      task.abort();
    }
  }

  fn remember(&self, task: JoinHandle<()>) {
    self
      .tasks
      .lock()
      .expect("deployer task list poisoned")
      .push(task);
  }

  fn contains_all(&self, app: &ApplicationDescriptor) -> bool {
    let deployed = self.deployed.lock().expect("deployed set poisoned");
    app.services().iter().all(|s| deployed.contains(s))
  }
}

#[async_trait]
impl Deployer for LocalDeployer {
  async fn is_deployed(&self, app: &ApplicationDescriptor) -> Result<bool, DeployError> {
    Ok(self.contains_all(app))
  }

  async fn deploy(&self, app: &ApplicationDescriptor) -> Result<(), DeployError> {
    if self.contains_all(app) {
      debug!(app = %app.name, "pipeline already deployed");
      return Ok(());
    }

    let reader = Arc::new(ReaderService::new(
      self.sources.clone(),
      self.data_type.clone(),
    ));
    let writer = Arc::new(WriterService::new(self.sinks.clone(), self.data_type.clone()));
    let stage = Arc::new(StageService {
      processor: self.processor.clone(),
    });

    let reader_topic = app.reader.topic();
    let stage_topic = app.stage.topic();
    let writer_topic = app.writer.topic();
    let errors = Topic::errors(&app.name);
    let credits = Topic::credits(&app.name);

    self.bus.register_responder(&reader_topic, reader.clone());
    self.bus.register_responder(&stage_topic, stage);
    self.bus.register_responder(&writer_topic, writer.clone());

    // Reader pump: windowed requests in, event data out to the stage.
    {
      let bus = self.bus.clone();
      let reader = reader.clone();
      let mut requests = ReceiverStream::new(self.bus.subscribe(&reader_topic).await?);
      let (stage_topic, errors) = (stage_topic.clone(), errors.clone());
      self.remember(tokio::spawn(async move {
        while let Some(request) = requests.next().await {
          let reply = reader.respond(request).await;
          let target = if reply.status().is_error() {
            &errors
          } else if !reply.payload().is_empty() {
            &stage_topic
          } else {
            continue;
          };
          let _ = bus.publish(target, reply).await;
        }
      }));
    }

    // Stage pump: events in, reconstructed events out to the writer.
    {
      let bus = self.bus.clone();
      let processor = self.processor.clone();
      let mut events = ReceiverStream::new(self.bus.subscribe(&stage_topic).await?);
      let (writer_topic, errors) = (writer_topic.clone(), errors.clone());
      self.remember(tokio::spawn(async move {
        while let Some(event) = events.next().await {
          let id = event.communication_id();
          match processor.process(&event) {
            Ok(out) => {
              let _ = bus.publish(&writer_topic, out).await;
            }
            Err(e) => {
              let failure = Message::error(e.to_string(), 1).with_communication_id(id);
              let _ = bus.publish(&errors, failure).await;
            }
          }
        }
      }));
    }

    // Writer pump: events in, replenish credits out to the node driver.
    {
      let bus = self.bus.clone();
      let writer = writer.clone();
      let mut events = ReceiverStream::new(self.bus.subscribe(&writer_topic).await?);
      let (credits, errors) = (credits.clone(), errors.clone());
      self.remember(tokio::spawn(async move {
        while let Some(event) = events.next().await {
          let reply = writer.respond(event).await;
          let target = if reply.status().is_error() {
            &errors
          } else {
            &credits
          };
          let _ = bus.publish(target, reply).await;
        }
      }));
    }

    let mut deployed = self.deployed.lock().expect("deployed set poisoned");
    for service in app.services() {
      deployed.insert(service.clone());
    }
    Ok(())
  }

  async fn configure(
    &self,
    service: &ServiceId,
    request: Message,
    wait: Duration,
  ) -> Result<Message, DeployError> {
    Ok(self.bus.request(&service.topic(), request, wait).await?)
  }

  async fn subscribe_errors(
    &self,
    app: &ApplicationDescriptor,
    reports: mpsc::Sender<ErrorReport>,
  ) -> Result<(), DeployError> {
    let node = app.name.clone();
    let mut notifications = ReceiverStream::new(self.bus.subscribe(&Topic::errors(&app.name)).await?);
    self.remember(tokio::spawn(async move {
      while let Some(message) = notifications.next().await {
        let report = ErrorReport::from_message(&node, &message);
        if reports.send(report).await.is_err() {
          break;
        }
      }
    }));
    Ok(())
  }
}
