//! Test suite for the worker node driver.
//!
//! Covers window sizing, the one-shot window start time, configuration
//! pushes with their failure semantics, the file queue, and node identity.

use crate::bus::{BusError, MessageBus, Responder, Topic};
use crate::deploy::{DeployError, Deployer, ServiceId};
use crate::message::{Message, REQUEST_NEXT};
use crate::node::{ApplicationDescriptor, FileAssignment, NodeError, StreamProcessingNode};
use crate::supervision::ErrorReport;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

// ============================================================================
// Recording collaborators
// ============================================================================

/// Bus that records every publish and keeps subscriptions open.
#[derive(Default)]
pub(crate) struct RecordingBus {
  pub(crate) published: Mutex<Vec<(Topic, Message)>>,
  subscriptions: Mutex<Vec<mpsc::Sender<Message>>>,
}

impl RecordingBus {
  pub(crate) fn published_to(&self, topic: &Topic) -> Vec<Message> {
    self
      .published
      .lock()
      .unwrap()
      .iter()
      .filter(|(t, _)| t == topic)
      .map(|(_, m)| m.clone())
      .collect()
  }
}

#[async_trait]
impl MessageBus for RecordingBus {
  async fn publish(&self, topic: &Topic, message: Message) -> Result<(), BusError> {
    self
      .published
      .lock()
      .unwrap()
      .push((topic.clone(), message));
    Ok(())
  }

  async fn subscribe(&self, _topic: &Topic) -> Result<mpsc::Receiver<Message>, BusError> {
    let (tx, rx) = mpsc::channel(16);
    self.subscriptions.lock().unwrap().push(tx);
    Ok(rx)
  }

  async fn request(
    &self,
    topic: &Topic,
    _message: Message,
    _wait: Duration,
  ) -> Result<Message, BusError> {
    Err(BusError::NoResponder(topic.to_string()))
  }

  fn register_responder(&self, _topic: &Topic, _responder: Arc<dyn Responder>) {}
}

/// Deployer that records configure pushes and can be told to reject them.
#[derive(Default)]
pub(crate) struct MockDeployer {
  pub(crate) deployed: AtomicBool,
  pub(crate) deploy_calls: AtomicUsize,
  pub(crate) configures: Mutex<Vec<(ServiceId, Message)>>,
  pub(crate) reject_configures: AtomicBool,
  pub(crate) error_tx: Mutex<Option<mpsc::Sender<ErrorReport>>>,
}

#[async_trait]
impl Deployer for MockDeployer {
  async fn is_deployed(&self, _app: &ApplicationDescriptor) -> Result<bool, DeployError> {
    Ok(self.deployed.load(Ordering::Acquire))
  }

  async fn deploy(&self, _app: &ApplicationDescriptor) -> Result<(), DeployError> {
    self.deploy_calls.fetch_add(1, Ordering::AcqRel);
    self.deployed.store(true, Ordering::Release);
    Ok(())
  }

  async fn configure(
    &self,
    service: &ServiceId,
    request: Message,
    _wait: Duration,
  ) -> Result<Message, DeployError> {
    self
      .configures
      .lock()
      .unwrap()
      .push((service.clone(), request));
    if self.reject_configures.load(Ordering::Acquire) {
      Ok(Message::error("rejected", 1))
    } else {
      Ok(Message::text("").with_description("configured"))
    }
  }

  async fn subscribe_errors(
    &self,
    _app: &ApplicationDescriptor,
    reports: mpsc::Sender<ErrorReport>,
  ) -> Result<(), DeployError> {
    *self.error_tx.lock().unwrap() = Some(reports);
    Ok(())
  }
}

pub(crate) fn test_app(name: &str, max_cores: u32) -> ApplicationDescriptor {
  ApplicationDescriptor {
    name: name.to_string(),
    reader: ServiceId::new(name, "pipeline", "reader"),
    stage: ServiceId::new(name, "pipeline", "stage"),
    writer: ServiceId::new(name, "pipeline", "writer"),
    monitoring: vec![ServiceId::new(name, "pipeline", "monitor")],
    max_cores,
    front_end: false,
  }
}

fn test_node(
  name: &str,
  max_cores: u32,
) -> (
  Arc<StreamProcessingNode>,
  Arc<RecordingBus>,
  Arc<MockDeployer>,
) {
  let bus = Arc::new(RecordingBus::default());
  let deployer = Arc::new(MockDeployer::default());
  let node = Arc::new(StreamProcessingNode::new(
    test_app(name, max_cores),
    bus.clone(),
    deployer.clone(),
  ));
  (node, bus, deployer)
}

// ============================================================================
// Window sizing and requests
// ============================================================================

#[tokio::test]
async fn send_events_opens_min_of_app_and_requested_cores() {
  let (node, bus, _) = test_node("worker-1", 2);
  let opened = node.send_events(4).await.unwrap();
  assert_eq!(opened, 2);
  assert_eq!(node.request_cores(), 2);

  let requests = bus.published_to(&node.app().reader.topic());
  assert_eq!(requests.len(), 2);
  let ids: Vec<i64> = requests.iter().map(|m| m.communication_id()).collect();
  assert_eq!(ids, vec![1, 2]);
  for request in &requests {
    assert!(request.is_request(REQUEST_NEXT));
  }
}

#[tokio::test]
async fn send_events_records_start_time_once() {
  let (node, _, _) = test_node("worker-1", 2);
  assert_eq!(node.start_time_millis(), 0);

  node.send_events(2).await.unwrap();
  let first = node.start_time_millis();
  assert!(first > 0);

  tokio::time::sleep(Duration::from_millis(5)).await;
  node.send_events(2).await.unwrap();
  assert_eq!(node.start_time_millis(), first);
}

#[tokio::test]
async fn request_event_publishes_to_the_reader_topic() {
  let (node, bus, _) = test_node("worker-1", 4);
  node.request_event(7, "next-rec").await.unwrap();

  let requests = bus.published_to(&node.app().reader.topic());
  assert_eq!(requests.len(), 1);
  assert_eq!(requests[0].communication_id(), 7);
  assert!(requests[0].is_request("next-rec"));
}

// ============================================================================
// Deployment and configuration
// ============================================================================

#[tokio::test]
async fn deploy_services_is_idempotent() {
  let (node, _, deployer) = test_node("worker-1", 2);
  node.deploy_services().await.unwrap();
  assert_eq!(deployer.deploy_calls.load(Ordering::Acquire), 1);

  // Already present: the check short-circuits the install.
  node.deploy_services().await.unwrap();
  assert_eq!(deployer.deploy_calls.load(Ordering::Acquire), 1);
}

#[tokio::test]
async fn configure_services_pushes_to_every_service() {
  let (node, _, deployer) = test_node("worker-1", 2);
  node.set_configuration(serde_json::json!({"geometry": "v2"}));
  node.configure_services().await.unwrap();

  let configures = deployer.configures.lock().unwrap();
  let services: Vec<String> = configures.iter().map(|(s, _)| s.name.clone()).collect();
  assert_eq!(services, vec!["reader", "stage", "writer", "monitor"]);
}

#[tokio::test]
async fn configure_services_without_configuration_is_a_noop() {
  let (node, _, deployer) = test_node("worker-1", 2);
  node.configure_services().await.unwrap();
  assert!(deployer.configures.lock().unwrap().is_empty());
}

#[tokio::test]
async fn configure_rejection_aborts_node_setup() {
  let (node, _, deployer) = test_node("worker-1", 2);
  deployer.reject_configures.store(true, Ordering::Release);
  node.set_configuration(serde_json::json!({"geometry": "v2"}));

  let result = node.configure_services().await;
  assert!(matches!(result, Err(NodeError::ConfigRejected { .. })));
  // The first rejection aborts the push sequence.
  assert_eq!(deployer.configures.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn set_paths_targets_the_processing_stage() {
  let (node, _, deployer) = test_node("worker-1", 2);
  node
    .set_paths("/data/in".as_ref(), "/data/out".as_ref())
    .await
    .unwrap();

  let configures = deployer.configures.lock().unwrap();
  assert_eq!(configures.len(), 1);
  assert_eq!(configures[0].0.name, "stage");
  let body: serde_json::Value = serde_json::from_slice(configures[0].1.payload()).unwrap();
  assert_eq!(body["input_path"], "/data/in");
  assert_eq!(body["output_path"], "/data/out");
}

#[tokio::test]
async fn set_paths_rejection_is_fatal() {
  let (node, _, deployer) = test_node("worker-1", 2);
  deployer.reject_configures.store(true, Ordering::Release);
  let result = node
    .set_paths("/data/in".as_ref(), "/data/out".as_ref())
    .await;
  assert!(matches!(result, Err(NodeError::ConfigRejected { .. })));
}

// ============================================================================
// File queue
// ============================================================================

#[tokio::test]
async fn open_next_file_walks_the_queue_with_limits() {
  let (node, _, deployer) = test_node("worker-1", 2);
  node.set_event_limits(5, 100);
  node.set_files(vec![
    FileAssignment {
      input: "/data/in/a.jsonl".into(),
      output: "/data/out/a.jsonl".into(),
    },
    FileAssignment {
      input: "/data/in/b.jsonl".into(),
      output: "/data/out/b.jsonl".into(),
    },
  ]);

  assert!(node.open_next_file().await.unwrap());
  {
    let configures = deployer.configures.lock().unwrap();
    // Reader open carries the configured bounds, writer open follows.
    assert_eq!(configures[0].0.name, "reader");
    let body: serde_json::Value = serde_json::from_slice(configures[0].1.payload()).unwrap();
    assert_eq!(body["action"], "open");
    assert_eq!(body["file"], "/data/in/a.jsonl");
    assert_eq!(body["skip"], 5);
    assert_eq!(body["max"], 100);
    assert_eq!(configures[1].0.name, "writer");
  }

  assert!(node.open_next_file().await.unwrap());
  assert!(!node.open_next_file().await.unwrap());

  let data = node.runtime_data();
  assert_eq!(data["files_done"], 2);
  assert_eq!(data["files_total"], 2);
}

#[tokio::test]
async fn unlimited_max_events_is_omitted_from_the_open_request() {
  let (node, _, deployer) = test_node("worker-1", 2);
  node.set_event_limits(0, -1);
  node.set_files(vec![FileAssignment {
    input: "/data/in/a.jsonl".into(),
    output: "/data/out/a.jsonl".into(),
  }]);
  node.open_next_file().await.unwrap();

  let configures = deployer.configures.lock().unwrap();
  let body: serde_json::Value = serde_json::from_slice(configures[0].1.payload()).unwrap();
  assert!(body.get("max").is_none());
}

// ============================================================================
// EOF accounting and identity
// ============================================================================

#[tokio::test]
async fn record_eof_completes_at_the_opened_slot_count() {
  let (node, _, _) = test_node("worker-1", 3);
  // No window opened yet: nothing can complete.
  assert!(!node.record_eof(1));

  node.send_events(3).await.unwrap();
  assert!(!node.record_eof(1));
  assert!(!node.record_eof(2));
  assert!(node.record_eof(3));
}

#[tokio::test]
async fn record_event_tracks_file_and_total_counters() {
  let (node, _, _) = test_node("worker-1", 2);
  node.record_event();
  node.record_event();
  assert_eq!(node.event_number(), 2);
  assert_eq!(node.total_events(), 2);
}

#[test]
fn node_identity_follows_the_application_descriptor() {
  let bus = Arc::new(RecordingBus::default());
  let deployer = Arc::new(MockDeployer::default());
  let a1 = StreamProcessingNode::new(test_app("worker-1", 2), bus.clone(), deployer.clone());
  let a2 = StreamProcessingNode::new(test_app("worker-1", 2), bus.clone(), deployer.clone());
  let b = StreamProcessingNode::new(test_app("worker-2", 2), bus, deployer);

  // Counters do not participate in identity.
  a2.record_event();
  assert_eq!(a1, a2);
  assert_ne!(a1, b);
}

#[test]
fn dpes_lists_distinct_hosts() {
  let mut app = test_app("worker-1", 2);
  app.monitoring = vec![ServiceId::new("monitor-host", "mon", "watch")];
  assert_eq!(app.dpes(), vec!["monitor-host", "worker-1"]);
}
