//! Worker node driver.
//!
//! A [`StreamProcessingNode`] owns one worker's deployed pipeline, its
//! configuration, and its request window — how many `next` requests to keep
//! outstanding against the node's reader. It issues windowed requests,
//! tracks per-node counters, and walks the node through its assigned file
//! queue. Counters are independently mutated by concurrent request and
//! credit handling, so they are all atomics; node identity is defined by the
//! deployed application descriptor, never by transient counters.

use crate::bus::MessageBus;
use crate::deploy::{DeployError, Deployer, ServiceId};
use crate::message::{ConfigRequest, Message, REQUEST_NEXT};
use crate::supervision::ErrorReport;
use bytes::Bytes;
use chrono::Utc;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

/// Timeout for the synchronous data-path configuration push.
const PATHS_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Timeout for each per-service configuration push and file open/close.
const CONFIGURE_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// The set of deployed service identities one node composes: the
/// reader/stage/writer triple plus monitoring services. Immutable after
/// construction; two nodes are the same node iff their descriptors match.
#[derive(Clone, Debug, Eq, Hash, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ApplicationDescriptor {
  /// Node name; also names the error and credit topics.
  pub name: String,
  /// Reader stage identity.
  pub reader: ServiceId,
  /// Processing stage identity.
  pub stage: ServiceId,
  /// Writer stage identity.
  pub writer: ServiceId,
  /// Monitoring service identities.
  pub monitoring: Vec<ServiceId>,
  /// Maximum concurrent window slots this application supports.
  pub max_cores: u32,
  /// True if this node hosts the monitoring front end.
  pub front_end: bool,
}

impl ApplicationDescriptor {
  /// All service identities of this application.
  #[must_use]
  pub fn services(&self) -> Vec<&ServiceId> {
    let mut services = vec![&self.reader, &self.stage, &self.writer];
    services.extend(self.monitoring.iter());
    services
  }

  /// The distinct worker hosts this application spans.
  #[must_use]
  pub fn dpes(&self) -> Vec<String> {
    let mut dpes: Vec<String> = self.services().iter().map(|s| s.dpe.clone()).collect();
    dpes.sort();
    dpes.dedup();
    dpes
  }
}

/// One input/output file pair assigned to a node.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FileAssignment {
  /// File the reader opens.
  pub input: PathBuf,
  /// File the writer creates.
  pub output: PathBuf,
}

/// Error type for node driver operations.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
  /// Transport failure on the bus; fatal for the run.
  #[error(transparent)]
  Bus(#[from] crate::bus::BusError),
  /// Deployment collaborator failure.
  #[error(transparent)]
  Deploy(#[from] DeployError),
  /// A service rejected a configuration push.
  #[error("configuration rejected by {service}: {reason}")]
  ConfigRejected {
    /// The rejecting service.
    service: String,
    /// The rejection description.
    reason: String,
  },
}

/// Driver for one worker node's deployed pipeline and request window.
pub struct StreamProcessingNode {
  app: ApplicationDescriptor,
  bus: Arc<dyn MessageBus>,
  deployer: Arc<dyn Deployer>,

  current_file_counter: AtomicU64,
  total_files_counter: AtomicU64,
  total_events: AtomicU64,
  event_number: AtomicU64,
  eof_counter: AtomicU32,
  skip_events: AtomicI64,
  max_events: AtomicI64,
  start_time: AtomicI64,
  last_report_time: AtomicI64,
  report_frequency: AtomicU64,
  request_cores: AtomicU32,

  files: Mutex<VecDeque<FileAssignment>>,
  current_file: Mutex<Option<FileAssignment>>,
  paths: Mutex<Option<(PathBuf, PathBuf)>>,
  configuration: Mutex<Option<serde_json::Value>>,
}

impl StreamProcessingNode {
  /// Creates a node driver for the given application.
  #[must_use]
  pub fn new(
    app: ApplicationDescriptor,
    bus: Arc<dyn MessageBus>,
    deployer: Arc<dyn Deployer>,
  ) -> Self {
    Self {
      app,
      bus,
      deployer,
      current_file_counter: AtomicU64::new(0),
      total_files_counter: AtomicU64::new(0),
      total_events: AtomicU64::new(0),
      event_number: AtomicU64::new(0),
      eof_counter: AtomicU32::new(0),
      skip_events: AtomicI64::new(0),
      max_events: AtomicI64::new(-1),
      start_time: AtomicI64::new(0),
      last_report_time: AtomicI64::new(0),
      report_frequency: AtomicU64::new(0),
      request_cores: AtomicU32::new(0),
      files: Mutex::new(VecDeque::new()),
      current_file: Mutex::new(None),
      paths: Mutex::new(None),
      configuration: Mutex::new(None),
    }
  }

  /// The node name.
  #[must_use]
  pub fn name(&self) -> &str {
    &self.app.name
  }

  /// The deployed application descriptor.
  #[must_use]
  pub fn app(&self) -> &ApplicationDescriptor {
    &self.app
  }

  /// The distinct worker hosts this node spans.
  #[must_use]
  pub fn dpes(&self) -> Vec<String> {
    self.app.dpes()
  }

  /// True if this node hosts the monitoring front end.
  #[must_use]
  pub fn is_front_end(&self) -> bool {
    self.app.front_end
  }

  /// Checks whether all required service identities are present.
  pub async fn check_services(&self) -> Result<bool, NodeError> {
    Ok(self.deployer.is_deployed(&self.app).await?)
  }

  /// Installs the node's service set. Idempotent: checks first, then
  /// deploys only what is missing.
  pub async fn deploy_services(&self) -> Result<(), NodeError> {
    if !self.check_services().await? {
      self.deployer.deploy(&self.app).await?;
    }
    Ok(())
  }

  /// Routes the node's asynchronous error notifications into `reports`.
  /// The receiving side must tolerate concurrent slot failures; delivery
  /// through the channel serializes them.
  pub async fn subscribe_errors(
    &self,
    reports: mpsc::Sender<ErrorReport>,
  ) -> Result<(), NodeError> {
    Ok(self.deployer.subscribe_errors(&self.app, reports).await?)
  }

  /// Stores the per-service configuration pushed by
  /// [`configure_services`](Self::configure_services).
  pub fn set_configuration(&self, configuration: serde_json::Value) {
    *self
      .configuration
      .lock()
      .expect("node configuration poisoned") = Some(configuration);
  }

  /// Pushes the data-path configuration to the processing stage.
  /// Synchronous with a multi-minute timeout; timeout and transport errors
  /// propagate and are fatal for this node's setup.
  pub async fn set_paths(&self, input: &Path, output: &Path) -> Result<(), NodeError> {
    let body = serde_json::json!({
      "input_path": input,
      "output_path": output,
    });
    let request = Message::data(
      mime::APPLICATION_JSON,
      Bytes::from(serde_json::to_vec(&body).expect("paths serialize")),
    );
    let reply = self
      .deployer
      .configure(&self.app.stage, request, PATHS_TIMEOUT)
      .await?;
    if reply.status().is_error() {
      return Err(NodeError::ConfigRejected {
        service: self.app.stage.to_string(),
        reason: reply.description().to_string(),
      });
    }
    *self.paths.lock().expect("node paths poisoned") =
      Some((input.to_path_buf(), output.to_path_buf()));
    Ok(())
  }

  /// Pushes the stored configuration to every service of the application,
  /// one synchronous request per service with a two-minute timeout. Any
  /// failure aborts the whole node setup.
  pub async fn configure_services(&self) -> Result<(), NodeError> {
    let configuration = self
      .configuration
      .lock()
      .expect("node configuration poisoned")
      .clone();
    let Some(configuration) = configuration else {
      return Ok(());
    };
    let body = Bytes::from(serde_json::to_vec(&configuration).expect("config serializes"));
    for service in self.app.services() {
      let request = Message::data(mime::APPLICATION_JSON, body.clone());
      let reply = self
        .deployer
        .configure(service, request, CONFIGURE_TIMEOUT)
        .await?;
      if reply.status().is_error() {
        return Err(NodeError::ConfigRejected {
          service: service.to_string(),
          reason: reply.description().to_string(),
        });
      }
    }
    Ok(())
  }

  /// Sets the event range bounds used when opening files on this node.
  /// `max < 0` means "no limit".
  pub fn set_event_limits(&self, skip: i64, max: i64) {
    self.skip_events.store(skip, Ordering::Release);
    self.max_events.store(max, Ordering::Release);
  }

  /// Sets how often (in events) progress is reported. Zero disables.
  pub fn set_report_frequency(&self, frequency: u64) {
    self.report_frequency.store(frequency, Ordering::Release);
  }

  /// Assigns the node's file queue.
  pub fn set_files(&self, assignments: Vec<FileAssignment>) {
    self
      .total_files_counter
      .store(assignments.len() as u64, Ordering::Release);
    *self.files.lock().expect("node file queue poisoned") = assignments.into();
  }

  /// Opens the next assigned file on the reader and writer, resetting the
  /// per-file counters. Returns false when the queue is empty.
  pub async fn open_next_file(&self) -> Result<bool, NodeError> {
    let assignment = {
      let mut files = self.files.lock().expect("node file queue poisoned");
      files.pop_front()
    };
    let Some(assignment) = assignment else {
      return Ok(false);
    };

    let skip = self.skip_events.load(Ordering::Acquire);
    let max = self.max_events.load(Ordering::Acquire);
    let open_reader = ConfigRequest::open(
      &assignment.input,
      Some(skip),
      if max < 0 { None } else { Some(max) },
    );
    let reply = self
      .deployer
      .configure(&self.app.reader, open_reader.to_message(), CONFIGURE_TIMEOUT)
      .await?;
    if reply.status().is_error() {
      return Err(NodeError::ConfigRejected {
        service: self.app.reader.to_string(),
        reason: reply.description().to_string(),
      });
    }

    let open_writer = ConfigRequest::open(&assignment.output, None, None);
    let reply = self
      .deployer
      .configure(&self.app.writer, open_writer.to_message(), CONFIGURE_TIMEOUT)
      .await?;
    if reply.status().is_error() {
      return Err(NodeError::ConfigRejected {
        service: self.app.writer.to_string(),
        reason: reply.description().to_string(),
      });
    }

    self.eof_counter.store(0, Ordering::Release);
    self.event_number.store(0, Ordering::Release);
    self.current_file_counter.fetch_add(1, Ordering::AcqRel);
    *self.current_file.lock().expect("node current file poisoned") = Some(assignment);
    Ok(true)
  }

  /// Closes the current file on the reader and writer, flushing the output.
  /// Both closes are idempotent; only transport failures propagate.
  pub async fn close_current_file(&self) -> Result<(), NodeError> {
    let assignment = self
      .current_file
      .lock()
      .expect("node current file poisoned")
      .take();
    let Some(assignment) = assignment else {
      return Ok(());
    };
    let close_reader = ConfigRequest::close(&assignment.input);
    self
      .deployer
      .configure(&self.app.reader, close_reader.to_message(), CONFIGURE_TIMEOUT)
      .await?;
    let close_writer = ConfigRequest::close(&assignment.output);
    self
      .deployer
      .configure(&self.app.writer, close_writer.to_message(), CONFIGURE_TIMEOUT)
      .await?;
    Ok(())
  }

  /// Opens the request window: issues `min(app.max_cores, max_cores)`
  /// concurrent `next` requests with correlation ids `1..=n`, recording the
  /// window start time on the first call only. Returns the slot count.
  pub async fn send_events(&self, max_cores: u32) -> Result<u32, NodeError> {
    let request_cores = self.app.max_cores.min(max_cores);
    let now = Utc::now().timestamp_millis();
    let _ = self
      .start_time
      .compare_exchange(0, now, Ordering::AcqRel, Ordering::Acquire);
    self.request_cores.store(request_cores, Ordering::Release);
    for id in 1..=request_cores {
      self.request_event(i64::from(id), REQUEST_NEXT).await?;
    }
    Ok(request_cores)
  }

  /// Sends one windowed request (`next` or `next-rec`) to the reader.
  /// A transport failure here is fatal for the run.
  pub async fn request_event(&self, communication_id: i64, request: &str) -> Result<(), NodeError> {
    let message = Message::text(request).with_communication_id(communication_id);
    self
      .bus
      .publish(&self.app.reader.topic(), message)
      .await?;
    Ok(())
  }

  /// Records one persisted event, reporting progress at the configured
  /// frequency.
  pub fn record_event(&self) {
    let in_file = self.event_number.fetch_add(1, Ordering::AcqRel) + 1;
    let total = self.total_events.fetch_add(1, Ordering::AcqRel) + 1;
    let frequency = self.report_frequency.load(Ordering::Acquire);
    if frequency > 0 && in_file % frequency == 0 {
      self
        .last_report_time
        .store(Utc::now().timestamp_millis(), Ordering::Release);
      info!(node = self.name(), in_file, total, "reconstruction progress");
    }
  }

  /// Records a terminal EOF acknowledgment with sentinel `n`. Returns true
  /// once every opened slot has reported terminal EOF.
  pub fn record_eof(&self, n: u32) -> bool {
    self.eof_counter.fetch_max(n, Ordering::AcqRel);
    let cores = self.request_cores.load(Ordering::Acquire);
    cores > 0 && n >= cores
  }

  /// Number of slots opened by the last [`send_events`](Self::send_events).
  #[must_use]
  pub fn request_cores(&self) -> u32 {
    self.request_cores.load(Ordering::Acquire)
  }

  /// Events persisted for the current file.
  #[must_use]
  pub fn event_number(&self) -> u64 {
    self.event_number.load(Ordering::Acquire)
  }

  /// Events persisted across all files since the window opened.
  #[must_use]
  pub fn total_events(&self) -> u64 {
    self.total_events.load(Ordering::Acquire)
  }

  /// Window start time in epoch milliseconds; zero until the window opens.
  #[must_use]
  pub fn start_time_millis(&self) -> i64 {
    self.start_time.load(Ordering::Acquire)
  }

  /// Snapshot of the node's runtime counters.
  #[must_use]
  pub fn runtime_data(&self) -> serde_json::Value {
    let current_file = self
      .current_file
      .lock()
      .expect("node current file poisoned")
      .clone();
    let paths = self.paths.lock().expect("node paths poisoned").clone();
    serde_json::json!({
      "name": self.app.name,
      "paths": paths,
      "current_file": current_file.map(|f| f.input),
      "files_done": self.current_file_counter.load(Ordering::Acquire),
      "files_total": self.total_files_counter.load(Ordering::Acquire),
      "events_in_file": self.event_number.load(Ordering::Acquire),
      "events_total": self.total_events.load(Ordering::Acquire),
      "eof_count": self.eof_counter.load(Ordering::Acquire),
      "start_time": self.start_time.load(Ordering::Acquire),
      "last_report_time": self.last_report_time.load(Ordering::Acquire),
    })
  }
}

impl std::fmt::Debug for StreamProcessingNode {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("StreamProcessingNode")
      .field("app", &self.app)
      .finish_non_exhaustive()
  }
}

impl PartialEq for StreamProcessingNode {
  fn eq(&self, other: &Self) -> bool {
    self.app == other.app
  }
}

impl Eq for StreamProcessingNode {}

impl std::hash::Hash for StreamProcessingNode {
  fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
    self.app.hash(state);
  }
}
