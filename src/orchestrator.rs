//! Orchestrator control loop.
//!
//! [`StreamOrchestrator::run`] is a template: the concrete workflow plugs in
//! through [`RunHooks`] (start / feed / end) while the orchestrator owns the
//! invariant machinery — parallel node setup, the per-node supervisor that
//! turns writer credits into `next-rec` requests and replays failed window
//! slots, end-of-stream accounting across nodes, the statistics registry,
//! and the completion barrier that makes [`wait_rec`] block until
//! [`exit_rec`] is invoked exactly once.
//!
//! # Failure semantics
//!
//! Timeouts and transport errors on synchronous configuration calls abort
//! that node's setup; the failure is logged and the node never joins the
//! free pool — the run keeps going with the nodes that made it.
//! Asynchronous per-event errors are recoverable: the supervisor re-issues
//! `next-rec` for the failed slot's correlation id. A transport failure
//! while re-arming a slot is fatal and ends the run through `exit_rec`.
//!
//! [`wait_rec`]: StreamOrchestrator::wait_rec
//! [`exit_rec`]: StreamOrchestrator::exit_rec

use crate::bus::{BusError, MessageBus, Topic};
use crate::config::{ConfigureMode, OrchestratorConfig};
use crate::deploy::{DeployError, Deployer};
use crate::message::{EofSignal, Message, REQUEST_NEXT_REC};
use crate::node::{NodeError, StreamProcessingNode};
use crate::stats::ReconstructionStats;
use crate::supervision::ErrorReport;
use async_trait::async_trait;
use chrono::Utc;
use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Buffer size for per-node error report channels.
const REPORT_BUFFER: usize = 64;

/// Correlation id for end-of-stream probes; never matches an event index,
/// so the probe acknowledges nothing.
const EOF_PROBE_ID: i64 = -1;

/// Final status of a run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RunStatus {
  /// Every node drained its file queue.
  Succeeded,
  /// The run was aborted.
  Failed,
}

impl Display for RunStatus {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    match self {
      RunStatus::Succeeded => write!(f, "succeeded"),
      RunStatus::Failed => write!(f, "failed"),
    }
  }
}

/// Outcome recorded by [`StreamOrchestrator::exit_rec`].
#[derive(Clone, Debug)]
pub struct RunOutcome {
  /// Final status.
  pub status: RunStatus,
  /// Human-readable completion message.
  pub message: String,
}

/// Binary-semaphore completion barrier.
///
/// The single permit is taken when the run begins; [`wait`](Self::wait)
/// then blocks until [`release`](Self::release) hands it back. Release
/// happens at most once per run — later calls are no-ops.
pub struct CompletionBarrier {
  permit: Semaphore,
  released: AtomicBool,
  outcome: Mutex<Option<RunOutcome>>,
}

impl CompletionBarrier {
  /// Creates a barrier with its single permit available.
  #[must_use]
  pub fn new() -> Self {
    Self {
      permit: Semaphore::new(1),
      released: AtomicBool::new(false),
      outcome: Mutex::new(None),
    }
  }

  /// Takes the permit; called once before the run begins.
  pub async fn begin(&self) {
    self
      .permit
      .acquire()
      .await
      .expect("barrier semaphore closed")
      .forget();
  }

  /// Records the outcome and returns the permit. Returns false if the
  /// barrier was already released.
  pub fn release(&self, outcome: RunOutcome) -> bool {
    if self.released.swap(true, Ordering::AcqRel) {
      return false;
    }
    *self.outcome.lock().expect("barrier outcome poisoned") = Some(outcome);
    self.permit.add_permits(1);
    true
  }

  /// Blocks until the barrier is released, then yields the outcome.
  pub async fn wait(&self) -> RunOutcome {
    self
      .permit
      .acquire()
      .await
      .expect("barrier semaphore closed")
      .forget();
    self.outcome().unwrap_or_else(|| RunOutcome {
      status: RunStatus::Failed,
      message: "barrier released without an outcome".to_string(),
    })
  }

  /// The recorded outcome, if the barrier has been released.
  #[must_use]
  pub fn outcome(&self) -> Option<RunOutcome> {
    self.outcome.lock().expect("barrier outcome poisoned").clone()
  }
}

impl Default for CompletionBarrier {
  fn default() -> Self {
    Self::new()
  }
}

/// Error type for orchestration operations.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
  /// Bus transport failure.
  #[error(transparent)]
  Bus(#[from] BusError),
  /// Node driver failure.
  #[error(transparent)]
  Node(#[from] NodeError),
  /// Deployment collaborator failure.
  #[error(transparent)]
  Deploy(#[from] DeployError),
  /// The run was aborted before completion.
  #[error("run aborted: {0}")]
  Aborted(String),
}

/// Concrete workflow hooks around the orchestrator's template run.
#[async_trait]
pub trait RunHooks: Send + Sync {
  /// Runs before the completion barrier is armed (node discovery, setup).
  async fn start(&self, orchestrator: &Arc<StreamOrchestrator>) -> Result<(), OrchestratorError>;

  /// The event-feeding loop: arms windows on the free nodes. Runs after the
  /// barrier is armed; must not block until run completion.
  async fn feed(&self, orchestrator: &Arc<StreamOrchestrator>) -> Result<(), OrchestratorError>;

  /// Runs after the barrier is released, before teardown.
  async fn end(&self, orchestrator: &Arc<StreamOrchestrator>) -> Result<(), OrchestratorError>;
}

/// Drives a whole reconstruction run across a pool of worker nodes.
pub struct StreamOrchestrator {
  bus: Arc<dyn MessageBus>,
  deployer: Arc<dyn Deployer>,
  config: OrchestratorConfig,
  stats: Arc<ReconstructionStats>,
  barrier: CompletionBarrier,
  free_nodes: Mutex<Vec<Arc<StreamProcessingNode>>>,
  setup_tasks: Mutex<JoinSet<()>>,
  supervisors: Mutex<Vec<JoinHandle<()>>>,
  active_nodes: AtomicUsize,
}

impl StreamOrchestrator {
  /// Creates an orchestrator over the given bus and deployment collaborator.
  #[must_use]
  pub fn new(
    bus: Arc<dyn MessageBus>,
    deployer: Arc<dyn Deployer>,
    config: OrchestratorConfig,
  ) -> Arc<Self> {
    Arc::new(Self {
      bus,
      deployer,
      config,
      stats: Arc::new(ReconstructionStats::new()),
      barrier: CompletionBarrier::new(),
      free_nodes: Mutex::new(Vec::new()),
      setup_tasks: Mutex::new(JoinSet::new()),
      supervisors: Mutex::new(Vec::new()),
      active_nodes: AtomicUsize::new(0),
    })
  }

  /// The run configuration.
  #[must_use]
  pub fn config(&self) -> &OrchestratorConfig {
    &self.config
  }

  /// The shared statistics registry.
  #[must_use]
  pub fn stats(&self) -> &Arc<ReconstructionStats> {
    &self.stats
  }

  /// Snapshot of the free-node pool.
  #[must_use]
  pub fn free_nodes(&self) -> Vec<Arc<StreamProcessingNode>> {
    self.free_nodes.lock().expect("free node pool poisoned").clone()
  }

  /// Template run: `start` hook, arm the barrier and delegate the feeding
  /// loop, block on the barrier, `end` hook, then teardown. Teardown runs
  /// even when an earlier step fails, before the error is re-raised.
  pub async fn run(
    self: &Arc<Self>,
    hooks: &dyn RunHooks,
  ) -> Result<RunOutcome, OrchestratorError> {
    let result = self.run_inner(hooks).await;
    self.destroy().await;
    result
  }

  async fn run_inner(
    self: &Arc<Self>,
    hooks: &dyn RunHooks,
  ) -> Result<RunOutcome, OrchestratorError> {
    hooks.start(self).await?;
    self.start_rec(hooks).await?;
    let outcome = self.wait_rec().await;
    hooks.end(self).await?;
    Ok(outcome)
  }

  /// Arms the completion barrier and delegates the event-feeding loop.
  async fn start_rec(self: &Arc<Self>, hooks: &dyn RunHooks) -> Result<(), OrchestratorError> {
    self.stats.start_clock();
    self.barrier.begin().await;
    hooks.feed(self).await
  }

  /// Blocks until [`exit_rec`](Self::exit_rec) releases the barrier.
  pub async fn wait_rec(&self) -> RunOutcome {
    self.barrier.wait().await
  }

  /// The single sanctioned way to finish a run. Stops the global clock and
  /// releases the completion barrier; at most one call per run takes
  /// effect.
  pub fn exit_rec(&self, status: RunStatus, message: impl Into<String>) {
    let message = message.into();
    self.stats.stop_clock();
    if self.barrier.release(RunOutcome {
      status,
      message: message.clone(),
    }) {
      match status {
        RunStatus::Succeeded => info!("run finished: {}", message),
        RunStatus::Failed => error!("run failed: {}", message),
      }
    } else {
      debug!("exit_rec after completion: {}", message);
    }
  }

  /// Submits a node's setup to the worker pool. A failed setup is logged
  /// and not retried; the node never joins the free pool.
  pub fn execute_setup(self: &Arc<Self>, node: Arc<StreamProcessingNode>) {
    let orchestrator = self.clone();
    let mut tasks = self.setup_tasks.lock().expect("setup task set poisoned");
    tasks.spawn(async move {
      let name = node.name().to_string();
      if let Err(e) = orchestrator.setup_node(node).await {
        error!(node = %name, "node setup failed, node excluded from run: {}", e);
      }
    });
  }

  /// Waits for all submitted setup tasks to finish.
  pub async fn await_setups(&self) {
    let mut tasks = {
      let mut guard = self.setup_tasks.lock().expect("setup task set poisoned");
      std::mem::take(&mut *guard)
    };
    while let Some(joined) = tasks.join_next().await {
      if let Err(e) = joined {
        error!("setup task aborted: {}", e);
      }
    }
  }

  /// Prepares one node end to end: deploy if missing, subscribe errors,
  /// push configuration, set limits, spawn its supervisor, and register it
  /// into the free pool and the statistics registry.
  pub async fn setup_node(
    self: &Arc<Self>,
    node: Arc<StreamProcessingNode>,
  ) -> Result<(), OrchestratorError> {
    if !node.check_services().await? {
      node.deploy_services().await?;
    }

    let (report_tx, report_rx) = mpsc::channel(REPORT_BUFFER);
    node.subscribe_errors(report_tx).await?;
    let credit_rx = self
      .bus
      .subscribe(&Topic::credits(node.name()))
      .await?;

    node
      .set_paths(&self.config.input_dir, &self.config.output_dir)
      .await?;
    if self.config.configure_mode == ConfigureMode::Dataset {
      node.configure_services().await?;
    }
    node.set_event_limits(self.config.skip_events, self.config.max_events);
    node.set_report_frequency(self.config.report_frequency);
    if node.is_front_end() || self.config.monitor_front_end.as_deref() == Some(node.name()) {
      info!(node = node.name(), "node hosts the monitoring front end");
    }

    let supervisor = tokio::spawn(supervise(self.clone(), node.clone(), report_rx, credit_rx));
    self
      .supervisors
      .lock()
      .expect("supervisor list poisoned")
      .push(supervisor);

    self.stats.register(node.name());
    self.active_nodes.fetch_add(1, Ordering::AcqRel);
    self
      .free_nodes
      .lock()
      .expect("free node pool poisoned")
      .push(node);
    Ok(())
  }

  /// Opens the node's next file and re-arms its request window. Returns
  /// false when the node's file queue is empty.
  pub async fn advance_node(
    &self,
    node: &Arc<StreamProcessingNode>,
  ) -> Result<bool, OrchestratorError> {
    if node.open_next_file().await? {
      node.send_events(self.config.max_cores).await?;
      Ok(true)
    } else {
      Ok(false)
    }
  }

  /// Feeds a node's wall-clock throughput into the statistics registry.
  pub fn print_average(&self, node: &StreamProcessingNode) {
    let started = node.start_time_millis();
    if started == 0 {
      return;
    }
    let elapsed = Utc::now().timestamp_millis() - started;
    let events = node.total_events();
    if events > 0 && elapsed > 0 {
      info!(
        node = node.name(),
        events,
        elapsed_ms = elapsed,
        average_ms = elapsed as f64 / events as f64,
        "node throughput"
      );
    }
    self.stats.update(node.name(), events, elapsed);
  }

  fn node_done(&self, node: &StreamProcessingNode) {
    info!(node = node.name(), "node drained its file queue");
    if self.active_nodes.fetch_sub(1, Ordering::AcqRel) == 1 {
      self.exit_rec(
        RunStatus::Succeeded,
        format!(
          "all nodes done, {} events reconstructed",
          self.stats.total_events()
        ),
      );
    }
  }

  /// Tears down the worker pool and supervisors, checks the stale-PID
  /// marker, and logs the final status.
  pub async fn destroy(&self) {
    {
      let mut tasks = self.setup_tasks.lock().expect("setup task set poisoned");
      tasks.abort_all();
    }
    let supervisors: Vec<JoinHandle<()>> = {
      let mut guard = self.supervisors.lock().expect("supervisor list poisoned");
      guard.drain(..).collect()
    };
    for supervisor in &supervisors {
      supervisor.abort();
    }
    let _ = futures::future::join_all(supervisors).await;
    self.check_stale_pid();
    match self.barrier.outcome() {
      Some(outcome) => info!(
        session = %self.config.session,
        status = %outcome.status,
        "orchestrator destroyed: {}",
        outcome.message
      ),
      None => warn!(
        session = %self.config.session,
        "orchestrator destroyed before run completion"
      ),
    }
  }

  /// Best-effort, informational only: reports a leftover PID marker from an
  /// earlier run. Does not attempt to terminate anything.
  fn check_stale_pid(&self) {
    let Some(path) = &self.config.stale_pid_file else {
      return;
    };
    match std::fs::read_to_string(path) {
      Ok(pid) => warn!(
        file = %path.display(),
        pid = pid.trim(),
        "stale PID marker found; a previous run may still be registered"
      ),
      Err(_) => debug!(file = %path.display(), "no stale PID marker"),
    }
  }
}

/// Per-node supervisor: turns writer credits into `next-rec` requests,
/// replays failed window slots, and accounts end-of-stream tiers.
///
/// One task per node; the report channel serializes concurrent slot
/// failures, so no further locking is needed here.
async fn supervise(
  orchestrator: Arc<StreamOrchestrator>,
  node: Arc<StreamProcessingNode>,
  mut reports: mpsc::Receiver<ErrorReport>,
  mut credits: mpsc::Receiver<Message>,
) {
  loop {
    tokio::select! {
      credit = credits.recv() => {
        let Some(credit) = credit else { break };
        node.record_event();
        if let Err(e) = node
          .request_event(credit.communication_id(), REQUEST_NEXT_REC)
          .await
        {
          orchestrator.exit_rec(
            RunStatus::Failed,
            format!("node {}: failed to re-arm window slot: {}", node.name(), e),
          );
          break;
        }
      }
      report = reports.recv() => {
        let Some(report) = report else { break };
        match report.eof {
          Some(EofSignal::Confirmed(n)) => {
            if node.record_eof(n) && !finish_file(&orchestrator, &node).await {
              break;
            }
          }
          Some(signal) => {
            // Exhausted/draining tiers are not terminal: keep the slot
            // probing until it collects its confirmed tier. The probe id -1
            // acknowledges no in-flight index.
            debug!(node = node.name(), %signal, "end-of-stream tier, re-probing");
            if let Err(e) = node.request_event(EOF_PROBE_ID, REQUEST_NEXT_REC).await {
              orchestrator.exit_rec(
                RunStatus::Failed,
                format!("node {}: failed to probe end-of-stream: {}", node.name(), e),
              );
              break;
            }
          }
          None => {
            warn!(
              node = node.name(),
              communication_id = report.communication_id,
              "processing error, replaying window slot: {}",
              report.description
            );
            if let Err(e) = node
              .request_event(report.communication_id, REQUEST_NEXT_REC)
              .await
            {
              orchestrator.exit_rec(
                RunStatus::Failed,
                format!("node {}: failed to replay window slot: {}", node.name(), e),
              );
              break;
            }
          }
        }
      }
      else => break,
    }
  }
}

/// Handles a fully drained file: report averages, close it, and either open
/// the next assignment or mark the node done. Returns false when the
/// supervisor should stop (node finished or the run was aborted).
async fn finish_file(
  orchestrator: &Arc<StreamOrchestrator>,
  node: &Arc<StreamProcessingNode>,
) -> bool {
  orchestrator.print_average(node);
  if let Err(e) = node.close_current_file().await {
    orchestrator.exit_rec(
      RunStatus::Failed,
      format!("node {}: failed to close file: {}", node.name(), e),
    );
    return false;
  }
  match orchestrator.advance_node(node).await {
    Ok(true) => true,
    Ok(false) => {
      orchestrator.node_done(node);
      false
    }
    Err(e) => {
      orchestrator.exit_rec(
        RunStatus::Failed,
        format!("node {}: failed to open next file: {}", node.name(), e),
      );
      false
    }
  }
}
