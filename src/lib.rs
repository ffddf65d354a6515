//! # ReconFlow
//!
//! Distributed event reconstruction over an asynchronous pub/sub bus.
//!
//! ReconFlow distributes reconstruction of a large sequence of discrete data
//! records ("events") across a pool of worker nodes, each hosting a
//! reader → processing → writer pipeline. The heart of the crate is the
//! windowed, pull-based flow-control protocol: a bounded number of events
//! stays in flight per node, end-of-stream is detected correctly even with
//! concurrently outstanding requests, and mid-flight processing failures
//! replay their window slot instead of stalling or duplicating the stream.
//!
//! ## Key pieces
//!
//! - **Reader window** ([`reader`]): hands out event indices, tracks the
//!   in-flight set, answers exhausted requests with tiered EOF sentinels
//! - **Writer window** ([`writer`]): persists events in completion order and
//!   returns the replenish credit that re-arms a reader slot
//! - **Node driver** ([`node`]): one worker's pipeline, configuration and
//!   request window
//! - **Orchestrator** ([`orchestrator`]): parallel node setup, per-node
//!   supervision, error replay and the run completion barrier
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use reconflow::bus::LocalBus;
//! use reconflow::config::OrchestratorConfig;
//! use reconflow::deploy::{LocalDeployer, ServiceId};
//! use reconflow::node::{ApplicationDescriptor, FileAssignment, StreamProcessingNode};
//! use reconflow::orchestrator::{OrchestratorError, RunHooks, StreamOrchestrator};
//! use reconflow::processor::PassThroughProcessor;
//! use reconflow::sink::JsonlSinkFactory;
//! use reconflow::source::JsonlSourceFactory;
//! use std::sync::Arc;
//!
//! struct Feed;
//!
//! #[async_trait::async_trait]
//! impl RunHooks for Feed {
//!   async fn start(&self, _orch: &Arc<StreamOrchestrator>) -> Result<(), OrchestratorError> {
//!     Ok(())
//!   }
//!   async fn feed(&self, orch: &Arc<StreamOrchestrator>) -> Result<(), OrchestratorError> {
//!     for node in orch.free_nodes() {
//!       orch.advance_node(&node).await?;
//!     }
//!     Ok(())
//!   }
//!   async fn end(&self, _orch: &Arc<StreamOrchestrator>) -> Result<(), OrchestratorError> {
//!     Ok(())
//!   }
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = Arc::new(LocalBus::new());
//! let deployer = Arc::new(LocalDeployer::new(
//!   bus.clone(),
//!   Arc::new(JsonlSourceFactory),
//!   Arc::new(JsonlSinkFactory),
//!   Arc::new(PassThroughProcessor),
//!   mime::APPLICATION_JSON,
//! ));
//!
//! let app = ApplicationDescriptor {
//!   name: "worker-1".to_string(),
//!   reader: ServiceId::new("worker-1", "pipeline", "reader"),
//!   stage: ServiceId::new("worker-1", "pipeline", "stage"),
//!   writer: ServiceId::new("worker-1", "pipeline", "writer"),
//!   monitoring: vec![],
//!   max_cores: 4,
//!   front_end: false,
//! };
//!
//! let config = OrchestratorConfig::new("session", "/data/in", "/data/out");
//! let orchestrator = StreamOrchestrator::new(bus.clone(), deployer.clone(), config);
//!
//! let node = Arc::new(StreamProcessingNode::new(app, bus, deployer));
//! node.set_files(vec![FileAssignment {
//!   input: "/data/in/run-001.jsonl".into(),
//!   output: "/data/out/run-001.jsonl".into(),
//! }]);
//! orchestrator.setup_node(node).await?;
//!
//! let outcome = orchestrator.run(&Feed).await?;
//! println!("run {}: {}", outcome.status, outcome.message);
//! # Ok(())
//! # }
//! ```

// Documentation enforcement - treat missing docs as errors
#![deny(missing_docs)]

/// Publish/subscribe bus interface and the in-process reference bus.
pub mod bus;
/// Typed orchestrator configuration.
pub mod config;
/// Deployment collaborator and the in-process pipeline runtime.
pub mod deploy;
/// Message envelope and the windowed request vocabulary.
pub mod message;
/// Worker node driver and its request window.
pub mod node;
/// Orchestrator control loop, completion barrier and run hooks.
pub mod orchestrator;
/// Processing stage seam between reader and writer.
pub mod processor;
/// Reader-side event window state machine and service.
pub mod reader;
/// Event sinks for the writer service.
pub mod sink;
/// Event sources for the reader service.
pub mod source;
/// Run-wide reconstruction statistics.
pub mod stats;
/// Error reports delivered to per-node supervisors.
pub mod supervision;
/// Writer-side event window state machine and service.
pub mod writer;

#[cfg(test)]
mod bus_test;
#[cfg(test)]
mod message_test;
#[cfg(test)]
mod node_test;
#[cfg(test)]
mod writer_test;

pub use bus::{LocalBus, MessageBus, Topic};
pub use message::{EofSignal, Message, Status};
pub use node::{ApplicationDescriptor, FileAssignment, StreamProcessingNode};
pub use orchestrator::{RunHooks, RunOutcome, RunStatus, StreamOrchestrator};
pub use reader::{ReaderService, ReaderWindow};
pub use stats::ReconstructionStats;
pub use writer::WriterService;
