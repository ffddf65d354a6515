//! Processing stage seam between reader and writer.
//!
//! Reconstruction chains plug in here; the runtime calls the processor for
//! every dispatched event and routes the result to the writer, or a failure
//! to the node's error topic for slot replay.

use crate::message::Message;

/// Error returned by a processing stage for one event.
#[derive(Debug, thiserror::Error)]
#[error("processing failed: {0}")]
pub struct ProcessorError(pub String);

/// Transforms one event payload into its reconstructed form.
///
/// Implementations must preserve the event's correlation id on the returned
/// message; the writer's replenish credit carries it back to the reader
/// window. Called concurrently for events from different slots, so
/// implementations hold no per-event mutable state.
pub trait EventProcessor: Send + Sync {
  /// Processes one event.
  fn process(&self, event: &Message) -> Result<Message, ProcessorError>;
}

/// Processor that forwards events unchanged.
#[derive(Clone, Copy, Debug, Default)]
pub struct PassThroughProcessor;

impl EventProcessor for PassThroughProcessor {
  fn process(&self, event: &Message) -> Result<Message, ProcessorError> {
    Ok(event.clone())
  }
}
