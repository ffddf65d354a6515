//! Error reports delivered from a node's containers to its supervisor.
//!
//! Asynchronous failures — per-event processing errors and the reader's
//! tiered end-of-stream notifications — arrive on the node's error topic and
//! are forwarded over an mpsc channel to one supervisor task per node. The
//! channel serializes concurrent slot failures, so the supervisor needs no
//! further locking.

use crate::message::{EofSignal, Message};

/// One asynchronous notification from a node's pipeline.
#[derive(Clone, Debug)]
pub struct ErrorReport {
  /// Name of the node the report came from.
  pub node: String,
  /// Correlation id of the affected window slot.
  pub communication_id: i64,
  /// Error description (service reply description).
  pub description: String,
  /// Decoded end-of-stream sentinel, when the report is an EOF tier rather
  /// than a genuine failure.
  pub eof: Option<EofSignal>,
}

impl ErrorReport {
  /// Builds a report from a message published on a node's error topic.
  #[must_use]
  pub fn from_message(node: &str, message: &Message) -> Self {
    Self {
      node: node.to_string(),
      communication_id: message.communication_id(),
      description: message.description().to_string(),
      eof: message.eof_signal(),
    }
  }

  /// Returns true if this report is an end-of-stream tier, not a failure.
  #[must_use]
  pub fn is_eof(&self) -> bool {
    self.eof.is_some()
  }
}
