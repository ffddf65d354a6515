//! Run-wide reconstruction statistics.
//!
//! One tally per node, each behind its own mutex so concurrent node
//! supervisors never serialize on a global lock; the global start/end clock
//! is a pair of atomics — start is idempotent (first writer wins), stop is
//! last-write-wins.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Per-node event and wall-clock totals.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct NodeTally {
  /// Events reconstructed by the node.
  pub events: u64,
  /// Wall-clock milliseconds the node's window has been open.
  pub total_time_ms: i64,
}

/// Registry of per-node tallies plus the global run clock.
///
/// `total_events()` equals the sum of `events` over nodes with
/// `events > 0`, and `global_average()` equals
/// `(end_time - start_time) / total_events()`.
pub struct ReconstructionStats {
  nodes: RwLock<HashMap<String, Arc<Mutex<NodeTally>>>>,
  start_time: AtomicI64,
  end_time: AtomicI64,
}

impl ReconstructionStats {
  /// Creates an empty registry with an unset clock.
  #[must_use]
  pub fn new() -> Self {
    Self {
      nodes: RwLock::new(HashMap::new()),
      start_time: AtomicI64::new(0),
      end_time: AtomicI64::new(0),
    }
  }

  /// Adds a node to the registry with a zero tally. Re-registering an
  /// existing node keeps its tally.
  pub fn register(&self, node: &str) {
    let mut nodes = self.nodes.write().expect("stats registry poisoned");
    nodes
      .entry(node.to_string())
      .or_insert_with(|| Arc::new(Mutex::new(NodeTally::default())));
  }

  /// Replaces a node's tally with its latest totals.
  pub fn update(&self, node: &str, events: u64, total_time_ms: i64) {
    let tally = {
      let nodes = self.nodes.read().expect("stats registry poisoned");
      nodes.get(node).cloned()
    };
    let Some(tally) = tally else {
      return;
    };
    let mut tally = tally.lock().expect("node tally poisoned");
    tally.events = events;
    tally.total_time_ms = total_time_ms;
  }

  /// Returns a node's tally, if registered.
  #[must_use]
  pub fn tally(&self, node: &str) -> Option<NodeTally> {
    let nodes = self.nodes.read().expect("stats registry poisoned");
    let tally = nodes.get(node)?;
    Some(*tally.lock().expect("node tally poisoned"))
  }

  /// Starts the global clock. Idempotent: only the first call records its
  /// timestamp.
  pub fn start_clock(&self) {
    self.start_clock_at(Utc::now().timestamp_millis());
  }

  /// Starts the global clock at an explicit timestamp (first caller wins).
  pub fn start_clock_at(&self, timestamp_ms: i64) {
    let _ = self.start_time.compare_exchange(
      0,
      timestamp_ms,
      Ordering::AcqRel,
      Ordering::Acquire,
    );
  }

  /// Stops the global clock; the last caller's timestamp wins.
  pub fn stop_clock(&self) {
    self.stop_clock_at(Utc::now().timestamp_millis());
  }

  /// Stops the global clock at an explicit timestamp.
  pub fn stop_clock_at(&self, timestamp_ms: i64) {
    self.end_time.store(timestamp_ms, Ordering::Release);
  }

  /// Global clock start in epoch milliseconds; zero if never started.
  #[must_use]
  pub fn start_time_millis(&self) -> i64 {
    self.start_time.load(Ordering::Acquire)
  }

  /// Global clock end in epoch milliseconds; zero if never stopped.
  #[must_use]
  pub fn end_time_millis(&self) -> i64 {
    self.end_time.load(Ordering::Acquire)
  }

  /// Sum of events over nodes that reconstructed at least one event.
  #[must_use]
  pub fn total_events(&self) -> u64 {
    let nodes = self.nodes.read().expect("stats registry poisoned");
    nodes
      .values()
      .map(|tally| tally.lock().expect("node tally poisoned").events)
      .filter(|events| *events > 0)
      .sum()
  }

  /// Wall-clock milliseconds per event over the whole run, or `None` when
  /// the clock never ran or no events were reconstructed.
  #[must_use]
  pub fn global_average(&self) -> Option<f64> {
    let start = self.start_time_millis();
    let end = self.end_time_millis();
    let events = self.total_events();
    if start == 0 || end == 0 || events == 0 {
      return None;
    }
    Some((end - start) as f64 / events as f64)
  }
}

impl Default for ReconstructionStats {
  fn default() -> Self {
    Self::new()
  }
}
