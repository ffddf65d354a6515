//! Typed orchestrator configuration.
//!
//! Everything the control loop needs is injected here at construction —
//! including the monitoring front end and the stale-PID marker path that the
//! original system read from ambient environment lookups — so a run is fully
//! testable without a real environment.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

fn default_max_cores() -> u32 {
  1
}

fn default_max_events() -> i64 {
  -1
}

/// When per-service configuration is pushed to a node's services.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigureMode {
  /// Once per dataset, during node setup.
  #[default]
  Dataset,
  /// Per file; setup skips the push and the feeding loop drives it.
  File,
}

/// Configuration for one reconstruction run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrchestratorConfig {
  /// Session name, used in logs and reports.
  pub session: String,
  /// Directory the readers open input files from.
  pub input_dir: PathBuf,
  /// Directory the writers create output files in.
  pub output_dir: PathBuf,
  /// Upper bound on concurrent window slots per node.
  #[serde(default = "default_max_cores")]
  pub max_cores: u32,
  /// Leading events to skip in every opened file.
  #[serde(default)]
  pub skip_events: i64,
  /// Maximum events to process per file; negative means all.
  #[serde(default = "default_max_events")]
  pub max_events: i64,
  /// Progress report frequency in events; zero disables reporting.
  #[serde(default)]
  pub report_frequency: u64,
  /// When per-service configuration is pushed.
  #[serde(default)]
  pub configure_mode: ConfigureMode,
  /// Name of the node hosting the monitoring front end, if any.
  #[serde(default)]
  pub monitor_front_end: Option<String>,
  /// Marker file checked (best-effort, informational only) at shutdown.
  #[serde(default)]
  pub stale_pid_file: Option<PathBuf>,
}

impl OrchestratorConfig {
  /// Creates a configuration with defaults for everything but the session
  /// name and data directories.
  #[must_use]
  pub fn new(
    session: impl Into<String>,
    input_dir: impl Into<PathBuf>,
    output_dir: impl Into<PathBuf>,
  ) -> Self {
    Self {
      session: session.into(),
      input_dir: input_dir.into(),
      output_dir: output_dir.into(),
      max_cores: default_max_cores(),
      skip_events: 0,
      max_events: default_max_events(),
      report_frequency: 0,
      configure_mode: ConfigureMode::default(),
      monitor_front_end: None,
      stale_pid_file: None,
    }
  }
}
