//! Event sinks for the writer service.
//!
//! An [`EventSink`] persists event payloads in whatever order the processing
//! chain completes them; the writer window tracks the persisted count and
//! drives flush/close. The built-in [`JsonlEventSink`] appends one JSON
//! record per line.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

/// Error type for event sink operations.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
  /// I/O or filesystem error.
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

/// Destination for persisted event records.
pub trait EventSink: Send {
  /// Appends one event payload.
  fn write_event(&mut self, payload: &[u8]) -> Result<(), SinkError>;

  /// Flushes buffered records to durable storage.
  fn flush(&mut self) -> Result<(), SinkError>;
}

/// Creates event sinks by path; the writer service holds one factory and
/// creates a fresh sink per file-open request.
pub trait SinkFactory: Send + Sync {
  /// Creates the sink backing the given output file, creating missing
  /// parent directories.
  fn create(&self, path: &Path) -> Result<Box<dyn EventSink>, SinkError>;
}

/// Event sink appending one JSON record per line.
pub struct JsonlEventSink {
  writer: BufWriter<File>,
}

impl JsonlEventSink {
  /// Creates the output file, along with any missing parent directories.
  pub fn create(path: &Path) -> Result<Self, SinkError> {
    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() {
        fs::create_dir_all(parent)?;
      }
    }
    Ok(Self {
      writer: BufWriter::new(File::create(path)?),
    })
  }
}

impl EventSink for JsonlEventSink {
  fn write_event(&mut self, payload: &[u8]) -> Result<(), SinkError> {
    self.writer.write_all(payload)?;
    self.writer.write_all(b"\n")?;
    Ok(())
  }

  fn flush(&mut self) -> Result<(), SinkError> {
    self.writer.flush()?;
    Ok(())
  }
}

/// Factory producing [`JsonlEventSink`] instances.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonlSinkFactory;

impl SinkFactory for JsonlSinkFactory {
  fn create(&self, path: &Path) -> Result<Box<dyn EventSink>, SinkError> {
    Ok(Box::new(JsonlEventSink::create(path)?))
  }
}
