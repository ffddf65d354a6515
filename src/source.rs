//! Event sources for the reader service.
//!
//! An [`EventSource`] exposes a dense index space `[0, event_count)` with
//! random access by index; the reader window hands indices out and the source
//! materializes the payloads. The built-in [`JsonlEventSource`] reads one
//! JSON event per line.

use bytes::Bytes;
use std::fmt::{self, Display, Formatter};
use std::fs;
use std::path::Path;

/// Byte order reported by the `order` query.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ByteOrder {
  /// Little-endian event data.
  LittleEndian,
  /// Big-endian event data.
  BigEndian,
}

impl ByteOrder {
  /// The byte order of the host platform.
  #[must_use]
  pub const fn native() -> Self {
    if cfg!(target_endian = "big") {
      ByteOrder::BigEndian
    } else {
      ByteOrder::LittleEndian
    }
  }
}

impl Display for ByteOrder {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    match self {
      ByteOrder::LittleEndian => write!(f, "LITTLE_ENDIAN"),
      ByteOrder::BigEndian => write!(f, "BIG_ENDIAN"),
    }
  }
}

/// Error type for event source operations.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
  /// I/O or filesystem error.
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
  /// An event record could not be parsed.
  #[error("malformed event at line {line}: {reason}")]
  Malformed {
    /// 1-based line number of the bad record.
    line: usize,
    /// Parse failure description.
    reason: String,
  },
  /// A requested index lies outside the source's event range.
  #[error("event index {index} out of range (count {count})")]
  OutOfRange {
    /// The requested index.
    index: usize,
    /// Total events in the source.
    count: usize,
  },
}

/// Random-access source of discrete event records.
pub trait EventSource: Send {
  /// Total number of events available.
  fn event_count(&self) -> usize;

  /// Byte order of the event data.
  fn byte_order(&self) -> ByteOrder;

  /// Reads the event at the given index.
  fn read_event(&mut self, index: usize) -> Result<Bytes, SourceError>;
}

/// Opens event sources by path; the reader service holds one factory and
/// opens a fresh source per file-open request.
pub trait SourceFactory: Send + Sync {
  /// Opens the source backing the given file.
  fn open(&self, path: &Path) -> Result<Box<dyn EventSource>, SourceError>;
}

/// Event source reading one JSON record per line.
///
/// The whole file is parsed up front so that `event_count` is exact and
/// index access is O(1); malformed lines fail the open rather than a later
/// read.
pub struct JsonlEventSource {
  events: Vec<Bytes>,
}

impl JsonlEventSource {
  /// Opens and fully indexes a JSON-lines event file.
  pub fn open(path: &Path) -> Result<Self, SourceError> {
    let contents = fs::read_to_string(path)?;
    let mut events = Vec::new();
    for (number, line) in contents.lines().enumerate() {
      let trimmed = line.trim();
      if trimmed.is_empty() {
        continue;
      }
      if let Err(e) = serde_json::from_str::<serde_json::Value>(trimmed) {
        return Err(SourceError::Malformed {
          line: number + 1,
          reason: e.to_string(),
        });
      }
      events.push(Bytes::from(trimmed.to_owned()));
    }
    Ok(Self { events })
  }
}

impl EventSource for JsonlEventSource {
  fn event_count(&self) -> usize {
    self.events.len()
  }

  fn byte_order(&self) -> ByteOrder {
    // JSON text carries no intrinsic endianness; report the host order so
    // the `order` query keeps its contract.
    ByteOrder::native()
  }

  fn read_event(&mut self, index: usize) -> Result<Bytes, SourceError> {
    self
      .events
      .get(index)
      .cloned()
      .ok_or(SourceError::OutOfRange {
        index,
        count: self.events.len(),
      })
  }
}

/// Factory producing [`JsonlEventSource`] instances.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonlSourceFactory;

impl SourceFactory for JsonlSourceFactory {
  fn open(&self, path: &Path) -> Result<Box<dyn EventSource>, SourceError> {
    Ok(Box::new(JsonlEventSource::open(path)?))
  }
}
