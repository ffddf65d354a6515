//! Message envelope types for the reconstruction bus protocol.
//!
//! Every exchange on the bus — windowed event requests, event payloads,
//! configuration pushes and error notifications — travels as a [`Message`]:
//! a mime-typed payload plus a free-text description, a [`Status`] with a
//! severity integer, a sender-assigned state label and an integer
//! correlation id (`communication_id`). The correlation id doubles as the
//! in-flight event index for windowed requests.
//!
//! # Overview
//!
//! The core types are:
//!
//! - [`Message`]: the envelope carried over the bus
//! - [`Status`]: `Info`/`Warning`/`Error` plus a severity integer
//! - [`EofSignal`]: the tiered end-of-stream sentinel
//! - [`ConfigRequest`]: JSON-bodied `open`/`close`/`skip` service configuration
//!
//! # Example
//!
//! ```rust
//! use reconflow::message::{EofSignal, Message, REQUEST_NEXT};
//!
//! // A windowed request for slot 3
//! let req = Message::text(REQUEST_NEXT).with_communication_id(3);
//! assert!(req.is_request(REQUEST_NEXT));
//!
//! // A terminal EOF acknowledgment, second of its kind
//! let eof = Message::eof(EofSignal::Confirmed(2));
//! assert_eq!(eof.eof_signal(), Some(EofSignal::Confirmed(2)));
//! ```

use bytes::Bytes;
use mime::Mime;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::path::PathBuf;

/// Request string asking the reader for the next event in a fresh slot.
pub const REQUEST_NEXT: &str = "next";

/// Request string that acknowledges a drained slot and asks for a replacement
/// event. Also used as the writer's replenish-credit reply payload.
pub const REQUEST_NEXT_REC: &str = "next-rec";

/// Read-only query for the byte order of the open file.
pub const REQUEST_ORDER: &str = "order";

/// Read-only query for the total event count of the open file.
pub const REQUEST_COUNT: &str = "count";

/// State label set on reader end-of-stream replies.
pub const STATE_EOF: &str = "eof";

/// State label marking an event the writer should discard without persisting.
pub const STATE_SKIP: &str = "skip";

/// Status of a message: an outcome class plus a severity integer.
///
/// `Info` replies carry no severity; `Warning` and `Error` carry the
/// sender-assigned severity. Reader EOF replies reuse the `Error` severity
/// slot for the [`EofSignal`] sentinel.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Status {
  /// Normal reply.
  Info,
  /// Degraded but usable reply, with severity.
  Warning(i32),
  /// Failed request or end-of-stream sentinel, with severity.
  Error(i32),
}

impl Status {
  /// Returns the severity integer (0 for `Info`).
  #[must_use]
  pub const fn severity(&self) -> i32 {
    match self {
      Status::Info => 0,
      Status::Warning(s) | Status::Error(s) => *s,
    }
  }

  /// Returns true if this is an `Error` status.
  #[must_use]
  pub const fn is_error(&self) -> bool {
    matches!(self, Status::Error(_))
  }
}

impl Display for Status {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    match self {
      Status::Info => write!(f, "INFO"),
      Status::Warning(s) => write!(f, "WARNING({})", s),
      Status::Error(s) => write!(f, "ERROR({})", s),
    }
  }
}

/// Tiered end-of-stream signal returned by the reader once its window range
/// is exhausted.
///
/// A node opens several concurrent slots against one reader, so a single EOF
/// reply would race: a slot finishing early must not declare the file done
/// while sibling slots still hold in-flight events that may yet fail and be
/// replayed. The three tiers close that race:
///
/// - [`Exhausted`](EofSignal::Exhausted) (`0`): range exhausted, reply to a
///   plain `next` probe — not part of the drain accounting.
/// - [`Draining`](EofSignal::Draining) (`-1`): range exhausted but sibling
///   slots still have unacknowledged events; do not finalize yet.
/// - [`Confirmed(n)`](EofSignal::Confirmed) (`n > 0`): the `n`-th distinct
///   terminal acknowledgment; when `n` reaches the opened slot count every
///   slot has observed terminal EOF.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EofSignal {
  /// Range exhausted; reply to a plain `next` request.
  Exhausted,
  /// Range exhausted but other slots are still draining.
  Draining,
  /// The n-th distinct terminal end-of-stream acknowledgment.
  Confirmed(u32),
}

impl EofSignal {
  /// Returns the integer sentinel carried as the reply severity.
  #[must_use]
  pub const fn sentinel(&self) -> i32 {
    match self {
      EofSignal::Exhausted => 0,
      EofSignal::Draining => -1,
      EofSignal::Confirmed(n) => *n as i32,
    }
  }

  /// Decodes a sentinel integer back into a signal.
  #[must_use]
  pub fn from_sentinel(sentinel: i32) -> Option<Self> {
    match sentinel {
      0 => Some(EofSignal::Exhausted),
      -1 => Some(EofSignal::Draining),
      n if n > 0 => Some(EofSignal::Confirmed(n as u32)),
      _ => None,
    }
  }
}

impl Display for EofSignal {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    match self {
      EofSignal::Exhausted => write!(f, "eof:exhausted"),
      EofSignal::Draining => write!(f, "eof:draining"),
      EofSignal::Confirmed(n) => write!(f, "eof:confirmed({})", n),
    }
  }
}

/// The envelope carried over the bus.
///
/// Construction goes through the [`data`](Message::data),
/// [`text`](Message::text), [`error`](Message::error) and
/// [`eof`](Message::eof) constructors plus the `with_*` builders; fields are
/// read through accessors so the envelope stays internally consistent.
#[derive(Clone, Debug)]
pub struct Message {
  mime_type: Mime,
  description: String,
  status: Status,
  state: String,
  communication_id: i64,
  payload: Bytes,
}

impl Message {
  /// Creates a data message with the given payload type and bytes.
  #[must_use]
  pub fn data(mime_type: Mime, payload: Bytes) -> Self {
    Self {
      mime_type,
      description: String::new(),
      status: Status::Info,
      state: String::new(),
      communication_id: 0,
      payload,
    }
  }

  /// Creates a plain-text message (requests, simple replies).
  #[must_use]
  pub fn text(text: impl Into<String>) -> Self {
    Self::data(mime::TEXT_PLAIN, Bytes::from(text.into()))
  }

  /// Creates an error reply with the given description and severity.
  #[must_use]
  pub fn error(description: impl Into<String>, severity: i32) -> Self {
    Self {
      mime_type: mime::TEXT_PLAIN,
      description: description.into(),
      status: Status::Error(severity),
      state: String::new(),
      communication_id: 0,
      payload: Bytes::new(),
    }
  }

  /// Creates a reader end-of-stream reply carrying the sentinel as severity.
  #[must_use]
  pub fn eof(signal: EofSignal) -> Self {
    Self::error(signal.to_string(), signal.sentinel()).with_state(STATE_EOF)
  }

  /// Sets the correlation id linking this message to its reply or error.
  #[must_use]
  pub fn with_communication_id(mut self, id: i64) -> Self {
    self.communication_id = id;
    self
  }

  /// Sets the sender-assigned state label.
  #[must_use]
  pub fn with_state(mut self, state: impl Into<String>) -> Self {
    self.state = state.into();
    self
  }

  /// Sets the free-text description.
  #[must_use]
  pub fn with_description(mut self, description: impl Into<String>) -> Self {
    self.description = description.into();
    self
  }

  /// Returns the payload mime type.
  #[must_use]
  pub fn mime_type(&self) -> &Mime {
    &self.mime_type
  }

  /// Returns the free-text description.
  #[must_use]
  pub fn description(&self) -> &str {
    &self.description
  }

  /// Returns the message status.
  #[must_use]
  pub fn status(&self) -> Status {
    self.status
  }

  /// Returns the sender-assigned state label.
  #[must_use]
  pub fn state(&self) -> &str {
    &self.state
  }

  /// Returns the correlation id.
  #[must_use]
  pub fn communication_id(&self) -> i64 {
    self.communication_id
  }

  /// Returns the raw payload bytes.
  #[must_use]
  pub fn payload(&self) -> &Bytes {
    &self.payload
  }

  /// Returns the payload as UTF-8 text, if it is valid UTF-8.
  #[must_use]
  pub fn text_payload(&self) -> Option<&str> {
    std::str::from_utf8(&self.payload).ok()
  }

  /// Returns true if this is a plain-text message whose payload equals the
  /// given request string.
  #[must_use]
  pub fn is_request(&self, request: &str) -> bool {
    self.mime_type == mime::TEXT_PLAIN && self.text_payload() == Some(request)
  }

  /// Returns true if this is a JSON configuration message.
  #[must_use]
  pub fn is_config(&self) -> bool {
    self.mime_type == mime::APPLICATION_JSON
  }

  /// Decodes the end-of-stream sentinel, if this is an EOF reply.
  #[must_use]
  pub fn eof_signal(&self) -> Option<EofSignal> {
    if self.state != STATE_EOF {
      return None;
    }
    EofSignal::from_sentinel(self.status.severity())
  }
}

/// Configuration action carried in a [`ConfigRequest`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigAction {
  /// Open a file for reading or writing.
  Open,
  /// Close the currently open file.
  Close,
  /// Put the writer into discard-everything mode.
  Skip,
}

/// JSON-bodied configuration request sent to reader and writer services.
///
/// Serialized as `{action, file, skip, max}`; absent fields are omitted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfigRequest {
  /// The action to perform.
  pub action: ConfigAction,
  /// Target file for `open`/`close`.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub file: Option<PathBuf>,
  /// Number of leading events to skip when opening a reader.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub skip: Option<i64>,
  /// Maximum number of events to process when opening a reader.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub max: Option<i64>,
}

impl ConfigRequest {
  /// Builds an `open` request with the given event-range bounds.
  #[must_use]
  pub fn open(file: impl Into<PathBuf>, skip: Option<i64>, max: Option<i64>) -> Self {
    Self {
      action: ConfigAction::Open,
      file: Some(file.into()),
      skip,
      max,
    }
  }

  /// Builds a `close` request for the given file.
  #[must_use]
  pub fn close(file: impl Into<PathBuf>) -> Self {
    Self {
      action: ConfigAction::Close,
      file: Some(file.into()),
      skip: None,
      max: None,
    }
  }

  /// Builds a `skip` request putting the writer into discard mode.
  #[must_use]
  pub fn skip_all() -> Self {
    Self {
      action: ConfigAction::Skip,
      file: None,
      skip: None,
      max: None,
    }
  }

  /// Encodes this request as a JSON bus message.
  #[must_use]
  pub fn to_message(&self) -> Message {
    let body = serde_json::to_vec(self).expect("config request serializes");
    Message::data(mime::APPLICATION_JSON, Bytes::from(body))
  }

  /// Decodes a configuration request from a JSON bus message.
  pub fn from_message(message: &Message) -> Result<Self, serde_json::Error> {
    serde_json::from_slice(message.payload())
  }
}
