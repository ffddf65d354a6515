//! Writer-side event window: persisted-event accounting and file lifecycle.
//!
//! The writer persists whatever order the processing chain completes events
//! in, counts what it wrote, and answers every accepted event with the
//! replenish-credit signal that re-arms one reader window slot. A
//! `skip-all` mode discards events without touching the file system; it can
//! only be entered while no file is open.

use crate::bus::Responder;
use crate::message::{ConfigAction, ConfigRequest, Message, REQUEST_NEXT_REC, STATE_SKIP};
use crate::sink::{EventSink, SinkFactory};
use async_trait::async_trait;
use mime::Mime;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, error};

/// Severity used for request-local error replies.
const ERROR_SEVERITY: i32 = 1;

/// Per-open state owned by the writer service.
struct WriterState {
  file: Option<PathBuf>,
  sink: Option<Box<dyn EventSink>>,
  event_counter: u64,
  skip_events: bool,
  open_error: Option<String>,
}

impl WriterState {
  /// Flushes (only if something was written) and drops the open sink.
  fn flush_and_close(&mut self) {
    if let Some(mut sink) = self.sink.take() {
      if self.event_counter > 0 {
        if let Err(e) = sink.flush() {
          error!("flush on close failed: {}", e);
        }
      }
    }
    self.file = None;
    self.event_counter = 0;
  }
}

/// Writer stage service: owns the event sink, serves JSON
/// `open`/`close`/`skip` configuration and persists incoming events,
/// answering each with the replenish credit.
pub struct WriterService {
  state: Mutex<WriterState>,
  factory: Arc<dyn SinkFactory>,
  data_type: Mime,
}

impl WriterService {
  /// Creates a writer service creating sinks through the given factory and
  /// accepting events of the given mime type.
  #[must_use]
  pub fn new(factory: Arc<dyn SinkFactory>, data_type: Mime) -> Self {
    Self {
      state: Mutex::new(WriterState {
        file: None,
        sink: None,
        event_counter: 0,
        skip_events: false,
        open_error: None,
      }),
      factory,
      data_type,
    }
  }

  /// Opens an output file, flush-and-closing any previously open one first.
  /// Parent directories are created as needed.
  pub fn open(&self, file: &Path) -> Message {
    let mut state = self.state.lock().expect("writer state lock poisoned");
    if state.file.is_some() {
      debug!(file = ?state.file, "force-closing previously open output");
      state.flush_and_close();
    }
    match self.factory.create(file) {
      Ok(sink) => {
        state.file = Some(file.to_path_buf());
        state.sink = Some(sink);
        state.event_counter = 0;
        state.skip_events = false;
        state.open_error = None;
        Message::text("").with_description(format!("opened {}", file.display()))
      }
      Err(e) => {
        let description = format!("failed to open {}: {}", file.display(), e);
        error!("{}", description);
        state.flush_and_close();
        state.open_error = Some(description.clone());
        Message::error(description, ERROR_SEVERITY)
      }
    }
  }

  /// Closes the open output file. Flushes only if at least one event was
  /// written; closing with nothing open logs an error but succeeds.
  pub fn close(&self, file: &Path) -> Message {
    let mut state = self.state.lock().expect("writer state lock poisoned");
    if state.file.is_none() {
      error!(file = %file.display(), "close requested but no output is open");
      return Message::text("").with_description("no output was open");
    }
    state.flush_and_close();
    state.open_error = None;
    Message::text("").with_description(format!("closed {}", file.display()))
  }

  /// Enters discard-everything mode. Only legal while no file is open.
  pub fn skip_all(&self) -> Message {
    let mut state = self.state.lock().expect("writer state lock poisoned");
    if state.file.is_some() {
      return Message::error("cannot enter skip mode while an output is open", ERROR_SEVERITY);
    }
    state.skip_events = true;
    Message::text("").with_description("skip mode enabled")
  }

  /// Persists one event and replies with the replenish credit.
  pub fn execute(&self, event: &Message) -> Message {
    let id = event.communication_id();
    if *event.mime_type() != self.data_type {
      return Message::error(
        format!(
          "type mismatch: expected {}, got {}",
          self.data_type,
          event.mime_type()
        ),
        ERROR_SEVERITY,
      )
      .with_communication_id(id);
    }
    let mut state = self.state.lock().expect("writer state lock poisoned");
    if state.skip_events || event.state() == STATE_SKIP {
      return Self::replenish(id);
    }
    match state.sink.as_mut() {
      None => {
        let description = state
          .open_error
          .clone()
          .unwrap_or_else(|| "no output open".to_string());
        Message::error(description, ERROR_SEVERITY).with_communication_id(id)
      }
      Some(sink) => match sink.write_event(event.payload()) {
        Ok(()) => {
          state.event_counter += 1;
          Self::replenish(id)
        }
        Err(e) => Message::error(format!("failed to write event: {}", e), ERROR_SEVERITY)
          .with_communication_id(id),
      },
    }
  }

  /// Number of events persisted since the current open.
  #[must_use]
  pub fn events_written(&self) -> u64 {
    self.state.lock().expect("writer state lock poisoned").event_counter
  }

  /// Flush-and-closes if open (service reset).
  pub fn reset(&self) {
    let mut state = self.state.lock().expect("writer state lock poisoned");
    state.flush_and_close();
    state.skip_events = false;
    state.open_error = None;
  }

  /// Flush-and-closes if open (service teardown).
  pub fn destroy(&self) {
    self.reset();
  }

  /// The credit handed back to the node driver, which turns it into a
  /// `next-rec` request to the reader.
  fn replenish(id: i64) -> Message {
    Message::text(REQUEST_NEXT_REC).with_communication_id(id)
  }

  fn handle_config(&self, request: &Message) -> Message {
    let config = match ConfigRequest::from_message(request) {
      Ok(config) => config,
      Err(_) => {
        // Engine-specific configuration; nothing for the window to do.
        return match serde_json::from_slice::<serde_json::Value>(request.payload()) {
          Ok(_) => Message::text("").with_description("configuration accepted"),
          Err(e) => Message::error(format!("malformed config request: {}", e), ERROR_SEVERITY),
        };
      }
    };
    match config.action {
      ConfigAction::Open => match config.file {
        Some(file) => self.open(&file),
        None => Message::error("open request carries no file", ERROR_SEVERITY),
      },
      ConfigAction::Close => match config.file {
        Some(file) => self.close(&file),
        None => Message::error("close request carries no file", ERROR_SEVERITY),
      },
      ConfigAction::Skip => self.skip_all(),
    }
  }
}

#[async_trait]
impl Responder for WriterService {
  async fn respond(&self, request: Message) -> Message {
    if request.is_config() {
      return self.handle_config(&request);
    }
    self.execute(&request)
  }
}
