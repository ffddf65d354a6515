//! Reader-side event window: state machine and request service.
//!
//! The reader hands out event indices from a configured sub-range of an open
//! file, tracks which indices are still in flight, and decides when
//! end-of-stream has truly been reached across all outstanding window slots.
//!
//! # Window protocol
//!
//! - `next` opens a fresh slot: hand out `current_event`, remember it as in
//!   flight, advance the cursor.
//! - `next-rec` first acknowledges the carried correlation id (the writer has
//!   persisted that slot), then hands out a replacement event the same way.
//! - Once the cursor reaches the end of the range, replies become tiered
//!   [`EofSignal`]s: a plain `next` gets `Exhausted`; a `next-rec` gets
//!   `Draining` while sibling slots still hold unacknowledged events, and a
//!   counted `Confirmed(n)` once the in-flight set is empty.
//!
//! Within one open epoch the cursor only increases, so no index is ever
//! handed out twice.

use crate::bus::Responder;
use crate::message::{
  ConfigAction, ConfigRequest, EofSignal, Message, REQUEST_COUNT, REQUEST_NEXT, REQUEST_NEXT_REC,
  REQUEST_ORDER,
};
use crate::source::{EventSource, SourceFactory};
use async_trait::async_trait;
use mime::Mime;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, warn};

/// Severity used for request-local error replies (open errors, bad requests).
const ERROR_SEVERITY: i32 = 1;

/// Window over the dense index space of one open file.
///
/// Owned exclusively by one reader service instance and mutated only under
/// its lock. Created on file open and discarded on close; every open gets a
/// fresh epoch.
#[derive(Debug)]
pub struct ReaderWindow {
  /// Next index to hand out; monotonically increasing, never revisited.
  current_event: usize,
  /// Exclusive upper bound of the active range (`skip + max`).
  last_event: usize,
  /// Total indices available in the opened source.
  event_count: usize,
  /// Indices dispatched but not yet acknowledged by the writer side.
  processing_events: HashSet<usize>,
  /// Count of distinct terminal end-of-stream replies already issued.
  eof_request_count: u32,
}

impl ReaderWindow {
  /// Creates the window for a freshly opened source.
  ///
  /// `skip` is clamped to `[0, event_count]` and `max` to
  /// `[0, event_count - skip]`; out-of-range values are logged and clamped
  /// rather than failing the open. Absent bounds default to the full range.
  #[must_use]
  pub fn new(event_count: usize, skip: Option<i64>, max: Option<i64>) -> Self {
    let skip = match skip {
      None => 0,
      Some(s) if s < 0 => {
        warn!(skip = s, "negative skip, using 0");
        0
      }
      Some(s) if s as usize > event_count => {
        warn!(skip = s, event_count, "skip beyond event count, clamping");
        event_count
      }
      Some(s) => s as usize,
    };
    let available = event_count - skip;
    let max = match max {
      None => available,
      Some(m) if m < 0 => {
        warn!(max = m, "negative max, using full remaining range");
        available
      }
      Some(m) if m as usize > available => {
        warn!(max = m, available, "max beyond remaining range, clamping");
        available
      }
      Some(m) => m as usize,
    };
    Self {
      current_event: skip,
      last_event: skip + max,
      event_count,
      processing_events: HashSet::new(),
      eof_request_count: 0,
    }
  }

  /// Next index the window would hand out.
  #[must_use]
  pub fn current_event(&self) -> usize {
    self.current_event
  }

  /// Exclusive upper bound of the active range.
  #[must_use]
  pub fn last_event(&self) -> usize {
    self.last_event
  }

  /// Total indices available in the opened source.
  #[must_use]
  pub fn event_count(&self) -> usize {
    self.event_count
  }

  /// Number of dispatched, unacknowledged indices.
  #[must_use]
  pub fn in_flight(&self) -> usize {
    self.processing_events.len()
  }

  /// Count of terminal EOF replies issued so far.
  #[must_use]
  pub fn eof_request_count(&self) -> u32 {
    self.eof_request_count
  }

  /// Removes an acknowledged index from the in-flight set. Returns false if
  /// the index was not in flight.
  pub fn acknowledge(&mut self, index: usize) -> bool {
    self.processing_events.remove(&index)
  }

  /// Hands out the next index, or `None` once the range is exhausted.
  pub fn dispatch(&mut self) -> Option<usize> {
    if self.current_event < self.last_event {
      let index = self.current_event;
      self.current_event += 1;
      self.processing_events.insert(index);
      Some(index)
    } else {
      None
    }
  }

  /// Produces the tiered EOF signal for an exhausted range.
  ///
  /// `replenish` distinguishes a `next-rec` probe (part of the drain
  /// accounting) from a plain `next` probe (not counted).
  pub fn eof(&mut self, replenish: bool) -> EofSignal {
    if !replenish {
      EofSignal::Exhausted
    } else if !self.processing_events.is_empty() {
      EofSignal::Draining
    } else {
      self.eof_request_count += 1;
      EofSignal::Confirmed(self.eof_request_count)
    }
  }
}

/// Per-open state owned by the reader service.
struct ReaderState {
  file: Option<PathBuf>,
  source: Option<Box<dyn EventSource>>,
  window: Option<ReaderWindow>,
  open_error: Option<String>,
}

impl ReaderState {
  fn clear(&mut self) {
    self.file = None;
    self.source = None;
    self.window = None;
  }
}

/// Reader stage service: owns the event source and its window, and serves
/// the `next`/`next-rec`/`order`/`count` request vocabulary plus JSON
/// `open`/`close` configuration.
pub struct ReaderService {
  state: Mutex<ReaderState>,
  factory: Arc<dyn SourceFactory>,
  data_type: Mime,
}

impl ReaderService {
  /// Creates a reader service opening sources through the given factory and
  /// tagging event payloads with the given mime type.
  #[must_use]
  pub fn new(factory: Arc<dyn SourceFactory>, data_type: Mime) -> Self {
    Self {
      state: Mutex::new(ReaderState {
        file: None,
        source: None,
        window: None,
        open_error: None,
      }),
      factory,
      data_type,
    }
  }

  /// Opens a file, force-closing any previously open one first.
  ///
  /// A source-construction failure clears the file state and caches an
  /// open-error message returned on subsequent requests; the reply reports
  /// the failure but the service stays usable.
  pub fn open(&self, file: &Path, skip: Option<i64>, max: Option<i64>) -> Message {
    let mut state = self.state.lock().expect("reader state lock poisoned");
    if let Some(previous) = state.file.take() {
      debug!(file = %previous.display(), "force-closing previously open file");
      state.clear();
    }
    match self.factory.open(file) {
      Ok(source) => {
        let window = ReaderWindow::new(source.event_count(), skip, max);
        state.file = Some(file.to_path_buf());
        state.source = Some(source);
        state.window = Some(window);
        state.open_error = None;
        Message::text("").with_description(format!("opened {}", file.display()))
      }
      Err(e) => {
        let description = format!("failed to open {}: {}", file.display(), e);
        error!("{}", description);
        state.clear();
        state.open_error = Some(description.clone());
        Message::error(description, ERROR_SEVERITY)
      }
    }
  }

  /// Closes the open file. Idempotent; closing with nothing open logs an
  /// error but succeeds.
  pub fn close(&self, file: &Path) -> Message {
    let mut state = self.state.lock().expect("reader state lock poisoned");
    if state.file.is_none() {
      error!(file = %file.display(), "close requested but no file is open");
      return Message::text("").with_description("no file was open");
    }
    state.clear();
    state.open_error = None;
    Message::text("").with_description(format!("closed {}", file.display()))
  }

  /// Force-closes any open file (service reset).
  pub fn reset(&self) {
    let mut state = self.state.lock().expect("reader state lock poisoned");
    state.clear();
    state.open_error = None;
  }

  /// Force-closes any open file (service teardown).
  pub fn destroy(&self) {
    self.reset();
  }

  fn handle_next(&self, replenish: bool, id: i64) -> Message {
    let mut guard = self.state.lock().expect("reader state lock poisoned");
    let state = &mut *guard;
    if let Some(err) = &state.open_error {
      return Message::error(err.clone(), ERROR_SEVERITY).with_communication_id(id);
    }
    let (Some(source), Some(window)) = (state.source.as_mut(), state.window.as_mut()) else {
      return Message::error("no file open", ERROR_SEVERITY).with_communication_id(id);
    };
    if replenish && id >= 0 {
      window.acknowledge(id as usize);
    }
    match window.dispatch() {
      Some(index) => match source.read_event(index) {
        Ok(payload) => {
          Message::data(self.data_type.clone(), payload).with_communication_id(index as i64)
        }
        Err(e) => {
          // The failed index stays in flight until its replay next-rec
          // acknowledges it.
          Message::error(format!("failed to read event {}: {}", index, e), ERROR_SEVERITY)
            .with_communication_id(index as i64)
        }
      },
      None => Message::eof(window.eof(replenish)).with_communication_id(id),
    }
  }

  fn handle_order(&self) -> Message {
    let state = self.state.lock().expect("reader state lock poisoned");
    if let Some(err) = &state.open_error {
      return Message::error(err.clone(), ERROR_SEVERITY);
    }
    match state.source.as_ref() {
      Some(source) => Message::text(source.byte_order().to_string()),
      None => Message::error("no file open", ERROR_SEVERITY),
    }
  }

  fn handle_count(&self) -> Message {
    let state = self.state.lock().expect("reader state lock poisoned");
    if let Some(err) = &state.open_error {
      return Message::error(err.clone(), ERROR_SEVERITY);
    }
    match state.source.as_ref() {
      Some(source) => Message::text(source.event_count().to_string()),
      None => Message::error("no file open", ERROR_SEVERITY),
    }
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
        Some(file) => self.open(&file, config.skip, config.max),
        None => Message::error("open request carries no file", ERROR_SEVERITY),
      },
      ConfigAction::Close => match config.file {
        Some(file) => self.close(&file),
        None => Message::error("close request carries no file", ERROR_SEVERITY),
      },
      ConfigAction::Skip => Message::error("skip is a writer-side action", ERROR_SEVERITY),
    }
  }
}

#[async_trait]
impl Responder for ReaderService {
  async fn respond(&self, request: Message) -> Message {
    if request.is_config() {
      return self.handle_config(&request);
    }
    let id = request.communication_id();
    match request.text_payload() {
      Some(REQUEST_NEXT) => self.handle_next(false, id),
      Some(REQUEST_NEXT_REC) => self.handle_next(true, id),
      Some(REQUEST_ORDER) => self.handle_order(),
      Some(REQUEST_COUNT) => self.handle_count(),
      other => Message::error(
        format!("unknown reader request: {:?}", other.unwrap_or("<binary>")),
        ERROR_SEVERITY,
      )
      .with_communication_id(id),
    }
  }
}
