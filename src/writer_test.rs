//! Test suite for the writer window state machine and service.
//!
//! Covers skip mode gating, the replenish credit, type mismatch handling,
//! open-error caching and the flush-only-if-written close rule.

use crate::bus::Responder;
use crate::message::{ConfigRequest, Message, REQUEST_NEXT_REC, STATE_SKIP};
use crate::sink::{EventSink, SinkError, SinkFactory};
use crate::writer::WriterService;
use bytes::Bytes;
use std::path::Path;
use std::sync::{Arc, Mutex};

// ============================================================================
// Mock Sinks
// ============================================================================

/// Shared recording of everything a mock sink saw.
#[derive(Default)]
struct SinkLog {
  written: Vec<Vec<u8>>,
  flushes: usize,
}

struct MockSink {
  log: Arc<Mutex<SinkLog>>,
}

impl EventSink for MockSink {
  fn write_event(&mut self, payload: &[u8]) -> Result<(), SinkError> {
    self
      .log
      .lock()
      .expect("sink log poisoned")
      .written
      .push(payload.to_vec());
    Ok(())
  }

  fn flush(&mut self) -> Result<(), SinkError> {
    self.log.lock().expect("sink log poisoned").flushes += 1;
    Ok(())
  }
}

#[derive(Default)]
struct MockSinkFactory {
  log: Arc<Mutex<SinkLog>>,
}

impl SinkFactory for MockSinkFactory {
  fn create(&self, _path: &Path) -> Result<Box<dyn EventSink>, SinkError> {
    Ok(Box::new(MockSink {
      log: self.log.clone(),
    }))
  }
}

/// Factory whose creates always fail.
struct BrokenSinkFactory;

impl SinkFactory for BrokenSinkFactory {
  fn create(&self, _path: &Path) -> Result<Box<dyn EventSink>, SinkError> {
    Err(SinkError::Io(std::io::Error::new(
      std::io::ErrorKind::PermissionDenied,
      "read-only file system",
    )))
  }
}

fn writer_with_log() -> (WriterService, Arc<Mutex<SinkLog>>) {
  let factory = Arc::new(MockSinkFactory::default());
  let log = factory.log.clone();
  (
    WriterService::new(factory, mime::APPLICATION_JSON),
    log,
  )
}

fn event(id: i64, body: &str) -> Message {
  Message::data(mime::APPLICATION_JSON, Bytes::from(body.to_owned())).with_communication_id(id)
}

// ============================================================================
// Execute and the replenish credit
// ============================================================================

#[tokio::test]
async fn execute_persists_and_replies_with_credit() {
  let (writer, log) = writer_with_log();
  writer.open(Path::new("/out/run.jsonl"));

  let reply = writer.execute(&event(5, r#"{"n":5}"#));
  assert!(reply.is_request(REQUEST_NEXT_REC));
  assert_eq!(reply.communication_id(), 5);
  assert_eq!(writer.events_written(), 1);
  assert_eq!(log.lock().unwrap().written.len(), 1);
}

#[tokio::test]
async fn execute_rejects_type_mismatch() {
  let (writer, log) = writer_with_log();
  writer.open(Path::new("/out/run.jsonl"));

  let wrong = Message::text("not an event").with_communication_id(2);
  let reply = writer.execute(&wrong);
  assert!(reply.status().is_error());
  assert!(reply.description().contains("type mismatch"));
  assert!(log.lock().unwrap().written.is_empty());
}

#[tokio::test]
async fn execute_without_open_returns_cached_error() {
  let writer = WriterService::new(Arc::new(BrokenSinkFactory), mime::APPLICATION_JSON);
  let reply = writer.open(Path::new("/out/run.jsonl"));
  assert!(reply.status().is_error());

  let reply = writer.execute(&event(1, r#"{"n":1}"#));
  assert!(reply.status().is_error());
  assert!(reply.description().contains("failed to open"));
}

#[tokio::test]
async fn execute_skips_marked_events_without_writing() {
  let (writer, log) = writer_with_log();
  writer.open(Path::new("/out/run.jsonl"));

  let skip = event(3, r#"{"n":3}"#).with_state(STATE_SKIP);
  let reply = writer.execute(&skip);
  assert!(reply.is_request(REQUEST_NEXT_REC));
  assert_eq!(reply.communication_id(), 3);
  assert!(log.lock().unwrap().written.is_empty());
  assert_eq!(writer.events_written(), 0);
}

// ============================================================================
// Skip-all mode
// ============================================================================

#[tokio::test]
async fn skip_all_discards_everything_without_a_file() {
  let (writer, log) = writer_with_log();
  let reply = writer.skip_all();
  assert!(!reply.status().is_error());

  for id in 0..4 {
    let reply = writer.execute(&event(id, r#"{"n":0}"#));
    assert!(reply.is_request(REQUEST_NEXT_REC));
    assert_eq!(reply.communication_id(), id);
  }
  assert!(log.lock().unwrap().written.is_empty());
}

#[tokio::test]
async fn skip_all_is_rejected_while_a_file_is_open() {
  let (writer, log) = writer_with_log();
  writer.open(Path::new("/out/run.jsonl"));

  let reply = writer.skip_all();
  assert!(reply.status().is_error());

  // State unchanged: events still get written.
  writer.execute(&event(0, r#"{"n":0}"#));
  assert_eq!(log.lock().unwrap().written.len(), 1);
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn close_flushes_only_if_something_was_written() {
  let (writer, log) = writer_with_log();

  writer.open(Path::new("/out/a.jsonl"));
  writer.close(Path::new("/out/a.jsonl"));
  assert_eq!(log.lock().unwrap().flushes, 0);

  writer.open(Path::new("/out/b.jsonl"));
  writer.execute(&event(0, r#"{"n":0}"#));
  writer.close(Path::new("/out/b.jsonl"));
  assert_eq!(log.lock().unwrap().flushes, 1);
  assert_eq!(writer.events_written(), 0);
}

#[tokio::test]
async fn close_with_nothing_open_is_a_logged_noop() {
  let (writer, _log) = writer_with_log();
  let reply = writer.close(Path::new("/out/a.jsonl"));
  assert!(!reply.status().is_error());
}

#[tokio::test]
async fn reopen_flushes_previous_output_and_resets_counter() {
  let (writer, log) = writer_with_log();
  writer.open(Path::new("/out/a.jsonl"));
  writer.execute(&event(0, r#"{"n":0}"#));
  assert_eq!(writer.events_written(), 1);

  writer.open(Path::new("/out/b.jsonl"));
  assert_eq!(log.lock().unwrap().flushes, 1);
  assert_eq!(writer.events_written(), 0);
}

#[tokio::test]
async fn config_requests_drive_the_lifecycle() {
  let (writer, log) = writer_with_log();

  let reply = writer
    .respond(ConfigRequest::skip_all().to_message())
    .await;
  assert!(!reply.status().is_error());

  // Events are discarded while in skip mode.
  let reply = writer.respond(event(1, r#"{"n":1}"#)).await;
  assert!(reply.is_request(REQUEST_NEXT_REC));
  assert!(log.lock().unwrap().written.is_empty());

  // Opening a file leaves skip mode behind.
  let reply = writer
    .respond(ConfigRequest::open("/out/run.jsonl", None, None).to_message())
    .await;
  assert!(!reply.status().is_error());
  let reply = writer.respond(event(2, r#"{"n":2}"#)).await;
  assert!(reply.is_request(REQUEST_NEXT_REC));
  assert_eq!(log.lock().unwrap().written.len(), 1);
}

#[tokio::test]
async fn reset_closes_and_clears_skip_mode() {
  let (writer, log) = writer_with_log();
  writer.skip_all();
  writer.reset();

  // After reset, skip mode is gone and execute needs an open file again.
  let reply = writer.execute(&event(0, r#"{"n":0}"#));
  assert!(reply.status().is_error());
  assert!(log.lock().unwrap().written.is_empty());
}
