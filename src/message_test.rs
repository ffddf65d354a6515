//! Test suite for the message envelope and the EOF sentinel encoding.

use crate::message::{
  ConfigAction, ConfigRequest, EofSignal, Message, REQUEST_NEXT, STATE_EOF, Status,
};
use bytes::Bytes;

#[test]
fn status_carries_severity() {
  assert_eq!(Status::Info.severity(), 0);
  assert_eq!(Status::Warning(2).severity(), 2);
  assert_eq!(Status::Error(5).severity(), 5);
  assert!(Status::Error(1).is_error());
  assert!(!Status::Warning(1).is_error());
}

#[test]
fn eof_sentinels_round_trip() {
  for signal in [
    EofSignal::Exhausted,
    EofSignal::Draining,
    EofSignal::Confirmed(1),
    EofSignal::Confirmed(7),
  ] {
    assert_eq!(EofSignal::from_sentinel(signal.sentinel()), Some(signal));
  }
  // Sentinels below -1 decode to nothing.
  assert_eq!(EofSignal::from_sentinel(-2), None);
}

#[test]
fn eof_messages_decode_only_with_the_eof_state() {
  let eof = Message::eof(EofSignal::Draining);
  assert_eq!(eof.state(), STATE_EOF);
  assert_eq!(eof.eof_signal(), Some(EofSignal::Draining));
  assert!(eof.status().is_error());

  // A plain error with the same severity is not an EOF reply.
  let error = Message::error("boom", -1);
  assert_eq!(error.eof_signal(), None);
}

#[test]
fn request_messages_match_their_vocabulary() {
  let request = Message::text(REQUEST_NEXT).with_communication_id(3);
  assert!(request.is_request(REQUEST_NEXT));
  assert!(!request.is_request("count"));
  assert_eq!(request.communication_id(), 3);

  let data = Message::data(mime::APPLICATION_JSON, Bytes::from(r#"{"n":1}"#));
  assert!(!data.is_request(REQUEST_NEXT));
  assert!(data.is_config());
}

#[test]
fn config_requests_use_the_json_wire_shape() {
  let open = ConfigRequest::open("/data/run.jsonl", Some(10), Some(500));
  let message = open.to_message();
  assert!(message.is_config());

  let value: serde_json::Value = serde_json::from_slice(message.payload()).unwrap();
  assert_eq!(value["action"], "open");
  assert_eq!(value["file"], "/data/run.jsonl");
  assert_eq!(value["skip"], 10);
  assert_eq!(value["max"], 500);

  let decoded = ConfigRequest::from_message(&message).unwrap();
  assert_eq!(decoded, open);
}

#[test]
fn config_requests_omit_absent_bounds() {
  let close = ConfigRequest::close("/data/run.jsonl");
  assert_eq!(close.action, ConfigAction::Close);
  let value: serde_json::Value =
    serde_json::from_slice(close.to_message().payload()).unwrap();
  assert!(value.get("skip").is_none());
  assert!(value.get("max").is_none());

  let skip = ConfigRequest::skip_all();
  let value: serde_json::Value =
    serde_json::from_slice(skip.to_message().payload()).unwrap();
  assert_eq!(value["action"], "skip");
  assert!(value.get("file").is_none());
}
