//! Test suite for the in-process bus: fan-out, request/reply and timeouts.

use crate::bus::{BusError, LocalBus, MessageBus, Responder, Topic};
use crate::message::Message;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Responder that echoes the request payload back with a description.
struct EchoResponder;

#[async_trait]
impl Responder for EchoResponder {
  async fn respond(&self, request: Message) -> Message {
    request.with_description("echo")
  }
}

/// Responder that never answers in time.
struct SlowResponder;

#[async_trait]
impl Responder for SlowResponder {
  async fn respond(&self, request: Message) -> Message {
    tokio::time::sleep(Duration::from_secs(60)).await;
    request
  }
}

#[tokio::test]
async fn publish_fans_out_to_all_subscribers() {
  let bus = LocalBus::new();
  let topic = Topic::new("node/reader");
  let mut first = bus.subscribe(&topic).await.unwrap();
  let mut second = bus.subscribe(&topic).await.unwrap();

  bus
    .publish(&topic, Message::text("next").with_communication_id(1))
    .await
    .unwrap();

  assert_eq!(first.recv().await.unwrap().communication_id(), 1);
  assert_eq!(second.recv().await.unwrap().communication_id(), 1);
}

#[tokio::test]
async fn publish_is_scoped_to_its_topic() {
  let bus = LocalBus::new();
  let mut reader = bus.subscribe(&Topic::new("node/reader")).await.unwrap();
  let mut writer = bus.subscribe(&Topic::new("node/writer")).await.unwrap();

  bus
    .publish(&Topic::new("node/reader"), Message::text("next"))
    .await
    .unwrap();

  assert!(reader.recv().await.is_some());
  assert!(writer.try_recv().is_err());
}

#[tokio::test]
async fn request_reply_round_trips_through_the_responder() {
  let bus = LocalBus::new();
  let topic = Topic::new("node/reader");
  bus.register_responder(&topic, Arc::new(EchoResponder));

  let reply = bus
    .request(
      &topic,
      Message::text("count").with_communication_id(9),
      Duration::from_secs(1),
    )
    .await
    .unwrap();
  assert_eq!(reply.description(), "echo");
  assert_eq!(reply.communication_id(), 9);
}

#[tokio::test]
async fn request_without_responder_fails() {
  let bus = LocalBus::new();
  let result = bus
    .request(
      &Topic::new("nowhere"),
      Message::text("next"),
      Duration::from_millis(100),
    )
    .await;
  assert!(matches!(result, Err(BusError::NoResponder(_))));
}

#[tokio::test]
async fn request_converts_expiry_into_timeout_error() {
  let bus = LocalBus::new();
  let topic = Topic::new("node/slow");
  bus.register_responder(&topic, Arc::new(SlowResponder));

  let result = bus
    .request(&topic, Message::text("next"), Duration::from_millis(20))
    .await;
  assert!(matches!(result, Err(BusError::Timeout(_))));
}

#[tokio::test]
async fn dropped_subscribers_are_pruned() {
  let bus = LocalBus::new();
  let topic = Topic::new("node/reader");
  let dropped = bus.subscribe(&topic).await.unwrap();
  drop(dropped);
  let mut live = bus.subscribe(&topic).await.unwrap();

  // Publishing past a dropped receiver neither fails nor loses the message
  // for the live one.
  bus.publish(&topic, Message::text("next")).await.unwrap();
  assert!(live.recv().await.is_some());
}

#[test]
fn control_topics_derive_from_the_node_name() {
  assert_eq!(Topic::errors("worker-1").as_str(), "worker-1/errors");
  assert_eq!(Topic::credits("worker-1").as_str(), "worker-1/credits");
}
