use super::Broker;
use super::message::Message;
use super::topic::TopicQueues;
use super::tracker::DeliveryTracker;
use crate::config::BrokerSettings;
use crate::persistence::MessageLog;
use crate::utils::error::CodecError;

use std::sync::Arc;
use std::time::Duration;
use tempfile::{TempDir, tempdir};

fn test_settings(dir: &TempDir) -> BrokerSettings {
    BrokerSettings {
        log_path: dir.path().join("broker.log").display().to_string(),
        ack_timeout_ms: 30_000,
        scan_interval_ms: 50,
        poll_wait_ms: 50,
        ..BrokerSettings::default()
    }
}

fn create_test_broker() -> (Broker, TempDir) {
    let dir = tempdir().unwrap();
    let broker = Broker::open(&test_settings(&dir)).unwrap();
    (broker, dir)
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[test]
fn test_message_round_trip_with_and_without_reply_fields() {
    let plain = Message::new("orders", "{\"qty\":3}");
    assert_eq!(Message::decode(&plain.encode()).unwrap(), plain);

    let request = Message::request("orders", "{\"qty\":3}", "corr-1", "reply.temp.abc");
    assert_eq!(Message::decode(&request.encode()).unwrap(), request);
}

#[test]
fn test_message_encodes_absent_fields_as_empty() {
    let mut msg = Message::new("orders", "body");
    msg.id = "m-1".to_string();
    assert_eq!(msg.encode(), "m-1:::orders:::body::::::");
    assert!(!msg.encode().contains("null"));
}

#[test]
fn test_message_empty_string_field_decodes_as_absent() {
    let mut msg = Message::new("orders", "body");
    msg.correlation_id = Some(String::new());
    let decoded = Message::decode(&msg.encode()).unwrap();
    assert_eq!(decoded.correlation_id, None);
}

#[test]
fn test_message_decodes_legacy_three_field_record() {
    let msg = Message::decode("m-1:::orders:::{\"a\":1}").unwrap();
    assert_eq!(msg.id, "m-1");
    assert_eq!(msg.topic, "orders");
    assert_eq!(msg.content, "{\"a\":1}");
    assert_eq!(msg.correlation_id, None);
    assert_eq!(msg.reply_to, None);
}

#[test]
fn test_message_content_may_contain_delimiter() {
    let request = Message::request("orders", "a:::b:::c", "corr", "reply");
    assert_eq!(Message::decode(&request.encode()).unwrap(), request);
}

#[test]
fn test_message_decode_rejects_short_records() {
    assert_eq!(
        Message::decode("only-one-field"),
        Err(CodecError::Malformed { fields: 1 })
    );
    assert_eq!(
        Message::decode("id:::topic"),
        Err(CodecError::Malformed { fields: 2 })
    );
    assert_eq!(
        Message::decode(":::topic:::body"),
        Err(CodecError::EmptyField("id"))
    );
}

#[test]
fn test_message_wire_safety_check() {
    assert!(Message::new("orders", "a:::b").check_wire_safe().is_ok());
    assert!(Message::new("or:::ders", "x").check_wire_safe().is_err());
    assert!(Message::new("orders", "line\nbreak").check_wire_safe().is_err());
    assert!(Message::new("", "x").check_wire_safe().is_err());
}

#[test]
fn test_message_rejects_colons_next_to_delimiter() {
    assert_eq!(
        Message::new("orders:", "body").check_wire_safe(),
        Err(CodecError::ReservedSequence {
            field: "topic",
            reserved: "trailing ':'",
        })
    );

    let mut msg = Message::new("orders", "body");
    msg.id = "m-1:".to_string();
    assert!(msg.check_wire_safe().is_err());

    let msg = Message::request("orders", "body", ":c", "reply");
    assert_eq!(
        msg.check_wire_safe(),
        Err(CodecError::ReservedSequence {
            field: "correlation_id",
            reserved: "leading ':'",
        })
    );
    assert!(
        Message::request("orders", "body", "c", ":reply")
            .check_wire_safe()
            .is_err()
    );

    let mut msg = Message::new("orders", "body");
    msg.correlation_id = Some(String::new());
    assert_eq!(
        msg.check_wire_safe(),
        Err(CodecError::EmptyField("correlation_id"))
    );
}

#[test]
fn test_message_wire_safe_values_round_trip() {
    let edge_values = ["a", ":", "a:", ":a", "a::", "::a", "a:b", "a:::b", ":::", ""];

    for value in edge_values {
        let mut variants = Vec::new();
        for field in 0..5 {
            let mut msg = Message::request("orders", "body", "corr", "reply");
            msg.id = "m-1".to_string();
            match field {
                0 => msg.id = value.to_string(),
                1 => msg.topic = value.to_string(),
                2 => msg.content = value.to_string(),
                3 => msg.correlation_id = Some(value.to_string()),
                _ => msg.reply_to = Some(value.to_string()),
            }
            variants.push(msg);
        }
        let mut plain = Message::new("orders", value);
        plain.id = "m-1".to_string();
        variants.push(plain);

        for msg in variants {
            if msg.check_wire_safe().is_ok() {
                assert_eq!(Message::decode(&msg.encode()).unwrap(), msg, "value {value:?}");
            }
        }
    }

    // Content is free-form, so every edge value must be accepted there
    for value in edge_values {
        let msg = Message::request("orders", value, "corr", "reply");
        assert!(msg.check_wire_safe().is_ok(), "content {value:?}");
    }
}

#[test]
fn test_topic_queues_fifo_and_lazy_creation() {
    let mut queues = TopicQueues::new();
    assert_eq!(queues.dequeue("orders"), None);

    let first = Message::new("orders", "1");
    let second = Message::new("orders", "2");
    queues.enqueue(first.clone());
    queues.enqueue(second.clone());
    queues.enqueue(Message::new("billing", "x"));

    assert_eq!(queues.len("orders"), 2);
    assert_eq!(queues.total_len(), 3);
    assert!(queues.contains("orders", &first.id));
    assert_eq!(queues.dequeue("orders"), Some(first));
    assert_eq!(queues.dequeue("orders"), Some(second));
    assert_eq!(queues.dequeue("orders"), None);
}

#[test]
fn test_topic_queues_prune_keeps_topics_with_waiters() {
    let mut queues = TopicQueues::new();
    queues.enqueue(Message::new("spent", "x"));
    queues.dequeue("spent");
    let _waiter = queues.notifier("watched");

    assert_eq!(queues.prune_idle(), 1);
    let names: Vec<&str> = queues.topic_names().collect();
    assert_eq!(names, vec!["watched"]);
}

#[test]
fn test_tracker_untrack_is_idempotent() {
    let mut tracker = DeliveryTracker::new();
    let msg = Message::new("orders", "x");
    tracker.track(msg.clone(), 1_000);

    assert_eq!(tracker.untrack(&msg.id), Some(msg.clone()));
    assert_eq!(tracker.untrack(&msg.id), None);
    assert!(tracker.is_empty());
}

#[test]
fn test_tracker_scan_removes_only_expired_entries() {
    let mut tracker = DeliveryTracker::new();
    let old = Message::new("orders", "old");
    let older = Message::new("orders", "older");
    let fresh = Message::new("orders", "fresh");
    tracker.track(old.clone(), 2_000);
    tracker.track(older.clone(), 1_000);
    tracker.track(fresh.clone(), 9_500);

    let expired = tracker.scan_expired(10_000, Duration::from_millis(5_000));
    assert_eq!(expired, vec![older, old]);
    assert!(tracker.contains(&fresh.id));
    assert_eq!(tracker.len(), 1);

    // The boundary itself is not expired
    assert!(
        tracker
            .scan_expired(14_500, Duration::from_millis(5_000))
            .is_empty()
    );
}

#[tokio::test]
async fn test_broker_fifo_within_topic() {
    let (broker, _dir) = create_test_broker();
    let ids: Vec<String> = (0..5)
        .map(|i| broker.produce(Message::new("orders", format!("{i}"))))
        .collect();

    for id in ids {
        let msg = broker.consume("orders").await.unwrap();
        assert_eq!(msg.id, id);
    }
    assert_eq!(broker.consume("orders").await, None);
}

#[tokio::test]
async fn test_broker_consume_empty_topic_returns_none_after_wait() {
    let (broker, _dir) = create_test_broker();
    let started = std::time::Instant::now();
    assert_eq!(
        broker
            .consume_within("nothing", Duration::from_millis(30))
            .await,
        None
    );
    assert!(started.elapsed() >= Duration::from_millis(25));
    assert_eq!(broker.consume("").await, None);
}

#[tokio::test]
async fn test_broker_consume_wakes_on_produce() {
    let (broker, _dir) = create_test_broker();
    let broker = Arc::new(broker);

    let waiter = {
        let broker = Arc::clone(&broker);
        tokio::spawn(async move {
            broker
                .consume_within("orders", Duration::from_secs(5))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let id = broker.produce(Message::new("orders", "late"));

    let msg = waiter.await.unwrap().unwrap();
    assert_eq!(msg.id, id);
}

#[tokio::test]
async fn test_broker_message_never_in_queue_and_tracker() {
    let (broker, _dir) = create_test_broker();
    let id = broker.produce(Message::new("orders", "x"));
    assert!(broker.is_queued("orders", &id));
    assert!(!broker.is_in_flight(&id));

    broker.consume("orders").await.unwrap();
    assert!(!broker.is_queued("orders", &id));
    assert!(broker.is_in_flight(&id));

    assert!(broker.acknowledge(&id));
    assert!(!broker.is_queued("orders", &id));
    assert!(!broker.is_in_flight(&id));
}

#[tokio::test]
async fn test_broker_ack_is_idempotent_and_erases_log_record() {
    let dir = tempdir().unwrap();
    let settings = test_settings(&dir);
    let broker = Broker::open(&settings).unwrap();
    let keep = broker.produce(Message::new("orders", "keep"));
    let done = broker.produce(Message::new("orders", "done"));

    broker.consume("orders").await.unwrap();
    broker.consume("orders").await.unwrap();
    assert!(broker.acknowledge(&done));
    assert!(!broker.acknowledge(&done));
    assert!(!broker.acknowledge("never-produced"));

    let remaining: Vec<String> = MessageLog::new(&settings.log_path)
        .replay()
        .unwrap()
        .into_iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(remaining, vec![keep]);

    let stats = broker.stats();
    assert_eq!(stats.acknowledged, 1);
    assert_eq!(stats.in_flight, 1);
}

#[tokio::test]
async fn test_broker_redelivers_after_ack_timeout() {
    let (broker, _dir) = create_test_broker();
    let id = broker.produce(Message::new("orders", "x"));
    broker.produce(Message::new("orders", "y"));

    broker.consume("orders").await.unwrap();
    assert_eq!(broker.redeliver_expired_at(now_ms()), 0);

    let later = now_ms() + broker.ack_timeout().as_millis() as i64 + 1;
    assert_eq!(broker.redeliver_expired_at(later), 1);
    assert!(!broker.is_in_flight(&id));
    assert!(broker.is_queued("orders", &id));

    // Redelivered messages go to the tail
    let next = broker.consume("orders").await.unwrap();
    assert_eq!(next.content, "y");
    let again = broker.consume("orders").await.unwrap();
    assert_eq!(again.id, id);
    assert_eq!(broker.stats().redelivered, 1);
}

#[tokio::test]
async fn test_broker_duplicate_produce_is_ignored() {
    let (broker, _dir) = create_test_broker();
    let msg = Message::new("orders", "once");

    assert_eq!(broker.produce(msg.clone()), msg.id);
    assert_eq!(broker.produce(msg.clone()), msg.id);
    assert_eq!(broker.queued_len("orders"), 1);

    // Still a no-op while in flight
    broker.consume("orders").await.unwrap();
    broker.produce(msg.clone());
    assert_eq!(broker.queued_len("orders"), 0);
    assert_eq!(broker.stats().produced, 1);
}

#[tokio::test]
async fn test_broker_replays_unacknowledged_messages_on_open() {
    let dir = tempdir().unwrap();
    let settings = test_settings(&dir);

    let (first, second, acked) = {
        let broker = Broker::open(&settings).unwrap();
        let first = broker.produce(Message::new("orders", "1"));
        let second = broker.produce(Message::new("billing", "2"));
        let acked = broker.produce(Message::new("orders", "3"));
        // `first` is in flight at shutdown and must come back
        broker.consume("orders").await.unwrap();
        broker.consume("orders").await.unwrap();
        broker.acknowledge(&acked);
        (first, second, acked)
    };

    let restarted = Broker::open(&settings).unwrap();
    assert!(restarted.is_queued("orders", &first));
    assert!(restarted.is_queued("billing", &second));
    assert!(!restarted.is_queued("orders", &acked));
    assert_eq!(restarted.stats().queued, 2);
    assert_eq!(restarted.stats().in_flight, 0);
}

#[test]
fn test_broker_replay_skips_duplicate_records() {
    let dir = tempdir().unwrap();
    let settings = test_settings(&dir);
    let msg = Message::new("orders", "dup");
    std::fs::write(
        &settings.log_path,
        format!("{}\n{}\n", msg.encode(), msg.encode()),
    )
    .unwrap();

    let broker = Broker::open(&settings).unwrap();
    assert_eq!(broker.queued_len("orders"), 1);
}

#[tokio::test]
async fn test_broker_keeps_serving_when_log_is_unwritable() {
    let dir = tempdir().unwrap();
    let settings = BrokerSettings {
        log_path: dir
            .path()
            .join("missing")
            .join("broker.log")
            .display()
            .to_string(),
        poll_wait_ms: 10,
        ..BrokerSettings::default()
    };
    let broker = Broker::new(MessageLog::new(&settings.log_path), &settings);

    let id = broker.produce(Message::new("orders", "volatile"));
    assert_eq!(broker.consume("orders").await.unwrap().id, id);
    assert!(broker.acknowledge(&id));
    assert!(broker.stats().durability_failures >= 1);
}

#[tokio::test]
async fn test_redelivery_scanner_stops_on_cancel() {
    let dir = tempdir().unwrap();
    let settings = BrokerSettings {
        ack_timeout_ms: 0,
        ..test_settings(&dir)
    };
    let broker = Arc::new(Broker::open(&settings).unwrap());
    let cancel = tokio_util::sync::CancellationToken::new();
    let scanner = broker.spawn_redelivery_scanner(cancel.clone());

    let id = broker.produce(Message::new("orders", "x"));
    broker.consume("orders").await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(broker.is_queued("orders", &id));

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), scanner)
        .await
        .unwrap()
        .unwrap();
}
