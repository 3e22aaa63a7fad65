mod common;

use bytes::Bytes;
use common::{partitioned_doc, MemoryLookup, MockBroker};
use riverq_client::{Message, Producer, ProducerConfigBuilder, RiverqError};
use std::time::Duration;

fn producer_config(retry: usize) -> riverq_client::ProducerConfig {
    ProducerConfigBuilder::new()
        .lookup_endpoints(vec!["memory:4161"])
        .publish_retry(retry)
        .borrow_timeout(Duration::from_millis(200))
        .build()
}

#[tokio::test]
async fn publish_acknowledged_by_partition_owner() {
    let broker = MockBroker::start().await;
    let lookup = MemoryLookup::new();
    lookup.set_topic("orders", partitioned_doc(&[broker.endpoint()]));

    let producer = Producer::new(producer_config(3), lookup).unwrap();
    let message = Message::builder()
        .topic("orders")
        .body("hello")
        .sharding_key(7)
        .build()
        .unwrap();

    let receipt = producer.publish(message).await.unwrap();
    assert_eq!(receipt.topic, "orders");
    assert_eq!(receipt.partition, Some(0));
    assert!(receipt.address.contains(&broker.port.to_string()));

    let pubs = broker.commands_with_prefix("PUB");
    assert_eq!(pubs, vec!["PUB orders 0".to_string()]);

    let snapshot = producer.metrics();
    assert_eq!(snapshot.messages_published, 1);
    assert_eq!(snapshot.publish_attempts, 1);
    assert_eq!(snapshot.publish_errors, 0);

    producer.close();
}

#[tokio::test]
async fn stale_routing_triggers_relookup_and_failover() {
    let leader_gone = MockBroker::start().await;
    let new_leader = MockBroker::start().await;
    leader_gone.always_fail_pub("E_FAILED_ON_NOT_LEADER");

    let lookup = MemoryLookup::new();
    // First lookup points at the departed leader; the refresh after the
    // rejection reveals the new one.
    lookup.set_topic_sequence(
        "orders",
        vec![
            partitioned_doc(&[leader_gone.endpoint()]),
            partitioned_doc(&[new_leader.endpoint()]),
        ],
    );

    let producer = Producer::new(producer_config(3), lookup).unwrap();
    let message = Message::builder()
        .topic("orders")
        .body("payload")
        .sharding_key(0)
        .build()
        .unwrap();

    let receipt = producer.publish(message).await.unwrap();
    assert!(receipt.address.contains(&new_leader.port.to_string()));

    assert_eq!(leader_gone.commands_with_prefix("PUB").len(), 1);
    assert_eq!(new_leader.commands_with_prefix("PUB").len(), 1);
    assert_eq!(producer.metrics().publish_attempts, 2);

    producer.close();
}

#[tokio::test]
async fn retry_is_bounded_and_attempts_are_reported() {
    let broker = MockBroker::start().await;
    broker.always_fail_pub("E_PUB_FAILED");

    let lookup = MemoryLookup::new();
    lookup.set_topic("orders", partitioned_doc(&[broker.endpoint()]));

    let producer = Producer::new(producer_config(3), lookup).unwrap();
    let message = Message::new("orders", "payload").unwrap();

    match producer.publish(message).await {
        Err(RiverqError::PublishFailed { topic, attempts }) => {
            assert_eq!(topic, "orders");
            assert_eq!(attempts.len(), 3);
        }
        other => panic!("expected PublishFailed, got {other:?}"),
    }
    assert_eq!(broker.commands_with_prefix("PUB").len(), 3);
    assert_eq!(producer.metrics().publish_errors, 1);

    producer.close();
}

#[tokio::test]
async fn malformed_message_fails_without_retry() {
    let broker = MockBroker::start().await;
    broker.always_fail_pub("E_BAD_MESSAGE");

    let lookup = MemoryLookup::new();
    lookup.set_topic("orders", partitioned_doc(&[broker.endpoint()]));

    let producer = Producer::new(producer_config(5), lookup).unwrap();
    let message = Message::new("orders", "payload").unwrap();

    match producer.publish(message).await {
        Err(RiverqError::InvalidMessage { .. }) => {}
        other => panic!("expected InvalidMessage, got {other:?}"),
    }
    // Fatal rejection: exactly one wire attempt.
    assert_eq!(broker.commands_with_prefix("PUB").len(), 1);

    producer.close();
}

#[tokio::test]
async fn unknown_topic_surfaces_immediately() {
    let lookup = MemoryLookup::new();
    let producer = Producer::new(producer_config(5), lookup).unwrap();
    let message = Message::new("nowhere", "payload").unwrap();

    match producer.publish(message).await {
        Err(RiverqError::TopicNotFound { topic }) => assert_eq!(topic, "nowhere"),
        other => panic!("expected TopicNotFound, got {other:?}"),
    }
    assert_eq!(producer.metrics().publish_attempts, 1);

    producer.close();
}

#[tokio::test]
async fn transient_broker_error_recovers_within_budget() {
    let broker = MockBroker::start().await;
    broker.fail_next_pubs("E_FAILED_ON_NOT_WRITABLE", 1);

    let lookup = MemoryLookup::new();
    lookup.set_topic("orders", partitioned_doc(&[broker.endpoint()]));

    let producer = Producer::new(producer_config(3), lookup).unwrap();
    let message = Message::new("orders", "payload").unwrap();

    let receipt = producer.publish(message).await.unwrap();
    assert_eq!(receipt.partition, Some(0));
    assert_eq!(broker.commands_with_prefix("PUB").len(), 2);

    producer.close();
}

#[tokio::test]
async fn concurrent_publishers_share_one_producer() {
    let broker = MockBroker::start().await;
    let lookup = MemoryLookup::new();
    lookup.set_topic("orders", partitioned_doc(&[broker.endpoint()]));

    let producer = Producer::new(producer_config(3), lookup).unwrap();
    let mut tasks = Vec::new();
    for i in 0..8 {
        let producer = producer.clone();
        tasks.push(tokio::spawn(async move {
            let message = Message::new("orders", format!("payload-{i}")).unwrap();
            producer.publish(message).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(broker.commands_with_prefix("PUB").len(), 8);
    assert_eq!(producer.metrics().messages_published, 8);

    producer.close();
}

#[tokio::test]
async fn publish_warms_the_pool_to_the_idle_minimum() {
    let broker = MockBroker::start().await;
    let lookup = MemoryLookup::new();
    lookup.set_topic("orders", partitioned_doc(&[broker.endpoint()]));

    let config = ProducerConfigBuilder::new()
        .lookup_endpoints(vec!["memory:4161"])
        .min_idle_per_broker(3)
        .borrow_timeout(Duration::from_millis(500))
        .build();
    let producer = Producer::new(config, lookup).unwrap();
    let message = Message::new("orders", "hello").unwrap();
    producer.publish(message).await.unwrap();

    // The background warm-up fills the idle queue past the connection the
    // publish itself used.
    let mut created = 0;
    for _ in 0..100 {
        created = producer.metrics().connections_created;
        if created >= 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(created >= 3, "only {created} connections created");

    producer.close();
}

#[tokio::test]
async fn idle_connection_is_revalidated_and_reused() {
    let broker = MockBroker::start().await;
    let lookup = MemoryLookup::new();
    lookup.set_topic("orders", partitioned_doc(&[broker.endpoint()]));

    let config = ProducerConfigBuilder::new()
        .lookup_endpoints(vec!["memory:4161"])
        .min_idle_per_broker(0)
        .borrow_timeout(Duration::from_millis(200))
        .build();
    let producer = Producer::new(config, lookup).unwrap();

    for i in 0..3 {
        let message = Message::new("orders", format!("payload-{i}")).unwrap();
        producer.publish(message).await.unwrap();
    }

    // Each publish reuses the idle connection after it passes the liveness
    // probe; a wedged probe would force a fresh connection or a timeout.
    assert_eq!(producer.metrics().connections_created, 1);
    assert_eq!(broker.commands_with_prefix("PUB").len(), 3);

    producer.close();
}

#[tokio::test]
async fn batch_publish_reports_only_failed_chunk() {
    let broker = MockBroker::start().await;
    // The trailing chunk of 5 is rejected with a fatal code; the two full
    // chunks of 10 go through.
    broker.fail_mpub_of_size(5, "E_BAD_BODY");

    let lookup = MemoryLookup::new();
    lookup.set_topic("orders", partitioned_doc(&[broker.endpoint()]));

    let config = ProducerConfigBuilder::new()
        .lookup_endpoints(vec!["memory:4161"])
        .publish_retry(2)
        .batch_size(10)
        .publish_workers(2)
        .borrow_timeout(Duration::from_millis(200))
        .build();
    let producer = Producer::new(config, lookup).unwrap();

    let bodies: Vec<Bytes> = (0..25)
        .map(|i| Bytes::from(format!("payload-{i:02}")))
        .collect();
    let failed = producer.publish_batch("orders", bodies.clone()).await.unwrap();

    assert_eq!(failed.len(), 5);
    assert_eq!(&failed[..], &bodies[20..]);

    let mpubs = broker.commands_with_prefix("MPUB");
    assert_eq!(mpubs.iter().filter(|c| c.ends_with("count=10")).count(), 2);

    producer.close();
}

#[tokio::test]
async fn batch_publish_of_nothing_is_a_no_op() {
    let lookup = MemoryLookup::new();
    let producer = Producer::new(producer_config(3), lookup).unwrap();
    let failed = producer.publish_batch("orders", Vec::new()).await.unwrap();
    assert!(failed.is_empty());
    producer.close();
}
