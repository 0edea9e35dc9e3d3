//! Pull consumer against a live HTTP sink.
//!
//! Uses the in-memory broker and a wiremock server standing in for the
//! webhook receiver.

use firehose_fanout::broker::{Broker, MemoryBroker, StartPosition, Subscription};
use firehose_fanout::consumer::{ConsumerSettings, PullConsumer, TickOutcome};
use firehose_fanout::event::EventIdentity;
use firehose_fanout::sink::{WebhookPayload, WebhookSink};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TOPIC: &str = "atproto.firehose.raw";
const NAK_DELAY: Duration = Duration::from_millis(200);

struct Harness {
    broker: Arc<MemoryBroker>,
    consumer: PullConsumer,
    subscription: Subscription,
}

async fn harness(server: &MockServer, events: &[&str]) -> Harness {
    let broker = Arc::new(MemoryBroker::new());
    let settings = ConsumerSettings {
        topic: TOPIC.to_string(),
        batch_size: 10,
        fetch_wait: Duration::from_millis(50),
        nak_delay: NAK_DELAY,
        start_position: StartPosition::Earliest,
        ..ConsumerSettings::default()
    };

    let sink = WebhookSink::new(format!("{}/webhook", server.uri()))
        .with_timeout(Duration::from_secs(2));
    let consumer = PullConsumer::new("consumer-0", broker.clone(), settings).with_sink(Arc::new(sink));
    let subscription = broker
        .pull_subscribe(TOPIC, "consumer-0", StartPosition::Earliest)
        .await
        .unwrap();

    for event in events {
        broker
            .publish(TOPIC, event.as_bytes(), &EventIdentity::of(event.as_bytes()))
            .await
            .unwrap();
    }

    Harness {
        broker,
        consumer,
        subscription,
    }
}

async fn received_batches(server: &MockServer) -> Vec<WebhookPayload> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .map(|request| serde_json::from_slice(&request.body).unwrap())
        .collect()
}

#[tokio::test]
async fn test_sink_500_naks_whole_batch_and_redelivers() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/webhook"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness(&server, &["e1", "e2", "e3", "e4"]).await;

    let outcome = h.consumer.poll_once(&h.subscription).await;
    assert_eq!(outcome, TickOutcome::Nacked(4));

    let counters = h.consumer.counters().snapshot();
    assert_eq!(counters.processed, 0);
    assert_eq!(counters.nacked, 4);
    assert_eq!(counters.batches_failed, 1);

    // Not before the redelivery delay
    let early = h.broker.fetch(&h.subscription, 10, Duration::ZERO).await.unwrap();
    assert!(early.is_empty());

    tokio::time::sleep(NAK_DELAY + Duration::from_millis(100)).await;
    let again = h.broker.fetch(&h.subscription, 10, Duration::ZERO).await.unwrap();
    let payloads: Vec<Vec<u8>> = again.into_iter().map(|d| d.payload).collect();
    assert_eq!(
        payloads,
        vec![b"e1".to_vec(), b"e2".to_vec(), b"e3".to_vec(), b"e4".to_vec()]
    );
}

#[tokio::test]
async fn test_sink_200_acks_and_counts_batch() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/webhook"))
        .and(header("X-Event-Count", "4"))
        .and(header("Content-Type", "application/json"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness(&server, &["e1", "e2", "e3", "e4"]).await;

    assert_eq!(h.consumer.poll_once(&h.subscription).await, TickOutcome::Acked(4));
    assert_eq!(h.consumer.counters().processed(), 4);
    assert_eq!(h.broker.pending_count(TOPIC, "consumer-0").await, 0);

    let batches = received_batches(&server).await;
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].consumer, "consumer-0");
    assert_eq!(batches[0].count, 4);
    assert_eq!(batches[0].events[0], b"e1".to_vec());
}

#[tokio::test]
async fn test_redelivered_batch_counted_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let h = harness(&server, &["e1", "e2", "e3"]).await;
    assert_eq!(h.consumer.poll_once(&h.subscription).await, TickOutcome::Nacked(3));

    server.reset().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    tokio::time::sleep(NAK_DELAY + Duration::from_millis(100)).await;
    assert_eq!(h.consumer.poll_once(&h.subscription).await, TickOutcome::Acked(3));
    assert_eq!(h.consumer.poll_once(&h.subscription).await, TickOutcome::Empty);
    assert_eq!(h.consumer.counters().processed(), 3);

    // The sink saw the same batch it had rejected
    let batches = received_batches(&server).await;
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].events, vec![b"e1".to_vec(), b"e2".to_vec(), b"e3".to_vec()]);
}

#[tokio::test]
async fn test_sink_timeout_is_a_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
        .mount(&server)
        .await;

    let broker = Arc::new(MemoryBroker::new());
    let settings = ConsumerSettings {
        topic: TOPIC.to_string(),
        fetch_wait: Duration::from_millis(50),
        nak_delay: NAK_DELAY,
        start_position: StartPosition::Earliest,
        ..ConsumerSettings::default()
    };
    let sink = WebhookSink::new(server.uri()).with_timeout(Duration::from_millis(200));
    let consumer = PullConsumer::new("slow", broker.clone(), settings).with_sink(Arc::new(sink));
    let subscription = broker
        .pull_subscribe(TOPIC, "slow", StartPosition::Earliest)
        .await
        .unwrap();
    broker
        .publish(TOPIC, b"e1", &EventIdentity::of(b"e1"))
        .await
        .unwrap();

    assert_eq!(consumer.poll_once(&subscription).await, TickOutcome::Nacked(1));
    assert_eq!(consumer.counters().processed(), 0);
}

#[tokio::test]
async fn test_empty_tick_does_not_call_sink() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let h = harness(&server, &[]).await;
    assert_eq!(h.consumer.poll_once(&h.subscription).await, TickOutcome::Empty);
}
