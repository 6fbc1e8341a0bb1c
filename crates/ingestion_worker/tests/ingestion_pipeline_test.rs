use async_trait::async_trait;
use common::domain::{
    DomainError, DomainResult, InMemoryReadingSink, ReadingSink, StoreReadingsInput,
};
use ingestion_worker::domain::{BackoffConfig, IngestionConfig, TransportMode};
use ingestion_worker::mqtt::{
    BrokerConnector, BrokerError, BrokerSession, ConnectionState, InboundMessage,
};
use ingestion_worker::IngestionWorker;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};

// Connector that hands out one channel-backed session, failing every other attempt
struct ChannelConnector {
    receiver: Mutex<Option<mpsc::Receiver<InboundMessage>>>,
    attempts: AtomicUsize,
}

impl ChannelConnector {
    fn new(receiver: mpsc::Receiver<InboundMessage>) -> Self {
        Self {
            receiver: Mutex::new(Some(receiver)),
            attempts: AtomicUsize::new(0),
        }
    }

    fn unreachable() -> Self {
        Self {
            receiver: Mutex::new(None),
            attempts: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl BrokerConnector for ChannelConnector {
    async fn connect(&self) -> Result<Box<dyn BrokerSession>, BrokerError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let receiver = self.receiver.lock().unwrap().take();
        match receiver {
            Some(receiver) => Ok(Box::new(ChannelSession { receiver })),
            None => Err(BrokerError::Connect("connection refused".to_string())),
        }
    }

    fn transport_mode(&self) -> TransportMode {
        TransportMode::Plain
    }
}

struct ChannelSession {
    receiver: mpsc::Receiver<InboundMessage>,
}

#[async_trait]
impl BrokerSession for ChannelSession {
    async fn next_message(&mut self) -> Result<InboundMessage, BrokerError> {
        self.receiver
            .recv()
            .await
            .ok_or_else(|| BrokerError::ConnectionLost("channel closed".to_string()))
    }

    async fn disconnect(&mut self) {}
}

// Sink that rejects its first batch
struct FlakySink {
    calls: AtomicUsize,
    inner: InMemoryReadingSink,
}

impl FlakySink {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            inner: InMemoryReadingSink::new(),
        }
    }
}

#[async_trait]
impl ReadingSink for FlakySink {
    async fn store_batch(&self, input: StoreReadingsInput) -> DomainResult<()> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(DomainError::RepositoryError(anyhow::anyhow!(
                "database unavailable"
            )));
        }
        self.inner.store_batch(input).await
    }
}

fn test_config(min_delay_ms: u64) -> IngestionConfig {
    IngestionConfig {
        backoff: BackoffConfig {
            min_delay_ms,
            max_delay_ms: min_delay_ms * 4,
            unexpected_error_delay_ms: min_delay_ms,
        },
        stop_timeout_ms: 2_000,
        ..Default::default()
    }
}

fn message(topic: &str, payload: &str) -> InboundMessage {
    InboundMessage {
        topic: topic.to_string(),
        payload: payload.as_bytes().to_vec(),
    }
}

async fn wait_for_count(sink: &InMemoryReadingSink, expected: usize) {
    timeout(Duration::from_secs(5), async {
        while sink.count().await < expected {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("readings were not stored in time");
}

#[tokio::test]
async fn test_worker_reaches_subscribed_and_stops() {
    let (tx, rx) = mpsc::channel(8);
    let connector = Arc::new(ChannelConnector::new(rx));
    let worker = IngestionWorker::with_connector(
        test_config(100),
        connector,
        Arc::new(InMemoryReadingSink::new()),
    );

    let mut state = worker.state();
    worker.start().await;
    assert!(worker.is_running().await);

    timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == ConnectionState::Subscribed),
    )
    .await
    .expect("worker never subscribed")
    .unwrap();

    worker.stop().await;
    assert!(!worker.is_running().await);
    assert_eq!(*worker.state().borrow(), ConnectionState::Stopped);
    drop(tx);
}

#[tokio::test]
async fn test_start_is_idempotent() {
    let (_tx, rx) = mpsc::channel(8);
    let connector = Arc::new(ChannelConnector::new(rx));
    let worker = IngestionWorker::with_connector(
        test_config(100),
        connector.clone(),
        Arc::new(InMemoryReadingSink::new()),
    );

    let mut state = worker.state();
    worker.start().await;
    worker.start().await;

    timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == ConnectionState::Subscribed),
    )
    .await
    .expect("worker never subscribed")
    .unwrap();
    worker.start().await;
    sleep(Duration::from_millis(50)).await;

    assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
    worker.stop().await;
}

#[tokio::test]
async fn test_stop_during_backoff_returns_promptly() {
    let connector = Arc::new(ChannelConnector::unreachable());
    let worker = IngestionWorker::with_connector(
        test_config(60_000),
        connector.clone(),
        Arc::new(InMemoryReadingSink::new()),
    );

    worker.start().await;
    timeout(Duration::from_secs(5), async {
        while connector.attempts.load(Ordering::SeqCst) == 0 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("worker never attempted a connection");

    let started = Instant::now();
    worker.stop().await;

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
    assert_eq!(worker.current_state(), ConnectionState::Stopped);
    let last_error = worker.last_error().expect("connect failure was not recorded");
    assert!(last_error.contains("connection refused"), "got {}", last_error);
}

#[tokio::test]
async fn test_new_rejects_zero_backoff() {
    let result = IngestionWorker::new(
        test_config(0),
        Arc::new(InMemoryReadingSink::new()),
    );

    let err = result.err().expect("zero backoff accepted");
    assert!(err.to_string().contains("minimum delay"));
}

#[tokio::test]
async fn test_stop_without_start_is_noop() {
    let worker = IngestionWorker::with_connector(
        test_config(100),
        Arc::new(ChannelConnector::unreachable()),
        Arc::new(InMemoryReadingSink::new()),
    );

    worker.stop().await;
    assert!(!worker.is_running().await);
}

#[tokio::test]
async fn test_malformed_message_does_not_block_next() {
    let (tx, rx) = mpsc::channel(8);
    let sink = Arc::new(InMemoryReadingSink::new());
    let worker = IngestionWorker::with_connector(
        test_config(100),
        Arc::new(ChannelConnector::new(rx)),
        sink.clone(),
    );
    worker.start().await;

    tx.send(message("aqms/SENSOR42/data", "{not json")).await.unwrap();
    tx.send(message(
        "aqms/SENSOR42/data",
        r#"{"datetime": "2023-11-14T22:13:20Z", "pm25": 9.5}"#,
    ))
    .await
    .unwrap();

    wait_for_count(&sink, 1).await;
    worker.stop().await;

    let stored = sink.readings().await;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].source_id(), "SENSOR42");
    assert_eq!(stored[0].observed_at().timestamp(), 1_700_000_000);
    assert_eq!(stored[0].measurements().pm25, Some(9.5));
}

#[tokio::test]
async fn test_sink_failure_does_not_block_next() {
    let (tx, rx) = mpsc::channel(8);
    let sink = Arc::new(FlakySink::new());
    let worker = IngestionWorker::with_connector(
        test_config(100),
        Arc::new(ChannelConnector::new(rx)),
        sink.clone(),
    );
    worker.start().await;

    tx.send(message(
        "aqms/station",
        r#"[{"uid": "a", "ts": 1700000000}, {"uid": "b", "ts": 1700000000}]"#,
    ))
    .await
    .unwrap();
    tx.send(message("aqms/station", r#"{"uid": "c", "ts": 1700000060000}"#))
        .await
        .unwrap();

    wait_for_count(&sink.inner, 1).await;
    worker.stop().await;

    let stored = sink.inner.readings().await;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].source_id(), "c");
    assert_eq!(stored[0].observed_at().timestamp(), 1_700_000_060);
    assert_eq!(sink.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_dropped_connection_reconnects() {
    let (tx, rx) = mpsc::channel(8);
    let connector = Arc::new(ChannelConnector::new(rx));
    let worker = IngestionWorker::with_connector(
        test_config(20),
        connector.clone(),
        Arc::new(InMemoryReadingSink::new()),
    );
    let mut state = worker.state();
    worker.start().await;

    timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == ConnectionState::Subscribed),
    )
    .await
    .expect("worker never subscribed")
    .unwrap();

    drop(tx);

    timeout(Duration::from_secs(5), async {
        while connector.attempts.load(Ordering::SeqCst) < 3 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("worker did not keep reconnecting");

    assert!(worker.is_running().await);
    worker.stop().await;
}
