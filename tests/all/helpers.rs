//! An in-memory broker implementing the transport seam, so the pipeline's
//! reconnect, backpressure and confirm machinery can be driven end-to-end
//! without a live RabbitMq instance.

use carrier_pigeon::amqp::configuration::{PipelineSettings, RabbitMqSettings};
use carrier_pigeon::amqp::transport::{
    ConfirmEvent, Delivery, QueueOptions, Transport, TransportChannel, TransportConnection,
};
use carrier_pigeon::amqp::{AMQPUri, BasicProperties, ExchangeKind};
use carrier_pigeon::pipeline::{PendingMessage, PipelineObserver, PublishError, PublishPipeline};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// A close notification that any number of waiters can observe.
#[derive(Clone)]
struct CloseFlag(Arc<watch::Sender<bool>>);

impl CloseFlag {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self(Arc::new(tx))
    }

    fn trip(&self) {
        let _ = self.0.send(true);
    }

    async fn wait(&self) {
        let mut rx = self.0.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

#[derive(Debug, Clone)]
pub struct PublishRecord {
    pub channel: usize,
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
}

#[derive(Default)]
struct BrokerState {
    dial_ok: AtomicBoolTrue,
    publish_ok: AtomicBoolTrue,
    emit_confirms: AtomicBoolTrue,
    /// Scripted ack decisions, consumed one per confirm-mode publish.
    /// An exhausted script acks.
    confirm_script: Mutex<VecDeque<bool>>,
    publishes: Mutex<Vec<PublishRecord>>,
    declares: Mutex<Vec<String>>,
    connections: Mutex<Vec<CloseFlag>>,
    channels: Mutex<Vec<(usize, CloseFlag)>>,
    consumers: Mutex<Vec<(String, mpsc::Sender<Delivery>)>>,
    channel_seq: AtomicUsize,
}

/// An `AtomicBool` that defaults to `true`.
struct AtomicBoolTrue(AtomicBool);

impl Default for AtomicBoolTrue {
    fn default() -> Self {
        Self(AtomicBool::new(true))
    }
}

impl AtomicBoolTrue {
    fn get(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn set(&self, value: bool) {
        self.0.store(value, Ordering::Release);
    }
}

/// Handle to the in-memory broker; clones share the same state.
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<BrokerState>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_dial_ok(&self, ok: bool) {
        self.state.dial_ok.set(ok);
    }

    pub fn set_publish_ok(&self, ok: bool) {
        self.state.publish_ok.set(ok);
    }

    /// Stop emitting confirmation events entirely (publishes still succeed).
    pub fn set_emit_confirms(&self, emit: bool) {
        self.state.emit_confirms.set(emit);
    }

    /// Queue ack/nack decisions for upcoming confirm-mode publishes.
    pub fn script_confirms(&self, decisions: impl IntoIterator<Item = bool>) {
        self.state
            .confirm_script
            .lock()
            .unwrap()
            .extend(decisions);
    }

    pub fn publish_count(&self) -> usize {
        self.state.publishes.lock().unwrap().len()
    }

    pub fn publishes(&self) -> Vec<PublishRecord> {
        self.state.publishes.lock().unwrap().clone()
    }

    pub fn declares(&self) -> Vec<String> {
        self.state.declares.lock().unwrap().clone()
    }

    /// Messages published per channel, indexed by channel id.
    pub fn counts_by_channel(&self) -> std::collections::HashMap<usize, usize> {
        let mut counts = std::collections::HashMap::new();
        for record in self.state.publishes.lock().unwrap().iter() {
            *counts.entry(record.channel).or_insert(0) += 1;
        }
        counts
    }

    /// Sever every live connection, as a broker restart would.
    pub fn drop_connections(&self) {
        for connection in self.state.connections.lock().unwrap().drain(..) {
            connection.trip();
        }
        for (_, channel) in self.state.channels.lock().unwrap().drain(..) {
            channel.trip();
        }
    }

    /// Sever a single channel, leaving the connection up.
    pub fn drop_channel(&self, id: usize) {
        let channels = self.state.channels.lock().unwrap();
        for (channel_id, flag) in channels.iter() {
            if *channel_id == id {
                flag.trip();
            }
        }
    }

    /// Ids of the channels opened so far (dead ones included).
    pub fn channel_ids(&self) -> Vec<usize> {
        self.state
            .channels
            .lock()
            .unwrap()
            .iter()
            .map(|(id, _)| *id)
            .collect()
    }

    /// Push a delivery to every consumer registered on `queue`.
    pub async fn push_delivery(&self, queue: &str, delivery: Delivery) {
        let senders: Vec<_> = self
            .state
            .consumers
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == queue)
            .map(|(_, tx)| tx.clone())
            .collect();
        for tx in senders {
            let _ = tx.send(delivery.clone()).await;
        }
    }
}

#[async_trait::async_trait]
impl Transport for MockBroker {
    async fn dial(&self, _uri: &AMQPUri) -> Result<Box<dyn TransportConnection>, anyhow::Error> {
        if !self.state.dial_ok.get() {
            anyhow::bail!("connection refused");
        }
        let close = CloseFlag::new();
        self.state.connections.lock().unwrap().push(close.clone());
        Ok(Box::new(MockConnection {
            state: self.state.clone(),
            close,
        }))
    }
}

struct MockConnection {
    state: Arc<BrokerState>,
    close: CloseFlag,
}

#[async_trait::async_trait]
impl TransportConnection for MockConnection {
    async fn open_channel(
        &self,
        confirms: bool,
    ) -> Result<Box<dyn TransportChannel>, anyhow::Error> {
        let id = self.state.channel_seq.fetch_add(1, Ordering::Relaxed);
        let close = CloseFlag::new();
        self.state
            .channels
            .lock()
            .unwrap()
            .push((id, close.clone()));
        let (confirm_tx, confirm_rx) = mpsc::unbounded_channel();
        Ok(Box::new(MockChannel {
            id,
            state: self.state.clone(),
            confirms,
            close,
            connection_close: self.close.clone(),
            confirm_tx,
            confirm_rx: tokio::sync::Mutex::new(confirm_rx),
            publish_seq: AtomicU64::new(0),
        }))
    }

    async fn closed(&self) {
        self.close.wait().await;
    }

    async fn close(&self) {
        self.close.trip();
    }
}

struct MockChannel {
    id: usize,
    state: Arc<BrokerState>,
    confirms: bool,
    close: CloseFlag,
    connection_close: CloseFlag,
    confirm_tx: mpsc::UnboundedSender<ConfirmEvent>,
    confirm_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ConfirmEvent>>,
    publish_seq: AtomicU64,
}

#[async_trait::async_trait]
impl TransportChannel for MockChannel {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        _properties: BasicProperties,
    ) -> Result<(), anyhow::Error> {
        if !self.state.publish_ok.get() {
            anyhow::bail!("channel in error state");
        }
        self.state.publishes.lock().unwrap().push(PublishRecord {
            channel: self.id,
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            payload: payload.to_vec(),
        });
        if self.confirms && self.state.emit_confirms.get() {
            let ack = self
                .state
                .confirm_script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(true);
            let delivery_tag = self.publish_seq.fetch_add(1, Ordering::Relaxed) + 1;
            let _ = self.confirm_tx.send(ConfirmEvent { delivery_tag, ack });
        }
        Ok(())
    }

    async fn next_confirmation(&self) -> Option<ConfirmEvent> {
        self.confirm_rx.lock().await.recv().await
    }

    async fn exchange_declare(
        &self,
        exchange: &str,
        _kind: ExchangeKind,
        _durable: bool,
    ) -> Result<(), anyhow::Error> {
        self.state
            .declares
            .lock()
            .unwrap()
            .push(format!("exchange:{exchange}"));
        Ok(())
    }

    async fn queue_declare(
        &self,
        queue: &str,
        _options: &QueueOptions,
    ) -> Result<(), anyhow::Error> {
        self.state
            .declares
            .lock()
            .unwrap()
            .push(format!("queue:{queue}"));
        Ok(())
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), anyhow::Error> {
        self.state
            .declares
            .lock()
            .unwrap()
            .push(format!("bind:{queue}:{exchange}:{routing_key}"));
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<mpsc::Receiver<Delivery>, anyhow::Error> {
        let (tx, rx) = mpsc::channel(16);
        self.state
            .consumers
            .lock()
            .unwrap()
            .push((queue.to_owned(), tx));
        Ok(rx)
    }

    async fn closed(&self) {
        tokio::select! {
            _ = self.close.wait() => {}
            _ = self.connection_close.wait() => {}
        }
    }
}

/// Observer recording drops and reports for assertions.
#[derive(Clone, Default)]
pub struct RecordingObserver {
    pub dropped: Arc<AtomicUsize>,
    pub reports: Arc<Mutex<Vec<(usize, u64, u64, u64)>>>,
}

impl PipelineObserver for RecordingObserver {
    fn message_dropped(&self, _message: &PendingMessage, _depth: usize) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    fn queue_report(&self, depth: usize, successes: u64, failures: u64, dropped: u64) {
        self.reports
            .lock()
            .unwrap()
            .push((depth, successes, failures, dropped));
    }
}

pub fn test_settings() -> RabbitMqSettings {
    RabbitMqSettings {
        addresses: vec!["rabbit-1:5672".into(), "rabbit-2:5672".into()],
        ..RabbitMqSettings::default()
    }
}

/// A pipeline wired to the mock broker with timings tightened for tests.
pub fn pipeline_builder(
    broker: &MockBroker,
    pipeline_settings: PipelineSettings,
) -> carrier_pigeon::pipeline::PipelineBuilder {
    PublishPipeline::builder(test_settings())
        .pipeline_settings(pipeline_settings)
        .transport(Arc::new(broker.clone()))
        .reconnect_delay(Duration::from_millis(10))
        .channel_retry_delay(Duration::from_millis(10))
        .publish_backoff(Duration::from_millis(10))
        .confirm_timeout(Duration::from_millis(100))
        .report_interval(Duration::from_secs(3600))
}

pub fn fast_pipeline(broker: &MockBroker, pipeline_settings: PipelineSettings) -> PublishPipeline {
    pipeline_builder(broker, pipeline_settings)
        .build()
        .expect("failed to build pipeline")
}

/// Poll `condition` until it holds or `deadline` elapses.
pub async fn eventually(deadline: Duration, mut condition: impl FnMut() -> bool) {
    let start = tokio::time::Instant::now();
    while !condition() {
        assert!(
            start.elapsed() < deadline,
            "condition not met within {deadline:?}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Poll until the pool has no ready channel left.
pub async fn eventually_unready(pipeline: &PublishPipeline, deadline: Duration) {
    let probe = PendingMessage::new("probe", "probe", vec![]);
    let start = tokio::time::Instant::now();
    loop {
        if matches!(
            pipeline.publish(&probe).await,
            Err(PublishError::NoChannelReady)
        ) {
            return;
        }
        assert!(
            start.elapsed() < deadline,
            "pool still has ready channels after {deadline:?}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
