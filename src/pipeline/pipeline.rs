use crate::amqp::configuration::{PipelineSettings, RabbitMqSettings};
use crate::amqp::transport::{Delivery, QueueOptions, Transport};
use crate::amqp::ConnectionFactory;
use crate::pipeline::dispatcher::{Dispatcher, PublishQueue};
use crate::pipeline::error::{DeclareError, EnqueueError, FirstConnectTimeout, PublishError};
use crate::pipeline::manager::ConnectionManager;
use crate::pipeline::message::{PendingMessage, PublishOutcome};
use crate::pipeline::observer::{PipelineObserver, TracingObserver};
use crate::pipeline::pool::ChannelPool;
use crate::pipeline::slot::{ChannelSlot, SlotContext};
use lapin::ExchangeKind;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// A resilient publish pipeline for RabbitMq.
///
/// The pipeline keeps a connection to one node of the configured cluster
/// alive across network failures, multiplexes publishes over a fixed-size
/// pool of channels that each re-open independently, and feeds a bounded
/// in-memory queue through a background dispatcher with retry and
/// backpressure policies.
///
/// # Fault tolerance
///
/// Lost connections and channels are re-established automatically; dial
/// failures are retried forever and never surface to callers. Under a
/// sustained outage the queued path is explicitly best-effort: once the queue
/// crosses its backpressure threshold, failing messages are dropped (and
/// reported to the observer) rather than allowed to stall producers or grow
/// memory without bound. Callers that need a per-message result must use
/// [`PublishPipeline::publish`] instead of the queued path.
///
/// # Ordering
///
/// Publishes on a single channel are issued and confirmed in strict FIFO
/// order. Across the pool there is no global ordering: concurrent messages
/// may land on different channels and reach the broker in any relative order.
/// Callers that need ordering must serialize their publishes or accept
/// reordering.
///
/// # How do I build a `PublishPipeline`?
///
/// `PublishPipeline` provides a fluent API to add configuration step-by-step,
/// known as "builder pattern" in Rust.
/// The starting point is [`PublishPipeline::builder`].
pub struct PublishPipeline {
    queue: PublishQueue,
    pool: Arc<ChannelPool>,
    shutdown: watch::Sender<bool>,
    first_ready: watch::Receiver<usize>,
    pool_size: usize,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl PublishPipeline {
    /// Start building a [`PublishPipeline`].
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use carrier_pigeon::amqp::configuration::{PipelineSettings, RabbitMqSettings};
    /// use carrier_pigeon::pipeline::PublishPipeline;
    ///
    /// # async fn example() -> Result<(), anyhow::Error> {
    /// let pipeline = PublishPipeline::builder(RabbitMqSettings::default())
    ///     .pipeline_settings(PipelineSettings {
    ///         channels: 8,
    ///         publisher_confirms: true,
    ///         ..PipelineSettings::default()
    ///     })
    ///     .build()?;
    ///
    /// pipeline
    ///     .wait_for_first_connect(std::time::Duration::from_secs(10))
    ///     .await?;
    /// pipeline.publish_content("events", "user.created", b"hello".to_vec())?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn builder(settings: RabbitMqSettings) -> PipelineBuilder {
        PipelineBuilder::new(settings)
    }

    /// Queue a message for background publishing - fire and forget.
    ///
    /// Returns immediately; delivery failures are handled (and eventually
    /// given up on) by the dispatcher and reported via the observer, never to
    /// this caller.
    pub fn publish_content(
        &self,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        payload: Vec<u8>,
    ) -> Result<(), EnqueueError> {
        self.enqueue(PendingMessage::new(exchange, routing_key, payload))
    }

    /// Queue an already-built [`PendingMessage`] for background publishing.
    pub fn enqueue(&self, message: PendingMessage) -> Result<(), EnqueueError> {
        self.queue.enqueue(message)
    }

    /// Publish one message directly, bypassing the queue.
    ///
    /// With publisher confirms enabled the returned outcome carries the
    /// broker's acknowledgement; without them it returns as soon as the
    /// broker accepts the publish locally.
    pub async fn publish(
        &self,
        message: &PendingMessage,
    ) -> Result<PublishOutcome, PublishError> {
        let slot = self.pool.acquire().ok_or(PublishError::NoChannelReady)?;
        slot.publish(message).await
    }

    /// Declare an exchange through a ready channel.
    pub async fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), DeclareError> {
        let slot = self.pool.acquire().ok_or(DeclareError::NoChannelReady)?;
        slot.exchange_declare(exchange, kind, durable).await
    }

    /// Declare a queue through a ready channel.
    pub async fn queue_declare(
        &self,
        queue: &str,
        options: &QueueOptions,
    ) -> Result<(), DeclareError> {
        let slot = self.pool.acquire().ok_or(DeclareError::NoChannelReady)?;
        slot.queue_declare(queue, options).await
    }

    /// Bind a queue to an exchange through a ready channel.
    pub async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), DeclareError> {
        let slot = self.pool.acquire().ok_or(DeclareError::NoChannelReady)?;
        slot.queue_bind(queue, exchange, routing_key).await
    }

    /// Start consuming from a queue in auto-ack mode.
    ///
    /// This is a thin pass-through: consumer-side processing and explicit
    /// acknowledgement are out of this crate's scope.
    pub async fn consume(&self, queue: &str) -> Result<mpsc::Receiver<Delivery>, DeclareError> {
        let slot = self.pool.acquire().ok_or(DeclareError::NoChannelReady)?;
        slot.consume(queue).await
    }

    /// Block until every channel in the pool has completed at least one
    /// successful initialization, or `timeout` elapses.
    ///
    /// Call this at startup so publishers do not race a cold pool.
    pub async fn wait_for_first_connect(
        &self,
        timeout: Duration,
    ) -> Result<(), FirstConnectTimeout> {
        let mut first_ready = self.first_ready.clone();
        let target = self.pool_size;
        let result =
            tokio::time::timeout(timeout, first_ready.wait_for(|count| *count >= target)).await;
        match result {
            Ok(Ok(_)) => Ok(()),
            _ => Err(FirstConnectTimeout),
        }
    }

    /// Number of messages currently waiting in the publish queue.
    pub fn queue_depth(&self) -> usize {
        self.queue.depth()
    }

    /// Shut the pipeline down: stop every background loop and release the
    /// connection and channels.
    ///
    /// Messages still sitting in the queue are discarded, not drained.
    /// Idempotent - calling `close` twice is a no-op.
    pub async fn close(&self) {
        let _ = self.shutdown.send(true);
        let tasks = match self.tasks.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(_) => Vec::new(),
        };
        for task in tasks {
            let _ = task.await;
        }
    }
}

/// A builder for [`PublishPipeline`].
///
/// Use [`PublishPipeline::builder`] as entrypoint.
pub struct PipelineBuilder {
    settings: RabbitMqSettings,
    pipeline_settings: PipelineSettings,
    transport: Option<Arc<dyn Transport>>,
    observer: Arc<dyn PipelineObserver>,
    reconnect_delay: Option<Duration>,
    channel_retry_delay: Option<Duration>,
    publish_backoff: Option<Duration>,
    confirm_timeout: Option<Duration>,
    report_interval: Option<Duration>,
}

impl PipelineBuilder {
    fn new(settings: RabbitMqSettings) -> Self {
        Self {
            settings,
            pipeline_settings: PipelineSettings::default(),
            transport: None,
            observer: Arc::new(TracingObserver),
            reconnect_delay: None,
            channel_retry_delay: None,
            publish_backoff: None,
            confirm_timeout: None,
            report_interval: None,
        }
    }

    /// Configure the pipeline layered on top of the connection: pool size,
    /// publisher confirms, queue capacity, backpressure ratio and the timing
    /// knobs.
    #[must_use]
    pub fn pipeline_settings(mut self, pipeline_settings: PipelineSettings) -> Self {
        self.pipeline_settings = pipeline_settings;
        self
    }

    /// Swap the broker transport.
    ///
    /// Defaults to the lapin-backed [`ConnectionFactory`] built from the
    /// connection settings. Mainly useful to exercise the pipeline against an
    /// in-memory broker in tests.
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Swap the observer receiving the pipeline's lifecycle and delivery
    /// events. Defaults to [`TracingObserver`].
    #[must_use]
    pub fn observer(mut self, observer: Arc<dyn PipelineObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Override the delay between connection attempts.
    #[must_use]
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = Some(delay);
        self
    }

    /// Override the delay before a channel retries a failed open.
    #[must_use]
    pub fn channel_retry_delay(mut self, delay: Duration) -> Self {
        self.channel_retry_delay = Some(delay);
        self
    }

    /// Override the delay between dispatcher retry cycles.
    #[must_use]
    pub fn publish_backoff(mut self, backoff: Duration) -> Self {
        self.publish_backoff = Some(backoff);
        self
    }

    /// Override how long a publish waits for the broker's confirmation.
    #[must_use]
    pub fn confirm_timeout(mut self, timeout: Duration) -> Self {
        self.confirm_timeout = Some(timeout);
        self
    }

    /// Override the interval between aggregate publish reports.
    #[must_use]
    pub fn report_interval(mut self, interval: Duration) -> Self {
        self.report_interval = Some(interval);
        self
    }

    /// Finalise the builder, spawn the background machinery and get a
    /// [`PublishPipeline`].
    ///
    /// Must be called from within a Tokio runtime. Connecting happens in the
    /// background: use
    /// [`wait_for_first_connect`](PublishPipeline::wait_for_first_connect)
    /// to await a warm pool.
    pub fn build(self) -> Result<PublishPipeline, anyhow::Error> {
        let uris = self.settings.amqp_uris()?;
        let pipeline_settings = self.pipeline_settings;
        if pipeline_settings.channels == 0 {
            anyhow::bail!("The channel pool requires at least one channel.");
        }
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ConnectionFactory::new_from_config(&self.settings)?),
        };
        let observer = self.observer;

        let reconnect_delay = self
            .reconnect_delay
            .unwrap_or_else(|| pipeline_settings.reconnect_delay());
        let channel_retry_delay = self
            .channel_retry_delay
            .unwrap_or_else(|| pipeline_settings.channel_retry_delay());
        let publish_backoff = self
            .publish_backoff
            .unwrap_or_else(|| pipeline_settings.publish_backoff());
        let confirm_timeout = self
            .confirm_timeout
            .unwrap_or_else(|| pipeline_settings.confirm_timeout());
        let report_interval = self
            .report_interval
            .unwrap_or_else(|| pipeline_settings.report_interval());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (connection_tx, connection_rx) = watch::channel(None);
        let (first_ready_tx, first_ready_rx) = watch::channel(0usize);
        let first_ready_tx = Arc::new(first_ready_tx);

        let slots: Vec<Arc<ChannelSlot>> = (0..pipeline_settings.channels)
            .map(|index| {
                Arc::new(ChannelSlot::new(
                    index,
                    pipeline_settings.publisher_confirms,
                    confirm_timeout,
                ))
            })
            .collect();
        let pool = Arc::new(ChannelPool::new(slots));
        let (queue, inbox) = PublishQueue::new(pipeline_settings.queue_capacity);

        let mut tasks = Vec::with_capacity(pipeline_settings.channels + 2);
        for slot in pool.slots() {
            let context = SlotContext {
                connection: connection_rx.clone(),
                shutdown: shutdown_rx.clone(),
                retry_delay: channel_retry_delay,
                first_ready: first_ready_tx.clone(),
                observer: observer.clone(),
            };
            tasks.push(tokio::spawn(slot.clone().run(context)));
        }

        let manager = ConnectionManager::new(
            transport,
            uris,
            connection_tx,
            reconnect_delay,
            observer.clone(),
        );
        tasks.push(tokio::spawn(manager.run(shutdown_rx.clone())));

        let dispatcher = Dispatcher::new(
            queue.clone(),
            inbox,
            pool.clone(),
            observer,
            pipeline_settings.backpressure_threshold(),
            publish_backoff,
            report_interval,
            shutdown_rx,
        );
        tasks.push(tokio::spawn(dispatcher.run()));

        Ok(PublishPipeline {
            queue,
            pool,
            shutdown: shutdown_tx,
            first_ready: first_ready_rx,
            pool_size: pipeline_settings.channels,
            tasks: StdMutex::new(tasks),
        })
    }
}
