//! The narrow seam between the pipeline and the underlying AMQP client.
//!
//! The pipeline never touches [`lapin`] directly: everything goes through the
//! [`Transport`] / [`TransportConnection`] / [`TransportChannel`] traits, so the
//! reconnect and backpressure machinery can be exercised against an in-memory
//! broker in tests while production wires in the lapin-backed implementations
//! from this module.

use futures_util::StreamExt;
use lapin::{
    options::{
        BasicConsumeOptions, BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    publisher_confirm::{Confirmation, PublisherConfirm},
    types::FieldTable,
    uri::AMQPUri,
    BasicProperties, ExchangeKind,
};
use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::sync::{mpsc, watch, Mutex};

/// How many in-flight deliveries a `consume` receiver buffers before the
/// forwarder stops pulling from the broker.
const DELIVERY_BUFFER: usize = 64;

/// A broker-side confirmation for one published message.
///
/// Confirmations are delivered strictly in publish order on each channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmEvent {
    /// The channel-local sequence number of the confirmed publish, counted
    /// from 1 the way AMQP numbers delivery tags.
    pub delivery_tag: u64,
    /// `true` if the broker durably accepted the message.
    pub ack: bool,
}

/// A message received from a queue via [`TransportChannel::consume`].
#[derive(Debug, Clone)]
pub struct Delivery {
    pub exchange: String,
    pub routing_key: String,
    pub delivery_tag: u64,
    pub payload: Vec<u8>,
}

#[derive(Clone, PartialEq, Eq, Debug)]
/// Configuration options when declaring a new queue.
pub struct QueueOptions {
    /// Will the queue survive a broker restart?
    pub durability: Durability,
    pub access: Access,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            durability: Durability::Durable,
            access: Access::Shared,
        }
    }
}

/// Will the queue survive a broker restart?
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Durability {
    /// The queue survives a broker restart.
    ///
    /// Metadata of a durable queue is stored on disk.
    Durable,
    /// Transient queues are deleted on node boot, together with their
    /// messages. Metadata of a transient queue is stored in memory when
    /// possible.
    Transient,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Access {
    /// The queue is used by only one connection and it will be deleted when that connection closes.
    Exclusive,
    /// The queue can be used by multiple connections concurrently.
    Shared,
}

/// A dialer for physical broker connections.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Establish a new physical connection to the broker at `uri`.
    async fn dial(&self, uri: &AMQPUri) -> Result<Box<dyn TransportConnection>, anyhow::Error>;
}

/// One physical connection to a broker.
#[async_trait::async_trait]
pub trait TransportConnection: Send + Sync + 'static {
    /// Open a fresh channel on this connection.
    ///
    /// With `confirms` enabled the channel is put in confirm mode and its
    /// confirmation subscription is armed before the handle is returned.
    async fn open_channel(
        &self,
        confirms: bool,
    ) -> Result<Box<dyn TransportChannel>, anyhow::Error>;

    /// Resolves once the connection is irrecoverably closed.
    ///
    /// The notification fires exactly once per connection lifetime.
    async fn closed(&self);

    /// Close the connection explicitly.
    async fn close(&self);
}

/// One channel multiplexed over a [`TransportConnection`].
#[async_trait::async_trait]
pub trait TransportChannel: Send + Sync + 'static {
    /// Hand one message to the broker.
    ///
    /// Returns as soon as the broker accepts the publish locally; a
    /// broker-side acknowledgement, if requested, is consumed separately via
    /// [`TransportChannel::next_confirmation`].
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), anyhow::Error>;

    /// Wait for the next broker confirmation on this channel.
    ///
    /// Confirmations arrive strictly in publish order; callers must consume
    /// exactly one event per confirm-mode publish. Returns `None` if the
    /// channel died before the confirmation arrived.
    async fn next_confirmation(&self) -> Option<ConfirmEvent>;

    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), anyhow::Error>;

    async fn queue_declare(&self, queue: &str, options: &QueueOptions)
        -> Result<(), anyhow::Error>;

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), anyhow::Error>;

    /// Start consuming from `queue` in auto-ack mode.
    ///
    /// Deliveries are forwarded to the returned receiver until the channel or
    /// the receiver is dropped. Consumer-side processing and explicit
    /// acknowledgement are out of this crate's scope.
    async fn consume(&self, queue: &str) -> Result<mpsc::Receiver<Delivery>, anyhow::Error>;

    /// Resolves once the channel is irrecoverably closed.
    async fn closed(&self);
}

/// A one-shot close notification, tripped at most once and observable by any
/// number of waiters.
#[derive(Clone)]
pub(crate) struct CloseSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl CloseSignal {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub(crate) fn trip(&self) {
        let _ = self.tx.send(true);
    }

    pub(crate) async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

/// Lapin-backed [`TransportConnection`].
pub struct AmqpConnection {
    inner: lapin::Connection,
    close_signal: CloseSignal,
}

impl AmqpConnection {
    pub fn new(connection: lapin::Connection) -> Self {
        let close_signal = CloseSignal::new();
        let on_close = close_signal.clone();
        connection.on_error(move |_| on_close.trip());
        Self {
            inner: connection,
            close_signal,
        }
    }
}

#[async_trait::async_trait]
impl TransportConnection for AmqpConnection {
    async fn open_channel(
        &self,
        confirms: bool,
    ) -> Result<Box<dyn TransportChannel>, anyhow::Error> {
        let channel = self.inner.create_channel().await?;
        if confirms {
            // Enable publish confirms on the channel
            // See https://www.rabbitmq.com/amqp-0-9-1-reference.html#confirm.select.nowait
            channel
                .confirm_select(ConfirmSelectOptions { nowait: false })
                .await?;
        }
        Ok(Box::new(AmqpChannel::new(channel, confirms)))
    }

    async fn closed(&self) {
        self.close_signal.wait().await;
    }

    async fn close(&self) {
        // 320 CONNECTION_FORCED is the conventional reply code for an
        // operator-initiated close.
        let _ = self.inner.close(320, "pipeline shutdown").await;
        self.close_signal.trip();
    }
}

/// Lapin-backed [`TransportChannel`].
///
/// Lapin models broker confirmations as one future per publish rather than an
/// event stream; the pending futures are kept FIFO and drained one at a time
/// by [`next_confirmation`](TransportChannel::next_confirmation), which
/// preserves the broker's per-channel confirmation order. Lapin does not
/// expose the broker's delivery tag on a confirmation, so the channel counts
/// confirm-mode publishes itself — the numbering is identical (sequential
/// from 1 per channel).
pub struct AmqpChannel {
    inner: lapin::Channel,
    confirms: bool,
    pending: Mutex<VecDeque<PublisherConfirm>>,
    publish_seq: AtomicU64,
    close_signal: CloseSignal,
}

impl AmqpChannel {
    fn new(channel: lapin::Channel, confirms: bool) -> Self {
        let close_signal = CloseSignal::new();
        let on_close = close_signal.clone();
        channel.on_error(move |_| on_close.trip());
        Self {
            inner: channel,
            confirms,
            pending: Mutex::new(VecDeque::new()),
            publish_seq: AtomicU64::new(0),
            close_signal,
        }
    }
}

#[async_trait::async_trait]
impl TransportChannel for AmqpChannel {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), anyhow::Error> {
        let options = BasicPublishOptions {
            // This flag tells the server how to react if the message cannot be routed to a queue.
            // If this flag is `true`, the server will return an unroutable message with a Return method.
            // If this flag is `false`, the server silently drops the message.
            mandatory: self.confirms,
            // The immediate flag was dropped in RabbitMQ 3.0 - see https://www.rabbitmq.com/blog/2012/11/19/breaking-things-with-rabbitmq-3-0/
            // Setting `true` will cause a not-supported error
            immediate: false,
        };
        let confirm = self
            .inner
            .basic_publish(exchange, routing_key, options, payload, properties)
            .await?;
        if self.confirms {
            self.pending.lock().await.push_back(confirm);
        }
        Ok(())
    }

    async fn next_confirmation(&self) -> Option<ConfirmEvent> {
        let confirm = self.pending.lock().await.pop_front()?;
        let delivery_tag = self.publish_seq.fetch_add(1, Ordering::Relaxed) + 1;
        match confirm.await {
            Ok(Confirmation::Ack(return_message)) => {
                // Reply Code 312 - NO_ROUTE: the broker accepted the publish
                // but could not route it anywhere, which for the pipeline's
                // purposes is a failed delivery.
                // See https://www.rabbitmq.com/amqp-0-9-1-reference.html
                let routed = return_message.map_or(true, |m| m.reply_code != 312);
                Some(ConfirmEvent {
                    delivery_tag,
                    ack: routed,
                })
            }
            Ok(Confirmation::Nack(_)) => Some(ConfirmEvent {
                delivery_tag,
                ack: false,
            }),
            Ok(Confirmation::NotRequested) => {
                unreachable!("confirmations are enabled on this channel")
            }
            Err(_) => None,
        }
    }

    #[tracing::instrument(name = "rabbitmq_declare_exchange", skip(self))]
    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), anyhow::Error> {
        let options = ExchangeDeclareOptions {
            passive: false,
            durable,
            auto_delete: false,
            internal: false,
            nowait: false,
        };
        self.inner
            .exchange_declare(exchange, kind, options, FieldTable::default())
            .await?;
        Ok(())
    }

    #[tracing::instrument(name = "rabbitmq_declare_queue", skip(self, options))]
    async fn queue_declare(
        &self,
        queue: &str,
        options: &QueueOptions,
    ) -> Result<(), anyhow::Error> {
        let options = QueueDeclareOptions {
            passive: false,
            durable: options.durability == Durability::Durable,
            exclusive: options.access == Access::Exclusive,
            auto_delete: false,
            nowait: false,
        };
        self.inner
            .queue_declare(queue, options, FieldTable::default())
            .await?;
        Ok(())
    }

    #[tracing::instrument(name = "rabbitmq_bind_queue", skip(self))]
    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), anyhow::Error> {
        self.inner
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<mpsc::Receiver<Delivery>, anyhow::Error> {
        let mut consumer = self
            .inner
            .basic_consume(
                queue,
                &uuid::Uuid::new_v4().to_string(),
                BasicConsumeOptions {
                    no_ack: true,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        let (tx, rx) = mpsc::channel(DELIVERY_BUFFER);
        tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                let Ok(delivery) = delivery else { break };
                let delivery = Delivery {
                    exchange: delivery.exchange.as_str().to_owned(),
                    routing_key: delivery.routing_key.as_str().to_owned(),
                    delivery_tag: delivery.delivery_tag,
                    payload: delivery.data,
                };
                if tx.send(delivery).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn closed(&self) {
        self.close_signal.wait().await;
    }
}
