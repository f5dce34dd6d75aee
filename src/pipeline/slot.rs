use crate::amqp::transport::{
    Delivery, QueueOptions, TransportChannel, TransportConnection,
};
use crate::pipeline::confirm::ConfirmTracker;
use crate::pipeline::error::{DeclareError, PublishError};
use crate::pipeline::message::{PendingMessage, PublishOutcome};
use crate::pipeline::observer::PipelineObserver;
use crate::pipeline::wait_cancelled;
use lapin::ExchangeKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};

/// The connection currently shared by the manager with every slot.
/// `None` while disconnected.
pub(crate) type SharedConnection = Option<Arc<dyn TransportConnection>>;

/// One pooled channel plus its reconnect state.
///
/// A slot is an independent failure domain: it owns its channel handle
/// exclusively, re-creates it whenever the underlying connection cycles or
/// the channel itself dies, and is only marked ready once the handle is fully
/// initialized - confirm mode included when reliability is requested.
pub(crate) struct ChannelSlot {
    index: usize,
    confirms: bool,
    ready: AtomicBool,
    initialized_once: AtomicBool,
    handle: StdMutex<Option<Arc<dyn TransportChannel>>>,
    /// Serializes the publish + confirm-wait pair so confirmations cannot be
    /// cross-wired between concurrent callers on the same channel.
    serialize: Mutex<()>,
    tracker: ConfirmTracker,
}

/// Everything a slot's background loop needs from its surroundings.
pub(crate) struct SlotContext {
    pub(crate) connection: watch::Receiver<SharedConnection>,
    pub(crate) shutdown: watch::Receiver<bool>,
    pub(crate) retry_delay: Duration,
    pub(crate) first_ready: Arc<watch::Sender<usize>>,
    pub(crate) observer: Arc<dyn PipelineObserver>,
}

impl ChannelSlot {
    pub(crate) fn new(index: usize, confirms: bool, confirm_timeout: Duration) -> Self {
        Self {
            index,
            confirms,
            ready: AtomicBool::new(false),
            initialized_once: AtomicBool::new(false),
            handle: StdMutex::new(None),
            serialize: Mutex::new(()),
            tracker: ConfirmTracker::new(confirm_timeout),
        }
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// The current channel handle, if the slot is ready.
    fn channel(&self) -> Option<Arc<dyn TransportChannel>> {
        if !self.is_ready() {
            return None;
        }
        self.handle.lock().ok()?.clone()
    }

    fn install(&self, channel: Arc<dyn TransportChannel>, first_ready: &watch::Sender<usize>) {
        if let Ok(mut guard) = self.handle.lock() {
            *guard = Some(channel);
        }
        // The handle must be in place before the slot advertises itself.
        self.ready.store(true, Ordering::Release);
        if !self.initialized_once.swap(true, Ordering::AcqRel) {
            first_ready.send_modify(|count| *count += 1);
        }
    }

    fn clear(&self) {
        // Readiness is revoked before the handle goes away, so acquire never
        // hands out a slot whose close notification already fired.
        self.ready.store(false, Ordering::Release);
        if let Ok(mut guard) = self.handle.lock() {
            *guard = None;
        }
    }

    /// The slot's background loop: (re-)initialize the channel against the
    /// current connection, then sleep until the channel or the connection is
    /// invalidated. Failed opens retry after a fixed delay without the slot
    /// ever becoming ready.
    pub(crate) async fn run(self: Arc<Self>, mut ctx: SlotContext) {
        loop {
            let Some(connection) = ({
                tokio::select! {
                    _ = wait_cancelled(&mut ctx.shutdown) => return,
                    connection = wait_connection(&mut ctx.connection) => connection,
                }
            }) else {
                return;
            };

            match connection.open_channel(self.confirms).await {
                Ok(channel) => {
                    let channel: Arc<dyn TransportChannel> = Arc::from(channel);
                    self.install(channel.clone(), &ctx.first_ready);
                    ctx.observer.channel_ready(self.index);
                    tokio::select! {
                        _ = wait_cancelled(&mut ctx.shutdown) => {
                            self.clear();
                            return;
                        }
                        _ = channel.closed() => {}
                        _ = ctx.connection.changed() => {}
                    }
                    self.clear();
                    ctx.observer.channel_lost(self.index);
                }
                Err(error) => {
                    ctx.observer.channel_open_failed(self.index, &error);
                    tokio::select! {
                        _ = wait_cancelled(&mut ctx.shutdown) => return,
                        _ = tokio::time::sleep(ctx.retry_delay) => {}
                        _ = ctx.connection.changed() => {}
                    }
                }
            }
        }
    }

    /// Publish one message on this slot, waiting for the broker's
    /// confirmation when reliability is requested.
    pub(crate) async fn publish(
        &self,
        message: &PendingMessage,
    ) -> Result<PublishOutcome, PublishError> {
        let channel = self.channel().ok_or(PublishError::NoChannelReady)?;
        let _ordering = self.serialize.lock().await;
        channel
            .publish(
                &message.exchange,
                &message.routing_key,
                &message.payload,
                message.amqp_properties(),
            )
            .await
            .map_err(PublishError::Transport)?;
        if self.confirms {
            let delivery_tag = self.tracker.await_next(channel.as_ref()).await?;
            Ok(PublishOutcome {
                confirmed: true,
                delivery_tag,
            })
        } else {
            Ok(PublishOutcome {
                confirmed: false,
                delivery_tag: 0,
            })
        }
    }

    pub(crate) async fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), DeclareError> {
        let channel = self.channel().ok_or(DeclareError::NoChannelReady)?;
        Ok(channel.exchange_declare(exchange, kind, durable).await?)
    }

    pub(crate) async fn queue_declare(
        &self,
        queue: &str,
        options: &QueueOptions,
    ) -> Result<(), DeclareError> {
        let channel = self.channel().ok_or(DeclareError::NoChannelReady)?;
        Ok(channel.queue_declare(queue, options).await?)
    }

    pub(crate) async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), DeclareError> {
        let channel = self.channel().ok_or(DeclareError::NoChannelReady)?;
        Ok(channel.queue_bind(queue, exchange, routing_key).await?)
    }

    pub(crate) async fn consume(
        &self,
        queue: &str,
    ) -> Result<mpsc::Receiver<Delivery>, DeclareError> {
        let channel = self.channel().ok_or(DeclareError::NoChannelReady)?;
        Ok(channel.consume(queue).await?)
    }

    #[cfg(test)]
    pub(crate) fn force_ready_for_tests(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }
}

/// Wait until the manager broadcasts a live connection.
///
/// Returns `None` if the broadcast channel itself is gone, which only happens
/// when the pipeline is being torn down.
async fn wait_connection(
    rx: &mut watch::Receiver<SharedConnection>,
) -> Option<Arc<dyn TransportConnection>> {
    match rx.wait_for(|connection| connection.is_some()).await {
        Ok(connection) => connection.clone(),
        Err(_) => None,
    }
}
