/// Error returned when trying to publish a message through the pipeline.
#[derive(thiserror::Error, Debug)]
pub enum PublishError {
    /// Every channel in the pool is mid-reconnect.
    ///
    /// This is a normal, transient condition while the connection is being
    /// re-established, not a sign of misconfiguration.
    #[error("No ready channel available in the pool.")]
    NoChannelReady,
    /// The broker refused the publish, or the connection failed while handing
    /// the message over.
    #[error("Failed to hand the message to the RabbitMq broker.")]
    Transport(#[source] anyhow::Error),
    /// The broker negatively acknowledged the message.
    #[error("The RabbitMq broker nacked the publishing of the message (delivery tag {0}).")]
    NotAcked(u64),
    /// No confirmation arrived within the configured window.
    #[error("Timed out waiting for the RabbitMq broker to confirm the message.")]
    ConfirmTimeout,
    /// The channel died between the publish and its confirmation.
    #[error("The channel closed before the broker confirmed the message.")]
    ChannelClosed,
}

/// Error returned when enqueueing a message for background publishing.
#[derive(thiserror::Error, Debug)]
pub enum EnqueueError {
    /// The publish queue is at capacity; the message was not accepted.
    #[error("The publish queue is full.")]
    QueueFull,
    /// The pipeline has been shut down.
    #[error("The publish pipeline has been closed.")]
    Closed,
}

/// Error returned by declarative pass-through operations.
#[derive(thiserror::Error, Debug)]
pub enum DeclareError {
    /// Every channel in the pool is mid-reconnect.
    #[error("No ready channel available in the pool.")]
    NoChannelReady,
    /// The broker rejected the operation.
    #[error(transparent)]
    Broker(#[from] anyhow::Error),
}

/// Error returned by [`PublishPipeline::wait_for_first_connect`](crate::pipeline::PublishPipeline::wait_for_first_connect).
#[derive(thiserror::Error, Debug)]
#[error("Timed out waiting for every channel to complete its first initialization.")]
pub struct FirstConnectTimeout;
