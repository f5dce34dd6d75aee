use crate::amqp::transport::{ConfirmEvent, TransportChannel};
use crate::pipeline::error::PublishError;
use std::time::Duration;

/// Pairs one publish with the broker's next confirmation on the same channel.
///
/// The broker confirms publishes strictly in order per channel, so after
/// issuing exactly one publish the tracker waits for exactly the next event -
/// never batching waits across in-flight publishes, never skipping. The
/// caller is responsible for serializing publish/wait pairs on the channel
/// (the owning slot holds a lock across both).
pub(crate) struct ConfirmTracker {
    timeout: Duration,
}

impl ConfirmTracker {
    pub(crate) fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Wait for the next confirmation, bounded by the configured timeout.
    ///
    /// Returns the confirmed delivery tag on an ack.
    pub(crate) async fn await_next(
        &self,
        channel: &dyn TransportChannel,
    ) -> Result<u64, PublishError> {
        match tokio::time::timeout(self.timeout, channel.next_confirmation()).await {
            Err(_) => Err(PublishError::ConfirmTimeout),
            Ok(None) => Err(PublishError::ChannelClosed),
            Ok(Some(ConfirmEvent {
                delivery_tag,
                ack: true,
            })) => Ok(delivery_tag),
            Ok(Some(ConfirmEvent {
                delivery_tag,
                ack: false,
            })) => Err(PublishError::NotAcked(delivery_tag)),
        }
    }
}
