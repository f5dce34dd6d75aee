//! Events emitted by the pipeline's background machinery.
//!
//! The pipeline does not own log formatting or metrics: it reports what
//! happened to an injected [`PipelineObserver`] and moves on. The default
//! observer, [`TracingObserver`], forwards everything to [`tracing`].

use crate::pipeline::error::PublishError;
use crate::pipeline::message::PendingMessage;
use tracing::{info, warn};

/// Sink for the pipeline's lifecycle and delivery events.
///
/// All methods default to no-ops, so implementors only override what they
/// care about. Methods are called from background tasks and must not block.
#[allow(unused_variables)]
pub trait PipelineObserver: Send + Sync + 'static {
    /// A dial attempt failed; the manager will retry after its fixed delay.
    fn connect_failed(&self, error: &anyhow::Error) {}

    /// A connection was established to `address`.
    fn connected(&self, address: &str) {}

    /// The active connection dropped; every channel is about to re-open.
    fn connection_lost(&self) {}

    /// Channel `index` finished initializing and is accepting publishes.
    fn channel_ready(&self, index: usize) {}

    /// Channel `index` failed to open; it will retry after its fixed delay.
    fn channel_open_failed(&self, index: usize, error: &anyhow::Error) {}

    /// Channel `index` was invalidated by a close notification.
    fn channel_lost(&self, index: usize) {}

    /// One publish attempt failed; the dispatcher decides whether to retry
    /// or drop based on queue depth.
    fn publish_failed(&self, message: &PendingMessage, error: &PublishError) {}

    /// A message was abandoned because the queue crossed the backpressure
    /// threshold while it was failing.
    fn message_dropped(&self, message: &PendingMessage, depth: usize) {}

    /// Periodic aggregate counters, reset after each report.
    fn queue_report(&self, depth: usize, successes: u64, failures: u64, dropped: u64) {}
}

/// The default observer: forwards every event to [`tracing`].
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl PipelineObserver for TracingObserver {
    fn connect_failed(&self, error: &anyhow::Error) {
        warn!("Failed to connect to RabbitMQ: {:?}", error);
    }

    fn connected(&self, address: &str) {
        info!(address, "Connected to RabbitMQ");
    }

    fn connection_lost(&self) {
        warn!("RabbitMQ broken connection");
    }

    fn channel_ready(&self, index: usize) {
        info!(channel = index, "RabbitMQ channel ready");
    }

    fn channel_open_failed(&self, index: usize, error: &anyhow::Error) {
        warn!(channel = index, "Failed to open RabbitMQ channel: {:?}", error);
    }

    fn channel_lost(&self, index: usize) {
        warn!(channel = index, "RabbitMQ channel closed");
    }

    fn publish_failed(&self, message: &PendingMessage, error: &PublishError) {
        warn!(
            exchange = %message.exchange,
            routing_key = %message.routing_key,
            "Failed to publish message: {:?}",
            error
        );
    }

    fn message_dropped(&self, message: &PendingMessage, depth: usize) {
        warn!(
            exchange = %message.exchange,
            routing_key = %message.routing_key,
            depth,
            "Publish queue crossed its backpressure threshold, dropping message"
        );
    }

    fn queue_report(&self, depth: usize, successes: u64, failures: u64, dropped: u64) {
        info!(depth, successes, failures, dropped, "Publish pipeline report");
    }
}
