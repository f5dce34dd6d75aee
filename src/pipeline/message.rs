use lapin::BasicProperties;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;
use uuid::Uuid;

/// Content type attached to messages that do not specify one.
const DEFAULT_CONTENT_TYPE: &str = "text/plain";

/// A message waiting to be published.
///
/// Immutable once handed to the pipeline: the dispatcher may retry it against
/// several channels, and every attempt must publish exactly the same bytes to
/// exactly the same destination.
#[derive(Debug, Clone)]
pub struct PendingMessage {
    /// The name of the exchange we are publishing the message to.
    pub exchange: String,
    /// The routing key used by exchange listeners to determine if they are
    /// interested or not in the message.
    pub routing_key: String,
    /// The body of the message - as a sequence of bytes.
    pub payload: Vec<u8>,
    /// The MIME content type of the payload.
    /// Defaults to `text/plain` if left unspecified.
    pub content_type: Option<String>,
}

impl PendingMessage {
    pub fn new(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            payload,
            content_type: None,
        }
    }

    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Build the AMQP properties for one publish attempt.
    ///
    /// The timestamp reflects the attempt, not the enqueue, so a message that
    /// sat in the queue through an outage is stamped when it actually leaves.
    pub(crate) fn amqp_properties(&self) -> BasicProperties {
        let content_type = self.content_type.as_deref().unwrap_or(DEFAULT_CONTENT_TYPE);
        // Delivery mode: Non-persistent (1) or persistent (2).
        let properties = BasicProperties::default()
            .with_content_type(content_type.into())
            .with_delivery_mode(2)
            .with_message_id(Uuid::new_v4().to_string().into());
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(now) => properties.with_timestamp(now.as_secs()),
            Err(_) => {
                warn!("System time is before 1970");
                properties
            }
        }
    }
}

/// The result of a direct publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishOutcome {
    /// Whether the broker acknowledged the message.
    ///
    /// Always `false` when publisher confirms are disabled: the message was
    /// handed off locally, not confirmed.
    pub confirmed: bool,
    /// The channel-local delivery tag of the confirmed publish.
    /// `0` when publisher confirms are disabled.
    pub delivery_tag: u64,
}
