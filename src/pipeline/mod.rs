//! The resilient publish pipeline: connection management, channel pooling,
//! queued dispatch with backpressure, and publisher-confirm tracking.

mod confirm;
mod dispatcher;
mod error;
mod manager;
mod message;
mod observer;
#[allow(clippy::module_inception)]
mod pipeline;
mod pool;
mod slot;

pub use error::{DeclareError, EnqueueError, FirstConnectTimeout, PublishError};
pub use message::{PendingMessage, PublishOutcome};
pub use observer::{PipelineObserver, TracingObserver};
pub use pipeline::{PipelineBuilder, PublishPipeline};

use tokio::sync::watch;

/// Suspend until the root shutdown signal fires.
///
/// A dropped sender counts as cancellation: the pipeline owning these loops
/// is gone.
pub(crate) async fn wait_cancelled(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
