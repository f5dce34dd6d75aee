use crate::pipeline::error::{EnqueueError, PublishError};
use crate::pipeline::message::PendingMessage;
use crate::pipeline::observer::PipelineObserver;
use crate::pipeline::pool::ChannelPool;
use crate::pipeline::wait_cancelled;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// Producer side of the bounded queue feeding the dispatcher.
///
/// Enqueueing never blocks: when the queue is at capacity the caller gets
/// [`EnqueueError::QueueFull`] instead of stalling.
#[derive(Clone)]
pub(crate) struct PublishQueue {
    tx: mpsc::Sender<PendingMessage>,
}

impl PublishQueue {
    pub(crate) fn new(capacity: usize) -> (Self, mpsc::Receiver<PendingMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub(crate) fn enqueue(&self, message: PendingMessage) -> Result<(), EnqueueError> {
        self.tx.try_send(message).map_err(|error| match error {
            TrySendError::Full(_) => EnqueueError::QueueFull,
            TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }

    /// Number of messages currently waiting to be dispatched.
    pub(crate) fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

#[derive(Default)]
struct Counters {
    successes: u64,
    failures: u64,
    dropped: u64,
}

/// Drains the publish queue, one message at a time.
///
/// A failing message cycles through the ready channels (at most one attempt
/// per pool slot), then either backs off and retries or - once the queue has
/// crossed its backpressure threshold - is abandoned so the queue keeps
/// absorbing new traffic during an outage. Delivery is explicitly best-effort
/// past that threshold: hot-path latency is protected at the cost of dropped
/// messages, and every drop is reported to the observer.
pub(crate) struct Dispatcher {
    queue: PublishQueue,
    inbox: mpsc::Receiver<PendingMessage>,
    pool: Arc<ChannelPool>,
    observer: Arc<dyn PipelineObserver>,
    backpressure_threshold: usize,
    backoff: Duration,
    report_interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        queue: PublishQueue,
        inbox: mpsc::Receiver<PendingMessage>,
        pool: Arc<ChannelPool>,
        observer: Arc<dyn PipelineObserver>,
        backpressure_threshold: usize,
        backoff: Duration,
        report_interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            queue,
            inbox,
            pool,
            observer,
            backpressure_threshold,
            backoff,
            report_interval,
            shutdown,
        }
    }

    pub(crate) async fn run(mut self) {
        // First report lands one full interval in, not at startup.
        let start = tokio::time::Instant::now() + self.report_interval;
        let mut report = tokio::time::interval_at(start, self.report_interval);
        report.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut counters = Counters::default();

        loop {
            tokio::select! {
                _ = wait_cancelled(&mut self.shutdown) => return,
                _ = report.tick() => {
                    self.observer.queue_report(
                        self.queue.depth(),
                        counters.successes,
                        counters.failures,
                        counters.dropped,
                    );
                    counters = Counters::default();
                }
                message = self.inbox.recv() => {
                    // The inbox closing means the pipeline handle is gone.
                    let Some(message) = message else { return };
                    self.dispatch(message, &mut counters).await;
                }
            }
        }
    }

    /// Drive one message to success, drop, or shutdown.
    async fn dispatch(&mut self, message: PendingMessage, counters: &mut Counters) {
        loop {
            match self.try_publish(&message).await {
                Ok(()) => {
                    counters.successes += 1;
                    return;
                }
                Err(error) => {
                    counters.failures += 1;
                    self.observer.publish_failed(&message, &error);
                    let depth = self.queue.depth();
                    if depth > self.backpressure_threshold {
                        counters.dropped += 1;
                        self.observer.message_dropped(&message, depth);
                        return;
                    }
                    tokio::select! {
                        _ = wait_cancelled(&mut self.shutdown) => return,
                        _ = tokio::time::sleep(self.backoff) => {}
                    }
                }
            }
        }
    }

    /// One publish cycle: at most one attempt per pool slot, rotating to a
    /// different channel after each failure.
    async fn try_publish(&self, message: &PendingMessage) -> Result<(), PublishError> {
        let mut last_error = PublishError::NoChannelReady;
        for _ in 0..self.pool.size() {
            let Some(slot) = self.pool.acquire() else { break };
            match slot.publish(message).await {
                Ok(_) => return Ok(()),
                Err(error) => last_error = error,
            }
        }
        Err(last_error)
    }
}
