use crate::amqp::transport::{Transport, TransportConnection};
use crate::pipeline::observer::PipelineObserver;
use crate::pipeline::slot::SharedConnection;
use crate::pipeline::wait_cancelled;
use lapin::uri::AMQPUri;
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Owns the single physical connection to the broker.
///
/// The manager runs the outer reconnect loop: dial one of the configured
/// addresses (picked uniformly at random, so a cluster's nodes share the
/// connection load), broadcast the live connection to every channel slot,
/// wait for its close notification, start over. Dial failures are retried
/// indefinitely at a fixed delay and are never fatal - the only caller-visible
/// signal of a cold broker is the `wait_for_first_connect` timeout.
pub(crate) struct ConnectionManager {
    transport: Arc<dyn Transport>,
    uris: Vec<AMQPUri>,
    connection: watch::Sender<SharedConnection>,
    reconnect_delay: Duration,
    observer: Arc<dyn PipelineObserver>,
}

impl ConnectionManager {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        uris: Vec<AMQPUri>,
        connection: watch::Sender<SharedConnection>,
        reconnect_delay: Duration,
        observer: Arc<dyn PipelineObserver>,
    ) -> Self {
        Self {
            transport,
            uris,
            connection,
            reconnect_delay,
            observer,
        }
    }

    pub(crate) async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let connection = tokio::select! {
                _ = wait_cancelled(&mut shutdown) => break,
                connection = self.connect() => connection,
            };
            self.connection.send_replace(Some(connection.clone()));

            tokio::select! {
                _ = wait_cancelled(&mut shutdown) => {
                    connection.close().await;
                    break;
                }
                _ = connection.closed() => {
                    self.observer.connection_lost();
                    self.connection.send_replace(None);
                }
            }
        }
        self.connection.send_replace(None);
    }

    /// Dial until a connection is established.
    async fn connect(&self) -> Arc<dyn TransportConnection> {
        loop {
            let uri = self.pick_uri();
            match self.transport.dial(uri).await {
                Ok(connection) => {
                    let address = format!("{}:{}", uri.authority.host, uri.authority.port);
                    self.observer.connected(&address);
                    return Arc::from(connection);
                }
                Err(error) => {
                    self.observer.connect_failed(&error);
                    tokio::time::sleep(self.reconnect_delay).await;
                }
            }
        }
    }

    fn pick_uri(&self) -> &AMQPUri {
        self.uris
            .choose(&mut rand::thread_rng())
            .expect("the address list is validated as non-empty when the pipeline is built")
    }
}
