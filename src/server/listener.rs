//! Consumer loop feeding inbound messages to a [`MessageListener`].

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::janitor::close_now;
use crate::transport::{ConnectionFactory, Destination, Message};
use crate::types::{DispatcherConfig, Error, Result};

/// Receives inbound messages. Implementations report their own failures.
#[async_trait]
pub trait MessageListener: Send + Sync + 'static {
    async fn on_message(&self, message: Message);
}

/// Serves one destination: receives messages and hands each to the listener
/// on its own task, at most `max_in_flight` at a time.
#[derive(Debug)]
pub struct ListenerServer<L> {
    listener: Arc<L>,
    factory: Arc<dyn ConnectionFactory>,
    destination: Destination,
    cancel: CancellationToken,
    config: DispatcherConfig,
}

impl<L: MessageListener> ListenerServer<L> {
    pub fn new(
        listener: Arc<L>,
        factory: Arc<dyn ConnectionFactory>,
        destination: Destination,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            listener,
            factory,
            destination,
            cancel: CancellationToken::new(),
            config,
        }
    }

    /// Run until cancelled or the transport fails. In-flight messages are
    /// finished before the consumer, session and connection are released.
    pub async fn serve(&self) -> Result<()> {
        let connection = self.factory.create_connection().await?;
        let session = match connection.create_session().await {
            Ok(session) => session,
            Err(e) => {
                close_now(connection.as_ref()).await;
                return Err(e);
            }
        };
        let consumer = match session.create_consumer(&self.destination).await {
            Ok(consumer) => consumer,
            Err(e) => {
                close_now(session.as_ref()).await;
                close_now(connection.as_ref()).await;
                return Err(e);
            }
        };

        let max_in_flight = self.config.max_in_flight.max(1);
        let in_flight = Arc::new(Semaphore::new(max_in_flight));
        let mut outcome = connection.start().await;
        if outcome.is_ok() {
            tracing::info!(
                "listener_serving: destination={}, max_in_flight={}",
                self.destination,
                max_in_flight
            );
        }

        while outcome.is_ok() {
            let permit = tokio::select! {
                _ = self.cancel.cancelled() => break,
                permit = in_flight.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(e) => {
                        outcome = Err(Error::execution(e.to_string()));
                        break;
                    }
                },
            };
            let received = tokio::select! {
                _ = self.cancel.cancelled() => break,
                received = consumer.receive(self.config.receive_timeout) => received,
            };
            match received {
                Ok(Some(message)) => {
                    tracing::debug!(
                        "listener_received: destination={}, message={}",
                        self.destination,
                        message.id
                    );
                    let listener = self.listener.clone();
                    tokio::spawn(async move {
                        listener.on_message(message).await;
                        drop(permit);
                    });
                }
                Ok(None) => tracing::trace!("listener_idle: destination={}", self.destination),
                Err(e) => outcome = Err(e),
            }
        }

        // Wait for in-flight handlers before tearing the consumer down.
        let all = u32::try_from(max_in_flight).unwrap_or(u32::MAX);
        let _ = in_flight.acquire_many(all).await;

        close_now(consumer.as_ref()).await;
        close_now(session.as_ref()).await;
        close_now(connection.as_ref()).await;
        match &outcome {
            Ok(()) => tracing::info!("listener_stopped: destination={}", self.destination),
            Err(e) => tracing::warn!(
                "listener_failed: destination={}, error={}",
                self.destination,
                e
            ),
        }
        outcome
    }

    /// Request graceful shutdown.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Token cancelling this server, for wiring into a wider shutdown.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}
