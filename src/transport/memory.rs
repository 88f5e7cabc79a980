//! In-process broker implementing the transport contract.
//!
//! Named queues are created on first use and shared by competing consumers.
//! Temporary queues belong to the connection that created them and disappear
//! when it closes; sending to one afterwards is a transport failure. Closing
//! a connection closes its sessions, closing a session closes its producers
//! and consumers (cancellation tokens form that hierarchy).

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::{
    Closeable, Connection, ConnectionFactory, Consumer, Destination, Message, Producer, Session,
};
use crate::types::{ConnectionId, Error, QueueName, Result};

#[derive(Debug)]
struct Queue {
    tx: mpsc::UnboundedSender<Message>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>,
    /// Owning connection, for temporary queues.
    owner: Option<ConnectionId>,
}

impl Queue {
    fn new(owner: Option<ConnectionId>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            owner,
        })
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: Mutex<HashMap<QueueName, Arc<Queue>>>,
    temp_seq: AtomicU64,
}

impl BrokerState {
    fn queues(&self) -> MutexGuard<'_, HashMap<QueueName, Arc<Queue>>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolve a destination. Named queues are created on demand, temporary
    /// ones must still exist.
    fn resolve(&self, destination: &Destination) -> Result<Arc<Queue>> {
        let mut queues = self.queues();
        if let Some(queue) = queues.get(&destination.name) {
            return Ok(queue.clone());
        }
        if destination.temporary {
            return Err(Error::transport(format!(
                "temporary destination no longer exists: {}",
                destination
            )));
        }
        let queue = Queue::new(None);
        queues.insert(destination.name.clone(), queue.clone());
        tracing::trace!("memory_broker_queue_created: {}", destination);
        Ok(queue)
    }

    fn delete_temporary_queues(&self, owner: &ConnectionId) -> usize {
        let mut queues = self.queues();
        let before = queues.len();
        queues.retain(|_, queue| queue.owner.as_ref() != Some(owner));
        before - queues.len()
    }
}

// =============================================================================
// Broker (connection factory)
// =============================================================================

/// In-memory broker. Cloning shares the same queues.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of temporary queues currently alive.
    pub fn temporary_queue_count(&self) -> usize {
        self.state
            .queues()
            .values()
            .filter(|queue| queue.owner.is_some())
            .count()
    }

    /// Whether a queue with this name currently exists.
    pub fn has_queue(&self, name: &QueueName) -> bool {
        self.state.queues().contains_key(name)
    }
}

#[async_trait]
impl ConnectionFactory for MemoryBroker {
    async fn create_connection(&self) -> Result<Box<dyn Connection>> {
        let (started, _) = watch::channel(false);
        Ok(Box::new(MemoryConnection {
            id: ConnectionId::new(),
            state: self.state.clone(),
            token: CancellationToken::new(),
            started,
        }))
    }
}

// =============================================================================
// Connection
// =============================================================================

#[derive(Debug)]
struct MemoryConnection {
    id: ConnectionId,
    state: Arc<BrokerState>,
    token: CancellationToken,
    started: watch::Sender<bool>,
}

impl MemoryConnection {
    fn release(&self) {
        self.token.cancel();
        let deleted = self.state.delete_temporary_queues(&self.id);
        if deleted > 0 {
            tracing::trace!(
                "memory_broker_temporary_queues_deleted: connection={}, count={}",
                self.id,
                deleted
            );
        }
    }
}

#[async_trait]
impl Closeable for MemoryConnection {
    async fn close(&self) -> Result<()> {
        self.started.send_replace(false);
        self.release();
        Ok(())
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn create_session(&self) -> Result<Box<dyn Session>> {
        if self.token.is_cancelled() {
            return Err(Error::transport("connection closed"));
        }
        Ok(Box::new(MemorySession {
            connection_id: self.id.clone(),
            state: self.state.clone(),
            token: self.token.child_token(),
            started: self.started.subscribe(),
        }))
    }

    async fn start(&self) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(Error::transport("connection closed"));
        }
        self.started.send_replace(true);
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.release();
    }
}

// =============================================================================
// Session
// =============================================================================

#[derive(Debug)]
struct MemorySession {
    connection_id: ConnectionId,
    state: Arc<BrokerState>,
    token: CancellationToken,
    started: watch::Receiver<bool>,
}

impl MemorySession {
    fn ensure_open(&self) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(Error::transport("session closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl Closeable for MemorySession {
    async fn close(&self) -> Result<()> {
        self.token.cancel();
        Ok(())
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn create_temporary_queue(&self) -> Result<Destination> {
        self.ensure_open()?;
        let seq = self.state.temp_seq.fetch_add(1, Ordering::Relaxed);
        let name = QueueName::from_string(format!("ID:{}:{}", self.connection_id, seq))
            .map_err(Error::transport)?;
        self.state
            .queues()
            .insert(name.clone(), Queue::new(Some(self.connection_id.clone())));
        Ok(Destination::temporary(name))
    }

    async fn create_producer(&self, destination: &Destination) -> Result<Box<dyn Producer>> {
        self.ensure_open()?;
        Ok(Box::new(MemoryProducer {
            state: self.state.clone(),
            destination: destination.clone(),
            token: self.token.child_token(),
        }))
    }

    async fn create_consumer(&self, destination: &Destination) -> Result<Box<dyn Consumer>> {
        self.ensure_open()?;
        let queue = self.state.resolve(destination)?;
        Ok(Box::new(MemoryConsumer {
            queue,
            token: self.token.child_token(),
            started: self.started.clone(),
        }))
    }
}

// =============================================================================
// Producer / Consumer
// =============================================================================

#[derive(Debug)]
struct MemoryProducer {
    state: Arc<BrokerState>,
    destination: Destination,
    token: CancellationToken,
}

#[async_trait]
impl Closeable for MemoryProducer {
    async fn close(&self) -> Result<()> {
        self.token.cancel();
        Ok(())
    }
}

#[async_trait]
impl Producer for MemoryProducer {
    async fn send(&self, message: Message) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(Error::transport("producer closed"));
        }
        let queue = self.state.resolve(&self.destination)?;
        queue
            .tx
            .send(message)
            .map_err(|_| Error::transport(format!("destination closed: {}", self.destination)))
    }
}

#[derive(Debug)]
struct MemoryConsumer {
    queue: Arc<Queue>,
    token: CancellationToken,
    started: watch::Receiver<bool>,
}

impl MemoryConsumer {
    async fn next_message(&self) -> Result<Message> {
        let mut started = self.started.clone();
        let running = started.wait_for(|started| *started).await.is_ok();
        if !running {
            return Err(Error::transport("connection closed"));
        }
        let mut rx = self.queue.rx.lock().await;
        rx.recv()
            .await
            .ok_or_else(|| Error::transport("queue deleted"))
    }
}

#[async_trait]
impl Closeable for MemoryConsumer {
    async fn close(&self) -> Result<()> {
        self.token.cancel();
        Ok(())
    }
}

#[async_trait]
impl Consumer for MemoryConsumer {
    async fn receive(&self, timeout: Option<Duration>) -> Result<Option<Message>> {
        if self.token.is_cancelled() {
            return Err(Error::transport("consumer closed"));
        }
        let wait = async {
            tokio::select! {
                _ = self.token.cancelled() => Err(Error::transport("consumer closed")),
                message = self.next_message() => message.map(Some),
            }
        };
        match timeout {
            Some(deadline) => match tokio::time::timeout(deadline, wait).await {
                Ok(result) => result,
                Err(_elapsed) => Ok(None),
            },
            None => wait.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open(broker: &MemoryBroker) -> (Box<dyn Connection>, Box<dyn Session>) {
        let connection = broker.create_connection().await.unwrap();
        let session = connection.create_session().await.unwrap();
        (connection, session)
    }

    #[tokio::test]
    async fn test_send_and_receive_named_queue() {
        let broker = MemoryBroker::new();
        let (connection, session) = open(&broker).await;
        let queue = Destination::named("TestQueue").unwrap();

        let consumer = session.create_consumer(&queue).await.unwrap();
        let producer = session.create_producer(&queue).await.unwrap();
        connection.start().await.unwrap();

        producer.send(Message::text(Some("hello".into()))).await.unwrap();
        let received = consumer
            .receive(Some(Duration::from_secs(1)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.text_body(), Some("hello"));
    }

    #[tokio::test]
    async fn test_receive_times_out_when_empty() {
        let broker = MemoryBroker::new();
        let (connection, session) = open(&broker).await;
        let consumer = session
            .create_consumer(&Destination::named("Empty").unwrap())
            .await
            .unwrap();
        connection.start().await.unwrap();

        let received = consumer.receive(Some(Duration::from_millis(20))).await.unwrap();
        assert!(received.is_none());
    }

    #[tokio::test]
    async fn test_no_delivery_before_start() {
        let broker = MemoryBroker::new();
        let (connection, session) = open(&broker).await;
        let queue = Destination::named("Stopped").unwrap();
        let producer = session.create_producer(&queue).await.unwrap();
        let consumer = session.create_consumer(&queue).await.unwrap();

        producer.send(Message::text(None)).await.unwrap();
        assert!(consumer
            .receive(Some(Duration::from_millis(20)))
            .await
            .unwrap()
            .is_none());

        connection.start().await.unwrap();
        assert!(consumer
            .receive(Some(Duration::from_millis(100)))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_temporary_queue_deleted_on_connection_close() {
        let broker = MemoryBroker::new();
        let (connection, session) = open(&broker).await;
        let temp = session.create_temporary_queue().await.unwrap();
        assert!(temp.temporary);
        assert_eq!(broker.temporary_queue_count(), 1);
        assert!(broker.has_queue(&temp.name));

        connection.close().await.unwrap();
        assert_eq!(broker.temporary_queue_count(), 0);

        // A different connection can no longer reach it.
        let (_other, other_session) = open(&broker).await;
        let producer = other_session.create_producer(&temp).await.unwrap();
        let err = producer.send(Message::text(None)).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[tokio::test]
    async fn test_closing_session_closes_consumer() {
        let broker = MemoryBroker::new();
        let (connection, session) = open(&broker).await;
        let consumer = session
            .create_consumer(&Destination::named("Closing").unwrap())
            .await
            .unwrap();
        connection.start().await.unwrap();

        session.close().await.unwrap();
        let err = consumer.receive(Some(Duration::from_millis(20))).await.unwrap_err();
        assert!(err.to_string().contains("consumer closed"));
        assert!(session.create_temporary_queue().await.is_err());
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_receive() {
        let broker = MemoryBroker::new();
        let (connection, session) = open(&broker).await;
        let consumer: Arc<dyn Consumer> = Arc::from(
            session
                .create_consumer(&Destination::named("Blocked").unwrap())
                .await
                .unwrap(),
        );
        connection.start().await.unwrap();

        let waiter = {
            let consumer = consumer.clone();
            tokio::spawn(async move { consumer.receive(None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        connection.close().await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_competing_consumers_each_get_one() {
        let broker = MemoryBroker::new();
        let (connection, session) = open(&broker).await;
        let queue = Destination::named("Shared").unwrap();
        let first = session.create_consumer(&queue).await.unwrap();
        let second = session.create_consumer(&queue).await.unwrap();
        let producer = session.create_producer(&queue).await.unwrap();
        connection.start().await.unwrap();

        producer.send(Message::text(Some("a".into()))).await.unwrap();
        producer.send(Message::text(Some("b".into()))).await.unwrap();

        let timeout = Some(Duration::from_millis(100));
        let a = first.receive(timeout).await.unwrap().unwrap();
        let b = second.receive(timeout).await.unwrap().unwrap();
        assert_eq!(a.text_body(), Some("a"));
        assert_eq!(b.text_body(), Some("b"));
    }
}
