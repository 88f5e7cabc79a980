//! Inbound dispatch: message → handler call → optional reply.

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use super::handler::{HandlerDescriptor, HandlerError, MessageService};
use super::listener::MessageListener;
use crate::client::{RequestEnvelope, RequestSender};
use crate::transport::{Destination, Headers, HeaderValue, Message, ERROR_HEADER};
use crate::types::{Error, Result};

/// What `on_message` did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Handler succeeded, reply sent.
    Replied,
    /// Handler failed, `ERROR` reply sent.
    RepliedWithError,
    /// Handler succeeded, no reply-to.
    Completed,
    /// Handler failed, no reply-to; the failure was logged.
    Reported,
}

/// Routes inbound messages to the single handler of a [`MessageService`].
#[derive(Debug)]
pub struct ListenerDispatcher {
    service: &'static str,
    handler: HandlerDescriptor,
    replies: RequestSender,
}

impl ListenerDispatcher {
    /// Fails with `ProtocolViolation` unless the service registers exactly
    /// one handler.
    pub fn build<S: MessageService>(service: Arc<S>, replies: RequestSender) -> Result<Self> {
        let name = std::any::type_name::<S>();
        let mut handlers = service.handlers();
        if handlers.len() > 1 {
            return Err(Error::protocol_violation(format!(
                "more than one message handler registered on {}",
                name
            )));
        }
        let handler = handlers.pop().ok_or_else(|| {
            Error::protocol_violation(format!("no message handler registered on {}", name))
        })?;
        tracing::debug!(
            "dispatcher_built: service={}, handler={}, body={}, headers={}",
            name,
            handler.name(),
            handler.takes_body(),
            handler.takes_headers()
        );
        Ok(Self {
            service: name,
            handler,
            replies,
        })
    }

    pub fn handler(&self) -> &HandlerDescriptor {
        &self.handler
    }

    /// Process one inbound message.
    ///
    /// Non-text messages are rejected before the handler runs and never get
    /// a reply. Any failure after that point becomes an `ERROR` reply when
    /// the message has a reply-to, and is logged otherwise.
    pub async fn on_message(&self, message: Message) -> Result<DispatchOutcome> {
        if !message.is_text() {
            return Err(Error::protocol_violation(format!(
                "received message {} is not a text message",
                message.id
            )));
        }
        let reply_to = message.reply_to.clone();

        let result = self.invoke(&message).await;

        match (result, reply_to) {
            (Ok(value), Some(reply_to)) => {
                let body = (!value.is_null()).then_some(value);
                self.reply(reply_to, Headers::new(), body).await?;
                Ok(DispatchOutcome::Replied)
            }
            (Ok(_), None) => Ok(DispatchOutcome::Completed),
            (Err(failure), Some(reply_to)) => {
                tracing::debug!(
                    "handler_failed: service={}, message={}, error={}",
                    self.service,
                    message.id,
                    failure
                );
                let mut headers = Headers::new();
                headers.insert(
                    ERROR_HEADER.to_string(),
                    HeaderValue::String(failure.to_string()),
                );
                self.reply(reply_to, headers, None).await?;
                Ok(DispatchOutcome::RepliedWithError)
            }
            (Err(failure), None) => {
                tracing::error!(
                    "handler_failed_without_reply_to: service={}, message={}, error={}",
                    self.service,
                    message.id,
                    failure
                );
                Ok(DispatchOutcome::Reported)
            }
        }
    }

    async fn invoke(&self, message: &Message) -> std::result::Result<Value, HandlerError> {
        let body = match message.text_body() {
            Some(text) if self.handler.takes_body() && !text.is_empty() => {
                Some(self.replies.codec().from_text(text)?)
            }
            _ => None,
        };
        let headers = self
            .handler
            .takes_headers()
            .then(|| message.properties_map());

        AssertUnwindSafe(self.handler.invoke(body, headers))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(HandlerError::panic(payload)))
    }

    async fn reply(
        &self,
        reply_to: Destination,
        headers: Headers,
        body: Option<Value>,
    ) -> Result<()> {
        let mut reply = RequestEnvelope::new(reply_to).with_headers(headers);
        reply.body = body;
        let destination = reply.destination.clone();
        self.replies.fire_and_forget(reply).await.map_err(|e| {
            tracing::warn!("reply_not_sent: destination={}, error={}", destination, e);
            e
        })
    }
}

#[async_trait]
impl MessageListener for ListenerDispatcher {
    async fn on_message(&self, message: Message) {
        if let Err(e) = ListenerDispatcher::on_message(self, message).await {
            tracing::warn!("dispatch_failed: service={}, error={}", self.service, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::janitor::ResourceJanitor;
    use crate::transport::memory::MemoryBroker;
    use crate::transport::{Connection, ConnectionFactory, Consumer};
    use crate::types::JanitorConfig;
    use pretty_assertions::assert_eq;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tracing_test::traced_test;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct PingMessage {
        ping: String,
    }

    #[derive(Debug, Default)]
    struct Echo {
        calls: AtomicUsize,
    }

    impl MessageService for Echo {
        fn handlers(self: Arc<Self>) -> Vec<HandlerDescriptor> {
            vec![HandlerDescriptor::body("ping", move |ping: PingMessage| {
                let this = self.clone();
                async move {
                    this.calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, HandlerError>(ping)
                }
            })]
        }
    }

    struct Nothing;

    impl MessageService for Nothing {
        fn handlers(self: Arc<Self>) -> Vec<HandlerDescriptor> {
            Vec::new()
        }
    }

    struct Twice;

    impl MessageService for Twice {
        fn handlers(self: Arc<Self>) -> Vec<HandlerDescriptor> {
            vec![
                HandlerDescriptor::no_args("a", || async { Ok::<_, HandlerError>(()) }),
                HandlerDescriptor::no_args("b", || async { Ok::<_, HandlerError>(()) }),
            ]
        }
    }

    struct Failing;

    impl MessageService for Failing {
        fn handlers(self: Arc<Self>) -> Vec<HandlerDescriptor> {
            vec![HandlerDescriptor::body("observe", |_: PingMessage| async {
                Err::<(), _>(HandlerError::new("RuntimeException", "expected problem"))
            })]
        }
    }

    struct Panicky;

    impl MessageService for Panicky {
        fn handlers(self: Arc<Self>) -> Vec<HandlerDescriptor> {
            vec![HandlerDescriptor::no_args("boom", || async {
                if true {
                    panic!("handler blew up");
                }
                Ok::<_, HandlerError>(())
            })]
        }
    }

    fn replies(broker: &MemoryBroker, janitor: &ResourceJanitor) -> RequestSender {
        RequestSender::new(Arc::new(broker.clone()), janitor.handle())
    }

    type ReplyQueue = (Box<dyn Connection>, Destination, Box<dyn Consumer>);

    async fn reply_queue(broker: &MemoryBroker) -> ReplyQueue {
        let connection = broker.create_connection().await.unwrap();
        let session = connection.create_session().await.unwrap();
        let reply_to = session.create_temporary_queue().await.unwrap();
        let consumer = session.create_consumer(&reply_to).await.unwrap();
        connection.start().await.unwrap();
        (connection, reply_to, consumer)
    }

    #[test]
    fn test_build_requires_exactly_one_handler() {
        let broker = MemoryBroker::new();
        let janitor = ResourceJanitor::new(JanitorConfig::default());

        let err =
            ListenerDispatcher::build(Arc::new(Nothing), replies(&broker, &janitor)).unwrap_err();
        assert!(matches!(&err, Error::ProtocolViolation(m) if m.contains("no message handler")));

        let err =
            ListenerDispatcher::build(Arc::new(Twice), replies(&broker, &janitor)).unwrap_err();
        assert!(matches!(&err, Error::ProtocolViolation(m) if m.contains("more than one")));

        let dispatcher =
            ListenerDispatcher::build(Arc::new(Echo::default()), replies(&broker, &janitor))
                .unwrap();
        assert_eq!(dispatcher.handler().name(), "ping");
    }

    #[tokio::test]
    async fn test_non_text_message_is_rejected() {
        let broker = MemoryBroker::new();
        let janitor = ResourceJanitor::new(JanitorConfig::default());
        let echo = Arc::new(Echo::default());
        let dispatcher =
            ListenerDispatcher::build(echo.clone(), replies(&broker, &janitor)).unwrap();

        let err = dispatcher.on_message(Message::bytes(vec![1, 2, 3])).await.unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)));
        assert_eq!(echo.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_reply_carries_return_value() {
        let broker = MemoryBroker::new();
        let janitor = ResourceJanitor::new(JanitorConfig::default());
        let dispatcher =
            ListenerDispatcher::build(Arc::new(Echo::default()), replies(&broker, &janitor))
                .unwrap();
        let (connection, reply_to, consumer) = reply_queue(&broker).await;

        let mut request = Message::text(Some(r#"{"ping":"signal1"}"#.into()));
        request.reply_to = Some(reply_to);
        let outcome = dispatcher.on_message(request).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Replied);

        let reply = consumer.receive(Some(Duration::from_secs(1))).await.unwrap().unwrap();
        assert_eq!(reply.text_body(), Some(r#"{"ping":"signal1"}"#));
        assert!(reply.string_property(ERROR_HEADER).is_none());
        connection.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_no_reply_to_completes_silently() {
        let broker = MemoryBroker::new();
        let janitor = ResourceJanitor::new(JanitorConfig::default());
        let echo = Arc::new(Echo::default());
        let dispatcher =
            ListenerDispatcher::build(echo.clone(), replies(&broker, &janitor)).unwrap();

        let outcome = dispatcher
            .on_message(Message::text(Some(r#"{"ping":"x"}"#.into())))
            .await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Completed);
        assert_eq!(echo.calls.load(Ordering::SeqCst), 1);
        assert_eq!(broker.temporary_queue_count(), 0);
    }

    #[tokio::test]
    async fn test_undecodable_body_becomes_error_reply() {
        let broker = MemoryBroker::new();
        let janitor = ResourceJanitor::new(JanitorConfig::default());
        let dispatcher =
            ListenerDispatcher::build(Arc::new(Echo::default()), replies(&broker, &janitor))
                .unwrap();
        let (connection, reply_to, consumer) = reply_queue(&broker).await;

        let mut request = Message::text(Some("{not json".into()));
        request.reply_to = Some(reply_to);
        let outcome = dispatcher.on_message(request).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::RepliedWithError);

        let reply = consumer.receive(Some(Duration::from_secs(1))).await.unwrap().unwrap();
        let error = reply.string_property(ERROR_HEADER).unwrap();
        assert!(error.starts_with("SerializationFailure: "));
        assert_eq!(reply.text_body(), None);
        connection.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_panic_becomes_error_reply() {
        let broker = MemoryBroker::new();
        let janitor = ResourceJanitor::new(JanitorConfig::default());
        let dispatcher =
            ListenerDispatcher::build(Arc::new(Panicky), replies(&broker, &janitor)).unwrap();
        let (connection, reply_to, consumer) = reply_queue(&broker).await;

        let mut request = Message::text(None);
        request.reply_to = Some(reply_to);
        let outcome = dispatcher.on_message(request).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::RepliedWithError);

        let reply = consumer.receive(Some(Duration::from_secs(1))).await.unwrap().unwrap();
        assert_eq!(
            reply.string_property(ERROR_HEADER),
            Some("Panic: handler blew up")
        );
        connection.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_reply_to_vanished_is_transport_failure() {
        let broker = MemoryBroker::new();
        let janitor = ResourceJanitor::new(JanitorConfig::default());
        let dispatcher =
            ListenerDispatcher::build(Arc::new(Echo::default()), replies(&broker, &janitor))
                .unwrap();
        let (connection, reply_to, _consumer) = reply_queue(&broker).await;
        connection.close().await.unwrap();

        let mut request = Message::text(Some(r#"{"ping":"late"}"#.into()));
        request.reply_to = Some(reply_to);
        let err = dispatcher.on_message(request).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_failure_without_reply_to_is_reported() {
        let broker = MemoryBroker::new();
        let janitor = ResourceJanitor::new(JanitorConfig::default());
        let dispatcher =
            ListenerDispatcher::build(Arc::new(Failing), replies(&broker, &janitor)).unwrap();

        let outcome = dispatcher
            .on_message(Message::text(Some(r#"{"ping":"ping"}"#.into())))
            .await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Reported);
        assert!(logs_contain("handler_failed_without_reply_to"));
        assert!(logs_contain("RuntimeException: expected problem"));
    }
}
