//! Request sending: one connection and session per call, an optional
//! private reply channel, and a [`PendingCall`] when a reply is expected.

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use super::pending::{CallResources, PendingCall, ReplyExpectation, ReplyValue};
use crate::codec::{Codec, JsonCodec};
use crate::janitor::{close_now, JanitorHandle};
use crate::transport::{
    Connection, ConnectionFactory, Consumer, Destination, Headers, Message, Session,
};
use crate::types::{Error, MessageId, Result};

/// An outbound request before it becomes a transport message.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestEnvelope {
    pub destination: Destination,
    pub headers: Headers,
    pub body: Option<Value>,
}

impl RequestEnvelope {
    pub fn new(destination: Destination) -> Self {
        Self {
            destination,
            headers: Headers::new(),
            body: None,
        }
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body_value(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_body<B: Serialize + ?Sized>(self, body: &B) -> Result<Self> {
        Ok(self.with_body_value(serde_json::to_value(body)?))
    }
}

/// Sends requests over the transport.
#[derive(Debug, Clone)]
pub struct RequestSender {
    factory: Arc<dyn ConnectionFactory>,
    codec: Arc<dyn Codec>,
    janitor: JanitorHandle,
}

impl RequestSender {
    pub fn new(factory: Arc<dyn ConnectionFactory>, janitor: JanitorHandle) -> Self {
        Self::with_codec(factory, Arc::new(JsonCodec), janitor)
    }

    pub fn with_codec(
        factory: Arc<dyn ConnectionFactory>,
        codec: Arc<dyn Codec>,
        janitor: JanitorHandle,
    ) -> Self {
        Self {
            factory,
            codec,
            janitor,
        }
    }

    pub fn codec(&self) -> &Arc<dyn Codec> {
        &self.codec
    }

    /// Send `request`. With an expectation, a temporary reply queue is
    /// attached to the message and the returned call owns the connection,
    /// session and reply consumer. Without one the call is fire-and-forget:
    /// everything is released before returning and no call is created.
    ///
    /// Transport failures surface as a single `Transport` error; nothing is
    /// retried.
    pub async fn send<T: ReplyValue>(
        &self,
        request: RequestEnvelope,
        expectation: Option<ReplyExpectation>,
    ) -> Result<Option<PendingCall<T>>> {
        let text = request
            .body
            .as_ref()
            .map(|body| self.codec.to_text(body))
            .transpose()?;

        let connection = self
            .factory
            .create_connection()
            .await
            .map_err(transport_failure)?;
        let session = match connection.create_session().await {
            Ok(session) => session,
            Err(e) => {
                close_now(connection.as_ref()).await;
                return Err(transport_failure(e));
            }
        };

        let sent = self
            .transmit(
                connection.as_ref(),
                session.as_ref(),
                &request,
                text,
                expectation.is_some(),
            )
            .await;

        match (sent, expectation) {
            (Ok((request_id, Some(consumer))), Some(expectation)) => {
                tracing::debug!(
                    "request_sent: destination={}, request={}, reply={:?}",
                    request.destination,
                    request_id,
                    expectation.kind
                );
                let resources = CallResources {
                    consumer,
                    session,
                    connection,
                };
                Ok(Some(PendingCall::new(
                    request_id,
                    resources,
                    expectation,
                    self.codec.clone(),
                    self.janitor.clone(),
                )))
            }
            (Ok((request_id, consumer)), _) => {
                tracing::debug!(
                    "request_sent: destination={}, request={}, reply=none",
                    request.destination,
                    request_id
                );
                if let Some(consumer) = consumer {
                    close_now(consumer.as_ref()).await;
                }
                close_now(session.as_ref()).await;
                close_now(connection.as_ref()).await;
                Ok(None)
            }
            (Err(e), _) => {
                close_now(session.as_ref()).await;
                close_now(connection.as_ref()).await;
                Err(transport_failure(e))
            }
        }
    }

    /// Send without expecting a reply.
    pub async fn fire_and_forget(&self, request: RequestEnvelope) -> Result<()> {
        self.send::<()>(request, None).await.map(|_| ())
    }

    /// Send and return the call awaiting the reply.
    pub async fn request<T: ReplyValue>(
        &self,
        request: RequestEnvelope,
        expectation: ReplyExpectation,
    ) -> Result<PendingCall<T>> {
        self.send(request, Some(expectation))
            .await?
            .ok_or_else(|| Error::transport("reply channel was not opened"))
    }

    async fn transmit(
        &self,
        connection: &dyn Connection,
        session: &dyn Session,
        request: &RequestEnvelope,
        text: Option<String>,
        expect_reply: bool,
    ) -> Result<(MessageId, Option<Box<dyn Consumer>>)> {
        let mut message = Message::text(text);
        message.set_properties(&request.headers);
        let reply_to = if expect_reply {
            let reply_to = session.create_temporary_queue().await?;
            message.reply_to = Some(reply_to.clone());
            Some(reply_to)
        } else {
            None
        };
        let request_id = message.id.clone();

        let producer = session.create_producer(&request.destination).await?;
        let delivered = producer.send(message).await;
        close_now(producer.as_ref()).await;
        delivered?;

        connection.start().await?;

        let consumer = match reply_to {
            Some(reply_to) => Some(session.create_consumer(&reply_to).await?),
            None => None,
        };
        Ok((request_id, consumer))
    }
}

fn transport_failure(e: Error) -> Error {
    match e {
        Error::Transport(_) => e,
        other => Error::transport(other.to_string()),
    }
}
