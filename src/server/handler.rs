//! Handler registration.
//!
//! A service exposes its message handler through [`MessageService::handlers`].
//! Each registration records, once, whether the handler takes a body and
//! whether it takes the header map; the dispatcher reads those flags instead
//! of inspecting anything per message.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

use crate::transport::Headers;
use crate::types::Error;

/// Failure raised by a handler, reported on the wire as `"<kind>: <message>"`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct HandlerError {
    pub kind: String,
    pub message: String,
}

impl HandlerError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Wrap any error, using its type name as the kind.
    pub fn from_error<E: std::error::Error>(error: &E) -> Self {
        let full = std::any::type_name::<E>();
        // `a::Wrap<b::Inner>` names kind `Wrap`.
        let path = full.split('<').next().unwrap_or(full);
        let kind = path.rsplit("::").next().unwrap_or(path);
        Self::new(kind, error.to_string())
    }

    pub(crate) fn panic(payload: Box<dyn Any + Send>) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "handler panicked".to_string());
        Self::new("Panic", message)
    }
}

impl From<Error> for HandlerError {
    fn from(error: Error) -> Self {
        Self::new(error.kind(), error.reason())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(error: serde_json::Error) -> Self {
        Error::from(error).into()
    }
}

/// Result type of handler invocations.
pub type HandlerResult<T> = std::result::Result<T, HandlerError>;

type Invoke = Arc<
    dyn Fn(Option<Value>, Option<Headers>) -> BoxFuture<'static, HandlerResult<Value>>
        + Send
        + Sync,
>;

/// One registered handler.
#[derive(Clone)]
pub struct HandlerDescriptor {
    name: String,
    body_param: bool,
    headers_param: bool,
    invoke: Invoke,
}

impl fmt::Debug for HandlerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("name", &self.name)
            .field("body_param", &self.body_param)
            .field("headers_param", &self.headers_param)
            .finish()
    }
}

impl HandlerDescriptor {
    /// Handler taking the deserialized body.
    pub fn body<B, R, F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        B: DeserializeOwned + Send + 'static,
        R: Serialize + 'static,
        F: Fn(B) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<R>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        Self::from_parts(name, true, false, move |body, _| {
            let handler = handler.clone();
            async move { encode(handler(decode(body)?).await?) }.boxed()
        })
    }

    /// Handler taking the header map and the deserialized body.
    pub fn headers_and_body<B, R, F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        B: DeserializeOwned + Send + 'static,
        R: Serialize + 'static,
        F: Fn(Headers, B) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<R>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        Self::from_parts(name, true, true, move |body, headers| {
            let handler = handler.clone();
            async move {
                let body = decode(body)?;
                encode(handler(headers.unwrap_or_default(), body).await?)
            }
            .boxed()
        })
    }

    /// Handler taking only the header map.
    pub fn headers<R, F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        R: Serialize + 'static,
        F: Fn(Headers) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<R>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        Self::from_parts(name, false, true, move |_, headers| {
            let handler = handler.clone();
            async move { encode(handler(headers.unwrap_or_default()).await?) }.boxed()
        })
    }

    /// Handler without parameters.
    pub fn no_args<R, F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        R: Serialize + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<R>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        Self::from_parts(name, false, false, move |_, _| {
            let handler = handler.clone();
            async move { encode(handler().await?) }.boxed()
        })
    }

    fn from_parts<F>(
        name: impl Into<String>,
        body_param: bool,
        headers_param: bool,
        invoke: F,
    ) -> Self
    where
        F: Fn(Option<Value>, Option<Headers>) -> BoxFuture<'static, HandlerResult<Value>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            body_param,
            headers_param,
            invoke: Arc::new(invoke),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn takes_body(&self) -> bool {
        self.body_param
    }

    pub fn takes_headers(&self) -> bool {
        self.headers_param
    }

    /// Run the handler. The returned future does all the work, including
    /// argument conversion, so a panic anywhere in it can be caught by the
    /// caller.
    pub fn invoke(
        &self,
        body: Option<Value>,
        headers: Option<Headers>,
    ) -> BoxFuture<'static, HandlerResult<Value>> {
        (self.invoke)(body, headers)
    }
}

fn decode<B: DeserializeOwned>(body: Option<Value>) -> HandlerResult<B> {
    Ok(serde_json::from_value(body.unwrap_or(Value::Null))?)
}

fn encode<R: Serialize>(value: R) -> HandlerResult<Value> {
    Ok(serde_json::to_value(value)?)
}

/// A server-side target object. Exactly one handler must be registered.
pub trait MessageService: Send + Sync + 'static {
    fn handlers(self: Arc<Self>) -> Vec<HandlerDescriptor>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::HeaderValue;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct PingMessage {
        ping: String,
    }

    #[derive(Debug, Error)]
    #[error("expected problem")]
    struct RuntimeException;

    #[tokio::test]
    async fn test_body_handler_round_trip() {
        let handler = HandlerDescriptor::body("ping", |ping: PingMessage| async move {
            Ok::<_, HandlerError>(ping)
        });
        assert!(handler.takes_body());
        assert!(!handler.takes_headers());

        let out = handler
            .invoke(Some(serde_json::json!({"ping": "signal1"})), None)
            .await
            .unwrap();
        assert_eq!(out, serde_json::json!({"ping": "signal1"}));
    }

    #[tokio::test]
    async fn test_undecodable_body_is_serialization_failure() {
        let handler = HandlerDescriptor::body("ping", |ping: PingMessage| async move {
            Ok::<_, HandlerError>(ping)
        });
        let err = handler.invoke(None, None).await.unwrap_err();
        assert_eq!(err.kind, "SerializationFailure");
    }

    #[tokio::test]
    async fn test_headers_handler_sees_headers() {
        let handler = HandlerDescriptor::headers("inspect", |headers: Headers| async move {
            Ok::<_, HandlerError>(headers.get("testHeader").and_then(HeaderValue::as_bool))
        });
        assert!(handler.takes_headers());
        let mut headers = Headers::new();
        headers.insert("testHeader".into(), true.into());
        let out = handler.invoke(None, Some(headers)).await.unwrap();
        assert_eq!(out, Value::Bool(true));
    }

    #[tokio::test]
    async fn test_unit_return_is_null() {
        let handler = HandlerDescriptor::no_args("noop", || async { Ok::<_, HandlerError>(()) });
        assert_eq!(handler.invoke(None, None).await.unwrap(), Value::Null);
    }

    #[test]
    fn test_from_error_uses_type_name() {
        let err = HandlerError::from_error(&RuntimeException);
        assert_eq!(err.to_string(), "RuntimeException: expected problem");
    }

    #[derive(Debug, Error)]
    #[error("wrapped: {0}")]
    struct Wrapped<E: std::error::Error>(E);

    #[test]
    fn test_from_error_ignores_generic_arguments() {
        let err = HandlerError::from_error(&Wrapped(RuntimeException));
        assert_eq!(err.kind, "Wrapped");
        assert_eq!(err.message, "wrapped: expected problem");
    }

    #[test]
    fn test_panic_payloads() {
        assert_eq!(
            HandlerError::panic(Box::new("boom")),
            HandlerError::new("Panic", "boom")
        );
        assert_eq!(
            HandlerError::panic(Box::new(String::from("bang"))).message,
            "bang"
        );
        assert_eq!(HandlerError::panic(Box::new(7u8)).message, "handler panicked");
    }

    #[test]
    fn test_from_crate_error() {
        let err: HandlerError = Error::protocol_violation("bad").into();
        assert_eq!(err.to_string(), "ProtocolViolation: bad");
    }
}
