//! Pending calls: the caller-held handle for a request awaiting its reply.
//!
//! State machine: `pending → succeeded | failed | timed-out`, then closed.
//! The slot mutex is the resolve-once guard: a `get` holds it for the whole
//! receive, and the janitor's safety net only releases when it can take the
//! lock without waiting. Whichever side finishes first releases the
//! consumer → session → connection chain; the other finds nothing to release.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::codec::{self, Codec};
use crate::janitor::{close_now, JanitorHandle, ScheduledRelease};
use crate::transport::{Closeable, Connection, Consumer, Message, Session, ERROR_HEADER};
use crate::types::{Error, MessageId, Result};

/// Values a call can resolve to.
pub trait ReplyValue: DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> ReplyValue for T where T: DeserializeOwned + Clone + Send + Sync + 'static {}

/// How a reply body is turned into the call's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    /// The reply's presence is the result; the body is never deserialized.
    Acknowledge,
    /// The body is deserialized into the declared reply type.
    Value,
}

/// What the caller expects back from a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyExpectation {
    pub kind: ReplyKind,
    /// Deadline for `PendingCall::get` and the safety-net release horizon.
    pub timeout: Duration,
}

impl ReplyExpectation {
    pub fn value(timeout: Duration) -> Self {
        Self {
            kind: ReplyKind::Value,
            timeout,
        }
    }

    pub fn acknowledge(timeout: Duration) -> Self {
        Self {
            kind: ReplyKind::Acknowledge,
            timeout,
        }
    }
}

/// The parts of a reply message the caller looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyEnvelope {
    pub body: Option<String>,
    /// `"<kind>: <message>"`, present only when the remote handler failed.
    pub error: Option<String>,
}

impl ReplyEnvelope {
    pub fn from_message(message: &Message) -> Self {
        Self {
            body: message.text_body().map(str::to_string),
            error: message.string_property(ERROR_HEADER).map(str::to_string),
        }
    }
}

/// Transport resources owned by a call, released consumer first.
pub(crate) struct CallResources {
    pub(crate) consumer: Box<dyn Consumer>,
    pub(crate) session: Box<dyn Session>,
    pub(crate) connection: Box<dyn Connection>,
}

#[async_trait]
impl Closeable for CallResources {
    async fn close(&self) -> Result<()> {
        close_now(self.consumer.as_ref()).await;
        close_now(self.session.as_ref()).await;
        close_now(self.connection.as_ref()).await;
        Ok(())
    }
}

enum CallState<T> {
    Pending,
    Succeeded(T),
    RemoteFailed(String),
    DecodeFailed(String),
    TimedOut(String),
}

impl<T: Clone> CallState<T> {
    /// The resolved result, or `None` while pending.
    fn cached(&self) -> Option<Result<T>> {
        match self {
            CallState::Pending => None,
            CallState::Succeeded(value) => Some(Ok(value.clone())),
            CallState::RemoteFailed(reason) => Some(Err(Error::remote_execution(reason.clone()))),
            CallState::DecodeFailed(reason) => Some(Err(Error::codec(reason.clone()))),
            CallState::TimedOut(reason) => Some(Err(Error::timeout(reason.clone()))),
        }
    }
}

struct CallSlot<T> {
    state: CallState<T>,
    resources: Option<CallResources>,
}

struct CallInner<T> {
    request_id: MessageId,
    expectation: ReplyExpectation,
    codec: Arc<dyn Codec>,
    janitor: JanitorHandle,
    slot: Mutex<CallSlot<T>>,
    done: AtomicBool,
    closed: AtomicBool,
    safety_net: OnceLock<ScheduledRelease>,
}

impl<T> CallInner<T> {
    async fn release(&self, resources: Option<CallResources>) {
        if let Some(net) = self.safety_net.get() {
            net.cancel();
        }
        if let Some(resources) = resources {
            close_now(&resources).await;
            tracing::debug!("call_resources_released: request={}", self.request_id);
        }
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Safety net handed to the janitor: releases the call's resources when
/// nobody resolved it within the configured horizon.
struct SafetyNet<T>(Arc<CallInner<T>>);

#[async_trait]
impl<T: Send + Sync + 'static> Closeable for SafetyNet<T> {
    async fn close(&self) -> Result<()> {
        // A held lock means a `get` is receiving; it releases on completion.
        let Ok(mut slot) = self.0.slot.try_lock() else {
            return Ok(());
        };
        let resources = slot.resources.take();
        drop(slot);
        if resources.is_some() {
            tracing::debug!("call_safety_net_fired: request={}", self.0.request_id);
        }
        self.0.release(resources).await;
        Ok(())
    }
}

/// Handle to an in-flight request awaiting a reply, a remote error or a timeout.
pub struct PendingCall<T> {
    inner: Arc<CallInner<T>>,
}

impl<T> fmt::Debug for PendingCall<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCall")
            .field("request_id", &self.inner.request_id)
            .field("expectation", &self.inner.expectation)
            .field("done", &self.is_done())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<T: ReplyValue> PendingCall<T> {
    pub(crate) fn new(
        request_id: MessageId,
        resources: CallResources,
        expectation: ReplyExpectation,
        codec: Arc<dyn Codec>,
        janitor: JanitorHandle,
    ) -> Self {
        let inner = Arc::new(CallInner {
            request_id,
            expectation,
            codec,
            janitor,
            slot: Mutex::new(CallSlot {
                state: CallState::Pending,
                resources: Some(resources),
            }),
            done: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            safety_net: OnceLock::new(),
        });
        let net = inner
            .janitor
            .close_after(expectation.timeout, Box::new(SafetyNet(inner.clone())));
        let _ = inner.safety_net.set(net);
        Self { inner }
    }

    /// Id of the request message this call waits on.
    pub fn request_id(&self) -> &MessageId {
        &self.inner.request_id
    }

    /// Wait at most `timeout` for the reply.
    ///
    /// A resolved call returns its cached result without touching the
    /// transport. The first resolution of any kind releases the call's
    /// resources.
    pub async fn get_timeout(&self, timeout: Duration) -> Result<T> {
        let mut slot = self.inner.slot.lock().await;
        if let Some(result) = slot.state.cached() {
            return result;
        }
        let received = match slot.resources.as_ref() {
            Some(resources) => resources.consumer.receive(Some(timeout)).await,
            None => Err(Error::transport(format!(
                "reply channel of request {} already released",
                self.inner.request_id
            ))),
        };

        let result = match received {
            Ok(Some(message)) => {
                self.inner.done.store(true, Ordering::SeqCst);
                slot.state = self.resolve(&ReplyEnvelope::from_message(&message));
                slot.state.cached().unwrap_or_else(|| {
                    Err(Error::execution("reply left the call unresolved"))
                })
            }
            Ok(None) => {
                let reason = format!(
                    "no reply to request {} within {:?}",
                    self.inner.request_id, timeout
                );
                slot.state = CallState::TimedOut(reason.clone());
                Err(Error::timeout(reason))
            }
            Err(e) => Err(match e {
                Error::Transport(_) => e,
                other => Error::transport(other.to_string()),
            }),
        };

        let resources = slot.resources.take();
        drop(slot);
        self.inner.release(resources).await;
        result
    }

    /// Wait with the configured default deadline. A timeout surfaces as an
    /// execution failure; resources are always released.
    pub async fn get(&self) -> Result<T> {
        let result = self.get_timeout(self.inner.expectation.timeout).await;
        self.close().await;
        result.map_err(|e| match e {
            Error::Timeout(reason) => Error::execution(reason),
            other => other,
        })
    }

    fn resolve(&self, reply: &ReplyEnvelope) -> CallState<T> {
        if let Some(error) = &reply.error {
            tracing::debug!(
                "call_remote_failure: request={}, error={}",
                self.inner.request_id,
                error
            );
            return CallState::RemoteFailed(error.clone());
        }
        let body = match self.inner.expectation.kind {
            ReplyKind::Acknowledge => None,
            ReplyKind::Value => reply.body.as_deref(),
        };
        match codec::deserialize(self.inner.codec.as_ref(), body) {
            Ok(value) => CallState::Succeeded(value),
            Err(e) => CallState::DecodeFailed(e.reason()),
        }
    }
}

impl<T> PendingCall<T> {
    /// Release the call's transport resources. Idempotent.
    pub async fn close(&self) {
        let resources = self.inner.slot.lock().await.resources.take();
        self.inner.release(resources).await;
    }

    /// Remote work cannot be aborted once dispatched; always `false`.
    pub fn cancel(&self) -> bool {
        false
    }

    /// A reply message has been received.
    pub fn is_done(&self) -> bool {
        self.inner.done.load(Ordering::SeqCst)
    }

    /// The call's resources have been released.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl<T> Drop for PendingCall<T> {
    fn drop(&mut self) {
        if self.is_closed() {
            return;
        }
        if let Ok(mut slot) = self.inner.slot.try_lock() {
            if let Some(resources) = slot.resources.take() {
                self.inner.janitor.close_soon(Box::new(resources));
            }
            if let Some(net) = self.inner.safety_net.get() {
                net.cancel();
            }
        }
    }
}

// =============================================================================
// Waiting on several calls
// =============================================================================

/// Type-erased view of a pending call, for waiting on heterogeneous calls.
#[async_trait]
pub trait AwaitReply: Send + Sync {
    async fn await_reply(&self, timeout: Duration) -> Result<()>;
}

#[async_trait]
impl<T: ReplyValue> AwaitReply for PendingCall<T> {
    async fn await_reply(&self, timeout: Duration) -> Result<()> {
        self.get_timeout(timeout).await.map(|_| ())
    }
}

/// Wait for every call in order under one shared time budget.
///
/// The budget left for each call is what remains after the wall-clock time
/// already spent; once it reaches zero the wait fails with a timeout. The
/// first failing call ends the wait with its error.
pub async fn wait_for_all(budget: Duration, calls: &[&dyn AwaitReply]) -> Result<()> {
    let started = Instant::now();
    for call in calls {
        let remaining = budget
            .checked_sub(started.elapsed())
            .filter(|left| !left.is_zero())
            .ok_or_else(|| Error::timeout(format!("wait budget of {:?} exhausted", budget)))?;
        call.await_reply(remaining).await?;
    }
    Ok(())
}
