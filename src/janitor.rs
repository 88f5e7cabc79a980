//! Best-effort, delayed release of transport resources.
//!
//! `ResourceJanitor` owns a single background worker that closes resources
//! after a delay. It is only used for safety-net releases (a reply consumer
//! nobody read from) and for resources handed over from synchronous contexts;
//! the send/receive path never waits on it.
//!
//! Close failures are swallowed: a release must never override a result that
//! was already delivered, and teardown races with the broker are expected.

use futures::StreamExt;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::time::{delay_queue, DelayQueue};

use crate::transport::Closeable;
use crate::types::JanitorConfig;

/// Close a resource now, discarding any failure.
pub async fn close_now(resource: &dyn Closeable) {
    if let Err(e) = resource.close().await {
        tracing::trace!("resource_close_failed: {}", e);
    }
}

enum JanitorCommand {
    Schedule {
        id: u64,
        delay: Duration,
        resource: Box<dyn Closeable>,
        token: CancellationToken,
    },
    Cancel(u64),
    Release(Box<dyn Closeable>),
}

impl fmt::Debug for JanitorCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JanitorCommand::Schedule { id, delay, .. } => f
                .debug_struct("Schedule")
                .field("id", id)
                .field("delay", delay)
                .finish(),
            JanitorCommand::Cancel(id) => f.debug_tuple("Cancel").field(id).finish(),
            JanitorCommand::Release(_) => f.write_str("Release"),
        }
    }
}

/// Handle to a scheduled release. Cancelling it keeps the resource open
/// and makes the worker drop its reference right away.
#[derive(Debug, Clone)]
pub struct ScheduledRelease {
    id: u64,
    token: CancellationToken,
    tx: mpsc::UnboundedSender<JanitorCommand>,
}

impl ScheduledRelease {
    pub fn cancel(&self) {
        if self.token.is_cancelled() {
            return;
        }
        self.token.cancel();
        // A stopped worker has nothing left to forget.
        let _ = self.tx.send(JanitorCommand::Cancel(self.id));
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Cloneable scheduling handle, passed into senders, calls and dispatchers.
#[derive(Debug, Clone)]
pub struct JanitorHandle {
    tx: mpsc::UnboundedSender<JanitorCommand>,
    next_id: Arc<AtomicU64>,
}

impl JanitorHandle {
    /// Close `resource` once `delay` has elapsed, unless the returned handle
    /// is cancelled first.
    pub fn close_after(&self, delay: Duration, resource: Box<dyn Closeable>) -> ScheduledRelease {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let command = JanitorCommand::Schedule {
            id,
            delay,
            resource,
            token: token.clone(),
        };
        if let Err(rejected) = self.tx.send(command) {
            if let JanitorCommand::Schedule { resource, .. } = rejected.0 {
                release_detached_after(delay, resource, token.clone());
            }
        }
        ScheduledRelease {
            id,
            token,
            tx: self.tx.clone(),
        }
    }

    /// Hand a resource to the worker for release as soon as possible.
    /// Usable from synchronous contexts such as `Drop`.
    pub fn close_soon(&self, resource: Box<dyn Closeable>) {
        if let Err(rejected) = self.tx.send(JanitorCommand::Release(resource)) {
            if let JanitorCommand::Release(resource) = rejected.0 {
                release_detached(resource);
            }
        }
    }
}

/// Release outside the worker once it has stopped. Without a runtime the
/// resource is simply dropped.
fn release_detached(resource: Box<dyn Closeable>) {
    if let Ok(runtime) = tokio::runtime::Handle::try_current() {
        runtime.spawn(async move { close_now(resource.as_ref()).await });
    }
}

/// Delayed release outside the worker once it has stopped. The delay still
/// applies and cancellation still wins.
fn release_detached_after(delay: Duration, resource: Box<dyn Closeable>, token: CancellationToken) {
    if let Ok(runtime) = tokio::runtime::Handle::try_current() {
        runtime.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => close_now(resource.as_ref()).await,
            }
        });
    }
}

/// Owner of the cleanup worker.
#[derive(Debug)]
pub struct ResourceJanitor {
    config: JanitorConfig,
    tx: mpsc::UnboundedSender<JanitorCommand>,
    rx: Option<mpsc::UnboundedReceiver<JanitorCommand>>,
    stop_tx: Option<oneshot::Sender<()>>,
    next_id: Arc<AtomicU64>,
}

impl ResourceJanitor {
    pub fn new(config: JanitorConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            config,
            tx,
            rx: Some(rx),
            stop_tx: None,
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Scheduling handle. Commands sent before `start` are queued.
    pub fn handle(&self) -> JanitorHandle {
        JanitorHandle {
            tx: self.tx.clone(),
            next_id: self.next_id.clone(),
        }
    }

    /// Start the worker in the background.
    /// Returns immediately; releases run in a spawned task.
    pub fn start(&mut self) -> JoinHandle<()> {
        let Some(rx) = self.rx.take() else {
            tracing::warn!("janitor_already_started");
            return tokio::spawn(async {});
        };
        let (stop_tx, stop_rx) = oneshot::channel();
        self.stop_tx = Some(stop_tx);
        tokio::spawn(run_worker(rx, stop_rx))
    }

    /// Stop the worker. Everything still scheduled is released immediately.
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Stop and wait (bounded by `shutdown_grace`) for the drain to finish.
    pub async fn shutdown(mut self, worker: JoinHandle<()>) {
        self.stop();
        if tokio::time::timeout(self.config.shutdown_grace, worker).await.is_err() {
            tracing::warn!(
                "janitor_shutdown_grace_exceeded: {:?}",
                self.config.shutdown_grace
            );
        }
    }
}

struct Scheduled {
    key: delay_queue::Key,
    resource: Box<dyn Closeable>,
    token: CancellationToken,
}

async fn run_worker(
    mut rx: mpsc::UnboundedReceiver<JanitorCommand>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let mut timers: DelayQueue<u64> = DelayQueue::new();
    let mut scheduled: HashMap<u64, Scheduled> = HashMap::new();

    loop {
        tokio::select! {
            _ = &mut stop_rx => break,
            command = rx.recv() => match command {
                Some(JanitorCommand::Schedule { id, delay, resource, token }) => {
                    if !token.is_cancelled() {
                        let key = timers.insert(id, delay);
                        scheduled.insert(id, Scheduled { key, resource, token });
                    }
                }
                Some(JanitorCommand::Cancel(id)) => {
                    if let Some(job) = scheduled.remove(&id) {
                        timers.remove(&job.key);
                    }
                }
                Some(JanitorCommand::Release(resource)) => close_now(resource.as_ref()).await,
                None => break,
            },
            Some(expired) = timers.next(), if !timers.is_empty() => {
                if let Some(job) = scheduled.remove(expired.get_ref()) {
                    if !job.token.is_cancelled() {
                        tracing::debug!("janitor_safety_net_release");
                        close_now(job.resource.as_ref()).await;
                    }
                }
            }
        }
    }

    // Drain: nothing scheduled outlives the worker.
    rx.close();
    let mut released = 0usize;
    while let Ok(command) = rx.try_recv() {
        let resource = match command {
            JanitorCommand::Schedule {
                resource, token, ..
            } if !token.is_cancelled() => resource,
            JanitorCommand::Release(resource) => resource,
            _ => continue,
        };
        close_now(resource.as_ref()).await;
        released += 1;
    }
    for (_, job) in scheduled.drain() {
        if !job.token.is_cancelled() {
            close_now(job.resource.as_ref()).await;
            released += 1;
        }
    }
    tracing::info!("janitor_stopped: released={}", released);
}
