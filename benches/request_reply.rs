//! Request/reply latency benchmark.
//!
//! Measures a full call over the in-memory broker (reply queue creation,
//! dispatch, reply, release) and the fire-and-forget send path using
//! Criterion.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use queue_rpc::client::{ReplyExpectation, RequestEnvelope, RequestSender};
use queue_rpc::janitor::ResourceJanitor;
use queue_rpc::server::{
    HandlerDescriptor, HandlerError, ListenerDispatcher, ListenerServer, MessageService,
};
use queue_rpc::transport::memory::MemoryBroker;
use queue_rpc::transport::Destination;
use queue_rpc::types::{DispatcherConfig, JanitorConfig};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

struct Echo;

impl MessageService for Echo {
    fn handlers(self: Arc<Self>) -> Vec<HandlerDescriptor> {
        vec![HandlerDescriptor::body("echo", |body: Value| async move {
            Ok::<_, HandlerError>(body)
        })]
    }
}

fn payload(size: usize) -> Value {
    serde_json::json!({ "ping": "x".repeat(size) })
}

fn bench_round_trip(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let broker = MemoryBroker::new();
    let queue = Destination::named("BenchQueue").unwrap();

    let (janitor, sender) = rt.block_on(async {
        let mut janitor = ResourceJanitor::new(JanitorConfig::default());
        let worker = janitor.start();
        let sender = RequestSender::new(Arc::new(broker.clone()), janitor.handle());
        let dispatcher = ListenerDispatcher::build(Arc::new(Echo), sender.clone()).unwrap();
        let server = Arc::new(ListenerServer::new(
            Arc::new(dispatcher),
            Arc::new(broker.clone()),
            queue.clone(),
            DispatcherConfig::default(),
        ));
        tokio::spawn(async move { server.serve().await });
        ((janitor, worker), sender)
    });

    let mut group = c.benchmark_group("round_trip");
    for &size in &[0usize, 64, 1024, 16384] {
        let body = payload(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &body, |b, body| {
            b.iter(|| {
                rt.block_on(async {
                    let request = RequestEnvelope::new(queue.clone())
                        .with_body_value(black_box(body.clone()));
                    let call = sender
                        .request::<Value>(request, ReplyExpectation::value(Duration::from_secs(5)))
                        .await
                        .unwrap();
                    call.get().await.unwrap()
                })
            });
        });
    }
    group.finish();

    let (janitor, worker) = janitor;
    rt.block_on(janitor.shutdown(worker));
}

fn bench_fire_and_forget(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let broker = MemoryBroker::new();
    let janitor = ResourceJanitor::new(JanitorConfig::default());
    let sender = RequestSender::new(Arc::new(broker), janitor.handle());
    let queue = Destination::named("Sink").unwrap();
    let body = payload(1024);

    c.bench_function("fire_and_forget_1kb", |b| {
        b.iter(|| {
            rt.block_on(async {
                let request =
                    RequestEnvelope::new(queue.clone()).with_body_value(black_box(body.clone()));
                sender.fire_and_forget(request).await.unwrap()
            })
        });
    });
}

criterion_group!(benches, bench_round_trip, bench_fire_and_forget);
criterion_main!(benches);
