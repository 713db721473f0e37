use criterion::{BatchSize, BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use async_trait::async_trait;
use bookingprocessor_core::BookingMessage;
use bookingprocessor_infra::consumer::{Batch, BatchProcessor, RedeliveryPolicy};
use bookingprocessor_infra::queue::{Broker, DeliveryChannel, InMemoryQueue};
use bookingprocessor_infra::registration::{Registrar, RegistrationError};
use bookingprocessor_observability::ConsumerMetrics;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::time::Instant;

/// Registrar with no I/O, so the numbers measure the consumer itself.
#[derive(Debug)]
struct AcceptAll;

#[async_trait]
impl Registrar for AcceptAll {
    async fn register(&self, email: &str) -> Result<(), RegistrationError> {
        black_box(email);
        Ok(())
    }
}

fn payload(i: usize) -> Vec<u8> {
    BookingMessage::new(i as i64, format!("guest{i}@example.com"), "Sample Hotel Data").to_payload()
}

async fn filled_batch(channel: &mut DeliveryChannel, queue: &InMemoryQueue, size: usize) -> Batch {
    for i in 0..size {
        queue.publish(payload(i));
    }
    let mut batch = Batch::new(size, Duration::from_millis(200));
    for _ in 0..size {
        let delivery = channel.recv().await.expect("channel open");
        let message = BookingMessage::from_payload(delivery.payload()).expect("valid payload");
        batch.push(message, delivery, Instant::now());
    }
    batch
}

fn bench_payload_decode(c: &mut Criterion) {
    let bytes = payload(42);
    c.bench_function("payload_decode", |b| {
        b.iter(|| BookingMessage::from_payload(black_box(&bytes)).unwrap());
    });
}

fn bench_flush_throughput(c: &mut Criterion) {
    let rt = Runtime::new().expect("tokio runtime");
    let mut group = c.benchmark_group("batch_flush_throughput");

    for size in [1usize, 10, 50, 200].iter() {
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let queue = InMemoryQueue::new();
            let mut channel = rt
                .block_on(queue.open_channel("bench", size))
                .expect("open channel");
            let processor = BatchProcessor::new(
                0,
                Arc::new(AcceptAll),
                Arc::new(ConsumerMetrics::new().expect("metrics")),
                RedeliveryPolicy::default(),
            );

            b.iter_batched(
                || rt.block_on(filled_batch(&mut channel, &queue, size)),
                |mut batch| rt.block_on(processor.flush(&mut batch)),
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

criterion_group!(benches, bench_payload_decode, bench_flush_throughput);
criterion_main!(benches);
