//! Benchmarks for the output hot path.
//!
//! - Scrollback appends and catch-up reads
//! - Fan-out of one chunk to many clients
//! - Prompt detection on output tails

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use daemon::session::activity::looks_like_prompt;
use daemon::session::{ScrollbackBuffer, SessionOutputBroadcaster};

fn bench_scrollback(c: &mut Criterion) {
    let mut group = c.benchmark_group("scrollback");

    for size in [64usize, 4096, 65536] {
        let chunk = Bytes::from(vec![b'x'; size]);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("append", size), &chunk, |b, chunk| {
            let mut buffer = ScrollbackBuffer::new(256 * 1024);
            b.iter(|| buffer.append(black_box(chunk.clone())));
        });
    }

    let mut buffer = ScrollbackBuffer::new(256 * 1024);
    for _ in 0..1024 {
        buffer.append(Bytes::from_static(&[b'y'; 512]));
    }
    let middle = buffer.start_offset() + buffer.len() as u64 / 2;
    group.throughput(Throughput::Bytes(buffer.len() as u64 / 2));
    group.bench_function("read_from_middle", |b| {
        b.iter(|| buffer.read_from(black_box(middle)));
    });

    group.finish();
}

fn bench_broadcast(c: &mut Criterion) {
    let mut group = c.benchmark_group("broadcast");
    let chunk = Bytes::from(vec![b'z'; 4096]);

    for clients in [1usize, 10, 100] {
        group.throughput(Throughput::Bytes((chunk.len() * clients) as u64));
        group.bench_with_input(BenchmarkId::new("clients", clients), &clients, |b, &clients| {
            let mut broadcaster = SessionOutputBroadcaster::new("bench", 1024);
            let mut subscriptions: Vec<_> = (0..clients)
                .map(|i| broadcaster.add_client(format!("client-{i}")))
                .collect();

            b.iter(|| {
                let delivered = broadcaster.broadcast(black_box(&chunk));
                for subscription in &mut subscriptions {
                    while subscription.rx.try_recv().is_ok() {}
                }
                delivered
            });
        });
    }

    group.finish();
}

fn bench_prompt_detection(c: &mut Criterion) {
    let mut group = c.benchmark_group("prompt_detection");
    let prompt = format!("{}\r\nuser@host:~/src$ ", "building crate...\r\n".repeat(200));
    let busy = "compiling module 42 of 97\r\n".repeat(200);

    group.bench_function("prompt_tail", |b| b.iter(|| looks_like_prompt(black_box(&prompt))));
    group.bench_function("busy_tail", |b| b.iter(|| looks_like_prompt(black_box(&busy))));
    group.finish();
}

criterion_group!(benches, bench_scrollback, bench_broadcast, bench_prompt_detection);
criterion_main!(benches);
